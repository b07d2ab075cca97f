use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;

use super::api::{self, AppState, SharedState};
use super::kyc::{FixedAnalyzer, HttpAnalyzer, IdentityAnalyzer};
use super::store::{DbHandle, EngineDb};
use super::{Engine, EngineConfig};

/// Stand-in score when no analysis service is configured; sits above the
/// default pass threshold.
const DEV_ANALYZER_SCORE: i64 = 92;

/// Configuration for the lifecycle engine server.
pub struct ServerConfig {
    pub port: u16,
    pub db_path: std::path::PathBuf,
    pub analyzer_url: Option<String>,
    pub dev_mode: bool,
    pub engine: EngineConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3325,
            db_path: std::path::PathBuf::from(".dealdesk/engine.db"),
            analyzer_url: None,
            dev_mode: false,
            engine: EngineConfig::default(),
        }
    }
}

/// Build the full application router.
pub fn build_router(state: SharedState) -> Router {
    api::api_router().with_state(state)
}

/// Start the lifecycle engine server.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    // Ensure parent directory exists for DB
    if let Some(parent) = config.db_path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }

    let db = EngineDb::new(&config.db_path).context("Failed to initialize engine database")?;
    let analyzer: Arc<dyn IdentityAnalyzer> = match &config.analyzer_url {
        Some(url) => Arc::new(HttpAnalyzer::new(url.clone())),
        None => {
            tracing::warn!(
                score = DEV_ANALYZER_SCORE,
                "no identity analyzer configured; every check returns a fixed score"
            );
            Arc::new(FixedAnalyzer::new(DEV_ANALYZER_SCORE))
        }
    };
    let engine = Engine::new(DbHandle::new(db), analyzer, config.engine);

    let state = Arc::new(AppState { engine });

    let mut app = build_router(state);

    if config.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    println!("Dealdesk engine running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install Ctrl+C handler");
    println!("\nShutting down...");
}
