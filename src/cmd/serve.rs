//! Engine server command — `dealdesk serve`.

use std::path::Path;

use anyhow::Result;

use dealdesk::config::DealdeskConfig;
use dealdesk::engine::server::start_server;

pub async fn cmd_serve(
    config_path: &Path,
    port: Option<u16>,
    db_path: Option<String>,
    dev: bool,
) -> Result<()> {
    let config = DealdeskConfig::load_or_default(config_path)?;
    for warning in config.validate() {
        tracing::warn!("{}", warning);
    }

    let mut server_config = config.to_server_config();
    if let Some(port) = port {
        server_config.port = port;
    }
    if let Some(db_path) = db_path {
        server_config.db_path = std::path::PathBuf::from(db_path);
    }
    if dev {
        server_config.dev_mode = true;
    }

    start_server(server_config).await
}
