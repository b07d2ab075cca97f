//! Transaction watch command — `dealdesk watch`.
//!
//! Runs the same sync poller the portal fronts use, printing each observed
//! lifecycle change until interrupted.

use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, watch};

use dealdesk::config::DealdeskConfig;
use dealdesk::engine::models::{Actor, ActorRole};
use dealdesk::engine::poller::{HttpSource, SyncPoller};

pub async fn cmd_watch(
    config_path: &Path,
    transaction_id: i64,
    server: &str,
    role: &str,
    actor_id: &str,
) -> Result<()> {
    let config = DealdeskConfig::load_or_default(config_path)?;
    let role = ActorRole::from_str(role).map_err(anyhow::Error::msg)?;
    let actor = Actor {
        role,
        id: actor_id.to_string(),
    };

    let source = Arc::new(HttpSource::new(server, actor));
    let poller = SyncPoller::new(source, transaction_id, config.poller.to_poller_config());

    let (events_tx, mut events_rx) = mpsc::channel(64);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = tokio::spawn(poller.run(events_tx, shutdown_rx));

    println!("Watching transaction {} at {}", transaction_id, server);

    loop {
        tokio::select! {
            event = events_rx.recv() => {
                match event {
                    Some(event) => println!("  {}", event),
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                let _ = shutdown_tx.send(true);
                break;
            }
        }
    }

    handle.await??;
    println!("Stopped watching.");
    Ok(())
}
