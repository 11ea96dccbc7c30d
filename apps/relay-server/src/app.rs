//! Application orchestrator: wires the hub into the relay server.

use std::sync::Arc;

use tunnelshare_relay::Hub;
use tunnelshare_server::{HubHandler, RelayServer};

use crate::config::Config;

/// Runs the relay until Ctrl-C or a fatal server error.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let hub = Hub::new(config.hub_config());
    let server = RelayServer::new(config.server_config()?, HubHandler::new(hub));

    let server_run = Arc::clone(&server);
    let mut serve = tokio::spawn(async move { server_run.run().await });

    // -- Main loop: wait for shutdown --
    tokio::select! {
        result = &mut serve => {
            // The server only returns on its own when binding fails.
            result??;
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Ctrl+C received");
        }
    }

    // -- Graceful shutdown --
    server.shutdown();
    if !serve.is_finished() {
        serve.await??;
    }
    Ok(())
}
