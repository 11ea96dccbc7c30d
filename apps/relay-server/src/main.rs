//! tunnelshare relay server entry point.

mod app;
mod config;

use tracing_subscriber::EnvFilter;

fn main() -> anyhow::Result<()> {
    let config = config::Config::load()?;

    // Initialize structured logging. RUST_LOG wins over the config file.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        "starting tunnelshare relay"
    );
    tracing::info!(bind = %config.bind, port = config.port, "configuration loaded");

    // A read-only home is no reason to refuse to start.
    let path = config::config_path();
    match config::Config::write_default_if_missing(&path) {
        Ok(true) => tracing::info!(path = %path.display(), "wrote default configuration"),
        Ok(false) => {}
        Err(e) => tracing::warn!("could not write default configuration: {e:#}"),
    }

    // Build and run the tokio runtime.
    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(app::run(config))?;

    tracing::info!("relay shut down cleanly");
    Ok(())
}
