use anyhow::Result;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod app;

#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG=hwclink_transport=trace shows every message on the wire.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .with_thread_ids(false)
        .init();

    info!("HwcLink bridge v{}", env!("CARGO_PKG_VERSION"));

    match app::run().await {
        Ok(()) => {
            info!("HwcLink bridge exited cleanly.");
            Ok(())
        }
        Err(e) => {
            error!("Fatal error: {:#}", e);
            Err(e)
        }
    }
}
