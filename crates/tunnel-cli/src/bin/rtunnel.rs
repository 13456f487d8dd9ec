use anyhow::Result;
use tokio::sync::watch;
use tracing::{info, warn};
use tunnel_cli::{args::TunnelArgs, init_tracing};
use tunnel_client::run_tunnel;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let config = TunnelArgs::parse_config()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("interrupt received, shutting down");
                let _ = shutdown_tx.send(true);
            }
            Err(err) => warn!(?err, "failed to listen for ctrl-c"),
        }
    });

    run_tunnel(&config, shutdown_rx).await?;
    Ok(())
}
