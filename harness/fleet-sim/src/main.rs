use anyhow::Result;
use clap::Parser;
use fleet_sim::{FleetState, SimConfig, serve_on};
use tracing::info;

/// Serve a simulated Fleet API for local smoke runs of the harness.
#[derive(Parser, Debug)]
#[command(name = "fleet-sim", version)]
struct Cli {
    #[arg(long, default_value = "127.0.0.1:5601")]
    listen: String,
    /// Agent list queries before an enrolled agent reports online
    #[arg(long, default_value_t = 2)]
    online_after: u32,
    /// Datastream queries answered with an empty list
    #[arg(long, default_value_t = 2)]
    data_streams_after: u32,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();

    let cli = Cli::parse();
    let state = FleetState::new(SimConfig {
        online_after_polls: cli.online_after,
        data_streams_after_polls: cli.data_streams_after,
        ..SimConfig::default()
    });
    let server = serve_on(&cli.listen, state).await?;
    info!(url = server.url(), "fleet-sim ready");

    tokio::signal::ctrl_c().await?;
    server.shutdown().await;
    Ok(())
}
