use clap::Parser;
use relay::{Relay, RelayConfig};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Multiplexing relay between command-line clients and editor instances.
#[derive(Parser)]
#[command(name = "relay", version)]
struct Args {
    /// TCP port to listen on (loopback only; 0 picks an ephemeral port).
    #[arg(long, default_value_t = relay_protocol::DEFAULT_PORT)]
    port: u16,
    /// Per-instance FIFO queue capacity. 0 disables queueing: a busy
    /// instance rejects new requests immediately.
    #[arg(long, default_value_t = 0)]
    queue_capacity: usize,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();
    let args = Args::parse();

    let config = RelayConfig {
        bind_addr: ([127, 0, 0, 1], args.port).into(),
        queue_capacity: args.queue_capacity,
        ..RelayConfig::default()
    };

    let relay = match Relay::bind(config).await {
        Ok(relay) => relay,
        Err(e) => {
            eprintln!("FATAL: failed to bind relay port: {e}");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        }
    });

    relay.run(shutdown_rx).await;
    info!("relay stopped");
}
