use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use treetab_hub::{HubConfig, TabHub};

#[derive(Parser, Debug)]
#[command(name = "treetab-hub", about = "Tab directory service over a unix socket")]
struct Args {
    /// Socket path. Empty means TREETAB_SOCKET or the default under the
    /// temp directory.
    #[arg(long, default_value = "")]
    socket: String,

    /// Window the served tab strip belongs to.
    #[arg(long, default_value_t = 1)]
    window_id: u64,

    /// Per-connection write timeout in milliseconds.
    #[arg(long, default_value_t = 1000)]
    write_timeout_ms: u64,

    /// Outbound frame queue depth per connection.
    #[arg(long, default_value_t = 64)]
    queue_capacity: usize,

    /// Force debug logging.
    #[arg(long, default_value_t = false)]
    debug: bool,
}

fn resolve_socket_path(flag: &str) -> PathBuf {
    if !flag.trim().is_empty() {
        return PathBuf::from(flag);
    }
    if let Ok(value) = std::env::var("TREETAB_SOCKET") {
        if !value.trim().is_empty() {
            return PathBuf::from(value);
        }
    }
    std::env::temp_dir().join("treetab").join("hub.sock")
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else {
        std::env::var("TREETAB_LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_logging(args.debug);

    let config = HubConfig {
        socket_path: resolve_socket_path(&args.socket),
        window_id: args.window_id,
        write_timeout: Duration::from_millis(args.write_timeout_ms),
        queue_capacity: args.queue_capacity,
    };

    info!(
        event = "hub_boot",
        socket = %config.socket_path.display(),
        window_id = config.window_id
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!(event = "hub_shutdown_signal");
            let _ = shutdown_tx.send(true);
        }
    });

    let hub = TabHub::new(config);
    if let Err(err) = hub.serve(shutdown_rx).await {
        error!(event = "hub_serve_error", error = %err);
        std::process::exit(1);
    }
}
