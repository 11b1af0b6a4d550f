use clap::Parser;
use mypooler::config::Config;
use mypooler::server::{Pool, PoolOptions, ProxyServer};
use mypooler::Result;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(3);

#[derive(Parser, Debug)]
#[command(name = "mypooler")]
#[command(about = "Transparent MySQL connection-pooling proxy over a unix socket", long_about = None)]
#[command(version)]
struct Args {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// MySQL host (overrides config)
    #[arg(long)]
    host: Option<String>,

    /// MySQL port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Unix socket path to listen on (overrides config)
    #[arg(long)]
    socket: Option<String>,

    /// Pool size (overrides config)
    #[arg(long)]
    size: Option<usize>,

    /// Max connection lifetime in seconds, 0 disables expiry (overrides config)
    #[arg(long)]
    life: Option<u64>,

    /// Acquire wait timeout in milliseconds (overrides config)
    #[arg(long)]
    wait: Option<u64>,

    /// Enable debug mode (verbose pool/session logging)
    #[arg(long)]
    debug: bool,

    /// Log level (trace, debug, info, warn, error); defaults to the config
    /// file value, or "info"
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = if let Some(config_path) = &args.config {
        Config::from_file(config_path)?
    } else {
        Config::default()
    };

    // Apply CLI overrides
    if let Some(host) = args.host {
        config.upstream.host = host;
    }
    if let Some(port) = args.port {
        config.upstream.port = port;
    }
    if let Some(socket) = args.socket {
        config.proxy.socket_path = socket;
    }
    if let Some(size) = args.size {
        config.pool.max_size = size;
    }
    if let Some(life) = args.life {
        config.pool.max_lifetime_secs = life;
    }
    if let Some(wait) = args.wait {
        config.pool.wait_timeout_ms = wait;
    }
    if args.debug {
        config.proxy.debug = true;
    }
    config.validate()?;

    let level = config.log_level(args.log_level.as_deref());
    init_logging(&level)?;

    println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
    info!(
        "Proxying {} -> {}:{}",
        config.proxy.socket_path, config.upstream.host, config.upstream.port
    );

    let pool = Pool::new(PoolOptions {
        host: config.upstream.host.clone(),
        port: config.upstream.port,
        max_size: config.pool.max_size,
        max_lifetime: config.max_lifetime(),
        wait_timeout: config.wait_timeout(),
    });

    let server = Arc::new(ProxyServer::new(pool, &config.proxy.socket_path));
    if config.proxy.debug {
        server.set_debug();
    }

    tokio::select! {
        result = server.run() => {
            // Only a bind failure gets here while running normally.
            if let Err(e) = result {
                error!("Server error: {}", e);
                return Err(e);
            }
        }
        _ = wait_for_shutdown_signal() => {
            info!("Received shutdown signal");
            if let Err(e) = server.shutdown(SHUTDOWN_DEADLINE).await {
                error!("Shutdown failed: {}", e);
                std::process::exit(1);
            }
        }
    }

    info!("exit");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt =
        signal(SignalKind::interrupt()).expect("Failed to install SIGINT handler");
    let mut terminate =
        signal(SignalKind::terminate()).expect("Failed to install SIGTERM handler");
    let mut user_defined =
        signal(SignalKind::user_defined2()).expect("Failed to install SIGUSR2 handler");

    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
        _ = user_defined.recv() => {}
    }
}

fn init_logging(level: &str) -> Result<()> {
    let env_filter = EnvFilter::try_new(level)
        .map_err(|e| mypooler::MypoolerError::Config(format!("Invalid log level: {}", e)))?;

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer())
        .init();

    Ok(())
}
