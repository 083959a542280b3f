use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use torii::config::{Config, StoreBackend};
use torii::pipeline::Gateway;
use torii::store::{FastStore, MemoryStore, RedisStore};
use torii::upstream::HttpFetcher;

/// Torii - media-aware forwarding gateway
#[derive(Parser, Debug)]
#[command(name = "torii")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: PathBuf,

    /// Test configuration and exit
    #[arg(long)]
    test: bool,
}

#[tokio::main]
async fn main() {
    torii::logging::init_subscriber().expect("Failed to initialize logging subsystem");

    let args = Args::parse();

    let config = Config::from_file(&args.config).unwrap_or_else(|e| {
        eprintln!("Failed to load configuration: {}", e);
        std::process::exit(1);
    });

    if args.test {
        println!("Configuration OK");
        return;
    }

    tracing::info!(
        config_file = %args.config.display(),
        server_address = %config.server.address,
        server_port = config.server.port,
        store_backend = ?config.store.backend,
        rate_limit_enabled = config.rate_limit.enabled,
        cache_enabled = config.cache.enabled,
        "Configuration loaded successfully"
    );

    let store: Arc<dyn FastStore> = match config.store.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::Redis => {
            let timeout =
                std::time::Duration::from_millis(config.store.operation_timeout_ms);
            match RedisStore::connect(&config.store.redis_url, timeout).await {
                Ok(store) => Arc::new(store),
                Err(e) => {
                    eprintln!("Failed to connect to redis: {}", e);
                    std::process::exit(1);
                }
            }
        }
    };

    let fetcher = HttpFetcher::new(&config.upstream).unwrap_or_else(|e| {
        eprintln!("Failed to build upstream client: {}", e);
        std::process::exit(1);
    });

    let addr: SocketAddr = format!("{}:{}", config.server.address, config.server.port)
        .parse()
        .unwrap_or_else(|e| {
            eprintln!("Invalid listen address: {}", e);
            std::process::exit(1);
        });

    let gateway = Arc::new(Gateway::new(config, store, Arc::new(fetcher)));

    tracing::info!(address = %addr, "Starting Torii gateway");

    if let Err(e) = torii::server::run(gateway, addr).await {
        tracing::error!(error = %e, "Server terminated");
        std::process::exit(1);
    }
}
