use clap::Parser;
use realtime_personalization::{create_app, Config, Services};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

const JANITOR_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Parser, Debug)]
#[command(name = "realtime-personalization", about = "Behavior ingestion and personalized recommendations")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `server.bind`
    #[arg(long)]
    bind: Option<String>,

    /// Number of synthetic products to load at startup
    #[arg(long, default_value_t = 0)]
    seed_products: usize,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let mut config = match Config::load(args.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    let level = config
        .server
        .log_level
        .parse::<tracing::Level>()
        .unwrap_or(tracing::Level::INFO);
    tracing_subscriber::fmt().with_max_level(level).init();

    if let Err(e) = run(config, args.seed_products).await {
        error!("💥 {}", e);
        std::process::exit(1);
    }
}

async fn run(config: Config, seed_products: usize) -> realtime_personalization::Result<()> {
    info!("🚀 Starting realtime personalization service...");

    let addr: SocketAddr = config
        .server
        .bind
        .parse()
        .map_err(|e| realtime_personalization::Error::Config(format!("invalid bind address: {}", e)))?;
    let shutdown_timeout = config.shutdown_timeout();

    let services = Services::build(config)?;
    if seed_products > 0 {
        services.seed_demo_catalog(seed_products).await?;
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let mut workers = services.orchestrator.spawn_workers(shutdown_rx.clone());
    info!(
        "📥 {} ingestion workers consuming {} ({} partitions)",
        services.config.consumer.concurrency,
        services.stream.topic(),
        services.config.consumer.partitions
    );

    let janitor = tokio::spawn({
        let fast = services.fast.clone();
        let updater = services.updater.clone();
        let repository = services.repository.clone();
        let popular = services.popular.clone();
        let mut shutdown = shutdown_rx.clone();
        async move {
            let mut ticker = tokio::time::interval(JANITOR_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let expired = fast.purge_expired();
                        let user_locks = updater.sweep_idle_locks() + repository.sweep_idle_locks();
                        let cache_locks = popular.sweep_idle_locks();
                        if expired + user_locks + cache_locks > 0 {
                            info!(
                                "🧹 Purged {} expired keys, {} user locks, {} cache locks",
                                expired, user_locks, cache_locks
                            );
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }
    });

    let app = create_app(services.app_state());
    let listener = tokio::net::TcpListener::bind(addr).await?;

    info!("🌐 HTTP API running on http://{}", addr);
    info!("📚 Recommend: curl http://localhost:{}/api/v1/recommendations/U1?limit=10", addr.port());
    info!(
        "📚 Event: curl -X POST http://localhost:{}/api/v1/events -H 'Content-Type: application/json' -d '{{\"userId\":\"U1\",\"productId\":\"P000001\",\"actionType\":\"VIEW\"}}'",
        addr.port()
    );

    let mut server_shutdown = shutdown_rx.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            })
            .await
    });

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("🛑 Shutdown requested, draining for up to {:?}", shutdown_timeout);
    let _ = shutdown_tx.send(true);

    let drained = tokio::time::timeout(shutdown_timeout, async {
        while let Some(result) = workers.join_next().await {
            if let Err(e) = result {
                error!("Ingestion worker panicked: {}", e);
            }
        }
    })
    .await;
    if drained.is_err() {
        warn!("Ingestion workers still busy after {:?}, aborting; uncommitted batches will be redelivered", shutdown_timeout);
        workers.abort_all();
    }

    match tokio::time::timeout(shutdown_timeout, server).await {
        Ok(Ok(Err(e))) => error!("HTTP server error: {}", e),
        Ok(Err(e)) => error!("HTTP server task failed: {}", e),
        Err(_) => warn!("HTTP server did not stop within {:?}", shutdown_timeout),
        Ok(Ok(Ok(()))) => {}
    }
    let _ = janitor.await;

    let abandoned = services.repository.shutdown(shutdown_timeout).await;
    info!(
        "✅ Stopped (stream lag {}, {} preference backups abandoned)",
        services.stream.lag(),
        abandoned
    );
    Ok(())
}
