use reckon::api;
use reckon::config::Config;
use reckon::services::{
    HttpPriceOracle, JobHandler, JobQueue, LogNotifier, MemoryJobQueue, NotificationOutbox,
    Notifier, PriceOnlyIndicators, RedisJobQueue, SqliteStore, WebhookNotifier, Worker,
};
use reckon::AppState;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "reckon=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    info!("Starting Reckon on {}", config.bind_addr());

    let store = Arc::new(SqliteStore::new(&config.database_path)?);

    let queue: Arc<dyn JobQueue> = match &config.redis_url {
        Some(url) => Arc::new(
            RedisJobQueue::connect(url, config.queue.backoff_base, config.queue.lease).await?,
        ),
        None => {
            warn!("REDIS_URL not set, using the in-process job queue");
            Arc::new(MemoryJobQueue::new(config.queue.backoff_base))
        }
    };

    let oracle = Arc::new(HttpPriceOracle::new(
        &config.market_service_url,
        config.price_timeout,
    )?);

    let notifier: Arc<dyn Notifier> = match &config.notify_webhook_url {
        Some(url) => {
            info!("Delivering notifications to webhook {}", url);
            Arc::new(WebhookNotifier::new(url, config.price_timeout)?)
        }
        None => Arc::new(LogNotifier),
    };
    let (outbox, _outbox_task) = NotificationOutbox::spawn(notifier);

    let state = AppState::new(
        config,
        store,
        queue,
        oracle,
        Arc::new(PriceOnlyIndicators),
        outbox,
    );
    let config = state.config.clone();

    // Workers
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    let handlers = [
        state.monitor.clone() as Arc<dyn JobHandler>,
        state.scheduler.clone() as Arc<dyn JobHandler>,
    ];
    for handler in handlers {
        let worker = Worker::new(state.queue.clone(), handler, config.queue.clone());
        tasks.push(tokio::spawn(worker.run(shutdown_rx.clone())));
    }

    // Periodic sweep for pending trades and active strategies without a live job
    {
        let monitor = state.monitor.clone();
        let scheduler = state.scheduler.clone();
        let mut shutdown = shutdown_rx.clone();
        let period = config.engine.stale_sweep;
        tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = monitor.requeue_stranded().await {
                            error!("Stranded trade sweep failed: {}", e);
                        }
                        if let Err(e) = scheduler.requeue_idle().await {
                            error!("Idle strategy sweep failed: {}", e);
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }));
    }

    if let Err(e) = state.scheduler.schedule_active().await {
        error!("Failed to schedule active strategies: {}", e);
    }

    let outbox = state.outbox.clone();
    let app = api::app(state);

    // Start the server
    let addr = config.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Reckon listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }

    outbox.flush().await;
    info!("Reckon stopped");
    Ok(())
}
