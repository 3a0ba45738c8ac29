//! Flash sale order worker.
//!
//! Persists admitted orders from the order topic and keeps the shop
//! membership filter warm.

use anyhow::Context;
use flash_sale::bloom::{MembershipFilter, SHOP_FILTER_KEY};
use flash_sale::cache::CacheAside;
use flash_sale::config::Config;
use flash_sale::metrics::{record_filter_warm, register_metrics};
use flash_sale::queue::{OrderConsumer, OrderProducer};
use flash_sale::shop::ShopService;
use flash_sale_core::environment::SystemClock;
use flash_sale_core::kv::KeyValueStore;
use flash_sale_core::order_bus::OrderBus;
use flash_sale_core::order_store::ShopRepository;
use flash_sale_core::retry::RetryPolicy;
use flash_sale_postgres::{DeadLetterQueue, PostgresOrderStore, PostgresShopRepository};
use flash_sale_redis::RedisKeyValueStore;
use flash_sale_redpanda::RedpandaOrderBus;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let config = Config::from_env();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.server.log_level.clone().into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting flash sale worker");
    info!(
        redis_url = %config.redis.url,
        redpanda_brokers = %config.redpanda.brokers,
        order_topic = %config.redpanda.order_topic,
        "Configuration loaded"
    );

    let metrics_addr: SocketAddr = format!(
        "{}:{}",
        config.server.metrics_host, config.server.metrics_port
    )
    .parse()
    .context("invalid metrics address")?;
    PrometheusBuilder::new()
        .with_http_listener(metrics_addr)
        .install()
        .context("failed to install Prometheus exporter")?;
    register_metrics();
    info!(%metrics_addr, "Prometheus metrics exporter listening");

    info!("Connecting to Redis...");
    let kv = Arc::new(RedisKeyValueStore::new(&config.redis.url).await?);

    info!("Connecting to PostgreSQL...");
    let pool =
        flash_sale_postgres::connect(&config.postgres.url, config.postgres.max_connections).await?;
    flash_sale_postgres::migrate(&pool).await?;
    info!("Database migrations applied");

    info!("Connecting to Redpanda...");
    let bus: Arc<dyn OrderBus> = Arc::new(
        RedpandaOrderBus::builder()
            .brokers(&config.redpanda.brokers)
            .topic(&config.redpanda.order_topic)
            .producer_acks(&config.redpanda.producer_acks)
            .consumer_group(&config.redpanda.consumer_group)
            .build()?,
    );

    let tuning = &config.flash_sale;
    let lock_policy = RetryPolicy::fixed(tuning.lock_attempts, tuning.lock_backoff());
    let filter = MembershipFilter::new(
        Arc::clone(&kv),
        SHOP_FILTER_KEY,
        tuning.filter_expected_items,
        tuning.filter_false_positive_rate,
    )?;
    let cache = CacheAside::new(Arc::clone(&kv))
        .with_ttl(tuning.cache_ttl())
        .with_lock_policy(lock_policy, tuning.lock_ttl());
    let shops = Arc::new(
        ShopService::new(filter, cache, Arc::new(PostgresShopRepository::new(pool.clone())))
            .with_warm_batch(tuning.warm_batch_size),
    );

    warm_filter(&*shops).await?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let refresh = spawn_filter_refresh(
        Arc::clone(&shops),
        tuning.filter_refresh(),
        shutdown_tx.subscribe(),
    );

    let producer = OrderProducer::new(Arc::clone(&bus)).with_policy(
        RetryPolicy::builder()
            .max_attempts(tuning.publish_attempts)
            .build(),
    );
    let consumer = OrderConsumer::new(
        bus,
        producer,
        Arc::new(PostgresOrderStore::new(pool.clone())),
        Arc::new(DeadLetterQueue::new(pool)),
        SystemClock,
        shutdown_tx.subscribe(),
    )
    .with_max_deliveries(tuning.max_deliveries)
    .with_processing_timeout(tuning.processing_timeout())
    .spawn();
    info!("Order consumer started");

    shutdown_signal().await;
    let _ = shutdown_tx.send(());

    let drain = async {
        if let Err(e) = consumer.await {
            error!(error = %e, "Order consumer task failed");
        }
        if let Err(e) = refresh.await {
            error!(error = %e, "Filter refresh task failed");
        }
    };
    if tokio::time::timeout(Duration::from_secs(config.server.shutdown_timeout), drain)
        .await
        .is_err()
    {
        warn!(
            timeout_secs = config.server.shutdown_timeout,
            "Shutdown timed out with tasks still running"
        );
    }

    info!("Flash sale worker stopped");
    Ok(())
}

async fn warm_filter<K, R>(shops: &ShopService<K, R>) -> anyhow::Result<usize>
where
    K: KeyValueStore,
    R: ShopRepository,
{
    let started = Instant::now();
    let count = shops.warm_filter().await?;
    record_filter_warm(started.elapsed().as_secs_f64());
    Ok(count)
}

/// Re-add every shop id on each tick. Bits are only ever added, so readers
/// never observe a half-built filter.
fn spawn_filter_refresh<K, R>(
    shops: Arc<ShopService<K, R>>,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> tokio::task::JoinHandle<()>
where
    K: KeyValueStore + 'static,
    R: ShopRepository + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every.max(Duration::from_secs(1)));
        // The first tick completes immediately and startup already warmed the filter.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Filter refresh stopped");
                    break;
                }
                _ = ticker.tick() => {
                    match warm_filter(&*shops).await {
                        Ok(count) => info!(shops = count, "Shop filter refreshed"),
                        Err(e) => error!(error = %e, "Shop filter refresh failed"),
                    }
                }
            }
        }
    })
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal, shutting down gracefully...");
        },
        () = terminate => {
            info!("Received SIGTERM signal, shutting down gracefully...");
        },
    }
}
