// Eventgate drain worker
//
// Drains both back-ends into the event store: one loop per broker
// queue and one per stream. The process exits 0 on any restart
// condition; the supervisor layer above re-launches it.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;

use eventgate_core::kv::KvStore;
use eventgate_core::HandlerRegistry;
use eventgate_observability::{init_tracing, MetricsSink};
use eventgate_queue::{
    broker, stream, BrokerAdapter, BrokerConfig, DeadLetterManager, RedisKv, StreamAdapter,
    StreamConfig,
};
use eventgate_reliability::{RetryPolicy, RetryTracker};
use eventgate_storage::PostgresEventStore;
use eventgate_worker::{
    processor::EventProcessor,
    supervisor::{shutdown_channel, DrainSource, Supervisor, WorkerConfig},
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("eventgate_worker=debug");
    info!("eventgate-worker starting...");

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL environment variable required")?;
    let store = PostgresEventStore::from_url(&database_url)
        .await
        .context("Failed to connect to the event store")?;
    store
        .ensure_schema()
        .await
        .context("Failed to apply event store schema")?;
    info!("Connected to event store");

    let stream_config = StreamConfig::from_env();
    let kv = Arc::new(
        RedisKv::connect(&stream_config.url)
            .await
            .context("Failed to connect to redis")?,
    );
    let stream_adapter = StreamAdapter::connect(stream_config.clone())
        .await
        .context("Failed to connect the stream adapter")?;

    let broker_config = BrokerConfig::from_env();
    let broker_adapter = BrokerAdapter::connect(broker_config.clone())
        .await
        .context("Failed to connect the broker adapter")?;

    let retry_tracker = Arc::new(RetryTracker::new(
        kv.clone() as Arc<dyn KvStore>,
        RetryPolicy::default(),
    ));
    let dlq = Arc::new(
        DeadLetterManager::connect(
            &broker_config,
            kv.clone() as Arc<dyn KvStore>,
            RetryPolicy::default(),
        )
        .await
        .context("Failed to connect the dead-letter manager")?,
    );

    let metrics = Arc::new(MetricsSink::new(
        std::env::var("METRICS_NAMESPACE").unwrap_or_else(|_| "eventgate".to_string()),
    ));

    // Business handlers are registered here from deployment config;
    // an event type without handlers persists without fan-out.
    let registry = Arc::new(HandlerRegistry::new());

    let processor = Arc::new(EventProcessor::new(
        Arc::new(store),
        registry,
        kv.clone() as Arc<dyn KvStore>,
        metrics.clone(),
    ));
    let handler = processor.delivery_handler();

    let worker_config = WorkerConfig::from_env();

    // one shutdown channel feeds every loop: flipped by an OS signal,
    // or when any sibling loop exits first
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut signal_rx = shutdown_channel().context("Failed to install signal handlers")?;
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if signal_rx.changed().await.is_ok() {
                let _ = shutdown_tx.send(true);
            }
        });
    }

    let mut sources = Vec::new();
    for queue in [broker::HIGH_PRIORITY_QUEUE, broker::NORMAL_QUEUE] {
        let consumer = broker_adapter
            .consumer(
                queue,
                handler.clone(),
                retry_tracker.clone(),
                dlq.clone(),
                metrics.clone(),
            )
            .await
            .with_context(|| format!("Failed to start consumer on {queue}"))?;
        sources.push(DrainSource::Broker(consumer));
    }
    for stream_key in [stream::HIGH_PRIORITY_STREAM, stream::NORMAL_STREAM] {
        sources.push(DrainSource::Stream(stream_adapter.consumer(
            stream_key,
            handler.clone(),
            metrics.clone(),
        )));
    }

    let mut loops = Vec::new();
    for source in sources {
        let config = worker_config.clone();
        let shutdown = shutdown_rx.clone();
        loops.push(tokio::spawn(async move {
            Supervisor::new(config).run(source, shutdown).await
        }));
    }

    // the first loop to exit takes the process down; the siblings see
    // the flipped channel and exit between deliveries
    let (exited, _, rest) = futures::future::select_all(loops).await;
    let reason = exited.context("Drain loop panicked")?;
    let _ = shutdown_tx.send(true);
    for task in rest {
        task.await.context("Drain loop panicked")?;
    }

    info!(reason = %reason, "Worker exiting");
    dlq.close().await.ok();
    broker_adapter.close().await.ok();

    Ok(())
}
