// Eventgate API server

use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use eventgate_api::{events, system};
use eventgate_core::kv::KvStore;
use eventgate_core::PriorityRouter;
use eventgate_observability::{init_tracing, MetricsSink};
use eventgate_queue::{
    BrokerAdapter, BrokerConfig, DeadLetterManager, EventPublisher, RedisKv, StreamAdapter,
    StreamConfig,
};
use eventgate_reliability::{BreakerRegistry, BreakerStore, CircuitBreakerConfig, RetryPolicy};
use eventgate_storage::PostgresEventStore;

/// OpenAPI documentation
#[derive(OpenApi)]
#[openapi(
    paths(
        events::ingest_event,
        events::event_status,
        system::health,
        system::metrics,
        system::system_info,
        system::queue_stats,
        system::circuit_breakers,
        system::dlq_restore,
    ),
    components(
        schemas(
            eventgate_core::NewEvent,
            eventgate_core::Event,
            eventgate_core::EventStatus,
            eventgate_core::EventSource,
            eventgate_core::FieldError,
            events::IngestResponse,
            events::ValidationResponse,
            events::EventStatusResponse,
            system::HealthResponse,
            system::HealthChecks,
            system::SystemInfoResponse,
            system::BreakerStatus,
            system::DepthEntry,
        )
    ),
    tags(
        (name = "events", description = "Event intake and status"),
        (name = "system", description = "Health, metrics and diagnostics")
    ),
    info(
        title = "Eventgate API",
        version = "0.1.0",
        description = "Analytics event ingestion and dispatch"
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("eventgate_api=debug,tower_http=debug");
    tracing::info!("eventgate-api starting...");

    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL environment variable required")?;
    let store = PostgresEventStore::from_url(&database_url)
        .await
        .context("Failed to connect to the event store")?;
    store
        .ensure_schema()
        .await
        .context("Failed to apply event store schema")?;
    tracing::info!("Connected to event store");

    let stream_config = StreamConfig::from_env();
    let kv = Arc::new(
        RedisKv::connect(&stream_config.url)
            .await
            .context("Failed to connect to redis")?,
    );
    let stream_adapter = Arc::new(
        StreamAdapter::connect(stream_config)
            .await
            .context("Failed to connect the stream adapter")?,
    );

    let broker_config = BrokerConfig::from_env();
    let broker_adapter = Arc::new(
        BrokerAdapter::connect(broker_config.clone())
            .await
            .context("Failed to connect the broker adapter")?,
    );
    let dlq = Arc::new(
        DeadLetterManager::connect(
            &broker_config,
            kv.clone() as Arc<dyn KvStore>,
            RetryPolicy::default(),
        )
        .await
        .context("Failed to connect the dead-letter manager")?,
    );

    let breakers = Arc::new(BreakerRegistry::new(
        kv.clone() as Arc<dyn BreakerStore>,
        CircuitBreakerConfig::for_queue(),
        &["rabbitmq", "redis"],
    ));
    let metrics = Arc::new(MetricsSink::new(
        std::env::var("METRICS_NAMESPACE").unwrap_or_else(|_| "eventgate".to_string()),
    ));

    let store: Arc<dyn eventgate_storage::EventStore> = Arc::new(store);
    let events_state = events::AppState {
        store: store.clone(),
        kv: kv.clone() as Arc<dyn KvStore>,
        broker: broker_adapter.clone() as Arc<dyn EventPublisher>,
        stream: stream_adapter.clone() as Arc<dyn EventPublisher>,
        breakers: breakers.clone(),
        metrics: metrics.clone(),
        router: PriorityRouter::new(),
    };
    let system_state = system::AppState {
        store,
        broker: broker_adapter.clone() as Arc<dyn EventPublisher>,
        stream: stream_adapter.clone() as Arc<dyn EventPublisher>,
        broker_adapter: Some(broker_adapter),
        stream_adapter: Some(stream_adapter),
        dlq: Some(dlq),
        breakers,
        metrics,
        started_at: Instant::now(),
    };

    let app = axum::Router::new()
        .merge(events::routes(events_state))
        .merge(system::routes(system_state))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let addr = std::env::var("API_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {addr}"))?;
    tracing::info!("Listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;

    Ok(())
}
