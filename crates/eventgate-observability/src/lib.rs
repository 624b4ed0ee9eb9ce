// Observability for eventgate: the metrics sink and tracing setup.

pub mod metrics;
pub mod telemetry;

pub use metrics::{MetricsSink, DURATION_BUCKETS};
pub use telemetry::init_tracing;
