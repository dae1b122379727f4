pub mod metrics;

pub use metrics::{sanitize_metric_name, MetricsError, MetricsManager, PrometheusMetrics};
