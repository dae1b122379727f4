use parking_lot::Mutex;
use prometheus::{Histogram, HistogramOpts, Registry};
use std::collections::{BTreeMap, HashMap};

/// Errors raised while registering a metric.
#[derive(thiserror::Error, Debug)]
pub enum MetricsError {
    #[error("invalid metric name `{0}`")]
    InvalidName(String),
    #[error("failed to register metric `{name}`: {source}")]
    Registration {
        name: String,
        #[source]
        source: prometheus::Error,
    },
}

/// Lazily registers metrics on behalf of the senders.
///
/// Calls with the same name and tags return the same underlying metric, so
/// callers may invoke this on every send without tracking registration state.
pub trait MetricsManager: Send + Sync {
    fn histogram(
        &self,
        name: &str,
        help: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<Histogram, MetricsError>;
}

const EXPORT_SIZE_BUCKETS: &[f64] = &[
    64.0, 256.0, 1024.0, 4096.0, 16384.0, 65536.0, 262144.0, 1048576.0,
];

/// Prometheus backed metrics manager.
pub struct PrometheusMetrics {
    registry: Registry,
    histograms: Mutex<HashMap<String, Histogram>>,
}

impl PrometheusMetrics {
    pub fn new(registry: Registry) -> Self {
        Self {
            registry,
            histograms: Mutex::new(HashMap::new()),
        }
    }

    /// Registers into the process-wide registry served by the exporter.
    pub fn global() -> Self {
        Self::new(prometheus::default_registry().clone())
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

impl Default for PrometheusMetrics {
    fn default() -> Self {
        Self::new(Registry::new())
    }
}

impl MetricsManager for PrometheusMetrics {
    fn histogram(
        &self,
        name: &str,
        help: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<Histogram, MetricsError> {
        let metric_name = sanitize_metric_name(name)?;
        let key = cache_key(&metric_name, tags);

        let mut guard = self.histograms.lock();
        if let Some(existing) = guard.get(&key) {
            return Ok(existing.clone());
        }

        let mut opts = HistogramOpts::new(metric_name.clone(), help)
            .buckets(EXPORT_SIZE_BUCKETS.to_vec());
        for (label, value) in tags {
            opts = opts.const_label(sanitize_label_name(label), value.clone());
        }
        let histogram = Histogram::with_opts(opts).map_err(|source| MetricsError::Registration {
            name: metric_name.clone(),
            source,
        })?;
        self.registry
            .register(Box::new(histogram.clone()))
            .map_err(|source| MetricsError::Registration {
                name: metric_name,
                source,
            })?;
        guard.insert(key, histogram.clone());
        Ok(histogram)
    }
}

fn cache_key(name: &str, tags: &BTreeMap<String, String>) -> String {
    let mut key = name.to_string();
    for (label, value) in tags {
        key.push('|');
        key.push_str(label);
        key.push('=');
        key.push_str(value);
    }
    key
}

/// Maps an arbitrary export name onto the prometheus metric name alphabet.
pub fn sanitize_metric_name(name: &str) -> Result<String, MetricsError> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(MetricsError::InvalidName(name.to_string()));
    }
    let mut out: String = trimmed
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    Ok(out)
}

fn sanitize_label_name(label: &str) -> String {
    let mut out: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_names() {
        assert_eq!(
            sanitize_metric_name("MqttExportSize").unwrap(),
            "MqttExportSize"
        );
        assert_eq!(
            sanitize_metric_name("Http-Export.Size").unwrap(),
            "Http_Export_Size"
        );
        assert_eq!(sanitize_metric_name("9lives").unwrap(), "_9lives");
        assert!(sanitize_metric_name("  ").is_err());
    }

    #[test]
    fn histogram_is_registered_once_per_tag_set() {
        let metrics = PrometheusMetrics::new(Registry::new());
        let mut tags = BTreeMap::new();
        tags.insert("destination".to_string(), "tcp://broker:1883/a".to_string());

        let first = metrics.histogram("MqttExportSize", "size", &tags).unwrap();
        first.observe(10.0);
        let second = metrics.histogram("MqttExportSize", "size", &tags).unwrap();
        second.observe(20.0);
        assert_eq!(second.get_sample_count(), 2);

        tags.insert("destination".to_string(), "tcp://broker:1883/b".to_string());
        let third = metrics.histogram("MqttExportSize", "size", &tags).unwrap();
        assert_eq!(third.get_sample_count(), 0);

        let families = metrics.registry().gather();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].get_metric().len(), 2);
    }
}
