//! Metrics export in Prometheus text format.

use std::collections::BTreeMap;

/// A flat set of named counters and gauges.
#[derive(Debug, Clone, Default)]
pub struct MetricsPayload {
    /// Counter metrics (monotonically increasing).
    pub counters: BTreeMap<String, u64>,

    /// Gauge metrics (can go up and down).
    pub gauges: BTreeMap<String, f64>,
}

impl MetricsPayload {
    /// Creates a new empty metrics payload.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a counter metric.
    pub fn counter(&mut self, name: impl Into<String>, value: u64) {
        self.counters.insert(name.into(), value);
    }

    /// Adds a gauge metric.
    pub fn gauge(&mut self, name: impl Into<String>, value: f64) {
        self.gauges.insert(name.into(), value);
    }

    /// Formats metrics in Prometheus text format, sorted by name.
    #[must_use]
    pub fn to_prometheus(&self, prefix: &str) -> String {
        let mut output = String::new();

        for (name, value) in &self.counters {
            output.push_str(&format!("# TYPE {prefix}_{name} counter\n"));
            output.push_str(&format!("{prefix}_{name} {value}\n"));
        }

        for (name, value) in &self.gauges {
            output.push_str(&format!("# TYPE {prefix}_{name} gauge\n"));
            output.push_str(&format!("{prefix}_{name} {value}\n"));
        }

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prometheus_format() {
        let mut metrics = MetricsPayload::new();
        metrics.counter("messages_sent", 3);
        metrics.gauge("open_channels", 2.0);

        let text = metrics.to_prometheus("mqtt");
        assert!(text.contains("# TYPE mqtt_messages_sent counter\nmqtt_messages_sent 3\n"));
        assert!(text.contains("mqtt_open_channels 2\n"));
    }
}
