use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, warn};

use crate::export::health::HealthMetrics;

/// Alerts raised by the aggregation subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertName {
    SummaryAggregationError,
    FreshnessError,
    SpendAggregationError,
}

impl AlertName {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SummaryAggregationError => "summary_aggregation_error",
            Self::FreshnessError => "freshness_error",
            Self::SpendAggregationError => "spend_aggregation_error",
        }
    }
}

impl fmt::Display for AlertName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert severity. The subsystem never raises below `Medium`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Severity {
    Medium,
    High,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Alert {
    pub name: AlertName,
    pub severity: Severity,
    pub message: String,
}

impl Alert {
    pub fn new(name: AlertName, severity: Severity, message: impl Into<String>) -> Self {
        Self {
            name,
            severity,
            message: message.into(),
        }
    }
}

/// Receives alerts. Delivery is the sink's concern; raising never fails.
pub trait AlertSink: Send + Sync {
    fn raise(&self, alert: Alert);
}

impl<S: AlertSink + ?Sized> AlertSink for Arc<S> {
    fn raise(&self, alert: Alert) {
        (**self).raise(alert)
    }
}

/// Sink that writes alerts to the log and counts them.
#[derive(Default)]
pub struct LogAlertSink {
    health: Option<Arc<HealthMetrics>>,
}

impl LogAlertSink {
    pub fn new(health: Option<Arc<HealthMetrics>>) -> Self {
        Self { health }
    }
}

impl AlertSink for LogAlertSink {
    fn raise(&self, alert: Alert) {
        match alert.severity {
            Severity::High => error!(
                alert = %alert.name,
                severity = %alert.severity,
                message = %alert.message,
                "alert raised",
            ),
            Severity::Medium => warn!(
                alert = %alert.name,
                severity = %alert.severity,
                message = %alert.message,
                "alert raised",
            ),
        }

        if let Some(h) = &self.health {
            h.alerts_raised
                .with_label_values(&[alert.name.as_str(), alert.severity.as_str()])
                .inc();
        }
    }
}

/// Sink that keeps every alert in memory.
#[derive(Debug, Default)]
pub struct MemoryAlertSink {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes and returns every recorded alert.
    pub fn take(&self) -> Vec<Alert> {
        std::mem::take(&mut *self.alerts.lock())
    }

    pub fn len(&self) -> usize {
        self.alerts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.lock().is_empty()
    }
}

impl AlertSink for MemoryAlertSink {
    fn raise(&self, alert: Alert) {
        self.alerts.lock().push(alert);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_records_in_order() {
        let sink = MemoryAlertSink::new();
        sink.raise(Alert::new(AlertName::FreshnessError, Severity::Medium, "first"));
        sink.raise(Alert::new(
            AlertName::SummaryAggregationError,
            Severity::High,
            "second",
        ));

        let alerts = sink.take();
        assert_eq!(alerts.len(), 2);
        assert_eq!(alerts[0].message, "first");
        assert_eq!(alerts[1].name, AlertName::SummaryAggregationError);
        assert!(sink.is_empty());
    }

    #[test]
    fn test_arc_sink_forwards() {
        let sink = Arc::new(MemoryAlertSink::new());
        let shared: Arc<MemoryAlertSink> = Arc::clone(&sink);
        shared.raise(Alert::new(AlertName::SpendAggregationError, Severity::High, "x"));
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_log_sink_counts_alerts() {
        let health = Arc::new(HealthMetrics::new(":0").expect("metrics"));
        let sink = LogAlertSink::new(Some(Arc::clone(&health)));
        sink.raise(Alert::new(AlertName::FreshnessError, Severity::High, "stale"));

        let count = health
            .alerts_raised
            .with_label_values(&["freshness_error", "high"])
            .get();
        assert_eq!(count, 1.0);
    }

    #[test]
    fn test_names_and_severity_labels() {
        assert_eq!(AlertName::FreshnessError.to_string(), "freshness_error");
        assert_eq!(Severity::High.to_string(), "high");
        assert!(Severity::High > Severity::Medium);
    }
}
