//! Prometheus metrics
//!
//! All metric families live on a caller-owned [`prometheus::Registry`] so
//! startup wires exactly one instance through the controller and tests can
//! substitute a fresh one. Rendering uses the standard text exposition
//! format on the metrics endpoint.

use chrono::Utc;
use prometheus::{
    Encoder, Gauge, HistogramOpts, HistogramVec, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use std::time::Instant;
use tracing::error;

/// Metrics collector for the whole controller.
pub struct Metrics {
    registry: Registry,
    issues_detected_total: IntCounterVec,
    remediations_total: IntCounterVec,
    api_calls_total: IntCounterVec,
    notifications_total: IntCounterVec,
    detection_duration_seconds: HistogramVec,
    remediation_duration_seconds: HistogramVec,
    api_duration_seconds: HistogramVec,
    cooldown_active: IntGaugeVec,
    last_detection_timestamp: Gauge,
    uptime_seconds: Gauge,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let issues_detected_total = IntCounterVec::new(
            Opts::new(
                "guardian_issues_detected_total",
                "Total number of issues detected by rule",
            ),
            &["rule", "severity", "namespace"],
        )?;
        let remediations_total = IntCounterVec::new(
            Opts::new(
                "guardian_remediations_total",
                "Total number of remediation actions executed",
            ),
            &["action", "result", "namespace"],
        )?;
        let api_calls_total = IntCounterVec::new(
            Opts::new(
                "guardian_api_calls_total",
                "Total number of Kubernetes API calls",
            ),
            &["method", "resource", "status"],
        )?;
        let notifications_total = IntCounterVec::new(
            Opts::new(
                "guardian_notifications_total",
                "Total number of notifications sent",
            ),
            &["type", "status"],
        )?;
        let detection_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "guardian_detection_duration_seconds",
                "Time spent detecting issues",
            ),
            &["rule"],
        )?;
        let remediation_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "guardian_remediation_duration_seconds",
                "Time spent executing remediation actions",
            ),
            &["action"],
        )?;
        let api_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "guardian_api_duration_seconds",
                "Time spent on Kubernetes API calls",
            ),
            &["method", "resource"],
        )?;
        let cooldown_active = IntGaugeVec::new(
            Opts::new("guardian_cooldown_active", "Number of active cooldown entries"),
            &["namespace"],
        )?;
        let last_detection_timestamp = Gauge::new(
            "guardian_last_detection_timestamp",
            "Timestamp of the last detection cycle",
        )?;
        let uptime_seconds = Gauge::new("guardian_uptime_seconds", "Controller uptime in seconds")?;

        registry.register(Box::new(issues_detected_total.clone()))?;
        registry.register(Box::new(remediations_total.clone()))?;
        registry.register(Box::new(api_calls_total.clone()))?;
        registry.register(Box::new(notifications_total.clone()))?;
        registry.register(Box::new(detection_duration_seconds.clone()))?;
        registry.register(Box::new(remediation_duration_seconds.clone()))?;
        registry.register(Box::new(api_duration_seconds.clone()))?;
        registry.register(Box::new(cooldown_active.clone()))?;
        registry.register(Box::new(last_detection_timestamp.clone()))?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        Ok(Self {
            registry,
            issues_detected_total,
            remediations_total,
            api_calls_total,
            notifications_total,
            detection_duration_seconds,
            remediation_duration_seconds,
            api_duration_seconds,
            cooldown_active,
            last_detection_timestamp,
            uptime_seconds,
            start_time: Instant::now(),
        })
    }

    pub fn record_issue_detected(&self, rule: &str, severity: &str, namespace: &str) {
        self.issues_detected_total
            .with_label_values(&[rule, severity, namespace])
            .inc();
    }

    pub fn record_detection_duration(&self, rule: &str, seconds: f64) {
        self.detection_duration_seconds
            .with_label_values(&[rule])
            .observe(seconds);
    }

    pub fn record_remediation(&self, action: &str, result: &str, namespace: &str, seconds: f64) {
        self.remediations_total
            .with_label_values(&[action, result, namespace])
            .inc();
        self.remediation_duration_seconds
            .with_label_values(&[action])
            .observe(seconds);
    }

    pub fn record_api_call(&self, method: &str, resource: &str, status: &str, seconds: f64) {
        self.api_calls_total
            .with_label_values(&[method, resource, status])
            .inc();
        self.api_duration_seconds
            .with_label_values(&[method, resource])
            .observe(seconds);
    }

    pub fn record_notification(&self, kind: &str, status: &str) {
        self.notifications_total
            .with_label_values(&[kind, status])
            .inc();
    }

    pub fn set_cooldown_active(&self, namespace: &str, count: i64) {
        self.cooldown_active
            .with_label_values(&[namespace])
            .set(count);
    }

    pub fn update_last_detection(&self) {
        #[allow(clippy::cast_precision_loss)]
        self.last_detection_timestamp
            .set(Utc::now().timestamp() as f64);
    }

    pub fn update_uptime(&self) {
        self.uptime_seconds.set(self.start_time.elapsed().as_secs_f64());
    }

    /// Current value of a remediation counter.
    #[must_use]
    pub fn remediation_total(&self, action: &str, result: &str, namespace: &str) -> u64 {
        self.remediations_total
            .with_label_values(&[action, result, namespace])
            .get()
    }

    /// Current value of an issue counter.
    #[must_use]
    pub fn issues_detected(&self, rule: &str, severity: &str, namespace: &str) -> u64 {
        self.issues_detected_total
            .with_label_values(&[rule, severity, namespace])
            .get()
    }

    /// Render the registry in the Prometheus text exposition format.
    #[must_use]
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(err) = encoder.encode(&families, &mut buffer) {
            error!(error = %err, "failed to encode metrics");
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_per_label_set() {
        let metrics = Metrics::new().expect("metrics");

        metrics.record_remediation("restart-pod", "success", "default", 0.1);
        metrics.record_remediation("restart-pod", "success", "default", 0.2);
        metrics.record_remediation("restart-pod", "failed", "default", 0.1);

        assert_eq!(metrics.remediation_total("restart-pod", "success", "default"), 2);
        assert_eq!(metrics.remediation_total("restart-pod", "failed", "default"), 1);
        assert_eq!(metrics.remediation_total("scale-replicas", "success", "default"), 0);
    }

    #[test]
    fn render_includes_registered_families() {
        let metrics = Metrics::new().expect("metrics");
        metrics.record_issue_detected("crash-loop-backoff", "high", "default");
        metrics.update_uptime();

        let body = metrics.render();
        assert!(body.contains("guardian_issues_detected_total"));
        assert!(body.contains("guardian_uptime_seconds"));
        assert!(body.contains(r#"rule="crash-loop-backoff""#));
    }

    #[test]
    fn independent_instances_do_not_share_state() {
        let a = Metrics::new().expect("metrics");
        let b = Metrics::new().expect("metrics");

        a.record_remediation("restart-pod", "success", "default", 0.1);
        assert_eq!(b.remediation_total("restart-pod", "success", "default"), 0);
    }
}
