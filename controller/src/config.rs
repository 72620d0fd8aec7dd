//! Guardian configuration
//!
//! Configuration is loaded once at startup from a YAML file, overlaid on the
//! built-in defaults, validated, and then shared immutably for the lifetime
//! of the process. Validation distinguishes hard errors (the process refuses
//! to start) from warnings (logged and tolerated).

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Configuration loading errors. Any of these is fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("configuration validation failed: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Outcome of validating a configuration
#[derive(Debug, Default)]
pub struct ValidationReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationReport {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Main Guardian configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub controller: ControllerConfig,
    pub detection: DetectionConfig,
    pub remediation: RemediationConfig,
    pub notification: NotificationConfig,
}

/// Controller-level settings (endpoints, loop pacing, concurrency)
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerConfig {
    /// Address the metrics endpoint binds to
    pub metrics_addr: String,

    /// Address the health probe endpoint binds to
    pub probe_addr: String,

    /// Whether leader election is enabled
    pub leader_election: bool,

    /// Manager sync period
    #[serde(with = "humantime_serde")]
    pub sync_period: Duration,

    /// Upper bound on issues processed concurrently within a cycle
    pub max_concurrent_reconciles: usize,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            metrics_addr: ":8080".to_string(),
            probe_addr: ":8081".to_string(),
            leader_election: true,
            sync_period: Duration::from_secs(30),
            max_concurrent_reconciles: 1,
        }
    }
}

/// Detection engine settings with global thresholds and per-namespace policies
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DetectionConfig {
    /// How often a detection cycle runs
    #[serde(with = "humantime_serde")]
    pub evaluation_interval: Duration,

    /// Restart count at which a crash-looping container becomes an issue
    pub crash_loop_threshold: i32,

    /// Failure threshold for deployment rollout issues
    pub failed_deployment_threshold: i32,

    /// CPU usage percentage threshold
    pub cpu_threshold_percent: f64,

    /// Memory usage percentage threshold
    pub memory_threshold_percent: f64,

    /// OOM kill count at which a pod becomes an issue
    pub oom_kill_threshold: i32,

    /// Namespace-specific detection policies. An entry replaces the global
    /// defaults for that namespace wholesale; there is no field-wise merge.
    pub namespaces: HashMap<String, NamespacePolicy>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            evaluation_interval: Duration::from_secs(30),
            crash_loop_threshold: 3,
            failed_deployment_threshold: 5,
            cpu_threshold_percent: 80.0,
            memory_threshold_percent: 85.0,
            oom_kill_threshold: 2,
            namespaces: HashMap::new(),
        }
    }
}

/// Per-namespace detection policy, one section per detection dimension
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NamespacePolicy {
    #[serde(rename = "crashloop")]
    pub crash_loop: CrashLoopPolicy,
    pub deployment: DeploymentPolicy,
    pub cpu: CpuPolicy,
    pub memory: MemoryPolicy,
}

/// Crash-loop detection settings for a namespace
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CrashLoopPolicy {
    pub enabled: bool,
    pub restart_limit: i32,
    #[serde(with = "humantime_serde")]
    pub check_duration: Duration,
}

impl Default for CrashLoopPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            restart_limit: 3,
            check_duration: Duration::from_secs(5 * 60),
        }
    }
}

/// Deployment failure detection settings for a namespace
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeploymentPolicy {
    pub enabled: bool,
    pub failure_threshold: i32,
    #[serde(with = "humantime_serde")]
    pub check_duration: Duration,
}

impl Default for DeploymentPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            failure_threshold: 5,
            check_duration: Duration::from_secs(10 * 60),
        }
    }
}

/// CPU monitoring settings for a namespace
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CpuPolicy {
    pub enabled: bool,
    pub threshold_percent: f64,
    #[serde(with = "humantime_serde")]
    pub check_duration: Duration,
}

impl Default for CpuPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_percent: 80.0,
            check_duration: Duration::from_secs(5 * 60),
        }
    }
}

/// Memory monitoring settings for a namespace
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemoryPolicy {
    pub enabled: bool,
    pub threshold_percent: f64,
    pub oom_kill_threshold: i32,
    #[serde(with = "humantime_serde")]
    pub check_duration: Duration,
}

impl Default for MemoryPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_percent: 85.0,
            oom_kill_threshold: 2,
            check_duration: Duration::from_secs(5 * 60),
        }
    }
}

/// Remediation engine settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RemediationConfig {
    /// Master switch for remediation
    pub enabled: bool,

    /// Simulate actions without issuing writes to the cluster
    pub dry_run: bool,

    /// Whether failed deployments may be rolled back automatically
    pub auto_rollback_enabled: bool,

    /// Whether deployments may be scaled up automatically
    pub auto_scale_enabled: bool,

    /// Retry budget for a single remediation action
    pub max_retries: u32,

    /// Delay between retries
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,

    /// Seconds a successful action suppresses repeats on the same resource.
    /// Zero disables the cooldown and is rejected by validation.
    pub cooldown_seconds: u64,

    /// Namespace-specific remediation policies; same wholesale-replacement
    /// semantics as detection policies.
    pub namespaces: HashMap<String, NamespaceRemediationPolicy>,
}

impl Default for RemediationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            dry_run: false,
            auto_rollback_enabled: true,
            auto_scale_enabled: true,
            max_retries: 3,
            retry_interval: Duration::from_secs(10),
            cooldown_seconds: 300,
            namespaces: HashMap::new(),
        }
    }
}

/// Per-namespace remediation policy
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NamespaceRemediationPolicy {
    pub enabled: bool,
    pub auto_rollback_enabled: bool,
    pub auto_scale_enabled: bool,
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub retry_interval: Duration,
    pub cooldown_seconds: u64,
}

impl Default for NamespaceRemediationPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_rollback_enabled: true,
            auto_scale_enabled: true,
            max_retries: 3,
            retry_interval: Duration::from_secs(10),
            cooldown_seconds: 300,
        }
    }
}

/// Notification sink settings
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NotificationConfig {
    pub slack: SlackConfig,
}

/// Slack-specific settings
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SlackConfig {
    pub enabled: bool,
    pub token: String,
    pub channel: String,
    pub username: String,
    pub icon_emoji: String,
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            token: String::new(),
            channel: "#guardian".to_string(),
            username: "Guardian".to_string(),
            icon_emoji: ":shield:".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file overlaid on the defaults.
    ///
    /// With no path the defaults are returned as-is (still validated).
    /// Validation errors are fatal; warnings are logged and tolerated.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)?;
                serde_yaml::from_str(&raw)?
            }
            None => Self::default(),
        };

        let report = config.validate();
        for warning in &report.warnings {
            warn!("configuration warning: {warning}");
        }
        if !report.is_valid() {
            return Err(ConfigError::Invalid(report.errors));
        }

        Ok(config)
    }

    /// Validate the configuration, collecting every problem rather than
    /// stopping at the first.
    #[must_use]
    pub fn validate(&self) -> ValidationReport {
        let mut report = ValidationReport::default();

        self.validate_controller(&mut report);
        self.validate_detection(&mut report);
        self.validate_remediation(&mut report);
        self.validate_notification(&mut report);
        self.validate_namespaces(&mut report);

        report
    }

    fn validate_controller(&self, report: &mut ValidationReport) {
        let c = &self.controller;
        if c.metrics_addr.is_empty() {
            report.errors.push("metrics address cannot be empty".to_string());
        }
        if c.probe_addr.is_empty() {
            report.errors.push("probe address cannot be empty".to_string());
        }
        if c.max_concurrent_reconciles < 1 {
            report
                .errors
                .push("max concurrent reconciles must be at least 1".to_string());
        }
        if c.sync_period < Duration::from_secs(1) {
            report
                .warnings
                .push("sync period less than 1 second may cause high CPU usage".to_string());
        }
    }

    fn validate_detection(&self, report: &mut ValidationReport) {
        let d = &self.detection;
        if d.evaluation_interval < Duration::from_secs(1) {
            report
                .errors
                .push("evaluation interval must be at least 1 second".to_string());
        }
        if d.crash_loop_threshold < 1 {
            report
                .errors
                .push("crash loop threshold must be at least 1".to_string());
        }
        if d.failed_deployment_threshold < 1 {
            report
                .errors
                .push("failed deployment threshold must be at least 1".to_string());
        }
        if !(0.0..=100.0).contains(&d.cpu_threshold_percent) {
            report
                .errors
                .push("CPU threshold percent must be between 0 and 100".to_string());
        }
        if !(0.0..=100.0).contains(&d.memory_threshold_percent) {
            report
                .errors
                .push("memory threshold percent must be between 0 and 100".to_string());
        }
        if d.oom_kill_threshold < 1 {
            report
                .errors
                .push("OOM kill threshold must be at least 1".to_string());
        }
    }

    fn validate_remediation(&self, report: &mut ValidationReport) {
        let r = &self.remediation;
        if r.max_retries > 10 {
            report
                .errors
                .push("max retries too high (potential resource exhaustion)".to_string());
        }
        if r.retry_interval < Duration::from_millis(100) {
            report
                .errors
                .push("retry interval too short (thundering herd risk)".to_string());
        } else if r.retry_interval < Duration::from_secs(1) {
            report
                .warnings
                .push("retry interval less than 1 second may cause excessive retries".to_string());
        }
        if r.cooldown_seconds == 0 {
            report
                .errors
                .push("cooldown disabled (potential for remediation abuse)".to_string());
        }
        if r.cooldown_seconds > 3600 {
            report
                .warnings
                .push("cooldown period greater than 1 hour may be too long".to_string());
        }
    }

    fn validate_notification(&self, report: &mut ValidationReport) {
        let slack = &self.notification.slack;
        if !slack.enabled {
            return;
        }
        if slack.token.is_empty() {
            report
                .errors
                .push("slack token is required when slack notifications are enabled".to_string());
        }
        if slack.channel.is_empty() {
            report
                .errors
                .push("slack channel is required when slack notifications are enabled".to_string());
        } else if !is_valid_slack_channel(&slack.channel) {
            report
                .warnings
                .push(format!("slack channel name may be invalid: {}", slack.channel));
        }
        if slack.username.is_empty() {
            report
                .warnings
                .push("slack username is not set, using default".to_string());
        }
    }

    fn validate_namespaces(&self, report: &mut ValidationReport) {
        for (namespace, policy) in &self.detection.namespaces {
            if !is_valid_namespace_name(namespace) {
                report
                    .errors
                    .push(format!("invalid namespace name '{namespace}'"));
                continue;
            }

            if policy.crash_loop.restart_limit < 1 {
                report.errors.push(format!(
                    "namespace '{namespace}': crash loop restart limit must be at least 1"
                ));
            }
            if policy.crash_loop.check_duration < Duration::from_secs(1) {
                report.warnings.push(format!(
                    "namespace '{namespace}': crash loop check duration less than 1 second may cause high CPU usage"
                ));
            }
            if policy.deployment.failure_threshold < 1 {
                report.errors.push(format!(
                    "namespace '{namespace}': deployment failure threshold must be at least 1"
                ));
            }
            if policy.deployment.check_duration < Duration::from_secs(1) {
                report.warnings.push(format!(
                    "namespace '{namespace}': deployment check duration less than 1 second may cause high CPU usage"
                ));
            }
            if !(0.0..=100.0).contains(&policy.cpu.threshold_percent) {
                report.errors.push(format!(
                    "namespace '{namespace}': CPU threshold percent must be between 0 and 100"
                ));
            }
            if !(0.0..=100.0).contains(&policy.memory.threshold_percent) {
                report.errors.push(format!(
                    "namespace '{namespace}': memory threshold percent must be between 0 and 100"
                ));
            }
            if policy.memory.oom_kill_threshold < 1 {
                report.errors.push(format!(
                    "namespace '{namespace}': OOM kill threshold must be at least 1"
                ));
            }
        }

        for (namespace, policy) in &self.remediation.namespaces {
            if !is_valid_namespace_name(namespace) {
                report
                    .errors
                    .push(format!("invalid namespace name '{namespace}'"));
                continue;
            }
            if policy.max_retries > 10 {
                report.errors.push(format!(
                    "namespace '{namespace}': max retries too high (potential resource exhaustion)"
                ));
            }
            if policy.retry_interval < Duration::from_secs(1) {
                report.warnings.push(format!(
                    "namespace '{namespace}': retry interval less than 1 second may cause excessive retries"
                ));
            }
            if policy.cooldown_seconds == 0 {
                report.errors.push(format!(
                    "namespace '{namespace}': cooldown disabled (potential for remediation abuse)"
                ));
            }
        }
    }
}

/// Kubernetes namespace names: DNS-1123 labels, at most 63 characters.
#[must_use]
pub fn is_valid_namespace_name(name: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").expect("static namespace regex")
    });
    name.len() <= 63 && re.is_match(name)
}

/// Slack channel names: leading '#', lowercase alphanumerics plus `-`/`_`.
#[must_use]
fn is_valid_slack_channel(channel: &str) -> bool {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"^#[a-z0-9_-]+$").expect("static channel regex"));
    channel.len() <= 22 && re.is_match(channel)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let report = Config::default().validate();
        assert!(report.is_valid(), "errors: {:?}", report.errors);
        assert!(report.warnings.is_empty(), "warnings: {:?}", report.warnings);
    }

    #[test]
    fn zero_cooldown_is_rejected() {
        let mut config = Config::default();
        config.remediation.cooldown_seconds = 0;

        let report = config.validate();
        assert!(!report.is_valid());
        assert!(report.errors.iter().any(|e| e.contains("cooldown disabled")));
    }

    #[test]
    fn cooldown_boundaries() {
        let mut config = Config::default();
        config.remediation.cooldown_seconds = 1;
        assert!(config.validate().is_valid());

        config.remediation.cooldown_seconds = 3600;
        let report = config.validate();
        assert!(report.is_valid());
        assert!(report.warnings.is_empty());

        config.remediation.cooldown_seconds = 3601;
        let report = config.validate();
        assert!(report.is_valid());
        assert!(report.warnings.iter().any(|w| w.contains("greater than 1 hour")));
    }

    #[test]
    fn cpu_threshold_boundaries() {
        let mut config = Config::default();
        config.detection.cpu_threshold_percent = 0.0;
        assert!(config.validate().is_valid());

        config.detection.cpu_threshold_percent = 100.0;
        assert!(config.validate().is_valid());

        config.detection.cpu_threshold_percent = 100.1;
        let report = config.validate();
        assert!(report.errors.iter().any(|e| e.contains("CPU threshold")));

        config.detection.cpu_threshold_percent = -1.0;
        let report = config.validate();
        assert!(report.errors.iter().any(|e| e.contains("CPU threshold")));
    }

    #[test]
    fn max_retries_boundaries() {
        let mut config = Config::default();
        config.remediation.max_retries = 0;
        assert!(config.validate().is_valid());

        config.remediation.max_retries = 10;
        assert!(config.validate().is_valid());

        config.remediation.max_retries = 11;
        let report = config.validate();
        assert!(report.errors.iter().any(|e| e.contains("max retries too high")));
    }

    #[test]
    fn short_retry_interval_is_rejected() {
        let mut config = Config::default();
        config.remediation.retry_interval = Duration::from_millis(50);
        let report = config.validate();
        assert!(report.errors.iter().any(|e| e.contains("retry interval too short")));

        config.remediation.retry_interval = Duration::from_millis(500);
        let report = config.validate();
        assert!(report.is_valid());
        assert!(report.warnings.iter().any(|w| w.contains("excessive retries")));
    }

    #[test]
    fn short_sync_period_warns() {
        let mut config = Config::default();
        config.controller.sync_period = Duration::from_millis(500);
        let report = config.validate();
        assert!(report.is_valid());
        assert!(report.warnings.iter().any(|w| w.contains("sync period")));
    }

    #[test]
    fn namespace_names_are_validated() {
        assert!(is_valid_namespace_name("default"));
        assert!(is_valid_namespace_name("team-a1"));
        assert!(!is_valid_namespace_name("Team"));
        assert!(!is_valid_namespace_name("-leading"));
        assert!(!is_valid_namespace_name("trailing-"));
        assert!(!is_valid_namespace_name(&"a".repeat(64)));
        assert!(is_valid_namespace_name(&"a".repeat(63)));

        let mut config = Config::default();
        config
            .detection
            .namespaces
            .insert("Bad_Name".to_string(), NamespacePolicy::default());
        let report = config.validate();
        assert!(report.errors.iter().any(|e| e.contains("invalid namespace name")));
    }

    #[test]
    fn slack_requires_token_and_channel_when_enabled() {
        let mut config = Config::default();
        config.notification.slack.enabled = true;
        config.notification.slack.token = String::new();
        config.notification.slack.channel = String::new();

        let report = config.validate();
        assert!(report.errors.iter().any(|e| e.contains("slack token")));
        assert!(report.errors.iter().any(|e| e.contains("slack channel")));
    }

    #[test]
    fn yaml_overlay_keeps_defaults_for_missing_fields() {
        let raw = r"
detection:
  evaluationInterval: 15s
  crashLoopThreshold: 5
remediation:
  dryRun: true
";
        let config: Config = serde_yaml::from_str(raw).expect("parse");
        assert_eq!(config.detection.evaluation_interval, Duration::from_secs(15));
        assert_eq!(config.detection.crash_loop_threshold, 5);
        // untouched fields keep their defaults
        assert_eq!(config.detection.failed_deployment_threshold, 5);
        assert!(config.remediation.dry_run);
        assert_eq!(config.remediation.cooldown_seconds, 300);
        assert_eq!(config.controller.metrics_addr, ":8080");
    }

    #[test]
    fn namespace_policy_parses_from_yaml() {
        let raw = r"
detection:
  namespaces:
    production:
      crashloop:
        enabled: true
        restartLimit: 10
        checkDuration: 2m
      memory:
        enabled: false
        thresholdPercent: 90
        oomKillThreshold: 4
        checkDuration: 3m
";
        let config: Config = serde_yaml::from_str(raw).expect("parse");
        let policy = config.detection.namespaces.get("production").expect("entry");
        assert_eq!(policy.crash_loop.restart_limit, 10);
        assert_eq!(policy.crash_loop.check_duration, Duration::from_secs(120));
        assert!(!policy.memory.enabled);
        assert_eq!(policy.memory.oom_kill_threshold, 4);
        // unspecified dimensions fall back to their defaults
        assert!(policy.deployment.enabled);
        assert_eq!(policy.deployment.check_duration, Duration::from_secs(600));
    }

    #[test]
    fn namespace_remediation_zero_cooldown_is_rejected() {
        let mut config = Config::default();
        config.remediation.namespaces.insert(
            "staging".to_string(),
            NamespaceRemediationPolicy {
                cooldown_seconds: 0,
                ..NamespaceRemediationPolicy::default()
            },
        );
        let report = config.validate();
        assert!(report
            .errors
            .iter()
            .any(|e| e.contains("staging") && e.contains("cooldown disabled")));
    }
}
