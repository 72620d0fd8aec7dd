//! Detection engine
//!
//! Evaluates the built-in rule set against the cluster store and emits
//! [`Issue`]s for the controller to act on. The detection path is strictly
//! read-only; a rule that fails to read the cluster is skipped for the cycle
//! while the remaining rules still run.

use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

use crate::config::Config;
use crate::store::{ApiSurface, ClusterStore};

mod rules;

/// Issue severity, ordered (Critical > High > Medium > Low)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    const fn rank(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }

    /// Lowercase label used in metrics and notifications.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

impl PartialOrd for Severity {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Severity {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank().cmp(&other.rank())
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The closed set of remediation actions a rule can trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    RestartPod,
    RollbackDeployment,
    ScaleReplicas,
}

impl ActionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RestartPod => "restart-pod",
            Self::RollbackDeployment => "rollback-deployment",
            Self::ScaleReplicas => "scale-replicas",
        }
    }

    /// The API surface whose circuit breaker guards this action's mutation.
    #[must_use]
    pub fn surface(self) -> ApiSurface {
        match self {
            Self::RestartPod => ApiSurface::Pods,
            Self::RollbackDeployment | Self::ScaleReplicas => ApiSurface::Deployments,
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed snapshot of the resource an issue was detected on.
///
/// Detection emits the already-typed payload so the remediation engine never
/// has to downcast an untyped reference.
#[derive(Debug, Clone)]
#[allow(clippy::large_enum_variant)]
pub enum IssueTarget {
    Pod(Pod),
    Deployment(Deployment),
}

impl IssueTarget {
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Pod(_) => "Pod",
            Self::Deployment(_) => "Deployment",
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        let meta = match self {
            Self::Pod(pod) => &pod.metadata,
            Self::Deployment(deployment) => &deployment.metadata,
        };
        meta.name.as_deref().unwrap_or_default()
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        let meta = match self {
            Self::Pod(pod) => &pod.metadata,
            Self::Deployment(deployment) => &deployment.metadata,
        };
        meta.namespace.as_deref().unwrap_or_default()
    }
}

/// A detected condition warranting one or more remediation actions.
/// Created by the detection engine, consumed once by the controller.
#[derive(Debug, Clone)]
pub struct Issue {
    pub rule_name: String,
    pub description: String,
    pub severity: Severity,
    pub kind: &'static str,
    pub namespace: String,
    pub name: String,
    pub target: IssueTarget,
    pub actions: Vec<ActionKind>,
    pub detected_at: DateTime<Utc>,
}

/// Identifies which evaluator a rule uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleKind {
    CrashLoop,
    FailedDeployment,
    HighCpu,
    HighMemory,
    OomKill,
}

/// A built-in detection rule. Rules are not user-authored; the set is fixed.
#[derive(Debug, Clone)]
pub struct Rule {
    pub kind: RuleKind,
    pub name: &'static str,
    pub description: &'static str,
    pub severity: Severity,
    pub actions: &'static [ActionKind],
}

impl Rule {
    /// The built-in rule set.
    #[must_use]
    pub fn builtin() -> Vec<Rule> {
        vec![
            Rule {
                kind: RuleKind::CrashLoop,
                name: "crash-loop-backoff",
                description: "Detect pods stuck in CrashLoopBackOff",
                severity: Severity::High,
                actions: &[ActionKind::RestartPod],
            },
            Rule {
                kind: RuleKind::FailedDeployment,
                name: "failed-deployment",
                description: "Detect deployments that exceeded their progress deadline",
                severity: Severity::High,
                actions: &[ActionKind::RollbackDeployment],
            },
            Rule {
                kind: RuleKind::HighCpu,
                name: "high-cpu-usage",
                description: "Detect sustained high CPU usage",
                severity: Severity::Medium,
                actions: &[ActionKind::ScaleReplicas],
            },
            Rule {
                kind: RuleKind::HighMemory,
                name: "high-memory-usage",
                description: "Detect sustained memory pressure",
                severity: Severity::High,
                actions: &[ActionKind::RestartPod],
            },
            Rule {
                kind: RuleKind::OomKill,
                name: "oom-kill-detected",
                description: "Detect containers killed by the OOM killer",
                severity: Severity::Critical,
                actions: &[ActionKind::RestartPod, ActionKind::ScaleReplicas],
            },
        ]
    }
}

/// The detection engine.
pub struct Detector {
    config: Arc<Config>,
    rules: Vec<Rule>,
}

impl Detector {
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            rules: Rule::builtin(),
            config,
        }
    }

    #[must_use]
    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Run every built-in rule once and collect the detected issues.
    ///
    /// Output ordering is unspecified; callers must not rely on it.
    pub async fn detect(&self, store: &dyn ClusterStore) -> Vec<Issue> {
        let mut issues = Vec::new();

        for rule in &self.rules {
            debug!(rule = rule.name, "running detection rule");
            match rules::evaluate(rule, store, &self.config.detection).await {
                Ok(mut found) => issues.append(&mut found),
                Err(err) => {
                    error!(rule = rule.name, error = %err, "failed to evaluate rule");
                }
            }
        }

        issues
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering() {
        assert!(Severity::Critical > Severity::High);
        assert!(Severity::High > Severity::Medium);
        assert!(Severity::Medium > Severity::Low);
        assert_eq!(Severity::High, Severity::High);
    }

    #[test]
    fn severity_labels() {
        assert_eq!(Severity::Critical.to_string(), "critical");
        assert_eq!(Severity::Low.to_string(), "low");
    }

    #[test]
    fn action_labels() {
        assert_eq!(ActionKind::RestartPod.to_string(), "restart-pod");
        assert_eq!(ActionKind::RollbackDeployment.to_string(), "rollback-deployment");
        assert_eq!(ActionKind::ScaleReplicas.to_string(), "scale-replicas");
    }

    #[test]
    fn action_surfaces() {
        assert_eq!(ActionKind::RestartPod.surface(), ApiSurface::Pods);
        assert_eq!(ActionKind::RollbackDeployment.surface(), ApiSurface::Deployments);
        assert_eq!(ActionKind::ScaleReplicas.surface(), ApiSurface::Deployments);
    }

    #[test]
    fn builtin_rules_cover_all_kinds() {
        let rules = Rule::builtin();
        assert_eq!(rules.len(), 5);
        let oom = rules
            .iter()
            .find(|r| r.kind == RuleKind::OomKill)
            .expect("oom rule");
        // restart before scale; the engine preserves list order
        assert_eq!(
            oom.actions.to_vec(),
            vec![ActionKind::RestartPod, ActionKind::ScaleReplicas]
        );
        assert_eq!(oom.severity, Severity::Critical);
    }
}
