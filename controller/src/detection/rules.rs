//! Built-in rule evaluators
//!
//! Each evaluator lists the relevant resources across all namespaces and
//! applies the namespace's effective policy to every candidate. The CPU and
//! memory rules work from restart counts and waiting reasons as stand-in
//! signals; a metrics provider can replace their internals as long as the
//! emitted issues keep the same shape.

use chrono::Utc;
use k8s_openapi::api::core::v1::{ContainerStateTerminated, ContainerStatus, Pod};
use std::time::Duration;

use crate::config::DetectionConfig;
use crate::detection::{Issue, IssueTarget, Rule, RuleKind};
use crate::policy;
use crate::store::{ClusterStore, StoreError};

pub(crate) async fn evaluate(
    rule: &Rule,
    store: &dyn ClusterStore,
    config: &DetectionConfig,
) -> Result<Vec<Issue>, StoreError> {
    match rule.kind {
        RuleKind::CrashLoop => crash_loop(rule, store, config).await,
        RuleKind::FailedDeployment => failed_deployment(rule, store, config).await,
        RuleKind::HighCpu => high_cpu(rule, store, config).await,
        RuleKind::HighMemory => high_memory(rule, store, config).await,
        RuleKind::OomKill => oom_kill(rule, store, config).await,
    }
}

async fn crash_loop(
    rule: &Rule,
    store: &dyn ClusterStore,
    config: &DetectionConfig,
) -> Result<Vec<Issue>, StoreError> {
    let mut issues = Vec::new();

    for pod in store.list_pods("").await? {
        let namespace = pod_namespace(&pod);
        let policy = policy::detection_policy(&namespace, config);
        if !policy.crash_loop.enabled {
            continue;
        }

        for status in container_statuses(&pod) {
            if waiting_reason(status) != Some("CrashLoopBackOff") {
                continue;
            }
            if status.restart_count < policy.crash_loop.restart_limit {
                continue;
            }
            if !meets_duration(last_termination(status), policy.crash_loop.check_duration) {
                continue;
            }

            issues.push(pod_issue(
                rule,
                &pod,
                format!(
                    "{} (restart limit: {})",
                    rule.description, policy.crash_loop.restart_limit
                ),
            ));
        }
    }

    Ok(issues)
}

async fn failed_deployment(
    rule: &Rule,
    store: &dyn ClusterStore,
    config: &DetectionConfig,
) -> Result<Vec<Issue>, StoreError> {
    let mut issues = Vec::new();

    for deployment in store.list_deployments("").await? {
        let namespace = deployment.metadata.namespace.clone().unwrap_or_default();
        let policy = policy::detection_policy(&namespace, config);
        if !policy.deployment.enabled {
            continue;
        }

        let conditions = deployment
            .status
            .as_ref()
            .and_then(|status| status.conditions.as_deref())
            .unwrap_or_default();

        for condition in conditions {
            if condition.type_ != "Progressing"
                || condition.status != "False"
                || condition.reason.as_deref() != Some("ProgressDeadlineExceeded")
            {
                continue;
            }

            let old_enough = condition
                .last_transition_time
                .as_ref()
                .and_then(|time| (Utc::now() - time.0).to_std().ok())
                .is_some_and(|age| age >= policy.deployment.check_duration);
            if !old_enough {
                continue;
            }

            issues.push(Issue {
                rule_name: rule.name.to_string(),
                description: format!(
                    "{} (failure threshold: {})",
                    rule.description, policy.deployment.failure_threshold
                ),
                severity: rule.severity,
                kind: "Deployment",
                namespace: namespace.clone(),
                name: deployment.metadata.name.clone().unwrap_or_default(),
                target: IssueTarget::Deployment(deployment.clone()),
                actions: rule.actions.to_vec(),
                detected_at: Utc::now(),
            });
        }
    }

    Ok(issues)
}

// Stand-in for a real metrics source: a container that keeps restarting is
// treated as the high-CPU signal, coercing the percentage threshold to a
// restart count.
async fn high_cpu(
    rule: &Rule,
    store: &dyn ClusterStore,
    config: &DetectionConfig,
) -> Result<Vec<Issue>, StoreError> {
    let mut issues = Vec::new();

    for pod in store.list_pods("").await? {
        let namespace = pod_namespace(&pod);
        let policy = policy::detection_policy(&namespace, config);
        if !policy.cpu.enabled {
            continue;
        }

        for status in container_statuses(&pod) {
            if i64::from(status.restart_count) <= policy.cpu.threshold_percent as i64 {
                continue;
            }
            if !meets_duration(last_termination(status), policy.cpu.check_duration) {
                continue;
            }

            issues.push(pod_issue(
                rule,
                &pod,
                format!(
                    "{} (threshold: {:.1}%)",
                    rule.description, policy.cpu.threshold_percent
                ),
            ));
        }
    }

    Ok(issues)
}

async fn high_memory(
    rule: &Rule,
    store: &dyn ClusterStore,
    config: &DetectionConfig,
) -> Result<Vec<Issue>, StoreError> {
    let mut issues = Vec::new();

    for pod in store.list_pods("").await? {
        let namespace = pod_namespace(&pod);
        let policy = policy::detection_policy(&namespace, config);
        if !policy.memory.enabled {
            continue;
        }

        for status in container_statuses(&pod) {
            let distressed = status.restart_count > 3
                || matches!(
                    waiting_reason(status),
                    Some("CrashLoopBackOff" | "ContainerCreating")
                );
            if !distressed {
                continue;
            }
            if !meets_duration(last_termination(status), policy.memory.check_duration) {
                continue;
            }

            issues.push(pod_issue(
                rule,
                &pod,
                format!(
                    "{} (threshold: {:.1}%)",
                    rule.description, policy.memory.threshold_percent
                ),
            ));
        }
    }

    Ok(issues)
}

async fn oom_kill(
    rule: &Rule,
    store: &dyn ClusterStore,
    config: &DetectionConfig,
) -> Result<Vec<Issue>, StoreError> {
    let mut issues = Vec::new();

    for pod in store.list_pods("").await? {
        let namespace = pod_namespace(&pod);
        let policy = policy::detection_policy(&namespace, config);
        if !policy.memory.enabled {
            continue;
        }

        for status in container_statuses(&pod) {
            let oom_killed = status
                .state
                .as_ref()
                .and_then(|state| state.terminated.as_ref())
                .and_then(|terminated| terminated.reason.as_deref())
                == Some("OOMKilled");
            if !oom_killed {
                continue;
            }

            let oom_count = status.restart_count.max(0);
            if oom_count < policy.memory.oom_kill_threshold {
                continue;
            }

            issues.push(pod_issue(
                rule,
                &pod,
                format!(
                    "{} (OOM kills: {}, threshold: {})",
                    rule.description, oom_count, policy.memory.oom_kill_threshold
                ),
            ));
        }
    }

    Ok(issues)
}

fn pod_issue(rule: &Rule, pod: &Pod, description: String) -> Issue {
    Issue {
        rule_name: rule.name.to_string(),
        description,
        severity: rule.severity,
        kind: "Pod",
        namespace: pod_namespace(pod),
        name: pod.metadata.name.clone().unwrap_or_default(),
        target: IssueTarget::Pod(pod.clone()),
        actions: rule.actions.to_vec(),
        detected_at: Utc::now(),
    }
}

fn pod_namespace(pod: &Pod) -> String {
    pod.metadata.namespace.clone().unwrap_or_default()
}

fn container_statuses(pod: &Pod) -> &[ContainerStatus] {
    pod.status
        .as_ref()
        .and_then(|status| status.container_statuses.as_deref())
        .unwrap_or_default()
}

fn waiting_reason(status: &ContainerStatus) -> Option<&str> {
    status
        .state
        .as_ref()
        .and_then(|state| state.waiting.as_ref())
        .and_then(|waiting| waiting.reason.as_deref())
}

fn last_termination(status: &ContainerStatus) -> Option<&ContainerStateTerminated> {
    status
        .last_state
        .as_ref()
        .and_then(|state| state.terminated.as_ref())
}

/// A condition only counts once it has persisted for `required`. With no
/// termination timestamp to measure from, the gate fails.
fn meets_duration(terminated: Option<&ContainerStateTerminated>, required: Duration) -> bool {
    let Some(finished_at) = terminated.and_then(|t| t.finished_at.as_ref()) else {
        return false;
    };

    (Utc::now() - finished_at.0)
        .to_std()
        .is_ok_and(|age| age >= required)
}
