//! Per-namespace policy resolution
//!
//! A namespace either has an explicit policy entry, which is used verbatim,
//! or it gets a policy synthesized from the global thresholds. There is no
//! field-wise merging: an entry replaces the defaults wholesale.

use crate::config::{
    CpuPolicy, CrashLoopPolicy, DeploymentPolicy, DetectionConfig, MemoryPolicy, NamespacePolicy,
    NamespaceRemediationPolicy, RemediationConfig,
};
use std::time::Duration;

/// Resolve the effective detection policy for a namespace.
#[must_use]
pub fn detection_policy(namespace: &str, config: &DetectionConfig) -> NamespacePolicy {
    if let Some(policy) = config.namespaces.get(namespace) {
        return policy.clone();
    }

    NamespacePolicy {
        crash_loop: CrashLoopPolicy {
            enabled: true,
            restart_limit: config.crash_loop_threshold,
            check_duration: Duration::from_secs(5 * 60),
        },
        deployment: DeploymentPolicy {
            enabled: true,
            failure_threshold: config.failed_deployment_threshold,
            check_duration: Duration::from_secs(10 * 60),
        },
        cpu: CpuPolicy {
            enabled: true,
            threshold_percent: config.cpu_threshold_percent,
            check_duration: Duration::from_secs(5 * 60),
        },
        memory: MemoryPolicy {
            enabled: true,
            threshold_percent: config.memory_threshold_percent,
            oom_kill_threshold: config.oom_kill_threshold,
            check_duration: Duration::from_secs(5 * 60),
        },
    }
}

/// Resolve the effective remediation policy for a namespace.
#[must_use]
pub fn remediation_policy(
    namespace: &str,
    config: &RemediationConfig,
) -> NamespaceRemediationPolicy {
    if let Some(policy) = config.namespaces.get(namespace) {
        return policy.clone();
    }

    NamespaceRemediationPolicy {
        enabled: config.enabled,
        auto_rollback_enabled: config.auto_rollback_enabled,
        auto_scale_enabled: config.auto_scale_enabled,
        max_retries: config.max_retries,
        retry_interval: config.retry_interval,
        cooldown_seconds: config.cooldown_seconds,
    }
}
