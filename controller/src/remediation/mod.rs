//! Remediation engine
//!
//! Executes corrective actions on cluster resources, gated by per-namespace
//! policy, a cooldown discipline, token-bucket rate limiting, and
//! per-API-surface circuit breakers. Policy denials are reported as
//! non-success outcomes, never as errors; the error channel is reserved for
//! invariant violations such as an action applied to the wrong resource
//! type.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::{Config, NamespaceRemediationPolicy};
use crate::detection::{ActionKind, IssueTarget};
use crate::policy;
use crate::store::{ApiSurface, ClusterStore};

pub mod breaker;
pub mod cooldown;
pub mod ratelimit;

use breaker::{BreakerConfig, BreakerError, CircuitBreaker};
use cooldown::{cooldown_key, CooldownTracker, ENTRY_TTL};
use k8s_openapi::api::core::v1::Pod;
use ratelimit::ActionRateLimiter;

/// Hard ceiling on automatic scale-up.
const MAX_REPLICAS: i32 = 10;

const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

/// Result of one remediation attempt. Denials and cluster errors are carried
/// here with `success = false` and a descriptive message.
#[derive(Debug, Clone)]
pub struct RemediationOutcome {
    pub action: ActionKind,
    pub success: bool,
    pub message: String,
    pub resource: String,
    pub namespace: String,
    pub executed_at: DateTime<Utc>,
    pub duration: Duration,
}

impl RemediationOutcome {
    fn finish(
        action: ActionKind,
        success: bool,
        message: String,
        resource: &str,
        namespace: &str,
        started: Instant,
    ) -> Self {
        Self {
            action,
            success,
            message,
            resource: resource.to_string(),
            namespace: namespace.to_string(),
            executed_at: Utc::now(),
            duration: started.elapsed(),
        }
    }
}

/// Invariant violations. Policy denials never land here.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("action {action} expects a {expected} target, got {got}")]
    TargetMismatch {
        action: ActionKind,
        expected: &'static str,
        got: &'static str,
    },
}

struct SurfaceBreakers {
    pods: CircuitBreaker,
    deployments: CircuitBreaker,
    replica_sets: CircuitBreaker,
}

impl SurfaceBreakers {
    fn get(&self, surface: ApiSurface) -> &CircuitBreaker {
        match surface {
            ApiSurface::Pods => &self.pods,
            ApiSurface::Deployments => &self.deployments,
            ApiSurface::ReplicaSets => &self.replica_sets,
        }
    }
}

fn log_state_change(name: &str, from: breaker::State, to: breaker::State) {
    warn!(breaker = name, %from, %to, "circuit breaker state change");
}

/// The remediation engine.
pub struct Engine {
    store: Arc<dyn ClusterStore>,
    config: Arc<Config>,
    cooldowns: CooldownTracker,
    breakers: SurfaceBreakers,
    rate_limiter: ActionRateLimiter,
}

impl Engine {
    #[must_use]
    pub fn new(store: Arc<dyn ClusterStore>, config: Arc<Config>) -> Self {
        let breakers = SurfaceBreakers {
            pods: CircuitBreaker::new(
                "pods-api",
                BreakerConfig {
                    max_requests: 5,
                    interval: Duration::from_secs(60),
                    timeout: Duration::from_secs(30),
                    // a pod that is already gone must not trip the breaker
                    is_successful: Some(Box::new(crate::store::StoreError::is_not_found)),
                    on_state_change: Some(Box::new(log_state_change)),
                    ..BreakerConfig::default()
                },
            ),
            deployments: CircuitBreaker::new(
                "deployments-api",
                BreakerConfig {
                    max_requests: 3,
                    interval: Duration::from_secs(60),
                    timeout: Duration::from_secs(30),
                    on_state_change: Some(Box::new(log_state_change)),
                    ..BreakerConfig::default()
                },
            ),
            replica_sets: CircuitBreaker::new(
                "replicasets-api",
                BreakerConfig {
                    max_requests: 3,
                    interval: Duration::from_secs(60),
                    timeout: Duration::from_secs(30),
                    on_state_change: Some(Box::new(log_state_change)),
                    ..BreakerConfig::default()
                },
            ),
        };

        Self {
            store,
            config,
            cooldowns: CooldownTracker::new(),
            breakers,
            // 10 actions/second sustained, bucket capacity 100
            rate_limiter: ActionRateLimiter::new(10, 100),
        }
    }

    /// Execute one remediation action on `target`.
    ///
    /// Preconditions run in order, each short-circuiting with a non-success
    /// outcome: namespace policy, cooldown, rate limiter, circuit breaker.
    /// The cooldown entry is written only after a success outcome, dry-run
    /// successes included.
    pub async fn execute(
        &self,
        action: ActionKind,
        target: &IssueTarget,
        namespace: &str,
    ) -> Result<RemediationOutcome, EngineError> {
        let started = Instant::now();
        let policy = policy::remediation_policy(namespace, &self.config.remediation);
        let resource = target.name().to_string();

        if !policy.enabled {
            return Ok(RemediationOutcome::finish(
                action,
                false,
                "remediation is disabled for this namespace".to_string(),
                &resource,
                namespace,
                started,
            ));
        }

        let key = cooldown_key(namespace, &resource, action);
        if self
            .cooldowns
            .in_cooldown(&key, Duration::from_secs(policy.cooldown_seconds))
        {
            info!(
                %action,
                resource,
                namespace,
                cooldown_seconds = policy.cooldown_seconds,
                "action skipped due to cooldown"
            );
            return Ok(RemediationOutcome::finish(
                action,
                false,
                format!(
                    "action skipped due to cooldown period ({}s)",
                    policy.cooldown_seconds
                ),
                &resource,
                namespace,
                started,
            ));
        }

        if !self.rate_limiter.allow(action.as_str()) {
            warn!(%action, resource, namespace, "action denied by rate limiter");
            return Ok(RemediationOutcome::finish(
                action,
                false,
                format!("rate limit exceeded for action {action}"),
                &resource,
                namespace,
                started,
            ));
        }

        let outcome = match action {
            ActionKind::RestartPod => self.restart_pod(target, namespace, started).await?,
            ActionKind::RollbackDeployment => {
                self.rollback_deployment(target, namespace, &policy, started)
                    .await?
            }
            ActionKind::ScaleReplicas => {
                self.scale_replicas(target, namespace, &policy, started)
                    .await?
            }
        };

        if outcome.success {
            self.cooldowns.record(&key);
        }

        Ok(outcome)
    }

    /// Drop cooldown entries older than an hour. Driven by the controller's
    /// cleanup ticker.
    pub fn cleanup_cooldowns(&self) -> usize {
        let removed = self.cooldowns.cleanup_older_than(ENTRY_TTL);
        if removed > 0 {
            debug!(removed, "dropped expired cooldown entries");
        }
        removed
    }

    /// Live cooldown entries per namespace, for the gauge.
    #[must_use]
    pub fn cooldown_counts(&self) -> HashMap<String, usize> {
        self.cooldowns.active_by_namespace()
    }

    /// Current breaker state for an API surface.
    #[must_use]
    pub fn breaker_state(&self, surface: ApiSurface) -> breaker::State {
        self.breakers.get(surface).state()
    }

    async fn restart_pod(
        &self,
        target: &IssueTarget,
        namespace: &str,
        started: Instant,
    ) -> Result<RemediationOutcome, EngineError> {
        let IssueTarget::Pod(pod) = target else {
            return Err(EngineError::TargetMismatch {
                action: ActionKind::RestartPod,
                expected: "Pod",
                got: target.kind(),
            });
        };
        let name = pod.metadata.name.clone().unwrap_or_default();

        if self.config.remediation.dry_run {
            info!(pod = name, namespace, "dry run: would restart pod");
            return Ok(RemediationOutcome::finish(
                ActionKind::RestartPod,
                true,
                format!("dry run: would restart pod {name}"),
                &name,
                namespace,
                started,
            ));
        }

        let deletion = {
            let store = Arc::clone(&self.store);
            let ns = namespace.to_string();
            let pod_name = name.clone();
            self.breakers
                .get(ApiSurface::Pods)
                .execute(move || async move { store.delete_pod(&ns, &pod_name).await })
                .await
        };

        match deletion {
            Ok(()) => {
                info!(pod = name, namespace, "restarted pod");
                Ok(RemediationOutcome::finish(
                    ActionKind::RestartPod,
                    true,
                    format!("restarted pod {name}"),
                    &name,
                    namespace,
                    started,
                ))
            }
            // benign race: the pod was replaced between list and delete
            Err(BreakerError::Store(err)) if err.is_not_found() => Ok(RemediationOutcome::finish(
                ActionKind::RestartPod,
                true,
                format!("pod {name} already gone"),
                &name,
                namespace,
                started,
            )),
            Err(err) => Ok(RemediationOutcome::finish(
                ActionKind::RestartPod,
                false,
                format!("failed to restart pod {name}: {err}"),
                &name,
                namespace,
                started,
            )),
        }
    }

    async fn rollback_deployment(
        &self,
        target: &IssueTarget,
        namespace: &str,
        policy: &NamespaceRemediationPolicy,
        started: Instant,
    ) -> Result<RemediationOutcome, EngineError> {
        let IssueTarget::Deployment(deployment) = target else {
            return Err(EngineError::TargetMismatch {
                action: ActionKind::RollbackDeployment,
                expected: "Deployment",
                got: target.kind(),
            });
        };
        let name = deployment.metadata.name.clone().unwrap_or_default();

        if !policy.auto_rollback_enabled {
            return Ok(RemediationOutcome::finish(
                ActionKind::RollbackDeployment,
                false,
                "auto rollback is disabled for this namespace".to_string(),
                &name,
                namespace,
                started,
            ));
        }

        if self.config.remediation.dry_run {
            info!(deployment = name, namespace, "dry run: would roll back deployment");
            return Ok(RemediationOutcome::finish(
                ActionKind::RollbackDeployment,
                true,
                format!("dry run: would roll back deployment {name}"),
                &name,
                namespace,
                started,
            ));
        }

        // read the live object; the issue snapshot may be a cycle old
        let current = {
            let store = Arc::clone(&self.store);
            let ns = namespace.to_string();
            let deployment_name = name.clone();
            self.breakers
                .get(ApiSurface::Deployments)
                .execute(move || async move { store.get_deployment(&ns, &deployment_name).await })
                .await
        };
        let current = match current {
            Ok(deployment) => deployment,
            Err(err) => {
                return Ok(RemediationOutcome::finish(
                    ActionKind::RollbackDeployment,
                    false,
                    format!("failed to get deployment {name}: {err}"),
                    &name,
                    namespace,
                    started,
                ))
            }
        };

        let revision = current
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(REVISION_ANNOTATION))
            .map_or("1", String::as_str);
        if revision == "1" {
            return Ok(RemediationOutcome::finish(
                ActionKind::RollbackDeployment,
                false,
                "no previous revision found for rollback".to_string(),
                &name,
                namespace,
                started,
            ));
        }

        let patch = serde_json::json!({
            "metadata": {
                "annotations": { "deployment.kubernetes.io/revision": "1" }
            }
        });
        let patched = {
            let store = Arc::clone(&self.store);
            let ns = namespace.to_string();
            let deployment_name = name.clone();
            self.breakers
                .get(ApiSurface::Deployments)
                .execute(move || async move {
                    store.patch_deployment(&ns, &deployment_name, patch).await
                })
                .await
        };

        match patched {
            Ok(()) => {
                info!(deployment = name, namespace, "rolled back deployment to revision 1");
                Ok(RemediationOutcome::finish(
                    ActionKind::RollbackDeployment,
                    true,
                    format!("rolled back deployment {name} to revision 1"),
                    &name,
                    namespace,
                    started,
                ))
            }
            Err(err) => Ok(RemediationOutcome::finish(
                ActionKind::RollbackDeployment,
                false,
                format!("failed to roll back deployment {name}: {err}"),
                &name,
                namespace,
                started,
            )),
        }
    }

    async fn scale_replicas(
        &self,
        target: &IssueTarget,
        namespace: &str,
        policy: &NamespaceRemediationPolicy,
        started: Instant,
    ) -> Result<RemediationOutcome, EngineError> {
        let resource = target.name().to_string();

        if !policy.auto_scale_enabled {
            return Ok(RemediationOutcome::finish(
                ActionKind::ScaleReplicas,
                false,
                "auto scaling is disabled for this namespace".to_string(),
                &resource,
                namespace,
                started,
            ));
        }

        let deployment_name = match target {
            IssueTarget::Deployment(deployment) => {
                deployment.metadata.name.clone().unwrap_or_default()
            }
            IssueTarget::Pod(pod) => match self.owning_deployment(pod, namespace).await {
                Ok(Some(name)) => name,
                Ok(None) => {
                    return Ok(RemediationOutcome::finish(
                        ActionKind::ScaleReplicas,
                        false,
                        "could not find owning deployment for pod".to_string(),
                        &resource,
                        namespace,
                        started,
                    ))
                }
                Err(message) => {
                    return Ok(RemediationOutcome::finish(
                        ActionKind::ScaleReplicas,
                        false,
                        message,
                        &resource,
                        namespace,
                        started,
                    ))
                }
            },
        };

        let current = {
            let store = Arc::clone(&self.store);
            let ns = namespace.to_string();
            let name = deployment_name.clone();
            self.breakers
                .get(ApiSurface::Deployments)
                .execute(move || async move { store.get_deployment(&ns, &name).await })
                .await
        };
        let current = match current {
            Ok(deployment) => deployment,
            Err(err) => {
                return Ok(RemediationOutcome::finish(
                    ActionKind::ScaleReplicas,
                    false,
                    format!("failed to get deployment {deployment_name}: {err}"),
                    &resource,
                    namespace,
                    started,
                ))
            }
        };

        let current_replicas = current
            .spec
            .as_ref()
            .and_then(|spec| spec.replicas)
            .unwrap_or(1);
        if current_replicas >= MAX_REPLICAS {
            return Ok(RemediationOutcome::finish(
                ActionKind::ScaleReplicas,
                false,
                format!("deployment {deployment_name} already at maximum replicas ({MAX_REPLICAS})"),
                &deployment_name,
                namespace,
                started,
            ));
        }

        let increase = (current_replicas / 2).max(2);
        let new_replicas = (current_replicas + increase).min(MAX_REPLICAS);

        if self.config.remediation.dry_run {
            info!(
                deployment = deployment_name,
                namespace,
                from = current_replicas,
                to = new_replicas,
                "dry run: would scale deployment"
            );
            return Ok(RemediationOutcome::finish(
                ActionKind::ScaleReplicas,
                true,
                format!(
                    "dry run: would scale deployment {deployment_name} from {current_replicas} to {new_replicas} replicas"
                ),
                &deployment_name,
                namespace,
                started,
            ));
        }

        let patch = serde_json::json!({ "spec": { "replicas": new_replicas } });
        let patched = {
            let store = Arc::clone(&self.store);
            let ns = namespace.to_string();
            let name = deployment_name.clone();
            self.breakers
                .get(ApiSurface::Deployments)
                .execute(move || async move { store.patch_deployment(&ns, &name, patch).await })
                .await
        };

        match patched {
            Ok(()) => {
                info!(
                    deployment = deployment_name,
                    namespace,
                    from = current_replicas,
                    to = new_replicas,
                    "scaled deployment"
                );
                Ok(RemediationOutcome::finish(
                    ActionKind::ScaleReplicas,
                    true,
                    format!(
                        "scaled deployment {deployment_name} from {current_replicas} to {new_replicas} replicas"
                    ),
                    &deployment_name,
                    namespace,
                    started,
                ))
            }
            Err(err) => Ok(RemediationOutcome::finish(
                ActionKind::ScaleReplicas,
                false,
                format!("failed to scale deployment {deployment_name}: {err}"),
                &deployment_name,
                namespace,
                started,
            )),
        }
    }

    /// Walk Pod -> ReplicaSet -> Deployment owner references.
    async fn owning_deployment(
        &self,
        pod: &Pod,
        namespace: &str,
    ) -> Result<Option<String>, String> {
        let owners = pod.metadata.owner_references.as_deref().unwrap_or_default();

        for owner in owners {
            if owner.kind != "ReplicaSet" {
                continue;
            }

            let replica_set = {
                let store = Arc::clone(&self.store);
                let ns = namespace.to_string();
                let rs_name = owner.name.clone();
                self.breakers
                    .get(ApiSurface::ReplicaSets)
                    .execute(move || async move { store.get_replica_set(&ns, &rs_name).await })
                    .await
            };
            let replica_set = match replica_set {
                Ok(rs) => rs,
                Err(err) => {
                    return Err(format!("failed to get replica set {}: {err}", owner.name));
                }
            };

            let rs_owners = replica_set
                .metadata
                .owner_references
                .as_deref()
                .unwrap_or_default();
            for rs_owner in rs_owners {
                if rs_owner.kind == "Deployment" {
                    return Ok(Some(rs_owner.name.clone()));
                }
            }
        }

        Ok(None)
    }
}
