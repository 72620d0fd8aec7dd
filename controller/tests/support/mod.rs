//! Shared test support: an in-memory cluster store with a write-call
//! recorder, workload fixtures, and a recording notifier.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use guardian::notify::{Notifier, NotifyError};
use guardian::remediation::RemediationOutcome;
use guardian::{ClusterStore, Config, Issue, StoreError};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentCondition, DeploymentSpec, DeploymentStatus, ReplicaSet};
use k8s_openapi::api::core::v1::{
    ContainerState, ContainerStateTerminated, ContainerStateWaiting, ContainerStatus, Pod,
    PodStatus,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};
use kube::core::ErrorResponse;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

pub const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

/// A mutation issued to the store, in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteCall {
    DeletePod {
        namespace: String,
        name: String,
    },
    PatchDeployment {
        namespace: String,
        name: String,
        patch: serde_json::Value,
    },
}

/// In-memory [`ClusterStore`] with injectable failures.
#[derive(Default)]
pub struct MemoryStore {
    pods: Mutex<Vec<Pod>>,
    deployments: Mutex<Vec<Deployment>>,
    replica_sets: Mutex<Vec<ReplicaSet>>,
    writes: Mutex<Vec<WriteCall>>,
    fail_pod_deletes: AtomicBool,
    fail_pod_lists: AtomicBool,
    delete_attempts: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_pod(&self, pod: Pod) {
        self.pods.lock().push(pod);
    }

    pub fn add_deployment(&self, deployment: Deployment) {
        self.deployments.lock().push(deployment);
    }

    pub fn add_replica_set(&self, replica_set: ReplicaSet) {
        self.replica_sets.lock().push(replica_set);
    }

    pub fn writes(&self) -> Vec<WriteCall> {
        self.writes.lock().clone()
    }

    /// Make every pod delete fail with a transient server error.
    pub fn set_fail_pod_deletes(&self, fail: bool) {
        self.fail_pod_deletes.store(fail, Ordering::SeqCst);
    }

    /// Make every pod list fail with a transient server error.
    pub fn set_fail_pod_lists(&self, fail: bool) {
        self.fail_pod_lists.store(fail, Ordering::SeqCst);
    }

    /// Number of delete calls that reached the store (including failures).
    pub fn delete_attempts(&self) -> usize {
        self.delete_attempts.load(Ordering::SeqCst)
    }

    fn server_error() -> StoreError {
        StoreError::Api(kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "the server is currently unable to handle the request".to_string(),
            reason: "InternalError".to_string(),
            code: 500,
        }))
    }
}

fn meta_matches(meta: &ObjectMeta, namespace: &str, name: &str) -> bool {
    meta.namespace.as_deref() == Some(namespace) && meta.name.as_deref() == Some(name)
}

#[async_trait]
impl ClusterStore for MemoryStore {
    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>, StoreError> {
        if self.fail_pod_lists.load(Ordering::SeqCst) {
            return Err(Self::server_error());
        }

        let pods = self.pods.lock();
        Ok(pods
            .iter()
            .filter(|pod| {
                namespace.is_empty() || pod.metadata.namespace.as_deref() == Some(namespace)
            })
            .cloned()
            .collect())
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>, StoreError> {
        let deployments = self.deployments.lock();
        Ok(deployments
            .iter()
            .filter(|deployment| {
                namespace.is_empty() || deployment.metadata.namespace.as_deref() == Some(namespace)
            })
            .cloned()
            .collect())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        self.delete_attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_pod_deletes.load(Ordering::SeqCst) {
            return Err(Self::server_error());
        }

        let mut pods = self.pods.lock();
        let index = pods
            .iter()
            .position(|pod| meta_matches(&pod.metadata, namespace, name));
        match index {
            Some(index) => {
                pods.remove(index);
                self.writes.lock().push(WriteCall::DeletePod {
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                });
                Ok(())
            }
            None => Err(StoreError::NotFound {
                kind: "Pod",
                namespace: namespace.to_string(),
                name: name.to_string(),
            }),
        }
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, StoreError> {
        let deployments = self.deployments.lock();
        deployments
            .iter()
            .find(|deployment| meta_matches(&deployment.metadata, namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "Deployment",
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }

    async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<(), StoreError> {
        let mut deployments = self.deployments.lock();
        let deployment = deployments
            .iter_mut()
            .find(|deployment| meta_matches(&deployment.metadata, namespace, name))
            .ok_or_else(|| StoreError::NotFound {
                kind: "Deployment",
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;

        if let Some(replicas) = patch
            .get("spec")
            .and_then(|spec| spec.get("replicas"))
            .and_then(serde_json::Value::as_i64)
        {
            deployment
                .spec
                .get_or_insert_with(DeploymentSpec::default)
                .replicas = Some(i32::try_from(replicas).unwrap_or(i32::MAX));
        }
        if let Some(revision) = patch
            .get("metadata")
            .and_then(|meta| meta.get("annotations"))
            .and_then(|annotations| annotations.get(REVISION_ANNOTATION))
            .and_then(serde_json::Value::as_str)
        {
            deployment
                .metadata
                .annotations
                .get_or_insert_with(BTreeMap::new)
                .insert(REVISION_ANNOTATION.to_string(), revision.to_string());
        }

        self.writes.lock().push(WriteCall::PatchDeployment {
            namespace: namespace.to_string(),
            name: name.to_string(),
            patch,
        });
        Ok(())
    }

    async fn get_replica_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ReplicaSet, StoreError> {
        let replica_sets = self.replica_sets.lock();
        replica_sets
            .iter()
            .find(|rs| meta_matches(&rs.metadata, namespace, name))
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                kind: "ReplicaSet",
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }
}

/// Records every notification for assertions; never fails.
#[derive(Default)]
pub struct RecordingNotifier {
    issues: Mutex<Vec<String>>,
    remediations: Mutex<Vec<(String, bool)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn issue_rules(&self) -> Vec<String> {
        self.issues.lock().clone()
    }

    pub fn remediation_attempts(&self) -> Vec<(String, bool)> {
        self.remediations.lock().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify_issue(&self, issue: &Issue) -> Result<(), NotifyError> {
        self.issues.lock().push(issue.rule_name.clone());
        Ok(())
    }

    async fn notify_remediation(
        &self,
        _issue: &Issue,
        outcome: &RemediationOutcome,
    ) -> Result<(), NotifyError> {
        self.remediations
            .lock()
            .push((outcome.action.to_string(), outcome.success));
        Ok(())
    }

    async fn notify_startup(&self, _version: &str) -> Result<(), NotifyError> {
        Ok(())
    }

    async fn test_connection(&self) -> Result<(), NotifyError> {
        Ok(())
    }
}

fn object_meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..ObjectMeta::default()
    }
}

/// Pod with one container stuck in CrashLoopBackOff whose last termination
/// finished `finished_ago` in the past.
pub fn crash_loop_pod(namespace: &str, name: &str, restarts: i32, finished_ago: Duration) -> Pod {
    Pod {
        metadata: object_meta(namespace, name),
        status: Some(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: "app".to_string(),
                restart_count: restarts,
                state: Some(ContainerState {
                    waiting: Some(ContainerStateWaiting {
                        reason: Some("CrashLoopBackOff".to_string()),
                        ..ContainerStateWaiting::default()
                    }),
                    ..ContainerState::default()
                }),
                last_state: Some(ContainerState {
                    terminated: Some(terminated_state(finished_ago, "Error")),
                    ..ContainerState::default()
                }),
                ..ContainerStatus::default()
            }]),
            ..PodStatus::default()
        }),
        ..Pod::default()
    }
}

/// Pod whose container was OOM killed, optionally owned by a ReplicaSet.
pub fn oom_pod(namespace: &str, name: &str, restarts: i32, owner_rs: Option<&str>) -> Pod {
    let mut metadata = object_meta(namespace, name);
    if let Some(rs_name) = owner_rs {
        metadata.owner_references = Some(vec![OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: "ReplicaSet".to_string(),
            name: rs_name.to_string(),
            uid: format!("{rs_name}-uid"),
            ..OwnerReference::default()
        }]);
    }

    Pod {
        metadata,
        status: Some(PodStatus {
            container_statuses: Some(vec![ContainerStatus {
                name: "app".to_string(),
                restart_count: restarts,
                state: Some(ContainerState {
                    terminated: Some(terminated_state(Duration::from_secs(30), "OOMKilled")),
                    ..ContainerState::default()
                }),
                ..ContainerStatus::default()
            }]),
            ..PodStatus::default()
        }),
        ..Pod::default()
    }
}

fn terminated_state(finished_ago: Duration, reason: &str) -> ContainerStateTerminated {
    let finished =
        Utc::now() - chrono::Duration::from_std(finished_ago).unwrap_or_else(|_| chrono::Duration::zero());
    ContainerStateTerminated {
        exit_code: 137,
        reason: Some(reason.to_string()),
        finished_at: Some(Time(finished)),
        ..ContainerStateTerminated::default()
    }
}

/// Plain deployment with the given replica count and revision annotation.
pub fn deployment(namespace: &str, name: &str, replicas: i32, revision: &str) -> Deployment {
    let mut metadata = object_meta(namespace, name);
    metadata.annotations = Some(BTreeMap::from([(
        REVISION_ANNOTATION.to_string(),
        revision.to_string(),
    )]));

    Deployment {
        metadata,
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            ..DeploymentSpec::default()
        }),
        ..Deployment::default()
    }
}

/// Deployment whose Progressing condition failed with
/// ProgressDeadlineExceeded `transitioned_ago` in the past.
pub fn failed_deployment(
    namespace: &str,
    name: &str,
    revision: &str,
    transitioned_ago: Duration,
) -> Deployment {
    let mut deployment = deployment(namespace, name, 1, revision);
    let transitioned = Utc::now()
        - chrono::Duration::from_std(transitioned_ago).unwrap_or_else(|_| chrono::Duration::zero());
    deployment.status = Some(DeploymentStatus {
        conditions: Some(vec![DeploymentCondition {
            type_: "Progressing".to_string(),
            status: "False".to_string(),
            reason: Some("ProgressDeadlineExceeded".to_string()),
            last_transition_time: Some(Time(transitioned)),
            ..DeploymentCondition::default()
        }]),
        ..DeploymentStatus::default()
    });
    deployment
}

/// ReplicaSet owned by the given deployment.
pub fn replica_set(namespace: &str, name: &str, owner_deployment: &str) -> ReplicaSet {
    let mut metadata = object_meta(namespace, name);
    metadata.owner_references = Some(vec![OwnerReference {
        api_version: "apps/v1".to_string(),
        kind: "Deployment".to_string(),
        name: owner_deployment.to_string(),
        uid: format!("{owner_deployment}-uid"),
        ..OwnerReference::default()
    }]);

    ReplicaSet {
        metadata,
        ..ReplicaSet::default()
    }
}

/// Baseline config for tests: defaults plus a short cooldown.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.remediation.cooldown_seconds = 300;
    config
}
