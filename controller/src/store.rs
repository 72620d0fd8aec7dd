//! Cluster store port
//!
//! The engines never talk to the Kubernetes API directly; they go through
//! the [`ClusterStore`] trait. `KubeStore` is the production implementation
//! backed by `kube::Api`. Tests substitute an in-memory store.
//!
//! All reads list with an empty namespace meaning "all namespaces". The only
//! writes the system ever issues are pod deletion (foreground propagation)
//! and deployment merge patches; everything else is read-only.

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PropagationPolicy};
use kube::Client;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use crate::metrics::Metrics;

/// The Kubernetes API surfaces the remediation engine touches. Each surface
/// gets its own circuit breaker so a degraded resource type does not block
/// the others.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ApiSurface {
    Pods,
    Deployments,
    ReplicaSets,
}

impl ApiSurface {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pods => "pods",
            Self::Deployments => "deployments",
            Self::ReplicaSets => "replicasets",
        }
    }
}

/// Errors surfaced by cluster store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} {namespace}/{name} not found")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    #[error("kubernetes api error: {0}")]
    Api(#[from] kube::Error),
}

impl StoreError {
    /// Whether this error is a benign "already gone" condition.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Api(kube::Error::Api(response)) => response.code == 404,
            Self::Api(_) => false,
        }
    }
}

/// Abstract workload store over pods, deployments, and replica sets.
///
/// `namespace = ""` on the list operations means all namespaces.
#[async_trait]
pub trait ClusterStore: Send + Sync {
    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>, StoreError>;

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>, StoreError>;

    /// Delete a pod with foreground propagation. The replacement pod is the
    /// cluster's responsibility.
    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), StoreError>;

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, StoreError>;

    /// Apply a JSON merge patch to a deployment.
    async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<(), StoreError>;

    async fn get_replica_set(&self, namespace: &str, name: &str)
        -> Result<ReplicaSet, StoreError>;
}

/// Production store backed by the Kubernetes API.
pub struct KubeStore {
    client: Client,
    metrics: Arc<Metrics>,
}

impl KubeStore {
    #[must_use]
    pub fn new(client: Client, metrics: Arc<Metrics>) -> Self {
        Self { client, metrics }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        if namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), namespace)
        }
    }

    fn deployments(&self, namespace: &str) -> Api<Deployment> {
        if namespace.is_empty() {
            Api::all(self.client.clone())
        } else {
            Api::namespaced(self.client.clone(), namespace)
        }
    }

    fn replica_sets(&self, namespace: &str) -> Api<ReplicaSet> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn record<T>(
        &self,
        method: &str,
        resource: &str,
        started: Instant,
        result: &Result<T, kube::Error>,
    ) {
        let status = if result.is_ok() { "success" } else { "error" };
        self.metrics
            .record_api_call(method, resource, status, started.elapsed().as_secs_f64());
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn list_pods(&self, namespace: &str) -> Result<Vec<Pod>, StoreError> {
        let started = Instant::now();
        let result = self.pods(namespace).list(&ListParams::default()).await;
        self.record("list", "pods", started, &result);
        Ok(result?.items)
    }

    async fn list_deployments(&self, namespace: &str) -> Result<Vec<Deployment>, StoreError> {
        let started = Instant::now();
        let result = self
            .deployments(namespace)
            .list(&ListParams::default())
            .await;
        self.record("list", "deployments", started, &result);
        Ok(result?.items)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> Result<(), StoreError> {
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Foreground),
            ..DeleteParams::default()
        };
        let started = Instant::now();
        let result = self.pods(namespace).delete(name, &params).await;
        self.record("delete", "pods", started, &result);
        result?;
        Ok(())
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment, StoreError> {
        let started = Instant::now();
        let result = self.deployments(namespace).get(name).await;
        self.record("get", "deployments", started, &result);
        Ok(result?)
    }

    async fn patch_deployment(
        &self,
        namespace: &str,
        name: &str,
        patch: serde_json::Value,
    ) -> Result<(), StoreError> {
        let started = Instant::now();
        let result = self
            .deployments(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await;
        self.record("patch", "deployments", started, &result);
        result?;
        Ok(())
    }

    async fn get_replica_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ReplicaSet, StoreError> {
        let started = Instant::now();
        let result = self.replica_sets(namespace).get(name).await;
        self.record("get", "replicasets", started, &result);
        Ok(result?)
    }
}
