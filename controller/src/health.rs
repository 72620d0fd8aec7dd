//! Health checks and probe endpoints
//!
//! `/healthz` answers 200 for as long as the process is alive, `/readyz`
//! aggregates the registered checks, and `/health` returns the full
//! per-check detail as JSON. Checks run on demand per request.

use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;

use crate::store::ClusterStore;

/// Health check errors
#[derive(Debug, Error)]
pub enum HealthError {
    #[error("{0}")]
    Check(String),
}

/// Status of one check or of the process as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Unhealthy,
}

/// Result of running a single check.
#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub status: HealthState,
    pub message: String,
    pub last_checked: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Aggregate health report served on `/health`.
#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub status: HealthState,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub version: String,
    pub checks: HashMap<String, CheckResult>,
}

/// A pluggable health check.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self) -> Result<(), HealthError>;
}

/// Registry of health checks, fixed after startup.
pub struct HealthRegistry {
    checks: Vec<Box<dyn HealthCheck>>,
    start_time: Instant,
    version: String,
}

impl HealthRegistry {
    #[must_use]
    pub fn new(version: impl Into<String>) -> Self {
        Self {
            checks: Vec::new(),
            start_time: Instant::now(),
            version: version.into(),
        }
    }

    #[must_use]
    pub fn with_check(mut self, check: Box<dyn HealthCheck>) -> Self {
        self.checks.push(check);
        self
    }

    /// Run every registered check and build the aggregate report.
    pub async fn run_checks(&self) -> HealthReport {
        let mut results = HashMap::new();
        let mut overall = HealthState::Healthy;

        for check in &self.checks {
            let started = Instant::now();
            let outcome = check.check().await;
            let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

            let result = match outcome {
                Ok(()) => CheckResult {
                    name: check.name().to_string(),
                    status: HealthState::Healthy,
                    message: "OK".to_string(),
                    last_checked: Utc::now(),
                    duration_ms,
                },
                Err(err) => {
                    overall = HealthState::Unhealthy;
                    CheckResult {
                        name: check.name().to_string(),
                        status: HealthState::Unhealthy,
                        message: err.to_string(),
                        last_checked: Utc::now(),
                        duration_ms,
                    }
                }
            };
            results.insert(check.name().to_string(), result);
        }

        HealthReport {
            status: overall,
            timestamp: Utc::now(),
            uptime_seconds: self.start_time.elapsed().as_secs(),
            version: self.version.clone(),
            checks: results,
        }
    }

    pub async fn is_healthy(&self) -> bool {
        self.run_checks().await.status == HealthState::Healthy
    }
}

/// Probe router served on the health probe address.
pub fn probe_router(registry: Arc<HealthRegistry>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/health", get(health))
        .with_state(registry)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(registry): State<Arc<HealthRegistry>>) -> (StatusCode, &'static str) {
    if registry.is_healthy().await {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn health(
    State(registry): State<Arc<HealthRegistry>>,
) -> (StatusCode, Json<HealthReport>) {
    let report = registry.run_checks().await;
    let code = match report.status {
        HealthState::Healthy => StatusCode::OK,
        HealthState::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(report))
}

/// Verifies the cluster API is reachable through the store.
pub struct ClusterApiCheck {
    store: Arc<dyn ClusterStore>,
}

impl ClusterApiCheck {
    #[must_use]
    pub fn new(store: Arc<dyn ClusterStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl HealthCheck for ClusterApiCheck {
    fn name(&self) -> &str {
        "kubernetes-api"
    }

    async fn check(&self) -> Result<(), HealthError> {
        self.store
            .list_pods("kube-system")
            .await
            .map(|_| ())
            .map_err(|err| HealthError::Check(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticCheck {
        name: &'static str,
        healthy: bool,
    }

    #[async_trait]
    impl HealthCheck for StaticCheck {
        fn name(&self) -> &str {
            self.name
        }

        async fn check(&self) -> Result<(), HealthError> {
            if self.healthy {
                Ok(())
            } else {
                Err(HealthError::Check("connection refused".to_string()))
            }
        }
    }

    #[tokio::test]
    async fn empty_registry_is_healthy() {
        let registry = HealthRegistry::new("test");
        assert!(registry.is_healthy().await);
    }

    #[tokio::test]
    async fn one_failing_check_makes_the_report_unhealthy() {
        let registry = HealthRegistry::new("test")
            .with_check(Box::new(StaticCheck { name: "up", healthy: true }))
            .with_check(Box::new(StaticCheck { name: "down", healthy: false }));

        let report = registry.run_checks().await;
        assert_eq!(report.status, HealthState::Unhealthy);
        assert_eq!(report.checks.len(), 2);
        assert_eq!(report.checks["up"].status, HealthState::Healthy);
        assert_eq!(report.checks["down"].status, HealthState::Unhealthy);
        assert!(report.checks["down"].message.contains("connection refused"));
    }

    #[tokio::test]
    async fn report_serializes_with_lowercase_status() {
        let registry =
            HealthRegistry::new("1.2.3").with_check(Box::new(StaticCheck { name: "up", healthy: true }));
        let report = registry.run_checks().await;

        let body = serde_json::to_value(&report).expect("serialize");
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["version"], "1.2.3");
        assert_eq!(body["checks"]["up"]["status"], "healthy");
    }
}
