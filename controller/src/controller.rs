//! Guardian control loop
//!
//! One long-lived cooperative loop driven by two tickers: the evaluation
//! ticker runs detect→process→act cycles, the cleanup ticker garbage
//! collects expired cooldowns. Cycle errors and panics never terminate the
//! loop; the next tick always gets a fresh start.

use futures::{FutureExt, StreamExt};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::detection::{Detector, Issue};
use crate::metrics::Metrics;
use crate::notify::Notifier;
use crate::remediation::Engine;
use crate::store::ClusterStore;

/// How often expired cooldown entries are swept.
const COOLDOWN_GC_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// The main controller.
pub struct Guardian {
    config: Arc<Config>,
    store: Arc<dyn ClusterStore>,
    detector: Detector,
    engine: Engine,
    notifier: Option<Arc<dyn Notifier>>,
    metrics: Arc<Metrics>,
}

impl Guardian {
    #[must_use]
    pub fn new(
        store: Arc<dyn ClusterStore>,
        config: Arc<Config>,
        metrics: Arc<Metrics>,
        notifier: Option<Arc<dyn Notifier>>,
    ) -> Self {
        Self {
            detector: Detector::new(Arc::clone(&config)),
            engine: Engine::new(Arc::clone(&store), Arc::clone(&config)),
            store,
            config,
            notifier,
            metrics,
        }
    }

    #[must_use]
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// Run the control loop until the shutdown signal fires. The in-flight
    /// cycle is allowed to finish; the caller bounds the grace window.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if let Some(notifier) = &self.notifier {
            match notifier.test_connection().await {
                Ok(()) => {
                    if let Err(err) = notifier.notify_startup(env!("CARGO_PKG_VERSION")).await {
                        error!(error = %err, "failed to send startup notification");
                    }
                }
                Err(err) => {
                    error!(error = %err, "notifier connection test failed, continuing without notifications");
                }
            }
        }

        let period = self.config.detection.evaluation_interval;
        info!(evaluation_interval = ?period, "guardian started");

        let start = tokio::time::Instant::now();
        let mut evaluation = tokio::time::interval_at(start + period, period);
        evaluation.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup =
            tokio::time::interval_at(start + COOLDOWN_GC_INTERVAL, COOLDOWN_GC_INTERVAL);
        cleanup.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("guardian stopping");
                    break;
                }
                _ = evaluation.tick() => {
                    if AssertUnwindSafe(self.run_cycle()).catch_unwind().await.is_err() {
                        error!("detection cycle panicked; resuming on next tick");
                    }
                }
                _ = cleanup.tick() => {
                    self.engine.cleanup_cooldowns();
                    self.refresh_cooldown_gauge();
                }
            }
        }
    }

    /// One detect→process→act cycle.
    pub async fn run_cycle(&self) {
        let started = Instant::now();
        debug!("starting detection cycle");

        let issues = self.detector.detect(self.store.as_ref()).await;
        self.metrics.update_last_detection();
        self.metrics.update_uptime();
        self.metrics
            .record_detection_duration("detection_cycle", started.elapsed().as_secs_f64());

        if issues.is_empty() {
            debug!("no issues detected");
            self.refresh_cooldown_gauge();
            return;
        }

        info!(count = issues.len(), "issues detected");
        for issue in &issues {
            self.metrics.record_issue_detected(
                &issue.rule_name,
                issue.severity.as_str(),
                &issue.namespace,
            );
        }

        let limit = self.config.controller.max_concurrent_reconciles.max(1);
        if limit <= 1 {
            for issue in issues {
                self.process_issue(issue).await;
            }
        } else {
            // actions on the same resource must serialize even when issues
            // are processed concurrently; group by namespace/name
            let mut groups: HashMap<String, Vec<Issue>> = HashMap::new();
            for issue in issues {
                groups
                    .entry(format!("{}/{}", issue.namespace, issue.name))
                    .or_default()
                    .push(issue);
            }

            futures::stream::iter(groups.into_values())
                .for_each_concurrent(limit, |group| async move {
                    for issue in group {
                        self.process_issue(issue).await;
                    }
                })
                .await;
        }

        self.refresh_cooldown_gauge();
    }

    async fn process_issue(&self, issue: Issue) {
        info!(
            rule = issue.rule_name,
            resource = issue.name,
            namespace = issue.namespace,
            severity = %issue.severity,
            "processing issue"
        );

        if let Some(notifier) = &self.notifier {
            match notifier.notify_issue(&issue).await {
                Ok(()) => self.metrics.record_notification("issue", "success"),
                Err(err) => {
                    error!(error = %err, "failed to send issue notification");
                    self.metrics.record_notification("issue", "failed");
                }
            }
        }

        // actions execute in list order; a failure moves on to the next one
        for action in issue.actions.clone() {
            let started = Instant::now();
            match self
                .engine
                .execute(action, &issue.target, &issue.namespace)
                .await
            {
                Ok(outcome) => {
                    let result = if outcome.success { "success" } else { "failed" };
                    self.metrics.record_remediation(
                        action.as_str(),
                        result,
                        &issue.namespace,
                        started.elapsed().as_secs_f64(),
                    );
                    info!(
                        %action,
                        success = outcome.success,
                        message = outcome.message,
                        "remediation action completed"
                    );

                    if let Some(notifier) = &self.notifier {
                        match notifier.notify_remediation(&issue, &outcome).await {
                            Ok(()) => self.metrics.record_notification("remediation", "success"),
                            Err(err) => {
                                error!(error = %err, "failed to send remediation notification");
                                self.metrics.record_notification("remediation", "failed");
                            }
                        }
                    }
                }
                Err(err) => {
                    error!(%action, error = %err, "failed to execute remediation action");
                    self.metrics.record_remediation(
                        action.as_str(),
                        "error",
                        &issue.namespace,
                        started.elapsed().as_secs_f64(),
                    );
                }
            }
        }
    }

    fn refresh_cooldown_gauge(&self) {
        for (namespace, count) in self.engine.cooldown_counts() {
            self.metrics
                .set_cooldown_active(&namespace, i64::try_from(count).unwrap_or(i64::MAX));
        }
    }
}
