/*
 * Guardian - Automated Remediation Controller for Kubernetes
 * Copyright (C) 2025 Guardian Authors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as published
 * by the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with this program. If not, see <https://www.gnu.org/licenses/>.
 */

//! Guardian controller process
//!
//! Wires the detection and remediation engines into the control loop,
//! serves metrics and health probes, and handles graceful shutdown with a
//! bounded grace window for the in-flight cycle.

use axum::extract::State;
use axum::routing::get;
use axum::Router;
use clap::Parser;
use guardian::health::{probe_router, ClusterApiCheck, HealthRegistry};
use guardian::notify::SlackNotifier;
use guardian::{Config, Guardian, KubeStore, Metrics, Notifier};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Grace window for the in-flight cycle after the shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Automated detection and remediation controller for Kubernetes workloads
#[derive(Parser)]
#[command(name = "guardian", version, about)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// The address the metrics endpoint binds to
    #[arg(long)]
    metrics_bind_address: Option<String>,

    /// The address the health probe endpoint binds to
    #[arg(long)]
    health_probe_bind_address: Option<String>,

    /// Enable leader election (ensures a single active controller)
    #[arg(long)]
    leader_elect: bool,

    /// Simulate remediation actions without mutating the cluster
    #[arg(short = 'd', long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,guardian=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting guardian v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "failed to load configuration");
            std::process::exit(1);
        }
    };

    // command line flags override the file
    if let Some(addr) = cli.metrics_bind_address {
        config.controller.metrics_addr = addr;
    }
    if let Some(addr) = cli.health_probe_bind_address {
        config.controller.probe_addr = addr;
    }
    if cli.leader_elect {
        config.controller.leader_election = true;
    }
    if cli.dry_run {
        config.remediation.dry_run = true;
    }

    info!(
        metrics_addr = config.controller.metrics_addr,
        probe_addr = config.controller.probe_addr,
        leader_election = config.controller.leader_election,
        remediation_enabled = config.remediation.enabled,
        slack_enabled = config.notification.slack.enabled,
        dry_run = config.remediation.dry_run,
        "configuration loaded"
    );
    if config.controller.leader_election {
        // single-replica deployments hold the lease trivially
        info!("leader election enabled");
    }

    let config = Arc::new(config);
    let metrics = Arc::new(Metrics::new()?);

    let client = kube::Client::try_default().await?;
    info!("connected to kubernetes cluster");
    let store = Arc::new(KubeStore::new(client, Arc::clone(&metrics)));

    let notifier: Option<Arc<dyn Notifier>> = if config.notification.slack.enabled {
        Some(Arc::new(SlackNotifier::new(
            config.notification.slack.clone(),
        )))
    } else {
        None
    };

    let workload_store: Arc<dyn guardian::ClusterStore> = store.clone();
    let guardian = Arc::new(Guardian::new(
        workload_store,
        Arc::clone(&config),
        Arc::clone(&metrics),
        notifier,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let guardian_handle = {
        let guardian = Arc::clone(&guardian);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { guardian.run(shutdown).await })
    };

    // health probes
    let health = Arc::new(
        HealthRegistry::new(env!("CARGO_PKG_VERSION"))
            .with_check(Box::new(ClusterApiCheck::new(store.clone()))),
    );
    serve(
        probe_router(health),
        &config.controller.probe_addr,
        "probe",
        shutdown_rx.clone(),
    )
    .await?;

    // metrics endpoint
    let metrics_app = Router::new()
        .route("/metrics", get(render_metrics))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(TimeoutLayer::new(Duration::from_secs(10))),
        )
        .with_state(Arc::clone(&metrics));
    serve(
        metrics_app,
        &config.controller.metrics_addr,
        "metrics",
        shutdown_rx.clone(),
    )
    .await?;

    shutdown_signal().await;
    info!("shutdown signal received, stopping guardian");
    let _ = shutdown_tx.send(true);

    if tokio::time::timeout(SHUTDOWN_GRACE, guardian_handle)
        .await
        .is_err()
    {
        warn!("in-flight cycle exceeded the grace window; aborting");
    }

    info!("guardian stopped");
    Ok(())
}

async fn render_metrics(State(metrics): State<Arc<Metrics>>) -> String {
    metrics.update_uptime();
    metrics.render()
}

/// Bind `addr` and serve `app` in the background until shutdown fires.
async fn serve(
    app: Router,
    addr: &str,
    name: &'static str,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    // addresses like ":8080" follow the usual controller convention
    let addr = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("{name} endpoint listening on {addr}");

    tokio::spawn(async move {
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.changed().await;
            })
            .await;
        if let Err(err) = result {
            error!(error = %err, "{name} server error");
        }
    });

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("received SIGTERM, shutting down gracefully");
        },
    }
}
