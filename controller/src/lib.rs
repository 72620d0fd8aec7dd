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

#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Guardian core library
//!
//! This crate provides the closed-loop control plane for automated workload
//! remediation: the detection engine, the remediation engine (cooldown, rate
//! limiting, circuit breaking), and the controller that sequences them.

pub mod config;
pub mod controller;
pub mod detection;
pub mod health;
pub mod metrics;
pub mod notify;
pub mod policy;
pub mod remediation;
pub mod store;

// Re-export commonly used types
pub use config::{Config, ConfigError};
pub use controller::Guardian;
pub use detection::{ActionKind, Detector, Issue, IssueTarget, Severity};
pub use metrics::Metrics;
pub use notify::Notifier;
pub use remediation::{Engine, RemediationOutcome};
pub use store::{ClusterStore, KubeStore, StoreError};
