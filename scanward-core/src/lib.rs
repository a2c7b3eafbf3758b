//! # Scanward Core
//!
//! Scan job orchestration on top of an external antivirus engine.
//!
//! ## Overview
//!
//! A job is either a set of uploaded files (`stream`) or the container images
//! a registry URL resolves to (`image`). The orchestrator admits each job
//! through the restart gate, runs one engine task per item, reduces the
//! engine's event stream to a verdict, persists the job and fires its
//! completion callbacks.
//!
//! ## Architecture
//!
//! - [`engine`]: engine task protocol, event stream decoding, verdict reduction
//! - [`restart`]: admission/drain barrier around engine restarts
//! - [`persistence`]: SQLite job store
//! - [`orchestration`]: job lifecycle and callbacks
//! - [`container`] and [`registry`]: image staging and discovery
//! - [`watcher`]: restarts the engine after updates that require it
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use scanward_core::container::Podman;
//! use scanward_core::engine::KeslControl;
//! use scanward_core::model::{ScanJob, ScanParams};
//! use scanward_core::orchestration::{Collaborators, OrchestratorSettings, ScanOrchestrator};
//! use scanward_core::registry::RegistryClient;
//! use scanward_core::restart::RestartCoordinator;
//!
//! async fn scan_upload() -> scanward_core::Result<()> {
//!     let timeout = Duration::from_secs(600);
//!     let kesl = Arc::new(KeslControl::new("/usr/bin/kesl-control", "/etc/init.d/kesl", timeout, timeout));
//!     let collaborators = Collaborators {
//!         engine: kesl.clone(),
//!         runtime: Arc::new(Podman::new("/usr/bin/podman", false, "certificates", timeout)),
//!         registry: Arc::new(RegistryClient::new(Duration::from_secs(30))?),
//!         gate: Arc::new(RestartCoordinator::new(kesl, Duration::from_secs(1))),
//!     };
//!     let orchestrator = ScanOrchestrator::start(
//!         "data/scans.sqlite".as_ref(),
//!         collaborators,
//!         OrchestratorSettings::default(),
//!     )
//!     .await?;
//!
//!     let job = ScanJob::stream("application/octet-stream", [("noname", "/tmp/upload")], ScanParams::default());
//!     let id = orchestrator.create_job(job).await;
//!     let summary = orchestrator.run_sync(id).await?;
//!     println!("{:?}", summary.verdicts);
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

/// One-shot external command invocations
pub mod command;

/// External collaborator for pulling, tagging and pushing images
pub mod container;

/// Scan engine control and event decoding
pub mod engine;

/// Error types and error handling utilities
pub mod error;

/// Job records and per-item outcomes
pub mod model;

pub mod orchestration;

pub mod persistence;

/// Registry URL parsing and image discovery
pub mod registry;

pub mod restart;

/// Background follower of engine update tasks
pub mod watcher;

pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");

pub use error::{Result, ScanwardError};
