//! # Gangway
//!
//! A multi-stage container build orchestrator.
//!
//! Gangway coordinates build stages that run as independent workers and
//! exchange artifacts through an embedded object store:
//!
//! - **Grouped execution**: Stages share an execution-order ordinal run
//!   concurrently; groups are serialized by a barrier
//! - **Readiness gating**: Dependencies are satisfied by polling build
//!   metadata, never by direct worker-to-worker channels
//! - **Termination fan-in**: Worker errors, OS signals, and external
//!   cancellation collapse into one cooperative shutdown broadcast
//! - **Embedded store**: The working tree is served as buckets and keys to
//!   workers for the lifetime of a run
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use gangway::prelude::*;
//! use std::sync::Arc;
//!
//! let cfg = Config::from_env()?;
//! let jobspec = JobSpec::from_file(&cfg.work_dir.join(&cfg.jobspec_file))?;
//! let dispatcher = Arc::new(LocalDispatcher::new(&cfg.work_dir));
//!
//! Orchestrator::new(cfg, jobspec).run(dispatcher, None).await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod errors;
pub mod jobspec;
pub mod meta;
pub mod orchestrate;
pub mod store;
pub mod terminate;
pub mod worker;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::errors::{GangwayError, Result};
    pub use crate::jobspec::{Job, JobSpec, Recipe, Repo, Stage};
    pub use crate::meta::{builder_arch, Artifact, BuildMeta, BuildsIndex};
    pub use crate::orchestrate::{Config, Orchestrator, Readiness, ReadinessGate};
    pub use crate::store::{
        HttpObjectClient, ObjectClient, StoreCredentials, StoreHandle, StoreServer,
    };
    pub use crate::terminate::Termination;
    pub use crate::worker::{
        LocalDispatcher, PodIdentity, RemoteFile, Return, WorkSpec, WorkerDispatcher,
    };
}
