//! The stage orchestration engine.
//!
//! Stages are grouped by execution-order ordinal; each group's stages run
//! concurrently as lightweight tasks and groups are serialized by a barrier.
//! No task ever blocks on another task directly: all cross-stage
//! coordination goes through the object store via the readiness gate. A
//! single termination broadcast collapses worker errors, OS signals, and
//! external cancellation into one shutdown decision every task checks.

pub mod config;
pub mod gate;
pub mod setup;

pub use config::{BuildSpec, Config};
pub use gate::{Readiness, ReadinessGate, POLL_INTERVAL};

use crate::errors::{GangwayError, Result};
use crate::jobspec::{JobSpec, Stage};
use crate::meta::{builder_arch, BUILDS_JSON};
use crate::store::{StoreHandle, StoreServer};
use crate::terminate::{spawn_coordinator, Termination};
use crate::worker::{PodIdentity, RemoteFile, Return, WorkSpec, WorkerDispatcher};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// Orchestrates one build job end to end.
pub struct Orchestrator {
    cfg: Config,
    jobspec: JobSpec,
}

impl Orchestrator {
    /// Creates an orchestrator for a job.
    #[must_use]
    pub fn new(cfg: Config, jobspec: JobSpec) -> Self {
        Self { cfg, jobspec }
    }

    /// Runs setup, the grouped stage loop, and teardown.
    ///
    /// Returns the first fatal error, if any. `external` is the governing
    /// run's termination handle; cancelling it stops the loop
    /// cooperatively.
    pub async fn run(
        mut self,
        dispatcher: Arc<dyn WorkerDispatcher>,
        external: Option<Termination>,
    ) -> Result<()> {
        let work_dir = self.cfg.work_dir.clone();
        if !work_dir.is_dir() {
            return Err(GangwayError::Config(format!(
                "context dir {} does not exist",
                work_dir.display()
            )));
        }

        // Setup happens once, before any stage runs; failures here are
        // fatal and abort orchestration.
        let mut remote_files = setup::process_binary_input(&self.cfg, &mut self.jobspec)?;

        // The running builds index is always served when it exists.
        if work_dir.join("builds").join(BUILDS_JSON).is_file() {
            remote_files.push(RemoteFile {
                bucket: "builds".to_string(),
                object: BUILDS_JSON.to_string(),
                compressed: false,
                artifact: None,
            });
        }

        remote_files.extend(setup::discover_stages(&self.cfg, &mut self.jobspec)?);

        if self.jobspec.stages.is_empty() {
            info!(
                "no work to do; define COSA_CMDS, declare jobspec stages, or \
                 provide files ending in .cosa.sh"
            );
            return Ok(());
        }

        // Start the store only after setup: every directory in the working
        // tree is an implicit bucket and every file an implicit key.
        let host = if self.cfg.pod.ip.is_empty() {
            "127.0.0.1".to_string()
        } else {
            self.cfg.pod.ip.clone()
        };
        let mut server = StoreServer::new(&work_dir, host);
        server.start().await?;
        server.ensure_bucket("builds")?;
        server.ensure_bucket(setup::SOURCE_BUCKET)?;

        if let Ok(rendered) = serde_yaml::to_string(&self.jobspec) {
            debug!(jobspec = %rendered, "using jobspec definition");
        }

        let return_to = Return {
            bucket: "builds".to_string(),
            endpoint: server.endpoint(),
            credentials: server.credentials().clone(),
        };

        let term = Termination::new();
        let (err_tx, err_rx) = mpsc::channel(1);
        let coordinator = spawn_coordinator(term.clone(), err_rx, external);

        let gate = Arc::new(ReadinessGate::new(
            StoreHandle::file_backed(),
            work_dir.to_string_lossy().into_owned(),
            builder_arch(),
        ));

        let ctx = RunContext {
            gate,
            base_files: remote_files,
            job_spec: self.jobspec.clone(),
            pod: self.cfg.pod.clone(),
            return_to,
            dispatcher,
            term: term.clone(),
            errors: err_tx,
        };
        run_groups(self.jobspec.stages.clone(), ctx).await;

        // Tear down the termination state and collect the first fatal
        // error, if one fired.
        term.signal();
        let first_error = coordinator.await.ok().flatten();

        let store = StoreHandle::file_backed();
        setup::final_inventory(&store, &work_dir).await;
        server.kill().await;
        let _ = std::fs::remove_dir_all(work_dir.join(setup::SOURCE_BUCKET));

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Shared state every stage task of a run observes.
#[derive(Clone)]
pub(crate) struct RunContext {
    pub(crate) gate: Arc<ReadinessGate>,
    pub(crate) base_files: Vec<RemoteFile>,
    pub(crate) job_spec: JobSpec,
    pub(crate) pod: PodIdentity,
    pub(crate) return_to: Return,
    pub(crate) dispatcher: Arc<dyn WorkerDispatcher>,
    pub(crate) term: Termination,
    pub(crate) errors: mpsc::Sender<GangwayError>,
}

/// Partitions stages by ordinal and runs each group behind a barrier.
///
/// Groups run in ascending ordinal order; once termination is signaled at
/// a group boundary, that group and all subsequent ones are skipped.
pub(crate) async fn run_groups(stages: Vec<Stage>, ctx: RunContext) {
    let mut groups: BTreeMap<u32, Vec<(usize, Stage)>> = BTreeMap::new();
    for (index, stage) in stages.into_iter().enumerate() {
        groups.entry(stage.execution_order).or_default().push((index, stage));
    }

    for (order, members) in groups {
        if ctx.term.is_terminated() {
            info!(group = order, "termination signaled, skipping remaining groups");
            break;
        }
        info!(group = order, workers = members.len(), "starting group of workers");
        let handles: Vec<_> = members
            .into_iter()
            .map(|(index, stage)| {
                let task = StageTask {
                    // Independent copy per task so concurrent closures
                    // cannot share mutable stage state.
                    stage: stage.deep_copy(),
                    index,
                    ctx: ctx.clone(),
                };
                tokio::spawn(task.run())
            })
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// One stage's lifecycle: waiting → dispatched → done | failed.
struct StageTask {
    stage: Stage,
    index: usize,
    ctx: RunContext,
}

impl StageTask {
    async fn run(self) {
        let Self { stage, index, ctx } = self;
        loop {
            if ctx.term.is_terminated() {
                return;
            }

            let readiness = ctx.gate.check(&stage.id, &stage.require_artifacts).await;
            if !readiness.ready {
                info!(
                    stage = %stage.id,
                    required_artifacts = ?stage.require_artifacts,
                    "waiting for dependencies"
                );
                tokio::select! {
                    () = tokio::time::sleep(ctx.gate.poll_interval()) => {}
                    () = ctx.term.terminated() => return,
                }
                continue;
            }

            // The work specification is rebuilt per attempt and becomes
            // immutable dispatcher input once the gate is satisfied.
            let mut remote_files = ctx.base_files.clone();
            remote_files.extend(readiness.remote_files);
            let ws = WorkSpec {
                pod: ctx.pod.clone(),
                execute_stages: vec![stage.id.clone()],
                job_spec: ctx.job_spec.clone(),
                remote_files,
                return_to: ctx.return_to.clone(),
            };

            info!(stage = %stage.id, "executing worker");
            match ctx.dispatcher.dispatch(&ws, index, &ctx.term).await {
                Ok(()) => info!(stage = %stage.id, "worker completed"),
                Err(err) => {
                    if ctx.term.is_terminated() {
                        // Termination already won; exit silently.
                        return;
                    }
                    error!(stage = %stage.id, %err, "failed stage execution");
                    let _ = ctx.errors.try_send(err);
                    // Hold the task open until the broadcast lands so the
                    // group barrier observes termination before the next
                    // group starts.
                    ctx.term.terminated().await;
                }
            }
            return;
        }
    }
}
