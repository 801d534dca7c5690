//! Worker handoff types and the dispatcher capability.
//!
//! The orchestrator never talks to a running worker directly. It prepares a
//! [`WorkSpec`] — the stage subset, the remote files the worker must fetch,
//! and the return destination — serializes it into a single environment
//! variable, and hands it to a [`WorkerDispatcher`]. The dispatcher is an
//! injected capability so the same orchestration logic can target a cluster
//! pod or a local process.

use crate::errors::{GangwayError, Result};
use crate::jobspec::JobSpec;
use crate::meta::Artifact;
use crate::store::StoreCredentials;
use crate::terminate::Termination;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, info};

/// Environment variable carrying the serialized work specification.
pub const WORKSPEC_ENV_VAR: &str = "COSA_WORK_POD_JSON";

/// A handoff unit: an object a dispatched worker is expected to fetch from
/// the store before running its commands.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteFile {
    /// Bucket holding the object.
    pub bucket: String,
    /// Object key within the bucket.
    pub object: String,
    /// Whether the object is a compressed payload the worker must expand.
    #[serde(default)]
    pub compressed: bool,
    /// The resolved build artifact this file corresponds to, when any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<Artifact>,
}

/// Identity of the orchestrating pod, as reported by the platform.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PodIdentity {
    /// Pod name.
    pub name: String,
    /// Pod namespace.
    pub namespace: String,
    /// Pod IP address; workers reach the embedded store through it.
    pub ip: String,
}

/// Where workers publish their results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Return {
    /// Destination bucket.
    pub bucket: String,
    /// Object-store endpoint, e.g. `http://10.0.0.4:9000`.
    pub endpoint: String,
    /// Credentials for the endpoint.
    pub credentials: StoreCredentials,
}

/// The materialized payload for one dispatched unit of execution.
///
/// Constructed fresh per readiness-poll attempt; immutable input to the
/// dispatcher once the gate reports satisfied.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkSpec {
    /// Identity of the orchestrating pod.
    pub pod: PodIdentity,
    /// Ids of the stages this worker executes.
    pub execute_stages: Vec<String>,
    /// The job specification the worker runs against.
    pub job_spec: JobSpec,
    /// Objects the worker fetches before running.
    pub remote_files: Vec<RemoteFile>,
    /// Where results are published.
    pub return_to: Return,
}

impl WorkSpec {
    /// Serializes the work specification into its environment variable.
    pub fn to_env_vars(&self) -> Result<Vec<(String, String)>> {
        let raw = serde_json::to_vec(self)?;
        Ok(vec![(WORKSPEC_ENV_VAR.to_string(), BASE64.encode(raw))])
    }

    /// Reconstructs a work specification from the process environment.
    ///
    /// Workers call this on startup.
    pub fn from_env() -> Result<Self> {
        let encoded = std::env::var(WORKSPEC_ENV_VAR)
            .map_err(|_| GangwayError::Config(format!("{WORKSPEC_ENV_VAR} is not set")))?;
        let raw = BASE64
            .decode(encoded)
            .map_err(|err| GangwayError::Config(format!("bad {WORKSPEC_ENV_VAR}: {err}")))?;
        Ok(serde_json::from_slice(&raw)?)
    }
}

/// Capability for launching one pod-equivalent unit of execution.
///
/// `dispatch` runs the worker synchronously to completion and errors if the
/// worker fails or could not be constructed. Running a stage is expected to
/// write new artifacts back into the object store; the orchestration loop
/// observes that through its next readiness poll, not through a return
/// value here.
#[async_trait]
pub trait WorkerDispatcher: Send + Sync {
    /// Launches the worker for `ws` and waits for it to finish.
    ///
    /// `index` distinguishes workers spawned for the same jobspec.
    /// Implementations may observe `term` to stop an in-progress
    /// invocation early.
    async fn dispatch(&self, ws: &WorkSpec, index: usize, term: &Termination) -> Result<()>;
}

/// Runs stage commands as local child processes.
///
/// The local analogue of a cluster pod: commands run under `bash` in the
/// working tree with the serialized work specification in the environment.
#[derive(Debug, Clone)]
pub struct LocalDispatcher {
    working_dir: PathBuf,
}

impl LocalDispatcher {
    /// Creates a dispatcher rooted at `working_dir`.
    #[must_use]
    pub fn new(working_dir: impl Into<PathBuf>) -> Self {
        Self {
            working_dir: working_dir.into(),
        }
    }

    async fn run_command(
        &self,
        stage_id: &str,
        command: &str,
        env: &[(String, String)],
        term: &Termination,
    ) -> Result<()> {
        debug!(stage = stage_id, %command, "running stage command");
        let mut child = tokio::process::Command::new("/bin/bash")
            .arg("-c")
            .arg(command)
            .current_dir(&self.working_dir)
            .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .spawn()
            .map_err(|err| GangwayError::dispatch(stage_id, err.to_string()))?;

        tokio::select! {
            status = child.wait() => {
                let status = status
                    .map_err(|err| GangwayError::dispatch(stage_id, err.to_string()))?;
                if status.success() {
                    Ok(())
                } else {
                    Err(GangwayError::dispatch(
                        stage_id,
                        format!("command exited with {status}"),
                    ))
                }
            }
            () = term.terminated() => {
                let _ = child.kill().await;
                Err(GangwayError::dispatch(stage_id, "terminated"))
            }
        }
    }
}

#[async_trait]
impl WorkerDispatcher for LocalDispatcher {
    async fn dispatch(&self, ws: &WorkSpec, index: usize, term: &Termination) -> Result<()> {
        let env = ws.to_env_vars()?;
        for stage_id in &ws.execute_stages {
            let stage = ws
                .job_spec
                .stages
                .iter()
                .find(|s| &s.id == stage_id)
                .ok_or_else(|| {
                    GangwayError::dispatch(stage_id, "stage not present in jobspec")
                })?;

            info!(stage = %stage.id, worker = index, "executing stage locally");
            if stage.direct_exec {
                for command in &stage.commands {
                    self.run_command(&stage.id, command, &env, term).await?;
                }
            } else {
                // Render the commands into one script so a failure in any
                // line aborts the stage.
                let script = format!("set -xeuo pipefail\n{}\n", stage.commands.join("\n"));
                let path = self
                    .working_dir
                    .join(format!("gangway-stage-{}.sh", uuid::Uuid::new_v4()));
                tokio::fs::write(&path, script).await?;
                let result = self
                    .run_command(&stage.id, &format!("/bin/bash {}", path.display()), &env, term)
                    .await;
                let _ = tokio::fs::remove_file(&path).await;
                result?;
            }
        }
        Ok(())
    }
}
