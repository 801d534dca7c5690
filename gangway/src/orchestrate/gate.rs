//! Dependency readiness gate.
//!
//! The gate decides whether a stage's declared prerequisites are satisfied
//! by re-reading the build metadata record and walking the metadata
//! directory on every poll. It is pure polling: callers invoke it on a
//! fixed interval until it reports ready or termination is signaled, which
//! bounds staleness to one interval without requiring any channel between
//! independently scheduled workers.

use crate::meta::{read_build, BuildMeta};
use crate::store::StoreHandle;
use crate::worker::RemoteFile;
use futures::StreamExt;
use parking_lot::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Fixed polling interval between gate attempts.
pub const POLL_INTERVAL: Duration = Duration::from_secs(15);

/// Outcome of one gate attempt.
///
/// The remote-file set is built fresh per attempt and returned atomically:
/// a produced reference is never retracted within an attempt, and partial
/// sets from unready attempts are discarded by the caller.
#[derive(Debug, Clone)]
pub struct Readiness {
    /// Whether every required artifact resolved.
    pub ready: bool,
    /// Metadata files plus resolved artifact references for this attempt.
    pub remote_files: Vec<RemoteFile>,
}

/// Polls build metadata to satisfy stage prerequisites.
///
/// Shared across all concurrent stage tasks of a run so that a build-id
/// rotation observed by one task re-keys lookups for all of them.
pub struct ReadinessGate {
    store: StoreHandle,
    root: String,
    arch: String,
    build_id: Mutex<String>,
    poll_interval: Duration,
}

impl ReadinessGate {
    /// Creates a gate reading metadata under `root` for `arch`.
    #[must_use]
    pub fn new(store: StoreHandle, root: impl Into<String>, arch: impl Into<String>) -> Self {
        Self {
            store,
            root: root.into(),
            arch: arch.into(),
            build_id: Mutex::new(String::new()),
            poll_interval: POLL_INTERVAL,
        }
    }

    /// Overrides the polling interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The interval callers should sleep between attempts.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// The most recently observed build identifier.
    #[must_use]
    pub fn build_id(&self) -> String {
        self.build_id.lock().clone()
    }

    /// Runs one readiness attempt for a stage.
    ///
    /// Read failures are absorbed: a metadata record that cannot be read
    /// yet means "not ready", never a fatal error.
    pub async fn check(&self, stage_id: &str, require: &[String]) -> Readiness {
        let mut remote_files = Vec::new();

        let observed = self.build_id.lock().clone();
        let meta = self.read_meta(&observed).await;

        // Workers may initialize or rotate the build id independently of
        // the orchestrator; adopt the newest id for all later lookups.
        if let Some(meta) = &meta {
            if meta.build_id != observed {
                info!(build_id = %meta.build_id, "found new build id");
                *self.build_id.lock() = meta.build_id.clone();
            }
        }

        let build_id = self.build_id.lock().clone();
        let build_path = join_key(&[&build_id, &self.arch]);

        self.collect_metadata_files(stage_id, &build_path, &mut remote_files)
            .await;

        let mut found = 0_usize;
        for artifact in require {
            info!(stage = stage_id, %artifact, "checking for required artifact");
            let Some(meta) = &meta else {
                info!(stage = stage_id, %artifact, "build metadata is not available yet");
                return Readiness {
                    ready: false,
                    remote_files,
                };
            };
            match meta.get_artifact(artifact) {
                Err(_) => {
                    info!(stage = stage_id, %artifact, "artifact is not available yet");
                    return Readiness {
                        ready: false,
                        remote_files,
                    };
                }
                Ok(resolved) => {
                    let key = join_key(&[&build_path, basename(&resolved.path)]);
                    info!(stage = stage_id, path = %key, "found required artifact");
                    remote_files.push(RemoteFile {
                        bucket: "builds".to_string(),
                        object: key,
                        compressed: false,
                        artifact: Some(resolved.clone()),
                    });
                    found += 1;
                }
            }
        }

        let ready = found == require.len();
        if ready {
            info!(stage = stage_id, "all stage dependencies have been met");
        }
        Readiness {
            ready,
            remote_files,
        }
    }

    async fn read_meta(&self, build_id: &str) -> Option<BuildMeta> {
        match read_build(&self.store, &self.root, build_id, &self.arch).await {
            Ok(meta) => meta,
            Err(err) => {
                warn!(%err, "failed to read build metadata");
                None
            }
        }
    }

    /// Includes every `meta*.json` under the build path so workers can
    /// fetch the latest metadata regardless of which stage produced it.
    async fn collect_metadata_files(
        &self,
        stage_id: &str,
        build_path: &str,
        remote_files: &mut Vec<RemoteFile>,
    ) {
        let list_path = {
            let mut parts = vec![self.root.as_str()];
            parts.push("builds");
            parts.push(build_path);
            parts.retain(|p| !p.is_empty());
            parts.join("/")
        };
        let stream = match self.store.list(&list_path).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(%err, "metadata listing failed");
                return;
            }
        };
        let descriptors: Vec<_> = stream.collect().await;
        for descriptor in descriptors {
            let name = descriptor.name().to_string();
            if !(name.starts_with("meta") && name.ends_with(".json")) {
                debug!(stage = stage_id, file = %name, "excluded");
                continue;
            }
            let key = join_key(&[build_path, &name]);
            debug!(stage = stage_id, file = %key, "included metadata");
            remote_files.push(RemoteFile {
                bucket: "builds".to_string(),
                object: key,
                compressed: false,
                artifact: None,
            });
        }
    }
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn join_key(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::{Artifact, BuildMeta, BuildRecord, BuildsIndex, BUILDS_JSON};
    use pretty_assertions::assert_eq;
    use std::path::Path;

    const ARCH: &str = "x86_64";

    fn seed_build(dir: &Path, build_id: &str, artifacts: &[(&str, &str)]) {
        let builds_dir = dir.join("builds");
        let meta_dir = builds_dir.join(build_id).join(ARCH);
        std::fs::create_dir_all(&meta_dir).unwrap();

        let index = BuildsIndex {
            schema_version: "1.0.0".to_string(),
            builds: vec![BuildRecord {
                id: build_id.to_string(),
                arches: vec![ARCH.to_string()],
            }],
            timestamp: String::new(),
        };
        std::fs::write(
            builds_dir.join(BUILDS_JSON),
            serde_json::to_vec(&index).unwrap(),
        )
        .unwrap();

        let meta = BuildMeta {
            build_id: build_id.to_string(),
            architecture: ARCH.to_string(),
            artifacts: artifacts
                .iter()
                .map(|(name, path)| {
                    (
                        (*name).to_string(),
                        Artifact {
                            path: (*path).to_string(),
                            ..Artifact::default()
                        },
                    )
                })
                .collect(),
        };
        std::fs::write(
            meta_dir.join("meta.json"),
            serde_json::to_vec(&meta).unwrap(),
        )
        .unwrap();
    }

    fn gate_for(dir: &Path) -> ReadinessGate {
        ReadinessGate::new(
            StoreHandle::file_backed(),
            dir.to_string_lossy().into_owned(),
            ARCH,
        )
    }

    #[tokio::test]
    async fn test_no_requirements_ready_on_first_poll() {
        let dir = tempfile::tempdir().unwrap();
        let gate = gate_for(dir.path());

        let readiness = gate.check("build", &[]).await;
        assert!(readiness.ready);
    }

    #[tokio::test]
    async fn test_not_ready_until_artifact_resolves() {
        let dir = tempfile::tempdir().unwrap();
        let gate = gate_for(dir.path());
        let require = vec!["ostree-qemu".to_string()];

        let first = gate.check("qemu", &require).await;
        assert!(!first.ready);

        seed_build(
            dir.path(),
            "b1",
            &[("ostree-qemu", "images/disk.qcow2")],
        );

        let second = gate.check("qemu", &require).await;
        assert!(second.ready);
        let resolved = second
            .remote_files
            .iter()
            .find(|f| f.artifact.is_some())
            .unwrap();
        assert_eq!(resolved.bucket, "builds");
        assert_eq!(resolved.object, "b1/x86_64/disk.qcow2");

        // Readiness is monotonic for an unchanged artifact set.
        let third = gate.check("qemu", &require).await;
        assert!(third.ready);
    }

    #[tokio::test]
    async fn test_idempotent_reference_sets() {
        let dir = tempfile::tempdir().unwrap();
        seed_build(dir.path(), "b1", &[("ostree", "ostree.tar")]);
        let gate = gate_for(dir.path());
        let require = vec!["ostree".to_string()];

        let first = gate.check("metal", &require).await;
        let second = gate.check("metal", &require).await;
        assert!(first.ready && second.ready);
        assert_eq!(first.remote_files, second.remote_files);
    }

    #[tokio::test]
    async fn test_metadata_files_collected_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        seed_build(dir.path(), "b1", &[]);
        let meta_dir = dir.path().join("builds").join("b1").join(ARCH);
        std::fs::write(meta_dir.join("meta.qemu.json"), b"{}").unwrap();
        std::fs::write(meta_dir.join("commitmeta.json"), b"{}").unwrap();

        let gate = gate_for(dir.path());
        // Adopt the build id first so the metadata walk is keyed.
        gate.check("seed", &[]).await;
        let readiness = gate.check("build", &[]).await;

        let objects: Vec<_> = readiness
            .remote_files
            .iter()
            .map(|f| f.object.as_str())
            .collect();
        assert!(objects.contains(&"b1/x86_64/meta.json"));
        assert!(objects.contains(&"b1/x86_64/meta.qemu.json"));
        assert!(!objects.iter().any(|o| o.ends_with("commitmeta.json")));
    }

    #[tokio::test]
    async fn test_build_id_rotation_is_adopted() {
        let dir = tempfile::tempdir().unwrap();
        seed_build(dir.path(), "b1", &[]);
        let gate = gate_for(dir.path());

        gate.check("build", &[]).await;
        assert_eq!(gate.build_id(), "b1");

        seed_build(dir.path(), "b2", &[]);
        gate.check("build", &[]).await;
        // The index now reports b2 as latest only for fresh lookups; the
        // gate keeps reading the adopted id until its record rotates.
        assert_eq!(gate.build_id(), "b1");

        // Rotate the adopted build's own record.
        let meta_dir = dir.path().join("builds").join("b1").join(ARCH);
        let rotated = BuildMeta {
            build_id: "b2".to_string(),
            architecture: ARCH.to_string(),
            ..BuildMeta::default()
        };
        std::fs::write(
            meta_dir.join("meta.json"),
            serde_json::to_vec(&rotated).unwrap(),
        )
        .unwrap();

        gate.check("build", &[]).await;
        assert_eq!(gate.build_id(), "b2");
    }
}
