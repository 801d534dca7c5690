//! Build metadata records.
//!
//! Worker stages publish their results as JSON metadata in the `builds`
//! bucket: a running index at `builds/builds.json` and one
//! `<buildID>/<arch>/meta*.json` record per build. The readiness gate
//! re-reads these on every poll; artifacts accrue append-only as stages
//! complete.

use crate::errors::{GangwayError, Result};
use crate::store::StoreHandle;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Filename of the running builds index inside the `builds` bucket.
pub const BUILDS_JSON: &str = "builds.json";

/// One produced build artifact.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Artifact {
    /// Path of the artifact relative to the build tree.
    pub path: String,
    /// Content digest, when recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    /// Size in bytes, when recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// The most recent state of an in-progress build.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildMeta {
    /// Build identifier. Workers may initialize or rotate this
    /// independently of the orchestrator.
    #[serde(rename = "buildid")]
    pub build_id: String,
    /// Architecture the build targets.
    pub architecture: String,
    /// Named artifacts with their relative paths.
    #[serde(default)]
    pub artifacts: BTreeMap<String, Artifact>,
}

impl BuildMeta {
    /// Resolves a named artifact.
    ///
    /// # Errors
    ///
    /// Returns [`GangwayError::ArtifactMissing`] when the artifact is not
    /// listed yet; the readiness gate treats that as "not ready".
    pub fn get_artifact(&self, name: &str) -> Result<&Artifact> {
        self.artifacts
            .get(name)
            .ok_or_else(|| GangwayError::ArtifactMissing(name.to_string()))
    }
}

/// One entry in the builds index.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildRecord {
    /// Build identifier.
    pub id: String,
    /// Architectures the build covers.
    #[serde(default)]
    pub arches: Vec<String>,
}

/// The running builds index, newest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildsIndex {
    /// Index schema version.
    #[serde(rename = "schema-version", default)]
    pub schema_version: String,
    /// Known builds, newest first.
    #[serde(default)]
    pub builds: Vec<BuildRecord>,
    /// Index generation timestamp.
    #[serde(default)]
    pub timestamp: String,
}

impl BuildsIndex {
    /// Returns the newest build id covering `arch`.
    #[must_use]
    pub fn latest_for(&self, arch: &str) -> Option<&str> {
        self.builds
            .iter()
            .find(|b| b.arches.iter().any(|a| a == arch))
            .map(|b| b.id.as_str())
    }
}

/// Reports the architecture of the running builder.
#[must_use]
pub fn builder_arch() -> &'static str {
    match std::env::consts::ARCH {
        "powerpc64" => "ppc64le",
        other => other,
    }
}

/// Joins path segments, skipping empty ones.
///
/// Lets the same metadata paths resolve through the file backend (rooted at
/// the working tree) and the remote backend (rooted at the bucket).
fn join_path(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("/")
}

/// Reads the builds index under `root` through the store façade.
///
/// Returns `Ok(None)` when the index does not exist yet.
pub async fn read_builds_index(store: &StoreHandle, root: &str) -> Result<Option<BuildsIndex>> {
    let path = join_path(&[root, "builds", BUILDS_JSON]);
    match store.open(&path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}

/// Reads the build metadata record for `build_id` (or the newest build for
/// `arch` when `build_id` is empty).
///
/// A missing index or metadata file yields `Ok(None)`: the build simply has
/// not been initialized yet.
pub async fn read_build(
    store: &StoreHandle,
    root: &str,
    build_id: &str,
    arch: &str,
) -> Result<Option<BuildMeta>> {
    let id = if build_id.is_empty() {
        let Some(index) = read_builds_index(store, root).await? else {
            return Ok(None);
        };
        match index.latest_for(arch) {
            Some(id) => id.to_string(),
            None => return Ok(None),
        }
    } else {
        build_id.to_string()
    };

    let path = join_path(&[root, "builds", &id, arch, "meta.json"]);
    match store.open(&path).await {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(err) if err.is_not_found() => Ok(None),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn write_meta(dir: &Path, build_id: &str, arch: &str, artifacts: &[(&str, &str)]) {
        let meta_dir = dir.join("builds").join(build_id).join(arch);
        std::fs::create_dir_all(&meta_dir).unwrap();
        let meta = BuildMeta {
            build_id: build_id.to_string(),
            architecture: arch.to_string(),
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

    fn write_index(dir: &Path, ids: &[&str], arch: &str) {
        let builds_dir = dir.join("builds");
        std::fs::create_dir_all(&builds_dir).unwrap();
        let index = BuildsIndex {
            schema_version: "1.0.0".to_string(),
            builds: ids
                .iter()
                .map(|id| BuildRecord {
                    id: (*id).to_string(),
                    arches: vec![arch.to_string()],
                })
                .collect(),
            timestamp: String::new(),
        };
        std::fs::write(
            builds_dir.join(BUILDS_JSON),
            serde_json::to_vec(&index).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn test_artifact_resolution() {
        let mut meta = BuildMeta::default();
        assert!(meta.get_artifact("qemu").is_err());

        meta.artifacts.insert(
            "qemu".to_string(),
            Artifact {
                path: "images/disk.qcow2".to_string(),
                ..Artifact::default()
            },
        );
        assert_eq!(meta.get_artifact("qemu").unwrap().path, "images/disk.qcow2");
    }

    #[test]
    fn test_latest_for_arch() {
        let index = BuildsIndex {
            builds: vec![
                BuildRecord {
                    id: "b2".to_string(),
                    arches: vec!["aarch64".to_string()],
                },
                BuildRecord {
                    id: "b1".to_string(),
                    arches: vec!["x86_64".to_string()],
                },
            ],
            ..BuildsIndex::default()
        };
        assert_eq!(index.latest_for("x86_64"), Some("b1"));
        assert_eq!(index.latest_for("aarch64"), Some("b2"));
        assert_eq!(index.latest_for("s390x"), None);
    }

    #[tokio::test]
    async fn test_read_build_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = StoreHandle::file_backed();
        let root = dir.path().to_string_lossy().into_owned();

        let meta = read_build(&store, &root, "", "x86_64").await.unwrap();
        assert!(meta.is_none());
    }

    #[tokio::test]
    async fn test_read_build_by_explicit_id() {
        let dir = tempfile::tempdir().unwrap();
        write_meta(dir.path(), "b1", "x86_64", &[("ostree", "ostree.tar")]);

        let store = StoreHandle::file_backed();
        let root = dir.path().to_string_lossy().into_owned();
        let meta = read_build(&store, &root, "b1", "x86_64")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.build_id, "b1");
        assert_eq!(meta.get_artifact("ostree").unwrap().path, "ostree.tar");
    }

    #[tokio::test]
    async fn test_read_build_resolves_latest_from_index() {
        let dir = tempfile::tempdir().unwrap();
        write_index(dir.path(), &["b7", "b6"], "x86_64");
        write_meta(dir.path(), "b7", "x86_64", &[]);

        let store = StoreHandle::file_backed();
        let root = dir.path().to_string_lossy().into_owned();
        let meta = read_build(&store, &root, "", "x86_64")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.build_id, "b7");
    }
}
