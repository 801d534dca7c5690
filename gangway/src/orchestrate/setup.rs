//! One-time setup performed before the orchestration loop starts.
//!
//! Receives the platform's binary input, expands compressed source payloads
//! into the working tree, lets an embedded jobspec supersede the one derived
//! from CLI/environment, and discovers implied stages (`COSA_CMDS` and
//! `*.cosa.sh` convention scripts). Setup I/O errors are fatal: they abort
//! orchestration before any stage runs.

use super::config::Config;
use crate::errors::{GangwayError, Result};
use crate::jobspec::{JobSpec, Stage};
use crate::store::StoreHandle;
use crate::worker::RemoteFile;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Bucket remote files served from the source tree live in.
pub const SOURCE_BUCKET: &str = "source";

/// Filename suffix marking a compressed source payload.
const SOURCE_BIN_SUFFIX: &str = "source.bin";

/// Filename suffix for implied convention scripts.
const SCRIPT_SUFFIX: &str = ".cosa.sh";

/// Wraps a command in the strict shell invocation implied stages run with.
fn strict_shell(command: &str) -> String {
    format!("/bin/bash -xeu -o pipefail {command}")
}

/// Locates the inbound binary payload, if one was delivered.
#[must_use]
pub fn receive_binary_input(cfg: &Config) -> Option<PathBuf> {
    if let Some(payload) = &cfg.binary_payload {
        if payload.is_file() {
            return Some(payload.clone());
        }
        warn!(payload = %payload.display(), "configured binary payload is missing");
    }
    let conventional = cfg.work_dir.join(SOURCE_BIN_SUFFIX);
    conventional.is_file().then_some(conventional)
}

/// Expands a gzip-compressed tarball into `dest`.
pub fn decompress_tarball(src: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(src)?;
    let tar = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(tar);
    archive
        .unpack(dest)
        .map_err(|err| GangwayError::Setup(format!("failed to unpack {}: {err}", src.display())))
}

/// Processes the platform binary input.
///
/// A compressed source payload is decompressed into the working tree and
/// registered as a remote file. When the payload carries a jobspec (the
/// configured filename, or any YAML file when the platform marks the source
/// that way), it supersedes the jobspec derived from CLI/environment and
/// its repository reference overrides the platform-supplied one.
pub fn process_binary_input(cfg: &Config, jobspec: &mut JobSpec) -> Result<Vec<RemoteFile>> {
    let mut remote_files = Vec::new();

    if let Some(bin) = receive_binary_input(cfg) {
        if bin
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(SOURCE_BIN_SUFFIX))
        {
            decompress_tarball(&bin, &cfg.work_dir)?;
            let bucket = bin
                .parent()
                .and_then(Path::file_name)
                .and_then(|n| n.to_str())
                .unwrap_or(SOURCE_BUCKET)
                .to_string();
            let object = bin
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(SOURCE_BIN_SUFFIX)
                .to_string();
            info!(bucket = %bucket, %object, "binary input will be served to workers");
            remote_files.push(RemoteFile {
                bucket,
                object,
                compressed: true,
                artifact: None,
            });
        }

        // Look for a jobspec in the payload.
        let mut js_file = None;
        let candidate = cfg.work_dir.join(&cfg.jobspec_file);
        if candidate.is_file() {
            info!("found jobspec file in binary payload");
            js_file = Some(candidate);
        }
        let as_file_is_yaml = cfg
            .build_spec
            .as_ref()
            .and_then(|b| b.binary_as_file.as_deref())
            .is_some_and(|f| f.ends_with("yaml"));
        if as_file_is_yaml {
            js_file = Some(bin);
        }

        if let Some(path) = js_file {
            info!(jobspec = %path.display(), "treating source as a jobspec");
            *jobspec = JobSpec::from_file(&path)?;
        }
    }

    apply_platform_source(cfg, jobspec);
    Ok(remote_files)
}

/// Fills the recipe's git source in from the platform build specification.
///
/// A jobspec that pins its own git reference wins over the platform's.
fn apply_platform_source(cfg: &Config, jobspec: &mut JobSpec) {
    let platform_url = cfg.build_spec.as_ref().and_then(|b| b.git_url.as_ref());
    if jobspec.recipe.git_url.is_some() {
        if platform_url.is_some() {
            info!("jobspec references a git repo, ignoring platform source reference");
        }
        return;
    }
    let Some(url) = platform_url else {
        return;
    };
    info!(git_url = %url, "using platform source reference");
    jobspec.recipe.git_url = Some(url.clone());
    jobspec.recipe.git_ref = cfg.build_spec.as_ref().and_then(|b| b.git_ref.clone());
}

/// Copies a file, refusing to overwrite an existing destination.
fn copy_file(src: &Path, dest: &Path) -> Result<()> {
    let mut reader = std::fs::File::open(src)?;
    let mut writer = std::fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(dest)?;
    std::io::copy(&mut reader, &mut writer)?;
    Ok(())
}

/// Discovers implied stages from the environment and the working tree.
///
/// Unless the jobspec declares strict mode, two synthetic stages may be
/// appended ahead of explicit ones: one running the environment-supplied
/// command string, and one running every discovered `*.cosa.sh` script.
/// Scripts are copied into the source bucket so workers can fetch them.
pub fn discover_stages(cfg: &Config, jobspec: &mut JobSpec) -> Result<Vec<RemoteFile>> {
    if jobspec.job.strict_mode {
        info!("job strict mode is set, skipping automated stage discovery");
        return Ok(Vec::new());
    }
    info!("strict mode is off: COSA_CMDS and *.cosa.sh files are implied stages");

    let mut remote_files = Vec::new();

    if let Some(commands) = &cfg.commands {
        jobspec.stages.push(Stage {
            id: "envVar".to_string(),
            description: "environment defined commands".to_string(),
            commands: vec![strict_shell(commands)],
            direct_exec: true,
            ..Stage::default()
        });
    }

    let mut scripts = Vec::new();
    let mut names: Vec<String> = std::fs::read_dir(&cfg.work_dir)?
        .filter_map(std::result::Result::ok)
        .filter(|e| e.path().is_file())
        .filter_map(|e| e.file_name().to_str().map(String::from))
        .filter(|n| n.ends_with(SCRIPT_SUFFIX))
        .collect();
    names.sort();

    if !names.is_empty() {
        let bucket_dir = cfg.work_dir.join(SOURCE_BUCKET);
        std::fs::create_dir_all(&bucket_dir)?;
        for name in names {
            let dest = bucket_dir.join(&name);
            copy_file(&cfg.work_dir.join(&name), &dest)?;

            // The scripts could be embedded in the jobspec directly, but the
            // jobspec travels as an env var with a hard size limit and an
            // object store is already running; serve them from there.
            remote_files.push(RemoteFile {
                bucket: SOURCE_BUCKET.to_string(),
                object: name.clone(),
                compressed: false,
                artifact: None,
            });
            scripts.push(strict_shell(&dest.display().to_string()));
        }
    }

    if !scripts.is_empty() {
        jobspec.stages.push(Stage {
            id: "cosa.sh".to_string(),
            description: "*.cosa.sh scripts".to_string(),
            commands: scripts,
            direct_exec: true,
            ..Stage::default()
        });
    }

    Ok(remote_files)
}

/// Walks the working tree after all stages complete, for observability.
///
/// Returns the number of files seen.
pub async fn final_inventory(store: &StoreHandle, dir: &Path) -> usize {
    let path = dir.to_string_lossy();
    let Ok(stream) = store.list(&path).await else {
        warn!(dir = %path, "final inventory listing failed");
        return 0;
    };
    let descriptors: Vec<_> = stream.collect().await;
    for descriptor in &descriptors {
        info!(file = %descriptor.path, size = descriptor.size, "inventory");
    }
    descriptors.len()
}
