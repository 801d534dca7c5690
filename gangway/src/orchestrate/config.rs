//! Environment-derived orchestrator configuration.
//!
//! Every environment variable the engine reads is enumerated here and
//! mapped to a named field; nothing is populated reflectively. `BUILD`
//! carries the platform build specification as JSON and is required in pod
//! mode.

use crate::errors::{GangwayError, Result};
use crate::jobspec::DEFAULT_JOB_SPEC_FILE;
use crate::worker::PodIdentity;
use serde::Deserialize;
use std::path::PathBuf;

/// Default working tree for orchestration runs.
pub const DEFAULT_WORK_DIR: &str = "/srv";

/// Jobspec filename override.
pub const ENV_JOBSPEC_FILE: &str = "COSA_JOBSPEC_FILE";
/// Ad hoc command string run as an implied stage.
pub const ENV_CMDS: &str = "COSA_CMDS";
/// Orchestrating pod name.
pub const ENV_POD_NAME: &str = "COSA_POD_NAME";
/// Orchestrating pod IP; workers reach the embedded store through it.
pub const ENV_POD_IP: &str = "COSA_POD_IP";
/// Orchestrating pod namespace.
pub const ENV_POD_NAMESPACE: &str = "COSA_POD_NAMESPACE";
/// Platform build specification (JSON).
pub const ENV_BUILD_SPEC: &str = "BUILD";
/// Location of the inbound binary payload.
pub const ENV_BINARY_PAYLOAD: &str = "COSA_BINARY_PAYLOAD";

/// The subset of the platform build specification the engine consumes.
#[derive(Debug, Clone, Default)]
pub struct BuildSpec {
    /// Build strategy type; empty or `Custom` are accepted.
    pub strategy: Option<String>,
    /// Context directory override.
    pub context_dir: Option<String>,
    /// Filename the platform assigned to the binary payload.
    pub binary_as_file: Option<String>,
    /// Source repository URL reported by the platform.
    pub git_url: Option<String>,
    /// Source ref reported by the platform.
    pub git_ref: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawBuild {
    #[serde(default)]
    spec: RawSpec,
}

#[derive(Debug, Default, Deserialize)]
struct RawSpec {
    #[serde(default)]
    strategy: RawStrategy,
    #[serde(default)]
    source: RawSource,
}

#[derive(Debug, Default, Deserialize)]
struct RawStrategy {
    #[serde(rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSource {
    #[serde(rename = "contextDir")]
    context_dir: Option<String>,
    #[serde(default)]
    binary: RawBinary,
    #[serde(default)]
    git: RawGit,
}

#[derive(Debug, Default, Deserialize)]
struct RawBinary {
    #[serde(rename = "asFile")]
    as_file: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawGit {
    uri: Option<String>,
    #[serde(rename = "ref")]
    git_ref: Option<String>,
}

impl BuildSpec {
    /// Parses the `BUILD` environment value.
    ///
    /// # Errors
    ///
    /// Fails on malformed JSON or a strategy the engine cannot serve.
    pub fn parse(raw: &str) -> Result<Self> {
        let parsed: RawBuild = serde_json::from_str(raw)
            .map_err(|err| GangwayError::Config(format!("invalid build specification: {err}")))?;

        let strategy = parsed.spec.strategy.kind;
        if let Some(kind) = &strategy {
            if !kind.is_empty() && kind != "Custom" {
                return Err(GangwayError::UnsupportedStrategy(kind.clone()));
            }
        }

        Ok(Self {
            strategy,
            context_dir: parsed.spec.source.context_dir,
            binary_as_file: parsed.spec.source.binary.as_file,
            git_url: parsed.spec.source.git.uri,
            git_ref: parsed.spec.source.git.git_ref,
        })
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Jobspec filename looked for in the working tree.
    pub jobspec_file: String,
    /// Ad hoc commands executed as an implied stage, when set.
    pub commands: Option<String>,
    /// Identity of the orchestrating pod.
    pub pod: PodIdentity,
    /// Working tree the embedded store serves.
    pub work_dir: PathBuf,
    /// Inbound binary payload location, when one was delivered.
    pub binary_payload: Option<PathBuf>,
    /// Platform build specification, when running in pod mode.
    pub build_spec: Option<BuildSpec>,
}

impl Config {
    /// Loads configuration from the environment.
    ///
    /// The context directory from the build specification overrides the
    /// default working tree unless it is empty or root.
    pub fn from_env() -> Result<Self> {
        let env = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        let build_spec = match env(ENV_BUILD_SPEC) {
            Some(raw) => Some(BuildSpec::parse(&raw)?),
            None => None,
        };

        let mut work_dir = PathBuf::from(DEFAULT_WORK_DIR);
        if let Some(ctx_dir) = build_spec.as_ref().and_then(|b| b.context_dir.as_deref()) {
            if !ctx_dir.is_empty() && ctx_dir != "/" {
                work_dir = PathBuf::from(ctx_dir);
            }
        }

        Ok(Self {
            jobspec_file: env(ENV_JOBSPEC_FILE)
                .unwrap_or_else(|| DEFAULT_JOB_SPEC_FILE.to_string()),
            commands: env(ENV_CMDS),
            pod: PodIdentity {
                name: env(ENV_POD_NAME).unwrap_or_default(),
                namespace: env(ENV_POD_NAMESPACE).unwrap_or_default(),
                ip: env(ENV_POD_IP).unwrap_or_default(),
            },
            work_dir,
            binary_payload: env(ENV_BINARY_PAYLOAD).map(PathBuf::from),
            build_spec,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_spec_custom_strategy_accepted() {
        let spec = BuildSpec::parse(
            r#"{"spec":{"strategy":{"type":"Custom"},"source":{"contextDir":"/srv"}}}"#,
        )
        .unwrap();
        assert_eq!(spec.strategy.as_deref(), Some("Custom"));
        assert_eq!(spec.context_dir.as_deref(), Some("/srv"));
    }

    #[test]
    fn test_build_spec_rejects_other_strategies() {
        let err = BuildSpec::parse(r#"{"spec":{"strategy":{"type":"Docker"}}}"#).unwrap_err();
        assert!(matches!(err, GangwayError::UnsupportedStrategy(_)));
    }

    #[test]
    fn test_build_spec_empty_is_fine() {
        let spec = BuildSpec::parse(r"{}").unwrap();
        assert!(spec.strategy.is_none());
        assert!(spec.git_url.is_none());
    }

    #[test]
    fn test_build_spec_source_fields() {
        let spec = BuildSpec::parse(
            r#"{"spec":{"source":{"binary":{"asFile":"job.yaml"},"git":{"uri":"https://example.com/r.git","ref":"main"}}}}"#,
        )
        .unwrap();
        assert_eq!(spec.binary_as_file.as_deref(), Some("job.yaml"));
        assert_eq!(spec.git_url.as_deref(), Some("https://example.com/r.git"));
        assert_eq!(spec.git_ref.as_deref(), Some("main"));
    }

    #[test]
    fn test_build_spec_invalid_json() {
        assert!(BuildSpec::parse("not json").is_err());
    }
}
