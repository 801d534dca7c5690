//! Job specification model.
//!
//! A [`JobSpec`] describes one build job: the recipe being built, job-level
//! policy, and the ordered list of [`Stage`]s the orchestration loop will
//! dispatch. Jobspecs are written and read as YAML; the CLI can also
//! synthesize one from flags via [`JobSpec::generate_stages`].

use crate::errors::{GangwayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::io::Write;
use std::path::Path;

/// Default jobspec filename looked for in the working tree.
pub const DEFAULT_JOB_SPEC_FILE: &str = "jobspec.yaml";

/// Artifact shorthand names accepted by the stage generator.
pub const ARTIFACT_SHORTHANDS: &[&str] =
    &["base", "qemu", "metal", "metal4k", "live", "oscontainer"];

/// One schedulable unit of build work.
///
/// Stages sharing an `execution_order` run concurrently; ordinals run in
/// ascending order. A stage may not start until every artifact named in
/// `require_artifacts` resolves in the build metadata record.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Stage {
    /// Unique identifier within the job's stage list.
    pub id: String,
    /// Human description of the stage.
    pub description: String,
    /// Shell commands executed by the worker, in order.
    pub commands: Vec<String>,
    /// Execution-order ordinal. Need not be contiguous, only comparable.
    pub execution_order: u32,
    /// Artifact names that must resolve before dispatch.
    pub require_artifacts: Vec<String>,
    /// Execute commands directly rather than through a generated script.
    pub direct_exec: bool,
}

impl Stage {
    /// Appends commands to the stage.
    pub fn add_commands(&mut self, commands: &[String]) {
        self.commands.extend_from_slice(commands);
    }

    /// Appends required artifact names to the stage.
    pub fn add_requires(&mut self, artifacts: &[String]) {
        self.require_artifacts.extend_from_slice(artifacts);
    }

    /// Returns an independent copy for use by a concurrent stage task.
    ///
    /// Each task mutates its own copy so closures cannot race on shared
    /// stage state.
    #[must_use]
    pub fn deep_copy(&self) -> Self {
        self.clone()
    }
}

/// Job-level policy knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Job {
    /// When set, implied-stage discovery is skipped entirely; only stages
    /// declared in the jobspec run.
    pub strict_mode: bool,
    /// Optional build name recorded in generated specs.
    pub build_name: Option<String>,
}

/// A package repository the build consumes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Repo {
    /// Repository name.
    pub name: String,
    /// Repository URL.
    pub url: Option<String>,
}

/// The source recipe the job builds from.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Recipe {
    /// Git URL of the recipe repository.
    pub git_url: Option<String>,
    /// Git ref to check out.
    pub git_ref: Option<String>,
    /// Package repositories. Generators always ensure this is non-nil.
    pub repos: Option<Vec<Repo>>,
}

/// A complete job specification.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobSpec {
    /// Job-level policy.
    pub job: Job,
    /// Source recipe.
    pub recipe: Recipe,
    /// Stages in declaration order.
    pub stages: Vec<Stage>,
}

impl JobSpec {
    /// Reads a jobspec from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let spec: Self = serde_yaml::from_str(&raw)?;
        spec.validate()?;
        Ok(spec)
    }

    /// Serializes the jobspec as YAML into the given writer.
    pub fn write_yaml(&self, mut out: impl Write) -> Result<()> {
        let rendered = serde_yaml::to_string(self)?;
        out.write_all(rendered.as_bytes())?;
        Ok(())
    }

    /// Validates the jobspec.
    ///
    /// # Errors
    ///
    /// Returns an error when two stages share an identifier.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for stage in &self.stages {
            if !seen.insert(stage.id.as_str()) {
                return Err(GangwayError::InvalidJobSpec(format!(
                    "duplicate stage id '{}'",
                    stage.id
                )));
            }
        }
        Ok(())
    }

    /// Ensures the recipe's repository list is present.
    pub fn ensure_repos(&mut self) {
        if self.recipe.repos.is_none() {
            self.recipe.repos = Some(Vec::new());
        }
    }

    /// Expands artifact shorthand names into build stages.
    ///
    /// With `single_stage` set, every generated command lands in one stage
    /// so the whole job runs on a single worker.
    pub fn generate_stages(&mut self, artifacts: &[String], single_stage: bool) -> Result<()> {
        let mut generated: Vec<Stage> = Vec::new();
        for name in artifacts {
            let stage = shorthand_stage(name)?;
            generated.push(stage);
        }

        if single_stage && !generated.is_empty() {
            let mut all = Stage {
                id: "single".to_string(),
                description: "combined single-stage build".to_string(),
                execution_order: 1,
                direct_exec: true,
                ..Stage::default()
            };
            for stage in generated {
                all.commands.extend(stage.commands);
            }
            self.stages.push(all);
        } else {
            self.stages.extend(generated);
        }
        self.validate()
    }
}

/// Maps one artifact shorthand to its build stage.
fn shorthand_stage(name: &str) -> Result<Stage> {
    let (commands, order, requires): (&[&str], u32, &[&str]) = match name {
        "base" => (&["cosa fetch", "cosa build"], 1, &[]),
        "qemu" => (&["cosa buildextend-qemu"], 2, &["ostree"]),
        "metal" => (&["cosa buildextend-metal"], 2, &["ostree"]),
        "metal4k" => (&["cosa buildextend-metal4k"], 2, &["ostree"]),
        "oscontainer" => (&["cosa buildextend-oscontainer"], 2, &["ostree"]),
        "live" => (&["cosa buildextend-live"], 3, &["metal", "metal4k"]),
        other => {
            return Err(GangwayError::InvalidJobSpec(format!(
                "unknown artifact shorthand '{other}', expected one of {ARTIFACT_SHORTHANDS:?}"
            )))
        }
    };

    Ok(Stage {
        id: name.to_string(),
        description: format!("build the {name} artifact"),
        commands: commands.iter().map(|c| (*c).to_string()).collect(),
        execution_order: order,
        require_artifacts: requires.iter().map(|r| (*r).to_string()).collect(),
        direct_exec: true,
    })
}
