//! Gangway CLI - multi-stage build orchestration entry point.
//!
//! ## Commands
//!
//! - `gangway run` - Execute the orchestration loop in pod mode
//! - `gangway generate` - Synthesize a jobspec from flags
//! - `gangway generate-single-pod` - Synthesize a single-stage jobspec

#![forbid(unsafe_code)]
#![warn(clippy::pedantic)]
// CLI uses print! macros intentionally
#![allow(clippy::print_stdout)]

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use gangway::jobspec::{JobSpec, Stage, DEFAULT_JOB_SPEC_FILE};
use gangway::orchestrate::{Config, Orchestrator};
use gangway::worker::LocalDispatcher;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Gangway - multi-stage container build orchestrator.
#[derive(Debug, Parser)]
#[command(name = "gangway")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Execute the orchestration loop against the working tree.
    Run,
    /// Synthesize a jobspec from flags.
    Generate(GenerateArgs),
    /// Synthesize a jobspec that runs everything in a single stage.
    GenerateSinglePod(GenerateArgs),
}

/// Flags shared by the jobspec generation commands.
#[derive(Debug, Args)]
struct GenerateArgs {
    /// Artifact shorthand to build; repeatable.
    #[arg(short = 'A', long = "build-artifact")]
    build_artifact: Vec<String>,

    /// Ad hoc command to run; repeatable, forces single-stage mode.
    #[arg(long)]
    cmd: Vec<String>,

    /// Artifact required before the ad hoc commands run; repeatable,
    /// forces single-stage mode.
    #[arg(long)]
    req: Vec<String>,

    /// Existing jobspec file to extend.
    #[arg(long, default_value = DEFAULT_JOB_SPEC_FILE)]
    jobspec: PathBuf,

    /// Write the generated YAML here instead of standard output.
    #[arg(long)]
    yaml_out: Option<PathBuf>,
}

fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run => run(),
        Commands::Generate(args) => generate(&args, false),
        Commands::GenerateSinglePod(args) => generate(&args, true),
    }
}

fn run() -> Result<()> {
    let cfg = Config::from_env().context("reading orchestrator configuration")?;
    if cfg.build_spec.is_none() {
        anyhow::bail!("BUILD is not set; run expects the platform build specification");
    }

    let jobspec_path = cfg.work_dir.join(&cfg.jobspec_file);
    let jobspec = if jobspec_path.is_file() {
        JobSpec::from_file(&jobspec_path)
            .with_context(|| format!("loading jobspec {}", jobspec_path.display()))?
    } else {
        JobSpec::default()
    };

    let dispatcher = Arc::new(LocalDispatcher::new(&cfg.work_dir));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async {
        Orchestrator::new(cfg, jobspec)
            .run(dispatcher, None)
            .await
            .context("orchestration failed")
    })
}

fn generate(args: &GenerateArgs, single_pod: bool) -> Result<()> {
    let mut spec = if args.jobspec.is_file() {
        JobSpec::from_file(&args.jobspec)
            .with_context(|| format!("loading jobspec {}", args.jobspec.display()))?
    } else {
        JobSpec::default()
    };
    spec.ensure_repos();

    // Ad hoc commands and requirements only make sense on one worker.
    let single_stage = single_pod || !args.cmd.is_empty() || !args.req.is_empty();
    spec.generate_stages(&args.build_artifact, single_stage)?;

    if !args.cmd.is_empty() || !args.req.is_empty() {
        let mut stage = Stage {
            id: "execute".to_string(),
            description: "ad hoc commands".to_string(),
            execution_order: 1,
            direct_exec: true,
            ..Stage::default()
        };
        stage.add_commands(&args.cmd);
        stage.add_requires(&args.req);
        spec.stages.push(stage);
        spec.validate()?;
    }

    let rendered = render(&spec)?;
    match &args.yaml_out {
        Some(path) => std::fs::write(path, rendered)
            .with_context(|| format!("writing {}", path.display()))?,
        None => print!("{rendered}"),
    }
    Ok(())
}

fn render(spec: &JobSpec) -> Result<String> {
    let mut buf = Vec::new();
    spec.write_yaml(&mut buf)?;
    Ok(format!(
        "# Generated by gangway on {}\n{}",
        chrono::Utc::now().to_rfc3339(),
        String::from_utf8(buf)?
    ))
}
