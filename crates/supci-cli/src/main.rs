//! supci - Supervisor build-and-release orchestrator CLI
//!
//! ## Commands
//!
//! - `run`: resolve the trigger and execute the full release graph
//! - `resolve`: print the resolved run context
//! - `matrix`: print the architecture set
//! - `plan`: list jobs in execution order with their guard results

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};

use supci_core::{
    ArchitectureMatrix, Collaborators, GitChangeSource, ManualInputs, ReleaseConfig, ReleaseRun,
    RunReport, Trigger, VersionResolver,
};

#[derive(Parser)]
#[command(name = "supci")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Build, sign, smoke-test and publish the Supervisor container", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Configuration file (JSON)
    #[arg(long, global = true, env = "SUPCI_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve the trigger and run the release graph
    Run {
        #[command(flatten)]
        trigger: TriggerArgs,

        /// Readiness timeout for the integration instance, in seconds
        #[arg(long, env = "SUPCI_READY_TIMEOUT_SECS")]
        ready_timeout: Option<u64>,

        /// Write the run report as JSON to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Print the resolved run context as JSON
    Resolve {
        #[command(flatten)]
        trigger: TriggerArgs,
    },

    /// Print the architecture matrix as JSON
    Matrix,

    /// Print the job graph in execution order with guard results
    Plan {
        #[command(flatten)]
        trigger: TriggerArgs,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum EventKind {
    Manual,
    PullRequest,
    Release,
    Push,
}

/// Trigger metadata, normally supplied by the CI environment.
#[derive(Debug, Args)]
struct TriggerArgs {
    /// Event that started the run
    #[arg(long, value_enum, env = "SUPCI_EVENT")]
    event: EventKind,

    /// Channel for manual runs
    #[arg(long, default_value = "dev")]
    channel: String,

    /// Version for manual runs
    #[arg(long = "version")]
    release_version: Option<String>,

    /// Publish the build (manual runs)
    #[arg(long)]
    publish: bool,

    /// Also mark the build stable (manual runs)
    #[arg(long)]
    stable: bool,

    /// Release tag (release events)
    #[arg(long, env = "SUPCI_TAG")]
    tag: Option<String>,

    /// Pushed branch (push events)
    #[arg(long, env = "SUPCI_BRANCH")]
    branch: Option<String>,

    /// Pull request base branch
    #[arg(long, env = "SUPCI_BASE_REF", default_value = "main")]
    base_ref: String,
}

impl TriggerArgs {
    fn to_trigger(&self) -> Result<Trigger> {
        Ok(match self.event {
            EventKind::Manual => Trigger::Manual(ManualInputs {
                channel: self.channel.clone(),
                version: self.release_version.clone(),
                publish: self.publish,
                stable: self.stable,
            }),
            EventKind::PullRequest => Trigger::PullRequest {
                base_ref: self.base_ref.clone(),
            },
            EventKind::Release => Trigger::Release {
                tag: self
                    .tag
                    .clone()
                    .context("--tag is required for release events")?,
            },
            EventKind::Push => Trigger::Push {
                branch: self
                    .branch
                    .clone()
                    .context("--branch is required for push events")?,
            },
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    supci_core::telemetry::init_tracing(cli.json, level);

    let config = ReleaseConfig::load(cli.config.as_deref())
        .with_context(|| match &cli.config {
            Some(path) => format!("Failed to load config from {}", path.display()),
            None => "Failed to load default config".to_string(),
        })?;

    match cli.command {
        Commands::Run {
            trigger,
            ready_timeout,
            report,
        } => cmd_run(config, &trigger, ready_timeout, report.as_deref()).await,
        Commands::Resolve { trigger } => cmd_resolve(&config, &trigger).await,
        Commands::Matrix => cmd_matrix(&config),
        Commands::Plan { trigger } => cmd_plan(config, &trigger).await,
    }
}

async fn cmd_run(
    mut config: ReleaseConfig,
    args: &TriggerArgs,
    ready_timeout: Option<u64>,
    report_path: Option<&Path>,
) -> Result<()> {
    if let Some(secs) = ready_timeout {
        config.readiness.timeout_secs = secs;
    }
    let trigger = args.to_trigger()?;
    let changes = GitChangeSource::new(config.workspace.clone());
    let collab = Collaborators::from_config(&config).context("Failed to set up collaborators")?;
    let release = ReleaseRun::new(config, collab);

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling run");
            on_signal.cancel();
        }
    });

    let report = release
        .run(&trigger, &changes, chrono::Utc::now(), &cancel)
        .await
        .context("Release run could not start")?;

    if let Some(path) = report_path {
        std::fs::write(path, serde_json::to_vec_pretty(&report)?)
            .with_context(|| format!("Failed to write report to {}", path.display()))?;
        info!(path = %path.display(), "run report written");
    }

    print_report(&report);

    if report.success {
        println!("\n✓ Release run passed");
        Ok(())
    } else {
        for (job, text) in &report.diagnostics {
            println!("\n--- diagnostics: {job} ---");
            println!("{text}");
        }
        anyhow::bail!("Release run failed")
    }
}

fn print_report(report: &RunReport) {
    println!("Run ID: {}", report.run_id);
    println!(
        "Version: {} (channel {}, {})",
        report.context.version,
        report.context.channel,
        if report.context.publish {
            "publish"
        } else {
            "test"
        }
    );
    println!(
        "Status: {}",
        if report.success {
            "✓ PASSED"
        } else {
            "✗ FAILED"
        }
    );
    println!();

    for outcome in &report.outcomes {
        let mark = match outcome.status {
            supci_core::JobStatus::Succeeded => "✓",
            supci_core::JobStatus::Skipped => "-",
            _ => "✗",
        };
        match &outcome.error {
            Some(error) => println!(
                "  {} {} [{}] ({}ms): {}",
                mark, outcome.name, outcome.status, outcome.duration_ms, error
            ),
            None => println!(
                "  {} {} [{}] ({}ms)",
                mark, outcome.name, outcome.status, outcome.duration_ms
            ),
        }
    }
}

async fn cmd_resolve(config: &ReleaseConfig, args: &TriggerArgs) -> Result<()> {
    let trigger = args.to_trigger()?;
    let changes = GitChangeSource::new(config.workspace.clone());
    let ctx = VersionResolver::from_config(config)
        .resolve(&trigger, &changes, chrono::Utc::now())
        .await?;
    println!("{}", serde_json::to_string_pretty(&ctx)?);
    Ok(())
}

fn cmd_matrix(config: &ReleaseConfig) -> Result<()> {
    let matrix = ArchitectureMatrix::from_config(config)?;
    println!("{}", serde_json::to_string_pretty(&matrix)?);
    Ok(())
}

#[derive(Serialize)]
struct PlanOutput<'a> {
    version: &'a str,
    publish: bool,
    jobs: &'a [supci_core::PlannedJob],
}

async fn cmd_plan(config: ReleaseConfig, args: &TriggerArgs) -> Result<()> {
    let trigger = args.to_trigger()?;
    let changes = GitChangeSource::new(config.workspace.clone());
    let collab = Collaborators::from_config(&config)?;
    let release = ReleaseRun::new(config, collab);
    let (ctx, orchestrator) = release
        .prepare(&trigger, &changes, chrono::Utc::now())
        .await?;
    let jobs = orchestrator.plan(&ctx)?;

    let output = PlanOutput {
        version: &ctx.version,
        publish: ctx.publish,
        jobs: &jobs,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}
