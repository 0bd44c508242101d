//! Shipline - deployment pipeline orchestrator CLI
//!
//! ## Commands
//!
//! - `run`: evaluate gates and execute a pipeline for one trigger
//! - `plan`: print the readiness batches of a pipeline
//! - `gate`: evaluate the gates for a trigger without running stages
//! - `validate`: check a pipeline definition
//! - `history`: list or show archived runs
//!
//! Exit status: 0 when the run succeeded (or gates allow), 1 when a stage
//! failed, 2 when a gate denied the run.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use shipline_core::{
    CompositeNotifier, EventKind, GateReport, LogNotifier, PipelineDefinition, PipelineEngine,
    PipelineRun, ProcessInvoker, RunStatus, TriggerContext,
};
use shipline_forge::{GitHubClient, GitHubConfig, WebhookNotifier, DEFAULT_API_URL};
use shipline_state::{RunEntry, RunHistory, RunId, SurrealRunHistory};
use tracing::{info, Level};

#[derive(Parser, Debug)]
#[command(name = "shipline")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Deployment pipeline orchestrator", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON log lines and JSON command output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run a pipeline for one trigger
    Run {
        #[command(flatten)]
        pipeline: PipelineArgs,

        #[command(flatten)]
        trigger: TriggerArgs,

        #[command(flatten)]
        forge: ForgeArgs,

        /// Archive the finished run in the history database
        #[arg(long)]
        record: bool,

        #[command(flatten)]
        db: DbArgs,
    },

    /// Print the readiness batches of a pipeline
    Plan {
        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Evaluate gates for a trigger without running stages
    Gate {
        #[command(flatten)]
        pipeline: PipelineArgs,

        #[command(flatten)]
        trigger: TriggerArgs,

        #[command(flatten)]
        forge: ForgeArgs,
    },

    /// Check a pipeline definition and print its digest
    Validate {
        #[command(flatten)]
        pipeline: PipelineArgs,
    },

    /// Inspect archived runs
    History {
        #[command(subcommand)]
        action: HistoryAction,

        #[command(flatten)]
        db: DbArgs,
    },
}

#[derive(Subcommand, Debug)]
enum HistoryAction {
    /// List recent runs, newest first
    List {
        /// Only runs of this pipeline
        #[arg(long)]
        pipeline: Option<String>,

        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Show one run in full
    Show {
        /// Run ID
        run_id: String,
    },
}

#[derive(Args, Debug)]
struct PipelineArgs {
    /// Pipeline definition file
    #[arg(short, long, default_value = "shipline.toml", env = "SHIPLINE_PIPELINE")]
    pipeline: PathBuf,
}

#[derive(Args, Debug)]
struct TriggerArgs {
    /// Event kind: manual, push, pull_request, merge_queue
    #[arg(long, default_value = "manual")]
    event: EventKind,

    /// Target branch
    #[arg(long, default_value = "main")]
    branch: String,

    /// Source ref: head branch or commit SHA
    #[arg(long, default_value = "HEAD")]
    source_ref: String,

    /// Who fired the trigger
    #[arg(long, env = "SHIPLINE_ACTOR", default_value = "unknown")]
    actor: String,

    /// Event sub-action, e.g. `enqueued`
    #[arg(long)]
    action: Option<String>,

    /// Originating pull request number
    #[arg(long)]
    pull_request: Option<u64>,
}

impl TriggerArgs {
    fn to_context(&self) -> TriggerContext {
        let mut trigger = TriggerContext::new(
            self.event,
            self.branch.clone(),
            self.source_ref.clone(),
            self.actor.clone(),
        );
        if let Some(action) = &self.action {
            trigger = trigger.with_action(action.clone());
        }
        if let Some(number) = self.pull_request {
            trigger = trigger.with_pull_request(number);
        }
        trigger
    }
}

#[derive(Args, Debug)]
struct ForgeArgs {
    /// GitHub repository (owner/name) for pull-request lookups and comments
    #[arg(long, env = "SHIPLINE_GITHUB_REPO")]
    github_repo: Option<String>,

    /// GitHub API root
    #[arg(long, env = "SHIPLINE_GITHUB_API", default_value = DEFAULT_API_URL)]
    github_api: String,

    /// GitHub token
    #[arg(long, env = "GITHUB_TOKEN", hide_env_values = true)]
    github_token: Option<String>,

    /// Comment the run summary on the originating pull request
    #[arg(long)]
    comment: bool,

    /// POST a JSON run report to this URL
    #[arg(long, env = "SHIPLINE_WEBHOOK_URL")]
    webhook_url: Option<String>,

    /// Per-request timeout for GitHub and webhook calls, in seconds
    #[arg(long, env = "SHIPLINE_HTTP_TIMEOUT_SECS", default_value = "30")]
    http_timeout: u64,
}

impl ForgeArgs {
    fn github(&self) -> Result<Option<Arc<GitHubClient>>> {
        let Some(repo) = &self.github_repo else {
            return Ok(None);
        };
        let mut config = GitHubConfig::new(repo.clone())
            .with_api_url(self.github_api.clone())
            .with_timeout(self.timeout());
        if let Some(token) = &self.github_token {
            config = config.with_token(token.clone());
        }
        let client = GitHubClient::new(config).context("Failed to configure GitHub client")?;
        Ok(Some(Arc::new(client)))
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout)
    }
}

#[derive(Args, Debug)]
struct DbArgs {
    /// SurrealDB endpoint; defaults to local storage under .shipline/db
    #[arg(long, env = "SURREALDB_URL")]
    db_url: Option<String>,
}

impl DbArgs {
    async fn connect(&self) -> Result<SurrealRunHistory> {
        let history = match &self.db_url {
            Some(url) => SurrealRunHistory::connect(url).await,
            None => SurrealRunHistory::from_env().await,
        };
        history.context("Failed to connect to run history database")
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    shipline_core::init_tracing(cli.json, level);

    let code = match cli.command {
        Commands::Run {
            pipeline,
            trigger,
            forge,
            record,
            db,
        } => {
            let history = if record {
                Some(Arc::new(db.connect().await?) as Arc<dyn RunHistory>)
            } else {
                None
            };
            cmd_run(&pipeline.pipeline, &trigger, &forge, history, cli.json).await
        }
        Commands::Plan { pipeline } => cmd_plan(&pipeline.pipeline, cli.json),
        Commands::Gate {
            pipeline,
            trigger,
            forge,
        } => cmd_gate(&pipeline.pipeline, &trigger, &forge, cli.json).await,
        Commands::Validate { pipeline } => cmd_validate(&pipeline.pipeline, cli.json),
        Commands::History { action, db } => {
            let history = db.connect().await?;
            match action {
                HistoryAction::List { pipeline, limit } => {
                    cmd_history_list(&history, pipeline.as_deref(), limit, cli.json).await
                }
                HistoryAction::Show { run_id } => {
                    cmd_history_show(&history, &run_id, cli.json).await
                }
            }
        }
    }?;
    Ok(ExitCode::from(code))
}

fn load(path: &Path) -> Result<PipelineDefinition> {
    PipelineDefinition::load(path)
        .with_context(|| format!("Failed to load pipeline {}", path.display()))
}

const EXIT_OK: u8 = 0;
const EXIT_FAILED: u8 = 1;
const EXIT_DENIED: u8 = 2;

/// Exit status for a finished run.
fn exit_code_for(status: RunStatus) -> u8 {
    match status {
        RunStatus::Succeeded => EXIT_OK,
        RunStatus::Denied => EXIT_DENIED,
        _ => EXIT_FAILED,
    }
}

fn build_engine(
    def: &PipelineDefinition,
    forge: &ForgeArgs,
    history: Option<Arc<dyn RunHistory>>,
) -> Result<PipelineEngine> {
    let mut engine = PipelineEngine::from_definition(def, Arc::new(ProcessInvoker))
        .context("Invalid pipeline definition")?;

    let github = forge.github()?;
    let mut notifier = CompositeNotifier::new().with(Arc::new(LogNotifier));
    if let Some(client) = &github {
        engine = engine.with_lookup(client.clone());
        if forge.comment {
            notifier = notifier.with(client.clone());
        }
    }
    if let Some(url) = &forge.webhook_url {
        let webhook = WebhookNotifier::with_timeout(url.clone(), forge.timeout())
            .context("Invalid webhook URL")?;
        notifier = notifier.with(Arc::new(webhook));
    }
    engine = engine.with_notifier(Arc::new(notifier));

    if let Some(history) = history {
        engine = engine.with_history(history);
    }
    Ok(engine)
}

async fn cmd_run(
    path: &Path,
    trigger: &TriggerArgs,
    forge: &ForgeArgs,
    history: Option<Arc<dyn RunHistory>>,
    json: bool,
) -> Result<u8> {
    let def = load(path)?;
    let engine = build_engine(&def, forge, history)?;

    info!(pipeline = %def.name, "starting pipeline run");
    let run = engine
        .run(trigger.to_context())
        .await
        .context("Pipeline run aborted")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print_run(&run);
    }
    Ok(exit_code_for(run.status()))
}

fn print_run(run: &PipelineRun) {
    println!("Run {} ({}): {}", run.id, run.pipeline, run.status());
    if let Some(reason) = &run.denial_reason {
        println!("  denied: {reason}");
    }
    for stage in &run.stages {
        let detail = match (&stage.result, &stage.skip_reason) {
            (Some(result), _) => match result.failure() {
                Some(reason) => format!("{reason} [{}]", result.output.reference()),
                None => format!("{} ms [{}]", result.duration_ms, result.output.reference()),
            },
            (None, Some(reason)) => reason.clone(),
            (None, None) => String::new(),
        };
        println!("  {:<20} {:<10} {}", stage.id(), stage.status.as_str(), detail);
    }
}

fn cmd_plan(path: &Path, json: bool) -> Result<u8> {
    let def = load(path)?;
    let batches = plan_batches(&def)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&batches)?);
    } else {
        println!("Pipeline {}: {} stages", def.name, def.stages.len());
        for (i, batch) in batches.iter().enumerate() {
            println!("  batch {i}: {}", batch.join(", "));
        }
    }
    Ok(EXIT_OK)
}

fn plan_batches(def: &PipelineDefinition) -> Result<Vec<Vec<String>>> {
    let graph = def.build_graph().context("Invalid stage graph")?;
    let batches = graph
        .batches()
        .context("Invalid stage graph")?
        .map(|batch| batch.into_iter().map(|s| s.id.clone()).collect())
        .collect();
    Ok(batches)
}

async fn cmd_gate(
    path: &Path,
    trigger: &TriggerArgs,
    forge: &ForgeArgs,
    json: bool,
) -> Result<u8> {
    let def = load(path)?;
    let engine = build_engine(&def, forge, None)?;
    let report = engine.check_gates(&trigger.to_context()).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_gates(&report);
    }
    Ok(if report.allowed() {
        EXIT_OK
    } else {
        EXIT_DENIED
    })
}

fn print_gates(report: &GateReport) {
    if report.outcomes.is_empty() {
        println!("No gates configured: allow");
        return;
    }
    for outcome in &report.outcomes {
        match outcome.decision.reason() {
            None => println!("  allow  {}", outcome.gate),
            Some(reason) => println!("  deny   {}: {reason}", outcome.gate),
        }
    }
}

fn cmd_validate(path: &Path, json: bool) -> Result<u8> {
    let def = load(path)?;
    let digest = def.digest()?;
    if json {
        println!(
            "{}",
            serde_json::json!({
                "pipeline": def.name,
                "stages": def.stages.len(),
                "gates": def.gates.len(),
                "digest": digest,
            })
        );
    } else {
        println!(
            "✓ {} is valid: {} stages, {} gates, digest {}",
            path.display(),
            def.stages.len(),
            def.gates.len(),
            &digest[..12]
        );
    }
    Ok(EXIT_OK)
}

async fn cmd_history_list(
    history: &dyn RunHistory,
    pipeline: Option<&str>,
    limit: usize,
    json: bool,
) -> Result<u8> {
    let entries = match pipeline {
        Some(name) => history.list_for_pipeline(name, limit).await,
        None => history.list(limit).await,
    }
    .context("Failed to list runs")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else if entries.is_empty() {
        println!("No runs recorded");
    } else {
        for entry in &entries {
            print_entry_line(entry);
        }
    }
    Ok(EXIT_OK)
}

fn print_entry_line(entry: &RunEntry) {
    println!(
        "{}  {:<12} {:<10} {:<12} {} ({} ms)",
        entry.finished_at.format("%Y-%m-%d %H:%M:%S"),
        entry.pipeline,
        entry.outcome.to_string(),
        entry.event,
        entry.run_id,
        entry.duration_ms()
    );
}

async fn cmd_history_show(history: &dyn RunHistory, run_id: &str, json: bool) -> Result<u8> {
    let entry = history
        .get(&RunId::from(run_id))
        .await
        .with_context(|| format!("Run {run_id} not found"))?;

    if json {
        println!("{}", serde_json::to_string_pretty(&entry)?);
        return Ok(EXIT_OK);
    }

    println!("Run {}", entry.run_id);
    println!("  pipeline: {} ({})", entry.pipeline, &entry.definition_digest);
    println!(
        "  trigger:  {} on {} from {} by {}",
        entry.event, entry.target_branch, entry.source_ref, entry.actor
    );
    println!("  outcome:  {}", entry.outcome);
    if let Some(reason) = &entry.denial_reason {
        println!("  denied:   {reason}");
    }
    for stage in &entry.stages {
        println!(
            "  {:<20} {:<10} {}",
            stage.stage_id,
            stage.status,
            stage.detail.as_deref().unwrap_or("")
        );
    }
    Ok(EXIT_OK)
}
