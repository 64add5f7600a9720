use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wavefront::agent::CommandAgent;
use wavefront::core::{EscalationDecision, OrchestratorConfig, OrchestratorError};
use wavefront::graph::validate;
use wavefront::model::BuildPlan;
use wavefront::progress::LoggingEventSink;
use wavefront::scheduler::plan;
use wavefront::Orchestrator;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum OnEscalation {
    Stop,
    Continue,
}

impl From<OnEscalation> for EscalationDecision {
    fn from(value: OnEscalation) -> Self {
        match value {
            OnEscalation::Stop => EscalationDecision::Stop,
            OnEscalation::Continue => EscalationDecision::Continue,
        }
    }
}

#[derive(Parser)]
#[command(name = "wavefront")]
#[command(about = "Build dependent work units in parallel phases", long_about = None)]
#[command(version)]
struct Cli {
    /// Build plan (YAML, or JSON by extension)
    plan: PathBuf,

    /// Run configuration file (YAML)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long)]
    max_retries: Option<u32>,

    /// Concurrency cap for bounded execution
    #[arg(long)]
    concurrency: Option<usize>,

    #[arg(long)]
    fail_fast: bool,

    #[arg(long, value_enum)]
    on_escalation: Option<OnEscalation>,

    /// Sled database for progress snapshots
    #[arg(long)]
    snapshot_db: Option<PathBuf>,

    /// Write the JSON report here instead of stdout
    #[arg(long)]
    report: Option<PathBuf>,

    /// Print the phase plan as Graphviz DOT and exit
    #[arg(long)]
    dot: bool,

    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "wavefront=debug" } else { "wavefront=info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default.into()),
        )
        .init();
}

fn load_config(cli: &Cli) -> Result<OrchestratorConfig> {
    let mut config = match &cli.config {
        Some(path) => OrchestratorConfig::from_path(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => OrchestratorConfig::default(),
    };
    if let Some(retries) = cli.max_retries {
        config.max_retries = retries;
    }
    if let Some(cap) = cli.concurrency {
        config.concurrency_cap = Some(cap);
    }
    if cli.fail_fast {
        config.fail_fast = true;
    }
    if let Some(decision) = cli.on_escalation {
        config.escalation = decision.into();
    }
    if let Some(path) = &cli.snapshot_db {
        config.snapshot_path = Some(path.clone());
    }
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn emit(json: &str, target: Option<&PathBuf>) -> Result<()> {
    match target {
        Some(path) => std::fs::write(path, json)
            .with_context(|| format!("writing report {}", path.display())),
        None => {
            println!("{}", json);
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let config = load_config(&cli)?;
    let build_plan = BuildPlan::from_path(&cli.plan)
        .with_context(|| format!("loading plan {}", cli.plan.display()))?;

    if cli.dot {
        let (graph, violations) = validate(build_plan.into_units()?, &config);
        if violations.iter().any(|v| v.is_critical()) {
            emit(&serde_json::to_string_pretty(&violations)?, cli.report.as_ref())?;
            return Ok(ExitCode::from(2));
        }
        println!("{}", plan(&graph)?.to_dot());
        return Ok(ExitCode::SUCCESS);
    }

    let agent = Arc::new(CommandAgent::new());
    let orchestrator = Orchestrator::new(config, agent.clone(), agent)?
        .with_event_sink(Arc::new(LoggingEventSink));

    let report = match orchestrator.run(build_plan).await {
        Ok(report) => report,
        Err(OrchestratorError::CriticalViolations { violations }) => {
            tracing::error!(count = violations.len(), "Plan rejected by validation");
            emit(&serde_json::to_string_pretty(&violations)?, cli.report.as_ref())?;
            return Ok(ExitCode::from(2));
        }
        Err(e @ OrchestratorError::InvalidPlan { .. }) => {
            tracing::error!(error = %e, "Plan rejected");
            return Ok(ExitCode::from(2));
        }
        Err(e) => {
            tracing::error!(category = e.category(), error = %e, "Run failed");
            return Err(e).context("run failed");
        }
    };

    emit(&serde_json::to_string_pretty(&report)?, cli.report.as_ref())?;

    if report.needs_attention() {
        tracing::warn!(
            escalated = ?report.escalated_units(),
            integration_failed = report.integration_failed(),
            "Run finished with units needing attention"
        );
        return Ok(ExitCode::from(1));
    }
    Ok(ExitCode::SUCCESS)
}
