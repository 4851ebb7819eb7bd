//! Courier CLI - run one offloaded fetch and print what the origin actor receives.
//!
//! ```text
//! courier fetch <url> [--race] [--method M] [--timeout-ms N] [--max-retries N] [--executor NAME]
//! courier resume [--settle-ms N]
//! ```
//!
//! `fetch` submits from a per-process `cli/run-<pid>` actor whose only handler
//! prints the delivered [`FetchResult`] as JSON. `resume` reactivates every
//! persisted actor and queue, so outcomes left behind by an interrupted run are
//! delivered and printed.

use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use courier_engine::{
    Actor, ActorContext, ActorRef, ActorSystem, BoxFuture, Continuation, CourierConfig,
    FetchOptions, FetchResult, FetchTarget, HandlerError, Invocation,
};

const CLI_BINDING: &str = "cli";
const DELIVER: &str = "deliver";

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_courier_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // Stdout carries the delivered outcome; keep logs off it.
    tracing_subscriber::registry().with(env_filter).init();
}

fn open_courier_log_file() -> (Option<(PathBuf, std::fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in courier_log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new().create(true).append(true).open(&candidate) {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn courier_log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();

    // Primary: ~/.courier/logs/courier.log
    if let Some(config_path) = CourierConfig::path()
        && let Some(config_dir) = config_path.parent()
    {
        candidates.push(config_dir.join("logs").join("courier.log"));
    }

    // Fallback: ./.courier/logs/courier.log
    candidates.push(PathBuf::from(".courier").join("logs").join("courier.log"));

    candidates
}

#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(about = "Run an offloaded fetch and print the delivered outcome")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit one fetch and wait for its outcome
    Fetch(FetchArgs),
    /// Reactivate persisted actors and queues and print late outcomes
    Resume {
        /// Stop once no outcome arrived for this long
        #[arg(long, default_value_t = 500)]
        settle_ms: u64,
    },
}

#[derive(Args, Debug)]
struct FetchArgs {
    url: String,

    /// Race the executor against a durable wake-up instead of queueing
    #[arg(long)]
    race: bool,

    #[arg(long, default_value = "GET")]
    method: String,

    /// Per-call abort timeout
    #[arg(long)]
    timeout_ms: Option<u64>,

    #[arg(long)]
    max_retries: Option<u32>,

    /// Execution context or queue binding
    #[arg(long)]
    executor: Option<String>,
}

impl FetchArgs {
    fn options(&self) -> FetchOptions {
        let defaults = FetchOptions::default();
        FetchOptions {
            timeout_ms: self.timeout_ms.unwrap_or(defaults.timeout_ms),
            max_retries: self.max_retries.unwrap_or(defaults.max_retries),
            executor_binding: self
                .executor
                .clone()
                .unwrap_or_else(|| defaults.executor_binding.clone()),
            ..defaults
        }
    }
}

/// Origin actor for CLI runs: forwards every delivered outcome to `main`.
struct Printer {
    outcomes: mpsc::UnboundedSender<FetchResult>,
}

impl Actor for Printer {
    fn methods(&self) -> &'static [&'static str] {
        &[DELIVER]
    }

    fn invoke<'a>(
        &'a mut self,
        _ctx: &'a ActorContext,
        invocation: Invocation,
    ) -> BoxFuture<'a, Result<(), HandlerError>> {
        Box::pin(async move {
            let result: FetchResult = invocation.arg(0)?;
            if self.outcomes.send(result).is_err() {
                tracing::debug!("Outcome arrived after the CLI stopped listening");
            }
            Ok(())
        })
    }
}

fn build_system(
    config: CourierConfig,
    outcomes: mpsc::UnboundedSender<FetchResult>,
) -> Result<ActorSystem> {
    let system = ActorSystem::builder(config)
        .binding(CLI_BINDING, move |_: &ActorRef| -> Box<dyn Actor> {
            Box::new(Printer {
                outcomes: outcomes.clone(),
            })
        })
        .build()?;
    Ok(system)
}

fn print_outcome(result: &FetchResult) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(result)?);
    Ok(())
}

async fn run_fetch(config: CourierConfig, args: FetchArgs) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let system = build_system(config, tx)?;

    let origin = ActorRef::new(CLI_BINDING, format!("run-{}", std::process::id()))?;
    let actor = system.actor(&origin).await?;
    let options = args.options();
    let target = FetchTarget::new(args.method, args.url)?;
    let continuation = Continuation::new(DELIVER).result();

    let req_id = if args.race {
        actor.race_fetch(target, continuation, options).await?
    } else {
        actor
            .enqueue_fetch(target, Some(continuation), options)
            .await?
    };
    tracing::info!(%req_id, race = args.race, "Fetch submitted");

    let result = tokio::select! {
        result = rx.recv() => result.context("actor system stopped before delivery")?,
        _ = tokio::signal::ctrl_c() => {
            bail!("interrupted; {req_id} stays persisted until `courier resume`")
        }
    };
    print_outcome(&result)?;
    system.shutdown();
    Ok(())
}

async fn run_resume(config: CourierConfig, settle: Duration) -> Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let system = build_system(config, tx)?;

    let report = system.resume().await?;
    eprintln!(
        "resumed {} actor(s) and {} queue(s) from {}",
        report.actors,
        report.queues,
        system.data_dir().display()
    );

    // Keep printing until deliveries stop for `settle`.
    while let Ok(Some(result)) = tokio::time::timeout(settle, rx.recv()).await {
        print_outcome(&result)?;
    }
    system.idle().await;
    system.shutdown();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let config = CourierConfig::load().ok().flatten().unwrap_or_default();

    match cli.command {
        Command::Fetch(args) => run_fetch(config, args).await,
        Command::Resume { settle_ms } => {
            run_resume(config, Duration::from_millis(settle_ms)).await
        }
    }
}
