use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use remedy::config::Config;
use remedy::detect::Detector;
use remedy::dispatch::Dispatcher;
use remedy::planner::Planner;
use remedy::queue::{self, JobQueue};
use remedy::report::Reporter;
use remedy::sandbox::SandboxRunner;
use remedy::server;
use remedy::store::{Store, LIST_LIMIT};
use remedy::validate::SandboxValidator;
use remedy::workflow::Orchestrator;

#[derive(Parser, Debug)]
#[command(
    name = "remedy",
    about = "Detects breaking dependency upgrades and repairs them automatically",
    version
)]
struct Args {
    /// Project tree to watch (defaults to REMEDY_WORKSPACE or the current directory)
    #[arg(short, long)]
    workspace: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one detection pass and print what it found
    Detect,
    /// Serve the read-only API without the detection loop
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing();

    let mut config = Config::load()?;
    if let Some(workspace) = args.workspace {
        config.workspace = workspace;
    }

    match args.command {
        Some(Command::Detect) => run_detect(&config).await,
        Some(Command::Serve) => run_serve(&config).await,
        None => run_daemon(config).await,
    }
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("remedy=info")),
        )
        .init();
}

/// One detection pass, then a summary on stdout.
async fn run_detect(config: &Config) -> Result<()> {
    let store = Store::open(&config.db_path())?;
    let reporter = Reporter::new(config)?;
    let detector = Detector::new(config, store, reporter)?;
    let summary = detector.run_pass().await?;

    println!(
        "Scanned {} pinned dependencies, {} with upgrades available.",
        summary.pinned, summary.upgrades
    );
    if summary.incidents.is_empty() {
        println!("No upgrade broke the pipeline.");
    } else {
        println!("{} upgrade(s) crashed:", summary.incidents.len());
        for incident in &summary.incidents {
            println!(
                "  {}  {} {} -> {}",
                incident.short_id(),
                incident.dependency.name,
                incident.dependency.current_version,
                incident.dependency.latest_version
            );
        }
        println!("Run the daemon to repair them.");
    }
    Ok(())
}

async fn run_serve(config: &Config) -> Result<()> {
    let store = Store::open(&config.db_path())?;
    server::serve(store, &config.api_bind, config.api_token.clone()).await
}

/// The full daemon: detection loop, repair workers, and the API.
async fn run_daemon(config: Config) -> Result<()> {
    tracing::info!(
        workspace = %config.workspace.display(),
        interval = ?config.detect_interval,
        "remedy daemon starting"
    );

    let store = Store::open(&config.db_path())?;
    let reporter = Reporter::new(&config)?;
    let detector = Detector::new(&config, store.clone(), reporter.clone())?;

    let planner = Planner::new(
        config.reasoner_url.clone(),
        config.model.clone(),
        config.reasoner_key.clone(),
    )?;
    let dispatcher = Dispatcher::new(config.mission_url.clone())?;
    let runner = SandboxRunner::new(
        config.sandbox_image.clone(),
        config.sandbox_workdir.clone(),
        config.sandbox_timeout,
    );
    let validator = SandboxValidator::new(
        runner,
        store.clone(),
        config.npm_test_cmd.clone(),
        config.py_test_cmd.clone(),
    );
    let orchestrator = Orchestrator::new(
        store.clone(),
        planner,
        dispatcher,
        validator,
        reporter,
        config.max_attempts,
        config.arena_root(),
        config.workspace.clone(),
    );

    let queue = queue::start(detector, orchestrator, config.max_parallel_incidents);
    requeue_unfinished(&store, &queue)?;
    queue::spawn_scheduler(queue, config.detect_interval);

    tokio::select! {
        result = server::serve(store, &config.api_bind, config.api_token.clone()) => result?,
        _ = tokio::signal::ctrl_c() => tracing::info!("shutdown signal received"),
    }
    Ok(())
}

/// Put incidents that were mid-repair when the last run stopped back on the
/// queue. Terminal incidents are left alone.
fn requeue_unfinished(store: &Store, queue: &JobQueue) -> Result<()> {
    for incident in store.list_incidents(LIST_LIMIT)? {
        if !incident.status.is_terminal() {
            tracing::info!(
                incident = incident.short_id(),
                status = incident.status.label(),
                "requeueing unfinished incident"
            );
            queue.enqueue_incident(incident);
        }
    }
    Ok(())
}
