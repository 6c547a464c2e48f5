//! deferq - a persistent, constraint-aware background job scheduler.
//!
//! Usage:
//!   deferq run <requests-dir>       Submit the requests in a directory and run them
//!   deferq validate <requests-dir>  Validate request files without running
//!   deferq list <requests-dir>      List the requests in a directory

use async_trait::async_trait;
use clap::{Parser, Subcommand};
use deferq::{
    Data, Event, EventBus, EventHandler, JobStore, LoadedRequest, RemoteWorker, Scheduler,
    SchedulerConfig, StorageConfig, WorkContext, WorkQuery, WorkResult, Worker, WorkerRegistry,
    YamlLoader, load_requests_from_directory,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// deferq - a persistent, constraint-aware background job scheduler
#[derive(Parser)]
#[command(name = "deferq")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Scheduler configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit the requests in a directory and run them
    Run {
        /// Path to the directory containing request YAML files
        #[arg(value_name = "REQUESTS_DIR")]
        requests_dir: PathBuf,

        /// Worker slots (overrides the configuration file)
        #[arg(short = 'w', long)]
        workers: Option<usize>,

        /// Register a remote worker as JOB_TYPE=PROGRAM
        #[arg(long = "remote", value_name = "JOB_TYPE=PROGRAM")]
        remotes: Vec<String>,
    },

    /// Validate request files without running
    Validate {
        /// Path to the directory containing request YAML files
        #[arg(value_name = "REQUESTS_DIR")]
        requests_dir: PathBuf,
    },

    /// List the requests in a directory
    List {
        /// Path to the directory containing request YAML files
        #[arg(value_name = "REQUESTS_DIR")]
        requests_dir: PathBuf,
    },

    /// Serve the built-in workers over stdin/stdout
    #[command(hide = true)]
    RemoteWorker,
}

/// Simple logging event handler that prints job events.
struct LoggingHandler;

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::JobStarted {
                job_id,
                job_type,
                attempt,
                ..
            } => {
                info!("Job '{}' ({}) started, attempt {}", job_type, job_id, attempt);
            }
            Event::JobSucceeded {
                job_id,
                job_type,
                duration,
                ..
            } => {
                info!(
                    "Job '{}' ({}) succeeded in {:?}",
                    job_type, job_id, duration
                );
            }
            Event::JobFailed {
                job_id,
                job_type,
                cause,
                ..
            } => {
                error!("Job '{}' ({}) failed: {}", job_type, job_id, cause);
            }
            Event::JobRetrying {
                job_id,
                job_type,
                delay,
                ..
            } => {
                warn!("Job '{}' ({}) will retry in {:?}", job_type, job_id, delay);
            }
            Event::JobStopped {
                job_id,
                job_type,
                reason,
                ..
            } => {
                warn!("Job '{}' ({}) stopped: {}", job_type, job_id, reason);
            }
            Event::PeriodCompleted {
                job_id,
                job_type,
                period,
                success,
                ..
            } => {
                info!(
                    "Job '{}' ({}) completed period {} ({})",
                    job_type,
                    job_id,
                    period,
                    if *success { "success" } else { "failure" }
                );
            }
        }
    }
}

/// Returns its input as output.
struct EchoWorker;

#[async_trait]
impl Worker for EchoWorker {
    async fn do_work(&self, ctx: WorkContext) -> WorkResult {
        WorkResult::Success(ctx.input().clone())
    }
}

/// Sleeps for `millis` from the input, reporting progress every 100ms.
struct SleepWorker;

#[async_trait]
impl Worker for SleepWorker {
    async fn do_work(&self, ctx: WorkContext) -> WorkResult {
        let total = ctx.input().get_int("millis").unwrap_or(1000).max(0);
        let mut slept = 0;
        while slept < total {
            let step = (total - slept).min(100);
            tokio::time::sleep(Duration::from_millis(step as u64)).await;
            slept += step;
            ctx.set_progress(Data::new().with("slept_ms", slept));
        }
        WorkResult::Success(Data::new().with("slept_ms", slept))
    }
}

/// Fails with `message` from the input.
struct FailWorker;

#[async_trait]
impl Worker for FailWorker {
    async fn do_work(&self, ctx: WorkContext) -> WorkResult {
        let message = ctx.input().get_str("message").unwrap_or("requested failure");
        WorkResult::Failure(message.to_string())
    }
}

fn builtin_workers() -> WorkerRegistry {
    let mut registry = WorkerRegistry::new();
    registry.register_async("echo", EchoWorker);
    registry.register_async("sleep", SleepWorker);
    registry.register_async("fail", FailWorker);
    registry
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => YamlLoader::load_scheduler_config(path)?,
        None => SchedulerConfig::default(),
    };

    // Stdout carries the worker protocol in remote-worker mode, so logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Run {
            requests_dir,
            workers,
            remotes,
        } => {
            run_requests(config, requests_dir, workers, remotes).await?;
        }
        Commands::Validate { requests_dir } => {
            validate_requests(requests_dir)?;
        }
        Commands::List { requests_dir } => {
            list_requests(requests_dir)?;
        }
        Commands::RemoteWorker => {
            deferq::worker::serve_stdio(&builtin_workers()).await?;
        }
    }

    Ok(())
}

async fn open_store(config: &SchedulerConfig) -> Result<Arc<JobStore>, Box<dyn std::error::Error>> {
    match &config.storage {
        StorageConfig::Memory => Ok(Arc::new(JobStore::in_memory())),
        #[cfg(feature = "sqlite")]
        StorageConfig::Sqlite { path } => {
            info!("Opening SQLite store at {}", path);
            let storage = deferq::SqliteStorage::new(path).await?;
            let store = JobStore::open(Arc::new(storage), Arc::new(deferq::SystemClock)).await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "sqlite"))]
        StorageConfig::Sqlite { .. } => {
            Err("sqlite storage requires building with the 'sqlite' feature".into())
        }
    }
}

/// Submit requests from a directory and run until they finish or Ctrl+C.
async fn run_requests(
    config: SchedulerConfig,
    requests_dir: PathBuf,
    workers: Option<usize>,
    remotes: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Loading requests from: {}", requests_dir.display());

    let requests = load_requests_from_directory(&requests_dir)?;
    if requests.is_empty() {
        warn!("No request files found in {}", requests_dir.display());
        return Ok(());
    }

    let mut registry = builtin_workers();
    for remote in &remotes {
        let Some((job_type, program)) = remote.split_once('=') else {
            return Err(format!("invalid --remote '{}', expected JOB_TYPE=PROGRAM", remote).into());
        };
        registry.register_remote(job_type, RemoteWorker::builder(program).build());
    }

    let store = open_store(&config).await?;

    let mut ids = Vec::new();
    let mut periodic = false;
    for LoadedRequest { request, unique } in requests {
        periodic |= request.is_periodic();
        let job_type = request.job_type().to_string();
        match unique {
            Some((name, policy)) => {
                let outcome = store.submit_unique(&name, policy, request).await?;
                info!("  - {} as '{}': {:?}", job_type, name, outcome.kind);
                ids.extend(outcome.ids);
            }
            None => {
                let id = store.submit(request).await?;
                info!("  - {} ({})", job_type, id);
                ids.push(id);
            }
        }
    }

    let event_bus = EventBus::new();
    event_bus.register(Arc::new(LoggingHandler)).await;

    let mut scheduler = Scheduler::new(store.clone(), registry)
        .with_config(&config)
        .with_event_bus(event_bus);
    if let Some(max) = workers {
        scheduler = scheduler.with_max_concurrent_workers(max);
    }

    info!("Starting scheduler...");
    info!("Press Ctrl+C to stop");
    let (handle, mut scheduler_task) = scheduler.start();

    let mut observer = store.observe_query(WorkQuery::new().with_ids(ids));
    let all_finished = async {
        while let Some(records) = observer.next().await {
            if !periodic && records.iter().all(|record| record.is_finished()) {
                return;
            }
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            handle.shutdown().await?;
        }
        _ = all_finished => {
            info!("All jobs finished");
            handle.shutdown().await?;
        }
        result = &mut scheduler_task => {
            match result {
                Ok(Ok(())) => info!("Scheduler stopped"),
                Ok(Err(e)) => return Err(e.into()),
                Err(e) => return Err(e.into()),
            }
            return Ok(());
        }
    }

    scheduler_task.await??;
    info!("Goodbye!");
    Ok(())
}

/// Validate request files without running.
fn validate_requests(requests_dir: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    info!("Validating requests in: {}", requests_dir.display());

    match load_requests_from_directory(&requests_dir) {
        Ok(requests) => {
            info!("All {} request(s) are valid", requests.len());
            Ok(())
        }
        Err(e) => {
            error!("Validation failed: {}", e);
            Err(e.into())
        }
    }
}

/// List the requests in a directory.
fn list_requests(requests_dir: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let requests = load_requests_from_directory(&requests_dir)?;

    if requests.is_empty() {
        println!("No requests found in {}", requests_dir.display());
        return Ok(());
    }

    println!("Requests in {}:", requests_dir.display());
    println!();

    for LoadedRequest { request, unique } in &requests {
        println!("Type: {}", request.job_type());
        if let Some((name, policy)) = unique {
            println!("  Unique: {} ({:?})", name, policy);
        }
        if request.is_periodic() {
            println!("  Periodicity: {:?}", request.periodicity());
        }
        if let Some(policy) = request.expedited() {
            println!("  Expedited: {:?}", policy);
        }
        if !request.tags().is_empty() {
            let tags: Vec<&str> = request.tags().iter().map(String::as_str).collect();
            println!("  Tags: {}", tags.join(", "));
        }
        if !request.constraints().is_empty() {
            println!("  Constraints: {:?}", request.constraints());
        }
        println!("  Input keys: {}", request.input().len());
        println!();
    }

    Ok(())
}
