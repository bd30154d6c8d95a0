//! dispatchd: run the trigger scheduler and inspect its streams.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use secrecy::{ExposeSecret, SecretString};
use tracing::{info, warn};
use trigger_dispatch::config::{Config, SchedulerConfig, StreamConfig};
use trigger_dispatch::event::NoopNotifier;
use trigger_dispatch::jobs;
use trigger_dispatch::model::JobTrigger;
use trigger_dispatch::scheduler::{
    ConditionScheduler, HmacSigner, HttpSubmitter, MemoryRepository,
};
use trigger_dispatch::store::{MemoryStore, PgStore, StreamStore};
use trigger_dispatch::stream::{JobStreamManager, StreamLog, TaskStreamManager};
use trigger_dispatch::telemetry::{TelemetryConfig, init_telemetry};
use trigger_dispatch::worker::JsonRpcClient;

#[derive(Parser)]
#[command(name = "dispatchd", about = "Trigger evaluation and task dispatch")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Schedule every job in a directory and run until Ctrl-C
    Serve {
        /// Directory containing job TOML files
        #[arg(long, default_value = "jobs")]
        jobs: PathBuf,
        /// Seconds to wait for workers to stop on shutdown
        #[arg(long, default_value_t = 10)]
        grace_secs: u64,
    },
    /// Job file operations
    Job {
        #[command(subcommand)]
        action: JobAction,
    },
    /// Print task and job stream lengths
    Streams,
}

#[derive(Subcommand)]
enum JobAction {
    /// Parse a job file and run admission checks
    Validate {
        /// Path to the job TOML file
        file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { jobs, grace_secs } => cmd_serve(jobs, grace_secs).await,
        Command::Job {
            action: JobAction::Validate { file },
        } => cmd_job_validate(&file),
        Command::Streams => {
            let config = Config::from_env()?;
            let store = open_store(&config).await?;
            cmd_streams(store).await
        }
    }
}

async fn open_store(config: &Config) -> anyhow::Result<Arc<dyn StreamStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url.expose_secret()).await?;
            store.migrate().await?;
            Ok(Arc::new(store))
        }
        None => Ok(Arc::new(MemoryStore::new())),
    }
}

async fn cmd_serve(dir: PathBuf, grace_secs: u64) -> anyhow::Result<()> {
    let config = Config::from_env()?;

    let _guard = init_telemetry(TelemetryConfig {
        endpoint: config.otel_endpoint.clone(),
        service_name: "dispatchd".to_string(),
        default_level: config.log_level.clone(),
    })?;

    let store = open_store(&config).await?;
    if config.database_url.is_none() {
        warn!("DATABASE_URL not set, streams are in-process only");
    }

    let repository = Arc::new(MemoryRepository::new());
    let definitions = jobs::load_from_dir(&dir)?;
    let job_ids: Vec<_> = definitions.iter().map(|j| j.job_id).collect();
    for job in definitions {
        repository.insert(job).await;
    }
    info!(count = job_ids.len(), dir = %dir.display(), "loaded job definitions");

    let scheduler_config = SchedulerConfig::from_config(&config);
    let signer = Arc::new(HmacSigner::new(SecretString::from(
        config.scheduler_private_key.expose_secret().to_string(),
    )));
    let mut builder = ConditionScheduler::builder(scheduler_config.clone(), store, signer)
        .repository(repository)
        .performers(config.performer_ids.clone());
    if let Some(url) = &config.task_dispatcher_url {
        builder = builder.submitter(Arc::new(HttpSubmitter::new(
            url.as_str(),
            scheduler_config.request_timeout,
        )?));
    }
    for (chain_id, url) in &config.chain_rpc_urls {
        let client = JsonRpcClient::new(
            url.as_str(),
            scheduler_config.request_timeout,
            scheduler_config.fetch_retry.clone(),
        )?;
        builder = builder.chain_client(chain_id.as_str(), Arc::new(client));
    }

    let scheduler = builder.build()?;
    scheduler.start().await?;

    for job_id in job_ids {
        if let Err(e) = scheduler.schedule_by_id(job_id).await {
            warn!(job_id = %job_id, error = %e, "job not scheduled");
        }
    }
    info!(active = scheduler.active_jobs().await.len(), "dispatchd running");

    tokio::signal::ctrl_c().await?;
    scheduler.shutdown(Duration::from_secs(grace_secs)).await;
    Ok(())
}

fn cmd_job_validate(file: &Path) -> anyhow::Result<()> {
    let job = jobs::load_job_file(file)?;
    let detail = match &job.trigger {
        JobTrigger::Condition(spec) => format!(
            "{} {} [{}, {}]",
            spec.value_source_type, spec.condition_type, spec.lower_limit, spec.upper_limit
        ),
        JobTrigger::Event(spec) => format!(
            "{} on {} (chain {})",
            spec.trigger_event, spec.trigger_contract_address, spec.trigger_chain_id
        ),
        JobTrigger::Socket(spec) => format!("{} {}", spec.socket_url, spec.condition_type),
    };
    println!("OK: job {} ({})", job.job_id, job.kind());
    println!("  trigger:   {detail}");
    println!(
        "  target:    {}.{} (chain {})",
        job.target.target_contract_address, job.target.target_function, job.target.target_chain_id
    );
    println!("  recurring: {}", job.recurring);
    println!("  expires:   {}", job.expiration_time.format("%Y-%m-%d %H:%M:%S UTC"));
    Ok(())
}

async fn cmd_streams(store: Arc<dyn StreamStore>) -> anyhow::Result<()> {
    let log = Arc::new(StreamLog::new(store));
    let stream_config = StreamConfig::default();
    let tasks = TaskStreamManager::new(log.clone(), stream_config.clone(), Arc::new(NoopNotifier));
    let jobs = JobStreamManager::new(log, stream_config, Arc::new(NoopNotifier));
    tasks.initialize().await?;
    jobs.initialize().await?;

    let info = tasks.stream_info().await?;
    println!("{:<20}  {:>8}  TTL", "STREAM", "LENGTH");
    println!("{}", "-".repeat(40));
    for stat in &info.streams {
        let ttl = stat
            .ttl_secs
            .map(|s| format!("{s}s"))
            .unwrap_or_else(|| "-".to_string());
        println!("{:<20}  {:>8}  {}", stat.name, stat.length, ttl);
    }
    println!("{:<20}  {:>8}  -", "jobs:running", jobs.running_len().await?);
    println!("{:<20}  {:>8}  -", "jobs:completed", jobs.completed_len().await?);
    println!(
        "\nmax length {}, max retries {}, base backoff {}s",
        info.max_len, info.max_retry_attempts, info.retry_backoff_base_secs
    );
    Ok(())
}
