use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use collaboration::{
    poll_job, CancellationToken, ConflictDiffEngine, HttpResourceClient, JobId, JobPoller,
    LockCoordinator, LockSnapshot, LockState, ReleaseMode, RemoteJob, RemoteResourceClient,
    ResourceId, SessionConfig, StaticTokenProvider,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use threat_model::ThreatModel;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const TOKEN_VAR: &str = "TM_API_TOKEN";

#[derive(Parser)]
#[command(name = "tm-session")]
#[command(about = "Threat model session tools - leases, generation jobs and conflict diffs")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Session configuration file (JSON)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Base URL of the document service, overrides the config file
    #[arg(long, global = true)]
    api_url: Option<String>,

    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Compare a local threat model file against a server copy
    Diff {
        /// Local document (JSON)
        local: PathBuf,

        /// Server document (JSON)
        server: PathBuf,

        /// Print the change set as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show who holds the edit lease on a document
    LockStatus {
        /// Document id
        resource: String,
    },

    /// Acquire the edit lease and keep it alive until interrupted
    Hold {
        /// Document id
        resource: String,

        /// Release after this many seconds
        #[arg(long)]
        seconds: Option<u64>,
    },

    /// Follow a generation job until it finishes
    WatchJob {
        /// Document the job belongs to
        resource: String,

        /// Job id; defaults to the job pending for the document
        #[arg(long)]
        job: Option<String>,
    },

    /// Write a configuration file with default values
    InitConfig {
        /// Output path
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let default_filter = if cli.verbose {
        "tm_session=debug,collaboration=debug,jobs=debug"
    } else {
        "tm_session=info,collaboration=info,jobs=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Diff {
            ref local,
            ref server,
            json,
        } => diff_command(local, server, json),
        Commands::InitConfig { ref path } => init_config_command(path),
        Commands::LockStatus { ref resource } => {
            let config = load_config(&cli)?;
            lock_status_command(&config, resource).await
        }
        Commands::Hold {
            ref resource,
            seconds,
        } => {
            let config = load_config(&cli)?;
            hold_command(&config, resource, seconds).await
        }
        Commands::WatchJob {
            ref resource,
            ref job,
        } => {
            let config = load_config(&cli)?;
            watch_job_command(&config, resource, job.clone()).await
        }
    }
}

fn load_config(cli: &Cli) -> Result<SessionConfig> {
    let mut config = match &cli.config {
        Some(path) => SessionConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => SessionConfig::default(),
    };
    if let Some(url) = &cli.api_url {
        config.api_url = Some(url.clone());
    }
    if config.api_url.is_none() {
        bail!("No API URL configured; pass --api-url or set api_url in the config file");
    }
    Ok(config)
}

fn connect(config: &SessionConfig) -> Result<Arc<dyn RemoteResourceClient>> {
    let token = std::env::var(TOKEN_VAR)
        .with_context(|| format!("{} must hold a bearer token", TOKEN_VAR))?;
    let client = HttpResourceClient::from_config(config, Arc::new(StaticTokenProvider::new(token)))
        .context("Failed to create API client")?;
    Ok(Arc::new(client))
}

fn read_model(path: &Path) -> Result<ThreatModel> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let model = ThreatModel::from_json(&json)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    if let Err(e) = model.validate() {
        warn!("{}: {}; matching degrades for that collection", path.display(), e);
    }
    Ok(model)
}

fn diff_command(local: &Path, server: &Path, json: bool) -> Result<()> {
    let local = read_model(local)?;
    let server = read_model(server)?;
    let changes = ConflictDiffEngine::diff_models(&local, &server)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&changes)?);
        return Ok(());
    }

    if changes.is_empty() {
        println!("No differences");
        return Ok(());
    }

    for group in &changes.groups {
        println!(
            "{} ({} added, {} modified, {} deleted)",
            group.collection, group.added, group.modified, group.deleted
        );
        for change in &group.changes {
            println!("  {:?}: {}", change.kind, change.entity_key);
        }
    }
    println!("Total: {}", changes.summary());
    Ok(())
}

fn init_config_command(path: &Path) -> Result<()> {
    let config = SessionConfig::default().with_api_url("http://localhost:8080/api");
    config
        .save(path)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    info!("Wrote default configuration to {}", path.display());
    Ok(())
}

async fn lock_status_command(config: &SessionConfig, resource: &str) -> Result<()> {
    let client = connect(config)?;
    let status = client.lock_status(&ResourceId::from(resource)).await?;

    if !status.locked {
        println!("{} is free", resource);
        return Ok(());
    }
    println!(
        "{} is locked by {}",
        resource,
        status.holder.as_deref().unwrap_or("an unknown user")
    );
    if let Some(since) = status.since {
        println!("  since   {}", since.to_rfc3339());
    }
    if let Some(expires_at) = status.expires_at {
        println!("  expires {}", expires_at.to_rfc3339());
    }
    Ok(())
}

fn print_lock(lock: &LockSnapshot) {
    match lock.state {
        LockState::Contested => println!(
            "{}: held by {}",
            lock.resource_id,
            lock.holder.as_deref().unwrap_or("another user")
        ),
        state => println!("{}: {:?}", lock.resource_id, state),
    }
}

async fn hold_command(config: &SessionConfig, resource: &str, seconds: Option<u64>) -> Result<()> {
    let client = connect(config)?;
    let locks = LockCoordinator::new(client, config.lock_config());
    let resource = ResourceId::from(resource);

    let subscription = locks.subscribe(resource.clone(), print_lock);

    match seconds {
        Some(seconds) => {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(seconds)) => {}
                _ = tokio::signal::ctrl_c() => {}
            }
        }
        None => {
            tokio::signal::ctrl_c().await?;
        }
    }

    info!("Releasing {}", resource);
    locks.release(&resource, ReleaseMode::Confirmed).await;
    drop(subscription);
    Ok(())
}

async fn watch_job_command(config: &SessionConfig, resource: &str, job: Option<String>) -> Result<()> {
    let client = connect(config)?;
    let resource = ResourceId::from(resource);

    let job_id = match job {
        Some(id) => JobId::new(id),
        None => match client.pending_generation(&resource).await? {
            Some(id) => id,
            None => {
                println!("No generation running for {}", resource);
                return Ok(());
            }
        },
    };
    info!("Watching job {} for {}", job_id, resource);

    let cancel = CancellationToken::new();
    let interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt.cancel();
        }
    });

    let poller = JobPoller::new(config.poll_config());
    let job = RemoteJob::new(client, resource, job_id);
    let result = poll_job(&poller, &job, &cancel, |progress| {
        println!(
            "[{}] {}{}",
            progress.attempt,
            progress.status,
            progress
                .detail
                .as_deref()
                .map(|d| format!(": {}", d))
                .unwrap_or_default()
        );
    })
    .await;

    match result {
        Ok(version) => {
            println!(
                "Generation complete, document updated at {}",
                version.last_modified_at.to_rfc3339()
            );
            Ok(())
        }
        Err(e) if !e.is_user_visible() => {
            println!("Stopped watching");
            Ok(())
        }
        Err(e) => Err(e).context("Generation did not complete"),
    }
}
