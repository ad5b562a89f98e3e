use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;

use edgecache_config::logging::{init_logging, LogLevel};
use edgecache_config::{log_daemon_error, log_daemon_info, log_daemon_warn, Config};
use edgecache_fetch::{
    CacheController, CacheOutcome, CacheRequest, EvictionJob, EvictionSettings, FetchSettings,
    HttpOrigin, OriginSettings,
};
use edgecache_push::{InvalidationListener, PushChannel, PushSettings};
use edgecache_store::{
    identify, CacheStore, ConcurrencyGuard, DiskAdmission, StatvfsProbe, StorePaths,
};

#[derive(Parser)]
#[command(name = "edgecached")]
#[command(version, about = "Local caching proxy daemon", long_about = None)]
struct Cli {
    /// Log level (error, warn, info, debug, trace)
    #[arg(long, global = true, env = "EDGECACHE_LOG", default_value = "info")]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the daemon (default)
    Start,

    /// Serve one URL through the cache and report the outcome
    Fetch {
        url: String,

        /// Byte range, e.g. `bytes=0-99`
        #[arg(long)]
        range: Option<String>,

        /// Write the served bytes here
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Run one eviction pass
    Sweep,

    /// Print the canonical identity and cache key of a URL
    Resolve { url: String },

    /// Print the default configuration
    Config,
}

/// Components shared by every command that touches the cache.
struct Runtime {
    config: Config,
    store: Arc<CacheStore>,
    guard: Arc<ConcurrencyGuard>,
}

impl Runtime {
    fn open() -> Result<Self> {
        let config = Config::load().context("Failed to load config")?;
        let store = CacheStore::open(&StorePaths::from(&config.cache))
            .context("Failed to open cache store")?;
        let guard = ConcurrencyGuard::new(config.cache.space_backoff());
        Ok(Self {
            config,
            store: Arc::new(store),
            guard: Arc::new(guard),
        })
    }

    fn controller(&self) -> Result<CacheController> {
        let origin = HttpOrigin::new(&OriginSettings {
            proxy: self.config.proxy.effective().map(str::to_string),
            connect_timeout: self.config.cache.request_timeout(),
            ..Default::default()
        })
        .context("Failed to build HTTP client")?;
        let admission = DiskAdmission::new(Arc::new(StatvfsProbe::new(self.store.cache_dir())));

        Ok(CacheController::new(
            self.store.clone(),
            Arc::new(admission),
            self.guard.clone(),
            Arc::new(origin),
            FetchSettings::from(&self.config.cache),
        ))
    }

    fn eviction(&self) -> EvictionJob {
        EvictionJob::new(
            self.store.clone(),
            self.guard.clone(),
            EvictionSettings::from(&self.config.eviction),
        )
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level);

    match cli.command.unwrap_or(Commands::Start) {
        Commands::Start => start_daemon().await?,
        Commands::Fetch { url, range, out } => fetch_once(url, range, out).await?,
        Commands::Sweep => sweep_once()?,
        Commands::Resolve { url } => {
            let identity = identify(&url)?;
            println!("identity: {}", identity.canonical);
            println!("key:      {}", identity.key.to_hex());
            if let Some(object) = identity.storage {
                println!("bucket:   {}", object.bucket);
                println!("path:     {}", object.path);
            }
        }
        Commands::Config => print!("{}", Config::default_toml()),
    }

    Ok(())
}

async fn start_daemon() -> Result<()> {
    let runtime = Runtime::open()?;
    let config = &runtime.config;

    match runtime
        .store
        .clean_staging(std::time::Duration::from_secs(config.eviction.staging_max_age_secs))
    {
        Ok(0) => {}
        Ok(n) => log_daemon_info!(removed = n, "Removed leftover staging files"),
        Err(e) => log_daemon_warn!(error = %e, "Staging cleanup failed"),
    }

    let eviction = Arc::new(runtime.eviction()).spawn(std::time::Duration::from_secs(
        config.eviction.interval_secs.max(1),
    ));

    // Requests are routed outside this binary, so no paths are registered
    // here; heartbeats and reconnects still drive full resyncs.
    let push = match PushSettings::from_config(&config.push) {
        Ok(settings) => {
            let display_id = settings.display_id.clone();
            let offline_grace = settings.offline_grace;
            let channel = Arc::new(PushChannel::new(settings));
            let listener = Arc::new(InvalidationListener::new(
                runtime.store.clone(),
                runtime.guard.clone(),
                channel.outbox(),
                Some(display_id),
                offline_grace,
            ));
            Some(channel.spawn(listener))
        }
        Err(e) => {
            log_daemon_info!(reason = %e, "Push invalidation disabled");
            None
        }
    };
    log_daemon_info!(
        cache_dir = %config.cache.cache_dir.display(),
        staleness_secs = config.cache.staleness_secs,
        "edgecached started"
    );

    tokio::select! {
        _ = signal::ctrl_c() => {
            log_daemon_info!("Shutting down");
        }
    }

    eviction.abort();
    if let Some(push) = push {
        push.abort();
    }
    if let Err(e) = runtime.store.meta().sync() {
        log_daemon_error!(error = %e, "Failed to flush metadata");
    }
    Ok(())
}

async fn fetch_once(url: String, range: Option<String>, out: Option<PathBuf>) -> Result<()> {
    let runtime = Runtime::open()?;
    let controller = runtime.controller()?;

    let mut request = CacheRequest::new(url);
    if let Some(range) = range {
        request = request.with_range(range);
    }

    let outcome = controller.fetch(&request).await;
    println!("{} {}", outcome.status_code(), outcome.label());
    if let CacheOutcome::Fallback { cause, .. } = &outcome {
        println!("cause: {}", cause);
    }

    match outcome.served() {
        Some(served) => {
            println!("key:  {}", served.key.to_hex());
            println!("file: {}", served.path.display());
            println!("size: {} ({} served)", served.size, served.content_length());
            if let Some(range) = served.range {
                println!("range: {}", range.content_range(served.size));
            }
            if let Some(out) = out {
                let data = served.read().await?;
                tokio::fs::write(&out, data)
                    .await
                    .with_context(|| format!("Failed to write {}", out.display()))?;
            }
            Ok(())
        }
        None => match outcome.error() {
            Some(e) => Err(anyhow::anyhow!("{}", e)),
            None => Ok(()),
        },
    }
}

fn sweep_once() -> Result<()> {
    let runtime = Runtime::open()?;
    let report = runtime.eviction().run_once()?;
    println!(
        "enumerated {} processed {} evicted {} records {} failed {}",
        report.enumerated, report.processed, report.evicted, report.records_evicted, report.failed
    );
    let stats = runtime.store.stats()?;
    println!(
        "cache holds {} files, {} bytes ({} staging)",
        stats.entry_count, stats.total_bytes, stats.staging_count
    );
    Ok(())
}
