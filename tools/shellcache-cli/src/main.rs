//! Command-line driver for the ShellCache offline asset cache.
//!
//! Provides commands for:
//! - Installing a generation from a worker config into an on-disk store
//! - Purging every generation but the configured one
//! - Answering a single request the way the worker would
//! - Listing what a store holds
//!
//! ## Usage
//!
//! ```bash
//! # Precache the manifest and make the generation current
//! shellcache install --config sw.json --store .cache/ --report install.json
//!
//! # Serve a navigation with the network switched off
//! shellcache fetch https://app.example/quiz --config sw.json --store .cache/ --navigate --offline
//!
//! # Show generations and entry counts
//! shellcache list --store .cache/
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use shellcache_common::{init_logging, LogConfig, LogFormat};
use shellcache_net::{Fetcher, HttpFetcher, LoaderConfig, OfflineFetcher, Request};
use shellcache_sw::{
    CacheStorage, DiskStorage, OfflineWorker, Registration, ResolvedConfig, WorkerConfig,
};
use tracing::debug;
use url::Url;

#[derive(Parser)]
#[command(name = "shellcache")]
#[command(about = "Offline asset cache for single-page applications")]
struct Cli {
    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log output format (pretty, compact, json)
    #[arg(long, global = true, default_value = "pretty")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Precache the manifest into the configured generation, then activate it
    Install {
        /// Worker config (JSON)
        #[arg(short, long)]
        config: PathBuf,
        /// Store directory
        #[arg(short, long)]
        store: PathBuf,
        /// Output JSON report path
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Delete every generation except the configured one
    Activate {
        /// Worker config (JSON)
        #[arg(short, long)]
        config: PathBuf,
        /// Store directory
        #[arg(short, long)]
        store: PathBuf,
    },

    /// Answer one request through the fetch policy (exits 1 unless the status is 2xx)
    Fetch {
        /// Absolute URL to request
        url: Url,
        /// Worker config (JSON)
        #[arg(short, long)]
        config: PathBuf,
        /// Store directory
        #[arg(short, long)]
        store: PathBuf,
        /// Treat the request as a page navigation
        #[arg(long)]
        navigate: bool,
        /// Reject every network request
        #[arg(long)]
        offline: bool,
        /// Write the response body here
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List generations and their entries
    List {
        /// Store directory
        #[arg(short, long)]
        store: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::debug()
    } else {
        LogConfig::default()
    };
    init_logging(&log_config.with_format(cli.log_format));

    match cli.command {
        Commands::Install {
            config,
            store,
            report,
        } => {
            let config = WorkerConfig::load(&config).await?;
            let resolved = config.resolve()?;
            let storage = Arc::new(DiskStorage::new(&store).await?);
            let fetcher = network(&resolved, false)?;

            let (registration, _events) = Registration::new(storage, fetcher);
            let result = registration.register(&config).await?;

            println!("Installed generation {}", result.generation);
            println!("  Cached: {}", result.cached.len());
            println!("  Failed: {}", result.failed.len());
            for (url, reason) in &result.failed {
                println!("    {url}: {reason}");
            }

            if let Some(report_path) = report {
                let json = serde_json::to_string_pretty(&result)?;
                tokio::fs::write(&report_path, json).await?;
                println!("Report written to: {}", report_path.display());
            }
        }

        Commands::Activate { config, store } => {
            let config = WorkerConfig::load(&config).await?;
            let resolved = config.resolve()?;
            let worker = open_worker(&config, &store, network(&resolved, true)?).await?;

            let purge = worker.activate().await?;
            println!("Current generation: {}", worker.generation());
            println!("  Deleted: {}", purge.deleted.join(", "));
            for (name, reason) in &purge.failed {
                println!("  Not deleted {name}: {reason}");
            }

            if !purge.is_clean() {
                std::process::exit(1);
            }
        }

        Commands::Fetch {
            url,
            config,
            store,
            navigate,
            offline,
            output,
        } => {
            let config = WorkerConfig::load(&config).await?;
            let resolved = config.resolve()?;
            let worker = open_worker(&config, &store, network(&resolved, offline)?).await?;

            let request = if navigate {
                Request::navigate(url)
            } else {
                Request::get(url)
            };

            let outcome = worker.handle_fetch(&request).await?;
            let (source, strategy) = (outcome.source, outcome.strategy);
            let response = outcome.settle().await;

            println!("Status:   {}", response.status);
            println!("Type:     {}", response.response_type.as_str());
            println!("Strategy: {}", strategy.as_str());
            println!("Source:   {source:?}");
            println!("Bytes:    {}", response.body.len());

            if let Some(path) = output {
                tokio::fs::write(&path, &response.body).await?;
                println!("Body written to: {}", path.display());
            }

            if !response.ok() {
                std::process::exit(1);
            }
        }

        Commands::List { store } => {
            list(&store).await?;
        }
    }

    Ok(())
}

fn network(config: &ResolvedConfig, offline: bool) -> Result<Arc<dyn Fetcher>, Box<dyn std::error::Error>> {
    if offline {
        debug!("Network disabled");
        return Ok(Arc::new(OfflineFetcher));
    }
    let fetcher = HttpFetcher::new(LoaderConfig::new(config.origin.clone()))?;
    Ok(Arc::new(fetcher))
}

async fn open_worker(
    config: &WorkerConfig,
    store: &Path,
    fetcher: Arc<dyn Fetcher>,
) -> Result<OfflineWorker, Box<dyn std::error::Error>> {
    let storage = Arc::new(DiskStorage::new(store).await?);
    Ok(OfflineWorker::new(config, storage, fetcher)?)
}

async fn list(store: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let storage = DiskStorage::new(store).await?;
    let names = storage.keys().await?;

    if names.is_empty() {
        println!("No generations in {}", store.display());
        return Ok(());
    }

    for name in names {
        let keys = storage.entry_keys(&name).await?;
        println!("{name} ({} entries)", keys.len());
        for key in keys {
            println!("  {key}");
        }
    }

    Ok(())
}
