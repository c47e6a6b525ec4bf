//! Smoke test harness for the swcache offline caching engine.
//!
//! Runs the engine in-process against a live origin and reports what it
//! served from where.
//!
//! ## Usage
//!
//! ```bash
//! # Install the worker against a dev server and fetch two paths twice
//! swcache-smoke run --origin http://localhost:3000 /_next/static/chunk.js /logo-dark.svg
//!
//! # Same, with a custom engine config and JSON logs
//! swcache-smoke --log-format json run --origin http://localhost:3000 --config sw.json /
//!
//! # Print the effective engine config
//! swcache-smoke config --config sw.json
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use serde::Serialize;
use swcache_common::{init_logging, with_timeout, LogConfig, LogFormat};
use swcache_net::{HttpFetcher, LoaderConfig, Request};
use swcache_sw::{EngineConfig, ServiceWorkerContainer, WorkerState};
use tracing::info;
use url::Url;

#[derive(Parser)]
#[command(name = "swcache-smoke")]
#[command(about = "Smoke test harness for the swcache offline caching engine")]
struct Cli {
    /// Log output format (pretty, compact, json)
    #[arg(long, global = true, default_value = "compact")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register the engine against an origin and fetch paths through it
    Run {
        /// Origin to serve, e.g. http://localhost:3000
        #[arg(long)]
        origin: String,
        /// Engine config JSON file
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Issue the requests as navigations
        #[arg(long)]
        navigate: bool,
        /// Per-request network timeout in seconds
        #[arg(long, default_value = "30")]
        timeout_secs: u64,
        /// Origin-relative paths to fetch
        #[arg(default_value = "/")]
        paths: Vec<String>,
    },

    /// Validate and print the effective engine config
    Config {
        /// Engine config JSON file
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

/// One fetch through the engine.
#[derive(Debug, Serialize)]
struct FetchRecord {
    path: String,
    pass: u8,
    status: Option<u16>,
    source: Option<String>,
    bytes: Option<usize>,
    error: Option<String>,
}

#[derive(Debug, Serialize)]
struct SmokeSummary {
    origin: String,
    version: String,
    worker_state: Option<String>,
    fetches: Vec<FetchRecord>,
    namespaces: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(LogConfig::default().with_format(cli.log_format))?;

    match cli.command {
        Commands::Run {
            origin,
            config,
            navigate,
            timeout_secs,
            paths,
        } => {
            let summary = run(&origin, config.as_deref(), navigate, timeout_secs, &paths).await?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }

        Commands::Config { config } => {
            let config = load_config(config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => Ok(EngineConfig::default()),
    }
}

async fn run(
    origin: &str,
    config: Option<&Path>,
    navigate: bool,
    timeout_secs: u64,
    paths: &[String],
) -> anyhow::Result<SmokeSummary> {
    let config = load_config(config)?;
    let origin = Url::parse(origin).with_context(|| format!("invalid origin {origin}"))?;
    let timeout = Duration::from_secs(timeout_secs);

    let fetcher = HttpFetcher::new(LoaderConfig {
        timeout,
        ..LoaderConfig::default()
    })?;
    let container = ServiceWorkerContainer::in_memory(origin.clone(), Arc::new(fetcher));

    container.register(config.clone()).await?;
    // Precache may retry every asset, so allow a few request timeouts.
    with_timeout(timeout * 4, || container.settle()).await?;

    let worker = container.active_worker().await;
    match &worker {
        Some(worker) if worker.state() == WorkerState::Activated => {
            info!(version = worker.version(), "Worker active");
        }
        _ => bail!("worker did not activate; see logs for install errors"),
    }

    let (client, _events) = container.connect_client(origin.clone()).await;
    let mut fetches = Vec::with_capacity(paths.len() * 2);
    for path in paths {
        let url = origin
            .join(path)
            .with_context(|| format!("invalid path {path}"))?;
        let request = if navigate {
            Request::navigate(url)
        } else {
            Request::get(url)
        };

        for pass in 1..=2 {
            let record = match container.fetch(client, &request).await {
                Ok(response) => FetchRecord {
                    path: path.clone(),
                    pass,
                    status: Some(response.status.as_u16()),
                    source: Some(format!("{:?}", response.source)),
                    bytes: Some(response.body().len()),
                    error: None,
                },
                Err(e) => FetchRecord {
                    path: path.clone(),
                    pass,
                    status: None,
                    source: None,
                    bytes: None,
                    error: Some(e.to_string()),
                },
            };
            fetches.push(record);
        }
    }

    with_timeout(timeout, || container.settle()).await?;
    let namespaces = container.store().list_names().await?;

    Ok(SmokeSummary {
        origin: origin.to_string(),
        version: config.cache_version,
        worker_state: worker.map(|w| w.state().to_string()),
        fetches,
        namespaces,
    })
}
