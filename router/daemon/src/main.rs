//! Router Daemon - Command-line host for the query router
//!
//! # Usage
//!
//! ```bash
//! # One query, printed as JSON
//! router-daemon query "cpu usage"
//!
//! # Mixed load, then the dashboard
//! router-daemon --simulate bench --requests 500 --concurrency 16
//!
//! # Line-oriented service on stdin/stdout
//! router-daemon --config ./router.toml serve
//!
//! # Verbose logging
//! RUST_LOG=debug router-daemon query "disk usage on server 3"
//! ```
//!
//! # Environment Variables
//!
//! - `ROUTER_CONFIG`: configuration file path
//! - `ROUTER_TARGET_MS`, `ROUTER_EXECUTION`, ...: see `router_core::config`
//! - `RUST_LOG`: log filter

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use router_core::engine::{KeywordEngine, PatternEngine, RemoteEngine, ScriptedEngine};
use router_core::{
    load_config_from_path, BackgroundTasks, ConfigOverrides, Engine, EngineFamily, QueryMode,
    QueryRequest, QueryRouter, RouterSettings,
};

/// Latency of the simulated remote engine
const SIMULATED_REMOTE_LATENCY: Duration = Duration::from_millis(120);

/// Query mix used by `bench`
const BENCH_QUERIES: &[&str] = &[
    "cpu usage",
    "memory status",
    "disk usage on server 3",
    "disk usage on server 7",
    "network status",
    "server status",
    "show error logs for api-gateway",
    "how do I restart a service",
    "analyze the database architecture and recommend a strategy",
    "explain why latency increased after the deploy",
];

/// Router Daemon - multi-tier cached query routing
#[derive(Parser, Debug)]
#[command(name = "router-daemon")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, global = true, env = "ROUTER_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Target response time in milliseconds
    #[arg(long, global = true, value_name = "MS")]
    target_ms: Option<u64>,

    /// Execution policy: sequential or raced
    #[arg(long, global = true, value_name = "POLICY")]
    execution: Option<String>,

    /// Engines raced at once when execution is raced
    #[arg(long, global = true, value_name = "N")]
    race_width: Option<usize>,

    /// Use a simulated remote engine instead of the configured endpoint
    #[arg(long, global = true, env = "ROUTER_SIMULATE")]
    simulate: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Route one query and print the response
    Query {
        /// Query text
        text: String,

        /// auto, local or remote
        #[arg(short, long, default_value = "auto")]
        mode: String,
    },

    /// Run a mixed load and print the dashboard
    Bench {
        #[arg(short = 'n', long, default_value_t = 200)]
        requests: usize,

        #[arg(short = 'j', long, default_value_t = 8)]
        concurrency: usize,
    },

    /// Answer queries read line by line from stdin
    Serve,
}

fn init_logging() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("router_daemon=info".parse()?)
                .add_directive("router_core=info".parse()?),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn load_settings(args: &Args) -> Result<RouterSettings> {
    let mut settings = load_config_from_path(args.config.clone())
        .context("Failed to load router configuration")?;

    let mut overrides = ConfigOverrides::new();
    if let Some(ms) = args.target_ms {
        overrides = overrides.with_target_ms(ms);
    }
    if let Some(ref execution) = args.execution {
        overrides = overrides.with_execution(execution.clone());
    }
    if let Some(width) = args.race_width {
        overrides = overrides.with_race_width(width);
    }
    overrides
        .apply(&mut settings)
        .context("Invalid command-line override")?;

    info!(
        source = %settings.source(),
        target_ms = settings.target.as_millis(),
        execution = settings.execution.as_str(),
        "Configuration loaded"
    );
    Ok(settings)
}

fn build_router(settings: RouterSettings, simulate: bool) -> Result<QueryRouter> {
    let mut builder = QueryRouter::builder()
        .engine(Arc::new(PatternEngine::new()))
        .engine(Arc::new(KeywordEngine::new()));

    let remote: Option<Arc<dyn Engine>> = if simulate {
        info!(latency_ms = SIMULATED_REMOTE_LATENCY.as_millis(), "Using simulated remote engine");
        Some(Arc::new(
            ScriptedEngine::new("remote", EngineFamily::Remote).with_latency(SIMULATED_REMOTE_LATENCY),
        ))
    } else if let Some(config) = settings.engines.remote_config() {
        info!(endpoint = %config.endpoint, "Using remote engine");
        Some(Arc::new(RemoteEngine::new(config)?))
    } else {
        warn!("No remote endpoint configured; routing to local engines only");
        None
    };
    if let Some(remote) = remote {
        builder = builder.engine(remote);
    }

    Ok(builder.settings(settings).build()?)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run_query(router: &QueryRouter, text: String, mode: &str) -> Result<()> {
    let mode: QueryMode = mode.parse().map_err(|e| anyhow::anyhow!("{e}"))?;
    let response = router.route(QueryRequest::new(text).with_mode(mode)).await;
    print_json(&response)
}

async fn run_bench(router: &QueryRouter, requests: usize, concurrency: usize) -> Result<()> {
    let warmed = router.warm_up_defaults().await;
    info!(warmed, requests, concurrency, "Starting benchmark");

    let started = Instant::now();
    let ok = stream::iter(0..requests)
        .map(|i| async move {
            let text = BENCH_QUERIES[i % BENCH_QUERIES.len()];
            router.route(QueryRequest::new(text)).await.success
        })
        .buffer_unordered(concurrency.max(1))
        .filter(|success| futures::future::ready(*success))
        .count()
        .await;
    let elapsed = started.elapsed();

    router.run_analysis().await;
    info!(
        requests,
        succeeded = ok,
        elapsed_ms = elapsed.as_millis(),
        "Benchmark complete"
    );
    print_json(&router.dashboard())
}

async fn run_serve(router: Arc<QueryRouter>, settings: &RouterSettings) -> Result<()> {
    let tasks = BackgroundTasks::spawn(Arc::clone(&router), settings.scheduler.clone())?;
    router.warm_up_defaults().await;
    info!("Reading queries from stdin");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(text)) => {
                        if text.trim().is_empty() {
                            continue;
                        }
                        let response = router.route(QueryRequest::new(text)).await;
                        println!("{}", serde_json::to_string(&response)?);
                    }
                    Ok(None) => {
                        info!("End of input, shutting down");
                        break;
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to read from stdin");
                        break;
                    }
                }
            }
        }
    }

    tasks.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging()?;

    info!("Router daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let settings = load_settings(&args)?;
    let router = Arc::new(build_router(settings.clone(), args.simulate)?);

    match args.command {
        Command::Query { text, mode } => run_query(&router, text, &mode).await,
        Command::Bench {
            requests,
            concurrency,
        } => run_bench(&router, requests, concurrency).await,
        Command::Serve => run_serve(router, &settings).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_args_parse() {
        let args = Args::try_parse_from([
            "router-daemon",
            "--target-ms",
            "90",
            "--simulate",
            "query",
            "cpu usage",
            "--mode",
            "local",
        ])
        .unwrap();
        assert_eq!(args.target_ms, Some(90));
        assert!(args.simulate);
        assert!(matches!(args.command, Command::Query { ref mode, .. } if mode == "local"));
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = Args::try_parse_from(["router-daemon", "bench", "--execution", "raced"]).unwrap();
        assert_eq!(args.execution.as_deref(), Some("raced"));
        assert!(matches!(args.command, Command::Bench { requests: 200, .. }));
    }

    #[test]
    fn test_settings_from_file_and_flags() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[router]\ntarget_response_ms = 120").unwrap();

        let args = Args::try_parse_from([
            "router-daemon",
            "--config",
            file.path().to_str().unwrap(),
            "--execution",
            "raced",
            "serve",
        ])
        .unwrap();
        let settings = load_settings(&args).unwrap();
        assert_eq!(settings.target, Duration::from_millis(120));
        assert_eq!(settings.execution.as_str(), "raced");
    }

    #[tokio::test]
    async fn test_simulated_router_answers() {
        let router = build_router(RouterSettings::default(), true).unwrap();
        let response = router.route(QueryRequest::new("cpu usage")).await;
        assert!(response.success);
        assert_eq!(response.engine_used, "local-fast");
    }
}
