use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use proxy_dispatch::{
    config::{parse_duration, resolve_checker_nodes, TlsFiles, DEFAULT_CHECKER_ADDR, DEFAULT_NODE_TAG},
    CheckResult, CheckStatus, DispatchEngine, DispatchMode, EngineConfig, FanOut, GrpcConnector,
    TransportOptions,
};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Distributed proxy check dispatcher for remote checker nodes
#[derive(Parser)]
#[command(name = "proxy-dispatch", version)]
#[command(about = "Distributed proxy check dispatcher for remote checker nodes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Checker nodes as addr:tag,addr:tag
    #[arg(long, env = "GRPC_CHECKER_NODES")]
    nodes: Option<String>,

    /// Checker address used when no node list is given
    #[arg(long, env = "GRPC_CHECKER_SERVICE_ADDR", default_value = DEFAULT_CHECKER_ADDR)]
    service_addr: String,

    /// Tag of the fallback checker node
    #[arg(long, env = "GRPC_CHECKER_NODE_TAG", default_value = DEFAULT_NODE_TAG)]
    node_tag: String,

    /// Default job timeout (e.g. 30s, 5m)
    #[arg(long, env = "GRPC_TIMEOUT", default_value = "5m", value_parser = parse_duration)]
    timeout: Duration,

    /// Items processed at once (0 = 100)
    #[arg(long, env = "GRPC_MAX_CONCURRENT", default_value = "0")]
    max_concurrent: usize,

    /// Send every item to every node and merge the verdicts
    #[arg(long, env = "GRPC_AGGREGATE_MODE")]
    aggregate: bool,

    /// Concurrency policy for sharded mode (bounded, unbounded)
    #[arg(long, env = "GRPC_SHARD_FAN_OUT", default_value = "bounded")]
    fan_out: FanOut,

    /// API key sent as x-api-key metadata
    #[arg(long, env = "GRPC_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Client certificate for TLS
    #[arg(long, env = "GRPC_TLS_CERT_FILE")]
    tls_cert_file: Option<PathBuf>,

    /// Client key for TLS
    #[arg(long, env = "GRPC_TLS_KEY_FILE")]
    tls_key_file: Option<PathBuf>,

    /// CA certificate; enables TLS
    #[arg(long, env = "GRPC_TLS_CA_FILE")]
    tls_ca_file: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info", global = true)]
    log_level: String,

    /// Log output format
    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "pretty", global = true)]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Check items from a file, one per line
    Check {
        /// Input file containing proxy configs
        input: PathBuf,
        /// Print each result as a JSON line
        #[arg(long)]
        json: bool,
        /// Job deadline, overriding the default timeout
        #[arg(long, value_parser = parse_duration)]
        deadline: Option<Duration>,
    },
    /// Probe every checker node
    Health,
    /// Show engine and checker node counters
    Stats {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Pretty,
    Compact,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_logging(&cli)?;

    let engine = DispatchEngine::<GrpcConnector>::connect(engine_config(&cli), transport_options(&cli)?)
        .await
        .context("Failed to connect to checker nodes")?;

    let result = match &cli.command {
        Commands::Check {
            input,
            json,
            deadline,
        } => run_check(&engine, input, *json, *deadline).await,
        Commands::Health => run_health(&engine).await,
        Commands::Stats { json } => run_stats(&engine, *json).await,
    };

    if let Err(e) = engine.close().await {
        warn!(error = %e, "Failed to close checker connections");
    }

    result
}

fn init_logging(cli: &Cli) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let fmt_layer = match cli.log_format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_target(true)
            .with_writer(std::io::stderr)
            .boxed(),
        LogFormat::Pretty => fmt::layer().pretty().with_writer(std::io::stderr).boxed(),
        LogFormat::Compact => fmt::layer().compact().with_writer(std::io::stderr).boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

    Ok(())
}

fn engine_config(cli: &Cli) -> EngineConfig {
    let nodes = resolve_checker_nodes(cli.nodes.as_deref(), &cli.service_addr, &cli.node_tag);
    let mode = if cli.aggregate {
        DispatchMode::Replicated
    } else {
        DispatchMode::Sharded
    };

    EngineConfig::new()
        .with_nodes(nodes)
        .with_legacy_addr(cli.service_addr.clone())
        .with_timeout(cli.timeout)
        .with_concurrency(cli.max_concurrent)
        .with_mode(mode)
        .with_shard_fan_out(cli.fan_out)
}

fn transport_options(cli: &Cli) -> Result<TransportOptions> {
    let non_empty = |path: &Option<PathBuf>| path.clone().filter(|p| !p.as_os_str().is_empty());
    let tls = TlsFiles {
        cert_file: non_empty(&cli.tls_cert_file),
        key_file: non_empty(&cli.tls_key_file),
        ca_file: non_empty(&cli.tls_ca_file),
    }
    .load()?;

    let mut options = TransportOptions::new().with_api_key(cli.api_key.as_deref().unwrap_or_default())?;
    if let Some(tls) = tls {
        options = options.with_tls(tls);
    }
    Ok(options)
}

fn load_items(path: &Path) -> Result<Vec<String>> {
    let content = std::fs::read_to_string(path).with_context(|| format!("Failed to read {:?}", path))?;
    Ok(content
        .lines()
        .map(str::trim)
        // Skip empty lines and comments
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

async fn run_check(
    engine: &DispatchEngine<GrpcConnector>,
    input: &Path,
    json: bool,
    deadline: Option<Duration>,
) -> Result<()> {
    let items = load_items(input)?;
    if items.is_empty() {
        println!("No items found in {:?}", input);
        return Ok(());
    }

    let total = items.len();
    info!(items = total, mode = ?engine.config().mode, "Submitting batch");

    let mut results = engine.submit(items, deadline);
    let mut summary = Summary::default();
    while let Some(result) = results.recv().await {
        summary.record(&result);
        if json {
            println!("{}", serde_json::to_string(&result)?);
        } else {
            print_result(&result);
        }
    }

    if json {
        info!(
            total,
            success = summary.success,
            unavailable = summary.unavailable,
            error = summary.error,
            "Batch complete"
        );
    } else {
        println!(
            "\nResults: {} working, {} unavailable, {} failed (of {})",
            summary.success, summary.unavailable, summary.error, total
        );
    }

    Ok(())
}

#[derive(Default)]
struct Summary {
    success: usize,
    unavailable: usize,
    error: usize,
}

impl Summary {
    fn record(&mut self, result: &CheckResult) {
        match result.status {
            CheckStatus::Success => self.success += 1,
            CheckStatus::Unavailable => self.unavailable += 1,
            CheckStatus::Error => self.error += 1,
        }
    }
}

fn print_result(result: &CheckResult) {
    let nodes: Vec<&str> = result.checker_nodes.iter().map(|tag| tag.as_str()).collect();
    match (&result.details, &result.error) {
        (Some(details), _) => println!(
            "✓ {} ({}ms) {} {} [{}]",
            result.raw,
            result.latency.as_millis(),
            details.protocol,
            details.country_code,
            nodes.join(",")
        ),
        (None, error) => println!(
            "✗ {} - {} {}",
            result.raw,
            result.status,
            error.as_deref().unwrap_or_default()
        ),
    }
}

async fn run_health(engine: &DispatchEngine<GrpcConnector>) -> Result<()> {
    let tags = engine.pool().tags();
    engine.health_check().await.context("Checker health check failed")?;
    println!("All {} checker nodes healthy", tags.len());
    Ok(())
}

async fn run_stats(engine: &DispatchEngine<GrpcConnector>, json: bool) -> Result<()> {
    let stats = engine.stats().await.context("Failed to fetch checker stats")?;
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    println!("Requests: {} total, {} active", stats.total_requests, stats.active_requests);
    println!("Node {}:", stats.node);
    println!("  checks:       {}", stats.remote.total_checks);
    println!("  successful:   {}", stats.remote.successful_checks);
    println!("  failed:       {}", stats.remote.failed_checks);
    println!("  success rate: {:.2}", stats.remote.success_rate);
    println!("  uptime:       {}s", stats.remote.uptime_seconds);
    Ok(())
}
