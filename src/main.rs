use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use edge_scan_rs::classifier::ColoTable;
use edge_scan_rs::config::{default_targets, RunProfile, ScanConfig};
use edge_scan_rs::orchestrator::{BatchOrchestrator, RunReport};
use edge_scan_rs::persist::{self, DirectorySink};
use edge_scan_rs::ports;
use edge_scan_rs::prober::{DiagnosticTarget, ProbeSettings, RetryPolicy, TcpProber};
use edge_scan_rs::quota::StopPolicy;
use edge_scan_rs::sources::{HttpFetcher, SourceSpec};
use edge_scan_rs::types::QuotaTarget;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// edge-scan-rs: find low-latency edge IPs per country under per-country quotas.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "edge-scan-rs",
    version,
    about = "Find low-latency edge IPs per country under per-country quotas.",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Subcommand)]
enum Command {
    /// Expand sources, probe candidates in batches and write per-country results.
    Scan(ScanArgs),
    /// Combine result directories from independent runs into one.
    Merge(MergeArgs),
}

#[derive(Debug, Clone, Args)]
struct ScanArgs {
    /// Country quotas as CC=N, comma separated or repeated. Defaults to US=20,HK=20,JP=5,SG=5.
    #[arg(long = "target", value_delimiter = ',')]
    targets: Vec<QuotaTarget>,

    /// Ports to probe (comma list, ranges allowed) or a path to a ports file.
    #[arg(long, env = "EDGE_SCAN_PORTS", default_value = "8443")]
    ports: String,

    /// Max probes in flight.
    #[arg(long, env = "EDGE_SCAN_CONCURRENCY", default_value_t = 30)]
    concurrency: usize,

    /// Candidates per batch. Defaults to the concurrency limit.
    #[arg(long = "batch-size")]
    batch_size: Option<usize>,

    /// Results slower than this are discarded.
    #[arg(long = "max-latency-ms", default_value_t = 2000)]
    max_latency_ms: u64,

    /// Candidate pool ceiling. Defaults to the profile's.
    #[arg(long = "max-pool")]
    max_pool: Option<usize>,

    /// Directory for per-country result files.
    #[arg(long = "output-dir", env = "EDGE_SCAN_OUTPUT_DIR", default_value = "ip_results")]
    output_dir: PathBuf,

    /// TCP connect timeout in milliseconds.
    #[arg(long = "connect-timeout-ms", default_value_t = 2500)]
    connect_timeout_ms: u64,

    /// TLS handshake plus trace request budget in milliseconds.
    #[arg(long = "diagnostic-timeout-ms", default_value_t = 5000)]
    diagnostic_timeout_ms: u64,

    /// Connection attempts per candidate.
    #[arg(long, default_value_t = 2)]
    attempts: u32,

    /// Pause between attempts in milliseconds.
    #[arg(long = "retry-delay-ms", default_value_t = 100)]
    retry_delay_ms: u64,

    /// Domain whose hex-encoded subdomains answer the trace request.
    #[arg(long = "diagnostic-domain", env = "EDGE_SCAN_DIAGNOSTIC_DOMAIN", default_value = "nip.lfree.org")]
    diagnostic_domain: String,

    #[arg(long = "diagnostic-path", default_value = "cdn-cgi/trace")]
    diagnostic_path: String,

    /// Measure TCP connect time only. Every result classifies as UNKNOWN.
    #[arg(long = "no-diagnostic", default_value_t = false)]
    no_diagnostic: bool,

    /// stop-on-quota, run-all-batches or min-countries=N.
    #[arg(long = "stop-policy", default_value = "stop-on-quota")]
    stop_policy: StopPolicy,

    /// full or ci.
    #[arg(long, env = "EDGE_SCAN_PROFILE", default_value = "full")]
    profile: RunProfile,

    /// Replace the profile's sources; tier:name=url, repeatable.
    #[arg(long = "source")]
    sources: Vec<SourceSpec>,

    /// Source download timeout in seconds. Defaults to the profile's.
    #[arg(long = "source-timeout-secs")]
    source_timeout_secs: Option<u64>,

    /// Seed for sampling and shuffling.
    #[arg(long)]
    seed: Option<u64>,

    /// Continue from results already in the output directory.
    #[arg(long, default_value_t = false)]
    resume: bool,

    /// Also write the run report as pretty JSON to this path.
    #[arg(long)]
    json: Option<PathBuf>,
}

#[derive(Debug, Clone, Args)]
struct MergeArgs {
    /// Result directory, or a parent of several run directories. Repeatable.
    #[arg(long = "input", required = true)]
    inputs: Vec<PathBuf>,

    /// Directory for the merged result files.
    #[arg(long, default_value = "ip_results_merged")]
    output: PathBuf,

    /// Keep at most this many endpoints per country.
    #[arg(long)]
    top: Option<usize>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Scan(args) => run_scan(args).await,
        Command::Merge(args) => run_merge(args),
    }
}

fn load_ports(spec: &str) -> Result<Vec<u16>> {
    let path = Path::new(spec);
    if path.is_file() {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading ports file {}", path.display()))?;
        return ports::parse_ports_str(&text);
    }
    ports::parse_ports_str(spec)
}

fn build_config(args: &ScanArgs) -> Result<ScanConfig> {
    let targets = if args.targets.is_empty() {
        default_targets()
    } else {
        args.targets.clone()
    };
    let diagnostic = (!args.no_diagnostic).then(|| DiagnosticTarget {
        domain: args.diagnostic_domain.clone(),
        path: args.diagnostic_path.clone(),
    });
    let config = ScanConfig {
        targets,
        concurrency: args.concurrency,
        batch_size: args.batch_size,
        ports: load_ports(&args.ports)?,
        max_latency_ms: args.max_latency_ms,
        max_pool: args.max_pool,
        output_dir: args.output_dir.clone(),
        probe: ProbeSettings {
            connect_timeout: Duration::from_millis(args.connect_timeout_ms),
            diagnostic_timeout: Duration::from_millis(args.diagnostic_timeout_ms),
            retry: RetryPolicy {
                attempts: args.attempts,
                delay: Duration::from_millis(args.retry_delay_ms),
            },
            diagnostic,
        },
        stop_policy: args.stop_policy,
        profile: args.profile,
        sources: (!args.sources.is_empty()).then(|| args.sources.clone()),
        seed: args.seed,
        resume: args.resume,
    };
    config.validate()?;
    Ok(config)
}

async fn run_scan(args: ScanArgs) -> Result<()> {
    let config = build_config(&args)?;

    println!("edge-scan-rs configuration:");
    println!(
        "  targets      : {}",
        config
            .targets
            .iter()
            .map(|t| format!("{}={}", t.country, t.target_count))
            .collect::<Vec<_>>()
            .join(",")
    );
    println!("  ports        : {:?}", config.ports);
    println!("  concurrency  : {}", config.concurrency);
    println!("  batch_size   : {}", config.batch_size());
    println!("  max_latency  : {}ms", config.max_latency_ms);
    println!("  pool ceiling : {}", config.pool_ceiling());
    println!("  profile      : {:?}", config.profile);
    println!("  sources      : {}", config.sources().len());
    println!("  stop policy  : {:?}", config.stop_policy);
    println!("  output       : {}", config.output_dir.display());
    println!(
        "  diagnostic   : {}",
        config
            .probe
            .diagnostic
            .as_ref()
            .map(|d| format!("https://<hex-ip>.{}/{}", d.domain, d.path))
            .unwrap_or_else(|| "<disabled>".to_string())
    );

    let sink = DirectorySink::create(&config.output_dir)
        .with_context(|| format!("preparing output directory {}", config.output_dir.display()))?;
    let previous = if config.resume {
        Some(persist::load_dir(sink.dir()).context("loading previous results")?)
    } else {
        None
    };

    let source_timeout = args
        .source_timeout_secs
        .map(Duration::from_secs)
        .unwrap_or_else(|| config.profile.source_timeout());
    let fetcher = Arc::new(HttpFetcher::new(source_timeout)?);
    let prober = Arc::new(TcpProber::new(config.probe.clone())?);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping after the current batch");
                cancel.cancel();
            }
        });
    }

    let mut orchestrator = BatchOrchestrator::new(config, fetcher, prober, Arc::new(ColoTable::default()))
        .with_sink(Box::new(sink))
        .with_cancel(cancel);
    if let Some(previous) = previous {
        orchestrator.resume_from(&previous);
    }

    let report = orchestrator.run().await?;
    print_results_table(&report);

    if let Some(path) = args.json.as_deref() {
        if let Err(e) = write_report_json(path, &report) {
            eprintln!("Failed to write JSON to {}: {}", path.display(), e);
        } else {
            println!("Wrote JSON report to {}", path.display());
        }
    }
    Ok(())
}

fn run_merge(args: MergeArgs) -> Result<()> {
    let summary = persist::merge_dirs(&args.inputs, &args.output, args.top)
        .with_context(|| format!("merging into {}", args.output.display()))?;
    info!(output = %args.output.display(), total = summary.total, "merge complete");
    print!("{}", summary.to_text());
    Ok(())
}

fn print_results_table(report: &RunReport) {
    let mut ep_w = "endpoint".len();
    for c in &report.countries {
        for r in &c.results {
            ep_w = ep_w.max(r.endpoint().to_string().len());
        }
    }
    let cc_w = "country".len();
    let src_w = "source".len().max("official".len());
    let lat_w = "latency_ms".len();

    let t = &report.totals;
    println!(
        "\nStopped: {:?} after {}/{} batches (pool {})",
        report.stop_reason, report.batches_run, report.batches_total, report.pool_size
    );
    println!(
        "Probed: {}  ok: {}  failed: {}  invalid: {}  too slow: {}  off target: {}  over quota: {}  accepted: {}",
        t.probed, t.succeeded, t.failed, t.invalid, t.too_slow, t.off_target, t.over_quota, t.accepted
    );
    println!(
        "{:<cc_w$}  {:<ep_w$}  {:<src_w$}  {:>lat_w$}",
        "country", "endpoint", "source", "latency_ms"
    );
    println!("{:-<cc_w$}  {:-<ep_w$}  {:-<src_w$}  {:-<lat_w$}", "", "", "", "");
    for c in &report.countries {
        for r in &c.results {
            println!(
                "{:<cc_w$}  {:<ep_w$}  {:<src_w$}  {:>lat_w$.0}",
                c.country,
                r.endpoint().to_string(),
                r.source_type.label(),
                r.latency_ms
            );
        }
    }
    for c in &report.countries {
        println!("{}: {}/{}", c.country, c.results.len(), c.target);
    }
    if !report.unsatisfied.is_empty() {
        println!("Unsatisfied: {}", report.unsatisfied.join(", "));
    }
}

fn write_report_json(path: &Path, report: &RunReport) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, report)?;
    Ok(())
}
