use anyhow::{Context, Result};
use cachetime_core::{Crawl, Verdict};
use cachetime_probe::analysis::Analyser;
use cachetime_probe::buster::CacheBuster;
use cachetime_probe::crawler::Crawler;
use cachetime_probe::experiment::{Experiment, ExperimentConfig, ExperimentKind};
use cachetime_probe::store::Store;
use cachetime_probe::PlainClient;
use clap::{Args, Parser, Subcommand};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "cachetime")]
#[command(about = "Detect shared web caches and web cache deception with HTTP/2 timeless timing", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Does this site have a cache? Probes cacheability first, then
    /// corroborates with the timing oracle.
    Preliminary(ScanCmd),
    /// Discover caches masked by header scrubbing: timing evidence only,
    /// no cacheability pre-check.
    HiddenCaches(ScanCmd),
    /// Scan for Web Cache Deception across the payload modes.
    Wcd(ScanCmd),
    /// Re-run the analyser over a saved output bundle and write the
    /// per-cell verdicts.
    Analyse(AnalyseCmd),
}

#[derive(Args, Debug)]
struct ScanCmd {
    /// Target site (e.g. example.com).
    #[arg(long)]
    target: String,
    /// Request pairs per measurement round.
    #[arg(long, default_value_t = 10)]
    requests: usize,
    /// Maximum URLs to test per domain.
    #[arg(long, default_value_t = 10)]
    max: usize,
    /// Maximum number of (sub)domains to crawl.
    #[arg(long, default_value_t = 10)]
    domains: usize,
    /// JSON file holding cookies to send ({"name": "value", ...}).
    #[arg(long)]
    cookie: Option<PathBuf>,
    /// Comma-separated regexes; matching URLs are never crawled.
    #[arg(long)]
    exclude: Option<String>,
    /// Test the site even if a previous run marked it tested.
    #[arg(long)]
    retest: bool,
    /// Seed the PRNG with 42 so token streams are reproducible.
    #[arg(long)]
    reproducible: bool,
    /// Verbose logging.
    #[arg(long)]
    debug: bool,
    /// Milliseconds between request pairs.
    #[arg(long, default_value_t = 100)]
    inter_request_ms: u64,
    /// Multiplier applied to negative fixed-round samples before the
    /// t-test.
    #[arg(long, default_value_t = 5.0)]
    amplification: f64,
    /// Identicality tolerance for the WCD pre-check (0 = byte-identical).
    #[arg(long, default_value_t = 0.0)]
    noise: f64,
    /// Directory holding logs/, stats/, output/ and analysis/.
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,
}

#[derive(Args, Debug)]
struct AnalyseCmd {
    /// Saved bundle (output/<site>-<timestamp>.json).
    file: PathBuf,
    /// Request-pair count the bundle was gathered with (names the
    /// analysis artifact).
    #[arg(long, default_value_t = 10)]
    requests: usize,
    /// Multiplier applied to negative fixed-round samples before the
    /// t-test.
    #[arg(long, default_value_t = 5.0)]
    amplification: f64,
    /// Re-analyse even if an artifact for this site already exists.
    #[arg(long)]
    retest: bool,
    /// Verbose logging.
    #[arg(long)]
    debug: bool,
    /// Directory holding logs/, stats/, output/ and analysis/.
    #[arg(long, default_value = ".")]
    out_dir: PathBuf,
}

fn init_tracing(debug: bool) {
    let default = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn load_cookies(path: &Path) -> Result<BTreeMap<String, String>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading cookie file {}", path.display()))?;
    let cookies: BTreeMap<String, String> =
        serde_json::from_str(&text).with_context(|| "cookie file must be a JSON object")?;
    Ok(cookies)
}

fn site_of(target: &str) -> String {
    target
        .trim()
        .trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .to_string()
}

async fn run_scan(kind: ExperimentKind, args: ScanCmd) -> Result<()> {
    init_tracing(args.debug);
    let site = site_of(&args.target);
    let store = Store::new(&args.out_dir);

    if !args.retest {
        if let Some(stats) = store.load_stats(&site)? {
            if stats.tested {
                tracing::info!(%site, "already tested, pass --retest to repeat");
                return Ok(());
            }
        }
    }

    let cookies = match &args.cookie {
        Some(path) => load_cookies(path)?,
        None => BTreeMap::new(),
    };

    let mut crawler = Crawler::new(&site, args.max, args.domains);
    if let Some(patterns) = &args.exclude {
        crawler = crawler.with_exclusions(patterns)?;
    }
    if !args.retest {
        if let Some(logs) = store.load_logs(&site)? {
            crawler.restore(logs.queue, logs.visited);
        }
    }
    crawler.add_to_queue(&format!("https://{site}/"));

    let config = ExperimentConfig {
        request_pairs: args.requests,
        inter_request_time: Duration::from_millis(args.inter_request_ms),
        noise: args.noise,
        ..Default::default()
    };
    let analyser = Analyser {
        amplification: args.amplification,
        ..Default::default()
    };
    let buster = CacheBuster::new(args.reproducible.then_some(42));
    let client = PlainClient::new()?;

    let mut experiment = Experiment::new(kind, &site, client, config, analyser, buster, cookies);
    if !args.retest {
        if let Some(stats) = store.load_stats(&site)? {
            experiment.restore_stats(stats);
        }
    }

    tokio::select! {
        result = experiment.run_site(&mut crawler, Some(&store)) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("interrupted, persisting accumulated state");
        }
    }
    experiment.checkpoint(&crawler, &store)?;

    let stats = experiment.stats();
    if let Some(vulnerable) = stats.vulnerable {
        println!(
            "{site}: {}",
            if vulnerable {
                "VULNERABLE to web cache deception"
            } else {
                "no web cache deception found"
            }
        );
    }
    if let Some(analysis) = &stats.analysis {
        for (url, extensions) in analysis {
            for (extension, modes) in extensions {
                for (mode, verdict) in modes {
                    print_verdict(url, extension, mode, verdict);
                }
            }
        }
    }
    Ok(())
}

fn site_of_bundle(path: &Path) -> String {
    let name = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();
    // Strip the trailing -YYYY-MM-DD-HH-MM-SS stamp.
    match name.split_once("-20") {
        Some((site, _)) => site.to_string(),
        None => name.to_string(),
    }
}

fn run_analyse(args: AnalyseCmd) -> Result<()> {
    init_tracing(args.debug);
    let site = site_of_bundle(&args.file);
    let store = Store::new(&args.out_dir);

    if !args.retest && store.analysed_sites(args.requests).iter().any(|s| *s == site) {
        tracing::info!(%site, "already analysed, pass --retest to repeat");
        return Ok(());
    }

    let bundle = Store::load_bundle(&args.file)?;
    let analyser = Analyser {
        amplification: args.amplification,
        ..Default::default()
    };
    let analysis = analyser.analyse_bundle(&bundle);
    let cells: usize = analysis
        .values()
        .flat_map(|e| e.values())
        .map(|m| m.len())
        .sum();
    if cells == 0 {
        println!("no data for site {site}");
        return Ok(());
    }

    for (url, extensions) in &analysis {
        for (extension, modes) in extensions {
            for (mode, verdict) in modes {
                let qualifier = if cells == 1 {
                    None
                } else {
                    Some(format!("{extension}-{mode}"))
                };
                let path =
                    store.save_analysis(&site, args.requests, qualifier.as_deref(), verdict)?;
                print_verdict(url, extension, mode, verdict);
                println!("{}", path.display());
            }
        }
    }
    Ok(())
}

fn print_rows(rows: &[cachetime_core::AnalysisRow]) {
    println!(
        "| {:>20} | {:^14} | {:^14} |",
        "Time difference (ms)", "Cache Status 1", "Cache Status 2"
    );
    for row in rows {
        println!(
            "| {:>20.2} | {:^14} | {:^14} |",
            row.time_diff,
            row.cache_status_1.to_string(),
            row.cache_status_2.to_string()
        );
    }
}

fn print_verdict(url: &str, extension: &str, mode: &str, verdict: &Verdict) {
    let spacing = "=".repeat(17);
    println!("{url} extension={extension:?} mode={mode}");
    println!("{spacing} Time differences w/o a cache {spacing}");
    print_rows(&verdict.randomized);
    println!("{spacing} Time differences w/ a cache  {spacing}");
    print_rows(&verdict.fixed);
    println!("{} Prediction {}", "=".repeat(22), "=".repeat(17));
    println!("| {:<12} | {:^14} |", "Label", verdict.label.to_string());
    println!(
        "| {:<12} | {:^14} |",
        "Statistics",
        verdict.statistics_prediction.to_string()
    );
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Preliminary(args) => run_scan(ExperimentKind::Preliminary, args).await,
        Commands::HiddenCaches(args) => run_scan(ExperimentKind::HiddenCaches, args).await,
        Commands::Wcd(args) => run_scan(ExperimentKind::Wcd, args).await,
        Commands::Analyse(args) => run_analyse(args),
    }
}
