use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};

use dealledger::config::{ScrapeSettings, DB_PATH, SNAPSHOT_ROOT};
use dealledger::db;
use dealledger::fetch::{HttpFetcher, PageFetcher, SpiderFetcher};
use dealledger::knowledge::{JsonPatternStore, PatternKnowledgeBase, PatternStore};
use dealledger::listing::Broker;
use dealledger::parser::vertical::VerticalFilter;
use dealledger::scrape::{self, RunStats};
use dealledger::snapshot;

#[derive(Parser)]
#[command(name = "dealledger", about = "Business-for-sale listing aggregator")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum FetcherKind {
    /// spider.cloud rendering API (needs SPIDER_API_KEY)
    Spider,
    /// Plain HTTP, no JavaScript
    Http,
}

#[derive(Subcommand)]
enum Commands {
    /// Scrape every broker in a JSON file
    Run {
        /// JSON array of {id, name, url}
        brokers: PathBuf,
        /// Only scrape the first N brokers
        #[arg(short = 'n', long)]
        limit: Option<usize>,
        /// Keep only listings in this vertical
        #[arg(long, value_enum)]
        vertical: Option<VerticalFilter>,
        /// Sites scraped at once
        #[arg(short = 'c', long)]
        concurrency: Option<usize>,
        /// Page cap per site
        #[arg(long)]
        max_pages: Option<usize>,
        /// Stop scheduling sites after this many seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Keep learned patterns in this JSON file instead of the database
        #[arg(long)]
        pattern_cache: Option<PathBuf>,
        /// Snapshot root directory
        #[arg(short, long, default_value = SNAPSHOT_ROOT)]
        output: PathBuf,
        #[arg(long, value_enum, default_value = "spider")]
        fetcher: FetcherKind,
    },
    /// Show database statistics
    Stats,
    /// Show what the knowledge base has learned
    Patterns {
        /// Read patterns from this JSON file instead of the database
        #[arg(long)]
        pattern_cache: Option<PathBuf>,
        /// Max rows to display
        #[arg(short = 'n', long, default_value = "50")]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let t0 = Instant::now();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run {
            brokers,
            limit,
            vertical,
            concurrency,
            max_pages,
            timeout,
            pattern_cache,
            output,
            fetcher,
        } => {
            let mut settings = ScrapeSettings::from_env()?;
            if vertical.is_some() {
                settings.vertical = vertical;
            }
            if let Some(n) = concurrency {
                settings.concurrency = n;
            }
            if let Some(n) = max_pages {
                settings.max_pages = n;
            }
            if timeout.is_some() {
                settings.run_timeout_secs = timeout;
            }

            let mut brokers = load_brokers(&brokers)?;
            if let Some(n) = limit {
                brokers.truncate(n);
            }
            if brokers.is_empty() {
                println!("No brokers to scrape.");
                return Ok(());
            }

            let conn = db::connect(Path::new(DB_PATH))?;
            db::init_schema(&conn)?;
            let knowledge = Arc::new(open_knowledge(pattern_cache, &settings)?);
            let fetcher: Arc<dyn PageFetcher> = match fetcher {
                FetcherKind::Spider => Arc::new(SpiderFetcher::from_env(settings.request_timeout())?),
                FetcherKind::Http => Arc::new(HttpFetcher::new(settings.request_timeout())?),
            };

            println!(
                "Scraping {} brokers ({} at a time{})...",
                brokers.len(),
                settings.concurrency,
                settings
                    .vertical
                    .map(|v| format!(", vertical: {}", v.label()))
                    .unwrap_or_default()
            );
            let out = scrape::scrape_brokers(brokers, fetcher, Arc::clone(&knowledge), &settings).await?;

            let counts = db::save_run(&conn, &out)?;
            let dir = snapshot::write_snapshot(&output, &out)?;
            print_run(&out.stats);
            println!(
                "\nSaved {} new, {} updated listings. Snapshot: {}",
                counts.inserted,
                counts.updated,
                dir.display()
            );
            let kb = knowledge.stats();
            println!(
                "Knowledge base: {} domains, {} successful scrapes, {} listings learned",
                kb.total_patterns, kb.total_scrapes, kb.total_listings
            );
            Ok(())
        }
        Commands::Stats => {
            let conn = db::connect(Path::new(DB_PATH))?;
            db::init_schema(&conn)?;
            let s = db::get_stats(&conn)?;
            println!("Listings:       {}", s.listings);
            println!("Brokers:        {}", s.brokers);
            println!("With price:     {}", s.with_price);
            println!("With revenue:   {}", s.with_revenue);
            println!("With cash flow: {}", s.with_cash_flow);
            println!("Failures:       {}", s.failures);
            println!("Runs:           {}", s.runs);
            println!("Patterns:       {}", s.patterns);
            if !s.by_vertical.is_empty() {
                println!("\n--- By vertical ---");
                for (vertical, n) in &s.by_vertical {
                    println!("  {:<16} {:>6}", vertical, n);
                }
            }
            if let Some(last) = db::last_run(&conn)? {
                println!(
                    "\nLast run {}: {}/{} brokers ok, {} listings",
                    last.run_id, last.brokers_succeeded, last.brokers_total, last.listings
                );
            }
            Ok(())
        }
        Commands::Patterns {
            pattern_cache,
            limit,
        } => {
            let settings = ScrapeSettings::from_env()?;
            if pattern_cache.is_none() {
                let conn = db::connect(Path::new(DB_PATH))?;
                db::init_schema(&conn)?;
            }
            let knowledge = open_knowledge(pattern_cache, &settings)?;
            let entries = knowledge.entries();
            if entries.is_empty() {
                println!("No patterns learned yet. Run 'run' first.");
                return Ok(());
            }

            println!(
                "{:>3} | {:<28} | {:>5} | {:>8} | {:<10} | {}",
                "#", "Domain", "Runs", "Listings", "Last used", "Signature"
            );
            println!("{}", "-".repeat(110));
            for (i, p) in entries.iter().take(limit).enumerate() {
                println!(
                    "{:>3} | {:<28} | {:>5} | {:>8} | {:<10} | {}",
                    i + 1,
                    truncate(&p.domain, 28),
                    p.success_count,
                    p.total_listings,
                    p.last_used.format("%Y-%m-%d"),
                    truncate(&p.pattern, 48)
                );
            }

            let kb = knowledge.stats();
            println!(
                "\n{} domains | {} successful scrapes | {} listings",
                kb.total_patterns, kb.total_scrapes, kb.total_listings
            );
            Ok(())
        }
    };

    let elapsed = t0.elapsed();
    if elapsed.as_secs() >= 1 {
        println!("\nDone in {}", format_duration(elapsed));
    }

    result
}

fn load_brokers(path: &Path) -> anyhow::Result<Vec<Broker>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading broker file {}", path.display()))?;
    let brokers: Vec<Broker> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing broker file {}", path.display()))?;
    let brokers: Vec<Broker> = brokers
        .into_iter()
        .map(Broker::normalized)
        .filter(|b| !b.url.is_empty())
        .collect();
    if brokers.iter().any(|b| url::Url::parse(&b.url).is_err()) {
        bail!("broker file {} contains an invalid url", path.display());
    }
    Ok(brokers)
}

fn open_knowledge(
    pattern_cache: Option<PathBuf>,
    settings: &ScrapeSettings,
) -> anyhow::Result<PatternKnowledgeBase> {
    let store: Box<dyn PatternStore> = match pattern_cache {
        Some(path) => Box::new(JsonPatternStore::new(path)),
        None => Box::new(db::SqlitePatternStore::open(Path::new(DB_PATH))?),
    };
    Ok(PatternKnowledgeBase::open(
        store,
        settings.similarity_threshold,
        settings.similar_domains_top_k,
    ))
}

fn print_run(stats: &RunStats) {
    println!(
        "\nRun {}: {} brokers, {} ok, {} failed{}",
        stats.run_id,
        stats.brokers_attempted,
        stats.brokers_succeeded,
        stats.brokers_failed,
        if stats.timed_out {
            format!(
                ", {} cancelled, {} skipped (timeout)",
                stats.brokers_cancelled, stats.brokers_skipped
            )
        } else {
            String::new()
        }
    );
    println!(
        "Listings: {} ({} with price, {} with revenue, {} with cash flow, {} filtered out, {} merged)",
        stats.listings,
        stats.with_price,
        stats.with_revenue,
        stats.with_cash_flow,
        stats.filtered_out,
        stats.duplicates_merged
    );
    println!(
        "Patterns: {} predictions used, {} learned",
        stats.predictions_used, stats.patterns_learned
    );

    if !stats.failures_by_kind.is_empty() {
        println!("\n--- Failures ---");
        for (kind, n) in &stats.failures_by_kind {
            println!("  {:<18} {:>4}", kind.as_str(), n);
        }
    }

    println!(
        "\n{:<24} | {:<9} | {:>8} | {:>5} | {:>8} | {}",
        "Broker", "Status", "Listings", "Pages", "Time", "Signature / failure"
    );
    println!("{}", "-".repeat(100));
    let mut sites: Vec<_> = stats.sites.iter().collect();
    sites.sort_by(|a, b| b.listings.cmp(&a.listings).then_with(|| a.broker_name.cmp(&b.broker_name)));
    for s in sites {
        let tail = match (&s.failure_kind, &s.signature) {
            (Some(kind), _) => kind.as_str().to_string(),
            (None, Some(sig)) => truncate(sig, 40),
            (None, None) => "-".to_string(),
        };
        println!(
            "{:<24} | {:<9} | {:>8} | {:>5} | {:>8} | {}",
            truncate(&s.broker_name, 24),
            s.status,
            s.listings,
            s.pages,
            format_duration(std::time::Duration::from_millis(s.duration_ms)),
            tail
        );
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max).collect();
        format!("{}...", truncated)
    }
}

fn format_duration(d: std::time::Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        format!("{:.1}s", d.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    }
}
