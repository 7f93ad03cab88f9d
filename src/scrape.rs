use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, Utc};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{jitter, ScrapeSettings};
use crate::failure::{FailureKind, FailureLog, FailureRecord};
use crate::fetch::PageFetcher;
use crate::knowledge::PatternKnowledgeBase;
use crate::listing::{Broker, NormalizedListing};
use crate::site::{SiteReport, SiteScraper, StopReason};

/// One line of the per-site table in the run summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SiteSummary {
    pub broker_id: String,
    pub broker_name: String,
    pub url: String,
    pub status: String,
    pub listings: usize,
    pub pages: usize,
    pub duration_ms: u64,
    pub signature: Option<String>,
    pub failure_kind: Option<FailureKind>,
}

impl SiteSummary {
    fn from_report(report: &SiteReport) -> Self {
        let status = match (&report.failure, report.stop) {
            (Some(_), _) => "failed",
            (None, StopReason::Cancelled) => "cancelled",
            (None, _) => "ok",
        };
        Self {
            broker_id: report.broker.id.clone(),
            broker_name: report.broker.name.clone(),
            url: report.broker.url.clone(),
            status: status.to_string(),
            listings: report.listings.len(),
            pages: report.pages_scraped,
            duration_ms: report.duration.as_millis() as u64,
            signature: report.signature.clone(),
            failure_kind: report.failure.as_ref().map(|f| f.kind),
        }
    }
}

/// Aggregate numbers for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub brokers_total: usize,
    pub brokers_attempted: usize,
    pub brokers_succeeded: usize,
    pub brokers_failed: usize,
    /// Sites stopped by the run timeout before finishing.
    pub brokers_cancelled: usize,
    pub brokers_skipped: usize,
    pub pages_scraped: usize,
    pub listings: usize,
    pub with_price: usize,
    pub with_revenue: usize,
    pub with_cash_flow: usize,
    pub duplicates_merged: usize,
    pub predictions_used: usize,
    pub patterns_learned: usize,
    pub filtered_out: usize,
    pub timed_out: bool,
    pub failures_by_kind: BTreeMap<FailureKind, usize>,
    pub sites: Vec<SiteSummary>,
}

/// Everything a run hands to the sinks.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub listings: Vec<NormalizedListing>,
    pub failures: Vec<FailureRecord>,
    pub stats: RunStats,
}

pub fn new_run_id(at: DateTime<Utc>) -> String {
    format!("run-{}", at.format("%Y%m%dT%H%M%S"))
}

/// Scrape every broker with a bounded pool of site workers.
///
/// Workers send one [`SiteReport`] each over a channel; this task is the only
/// place listings are de-duplicated and stats are counted. The run timeout
/// stops scheduling new sites and cancels in-flight ones, which still report
/// what they gathered.
pub async fn scrape_brokers(
    brokers: Vec<Broker>,
    fetcher: Arc<dyn PageFetcher>,
    knowledge: Arc<PatternKnowledgeBase>,
    settings: &ScrapeSettings,
) -> Result<RunOutput> {
    let started = Instant::now();
    let started_at = Utc::now();
    let total = brokers.len();
    let concurrency = settings.concurrency.max(1);

    let cancel = CancellationToken::new();
    let timer = settings.run_timeout().map(|limit| {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            warn!(secs = limit.as_secs(), "run timeout reached, cancelling remaining sites");
            cancel.cancel();
        })
    });

    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} sites {msg}")?
            .progress_chars("#>-"),
    );

    let site = Arc::new(SiteScraper::new(fetcher, knowledge, settings.clone()));
    let semaphore = Arc::new(Semaphore::new(concurrency));
    let (tx, mut rx) = mpsc::channel::<SiteReport>(concurrency * 2);

    let scheduler = {
        let cancel = cancel.clone();
        let site_delay = settings.site_delay();
        tokio::spawn(async move {
            let mut started = 0usize;
            for broker in brokers {
                if cancel.is_cancelled() {
                    break;
                }
                if started > 0 {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(jitter(&site_delay)) => {}
                    }
                }
                let permit = tokio::select! {
                    _ = cancel.cancelled() => break,
                    permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break,
                    },
                };

                let site = Arc::clone(&site);
                let tx = tx.clone();
                let cancel = cancel.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let report = site.scrape(broker, &cancel).await;
                    let _ = tx.send(report).await;
                });
                started += 1;
            }
            // Dropping our sender here lets the aggregator finish once
            // every spawned site has reported.
            started
        })
    };

    let mut listings: Vec<NormalizedListing> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut failures = FailureLog::default();
    let mut stats = RunStats {
        run_id: new_run_id(started_at),
        started_at,
        brokers_total: total,
        ..RunStats::default()
    };

    while let Some(report) = rx.recv().await {
        stats.pages_scraped += report.pages_scraped;
        stats.filtered_out += report.filtered_out;
        stats.predictions_used += usize::from(report.prediction_used);
        stats.patterns_learned += usize::from(report.pattern_learned);
        stats.sites.push(SiteSummary::from_report(&report));

        match (report.failure, report.stop) {
            (Some(failure), _) => {
                stats.brokers_failed += 1;
                failures.push(failure);
            }
            (None, StopReason::Cancelled) => stats.brokers_cancelled += 1,
            (None, _) => stats.brokers_succeeded += 1,
        }

        for listing in report.listings {
            match index.get(&listing.id) {
                Some(&i) => {
                    listings[i].observe(&listing);
                    stats.duplicates_merged += 1;
                }
                None => {
                    index.insert(listing.id.clone(), listings.len());
                    listings.push(listing);
                }
            }
        }

        pb.set_message(report.broker.name);
        pb.inc(1);
    }

    let attempted = scheduler.await?;
    if let Some(timer) = timer {
        timer.abort();
    }
    pb.finish_and_clear();

    stats.brokers_attempted = attempted;
    stats.brokers_skipped = total - attempted;
    stats.timed_out = cancel.is_cancelled();
    stats.listings = listings.len();
    stats.with_price = listings.iter().filter(|l| l.price.is_some()).count();
    stats.with_revenue = listings.iter().filter(|l| l.revenue.is_some()).count();
    stats.with_cash_flow = listings.iter().filter(|l| l.cash_flow.is_some()).count();
    stats.failures_by_kind = failures.by_kind();
    stats.finished_at = Utc::now();

    info!(
        run_id = %stats.run_id,
        sites = attempted,
        ok = stats.brokers_succeeded,
        failed = stats.brokers_failed,
        cancelled = stats.brokers_cancelled,
        listings = stats.listings,
        elapsed_secs = started.elapsed().as_secs_f64(),
        "run finished"
    );

    Ok(RunOutput {
        listings,
        failures: failures.into_records(),
        stats,
    })
}
