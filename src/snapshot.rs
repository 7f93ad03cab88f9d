use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::failure::FailureRecord;
use crate::listing::NormalizedListing;
use crate::scrape::{RunOutput, RunStats};

pub const LISTINGS_FILE: &str = "listings.json";
pub const FAILURES_FILE: &str = "failures.json";
pub const SUMMARY_FILE: &str = "summary.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub run_id: String,
    pub generated_at: DateTime<Utc>,
    pub total_listings: usize,
    pub brokers: usize,
    pub version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListingsSnapshot {
    pub metadata: SnapshotMetadata,
    pub listings: Vec<NormalizedListing>,
}

#[derive(Debug, Serialize)]
struct FailuresSnapshot<'a> {
    run_id: &'a str,
    total: usize,
    failures: &'a [FailureRecord],
}

/// Directory for a run started at `at`: `<root>/YYYY-MM-DD`.
pub fn snapshot_dir(root: &Path, at: DateTime<Utc>) -> PathBuf {
    root.join(at.format("%Y-%m-%d").to_string())
}

/// Write the three snapshot files for `output`. Same-day runs overwrite.
pub fn write_snapshot(root: &Path, output: &RunOutput) -> Result<PathBuf> {
    let dir = snapshot_dir(root, output.stats.started_at);
    std::fs::create_dir_all(&dir).with_context(|| format!("creating {}", dir.display()))?;

    let mut brokers: Vec<&str> = output.listings.iter().map(|l| l.broker_id.as_str()).collect();
    brokers.sort_unstable();
    brokers.dedup();

    let listings = ListingsSnapshot {
        metadata: SnapshotMetadata {
            run_id: output.stats.run_id.clone(),
            generated_at: Utc::now(),
            total_listings: output.listings.len(),
            brokers: brokers.len(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        },
        listings: output.listings.clone(),
    };
    write_json(&dir.join(LISTINGS_FILE), &listings)?;
    write_json(
        &dir.join(FAILURES_FILE),
        &FailuresSnapshot {
            run_id: &output.stats.run_id,
            total: output.failures.len(),
            failures: &output.failures,
        },
    )?;
    write_json(&dir.join(SUMMARY_FILE), &output.stats)?;

    info!(dir = %dir.display(), listings = output.listings.len(), "snapshot written");
    Ok(dir)
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_string_pretty(value)?;
    std::fs::write(path, body).with_context(|| format!("writing {}", path.display()))
}

pub fn read_listings(dir: &Path) -> Result<ListingsSnapshot> {
    let path = dir.join(LISTINGS_FILE);
    let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

pub fn read_summary(dir: &Path) -> Result<RunStats> {
    let path = dir.join(SUMMARY_FILE);
    let raw = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}
