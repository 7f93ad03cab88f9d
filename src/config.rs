use std::ops::RangeInclusive;
use std::time::Duration;

use anyhow::Result;
use config::{Config, Environment};
use serde::{Deserialize, Serialize};

use crate::parser::vertical::VerticalFilter;

pub const DB_PATH: &str = "data/dealledger.sqlite";
pub const SNAPSHOT_ROOT: &str = "data/snapshots";

/// Run settings. Every field has a default, so a partial environment is fine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScrapeSettings {
    pub max_pages: usize,
    pub max_consecutive_empty: usize,
    pub candidates_tried: usize,
    pub page_delay_min_ms: u64,
    pub page_delay_max_ms: u64,
    pub site_delay_min_ms: u64,
    pub site_delay_max_ms: u64,
    pub similarity_threshold: f64,
    pub similar_domains_top_k: usize,
    pub concurrency: usize,
    pub request_timeout_secs: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub run_timeout_secs: Option<u64>,
    pub vertical: Option<VerticalFilter>,
}

impl Default for ScrapeSettings {
    fn default() -> Self {
        Self {
            max_pages: 100,
            max_consecutive_empty: 3,
            candidates_tried: 3,
            page_delay_min_ms: 1_000,
            page_delay_max_ms: 2_000,
            site_delay_min_ms: 2_000,
            site_delay_max_ms: 4_000,
            similarity_threshold: 0.30,
            similar_domains_top_k: 5,
            concurrency: 4,
            request_timeout_secs: 30,
            max_retries: 2,
            retry_backoff_ms: 2_000,
            run_timeout_secs: None,
            vertical: None,
        }
    }
}

impl ScrapeSettings {
    /// Defaults overlaid with `DEALLEDGER_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let settings = Config::builder()
            .add_source(Environment::with_prefix("DEALLEDGER").try_parsing(true))
            .build()?;
        Ok(settings.try_deserialize()?)
    }

    pub fn page_delay(&self) -> RangeInclusive<u64> {
        ordered(self.page_delay_min_ms, self.page_delay_max_ms)
    }

    pub fn site_delay(&self) -> RangeInclusive<u64> {
        ordered(self.site_delay_min_ms, self.site_delay_max_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_ms)
    }

    pub fn run_timeout(&self) -> Option<Duration> {
        self.run_timeout_secs.map(Duration::from_secs)
    }

    /// Zero delays everywhere; for tests and local fixtures.
    pub fn without_delays(mut self) -> Self {
        self.page_delay_min_ms = 0;
        self.page_delay_max_ms = 0;
        self.site_delay_min_ms = 0;
        self.site_delay_max_ms = 0;
        self.retry_backoff_ms = 0;
        self
    }
}

fn ordered(a: u64, b: u64) -> RangeInclusive<u64> {
    a.min(b)..=a.max(b)
}

/// Random pause drawn from `range_ms`; zero when the range is `0..=0`.
pub fn jitter(range_ms: &RangeInclusive<u64>) -> Duration {
    use rand::Rng;
    if *range_ms.end() == 0 {
        return Duration::ZERO;
    }
    Duration::from_millis(rand::thread_rng().gen_range(range_ms.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = ScrapeSettings::default();
        assert_eq!(s.max_pages, 100);
        assert_eq!(s.max_consecutive_empty, 3);
        assert_eq!(s.similar_domains_top_k, 5);
        assert!((s.similarity_threshold - 0.30).abs() < f64::EPSILON);
        assert_eq!(s.page_delay(), 1_000..=2_000);
        assert_eq!(s.run_timeout(), None);
    }

    #[test]
    fn environment_overrides_defaults() {
        std::env::set_var("DEALLEDGER_MAX_PAGES", "7");
        std::env::set_var("DEALLEDGER_VERTICAL", "hvac");
        let s = ScrapeSettings::from_env().unwrap();
        std::env::remove_var("DEALLEDGER_MAX_PAGES");
        std::env::remove_var("DEALLEDGER_VERTICAL");

        assert_eq!(s.max_pages, 7);
        assert_eq!(s.vertical, Some(VerticalFilter::Hvac));
        assert_eq!(s.concurrency, 4);
    }

    #[test]
    fn jitter_stays_in_range() {
        assert_eq!(jitter(&(0..=0)), Duration::ZERO);
        let d = jitter(&ordered(20, 10));
        assert!(d >= Duration::from_millis(10) && d <= Duration::from_millis(20));
    }
}
