use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::listing::Broker;
use crate::parser::truncate_chars;

/// HTML shorter than this is treated as an unrendered JavaScript shell.
pub const MIN_RENDERED_HTML: usize = 10_000;
const DETAIL_CHARS: usize = 500;
const UNKNOWN_ERROR_CHARS: usize = 200;

/// Error text the site loop uses when detection found nothing usable.
pub const NO_LISTINGS: &str = "no listings detected";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    Blocked,
    NotFound,
    ServerError,
    Timeout,
    TlsError,
    NoPattern,
    RenderIncomplete,
    Unknown,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Blocked => "BLOCKED",
            Self::NotFound => "NOT_FOUND",
            Self::ServerError => "SERVER_ERROR",
            Self::Timeout => "TIMEOUT",
            Self::TlsError => "TLS_ERROR",
            Self::NoPattern => "NO_PATTERN",
            Self::RenderIncomplete => "RENDER_INCOMPLETE",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub broker_id: String,
    pub broker_name: String,
    pub broker_url: String,
    pub kind: FailureKind,
    pub detail: String,
    pub http_status: Option<u16>,
    pub failed_at: DateTime<Utc>,
}

/// Maps a failed fetch or extraction onto a [`FailureKind`].
#[derive(Debug, Default, Clone, Copy)]
pub struct FailureAnalyzer;

impl FailureAnalyzer {
    /// HTTP status first, then error text, then what the HTML looks like.
    pub fn classify(&self, error: &str, status: Option<u16>, html: Option<&str>) -> (FailureKind, String) {
        match status {
            Some(403) => {
                return (
                    FailureKind::Blocked,
                    "Site blocking (403) - anti-bot protection".to_string(),
                )
            }
            Some(404) => {
                return (
                    FailureKind::NotFound,
                    "Page not found (404) - URL may be outdated".to_string(),
                )
            }
            Some(code) if code >= 500 => {
                return (FailureKind::ServerError, format!("Server error ({code})"))
            }
            _ => {}
        }

        let error_lower = error.to_lowercase();
        if error_lower.contains("timeout") || error_lower.contains("timed out") {
            return (FailureKind::Timeout, "Connection timeout".to_string());
        }
        if error_lower.contains("ssl") || error_lower.contains("certificate") {
            return (FailureKind::TlsError, "SSL certificate error".to_string());
        }

        let html = html.filter(|h| !h.is_empty());
        if let Some(html) = html {
            if html.to_lowercase().contains("captcha") {
                return (FailureKind::Blocked, "CAPTCHA protection detected".to_string());
            }
        }
        if error_lower.contains(NO_LISTINGS) || error_lower.contains("no pattern") {
            return (FailureKind::NoPattern, "Could not detect listing pattern".to_string());
        }
        if let Some(html) = html {
            if html.len() < MIN_RENDERED_HTML {
                return (
                    FailureKind::RenderIncomplete,
                    "Minimal content - JavaScript-heavy".to_string(),
                );
            }
        }
        (
            FailureKind::Unknown,
            format!("Unknown: {}", truncate_chars(error, UNKNOWN_ERROR_CHARS)),
        )
    }

    /// Classify and stamp a record for `broker`.
    pub fn record(
        &self,
        broker: &Broker,
        error: &str,
        status: Option<u16>,
        html: Option<&str>,
    ) -> FailureRecord {
        let (kind, detail) = self.classify(error, status, html);
        let detail = if error.is_empty() || kind == FailureKind::Unknown {
            detail
        } else {
            format!("{detail}: {error}")
        };
        FailureRecord {
            broker_id: broker.id.clone(),
            broker_name: broker.name.clone(),
            broker_url: broker.url.clone(),
            kind,
            detail: truncate_chars(&detail, DETAIL_CHARS),
            http_status: status,
            failed_at: Utc::now(),
        }
    }
}

/// Append-only list of failures for one run.
#[derive(Debug, Default, Clone)]
pub struct FailureLog {
    records: Vec<FailureRecord>,
}

impl FailureLog {
    pub fn push(&mut self, record: FailureRecord) {
        self.records.push(record);
    }

    pub fn records(&self) -> &[FailureRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn by_kind(&self) -> BTreeMap<FailureKind, usize> {
        let mut counts = BTreeMap::new();
        for record in &self.records {
            *counts.entry(record.kind).or_insert(0) += 1;
        }
        counts
    }

    pub fn into_records(self) -> Vec<FailureRecord> {
        self.records
    }
}
