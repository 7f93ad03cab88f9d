use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::StoreError;
use crate::failure::FailureRecord;
use crate::knowledge::{DomainPattern, PatternStore};
use crate::listing::{ListingStatus, NormalizedListing};
use crate::scrape::{RunOutput, RunStats};

pub fn connect(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let conn = Connection::open(path).with_context(|| format!("opening {}", path.display()))?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    Ok(conn)
}

pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS listings (
            id            TEXT PRIMARY KEY,
            broker_id     TEXT NOT NULL,
            broker_name   TEXT NOT NULL,
            broker_url    TEXT NOT NULL,
            source_url    TEXT NOT NULL,
            title         TEXT NOT NULL,
            description   TEXT NOT NULL,
            price         INTEGER,
            price_text    TEXT,
            revenue       INTEGER,
            cash_flow     INTEGER,
            location      TEXT,
            city          TEXT,
            state         TEXT,
            country       TEXT NOT NULL DEFAULT 'US',
            vertical      TEXT NOT NULL,
            business_type TEXT,
            status        TEXT NOT NULL CHECK(status IN ('active')),
            content_hash  TEXT NOT NULL,
            first_seen    TEXT NOT NULL,
            last_seen     TEXT NOT NULL,
            scraped_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_listings_broker ON listings(broker_id);
        CREATE INDEX IF NOT EXISTS idx_listings_vertical ON listings(vertical);
        CREATE INDEX IF NOT EXISTS idx_listings_state ON listings(state);

        CREATE TABLE IF NOT EXISTS failures (
            id           INTEGER PRIMARY KEY,
            run_id       TEXT NOT NULL,
            broker_id    TEXT NOT NULL,
            broker_name  TEXT NOT NULL,
            broker_url   TEXT NOT NULL,
            kind         TEXT NOT NULL,
            detail       TEXT NOT NULL,
            http_status  INTEGER,
            failed_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_failures_run ON failures(run_id);
        CREATE INDEX IF NOT EXISTS idx_failures_kind ON failures(kind);

        CREATE TABLE IF NOT EXISTS runs (
            run_id       TEXT PRIMARY KEY,
            started_at   TEXT NOT NULL,
            finished_at  TEXT NOT NULL,
            brokers      INTEGER NOT NULL,
            succeeded    INTEGER NOT NULL,
            failed       INTEGER NOT NULL,
            listings     INTEGER NOT NULL,
            summary      TEXT NOT NULL
        );
        ",
    )?;
    init_pattern_table(conn)?;
    Ok(())
}

fn init_pattern_table(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS domain_patterns (
            domain         TEXT PRIMARY KEY,
            pattern        TEXT NOT NULL,
            success_count  INTEGER NOT NULL,
            total_listings INTEGER NOT NULL,
            first_seen     TEXT NOT NULL,
            last_used      TEXT NOT NULL
        );
        ",
    )
}

// ── Listings ──

/// How a batch of listings landed in the table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertCounts {
    pub inserted: usize,
    pub updated: usize,
}

/// Insert new listings and refresh known ones. `first_seen` is kept from the
/// stored row; a NULL in the new observation never erases a stored value.
fn upsert_listings(tx: &Connection, listings: &[NormalizedListing]) -> Result<UpsertCounts> {
    let mut counts = UpsertCounts::default();
    let mut exists = tx.prepare("SELECT 1 FROM listings WHERE id = ?1")?;
    let mut stmt = tx.prepare(
        "INSERT INTO listings
         (id, broker_id, broker_name, broker_url, source_url, title, description,
          price, price_text, revenue, cash_flow, location, city, state, country,
          vertical, business_type, status, content_hash, first_seen, last_seen, scraped_at)
         VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16,?17,?18,?19,?20,?21,?22)
         ON CONFLICT(id) DO UPDATE SET
            broker_id     = excluded.broker_id,
            broker_name   = excluded.broker_name,
            broker_url    = excluded.broker_url,
            title         = excluded.title,
            description   = excluded.description,
            price         = COALESCE(excluded.price, listings.price),
            price_text    = COALESCE(excluded.price_text, listings.price_text),
            revenue       = COALESCE(excluded.revenue, listings.revenue),
            cash_flow     = COALESCE(excluded.cash_flow, listings.cash_flow),
            location      = COALESCE(excluded.location, listings.location),
            city          = COALESCE(excluded.city, listings.city),
            state         = COALESCE(excluded.state, listings.state),
            vertical      = excluded.vertical,
            business_type = COALESCE(excluded.business_type, listings.business_type),
            status        = excluded.status,
            content_hash  = excluded.content_hash,
            last_seen     = excluded.last_seen,
            scraped_at    = excluded.scraped_at",
    )?;
    for l in listings {
        if exists.exists(params![l.id])? {
            counts.updated += 1;
        } else {
            counts.inserted += 1;
        }
        stmt.execute(params![
            l.id, l.broker_id, l.broker_name, l.broker_url, l.source_url, l.title,
            l.description, l.price, l.price_text, l.revenue, l.cash_flow, l.location,
            l.city, l.state, l.country, l.vertical, l.business_type, "active",
            l.content_hash, l.first_seen.to_rfc3339(), l.last_seen.to_rfc3339(),
            l.scraped_at.to_rfc3339(),
        ])?;
    }
    Ok(counts)
}

pub fn save_listings(conn: &Connection, listings: &[NormalizedListing]) -> Result<UpsertCounts> {
    let tx = conn.unchecked_transaction()?;
    let counts = upsert_listings(&tx, listings)?;
    tx.commit()?;
    Ok(counts)
}

pub fn fetch_listings(conn: &Connection, limit: Option<usize>) -> Result<Vec<NormalizedListing>> {
    let sql = format!(
        "SELECT id, broker_id, broker_name, broker_url, source_url, title, description,
                price, price_text, revenue, cash_flow, location, city, state, country,
                vertical, business_type, content_hash, first_seen, last_seen, scraped_at
         FROM listings
         ORDER BY last_seen DESC, id{}",
        match limit {
            Some(n) => format!(" LIMIT {}", n),
            None => String::new(),
        }
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                NormalizedListing {
                    id: row.get(0)?,
                    broker_id: row.get(1)?,
                    broker_name: row.get(2)?,
                    broker_url: row.get(3)?,
                    source_url: row.get(4)?,
                    title: row.get(5)?,
                    description: row.get(6)?,
                    price: row.get(7)?,
                    price_text: row.get(8)?,
                    revenue: row.get(9)?,
                    cash_flow: row.get(10)?,
                    location: row.get(11)?,
                    city: row.get(12)?,
                    state: row.get(13)?,
                    country: row.get(14)?,
                    vertical: row.get(15)?,
                    business_type: row.get(16)?,
                    status: ListingStatus::Active,
                    content_hash: row.get(17)?,
                    first_seen: DateTime::<Utc>::default(),
                    last_seen: DateTime::<Utc>::default(),
                    scraped_at: DateTime::<Utc>::default(),
                },
                [
                    row.get::<_, String>(18)?,
                    row.get::<_, String>(19)?,
                    row.get::<_, String>(20)?,
                ],
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    rows.into_iter()
        .map(|(mut listing, [first, last, scraped])| -> Result<NormalizedListing> {
            listing.first_seen = parse_timestamp(&first)?;
            listing.last_seen = parse_timestamp(&last)?;
            listing.scraped_at = parse_timestamp(&scraped)?;
            Ok(listing)
        })
        .collect()
}

// ── Runs ──

fn insert_failures(tx: &Connection, run_id: &str, failures: &[FailureRecord]) -> Result<usize> {
    let mut count = 0;
    let mut stmt = tx.prepare(
        "INSERT INTO failures
         (run_id, broker_id, broker_name, broker_url, kind, detail, http_status, failed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for f in failures {
        count += stmt.execute(params![
            run_id, f.broker_id, f.broker_name, f.broker_url, f.kind.as_str(), f.detail,
            f.http_status, f.failed_at.to_rfc3339(),
        ])?;
    }
    Ok(count)
}

fn insert_run(tx: &Connection, stats: &RunStats) -> Result<()> {
    let summary = serde_json::to_string(stats)?;
    tx.execute(
        "INSERT OR REPLACE INTO runs
         (run_id, started_at, finished_at, brokers, succeeded, failed, listings, summary)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            stats.run_id,
            stats.started_at.to_rfc3339(),
            stats.finished_at.to_rfc3339(),
            stats.brokers_total,
            stats.brokers_succeeded,
            stats.brokers_failed,
            stats.listings,
            summary,
        ],
    )?;
    Ok(())
}

/// Persist one run's listings, failures and summary in a single transaction.
pub fn save_run(conn: &Connection, output: &RunOutput) -> Result<UpsertCounts> {
    let tx = conn.unchecked_transaction()?;
    let counts = upsert_listings(&tx, &output.listings)?;
    insert_failures(&tx, &output.stats.run_id, &output.failures)?;
    insert_run(&tx, &output.stats)?;
    tx.commit()?;
    Ok(counts)
}

/// Summary JSON of the most recent run, if any.
pub fn last_run(conn: &Connection) -> Result<Option<RunStats>> {
    let summary: Option<String> = conn
        .query_row(
            "SELECT summary FROM runs ORDER BY started_at DESC LIMIT 1",
            [],
            |r| r.get(0),
        )
        .optional()?;
    summary
        .map(|s| serde_json::from_str(&s).context("decoding run summary"))
        .transpose()
}

// ── Stats ──

pub struct Stats {
    pub listings: usize,
    pub brokers: usize,
    pub with_price: usize,
    pub with_revenue: usize,
    pub with_cash_flow: usize,
    pub by_vertical: Vec<(String, usize)>,
    pub failures: usize,
    pub runs: usize,
    pub patterns: usize,
}

pub fn get_stats(conn: &Connection) -> Result<Stats> {
    let count = |sql: &str| -> Result<usize> { Ok(conn.query_row(sql, [], |r| r.get(0))?) };

    let mut stmt = conn.prepare(
        "SELECT vertical, COUNT(*) FROM listings GROUP BY vertical ORDER BY COUNT(*) DESC, vertical",
    )?;
    let by_vertical = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Stats {
        listings: count("SELECT COUNT(*) FROM listings")?,
        brokers: count("SELECT COUNT(DISTINCT broker_id) FROM listings")?,
        with_price: count("SELECT COUNT(*) FROM listings WHERE price IS NOT NULL")?,
        with_revenue: count("SELECT COUNT(*) FROM listings WHERE revenue IS NOT NULL")?,
        with_cash_flow: count("SELECT COUNT(*) FROM listings WHERE cash_flow IS NOT NULL")?,
        by_vertical,
        failures: count("SELECT COUNT(*) FROM failures")?,
        runs: count("SELECT COUNT(*) FROM runs")?,
        patterns: count("SELECT COUNT(*) FROM domain_patterns")?,
    })
}

// ── Learned patterns ──

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|_| StoreError::Timestamp(raw.to_string()))
}

/// Knowledge-base persistence in the `domain_patterns` table.
pub struct SqlitePatternStore {
    conn: Mutex<Connection>,
}

impl SqlitePatternStore {
    pub fn new(conn: Connection) -> Result<Self, StoreError> {
        init_pattern_table(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::new(Connection::open(path)?)
    }
}

impl PatternStore for SqlitePatternStore {
    fn load(&self) -> Result<HashMap<String, DomainPattern>, StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare(
            "SELECT domain, pattern, success_count, total_listings, first_seen, last_used
             FROM domain_patterns",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, String>(5)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut patterns = HashMap::with_capacity(rows.len());
        for (domain, pattern, success_count, total_listings, first_seen, last_used) in rows {
            patterns.insert(
                domain.clone(),
                DomainPattern {
                    domain,
                    pattern,
                    success_count: success_count.max(0) as u64,
                    total_listings: total_listings.max(0) as u64,
                    first_seen: parse_timestamp(&first_seen)?,
                    last_used: parse_timestamp(&last_used)?,
                },
            );
        }
        Ok(patterns)
    }

    fn save(&self, patterns: &HashMap<String, DomainPattern>) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT OR REPLACE INTO domain_patterns
                 (domain, pattern, success_count, total_listings, first_seen, last_used)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            )?;
            for (domain, p) in patterns {
                stmt.execute(params![
                    domain,
                    p.pattern,
                    p.success_count as i64,
                    p.total_listings as i64,
                    p.first_seen.to_rfc3339(),
                    p.last_used.to_rfc3339(),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::failure::FailureKind;
    use chrono::Duration;

    fn listing(url: &str, price: Option<i64>, seen: DateTime<Utc>) -> NormalizedListing {
        let mut l = NormalizedListing {
            id: crate::listing::listing_id(url),
            broker_id: "b1".into(),
            broker_name: "Acme".into(),
            broker_url: "https://acme.example".into(),
            source_url: url.into(),
            title: "Commercial cleaning company".into(),
            description: "Janitorial contracts".into(),
            price,
            price_text: price.map(|p| format!("${p}")),
            revenue: Some(900_000),
            cash_flow: None,
            location: Some("Austin, TX".into()),
            city: Some("Austin".into()),
            state: Some("TX".into()),
            country: "US".into(),
            vertical: "cleaning".into(),
            business_type: Some("service".into()),
            status: ListingStatus::Active,
            content_hash: String::new(),
            first_seen: seen,
            last_seen: seen,
            scraped_at: seen,
        };
        l.content_hash = l.compute_content_hash();
        l
    }

    fn open() -> (tempfile::TempDir, Connection) {
        let dir = tempfile::tempdir().unwrap();
        let conn = connect(&dir.path().join("db/test.sqlite")).unwrap();
        init_schema(&conn).unwrap();
        (dir, conn)
    }

    #[test]
    fn upsert_keeps_first_seen_and_stored_values() {
        let (_dir, conn) = open();
        let day1 = Utc::now() - Duration::days(1);
        let day2 = Utc::now();

        let counts = save_listings(&conn, &[listing("https://acme.example/1", Some(450_000), day1)]).unwrap();
        assert_eq!(counts, UpsertCounts { inserted: 1, updated: 0 });

        let counts = save_listings(&conn, &[listing("https://acme.example/1", None, day2)]).unwrap();
        assert_eq!(counts, UpsertCounts { inserted: 0, updated: 1 });

        let rows = fetch_listings(&conn, None).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].first_seen.timestamp(), day1.timestamp());
        assert_eq!(rows[0].last_seen.timestamp(), day2.timestamp());
        assert_eq!(rows[0].price, Some(450_000));
    }

    #[test]
    fn runs_and_failures_are_recorded() {
        let (_dir, conn) = open();
        let now = Utc::now();
        let mut stats = RunStats {
            run_id: crate::scrape::new_run_id(now),
            started_at: now,
            finished_at: now,
            brokers_total: 2,
            brokers_succeeded: 1,
            brokers_failed: 1,
            listings: 1,
            ..RunStats::default()
        };
        stats.failures_by_kind.insert(FailureKind::Blocked, 1);
        let output = RunOutput {
            listings: vec![listing("https://acme.example/2", Some(1), now)],
            failures: vec![FailureRecord {
                broker_id: "b2".into(),
                broker_name: "Walled".into(),
                broker_url: "https://walled.example".into(),
                kind: FailureKind::Blocked,
                detail: "Site blocking (403) - anti-bot protection".into(),
                http_status: Some(403),
                failed_at: now,
            }],
            stats: stats.clone(),
        };
        save_run(&conn, &output).unwrap();

        let s = get_stats(&conn).unwrap();
        assert_eq!(s.listings, 1);
        assert_eq!(s.failures, 1);
        assert_eq!(s.runs, 1);
        assert_eq!(s.by_vertical, vec![("cleaning".to_string(), 1)]);

        let kind: String = conn
            .query_row("SELECT kind FROM failures", [], |r| r.get(0))
            .unwrap();
        assert_eq!(kind, "BLOCKED");
        assert_eq!(last_run(&conn).unwrap(), Some(stats));
    }

    #[test]
    fn pattern_store_round_trips() {
        let (dir, conn) = open();
        drop(conn);
        let path = dir.path().join("db/test.sqlite");
        let store = SqlitePatternStore::open(&path).unwrap();
        assert!(store.load().unwrap().is_empty());

        let now = Utc::now();
        let mut patterns = HashMap::new();
        patterns.insert(
            "sunbeltnetwork.com".to_string(),
            DomainPattern {
                domain: "sunbeltnetwork.com".into(),
                pattern: "div|children:h3,p|has_link|text:medium|has_price".into(),
                success_count: 3,
                total_listings: 61,
                first_seen: now,
                last_used: now,
            },
        );
        store.save(&patterns).unwrap();

        let loaded = SqlitePatternStore::open(&path).unwrap().load().unwrap();
        let entry = &loaded["sunbeltnetwork.com"];
        assert_eq!(entry.success_count, 3);
        assert_eq!(entry.total_listings, 61);
        assert_eq!(entry.first_seen.timestamp(), now.timestamp());
    }

    #[test]
    fn bad_timestamp_is_a_store_error() {
        let (dir, conn) = open();
        conn.execute(
            "INSERT INTO domain_patterns VALUES ('x.com', 'div', 1, 1, 'yesterday', 'today')",
            [],
        )
        .unwrap();
        drop(conn);
        let store = SqlitePatternStore::open(&dir.path().join("db/test.sqlite")).unwrap();
        assert!(matches!(store.load(), Err(StoreError::Timestamp(_))));
    }
}
