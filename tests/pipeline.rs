use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use dealledger::config::ScrapeSettings;
use dealledger::db;
use dealledger::error::FetchError;
use dealledger::failure::FailureKind;
use dealledger::fetch::{FetchedPage, PageFetcher};
use dealledger::knowledge::{JsonPatternStore, PatternKnowledgeBase};
use dealledger::listing::Broker;
use dealledger::parser::vertical::VerticalFilter;
use dealledger::scrape::{scrape_brokers, RunOutput};
use dealledger::snapshot;

const ALPHA: &str = "https://alpha-brokers.test/listings";
const WALLED: &str = "https://walled-broker.test/";

/// Serves canned pages; anything else is a connection error.
struct FakeFetcher {
    pages: HashMap<String, (u16, String)>,
}

#[async_trait]
impl PageFetcher for FakeFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        match self.pages.get(url) {
            Some((status, html)) => Ok(FetchedPage {
                status: *status,
                html: html.clone(),
                final_url: url.to_string(),
            }),
            None => Err(FetchError::Request(format!("connection refused: {url}"))),
        }
    }
}

fn card(i: usize) -> String {
    if i % 2 == 0 {
        format!(
            r#"<div class="card"><h3><a href="/biz/{i}">Commercial Cleaning Company {i:02}</a></h3>
               <p>Asking Price: $450,000. Revenue: $800,000. Cash Flow: $200,000. Austin, TX.</p></div>"#
        )
    } else {
        format!(
            r#"<div class="card"><h3><a href="/biz/{i}">Vending Machine Route {i:02} Portfolio</a></h3>
               <p>Asking Price: $150,000. Revenue: $300,000. Cash Flow: $90,000. Tampa, FL.</p></div>"#
        )
    }
}

fn page(cards: std::ops::Range<usize>, next: Option<&str>) -> String {
    let body: String = cards.map(card).collect();
    let next = next
        .map(|href| format!(r#"<div class="pager"><a class="next" href="{href}">Next</a></div>"#))
        .unwrap_or_default();
    format!(
        r#"<html><body><nav><a href="/">Home</a></nav>
           <main><section class="results">{body}</section>{next}</main></body></html>"#
    )
}

fn fetcher() -> Arc<FakeFetcher> {
    let mut pages = HashMap::new();
    // Second page repeats cards 8 and 9 from the first.
    pages.insert(ALPHA.to_string(), (200, page(0..10, Some("?p=2"))));
    pages.insert(format!("{ALPHA}?p=2"), (200, page(8..16, None)));
    pages.insert(
        WALLED.to_string(),
        (403, "<html><body>Please complete the captcha</body></html>".to_string()),
    );
    Arc::new(FakeFetcher { pages })
}

fn brokers() -> Vec<Broker> {
    vec![
        Broker {
            id: "alpha".into(),
            name: "Alpha Brokers".into(),
            url: ALPHA.into(),
        },
        Broker {
            id: "walled".into(),
            name: "Walled Garden".into(),
            url: WALLED.into(),
        },
    ]
}

fn settings() -> ScrapeSettings {
    ScrapeSettings {
        max_retries: 0,
        ..ScrapeSettings::default()
    }
    .without_delays()
}

fn knowledge(dir: &tempfile::TempDir) -> Arc<PatternKnowledgeBase> {
    Arc::new(PatternKnowledgeBase::open(
        Box::new(JsonPatternStore::new(dir.path().join("pattern_cache.json"))),
        0.30,
        5,
    ))
}

async fn run(kb: &Arc<PatternKnowledgeBase>, settings: &ScrapeSettings) -> RunOutput {
    scrape_brokers(brokers(), fetcher(), Arc::clone(kb), settings)
        .await
        .unwrap()
}

fn ids(out: &RunOutput) -> HashSet<String> {
    out.listings.iter().map(|l| l.id.clone()).collect()
}

#[tokio::test]
async fn end_to_end_run_dedups_classifies_and_learns() {
    let dir = tempfile::tempdir().unwrap();
    let kb = knowledge(&dir);
    let out = run(&kb, &settings()).await;

    assert_eq!(out.listings.len(), 16);
    assert_eq!(ids(&out).len(), 16);
    assert_eq!(out.stats.with_price, 16);
    assert_eq!(out.stats.with_revenue, 16);
    assert_eq!(out.stats.with_cash_flow, 16);
    assert_eq!(out.stats.brokers_succeeded, 1);
    assert_eq!(out.stats.brokers_failed, 1);
    assert_eq!(out.stats.patterns_learned, 1);

    let alpha = out.stats.sites.iter().find(|s| s.broker_id == "alpha").unwrap();
    assert_eq!(alpha.pages, 2);
    assert_eq!(alpha.listings, 16);
    assert_eq!(alpha.status, "ok");

    assert_eq!(out.failures.len(), 1);
    let failure = &out.failures[0];
    assert_eq!(failure.broker_id, "walled");
    assert_eq!(failure.kind, FailureKind::Blocked);
    assert_eq!(failure.http_status, Some(403));
    assert_eq!(out.stats.failures_by_kind.get(&FailureKind::Blocked), Some(&1));

    let cleaning = out
        .listings
        .iter()
        .find(|l| l.title == "Commercial Cleaning Company 00")
        .unwrap();
    assert_eq!(cleaning.source_url, "https://alpha-brokers.test/biz/0");
    assert_eq!(cleaning.price, Some(450_000));
    assert_eq!(cleaning.revenue, Some(800_000));
    assert_eq!(cleaning.cash_flow, Some(200_000));
    assert_eq!(cleaning.city.as_deref(), Some("Austin"));
    assert_eq!(cleaning.state.as_deref(), Some("TX"));
    assert_eq!(cleaning.vertical, "cleaning");
    assert_eq!(cleaning.broker_name, "Alpha Brokers");

    let learned = kb.lookup("alpha-brokers.test").unwrap();
    assert_eq!(learned.success_count, 1);
    assert_eq!(learned.total_listings, 16);
    assert!(kb.lookup("walled-broker.test").is_none());
    assert!(dir.path().join("pattern_cache.json").exists());
}

#[tokio::test]
async fn rerun_is_idempotent_and_uses_cached_pattern() {
    let dir = tempfile::tempdir().unwrap();
    let kb = knowledge(&dir);
    let conn = db::connect(&dir.path().join("dealledger.sqlite")).unwrap();
    db::init_schema(&conn).unwrap();

    let first = run(&kb, &settings()).await;
    let counts = db::save_run(&conn, &first).unwrap();
    assert_eq!((counts.inserted, counts.updated), (16, 0));

    let second = run(&kb, &settings()).await;
    assert_eq!(ids(&first), ids(&second));
    assert_eq!(second.stats.predictions_used, 1);
    let counts = db::save_run(&conn, &second).unwrap();
    assert_eq!((counts.inserted, counts.updated), (0, 16));

    let stats = db::get_stats(&conn).unwrap();
    assert_eq!(stats.listings, 16);
    assert_eq!(stats.failures, 2);
    assert_eq!(kb.lookup("alpha-brokers.test").unwrap().success_count, 2);

    let stored = db::fetch_listings(&conn, None).unwrap();
    let original = first.listings.iter().find(|l| l.id == stored[0].id).unwrap();
    assert_eq!(stored[0].first_seen.timestamp(), original.first_seen.timestamp());
}

#[tokio::test]
async fn vertical_filter_keeps_matching_listings() {
    let dir = tempfile::tempdir().unwrap();
    let kb = knowledge(&dir);
    let settings = ScrapeSettings {
        vertical: Some(VerticalFilter::Cleaning),
        ..settings()
    };
    let out = run(&kb, &settings).await;

    assert_eq!(out.listings.len(), 8);
    assert_eq!(out.stats.filtered_out, 8);
    assert!(out.listings.iter().all(|l| l.vertical == "cleaning"));
    // The pattern still worked for every card, filtered or not.
    assert_eq!(kb.lookup("alpha-brokers.test").unwrap().total_listings, 16);
}

#[tokio::test]
async fn snapshot_preserves_identifiers() {
    let dir = tempfile::tempdir().unwrap();
    let kb = knowledge(&dir);
    let out = run(&kb, &settings()).await;

    let written = snapshot::write_snapshot(&dir.path().join("snapshots"), &out).unwrap();
    let snap = snapshot::read_listings(&written).unwrap();
    assert_eq!(snap.metadata.total_listings, 16);
    assert_eq!(snap.metadata.run_id, out.stats.run_id);
    let read: HashSet<String> = snap.listings.iter().map(|l| l.id.clone()).collect();
    assert_eq!(read, ids(&out));
    assert_eq!(snapshot::read_summary(&written).unwrap().listings, 16);
}
