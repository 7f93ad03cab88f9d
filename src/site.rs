use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use scraper::Html;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{jitter, ScrapeSettings};
use crate::failure::{FailureAnalyzer, FailureRecord, MIN_RENDERED_HTML, NO_LISTINGS};
use crate::fetch::{fetch_with_retry, PageFetcher};
use crate::knowledge::PatternKnowledgeBase;
use crate::listing::{listing_id, Admission, Broker, ListingFilter, NormalizedListing};
use crate::parser::detect::PatternDetector;
use crate::parser::extract::{ExtractedListing, SmartExtractor};
use crate::parser::paginate::Paginator;

/// Why a site's page loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    NoNextPage,
    PageCap,
    EmptyStreak,
    Revisit,
    Cancelled,
    /// A page after the first could not be fetched or parsed.
    PageFailed,
    /// The first page failed; see [`SiteReport::failure`].
    Failed,
}

/// Everything one site produced.
#[derive(Debug, Clone)]
pub struct SiteReport {
    pub broker: Broker,
    pub listings: Vec<NormalizedListing>,
    pub pages_scraped: usize,
    pub signature: Option<String>,
    pub failure: Option<FailureRecord>,
    pub prediction_used: bool,
    pub pattern_learned: bool,
    pub filtered_out: usize,
    pub stop: StopReason,
    pub duration: Duration,
}

impl SiteReport {
    fn new(broker: Broker) -> Self {
        Self {
            broker,
            listings: Vec::new(),
            pages_scraped: 0,
            signature: None,
            failure: None,
            prediction_used: false,
            pattern_learned: false,
            filtered_out: 0,
            stop: StopReason::NoNextPage,
            duration: Duration::ZERO,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// Result of processing one fetched page. Holds no DOM references.
#[derive(Debug, Default)]
struct PageOutcome {
    extracted: Vec<ExtractedListing>,
    signature: Option<String>,
    candidates: usize,
    prediction_used: bool,
    next_url: Option<String>,
}

/// Runs the fetch → detect → extract → paginate loop for one site at a time.
/// One instance is shared by all workers of a run.
pub struct SiteScraper {
    fetcher: Arc<dyn PageFetcher>,
    knowledge: Arc<PatternKnowledgeBase>,
    settings: ScrapeSettings,
    detector: PatternDetector,
    extractor: SmartExtractor,
    paginator: Paginator,
    filter: ListingFilter,
    analyzer: FailureAnalyzer,
}

impl SiteScraper {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        knowledge: Arc<PatternKnowledgeBase>,
        settings: ScrapeSettings,
    ) -> Self {
        Self {
            filter: ListingFilter::new(settings.vertical),
            fetcher,
            knowledge,
            settings,
            detector: PatternDetector::new(),
            extractor: SmartExtractor::new(),
            paginator: Paginator::new(),
            analyzer: FailureAnalyzer,
        }
    }

    pub async fn scrape(&self, broker: Broker, cancel: &CancellationToken) -> SiteReport {
        let start = Instant::now();
        let mut report = SiteReport::new(broker);
        let mut visited: HashSet<String> = HashSet::new();
        let mut seen_ids: HashSet<String> = HashSet::new();
        let mut extracted_total = 0usize;
        let mut empty_streak = 0usize;
        let mut previous_signature: Option<String> = None;
        let mut next = Some(report.broker.url.clone());

        info!(broker = %report.broker.name, url = %report.broker.url, "scraping site");

        while let Some(url) = next.take() {
            if cancel.is_cancelled() {
                report.stop = StopReason::Cancelled;
                break;
            }
            if report.pages_scraped >= self.settings.max_pages {
                report.stop = StopReason::PageCap;
                break;
            }
            if !visited.insert(url.clone()) {
                report.stop = StopReason::Revisit;
                break;
            }

            let first_page = report.pages_scraped == 0;
            if !first_page {
                let pause = jitter(&self.settings.page_delay());
                tokio::select! {
                    _ = cancel.cancelled() => {
                        report.stop = StopReason::Cancelled;
                        break;
                    }
                    _ = tokio::time::sleep(pause) => {}
                }
            }

            let fetched = tokio::select! {
                _ = cancel.cancelled() => {
                    report.stop = StopReason::Cancelled;
                    break;
                }
                result = fetch_with_retry(
                    self.fetcher.as_ref(),
                    &url,
                    self.settings.max_retries,
                    self.settings.retry_backoff(),
                ) => result,
            };

            let page = match fetched {
                Ok(page) if page.is_success() => page,
                Ok(page) => {
                    if first_page {
                        report.failure = Some(self.analyzer.record(
                            &report.broker,
                            "",
                            Some(page.status),
                            Some(&page.html),
                        ));
                        report.stop = StopReason::Failed;
                    } else {
                        warn!(%url, status = page.status, "later page failed, keeping earlier listings");
                        report.stop = StopReason::PageFailed;
                    }
                    break;
                }
                Err(e) => {
                    if first_page {
                        report.failure = Some(self.analyzer.record(&report.broker, &e.to_string(), None, None));
                        report.stop = StopReason::Failed;
                    } else {
                        warn!(%url, error = %e, "later page failed, keeping earlier listings");
                        report.stop = StopReason::PageFailed;
                    }
                    break;
                }
            };
            if page.final_url != url && !visited.insert(page.final_url.clone()) {
                debug!(%url, final_url = %page.final_url, "redirected to a visited page");
                report.stop = StopReason::Revisit;
                break;
            }
            report.pages_scraped += 1;

            let outcome = self.process_page(
                &page.html,
                &page.final_url,
                &url,
                first_page,
                previous_signature.as_deref(),
            );

            let Some(signature) = outcome.signature.clone() else {
                if first_page {
                    let error = if outcome.candidates == 0 && page.html.len() < MIN_RENDERED_HTML {
                        ""
                    } else {
                        NO_LISTINGS
                    };
                    report.failure = Some(self.analyzer.record(
                        &report.broker,
                        error,
                        Some(page.status),
                        Some(&page.html),
                    ));
                    report.stop = StopReason::Failed;
                } else {
                    debug!(%url, "no listings on later page");
                    report.stop = StopReason::PageFailed;
                }
                break;
            };

            if first_page {
                report.signature = Some(signature.clone());
                report.prediction_used = outcome.prediction_used;
            }
            previous_signature = Some(signature);

            let mut new_on_page = 0usize;
            let now = Utc::now();
            for ex in outcome.extracted {
                if !seen_ids.insert(listing_id(&ex.url)) {
                    continue;
                }
                new_on_page += 1;
                match self.filter.admit(&ex) {
                    Admission::Accepted => report
                        .listings
                        .push(NormalizedListing::from_extracted(ex, &report.broker, now)),
                    Admission::RealEstate | Admission::OffVertical => report.filtered_out += 1,
                }
            }
            extracted_total += new_on_page;
            debug!(
                %url,
                page = report.pages_scraped,
                new = new_on_page,
                kept = report.listings.len(),
                "page processed"
            );

            if new_on_page == 0 {
                empty_streak += 1;
                if empty_streak >= self.settings.max_consecutive_empty {
                    report.stop = StopReason::EmptyStreak;
                    break;
                }
            } else {
                empty_streak = 0;
            }

            next = outcome.next_url;
            if next.is_none() {
                report.stop = StopReason::NoNextPage;
            }
        }

        if report.failure.is_none() && extracted_total > 0 {
            if let Some(signature) = report.signature.as_deref() {
                self.knowledge
                    .record_success(&report.broker.url, signature, extracted_total);
                report.pattern_learned = true;
            }
        }

        report.duration = start.elapsed();
        match &report.failure {
            Some(f) => warn!(broker = %report.broker.name, kind = %f.kind, detail = %f.detail, "site failed"),
            None => info!(
                broker = %report.broker.name,
                listings = report.listings.len(),
                pages = report.pages_scraped,
                stop = ?report.stop,
                "site done"
            ),
        }
        report
    }

    /// Detect, extract and find the next link on one page.
    fn process_page(
        &self,
        html: &str,
        final_url: &str,
        requested_url: &str,
        first_page: bool,
        preferred: Option<&str>,
    ) -> PageOutcome {
        let Some(base) = Url::parse(final_url)
            .or_else(|_| Url::parse(requested_url))
            .ok()
        else {
            return PageOutcome::default();
        };
        let doc = Html::parse_document(html);
        let mut outcome = PageOutcome {
            next_url: self.paginator.next_page(&doc, &base),
            ..PageOutcome::default()
        };

        if first_page {
            if let Some(cached) = self.knowledge.cached_signature(requested_url) {
                let elements = self.detector.elements_with_signature(&doc, &cached);
                let extracted = self.extract_all(&elements, &base);
                if !extracted.is_empty() {
                    debug!(signature = %cached, "cached pattern matched");
                    outcome.extracted = extracted;
                    outcome.signature = Some(cached);
                    outcome.prediction_used = true;
                    return outcome;
                }
                debug!(signature = %cached, "cached pattern found nothing, detecting");
            }
        }

        let mut patterns = self.detector.find_patterns(&doc);
        outcome.candidates = patterns.len();
        if patterns.is_empty() {
            return outcome;
        }

        let signatures: Vec<String> = patterns.iter().map(|p| p.signature.clone()).collect();
        let mut predicted = None;
        let front = match preferred.filter(|sig| signatures.iter().any(|s| s.as_str() == *sig)) {
            Some(sig) => Some(sig.to_string()),
            None => {
                predicted = self
                    .knowledge
                    .predict(requested_url, &signatures)
                    .map(|p| p.signature);
                predicted.clone()
            }
        };
        if let Some(front) = front {
            if let Some(pos) = patterns.iter().position(|p| p.signature == front) {
                let chosen = patterns.remove(pos);
                patterns.insert(0, chosen);
            }
        }

        for pattern in patterns.iter().take(self.settings.candidates_tried) {
            let extracted = self.extract_all(&pattern.elements, &base);
            if !extracted.is_empty() {
                outcome.prediction_used = predicted.as_deref() == Some(pattern.signature.as_str());
                outcome.signature = Some(pattern.signature.clone());
                outcome.extracted = extracted;
                break;
            }
        }
        outcome
    }

    fn extract_all(&self, elements: &[scraper::ElementRef<'_>], base: &Url) -> Vec<ExtractedListing> {
        elements
            .iter()
            .filter_map(|el| self.extractor.extract(*el, base).ok())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::fetch::FetchedPage;
    use crate::failure::FailureKind;
    use crate::knowledge::JsonPatternStore;
    use std::collections::HashMap;

    struct Pages(HashMap<String, (u16, String)>);

    #[async_trait::async_trait]
    impl PageFetcher for Pages {
        async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
            match self.0.get(url) {
                Some((status, html)) => Ok(FetchedPage {
                    status: *status,
                    html: html.clone(),
                    final_url: url.to_string(),
                }),
                None => Err(FetchError::Timeout(30)),
            }
        }
    }

    /// Serves `to`'s page for each redirected url, reporting `to` as final.
    struct Redirects {
        pages: Pages,
        to: HashMap<String, String>,
    }

    #[async_trait::async_trait]
    impl PageFetcher for Redirects {
        async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
            match self.to.get(url) {
                Some(target) => self.pages.fetch(target).await,
                None => self.pages.fetch(url).await,
            }
        }
    }

    fn card(i: usize) -> String {
        format!(
            r#"<div class="listing"><h3><a href="/biz/{i}">Established Cleaning Company {i}</a></h3>
               <p>Asking $350,000. Revenue: $900,000. Recurring commercial contracts, Dallas, TX.</p></div>"#
        )
    }

    fn page(cards: std::ops::Range<usize>, next: Option<&str>) -> String {
        let body: String = cards.map(card).collect();
        let next = next
            .map(|href| format!(r#"<a class="next" href="{href}">Next</a>"#))
            .unwrap_or_default();
        format!("<html><body><main><section>{body}</section>{next}</main></body></html>")
    }

    fn scraper(pages: Vec<(&str, u16, String)>, dir: &tempfile::TempDir) -> SiteScraper {
        let map = pages
            .into_iter()
            .map(|(url, status, html)| (url.to_string(), (status, html)))
            .collect();
        let kb = PatternKnowledgeBase::open(
            Box::new(JsonPatternStore::new(dir.path().join("kb.json"))),
            0.30,
            5,
        );
        let settings = ScrapeSettings {
            max_retries: 0,
            ..ScrapeSettings::default()
        }
        .without_delays();
        SiteScraper::new(Arc::new(Pages(map)), Arc::new(kb), settings)
    }

    fn broker(url: &str) -> Broker {
        Broker {
            id: "b1".into(),
            name: "Test Brokers".into(),
            url: url.into(),
        }
    }

    #[tokio::test]
    async fn follows_pages_and_learns() {
        let dir = tempfile::tempdir().unwrap();
        let s = scraper(
            vec![
                ("https://brokers.test/list", 200, page(0..4, Some("/list?p=2"))),
                ("https://brokers.test/list?p=2", 200, page(4..7, None)),
            ],
            &dir,
        );
        let report = s.scrape(broker("https://brokers.test/list"), &CancellationToken::new()).await;
        assert!(report.succeeded());
        assert_eq!(report.pages_scraped, 2);
        assert_eq!(report.listings.len(), 7);
        assert_eq!(report.stop, StopReason::NoNextPage);
        assert!(report.pattern_learned);

        let entry = s.knowledge.lookup("brokers.test").unwrap();
        assert_eq!(entry.total_listings, 7);
        assert_eq!(Some(entry.pattern), report.signature);

        // Second visit short-circuits through the cached signature.
        let again = s.scrape(broker("https://brokers.test/list"), &CancellationToken::new()).await;
        assert!(again.prediction_used);
        assert_eq!(again.listings.len(), 7);
    }

    #[tokio::test]
    async fn first_page_failures_are_classified() {
        let dir = tempfile::tempdir().unwrap();
        let s = scraper(
            vec![
                ("https://blocked.test/", 403, "<html>captcha</html>".into()),
                ("https://shell.test/", 200, r#"<html><div id="app"></div></html>"#.into()),
            ],
            &dir,
        );
        let cancel = CancellationToken::new();

        let blocked = s.scrape(broker("https://blocked.test/"), &cancel).await;
        assert_eq!(blocked.failure.as_ref().unwrap().kind, FailureKind::Blocked);
        assert_eq!(blocked.failure.as_ref().unwrap().http_status, Some(403));
        assert_eq!(blocked.stop, StopReason::Failed);

        let shell = s.scrape(broker("https://shell.test/"), &cancel).await;
        assert_eq!(shell.failure.unwrap().kind, FailureKind::RenderIncomplete);

        let missing = s.scrape(broker("https://missing.test/"), &cancel).await;
        assert_eq!(missing.failure.unwrap().kind, FailureKind::Timeout);
        assert!(s.knowledge.entries().is_empty());
    }

    #[tokio::test]
    async fn later_page_failure_keeps_listings() {
        let dir = tempfile::tempdir().unwrap();
        let s = scraper(
            vec![("https://partial.test/", 200, page(0..5, Some("/p2")))],
            &dir,
        );
        let report = s.scrape(broker("https://partial.test/"), &CancellationToken::new()).await;
        assert!(report.succeeded());
        assert_eq!(report.listings.len(), 5);
        assert_eq!(report.stop, StopReason::PageFailed);
    }

    #[tokio::test]
    async fn repeated_pages_stop_on_empty_streak() {
        let dir = tempfile::tempdir().unwrap();
        let same = |next: &str| page(0..3, Some(next));
        let s = scraper(
            vec![
                ("https://loop.test/?page=1", 200, same("?page=2")),
                ("https://loop.test/?page=2", 200, same("?page=3")),
                ("https://loop.test/?page=3", 200, same("?page=4")),
                ("https://loop.test/?page=4", 200, same("?page=5")),
                ("https://loop.test/?page=5", 200, same("?page=6")),
            ],
            &dir,
        );
        let report = s.scrape(broker("https://loop.test/?page=1"), &CancellationToken::new()).await;
        assert_eq!(report.listings.len(), 3);
        assert_eq!(report.pages_scraped, 4);
        assert_eq!(report.stop, StopReason::EmptyStreak);
    }

    #[tokio::test]
    async fn page_cap_and_cycles() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = scraper(
            vec![
                ("https://cycle.test/a", 200, page(0..3, Some("/b"))),
                ("https://cycle.test/b", 200, page(3..6, Some("/a"))),
            ],
            &dir,
        );
        let report = s.scrape(broker("https://cycle.test/a"), &CancellationToken::new()).await;
        assert_eq!(report.pages_scraped, 2);
        assert_eq!(report.stop, StopReason::Revisit);

        s.settings.max_pages = 1;
        let report = s.scrape(broker("https://cycle.test/a"), &CancellationToken::new()).await;
        assert_eq!(report.pages_scraped, 1);
        assert_eq!(report.stop, StopReason::PageCap);
    }

    #[tokio::test]
    async fn stale_cached_signature_falls_back_to_detection() {
        let dir = tempfile::tempdir().unwrap();
        let s = scraper(vec![("https://stale.test/", 200, page(0..4, None))], &dir);
        s.knowledge.record_success("https://stale.test/", "tr|text:short", 3);

        let report = s.scrape(broker("https://stale.test/"), &CancellationToken::new()).await;
        assert!(report.succeeded());
        assert!(!report.prediction_used);
        assert_eq!(report.listings.len(), 4);

        let entry = s.knowledge.lookup("stale.test").unwrap();
        assert_ne!(entry.pattern, "tr|text:short");
        assert_eq!(Some(entry.pattern), report.signature);
        assert_eq!(entry.success_count, 2);
        assert_eq!(entry.total_listings, 7);
    }

    #[tokio::test]
    async fn redirect_to_visited_page_stops() {
        let dir = tempfile::tempdir().unwrap();
        let pages = Pages(HashMap::from([(
            "https://redir.test/a".to_string(),
            (200, page(0..3, Some("/b"))),
        )]));
        let to = HashMap::from([("https://redir.test/b".to_string(), "https://redir.test/a".to_string())]);
        let kb = PatternKnowledgeBase::open(
            Box::new(JsonPatternStore::new(dir.path().join("kb.json"))),
            0.30,
            5,
        );
        let settings = ScrapeSettings {
            max_retries: 0,
            ..ScrapeSettings::default()
        }
        .without_delays();
        let s = SiteScraper::new(Arc::new(Redirects { pages, to }), Arc::new(kb), settings);

        let report = s.scrape(broker("https://redir.test/a"), &CancellationToken::new()).await;
        assert!(report.succeeded());
        assert_eq!(report.pages_scraped, 1);
        assert_eq!(report.listings.len(), 3);
        assert_eq!(report.stop, StopReason::Revisit);
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let s = scraper(vec![("https://c.test/", 200, page(0..3, None))], &dir);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = s.scrape(broker("https://c.test/"), &cancel).await;
        assert_eq!(report.stop, StopReason::Cancelled);
        assert_eq!(report.pages_scraped, 0);
        assert!(report.succeeded());
    }
}
