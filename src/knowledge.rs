use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use crate::error::StoreError;

/// What the knowledge base remembers about one domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DomainPattern {
    #[serde(default)]
    pub domain: String,
    pub pattern: String,
    pub success_count: u64,
    pub total_listings: u64,
    pub first_seen: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

/// Persistence collaborator for [`PatternKnowledgeBase`].
pub trait PatternStore: Send + Sync {
    fn load(&self) -> Result<HashMap<String, DomainPattern>, StoreError>;
    fn save(&self, patterns: &HashMap<String, DomainPattern>) -> Result<(), StoreError>;
}

/// Pretty-printed JSON object keyed by domain.
#[derive(Debug, Clone)]
pub struct JsonPatternStore {
    path: PathBuf,
}

impl JsonPatternStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl PatternStore for JsonPatternStore {
    fn load(&self) -> Result<HashMap<String, DomainPattern>, StoreError> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let raw = std::fs::read_to_string(&self.path)?;
        let mut patterns: HashMap<String, DomainPattern> = serde_json::from_str(&raw)?;
        for (domain, entry) in patterns.iter_mut() {
            entry.domain = domain.clone();
        }
        Ok(patterns)
    }

    fn save(&self, patterns: &HashMap<String, DomainPattern>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let sorted: BTreeMap<&String, &DomainPattern> = patterns.iter().collect();
        std::fs::write(&self.path, serde_json::to_string_pretty(&sorted)?)?;
        Ok(())
    }
}

/// Where a predicted signature came from.
#[derive(Debug, Clone, PartialEq)]
pub enum PredictionSource {
    Exact,
    Similar { domain: String, similarity: f64 },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub signature: String,
    pub source: PredictionSource,
}

/// Accumulated support for one signature during similar-domain prediction.
struct Vote<'a> {
    signature: &'a str,
    weight: f64,
    domain: &'a str,
    similarity: f64,
}

/// Aggregate counters for the `patterns` report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct KnowledgeStats {
    pub total_patterns: usize,
    pub total_scrapes: u64,
    pub total_listings: u64,
}

/// Per-domain memory of which structural signature produced listings.
///
/// Shared by every site worker; each operation holds the lock for its whole
/// read-modify-write and flushes through the store before releasing it.
pub struct PatternKnowledgeBase {
    patterns: Mutex<HashMap<String, DomainPattern>>,
    store: Box<dyn PatternStore>,
    similarity_threshold: f64,
    top_k: usize,
}

impl PatternKnowledgeBase {
    /// Load from `store`. An unreadable store starts the run with an empty
    /// memory instead of failing it.
    pub fn open(store: Box<dyn PatternStore>, similarity_threshold: f64, top_k: usize) -> Self {
        let patterns = match store.load() {
            Ok(patterns) => {
                info!(count = patterns.len(), "loaded learned patterns");
                patterns
            }
            Err(e) => {
                warn!(error = %e, "could not load pattern store, learning from scratch");
                HashMap::new()
            }
        };
        Self {
            patterns: Mutex::new(patterns),
            store,
            similarity_threshold,
            top_k,
        }
    }

    fn guard(&self) -> MutexGuard<'_, HashMap<String, DomainPattern>> {
        self.patterns.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remember that `signature` yielded `listing_count` listings on `url`'s
    /// domain. The latest success always replaces the stored signature.
    pub fn record_success(&self, url: &str, signature: &str, listing_count: usize) {
        let Some(domain) = domain_of(url) else {
            warn!(url, "cannot record pattern for url without a host");
            return;
        };
        let now = Utc::now();
        let mut patterns = self.guard();
        let entry = patterns.entry(domain.clone()).or_insert_with(|| DomainPattern {
            domain: domain.clone(),
            pattern: signature.to_string(),
            success_count: 0,
            total_listings: 0,
            first_seen: now,
            last_used: now,
        });
        entry.pattern = signature.to_string();
        entry.success_count += 1;
        entry.total_listings += listing_count as u64;
        entry.last_used = now;
        debug!(%domain, signature, listing_count, "recorded pattern success");

        if let Err(e) = self.store.save(&patterns) {
            warn!(error = %e, %domain, "could not persist learned pattern");
        }
    }

    pub fn lookup(&self, domain: &str) -> Option<DomainPattern> {
        let domain = domain.trim().to_lowercase();
        self.guard().get(domain.trim_start_matches("www.")).cloned()
    }

    /// Stored signature for `url`'s domain, no matter what the page shows.
    pub fn cached_signature(&self, url: &str) -> Option<String> {
        let domain = domain_of(url)?;
        self.guard().get(&domain).map(|p| p.pattern.clone())
    }

    /// Pick the most likely signature among `candidates` for `url`.
    ///
    /// A known domain answers with its own signature when that signature is
    /// still on the page. Otherwise the most similar known domains vote,
    /// each weighted by similarity times its success count.
    pub fn predict(&self, url: &str, candidates: &[String]) -> Option<Prediction> {
        let domain = domain_of(url)?;
        let present: HashSet<&str> = candidates.iter().map(String::as_str).collect();
        let patterns = self.guard();

        if let Some(known) = patterns.get(&domain) {
            if present.contains(known.pattern.as_str()) {
                return Some(Prediction {
                    signature: known.pattern.clone(),
                    source: PredictionSource::Exact,
                });
            }
            debug!(%domain, "stored pattern not on page, asking similar domains");
        }

        let mut similar: Vec<(&DomainPattern, f64)> = patterns
            .values()
            .filter(|p| p.domain != domain)
            .map(|p| (p, trigram_similarity(&domain, &p.domain)))
            .filter(|(_, sim)| *sim > self.similarity_threshold)
            .collect();
        similar.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.domain.cmp(&b.0.domain)));
        similar.truncate(self.top_k);

        // Votes keep first-seen order, so on equal weight the most similar
        // domain's signature wins.
        let mut votes: Vec<Vote<'_>> = Vec::new();
        for (entry, similarity) in similar {
            if !present.contains(entry.pattern.as_str()) {
                continue;
            }
            let weight = similarity * entry.success_count as f64;
            match votes.iter_mut().find(|v| v.signature == entry.pattern) {
                Some(vote) => vote.weight += weight,
                None => votes.push(Vote {
                    signature: &entry.pattern,
                    weight,
                    domain: &entry.domain,
                    similarity,
                }),
            }
        }

        let mut best: Option<&Vote<'_>> = None;
        for vote in &votes {
            if best.map_or(true, |b| vote.weight > b.weight) {
                best = Some(vote);
            }
        }
        best.map(|vote| Prediction {
            signature: vote.signature.to_string(),
            source: PredictionSource::Similar {
                domain: vote.domain.to_string(),
                similarity: vote.similarity,
            },
        })
    }

    pub fn stats(&self) -> KnowledgeStats {
        let patterns = self.guard();
        KnowledgeStats {
            total_patterns: patterns.len(),
            total_scrapes: patterns.values().map(|p| p.success_count).sum(),
            total_listings: patterns.values().map(|p| p.total_listings).sum(),
        }
    }

    /// Snapshot of all entries, most successful first.
    pub fn entries(&self) -> Vec<DomainPattern> {
        let mut entries: Vec<DomainPattern> = self.guard().values().cloned().collect();
        entries.sort_by(|a, b| {
            b.success_count
                .cmp(&a.success_count)
                .then_with(|| a.domain.cmp(&b.domain))
        });
        entries
    }
}

/// Host of `url` with a leading `www.` removed.
pub fn domain_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_lowercase();
    Some(host.trim_start_matches("www.").to_string())
}

/// Jaccard similarity of the two strings' character trigram sets.
pub fn trigram_similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let ta: HashSet<&[char]> = a.windows(3).collect();
    let tb: HashSet<&[char]> = b.windows(3).collect();
    if ta.is_empty() || tb.is_empty() {
        return 0.0;
    }
    let shared = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    shared as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kb(dir: &tempfile::TempDir) -> PatternKnowledgeBase {
        let store = JsonPatternStore::new(dir.path().join("patterns.json"));
        PatternKnowledgeBase::open(Box::new(store), 0.30, 5)
    }

    #[test]
    fn success_is_counted_and_last_signature_wins() {
        let dir = tempfile::tempdir().unwrap();
        let kb = kb(&dir);

        kb.record_success("https://sunbeltnetwork.com/x", "sigA", 42);
        let entry = kb.lookup("sunbeltnetwork.com").unwrap();
        assert_eq!(entry.success_count, 1);
        assert_eq!(entry.total_listings, 42);
        assert_eq!(entry.pattern, "sigA");

        kb.record_success("https://www.sunbeltnetwork.com/y", "sigB", 10);
        let entry = kb.lookup("sunbeltnetwork.com").unwrap();
        assert_eq!(entry.success_count, 2);
        assert_eq!(entry.total_listings, 52);
        assert_eq!(entry.pattern, "sigB");
        assert!(entry.last_used >= entry.first_seen);
    }

    #[test]
    fn store_is_written_through() {
        let dir = tempfile::tempdir().unwrap();
        kb(&dir).record_success("https://www.bizbuysell.com/texas", "div|text:medium", 12);

        let reopened = kb(&dir);
        let entry = reopened.lookup("bizbuysell.com").unwrap();
        assert_eq!(entry.domain, "bizbuysell.com");
        assert_eq!(entry.total_listings, 12);
        assert_eq!(
            reopened.stats(),
            KnowledgeStats {
                total_patterns: 1,
                total_scrapes: 1,
                total_listings: 12
            }
        );
    }

    #[test]
    fn unreadable_store_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patterns.json");
        std::fs::write(&path, "not json").unwrap();
        let kb = PatternKnowledgeBase::open(Box::new(JsonPatternStore::new(&path)), 0.30, 5);
        assert_eq!(kb.stats().total_patterns, 0);
    }

    #[test]
    fn unwritable_store_does_not_panic() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the file should be makes every save fail.
        let path = dir.path().join("patterns.json");
        std::fs::create_dir(&path).unwrap();
        let kb = PatternKnowledgeBase::open(Box::new(JsonPatternStore::new(&path)), 0.30, 5);
        kb.record_success("https://a-brokers.com", "sig", 3);
        assert_eq!(kb.lookup("a-brokers.com").unwrap().success_count, 1);
    }

    #[test]
    fn exact_domain_prediction_requires_presence() {
        let dir = tempfile::tempdir().unwrap();
        let kb = kb(&dir);
        kb.record_success("https://sunbeltnetwork.com/", "sigA", 5);

        let hit = kb
            .predict("https://www.sunbeltnetwork.com/page/2", &["sigZ".into(), "sigA".into()])
            .unwrap();
        assert_eq!(hit.signature, "sigA");
        assert_eq!(hit.source, PredictionSource::Exact);

        assert_eq!(kb.predict("https://sunbeltnetwork.com/", &["sigZ".into()]), None);
        assert_eq!(kb.cached_signature("https://sunbeltnetwork.com/"), Some("sigA".into()));
    }

    #[test]
    fn similar_domains_vote_by_weight() {
        let dir = tempfile::tempdir().unwrap();
        let kb = kb(&dir);
        kb.record_success("https://transworlddallas.com", "table", 10);
        kb.record_success("https://transworldflorida.com", "grid", 10);
        kb.record_success("https://transworldflorida.com", "grid", 10);
        kb.record_success("https://unrelated.org", "cards", 10);

        // dallas is closer (0.52) but florida has twice the successes (2 x 0.38).
        let candidates = vec!["table".to_string(), "grid".to_string(), "cards".to_string()];
        let hit = kb.predict("https://transworldtexas.com", &candidates).unwrap();
        assert_eq!(hit.signature, "grid");
        match hit.source {
            PredictionSource::Similar { domain, similarity } => {
                assert_eq!(domain, "transworldflorida.com");
                assert!(similarity > 0.30);
            }
            other => panic!("unexpected source {other:?}"),
        }

        let only_table = vec!["table".to_string()];
        assert_eq!(
            kb.predict("https://transworldtexas.com", &only_table).map(|p| p.signature),
            Some("table".into())
        );
        assert_eq!(kb.predict("https://transworldtexas.com", &["other".into()]), None);
        assert_eq!(kb.predict("https://zzz.net", &candidates), None);
    }

    #[test]
    fn trigram_similarity_bounds() {
        assert_eq!(trigram_similarity("abcd", "abcd"), 1.0);
        assert_eq!(trigram_similarity("ab", "abcd"), 0.0);
        assert_eq!(trigram_similarity("abc", "xyz"), 0.0);
        let s = trigram_similarity("transworldtexas.com", "transworlddallas.com");
        assert!(s > 0.3 && s < 1.0, "{s}");
    }

    #[test]
    fn domains_are_normalized() {
        assert_eq!(domain_of("https://www.Example.com/a?b=c"), Some("example.com".into()));
        assert_eq!(domain_of("not a url"), None);
    }

    #[test]
    fn lookup_ignores_host_case() {
        let dir = tempfile::tempdir().unwrap();
        let kb = kb(&dir);
        kb.record_success("https://www.Sunbelt.com/x", "li|text:long", 8);

        assert_eq!(kb.lookup("sunbelt.com").unwrap().domain, "sunbelt.com");
        assert!(kb.lookup("Sunbelt.com").is_some());
        assert!(kb.lookup("WWW.SUNBELT.COM").is_some());
        assert!(kb.lookup("sunbelt.org").is_none());
    }
}
