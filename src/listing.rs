use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::knowledge::domain_of;
use crate::parser::extract::ExtractedListing;
use crate::parser::money::normalize_state;
use crate::parser::vertical::VerticalFilter;

const ID_PREFIX: &str = "dl_";
const ID_HEX_CHARS: usize = 16;

/// A brokerage site to scrape. Field aliases accept CRM export column names.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Broker {
    #[serde(default, alias = "account", alias = "broker_id")]
    pub id: String,
    #[serde(default, alias = "companyname", alias = "company_name")]
    pub name: String,
    #[serde(alias = "listing_url", alias = "website")]
    pub url: String,
}

impl Broker {
    /// Fill a missing id or name from the site's domain.
    pub fn normalized(mut self) -> Self {
        self.url = self.url.trim().to_string();
        let domain = domain_of(&self.url).unwrap_or_else(|| self.url.clone());
        if self.id.trim().is_empty() {
            self.id = domain.clone();
        }
        if self.name.trim().is_empty() {
            self.name = domain;
        }
        self
    }
}

/// Stable identifier for a listing: a hash of its source URL.
pub fn listing_id(url: &str) -> String {
    let hash = blake3::hash(url.trim().as_bytes()).to_hex();
    format!("{ID_PREFIX}{}", &hash[..ID_HEX_CHARS])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingStatus {
    Active,
}

/// The public listing record written to every sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedListing {
    pub id: String,
    pub broker_id: String,
    pub broker_name: String,
    pub broker_url: String,
    pub source_url: String,
    pub title: String,
    pub description: String,
    pub price: Option<i64>,
    pub price_text: Option<String>,
    pub revenue: Option<i64>,
    pub cash_flow: Option<i64>,
    pub location: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub country: String,
    pub vertical: String,
    pub business_type: Option<String>,
    pub status: ListingStatus,
    pub content_hash: String,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub scraped_at: DateTime<Utc>,
}

impl NormalizedListing {
    pub fn from_extracted(ex: ExtractedListing, broker: &Broker, now: DateTime<Utc>) -> Self {
        let mut listing = Self {
            id: listing_id(&ex.url),
            broker_id: broker.id.clone(),
            broker_name: broker.name.clone(),
            broker_url: broker.url.clone(),
            source_url: ex.url,
            title: ex.title,
            description: ex.description,
            price: ex.price,
            price_text: ex.price_text,
            revenue: ex.revenue,
            cash_flow: ex.cash_flow,
            location: ex.location,
            city: ex.city,
            state: ex.state.as_deref().and_then(normalize_state),
            country: "US".to_string(),
            vertical: ex.vertical,
            business_type: ex.business_type,
            status: ListingStatus::Active,
            content_hash: String::new(),
            first_seen: now,
            last_seen: now,
            scraped_at: now,
        };
        listing.content_hash = listing.compute_content_hash();
        listing
    }

    /// Fold a later observation of the same listing into this one.
    /// `first_seen` never moves; gaps are filled from the newer record.
    pub fn observe(&mut self, later: &NormalizedListing) {
        debug_assert_eq!(self.id, later.id);
        self.last_seen = self.last_seen.max(later.last_seen);
        self.scraped_at = self.scraped_at.max(later.scraped_at);

        fn fill<T: Clone>(slot: &mut Option<T>, other: &Option<T>) {
            if slot.is_none() {
                slot.clone_from(other);
            }
        }
        fill(&mut self.price, &later.price);
        fill(&mut self.price_text, &later.price_text);
        fill(&mut self.revenue, &later.revenue);
        fill(&mut self.cash_flow, &later.cash_flow);
        fill(&mut self.location, &later.location);
        fill(&mut self.city, &later.city);
        fill(&mut self.state, &later.state);
        fill(&mut self.business_type, &later.business_type);
        self.content_hash = self.compute_content_hash();
    }

    /// Digest of the fields a reader would notice changing.
    pub fn compute_content_hash(&self) -> String {
        let opt = |v: Option<i64>| v.map(|n| n.to_string()).unwrap_or_default();
        let parts = format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.title,
            opt(self.price),
            opt(self.revenue),
            opt(self.cash_flow),
            self.city.as_deref().unwrap_or(""),
            self.state.as_deref().unwrap_or(""),
            self.description,
        );
        blake3::hash(parts.as_bytes()).to_hex()[..ID_HEX_CHARS].to_string()
    }
}

/// Outcome of the per-listing admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    RealEstate,
    OffVertical,
}

/// Drops property listings and, when configured, listings outside one vertical.
#[derive(Debug, Clone)]
pub struct ListingFilter {
    real_estate: Regex,
    vertical: Option<VerticalFilter>,
}

impl ListingFilter {
    pub fn new(vertical: Option<VerticalFilter>) -> Self {
        Self {
            real_estate: Regex::new(r"(?i)\bmls\s*#|\bidx\b|\d+\s*bed.*\d+\s*bath")
                .expect("valid real estate pattern"),
            vertical,
        }
    }

    pub fn admit(&self, listing: &ExtractedListing) -> Admission {
        if self.real_estate.is_match(&listing.full_text) {
            return Admission::RealEstate;
        }
        if let Some(filter) = self.vertical {
            let text = format!(
                "{} {} {}",
                listing.title,
                listing.description,
                listing.business_type.as_deref().unwrap_or("")
            );
            if !filter.matches(&text) {
                return Admission::OffVertical;
            }
        }
        Admission::Accepted
    }
}
