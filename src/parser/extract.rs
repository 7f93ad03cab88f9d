use regex::Regex;
use scraper::{ElementRef, Selector};
use serde::{Deserialize, Serialize};
use url::Url;

use super::money::{parse_money, LocationParser};
use super::vertical::{business_type, VerticalClassifier};
use super::{truncate_chars, visible_text};

const MIN_TEXT: usize = 30;
const DESCRIPTION_CHARS: usize = 500;
const FALLBACK_TITLE_CHARS: usize = 100;
const REVENUE_FLOOR: i64 = 10_000;
const CASH_FLOW_FLOOR: i64 = 1_000;

/// URL fragments that mark navigation rather than a listing page.
const NON_LISTING_MARKERS: [&str; 4] = ["#", "javascript:", "/contact", "/about"];

const TITLE_TAGS: [&str; 8] = ["h1", "h2", "h3", "h4", "h5", "h6", "strong", "b"];

const REVENUE_LABELS: [&str; 4] = ["revenue", "gross sales", "annual sales", "sales"];
const CASH_FLOW_LABELS: [&str; 6] = [
    "cash flow",
    "net income",
    "ebitda",
    "sde",
    "seller'?s discretionary earnings",
    "owner benefit",
];

/// Amount after a label: optional `$`, digits with separators, optional
/// decimals and a k/m suffix.
const AMOUNT: &str = r"[:\s]*\$?\s*(\d[\d,]*(?:\.\d+)?(?:[km]\b)?)";

/// A `$` figure as written on a card: `$1,250,000`, `$850K`, `$1.5M`.
const DOLLAR: &str = r"\$\d+(?:,\d{3})*(?:\.\d+)?(?:[km]\b)?";

/// Fields pulled out of one listing card.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtractedListing {
    pub title: String,
    pub url: String,
    pub price: Option<i64>,
    pub price_text: Option<String>,
    pub location: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub revenue: Option<i64>,
    pub cash_flow: Option<i64>,
    pub vertical: String,
    pub business_type: Option<String>,
    pub description: String,
    pub full_text: String,
}

/// Why a card was skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    TooShort,
    NoLink,
    UnresolvableUrl,
    NonListingUrl,
}

/// Heuristic field extractor for a single candidate element.
#[derive(Debug)]
pub struct SmartExtractor {
    link: Selector,
    anchor: Selector,
    title_tags: Vec<Selector>,
    dollar: Regex,
    asking: Regex,
    labelled_figure: Regex,
    sentence_break: Regex,
    revenue: Vec<Regex>,
    cash_flow: Vec<Regex>,
    locations: LocationParser,
    classifier: VerticalClassifier,
}

impl Default for SmartExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl SmartExtractor {
    pub fn new() -> Self {
        let labelled = |labels: &[&str]| -> Vec<Regex> {
            labels
                .iter()
                .map(|label| {
                    Regex::new(&format!(r"(?i)\b{label}\b{AMOUNT}")).expect("valid figure pattern")
                })
                .collect()
        };
        let all_labels = REVENUE_LABELS
            .iter()
            .chain(CASH_FLOW_LABELS.iter())
            .copied()
            .collect::<Vec<_>>()
            .join("|");

        Self {
            link: Selector::parse("a[href]").expect("valid link selector"),
            anchor: Selector::parse("a").expect("valid anchor selector"),
            title_tags: TITLE_TAGS
                .iter()
                .map(|tag| Selector::parse(tag).expect("valid title selector"))
                .collect(),
            dollar: Regex::new(&format!("(?i){DOLLAR}")).expect("valid dollar pattern"),
            asking: Regex::new(&format!(
                r"(?i)\b(?:asking\s+price|asking|list\s+price|price)\s*:?\s*({DOLLAR})"
            ))
            .expect("valid asking pattern"),
            labelled_figure: Regex::new(&format!(
                r"(?i)\b(?:{all_labels})\b[:\s]*{DOLLAR}|{DOLLAR}\s+(?:in|of)\s+(?:{all_labels})\b"
            ))
            .expect("valid labelled figure pattern"),
            sentence_break: Regex::new(r"[.!?]\s+").expect("valid sentence pattern"),
            revenue: labelled(&REVENUE_LABELS),
            cash_flow: labelled(&CASH_FLOW_LABELS),
            locations: LocationParser::new(),
            classifier: VerticalClassifier::default(),
        }
    }

    /// Extract one listing from `element`, resolving links against `base`.
    pub fn extract(&self, element: ElementRef<'_>, base: &Url) -> Result<ExtractedListing, Rejection> {
        let text = visible_text(element);
        if text.chars().count() < MIN_TEXT {
            return Err(Rejection::TooShort);
        }

        let href = self.find_href(element).ok_or(Rejection::NoLink)?;
        let url = base
            .join(href.trim())
            .map_err(|_| Rejection::UnresolvableUrl)?
            .to_string();
        let lower_url = url.to_lowercase();
        if NON_LISTING_MARKERS.iter().any(|m| lower_url.contains(m)) {
            return Err(Rejection::NonListingUrl);
        }

        let title = self.title(element, &text);
        let price_text = self.price_text(&text);
        let price = price_text.as_deref().and_then(parse_money);
        let location = self.locations.find_location(&text);
        let (city, state) = location
            .as_deref()
            .map(|loc| self.locations.city_state(loc))
            .unwrap_or((None, None));
        let revenue = first_figure(&self.revenue, &text, REVENUE_FLOOR);
        let cash_flow = first_figure(&self.cash_flow, &text, CASH_FLOW_FLOOR);
        let vertical = self.classifier.classify(&format!("{title} {text}")).to_string();

        Ok(ExtractedListing {
            business_type: business_type(&text).map(str::to_string),
            description: truncate_chars(&text, DESCRIPTION_CHARS),
            title,
            url,
            price,
            price_text,
            location,
            city,
            state,
            revenue,
            cash_flow,
            vertical,
            full_text: text,
        })
    }

    /// Descendant link first, then an enclosing anchor.
    fn find_href<'a>(&self, element: ElementRef<'a>) -> Option<&'a str> {
        if let Some(a) = element.select(&self.link).next() {
            return a.value().attr("href");
        }
        std::iter::successors(element.parent(), |node| node.parent())
            .filter_map(ElementRef::wrap)
            .find(|el| el.value().name() == "a" && el.value().attr("href").is_some())
            .and_then(|a| a.value().attr("href"))
    }

    fn title(&self, element: ElementRef<'_>, text: &str) -> String {
        let fits = |s: &str| {
            let n = s.chars().count();
            n > 10 && n < 200
        };

        for selector in &self.title_tags {
            if let Some(el) = element.select(selector).next() {
                let t = visible_text(el);
                if fits(&t) {
                    return t;
                }
            }
        }

        if let Some(a) = element.select(&self.anchor).next() {
            let t = visible_text(a);
            if fits(&t) {
                return t;
            }
        }

        if let Some(sentence) = self
            .sentence_break
            .split(text)
            .map(str::trim)
            .find(|s| fits(s))
        {
            return sentence.to_string();
        }

        truncate_chars(text, FALLBACK_TITLE_CHARS)
    }

    /// The displayed asking price. An explicit asking/price label wins;
    /// otherwise the largest `$` figure that is not a labelled revenue or
    /// cash-flow number, falling back to the largest figure overall.
    fn price_text(&self, text: &str) -> Option<String> {
        if let Some(caps) = self.asking.captures(text) {
            return Some(caps[1].to_string());
        }

        let labelled: Vec<(usize, usize)> = self
            .labelled_figure
            .find_iter(text)
            .map(|m| (m.start(), m.end()))
            .collect();
        let figures: Vec<(i64, &str, bool)> = self
            .dollar
            .find_iter(text)
            .filter_map(|m| {
                let value = parse_money(m.as_str())?;
                let is_labelled = labelled.iter().any(|(s, e)| m.start() >= *s && m.start() < *e);
                Some((value, m.as_str(), is_labelled))
            })
            .collect();

        let largest = |want_unlabelled: bool| {
            figures
                .iter()
                .filter(|(_, _, labelled)| !want_unlabelled || !labelled)
                .max_by_key(|(value, _, _)| *value)
                .map(|(_, raw, _)| raw.to_string())
        };
        largest(true).or_else(|| largest(false))
    }
}

/// First labelled figure, in pattern order, whose value clears `floor`.
fn first_figure(patterns: &[Regex], text: &str, floor: i64) -> Option<i64> {
    patterns.iter().find_map(|re| {
        re.captures_iter(text)
            .filter_map(|caps| parse_money(&caps[1]))
            .find(|value| *value > floor)
    })
}
