use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use super::visible_text;

/// One way of spotting a "next page" control.
#[derive(Debug)]
enum NextMarker {
    Css(Selector),
    /// Anchor whose visible text contains the marker (case-insensitive).
    Text(&'static str),
}

/// Finds the URL of the page after the current one.
#[derive(Debug)]
pub struct Paginator {
    markers: Vec<NextMarker>,
    anchors: Selector,
    link: Selector,
    page_param: Regex,
    page_segment: Regex,
}

impl Default for Paginator {
    fn default() -> Self {
        Self::new()
    }
}

impl Paginator {
    pub fn new() -> Self {
        let css = |s: &str| NextMarker::Css(Selector::parse(s).expect("valid pagination selector"));
        Self {
            markers: vec![
                css("a.next"),
                css("a.next-page"),
                css(".pagination .next"),
                NextMarker::Text("next"),
                NextMarker::Text(">"),
                css(r#"a[rel="next"]"#),
                css(".pagination a:last-child"),
            ],
            anchors: Selector::parse("a").expect("valid anchor selector"),
            link: Selector::parse("a[href]").expect("valid link selector"),
            page_param: Regex::new(r"page=(\d+)").expect("valid page param pattern"),
            page_segment: Regex::new(r"/page/(\d+)").expect("valid page segment pattern"),
        }
    }

    /// Next page URL, or `None` when the page offers no way forward.
    ///
    /// Markers are tried in a fixed order; links that point nowhere (`#`,
    /// `javascript:`) or back at `current` are ignored. Without a usable
    /// link a numeric `page=N` query or `/page/N` path segment is bumped.
    pub fn next_page(&self, doc: &Html, current: &Url) -> Option<String> {
        self.markers
            .iter()
            .find_map(|marker| self.follow(marker, doc, current))
            .or_else(|| self.increment(current))
    }

    fn follow(&self, marker: &NextMarker, doc: &Html, current: &Url) -> Option<String> {
        let resolve = |el: ElementRef<'_>| self.resolve(el, current);
        match marker {
            NextMarker::Css(selector) => doc.select(selector).find_map(resolve),
            NextMarker::Text(needle) => doc
                .select(&self.anchors)
                .filter(|a| visible_text(*a).to_lowercase().contains(needle))
                .find_map(resolve),
        }
    }

    fn resolve(&self, element: ElementRef<'_>, current: &Url) -> Option<String> {
        let href = match element.value().attr("href") {
            Some(href) => href,
            None => element.select(&self.link).next()?.value().attr("href")?,
        };
        let href = href.trim();
        if href.is_empty() || href.starts_with('#') || href.to_lowercase().starts_with("javascript:") {
            return None;
        }
        let next = current.join(href).ok()?;
        (next != *current).then(|| next.to_string())
    }

    fn increment(&self, current: &Url) -> Option<String> {
        let mut next = current.clone();
        if let Some(query) = current.query() {
            if let Some(caps) = self.page_param.captures(query) {
                let n: u64 = caps[1].parse().ok()?;
                let bumped = self
                    .page_param
                    .replacen(query, 1, format!("page={}", n + 1).as_str())
                    .into_owned();
                next.set_query(Some(bumped.as_str()));
                return Some(next.to_string());
            }
        }
        let caps = self.page_segment.captures(current.path())?;
        let n: u64 = caps[1].parse().ok()?;
        let bumped = self
            .page_segment
            .replacen(current.path(), 1, format!("/page/{}", n + 1).as_str())
            .into_owned();
        next.set_path(&bumped);
        Some(next.to_string())
    }
}
