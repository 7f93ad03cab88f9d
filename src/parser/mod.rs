pub mod detect;
pub mod extract;
pub mod money;
pub mod paginate;
pub mod vertical;

use scraper::ElementRef;

/// Visible text of an element: every text node split on whitespace and
/// re-joined with single spaces.
pub fn visible_text(element: ElementRef<'_>) -> String {
    element
        .text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Length in chars of the element's text with each node trimmed and the
/// pieces concatenated without separators.
pub fn compact_text_len(element: ElementRef<'_>) -> usize {
    element.text().map(|t| t.trim().chars().count()).sum()
}

/// First `max` chars of `s`, never splitting a code point.
pub fn truncate_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}
