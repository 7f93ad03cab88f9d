use regex::Regex;

/// Full state names (upper case) to USPS codes, including the federal district.
const STATE_NAMES: [(&str, &str); 51] = [
    ("ALABAMA", "AL"),
    ("ALASKA", "AK"),
    ("ARIZONA", "AZ"),
    ("ARKANSAS", "AR"),
    ("CALIFORNIA", "CA"),
    ("COLORADO", "CO"),
    ("CONNECTICUT", "CT"),
    ("DELAWARE", "DE"),
    ("FLORIDA", "FL"),
    ("GEORGIA", "GA"),
    ("HAWAII", "HI"),
    ("IDAHO", "ID"),
    ("ILLINOIS", "IL"),
    ("INDIANA", "IN"),
    ("IOWA", "IA"),
    ("KANSAS", "KS"),
    ("KENTUCKY", "KY"),
    ("LOUISIANA", "LA"),
    ("MAINE", "ME"),
    ("MARYLAND", "MD"),
    ("MASSACHUSETTS", "MA"),
    ("MICHIGAN", "MI"),
    ("MINNESOTA", "MN"),
    ("MISSISSIPPI", "MS"),
    ("MISSOURI", "MO"),
    ("MONTANA", "MT"),
    ("NEBRASKA", "NE"),
    ("NEVADA", "NV"),
    ("NEW HAMPSHIRE", "NH"),
    ("NEW JERSEY", "NJ"),
    ("NEW MEXICO", "NM"),
    ("NEW YORK", "NY"),
    ("NORTH CAROLINA", "NC"),
    ("NORTH DAKOTA", "ND"),
    ("OHIO", "OH"),
    ("OKLAHOMA", "OK"),
    ("OREGON", "OR"),
    ("PENNSYLVANIA", "PA"),
    ("RHODE ISLAND", "RI"),
    ("SOUTH CAROLINA", "SC"),
    ("SOUTH DAKOTA", "SD"),
    ("TENNESSEE", "TN"),
    ("TEXAS", "TX"),
    ("UTAH", "UT"),
    ("VERMONT", "VT"),
    ("VIRGINIA", "VA"),
    ("WASHINGTON", "WA"),
    ("WEST VIRGINIA", "WV"),
    ("WISCONSIN", "WI"),
    ("WYOMING", "WY"),
    ("DISTRICT OF COLUMBIA", "DC"),
];

/// Parse a free-form money string into whole dollars.
///
/// Currency symbols, thousands separators and whitespace are ignored. A single
/// trailing `k`/`K` multiplies by 1,000 and `m`/`M` by 1,000,000. Anything that
/// does not leave a finite number behind yields `None`.
pub fn parse_money(text: &str) -> Option<i64> {
    let cleaned: String = text
        .chars()
        .filter(|c| !matches!(c, '$' | ',' | '€' | '£') && !c.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }

    let (number, multiplier) = match cleaned.chars().last() {
        Some('k' | 'K') => (&cleaned[..cleaned.len() - 1], 1_000.0),
        Some('m' | 'M') => (&cleaned[..cleaned.len() - 1], 1_000_000.0),
        _ => (cleaned.as_str(), 1.0),
    };

    let value = number.parse::<f64>().ok()? * multiplier;
    value.is_finite().then(|| value.round() as i64)
}

/// Normalize a state to its two-letter code. Two-letter input passes through
/// upper-cased; full names go through the lookup table.
pub fn normalize_state(state: &str) -> Option<String> {
    let state = state.trim().to_uppercase();
    if state.is_empty() {
        return None;
    }
    if state.chars().count() == 2 {
        return Some(state);
    }
    STATE_NAMES
        .iter()
        .find(|(name, _)| *name == state)
        .map(|(_, code)| code.to_string())
}

/// City/state recognizer. Owns its compiled patterns so callers can hold
/// one per component.
#[derive(Debug, Clone)]
pub struct LocationParser {
    city_code: Regex,
    city_name: Regex,
    state_code: Regex,
}

impl Default for LocationParser {
    fn default() -> Self {
        Self::new()
    }
}

impl LocationParser {
    pub fn new() -> Self {
        Self {
            city_code: Regex::new(r"\b([A-Z][a-z]+(?:\s+[A-Z][a-z]+)*),\s*([A-Z]{2})\b")
                .expect("valid city/code pattern"),
            city_name: Regex::new(
                r"\b([A-Z][a-z]+(?:\s+[A-Z][a-z]+)*),\s*([A-Z][a-z]+(?:\s+[A-Z][a-z]+)*)\b",
            )
            .expect("valid city/name pattern"),
            state_code: Regex::new(r"\b([A-Z]{2})\b").expect("valid state code pattern"),
        }
    }

    /// First `"City Name, ST"` span in `text`, as written.
    pub fn find_location(&self, text: &str) -> Option<String> {
        self.city_code
            .captures(text)
            .map(|caps| format!("{}, {}", &caps[1], &caps[2]))
    }

    /// Split a location string into `(city, state)`.
    ///
    /// Tries `"City, ST"`, then `"City, State Name"` (only when the name is a
    /// real state), then any standalone two-letter upper-case token as a bare
    /// state.
    pub fn city_state(&self, text: &str) -> (Option<String>, Option<String>) {
        if text.trim().is_empty() {
            return (None, None);
        }
        if let Some(caps) = self.city_code.captures(text) {
            return (Some(caps[1].trim().to_string()), Some(caps[2].to_string()));
        }
        for caps in self.city_name.captures_iter(text) {
            if let Some(code) = normalize_state(&caps[2]) {
                return (Some(caps[1].trim().to_string()), Some(code));
            }
        }
        match self.state_code.captures(text) {
            Some(caps) => (None, Some(caps[1].to_string())),
            None => (None, None),
        }
    }
}

/// One-off convenience over [`LocationParser::city_state`].
pub fn extract_city_state(text: &str) -> (Option<String>, Option<String>) {
    LocationParser::new().city_state(text)
}
