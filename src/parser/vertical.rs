use clap::ValueEnum;
use serde::{Deserialize, Serialize};

/// Tag returned when no vertical keyword matches.
pub const OTHER: &str = "other";

/// Vertical → keywords, in declaration order. Order breaks score ties.
const VERTICAL_KEYWORDS: &[(&str, &[&str])] = &[
    (
        "cleaning",
        &[
            "cleaning",
            "janitorial",
            "custodial",
            "maid",
            "housekeeping",
            "carpet cleaning",
            "window cleaning",
            "pressure washing",
            "commercial cleaning",
            "residential cleaning",
        ],
    ),
    (
        "laundromat",
        &["laundromat", "laundry", "coin laundry", "wash and fold", "dry cleaning"],
    ),
    (
        "vending",
        &["vending", "vending machine", "atm route", "amusement", "arcade", "coin-op"],
    ),
    (
        "hvac",
        &[
            "hvac",
            "heating",
            "cooling",
            "air conditioning",
            "furnace",
            "ventilation",
            "refrigeration",
        ],
    ),
    (
        "landscaping",
        &[
            "landscape",
            "landscaping",
            "lawn care",
            "lawn maintenance",
            "irrigation",
            "tree service",
            "snow removal",
            "lawn mowing",
        ],
    ),
    ("pool", &["pool service", "pool cleaning", "pool maintenance", "pool route"]),
    ("pest", &["pest control", "exterminator", "termite", "pest management"]),
    ("plumbing", &["plumbing", "plumber", "drain", "sewer"]),
    ("electrical", &["electrical", "electrician", "electric service"]),
    ("automotive", &["auto repair", "car wash", "auto body", "mechanic", "tire"]),
    (
        "restaurant",
        &[
            "restaurant",
            "cafe",
            "diner",
            "bistro",
            "bar",
            "tavern",
            "food service",
            "catering",
        ],
    ),
    ("retail", &["retail", "store", "shop", "boutique"]),
    (
        "ecommerce",
        &["ecommerce", "e-commerce", "online business", "amazon", "shopify"],
    ),
    ("manufacturing", &["manufacturing", "fabrication", "production", "factory"]),
    ("distribution", &["distribution", "wholesale", "distributor", "logistics"]),
    ("professional", &["consulting", "accounting", "staffing", "insurance agency"]),
    (
        "healthcare",
        &["medical", "dental", "healthcare", "clinic", "pharmacy", "home health"],
    ),
];

/// Coarse business type → keywords. First match wins.
const BUSINESS_TYPES: &[(&str, &[&str])] = &[
    ("restaurant", &["restaurant", "cafe", "diner", "bistro"]),
    ("bar", &["bar", "tavern", "pub", "lounge"]),
    ("retail", &["store", "shop", "boutique"]),
    ("service", &["salon", "spa", "cleaning"]),
    ("manufacturing", &["manufacturing", "fabrication", "production"]),
    ("distribution", &["distribution", "wholesale", "logistics"]),
    ("franchise", &["franchise"]),
    ("ecommerce", &["ecommerce", "e-commerce", "online store", "amazon"]),
];

/// Keyword-scoring vertical classifier.
///
/// Every vertical is scored by how many of its keywords occur in the
/// lower-cased text (substring match); the highest score wins and ties go to
/// the vertical declared first. No hit at all gives [`OTHER`].
#[derive(Debug, Clone)]
pub struct VerticalClassifier {
    table: &'static [(&'static str, &'static [&'static str])],
}

impl Default for VerticalClassifier {
    fn default() -> Self {
        Self {
            table: VERTICAL_KEYWORDS,
        }
    }
}

impl VerticalClassifier {
    pub fn classify(&self, text: &str) -> &'static str {
        let lower = text.to_lowercase();
        let mut best: Option<(&'static str, usize)> = None;
        for (vertical, keywords) in self.table {
            let score = keywords.iter().filter(|kw| lower.contains(*kw)).count();
            if score == 0 {
                continue;
            }
            // Strictly greater keeps the earlier vertical on ties.
            if best.map_or(true, |(_, top)| score > top) {
                best = Some((vertical, score));
            }
        }
        best.map_or(OTHER, |(vertical, _)| vertical)
    }

    pub fn verticals(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.table.iter().map(|(vertical, _)| *vertical)
    }
}

/// Coarse business type from free text, first match in declaration order.
pub fn business_type(text: &str) -> Option<&'static str> {
    let lower = text.to_lowercase();
    BUSINESS_TYPES
        .iter()
        .find(|(_, keywords)| keywords.iter().any(|kw| lower.contains(kw)))
        .map(|(kind, _)| *kind)
}

/// Optional output restriction to one industry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum VerticalFilter {
    Cleaning,
    Landscape,
    Hvac,
    Vending,
}

impl VerticalFilter {
    pub fn label(self) -> &'static str {
        match self {
            Self::Cleaning => "Cleaning Services",
            Self::Landscape => "Landscape Services",
            Self::Hvac => "HVAC Services",
            Self::Vending => "Vending Services",
        }
    }

    fn include_keywords(self) -> &'static [&'static str] {
        match self {
            Self::Cleaning => &[
                "cleaning",
                "janitorial",
                "custodial",
                "sanitation",
                "maintenance",
                "maid service",
                "housekeeping",
                "carpet cleaning",
                "window cleaning",
                "pressure washing",
                "commercial cleaning",
                "residential cleaning",
                "floor care",
                "disinfection",
                "restoration",
            ],
            Self::Landscape => &[
                "landscape",
                "landscaping",
                "lawn care",
                "lawn maintenance",
                "irrigation",
                "hardscape",
                "tree service",
                "snow removal",
                "lawn mowing",
                "garden",
                "turf care",
                "lawn treatment",
                "landscape design",
                "outdoor living",
            ],
            Self::Hvac => &[
                "hvac",
                "heating",
                "cooling",
                "air conditioning",
                "furnace",
                "ventilation",
                "refrigeration",
                "climate control",
                "ductwork",
                "heat pump",
                "ac repair",
                "hvac contractor",
                "hvac service",
            ],
            Self::Vending => &[
                "vending",
                "vending machine",
                "atm",
                "amusement",
                "arcade",
                "coin-op",
                "laundromat",
                "car wash",
                "self-service",
            ],
        }
    }

    fn exclude_keywords(self) -> &'static [&'static str] {
        match self {
            Self::Cleaning => &[
                "restaurant",
                "food service",
                "hvac",
                "plumbing",
                "electrical",
                "landscaping",
                "lawn care",
                "pool",
                "spa",
                "salon",
            ],
            Self::Landscape => &[
                "restaurant",
                "food service",
                "hvac",
                "plumbing",
                "electrical",
                "cleaning",
                "janitorial",
                "pool",
                "spa",
            ],
            Self::Hvac => &[
                "restaurant",
                "food service",
                "cleaning",
                "janitorial",
                "landscaping",
                "lawn care",
                "pool",
                "spa",
                "plumbing",
                "electrical",
            ],
            Self::Vending => &[
                "restaurant",
                "food service",
                "hvac",
                "plumbing",
                "electrical",
                "landscaping",
                "lawn care",
                "cleaning",
                "janitorial",
            ],
        }
    }

    /// Include/exclude gate. Any exclude keyword rejects outright; otherwise
    /// at least one include keyword must appear.
    pub fn matches(self, text: &str) -> bool {
        let lower = text.to_lowercase();
        if self.exclude_keywords().iter().any(|kw| lower.contains(kw)) {
            return false;
        }
        self.include_keywords().iter().any(|kw| lower.contains(kw))
    }
}
