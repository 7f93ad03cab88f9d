use std::collections::{BTreeSet, HashMap};
use std::fmt;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};

use super::{compact_text_len, visible_text};

/// Tags that can act as a listing card.
const CARD_TAGS: &str = "div, article, section, li, tr";
const MIN_DEPTH: usize = 3;
const MAX_DEPTH: usize = 15;
const MIN_MEMBERS: usize = 3;
/// Text length a member needs (beyond having a link) to count towards validity.
const MIN_MEMBER_TEXT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TextBucket {
    Short,
    Medium,
    Long,
}

impl TextBucket {
    fn from_len(len: usize) -> Self {
        if len > 200 {
            Self::Long
        } else if len >= 50 {
            Self::Medium
        } else {
            Self::Short
        }
    }

    fn as_str(self) -> &'static str {
        match self {
            Self::Short => "short",
            Self::Medium => "medium",
            Self::Long => "long",
        }
    }
}

/// Order-independent structural fingerprint of one element.
///
/// Its `Display` form (e.g. `div|children:a,h3,p|has_link|text:medium|has_price`)
/// is what the knowledge base remembers per domain.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StructuralSignature {
    pub tag: String,
    pub children: BTreeSet<String>,
    pub has_link: bool,
    pub has_image: bool,
    pub text: TextBucket,
    pub has_price: bool,
}

impl fmt::Display for StructuralSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag)?;
        if !self.children.is_empty() {
            let children: Vec<&str> = self.children.iter().map(String::as_str).collect();
            write!(f, "|children:{}", children.join(","))?;
        }
        if self.has_link {
            f.write_str("|has_link")?;
        }
        if self.has_image {
            f.write_str("|has_img")?;
        }
        write!(f, "|text:{}", self.text.as_str())?;
        if self.has_price {
            f.write_str("|has_price")?;
        }
        Ok(())
    }
}

/// A group of same-signature elements large enough to be a listing grid.
/// Only the members that carry a link and enough text are kept.
#[derive(Debug, Clone)]
pub struct CandidatePattern<'a> {
    pub signature: String,
    pub elements: Vec<ElementRef<'a>>,
    pub count: usize,
    pub avg_text_len: f64,
}

/// Finds repeating element structures in a parsed page.
#[derive(Debug)]
pub struct PatternDetector {
    cards: Selector,
    link: Selector,
    image: Selector,
    price: Regex,
}

impl Default for PatternDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl PatternDetector {
    pub fn new() -> Self {
        Self {
            cards: Selector::parse(CARD_TAGS).expect("valid card selector"),
            link: Selector::parse("a[href]").expect("valid link selector"),
            image: Selector::parse("img").expect("valid image selector"),
            price: Regex::new(r"\$[\d,]+").expect("valid price pattern"),
        }
    }

    pub fn signature(&self, element: ElementRef<'_>) -> StructuralSignature {
        let children = element
            .children()
            .filter_map(ElementRef::wrap)
            .map(|child| child.value().name().to_string())
            .collect();

        StructuralSignature {
            tag: element.value().name().to_string(),
            children,
            has_link: self.has_link(element),
            has_image: element.select(&self.image).next().is_some(),
            text: TextBucket::from_len(compact_text_len(element)),
            has_price: self.price.is_match(&visible_text(element)),
        }
    }

    /// Rank candidate listing groups on `doc`, largest first. Ties keep
    /// document order of each group's first member.
    pub fn find_patterns<'a>(&self, doc: &'a Html) -> Vec<CandidatePattern<'a>> {
        let mut order: Vec<(String, Vec<ElementRef<'a>>)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for element in self.card_elements(doc) {
            let key = self.signature(element).to_string();
            match index.get(&key) {
                Some(&i) => order[i].1.push(element),
                None => {
                    index.insert(key.clone(), order.len());
                    order.push((key, vec![element]));
                }
            }
        }

        let mut patterns: Vec<CandidatePattern<'a>> = order
            .into_iter()
            .filter(|(_, members)| members.len() >= MIN_MEMBERS)
            .filter_map(|(signature, members)| {
                let valid: Vec<ElementRef<'a>> = members
                    .into_iter()
                    .filter(|el| self.has_link(*el) && compact_text_len(*el) > MIN_MEMBER_TEXT)
                    .collect();
                if valid.len() < MIN_MEMBERS {
                    return None;
                }
                let total: usize = valid.iter().map(|el| visible_text(*el).chars().count()).sum();
                Some(CandidatePattern {
                    signature,
                    count: valid.len(),
                    avg_text_len: total as f64 / valid.len() as f64,
                    elements: valid,
                })
            })
            .collect();

        patterns.sort_by(|a, b| b.count.cmp(&a.count));
        patterns
    }

    /// Every in-depth card element whose signature renders as `signature`.
    /// Used to replay a remembered pattern without ranking candidates.
    pub fn elements_with_signature<'a>(&self, doc: &'a Html, signature: &str) -> Vec<ElementRef<'a>> {
        self.card_elements(doc)
            .filter(|el| self.signature(*el).to_string() == signature)
            .collect()
    }

    fn card_elements<'s, 'a: 's>(
        &'s self,
        doc: &'a Html,
    ) -> impl Iterator<Item = ElementRef<'a>> + 's {
        doc.select(&self.cards)
            .filter(|el| (MIN_DEPTH..=MAX_DEPTH).contains(&depth(*el)))
    }

    fn has_link(&self, element: ElementRef<'_>) -> bool {
        element.select(&self.link).next().is_some()
    }
}

/// Number of ancestors, counting the document root.
fn depth(element: ElementRef<'_>) -> usize {
    std::iter::successors(element.parent(), |node| node.parent()).count()
}
