//! Maps free-text completions back onto the category vocabulary.
//!
//! Tiers run in a fixed priority order and the first hit wins:
//! exact name, name contained in the answer, then fuzzy similarity above a threshold.

use crate::models::Category;
use serde::Serialize;

const QUOTE_CHARS: &[char] = &['"', '\'', '\u{201C}', '\u{201D}', '\u{2018}', '\u{2019}', '`'];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMethod {
    Exact,
    Substring,
    Fuzzy,
}

impl MatchMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exact => "exact",
            Self::Substring => "substring",
            Self::Fuzzy => "fuzzy",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchResult {
    Matched {
        category: Category,
        method: MatchMethod,
        score: Option<f64>,
    },
    NoMatch,
}

impl MatchResult {
    pub fn category(&self) -> Option<&Category> {
        match self {
            Self::Matched { category, .. } => Some(category),
            Self::NoMatch => None,
        }
    }

    pub fn method(&self) -> Option<MatchMethod> {
        match self {
            Self::Matched { method, .. } => Some(*method),
            Self::NoMatch => None,
        }
    }
}

/// A category paired with its normalized name, computed once per resolve call.
pub struct Candidate<'a> {
    pub normalized: String,
    pub category: &'a Category,
}

pub struct Hit<'a> {
    pub category: &'a Category,
    pub score: Option<f64>,
}

pub trait Matcher: Send + Sync {
    fn method(&self) -> MatchMethod;

    /// `text` is already normalized.
    fn find<'a>(&self, text: &str, candidates: &[Candidate<'a>]) -> Option<Hit<'a>>;
}

pub struct ExactMatcher;

impl Matcher for ExactMatcher {
    fn method(&self) -> MatchMethod {
        MatchMethod::Exact
    }

    fn find<'a>(&self, text: &str, candidates: &[Candidate<'a>]) -> Option<Hit<'a>> {
        candidates
            .iter()
            .find(|c| !c.normalized.is_empty() && c.normalized == text)
            .map(|c| Hit {
                category: c.category,
                score: None,
            })
    }
}

/// First candidate in enumeration order whose name occurs inside the answer.
pub struct SubstringMatcher;

impl Matcher for SubstringMatcher {
    fn method(&self) -> MatchMethod {
        MatchMethod::Substring
    }

    fn find<'a>(&self, text: &str, candidates: &[Candidate<'a>]) -> Option<Hit<'a>> {
        candidates
            .iter()
            .find(|c| !c.normalized.is_empty() && text.contains(c.normalized.as_str()))
            .map(|c| Hit {
                category: c.category,
                score: None,
            })
    }
}

pub struct FuzzyMatcher {
    threshold: f64,
}

impl FuzzyMatcher {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl Matcher for FuzzyMatcher {
    fn method(&self) -> MatchMethod {
        MatchMethod::Fuzzy
    }

    fn find<'a>(&self, text: &str, candidates: &[Candidate<'a>]) -> Option<Hit<'a>> {
        let mut best: Option<Hit<'a>> = None;
        for candidate in candidates.iter().filter(|c| !c.normalized.is_empty()) {
            let score = similarity(text, &candidate.normalized);
            if score <= self.threshold {
                continue;
            }
            let better = best
                .as_ref()
                .and_then(|hit| hit.score)
                .is_none_or(|current| score > current);
            if better {
                best = Some(Hit {
                    category: candidate.category,
                    score: Some(score),
                });
            }
        }
        best
    }
}

pub struct CategoryResolver {
    matchers: Vec<Box<dyn Matcher>>,
}

impl CategoryResolver {
    pub fn new(fuzzy_threshold: f64) -> Self {
        Self::with_matchers(vec![
            Box::new(ExactMatcher),
            Box::new(SubstringMatcher),
            Box::new(FuzzyMatcher::new(fuzzy_threshold)),
        ])
    }

    pub fn with_matchers(matchers: Vec<Box<dyn Matcher>>) -> Self {
        Self { matchers }
    }

    pub fn resolve(&self, raw_text: &str, categories: &[Category]) -> MatchResult {
        let text = normalize(raw_text);
        if text.is_empty() {
            return MatchResult::NoMatch;
        }
        let candidates: Vec<Candidate<'_>> = categories
            .iter()
            .map(|category| Candidate {
                normalized: normalize(&category.name),
                category,
            })
            .collect();

        for matcher in &self.matchers {
            if let Some(hit) = matcher.find(&text, &candidates) {
                return MatchResult::Matched {
                    category: hit.category.clone(),
                    method: matcher.method(),
                    score: hit.score,
                };
            }
        }
        MatchResult::NoMatch
    }
}

pub fn normalize(raw: &str) -> String {
    raw.trim_matches(|c: char| c.is_whitespace() || QUOTE_CHARS.contains(&c))
        .to_lowercase()
}

/// Percentage similarity from recursively summed longest common substrings.
///
/// `2 * common / (len_a + len_b) * 100`, computed over chars. The common count
/// depends on which side is scanned first, so both directions are scored and the
/// higher one wins.
pub fn similarity(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 0.0;
    }
    let common = common_chars(&a, &b).max(common_chars(&b, &a));
    (common * 2 * 100) as f64 / total as f64
}

fn common_chars(a: &[char], b: &[char]) -> usize {
    let (pos_a, pos_b, len) = longest_common_run(a, b);
    if len == 0 {
        return 0;
    }
    len + common_chars(&a[..pos_a], &b[..pos_b])
        + common_chars(&a[pos_a + len..], &b[pos_b + len..])
}

/// Earliest longest common substring as `(start_a, start_b, len)`.
fn longest_common_run(a: &[char], b: &[char]) -> (usize, usize, usize) {
    let mut best = (0, 0, 0);
    let mut prev = vec![0usize; b.len() + 1];
    let mut row = vec![0usize; b.len() + 1];
    for i in 1..=a.len() {
        for j in 1..=b.len() {
            row[j] = if a[i - 1] == b[j - 1] { prev[j - 1] + 1 } else { 0 };
            if row[j] > best.2 {
                best = (i - row[j], j - row[j], row[j]);
            }
        }
        std::mem::swap(&mut prev, &mut row);
    }
    best
}
