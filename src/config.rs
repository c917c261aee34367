use std::{env, str::FromStr, time::Duration};

pub const MIN_CHUNK_SIZE: usize = 1;
pub const MAX_CHUNK_SIZE: usize = 20;
pub const DEFAULT_CHUNK_SIZE: usize = 5;
pub const DEFAULT_FUZZY_THRESHOLD: f64 = 70.0;
pub const DEFAULT_MAX_PROMPT_CATEGORIES: usize = 250;

/// Knobs for the categorization sweep. Read once at startup.
#[derive(Debug, Clone)]
pub struct MatcherConfig {
    pub chunk_size: usize,
    pub fuzzy_threshold: f64,
    /// `None` enumerates every category in the classification prompt.
    pub max_prompt_categories: Option<usize>,
    pub chunk_delay: Duration,
    pub unmatched_category: String,
    pub uncategorized_name: String,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            fuzzy_threshold: DEFAULT_FUZZY_THRESHOLD,
            max_prompt_categories: Some(DEFAULT_MAX_PROMPT_CATEGORIES),
            chunk_delay: Duration::from_millis(750),
            unmatched_category: "Unmatched".into(),
            uncategorized_name: "Uncategorized".into(),
        }
    }
}

impl MatcherConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let max_prompt_categories =
            match env_parse::<usize>("MATCHER_MAX_PROMPT_CATEGORIES") {
                Some(0) => None,
                Some(limit) => Some(limit),
                None => defaults.max_prompt_categories,
            };
        Self {
            chunk_size: clamp_chunk_size(
                env_parse("MATCHER_CHUNK_SIZE").unwrap_or(defaults.chunk_size),
            ),
            fuzzy_threshold: env_parse::<f64>("MATCHER_FUZZY_THRESHOLD")
                .filter(|v| (0.0..=100.0).contains(v))
                .unwrap_or(defaults.fuzzy_threshold),
            max_prompt_categories,
            chunk_delay: env_parse::<u64>("MATCHER_CHUNK_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.chunk_delay),
            unmatched_category: env_string("MATCHER_UNMATCHED_CATEGORY")
                .unwrap_or(defaults.unmatched_category),
            uncategorized_name: env_string("MATCHER_UNCATEGORIZED_SLUG")
                .unwrap_or(defaults.uncategorized_name),
        }
    }
}

pub fn clamp_chunk_size(value: usize) -> usize {
    value.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE)
}

/// Per-call network budgets.
#[derive(Debug, Clone, Copy)]
pub struct Timeouts {
    pub completion: Duration,
    pub batch_completion: Duration,
    pub site_fetch: Duration,
    pub connect: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            completion: Duration::from_secs(30),
            batch_completion: Duration::from_secs(45),
            site_fetch: Duration::from_secs(15),
            connect: Duration::from_secs(5),
        }
    }
}

impl Timeouts {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            completion: env_secs("COMPLETION_TIMEOUT_SECS").unwrap_or(defaults.completion),
            batch_completion: env_secs("BATCH_COMPLETION_TIMEOUT_SECS")
                .unwrap_or(defaults.batch_completion),
            site_fetch: env_secs("SITE_FETCH_TIMEOUT_SECS").unwrap_or(defaults.site_fetch),
            connect: env_secs("HTTP_CONNECT_TIMEOUT_SECS").unwrap_or(defaults.connect),
        }
    }
}

pub fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

pub fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_secs(key: &str) -> Option<Duration> {
    env_parse::<u64>(key)
        .filter(|v| *v > 0)
        .map(Duration::from_secs)
}
