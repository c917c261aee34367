use crate::{
    http::build_client,
    llm::{CompletionRequest, CompletionService, ModelParams},
    models::{ItemId, ItemSummary},
    pipeline::{Pipeline, PipelineError},
    prompt::{MAX_BATCH_TITLES, NOT_FOUND, build_batch_extraction_prompt},
    store::{CategoryStore, ProductStore},
};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{collections::HashSet, sync::Arc, time::Duration};
use thiserror::Error;
use tracing::{info, warn};

pub const MAX_SITE_URLS: usize = 2;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("site returned HTTP {0}")]
    Status(u16),
}

#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<String, FetchError>;
}

pub struct HttpPageFetcher {
    http: Client,
}

impl HttpPageFetcher {
    pub fn new(timeout: Duration, connect_timeout: Duration) -> Self {
        Self {
            http: build_client(timeout, connect_timeout),
        }
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|err| FetchError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }
        response
            .text()
            .await
            .map_err(|err| FetchError::Transport(err.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ItemCategoryGuess {
    pub item_id: ItemId,
    pub title: String,
    pub category: String,
}

impl ItemCategoryGuess {
    fn pending(item: &ItemSummary) -> Self {
        Self {
            item_id: item.id,
            title: item.title.clone(),
            category: NOT_FOUND.to_string(),
        }
    }

    pub fn is_found(&self) -> bool {
        self.category != NOT_FOUND
    }
}

/// Asks the completion service which category a handful of external pages give each item.
pub struct ExternalSiteResolver {
    fetcher: Arc<dyn PageFetcher>,
    llm: Arc<dyn CompletionService>,
    params: ModelParams,
    timeout: Duration,
}

impl ExternalSiteResolver {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        llm: Arc<dyn CompletionService>,
        params: ModelParams,
        timeout: Duration,
    ) -> Self {
        Self {
            fetcher,
            llm,
            params: params.for_batch(),
            timeout,
        }
    }

    pub fn for_pipeline(fetcher: Arc<dyn PageFetcher>, pipeline: &Pipeline) -> Self {
        Self::new(
            fetcher,
            pipeline.llm.clone(),
            pipeline.params,
            pipeline.timeouts.batch_completion,
        )
    }

    /// One guess per distinct item, in input order. Items nobody could place stay `"not found"`.
    pub async fn check_sites_for_items(
        &self,
        items: &[ItemSummary],
        urls: &[String],
        instructions: Option<&str>,
    ) -> Result<Vec<ItemCategoryGuess>, PipelineError> {
        let urls = validate_urls(urls)?;
        self.llm
            .ensure_configured()
            .map_err(|err| PipelineError::from_completion("external_check", err))?;

        let mut seen = HashSet::new();
        let mut guesses: Vec<ItemCategoryGuess> = items
            .iter()
            .filter(|item| seen.insert(item.id))
            .map(ItemCategoryGuess::pending)
            .collect();
        for url in urls {
            let pending: Vec<usize> = guesses
                .iter()
                .enumerate()
                .filter(|(_, guess)| !guess.is_found())
                .map(|(idx, _)| idx)
                .collect();
            if pending.is_empty() {
                break;
            }

            let html = match self.fetcher.fetch(url).await {
                Ok(body) if !body.trim().is_empty() => body,
                Ok(_) => {
                    warn!(target = "catmatch.external", url, "site_body_empty");
                    continue;
                }
                Err(err) => {
                    warn!(target = "catmatch.external", url, error = %err, "site_fetch_failed");
                    continue;
                }
            };

            for batch in pending.chunks(MAX_BATCH_TITLES) {
                let titles: Vec<String> = batch.iter().map(|idx| guesses[*idx].title.clone()).collect();
                let map = self.extract_batch(&titles, &html, instructions).await;
                for idx in batch {
                    let guess = &mut guesses[*idx];
                    if let Some(map) = &map
                        && let Some(category) = lookup_category(map, &guess.title)
                    {
                        guess.category = category;
                    }
                }
            }
            info!(
                target = "catmatch.external",
                url,
                checked = pending.len(),
                found = guesses.iter().filter(|g| g.is_found()).count(),
                "site_checked"
            );
        }
        Ok(guesses)
    }

    async fn extract_batch(
        &self,
        titles: &[String],
        html: &str,
        instructions: Option<&str>,
    ) -> Option<Map<String, Value>> {
        let prompt = build_batch_extraction_prompt(titles, html, instructions);
        let request = CompletionRequest::new(prompt, self.params, self.timeout);
        match self.llm.complete(&request).await {
            Ok(text) => {
                let parsed = parse_category_map(&text);
                if parsed.is_none() {
                    warn!(target = "catmatch.external", titles = titles.len(), "batch_answer_unparseable");
                }
                parsed
            }
            Err(err) => {
                warn!(target = "catmatch.external", error = %err, "batch_completion_failed");
                None
            }
        }
    }
}

fn validate_urls(urls: &[String]) -> Result<Vec<&str>, PipelineError> {
    let urls: Vec<&str> = urls
        .iter()
        .map(|u| u.trim())
        .filter(|u| !u.is_empty())
        .collect();
    if urls.is_empty() {
        return Err(PipelineError::invalid_input("external_check", "at least one URL is required"));
    }
    if urls.len() > MAX_SITE_URLS {
        return Err(PipelineError::invalid_input(
            "external_check",
            format!("at most {MAX_SITE_URLS} URLs are accepted"),
        ));
    }
    Ok(urls)
}

/// First balanced `{...}` region of `text`, skipping braces inside JSON strings.
/// An opening brace that never closes is skipped and the scan resumes after it.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let mut from = 0;
    while let Some(found) = text[from..].find('{') {
        let start = from + found;
        if let Some(region) = balanced_from(text, start) {
            return Some(region);
        }
        from = start + 1;
    }
    None
}

fn balanced_from(text: &str, start: usize) -> Option<&str> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

pub fn parse_category_map(text: &str) -> Option<Map<String, Value>> {
    let candidate = extract_json_object(text)?;
    serde_json::from_str::<Map<String, Value>>(candidate).ok()
}

fn lookup_category(map: &Map<String, Value>, title: &str) -> Option<String> {
    let wanted = title.trim().to_lowercase();
    let value = map.get(title).or_else(|| {
        map.iter()
            .find(|(key, _)| key.trim().to_lowercase() == wanted)
            .map(|(_, value)| value)
    })?;
    let category = value.as_str()?.trim();
    if category.is_empty() || category.eq_ignore_ascii_case(NOT_FOUND) {
        return None;
    }
    Some(category.to_string())
}

#[derive(Debug, Clone, Deserialize)]
pub struct CategoryUpdate {
    pub item_id: ItemId,
    pub category: String,
}

#[derive(Debug, Default, Serialize)]
pub struct AssignReport {
    pub assigned: Vec<ItemId>,
    pub failed: Vec<ItemId>,
}

/// Applies reviewer-confirmed guesses by category name. Bad rows are collected, not fatal.
pub async fn assign_found_categories(pipeline: &Pipeline, updates: &[CategoryUpdate]) -> AssignReport {
    let mut report = AssignReport::default();
    for update in updates {
        let name = update.category.trim();
        if name.is_empty() || name.eq_ignore_ascii_case(NOT_FOUND) {
            report.failed.push(update.item_id);
            continue;
        }
        let category = match pipeline.categories().find_by_name(name).await {
            Ok(Some(category)) => category,
            Ok(None) => {
                warn!(target = "catmatch.external", item_id = update.item_id, category = name, "unknown_category");
                report.failed.push(update.item_id);
                continue;
            }
            Err(err) => {
                warn!(target = "catmatch.external", item_id = update.item_id, error = %err, "category_lookup_failed");
                report.failed.push(update.item_id);
                continue;
            }
        };
        match pipeline.products().assign_category(update.item_id, category.id).await {
            Ok(()) => report.assigned.push(update.item_id),
            Err(err) => {
                warn!(target = "catmatch.external", item_id = update.item_id, error = %err, "found_category_assignment_failed");
                report.failed.push(update.item_id);
            }
        }
    }
    report
}
