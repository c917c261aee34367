use crate::config::{MatcherConfig, Timeouts};
use crate::llm::{CompletionError, CompletionErrorKind, CompletionRequest, CompletionService, ModelParams};
use crate::metrics;
use crate::models::{Category, Item, ItemId};
use crate::prompt::PromptBuilder;
use crate::resolver::{CategoryResolver, MatchMethod, MatchResult};
use crate::store::{CategoryStore, ProductStore, StoreError};
use serde::Serialize;
use serde_with::skip_serializing_none;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Shared engine: prompt → completion → resolution → assignment, one item at a time.
#[derive(Clone)]
pub struct Pipeline {
    pub config: Arc<MatcherConfig>,
    pub llm: Arc<dyn CompletionService>,
    pub timeouts: Timeouts,
    pub params: ModelParams,
    products: Arc<dyn ProductStore>,
    categories: Arc<dyn CategoryStore>,
    prompts: PromptBuilder,
    resolver: Arc<CategoryResolver>,
}

impl Pipeline {
    pub fn new(
        config: MatcherConfig,
        timeouts: Timeouts,
        params: ModelParams,
        llm: Arc<dyn CompletionService>,
        products: Arc<dyn ProductStore>,
        categories: Arc<dyn CategoryStore>,
    ) -> Self {
        let prompts = PromptBuilder::new(config.max_prompt_categories);
        let resolver = Arc::new(CategoryResolver::new(config.fuzzy_threshold));
        Self {
            config: Arc::new(config),
            llm,
            timeouts,
            params,
            products,
            categories,
            prompts,
            resolver,
        }
    }

    pub fn products(&self) -> &Arc<dyn ProductStore> {
        &self.products
    }

    pub fn categories(&self) -> &Arc<dyn CategoryStore> {
        &self.categories
    }

    pub fn ensure_ready(&self) -> Result<(), PipelineError> {
        self.llm
            .ensure_configured()
            .map_err(|err| PipelineError::from_completion("completion", err))
    }

    pub async fn count_uncategorized(&self) -> Result<usize, PipelineError> {
        self.products
            .count_uncategorized()
            .await
            .map_err(|err| PipelineError::internal("count_uncategorized", err.to_string()))
    }

    /// Candidate categories ordered by id, without the sentinel and the fallback sink.
    pub async fn vocabulary(&self) -> Result<Vec<Category>, PipelineError> {
        let excluded = [
            self.config.uncategorized_name.trim().to_lowercase(),
            self.config.unmatched_category.trim().to_lowercase(),
        ];
        let mut categories = self
            .categories
            .list_categories(true)
            .await
            .map_err(|err| PipelineError::internal("list_categories", err.to_string()))?;
        categories.retain(|c| !excluded.contains(&c.name.trim().to_lowercase()));
        categories.sort_by_key(|c| c.id);
        if categories.is_empty() {
            return Err(PipelineError::config(
                "list_categories",
                "no categories configured",
            ));
        }
        Ok(categories)
    }

    /// Processes up to `limit` uncategorized items starting at `offset`.
    ///
    /// Only failures to read the chunk surface as errors; everything that goes wrong
    /// for a single item is folded into its [`ItemReport`].
    pub async fn process_chunk(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<ChunkOutcome, PipelineError> {
        let items = self
            .products
            .list_uncategorized(limit, offset)
            .await
            .map_err(|err| PipelineError::internal("list_uncategorized", err.to_string()))?;
        let mut outcome = ChunkOutcome::default();
        if items.is_empty() {
            return Ok(outcome);
        }

        let vocabulary = self.vocabulary().await?;
        let mut sink: Option<Category> = None;
        for item in &items {
            let report = self.categorize_item(item, &vocabulary, &mut sink).await;
            metrics::item_outcome(report.status.as_str());
            outcome.counts.record(report.status);
            outcome.reports.push(report);
        }
        Ok(outcome)
    }

    pub async fn categorize_item(
        &self,
        item: &Item,
        vocabulary: &[Category],
        sink: &mut Option<Category>,
    ) -> ItemReport {
        let prompt = self.prompts.build_classification_prompt(item, vocabulary);
        let request = CompletionRequest::new(prompt, self.params, self.timeouts.completion);

        let answer = match self.llm.complete(&request).await {
            Ok(text) => text,
            Err(err) => {
                warn!(
                    target = "catmatch.llm",
                    item_id = item.id,
                    error = %err,
                    "completion_failed_item_untouched"
                );
                return ItemReport::untouched(item, &err);
            }
        };

        let resolution = self.resolver.resolve(&answer, vocabulary);
        debug!(
            target = "catmatch.resolver",
            item_id = item.id,
            method = resolution.method().map(|m| m.as_str()),
            category = resolution.category().map(|c| c.name.as_str()),
            "answer_resolved"
        );
        match resolution {
            MatchResult::Matched {
                category,
                method,
                score,
            } => match self.products.assign_category(item.id, category.id).await {
                Ok(()) => {
                    info!(
                        target = "catmatch.pipeline",
                        item_id = item.id,
                        category = %category.name,
                        method = method.as_str(),
                        "category_assigned"
                    );
                    ItemReport::matched(item, &category, method, score)
                }
                Err(err) => ItemReport::persistence_failed(item, &err),
            },
            MatchResult::NoMatch => {
                info!(
                    target = "catmatch.pipeline",
                    item_id = item.id,
                    answer = %answer.trim(),
                    "no_category_match"
                );
                let category = match sink.clone() {
                    Some(category) => category,
                    None => match self
                        .categories
                        .ensure_category(&self.config.unmatched_category)
                        .await
                    {
                        Ok(created) => sink.insert(created).clone(),
                        Err(err) => return ItemReport::persistence_failed(item, &err),
                    },
                };
                match self.products.assign_category(item.id, category.id).await {
                    Ok(()) => ItemReport::unmatched(item, &category, &answer),
                    Err(err) => ItemReport::persistence_failed(item, &err),
                }
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct ChunkOutcome {
    pub reports: Vec<ItemReport>,
    pub counts: OutcomeCounts,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Matched,
    Unmatched,
    Untouched,
    PersistenceFailed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Matched => "matched",
            Self::Unmatched => "unmatched",
            Self::Untouched => "untouched",
            Self::PersistenceFailed => "persistence_failed",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutcomeCounts {
    pub matched: usize,
    pub unmatched: usize,
    pub untouched: usize,
    pub persistence_failed: usize,
}

impl OutcomeCounts {
    pub fn record(&mut self, status: ItemStatus) {
        match status {
            ItemStatus::Matched => self.matched += 1,
            ItemStatus::Unmatched => self.unmatched += 1,
            ItemStatus::Untouched => self.untouched += 1,
            ItemStatus::PersistenceFailed => self.persistence_failed += 1,
        }
    }

    pub fn absorb(&mut self, other: &OutcomeCounts) {
        self.matched += other.matched;
        self.unmatched += other.unmatched;
        self.untouched += other.untouched;
        self.persistence_failed += other.persistence_failed;
    }

    /// Items still sitting in the uncategorized pool after the chunk.
    pub fn left_in_pool(&self) -> usize {
        self.untouched + self.persistence_failed
    }
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct ItemReport {
    pub item_id: ItemId,
    pub item_title: String,
    pub status: ItemStatus,
    pub category: Option<String>,
    pub method: Option<MatchMethod>,
    pub score: Option<f64>,
    pub message: Option<String>,
}

impl ItemReport {
    fn base(item: &Item, status: ItemStatus) -> Self {
        Self {
            item_id: item.id,
            item_title: item.title.clone(),
            status,
            category: None,
            method: None,
            score: None,
            message: None,
        }
    }

    fn matched(item: &Item, category: &Category, method: MatchMethod, score: Option<f64>) -> Self {
        Self {
            category: Some(category.name.clone()),
            method: Some(method),
            score: score.map(|s| (s * 100.0).round() / 100.0),
            ..Self::base(item, ItemStatus::Matched)
        }
    }

    fn unmatched(item: &Item, sink: &Category, answer: &str) -> Self {
        Self {
            category: Some(sink.name.clone()),
            message: Some(format!("no category matched answer `{}`", answer.trim())),
            ..Self::base(item, ItemStatus::Unmatched)
        }
    }

    fn untouched(item: &Item, err: &CompletionError) -> Self {
        Self {
            message: Some(err.to_string()),
            ..Self::base(item, ItemStatus::Untouched)
        }
    }

    fn persistence_failed(item: &Item, err: &StoreError) -> Self {
        warn!(
            target = "catmatch.store",
            item_id = item.id,
            error = %err,
            "category_assignment_failed"
        );
        Self {
            message: Some(err.to_string()),
            ..Self::base(item, ItemStatus::PersistenceFailed)
        }
    }

    /// The assigned category name, or the status when nothing was assigned.
    pub fn label(&self) -> &str {
        self.category.as_deref().unwrap_or(self.status.as_str())
    }
}

#[derive(Debug, Error)]
#[error("stage `{stage}` failed: {message}")]
pub struct PipelineError {
    stage: &'static str,
    message: String,
    kind: PipelineErrorKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineErrorKind {
    Config,
    Authorization,
    InvalidInput,
    NotFound,
    Conflict,
    Internal,
}

impl PipelineError {
    pub fn config(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, PipelineErrorKind::Config)
    }

    pub fn unauthorized(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, PipelineErrorKind::Authorization)
    }

    pub fn invalid_input(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, PipelineErrorKind::InvalidInput)
    }

    pub fn not_found(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, PipelineErrorKind::NotFound)
    }

    pub fn conflict(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, PipelineErrorKind::Conflict)
    }

    pub fn internal(stage: &'static str, message: impl Into<String>) -> Self {
        Self::new(stage, message, PipelineErrorKind::Internal)
    }

    pub fn from_completion(stage: &'static str, err: CompletionError) -> Self {
        match err.kind() {
            CompletionErrorKind::Config => Self::config(stage, err.to_string()),
            _ => Self::internal(stage, err.to_string()),
        }
    }

    fn new(stage: &'static str, message: impl Into<String>, kind: PipelineErrorKind) -> Self {
        Self {
            stage,
            message: message.into(),
            kind,
        }
    }

    pub fn stage(&self) -> &'static str {
        self.stage
    }

    pub fn kind(&self) -> PipelineErrorKind {
        self.kind
    }

    pub fn detail(&self) -> &str {
        &self.message
    }

    /// Errors that end a job instead of being retried chunk by chunk.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            PipelineErrorKind::Config | PipelineErrorKind::Authorization
        )
    }
}
