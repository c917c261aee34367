//! Doubles shared by the unit tests.

use crate::config::{MatcherConfig, Timeouts};
use crate::external::{FetchError, PageFetcher};
use crate::llm::{CompletionError, CompletionRequest, CompletionResult, CompletionService, ModelParams};
use crate::models::{Category, CategoryId, Item, ItemId};
use crate::pipeline::Pipeline;
use crate::store::{MemoryCatalog, ProductStore, StoreError, memory::CatalogSeed};
use async_trait::async_trait;
use std::{
    collections::{BTreeSet, HashMap, HashSet, VecDeque},
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio::sync::Semaphore;

pub const UNCATEGORIZED: CategoryId = 1;
pub const HOME_GARDEN: CategoryId = 2;
pub const GARDEN_TOOLS: CategoryId = 3;
pub const SHOES: CategoryId = 4;

/// Four categories plus `items` uncategorized items titled `Item 1..=items`.
pub fn catalog(items: u64) -> Arc<MemoryCatalog> {
    let seed = CatalogSeed {
        categories: vec![
            Category::new(UNCATEGORIZED, "Uncategorized", ""),
            Category::new(HOME_GARDEN, "Home & Garden", "Indoor and outdoor living"),
            Category::new(GARDEN_TOOLS, "Garden Tools", "Rakes, spades and hoes"),
            Category::new(SHOES, "Shoes", "Sneakers and boots"),
        ],
        items: (1..=items)
            .map(|id| Item {
                id,
                title: format!("Item {id}"),
                description: String::new(),
                category_ids: BTreeSet::from([UNCATEGORIZED]),
            })
            .collect(),
    };
    Arc::new(MemoryCatalog::new(seed, "Uncategorized"))
}

pub fn config(chunk_size: usize) -> MatcherConfig {
    MatcherConfig {
        chunk_size,
        chunk_delay: Duration::from_millis(1),
        ..MatcherConfig::default()
    }
}

pub fn pipeline(catalog: Arc<MemoryCatalog>, llm: Arc<Scripted>) -> Pipeline {
    pipeline_with_chunk_size(catalog, llm, 5)
}

pub fn pipeline_with_chunk_size(
    catalog: Arc<MemoryCatalog>,
    llm: Arc<Scripted>,
    chunk_size: usize,
) -> Pipeline {
    Pipeline::new(
        config(chunk_size),
        Timeouts::default(),
        ModelParams::default(),
        llm,
        catalog.clone(),
        catalog,
    )
}

pub fn pipeline_with_store(
    store: Arc<dyn ProductStore>,
    catalog: Arc<MemoryCatalog>,
    llm: Arc<Scripted>,
) -> Pipeline {
    Pipeline::new(
        config(5),
        Timeouts::default(),
        ModelParams::default(),
        llm,
        store,
        catalog,
    )
}

enum Script {
    Always(CompletionResult),
    Sequence(VecDeque<CompletionResult>),
}

/// Completion double answering from a fixed script and recording every prompt.
pub struct Scripted {
    script: Mutex<Script>,
    configured: bool,
    prompts: Mutex<Vec<String>>,
    calls: AtomicUsize,
    gate: Mutex<Option<Arc<Semaphore>>>,
}

impl Scripted {
    fn with(script: Script, configured: bool) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script),
            configured,
            prompts: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            gate: Mutex::new(None),
        })
    }

    pub fn always(text: &str) -> Arc<Self> {
        Self::with(Script::Always(Ok(text.to_string())), true)
    }

    pub fn failing(err: CompletionError) -> Arc<Self> {
        Self::with(Script::Always(Err(err)), true)
    }

    /// Answers in order; once exhausted every call fails with a transport error.
    pub fn sequence(answers: Vec<CompletionResult>) -> Arc<Self> {
        Self::with(Script::Sequence(answers.into()), true)
    }

    pub fn unconfigured() -> Arc<Self> {
        Self::with(Script::Always(Err(CompletionError::MissingApiKey)), false)
    }

    /// Blocks every call until the returned semaphore receives permits.
    pub fn hold(&self) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *self.gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub async fn wait_for_calls(&self, count: usize) {
        while self.calls() < count {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    fn next_answer(&self) -> CompletionResult {
        match &mut *self.script.lock().unwrap() {
            Script::Always(answer) => answer.clone(),
            Script::Sequence(queue) => queue
                .pop_front()
                .unwrap_or_else(|| Err(CompletionError::Transport("script exhausted".into()))),
        }
    }
}

#[async_trait]
impl CompletionService for Scripted {
    fn ensure_configured(&self) -> Result<(), CompletionError> {
        if self.configured {
            Ok(())
        } else {
            Err(CompletionError::MissingApiKey)
        }
    }

    async fn complete(&self, request: &CompletionRequest) -> CompletionResult {
        self.ensure_configured()?;
        self.prompts.lock().unwrap().push(request.prompt.clone());
        self.calls.fetch_add(1, Ordering::SeqCst);
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _permit = gate.acquire().await;
        }
        self.next_answer()
    }
}

/// Product store whose writes fail for selected items.
pub struct FailingWrites {
    inner: Arc<MemoryCatalog>,
    rejected: HashSet<ItemId>,
}

impl FailingWrites {
    pub fn new(inner: Arc<MemoryCatalog>, rejected: impl IntoIterator<Item = ItemId>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            rejected: rejected.into_iter().collect(),
        })
    }
}

#[async_trait]
impl ProductStore for FailingWrites {
    async fn list_uncategorized(&self, limit: usize, offset: usize) -> Result<Vec<Item>, StoreError> {
        self.inner.list_uncategorized(limit, offset).await
    }

    async fn count_uncategorized(&self) -> Result<usize, StoreError> {
        self.inner.count_uncategorized().await
    }

    async fn get_item(&self, id: ItemId) -> Result<Option<Item>, StoreError> {
        self.inner.get_item(id).await
    }

    async fn assign_category(&self, item_id: ItemId, category_id: CategoryId) -> Result<(), StoreError> {
        if self.rejected.contains(&item_id) {
            return Err(StoreError::Backend("write rejected".into()));
        }
        self.inner.assign_category(item_id, category_id).await
    }
}

/// Product store that keeps listing the same items whatever gets assigned to them.
pub struct StickyPool {
    inner: Arc<MemoryCatalog>,
    ids: Vec<ItemId>,
}

impl StickyPool {
    pub fn new(inner: Arc<MemoryCatalog>, ids: impl IntoIterator<Item = ItemId>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            ids: ids.into_iter().collect(),
        })
    }
}

#[async_trait]
impl ProductStore for StickyPool {
    async fn list_uncategorized(&self, limit: usize, offset: usize) -> Result<Vec<Item>, StoreError> {
        let mut items = Vec::new();
        for id in self.ids.iter().skip(offset).take(limit) {
            if let Some(item) = self.inner.get_item(*id).await? {
                items.push(item);
            }
        }
        Ok(items)
    }

    async fn count_uncategorized(&self) -> Result<usize, StoreError> {
        Ok(self.ids.len())
    }

    async fn get_item(&self, id: ItemId) -> Result<Option<Item>, StoreError> {
        self.inner.get_item(id).await
    }

    async fn assign_category(&self, item_id: ItemId, category_id: CategoryId) -> Result<(), StoreError> {
        self.inner.assign_category(item_id, category_id).await
    }
}

/// Page fetcher serving canned bodies; unknown URLs answer 404.
pub struct StaticPages {
    pages: HashMap<String, String>,
    fetched: Mutex<Vec<String>>,
}

impl StaticPages {
    pub fn new<'a>(pages: impl IntoIterator<Item = (&'a str, &'a str)>) -> Arc<Self> {
        Arc::new(Self {
            pages: pages
                .into_iter()
                .map(|(url, body)| (url.to_string(), body.to_string()))
                .collect(),
            fetched: Mutex::new(Vec::new()),
        })
    }

    pub fn fetched(&self) -> Vec<String> {
        self.fetched.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageFetcher for StaticPages {
    async fn fetch(&self, url: &str) -> Result<String, FetchError> {
        self.fetched.lock().unwrap().push(url.to_string());
        self.pages.get(url).cloned().ok_or(FetchError::Status(404))
    }
}
