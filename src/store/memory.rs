use super::{CategoryStore, ProductStore, StoreError};
use crate::models::{Category, CategoryId, Item, ItemId};
use async_trait::async_trait;
use serde::Deserialize;
use std::{collections::BTreeMap, path::Path};
use tokio::sync::RwLock;
use tracing::info;

/// YAML seed layout for [`MemoryCatalog::from_yaml_file`].
#[derive(Debug, Default, Deserialize)]
pub struct CatalogSeed {
    #[serde(default)]
    pub categories: Vec<Category>,
    #[serde(default)]
    pub items: Vec<Item>,
}

struct CatalogState {
    items: BTreeMap<ItemId, Item>,
    categories: BTreeMap<CategoryId, Category>,
    uncategorized_id: CategoryId,
}

impl CatalogState {
    fn is_uncategorized(&self, item: &Item) -> bool {
        item.category_ids.iter().all(|id| *id == self.uncategorized_id)
    }

    fn next_category_id(&self) -> CategoryId {
        self.categories.keys().next_back().map_or(1, |id| id + 1)
    }

    fn find_by_name(&self, name: &str) -> Option<&Category> {
        let wanted = name.trim().to_lowercase();
        self.categories
            .values()
            .find(|c| c.name.trim().to_lowercase() == wanted)
    }

    fn insert_named(&mut self, name: &str) -> Category {
        let category = Category::new(self.next_category_id(), name.trim(), "");
        self.categories.insert(category.id, category.clone());
        category
    }
}

/// In-process catalog. Items whose category set is empty or holds only the
/// sentinel "uncategorized" category count as uncategorized.
pub struct MemoryCatalog {
    state: RwLock<CatalogState>,
}

impl MemoryCatalog {
    pub fn new(seed: CatalogSeed, uncategorized_name: &str) -> Self {
        let mut state = CatalogState {
            items: seed.items.into_iter().map(|item| (item.id, item)).collect(),
            categories: seed
                .categories
                .into_iter()
                .map(|category| (category.id, category))
                .collect(),
            uncategorized_id: 0,
        };
        let existing = state.find_by_name(uncategorized_name).map(|c| c.id);
        state.uncategorized_id = match existing {
            Some(id) => id,
            None => state.insert_named(uncategorized_name).id,
        };
        Self {
            state: RwLock::new(state),
        }
    }

    pub fn from_yaml_file(
        path: impl AsRef<Path>,
        uncategorized_name: &str,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .map_err(|err| StoreError::Backend(format!("{}: {err}", path.display())))?;
        let seed: CatalogSeed = serde_yaml::from_str(&raw)
            .map_err(|err| StoreError::Backend(format!("{}: {err}", path.display())))?;
        info!(
            target = "catmatch.store",
            path = %path.display(),
            items = seed.items.len(),
            categories = seed.categories.len(),
            "catalog_seed_loaded"
        );
        Ok(Self::new(seed, uncategorized_name))
    }

    pub async fn uncategorized_category_id(&self) -> CategoryId {
        self.state.read().await.uncategorized_id
    }
}

#[async_trait]
impl ProductStore for MemoryCatalog {
    async fn list_uncategorized(
        &self,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Item>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .items
            .values()
            .filter(|item| state.is_uncategorized(item))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn count_uncategorized(&self) -> Result<usize, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .items
            .values()
            .filter(|item| state.is_uncategorized(item))
            .count())
    }

    async fn get_item(&self, id: ItemId) -> Result<Option<Item>, StoreError> {
        Ok(self.state.read().await.items.get(&id).cloned())
    }

    async fn assign_category(
        &self,
        item_id: ItemId,
        category_id: CategoryId,
    ) -> Result<(), StoreError> {
        let mut state = self.state.write().await;
        if !state.categories.contains_key(&category_id) {
            return Err(StoreError::CategoryNotFound(category_id));
        }
        let item = state
            .items
            .get_mut(&item_id)
            .ok_or(StoreError::ItemNotFound(item_id))?;
        item.category_ids.insert(category_id);
        Ok(())
    }
}

#[async_trait]
impl CategoryStore for MemoryCatalog {
    async fn list_categories(&self, include_empty: bool) -> Result<Vec<Category>, StoreError> {
        let state = self.state.read().await;
        Ok(state
            .categories
            .values()
            .filter(|category| {
                include_empty
                    || state
                        .items
                        .values()
                        .any(|item| item.category_ids.contains(&category.id))
            })
            .cloned()
            .collect())
    }

    async fn ensure_category(&self, name: &str) -> Result<Category, StoreError> {
        if name.trim().is_empty() {
            return Err(StoreError::Backend("category name must not be blank".into()));
        }
        let mut state = self.state.write().await;
        if let Some(existing) = state.find_by_name(name) {
            return Ok(existing.clone());
        }
        let created = state.insert_named(name);
        info!(
            target = "catmatch.store",
            category_id = created.id,
            name = %created.name,
            "category_created"
        );
        Ok(created)
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Category>, StoreError> {
        Ok(self.state.read().await.find_by_name(name).cloned())
    }
}
