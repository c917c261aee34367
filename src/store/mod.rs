//! Catalog boundary.
//!
//! The engine only needs to page through uncategorized items, read the vocabulary and
//! add category assignments. Any backend offering that can sit behind these traits;
//! [`memory::MemoryCatalog`] is the bundled one.

pub mod memory;

use crate::models::{Category, CategoryId, Item, ItemId};
use async_trait::async_trait;
use thiserror::Error;

pub use memory::MemoryCatalog;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("item {0} not found")]
    ItemNotFound(ItemId),
    #[error("category {0} not found")]
    CategoryNotFound(CategoryId),
    #[error("catalog backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait ProductStore: Send + Sync {
    /// Uncategorized items ordered by ascending id.
    async fn list_uncategorized(&self, limit: usize, offset: usize)
    -> Result<Vec<Item>, StoreError>;

    async fn count_uncategorized(&self) -> Result<usize, StoreError>;

    async fn get_item(&self, id: ItemId) -> Result<Option<Item>, StoreError>;

    /// Adds `category_id` to the item's set; assigning twice is a no-op.
    async fn assign_category(&self, item_id: ItemId, category_id: CategoryId)
    -> Result<(), StoreError>;
}

#[async_trait]
pub trait CategoryStore: Send + Sync {
    /// Categories ordered by ascending id.
    async fn list_categories(&self, include_empty: bool) -> Result<Vec<Category>, StoreError>;

    /// Returns the category with this name, creating it when absent.
    async fn ensure_category(&self, name: &str) -> Result<Category, StoreError>;

    /// Case-insensitive lookup by name.
    async fn find_by_name(&self, name: &str) -> Result<Option<Category>, StoreError>;
}
