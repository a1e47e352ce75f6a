pub mod file;
pub mod mongo;
#[cfg(test)]
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use mongodb::bson::oid::ObjectId;
use std::sync::Arc;

use crate::cli::config::{StorageBackendKind, StorageSettings};
use crate::crawler::task::{ExtractedDocument, QueueItem};

// Re-export common types
pub use file::FileStore;
pub use mongo::MongoStore;

/// Lifecycle state of a queue item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemState {
    Pending,
    Fetched,
    Failed,
}

impl ItemState {
    pub fn of(item: &QueueItem) -> Self {
        if item.fetched {
            ItemState::Fetched
        } else if item.failed {
            ItemState::Failed
        } else {
            ItemState::Pending
        }
    }
}

/// Work queue and extracted document storage.
///
/// Every mutation is a single-item atomic update; callers never hold a
/// local authoritative copy of an item.
#[async_trait]
pub trait StoreBackend: Send + Sync {
    /// Up to `limit` pending items, highest id first, skipping `exclude`
    async fn select_pending(&self, limit: usize, exclude: &[ObjectId]) -> Result<Vec<QueueItem>>;

    /// Give up on an item for this run
    async fn mark_failed(&self, id: &ObjectId) -> Result<()>;

    /// Record that an item's content has been extracted and stored
    async fn mark_fetched(&self, id: &ObjectId) -> Result<()>;

    /// Number of items in the given state
    async fn count(&self, state: ItemState) -> Result<u64>;

    /// Persist an extracted document, returning whether the write was acknowledged.
    ///
    /// A document that already exists for the id counts as acknowledged.
    async fn insert_document(&self, document: &ExtractedDocument) -> Result<bool>;

    /// Release the underlying connection
    async fn close(&self) -> Result<()>;
}

/// Open the backend selected by the settings
pub async fn open(settings: &StorageSettings) -> Result<Arc<dyn StoreBackend>> {
    match settings.backend {
        StorageBackendKind::Mongodb => {
            let store = MongoStore::connect(settings).await?;
            Ok(Arc::new(store))
        }
        StorageBackendKind::Filesystem => {
            let store = FileStore::open(&settings.queue_file, &settings.output_dir).await?;
            Ok(Arc::new(store))
        }
    }
}
