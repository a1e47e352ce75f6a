use anyhow::Result;
use async_trait::async_trait;
use mongodb::bson::oid::ObjectId;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::crawler::task::{ExtractedDocument, QueueItem};
use super::{ItemState, StoreBackend};

/// In-memory store with write and close counters
#[derive(Default)]
pub struct MemoryStore {
    items: Mutex<Vec<QueueItem>>,
    documents: Mutex<HashMap<ObjectId, ExtractedDocument>>,
    pub status_writes: AtomicUsize,
    pub document_writes: AtomicUsize,
    pub closes: AtomicUsize,

    /// Make the matching operations return an error
    pub fail_status_writes: AtomicBool,
    pub fail_selects: AtomicBool,
    pub fail_counts: AtomicBool,
}

impl MemoryStore {
    pub fn with_items(items: Vec<QueueItem>) -> Self {
        Self {
            items: Mutex::new(items),
            ..Default::default()
        }
    }

    /// Queue of `count` pending items with increasing ids
    pub fn with_pending(count: usize) -> Self {
        let items = (0..count)
            .map(|i| QueueItem {
                id: ObjectId::new(),
                url: format!("https://news.example/{}", i),
                fetched: false,
                failed: false,
            })
            .collect();
        Self::with_items(items)
    }

    pub fn items(&self) -> Vec<QueueItem> {
        self.items.lock().unwrap().clone()
    }

    pub fn item(&self, id: &ObjectId) -> Option<QueueItem> {
        self.items.lock().unwrap().iter().find(|item| item.id == *id).cloned()
    }

    pub fn document(&self, id: &ObjectId) -> Option<ExtractedDocument> {
        self.documents.lock().unwrap().get(id).cloned()
    }

    pub fn writes(&self) -> usize {
        self.status_writes.load(Ordering::SeqCst) + self.document_writes.load(Ordering::SeqCst)
    }

    fn update<F: FnOnce(&mut QueueItem)>(&self, id: &ObjectId, update: F) -> Result<()> {
        if self.fail_status_writes.load(Ordering::SeqCst) {
            anyhow::bail!("status write rejected for {}", id);
        }
        self.status_writes.fetch_add(1, Ordering::SeqCst);
        let mut items = self.items.lock().unwrap();
        if let Some(item) = items.iter_mut().find(|item| item.id == *id) {
            update(item);
        }
        Ok(())
    }
}

#[async_trait]
impl StoreBackend for MemoryStore {
    async fn select_pending(&self, limit: usize, exclude: &[ObjectId]) -> Result<Vec<QueueItem>> {
        if self.fail_selects.load(Ordering::SeqCst) {
            anyhow::bail!("queue unavailable");
        }
        let mut pending: Vec<QueueItem> = self.items.lock().unwrap().iter()
            .filter(|item| ItemState::of(item) == ItemState::Pending && !exclude.contains(&item.id))
            .cloned()
            .collect();
        pending.sort_by(|a, b| b.id.cmp(&a.id));
        pending.truncate(limit);
        Ok(pending)
    }

    async fn mark_failed(&self, id: &ObjectId) -> Result<()> {
        self.update(id, |item| item.failed = true)
    }

    async fn mark_fetched(&self, id: &ObjectId) -> Result<()> {
        self.update(id, |item| {
            item.fetched = true;
            item.failed = false;
        })
    }

    async fn count(&self, state: ItemState) -> Result<u64> {
        if self.fail_counts.load(Ordering::SeqCst) {
            anyhow::bail!("queue unavailable");
        }
        Ok(self.items.lock().unwrap().iter().filter(|item| ItemState::of(item) == state).count() as u64)
    }

    async fn insert_document(&self, document: &ExtractedDocument) -> Result<bool> {
        let mut documents = self.documents.lock().unwrap();
        if !documents.contains_key(&document.id) {
            self.document_writes.fetch_add(1, Ordering::SeqCst);
            documents.insert(document.id, document.clone());
        }
        Ok(true)
    }

    async fn close(&self) -> Result<()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
