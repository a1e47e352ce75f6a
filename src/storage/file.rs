use anyhow::{Result, Context};
use async_trait::async_trait;
use mongodb::bson::oid::ObjectId;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::crawler::task::{ExtractedDocument, QueueItem};
use super::{ItemState, StoreBackend};

/// Filesystem store: a JSON queue file plus one JSON file per extracted document
pub struct FileStore {
    /// Path of the queue file
    queue_file: PathBuf,

    /// Directory receiving `<id>.json` documents
    output_dir: PathBuf,

    /// In-memory copy of the queue, written back after every update
    items: Mutex<Vec<QueueItem>>,
}

impl FileStore {
    /// Load the queue file and make sure the output directory exists
    pub async fn open(queue_file: &Path, output_dir: &Path) -> Result<Self> {
        let contents = fs::read_to_string(queue_file).await
            .context(format!("Failed to read queue file: {}", queue_file.display()))?;

        let items: Vec<QueueItem> = serde_json::from_str(&contents)
            .context(format!("Failed to parse queue file: {}", queue_file.display()))?;

        fs::create_dir_all(output_dir).await
            .context(format!("Failed to create output directory: {}", output_dir.display()))?;

        info!("Loaded {} queue items from {}", items.len(), queue_file.display());

        Ok(Self {
            queue_file: queue_file.to_path_buf(),
            output_dir: output_dir.to_path_buf(),
            items: Mutex::new(items),
        })
    }

    /// Path of the document written for `id`
    pub fn document_path(&self, id: &ObjectId) -> PathBuf {
        self.output_dir.join(format!("{}.json", id.to_hex()))
    }

    /// Apply `update` to one item and persist the queue.
    ///
    /// Every status change rewrites the whole queue file, so a run costs
    /// O(items) per update. This backend is meant for small local backlogs;
    /// large queues belong in MongoDB.
    async fn update<F>(&self, id: &ObjectId, update: F) -> Result<()>
    where
        F: FnOnce(&mut QueueItem),
    {
        let mut items = self.items.lock().await;
        match items.iter_mut().find(|item| item.id == *id) {
            Some(item) => update(item),
            None => {
                warn!("Item {} is not in {}, status left unchanged", id, self.queue_file.display());
                return Ok(());
            }
        }
        self.persist(&items).await
    }

    /// Write the queue through a temporary file so readers never see a torn file
    async fn persist(&self, items: &[QueueItem]) -> Result<()> {
        let contents = serde_json::to_string_pretty(items)
            .context("Failed to serialize queue")?;

        let tmp = self.queue_file.with_extension("json.tmp");
        fs::write(&tmp, contents).await
            .context(format!("Failed to write queue file: {}", tmp.display()))?;
        fs::rename(&tmp, &self.queue_file).await
            .context(format!("Failed to replace queue file: {}", self.queue_file.display()))?;

        Ok(())
    }
}

#[async_trait]
impl StoreBackend for FileStore {
    async fn select_pending(&self, limit: usize, exclude: &[ObjectId]) -> Result<Vec<QueueItem>> {
        let items = self.items.lock().await;

        let mut pending: Vec<QueueItem> = items.iter()
            .filter(|item| ItemState::of(item) == ItemState::Pending && !exclude.contains(&item.id))
            .cloned()
            .collect();

        pending.sort_by(|a, b| b.id.cmp(&a.id));
        pending.truncate(limit);

        Ok(pending)
    }

    async fn mark_failed(&self, id: &ObjectId) -> Result<()> {
        self.update(id, |item| item.failed = true).await
    }

    async fn mark_fetched(&self, id: &ObjectId) -> Result<()> {
        self.update(id, |item| {
            item.fetched = true;
            item.failed = false;
        }).await
    }

    async fn count(&self, state: ItemState) -> Result<u64> {
        let items = self.items.lock().await;
        Ok(items.iter().filter(|item| ItemState::of(item) == state).count() as u64)
    }

    async fn insert_document(&self, document: &ExtractedDocument) -> Result<bool> {
        let path = self.document_path(&document.id);
        let contents = serde_json::to_string_pretty(document)
            .context("Failed to serialize document")?;

        let mut file = match fs::OpenOptions::new().write(true).create_new(true).open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!("Document {} already written", path.display());
                return Ok(true);
            }
            Err(e) => return Err(e).context(format!("Failed to create document file: {}", path.display())),
        };

        file.write_all(contents.as_bytes()).await
            .context(format!("Failed to write document file: {}", path.display()))?;
        file.flush().await?;

        Ok(true)
    }

    async fn close(&self) -> Result<()> {
        let items = self.items.lock().await;
        self.persist(&items).await
    }
}
