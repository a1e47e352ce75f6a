use anyhow::{Result, Context};
use futures::StreamExt;
use async_trait::async_trait;
use mongodb::{Client, Collection, options::{ClientOptions, FindOptions}};
use mongodb::bson::{doc, Document, oid::ObjectId};
use mongodb::error::{ErrorKind, WriteFailure};
use tracing::{debug, info};

use crate::cli::config::StorageSettings;
use crate::crawler::task::{ExtractedDocument, QueueItem};
use super::{ItemState, StoreBackend};

/// Server error code for a unique index violation
const DUPLICATE_KEY: i32 = 11000;

/// MongoDB implementation of the store
pub struct MongoStore {
    /// MongoDB client, shared by every collection handle
    client: Client,

    /// Collection holding the crawl backlog
    queue: Collection<QueueItem>,

    /// Collection receiving extracted documents
    documents: Collection<ExtractedDocument>,
}

impl MongoStore {
    /// Connect and verify the server is reachable
    pub async fn connect(settings: &StorageSettings) -> Result<Self> {
        let connection_string = settings.connection_string.as_deref()
            .context("No MongoDB connection string configured")?;

        let client_options = ClientOptions::parse(connection_string)
            .await
            .context("Failed to parse MongoDB connection string")?;

        let client = Client::with_options(client_options)
            .context("Failed to create MongoDB client")?;

        // Test connection
        client.database(&settings.queue_database)
            .run_command(doc! { "ping": 1 }, None)
            .await
            .context("Failed to connect to MongoDB")?;

        info!("Connected to MongoDB, queue {}.{}", settings.queue_database, settings.queue_collection);

        let queue = client.database(&settings.queue_database).collection(&settings.queue_collection);
        let documents = client.database(&settings.content_database).collection(&settings.content_collection);

        Ok(Self { client, queue, documents })
    }
}

/// Filter matching items in `state`; a missing `failed` field counts as false
fn state_filter(state: ItemState) -> Document {
    match state {
        ItemState::Pending => doc! { "fetched": false, "failed": { "$ne": true } },
        ItemState::Fetched => doc! { "fetched": true },
        ItemState::Failed => doc! { "fetched": { "$ne": true }, "failed": true },
    }
}

fn is_duplicate_key(error: &mongodb::error::Error) -> bool {
    matches!(
        &*error.kind,
        ErrorKind::Write(WriteFailure::WriteError(write_error)) if write_error.code == DUPLICATE_KEY
    )
}

#[async_trait]
impl StoreBackend for MongoStore {
    async fn select_pending(&self, limit: usize, exclude: &[ObjectId]) -> Result<Vec<QueueItem>> {
        let mut filter = state_filter(ItemState::Pending);
        if !exclude.is_empty() {
            filter.insert("_id", doc! { "$nin": exclude.to_vec() });
        }

        let options = FindOptions::builder()
            .sort(doc! { "_id": -1 })
            .limit(limit as i64)
            .build();

        let mut cursor = self.queue.find(filter, options).await
            .context("Failed to query MongoDB for pending items")?;

        let mut items = Vec::new();
        while let Some(item) = cursor.next().await {
            items.push(item.context("Failed to read queue item from cursor")?);
        }

        debug!("Selected {} pending items", items.len());

        Ok(items)
    }

    async fn mark_failed(&self, id: &ObjectId) -> Result<()> {
        self.queue.update_one(doc! { "_id": *id }, doc! { "$set": { "failed": true } }, None)
            .await
            .context(format!("Failed to mark item {} as failed", id))?;
        Ok(())
    }

    async fn mark_fetched(&self, id: &ObjectId) -> Result<()> {
        self.queue.update_one(doc! { "_id": *id }, doc! { "$set": { "fetched": true, "failed": false } }, None)
            .await
            .context(format!("Failed to mark item {} as fetched", id))?;
        Ok(())
    }

    async fn count(&self, state: ItemState) -> Result<u64> {
        self.queue.count_documents(state_filter(state), None)
            .await
            .context("Failed to count queue items")
    }

    async fn insert_document(&self, document: &ExtractedDocument) -> Result<bool> {
        match self.documents.insert_one(document, None).await {
            Ok(_) => Ok(true),
            Err(e) if is_duplicate_key(&e) => {
                debug!("Document {} already stored", document.id);
                Ok(true)
            }
            Err(e) => Err(e).context(format!("Failed to store document {}", document.id)),
        }
    }

    async fn close(&self) -> Result<()> {
        self.client.clone().shutdown().await;
        debug!("MongoDB connection closed");
        Ok(())
    }
}
