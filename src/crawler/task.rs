use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mongodb::bson::oid::ObjectId;
use serde::{Serialize, Deserialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::crawler::extractor;
use crate::proxy::{IdentityRotator, ProxyManager, RotationError};
use crate::storage::StoreBackend;
use crate::utils::metrics::RequestTimer;

/// One crawl target in the backlog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueItem {
    /// Stable identifier, also the selection sort key
    #[serde(rename = "_id")]
    pub id: ObjectId,

    /// Absolute URL to fetch
    pub url: String,

    /// Content has been extracted and stored
    #[serde(default)]
    pub fetched: bool,

    /// Given up on for the current run
    #[serde(default)]
    pub failed: bool,
}

/// Stored result of a successful fetch, keyed by the originating item's id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedDocument {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub url: String,
    pub lang: String,
    pub content: String,
    pub fetched_at: DateTime<Utc>,
}

/// What a fetch task reports back for its item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchOutcome {
    /// The page answered with a 2xx status
    pub fetched: bool,

    /// An extracted document was stored
    pub saved: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FetchOutcome {
    /// The site refused the request
    pub fn blocked() -> Self {
        Self { fetched: false, saved: false, error: None }
    }

    /// The page was fetched but nothing was stored
    pub fn unsaved() -> Self {
        Self { fetched: true, saved: false, error: None }
    }

    pub fn stored(saved: bool) -> Self {
        Self { fetched: true, saved, error: None }
    }
}

/// A task that could not produce an outcome
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("identity rotation failed: {0}")]
    Rotation(#[from] RotationError),

    #[error("transport error fetching {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("failed to set up request: {0}")]
    Setup(String),

    #[error("failed to store document {id}: {message}")]
    Store { id: ObjectId, message: String },

    #[error("task exceeded {0:?}")]
    Timeout(Duration),

    #[error("task panicked: {0}")]
    Panicked(String),
}

/// Executes the fetch-extract-store work for one queue item
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, item: QueueItem) -> Result<FetchOutcome, TaskError>;
}

/// Fetches pages through the proxy and stores what the extractor finds
pub struct PageFetcher {
    proxy: ProxyManager,
    store: Arc<dyn StoreBackend>,

    /// Rotates identity before every fetch when set
    rotator: Option<Arc<dyn IdentityRotator>>,
}

impl PageFetcher {
    pub fn new(proxy: ProxyManager, store: Arc<dyn StoreBackend>) -> Self {
        Self { proxy, store, rotator: None }
    }

    /// Request a new identity before every fetch
    pub fn with_rotation(mut self, rotator: Arc<dyn IdentityRotator>) -> Self {
        self.rotator = Some(rotator);
        self
    }

    /// GET the page; `None` when the site answers outside 2xx
    async fn fetch_page(&self, item: &QueueItem, url: Url) -> Result<Option<String>, TaskError> {
        let client = self.proxy.client().map_err(|e| TaskError::Setup(format!("{:#}", e)))?;

        debug!("[{}] Fetching: {}", item.id, item.url);
        let timer = RequestTimer::start();

        let transport = |source: reqwest::Error| TaskError::Transport { url: item.url.clone(), source };
        let response = client.get(url).send().await.map_err(transport)?;
        let status = response.status();

        debug!("[{}] Fetch result: {} in {}ms", item.id, status, timer.end());

        if !status.is_success() {
            warn!("[{}] HTTP {} for {}", item.id, status.as_u16(), item.url);
            return Ok(None);
        }

        let body = response.text().await.map_err(transport)?;
        Ok(Some(body))
    }
}

#[async_trait]
impl TaskExecutor for PageFetcher {
    async fn execute(&self, item: QueueItem) -> Result<FetchOutcome, TaskError> {
        if let Some(rotator) = &self.rotator {
            rotator.rotate().await?;
        }

        let url = match Url::parse(&item.url) {
            Ok(url) => url,
            Err(e) => {
                warn!("[{}] Invalid URL {}: {}", item.id, item.url, e);
                return Ok(FetchOutcome::blocked());
            }
        };

        let html = match self.fetch_page(&item, url).await? {
            Some(html) => html,
            None => return Ok(FetchOutcome::blocked()),
        };

        let extracted = extractor::extract(&html);
        if !extracted.is_usable() {
            debug!("[{}] Nothing usable (lang {}, {} bytes of text)", item.id, extracted.lang, extracted.content.len());
            return Ok(FetchOutcome::unsaved());
        }

        let document = ExtractedDocument {
            id: item.id,
            url: item.url,
            lang: extracted.lang,
            content: extracted.content,
            fetched_at: Utc::now(),
        };

        let saved = self.store.insert_document(&document).await
            .map_err(|e| TaskError::Store { id: item.id, message: format!("{:#}", e) })?;

        info!("[{}] Extracted content {}", item.id, if saved { "saved" } else { "was not saved" });

        Ok(FetchOutcome::stored(saved))
    }
}
