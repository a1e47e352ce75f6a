pub mod controller;
pub mod extractor;
pub mod task;

// Re-export common types
pub use controller::{CrawlerController, RunReport, StopReason};
pub use task::{ExtractedDocument, FetchOutcome, PageFetcher, QueueItem, TaskError, TaskExecutor};
