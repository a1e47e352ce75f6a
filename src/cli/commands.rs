use anyhow::{Result, Context};
use std::path::Path;
use tracing::{info, warn};

use crate::cli::config::{CrawlerConfig, RotationPolicy};
use crate::crawler::controller::{CrawlerController, StopReason};
use crate::crawler::extractor;
use crate::proxy::{IdentityRotator, TorController};
use crate::storage::{self, ItemState};
use crate::utils::shutdown_signal;

/// Drain the pending queue
pub async fn run(config_path: Option<&Path>, workers: Option<usize>, rotation: Option<RotationPolicy>) -> Result<()> {
    let mut config = CrawlerConfig::load(config_path)?;

    if let Some(w) = workers {
        config.crawler.workers = Some(w);
    }
    if let Some(r) = rotation {
        config.crawler.rotation = r;
    }

    config.validate()?;

    // Signal handlers are installed on the first poll, before the store is opened.
    // A signal that arrives after the open is observed by the run itself.
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let store = tokio::select! {
        _ = &mut shutdown => {
            warn!("Interrupted during initialization");
            return Ok(());
        }
        store = storage::open(&config.storage) => store.context("Failed to open the queue store")?,
    };

    let controller = CrawlerController::new(&config, store).await?;

    let report = controller.run(shutdown).await;
    let metrics = &report.metrics;

    println!("Run:       {}", report.run_id);
    println!("Stopped:   {:?}", report.reason);
    println!("Batches:   {}", metrics.batches);
    println!("Saved:     {}", metrics.saved);
    println!("Blocked:   {}", metrics.blocked);
    println!("Unsaved:   {}", metrics.unsaved);
    println!("Rejected:  {}", metrics.rejected);
    println!("Remaining: {}", metrics.remaining);

    match report.reason {
        StopReason::Fatal(message) => anyhow::bail!("Run {} aborted: {}", report.run_id, message),
        StopReason::Drained | StopReason::Interrupted => Ok(()),
    }
}

/// Print queue counts per state
pub async fn status(config_path: Option<&Path>) -> Result<()> {
    let config = CrawlerConfig::load(config_path)?;
    config.validate()?;

    let store = storage::open(&config.storage).await
        .context("Failed to open the queue store")?;

    let mut counts = Vec::new();
    for state in [ItemState::Pending, ItemState::Fetched, ItemState::Failed] {
        let count = store.count(state).await
            .context(format!("Failed to count {:?} items", state))?;
        counts.push((state, count));
    }
    store.close().await?;

    for (state, count) in counts {
        println!("{:<8} {}", format!("{:?}:", state), count);
    }

    Ok(())
}

/// Ask the proxy for a new exit identity once
pub async fn rotate(config_path: Option<&Path>) -> Result<()> {
    let config = CrawlerConfig::load(config_path)?;
    let controller = TorController::from_settings(&config.proxy)
        .context("No control password configured (proxy.control_password or CONTROL_PASSWORD)")?;

    controller.rotate().await?;
    println!("New identity requested");

    Ok(())
}

/// Run the extractor on a local file and print what it finds
pub async fn extract_file(file: &Path) -> Result<()> {
    let html = tokio::fs::read_to_string(file).await
        .context(format!("Failed to read {}", file.display()))?;

    let extracted = extractor::extract(&html);
    info!("Extracted {} bytes of text", extracted.content.len());

    println!("Language: {}", extracted.lang);
    println!("Usable:   {}", extracted.is_usable());
    println!();
    println!("{}", extracted.content);

    Ok(())
}

/// Show the effective configuration with secrets masked
pub async fn show_config(config_path: Option<&Path>) -> Result<()> {
    let config = CrawlerConfig::load(config_path)?;
    let rendered = serde_yaml::to_string(&config.redacted())
        .context("Failed to serialize configuration")?;

    println!("Effective configuration:");
    println!("{}", rendered);

    Ok(())
}

/// Write the default configuration unless one already exists
pub async fn init_config() -> Result<()> {
    let path = CrawlerConfig::default_path();
    if path.exists() {
        anyhow::bail!("Configuration already exists at {}", path.display());
    }

    let path = CrawlerConfig::default().save_as_default()?;
    println!("Created default configuration: {}", path.display());

    Ok(())
}
