use anyhow::{Result, Context};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::fs;
use std::time::Duration;
use tracing::{info, debug};

/// Main configuration structure
#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct CrawlerConfig {
    pub crawler: CrawlerSettings,
    pub proxy: ProxySettings,
    pub storage: StorageSettings,
}

/// When to request a new identity from the anonymizing proxy
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum RotationPolicy {
    #[default]
    Off,
    PerTask,
    PerBatch,
}

/// What happens to an item whose page was fetched but yielded nothing worth saving
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum UnusableContentPolicy {
    #[default]
    MarkFailed,
    KeepPending,
}

/// Crawler-specific settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct CrawlerSettings {
    /// Overrides the worker count derived from the CPU count
    pub workers: Option<usize>,
    pub rotation: RotationPolicy,
    pub unusable_content: UnusableContentPolicy,
    pub request_timeout_secs: u64,
    pub task_timeout_secs: u64,
    pub profiles: Vec<BrowserProfile>,
}

/// Header set sent with every page request
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct BrowserProfile {
    pub user_agent: String,
    pub accept_language: String,
    pub accept: String,
}

/// Proxy and control port settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ProxySettings {
    /// SOCKS proxy every page request goes through; `None` connects directly
    pub socks_url: Option<String>,
    pub control_host: String,
    pub control_port: u16,
    pub control_password: Option<String>,
    pub control_timeout_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    #[default]
    Mongodb,
    Filesystem,
}

/// Storage settings
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct StorageSettings {
    pub backend: StorageBackendKind,
    pub connection_string: Option<String>,
    pub queue_database: String,
    pub queue_collection: String,
    pub content_database: String,
    pub content_collection: String,
    /// Queue items for the filesystem backend
    pub queue_file: PathBuf,
    /// One `<id>.json` per extracted document for the filesystem backend
    pub output_dir: PathBuf,
}

impl Default for CrawlerSettings {
    fn default() -> Self {
        Self {
            workers: None,
            rotation: RotationPolicy::Off,
            unusable_content: UnusableContentPolicy::MarkFailed,
            request_timeout_secs: 20,
            task_timeout_secs: 60,
            profiles: vec![
                BrowserProfile {
                    user_agent: "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/139.0.0.0 Safari/537.36".to_string(),
                    accept_language: "es-ES,es;q=0.9,en;q=0.8".to_string(),
                    accept: "text/html,application/xhtml+xml,application/xml;q=0.9,image/webp,*/*;q=0.8".to_string(),
                },
            ],
        }
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            socks_url: Some("socks5h://127.0.0.1:9050".to_string()),
            control_host: "127.0.0.1".to_string(),
            control_port: 9051,
            control_password: None,
            control_timeout_secs: 10,
        }
    }
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::Mongodb,
            connection_string: None,
            queue_database: "indexed_content".to_string(),
            queue_collection: "news".to_string(),
            content_database: "fetched_content".to_string(),
            content_collection: "news".to_string(),
            queue_file: PathBuf::from("./queue.json"),
            output_dir: PathBuf::from("./output"),
        }
    }
}

impl CrawlerSettings {
    /// Number of concurrent fetch tasks for this run
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| default_workers(num_cpus::get()))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }
}

impl ProxySettings {
    pub fn control_timeout(&self) -> Duration {
        Duration::from_secs(self.control_timeout_secs)
    }
}

/// Three quarters of the logical CPUs, never less than one
pub fn default_workers(cpus: usize) -> usize {
    ((cpus as f64 / 4.0) * 3.0).round().max(1.0) as usize
}

impl CrawlerConfig {
    /// Get the path to the config directory
    fn config_dir() -> PathBuf {
        if let Some(proj_dirs) = directories::ProjectDirs::from("com", "news-extractor", "news-extractor") {
            proj_dirs.config_dir().to_path_buf()
        } else {
            PathBuf::from("./config")
        }
    }

    /// Path of the default configuration file
    pub fn default_path() -> PathBuf {
        Self::config_dir().join("config.yaml")
    }

    /// Load the configuration from `path`, or from the default location.
    ///
    /// An explicit path must exist. A missing default file falls back to the
    /// built-in defaults. Environment overrides are applied last.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_file(path)?,
            None => {
                let default_path = Self::default_path();
                if default_path.exists() {
                    Self::load_from_file(&default_path)?
                } else {
                    debug!("No configuration at {}, using defaults", default_path.display());
                    Self::default()
                }
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Load configuration from a file
    fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let config: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        Ok(config)
    }

    /// Overlay process environment onto the loaded settings
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("MONGODB_URL") {
            self.storage.connection_string = Some(url);
        }
        if let Some(proxy) = lookup("SOCKS_PROXY") {
            self.proxy.socks_url = if proxy.is_empty() { None } else { Some(proxy) };
        }
        if let Some(host) = lookup("CONTROL_HOST") {
            self.proxy.control_host = host;
        }
        if let Some(port) = lookup("CONTROL_PORT") {
            self.proxy.control_port = port.parse()
                .context(format!("CONTROL_PORT is not a valid port: {}", port))?;
        }
        if let Some(password) = lookup("CONTROL_PASSWORD") {
            self.proxy.control_password = Some(password);
        }
        if let Some(dir) = lookup("OUTPUT_DIR") {
            self.storage.output_dir = PathBuf::from(dir);
        }
        if let Some(file) = lookup("QUEUE_FILE") {
            self.storage.queue_file = PathBuf::from(file);
        }
        if let Some(workers) = lookup("CRAWLER_WORKERS") {
            self.crawler.workers = Some(workers.parse()
                .context(format!("CRAWLER_WORKERS is not a number: {}", workers))?);
        }
        Ok(())
    }

    /// Reject settings a run cannot start with
    pub fn validate(&self) -> Result<()> {
        if self.crawler.workers == Some(0) {
            anyhow::bail!("crawler.workers must be at least 1");
        }
        if self.crawler.request_timeout_secs == 0 || self.crawler.task_timeout_secs == 0 {
            anyhow::bail!("crawler.request_timeout_secs and crawler.task_timeout_secs must be at least 1");
        }
        if self.proxy.control_timeout_secs == 0 {
            anyhow::bail!("proxy.control_timeout_secs must be at least 1");
        }
        if self.crawler.profiles.is_empty() {
            anyhow::bail!("crawler.profiles must contain at least one browser profile");
        }
        if self.crawler.rotation != RotationPolicy::Off && self.proxy.control_password.is_none() {
            anyhow::bail!("Identity rotation requires proxy.control_password (or CONTROL_PASSWORD)");
        }
        if self.storage.backend == StorageBackendKind::Mongodb && self.storage.connection_string.is_none() {
            anyhow::bail!("The mongodb backend requires storage.connection_string (or MONGODB_URL)");
        }
        Ok(())
    }

    /// Copy of the configuration that is safe to print
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if config.proxy.control_password.is_some() {
            config.proxy.control_password = Some("********".to_string());
        }
        if config.storage.connection_string.is_some() {
            config.storage.connection_string = Some("********".to_string());
        }
        config
    }

    /// Write the configuration to the default location
    pub fn save_as_default(&self) -> Result<PathBuf> {
        let path = Self::default_path();
        self.save_to_file(&path)?;
        info!("Configuration written to {}", path.display());
        Ok(path)
    }

    /// Save the configuration to a file
    fn save_to_file(&self, path: &Path) -> Result<()> {
        debug!("Saving configuration to: {}", path.display());

        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)
                    .context(format!("Failed to create directory: {}", parent.display()))?;
            }
        }

        let contents = serde_yaml::to_string(self)
            .context("Failed to serialize configuration")?;

        fs::write(path, contents)
            .context(format!("Failed to write configuration file: {}", path.display()))?;

        Ok(())
    }
}
