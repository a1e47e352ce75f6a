use anyhow::{Result, Context};
use rand::{thread_rng, Rng};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, CONNECTION, USER_AGENT};
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::cli::config::{BrowserProfile, CrawlerSettings, ProxySettings};

/// Builds the HTTP clients fetch tasks use to reach pages through the proxy
#[derive(Debug, Clone)]
pub struct ProxyManager {
    /// SOCKS proxy URL, `None` for direct connections
    socks_url: Option<String>,

    /// Header sets to pick from
    profiles: Vec<BrowserProfile>,

    /// Per-request timeout
    timeout: Duration,
}

impl ProxyManager {
    pub fn new(proxy: &ProxySettings, crawler: &CrawlerSettings) -> Self {
        Self {
            socks_url: proxy.socks_url.clone(),
            profiles: crawler.profiles.clone(),
            timeout: crawler.request_timeout(),
        }
    }

    /// Select a random browser profile
    pub fn random_profile(&self) -> Result<&BrowserProfile> {
        if self.profiles.is_empty() {
            anyhow::bail!("No browser profiles configured");
        }

        let mut rng = thread_rng();
        Ok(&self.profiles[rng.gen_range(0..self.profiles.len())])
    }

    /// Build a fresh client for one task.
    ///
    /// Every task gets its own connection pool, so a connection opened before
    /// an identity rotation is never reused after it.
    pub fn client(&self) -> Result<Client> {
        let profile = self.random_profile()?;
        let headers = profile_headers(profile)?;

        let mut builder = Client::builder()
            .default_headers(headers)
            .timeout(self.timeout);

        if let Some(socks_url) = &self.socks_url {
            let proxy = reqwest::Proxy::all(socks_url)
                .context(format!("Invalid SOCKS proxy URL: {}", socks_url))?;
            builder = builder.proxy(proxy);
        } else {
            builder = builder.no_proxy();
        }

        debug!("Built client with profile: {}", profile.user_agent);

        builder.build().context("Failed to create HTTP client")
    }
}

fn profile_headers(profile: &BrowserProfile) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_str(&profile.user_agent)
        .context("Invalid user agent in browser profile")?);
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_str(&profile.accept_language)
        .context("Invalid accept-language in browser profile")?);
    headers.insert(ACCEPT, HeaderValue::from_str(&profile.accept)
        .context("Invalid accept header in browser profile")?);
    headers.insert(CONNECTION, HeaderValue::from_static("keep-alive"));
    Ok(headers)
}
