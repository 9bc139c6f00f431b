use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};

pub const DEFAULT_USER_AGENT: &str = "wikigg-harvest/0.1";
pub const DEFAULT_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_DIRECTORY_ENDPOINT: &str = "https://www.wiki.gg/_api/cloud-data/v2/items/query";
pub const DEFAULT_APP_ID: &str = "9da2fba0-30fd-4379-962b-335075512ce3";
pub const DEFAULT_PAGE_DELAY_MS: u64 = 500;

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct HarvestConfig {
    #[serde(default)]
    pub http: HttpSection,
    #[serde(default)]
    pub directory: DirectorySection,
    #[serde(default)]
    pub crawl: CrawlSection,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct HttpSection {
    pub user_agent: Option<String>,
    pub timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct DirectorySection {
    pub endpoint: Option<String>,
    pub app_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq, Eq)]
pub struct CrawlSection {
    pub page_delay_ms: Option<u64>,
}

impl HarvestConfig {
    /// Resolve user agent: env WIKIGG_USER_AGENT > config > DEFAULT_USER_AGENT.
    pub fn user_agent(&self) -> String {
        env_string("WIKIGG_USER_AGENT")
            .or_else(|| self.http.user_agent.clone())
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string())
    }

    pub fn timeout(&self) -> Duration {
        let millis = env_u64("WIKIGG_HTTP_TIMEOUT_MS")
            .or(self.http.timeout_ms)
            .unwrap_or(DEFAULT_TIMEOUT_MS);
        Duration::from_millis(millis)
    }

    pub fn directory_endpoint(&self) -> String {
        env_string("WIKIGG_DIRECTORY_URL")
            .or_else(|| self.directory.endpoint.clone())
            .unwrap_or_else(|| DEFAULT_DIRECTORY_ENDPOINT.to_string())
    }

    pub fn app_id(&self) -> String {
        env_string("WIKIGG_APP_ID")
            .or_else(|| self.directory.app_id.clone())
            .unwrap_or_else(|| DEFAULT_APP_ID.to_string())
    }

    /// Delay between page fetches in the content crawl.
    pub fn page_delay(&self) -> Duration {
        let millis = env_u64("WIKIGG_PAGE_DELAY_MS")
            .or(self.crawl.page_delay_ms)
            .unwrap_or(DEFAULT_PAGE_DELAY_MS);
        Duration::from_millis(millis)
    }

    pub fn http_settings(&self) -> HttpSettings {
        HttpSettings {
            user_agent: self.user_agent(),
            timeout: self.timeout(),
        }
    }
}

/// Resolved transport settings shared by every HTTP client in the crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSettings {
    pub user_agent: String,
    pub timeout: Duration,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
        }
    }
}

impl HttpSettings {
    pub fn build_client(&self) -> Result<Client> {
        Client::builder()
            .timeout(self.timeout)
            .user_agent(self.user_agent.clone())
            .build()
            .context("failed to build HTTP client")
    }
}

/// Load and parse a HarvestConfig from a TOML file. Returns default if file doesn't exist.
pub fn load_config(config_path: &Path) -> Result<HarvestConfig> {
    if !config_path.exists() {
        return Ok(HarvestConfig::default());
    }
    let content = fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {}", config_path.display()))?;
    let parsed: HarvestConfig = toml::from_str(&content)
        .with_context(|| format!("failed to parse {}", config_path.display()))?;
    Ok(parsed)
}

fn env_string(key: &str) -> Option<String> {
    let value = env::var(key).ok()?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env_string(key).and_then(|value| value.parse::<u64>().ok())
}
