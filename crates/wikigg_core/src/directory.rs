use anyhow::{Context, Result, bail};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;

use crate::config::{DEFAULT_APP_ID, DEFAULT_DIRECTORY_ENDPOINT, HarvestConfig, HttpSettings};
use crate::model::WikiRecord;
use crate::pager::{Page, paginate};

pub const DIRECTORY_PAGE_SIZE: u64 = 1000;
pub const DIRECTORY_COLLECTION: &str = "SyncedWikis";

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryResponse {
    #[serde(default)]
    pub paging_metadata: PagingMetadata,
    #[serde(default)]
    pub data_items: Vec<DirectoryItem>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PagingMetadata {
    #[serde(default)]
    pub has_next: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryItem {
    pub id: String,
    pub data: DirectoryItemData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DirectoryItemData {
    pub name: String,
    pub host: String,
    #[serde(default)]
    pub logo: Option<String>,
}

impl From<DirectoryItem> for WikiRecord {
    fn from(item: DirectoryItem) -> Self {
        Self {
            id: item.id,
            name: item.data.name,
            host: item.data.host,
            logo: item.data.logo,
        }
    }
}

/// One offset/limit window of the wiki directory.
pub trait DirectoryApi {
    fn query_window(&self, offset: u64, limit: u64) -> Result<DirectoryResponse>;
}

impl<T: DirectoryApi + ?Sized> DirectoryApi for &T {
    fn query_window(&self, offset: u64, limit: u64) -> Result<DirectoryResponse> {
        (**self).query_window(offset, limit)
    }
}

/// Every wiki in the directory, fetched lazily one window at a time.
///
/// The offset moves by [`DIRECTORY_PAGE_SIZE`] after each request whatever
/// the window held; only `hasNext` decides whether another request follows.
pub fn list_wikis<A: DirectoryApi>(api: A) -> impl Iterator<Item = Result<WikiRecord>> {
    paginate(move |cursor: Option<&u64>| {
        let offset = cursor.copied().unwrap_or(0);
        let response = api.query_window(offset, DIRECTORY_PAGE_SIZE)?;
        debug!(
            offset,
            items = response.data_items.len(),
            has_next = response.paging_metadata.has_next,
            "directory window fetched"
        );
        let next = response
            .paging_metadata
            .has_next
            .then_some(offset + DIRECTORY_PAGE_SIZE);
        let records: Vec<WikiRecord> = response
            .data_items
            .into_iter()
            .map(WikiRecord::from)
            .collect();
        Ok(Page::new(records, next))
    })
    .items()
}

#[derive(Debug, Clone)]
pub struct DirectoryClientConfig {
    pub endpoint: String,
    pub app_id: String,
    pub http: HttpSettings,
}

impl Default for DirectoryClientConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_DIRECTORY_ENDPOINT.to_string(),
            app_id: DEFAULT_APP_ID.to_string(),
            http: HttpSettings::default(),
        }
    }
}

impl DirectoryClientConfig {
    pub fn from_config(config: &HarvestConfig) -> Self {
        Self {
            endpoint: config.directory_endpoint(),
            app_id: config.app_id(),
            http: config.http_settings(),
        }
    }
}

/// HTTP client for the wiki.gg cloud-data directory.
pub struct DirectoryClient {
    client: Client,
    config: DirectoryClientConfig,
    authorization: String,
}

impl DirectoryClient {
    pub fn new(config: DirectoryClientConfig, authorization: impl Into<String>) -> Result<Self> {
        let client = config.http.build_client()?;
        Ok(Self {
            client,
            config,
            authorization: authorization.into(),
        })
    }
}

impl DirectoryApi for DirectoryClient {
    fn query_window(&self, offset: u64, limit: u64) -> Result<DirectoryResponse> {
        let encoded = encode_directory_query(&self.config.app_id, offset, limit)?;
        let response = self
            .client
            .get(&self.config.endpoint)
            .query(&[(".r", encoded)])
            .header("authorization", &self.authorization)
            .send()
            .with_context(|| format!("failed to call directory API {}", self.config.endpoint))?;

        let status = response.status();
        if !status.is_success() {
            bail!("directory API request failed with HTTP {status}");
        }
        response
            .json::<DirectoryResponse>()
            .context("failed to decode directory API JSON response")
    }
}

pub fn directory_query_payload(app_id: &str, offset: u64, limit: u64) -> Value {
    json!({
        "dataCollectionId": DIRECTORY_COLLECTION,
        "query": {
            "filter": {},
            "sort": [{"fieldName": "name", "order": "ASC"}],
            "paging": {"offset": offset, "limit": limit},
            "fields": [],
        },
        "referencedItemOptions": [],
        "returnTotalCount": true,
        "environment": "LIVE",
        "appId": app_id,
    })
}

/// Base64 of the JSON query, as carried in the `.r` parameter.
pub fn encode_directory_query(app_id: &str, offset: u64, limit: u64) -> Result<String> {
    let payload = directory_query_payload(app_id, offset, limit);
    let raw = serde_json::to_vec(&payload).context("failed to serialize directory query")?;
    Ok(STANDARD.encode(raw))
}
