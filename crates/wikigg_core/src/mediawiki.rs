use std::cell::Cell;
use std::collections::BTreeMap;

use anyhow::{Context, Result, bail};
use reqwest::Url;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::config::HttpSettings;
use crate::pager::Page;

/// Raw access to a wiki's `api.php`. Implementations return the decoded JSON
/// body as-is; API-level `error` payloads are checked by the callers.
pub trait SiteApi {
    fn get_json(&self, host: &str, params: &[(&str, String)]) -> Result<Value>;
}

impl<T: SiteApi + ?Sized> SiteApi for &T {
    fn get_json(&self, host: &str, params: &[(&str, String)]) -> Result<Value> {
        (**self).get_json(host, params)
    }
}

/// A page as listed by `list=allpages`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ListedPage {
    pub pageid: i64,
    pub title: String,
}

pub struct MediaWikiClient {
    client: Client,
    request_count: Cell<usize>,
}

impl MediaWikiClient {
    pub fn new(settings: &HttpSettings) -> Result<Self> {
        let client = settings
            .build_client()
            .context("failed to build MediaWiki HTTP client")?;
        Ok(Self {
            client,
            request_count: Cell::new(0),
        })
    }

    pub fn request_count(&self) -> usize {
        self.request_count.get()
    }
}

impl SiteApi for MediaWikiClient {
    fn get_json(&self, host: &str, params: &[(&str, String)]) -> Result<Value> {
        let url = api_url(host)?;
        let mut pairs = Vec::with_capacity(params.len() + 1);
        pairs.push(("format", "json".to_string()));
        for (key, value) in params {
            pairs.push((*key, value.clone()));
        }

        self.request_count.set(self.request_count.get() + 1);
        let response = self
            .client
            .get(url.clone())
            .query(&pairs)
            .send()
            .with_context(|| format!("failed to call MediaWiki API {url}"))?;
        let status = response.status();
        if !status.is_success() {
            bail!("MediaWiki API request to {url} failed with HTTP {status}");
        }
        response
            .json::<Value>()
            .context("failed to decode MediaWiki API JSON response")
    }
}

/// `<host>/api.php`, tolerating a trailing slash on the host.
pub fn api_url(host: &str) -> Result<Url> {
    let base = host.trim().trim_end_matches('/');
    Url::parse(&format!("{base}/api.php")).with_context(|| format!("invalid wiki host: {host}"))
}

/// Fail when the payload carries a non-empty top-level `error`.
pub fn ensure_no_api_error(payload: &Value) -> Result<()> {
    let Some(error) = payload.get("error").filter(|error| is_truthy(error)) else {
        return Ok(());
    };
    let code = error.get("code").and_then(Value::as_str);
    let info = error.get("info").and_then(Value::as_str);
    match (code, info) {
        (None, None) => bail!("MediaWiki API error: {error}"),
        (code, info) => bail!(
            "MediaWiki API error [{}]: {}",
            code.unwrap_or("unknown_error"),
            info.unwrap_or("unknown info")
        ),
    }
}

fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(flag) => *flag,
        Value::Number(number) => number.as_f64().is_some_and(|n| n != 0.0),
        Value::String(text) => !text.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// One `list=allpages` batch; the next cursor is `continue.apcontinue`.
pub fn fetch_allpages<A: SiteApi + ?Sized>(
    api: &A,
    host: &str,
    apcontinue: Option<&str>,
) -> Result<Page<ListedPage, String>> {
    let mut params = vec![
        ("action", "query".to_string()),
        ("list", "allpages".to_string()),
        ("aplimit", "max".to_string()),
    ];
    if let Some(token) = apcontinue {
        params.push(("apcontinue", token.to_string()));
    }

    let payload = api.get_json(host, &params)?;
    ensure_no_api_error(&payload)?;
    let parsed: AllPagesResponse =
        serde_json::from_value(payload).context("failed to decode allpages API response")?;
    Ok(Page::new(
        parsed.query.allpages,
        non_empty_cursor(parsed.continuation.apcontinue),
    ))
}

/// `action=parse` for one title, returned untouched.
pub fn fetch_parsed_page<A: SiteApi + ?Sized>(api: &A, host: &str, title: &str) -> Result<Value> {
    let payload = api.get_json(
        host,
        &[
            ("action", "parse".to_string()),
            ("page", title.to_string()),
        ],
    )?;
    ensure_no_api_error(&payload)?;
    Ok(payload)
}

/// Latest main-slot wikitext of a page, `None` when any level of the
/// response is missing.
pub fn fetch_revision_content<A: SiteApi + ?Sized>(
    api: &A,
    host: &str,
    page_id: i64,
) -> Result<Option<String>> {
    let payload = api.get_json(
        host,
        &[
            ("action", "query".to_string()),
            ("prop", "revisions".to_string()),
            ("rvprop", "content".to_string()),
            ("rvslots", "main".to_string()),
            ("pageids", page_id.to_string()),
        ],
    )?;
    ensure_no_api_error(&payload)?;
    Ok(extract_revision_content(&payload, page_id))
}

pub fn extract_revision_content(payload: &Value, page_id: i64) -> Option<String> {
    let main = payload.pointer(&format!("/query/pages/{page_id}/revisions/0/slots/main"))?;
    main.get("*")
        .or_else(|| main.get("content"))
        .and_then(Value::as_str)
        .map(ToString::to_string)
}

/// One `prop=links` batch for a page; the next cursor is `continue.plcontinue`.
pub fn fetch_links<A: SiteApi + ?Sized>(
    api: &A,
    host: &str,
    page_id: i64,
    plcontinue: Option<&str>,
) -> Result<Page<String, String>> {
    let mut params = vec![
        ("action", "query".to_string()),
        ("prop", "links".to_string()),
        ("pllimit", "max".to_string()),
        ("pageids", page_id.to_string()),
    ];
    if let Some(token) = plcontinue {
        params.push(("plcontinue", token.to_string()));
    }

    let payload = api.get_json(host, &params)?;
    ensure_no_api_error(&payload)?;
    let mut parsed: LinksResponse =
        serde_json::from_value(payload).context("failed to decode links API response")?;
    let targets = parsed
        .query
        .pages
        .remove(&page_id.to_string())
        .map(|page| page.links.into_iter().map(|link| link.title).collect())
        .unwrap_or_default();
    Ok(Page::new(
        targets,
        non_empty_cursor(parsed.continuation.plcontinue),
    ))
}

/// An empty continuation token ends the walk like a missing one.
fn non_empty_cursor(token: Option<String>) -> Option<String> {
    token.filter(|token| !token.is_empty())
}

#[derive(Debug, Deserialize, Default)]
struct AllPagesResponse {
    #[serde(default)]
    query: AllPagesPayload,
    #[serde(default, rename = "continue")]
    continuation: ContinuationPayload,
}

#[derive(Debug, Deserialize, Default)]
struct AllPagesPayload {
    #[serde(default)]
    allpages: Vec<ListedPage>,
}

#[derive(Debug, Deserialize, Default)]
struct LinksResponse {
    #[serde(default)]
    query: LinksPayload,
    #[serde(default, rename = "continue")]
    continuation: ContinuationPayload,
}

#[derive(Debug, Deserialize, Default)]
struct LinksPayload {
    #[serde(default)]
    pages: BTreeMap<String, LinkedPageItem>,
}

#[derive(Debug, Deserialize, Default)]
struct LinkedPageItem {
    #[serde(default)]
    links: Vec<TitleQueryItem>,
}

#[derive(Debug, Deserialize)]
struct TitleQueryItem {
    title: String,
}

#[derive(Debug, Deserialize, Default)]
struct ContinuationPayload {
    apcontinue: Option<String>,
    plcontinue: Option<String>,
}
