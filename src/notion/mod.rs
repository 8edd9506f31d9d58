use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::{Client, Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::fmt;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::PipelineError;
use crate::model::{BlockMetadata, Listing, RemoteBlock, RemotePage};
use crate::notion::model::{ListResp, PageObject};

pub mod model;

const NOTION_API_BASE: &str = "https://api.notion.com/";
pub const PAGE_SIZE: u32 = 100;

static NOTION_ID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)([0-9a-f]{8})-?([0-9a-f]{4})-?([0-9a-f]{4})-?([0-9a-f]{4})-?([0-9a-f]{12})$")
        .expect("valid notion id regex")
});

/// Normalize a Notion id (bare, hyphenated, or the tail of a page URL) to the
/// lowercase hyphenated form the API returns.
pub fn normalize_id(raw: &str) -> Option<String> {
    let trimmed = raw.trim().trim_end_matches('/');
    let trimmed = trimmed.split(['?', '#']).next().unwrap_or(trimmed);
    let caps = NOTION_ID.captures(trimmed)?;
    Some(
        format!(
            "{}-{}-{}-{}-{}",
            &caps[1], &caps[2], &caps[3], &caps[4], &caps[5]
        )
        .to_ascii_lowercase(),
    )
}

/// Optional narrowing of the page inventory.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageFilter {
    pub database_id: Option<String>,
}

/// The calls the pipeline makes against the remote source.
#[async_trait]
pub trait NotionSource: Send + Sync {
    async fn list_pages(
        &self,
        filter: Option<&PageFilter>,
        cursor: Option<&str>,
    ) -> Result<Listing<RemotePage>>;

    async fn get_block_metadata(&self, block_id: &str) -> Result<BlockMetadata>;

    async fn list_children(&self, block_id: &str, cursor: Option<&str>)
        -> Result<Listing<RemoteBlock>>;
}

#[derive(Clone)]
pub struct NotionClient {
    http: Client,
    base_url: Url,
    token: String,
    version: String,
    type_property: String,
}

impl fmt::Debug for NotionClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotionClient")
            .field("base_url", &self.base_url)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl NotionClient {
    pub fn new(token: String, version: String) -> Result<Self> {
        let base_url = Url::parse(NOTION_API_BASE).context("invalid default Notion URL")?;
        Self::with_base_url(token, version, base_url)
    }

    pub fn with_base_url(token: String, version: String, base_url: Url) -> Result<Self> {
        let http = Client::builder()
            .user_agent("notion-mirror/0.1")
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url,
            token,
            version,
            type_property: "Type".to_string(),
        })
    }

    pub fn from_config(cfg: &Config) -> Result<Self> {
        let mut client = Self::new(cfg.notion.token.clone(), cfg.notion.version.clone())?;
        client.type_property = cfg.notion.type_property.clone();
        Ok(client)
    }

    pub fn build_request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
    ) -> Result<reqwest::Request> {
        let endpoint = self
            .base_url
            .join(path)
            .context("invalid Notion base URL")?;
        let mut builder = self
            .http
            .request(method, endpoint)
            .header("Authorization", format!("Bearer {}", self.token))
            .header("Notion-Version", &self.version);
        if !query.is_empty() {
            builder = builder.query(query);
        }
        if let Some(body) = body {
            builder = builder
                .header("Content-Type", "application/json")
                .json(body);
        }
        builder.build().context("failed to build Notion request")
    }

    async fn execute<T: DeserializeOwned>(&self, request: reqwest::Request) -> Result<T> {
        debug!(method=%request.method(), url=%request.url(), "sending notion request");
        let res = self
            .http
            .execute(request)
            .await
            .map_err(|err| PipelineError::RemoteTransient(err.to_string()))
            .context("failed to reach Notion")?;

        if res.status() == StatusCode::TOO_MANY_REQUESTS {
            let body = res.text().await.unwrap_or_default();
            warn!("Rate limited by Notion: {}", body);
            return Err(PipelineError::RemoteTransient(format!(
                "received 429 from Notion: {}",
                body
            ))
            .into());
        }
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(
                PipelineError::RemoteTransient(format!("notion error {}: {}", status, body)).into(),
            );
        }

        res.json::<T>().await.context("invalid Notion response")
    }

    fn block_path(block_id: &str, suffix: &str) -> Result<String> {
        let id = normalize_id(block_id).ok_or_else(|| anyhow!("invalid block id '{}'", block_id))?;
        Ok(format!("v1/blocks/{}{}", id, suffix))
    }

    pub async fn retrieve_block(&self, block_id: &str) -> Result<RemoteBlock> {
        let path = Self::block_path(block_id, "")?;
        let request = self.build_request(Method::GET, &path, &[], None)?;
        self.execute(request).await
    }
}

pub fn build_search_body(cursor: Option<&str>) -> Value {
    let mut body = json!({
        "filter": { "property": "object", "value": "page" },
        "page_size": PAGE_SIZE,
    });
    if let Some(cursor) = cursor {
        body["start_cursor"] = json!(cursor);
    }
    body
}

pub fn build_query_body(cursor: Option<&str>) -> Value {
    let mut body = json!({ "page_size": PAGE_SIZE });
    if let Some(cursor) = cursor {
        body["start_cursor"] = json!(cursor);
    }
    body
}

#[async_trait]
impl NotionSource for NotionClient {
    async fn list_pages(
        &self,
        filter: Option<&PageFilter>,
        cursor: Option<&str>,
    ) -> Result<Listing<RemotePage>> {
        let request = match filter.and_then(|f| f.database_id.as_deref()) {
            Some(db) => {
                let id = normalize_id(db).ok_or_else(|| anyhow!("invalid database id '{}'", db))?;
                let body = build_query_body(cursor);
                self.build_request(
                    Method::POST,
                    &format!("v1/databases/{}/query", id),
                    &[],
                    Some(&body),
                )?
            }
            None => {
                let body = build_search_body(cursor);
                self.build_request(Method::POST, "v1/search", &[], Some(&body))?
            }
        };
        let resp: ListResp<PageObject> = self.execute(request).await?;
        Ok(Listing {
            results: resp
                .results
                .into_iter()
                .filter_map(|p| p.into_remote_page(&self.type_property))
                .collect(),
            next_cursor: resp.next_cursor,
            has_more: resp.has_more,
        })
    }

    async fn get_block_metadata(&self, block_id: &str) -> Result<BlockMetadata> {
        let block = self.retrieve_block(block_id).await?;
        Ok(BlockMetadata {
            id: block.id,
            edited_at: block.edited_at,
            has_children: block.has_children,
        })
    }

    async fn list_children(
        &self,
        block_id: &str,
        cursor: Option<&str>,
    ) -> Result<Listing<RemoteBlock>> {
        let path = Self::block_path(block_id, "/children")?;
        let mut query = vec![("page_size", PAGE_SIZE.to_string())];
        if let Some(cursor) = cursor {
            query.push(("start_cursor", cursor.to_string()));
        }
        let request = self.build_request(Method::GET, &path, &query, None)?;
        let resp: ListResp<RemoteBlock> = self.execute(request).await?;
        Ok(resp.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_id_accepts_bare_hyphenated_and_urls() {
        let want = "0123abcd-4567-89ef-0123-456789abcdef";
        assert_eq!(normalize_id(want).as_deref(), Some(want));
        assert_eq!(
            normalize_id("0123ABCD456789EF0123456789ABCDEF").as_deref(),
            Some(want)
        );
        assert_eq!(
            normalize_id("https://www.notion.so/ws/My-Page-0123abcd456789ef0123456789abcdef?pvs=4")
                .as_deref(),
            Some(want)
        );
        assert!(normalize_id("not-an-id").is_none());
    }

    #[test]
    fn search_body_filters_pages_and_carries_cursor() {
        let body = build_search_body(None);
        assert_eq!(body["filter"]["value"], "page");
        assert_eq!(body["page_size"], 100);
        assert!(body.get("start_cursor").is_none());

        let body = build_search_body(Some("cur-2"));
        assert_eq!(body["start_cursor"], "cur-2");
        assert_eq!(build_query_body(Some("c"))["start_cursor"], "c");
    }

    #[test]
    fn build_request_sets_headers() {
        let client = NotionClient::new("token".into(), "2022-06-28".into()).unwrap();
        let body = json!({ "sample": true });
        let request = client
            .build_request(Method::POST, "v1/search", &[], Some(&body))
            .unwrap();
        assert_eq!(request.method(), Method::POST);
        assert_eq!(request.url().path(), "/v1/search");
        let headers = request.headers();
        assert_eq!(
            headers
                .get("Authorization")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "Bearer token"
        );
        assert_eq!(
            headers
                .get("Notion-Version")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "2022-06-28"
        );
        assert_eq!(
            headers
                .get("Content-Type")
                .and_then(|h| h.to_str().ok())
                .unwrap(),
            "application/json"
        );
    }

    #[test]
    fn children_request_uses_query_cursor() {
        let client = NotionClient::new("token".into(), "2022-06-28".into()).unwrap();
        let path = NotionClient::block_path("0123abcd456789ef0123456789abcdef", "/children").unwrap();
        let request = client
            .build_request(
                Method::GET,
                &path,
                &[("page_size", "100".into()), ("start_cursor", "abc".into())],
                None,
            )
            .unwrap();
        assert_eq!(
            request.url().path(),
            "/v1/blocks/0123abcd-4567-89ef-0123-456789abcdef/children"
        );
        assert_eq!(request.url().query(), Some("page_size=100&start_cursor=abc"));
        assert!(request.headers().get("Content-Type").is_none());
    }
}
