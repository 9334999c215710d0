//! Confluence Cloud pages of one space.
//!
//! The group URL names the space (`…/wiki/spaces/<KEY>…`). Listing pages
//! returns a relative `_links.next` link; its `cursor` query parameter is
//! the discovery cursor. Page bodies are fetched in the `view` rendering and
//! converted to markdown.

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use std::sync::{Arc, LazyLock};
use url::Url;

use crate::config::ConfluenceSourceConfig;
use crate::error::{SyncError, SyncResult};
use crate::models::{Discovery, GroupType, ItemJob, ItemRef, KnowledgeGroup, Page};
use crate::sources::{html_to_markdown, status_error, SkipFilter, Source};

static RE_SPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"/spaces/([A-Za-z0-9~_-]+)").expect("valid regex"));

#[derive(Debug, Clone, PartialEq)]
pub struct ConfluencePageRef {
    pub id: String,
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, Default)]
pub struct ConfluenceListing {
    pub pages: Vec<ConfluencePageRef>,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConfluencePage {
    pub title: String,
    /// `body.view` HTML.
    pub html: String,
}

#[async_trait]
pub trait ConfluenceApi: Send + Sync {
    async fn list_pages(&self, space_key: &str, cursor: Option<&str>)
        -> SyncResult<ConfluenceListing>;

    async fn get_page_view(&self, page_id: &str) -> SyncResult<ConfluencePage>;
}

/// Space key from a space URL.
pub fn space_key(url: &str) -> SyncResult<String> {
    RE_SPACE
        .captures(url)
        .map(|c| c[1].to_string())
        .ok_or_else(|| SyncError::config(format!("not a Confluence space URL: '{}'", url)))
}

/// The `cursor` query parameter of a (possibly relative) next-page link.
pub fn cursor_from_next_link(next: &str) -> Option<String> {
    let base = Url::parse("https://confluence.invalid/").ok()?;
    let url = base.join(next).ok()?;
    url.query_pairs()
        .find(|(k, _)| k == "cursor")
        .map(|(_, v)| v.into_owned())
}

/// Page listing request for a space, resuming at `cursor`.
pub fn list_pages_url(base: &str, space_key: &str, cursor: Option<&str>) -> SyncResult<Url> {
    let mut url = Url::parse(&format!("{}/wiki/rest/api/content", base))
        .map_err(|e| SyncError::config(format!("invalid Confluence base URL '{}': {}", base, e)))?;
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("spaceKey", space_key)
            .append_pair("type", "page")
            .append_pair("limit", "50");
        if let Some(c) = cursor {
            query.append_pair("cursor", c);
        }
    }
    Ok(url)
}

pub struct ConfluenceSource {
    api: Arc<dyn ConfluenceApi>,
}

impl ConfluenceSource {
    pub fn new(api: Arc<dyn ConfluenceApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Source for ConfluenceSource {
    fn group_type(&self) -> GroupType {
        GroupType::Confluence
    }

    fn description(&self) -> &str {
        "Confluence pages of one space"
    }

    async fn update_group(
        &self,
        group: &KnowledgeGroup,
        cursor: Option<&str>,
    ) -> SyncResult<Discovery> {
        let url = group
            .url
            .as_deref()
            .ok_or_else(|| SyncError::config("Confluence group has no space URL"))?;
        let key = space_key(url)?;
        let skip = SkipFilter::for_group(group)?;

        let listing = self.api.list_pages(&key, cursor).await?;
        let items = listing
            .pages
            .into_iter()
            .filter(|p| !skip.skips(&[p.url.as_str(), p.id.as_str(), p.title.as_str()]))
            .map(|p| ItemRef::new(p.url).with_page_id(p.id).with_title(p.title))
            .collect();

        Ok(Discovery {
            items,
            pages: Vec::new(),
            next_cursor: listing.next_cursor,
        })
    }

    async fn update_item(&self, _group: &KnowledgeGroup, job: &ItemJob) -> SyncResult<Option<Page>> {
        let id = job.source_page_id.as_deref().ok_or_else(|| {
            SyncError::config(format!("Confluence item {} has no page id", job.url))
        })?;
        let page = self.api.get_page_view(id).await?;
        let body = html_to_markdown(&page.html)?;
        Ok(Some(Page {
            text: format!("# {}\n\n{}", page.title, body),
            title: page.title,
        }))
    }
}

// ============ HTTP client ============

pub struct HttpConfluenceApi {
    client: reqwest::Client,
    config: ConfluenceSourceConfig,
}

#[derive(Deserialize)]
struct ListResponse {
    #[serde(default)]
    results: Vec<ContentSummary>,
    #[serde(rename = "_links", default)]
    links: Links,
}

#[derive(Deserialize, Default)]
struct Links {
    #[serde(default)]
    next: Option<String>,
    #[serde(default)]
    webui: Option<String>,
}

#[derive(Deserialize)]
struct ContentSummary {
    id: String,
    title: String,
    #[serde(rename = "_links", default)]
    links: Links,
}

#[derive(Deserialize)]
struct ContentView {
    title: String,
    body: ViewBody,
}

#[derive(Deserialize)]
struct ViewBody {
    view: ViewValue,
}

#[derive(Deserialize)]
struct ViewValue {
    value: String,
}

impl HttpConfluenceApi {
    pub fn new(client: reqwest::Client, config: ConfluenceSourceConfig) -> Self {
        Self { client, config }
    }

    fn base_url(&self) -> SyncResult<&str> {
        self.config
            .base_url
            .as_deref()
            .map(|u| u.trim_end_matches('/'))
            .ok_or_else(|| SyncError::config("sources.confluence.base_url is not set"))
    }

    fn get(&self, url: &str) -> SyncResult<reqwest::RequestBuilder> {
        let email = self
            .config
            .email
            .as_deref()
            .ok_or_else(|| SyncError::config("sources.confluence.email is not set"))?;
        Ok(self
            .client
            .get(url)
            .basic_auth(email, self.config.api_token.as_deref()))
    }
}

#[async_trait]
impl ConfluenceApi for HttpConfluenceApi {
    async fn list_pages(
        &self,
        space_key: &str,
        cursor: Option<&str>,
    ) -> SyncResult<ConfluenceListing> {
        let base = self.base_url()?;
        let url = list_pages_url(base, space_key, cursor)?;
        let resp = self.get(url.as_str())?.send().await?;
        if !resp.status().is_success() {
            return Err(status_error(&format!("GET {}", url), resp.status()));
        }
        let body: ListResponse = resp.json().await?;

        let pages = body
            .results
            .into_iter()
            .map(|r| ConfluencePageRef {
                url: match &r.links.webui {
                    Some(webui) => format!("{}/wiki{}", base, webui),
                    None => format!("{}/wiki/pages/viewpage.action?pageId={}", base, r.id),
                },
                id: r.id,
                title: r.title,
            })
            .collect();
        Ok(ConfluenceListing {
            pages,
            next_cursor: body.links.next.as_deref().and_then(cursor_from_next_link),
        })
    }

    async fn get_page_view(&self, page_id: &str) -> SyncResult<ConfluencePage> {
        let url = format!(
            "{}/wiki/rest/api/content/{}?expand=body.view",
            self.base_url()?,
            page_id
        );
        let resp = self.get(&url)?.send().await?;
        if !resp.status().is_success() {
            return Err(status_error(&format!("GET {}", url), resp.status()));
        }
        let content: ContentView = resp.json().await?;
        Ok(ConfluencePage {
            title: content.title,
            html: content.body.view.value,
        })
    }
}
