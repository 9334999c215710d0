//! Web pages: a fixed list of URLs, each fetched and converted to markdown.

use async_trait::async_trait;
use regex::Regex;
use std::collections::HashSet;
use std::sync::{Arc, LazyLock};

use crate::error::{SyncError, SyncResult};
use crate::models::{Discovery, GroupType, ItemJob, ItemRef, KnowledgeGroup, Page};
use crate::sources::{html_to_markdown, status_error, SkipFilter, Source};

/// Downloads raw HTML.
#[async_trait]
pub trait WebFetcher: Send + Sync {
    async fn fetch_html(&self, url: &str) -> SyncResult<String>;
}

pub struct HttpWebFetcher {
    client: reqwest::Client,
}

impl HttpWebFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WebFetcher for HttpWebFetcher {
    async fn fetch_html(&self, url: &str) -> SyncResult<String> {
        let resp = self.client.get(url).send().await?;
        if !resp.status().is_success() {
            return Err(status_error(&format!("GET {}", url), resp.status()));
        }
        Ok(resp.text().await?)
    }
}

pub struct WebSource {
    fetcher: Arc<dyn WebFetcher>,
}

impl WebSource {
    pub fn new(fetcher: Arc<dyn WebFetcher>) -> Self {
        Self { fetcher }
    }
}

#[async_trait]
impl Source for WebSource {
    fn group_type(&self) -> GroupType {
        GroupType::Web
    }

    fn description(&self) -> &str {
        "Web pages listed on the group"
    }

    async fn update_group(
        &self,
        group: &KnowledgeGroup,
        _cursor: Option<&str>,
    ) -> SyncResult<Discovery> {
        let skip = SkipFilter::for_group(group)?;
        let mut seen = HashSet::new();
        let mut items = Vec::new();

        let urls = group.url.iter().chain(group.urls.iter());
        for url in urls {
            let url = url.trim();
            if url.is_empty() || !seen.insert(url.to_string()) {
                continue;
            }
            if !url.starts_with("http://") && !url.starts_with("https://") {
                return Err(SyncError::config(format!("not a web URL: '{}'", url)));
            }
            if skip.skips(&[url]) {
                continue;
            }
            items.push(ItemRef::new(url));
        }

        Ok(Discovery {
            items,
            ..Default::default()
        })
    }

    async fn update_item(&self, _group: &KnowledgeGroup, job: &ItemJob) -> SyncResult<Option<Page>> {
        let html = self.fetcher.fetch_html(&job.url).await?;
        let title = extract_title(&html)
            .or_else(|| job.title.clone())
            .unwrap_or_else(|| job.url.clone());
        let text = html_to_markdown(&html)?;
        Ok(Some(Page { title, text }))
    }
}

static RE_TITLE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<title[^>]*>(.*?)</title>").expect("valid regex"));

fn extract_title(html: &str) -> Option<String> {
    RE_TITLE
        .captures(html)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|t| !t.is_empty())
}
