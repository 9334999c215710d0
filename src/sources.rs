//! Source adapters: the [`Source`] trait, the type → adapter registry, and
//! helpers shared by every adapter.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    SourceRegistry                       │
//! │  web │ github_issues │ github_discussions │ linear │ …  │
//! └──────────────┬──────────────────────────────────────────┘
//!                ▼
//!   update_group(cursor) → Discovery { items, pages, next_cursor }
//!   update_item(job)     → Option<Page>
//! ```
//!
//! Adapters never enqueue jobs and never chain pagination themselves: they
//! return one page of discovery and the pipeline decides what to schedule.

use anyhow::Context;
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::{Config, WebSourceConfig};
use crate::error::{SyncError, SyncResult};
use crate::models::{Discovery, GroupType, ItemJob, KnowledgeGroup, Page};

/// Discovery and fetch for one source type.
#[async_trait]
pub trait Source: Send + Sync {
    /// The group type this adapter serves.
    fn group_type(&self) -> GroupType;

    /// One-line description for `ksync group types`.
    fn description(&self) -> &str;

    /// Discover one page of items, starting at `cursor` (`None` for the
    /// first page). Items matching the group's skip patterns are left out.
    async fn update_group(
        &self,
        group: &KnowledgeGroup,
        cursor: Option<&str>,
    ) -> SyncResult<Discovery>;

    /// Fetch one item's content. `Ok(None)` settles the item without
    /// storing anything.
    async fn update_item(&self, group: &KnowledgeGroup, job: &ItemJob) -> SyncResult<Option<Page>>;
}

/// Adapter for types without an implementation. Always fails.
pub struct PlaceholderSource {
    group_type: GroupType,
}

impl PlaceholderSource {
    pub fn new(group_type: GroupType) -> Self {
        Self { group_type }
    }

    fn unsupported(&self) -> SyncError {
        SyncError::config(format!(
            "source type '{}' has no adapter",
            self.group_type
        ))
    }
}

#[async_trait]
impl Source for PlaceholderSource {
    fn group_type(&self) -> GroupType {
        self.group_type
    }

    fn description(&self) -> &str {
        "not implemented"
    }

    async fn update_group(
        &self,
        _group: &KnowledgeGroup,
        _cursor: Option<&str>,
    ) -> SyncResult<Discovery> {
        Err(self.unsupported())
    }

    async fn update_item(
        &self,
        _group: &KnowledgeGroup,
        _job: &ItemJob,
    ) -> SyncResult<Option<Page>> {
        Err(self.unsupported())
    }
}

// ============ Registry ============

/// Maps each [`GroupType`] to its adapter.
///
/// Built once at startup; [`SourceRegistry::from_config`] registers every
/// built-in adapter so a group of any known type always resolves.
#[derive(Clone, Default)]
pub struct SourceRegistry {
    sources: HashMap<GroupType, Arc<dyn Source>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in adapter wired to the configured APIs.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        use crate::source_confluence::{ConfluenceSource, HttpConfluenceApi};
        use crate::source_github::{GithubDiscussionsSource, GithubIssuesSource, HttpGithubApi};
        use crate::source_linear::{HttpLinearApi, LinearProjectsSource, LinearSource};
        use crate::source_web::{HttpWebFetcher, WebSource};
        use crate::source_youtube::{HttpYoutubeApi, YoutubeChannelSource, YoutubeVideosSource};

        let client = http_client(&config.sources.web)?;
        let mut registry = Self::new();

        registry.register(Arc::new(WebSource::new(Arc::new(HttpWebFetcher::new(
            client.clone(),
        )))));

        let github = Arc::new(HttpGithubApi::new(
            client.clone(),
            config.sources.github.clone(),
        ));
        registry.register(Arc::new(GithubIssuesSource::new(github.clone())));
        registry.register(Arc::new(GithubDiscussionsSource::new(github)));

        let linear = Arc::new(HttpLinearApi::new(
            client.clone(),
            config.sources.linear.clone(),
        ));
        registry.register(Arc::new(LinearSource::new(linear.clone())));
        registry.register(Arc::new(LinearProjectsSource::new(linear)));

        registry.register(Arc::new(ConfluenceSource::new(Arc::new(
            HttpConfluenceApi::new(client.clone(), config.sources.confluence.clone()),
        ))));

        let youtube = Arc::new(HttpYoutubeApi::new(client, config.sources.youtube.clone()));
        registry.register(Arc::new(YoutubeChannelSource::new(youtube.clone())));
        registry.register(Arc::new(YoutubeVideosSource::new(youtube)));

        registry.register(Arc::new(PlaceholderSource::new(GroupType::Notion)));
        registry.register(Arc::new(PlaceholderSource::new(GroupType::Upload)));

        registry.validate_complete()?;
        Ok(registry)
    }

    /// Register an adapter, replacing any previous one for its type.
    pub fn register(&mut self, source: Arc<dyn Source>) {
        self.sources.insert(source.group_type(), source);
    }

    pub fn get(&self, group_type: GroupType) -> SyncResult<Arc<dyn Source>> {
        self.sources
            .get(&group_type)
            .cloned()
            .ok_or_else(|| SyncError::config(format!("no adapter registered for '{}'", group_type)))
    }

    /// Fail unless every known group type has an adapter.
    pub fn validate_complete(&self) -> SyncResult<()> {
        let missing: Vec<&str> = GroupType::ALL
            .iter()
            .filter(|t| !self.sources.contains_key(t))
            .map(|t| t.as_str())
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(SyncError::config(format!(
                "no adapter registered for: {}",
                missing.join(", ")
            )))
        }
    }

    /// Registered adapters in [`GroupType::ALL`] order.
    pub fn sources(&self) -> Vec<Arc<dyn Source>> {
        GroupType::ALL
            .iter()
            .filter_map(|t| self.sources.get(t).cloned())
            .collect()
    }
}

// ============ Shared helpers ============

/// Compiled `skip_page_regex`: a comma-separated list of patterns.
#[derive(Debug, Default)]
pub struct SkipFilter {
    patterns: Vec<Regex>,
}

impl SkipFilter {
    pub fn parse(spec: Option<&str>) -> SyncResult<Self> {
        let mut patterns = Vec::new();
        for raw in csv_list(spec) {
            let re = Regex::new(&raw)
                .map_err(|e| SyncError::config(format!("invalid skip pattern '{}': {}", raw, e)))?;
            patterns.push(re);
        }
        Ok(Self { patterns })
    }

    pub fn for_group(group: &KnowledgeGroup) -> SyncResult<Self> {
        Self::parse(group.skip_page_regex.as_deref())
    }

    /// True when any pattern matches any of the candidates.
    pub fn skips(&self, candidates: &[&str]) -> bool {
        self.patterns
            .iter()
            .any(|re| candidates.iter().any(|c| re.is_match(c)))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Split a comma-separated setting into trimmed, non-empty entries.
pub fn csv_list(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// HTML → markdown with the non-content tags dropped.
pub fn html_to_markdown(html: &str) -> SyncResult<String> {
    let converter = htmd::HtmlToMarkdown::builder()
        .skip_tags(vec!["script", "style", "nav", "iframe", "noscript", "svg"])
        .build();
    converter
        .convert(html)
        .map(|md| md.trim().to_string())
        .map_err(|e| SyncError::content(format!("html conversion failed: {}", e)))
}

/// Map a non-success HTTP status to the matching failure class.
///
/// Missing resources and auth failures will not fix themselves on retry.
pub fn status_error(what: &str, status: reqwest::StatusCode) -> SyncError {
    match status.as_u16() {
        401 | 403 => SyncError::config(format!("{}: unauthorized ({})", what, status)),
        404 | 410 => SyncError::content(format!("{}: not found ({})", what, status)),
        _ => SyncError::fetch(format!("{}: {}", what, status)),
    }
}

/// The shared HTTP client used by every built-in adapter.
pub fn http_client(cfg: &WebSourceConfig) -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(cfg.user_agent.clone())
        .timeout(Duration::from_secs(cfg.timeout_secs))
        .build()
        .context("Failed to build HTTP client")
}
