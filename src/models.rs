//! Core data models used throughout the sync pipeline.
//!
//! These types represent the configured sources (knowledge groups), the
//! content units discovered from them (scrape items), the job payloads that
//! flow through the two queues, and the pages and chunks handed to the
//! content reconciler.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::SyncError;

/// The kind of external source a knowledge group pulls from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupType {
    Web,
    GithubIssues,
    GithubDiscussions,
    Linear,
    LinearProjects,
    Confluence,
    Notion,
    YoutubeChannel,
    YoutubeVideos,
    Upload,
}

impl GroupType {
    pub const ALL: [GroupType; 10] = [
        GroupType::Web,
        GroupType::GithubIssues,
        GroupType::GithubDiscussions,
        GroupType::Linear,
        GroupType::LinearProjects,
        GroupType::Confluence,
        GroupType::Notion,
        GroupType::YoutubeChannel,
        GroupType::YoutubeVideos,
        GroupType::Upload,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GroupType::Web => "web",
            GroupType::GithubIssues => "github_issues",
            GroupType::GithubDiscussions => "github_discussions",
            GroupType::Linear => "linear",
            GroupType::LinearProjects => "linear_projects",
            GroupType::Confluence => "confluence",
            GroupType::Notion => "notion",
            GroupType::YoutubeChannel => "youtube_channel",
            GroupType::YoutubeVideos => "youtube_videos",
            GroupType::Upload => "upload",
        }
    }
}

impl fmt::Display for GroupType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupType {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        GroupType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| SyncError::config(format!("unknown knowledge group type: '{}'", s)))
    }
}

/// Lifecycle of a knowledge group sync: `pending → processing → {done | error}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Pending,
    Processing,
    Done,
    Error,
}

impl GroupStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GroupStatus::Pending => "pending",
            GroupStatus::Processing => "processing",
            GroupStatus::Done => "done",
            GroupStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "processing" => GroupStatus::Processing,
            "done" => GroupStatus::Done,
            "error" => GroupStatus::Error,
            _ => GroupStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Pending,
    Done,
    Failed,
}

impl ItemStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Done => "done",
            ItemStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "done" => ItemStatus::Done,
            "failed" => ItemStatus::Failed,
            _ => ItemStatus::Pending,
        }
    }
}

/// How often the cron scan re-syncs a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateFrequency {
    Never,
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl UpdateFrequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateFrequency::Never => "never",
            UpdateFrequency::Hourly => "hourly",
            UpdateFrequency::Daily => "daily",
            UpdateFrequency::Weekly => "weekly",
            UpdateFrequency::Monthly => "monthly",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "hourly" => UpdateFrequency::Hourly,
            "daily" => UpdateFrequency::Daily,
            "weekly" => UpdateFrequency::Weekly,
            "monthly" => UpdateFrequency::Monthly,
            _ => UpdateFrequency::Never,
        }
    }

    /// The next scheduled run after `from`, or `None` when the group is
    /// only ever synced on demand.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            UpdateFrequency::Never => None,
            UpdateFrequency::Hourly => Some(from + Duration::hours(1)),
            UpdateFrequency::Daily => Some(from + Duration::days(1)),
            UpdateFrequency::Weekly => Some(from + Duration::weeks(1)),
            UpdateFrequency::Monthly => Some(from + Duration::days(30)),
        }
    }
}

/// A configured content source plus its sync settings.
#[derive(Debug, Clone, Serialize)]
pub struct KnowledgeGroup {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub group_type: GroupType,
    pub status: GroupStatus,
    pub update_process_id: Option<String>,
    pub next_update_at: Option<DateTime<Utc>>,
    pub update_frequency: UpdateFrequency,
    /// Primary source URL (repository, channel, Confluence space, site root).
    pub url: Option<String>,
    /// Explicit URL list (web pages, YouTube videos).
    pub urls: Vec<String>,
    /// Comma-separated regex list; matching items are never scheduled.
    pub skip_page_regex: Option<String>,
    /// Comma-separated GitHub issue states (`open`, `closed`).
    pub allowed_github_issue_states: Option<String>,
    /// Comma-separated Linear workflow state names to exclude.
    pub linear_skip_issue_statuses: Option<String>,
    /// Source credential overriding the configured default token.
    pub credential: Option<String>,
    pub remove_stale_pages: bool,
}

#[cfg(test)]
impl KnowledgeGroup {
    /// A processing-free group with only the type set.
    pub(crate) fn for_test(group_type: GroupType) -> Self {
        Self {
            id: "g1".into(),
            user_id: "u1".into(),
            title: "Test".into(),
            group_type,
            status: GroupStatus::Pending,
            update_process_id: None,
            next_update_at: None,
            update_frequency: UpdateFrequency::Never,
            url: None,
            urls: Vec::new(),
            skip_page_regex: None,
            allowed_github_issue_states: None,
            linear_skip_issue_statuses: None,
            credential: None,
            remove_stale_pages: false,
        }
    }
}

/// Fields supplied when registering a new group.
#[derive(Debug, Clone, Deserialize)]
pub struct NewKnowledgeGroup {
    pub user_id: String,
    pub title: String,
    pub group_type: GroupType,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub skip_page_regex: Option<String>,
    #[serde(default)]
    pub allowed_github_issue_states: Option<String>,
    #[serde(default)]
    pub linear_skip_issue_statuses: Option<String>,
    #[serde(default)]
    pub credential: Option<String>,
    #[serde(default = "default_frequency")]
    pub update_frequency: UpdateFrequency,
    #[serde(default)]
    pub remove_stale_pages: bool,
}

fn default_frequency() -> UpdateFrequency {
    UpdateFrequency::Never
}

impl NewKnowledgeGroup {
    pub fn new(user_id: &str, title: &str, group_type: GroupType) -> Self {
        Self {
            user_id: user_id.to_string(),
            title: title.to_string(),
            group_type,
            url: None,
            urls: Vec::new(),
            skip_page_regex: None,
            allowed_github_issue_states: None,
            linear_skip_issue_statuses: None,
            credential: None,
            update_frequency: UpdateFrequency::Never,
            remove_stale_pages: false,
        }
    }
}

/// One discovered content unit (URL, issue, page, or video) of a group.
#[derive(Debug, Clone, Serialize)]
pub struct ScrapeItem {
    pub id: String,
    pub knowledge_group_id: String,
    pub url: String,
    pub source_page_id: Option<String>,
    pub title: Option<String>,
    pub status: ItemStatus,
    /// An item job for this item is outstanding in the current process.
    pub will_update: bool,
    pub error: Option<String>,
    /// The sync run that last discovered this item.
    pub last_process_id: Option<String>,
    pub updated_at: i64,
}

/// Payload of a job on the `group` queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupJob {
    pub process_id: String,
    pub knowledge_group_id: String,
    #[serde(default)]
    pub cursor: Option<String>,
}

/// Payload of a job on the `item` queue.
///
/// Unknown fields are ignored on deserialization so older workers keep
/// accepting payloads written by newer producers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemJob {
    pub process_id: String,
    pub knowledge_group_id: String,
    pub scrape_item_id: String,
    pub url: String,
    #[serde(default)]
    pub source_page_id: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    /// Set only on the last item of a discovery page; finishing this item
    /// schedules discovery of the next page.
    #[serde(default)]
    pub next_cursor: Option<String>,
    /// Refresh only this item; never chains further discovery.
    #[serde(default)]
    pub just_this: bool,
}

/// A reference to an item found during discovery, before its content is fetched.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemRef {
    pub url: String,
    pub source_page_id: Option<String>,
    pub title: Option<String>,
}

impl ItemRef {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            source_page_id: None,
            title: None,
        }
    }

    pub fn with_page_id(mut self, id: impl Into<String>) -> Self {
        self.source_page_id = Some(id.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

/// A page whose content was already available at discovery time.
#[derive(Debug, Clone, PartialEq)]
pub struct InlinePage {
    pub url: String,
    pub source_page_id: Option<String>,
    pub page: Page,
}

/// One page of discovery results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Discovery {
    pub items: Vec<ItemRef>,
    pub pages: Vec<InlinePage>,
    pub next_cursor: Option<String>,
}

/// Fetched page content handed to the content reconciler.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub title: String,
    pub text: String,
}

/// A chunk of a stored document's markdown.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub hash: String,
}
