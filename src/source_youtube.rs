//! YouTube channels and explicit video lists, indexed by transcript.
//!
//! A channel is listed through its uploads playlist, one `pageToken` page
//! per discovery. A video list has no pagination: every valid video URL is
//! scheduled in one pass. A video without a transcript fails its own item
//! with a content error; the rest of the group carries on.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;
use url::Url;

use crate::config::YoutubeSourceConfig;
use crate::error::{SyncError, SyncResult};
use crate::models::{Discovery, GroupType, ItemJob, ItemRef, KnowledgeGroup, Page};
use crate::sources::{status_error, SkipFilter, Source};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelRef {
    Id(String),
    Handle(String),
}

impl ChannelRef {
    /// Parse `youtube.com/channel/<id>` or `youtube.com/@<handle>`.
    pub fn parse(raw: &str) -> SyncResult<Self> {
        let url = Url::parse(raw.trim())
            .map_err(|_| SyncError::config(format!("invalid YouTube channel URL: '{}'", raw)))?;
        if !is_youtube_host(&url) {
            return Err(SyncError::config(format!("not a YouTube URL: '{}'", raw)));
        }
        let mut segments = url.path_segments().into_iter().flatten();
        match (segments.next(), segments.next()) {
            (Some("channel"), Some(id)) if !id.is_empty() => Ok(ChannelRef::Id(id.to_string())),
            (Some(handle), _) if handle.starts_with('@') && handle.len() > 1 => {
                Ok(ChannelRef::Handle(handle.to_string()))
            }
            _ => Err(SyncError::config(format!(
                "cannot find a channel in YouTube URL: '{}'",
                raw
            ))),
        }
    }
}

fn is_youtube_host(url: &Url) -> bool {
    matches!(
        url.host_str(),
        Some("youtube.com" | "www.youtube.com" | "m.youtube.com" | "youtu.be")
    )
}

/// Video id from watch, short-link, shorts, and embed URLs.
pub fn video_id(raw: &str) -> Option<String> {
    let url = Url::parse(raw.trim()).ok()?;
    if !is_youtube_host(&url) {
        return None;
    }
    let id = if url.host_str() == Some("youtu.be") {
        url.path_segments()?.next().map(String::from)
    } else {
        let mut segments = url.path_segments()?;
        match segments.next() {
            Some("watch") => url
                .query_pairs()
                .find(|(k, _)| k == "v")
                .map(|(_, v)| v.into_owned()),
            Some("shorts" | "embed" | "live") => segments.next().map(String::from),
            _ => None,
        }
    }?;
    let valid = !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    valid.then_some(id)
}

fn watch_url(id: &str) -> String {
    format!("https://www.youtube.com/watch?v={}", id)
}

#[derive(Debug, Clone, PartialEq)]
pub struct VideoRef {
    pub id: String,
    pub title: String,
}

#[derive(Debug, Clone, Default)]
pub struct VideoListing {
    pub videos: Vec<VideoRef>,
    pub next_page_token: Option<String>,
}

#[async_trait]
pub trait YoutubeApi: Send + Sync {
    async fn list_channel_videos(
        &self,
        channel: &ChannelRef,
        page_token: Option<&str>,
    ) -> SyncResult<VideoListing>;

    /// Transcript text, or `None` when the video has none.
    async fn transcript(&self, video_id: &str) -> SyncResult<Option<String>>;
}

async fn fetch_video(api: &dyn YoutubeApi, job: &ItemJob) -> SyncResult<Option<Page>> {
    let id = job
        .source_page_id
        .clone()
        .or_else(|| video_id(&job.url))
        .ok_or_else(|| SyncError::config(format!("not a YouTube video URL: '{}'", job.url)))?;
    let transcript = api
        .transcript(&id)
        .await?
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| SyncError::content(format!("video {} has no transcript", id)))?;

    let title = job
        .title
        .clone()
        .unwrap_or_else(|| format!("YouTube video {}", id));
    Ok(Some(Page {
        text: format!("# {}\n\n{}", title, transcript.trim()),
        title,
    }))
}

// ============ Channel ============

pub struct YoutubeChannelSource {
    api: Arc<dyn YoutubeApi>,
}

impl YoutubeChannelSource {
    pub fn new(api: Arc<dyn YoutubeApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Source for YoutubeChannelSource {
    fn group_type(&self) -> GroupType {
        GroupType::YoutubeChannel
    }

    fn description(&self) -> &str {
        "Transcripts of every upload of a YouTube channel"
    }

    async fn update_group(
        &self,
        group: &KnowledgeGroup,
        cursor: Option<&str>,
    ) -> SyncResult<Discovery> {
        let url = group
            .url
            .as_deref()
            .ok_or_else(|| SyncError::config("YouTube channel group has no URL"))?;
        let channel = ChannelRef::parse(url)?;
        let skip = SkipFilter::for_group(group)?;

        let listing = self.api.list_channel_videos(&channel, cursor).await?;
        let items = listing
            .videos
            .into_iter()
            .map(|v| (watch_url(&v.id), v))
            .filter(|(url, v)| !skip.skips(&[url.as_str(), v.id.as_str(), v.title.as_str()]))
            .map(|(url, v)| ItemRef::new(url).with_page_id(v.id).with_title(v.title))
            .collect();

        Ok(Discovery {
            items,
            pages: Vec::new(),
            next_cursor: listing.next_page_token,
        })
    }

    async fn update_item(&self, _group: &KnowledgeGroup, job: &ItemJob) -> SyncResult<Option<Page>> {
        fetch_video(self.api.as_ref(), job).await
    }
}

// ============ Video list ============

pub struct YoutubeVideosSource {
    api: Arc<dyn YoutubeApi>,
}

impl YoutubeVideosSource {
    pub fn new(api: Arc<dyn YoutubeApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Source for YoutubeVideosSource {
    fn group_type(&self) -> GroupType {
        GroupType::YoutubeVideos
    }

    fn description(&self) -> &str {
        "Transcripts of listed YouTube videos"
    }

    async fn update_group(
        &self,
        group: &KnowledgeGroup,
        _cursor: Option<&str>,
    ) -> SyncResult<Discovery> {
        let skip = SkipFilter::for_group(group)?;
        let mut items: Vec<ItemRef> = Vec::new();

        for raw in &group.urls {
            let Some(id) = video_id(raw) else {
                warn!(knowledge_group_id = %group.id, url = %raw, "skipping invalid YouTube video URL");
                continue;
            };
            let url = watch_url(&id);
            if skip.skips(&[raw.as_str(), url.as_str(), id.as_str()])
                || items.iter().any(|i| i.url == url)
            {
                continue;
            }
            items.push(ItemRef::new(url).with_page_id(id));
        }

        Ok(Discovery {
            items,
            ..Default::default()
        })
    }

    async fn update_item(&self, _group: &KnowledgeGroup, job: &ItemJob) -> SyncResult<Option<Page>> {
        fetch_video(self.api.as_ref(), job).await
    }
}

// ============ HTTP client ============

pub struct HttpYoutubeApi {
    client: reqwest::Client,
    config: YoutubeSourceConfig,
}

impl HttpYoutubeApi {
    pub fn new(client: reqwest::Client, config: YoutubeSourceConfig) -> Self {
        Self { client, config }
    }

    fn key(&self) -> SyncResult<&str> {
        self.config
            .api_key
            .as_deref()
            .ok_or_else(|| SyncError::config("sources.youtube.api_key is not set"))
    }

    async fn get_json(&self, path: &str, query: &[(&str, &str)]) -> SyncResult<Value> {
        let url = format!("{}/{}", self.config.api_url.trim_end_matches('/'), path);
        let resp = self
            .client
            .get(&url)
            .query(query)
            .query(&[("key", self.key()?)])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error(&format!("GET {}", url), resp.status()));
        }
        Ok(resp.json().await?)
    }

    async fn uploads_playlist(&self, channel: &ChannelRef) -> SyncResult<String> {
        let (param, value) = match channel {
            ChannelRef::Id(id) => ("id", id.as_str()),
            ChannelRef::Handle(handle) => ("forHandle", handle.as_str()),
        };
        let body = self
            .get_json("channels", &[("part", "contentDetails"), (param, value)])
            .await?;
        body["items"][0]["contentDetails"]["relatedPlaylists"]["uploads"]
            .as_str()
            .map(String::from)
            .ok_or_else(|| SyncError::content(format!("YouTube channel {} not found", value)))
    }
}

#[async_trait]
impl YoutubeApi for HttpYoutubeApi {
    async fn list_channel_videos(
        &self,
        channel: &ChannelRef,
        page_token: Option<&str>,
    ) -> SyncResult<VideoListing> {
        let playlist = self.uploads_playlist(channel).await?;
        let mut query = vec![
            ("part", "snippet"),
            ("maxResults", "50"),
            ("playlistId", playlist.as_str()),
        ];
        if let Some(token) = page_token {
            query.push(("pageToken", token));
        }
        let body = self.get_json("playlistItems", &query).await?;

        let videos = body["items"]
            .as_array()
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        let snippet = &item["snippet"];
                        Some(VideoRef {
                            id: snippet["resourceId"]["videoId"].as_str()?.to_string(),
                            title: snippet["title"].as_str().unwrap_or_default().to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(VideoListing {
            videos,
            next_page_token: body["nextPageToken"].as_str().map(String::from),
        })
    }

    async fn transcript(&self, video_id: &str) -> SyncResult<Option<String>> {
        let base = self
            .config
            .transcript_url
            .as_deref()
            .ok_or_else(|| SyncError::config("sources.youtube.transcript_url is not set"))?;
        let resp = self
            .client
            .get(base)
            .query(&[("video_id", video_id)])
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !resp.status().is_success() {
            return Err(status_error(&format!("transcript {}", video_id), resp.status()));
        }
        let body: Value = resp.json().await?;
        Ok(body["transcript"].as_str().map(String::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FakeYoutube;

    #[async_trait]
    impl YoutubeApi for FakeYoutube {
        async fn list_channel_videos(
            &self,
            _channel: &ChannelRef,
            page_token: Option<&str>,
        ) -> SyncResult<VideoListing> {
            Ok(VideoListing {
                videos: vec![VideoRef {
                    id: if page_token.is_some() { "vid2" } else { "vid1" }.into(),
                    title: "Launch".into(),
                }],
                next_page_token: page_token.is_none().then(|| "NEXT".to_string()),
            })
        }

        async fn transcript(&self, video_id: &str) -> SyncResult<Option<String>> {
            Ok((video_id == "vid1").then(|| "hello and welcome".to_string()))
        }
    }

    fn job(url: &str, id: Option<&str>) -> ItemJob {
        ItemJob {
            process_id: "p1".into(),
            knowledge_group_id: "g1".into(),
            scrape_item_id: "s1".into(),
            url: url.into(),
            source_page_id: id.map(String::from),
            title: Some("Launch".into()),
            next_cursor: None,
            just_this: false,
        }
    }

    #[test]
    fn test_video_id_forms() {
        assert_eq!(
            video_id("https://www.youtube.com/watch?v=dQw4w9WgXcQ&t=10").as_deref(),
            Some("dQw4w9WgXcQ")
        );
        assert_eq!(video_id("https://youtu.be/abc_-1").as_deref(), Some("abc_-1"));
        assert_eq!(
            video_id("https://youtube.com/shorts/XyZ").as_deref(),
            Some("XyZ")
        );
        assert_eq!(video_id("https://vimeo.com/123"), None);
        assert_eq!(video_id("not a url"), None);
    }

    #[test]
    fn test_channel_ref() {
        assert_eq!(
            ChannelRef::parse("https://www.youtube.com/channel/UC123").unwrap(),
            ChannelRef::Id("UC123".into())
        );
        assert_eq!(
            ChannelRef::parse("https://www.youtube.com/@acme/videos").unwrap(),
            ChannelRef::Handle("@acme".into())
        );
        assert!(ChannelRef::parse("https://www.youtube.com/").is_err());
    }

    #[tokio::test]
    async fn test_channel_pages_by_token() {
        let source = YoutubeChannelSource::new(Arc::new(FakeYoutube));
        let mut group = KnowledgeGroup::for_test(GroupType::YoutubeChannel);
        group.url = Some("https://www.youtube.com/@acme".into());

        let first = source.update_group(&group, None).await.unwrap();
        assert_eq!(first.items[0].url, "https://www.youtube.com/watch?v=vid1");
        assert_eq!(first.next_cursor.as_deref(), Some("NEXT"));
        let second = source.update_group(&group, Some("NEXT")).await.unwrap();
        assert_eq!(second.items[0].source_page_id.as_deref(), Some("vid2"));
        assert!(second.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_video_list_single_pass_skips_invalid() {
        let source = YoutubeVideosSource::new(Arc::new(FakeYoutube));
        let mut group = KnowledgeGroup::for_test(GroupType::YoutubeVideos);
        group.urls = vec![
            "https://youtu.be/vid1".into(),
            "https://www.youtube.com/watch?v=vid1".into(),
            "https://example.com/video".into(),
            "https://www.youtube.com/watch?v=vid2".into(),
        ];
        let found = source.update_group(&group, None).await.unwrap();
        let ids: Vec<_> = found
            .items
            .iter()
            .map(|i| i.source_page_id.as_deref().unwrap())
            .collect();
        assert_eq!(ids, vec!["vid1", "vid2"]);
        assert!(found.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_missing_transcript_is_content_error() {
        let source = YoutubeVideosSource::new(Arc::new(FakeYoutube));
        let group = KnowledgeGroup::for_test(GroupType::YoutubeVideos);

        let page = source
            .update_item(&group, &job("https://youtu.be/vid1", Some("vid1")))
            .await
            .unwrap()
            .unwrap();
        assert!(page.text.contains("hello and welcome"));

        let err = source
            .update_item(&group, &job("https://youtu.be/vid2", None))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Content(_)));
        assert!(!err.is_retryable());
    }
}
