//! Linear issues and projects over the GraphQL API.
//!
//! Issue discovery excludes the group's `linear_skip_issue_statuses`
//! server-side. Fetching an issue appends a `Status:` line and a
//! `### Comments` section, paging through every comment first. Projects
//! carry their whole content in the listing, so discovery returns them as
//! inline pages and no item jobs are needed; a single-item refresh refetches
//! the project by id.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use crate::config::LinearSourceConfig;
use crate::error::{SyncError, SyncResult};
use crate::models::{Discovery, GroupType, InlinePage, ItemJob, ItemRef, KnowledgeGroup, Page};
use crate::sources::{csv_list, status_error, SkipFilter, Source};

/// One page of a GraphQL connection. `end_cursor` is set only when more
/// pages follow.
#[derive(Debug, Clone)]
pub struct Connection<T> {
    pub nodes: Vec<T>,
    pub end_cursor: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinearState {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinearIssue {
    pub id: String,
    pub identifier: String,
    pub title: String,
    pub url: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub state: Option<LinearState>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinearUser {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinearComment {
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub user: Option<LinearUser>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LinearProject {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

#[async_trait]
pub trait LinearApi: Send + Sync {
    async fn list_issues(
        &self,
        api_key: &str,
        skip_statuses: &[String],
        cursor: Option<&str>,
    ) -> SyncResult<Connection<LinearIssue>>;

    async fn get_issue(&self, api_key: &str, id: &str) -> SyncResult<LinearIssue>;

    async fn list_comments(
        &self,
        api_key: &str,
        issue_id: &str,
        cursor: Option<&str>,
    ) -> SyncResult<Connection<LinearComment>>;

    async fn list_projects(
        &self,
        api_key: &str,
        cursor: Option<&str>,
    ) -> SyncResult<Connection<LinearProject>>;

    async fn get_project(&self, api_key: &str, id: &str) -> SyncResult<LinearProject>;

    fn default_key(&self) -> Option<&str>;
}

fn api_key<'a>(api: &'a dyn LinearApi, group: &'a KnowledgeGroup) -> SyncResult<&'a str> {
    group
        .credential
        .as_deref()
        .or_else(|| api.default_key())
        .ok_or_else(|| SyncError::config("Linear group has no API key"))
}

// ============ Issues ============

pub struct LinearSource {
    api: Arc<dyn LinearApi>,
}

impl LinearSource {
    pub fn new(api: Arc<dyn LinearApi>) -> Self {
        Self { api }
    }

    async fn all_comments(&self, key: &str, issue_id: &str) -> SyncResult<Vec<LinearComment>> {
        let mut comments = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .api
                .list_comments(key, issue_id, cursor.as_deref())
                .await?;
            comments.extend(page.nodes);
            match page.end_cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(comments),
            }
        }
    }
}

#[async_trait]
impl Source for LinearSource {
    fn group_type(&self) -> GroupType {
        GroupType::Linear
    }

    fn description(&self) -> &str {
        "Linear issues with status and comments"
    }

    async fn update_group(
        &self,
        group: &KnowledgeGroup,
        cursor: Option<&str>,
    ) -> SyncResult<Discovery> {
        let key = api_key(self.api.as_ref(), group)?;
        let skip = SkipFilter::for_group(group)?;
        let skip_statuses = csv_list(group.linear_skip_issue_statuses.as_deref());

        let page = self.api.list_issues(key, &skip_statuses, cursor).await?;
        let items = page
            .nodes
            .into_iter()
            .filter(|i| !skip.skips(&[i.url.as_str(), i.identifier.as_str(), i.title.as_str()]))
            .map(|i| {
                ItemRef::new(i.url)
                    .with_page_id(i.id)
                    .with_title(format!("{} {}", i.identifier, i.title))
            })
            .collect();

        Ok(Discovery {
            items,
            pages: Vec::new(),
            next_cursor: page.end_cursor,
        })
    }

    async fn update_item(&self, group: &KnowledgeGroup, job: &ItemJob) -> SyncResult<Option<Page>> {
        let key = api_key(self.api.as_ref(), group)?;
        let id = job
            .source_page_id
            .as_deref()
            .ok_or_else(|| SyncError::config(format!("Linear item {} has no issue id", job.url)))?;

        let issue = self.api.get_issue(key, id).await?;
        let comments = self.all_comments(key, id).await?;

        let title = format!("{} {}", issue.identifier, issue.title);
        let mut text = format!("# {}", title);
        if let Some(desc) = issue.description.as_deref().map(str::trim).filter(|d| !d.is_empty()) {
            text.push_str("\n\n");
            text.push_str(desc);
        }
        if let Some(state) = &issue.state {
            text.push_str(&format!("\n\nStatus: {}", state.name));
        }

        let rendered: Vec<String> = comments
            .iter()
            .filter_map(|c| {
                let body = c.body.as_deref()?.trim();
                if body.is_empty() {
                    return None;
                }
                let who = c.user.as_ref().map(|u| u.name.as_str()).unwrap_or("unknown");
                Some(format!("**{}**: {}", who, body))
            })
            .collect();
        if !rendered.is_empty() {
            text.push_str("\n\n### Comments\n\n");
            text.push_str(&rendered.join("\n\n"));
        }

        Ok(Some(Page { title, text }))
    }
}

// ============ Projects ============

pub struct LinearProjectsSource {
    api: Arc<dyn LinearApi>,
}

impl LinearProjectsSource {
    pub fn new(api: Arc<dyn LinearApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Source for LinearProjectsSource {
    fn group_type(&self) -> GroupType {
        GroupType::LinearProjects
    }

    fn description(&self) -> &str {
        "Linear project descriptions and content"
    }

    async fn update_group(
        &self,
        group: &KnowledgeGroup,
        cursor: Option<&str>,
    ) -> SyncResult<Discovery> {
        let key = api_key(self.api.as_ref(), group)?;
        let skip = SkipFilter::for_group(group)?;
        let page = self.api.list_projects(key, cursor).await?;

        let pages = page
            .nodes
            .into_iter()
            .filter(|p| !skip.skips(&[p.url.as_str(), p.name.as_str()]))
            .map(|p| InlinePage {
                page: render_project(&p),
                url: p.url,
                source_page_id: Some(p.id),
            })
            .collect();

        Ok(Discovery {
            items: Vec::new(),
            pages,
            next_cursor: page.end_cursor,
        })
    }

    async fn update_item(&self, group: &KnowledgeGroup, job: &ItemJob) -> SyncResult<Option<Page>> {
        let key = api_key(self.api.as_ref(), group)?;
        let id = job.source_page_id.as_deref().ok_or_else(|| {
            SyncError::config(format!("Linear project {} has no project id", job.url))
        })?;
        let project = self.api.get_project(key, id).await?;
        Ok(Some(render_project(&project)))
    }
}

fn render_project(p: &LinearProject) -> Page {
    let mut text = format!("# {}", p.name);
    if let Some(state) = &p.state {
        text.push_str(&format!("\n\nStatus: {}", state));
    }
    for part in [&p.description, &p.content].into_iter().flatten() {
        if !part.trim().is_empty() {
            text.push_str("\n\n");
            text.push_str(part.trim());
        }
    }
    Page {
        title: p.name.clone(),
        text,
    }
}

// ============ HTTP client ============

pub struct HttpLinearApi {
    client: reqwest::Client,
    config: LinearSourceConfig,
}

impl HttpLinearApi {
    pub fn new(client: reqwest::Client, config: LinearSourceConfig) -> Self {
        Self { client, config }
    }

    async fn query(&self, api_key: &str, query: &str, variables: Value) -> SyncResult<Value> {
        let resp = self
            .client
            .post(&self.config.api_url)
            .header("Authorization", api_key)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error("Linear GraphQL", resp.status()));
        }
        let body: Value = resp.json().await?;
        if let Some(errors) = body.get("errors") {
            return Err(SyncError::fetch(format!("Linear GraphQL: {}", errors)));
        }
        Ok(body["data"].clone())
    }
}

fn connection<T: serde::de::DeserializeOwned>(conn: &Value) -> SyncResult<Connection<T>> {
    let nodes: Vec<T> = serde_json::from_value(conn["nodes"].clone())
        .map_err(|e| SyncError::fetch(format!("unexpected Linear response: {}", e)))?;
    let end_cursor = if conn["pageInfo"]["hasNextPage"].as_bool() == Some(true) {
        conn["pageInfo"]["endCursor"].as_str().map(String::from)
    } else {
        None
    };
    Ok(Connection { nodes, end_cursor })
}

#[async_trait]
impl LinearApi for HttpLinearApi {
    async fn list_issues(
        &self,
        api_key: &str,
        skip_statuses: &[String],
        cursor: Option<&str>,
    ) -> SyncResult<Connection<LinearIssue>> {
        let data = self
            .query(
                api_key,
                r#"query($after: String, $skip: [String!]) {
                    issues(first: 50, after: $after, filter: { state: { name: { nin: $skip } } }) {
                        nodes { id identifier title url }
                        pageInfo { hasNextPage endCursor }
                    }
                }"#,
                json!({ "after": cursor, "skip": skip_statuses }),
            )
            .await?;
        connection(&data["issues"])
    }

    async fn get_issue(&self, api_key: &str, id: &str) -> SyncResult<LinearIssue> {
        let data = self
            .query(
                api_key,
                r#"query($id: String!) {
                    issue(id: $id) { id identifier title url description state { name } }
                }"#,
                json!({ "id": id }),
            )
            .await?;
        if data["issue"].is_null() {
            return Err(SyncError::content(format!("Linear issue {} not found", id)));
        }
        serde_json::from_value(data["issue"].clone())
            .map_err(|e| SyncError::fetch(format!("unexpected Linear response: {}", e)))
    }

    async fn list_comments(
        &self,
        api_key: &str,
        issue_id: &str,
        cursor: Option<&str>,
    ) -> SyncResult<Connection<LinearComment>> {
        let data = self
            .query(
                api_key,
                r#"query($id: String!, $after: String) {
                    issue(id: $id) {
                        comments(first: 50, after: $after) {
                            nodes { body user { name } }
                            pageInfo { hasNextPage endCursor }
                        }
                    }
                }"#,
                json!({ "id": issue_id, "after": cursor }),
            )
            .await?;
        connection(&data["issue"]["comments"])
    }

    async fn list_projects(
        &self,
        api_key: &str,
        cursor: Option<&str>,
    ) -> SyncResult<Connection<LinearProject>> {
        let data = self
            .query(
                api_key,
                r#"query($after: String) {
                    projects(first: 50, after: $after) {
                        nodes { id name url description content state }
                        pageInfo { hasNextPage endCursor }
                    }
                }"#,
                json!({ "after": cursor }),
            )
            .await?;
        connection(&data["projects"])
    }

    async fn get_project(&self, api_key: &str, id: &str) -> SyncResult<LinearProject> {
        let data = self
            .query(
                api_key,
                r#"query($id: String!) {
                    project(id: $id) { id name url description content state }
                }"#,
                json!({ "id": id }),
            )
            .await?;
        if data["project"].is_null() {
            return Err(SyncError::content(format!("Linear project {} not found", id)));
        }
        serde_json::from_value(data["project"].clone())
            .map_err(|e| SyncError::fetch(format!("unexpected Linear response: {}", e)))
    }

    fn default_key(&self) -> Option<&str> {
        self.config.api_key.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeLinear {
        skip_seen: Mutex<Vec<Vec<String>>>,
        comment_pages: Mutex<usize>,
    }

    #[async_trait]
    impl LinearApi for FakeLinear {
        async fn list_issues(
            &self,
            _api_key: &str,
            skip_statuses: &[String],
            cursor: Option<&str>,
        ) -> SyncResult<Connection<LinearIssue>> {
            self.skip_seen.lock().unwrap().push(skip_statuses.to_vec());
            let start = if cursor.is_some() { 10 } else { 0 };
            Ok(Connection {
                nodes: (start..start + 10)
                    .map(|n| LinearIssue {
                        id: format!("id-{}", n),
                        identifier: format!("ENG-{}", n),
                        title: format!("Issue {}", n),
                        url: format!("https://linear.app/acme/issue/ENG-{}", n),
                        description: None,
                        state: None,
                    })
                    .collect(),
                end_cursor: cursor.is_none().then(|| "cursor-1".to_string()),
            })
        }

        async fn get_issue(&self, _api_key: &str, id: &str) -> SyncResult<LinearIssue> {
            Ok(LinearIssue {
                id: id.to_string(),
                identifier: "ENG-1".into(),
                title: "Crash on save".into(),
                url: "https://linear.app/acme/issue/ENG-1".into(),
                description: Some("Steps to reproduce".into()),
                state: Some(LinearState {
                    name: "In Progress".into(),
                }),
            })
        }

        async fn list_comments(
            &self,
            _api_key: &str,
            _issue_id: &str,
            cursor: Option<&str>,
        ) -> SyncResult<Connection<LinearComment>> {
            *self.comment_pages.lock().unwrap() += 1;
            let (body, next) = match cursor {
                None => ("first", Some("c2".to_string())),
                Some(_) => ("second", None),
            };
            Ok(Connection {
                nodes: vec![LinearComment {
                    body: Some(body.into()),
                    user: Some(LinearUser { name: "ana".into() }),
                }],
                end_cursor: next,
            })
        }

        async fn list_projects(
            &self,
            _api_key: &str,
            _cursor: Option<&str>,
        ) -> SyncResult<Connection<LinearProject>> {
            Ok(Connection {
                nodes: vec![LinearProject {
                    id: "proj-1".into(),
                    name: "Roadmap".into(),
                    url: "https://linear.app/acme/project/roadmap".into(),
                    description: Some("Q3 plan".into()),
                    content: Some("## Milestones".into()),
                    state: Some("started".into()),
                }],
                end_cursor: None,
            })
        }

        async fn get_project(&self, _api_key: &str, id: &str) -> SyncResult<LinearProject> {
            Ok(LinearProject {
                id: id.to_string(),
                name: "Roadmap".into(),
                url: "https://linear.app/acme/project/roadmap".into(),
                description: Some("Q4 plan".into()),
                content: None,
                state: Some("completed".into()),
            })
        }

        fn default_key(&self) -> Option<&str> {
            Some("lin_key")
        }
    }

    fn job(id: &str) -> ItemJob {
        ItemJob {
            process_id: "p1".into(),
            knowledge_group_id: "g1".into(),
            scrape_item_id: "s1".into(),
            url: "https://linear.app/acme/issue/ENG-1".into(),
            source_page_id: Some(id.into()),
            title: None,
            next_cursor: None,
            just_this: false,
        }
    }

    #[tokio::test]
    async fn test_discovery_passes_skip_statuses_and_cursor() {
        let api = Arc::new(FakeLinear::default());
        let source = LinearSource::new(api.clone());
        let mut group = KnowledgeGroup::for_test(GroupType::Linear);
        group.linear_skip_issue_statuses = Some("Canceled, Duplicate".into());

        let first = source.update_group(&group, None).await.unwrap();
        assert_eq!(first.items.len(), 10);
        assert_eq!(first.next_cursor.as_deref(), Some("cursor-1"));
        assert_eq!(
            api.skip_seen.lock().unwrap()[0],
            vec!["Canceled".to_string(), "Duplicate".to_string()]
        );

        let second = source.update_group(&group, Some("cursor-1")).await.unwrap();
        assert!(second.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_issue_pages_all_comments() {
        let api = Arc::new(FakeLinear::default());
        let source = LinearSource::new(api.clone());
        let group = KnowledgeGroup::for_test(GroupType::Linear);

        let page = source.update_item(&group, &job("id-1")).await.unwrap().unwrap();
        assert_eq!(*api.comment_pages.lock().unwrap(), 2);
        assert!(page.text.contains("Status: In Progress"));
        let comments_at = page.text.find("### Comments").unwrap();
        assert!(page.text[comments_at..].contains("**ana**: first"));
        assert!(page.text[comments_at..].contains("**ana**: second"));
    }

    #[tokio::test]
    async fn test_projects_are_inline_pages() {
        let source = LinearProjectsSource::new(Arc::new(FakeLinear::default()));
        let group = KnowledgeGroup::for_test(GroupType::LinearProjects);
        let found = source.update_group(&group, None).await.unwrap();
        assert!(found.items.is_empty());
        assert_eq!(found.pages.len(), 1);
        assert!(found.pages[0].page.text.contains("## Milestones"));
    }

    #[tokio::test]
    async fn test_project_refresh_refetches_by_id() {
        let source = LinearProjectsSource::new(Arc::new(FakeLinear::default()));
        let group = KnowledgeGroup::for_test(GroupType::LinearProjects);

        let page = source.update_item(&group, &job("proj-1")).await.unwrap().unwrap();
        assert_eq!(page.title, "Roadmap");
        assert!(page.text.starts_with("# Roadmap"));
        assert!(page.text.contains("Status: completed"));
        assert!(page.text.contains("Q4 plan"));

        let mut no_id = job("proj-1");
        no_id.source_page_id = None;
        let err = source.update_item(&group, &no_id).await.unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[tokio::test]
    async fn test_missing_api_key_is_config_error() {
        struct NoKey;
        #[async_trait]
        impl LinearApi for NoKey {
            async fn list_issues(
                &self,
                _: &str,
                _: &[String],
                _: Option<&str>,
            ) -> SyncResult<Connection<LinearIssue>> {
                unreachable!()
            }
            async fn get_issue(&self, _: &str, _: &str) -> SyncResult<LinearIssue> {
                unreachable!()
            }
            async fn list_comments(
                &self,
                _: &str,
                _: &str,
                _: Option<&str>,
            ) -> SyncResult<Connection<LinearComment>> {
                unreachable!()
            }
            async fn list_projects(
                &self,
                _: &str,
                _: Option<&str>,
            ) -> SyncResult<Connection<LinearProject>> {
                unreachable!()
            }
            async fn get_project(&self, _: &str, _: &str) -> SyncResult<LinearProject> {
                unreachable!()
            }
            fn default_key(&self) -> Option<&str> {
                None
            }
        }
        let source = LinearSource::new(Arc::new(NoKey));
        let err = source
            .update_group(&KnowledgeGroup::for_test(GroupType::Linear), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }
}
