//! GitHub issues (REST) and discussions (GraphQL).
//!
//! Issue discovery pages through `GET /repos/{owner}/{repo}/issues`; the
//! cursor is the `rel="next"` URL from the `Link` header. When exactly one
//! state is allowed it is sent as the `state` query parameter, otherwise
//! `state=all` is requested. Either way states are re-checked locally, and
//! pull requests (which the issues API also returns) are dropped.
//!
//! Discussion discovery uses the GraphQL `discussions` connection and its
//! `endCursor`.

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::{Arc, LazyLock};

use crate::config::GithubSourceConfig;
use crate::error::{SyncError, SyncResult};
use crate::models::{Discovery, GroupType, ItemJob, ItemRef, KnowledgeGroup, Page};
use crate::sources::{csv_list, status_error, SkipFilter, Source};

const ISSUE_STATES: [&str; 2] = ["open", "closed"];

static RE_REPO_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^https://(?:www\.)?github\.com/([A-Za-z0-9_.-]+)/([A-Za-z0-9_.-]+?)(?:\.git)?/?$")
        .expect("valid regex")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    /// Parse `https://github.com/<owner>/<repo>`.
    pub fn parse(url: &str) -> SyncResult<Self> {
        let caps = RE_REPO_URL
            .captures(url.trim())
            .ok_or_else(|| SyncError::config(format!("invalid GitHub repository URL: '{}'", url)))?;
        Ok(Self {
            owner: caps[1].to_string(),
            name: caps[2].to_string(),
        })
    }

    fn for_group(group: &KnowledgeGroup) -> SyncResult<Self> {
        let url = group
            .url
            .as_deref()
            .ok_or_else(|| SyncError::config("GitHub group has no repository URL"))?;
        Self::parse(url)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubUser {
    pub login: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubIssue {
    pub number: u64,
    pub title: String,
    pub state: String,
    pub html_url: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub user: Option<GithubUser>,
    /// Present only on pull requests.
    #[serde(default)]
    pub pull_request: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubComment {
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub user: Option<GithubUser>,
}

#[derive(Debug, Clone, Default)]
pub struct IssuePage {
    pub issues: Vec<GithubIssue>,
    pub next_page_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DiscussionSummary {
    pub number: u64,
    pub title: String,
    pub url: String,
}

#[derive(Debug, Clone, Default)]
pub struct DiscussionPage {
    pub discussions: Vec<DiscussionSummary>,
    pub end_cursor: Option<String>,
}

#[derive(Debug, Clone)]
pub struct GithubDiscussion {
    pub number: u64,
    pub title: String,
    pub url: String,
    pub body: String,
    pub comments: Vec<GithubComment>,
}

/// Raw GitHub fetches. `token` is the group credential or the configured default.
#[async_trait]
pub trait GithubApi: Send + Sync {
    /// `page_url` continues a previous listing verbatim.
    async fn list_issues(
        &self,
        token: Option<&str>,
        repo: &RepoRef,
        state: &str,
        page_url: Option<&str>,
    ) -> SyncResult<IssuePage>;

    async fn get_issue(
        &self,
        token: Option<&str>,
        repo: &RepoRef,
        number: u64,
    ) -> SyncResult<GithubIssue>;

    /// Every comment of the issue, all pages.
    async fn list_issue_comments(
        &self,
        token: Option<&str>,
        repo: &RepoRef,
        number: u64,
    ) -> SyncResult<Vec<GithubComment>>;

    async fn list_discussions(
        &self,
        token: Option<&str>,
        repo: &RepoRef,
        cursor: Option<&str>,
    ) -> SyncResult<DiscussionPage>;

    async fn get_discussion(
        &self,
        token: Option<&str>,
        repo: &RepoRef,
        number: u64,
    ) -> SyncResult<GithubDiscussion>;

    fn default_token(&self) -> Option<&str>;
}

fn token_for<'a>(api: &'a dyn GithubApi, group: &'a KnowledgeGroup) -> Option<&'a str> {
    group.credential.as_deref().or_else(|| api.default_token())
}

fn item_number(job: &ItemJob) -> SyncResult<u64> {
    let raw = job
        .source_page_id
        .as_deref()
        .or_else(|| job.url.rsplit('/').next())
        .unwrap_or("");
    raw.parse()
        .map_err(|_| SyncError::config(format!("cannot determine GitHub number for {}", job.url)))
}

fn render_comments(out: &mut String, comments: &[GithubComment]) {
    let comments: Vec<_> = comments
        .iter()
        .filter_map(|c| {
            let body = c.body.as_deref()?.trim();
            if body.is_empty() {
                return None;
            }
            let who = c.user.as_ref().map(|u| u.login.as_str()).unwrap_or("unknown");
            Some(format!("**{}**: {}", who, body))
        })
        .collect();
    if comments.is_empty() {
        return;
    }
    out.push_str("\n\n### Comments\n\n");
    out.push_str(&comments.join("\n\n"));
}

// ============ Issues ============

pub struct GithubIssuesSource {
    api: Arc<dyn GithubApi>,
}

impl GithubIssuesSource {
    pub fn new(api: Arc<dyn GithubApi>) -> Self {
        Self { api }
    }
}

/// Allowed issue states, lower-cased. Empty setting allows every state.
fn allowed_states(group: &KnowledgeGroup) -> SyncResult<Vec<String>> {
    let states: Vec<String> = csv_list(group.allowed_github_issue_states.as_deref())
        .into_iter()
        .map(|s| s.to_lowercase())
        .collect();
    if let Some(bad) = states.iter().find(|s| !ISSUE_STATES.contains(&s.as_str())) {
        return Err(SyncError::config(format!("unknown GitHub issue state '{}'", bad)));
    }
    if states.is_empty() {
        return Ok(ISSUE_STATES.iter().map(|s| s.to_string()).collect());
    }
    Ok(states)
}

#[async_trait]
impl Source for GithubIssuesSource {
    fn group_type(&self) -> GroupType {
        GroupType::GithubIssues
    }

    fn description(&self) -> &str {
        "GitHub repository issues with their comments"
    }

    async fn update_group(
        &self,
        group: &KnowledgeGroup,
        cursor: Option<&str>,
    ) -> SyncResult<Discovery> {
        let repo = RepoRef::for_group(group)?;
        let allowed = allowed_states(group)?;
        let skip = SkipFilter::for_group(group)?;
        let state = if allowed.len() == 1 {
            allowed[0].as_str()
        } else {
            "all"
        };

        let page = self
            .api
            .list_issues(token_for(self.api.as_ref(), group), &repo, state, cursor)
            .await?;

        let items = page
            .issues
            .into_iter()
            .filter(|i| i.pull_request.is_none())
            .filter(|i| allowed.contains(&i.state.to_lowercase()))
            .filter(|i| !skip.skips(&[i.html_url.as_str(), i.number.to_string().as_str(), i.title.as_str()]))
            .map(|i| {
                ItemRef::new(i.html_url)
                    .with_page_id(i.number.to_string())
                    .with_title(i.title)
            })
            .collect();

        Ok(Discovery {
            items,
            pages: Vec::new(),
            next_cursor: page.next_page_url,
        })
    }

    async fn update_item(&self, group: &KnowledgeGroup, job: &ItemJob) -> SyncResult<Option<Page>> {
        let repo = RepoRef::for_group(group)?;
        let number = item_number(job)?;
        let token = token_for(self.api.as_ref(), group);

        let issue = self.api.get_issue(token, &repo, number).await?;
        let comments = self.api.list_issue_comments(token, &repo, number).await?;

        let mut text = format!("# {}\n\nState: {}", issue.title, issue.state);
        if let Some(author) = &issue.user {
            text.push_str(&format!("\nAuthor: {}", author.login));
        }
        if let Some(body) = issue.body.as_deref().map(str::trim).filter(|b| !b.is_empty()) {
            text.push_str("\n\n");
            text.push_str(body);
        }
        render_comments(&mut text, &comments);

        Ok(Some(Page {
            title: issue.title,
            text,
        }))
    }
}

// ============ Discussions ============

pub struct GithubDiscussionsSource {
    api: Arc<dyn GithubApi>,
}

impl GithubDiscussionsSource {
    pub fn new(api: Arc<dyn GithubApi>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl Source for GithubDiscussionsSource {
    fn group_type(&self) -> GroupType {
        GroupType::GithubDiscussions
    }

    fn description(&self) -> &str {
        "GitHub repository discussions with their comments"
    }

    async fn update_group(
        &self,
        group: &KnowledgeGroup,
        cursor: Option<&str>,
    ) -> SyncResult<Discovery> {
        let repo = RepoRef::for_group(group)?;
        let skip = SkipFilter::for_group(group)?;
        let page = self
            .api
            .list_discussions(token_for(self.api.as_ref(), group), &repo, cursor)
            .await?;

        let items = page
            .discussions
            .into_iter()
            .filter(|d| !skip.skips(&[d.url.as_str(), d.number.to_string().as_str(), d.title.as_str()]))
            .map(|d| {
                ItemRef::new(d.url)
                    .with_page_id(d.number.to_string())
                    .with_title(d.title)
            })
            .collect();

        Ok(Discovery {
            items,
            pages: Vec::new(),
            next_cursor: page.end_cursor,
        })
    }

    async fn update_item(&self, group: &KnowledgeGroup, job: &ItemJob) -> SyncResult<Option<Page>> {
        let repo = RepoRef::for_group(group)?;
        let number = item_number(job)?;
        let discussion = self
            .api
            .get_discussion(token_for(self.api.as_ref(), group), &repo, number)
            .await?;

        let mut text = format!("# {}", discussion.title);
        if !discussion.body.trim().is_empty() {
            text.push_str("\n\n");
            text.push_str(discussion.body.trim());
        }
        render_comments(&mut text, &discussion.comments);

        Ok(Some(Page {
            title: discussion.title,
            text,
        }))
    }
}

// ============ HTTP client ============

pub struct HttpGithubApi {
    client: reqwest::Client,
    config: GithubSourceConfig,
}

impl HttpGithubApi {
    pub fn new(client: reqwest::Client, config: GithubSourceConfig) -> Self {
        Self { client, config }
    }

    fn get(&self, url: &str, token: Option<&str>) -> reqwest::RequestBuilder {
        let req = self
            .client
            .get(url)
            .header("Accept", "application/vnd.github+json");
        match token {
            Some(t) => req.bearer_auth(t),
            None => req,
        }
    }

    async fn graphql(&self, token: Option<&str>, query: &str, variables: Value) -> SyncResult<Value> {
        let token =
            token.ok_or_else(|| SyncError::config("GitHub discussions require an access token"))?;
        let url = format!("{}/graphql", self.config.api_url.trim_end_matches('/'));
        let resp = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&json!({ "query": query, "variables": variables }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(status_error("GitHub GraphQL", resp.status()));
        }
        let body: Value = resp.json().await?;
        if let Some(errors) = body.get("errors") {
            return Err(SyncError::fetch(format!("GitHub GraphQL: {}", errors)));
        }
        Ok(body["data"].clone())
    }
}

/// The `rel="next"` target of a `Link` header.
pub fn next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let mut pieces = part.split(';');
        let target = pieces.next()?.trim();
        let is_next = pieces.any(|p| p.trim() == r#"rel="next""#);
        if is_next && target.starts_with('<') && target.ends_with('>') {
            Some(target[1..target.len() - 1].to_string())
        } else {
            None
        }
    })
}

#[async_trait]
impl GithubApi for HttpGithubApi {
    async fn list_issues(
        &self,
        token: Option<&str>,
        repo: &RepoRef,
        state: &str,
        page_url: Option<&str>,
    ) -> SyncResult<IssuePage> {
        let url = match page_url {
            Some(u) => u.to_string(),
            None => format!(
                "{}/repos/{}/{}/issues?state={}&per_page=100",
                self.config.api_url.trim_end_matches('/'),
                repo.owner,
                repo.name,
                state
            ),
        };
        let resp = self.get(&url, token).send().await?;
        if !resp.status().is_success() {
            return Err(status_error(&format!("GET {}", url), resp.status()));
        }
        let next_page_url = resp
            .headers()
            .get("link")
            .and_then(|v| v.to_str().ok())
            .and_then(next_link);
        let issues: Vec<GithubIssue> = resp.json().await?;
        Ok(IssuePage {
            issues,
            next_page_url,
        })
    }

    async fn get_issue(
        &self,
        token: Option<&str>,
        repo: &RepoRef,
        number: u64,
    ) -> SyncResult<GithubIssue> {
        let url = format!(
            "{}/repos/{}/{}/issues/{}",
            self.config.api_url.trim_end_matches('/'),
            repo.owner,
            repo.name,
            number
        );
        let resp = self.get(&url, token).send().await?;
        if !resp.status().is_success() {
            return Err(status_error(&format!("GET {}", url), resp.status()));
        }
        Ok(resp.json().await?)
    }

    async fn list_issue_comments(
        &self,
        token: Option<&str>,
        repo: &RepoRef,
        number: u64,
    ) -> SyncResult<Vec<GithubComment>> {
        let mut url = Some(format!(
            "{}/repos/{}/{}/issues/{}/comments?per_page=100",
            self.config.api_url.trim_end_matches('/'),
            repo.owner,
            repo.name,
            number
        ));
        let mut comments = Vec::new();
        while let Some(current) = url.take() {
            let resp = self.get(&current, token).send().await?;
            if !resp.status().is_success() {
                return Err(status_error(&format!("GET {}", current), resp.status()));
            }
            url = resp
                .headers()
                .get("link")
                .and_then(|v| v.to_str().ok())
                .and_then(next_link);
            let page: Vec<GithubComment> = resp.json().await?;
            comments.extend(page);
        }
        Ok(comments)
    }

    async fn list_discussions(
        &self,
        token: Option<&str>,
        repo: &RepoRef,
        cursor: Option<&str>,
    ) -> SyncResult<DiscussionPage> {
        let data = self
            .graphql(
                token,
                r#"query($owner: String!, $name: String!, $after: String) {
                    repository(owner: $owner, name: $name) {
                        discussions(first: 50, after: $after) {
                            nodes { number title url }
                            pageInfo { hasNextPage endCursor }
                        }
                    }
                }"#,
                json!({ "owner": repo.owner, "name": repo.name, "after": cursor }),
            )
            .await?;

        let conn = &data["repository"]["discussions"];
        let discussions = conn["nodes"]
            .as_array()
            .map(|nodes| {
                nodes
                    .iter()
                    .filter_map(|n| {
                        Some(DiscussionSummary {
                            number: n["number"].as_u64()?,
                            title: n["title"].as_str()?.to_string(),
                            url: n["url"].as_str()?.to_string(),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        let end_cursor = if conn["pageInfo"]["hasNextPage"].as_bool() == Some(true) {
            conn["pageInfo"]["endCursor"].as_str().map(String::from)
        } else {
            None
        };
        Ok(DiscussionPage {
            discussions,
            end_cursor,
        })
    }

    async fn get_discussion(
        &self,
        token: Option<&str>,
        repo: &RepoRef,
        number: u64,
    ) -> SyncResult<GithubDiscussion> {
        let data = self
            .graphql(
                token,
                r#"query($owner: String!, $name: String!, $number: Int!) {
                    repository(owner: $owner, name: $name) {
                        discussion(number: $number) {
                            number title url body
                            comments(first: 100) { nodes { body author { login } } }
                        }
                    }
                }"#,
                json!({ "owner": repo.owner, "name": repo.name, "number": number }),
            )
            .await?;

        let d = &data["repository"]["discussion"];
        if d.is_null() {
            return Err(SyncError::content(format!(
                "discussion #{} not found in {}/{}",
                number, repo.owner, repo.name
            )));
        }
        let comments = d["comments"]["nodes"]
            .as_array()
            .map(|nodes| {
                nodes
                    .iter()
                    .map(|c| GithubComment {
                        body: c["body"].as_str().map(String::from),
                        user: c["author"]["login"].as_str().map(|l| GithubUser {
                            login: l.to_string(),
                        }),
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(GithubDiscussion {
            number,
            title: d["title"].as_str().unwrap_or_default().to_string(),
            url: d["url"].as_str().unwrap_or_default().to_string(),
            body: d["body"].as_str().unwrap_or_default().to_string(),
            comments,
        })
    }

    fn default_token(&self) -> Option<&str> {
        self.config.token.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeGithub {
        issues: Vec<GithubIssue>,
        requested_states: Mutex<Vec<String>>,
    }

    fn issue(number: u64, state: &str, pr: bool) -> GithubIssue {
        GithubIssue {
            number,
            title: format!("Issue {}", number),
            state: state.to_string(),
            html_url: format!("https://github.com/acme/widgets/issues/{}", number),
            body: Some(format!("Body of {}", number)),
            user: Some(GithubUser {
                login: "octo".into(),
            }),
            pull_request: pr.then(|| json!({ "url": "x" })),
        }
    }

    #[async_trait]
    impl GithubApi for FakeGithub {
        async fn list_issues(
            &self,
            _token: Option<&str>,
            _repo: &RepoRef,
            state: &str,
            page_url: Option<&str>,
        ) -> SyncResult<IssuePage> {
            self.requested_states.lock().unwrap().push(state.to_string());
            Ok(IssuePage {
                issues: self.issues.clone(),
                next_page_url: if page_url.is_none() {
                    Some("https://api.github.com/repositories/1/issues?page=2".into())
                } else {
                    None
                },
            })
        }

        async fn get_issue(
            &self,
            _token: Option<&str>,
            _repo: &RepoRef,
            number: u64,
        ) -> SyncResult<GithubIssue> {
            self.issues
                .iter()
                .find(|i| i.number == number)
                .cloned()
                .ok_or_else(|| SyncError::content("missing"))
        }

        async fn list_issue_comments(
            &self,
            _token: Option<&str>,
            _repo: &RepoRef,
            _number: u64,
        ) -> SyncResult<Vec<GithubComment>> {
            Ok(vec![GithubComment {
                body: Some("Fixed in 1.2".into()),
                user: Some(GithubUser {
                    login: "maintainer".into(),
                }),
            }])
        }

        async fn list_discussions(
            &self,
            _token: Option<&str>,
            _repo: &RepoRef,
            _cursor: Option<&str>,
        ) -> SyncResult<DiscussionPage> {
            Ok(DiscussionPage::default())
        }

        async fn get_discussion(
            &self,
            _token: Option<&str>,
            _repo: &RepoRef,
            _number: u64,
        ) -> SyncResult<GithubDiscussion> {
            Err(SyncError::content("none"))
        }

        fn default_token(&self) -> Option<&str> {
            None
        }
    }

    fn group(states: Option<&str>) -> KnowledgeGroup {
        let mut g = KnowledgeGroup::for_test(GroupType::GithubIssues);
        g.url = Some("https://github.com/acme/widgets".into());
        g.allowed_github_issue_states = states.map(String::from);
        g
    }

    #[test]
    fn test_repo_url_parsing() {
        let r = RepoRef::parse("https://www.github.com/acme/widgets.git").unwrap();
        assert_eq!(r.owner, "acme");
        assert_eq!(r.name, "widgets");
        assert!(RepoRef::parse("https://gitlab.com/acme/widgets").is_err());
        assert!(RepoRef::parse("https://github.com/acme").is_err());
        assert!(RepoRef::parse("https://github.com/acme/widgets/issues").is_err());
    }

    #[test]
    fn test_next_link() {
        let header = r#"<https://api.github.com/x?page=2>; rel="next", <https://api.github.com/x?page=5>; rel="last""#;
        assert_eq!(
            next_link(header).as_deref(),
            Some("https://api.github.com/x?page=2")
        );
        assert_eq!(next_link(r#"<https://a/x?page=1>; rel="prev""#), None);
    }

    #[tokio::test]
    async fn test_single_state_filters_server_and_client_side() {
        let api = Arc::new(FakeGithub {
            issues: vec![issue(1, "closed", false), issue(2, "closed", false), issue(3, "open", false)],
            ..Default::default()
        });
        let source = GithubIssuesSource::new(api.clone());
        let found = source.update_group(&group(Some("closed")), None).await.unwrap();

        let ids: Vec<_> = found
            .items
            .iter()
            .map(|i| i.source_page_id.clone().unwrap())
            .collect();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(api.requested_states.lock().unwrap().as_slice(), ["closed"]);
        assert!(found.next_cursor.is_some());
    }

    #[tokio::test]
    async fn test_pull_requests_excluded_and_all_states_requested() {
        let api = Arc::new(FakeGithub {
            issues: vec![issue(1, "open", true), issue(2, "open", false), issue(3, "closed", false)],
            ..Default::default()
        });
        let source = GithubIssuesSource::new(api.clone());
        let found = source.update_group(&group(None), Some("page-2")).await.unwrap();

        assert_eq!(found.items.len(), 2);
        assert_eq!(api.requested_states.lock().unwrap().as_slice(), ["all"]);
        assert!(found.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_invalid_repo_url_is_fatal() {
        let source = GithubIssuesSource::new(Arc::new(FakeGithub::default()));
        let mut g = group(None);
        g.url = Some("https://example.com/acme/widgets".into());
        let err = source.update_group(&g, None).await.unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[tokio::test]
    async fn test_issue_page_includes_comments() {
        let api = Arc::new(FakeGithub {
            issues: vec![issue(7, "closed", false)],
            ..Default::default()
        });
        let source = GithubIssuesSource::new(api);
        let job = ItemJob {
            process_id: "p1".into(),
            knowledge_group_id: "g1".into(),
            scrape_item_id: "s1".into(),
            url: "https://github.com/acme/widgets/issues/7".into(),
            source_page_id: Some("7".into()),
            title: None,
            next_cursor: None,
            just_this: false,
        };
        let page = source.update_item(&group(None), &job).await.unwrap().unwrap();
        assert_eq!(page.title, "Issue 7");
        assert!(page.text.contains("State: closed"));
        assert!(page.text.contains("### Comments"));
        assert!(page.text.contains("**maintainer**: Fixed in 1.2"));
    }
}
