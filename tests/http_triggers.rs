use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;

use knowledge_sync::config::Config;
use knowledge_sync::db;
use knowledge_sync::migrate::migrate_pool;
use knowledge_sync::models::{GroupStatus, GroupType, ItemRef, NewKnowledgeGroup};
use knowledge_sync::pipeline::SyncPipeline;
use knowledge_sync::server::router;

const TOKEN: &str = "test-token";
const CRON_SECRET: &str = "tick";

struct Server {
    _tmp: TempDir,
    base: String,
    pipeline: Arc<SyncPipeline>,
    client: reqwest::Client,
}

impl Server {
    async fn start() -> Self {
        let tmp = TempDir::new().unwrap();
        let mut cfg = Config::minimal(tmp.path().join("ksync.sqlite"));
        cfg.server.api_token = Some(TOKEN.into());
        cfg.server.cron_secret = Some(CRON_SECRET.into());

        let pool = db::connect(&cfg).await.unwrap();
        migrate_pool(&pool).await.unwrap();
        let pipeline = Arc::new(SyncPipeline::from_config(&cfg, pool).unwrap());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(Arc::new(cfg), pipeline.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            _tmp: tmp,
            base: format!("http://{}", addr),
            pipeline,
            client: reqwest::Client::new(),
        }
    }

    async fn post(&self, path: &str, body: Value) -> (u16, Value) {
        let resp = self
            .client
            .post(format!("{}{}", self.base, path))
            .bearer_auth(TOKEN)
            .json(&body)
            .send()
            .await
            .unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn web_group(&self) -> String {
        let mut new = NewKnowledgeGroup::new("u1", "Docs", GroupType::Web);
        new.urls = vec!["https://example.com/guide".into()];
        self.pipeline.repo().create_group(&new).await.unwrap().id
    }
}

#[tokio::test]
async fn test_health() {
    let server = Server::start().await;
    let resp = reqwest::get(format!("{}/health", server.base)).await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
}

#[tokio::test]
async fn test_update_group_requires_token() {
    let server = Server::start().await;
    let resp = server
        .client
        .post(format!("{}/update-group", server.base))
        .json(&json!({ "knowledgeGroupId": "x" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["error"]["code"], "unauthorized");
}

#[tokio::test]
async fn test_update_group_starts_sync() {
    let server = Server::start().await;
    let id = server.web_group().await;

    let (status, body) = server
        .post("/update-group", json!({ "knowledgeGroupId": id }))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["message"], "ok");

    let group = server.pipeline.repo().get_group(&id).await.unwrap().unwrap();
    assert_eq!(group.status, GroupStatus::Processing);
    assert_eq!(
        group.update_process_id.as_deref(),
        body["processId"].as_str()
    );
    assert_eq!(
        server.pipeline.group_queue().pending_for_group(&id).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn test_update_group_unknown_is_404() {
    let server = Server::start().await;
    let (status, body) = server
        .post("/update-group", json!({ "knowledgeGroupId": "missing" }))
        .await;
    assert_eq!(status, 404);
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_update_item_without_url_is_400() {
    let server = Server::start().await;
    let id = server.web_group().await;
    let item = server
        .pipeline
        .repo()
        .upsert_discovered_item(&id, "p0", &ItemRef::new(""), false)
        .await
        .unwrap();

    let (status, body) = server
        .post("/update-item", json!({ "scrapeItemId": item.id }))
        .await;
    assert_eq!(status, 400);
    assert_eq!(body["error"]["code"], "bad_request");
}

#[tokio::test]
async fn test_update_item_enqueues_single_item() {
    let server = Server::start().await;
    let id = server.web_group().await;
    let item = server
        .pipeline
        .repo()
        .upsert_discovered_item(&id, "p0", &ItemRef::new("https://example.com/guide"), false)
        .await
        .unwrap();

    let (status, _) = server
        .post("/update-item", json!({ "scrapeItemId": item.id }))
        .await;
    assert_eq!(status, 200);

    let jobs = server.pipeline.item_queue().jobs_for_group(&id).await.unwrap();
    assert_eq!(jobs.len(), 1);
    let payload: knowledge_sync::models::ItemJob = jobs[0].payload_as().unwrap();
    assert!(payload.just_this);
    assert!(payload.next_cursor.is_none());
}

#[tokio::test]
async fn test_stop_group() {
    let server = Server::start().await;
    let id = server.web_group().await;
    server
        .post("/update-group", json!({ "knowledgeGroupId": id }))
        .await;

    let (status, body) = server
        .post("/stop-group", json!({ "knowledgeGroupId": id }))
        .await;
    assert_eq!(status, 200);
    assert_eq!(body["jobs_removed"], 1);

    let group = server.pipeline.repo().get_group(&id).await.unwrap().unwrap();
    assert_eq!(group.status, GroupStatus::Done);
    assert!(group.update_process_id.is_none());
}

#[tokio::test]
async fn test_cron_trigger_checks_secret() {
    let server = Server::start().await;
    let url = format!("{}/update-knowledge-base", server.base);

    let resp = server
        .client
        .post(&url)
        .header("x-cron-secret", "wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 401);

    let resp = server
        .client
        .post(&url)
        .header("x-cron-secret", CRON_SECRET)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body, json!({ "found": 0, "scheduled": 0, "failed": 0 }));
}
