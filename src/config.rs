use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
    #[serde(default)]
    pub credits: CreditsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    /// Maximum characters per stored chunk, newlines included.
    pub size: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueueConfig {
    #[serde(default = "default_item_concurrency")]
    pub item_concurrency: usize,
    #[serde(default = "default_group_concurrency")]
    pub group_concurrency: usize,
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Completed jobs kept per queue; older ones are deleted.
    #[serde(default)]
    pub keep_completed: u32,
    /// Failed jobs kept per queue for inspection.
    #[serde(default = "default_keep_failed")]
    pub keep_failed: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            item_concurrency: default_item_concurrency(),
            group_concurrency: default_group_concurrency(),
            attempts: default_attempts(),
            backoff_ms: default_backoff_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            keep_completed: 0,
            keep_failed: default_keep_failed(),
        }
    }
}

fn default_item_concurrency() -> usize {
    10
}
fn default_group_concurrency() -> usize {
    1
}
fn default_attempts() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    2000
}
fn default_poll_interval_ms() -> u64 {
    500
}
fn default_keep_failed() -> u32 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// Shared secret expected in `x-cron-secret` on the cron trigger.
    #[serde(default)]
    pub cron_secret: Option<String>,
    /// Bearer token expected on the authenticated triggers.
    #[serde(default)]
    pub api_token: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SourcesConfig {
    #[serde(default)]
    pub github: GithubSourceConfig,
    #[serde(default)]
    pub linear: LinearSourceConfig,
    #[serde(default)]
    pub confluence: ConfluenceSourceConfig,
    #[serde(default)]
    pub youtube: YoutubeSourceConfig,
    #[serde(default)]
    pub web: WebSourceConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GithubSourceConfig {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_github_api")]
    pub api_url: String,
}

impl Default for GithubSourceConfig {
    fn default() -> Self {
        Self {
            token: None,
            api_url: default_github_api(),
        }
    }
}

fn default_github_api() -> String {
    "https://api.github.com".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LinearSourceConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_linear_api")]
    pub api_url: String,
}

impl Default for LinearSourceConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: default_linear_api(),
        }
    }
}

fn default_linear_api() -> String {
    "https://api.linear.app/graphql".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct ConfluenceSourceConfig {
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub api_token: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct YoutubeSourceConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_youtube_api")]
    pub api_url: String,
    /// Transcript service queried as `{transcript_url}?video_id=<id>`.
    #[serde(default)]
    pub transcript_url: Option<String>,
}

impl Default for YoutubeSourceConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_url: default_youtube_api(),
            transcript_url: None,
        }
    }
}

fn default_youtube_api() -> String {
    "https://www.googleapis.com/youtube/v3".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebSourceConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for WebSourceConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_user_agent() -> String {
    format!("ksync/{}", env!("CARGO_PKG_VERSION"))
}
fn default_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct CreditsConfig {
    /// Users whose credit balance is exhausted; their syncs stop cooperatively.
    #[serde(default)]
    pub exhausted_users: Vec<String>,
}

impl Config {
    /// In-code defaults with the database at `db_path`.
    pub fn minimal(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            chunking: ChunkingConfig { size: 4000 },
            queue: QueueConfig::default(),
            server: ServerConfig {
                bind: "127.0.0.1:7341".to_string(),
                cron_secret: None,
                api_token: None,
            },
            sources: SourcesConfig::default(),
            credits: CreditsConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunking.size == 0 {
            anyhow::bail!("chunking.size must be > 0");
        }
        if self.queue.item_concurrency == 0 {
            anyhow::bail!("queue.item_concurrency must be >= 1");
        }
        // Discovery of one group must never race its own cursor chain.
        if self.queue.group_concurrency != 1 {
            anyhow::bail!(
                "queue.group_concurrency must be 1 (got {})",
                self.queue.group_concurrency
            );
        }
        if self.queue.attempts == 0 {
            anyhow::bail!("queue.attempts must be >= 1");
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(extra: &str) -> Result<Config> {
        let content = format!(
            r#"
[db]
path = "/tmp/ksync.sqlite"

[chunking]
size = 1000

[server]
bind = "127.0.0.1:0"
{}
"#,
            extra
        );
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_queue_defaults() {
        let cfg = parse("").unwrap();
        assert_eq!(cfg.queue.item_concurrency, 10);
        assert_eq!(cfg.queue.group_concurrency, 1);
        assert_eq!(cfg.queue.attempts, 3);
        assert_eq!(cfg.queue.backoff_ms, 2000);
        assert!(cfg.credits.exhausted_users.is_empty());
        assert_eq!(cfg.sources.github.api_url, "https://api.github.com");
    }

    #[test]
    fn test_rejects_parallel_group_pool() {
        let err = parse("[queue]\ngroup_concurrency = 4").unwrap_err();
        assert!(err.to_string().contains("group_concurrency"));
    }

    #[test]
    fn test_rejects_zero_chunk_size() {
        let mut cfg = Config::minimal("/tmp/x.sqlite");
        cfg.chunking.size = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_source_credentials() {
        let cfg = parse(
            r#"
[sources.github]
token = "ghp_x"

[sources.confluence]
base_url = "https://acme.atlassian.net"
email = "ops@acme.dev"
api_token = "t"
"#,
        )
        .unwrap();
        assert_eq!(cfg.sources.github.token.as_deref(), Some("ghp_x"));
        assert_eq!(
            cfg.sources.confluence.base_url.as_deref(),
            Some("https://acme.atlassian.net")
        );
    }
}
