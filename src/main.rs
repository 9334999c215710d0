//! # Knowledge Sync CLI (`ksync`)
//!
//! ## Usage
//!
//! ```bash
//! ksync --config ./config/ksync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `ksync init` | Create the SQLite database and run schema migrations |
//! | `ksync serve` | Serve the HTTP triggers and run both worker pools |
//! | `ksync work` | Run both worker pools without the HTTP server |
//! | `ksync group add\|list\|items\|types` | Manage knowledge groups |
//! | `ksync sync <group>` | Start a full sync and run it to completion |
//! | `ksync sync-item <item>` | Refresh a single scrape item |
//! | `ksync stop <group>` | Stop a running sync and prune its work |
//! | `ksync cron` | Start every group that is due |
//! | `ksync status` | Show job counts per queue |
//! | `ksync chunk <file>` | Print the markdown chunks of a file |
//!
//! ## Examples
//!
//! ```bash
//! ksync init
//! ksync group add --type github-issues --title Widgets \
//!     --url https://github.com/acme/widgets --github-states closed
//! ksync sync 6f1c…
//! ksync serve --log-json
//! ```

use anyhow::Context;
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use knowledge_sync::chunk::{split_markdown, SplitOptions};
use knowledge_sync::config::{self, Config};
use knowledge_sync::db;
use knowledge_sync::migrate;
use knowledge_sync::models::{GroupType, NewKnowledgeGroup, UpdateFrequency};
use knowledge_sync::pipeline::SyncPipeline;
use knowledge_sync::server;

/// Knowledge Sync: discover, fetch, chunk, and reconcile content from
/// external knowledge sources.
#[derive(Parser)]
#[command(name = "ksync", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/ksync.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Serve the HTTP triggers and run both worker pools.
    Serve,

    /// Run both worker pools until interrupted.
    Work,

    /// Manage knowledge groups.
    Group {
        #[command(subcommand)]
        action: GroupAction,
    },

    /// Start a full sync of a group.
    ///
    /// Runs queued jobs in the foreground until the queues are idle, unless
    /// `--no-wait` is given.
    Sync {
        /// Knowledge group id.
        group: String,

        /// Only enqueue; leave execution to a running `ksync work`.
        #[arg(long)]
        no_wait: bool,
    },

    /// Refresh a single scrape item.
    SyncItem {
        /// Scrape item id.
        item: String,

        #[arg(long)]
        no_wait: bool,
    },

    /// Stop a running sync.
    Stop {
        /// Knowledge group id.
        group: String,
    },

    /// Start every group whose next update is due.
    Cron {
        /// Run the scheduled jobs in the foreground.
        #[arg(long)]
        drain: bool,
    },

    /// Show job counts per queue.
    Status,

    /// Split a markdown file into chunks and print them.
    Chunk {
        file: PathBuf,

        /// Maximum characters per chunk. Defaults to `[chunking].size`.
        #[arg(long)]
        size: Option<usize>,

        /// Preface line repeated at the top of every chunk.
        #[arg(long)]
        context: Option<String>,
    },
}

#[derive(Subcommand)]
enum GroupAction {
    /// Register a new knowledge group.
    Add {
        #[arg(long = "type", value_enum)]
        group_type: TypeArg,

        #[arg(long)]
        title: String,

        #[arg(long, default_value = "local")]
        user: String,

        /// Primary source URL (repository, channel, space, site).
        #[arg(long)]
        url: Option<String>,

        /// Additional URLs (web pages, videos). Repeatable.
        #[arg(long = "page")]
        pages: Vec<String>,

        /// Comma-separated regexes; matching items are skipped.
        #[arg(long)]
        skip: Option<String>,

        /// Comma-separated GitHub issue states (open, closed).
        #[arg(long)]
        github_states: Option<String>,

        /// Comma-separated Linear workflow states to exclude.
        #[arg(long)]
        linear_skip_statuses: Option<String>,

        /// Source credential overriding the configured token.
        #[arg(long)]
        credential: Option<String>,

        #[arg(long, value_enum, default_value = "never")]
        frequency: FrequencyArg,

        /// Delete items no longer discovered at the end of a run.
        #[arg(long)]
        remove_stale: bool,
    },

    /// List knowledge groups.
    List,

    /// List the scrape items of a group.
    Items { group: String },

    /// List supported source types.
    Types,
}

#[derive(Clone, Copy, ValueEnum)]
enum TypeArg {
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

impl From<TypeArg> for GroupType {
    fn from(arg: TypeArg) -> Self {
        match arg {
            TypeArg::Web => GroupType::Web,
            TypeArg::GithubIssues => GroupType::GithubIssues,
            TypeArg::GithubDiscussions => GroupType::GithubDiscussions,
            TypeArg::Linear => GroupType::Linear,
            TypeArg::LinearProjects => GroupType::LinearProjects,
            TypeArg::Confluence => GroupType::Confluence,
            TypeArg::Notion => GroupType::Notion,
            TypeArg::YoutubeChannel => GroupType::YoutubeChannel,
            TypeArg::YoutubeVideos => GroupType::YoutubeVideos,
            TypeArg::Upload => GroupType::Upload,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum FrequencyArg {
    Never,
    Hourly,
    Daily,
    Weekly,
    Monthly,
}

impl From<FrequencyArg> for UpdateFrequency {
    fn from(arg: FrequencyArg) -> Self {
        match arg {
            FrequencyArg::Never => UpdateFrequency::Never,
            FrequencyArg::Hourly => UpdateFrequency::Hourly,
            FrequencyArg::Daily => UpdateFrequency::Daily,
            FrequencyArg::Weekly => UpdateFrequency::Weekly,
            FrequencyArg::Monthly => UpdateFrequency::Monthly,
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("knowledge_sync=info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if json {
        builder.json().init();
    } else {
        builder.with_ansi(atty::is(atty::Stream::Stderr)).init();
    }
}

async fn open_pipeline(cfg: &Config) -> anyhow::Result<Arc<SyncPipeline>> {
    let pool = db::connect(cfg).await?;
    migrate::migrate_pool(&pool).await?;
    Ok(Arc::new(SyncPipeline::from_config(cfg, pool)?))
}

async fn run_until_idle(pipeline: &Arc<SyncPipeline>) -> anyhow::Result<()> {
    let ran = pipeline.drain().await?;
    println!("Ran {} jobs.", ran);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    // Commands that don't require config
    match &cli.command {
        Commands::Group {
            action: GroupAction::Types,
        } => {
            let sources =
                knowledge_sync::sources::SourceRegistry::from_config(&Config::minimal("unused"))?;
            for source in sources.sources() {
                println!("{:<20} {}", source.group_type(), source.description());
            }
            return Ok(());
        }
        Commands::Chunk {
            file,
            size: Some(size),
            context,
        } => {
            print_chunks(file, *size, context.as_deref())?;
            return Ok(());
        }
        _ => {}
    }

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            let pipeline = open_pipeline(&cfg).await?;
            let shutdown = CancellationToken::new();
            let workers = pipeline.spawn_workers(shutdown.clone()).await?;
            tokio::spawn(cancel_on_ctrl_c(shutdown.clone()));
            server::run_server(&cfg, pipeline, shutdown.clone()).await?;
            shutdown.cancel();
            for worker in workers {
                worker.await?;
            }
        }
        Commands::Work => {
            let pipeline = open_pipeline(&cfg).await?;
            let shutdown = CancellationToken::new();
            let workers = pipeline.spawn_workers(shutdown.clone()).await?;
            cancel_on_ctrl_c(shutdown).await;
            for worker in workers {
                worker.await?;
            }
        }
        Commands::Group { action } => {
            let pipeline = open_pipeline(&cfg).await?;
            run_group_action(&pipeline, action).await?;
        }
        Commands::Sync { group, no_wait } => {
            let pipeline = open_pipeline(&cfg).await?;
            let process_id = pipeline.start_group_sync(&group).await?;
            println!("Started sync {} for group {}", process_id, group);
            if !no_wait {
                run_until_idle(&pipeline).await?;
                print_group_status(&pipeline, &group).await?;
            }
        }
        Commands::SyncItem { item, no_wait } => {
            let pipeline = open_pipeline(&cfg).await?;
            let process_id = pipeline.start_item_sync(&item).await?;
            println!("Started item sync {} for item {}", process_id, item);
            if !no_wait {
                run_until_idle(&pipeline).await?;
            }
        }
        Commands::Stop { group } => {
            let pipeline = open_pipeline(&cfg).await?;
            let summary = pipeline.stop_group(&group).await?;
            println!(
                "Stopped group {}: {} items deleted, {} flags cleared, {} jobs removed",
                group, summary.items_deleted, summary.flags_cleared, summary.jobs_removed
            );
        }
        Commands::Cron { drain } => {
            let pipeline = open_pipeline(&cfg).await?;
            let summary = pipeline.schedule_due_groups(Utc::now()).await?;
            println!("{}", serde_json::to_string(&summary)?);
            if drain {
                run_until_idle(&pipeline).await?;
            }
        }
        Commands::Status => {
            let pipeline = open_pipeline(&cfg).await?;
            let status = serde_json::json!({
                "group": pipeline.group_queue().counts().await?,
                "item": pipeline.item_queue().counts().await?,
            });
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::Chunk {
            file,
            size,
            context,
        } => {
            print_chunks(
                &file,
                size.unwrap_or(cfg.chunking.size),
                context.as_deref(),
            )?;
        }
    }

    Ok(())
}

async fn cancel_on_ctrl_c(shutdown: CancellationToken) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
    }
    tracing::info!("shutting down");
    shutdown.cancel();
}

async fn run_group_action(pipeline: &SyncPipeline, action: GroupAction) -> anyhow::Result<()> {
    match action {
        GroupAction::Add {
            group_type,
            title,
            user,
            url,
            pages,
            skip,
            github_states,
            linear_skip_statuses,
            credential,
            frequency,
            remove_stale,
        } => {
            let mut new = NewKnowledgeGroup::new(&user, &title, group_type.into());
            new.url = url;
            new.urls = pages;
            new.skip_page_regex = skip;
            new.allowed_github_issue_states = github_states;
            new.linear_skip_issue_statuses = linear_skip_statuses;
            new.credential = credential;
            new.update_frequency = frequency.into();
            new.remove_stale_pages = remove_stale;
            let group = pipeline.repo().create_group(&new).await?;
            println!("{}", group.id);
        }
        GroupAction::List => {
            let groups = pipeline.repo().list_groups().await?;
            if groups.is_empty() {
                println!("No knowledge groups.");
            }
            for g in groups {
                println!(
                    "{}  {:<18} {:<10} {}",
                    g.id, g.group_type, g.status.as_str(), g.title
                );
            }
        }
        GroupAction::Items { group } => {
            for item in pipeline.repo().list_items(&group).await? {
                let flag = if item.will_update { "*" } else { " " };
                println!(
                    "{} {}  {:<7} {}{}",
                    flag,
                    item.id,
                    item.status.as_str(),
                    item.url,
                    item.error.map(|e| format!("  ({})", e)).unwrap_or_default()
                );
            }
        }
        GroupAction::Types => {}
    }
    Ok(())
}

async fn print_group_status(pipeline: &SyncPipeline, group_id: &str) -> anyhow::Result<()> {
    let group = pipeline
        .repo()
        .get_group(group_id)
        .await?
        .with_context(|| format!("group {} vanished", group_id))?;
    let items = pipeline.repo().list_items(group_id).await?;
    let failed = items
        .iter()
        .filter(|i| i.status == knowledge_sync::models::ItemStatus::Failed)
        .count();
    println!(
        "Group {} is {} ({} items, {} failed)",
        group.id,
        group.status.as_str(),
        items.len(),
        failed
    );
    Ok(())
}

fn print_chunks(file: &Path, size: usize, context: Option<&str>) -> anyhow::Result<()> {
    let markdown = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let mut opts = SplitOptions::new(size);
    if let Some(ctx) = context {
        opts = opts.with_context(ctx);
    }
    let chunks = split_markdown(&markdown, &opts)?;
    for (i, chunk) in chunks.iter().enumerate() {
        println!("--- chunk {} ({} chars) ---", i + 1, chunk.chars().count());
        println!("{}", chunk);
    }
    Ok(())
}
