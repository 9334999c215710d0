//! Sync orchestration: starting and stopping runs, executing group and item
//! jobs, and the completion/cancellation check.
//!
//! # Run lifecycle
//!
//! ```text
//! start_group_sync ──▶ group job (cursor = None)
//!                          │ update_group
//!                          ▼
//!              item job … item job (last one carries next_cursor)
//!                                         │ update_item
//!                                         ▼
//!                               group job (cursor = next) ──▶ …
//! ```
//!
//! Every settled job triggers [`SyncPipeline::check_completion`]. A run is
//! `done` once no item of the group is flagged `will_update` and no job of
//! the group is unfinished on either queue. A job whose `process_id` no
//! longer matches its group's `update_process_id`, or whose group left
//! `processing`, is discarded without side effects.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{Config, QueueConfig};
use crate::content::{ContentReconciler, CreditGate, SqliteContentStore, StaticCreditGate};
use crate::error::{SyncError, SyncResult};
use crate::models::{
    GroupJob, GroupStatus, ItemJob, ItemRef, KnowledgeGroup, ScrapeItem,
};
use crate::queue::{JobOptions, JobQueue, JobRecord, QueueName};
use crate::repo::KnowledgeRepo;
use crate::sources::SourceRegistry;
use crate::worker::{self, JobHandler};

/// Result of the cron scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CronSummary {
    pub found: usize,
    pub scheduled: usize,
    pub failed: usize,
}

/// What a cancellation pruned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CancelSummary {
    pub items_deleted: u64,
    pub flags_cleared: u64,
    pub jobs_removed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionOutcome {
    /// This check moved the group to `done`.
    Completed,
    /// Work is still outstanding for the run.
    InProgress,
    /// The group runs a newer process; nothing to do for this one.
    Superseded,
    /// The group is not processing and nothing is outstanding.
    AlreadySettled,
    /// The group was stopped or deleted; leftover work was pruned.
    Cancelled(CancelSummary),
}

#[derive(Clone)]
pub struct SyncPipeline {
    repo: KnowledgeRepo,
    group_queue: JobQueue,
    item_queue: JobQueue,
    sources: SourceRegistry,
    reconciler: Arc<dyn ContentReconciler>,
    credits: Arc<dyn CreditGate>,
    queue_config: QueueConfig,
}

impl SyncPipeline {
    pub fn new(
        pool: SqlitePool,
        queue_config: &QueueConfig,
        sources: SourceRegistry,
        reconciler: Arc<dyn ContentReconciler>,
        credits: Arc<dyn CreditGate>,
    ) -> Self {
        let options = JobOptions::from(queue_config);
        Self {
            repo: KnowledgeRepo::new(pool.clone()),
            group_queue: JobQueue::new(pool.clone(), QueueName::Group, options),
            item_queue: JobQueue::new(pool, QueueName::Item, options),
            sources,
            reconciler,
            credits,
            queue_config: queue_config.clone(),
        }
    }

    /// Pipeline with the built-in adapters, the SQLite reconciler, and the
    /// configured credit gate.
    pub fn from_config(config: &Config, pool: SqlitePool) -> anyhow::Result<Self> {
        let sources = SourceRegistry::from_config(config)?;
        let reconciler = Arc::new(SqliteContentStore::new(pool.clone(), config.chunking.size));
        let credits = Arc::new(StaticCreditGate::new(
            config.credits.exhausted_users.iter().cloned(),
        ));
        Ok(Self::new(pool, &config.queue, sources, reconciler, credits))
    }

    pub fn repo(&self) -> &KnowledgeRepo {
        &self.repo
    }

    pub fn group_queue(&self) -> &JobQueue {
        &self.group_queue
    }

    pub fn item_queue(&self) -> &JobQueue {
        &self.item_queue
    }

    pub fn sources(&self) -> &SourceRegistry {
        &self.sources
    }

    // ============ Triggers ============

    /// Start a full sync of a group. Returns the new process id.
    ///
    /// Leftovers of an earlier run are pruned first so its flags cannot hold
    /// the new run open.
    pub async fn start_group_sync(&self, group_id: &str) -> SyncResult<String> {
        let group = self.require_group(group_id).await?;
        self.sources.get(group.group_type)?;

        let process_id = Uuid::new_v4().to_string();
        self.cancel_group(&group.id).await?;
        self.repo.begin_sync(&group.id, &process_id).await?;
        self.group_queue
            .add(
                &process_id,
                &group.id,
                &GroupJob {
                    process_id: process_id.clone(),
                    knowledge_group_id: group.id.clone(),
                    cursor: None,
                },
            )
            .await?;

        info!(
            knowledge_group_id = %group.id,
            process_id = %process_id,
            group_type = %group.group_type,
            "group sync started"
        );
        Ok(process_id)
    }

    /// Refresh one item without further discovery. Returns the process id:
    /// the running one when the group is already syncing, a new one otherwise.
    pub async fn start_item_sync(&self, item_id: &str) -> SyncResult<String> {
        let item = self
            .repo
            .get_item(item_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("scrape item {}", item_id)))?;
        if item.url.trim().is_empty() {
            return Err(SyncError::config(format!("scrape item {} has no URL", item_id)));
        }
        let group = self.require_group(&item.knowledge_group_id).await?;
        self.sources.get(group.group_type)?;

        // A running sync absorbs the refresh; only an idle group starts a run.
        let process_id = match (group.status, group.update_process_id.clone()) {
            (GroupStatus::Processing, Some(running)) => {
                if item.will_update && item.last_process_id.as_deref() == Some(running.as_str()) {
                    debug!(scrape_item_id = %item.id, "item already queued in the running sync");
                    return Ok(running);
                }
                running
            }
            _ => {
                let process_id = Uuid::new_v4().to_string();
                self.cancel_group(&group.id).await?;
                self.repo.begin_sync(&group.id, &process_id).await?;
                process_id
            }
        };

        let item_ref = ItemRef {
            url: item.url.clone(),
            source_page_id: item.source_page_id.clone(),
            title: item.title.clone(),
        };
        // Cancellation deletes never-fetched items, so re-register it.
        let scrape = self
            .repo
            .upsert_discovered_item(&group.id, &process_id, &item_ref, true)
            .await?;
        self.item_queue
            .add(
                &process_id,
                &group.id,
                &item_job(&process_id, &group.id, &scrape, None, true),
            )
            .await?;

        info!(
            knowledge_group_id = %group.id,
            scrape_item_id = %scrape.id,
            process_id = %process_id,
            "item sync started"
        );
        Ok(process_id)
    }

    /// Stop the group's current run and prune its outstanding work.
    pub async fn stop_group(&self, group_id: &str) -> SyncResult<CancelSummary> {
        if !self.repo.stop_group(group_id).await? {
            return Err(SyncError::NotFound(format!("knowledge group {}", group_id)));
        }
        let summary = self.cancel_group(group_id).await?;
        info!(knowledge_group_id = %group_id, ?summary, "group sync stopped");
        Ok(summary)
    }

    /// Start every group whose `next_update_at` is due at `now`.
    ///
    /// The next cycle is scheduled before the current one starts, whatever
    /// its outcome. Groups already processing are skipped.
    pub async fn schedule_due_groups(&self, now: DateTime<Utc>) -> SyncResult<CronSummary> {
        let (groups, invalid) = self.repo.due_groups(now).await?;
        let mut summary = CronSummary {
            found: groups.len() + invalid.len(),
            failed: invalid.len(),
            ..Default::default()
        };
        for (id, err) in &invalid {
            warn!(knowledge_group_id = %id, error = %err, "due group cannot be scheduled");
        }

        for group in groups {
            self.repo
                .set_next_update(&group.id, group.update_frequency.next_after(now))
                .await?;
            if group.status == GroupStatus::Processing {
                debug!(knowledge_group_id = %group.id, "group already processing, skipped");
                continue;
            }
            match self.start_group_sync(&group.id).await {
                Ok(_) => summary.scheduled += 1,
                Err(e) => {
                    warn!(knowledge_group_id = %group.id, error = %e, "failed to schedule group");
                    summary.failed += 1;
                }
            }
        }

        info!(
            found = summary.found,
            scheduled = summary.scheduled,
            failed = summary.failed,
            "cron scan finished"
        );
        Ok(summary)
    }

    // ============ Job execution ============

    /// Discover one page for a group and schedule its items.
    pub async fn run_group_job(&self, job: &JobRecord) -> SyncResult<()> {
        let payload: GroupJob = job.payload_as()?;
        let Some(group) = self
            .live_group(&payload.knowledge_group_id, &payload.process_id)
            .await?
        else {
            debug!("group job belongs to a cancelled run, discarded");
            return Ok(());
        };

        if !self.credits.has_credits(&group.user_id).await? {
            info!(user_id = %group.user_id, "credits exhausted, discovery skipped");
            return Ok(());
        }

        let source = self.sources.get(group.group_type)?;
        let discovery = source
            .update_group(&group, payload.cursor.as_deref())
            .await?;
        let pid = &payload.process_id;

        for inline in &discovery.pages {
            let item_ref = ItemRef {
                url: inline.url.clone(),
                source_page_id: inline.source_page_id.clone(),
                title: Some(inline.page.title.clone()),
            };
            let scrape = self
                .repo
                .upsert_discovered_item(&group.id, pid, &item_ref, false)
                .await?;
            self.reconciler
                .upsert_item(&scrape, &group, &inline.url, &inline.page.title, &inline.page.text)
                .await?;
            self.repo
                .complete_item(&scrape.id, Some(&inline.page.title))
                .await?;
        }

        let last = discovery.items.len().checked_sub(1);
        for (i, item_ref) in discovery.items.iter().enumerate() {
            let scrape = self
                .repo
                .upsert_discovered_item(&group.id, pid, item_ref, true)
                .await?;
            let cursor = if Some(i) == last {
                discovery.next_cursor.clone()
            } else {
                None
            };
            self.item_queue
                .add(
                    pid,
                    &group.id,
                    &item_job(pid, &group.id, &scrape, cursor, false),
                )
                .await?;
        }

        info!(
            items = discovery.items.len(),
            pages = discovery.pages.len(),
            has_next = discovery.next_cursor.is_some(),
            "discovery page processed"
        );

        match &discovery.next_cursor {
            // Nothing to carry the cursor: chain the next page directly.
            Some(cursor) if discovery.items.is_empty() => {
                self.enqueue_next_page(pid, &group.id, cursor).await?;
            }
            Some(_) => {}
            None if group.remove_stale_pages => {
                let removed = self.repo.remove_stale_items(&group.id, pid).await?;
                if !removed.is_empty() {
                    let documents = self.reconciler.remove_items(&removed).await?;
                    info!(items = removed.len(), documents, "stale items removed");
                }
            }
            None => {}
        }
        Ok(())
    }

    /// Fetch and store one item, then chain the next discovery page if this
    /// item carries the cursor.
    pub async fn run_item_job(&self, job: &JobRecord) -> SyncResult<()> {
        let payload: ItemJob = job.payload_as()?;
        let Some(group) = self
            .live_group(&payload.knowledge_group_id, &payload.process_id)
            .await?
        else {
            debug!("item job belongs to a cancelled run, discarded");
            return Ok(());
        };
        let Some(scrape) = self.repo.get_item(&payload.scrape_item_id).await? else {
            warn!(scrape_item_id = %payload.scrape_item_id, "scrape item no longer exists");
            return Ok(());
        };

        if !self.credits.has_credits(&group.user_id).await? {
            info!(user_id = %group.user_id, "credits exhausted, item released");
            self.repo.release_item(&scrape.id).await?;
            return Ok(());
        }

        let source = self.sources.get(group.group_type)?;
        let page = source.update_item(&group, &payload).await?;
        if let Some(page) = &page {
            match self
                .reconciler
                .upsert_item(&scrape, &group, &payload.url, &page.title, &page.text)
                .await
            {
                Ok(outcome) => debug!(?outcome, "item content reconciled"),
                Err(SyncError::InsufficientCredits(user_id)) => {
                    info!(user_id = %user_id, "credits ran out while storing, item released");
                    self.repo.release_item(&scrape.id).await?;
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }

        self.repo
            .complete_item(&scrape.id, page.as_ref().map(|p| p.title.as_str()))
            .await?;
        self.chain_next_page(&payload).await?;
        Ok(())
    }

    /// Terminal failure of an item job: record the error on the item and
    /// keep the run moving.
    pub async fn on_item_failed(&self, job: &JobRecord, error: &SyncError) -> SyncResult<()> {
        let payload: ItemJob = job.payload_as()?;
        if self
            .live_group(&payload.knowledge_group_id, &payload.process_id)
            .await?
            .is_some()
        {
            self.repo
                .fail_item(&payload.scrape_item_id, &error.to_string())
                .await?;
            self.chain_next_page(&payload).await?;
        }
        self.check_completion(&payload.knowledge_group_id, &payload.process_id)
            .await?;
        Ok(())
    }

    /// Terminal failure of a group job: the run ends in `error`.
    pub async fn on_group_failed(&self, job: &JobRecord, error: &SyncError) -> SyncResult<()> {
        let payload: GroupJob = job.payload_as()?;
        if self
            .repo
            .mark_group_error(&payload.knowledge_group_id, &payload.process_id)
            .await?
        {
            warn!(error = %error, "group sync failed");
        }
        self.check_completion(&payload.knowledge_group_id, &payload.process_id)
            .await?;
        Ok(())
    }

    /// Decide whether the run `process_id` of a group is finished, still
    /// going, or cancelled. Safe to call any number of times.
    pub async fn check_completion(
        &self,
        group_id: &str,
        process_id: &str,
    ) -> SyncResult<CompletionOutcome> {
        let Some(group) = self.repo.get_group(group_id).await? else {
            let summary = self.cancel_group(group_id).await?;
            return Ok(CompletionOutcome::Cancelled(summary));
        };

        if group.status == GroupStatus::Processing {
            if group.update_process_id.as_deref() != Some(process_id) {
                return Ok(CompletionOutcome::Superseded);
            }
            if self.repo.try_mark_done(group_id, process_id).await? {
                info!(knowledge_group_id = %group_id, process_id, "group sync done");
                return Ok(CompletionOutcome::Completed);
            }
            return Ok(CompletionOutcome::InProgress);
        }

        let flagged = self.repo.count_will_update(group_id).await?;
        let jobs = self.group_queue.pending_for_group(group_id).await?
            + self.item_queue.pending_for_group(group_id).await?;
        if flagged == 0 && jobs == 0 {
            return Ok(CompletionOutcome::AlreadySettled);
        }
        let summary = self.cancel_group(group_id).await?;
        Ok(CompletionOutcome::Cancelled(summary))
    }

    /// Delete never-fetched items, clear outstanding flags, and remove the
    /// group's waiting and delayed jobs. In-flight jobs finish on their own.
    pub async fn cancel_group(&self, group_id: &str) -> SyncResult<CancelSummary> {
        let (items_deleted, flags_cleared) = self.repo.cancel_pending_items(group_id).await?;
        let jobs_removed = self.item_queue.remove_pending_for_group(group_id).await?
            + self.group_queue.remove_pending_for_group(group_id).await?;
        let summary = CancelSummary {
            items_deleted,
            flags_cleared,
            jobs_removed,
        };
        if summary != CancelSummary::default() {
            info!(
                knowledge_group_id = %group_id,
                items_deleted, flags_cleared, jobs_removed, "cancelled outstanding work"
            );
        }
        Ok(summary)
    }

    // ============ Workers ============

    pub fn group_handler(self: &Arc<Self>) -> GroupJobHandler {
        GroupJobHandler {
            pipeline: self.clone(),
        }
    }

    pub fn item_handler(self: &Arc<Self>) -> ItemJobHandler {
        ItemJobHandler {
            pipeline: self.clone(),
        }
    }

    /// Recover stalled jobs and spawn both worker pools.
    pub async fn spawn_workers(
        self: &Arc<Self>,
        shutdown: CancellationToken,
    ) -> SyncResult<Vec<JoinHandle<()>>> {
        let recovered = self.group_queue.recover_stalled().await?
            + self.item_queue.recover_stalled().await?;
        if recovered > 0 {
            warn!(jobs = recovered, "recovered stalled jobs");
        }

        let poll = Duration::from_millis(self.queue_config.poll_interval_ms);
        Ok(vec![
            worker::spawn_pool(
                self.group_queue.clone(),
                Arc::new(self.group_handler()),
                self.queue_config.group_concurrency,
                poll,
                shutdown.clone(),
            ),
            worker::spawn_pool(
                self.item_queue.clone(),
                Arc::new(self.item_handler()),
                self.queue_config.item_concurrency,
                poll,
                shutdown,
            ),
        ])
    }

    /// Run due jobs of both queues in the foreground until none is left.
    /// Returns how many jobs ran.
    pub async fn drain(self: &Arc<Self>) -> SyncResult<usize> {
        let groups = self.group_handler();
        let items = self.item_handler();
        let mut total = 0;
        loop {
            let ran = worker::drain(&self.group_queue, &groups).await?
                + worker::drain(&self.item_queue, &items).await?;
            if ran == 0 {
                return Ok(total);
            }
            total += ran;
        }
    }

    // ============ Helpers ============

    async fn require_group(&self, group_id: &str) -> SyncResult<KnowledgeGroup> {
        self.repo
            .get_group(group_id)
            .await?
            .ok_or_else(|| SyncError::NotFound(format!("knowledge group {}", group_id)))
    }

    /// The group, if it is still processing `process_id`.
    async fn live_group(
        &self,
        group_id: &str,
        process_id: &str,
    ) -> SyncResult<Option<KnowledgeGroup>> {
        Ok(self.repo.get_group(group_id).await?.filter(|g| {
            g.status == GroupStatus::Processing
                && g.update_process_id.as_deref() == Some(process_id)
        }))
    }

    async fn chain_next_page(&self, payload: &ItemJob) -> SyncResult<()> {
        match &payload.next_cursor {
            Some(cursor) if !payload.just_this => {
                self.enqueue_next_page(&payload.process_id, &payload.knowledge_group_id, cursor)
                    .await
            }
            _ => Ok(()),
        }
    }

    async fn enqueue_next_page(
        &self,
        process_id: &str,
        group_id: &str,
        cursor: &str,
    ) -> SyncResult<()> {
        self.group_queue
            .add(
                process_id,
                group_id,
                &GroupJob {
                    process_id: process_id.to_string(),
                    knowledge_group_id: group_id.to_string(),
                    cursor: Some(cursor.to_string()),
                },
            )
            .await?;
        debug!(cursor, "next discovery page scheduled");
        Ok(())
    }
}

fn item_job(
    process_id: &str,
    group_id: &str,
    scrape: &ScrapeItem,
    next_cursor: Option<String>,
    just_this: bool,
) -> ItemJob {
    ItemJob {
        process_id: process_id.to_string(),
        knowledge_group_id: group_id.to_string(),
        scrape_item_id: scrape.id.clone(),
        url: scrape.url.clone(),
        source_page_id: scrape.source_page_id.clone(),
        title: scrape.title.clone(),
        next_cursor,
        just_this,
    }
}

/// Runs group jobs.
pub struct GroupJobHandler {
    pipeline: Arc<SyncPipeline>,
}

#[async_trait]
impl JobHandler for GroupJobHandler {
    async fn handle(&self, job: &JobRecord) -> SyncResult<()> {
        self.pipeline.run_group_job(job).await
    }

    async fn on_completed(&self, job: &JobRecord) -> SyncResult<()> {
        self.pipeline
            .check_completion(&job.knowledge_group_id, &job.process_id)
            .await?;
        Ok(())
    }

    async fn on_failed(&self, job: &JobRecord, error: &SyncError) -> SyncResult<()> {
        self.pipeline.on_group_failed(job, error).await
    }
}

/// Runs item jobs.
pub struct ItemJobHandler {
    pipeline: Arc<SyncPipeline>,
}

#[async_trait]
impl JobHandler for ItemJobHandler {
    async fn handle(&self, job: &JobRecord) -> SyncResult<()> {
        self.pipeline.run_item_job(job).await
    }

    async fn on_completed(&self, job: &JobRecord) -> SyncResult<()> {
        self.pipeline
            .check_completion(&job.knowledge_group_id, &job.process_id)
            .await?;
        Ok(())
    }

    async fn on_failed(&self, job: &JobRecord, error: &SyncError) -> SyncResult<()> {
        self.pipeline.on_item_failed(job, error).await
    }
}
