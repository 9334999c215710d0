//! Durable job queues backed by the `jobs` table.
//!
//! Two named queues share one table: `group` (discovery) and `item`
//! (content fetch). Delivery is at-least-once: a job is claimed by flipping
//! it to `active` in a single statement, and a crashed worker's `active`
//! jobs are put back to `waiting` by [`JobQueue::recover_stalled`].
//!
//! ```text
//!  add ──▶ waiting ──claim──▶ active ──complete──▶ completed
//!             ▲                  │
//!             │ run_at reached   │ fail (retryable, attempts left)
//!          delayed ◀─────────────┤
//!                                └─ fail (final) ──▶ failed
//! ```
//!
//! Retry delay grows exponentially: `backoff_ms * 2^(attempt - 1)`.
//!
//! Settled rows are pruned as they settle: each queue keeps only the newest
//! `keep_completed` completed and `keep_failed` failed jobs. Claim order
//! comes from the `seq` row id.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::config::QueueConfig;
use crate::error::{SyncError, SyncResult};

const JOB_COLUMNS: &str = "id, queue, status, process_id, knowledge_group_id, payload_json, \
     attempts, max_attempts, backoff_ms, run_at, last_error";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    Group,
    Item,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Group => "group",
            QueueName::Item => "item",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Delayed => "delayed",
            JobStatus::Active => "active",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "delayed" => JobStatus::Delayed,
            "active" => JobStatus::Active,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Waiting,
        }
    }
}

/// A job row as stored in the queue.
#[derive(Debug, Clone)]
pub struct JobRecord {
    pub id: String,
    pub queue: QueueName,
    pub status: JobStatus,
    pub process_id: String,
    pub knowledge_group_id: String,
    pub payload_json: String,
    /// Attempts started so far, including the current one once claimed.
    pub attempts: u32,
    pub max_attempts: u32,
    pub backoff_ms: u64,
    /// Earliest claim time, epoch milliseconds.
    pub run_at: i64,
    pub last_error: Option<String>,
}

impl JobRecord {
    /// Decode the payload. Unknown fields are ignored by the payload types.
    pub fn payload_as<T: DeserializeOwned>(&self) -> SyncResult<T> {
        Ok(serde_json::from_str(&self.payload_json)?)
    }
}

/// Retry policy applied to every job added to a queue.
#[derive(Debug, Clone, Copy)]
pub struct JobOptions {
    pub attempts: u32,
    pub backoff_ms: u64,
    pub keep_completed: u32,
    pub keep_failed: u32,
}

impl From<&QueueConfig> for JobOptions {
    fn from(cfg: &QueueConfig) -> Self {
        Self {
            attempts: cfg.attempts,
            backoff_ms: cfg.backoff_ms,
            keep_completed: cfg.keep_completed,
            keep_failed: cfg.keep_failed,
        }
    }
}

impl Default for JobOptions {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

/// What [`JobQueue::fail`] did with a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Rescheduled as `delayed`.
    Retrying { delay_ms: u64 },
    /// Settled as `failed`; no further attempts.
    Exhausted,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: i64,
    pub delayed: i64,
    pub active: i64,
    pub completed: i64,
    pub failed: i64,
}

/// One named queue over the shared `jobs` table.
#[derive(Clone)]
pub struct JobQueue {
    pool: SqlitePool,
    name: QueueName,
    options: JobOptions,
}

impl JobQueue {
    pub fn new(pool: SqlitePool, name: QueueName, options: JobOptions) -> Self {
        Self {
            pool,
            name,
            options,
        }
    }

    pub fn name(&self) -> QueueName {
        self.name
    }

    /// Enqueue a job. Jobs are claimed in insertion order among those due.
    pub async fn add<T: Serialize>(
        &self,
        process_id: &str,
        knowledge_group_id: &str,
        payload: &T,
    ) -> SyncResult<String> {
        let id = Uuid::new_v4().to_string();
        let now_ms = Utc::now().timestamp_millis();
        sqlx::query(
            r#"
            INSERT INTO jobs (id, queue, status, process_id, knowledge_group_id, payload_json,
                              attempts, max_attempts, backoff_ms, run_at, created_at)
            VALUES (?, ?, 'waiting', ?, ?, ?, 0, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(self.name.as_str())
        .bind(process_id)
        .bind(knowledge_group_id)
        .bind(serde_json::to_string(payload)?)
        .bind(self.options.attempts as i64)
        .bind(self.options.backoff_ms as i64)
        .bind(now_ms)
        .bind(now_ms)
        .execute(&self.pool)
        .await?;
        Ok(id)
    }

    /// Claim the next due job, if any.
    pub async fn claim(&self) -> SyncResult<Option<JobRecord>> {
        self.claim_at(Utc::now().timestamp_millis()).await
    }

    /// Claim the oldest job that is due at `now_ms`, flipping it to `active`.
    pub async fn claim_at(&self, now_ms: i64) -> SyncResult<Option<JobRecord>> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE jobs SET status = 'active', attempts = attempts + 1
            WHERE id = (
                SELECT id FROM jobs
                WHERE queue = ? AND status IN ('waiting', 'delayed') AND run_at <= ?
                ORDER BY run_at, seq
                LIMIT 1
            )
            RETURNING {}
            "#,
            JOB_COLUMNS
        ))
        .bind(self.name.as_str())
        .bind(now_ms)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(row_to_job))
    }

    pub async fn complete(&self, job_id: &str) -> SyncResult<()> {
        sqlx::query(
            "UPDATE jobs SET status = 'completed', last_error = NULL, finished_at = ? WHERE id = ?",
        )
        .bind(Utc::now().timestamp_millis())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        self.prune(JobStatus::Completed, self.options.keep_completed)
            .await?;
        Ok(())
    }

    /// Record a failed attempt.
    ///
    /// Non-retryable errors and the last permitted attempt settle the job as
    /// `failed`; anything else is rescheduled with exponential backoff.
    pub async fn fail(&self, job: &JobRecord, error: &SyncError) -> SyncResult<FailOutcome> {
        let now_ms = Utc::now().timestamp_millis();
        let message = error.to_string();

        if !error.is_retryable() || job.attempts >= job.max_attempts {
            sqlx::query(
                "UPDATE jobs SET status = 'failed', last_error = ?, finished_at = ? WHERE id = ?",
            )
            .bind(&message)
            .bind(now_ms)
            .bind(&job.id)
            .execute(&self.pool)
            .await?;
            self.prune(JobStatus::Failed, self.options.keep_failed)
                .await?;
            return Ok(FailOutcome::Exhausted);
        }

        let delay_ms = backoff_delay(job.backoff_ms, job.attempts);
        sqlx::query("UPDATE jobs SET status = 'delayed', last_error = ?, run_at = ? WHERE id = ?")
            .bind(&message)
            .bind(now_ms.saturating_add(delay_ms as i64))
            .bind(&job.id)
            .execute(&self.pool)
            .await?;
        Ok(FailOutcome::Retrying { delay_ms })
    }

    /// Delete settled jobs in `status` beyond the newest `keep`.
    async fn prune(&self, status: JobStatus, keep: u32) -> SyncResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM jobs
            WHERE queue = ? AND status = ? AND seq NOT IN (
                SELECT seq FROM jobs WHERE queue = ? AND status = ?
                ORDER BY seq DESC
                LIMIT ?
            )
            "#,
        )
        .bind(self.name.as_str())
        .bind(status.as_str())
        .bind(self.name.as_str())
        .bind(status.as_str())
        .bind(keep as i64)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Delete not-yet-running jobs of a group. In-flight jobs are left alone.
    pub async fn remove_pending_for_group(&self, knowledge_group_id: &str) -> SyncResult<u64> {
        let result = sqlx::query(
            "DELETE FROM jobs WHERE queue = ? AND knowledge_group_id = ? AND status IN ('waiting', 'delayed')",
        )
        .bind(self.name.as_str())
        .bind(knowledge_group_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Return jobs left `active` by a dead worker to `waiting`.
    pub async fn recover_stalled(&self) -> SyncResult<u64> {
        let result =
            sqlx::query("UPDATE jobs SET status = 'waiting' WHERE queue = ? AND status = 'active'")
                .bind(self.name.as_str())
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    /// Unfinished (`waiting`, `delayed`, `active`) jobs of a group.
    pub async fn pending_for_group(&self, knowledge_group_id: &str) -> SyncResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM jobs WHERE queue = ? AND knowledge_group_id = ? AND status IN ('waiting', 'delayed', 'active')",
        )
        .bind(self.name.as_str())
        .bind(knowledge_group_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// All jobs of a group on this queue, oldest first.
    pub async fn jobs_for_group(&self, knowledge_group_id: &str) -> SyncResult<Vec<JobRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM jobs WHERE queue = ? AND knowledge_group_id = ? ORDER BY seq",
            JOB_COLUMNS
        ))
        .bind(self.name.as_str())
        .bind(knowledge_group_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_job).collect())
    }

    pub async fn counts(&self) -> SyncResult<QueueCounts> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs WHERE queue = ? GROUP BY status")
            .bind(self.name.as_str())
            .fetch_all(&self.pool)
            .await?;

        let mut counts = QueueCounts::default();
        for row in &rows {
            let n: i64 = row.get("n");
            match JobStatus::parse(&row.get::<String, _>("status")) {
                JobStatus::Waiting => counts.waiting = n,
                JobStatus::Delayed => counts.delayed = n,
                JobStatus::Active => counts.active = n,
                JobStatus::Completed => counts.completed = n,
                JobStatus::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }
}

fn backoff_delay(base_ms: u64, attempt: u32) -> u64 {
    let exp = attempt.saturating_sub(1).min(30);
    base_ms.saturating_mul(1u64 << exp)
}

fn row_to_job(row: &SqliteRow) -> JobRecord {
    let queue = match row.get::<String, _>("queue").as_str() {
        "group" => QueueName::Group,
        _ => QueueName::Item,
    };
    JobRecord {
        id: row.get("id"),
        queue,
        status: JobStatus::parse(&row.get::<String, _>("status")),
        process_id: row.get("process_id"),
        knowledge_group_id: row.get("knowledge_group_id"),
        payload_json: row.get("payload_json"),
        attempts: row.get::<i64, _>("attempts") as u32,
        max_attempts: row.get::<i64, _>("max_attempts") as u32,
        backoff_ms: row.get::<i64, _>("backoff_ms") as u64,
        run_at: row.get("run_at"),
        last_error: row.get("last_error"),
    }
}
