//! Knowledge Group and Scrape Item repository.
//!
//! The scrape item table is the single source of truth for "is more work
//! outstanding for this group". Every status / `will_update` write is a
//! single statement, and the `done` transition is a conditional update that
//! re-checks outstanding work in the same statement, so it cannot interleave
//! with an item write.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::models::{
    GroupStatus, ItemRef, ItemStatus, KnowledgeGroup, NewKnowledgeGroup, ScrapeItem,
    UpdateFrequency,
};

const GROUP_COLUMNS: &str = "id, user_id, title, type, status, update_process_id, next_update_at, \
     update_frequency, url, urls_json, skip_page_regex, allowed_github_issue_states, \
     linear_skip_issue_statuses, credential, remove_stale_pages";

const ITEM_COLUMNS: &str = "id, knowledge_group_id, url, source_page_id, title, status, \
     will_update, error, last_process_id, updated_at";

/// SQLite-backed repository for groups and their scrape items.
#[derive(Clone)]
pub struct KnowledgeRepo {
    pool: SqlitePool,
}

impl KnowledgeRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ============ Groups ============

    pub async fn create_group(&self, new: &NewKnowledgeGroup) -> SyncResult<KnowledgeGroup> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();
        let next_update_at = new
            .update_frequency
            .next_after(Utc::now())
            .map(|t| t.timestamp());

        sqlx::query(
            r#"
            INSERT INTO knowledge_groups (id, user_id, title, type, status, next_update_at,
                update_frequency, url, urls_json, skip_page_regex, allowed_github_issue_states,
                linear_skip_issue_statuses, credential, remove_stale_pages, created_at, updated_at)
            VALUES (?, ?, ?, ?, 'pending', ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&new.user_id)
        .bind(&new.title)
        .bind(new.group_type.as_str())
        .bind(next_update_at)
        .bind(new.update_frequency.as_str())
        .bind(&new.url)
        .bind(serde_json::to_string(&new.urls)?)
        .bind(&new.skip_page_regex)
        .bind(&new.allowed_github_issue_states)
        .bind(&new.linear_skip_issue_statuses)
        .bind(&new.credential)
        .bind(new.remove_stale_pages)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        self.get_group(&id)
            .await?
            .ok_or_else(|| SyncError::Storage(format!("group {} vanished after insert", id)))
    }

    pub async fn get_group(&self, id: &str) -> SyncResult<Option<KnowledgeGroup>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM knowledge_groups WHERE id = ?",
            GROUP_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_group).transpose()
    }

    pub async fn list_groups(&self) -> SyncResult<Vec<KnowledgeGroup>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM knowledge_groups ORDER BY created_at",
            GROUP_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_group).collect()
    }

    /// Groups whose `next_update_at` is at or before `now`.
    ///
    /// Rows with an unknown source type are reported separately instead of
    /// failing the whole scan.
    pub async fn due_groups(
        &self,
        now: DateTime<Utc>,
    ) -> SyncResult<(Vec<KnowledgeGroup>, Vec<(String, SyncError)>)> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM knowledge_groups WHERE next_update_at IS NOT NULL AND next_update_at <= ? ORDER BY next_update_at",
            GROUP_COLUMNS
        ))
        .bind(now.timestamp())
        .fetch_all(&self.pool)
        .await?;

        let mut groups = Vec::new();
        let mut invalid = Vec::new();
        for row in &rows {
            match row_to_group(row) {
                Ok(g) => groups.push(g),
                Err(e) => invalid.push((row.get::<String, _>("id"), e)),
            }
        }
        Ok((groups, invalid))
    }

    /// Start a sync run: `status = processing`, `update_process_id = process_id`.
    pub async fn begin_sync(&self, group_id: &str, process_id: &str) -> SyncResult<bool> {
        let result = sqlx::query(
            "UPDATE knowledge_groups SET status = 'processing', update_process_id = ?, updated_at = ? WHERE id = ?",
        )
        .bind(process_id)
        .bind(Utc::now().timestamp())
        .bind(group_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn set_next_update(
        &self,
        group_id: &str,
        next: Option<DateTime<Utc>>,
    ) -> SyncResult<()> {
        sqlx::query("UPDATE knowledge_groups SET next_update_at = ? WHERE id = ?")
            .bind(next.map(|t| t.timestamp()))
            .bind(group_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_group_status(&self, group_id: &str, status: GroupStatus) -> SyncResult<()> {
        sqlx::query("UPDATE knowledge_groups SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now().timestamp())
            .bind(group_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Stop the current run: the group leaves `processing` and forgets its
    /// process id, so every outstanding job of that run reads as cancelled.
    pub async fn stop_group(&self, group_id: &str) -> SyncResult<bool> {
        let result = sqlx::query(
            "UPDATE knowledge_groups SET status = 'done', update_process_id = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(Utc::now().timestamp())
        .bind(group_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Flip `processing → done` when nothing is outstanding for the run.
    ///
    /// Outstanding means an item still flagged `will_update`, or an unfinished
    /// job on either queue for the group. Returns true only for the call
    /// that performed the transition.
    pub async fn try_mark_done(&self, group_id: &str, process_id: &str) -> SyncResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE knowledge_groups SET status = 'done', updated_at = ?
            WHERE id = ? AND status = 'processing' AND update_process_id = ?
              AND NOT EXISTS (
                  SELECT 1 FROM scrape_items WHERE knowledge_group_id = ? AND will_update = 1
              )
              AND NOT EXISTS (
                  SELECT 1 FROM jobs WHERE knowledge_group_id = ?
                    AND status IN ('waiting', 'delayed', 'active')
              )
            "#,
        )
        .bind(Utc::now().timestamp())
        .bind(group_id)
        .bind(process_id)
        .bind(group_id)
        .bind(group_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Mark the run as failed. Ignored when the group moved on to another run.
    pub async fn mark_group_error(&self, group_id: &str, process_id: &str) -> SyncResult<bool> {
        let result = sqlx::query(
            "UPDATE knowledge_groups SET status = 'error', updated_at = ? WHERE id = ? AND update_process_id = ?",
        )
        .bind(Utc::now().timestamp())
        .bind(group_id)
        .bind(process_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    // ============ Scrape items ============

    /// Record a discovered item for `process_id`, creating it if new.
    ///
    /// When `will_update` is set the item is flagged as having an item job
    /// outstanding in this run.
    pub async fn upsert_discovered_item(
        &self,
        group_id: &str,
        process_id: &str,
        item: &ItemRef,
        will_update: bool,
    ) -> SyncResult<ScrapeItem> {
        let now = Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO scrape_items (id, knowledge_group_id, url, source_page_id, title, status,
                                      will_update, last_process_id, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, 'pending', ?, ?, ?, ?)
            ON CONFLICT(knowledge_group_id, url) DO UPDATE SET
                source_page_id = COALESCE(excluded.source_page_id, scrape_items.source_page_id),
                title = COALESCE(excluded.title, scrape_items.title),
                will_update = excluded.will_update,
                last_process_id = excluded.last_process_id,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(group_id)
        .bind(&item.url)
        .bind(&item.source_page_id)
        .bind(&item.title)
        .bind(will_update)
        .bind(process_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query(&format!(
            "SELECT {} FROM scrape_items WHERE knowledge_group_id = ? AND url = ?",
            ITEM_COLUMNS
        ))
        .bind(group_id)
        .bind(&item.url)
        .fetch_one(&self.pool)
        .await?;
        Ok(row_to_item(&row))
    }

    pub async fn get_item(&self, id: &str) -> SyncResult<Option<ScrapeItem>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM scrape_items WHERE id = ?",
            ITEM_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_item))
    }

    pub async fn list_items(&self, group_id: &str) -> SyncResult<Vec<ScrapeItem>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM scrape_items WHERE knowledge_group_id = ? ORDER BY created_at, url",
            ITEM_COLUMNS
        ))
        .bind(group_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_item).collect())
    }

    pub async fn complete_item(&self, item_id: &str, title: Option<&str>) -> SyncResult<()> {
        sqlx::query(
            r#"
            UPDATE scrape_items SET status = 'done', will_update = 0, error = NULL,
                title = COALESCE(?, title), updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(title)
        .bind(Utc::now().timestamp())
        .bind(item_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn fail_item(&self, item_id: &str, error: &str) -> SyncResult<()> {
        sqlx::query(
            "UPDATE scrape_items SET status = 'failed', will_update = 0, error = ?, updated_at = ? WHERE id = ?",
        )
        .bind(error)
        .bind(Utc::now().timestamp())
        .bind(item_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Drop the outstanding flag without touching status (credit stop).
    pub async fn release_item(&self, item_id: &str) -> SyncResult<()> {
        sqlx::query("UPDATE scrape_items SET will_update = 0, updated_at = ? WHERE id = ?")
            .bind(Utc::now().timestamp())
            .bind(item_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn count_will_update(&self, group_id: &str) -> SyncResult<i64> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM scrape_items WHERE knowledge_group_id = ? AND will_update = 1",
        )
        .bind(group_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Delete never-fetched items and clear outstanding flags on the rest.
    ///
    /// Returns `(deleted, cleared)`.
    pub async fn cancel_pending_items(&self, group_id: &str) -> SyncResult<(u64, u64)> {
        let mut tx = self.pool.begin().await?;
        let deleted = sqlx::query(
            "DELETE FROM scrape_items WHERE knowledge_group_id = ? AND status = 'pending'",
        )
        .bind(group_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let cleared = sqlx::query(
            "UPDATE scrape_items SET will_update = 0, updated_at = ? WHERE knowledge_group_id = ? AND will_update = 1",
        )
        .bind(Utc::now().timestamp())
        .bind(group_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        tx.commit().await?;
        Ok((deleted, cleared))
    }

    /// Delete items not re-discovered by `process_id`. Returns their ids.
    pub async fn remove_stale_items(
        &self,
        group_id: &str,
        process_id: &str,
    ) -> SyncResult<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            DELETE FROM scrape_items
            WHERE knowledge_group_id = ? AND will_update = 0
              AND (last_process_id IS NULL OR last_process_id != ?)
            RETURNING id
            "#,
        )
        .bind(group_id)
        .bind(process_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }
}

fn split_csv(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn row_to_group(row: &SqliteRow) -> SyncResult<KnowledgeGroup> {
    let id: String = row.get("id");
    let type_str: String = row.get("type");
    let urls_json: String = row.get("urls_json");
    let next_update_at: Option<i64> = row.get("next_update_at");
    let urls = serde_json::from_str(&urls_json).map_err(|e| {
        SyncError::Storage(format!("knowledge group {} has malformed urls: {}", id, e))
    })?;

    Ok(KnowledgeGroup {
        id,
        user_id: row.get("user_id"),
        title: row.get("title"),
        group_type: type_str.parse()?,
        status: GroupStatus::parse(&row.get::<String, _>("status")),
        update_process_id: row.get("update_process_id"),
        next_update_at: next_update_at.and_then(|ts| DateTime::from_timestamp(ts, 0)),
        update_frequency: UpdateFrequency::parse(&row.get::<String, _>("update_frequency")),
        url: row.get("url"),
        urls,
        skip_page_regex: split_csv(row.get("skip_page_regex")),
        allowed_github_issue_states: split_csv(row.get("allowed_github_issue_states")),
        linear_skip_issue_statuses: split_csv(row.get("linear_skip_issue_statuses")),
        credential: row.get("credential"),
        remove_stale_pages: row.get("remove_stale_pages"),
    })
}

fn row_to_item(row: &SqliteRow) -> ScrapeItem {
    ScrapeItem {
        id: row.get("id"),
        knowledge_group_id: row.get("knowledge_group_id"),
        url: row.get("url"),
        source_page_id: row.get("source_page_id"),
        title: row.get("title"),
        status: ItemStatus::parse(&row.get::<String, _>("status")),
        will_update: row.get("will_update"),
        error: row.get("error"),
        last_process_id: row.get("last_process_id"),
        updated_at: row.get("updated_at"),
    }
}
