//! Collaborators consumed by the pipeline: the content reconciler that
//! stores fetched pages, and the credit gate consulted before each unit of
//! work.
//!
//! [`SqliteContentStore`] is the built-in reconciler. It keeps one document
//! per scrape item, skips pages whose `(url, title, text)` hash is unchanged,
//! and otherwise replaces the document's chunks in a single transaction.

use async_trait::async_trait;
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use std::collections::HashSet;
use uuid::Uuid;

use crate::chunk::chunk_document;
use crate::error::{SyncError, SyncResult};
use crate::models::{Chunk, KnowledgeGroup, ScrapeItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Created { chunks: usize },
    Updated { chunks: usize },
    /// Stored content already matches the page.
    Skipped,
}

/// Stores fetched pages. Failures surface as [`SyncError::Upsert`].
///
/// A reconciler that bills per stored page returns
/// [`SyncError::InsufficientCredits`] once the user's balance is spent; the
/// pipeline then releases the item instead of failing it.
#[async_trait]
pub trait ContentReconciler: Send + Sync {
    async fn upsert_item(
        &self,
        scrape: &ScrapeItem,
        group: &KnowledgeGroup,
        url: &str,
        title: &str,
        text: &str,
    ) -> SyncResult<UpsertOutcome>;

    /// Drop stored content of removed scrape items. Returns documents removed.
    async fn remove_items(&self, scrape_item_ids: &[String]) -> SyncResult<u64>;
}

/// Answers whether a user may spend credits on more sync work.
#[async_trait]
pub trait CreditGate: Send + Sync {
    async fn has_credits(&self, user_id: &str) -> SyncResult<bool>;
}

/// Credit gate backed by the `[credits]` config section.
pub struct StaticCreditGate {
    exhausted: HashSet<String>,
}

impl StaticCreditGate {
    pub fn new(exhausted_users: impl IntoIterator<Item = String>) -> Self {
        Self {
            exhausted: exhausted_users.into_iter().collect(),
        }
    }

    /// Every user has credits.
    pub fn unlimited() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl CreditGate for StaticCreditGate {
    async fn has_credits(&self, user_id: &str) -> SyncResult<bool> {
        Ok(!self.exhausted.contains(user_id))
    }
}

/// SQLite reconciler writing `documents` and `chunks`.
#[derive(Clone)]
pub struct SqliteContentStore {
    pool: SqlitePool,
    chunk_size: usize,
}

impl SqliteContentStore {
    pub fn new(pool: SqlitePool, chunk_size: usize) -> Self {
        Self { pool, chunk_size }
    }

    pub async fn chunks_for_item(&self, scrape_item_id: &str) -> SyncResult<Vec<String>> {
        let texts: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT c.text FROM chunks c
            JOIN documents d ON d.id = c.document_id
            WHERE d.scrape_item_id = ?
            ORDER BY c.chunk_index
            "#,
        )
        .bind(scrape_item_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(texts)
    }

    pub async fn document_count(&self, knowledge_group_id: &str) -> SyncResult<i64> {
        let n: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE knowledge_group_id = ?")
                .bind(knowledge_group_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(n)
    }

    async fn write(
        &self,
        scrape: &ScrapeItem,
        group: &KnowledgeGroup,
        url: &str,
        title: &str,
        text: &str,
    ) -> SyncResult<UpsertOutcome> {
        let dedup_hash = dedup_hash(url, title, text);

        let existing: Option<(String, String)> =
            sqlx::query_as("SELECT id, dedup_hash FROM documents WHERE scrape_item_id = ?")
                .bind(&scrape.id)
                .fetch_optional(&self.pool)
                .await
                .map_err(upsert_err)?;

        if let Some((_, hash)) = &existing {
            if *hash == dedup_hash {
                return Ok(UpsertOutcome::Skipped);
            }
        }
        let created = existing.is_none();
        let doc_id = existing
            .map(|(id, _)| id)
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        // Titles prefaced on every chunk must leave most of the room for content.
        let preface = (!title.is_empty() && title.chars().count() * 4 < self.chunk_size)
            .then_some(title);
        let chunks = chunk_document(&doc_id, text, self.chunk_size, preface)
            .map_err(|e| SyncError::content(format!("{}: {}", url, e)))?;

        let mut tx = self.pool.begin().await.map_err(upsert_err)?;
        sqlx::query(
            r#"
            INSERT INTO documents (id, knowledge_group_id, scrape_item_id, url, title, body, dedup_hash, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(scrape_item_id) DO UPDATE SET
                url = excluded.url,
                title = excluded.title,
                body = excluded.body,
                dedup_hash = excluded.dedup_hash,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&doc_id)
        .bind(&group.id)
        .bind(&scrape.id)
        .bind(url)
        .bind(title)
        .bind(text)
        .bind(&dedup_hash)
        .bind(Utc::now().timestamp())
        .execute(&mut *tx)
        .await
        .map_err(upsert_err)?;

        replace_chunks(&mut tx, &doc_id, &chunks)
            .await
            .map_err(upsert_err)?;
        tx.commit().await.map_err(upsert_err)?;

        Ok(if created {
            UpsertOutcome::Created {
                chunks: chunks.len(),
            }
        } else {
            UpsertOutcome::Updated {
                chunks: chunks.len(),
            }
        })
    }
}

#[async_trait]
impl ContentReconciler for SqliteContentStore {
    async fn upsert_item(
        &self,
        scrape: &ScrapeItem,
        group: &KnowledgeGroup,
        url: &str,
        title: &str,
        text: &str,
    ) -> SyncResult<UpsertOutcome> {
        self.write(scrape, group, url, title, text).await
    }

    async fn remove_items(&self, scrape_item_ids: &[String]) -> SyncResult<u64> {
        let mut removed = 0;
        let mut tx = self.pool.begin().await.map_err(upsert_err)?;
        for id in scrape_item_ids {
            sqlx::query(
                "DELETE FROM chunks WHERE document_id IN (SELECT id FROM documents WHERE scrape_item_id = ?)",
            )
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(upsert_err)?;
            removed += sqlx::query("DELETE FROM documents WHERE scrape_item_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(upsert_err)?
                .rows_affected();
        }
        tx.commit().await.map_err(upsert_err)?;
        Ok(removed)
    }
}

fn upsert_err(e: sqlx::Error) -> SyncError {
    SyncError::Upsert(e.to_string())
}

fn dedup_hash(url: &str, title: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update([0u8]);
    hasher.update(title.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    hex::encode(hasher.finalize())
}

async fn replace_chunks(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    document_id: &str,
    chunks: &[Chunk],
) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM chunks WHERE document_id = ?")
        .bind(document_id)
        .execute(&mut **tx)
        .await?;

    for chunk in chunks {
        sqlx::query(
            "INSERT INTO chunks (id, document_id, chunk_index, text, hash) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&chunk.id)
        .bind(&chunk.document_id)
        .bind(chunk.chunk_index)
        .bind(&chunk.text)
        .bind(&chunk.hash)
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migrate::migrate_pool;
    use crate::models::{GroupType, ItemRef, NewKnowledgeGroup};
    use crate::repo::KnowledgeRepo;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn setup() -> (SqliteContentStore, KnowledgeGroup, ScrapeItem) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        migrate_pool(&pool).await.unwrap();
        let repo = KnowledgeRepo::new(pool.clone());
        let group = repo
            .create_group(&NewKnowledgeGroup::new("u1", "Docs", GroupType::Web))
            .await
            .unwrap();
        let item = repo
            .upsert_discovered_item(&group.id, "p1", &ItemRef::new("https://e.com/a"), true)
            .await
            .unwrap();
        (SqliteContentStore::new(pool, 40), group, item)
    }

    #[tokio::test]
    async fn test_create_skip_update() {
        let (store, group, item) = setup().await;
        let url = "https://e.com/a";

        let first = store
            .upsert_item(&item, &group, url, "A", "# A\n\nhello")
            .await
            .unwrap();
        assert!(matches!(first, UpsertOutcome::Created { .. }));

        let again = store
            .upsert_item(&item, &group, url, "A", "# A\n\nhello")
            .await
            .unwrap();
        assert_eq!(again, UpsertOutcome::Skipped);

        let changed = store
            .upsert_item(&item, &group, url, "A", "# A\n\nhello again")
            .await
            .unwrap();
        assert!(matches!(changed, UpsertOutcome::Updated { .. }));
        assert_eq!(store.document_count(&group.id).await.unwrap(), 1);

        let chunks = store.chunks_for_item(&item.id).await.unwrap();
        assert!(chunks.iter().all(|c| c.chars().count() <= 40));
        assert!(chunks[0].starts_with("A\n"));
    }

    #[tokio::test]
    async fn test_remove_items_drops_chunks() {
        let (store, group, item) = setup().await;
        store
            .upsert_item(&item, &group, "https://e.com/a", "A", "body")
            .await
            .unwrap();
        assert_eq!(store.remove_items(&[item.id.clone()]).await.unwrap(), 1);
        assert!(store.chunks_for_item(&item.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_static_credit_gate() {
        let gate = StaticCreditGate::new(vec!["broke".to_string()]);
        assert!(gate.has_credits("u1").await.unwrap());
        assert!(!gate.has_credits("broke").await.unwrap());
    }
}
