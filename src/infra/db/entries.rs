use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, QueryBuilder};
use time::OffsetDateTime;

use crate::cache::{CacheBackend, CacheError, StoredRow};

use super::map_sqlx_error;

/// Cache rows in `cache_entries` with their tags in `cache_entry_tags`.
///
/// Tag rows reference their entry with `ON DELETE CASCADE`, so every delete
/// below removes the associations in the same statement.
#[derive(Clone)]
pub struct PostgresBackend {
    pool: Arc<PgPool>,
}

#[derive(sqlx::FromRow)]
struct EntryRow {
    content: Vec<u8>,
    expires: OffsetDateTime,
    lifetime: i64,
}

impl From<EntryRow> for StoredRow {
    fn from(row: EntryRow) -> Self {
        Self {
            content: row.content,
            expires: row.expires,
            lifetime: u64::try_from(row.lifetime).unwrap_or(0),
        }
    }
}

impl PostgresBackend {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

#[async_trait]
impl CacheBackend for PostgresBackend {
    async fn get(
        &self,
        identifier: &str,
        now: OffsetDateTime,
    ) -> Result<Option<StoredRow>, CacheError> {
        let row = sqlx::query_as::<_, EntryRow>(
            r#"
            SELECT content, expires, lifetime
            FROM cache_entries
            WHERE identifier = $1 AND expires > $2
            "#,
        )
        .bind(identifier)
        .bind(now)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(StoredRow::from))
    }

    async fn set(
        &self,
        identifier: &str,
        row: StoredRow,
        tags: &BTreeSet<String>,
    ) -> Result<(), CacheError> {
        let mut tx = self.pool().begin().await.map_err(map_sqlx_error)?;

        sqlx::query(
            r#"
            INSERT INTO cache_entries (identifier, expires, lifetime, content)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (identifier) DO UPDATE
            SET expires = EXCLUDED.expires,
                lifetime = EXCLUDED.lifetime,
                content = EXCLUDED.content
            "#,
        )
        .bind(identifier)
        .bind(row.expires)
        .bind(to_i64(row.lifetime))
        .bind(row.content)
        .execute(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        sqlx::query("DELETE FROM cache_entry_tags WHERE identifier = $1")
            .bind(identifier)
            .execute(&mut *tx)
            .await
            .map_err(map_sqlx_error)?;

        if !tags.is_empty() {
            let mut qb: QueryBuilder<Postgres> =
                QueryBuilder::new("INSERT INTO cache_entry_tags (identifier, tag) ");
            qb.push_values(tags, |mut b, tag| {
                b.push_bind(identifier).push_bind(tag);
            });
            qb.build()
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;
        }

        tx.commit().await.map_err(map_sqlx_error)
    }

    async fn remove(&self, identifier: &str) -> Result<bool, CacheError> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE identifier = $1")
            .bind(identifier)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn flush(&self) -> Result<(), CacheError> {
        sqlx::query("TRUNCATE cache_entry_tags, cache_entries")
            .execute(self.pool())
            .await
            .map(|_| ())
            .map_err(map_sqlx_error)
    }

    async fn flush_by_tags(&self, tags: &[String]) -> Result<u64, CacheError> {
        let result = sqlx::query(
            r#"
            DELETE FROM cache_entries
            WHERE identifier IN (
                SELECT identifier FROM cache_entry_tags WHERE tag = ANY($1)
            )
            "#,
        )
        .bind(tags)
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn collect_garbage(&self, now: OffsetDateTime) -> Result<u64, CacheError> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires <= $1")
            .bind(now)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn count(&self) -> Result<u64, CacheError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cache_entries")
            .fetch_one(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(to_u64(count))
    }

    async fn delete_oldest(&self, limit: u64) -> Result<u64, CacheError> {
        if limit == 0 {
            return Ok(0);
        }
        let result = sqlx::query(
            r#"
            DELETE FROM cache_entries
            WHERE identifier IN (
                SELECT identifier
                FROM cache_entries
                ORDER BY expires ASC, identifier ASC
                LIMIT $1
            )
            "#,
        )
        .bind(to_i64(limit))
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }
}
