use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Postgres, QueryBuilder, Transaction};
use time::OffsetDateTime;

use crate::{
    application::repos::{FragmentLookup, FragmentStore, RepoError},
    domain::{
        entities::{CacheStats, EntityRef, NewCacheEntry, QueryRef, StoredQueryRef},
        types::{CacheEntryId, EntityId, EntityType},
    },
};

use super::util::convert_count;
use super::{PostgresRepositories, map_sqlx_error};

/// Rows per bulk insert; keeps bind parameters well below the protocol limit.
const INSERT_CHUNK: usize = 5_000;

#[derive(sqlx::FromRow)]
struct QueryRefRow {
    id: i64,
    cache_entry_id: i64,
    entity_type_handle: String,
    serialized_query: String,
}

impl From<QueryRefRow> for StoredQueryRef {
    fn from(row: QueryRefRow) -> Self {
        Self {
            id: row.id,
            cache_entry_id: row.cache_entry_id,
            entity_type: EntityType::from(row.entity_type_handle),
            serialized_query: row.serialized_query,
        }
    }
}

#[derive(sqlx::FromRow)]
struct StatsRow {
    live_entries: i64,
    expired_entries: i64,
    entity_refs: i64,
    query_refs: i64,
}

#[async_trait]
impl FragmentStore for PostgresRepositories {
    type Tx = Transaction<'static, Postgres>;

    async fn begin(&self) -> Result<Self::Tx, RepoError> {
        self.pool().begin().await.map_err(map_sqlx_error)
    }

    async fn commit(&self, tx: Self::Tx) -> Result<(), RepoError> {
        tx.commit().await.map_err(map_sqlx_error)
    }

    async fn rollback(&self, tx: Self::Tx) -> Result<(), RepoError> {
        tx.rollback().await.map_err(map_sqlx_error)
    }

    async fn insert_fragment(
        &self,
        tx: &mut Self::Tx,
        entry: &NewCacheEntry,
        entities: &[EntityRef],
        queries: &[QueryRef],
    ) -> Result<CacheEntryId, RepoError> {
        let id: CacheEntryId = sqlx::query_scalar(
            r#"
            INSERT INTO cache_entries (cache_key, locale, path, expires_at, body)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(&entry.cache_key)
        .bind(&entry.locale)
        .bind(entry.path.as_deref())
        .bind(entry.expires_at)
        .bind(&entry.body)
        .fetch_one(&mut **tx)
        .await
        .map_err(map_sqlx_error)?;

        for chunk in entities.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO cache_entity_refs (cache_entry_id, entity_id, entity_type) ",
            );
            qb.push_values(chunk, |mut row, entity| {
                row.push_bind(id)
                    .push_bind(entity.entity_id)
                    .push_bind(entity.entity_type.as_ref().map(|t| t.as_str().to_string()));
            });
            qb.build()
                .execute(&mut **tx)
                .await
                .map_err(map_sqlx_error)?;
        }

        for chunk in queries.chunks(INSERT_CHUNK) {
            let mut qb = QueryBuilder::<Postgres>::new(
                "INSERT INTO cache_query_refs (cache_entry_id, entity_type_handle, serialized_query) ",
            );
            qb.push_values(chunk, |mut row, query| {
                row.push_bind(id)
                    .push_bind(query.entity_type.as_str().to_string())
                    .push_bind(query.serialized_query.clone());
            });
            qb.build()
                .execute(&mut **tx)
                .await
                .map_err(map_sqlx_error)?;
        }

        Ok(id)
    }

    async fn find_body(
        &self,
        lookup: FragmentLookup<'_>,
        now: OffsetDateTime,
    ) -> Result<Option<String>, RepoError> {
        sqlx::query_scalar(
            r#"
            SELECT body
              FROM cache_entries
             WHERE cache_key = $1
               AND locale = $2
               AND expires_at > $3
               AND ($4::text IS NULL OR path = $4)
             ORDER BY id DESC
             LIMIT 1
            "#,
        )
        .bind(lookup.cache_key)
        .bind(lookup.locale)
        .bind(now)
        .bind(lookup.path)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)
    }

    async fn entry_ids_for_entities(
        &self,
        entity_ids: &[EntityId],
    ) -> Result<Vec<CacheEntryId>, RepoError> {
        if entity_ids.is_empty() {
            return Ok(Vec::new());
        }

        sqlx::query_scalar(
            r#"
            SELECT DISTINCT cache_entry_id
              FROM cache_entity_refs
             WHERE entity_id = ANY($1)
            "#,
        )
        .bind(entity_ids)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)
    }

    async fn delete_by_ids(&self, ids: &[CacheEntryId]) -> Result<u64, RepoError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let result = sqlx::query("DELETE FROM cache_entries WHERE id = ANY($1)")
            .bind(ids)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn delete_by_entity_type(&self, entity_type: &EntityType) -> Result<u64, RepoError> {
        let result = sqlx::query(
            r#"
            DELETE FROM cache_entries e
             WHERE EXISTS (
                       SELECT 1 FROM cache_entity_refs r
                        WHERE r.cache_entry_id = e.id AND r.entity_type = $1
                   )
                OR EXISTS (
                       SELECT 1 FROM cache_query_refs q
                        WHERE q.cache_entry_id = e.id AND q.entity_type_handle = $1
                   )
            "#,
        )
        .bind(entity_type.as_str())
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn delete_all(&self) -> Result<u64, RepoError> {
        let result = sqlx::query("DELETE FROM cache_entries")
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn delete_expired(&self, now: OffsetDateTime) -> Result<u64, RepoError> {
        let result = sqlx::query("DELETE FROM cache_entries WHERE expires_at <= $1")
            .bind(now)
            .execute(self.pool())
            .await
            .map_err(map_sqlx_error)?;
        Ok(result.rows_affected())
    }

    async fn claim_sweep(&self, now: OffsetDateTime, window: Duration) -> Result<bool, RepoError> {
        let window = time::Duration::try_from(window).unwrap_or(time::Duration::MAX);
        let threshold = now.saturating_sub(window);

        // The upsert only touches the marker when it is older than the window;
        // concurrent claimers serialize on the row lock and only one wins.
        let claimed: Option<i16> = sqlx::query_scalar(
            r#"
            INSERT INTO cache_sweeps (id, last_swept_at)
            VALUES (1, $1)
            ON CONFLICT (id) DO UPDATE
                SET last_swept_at = EXCLUDED.last_swept_at
              WHERE cache_sweeps.last_swept_at <= $2
            RETURNING id
            "#,
        )
        .bind(now)
        .bind(threshold)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(claimed.is_some())
    }

    async fn query_refs(&self, now: OffsetDateTime) -> Result<Vec<StoredQueryRef>, RepoError> {
        let rows = sqlx::query_as::<_, QueryRefRow>(
            r#"
            SELECT q.id,
                   q.cache_entry_id,
                   q.entity_type_handle,
                   q.serialized_query
              FROM cache_query_refs q
              JOIN cache_entries e ON e.id = q.cache_entry_id
             WHERE e.expires_at > $1
             ORDER BY q.id
            "#,
        )
        .bind(now)
        .fetch_all(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(rows.into_iter().map(StoredQueryRef::from).collect())
    }

    async fn stats(&self, now: OffsetDateTime) -> Result<CacheStats, RepoError> {
        let row = sqlx::query_as::<_, StatsRow>(
            r#"
            SELECT COUNT(*) FILTER (WHERE expires_at > $1)  AS live_entries,
                   COUNT(*) FILTER (WHERE expires_at <= $1) AS expired_entries,
                   (SELECT COUNT(*) FROM cache_entity_refs) AS entity_refs,
                   (SELECT COUNT(*) FROM cache_query_refs)  AS query_refs
              FROM cache_entries
            "#,
        )
        .bind(now)
        .fetch_one(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(CacheStats {
            live_entries: convert_count(row.live_entries)?,
            expired_entries: convert_count(row.expired_entries)?,
            entity_refs: convert_count(row.entity_refs)?,
            query_refs: convert_count(row.query_refs)?,
        })
    }
}
