use std::collections::BTreeSet;

use async_trait::async_trait;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::{
    application::repos::{PendingRequery, RepoError, RequeryPayload, RequeryQueue},
    domain::types::{EntityId, JobState, JobType},
};

use super::{PostgresRepositories, map_sqlx_error};

const REQUERY_MAX_ATTEMPTS: i32 = 5;
const REQUERY_PRIORITY: i32 = 0;

#[derive(sqlx::FromRow)]
struct PendingRow {
    id: String,
    job: serde_json::Value,
}

impl TryFrom<PendingRow> for PendingRequery {
    type Error = RepoError;

    fn try_from(row: PendingRow) -> Result<Self, Self::Error> {
        let payload = serde_json::from_value(row.job).map_err(|err| {
            RepoError::from_persistence(format!("invalid requery payload `{}`: {err}", row.id))
        })?;
        Ok(Self {
            id: row.id,
            payload,
        })
    }
}

/// Requery jobs live in the apalis job table under their own job type, so the
/// apalis worker and the merge logic here see the same rows.
#[async_trait]
impl RequeryQueue for PostgresRepositories {
    async fn enqueue_or_merge(&self, entity_ids: &BTreeSet<EntityId>) -> Result<String, RepoError> {
        let mut tx = self.pool().begin().await.map_err(map_sqlx_error)?;

        let pending = sqlx::query_as::<_, PendingRow>(
            r#"
            SELECT id, job
              FROM apalis.jobs
             WHERE job_type = $1
               AND status = $2
             ORDER BY run_at
             LIMIT 1
               FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(JobType::RequeryStaleCaches.as_str())
        .bind(JobState::Pending.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_sqlx_error)?;

        let id = match pending {
            Some(row) => {
                let mut job = PendingRequery::try_from(row)?;
                let added = job.payload.merge(entity_ids.iter().copied());
                let payload = serde_json::to_value(&job.payload).map_err(RepoError::from_persistence)?;

                sqlx::query("UPDATE apalis.jobs SET job = $2 WHERE id = $1")
                    .bind(&job.id)
                    .bind(payload)
                    .execute(&mut *tx)
                    .await
                    .map_err(map_sqlx_error)?;

                debug!(job_id = %job.id, added, "Merged ids into pending requery job");
                job.id
            }
            None => {
                let payload = serde_json::to_value(RequeryPayload::new(entity_ids.iter().copied()))
                    .map_err(RepoError::from_persistence)?;

                let id: String = sqlx::query_scalar(
                    r#"
                    SELECT (apalis.push_job($1, $2::json, $3, $4, $5, $6)).id
                    "#,
                )
                .bind(JobType::RequeryStaleCaches.as_str())
                .bind(payload)
                .bind(JobState::Pending.as_str())
                .bind(OffsetDateTime::now_utc())
                .bind(REQUERY_MAX_ATTEMPTS)
                .bind(REQUERY_PRIORITY)
                .fetch_one(&mut *tx)
                .await
                .map_err(map_sqlx_error)?;

                info!(job_id = %id, entity_count = entity_ids.len(), "Requery job enqueued");
                id
            }
        };

        tx.commit().await.map_err(map_sqlx_error)?;
        Ok(id)
    }

    async fn pending(&self) -> Result<Option<PendingRequery>, RepoError> {
        let row = sqlx::query_as::<_, PendingRow>(
            r#"
            SELECT id, job
              FROM apalis.jobs
             WHERE job_type = $1
               AND status = $2
             ORDER BY run_at
             LIMIT 1
            "#,
        )
        .bind(JobType::RequeryStaleCaches.as_str())
        .bind(JobState::Pending.as_str())
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        row.map(PendingRequery::try_from).transpose()
    }

    async fn take_pending(&self) -> Result<Option<PendingRequery>, RepoError> {
        // lock_by stays NULL: it references registered apalis workers.
        let row = sqlx::query_as::<_, PendingRow>(
            r#"
            UPDATE apalis.jobs
               SET status = $3,
                   lock_at = now(),
                   attempts = attempts + 1
             WHERE id = (
                       SELECT id
                         FROM apalis.jobs
                        WHERE job_type = $1
                          AND status = $2
                        ORDER BY run_at
                        LIMIT 1
                          FOR UPDATE SKIP LOCKED
                   )
            RETURNING id, job
            "#,
        )
        .bind(JobType::RequeryStaleCaches.as_str())
        .bind(JobState::Pending.as_str())
        .bind(JobState::Running.as_str())
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        row.map(PendingRequery::try_from).transpose()
    }

    async fn complete(&self, id: &str, error: Option<String>) -> Result<(), RepoError> {
        let state = if error.is_some() {
            JobState::Failed
        } else {
            JobState::Done
        };

        let result = sqlx::query(
            r#"
            UPDATE apalis.jobs
               SET status = $3,
                   last_error = $4,
                   done_at = now()
             WHERE id = $1
               AND job_type = $2
            "#,
        )
        .bind(id)
        .bind(JobType::RequeryStaleCaches.as_str())
        .bind(state.as_str())
        .bind(error.as_deref())
        .execute(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        if result.rows_affected() == 0 {
            return Err(RepoError::NotFound);
        }
        Ok(())
    }
}
