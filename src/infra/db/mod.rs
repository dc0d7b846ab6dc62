//! Postgres-backed repository implementations.

mod fragments;
mod jobs;
mod util;

pub use util::map_sqlx_error;

use std::sync::Arc;

use apalis_sql::postgres::PostgresStorage;
use sqlx::{
    Postgres, Transaction,
    postgres::{PgPool, PgPoolOptions},
    query,
};
use tracing::info;

use crate::infra::error::InfraError;

#[derive(Clone)]
pub struct PostgresRepositories {
    pool: Arc<PgPool>,
}

impl PostgresRepositories {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, sqlx::Error> {
        self.pool.begin().await
    }

    pub async fn connect(url: &str, max_connections: u32) -> Result<PgPool, sqlx::Error> {
        PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
    }

    /// Install the job queue schema, then the fragment cache tables.
    ///
    /// Both migrators share `_sqlx_migrations`, so each ignores the other's
    /// applied versions.
    pub async fn run_migrations(pool: &PgPool) -> Result<(), InfraError> {
        let mut queue = PostgresStorage::migrations();
        queue.set_ignore_missing(true);
        queue.run(pool).await?;

        let mut cache = sqlx::migrate!("./migrations");
        cache.set_ignore_missing(true);
        cache.run(pool).await?;

        info!("Database migrations applied");
        Ok(())
    }

    pub async fn health_check(&self) -> Result<(), sqlx::Error> {
        query("SELECT 1").execute(self.pool()).await.map(|_| ())
    }
}
