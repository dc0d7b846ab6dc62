//! Repository traits describing persistence adapters and host collaborators.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use time::OffsetDateTime;

use crate::domain::entities::{CacheStats, EntityRef, NewCacheEntry, QueryRef, StoredQueryRef};
use crate::domain::query::EntityQuery;
use crate::domain::types::{CacheEntryId, EntityId, EntityType};

#[derive(Debug, Error)]
pub enum RepoError {
    #[error("persistence error: {0}")]
    Persistence(String),
    #[error("resource not found")]
    NotFound,
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("integrity error: {message}")]
    Integrity { message: String },
    #[error("database timeout")]
    Timeout,
}

impl RepoError {
    pub fn from_persistence(err: impl std::fmt::Display) -> Self {
        Self::Persistence(err.to_string())
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }
}

/// Lookup coordinates for a cached fragment.
#[derive(Debug, Clone, Copy)]
pub struct FragmentLookup<'a> {
    pub cache_key: &'a str,
    pub locale: &'a str,
    /// `None` matches rows regardless of their path (global lookup).
    pub path: Option<&'a str>,
}

/// Durable storage of fragments and their dependency references.
///
/// Writes go through a transaction handle so callers can fold a fragment
/// write into a larger unit of work. Deletes cascade to both reference
/// relations and report the number of fragments removed.
#[async_trait]
pub trait FragmentStore: Send + Sync {
    type Tx: Send + 'static;

    async fn begin(&self) -> Result<Self::Tx, RepoError>;

    async fn commit(&self, tx: Self::Tx) -> Result<(), RepoError>;

    async fn rollback(&self, tx: Self::Tx) -> Result<(), RepoError>;

    /// Insert the entry row, then bulk-insert its references.
    async fn insert_fragment(
        &self,
        tx: &mut Self::Tx,
        entry: &NewCacheEntry,
        entities: &[EntityRef],
        queries: &[QueryRef],
    ) -> Result<CacheEntryId, RepoError>;

    /// Body of the newest live fragment matching the lookup.
    async fn find_body(
        &self,
        lookup: FragmentLookup<'_>,
        now: OffsetDateTime,
    ) -> Result<Option<String>, RepoError>;

    /// Ids of fragments that reference any of the given entities.
    async fn entry_ids_for_entities(
        &self,
        entity_ids: &[EntityId],
    ) -> Result<Vec<CacheEntryId>, RepoError>;

    async fn delete_by_ids(&self, ids: &[CacheEntryId]) -> Result<u64, RepoError>;

    /// Delete every fragment with an entity or query reference of this type.
    async fn delete_by_entity_type(&self, entity_type: &EntityType) -> Result<u64, RepoError>;

    async fn delete_all(&self) -> Result<u64, RepoError>;

    async fn delete_expired(&self, now: OffsetDateTime) -> Result<u64, RepoError>;

    /// Atomically claim the shared sweep marker.
    ///
    /// Returns `true` and stamps the marker with `now` when no sweep happened
    /// within `window`; returns `false` otherwise.
    async fn claim_sweep(&self, now: OffsetDateTime, window: Duration) -> Result<bool, RepoError>;

    /// Query references owned by fragments that have not expired.
    async fn query_refs(&self, now: OffsetDateTime) -> Result<Vec<StoredQueryRef>, RepoError>;

    async fn stats(&self, now: OffsetDateTime) -> Result<CacheStats, RepoError>;
}

/// Payload of the deferred requery job: the set of changed entity ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequeryPayload {
    #[serde(default)]
    pub entity_ids: BTreeSet<EntityId>,
}

impl RequeryPayload {
    pub fn new(entity_ids: impl IntoIterator<Item = EntityId>) -> Self {
        Self {
            entity_ids: entity_ids.into_iter().collect(),
        }
    }

    /// Merge ids into the payload, returning how many were new.
    pub fn merge(&mut self, entity_ids: impl IntoIterator<Item = EntityId>) -> usize {
        let before = self.entity_ids.len();
        self.entity_ids.extend(entity_ids);
        self.entity_ids.len() - before
    }

    pub fn is_empty(&self) -> bool {
        self.entity_ids.is_empty()
    }
}

/// A requery job taken off the queue for execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequery {
    pub id: String,
    pub payload: RequeryPayload,
}

/// Queue holding at most one pending requery job.
#[async_trait]
pub trait RequeryQueue: Send + Sync {
    /// Merge ids into the pending job, or enqueue a new one. Returns the job id.
    async fn enqueue_or_merge(&self, entity_ids: &BTreeSet<EntityId>) -> Result<String, RepoError>;

    /// Snapshot of the pending job without claiming it.
    async fn pending(&self) -> Result<Option<PendingRequery>, RepoError>;

    /// Claim the pending job for execution.
    async fn take_pending(&self) -> Result<Option<PendingRequery>, RepoError>;

    /// Record the outcome of a claimed job.
    async fn complete(&self, id: &str, error: Option<String>) -> Result<(), RepoError>;
}

/// Host-side evaluation of saved queries.
#[async_trait]
pub trait QueryResolver: Send + Sync {
    /// Ids of the entities currently matching `query`.
    async fn resolve_ids(&self, query: &EntityQuery) -> Result<Vec<EntityId>, RepoError>;
}
