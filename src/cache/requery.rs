//! Deferred re-evaluation of saved queries.
//!
//! Entity changes are funnelled into a single pending job whose payload is the
//! set of changed ids. Scheduling while that job is still pending merges the
//! new ids into it, so a burst of edits costs one requery run.

use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info};

use crate::application::repos::{
    PendingRequery, QueryResolver, RepoError, RequeryPayload, RequeryQueue,
};
use crate::domain::query::EntityQuery;
use crate::domain::types::EntityId;

use super::lock::mutex_lock;

const SOURCE: &str = "cache::requery";

/// Front door of the requery queue used by the invalidation engine.
#[derive(Clone)]
pub struct RequeryCoordinator {
    queue: Arc<dyn RequeryQueue>,
}

impl RequeryCoordinator {
    pub fn new(queue: Arc<dyn RequeryQueue>) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &Arc<dyn RequeryQueue> {
        &self.queue
    }

    /// Schedule a requery for `entity_ids`, merging into a pending job.
    pub async fn schedule(&self, entity_ids: &[EntityId]) -> Result<Option<String>, RepoError> {
        if entity_ids.is_empty() {
            return Ok(None);
        }

        let ids: BTreeSet<EntityId> = entity_ids.iter().copied().collect();
        let job_id = self.queue.enqueue_or_merge(&ids).await?;
        debug!(job_id = %job_id, entity_count = ids.len(), "Requery scheduled");
        Ok(Some(job_id))
    }
}

#[derive(Debug, Default)]
struct QueueState {
    pending: Option<PendingRequery>,
    running: HashMap<String, RequeryPayload>,
    finished: Vec<(String, Option<String>)>,
}

/// In-process requery queue for embedding and tests.
pub struct MemoryRequeryQueue {
    state: Mutex<QueueState>,
    job_counter: AtomicU64,
}

impl MemoryRequeryQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            job_counter: AtomicU64::new(0),
        }
    }

    fn next_job_id(&self) -> String {
        format!("requery-{}", self.job_counter.fetch_add(1, Ordering::SeqCst))
    }

    /// Jobs that completed, with their error message when they failed.
    pub fn finished(&self) -> Vec<(String, Option<String>)> {
        mutex_lock(&self.state, SOURCE, "finished").finished.clone()
    }

    pub fn running_len(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "running_len").running.len()
    }
}

impl Default for MemoryRequeryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RequeryQueue for MemoryRequeryQueue {
    async fn enqueue_or_merge(&self, entity_ids: &BTreeSet<EntityId>) -> Result<String, RepoError> {
        let mut state = mutex_lock(&self.state, SOURCE, "enqueue_or_merge");

        if let Some(pending) = state.pending.as_mut() {
            let added = pending.payload.merge(entity_ids.iter().copied());
            debug!(job_id = %pending.id, added, "Merged ids into pending requery job");
            return Ok(pending.id.clone());
        }

        let id = self.next_job_id();
        info!(job_id = %id, entity_count = entity_ids.len(), "Requery job enqueued");
        state.pending = Some(PendingRequery {
            id: id.clone(),
            payload: RequeryPayload::new(entity_ids.iter().copied()),
        });
        Ok(id)
    }

    async fn pending(&self) -> Result<Option<PendingRequery>, RepoError> {
        Ok(mutex_lock(&self.state, SOURCE, "pending").pending.clone())
    }

    async fn take_pending(&self) -> Result<Option<PendingRequery>, RepoError> {
        let mut state = mutex_lock(&self.state, SOURCE, "take_pending");
        let Some(job) = state.pending.take() else {
            return Ok(None);
        };
        state.running.insert(job.id.clone(), job.payload.clone());
        Ok(Some(job))
    }

    async fn complete(&self, id: &str, error: Option<String>) -> Result<(), RepoError> {
        let mut state = mutex_lock(&self.state, SOURCE, "complete");
        if state.running.remove(id).is_none() {
            return Err(RepoError::NotFound);
        }
        state.finished.push((id.to_string(), error));
        Ok(())
    }
}

/// Resolver used when no host resolver is plugged in.
///
/// It cannot evaluate criteria, so it reports every id a query was narrowed
/// to as matching. Requery runs then invalidate every query-tagged fragment
/// they inspect, which errs on the side of freshness.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConservativeResolver;

#[async_trait]
impl QueryResolver for ConservativeResolver {
    async fn resolve_ids(&self, query: &EntityQuery) -> Result<Vec<EntityId>, RepoError> {
        Ok(query
            .restricted_ids()
            .map(|ids| ids.into_iter().collect())
            .unwrap_or_default())
    }
}
