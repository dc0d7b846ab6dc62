//! Turning content changes into fragment deletions.
//!
//! A mutation pipeline runs one or more invalidation calls inside an
//! [`InvalidationPass`]. The pass remembers what has already been cleared so
//! later calls can skip work: once everything is gone every delete is a no-op,
//! and a type cleared wholesale is not cleared again.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use time::OffsetDateTime;
use tracing::{debug, info, instrument, warn};

use crate::application::repos::{FragmentStore, QueryResolver, RepoError, RequeryPayload};
use crate::domain::entities::EntityRef;
use crate::domain::query::EntityQuery;
use crate::domain::types::{CacheEntryId, EntityId, EntityType};

use super::config::CacheConfig;
use super::requery::RequeryCoordinator;

const METRIC_INVALIDATED: &str = "tessera_invalidated_total";
const METRIC_REQUERY_MS: &str = "tessera_requery_ms";
const METRIC_REQUERY_MALFORMED: &str = "tessera_requery_malformed_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassState {
    Fresh,
    PartiallyCleared,
    /// Terminal: the whole cache was cleared.
    FullyCleared,
}

/// Memo of one invalidation pass.
#[derive(Debug, Clone)]
pub struct InvalidationPass {
    state: PassState,
    cleared_types: HashSet<EntityType>,
    swept: bool,
}

impl InvalidationPass {
    pub fn new() -> Self {
        Self {
            state: PassState::Fresh,
            cleared_types: HashSet::new(),
            swept: false,
        }
    }

    pub fn state(&self) -> PassState {
        self.state
    }

    pub fn is_fully_cleared(&self) -> bool {
        self.state == PassState::FullyCleared
    }

    pub fn type_cleared(&self, entity_type: &EntityType) -> bool {
        self.cleared_types.contains(entity_type)
    }

    pub fn has_swept(&self) -> bool {
        self.swept
    }

    pub(crate) fn mark_swept(&mut self) {
        self.swept = true;
    }

    fn mark_partial(&mut self) {
        if self.state == PassState::Fresh {
            self.state = PassState::PartiallyCleared;
        }
    }

    fn mark_full(&mut self) {
        self.state = PassState::FullyCleared;
    }
}

impl Default for InvalidationPass {
    fn default() -> Self {
        Self::new()
    }
}

/// Fragments named directly by the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClearTarget {
    All,
    Entries(Vec<CacheEntryId>),
}

pub struct InvalidationEngine<S: FragmentStore> {
    store: Arc<S>,
    config: Arc<CacheConfig>,
    requery: RequeryCoordinator,
    resolver: Arc<dyn QueryResolver>,
}

impl<S: FragmentStore> InvalidationEngine<S> {
    pub fn new(
        store: Arc<S>,
        config: Arc<CacheConfig>,
        requery: RequeryCoordinator,
        resolver: Arc<dyn QueryResolver>,
    ) -> Self {
        Self {
            store,
            config,
            requery,
            resolver,
        }
    }

    pub fn requery_coordinator(&self) -> &RequeryCoordinator {
        &self.requery
    }

    pub async fn on_entity_changed(
        &self,
        pass: &mut InvalidationPass,
        entity_id: EntityId,
    ) -> Result<u64, RepoError> {
        self.invalidate_ids(pass, &[entity_id], true).await
    }

    /// Delete fragments referencing any of `entity_ids` and, with query
    /// caching on, schedule a requery for them.
    #[instrument(skip(self, pass, entity_ids), fields(entity_count = entity_ids.len()))]
    pub async fn on_entities_changed(
        &self,
        pass: &mut InvalidationPass,
        entity_ids: &[EntityId],
    ) -> Result<u64, RepoError> {
        self.invalidate_ids(pass, entity_ids, true).await
    }

    /// Like [`Self::on_entities_changed`], skipping ids whose type was already
    /// cleared in this pass.
    ///
    /// Only fragments that recorded the entity with its type are covered by a
    /// type clear, so callers must tag consistently for the skip to be exact.
    pub async fn on_typed_entities_changed(
        &self,
        pass: &mut InvalidationPass,
        entities: &[EntityRef],
    ) -> Result<u64, RepoError> {
        let ids: Vec<EntityId> = entities
            .iter()
            .filter(|entity| match &entity.entity_type {
                Some(entity_type) => !pass.type_cleared(entity_type),
                None => true,
            })
            .map(|entity| entity.entity_id)
            .collect();
        self.invalidate_ids(pass, &ids, true).await
    }

    #[instrument(skip(self, pass), fields(entity_type = %entity_type))]
    pub async fn on_entity_type_changed(
        &self,
        pass: &mut InvalidationPass,
        entity_type: &EntityType,
    ) -> Result<u64, RepoError> {
        if pass.is_fully_cleared() || pass.type_cleared(entity_type) {
            return Ok(0);
        }

        let deleted = self.store.delete_by_entity_type(entity_type).await?;
        pass.cleared_types.insert(entity_type.clone());
        pass.mark_partial();
        record_invalidated(deleted);
        info!(deleted, "Fragments invalidated by type");
        Ok(deleted)
    }

    pub async fn on_explicit_ids(
        &self,
        pass: &mut InvalidationPass,
        target: ClearTarget,
    ) -> Result<u64, RepoError> {
        match target {
            ClearTarget::All => self.clear_all(pass).await,
            ClearTarget::Entries(ids) => {
                if pass.is_fully_cleared() || ids.is_empty() {
                    return Ok(0);
                }
                let deleted = self.store.delete_by_ids(&ids).await?;
                pass.mark_partial();
                record_invalidated(deleted);
                debug!(deleted, "Fragments invalidated by id");
                Ok(deleted)
            }
        }
    }

    pub async fn clear_all(&self, pass: &mut InvalidationPass) -> Result<u64, RepoError> {
        if pass.is_fully_cleared() {
            return Ok(0);
        }

        let deleted = self.store.delete_all().await?;
        pass.mark_full();
        record_invalidated(deleted);
        info!(deleted, "Fragment cache cleared");
        Ok(deleted)
    }

    /// Resolve a saved query without its limit and invalidate every match.
    pub async fn on_saved_query_resolved(
        &self,
        pass: &mut InvalidationPass,
        query: &EntityQuery,
    ) -> Result<u64, RepoError> {
        if pass.is_fully_cleared() {
            return Ok(0);
        }

        let unlimited = query.clone().without_limit();
        let ids = self.resolver.resolve_ids(&unlimited).await?;
        self.on_entities_changed(pass, &ids).await
    }

    /// Claim the pending requery job, run it and record its outcome.
    pub async fn run_pending_requery(&self, pass: &mut InvalidationPass) -> Result<u64, RepoError> {
        let queue = self.requery.queue();
        let Some(job) = queue.take_pending().await? else {
            return Ok(0);
        };

        let result = self.requery(pass, &job.payload).await;
        let error = result.as_ref().err().map(ToString::to_string);
        queue.complete(&job.id, error).await?;
        result
    }

    /// Re-run every outstanding saved query against the changed ids.
    ///
    /// Fragments whose queries now match any of the ids are deleted, and the
    /// matched ids go through id invalidation without scheduling another
    /// requery.
    #[instrument(skip(self, pass, payload), fields(entity_count = payload.entity_ids.len()))]
    pub async fn requery(
        &self,
        pass: &mut InvalidationPass,
        payload: &RequeryPayload,
    ) -> Result<u64, RepoError> {
        if pass.is_fully_cleared() || payload.is_empty() {
            return Ok(0);
        }

        let started_at = Instant::now();
        let refs = self.store.query_refs(OffsetDateTime::now_utc()).await?;

        let mut doomed: BTreeSet<CacheEntryId> = BTreeSet::new();
        let mut matched: BTreeSet<EntityId> = BTreeSet::new();

        for stored in &refs {
            if doomed.contains(&stored.cache_entry_id) {
                continue;
            }

            let query = match EntityQuery::decode(stored) {
                Ok(query) => query,
                Err(err) => {
                    counter!(METRIC_REQUERY_MALFORMED).increment(1);
                    warn!(
                        query_ref_id = stored.id,
                        cache_entry_id = stored.cache_entry_id,
                        error = %err,
                        "Skipping malformed saved query"
                    );
                    continue;
                }
            };

            let Some(narrowed) = query.without_limit().narrowed_to(&payload.entity_ids) else {
                continue;
            };
            let hits = match self.resolver.resolve_ids(&narrowed).await {
                Ok(ids) => ids,
                Err(err) => {
                    warn!(
                        query_ref_id = stored.id,
                        cache_entry_id = stored.cache_entry_id,
                        error = %err,
                        "Saved query resolution failed"
                    );
                    continue;
                }
            };

            let mut hit_any = false;
            for id in hits {
                if payload.entity_ids.contains(&id) {
                    matched.insert(id);
                    hit_any = true;
                }
            }
            if hit_any {
                doomed.insert(stored.cache_entry_id);
            }
        }

        let mut deleted = 0;
        if !doomed.is_empty() {
            let ids: Vec<CacheEntryId> = doomed.into_iter().collect();
            deleted = self.store.delete_by_ids(&ids).await?;
            pass.mark_partial();
            record_invalidated(deleted);
        }

        let matched: Vec<EntityId> = matched.into_iter().collect();
        deleted += self.invalidate_ids(pass, &matched, false).await?;

        histogram!(METRIC_REQUERY_MS).record(started_at.elapsed().as_secs_f64() * 1000.0);
        info!(
            query_refs = refs.len(),
            matched = matched.len(),
            deleted,
            "Requery finished"
        );
        Ok(deleted)
    }

    async fn invalidate_ids(
        &self,
        pass: &mut InvalidationPass,
        entity_ids: &[EntityId],
        schedule_requery: bool,
    ) -> Result<u64, RepoError> {
        if pass.is_fully_cleared() || entity_ids.is_empty() {
            return Ok(0);
        }

        let entries = self.store.entry_ids_for_entities(entity_ids).await?;
        let deleted = if entries.is_empty() {
            0
        } else {
            let deleted = self.store.delete_by_ids(&entries).await?;
            pass.mark_partial();
            deleted
        };
        record_invalidated(deleted);

        if schedule_requery && self.config.query_caching_enabled {
            self.requery.schedule(entity_ids).await?;
        }

        debug!(entity_count = entity_ids.len(), deleted, "Fragments invalidated by entity");
        Ok(deleted)
    }
}

fn record_invalidated(deleted: u64) {
    if deleted > 0 {
        counter!(METRIC_INVALIDATED).increment(deleted);
    }
}
