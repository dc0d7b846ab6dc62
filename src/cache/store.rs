//! In-process fragment store.
//!
//! Mirrors the PostgreSQL schema with plain maps behind a lock. Writes are
//! staged on a `MemoryTx` and become visible only on commit, so it honours the
//! same all-or-nothing contract as the database-backed store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::application::repos::{FragmentLookup, FragmentStore, RepoError};
use crate::domain::entities::{
    CacheEntryRecord, CacheStats, EntityRef, NewCacheEntry, QueryRef, StoredQueryRef,
};
use crate::domain::types::{CacheEntryId, EntityId, EntityType};

use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::store";

#[derive(Debug, Default)]
struct Tables {
    entries: BTreeMap<CacheEntryId, CacheEntryRecord>,
    entity_refs: BTreeMap<CacheEntryId, Vec<EntityRef>>,
    query_refs: BTreeMap<i64, StoredQueryRef>,
    last_swept_at: Option<OffsetDateTime>,
}

impl Tables {
    fn remove_entries(&mut self, ids: impl IntoIterator<Item = CacheEntryId>) -> u64 {
        let doomed: BTreeSet<CacheEntryId> = ids
            .into_iter()
            .filter(|id| self.entries.contains_key(id))
            .collect();
        for id in &doomed {
            self.entries.remove(id);
            self.entity_refs.remove(id);
        }
        self.query_refs
            .retain(|_, query| !doomed.contains(&query.cache_entry_id));
        doomed.len() as u64
    }
}

#[derive(Debug)]
struct StagedFragment {
    id: CacheEntryId,
    entry: NewCacheEntry,
    entities: Vec<EntityRef>,
    queries: Vec<(i64, QueryRef)>,
}

/// Pending writes of one in-process transaction.
#[derive(Debug, Default)]
pub struct MemoryTx {
    staged: Vec<StagedFragment>,
}

impl MemoryTx {
    pub fn staged_len(&self) -> usize {
        self.staged.len()
    }
}

#[derive(Debug)]
pub struct MemoryFragmentStore {
    tables: RwLock<Tables>,
    entry_seq: AtomicI64,
    query_seq: AtomicI64,
}

impl MemoryFragmentStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            entry_seq: AtomicI64::new(1),
            query_seq: AtomicI64::new(1),
        }
    }

    /// Every stored row, live or expired, ordered by id.
    pub fn entries(&self) -> Vec<CacheEntryRecord> {
        rw_read(&self.tables, SOURCE, "entries")
            .entries
            .values()
            .cloned()
            .collect()
    }

    pub fn entry(&self, id: CacheEntryId) -> Option<CacheEntryRecord> {
        rw_read(&self.tables, SOURCE, "entry")
            .entries
            .get(&id)
            .cloned()
    }

    pub fn entity_refs(&self, id: CacheEntryId) -> Vec<EntityRef> {
        rw_read(&self.tables, SOURCE, "entity_refs")
            .entity_refs
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    /// Query references of one entry regardless of expiry.
    pub fn query_refs_of(&self, id: CacheEntryId) -> Vec<StoredQueryRef> {
        rw_read(&self.tables, SOURCE, "query_refs_of")
            .query_refs
            .values()
            .filter(|query| query.cache_entry_id == id)
            .cloned()
            .collect()
    }

    /// Insert a raw query reference, bypassing scope collection.
    pub fn insert_raw_query_ref(
        &self,
        cache_entry_id: CacheEntryId,
        entity_type: EntityType,
        serialized_query: impl Into<String>,
    ) -> i64 {
        let id = self.query_seq.fetch_add(1, Ordering::SeqCst);
        rw_write(&self.tables, SOURCE, "insert_raw_query_ref")
            .query_refs
            .insert(
                id,
                StoredQueryRef {
                    id,
                    cache_entry_id,
                    entity_type,
                    serialized_query: serialized_query.into(),
                },
            );
        id
    }

    pub fn last_swept_at(&self) -> Option<OffsetDateTime> {
        rw_read(&self.tables, SOURCE, "last_swept_at").last_swept_at
    }
}

impl Default for MemoryFragmentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FragmentStore for MemoryFragmentStore {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx, RepoError> {
        Ok(MemoryTx::default())
    }

    async fn commit(&self, tx: MemoryTx) -> Result<(), RepoError> {
        let mut tables = rw_write(&self.tables, SOURCE, "commit");
        for staged in tx.staged {
            let StagedFragment {
                id,
                entry,
                entities,
                queries,
            } = staged;

            tables.entries.insert(
                id,
                CacheEntryRecord {
                    id,
                    cache_key: entry.cache_key,
                    locale: entry.locale,
                    path: entry.path,
                    expires_at: entry.expires_at,
                    body: entry.body,
                },
            );
            if !entities.is_empty() {
                tables.entity_refs.insert(id, entities);
            }
            for (query_id, query) in queries {
                tables.query_refs.insert(
                    query_id,
                    StoredQueryRef {
                        id: query_id,
                        cache_entry_id: id,
                        entity_type: query.entity_type,
                        serialized_query: query.serialized_query,
                    },
                );
            }
        }
        Ok(())
    }

    async fn rollback(&self, tx: MemoryTx) -> Result<(), RepoError> {
        drop(tx);
        Ok(())
    }

    async fn insert_fragment(
        &self,
        tx: &mut MemoryTx,
        entry: &NewCacheEntry,
        entities: &[EntityRef],
        queries: &[QueryRef],
    ) -> Result<CacheEntryId, RepoError> {
        if entry.cache_key.is_empty() {
            return Err(RepoError::invalid_input("cache_key must not be empty"));
        }

        let id = self.entry_seq.fetch_add(1, Ordering::SeqCst);
        let queries = queries
            .iter()
            .map(|query| (self.query_seq.fetch_add(1, Ordering::SeqCst), query.clone()))
            .collect();

        tx.staged.push(StagedFragment {
            id,
            entry: entry.clone(),
            entities: entities.to_vec(),
            queries,
        });
        Ok(id)
    }

    async fn find_body(
        &self,
        lookup: FragmentLookup<'_>,
        now: OffsetDateTime,
    ) -> Result<Option<String>, RepoError> {
        let tables = rw_read(&self.tables, SOURCE, "find_body");
        let body = tables
            .entries
            .values()
            .rev()
            .filter(|entry| entry.expires_at > now)
            .filter(|entry| entry.cache_key == lookup.cache_key && entry.locale == lookup.locale)
            .find(|entry| match lookup.path {
                Some(path) => entry.path.as_deref() == Some(path),
                None => true,
            })
            .map(|entry| entry.body.clone());
        Ok(body)
    }

    async fn entry_ids_for_entities(
        &self,
        entity_ids: &[EntityId],
    ) -> Result<Vec<CacheEntryId>, RepoError> {
        let wanted: BTreeSet<EntityId> = entity_ids.iter().copied().collect();
        let tables = rw_read(&self.tables, SOURCE, "entry_ids_for_entities");
        Ok(tables
            .entity_refs
            .iter()
            .filter(|(_, refs)| refs.iter().any(|r| wanted.contains(&r.entity_id)))
            .map(|(id, _)| *id)
            .collect())
    }

    async fn delete_by_ids(&self, ids: &[CacheEntryId]) -> Result<u64, RepoError> {
        Ok(rw_write(&self.tables, SOURCE, "delete_by_ids").remove_entries(ids.iter().copied()))
    }

    async fn delete_by_entity_type(&self, entity_type: &EntityType) -> Result<u64, RepoError> {
        let mut tables = rw_write(&self.tables, SOURCE, "delete_by_entity_type");
        let mut doomed: BTreeSet<CacheEntryId> = tables
            .entity_refs
            .iter()
            .filter(|(_, refs)| {
                refs.iter()
                    .any(|r| r.entity_type.as_ref() == Some(entity_type))
            })
            .map(|(id, _)| *id)
            .collect();
        doomed.extend(
            tables
                .query_refs
                .values()
                .filter(|query| &query.entity_type == entity_type)
                .map(|query| query.cache_entry_id),
        );
        Ok(tables.remove_entries(doomed))
    }

    async fn delete_all(&self) -> Result<u64, RepoError> {
        let mut tables = rw_write(&self.tables, SOURCE, "delete_all");
        let ids: Vec<CacheEntryId> = tables.entries.keys().copied().collect();
        Ok(tables.remove_entries(ids))
    }

    async fn delete_expired(&self, now: OffsetDateTime) -> Result<u64, RepoError> {
        let mut tables = rw_write(&self.tables, SOURCE, "delete_expired");
        let expired: Vec<CacheEntryId> = tables
            .entries
            .values()
            .filter(|entry| entry.expires_at <= now)
            .map(|entry| entry.id)
            .collect();
        Ok(tables.remove_entries(expired))
    }

    async fn claim_sweep(&self, now: OffsetDateTime, window: Duration) -> Result<bool, RepoError> {
        let window = time::Duration::try_from(window).unwrap_or(time::Duration::MAX);
        let threshold = now.saturating_sub(window);

        let mut tables = rw_write(&self.tables, SOURCE, "claim_sweep");
        let due = match tables.last_swept_at {
            Some(last) => last <= threshold,
            None => true,
        };
        if due {
            tables.last_swept_at = Some(now);
        }
        Ok(due)
    }

    async fn query_refs(&self, now: OffsetDateTime) -> Result<Vec<StoredQueryRef>, RepoError> {
        let tables = rw_read(&self.tables, SOURCE, "query_refs");
        Ok(tables
            .query_refs
            .values()
            .filter(|query| {
                tables
                    .entries
                    .get(&query.cache_entry_id)
                    .is_some_and(|entry| entry.expires_at > now)
            })
            .cloned()
            .collect())
    }

    async fn stats(&self, now: OffsetDateTime) -> Result<CacheStats, RepoError> {
        let tables = rw_read(&self.tables, SOURCE, "stats");
        let expired = tables
            .entries
            .values()
            .filter(|entry| entry.expires_at <= now)
            .count() as u64;
        Ok(CacheStats {
            live_entries: tables.entries.len() as u64 - expired,
            expired_entries: expired,
            entity_refs: tables.entity_refs.values().map(|refs| refs.len() as u64).sum(),
            query_refs: tables.query_refs.len() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{AssertUnwindSafe, catch_unwind};

    use time::Duration as TimeDuration;

    use super::*;

    fn entry(key: &str, path: Option<&str>, expires_at: OffsetDateTime) -> NewCacheEntry {
        NewCacheEntry {
            cache_key: key.to_string(),
            locale: "en-US".to_string(),
            path: path.map(str::to_string),
            expires_at,
            body: format!("body:{key}"),
        }
    }

    async fn put(
        store: &MemoryFragmentStore,
        new: NewCacheEntry,
        entities: &[EntityRef],
        queries: &[QueryRef],
    ) -> CacheEntryId {
        let mut tx = store.begin().await.expect("begin");
        let id = store
            .insert_fragment(&mut tx, &new, entities, queries)
            .await
            .expect("insert");
        store.commit(tx).await.expect("commit");
        id
    }

    #[tokio::test]
    async fn staged_writes_are_invisible_until_commit() {
        let store = MemoryFragmentStore::new();
        let now = OffsetDateTime::now_utc();
        let later = now + TimeDuration::hours(1);

        let mut tx = store.begin().await.expect("begin");
        store
            .insert_fragment(&mut tx, &entry("k", None, later), &[], &[])
            .await
            .expect("insert");
        assert_eq!(tx.staged_len(), 1);

        let lookup = FragmentLookup {
            cache_key: "k",
            locale: "en-US",
            path: None,
        };
        assert!(store.find_body(lookup, now).await.expect("find").is_none());

        store.commit(tx).await.expect("commit");
        assert_eq!(
            store.find_body(lookup, now).await.expect("find").as_deref(),
            Some("body:k")
        );
    }

    #[tokio::test]
    async fn rollback_discards_staged_writes() {
        let store = MemoryFragmentStore::new();
        let later = OffsetDateTime::now_utc() + TimeDuration::hours(1);

        let mut tx = store.begin().await.expect("begin");
        store
            .insert_fragment(&mut tx, &entry("k", None, later), &[EntityRef::from(1)], &[])
            .await
            .expect("insert");
        store.rollback(tx).await.expect("rollback");

        assert!(store.entries().is_empty());
    }

    #[tokio::test]
    async fn empty_cache_key_is_rejected() {
        let store = MemoryFragmentStore::new();
        let mut tx = store.begin().await.expect("begin");
        let err = store
            .insert_fragment(&mut tx, &entry("", None, OffsetDateTime::now_utc()), &[], &[])
            .await
            .expect_err("empty key");
        assert!(matches!(err, RepoError::InvalidInput { .. }));
    }

    #[tokio::test]
    async fn newest_live_row_wins() {
        let store = MemoryFragmentStore::new();
        let now = OffsetDateTime::now_utc();
        let later = now + TimeDuration::hours(1);

        put(&store, entry("k", None, later), &[], &[]).await;
        let mut newer = entry("k", None, later);
        newer.body = "newer".to_string();
        put(&store, newer, &[], &[]).await;

        let lookup = FragmentLookup {
            cache_key: "k",
            locale: "en-US",
            path: None,
        };
        assert_eq!(
            store.find_body(lookup, now).await.expect("find").as_deref(),
            Some("newer")
        );
    }

    #[tokio::test]
    async fn type_delete_covers_entity_and_query_refs() {
        let store = MemoryFragmentStore::new();
        let later = OffsetDateTime::now_utc() + TimeDuration::hours(1);
        let entry_type = EntityType::from("entry");

        let by_ref = put(
            &store,
            entry("a", None, later),
            &[EntityRef::typed(1, "entry")],
            &[],
        )
        .await;
        let by_query = put(
            &store,
            entry("b", None, later),
            &[],
            &[QueryRef {
                entity_type: entry_type.clone(),
                serialized_query: "{}".to_string(),
            }],
        )
        .await;
        let untouched = put(
            &store,
            entry("c", None, later),
            &[EntityRef::typed(2, "asset")],
            &[],
        )
        .await;

        assert_eq!(store.delete_by_entity_type(&entry_type).await.expect("delete"), 2);
        assert!(store.entry(by_ref).is_none());
        assert!(store.entry(by_query).is_none());
        assert!(store.entry(untouched).is_some());
        assert!(store.query_refs_of(by_query).is_empty());
    }

    #[tokio::test]
    async fn claim_sweep_respects_window() {
        let store = MemoryFragmentStore::new();
        let now = OffsetDateTime::now_utc();
        let window = Duration::from_secs(60);

        assert!(store.claim_sweep(now, window).await.expect("claim"));
        assert!(
            !store
                .claim_sweep(now + TimeDuration::seconds(30), window)
                .await
                .expect("claim")
        );
        assert!(
            store
                .claim_sweep(now + TimeDuration::seconds(61), window)
                .await
                .expect("claim")
        );
    }

    #[tokio::test]
    async fn oversized_window_never_reopens() {
        let store = MemoryFragmentStore::new();
        let now = OffsetDateTime::now_utc();
        let window = Duration::from_secs(u64::MAX);

        assert!(store.claim_sweep(now, window).await.expect("claim"));
        assert!(
            !store
                .claim_sweep(now + TimeDuration::days(365), window)
                .await
                .expect("claim")
        );
    }

    #[tokio::test]
    async fn stats_split_live_and_expired() {
        let store = MemoryFragmentStore::new();
        let now = OffsetDateTime::now_utc();

        put(
            &store,
            entry("live", None, now + TimeDuration::hours(1)),
            &[EntityRef::from(1), EntityRef::from(2)],
            &[],
        )
        .await;
        put(&store, entry("old", None, now - TimeDuration::hours(1)), &[], &[]).await;

        let stats = store.stats(now).await.expect("stats");
        assert_eq!(stats.live_entries, 1);
        assert_eq!(stats.expired_entries, 1);
        assert_eq!(stats.entity_refs, 2);
    }

    #[test]
    fn store_recovers_from_poisoned_lock() {
        let store = MemoryFragmentStore::new();

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = store.tables.write().expect("tables lock should be acquired");
            panic!("poison tables lock");
        }));

        assert!(store.entries().is_empty());
    }
}
