//! Open fragment scopes of a render pass.
//!
//! Scopes do not nest like a stack: any number may be open at once and every
//! dependency touch is broadcast to all of them. An outer scope therefore ends
//! up with the union of everything touched while it was open, including
//! touches made inside inner or sibling scopes.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::debug;

use crate::domain::entities::{EntityRef, QueryRef};
use crate::domain::query::EntityQuery;
use crate::domain::types::{EntityId, EntityType};

/// Dependencies collected by one scope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ScopeDeps {
    entities: BTreeMap<EntityId, Option<EntityType>>,
    /// `None` when query tracking was disabled at `start`.
    queries: Option<BTreeSet<QueryRef>>,
}

impl ScopeDeps {
    fn new(track_queries: bool) -> Self {
        Self {
            entities: BTreeMap::new(),
            queries: track_queries.then(BTreeSet::new),
        }
    }

    fn add_entity(&mut self, entity: &EntityRef) {
        let slot = self.entities.entry(entity.entity_id).or_default();
        // A typed touch upgrades an untyped one; never the other way round.
        if entity.entity_type.is_some() {
            *slot = entity.entity_type.clone();
        }
    }

    pub fn entity_ids(&self) -> impl Iterator<Item = EntityId> + '_ {
        self.entities.keys().copied()
    }

    pub fn entity_refs(&self) -> Vec<EntityRef> {
        self.entities
            .iter()
            .map(|(id, entity_type)| EntityRef {
                entity_id: *id,
                entity_type: entity_type.clone(),
            })
            .collect()
    }

    pub fn query_refs(&self) -> Vec<QueryRef> {
        self.queries
            .as_ref()
            .map(|queries| queries.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn tracks_queries(&self) -> bool {
        self.queries.is_some()
    }
}

/// Arena of open scope buckets keyed by cache key.
#[derive(Debug, Default)]
pub struct ScopeTracker {
    track_queries: bool,
    open: HashMap<String, ScopeDeps>,
}

impl ScopeTracker {
    pub fn new(track_queries: bool) -> Self {
        Self {
            track_queries,
            open: HashMap::new(),
        }
    }

    /// Open an empty bucket for `key`, replacing one still open under it.
    pub fn start(&mut self, key: &str) {
        if self
            .open
            .insert(key.to_string(), ScopeDeps::new(self.track_queries))
            .is_some()
        {
            debug!(cache_key = key, "Fragment scope restarted while open");
        }
    }

    /// Add an entity to every open scope.
    pub fn record_entity(&mut self, entity: impl Into<EntityRef>) {
        if self.open.is_empty() {
            return;
        }

        let entity = entity.into();
        for deps in self.open.values_mut() {
            deps.add_entity(&entity);
        }
    }

    /// Add a saved query to every open scope that tracks queries.
    pub fn record_query(&mut self, query: &EntityQuery) {
        if !self.open.values().any(ScopeDeps::tracks_queries) {
            return;
        }

        let query_ref = query.to_query_ref();
        for queries in self.open.values_mut().filter_map(|deps| deps.queries.as_mut()) {
            queries.insert(query_ref.clone());
        }
    }

    /// Close `key` and hand back what it collected.
    pub fn close(&mut self, key: &str) -> Option<ScopeDeps> {
        self.open.remove(key)
    }

    pub fn is_open(&self, key: &str) -> bool {
        self.open.contains_key(key)
    }

    pub fn open_count(&self) -> usize {
        self.open.len()
    }

    /// Dependencies gathered so far by an open scope.
    pub fn peek(&self, key: &str) -> Option<&ScopeDeps> {
        self.open.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(deps: &ScopeDeps) -> Vec<EntityId> {
        deps.entity_ids().collect()
    }

    #[test]
    fn touches_without_open_scope_are_dropped() {
        let mut tracker = ScopeTracker::new(true);
        tracker.record_entity(1);
        tracker.start("a");
        let deps = tracker.close("a").expect("open scope");
        assert!(ids(&deps).is_empty());
    }

    #[test]
    fn touches_fan_out_to_every_open_scope() {
        let mut tracker = ScopeTracker::new(false);
        tracker.start("A");
        tracker.record_entity(1);
        tracker.start("B");
        tracker.record_entity(2);
        let inner = tracker.close("B").expect("B open");
        tracker.record_entity(3);
        let outer = tracker.close("A").expect("A open");

        assert_eq!(ids(&inner), vec![2]);
        assert_eq!(ids(&outer), vec![1, 2, 3]);
        assert_eq!(tracker.open_count(), 0);
    }

    #[test]
    fn scopes_may_close_out_of_order() {
        let mut tracker = ScopeTracker::new(false);
        tracker.start("A");
        tracker.start("B");
        tracker.record_entity(9);
        let outer = tracker.close("A").expect("A open");
        tracker.record_entity(10);
        let inner = tracker.close("B").expect("B open");

        assert_eq!(ids(&outer), vec![9]);
        assert_eq!(ids(&inner), vec![9, 10]);
    }

    #[test]
    fn entity_recording_is_idempotent() {
        let mut tracker = ScopeTracker::new(false);
        tracker.start("A");
        tracker.record_entity(4);
        tracker.record_entity(4);
        let deps = tracker.close("A").expect("A open");
        assert_eq!(ids(&deps), vec![4]);
    }

    #[test]
    fn typed_touch_upgrades_untyped_ref() {
        let mut tracker = ScopeTracker::new(false);
        tracker.start("A");
        tracker.record_entity(4);
        tracker.record_entity(EntityRef::typed(4, "entry"));
        tracker.record_entity(4);
        let deps = tracker.close("A").expect("A open");
        assert_eq!(deps.entity_refs(), vec![EntityRef::typed(4, "entry")]);
    }

    #[test]
    fn reopened_key_starts_empty() {
        let mut tracker = ScopeTracker::new(false);
        tracker.start("A");
        tracker.record_entity(1);
        tracker.close("A");
        tracker.start("A");
        tracker.record_entity(2);
        let deps = tracker.close("A").expect("A open");
        assert_eq!(ids(&deps), vec![2]);
    }

    #[test]
    fn queries_are_ignored_when_tracking_disabled() {
        let mut tracker = ScopeTracker::new(false);
        tracker.start("A");
        tracker.record_query(&EntityQuery::new("entry"));
        let deps = tracker.close("A").expect("A open");
        assert!(!deps.tracks_queries());
        assert!(deps.query_refs().is_empty());
    }

    #[test]
    fn identical_queries_are_recorded_once() {
        let mut tracker = ScopeTracker::new(true);
        tracker.start("A");
        tracker.record_query(&EntityQuery::new("entry").with("section", "news"));
        tracker.record_query(&EntityQuery::new("entry").with("section", "news"));
        tracker.record_query(&EntityQuery::new("entry").with("section", "blog"));
        let deps = tracker.close("A").expect("A open");
        assert_eq!(deps.query_refs().len(), 2);
    }

    #[test]
    fn close_unknown_key_returns_none() {
        let mut tracker = ScopeTracker::new(true);
        assert!(tracker.close("missing").is_none());
        assert!(!tracker.is_open("missing"));
    }
}
