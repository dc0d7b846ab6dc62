//! Saved entity queries.
//!
//! A saved query is an entity type plus a flat map of criteria. Criteria are
//! opaque to the cache; only the host's `QueryResolver` interprets them. The
//! cache relies on two reserved keys: `limit` and `id`.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::domain::entities::{QueryRef, StoredQueryRef};
use crate::domain::error::DomainError;
use crate::domain::types::{EntityId, EntityType};

const LIMIT_KEY: &str = "limit";
const ID_KEY: &str = "id";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityQuery {
    entity_type: EntityType,
    criteria: Map<String, Value>,
}

impl EntityQuery {
    pub fn new(entity_type: impl Into<EntityType>) -> Self {
        Self {
            entity_type: entity_type.into(),
            criteria: Map::new(),
        }
    }

    /// Set a criteria attribute.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.criteria.insert(key.into(), value.into());
        self
    }

    pub fn entity_type(&self) -> &EntityType {
        &self.entity_type
    }

    pub fn criteria(&self) -> &Map<String, Value> {
        &self.criteria
    }

    pub fn limit(&self) -> Option<u64> {
        self.criteria.get(LIMIT_KEY).and_then(Value::as_u64)
    }

    /// Drop any result limit so resolution sees every matching entity.
    pub fn without_limit(mut self) -> Self {
        self.criteria.remove(LIMIT_KEY);
        self
    }

    /// Narrow the query to the given entity ids.
    pub fn restricted_to<'a>(mut self, ids: impl IntoIterator<Item = &'a EntityId>) -> Self {
        let ids: Vec<Value> = ids.into_iter().map(|id| Value::from(*id)).collect();
        self.criteria.insert(ID_KEY.to_string(), Value::Array(ids));
        self
    }

    /// Narrow the query to `ids` while keeping its own `id` criterion.
    ///
    /// Returns `None` when the query can no longer match any of `ids`.
    pub fn narrowed_to(self, ids: &BTreeSet<EntityId>) -> Option<Self> {
        let allowed: BTreeSet<EntityId> = match self.restricted_ids() {
            Some(own) => own.intersection(ids).copied().collect(),
            None => ids.clone(),
        };
        if allowed.is_empty() {
            return None;
        }
        Some(self.restricted_to(allowed.iter()))
    }

    /// Ids the query was narrowed to, if it carries an `id` criterion.
    pub fn restricted_ids(&self) -> Option<BTreeSet<EntityId>> {
        match self.criteria.get(ID_KEY)? {
            Value::Array(values) => Some(values.iter().filter_map(Value::as_i64).collect()),
            Value::Number(number) => number.as_i64().map(|id| BTreeSet::from([id])),
            _ => None,
        }
    }

    /// Fingerprint captured when the query runs inside an open scope.
    ///
    /// `serde_json::Map` keeps keys sorted, so equal criteria always serialize
    /// to the same text.
    pub fn to_query_ref(&self) -> QueryRef {
        QueryRef {
            entity_type: self.entity_type.clone(),
            serialized_query: Value::Object(self.criteria.clone()).to_string(),
        }
    }

    pub fn decode(stored: &StoredQueryRef) -> Result<Self, DomainError> {
        let value: Value = serde_json::from_str(&stored.serialized_query).map_err(|err| {
            DomainError::malformed_query(stored.entity_type.as_str(), err.to_string())
        })?;

        match value {
            Value::Object(criteria) => Ok(Self {
                entity_type: stored.entity_type.clone(),
                criteria,
            }),
            other => Err(DomainError::malformed_query(
                stored.entity_type.as_str(),
                format!("expected a JSON object, found `{other}`"),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(serialized: &str) -> StoredQueryRef {
        StoredQueryRef {
            id: 1,
            cache_entry_id: 7,
            entity_type: EntityType::from("entry"),
            serialized_query: serialized.to_string(),
        }
    }

    #[test]
    fn equal_criteria_produce_equal_fingerprints() {
        let first = EntityQuery::new("entry")
            .with("section", "news")
            .with("limit", 10);
        let second = EntityQuery::new("entry")
            .with("limit", 10)
            .with("section", "news");

        assert_eq!(first.to_query_ref(), second.to_query_ref());
    }

    #[test]
    fn fingerprint_decodes_back_to_query() {
        let query = EntityQuery::new("entry").with("section", "news");
        let query_ref = query.to_query_ref();

        let mut row = stored(&query_ref.serialized_query);
        row.entity_type = query_ref.entity_type;

        assert_eq!(EntityQuery::decode(&row).expect("decodes"), query);
    }

    #[test]
    fn without_limit_removes_limit() {
        let query = EntityQuery::new("entry").with("limit", 5).without_limit();
        assert_eq!(query.limit(), None);
    }

    #[test]
    fn restriction_is_readable() {
        let ids = [3, 1, 2];
        let query = EntityQuery::new("entry").restricted_to(ids.iter());
        assert_eq!(query.restricted_ids(), Some(BTreeSet::from([1, 2, 3])));
    }

    #[test]
    fn narrowing_keeps_the_query_own_ids() {
        let changed = BTreeSet::from([5, 9]);

        let unrestricted = EntityQuery::new("entry")
            .narrowed_to(&changed)
            .expect("narrowed");
        assert_eq!(unrestricted.restricted_ids(), Some(changed.clone()));

        let pinned = EntityQuery::new("entry")
            .with("id", 5)
            .narrowed_to(&changed)
            .expect("narrowed");
        assert_eq!(pinned.restricted_ids(), Some(BTreeSet::from([5])));

        let disjoint = EntityQuery::new("entry").with("id", 5);
        assert!(disjoint.narrowed_to(&BTreeSet::from([9])).is_none());
    }

    #[test]
    fn decode_rejects_invalid_json() {
        let err = EntityQuery::decode(&stored("{not json")).expect_err("malformed");
        assert!(matches!(err, DomainError::MalformedQuery { .. }));
    }

    #[test]
    fn decode_rejects_non_object() {
        let err = EntityQuery::decode(&stored("[1,2,3]")).expect_err("malformed");
        assert!(err.to_string().contains("expected a JSON object"));
    }
}
