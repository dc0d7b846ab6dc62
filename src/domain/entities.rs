//! Domain entities mirrored from persistent storage.

use serde::Serialize;
use time::OffsetDateTime;

use crate::domain::types::{CacheEntryId, EntityId, EntityType};

/// A persisted fragment row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheEntryRecord {
    pub id: CacheEntryId,
    pub cache_key: String,
    pub locale: String,
    /// `None` when the fragment was stored globally.
    pub path: Option<String>,
    pub expires_at: OffsetDateTime,
    pub body: String,
}

/// A fragment about to be written by a closing scope.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCacheEntry {
    pub cache_key: String,
    pub locale: String,
    pub path: Option<String>,
    pub expires_at: OffsetDateTime,
    pub body: String,
}

/// Dependency of a fragment on one content entity.
///
/// The type handle is optional because renderers do not always know it; typed
/// references are additionally covered by type-wide invalidation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EntityRef {
    pub entity_id: EntityId,
    pub entity_type: Option<EntityType>,
}

impl EntityRef {
    pub fn typed(entity_id: EntityId, entity_type: impl Into<EntityType>) -> Self {
        Self {
            entity_id,
            entity_type: Some(entity_type.into()),
        }
    }
}

impl From<EntityId> for EntityRef {
    fn from(entity_id: EntityId) -> Self {
        Self {
            entity_id,
            entity_type: None,
        }
    }
}

/// Fingerprint of a saved query captured while a scope was open.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct QueryRef {
    pub entity_type: EntityType,
    pub serialized_query: String,
}

/// A `cache_query_refs` row as read back for deferred re-evaluation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredQueryRef {
    pub id: i64,
    pub cache_entry_id: CacheEntryId,
    pub entity_type: EntityType,
    pub serialized_query: String,
}

/// Row counts reported by the `stats` command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub live_entries: u64,
    pub expired_entries: u64,
    pub entity_refs: u64,
    pub query_refs: u64,
}
