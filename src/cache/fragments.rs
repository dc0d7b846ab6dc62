//! Render-side facade: open scopes, record dependencies, persist fragments.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use time::OffsetDateTime;
use tracing::{debug, instrument, warn};

use crate::application::repos::{FragmentLookup, FragmentStore, RepoError};
use crate::domain::entities::{EntityRef, NewCacheEntry};
use crate::domain::query::EntityQuery;
use crate::domain::types::CacheEntryId;

use super::config::CacheConfig;
use super::path::RequestPath;
use super::scope::{ScopeDeps, ScopeTracker};

const METRIC_HIT: &str = "tessera_fragment_hit_total";
const METRIC_MISS: &str = "tessera_fragment_miss_total";
const METRIC_WRITE: &str = "tessera_fragment_write_total";
const METRIC_WRITE_SKIPPED: &str = "tessera_fragment_write_skipped_total";

/// Transaction a fragment write runs in.
///
/// The cache only finishes transactions it opened itself; a joined
/// transaction belongs to the caller, who commits or rolls it back.
pub enum WriteTx<'t, T> {
    Owned(T),
    Joined(&'t mut T),
}

impl<T> WriteTx<'_, T> {
    fn as_mut(&mut self) -> &mut T {
        match self {
            WriteTx::Owned(tx) => tx,
            WriteTx::Joined(tx) => tx,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The key had no open scope.
    NotOpen,
    /// Caching is switched off.
    Disabled,
    /// The body references a transform URL that is generated on first hit.
    TransientResource,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::NotOpen => "not_open",
            SkipReason::Disabled => "disabled",
            SkipReason::TransientResource => "transient_resource",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Stored(CacheEntryId),
    Skipped(SkipReason),
}

/// A closing scope: its key, rendered body and lifetime options.
#[derive(Debug, Clone)]
pub struct ScopeWrite<'a> {
    key: &'a str,
    body: &'a str,
    global: bool,
    ttl: Option<Duration>,
    expires_at: Option<OffsetDateTime>,
}

impl<'a> ScopeWrite<'a> {
    pub fn new(key: &'a str, body: &'a str) -> Self {
        Self {
            key,
            body,
            global: false,
            ttl: None,
            expires_at: None,
        }
    }

    /// Store the fragment without a path so it is served on every request.
    pub fn global(mut self) -> Self {
        self.global = true;
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Explicit expiration; takes precedence over any TTL.
    pub fn expires_at(mut self, expires_at: OffsetDateTime) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn key(&self) -> &str {
        self.key
    }
}

/// State of one render pass: open scopes plus the request's locale and path.
#[derive(Debug)]
pub struct RenderPass {
    scopes: ScopeTracker,
    locale: String,
    path: String,
}

impl RenderPass {
    pub fn locale(&self) -> &str {
        &self.locale
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn start_scope(&mut self, key: &str) {
        self.scopes.start(key);
    }

    pub fn record_entity(&mut self, entity: impl Into<EntityRef>) {
        self.scopes.record_entity(entity);
    }

    pub fn record_query(&mut self, query: &EntityQuery) {
        self.scopes.record_query(query);
    }

    pub fn is_open(&self, key: &str) -> bool {
        self.scopes.is_open(key)
    }

    pub fn open_scopes(&self) -> usize {
        self.scopes.open_count()
    }

    pub fn peek(&self, key: &str) -> Option<&ScopeDeps> {
        self.scopes.peek(key)
    }
}

/// A scope that passed every skip check and is ready to be written.
struct PreparedWrite {
    entry: NewCacheEntry,
    deps: ScopeDeps,
}

pub struct FragmentCache<S: FragmentStore> {
    store: Arc<S>,
    config: Arc<CacheConfig>,
}

impl<S: FragmentStore> Clone for FragmentCache<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            config: Arc::clone(&self.config),
        }
    }
}

impl<S: FragmentStore> FragmentCache<S> {
    pub fn new(store: Arc<S>, config: Arc<CacheConfig>) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn begin_pass(&self, locale: impl Into<String>, request: RequestPath<'_>) -> RenderPass {
        RenderPass {
            scopes: ScopeTracker::new(self.config.query_caching_enabled),
            locale: locale.into(),
            path: request.derive(&self.config),
        }
    }

    /// Look up a live fragment for the pass's locale (and path unless global).
    #[instrument(skip(self, pass), fields(locale = %pass.locale))]
    pub async fn get(
        &self,
        pass: &RenderPass,
        key: &str,
        global: bool,
    ) -> Result<Option<String>, RepoError> {
        if !self.config.enabled {
            return Ok(None);
        }

        let lookup = FragmentLookup {
            cache_key: key,
            locale: &pass.locale,
            path: (!global).then_some(pass.path.as_str()),
        };
        let body = self
            .store
            .find_body(lookup, OffsetDateTime::now_utc())
            .await?;

        if body.is_some() {
            counter!(METRIC_HIT).increment(1);
        } else {
            counter!(METRIC_MISS).increment(1);
        }
        Ok(body)
    }

    /// Close a scope and persist it in a transaction of its own.
    #[instrument(skip(self, pass, write), fields(cache_key = write.key))]
    pub async fn end_scope(
        &self,
        pass: &mut RenderPass,
        write: ScopeWrite<'_>,
    ) -> Result<WriteOutcome, RepoError> {
        let prepared = match self.prepare(pass, &write) {
            Ok(prepared) => prepared,
            Err(reason) => return Ok(self.skipped(write.key, reason)),
        };

        let tx = match self.store.begin().await {
            Ok(tx) => tx,
            Err(err) => {
                warn!(cache_key = write.key, error = %err, "Failed to begin fragment write");
                return Err(err);
            }
        };
        self.persist(write.key, prepared, WriteTx::Owned(tx)).await
    }

    /// Close a scope and persist it inside the caller's transaction.
    ///
    /// The transaction is left open; the caller decides its fate.
    #[instrument(skip(self, pass, write, tx), fields(cache_key = write.key))]
    pub async fn end_scope_in(
        &self,
        pass: &mut RenderPass,
        write: ScopeWrite<'_>,
        tx: &mut S::Tx,
    ) -> Result<WriteOutcome, RepoError> {
        let prepared = match self.prepare(pass, &write) {
            Ok(prepared) => prepared,
            Err(reason) => return Ok(self.skipped(write.key, reason)),
        };
        self.persist(write.key, prepared, WriteTx::Joined(tx)).await
    }

    fn prepare(&self, pass: &mut RenderPass, write: &ScopeWrite<'_>) -> Result<PreparedWrite, SkipReason> {
        // The bucket goes away whatever happens next.
        let deps = pass.scopes.close(write.key).ok_or(SkipReason::NotOpen)?;

        if !self.config.enabled {
            return Err(SkipReason::Disabled);
        }
        if let Some(marker) = self.config.transient_resource_marker()
            && write.body.contains(&marker)
        {
            return Err(SkipReason::TransientResource);
        }

        let now = OffsetDateTime::now_utc();
        let expires_at = match (write.expires_at, write.ttl) {
            (Some(explicit), _) => explicit,
            (None, Some(ttl)) => expires_after(now, ttl),
            (None, None) => expires_after(now, self.config.default_duration()),
        };

        Ok(PreparedWrite {
            entry: NewCacheEntry {
                cache_key: write.key.to_string(),
                locale: pass.locale.clone(),
                path: (!write.global).then(|| pass.path.clone()),
                expires_at,
                body: write.body.to_string(),
            },
            deps,
        })
    }

    async fn persist(
        &self,
        key: &str,
        prepared: PreparedWrite,
        mut tx: WriteTx<'_, S::Tx>,
    ) -> Result<WriteOutcome, RepoError> {
        let PreparedWrite { entry, deps } = prepared;
        let entities = deps.entity_refs();
        let queries = deps.query_refs();

        let inserted = self
            .store
            .insert_fragment(tx.as_mut(), &entry, &entities, &queries)
            .await;

        let result = match (inserted, tx) {
            (Ok(id), WriteTx::Owned(tx)) => self.store.commit(tx).await.map(|()| id),
            (Ok(id), WriteTx::Joined(_)) => Ok(id),
            (Err(err), WriteTx::Owned(tx)) => {
                if let Err(rollback_err) = self.store.rollback(tx).await {
                    warn!(cache_key = key, error = %rollback_err, "Fragment write rollback failed");
                }
                Err(err)
            }
            (Err(err), WriteTx::Joined(_)) => Err(err),
        };

        match result {
            Ok(id) => {
                counter!(METRIC_WRITE).increment(1);
                debug!(
                    cache_key = key,
                    cache_entry_id = id,
                    entity_count = entities.len(),
                    query_count = queries.len(),
                    expires_at = %entry.expires_at,
                    "Fragment stored"
                );
                Ok(WriteOutcome::Stored(id))
            }
            Err(err) => {
                warn!(cache_key = key, error = %err, "Fragment write failed");
                Err(err)
            }
        }
    }

    fn skipped(&self, key: &str, reason: SkipReason) -> WriteOutcome {
        counter!(METRIC_WRITE_SKIPPED, "reason" => reason.as_str()).increment(1);
        debug!(cache_key = key, reason = reason.as_str(), "Fragment write skipped");
        WriteOutcome::Skipped(reason)
    }
}

fn expires_after(now: OffsetDateTime, lifetime: Duration) -> OffsetDateTime {
    let lifetime = time::Duration::try_from(lifetime).unwrap_or(time::Duration::MAX);
    now.saturating_add(lifetime)
}
