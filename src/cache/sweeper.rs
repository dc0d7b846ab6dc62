//! Throttled removal of expired fragments.

use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::application::repos::{FragmentStore, RepoError};

use super::invalidation::InvalidationPass;

const METRIC_SWEPT: &str = "tessera_swept_total";

pub struct ExpirySweeper<S: FragmentStore> {
    store: Arc<S>,
    throttle: Duration,
}

impl<S: FragmentStore> ExpirySweeper<S> {
    pub fn new(store: Arc<S>, throttle: Duration) -> Self {
        Self { store, throttle }
    }

    /// Delete expired fragments unless a sweep already ran within the
    /// throttle window, in this pass or in any other process.
    pub async fn sweep_if_due(&self, pass: &mut InvalidationPass) -> Result<u64, RepoError> {
        if pass.has_swept() || pass.is_fully_cleared() {
            return Ok(0);
        }
        pass.mark_swept();

        let now = OffsetDateTime::now_utc();
        if !self.store.claim_sweep(now, self.throttle).await? {
            debug!("Expiry sweep skipped; throttle window still open");
            return Ok(0);
        }
        self.delete_expired(now).await
    }

    /// Sweep regardless of the throttle, restarting its window.
    pub async fn sweep_now(&self) -> Result<u64, RepoError> {
        let now = OffsetDateTime::now_utc();
        self.store.claim_sweep(now, Duration::ZERO).await?;
        self.delete_expired(now).await
    }

    async fn delete_expired(&self, now: OffsetDateTime) -> Result<u64, RepoError> {
        let deleted = self.store.delete_expired(now).await?;
        counter!(METRIC_SWEPT).increment(deleted);
        info!(deleted, "Expired fragments swept");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::store::MemoryFragmentStore;
    use crate::domain::entities::NewCacheEntry;

    async fn seed_expired(store: &MemoryFragmentStore) {
        let mut tx = store.begin().await.expect("begin");
        store
            .insert_fragment(
                &mut tx,
                &NewCacheEntry {
                    cache_key: "old".to_string(),
                    locale: "en-US".to_string(),
                    path: None,
                    expires_at: OffsetDateTime::now_utc() - time::Duration::minutes(1),
                    body: "stale".to_string(),
                },
                &[],
                &[],
            )
            .await
            .expect("insert");
        store.commit(tx).await.expect("commit");
    }

    #[tokio::test]
    async fn second_sweep_in_window_is_a_no_op() {
        let store = Arc::new(MemoryFragmentStore::new());
        let sweeper = ExpirySweeper::new(store.clone(), Duration::from_secs(86_400));

        seed_expired(&store).await;
        let mut pass = InvalidationPass::new();
        assert_eq!(sweeper.sweep_if_due(&mut pass).await.expect("sweep"), 1);
        assert!(pass.has_swept());

        seed_expired(&store).await;
        let mut next = InvalidationPass::new();
        assert_eq!(sweeper.sweep_if_due(&mut next).await.expect("sweep"), 0);
        assert_eq!(store.entries().len(), 1);
    }

    #[tokio::test]
    async fn pass_sweeps_at_most_once() {
        let store = Arc::new(MemoryFragmentStore::new());
        let sweeper = ExpirySweeper::new(store.clone(), Duration::ZERO);
        let mut pass = InvalidationPass::new();

        sweeper.sweep_if_due(&mut pass).await.expect("sweep");
        seed_expired(&store).await;
        assert_eq!(sweeper.sweep_if_due(&mut pass).await.expect("sweep"), 0);
        assert_eq!(store.entries().len(), 1);
    }

    #[tokio::test]
    async fn sweep_now_ignores_throttle() {
        let store = Arc::new(MemoryFragmentStore::new());
        let sweeper = ExpirySweeper::new(store.clone(), Duration::from_secs(86_400));

        sweeper.sweep_if_due(&mut InvalidationPass::new()).await.expect("sweep");
        seed_expired(&store).await;
        assert_eq!(sweeper.sweep_now().await.expect("sweep"), 1);
    }
}
