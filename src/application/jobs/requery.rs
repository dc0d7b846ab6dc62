use apalis::prelude::{Data, Error as ApalisError};
use tracing::{info, warn};

use crate::{
    application::repos::{FragmentStore, RequeryPayload},
    cache::InvalidationPass,
};

use super::context::{RequeryWorkerContext, job_failed};

/// Re-run saved queries against the ids collected in a requery job.
///
/// Each job is its own invalidation pass; ids it matches are invalidated
/// without scheduling a follow-up job.
pub async fn process_requery_job<S>(
    payload: RequeryPayload,
    ctx: Data<RequeryWorkerContext<S>>,
) -> Result<(), ApalisError>
where
    S: FragmentStore + 'static,
{
    let entity_count = payload.entity_ids.len();
    let mut pass = InvalidationPass::new();

    match ctx.engine.requery(&mut pass, &payload).await {
        Ok(deleted) => {
            info!(entity_count, deleted, "Requery job finished");
            Ok(())
        }
        Err(err) => {
            warn!(entity_count, error = %err, "Requery job failed");
            Err(job_failed(err))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use apalis::prelude::Data;
    use time::OffsetDateTime;

    use super::*;
    use crate::application::repos::RequeryQueue;
    use crate::cache::{
        CacheConfig, ConservativeResolver, InvalidationEngine, MemoryFragmentStore,
        MemoryRequeryQueue, RequeryCoordinator,
    };
    use crate::domain::entities::NewCacheEntry;
    use crate::domain::query::EntityQuery;

    #[tokio::test]
    async fn job_invalidates_matching_fragments_without_rescheduling() {
        let store = Arc::new(MemoryFragmentStore::new());
        let queue = Arc::new(MemoryRequeryQueue::new());
        let engine = InvalidationEngine::new(
            store.clone(),
            Arc::new(CacheConfig::default()),
            RequeryCoordinator::new(queue.clone()),
            Arc::new(ConservativeResolver),
        );

        let mut tx = store.begin().await.expect("begin");
        let id = store
            .insert_fragment(
                &mut tx,
                &NewCacheEntry {
                    cache_key: "list".to_string(),
                    locale: "en-US".to_string(),
                    path: None,
                    expires_at: OffsetDateTime::now_utc() + time::Duration::hours(1),
                    body: "<ul></ul>".to_string(),
                },
                &[],
                &[EntityQuery::new("entry").to_query_ref()],
            )
            .await
            .expect("insert");
        store.commit(tx).await.expect("commit");

        let ctx = RequeryWorkerContext::new(Arc::new(engine));
        process_requery_job(RequeryPayload::new([9]), Data::new(ctx))
            .await
            .expect("job succeeds");

        assert!(store.entry(id).is_none());
        assert!(queue.pending().await.expect("pending").is_none());
    }
}
