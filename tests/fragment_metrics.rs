use std::collections::HashSet;
use std::sync::Arc;

use metrics_util::debugging::DebuggingRecorder;
use tessera::application::repos::RequeryQueue;
use tessera::cache::{
    CacheConfig, ConservativeResolver, ExpirySweeper, FragmentCache, InvalidationEngine,
    InvalidationPass, MemoryFragmentStore, MemoryRequeryQueue, RequestPath, RequeryCoordinator,
    ScopeWrite,
};
use tessera::domain::query::EntityQuery;
use tessera::domain::types::EntityType;

#[tokio::test]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    let store = Arc::new(MemoryFragmentStore::new());
    let queue = Arc::new(MemoryRequeryQueue::new());
    let config = Arc::new(CacheConfig::default());
    let queue_handle: Arc<dyn RequeryQueue> = queue.clone();
    let cache = FragmentCache::new(store.clone(), config.clone());
    let engine = InvalidationEngine::new(
        store.clone(),
        config.clone(),
        RequeryCoordinator::new(queue_handle),
        Arc::new(ConservativeResolver),
    );
    let sweeper = ExpirySweeper::new(store.clone(), config.sweep_throttle);

    // Miss, write, hit
    let mut pass = cache.begin_pass("en-US", RequestPath::site("blog"));
    assert!(cache.get(&pass, "list", false).await.expect("get").is_none());
    pass.start_scope("list");
    pass.record_entity(1);
    pass.record_query(&EntityQuery::new("entry").with("section", "news"));
    cache
        .end_scope(&mut pass, ScopeWrite::new("list", "<ul></ul>"))
        .await
        .expect("write");
    assert!(cache.get(&pass, "list", false).await.expect("get").is_some());

    // Skipped write
    cache
        .end_scope(&mut pass, ScopeWrite::new("never-started", "body"))
        .await
        .expect("skip");

    // Malformed reference on a fragment that survives id invalidation
    pass.start_scope("other");
    pass.record_entity(2);
    let other = match cache
        .end_scope(&mut pass, ScopeWrite::new("other", "body"))
        .await
        .expect("write")
    {
        tessera::cache::WriteOutcome::Stored(id) => id,
        skipped => panic!("unexpected outcome {skipped:?}"),
    };
    store.insert_raw_query_ref(other, EntityType::from("entry"), "not json");

    // Invalidation, requery, sweep
    let mut invalidation = InvalidationPass::new();
    assert_eq!(
        engine
            .on_entity_changed(&mut invalidation, 1)
            .await
            .expect("invalidate"),
        1
    );
    engine
        .run_pending_requery(&mut invalidation)
        .await
        .expect("requery");
    sweeper.sweep_now().await.expect("sweep");

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "tessera_fragment_hit_total",
        "tessera_fragment_miss_total",
        "tessera_fragment_write_total",
        "tessera_fragment_write_skipped_total",
        "tessera_invalidated_total",
        "tessera_swept_total",
        "tessera_requery_ms",
        "tessera_requery_malformed_total",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
