mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use file_lifecycle::shard::ShardRouter;
use file_lifecycle::stats::{ShardReport, StatsAggregator};
use file_lifecycle::storage::{Database, MetadataStore};

use common::{record, SlowShard, UnavailableShard, DEADLINE};

#[tokio::test]
async fn test_stats_merge_all_shards() {
    let dir = tempfile::tempdir().unwrap();
    let shard0 = Database::open_shard(dir.path(), 0, 2).unwrap();
    let shard1 = Database::open_shard(dir.path(), 1, 2).unwrap();

    let now = Utc::now();
    shard0.save(&record("a1", "alice", now - chrono::Duration::hours(1))).unwrap();
    shard0.save(&record("a2", "alice", now)).unwrap();
    shard1.save(&record("b1", "bob", now - chrono::Duration::hours(2))).unwrap();

    let shards: Vec<Arc<dyn MetadataStore>> = vec![Arc::new(shard0), Arc::new(shard1)];
    let router = Arc::new(ShardRouter::new(shards).unwrap());
    let stats = StatsAggregator::new(router, DEADLINE).global_stats().await;

    assert_eq!(stats.degraded_shards, 0);
    assert_eq!(stats.totals.file_count, 3);
    assert_eq!(stats.totals.total_size_bytes, 300);
    assert_eq!(stats.totals.latest_upload, Some(now));

    match &stats.shards[&0usize] {
        ShardReport::Available(shard) => assert_eq!(shard.file_count, 2),
        other => panic!("shard 0 should be available, got {other:?}"),
    }
    match &stats.shards[&1usize] {
        ShardReport::Available(shard) => assert_eq!(shard.file_count, 1),
        other => panic!("shard 1 should be available, got {other:?}"),
    }
}

#[tokio::test]
async fn test_failing_shard_is_reported_as_degraded() {
    let dir = tempfile::tempdir().unwrap();
    let healthy = Database::open_shard(dir.path(), 0, 2).unwrap();
    healthy.save(&record("a1", "alice", Utc::now())).unwrap();

    let shards: Vec<Arc<dyn MetadataStore>> = vec![Arc::new(healthy), Arc::new(UnavailableShard)];
    let router = Arc::new(ShardRouter::new(shards).unwrap());
    let stats = StatsAggregator::new(router, DEADLINE).global_stats().await;

    assert_eq!(stats.shards.len(), 2);
    assert_eq!(stats.degraded_shards, 1);
    assert_eq!(stats.totals.file_count, 1);
    assert!(matches!(stats.shards[&0usize], ShardReport::Available(_)));
    match &stats.shards[&1usize] {
        ShardReport::Degraded { error } => assert!(error.contains("shard offline"), "{error}"),
        other => panic!("shard 1 should be degraded, got {other:?}"),
    }
}

#[tokio::test]
async fn test_slow_shard_hits_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let slow = SlowShard::new(
        Database::open_shard(dir.path(), 0, 1).unwrap(),
        Duration::from_millis(300),
    );

    let shards: Vec<Arc<dyn MetadataStore>> = vec![Arc::new(slow)];
    let router = Arc::new(ShardRouter::new(shards).unwrap());
    let stats = StatsAggregator::new(router, Duration::from_millis(20))
        .global_stats()
        .await;

    assert_eq!(stats.degraded_shards, 1);
    assert!(matches!(stats.shards[&0usize], ShardReport::Degraded { .. }));
}

#[tokio::test]
async fn test_stats_serialize_with_status_tag() {
    let dir = tempfile::tempdir().unwrap();
    let shards: Vec<Arc<dyn MetadataStore>> = vec![
        Arc::new(Database::open_shard(dir.path(), 0, 2).unwrap()),
        Arc::new(UnavailableShard),
    ];
    let router = Arc::new(ShardRouter::new(shards).unwrap());
    let stats = StatsAggregator::new(router, DEADLINE).global_stats().await;

    let json = serde_json::to_value(&stats).unwrap();
    assert_eq!(json["shards"]["0"]["status"], "available");
    assert_eq!(json["shards"]["0"]["file_count"], 0);
    assert_eq!(json["shards"]["1"]["status"], "degraded");
    assert_eq!(json["totals"]["file_count"], 0);
}
