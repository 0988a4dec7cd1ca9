//! Cross-shard statistics.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;

use crate::shard::{call_shard, ShardRouter};
use crate::storage::models::ShardStats;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum ShardReport {
    Available(ShardStats),
    /// The shard could not be read; the rest of the report is still valid.
    Degraded { error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GlobalStats {
    pub shards: BTreeMap<usize, ShardReport>,
    /// Sum over available shards only.
    pub totals: ShardStats,
    pub degraded_shards: usize,
}

pub struct StatsAggregator {
    router: Arc<ShardRouter>,
    deadline: Duration,
}

impl StatsAggregator {
    pub fn new(router: Arc<ShardRouter>, deadline: Duration) -> Self {
        Self { router, deadline }
    }

    /// Read every shard concurrently. A failing shard is reported as degraded
    /// instead of failing the whole report.
    pub async fn global_stats(&self) -> GlobalStats {
        let mut shards: BTreeMap<usize, ShardReport> = self
            .router
            .shards()
            .map(|(index, _)| {
                (
                    index,
                    ShardReport::Degraded {
                        error: "no response".to_string(),
                    },
                )
            })
            .collect();

        let mut tasks = JoinSet::new();
        for (index, store) in self.router.shards() {
            let store = Arc::clone(store);
            let deadline = self.deadline;
            tasks.spawn(async move {
                let result = call_shard(index, store, deadline, |store| store.stats()).await;
                (index, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            let Ok((index, result)) = joined else {
                continue;
            };
            let report = match result {
                Ok(stats) => ShardReport::Available(stats),
                Err(e) => {
                    tracing::warn!(shard = index, error = %e, "Shard stats unavailable");
                    ShardReport::Degraded {
                        error: e.to_string(),
                    }
                }
            };
            shards.insert(index, report);
        }

        let mut totals = ShardStats::default();
        let mut degraded_shards = 0;
        for report in shards.values() {
            match report {
                ShardReport::Available(stats) => {
                    totals.file_count += stats.file_count;
                    totals.total_size_bytes += stats.total_size_bytes;
                    totals.latest_upload = totals.latest_upload.max(stats.latest_upload);
                }
                ShardReport::Degraded { .. } => degraded_shards += 1,
            }
        }

        GlobalStats {
            shards,
            totals,
            degraded_shards,
        }
    }
}
