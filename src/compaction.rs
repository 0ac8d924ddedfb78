//! Tiered downsampling and retention.
//!
//! One pass, per tier pair (`REALTIME -> MINUTELY`, then `MINUTELY -> HOURLY`):
//!
//! 1. select source rows in `[now - target horizon, now - source horizon)`,
//!    with the upper edge truncated to a target bucket boundary;
//! 2. group them by sensor and by UTC bucket of the target resolution;
//! 3. for each group without an aggregate at that bucket in the target tier,
//!    build one from the per-measurement means;
//! 4. hand the new aggregates and all grouped source ids to
//!    [`ReadingStore::commit_aggregation`], which writes and deletes in one
//!    transaction. Only exported sources are deleted; the rest stay until a
//!    later pass finds them exported and the aggregate already in place.
//!
//! After each pair the source tier is purged up to that same truncated edge,
//! exported rows only. Unexported rows past a horizon are reported as export backlog.

use crate::config::RetentionConfig;
use crate::error::AppResult;
use crate::reading::{bucket_start, mean_of_present, Reading, StorageTier};
use crate::storage::{RangeQuery, ReadingStore};
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A source tier and the coarser tier it folds into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TierPair {
    pub source: StorageTier,
    pub target: StorageTier,
    /// Bucket width of the target tier
    pub bucket_secs: i64,
}

impl TierPair {
    pub const REALTIME_TO_MINUTELY: TierPair = TierPair {
        source: StorageTier::Realtime,
        target: StorageTier::Minutely,
        bucket_secs: 60,
    };

    pub const MINUTELY_TO_HOURLY: TierPair = TierPair {
        source: StorageTier::Minutely,
        target: StorageTier::Hourly,
        bucket_secs: 3600,
    };
}

/// Outcome of folding one tier pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FoldStats {
    /// Source rows in the window
    pub sources: usize,
    /// New aggregates written
    pub aggregates: usize,
    /// Buckets whose aggregate already existed
    pub existing: usize,
    /// Source rows deleted
    pub deleted: usize,
}

/// Outcome of a full pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionReport {
    pub folds: Vec<(TierPair, FoldStats)>,
    pub purged: usize,
    /// Rows past their horizon still waiting for export
    pub backlog: usize,
    pub failures: usize,
}

pub struct CompactionEngine {
    store: Arc<dyn ReadingStore>,
    retention: RetentionConfig,
    pass: Mutex<()>,
}

impl CompactionEngine {
    pub fn new(store: Arc<dyn ReadingStore>, retention: RetentionConfig) -> Self {
        Self {
            store,
            retention,
            pass: Mutex::new(()),
        }
    }

    /// Run one complete pass. Concurrent callers wait for the running pass.
    #[tracing::instrument(skip(self))]
    pub async fn run_pass(&self, now: DateTime<Utc>) -> CompactionReport {
        let _pass = self.pass.lock().await;
        let mut report = CompactionReport::default();
        let realtime_edge = now - self.retention.realtime();
        let minutely_edge = now - self.retention.minutely();
        let hourly_edge = now - self.retention.hourly();

        let plan = [
            (TierPair::REALTIME_TO_MINUTELY, minutely_edge, realtime_edge),
            (TierPair::MINUTELY_TO_HOURLY, hourly_edge, minutely_edge),
        ];
        for (pair, from, to) in plan {
            // whole buckets only; the rest of a straddling bucket waits for the next pass
            let to = bucket_start(to, pair.bucket_secs);
            match self.fold(pair, from, to).await {
                Ok(stats) => {
                    report.folds.push((pair, stats));
                    self.purge_into(&mut report, pair.source, to).await;
                }
                Err(e) => {
                    report.failures += 1;
                    tracing::error!(
                        source = %pair.source,
                        target = %pair.target,
                        error = %e,
                        "Compaction failed, purge of the source tier skipped until the next pass"
                    );
                }
            }
        }

        self.purge_into(&mut report, StorageTier::Hourly, hourly_edge).await;
        self.purge_into(&mut report, StorageTier::Predicted, realtime_edge).await;

        tracing::info!(
            purged = report.purged,
            backlog = report.backlog,
            failures = report.failures,
            "Compaction pass finished"
        );
        report
    }

    /// Fold the `pair.source` rows in `[from, to)` into `pair.target`.
    ///
    /// `to` is truncated to a bucket boundary so a bucket is only ever
    /// aggregated once all of its rows are inside the window.
    pub async fn fold(&self, pair: TierPair, from: DateTime<Utc>, to: DateTime<Utc>) -> AppResult<FoldStats> {
        let to = bucket_start(to, pair.bucket_secs);
        let sources = self
            .store
            .find_range(&RangeQuery::new(from, to).tier(pair.source))
            .await?;
        let mut stats = FoldStats {
            sources: sources.len(),
            ..Default::default()
        };
        if sources.is_empty() {
            return Ok(stats);
        }

        let mut groups: BTreeMap<(String, DateTime<Utc>), Vec<Reading>> = BTreeMap::new();
        for reading in sources {
            let bucket = bucket_start(reading.timestamp, pair.bucket_secs);
            groups
                .entry((reading.sensor_id.clone(), bucket))
                .or_default()
                .push(reading);
        }

        let width = Duration::seconds(pair.bucket_secs);
        let mut aggregates = Vec::new();
        let mut source_ids = Vec::new();
        for ((sensor_id, bucket), rows) in groups {
            let existing = self
                .store
                .find_range(&RangeQuery::new(bucket, bucket + width).sensor(&sensor_id).tier(pair.target))
                .await?;
            if existing.is_empty() {
                aggregates.push(aggregate(&rows, bucket, pair.target));
            } else {
                stats.existing += 1;
            }
            source_ids.extend(rows.iter().filter_map(|r| r.id));
        }

        stats.aggregates = aggregates.len();
        stats.deleted = self.store.commit_aggregation(aggregates, source_ids).await?;
        tracing::info!(
            source = %pair.source,
            target = %pair.target,
            aggregates = stats.aggregates,
            deleted = stats.deleted,
            kept = stats.sources - stats.deleted,
            "Compacted"
        );
        Ok(stats)
    }

    /// Delete exported `tier` rows older than `before`. Returns `(purged, backlog)`.
    pub async fn purge(&self, tier: StorageTier, before: DateTime<Utc>) -> AppResult<(usize, usize)> {
        let purged = self.store.delete_exported_before(tier, before).await?;
        if purged > 0 {
            tracing::info!(%tier, purged, %before, "Purged exported rows");
        }
        let backlog = self.store.count_unexported_before(tier, before).await?;
        if backlog > 0 {
            tracing::warn!(
                %tier,
                backlog,
                %before,
                "Rows past retention are still not exported, check the export service"
            );
        }
        Ok((purged, backlog))
    }

    async fn purge_into(&self, report: &mut CompactionReport, tier: StorageTier, before: DateTime<Utc>) {
        match self.purge(tier, before).await {
            Ok((purged, backlog)) => {
                report.purged += purged;
                report.backlog += backlog;
            }
            Err(e) => {
                report.failures += 1;
                tracing::error!(%tier, error = %e, "Purge failed");
            }
        }
    }
}

/// Mean of every present measurement of `rows`, stamped at `bucket`.
fn aggregate(rows: &[Reading], bucket: DateTime<Utc>, tier: StorageTier) -> Reading {
    let first = &rows[0];
    Reading {
        id: None,
        device_id: first.device_id.clone(),
        sensor_id: first.sensor_id.clone(),
        sensor_name: first.sensor_name.clone(),
        timestamp: bucket,
        temperature: mean_of_present(rows.iter().map(|r| r.temperature)),
        humidity: mean_of_present(rows.iter().map(|r| r.humidity)),
        pressure: mean_of_present(rows.iter().map(|r| r.pressure)),
        predicted_temperature: None,
        alarm: false,
        alarm_message: None,
        exported: false,
        tier,
    }
}
