//! Drives one shard: serial ingest from the source feed on the single
//! writer, with group flushes rotating onto the flush executor.
//!
//! The loop owns the [`ShardWriter`], which is what keeps every mutation —
//! ingest, buffer switches, eviction — on one logical thread. Flush tasks
//! are the only work spawned off it, and they were built after the writer
//! finished switching the group's buffers.

use std::{fmt::Debug, sync::Arc, time::Duration};

use async_trait::async_trait;
use data_types::{FlushGroup, GroupId, IngestRecord, ShardId};
use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    config::MemStoreConfig,
    shard::{ShardError, ShardStatus, ShardWriter, TimeSeriesShard},
    sink::{DynError, FlushResponse},
};

/// Ordered record feed for one shard. Offsets are monotonic; replayed
/// records below a group watermark are dropped by the shard itself.
#[async_trait]
pub trait SourceFeed: Debug + Send {
    /// Establish the feed. Bounded by the configured connect timeout.
    async fn connect(&mut self) -> Result<(), DynError>;

    /// The next ordered batch, or `None` once the feed is closed.
    async fn next_batch(&mut self) -> Result<Option<Vec<IngestRecord>>, DynError>;
}

/// Optional sink for flush-failure notifications (the failures topic).
#[async_trait]
pub trait FailureChannel: Debug + Send + Sync {
    /// Called once per flush that did not settle cleanly.
    async fn publish(&self, shard: ShardId, group: GroupId, response: &FlushResponse);
}

/// Errors terminating the ingest loop.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum DriverError {
    #[snafu(display("connecting the source feed: {}", source))]
    Connect { source: DynError },

    #[snafu(display("source feed connect timed out after {:?}", timeout))]
    ConnectTimeout { timeout: Duration },

    #[snafu(display("ingest failed: {}", source))]
    Ingest { source: ShardError },
}

/// Run the shard's ingest loop until the feed closes or `shutdown` fires,
/// then drain: seal and flush every group within the shutdown timeout.
/// Data that misses the drain window is lost by design and will be replayed
/// from the feed.
///
/// Returns the writer handle so the caller can decide between keeping the
/// shard and [`ShardWriter::shutdown`].
pub async fn run_ingest_loop(
    mut writer: ShardWriter,
    mut feed: Box<dyn SourceFeed>,
    config: &MemStoreConfig,
    failure_channel: Option<Arc<dyn FailureChannel>>,
    shutdown: CancellationToken,
) -> Result<ShardWriter, DriverError> {
    match tokio::time::timeout(config.connect_timeout, feed.connect()).await {
        Ok(connected) => connected.context(ConnectSnafu)?,
        Err(_) => {
            return Err(DriverError::ConnectTimeout {
                timeout: config.connect_timeout,
            })
        }
    }
    let shard_id = writer.shard().shard_id();
    info!(shard = %shard_id, "source feed connected");

    let num_groups = writer.shard().num_groups();
    let mut next_group: u16 = 0;
    let interval = config.flush_interval.max(Duration::from_millis(1));
    let mut flush_tick = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!(shard = %shard_id, "shutdown requested");
                break;
            }
            _ = flush_tick.tick() => {
                let group = GroupId::new(next_group);
                next_group = (next_group + 1) % num_groups;
                if let Err(e) = writer.switch_group_buffers(group) {
                    error!(shard = %shard_id, group = %group, error = %e, "buffer switch failed");
                    continue;
                }
                let task = writer.shard().create_flush_task(FlushGroup {
                    group,
                    flush_watermark: writer.shard().latest_offset(),
                });
                let failure_channel = failure_channel.clone();
                tokio::spawn(async move {
                    let response = task.await;
                    report_flush(&failure_channel, shard_id, group, &response).await;
                });
            }
            batch = feed.next_batch() => match batch {
                Ok(Some(batch)) => {
                    writer.ingest(&batch).context(IngestSnafu)?;
                }
                Ok(None) => {
                    info!(shard = %shard_id, "source feed closed");
                    break;
                }
                Err(e) => {
                    warn!(shard = %shard_id, error = %e, "source feed error; stopping");
                    break;
                }
            }
        }
    }

    let drain = async {
        for g in 0..num_groups {
            let group = GroupId::new(g);
            if writer.switch_group_buffers(group).is_err() {
                continue;
            }
            let response = writer
                .shard()
                .create_flush_task(FlushGroup {
                    group,
                    flush_watermark: writer.shard().latest_offset(),
                })
                .await;
            report_flush(&failure_channel, shard_id, group, &response).await;
        }
    };
    if tokio::time::timeout(config.shutdown_timeout, drain).await.is_err() {
        warn!(shard = %shard_id, "shutdown drain timed out; unflushed data dropped");
    }
    Ok(writer)
}

async fn report_flush(
    channel: &Option<Arc<dyn FailureChannel>>,
    shard: ShardId,
    group: GroupId,
    response: &FlushResponse,
) {
    match response {
        FlushResponse::Success | FlushResponse::NotApplied => {}
        other => {
            warn!(shard = %shard, group = %group, response = ?other, "flush did not settle cleanly");
            if let Some(channel) = channel {
                channel.publish(shard, group, other).await;
            }
        }
    }
}

/// Health probe: snapshot the shard's status, bounded by the configured
/// status timeout in case the executor is saturated.
pub async fn probe_status(
    shard: &Arc<TimeSeriesShard>,
    config: &MemStoreConfig,
) -> Option<ShardStatus> {
    let shard = Arc::clone(shard);
    tokio::time::timeout(config.status_timeout, async move { shard.status() })
        .await
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkSet, PlainCodec};
    use crate::eviction::WatermarkEvictionPolicy;
    use crate::sink::{ColumnSink, MetaStore, SinkResponse};
    use data_types::{DatasetSchema, PartitionKey, SampleRow, SequenceNumber};
    use futures::stream::BoxStream;
    use futures::StreamExt;
    use memstore_time::SystemProvider;
    use metric::Registry;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Debug, Default)]
    struct VecSink {
        chunks: Mutex<Vec<ChunkSet>>,
    }

    #[async_trait]
    impl ColumnSink for VecSink {
        async fn write_chunks(
            &self,
            _dataset: &DatasetSchema,
            chunks: BoxStream<'_, ChunkSet>,
        ) -> SinkResponse {
            let mut collected: Vec<_> = chunks.collect().await;
            if collected.is_empty() {
                return SinkResponse::NotApplied;
            }
            self.chunks.lock().append(&mut collected);
            SinkResponse::Success
        }

        async fn add_partitions(
            &self,
            _dataset: &DatasetSchema,
            _keys: Vec<PartitionKey>,
            _shard: ShardId,
        ) -> SinkResponse {
            SinkResponse::Success
        }
    }

    #[derive(Debug, Default)]
    struct VecMetaStore {
        checkpoints: Mutex<Vec<(GroupId, SequenceNumber)>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl MetaStore for VecMetaStore {
        async fn write_checkpoint(
            &self,
            _dataset: &DatasetSchema,
            _shard: ShardId,
            group: GroupId,
            offset: SequenceNumber,
        ) -> Result<(), DynError> {
            if self.fail.load(Ordering::Relaxed) {
                return Err("metastore down".into());
            }
            self.checkpoints.lock().push((group, offset));
            Ok(())
        }
    }

    #[derive(Debug)]
    struct VecFeed {
        batches: VecDeque<Vec<IngestRecord>>,
    }

    #[async_trait]
    impl SourceFeed for VecFeed {
        async fn connect(&mut self) -> Result<(), DynError> {
            Ok(())
        }

        async fn next_batch(&mut self) -> Result<Option<Vec<IngestRecord>>, DynError> {
            Ok(self.batches.pop_front())
        }
    }

    #[derive(Debug, Default)]
    struct VecFailureChannel {
        published: Mutex<Vec<(GroupId, String)>>,
    }

    #[async_trait]
    impl FailureChannel for VecFailureChannel {
        async fn publish(&self, _shard: ShardId, group: GroupId, response: &FlushResponse) {
            self.published.lock().push((group, format!("{:?}", response)));
        }
    }

    fn config() -> MemStoreConfig {
        MemStoreConfig {
            max_chunks_size: 16,
            shard_memory_mb: 1,
            num_block_pages: 1,
            groups_per_shard: 2,
            max_num_partitions: 16,
            demand_paged_chunk_retention: Duration::from_secs(3600),
            // Long relative to the test: flushing happens in the drain.
            flush_interval: Duration::from_secs(3600),
            status_timeout: Duration::from_secs(1),
            connect_timeout: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(5),
            failures_channel_enabled: true,
            failures_topic: "memstore-failures".to_string(),
        }
    }

    fn harness(
        metastore: Arc<VecMetaStore>,
    ) -> (Arc<TimeSeriesShard>, ShardWriter, DatasetSchema, Arc<VecSink>) {
        let schema = DatasetSchema::new("metrics", ["metric"], ["value"]);
        let sink = Arc::new(VecSink::default());
        let (shard, writer) = TimeSeriesShard::new(
            schema.clone(),
            ShardId::new(1),
            &config(),
            Arc::clone(&sink) as _,
            metastore as _,
            Arc::new(WatermarkEvictionPolicy::new(16, 8)),
            Arc::new(PlainCodec),
            Arc::new(SystemProvider::new()),
            &Registry::new(),
        );
        (shard, writer, schema, sink)
    }

    fn record(schema: &DatasetSchema, metric: &str, ts: i64, offset: i64) -> IngestRecord {
        IngestRecord {
            key: schema.partition_key(&[("metric", metric)]).unwrap(),
            row: SampleRow::new(ts, vec![0.25]),
            offset: SequenceNumber::new(offset),
        }
    }

    #[tokio::test]
    async fn loop_ingests_until_the_feed_closes_then_drains() {
        let metastore = Arc::new(VecMetaStore::default());
        let (shard, writer, schema, sink) = harness(Arc::clone(&metastore));

        let feed = Box::new(VecFeed {
            batches: VecDeque::from(vec![
                vec![record(&schema, "cpu", 1, 10), record(&schema, "mem", 2, 11)],
                vec![record(&schema, "cpu", 3, 12)],
            ]),
        });

        let writer = run_ingest_loop(writer, feed, &config(), None, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(shard.latest_offset(), SequenceNumber::new(12));
        assert_eq!(shard.status().rows_ingested, 3);
        // The drain sealed and flushed both groups at the final offset.
        assert!(!sink.chunks.lock().is_empty());
        let checkpoints = metastore.checkpoints.lock();
        assert_eq!(checkpoints.len(), 2);
        assert!(checkpoints.iter().all(|(_, o)| *o == SequenceNumber::new(12)));
        drop(checkpoints);

        writer.shutdown();
    }

    #[tokio::test]
    async fn failed_flushes_reach_the_failure_channel() {
        let metastore = Arc::new(VecMetaStore::default());
        metastore.fail.store(true, Ordering::Relaxed);
        let (_shard, writer, schema, _sink) = harness(Arc::clone(&metastore));

        let feed = Box::new(VecFeed {
            batches: VecDeque::from(vec![vec![record(&schema, "cpu", 1, 10)]]),
        });
        let channel = Arc::new(VecFailureChannel::default());

        run_ingest_loop(
            writer,
            feed,
            &config(),
            Some(Arc::clone(&channel) as _),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        let published = channel.published.lock();
        assert!(!published.is_empty());
        assert!(published.iter().all(|(_, r)| r.contains("DataDropped")));
    }

    #[tokio::test]
    async fn probe_status_reports_within_the_deadline() {
        let metastore = Arc::new(VecMetaStore::default());
        let (shard, _writer, _schema, _sink) = harness(metastore);

        let status = probe_status(&shard, &config()).await.unwrap();
        assert_eq!(status.shard, ShardId::new(1));
        assert_eq!(status.num_partitions, 0);
    }
}
