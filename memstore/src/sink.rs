//! External collaborator interfaces: the durable columnar sink and the
//! checkpoint metastore.

use std::fmt::Debug;

use async_trait::async_trait;
use data_types::{DatasetSchema, GroupId, PartitionKey, SequenceNumber, ShardId};
use futures::stream::BoxStream;

use crate::chunk::ChunkSet;

/// Boxed error carried across the collaborator boundary.
pub type DynError = Box<dyn std::error::Error + Send + Sync>;

/// Outcome of one sink write.
#[derive(Debug)]
pub enum SinkResponse {
    /// The write is durable.
    Success,
    /// Nothing to write; no durability claim is made.
    NotApplied,
    /// The write failed after the sink's internal retries.
    Error(DynError),
}

/// Outcome of one flush task.
#[derive(Debug)]
pub enum FlushResponse {
    /// Chunks and partition keys are durable and the checkpoint advanced.
    Success,
    /// Nothing was flushed and no checkpoint was written.
    NotApplied,
    /// Some data was lost; the watermark did not advance, so recovery
    /// replays the window.
    DataDropped,
    /// The flush invocation itself was invalid.
    Error(DynError),
}

/// The durable columnar sink. Implementations retry internally; only
/// post-retry failure surfaces as [`SinkResponse::Error`].
#[async_trait]
pub trait ColumnSink: Debug + Send + Sync {
    /// Stream encoded chunk sets to durable storage.
    async fn write_chunks(
        &self,
        dataset: &DatasetSchema,
        chunks: BoxStream<'_, ChunkSet>,
    ) -> SinkResponse;

    /// Persist newly seen partition keys for `shard`.
    async fn add_partitions(
        &self,
        dataset: &DatasetSchema,
        keys: Vec<PartitionKey>,
        shard: ShardId,
    ) -> SinkResponse;
}

/// Stores per-(dataset, shard, group) checkpoint offsets.
#[async_trait]
pub trait MetaStore: Debug + Send + Sync {
    /// Record that group `group` of `shard` is durable up to `offset`.
    /// `offset` must be positive.
    async fn write_checkpoint(
        &self,
        dataset: &DatasetSchema,
        shard: ShardId,
        group: GroupId,
        offset: SequenceNumber,
    ) -> Result<(), DynError>;
}
