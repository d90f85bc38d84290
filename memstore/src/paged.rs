//! Demand paging: chunks fetched back from the durable sink on a query
//! miss are cached in the block arena, in time-ordered blocks the manager
//! only recycles once they age past the retention horizon.

use std::{fmt::Debug, sync::Arc};

use async_trait::async_trait;
use data_types::{ChunkId, DatasetSchema, PartitionKey, ShardId};
use metric::{Registry, U64Counter};
use tracing::debug;

use crate::{
    block::{BlockError, BlockManager, BlockMemFactory},
    chunk::{encode_chunk_slot, ChunkRef},
    partition::TimeSeriesPartition,
    sink::DynError,
};

/// A chunk as read back from the durable sink.
#[derive(Debug, Clone)]
pub struct RawChunk {
    /// The chunk's original time-ordered ID.
    pub chunk_id: ChunkId,
    /// Samples encoded in the payload.
    pub num_rows: u32,
    /// The encoded payload, exactly as flushed.
    pub payload: Vec<u8>,
}

/// Read side of the durable sink, used to fault chunks back in.
#[async_trait]
pub trait RawChunkSource: Debug + Send + Sync {
    /// Durable chunks for `key` with IDs strictly below `before`, oldest
    /// first.
    async fn read_chunks(
        &self,
        dataset: &DatasetSchema,
        shard: ShardId,
        key: &PartitionKey,
        before: ChunkId,
    ) -> Result<Vec<RawChunk>, DynError>;
}

/// Caches demand-paged chunks in the shard's block arena.
#[derive(Debug)]
pub struct DemandPagedChunkStore {
    holder: BlockMemFactory,
    chunks_paged_in: U64Counter,
}

impl DemandPagedChunkStore {
    /// Create a store writing into `manager`'s arena.
    pub fn new(manager: Arc<BlockManager>, registry: &Registry) -> Self {
        let chunks_paged_in = registry
            .register_metric::<U64Counter>(
                "memstore-chunks-paged-in",
                "Chunks faulted back in from the durable sink",
            )
            .recorder(&[]);
        Self {
            holder: BlockMemFactory::new(manager, true),
            chunks_paged_in,
        }
    }

    /// Cache one raw chunk and re-attach it to `partition`. Returns `false`
    /// if a chunk with that ID is already resident.
    pub fn page_in(
        &self,
        partition: &TimeSeriesPartition,
        raw: &RawChunk,
    ) -> Result<bool, BlockError> {
        if partition
            .chunks()
            .iter()
            .any(|c| c.chunk_id() == raw.chunk_id)
        {
            return Ok(false);
        }
        let slot = encode_chunk_slot(partition.id(), raw.chunk_id);
        let location = self.holder.write_chunk(&slot, &raw.payload)?;
        let attached = partition.attach_chunk(ChunkRef::new(raw.chunk_id, raw.num_rows, location));
        if attached {
            self.chunks_paged_in.inc(1);
            debug!(partition = %partition.id(), chunk = %raw.chunk_id, "paged in chunk");
        }
        // Filled blocks queue for reclaim now; the retention horizon keeps
        // them resident until they age out.
        self.holder.mark_filled_blocks_reclaimable();
        Ok(attached)
    }

    /// Fault in every durable chunk older than the oldest resident one.
    /// Returns how many chunks became resident.
    pub async fn page_in_missing(
        &self,
        source: &dyn RawChunkSource,
        dataset: &DatasetSchema,
        shard: ShardId,
        partition: &TimeSeriesPartition,
    ) -> Result<usize, DynError> {
        let oldest = partition
            .chunks()
            .first()
            .map(|c| c.chunk_id())
            .unwrap_or_else(|| ChunkId::new(i64::MAX));
        let raw = source
            .read_chunks(dataset, shard, partition.bin_partition(), oldest)
            .await?;
        let mut paged = 0;
        for chunk in &raw {
            if self.page_in(partition, chunk)? {
                paged += 1;
            }
        }
        Ok(paged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::PAGE_SIZE;
    use crate::buffer::WriteBufferPool;
    use crate::chunk::PlainCodec;
    use crate::partition::TimeSeriesPartition;
    use data_types::{GroupId, PartitionId};
    use std::time::Duration;

    #[derive(Debug)]
    struct NopListener;

    impl crate::block::ReclaimListener for NopListener {
        fn on_reclaim(&self, _metadata: &[u8]) {}
    }

    fn partition() -> TimeSeriesPartition {
        let schema = DatasetSchema::new("metrics", ["metric"], ["value"]);
        let key = schema.partition_key(&[("metric", "cpu")]).unwrap();
        TimeSeriesPartition::new(
            PartitionId::new(3),
            key,
            GroupId::new(0),
            Arc::new(WriteBufferPool::new(16, 4, 1, &Registry::new())),
            Arc::new(PlainCodec),
        )
    }

    #[test]
    fn paging_in_attaches_and_deduplicates() {
        let registry = Registry::new();
        let manager = Arc::new(BlockManager::new(
            4 * PAGE_SIZE,
            1,
            Duration::from_secs(3600),
            Arc::new(NopListener),
            Arc::new(memstore_time::SystemProvider::new()),
        ));
        let store = DemandPagedChunkStore::new(manager, &registry);
        let partition = partition();

        let raw = RawChunk {
            chunk_id: ChunkId::new(42),
            num_rows: 10,
            payload: vec![1, 2, 3, 4],
        };
        assert!(store.page_in(&partition, &raw).unwrap());
        assert!(!store.page_in(&partition, &raw).unwrap());

        let chunks = partition.chunks();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].chunk_id(), ChunkId::new(42));
        assert_eq!(chunks[0].payload(), &[1, 2, 3, 4]);
        assert_eq!(
            registry
                .get_instrument::<metric::Metric<U64Counter>>("memstore-chunks-paged-in")
                .unwrap()
                .get_observer(&metric::Attributes::default())
                .unwrap()
                .fetch(),
            1
        );
    }
}
