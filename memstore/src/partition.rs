//! Per-series state: active write buffers, sealed chunks, and the
//! buffer-switch / make-flush-chunks protocol.

use std::sync::{
    atomic::{AtomicBool, AtomicI64, Ordering},
    Arc,
};

use data_types::{ChunkId, GroupId, PartitionId, PartitionKey, SampleRow, SequenceNumber};
use parking_lot::{Mutex, RwLock};
use snafu::{ResultExt, Snafu};
use tracing::trace;

use crate::{
    block::{BlockError, BlockMemFactory},
    buffer::{BufferError, WriteBufferPool, WriteBufferSet},
    chunk::{encode_chunk_slot, ChunkCodec, ChunkRef, ChunkSet},
};

/// Errors from a single partition's ingest or flush-encode path.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum PartitionError {
    #[snafu(display("acquiring write buffers for partition {}: {}", id, source))]
    Buffers {
        id: PartitionId,
        source: BufferError,
    },

    #[snafu(display("writing chunks for partition {}: {}", id, source))]
    ChunkWrite { id: PartitionId, source: BlockError },
}

#[derive(Debug, Default)]
struct BufferState {
    /// The set ingest currently appends to.
    active: Option<WriteBufferSet>,
    /// Sealed sets awaiting encoding by the next flush.
    frozen: Vec<WriteBufferSet>,
}

/// One time series: identity, mutable buffers, and the encoded chunks the
/// series currently exposes to queries.
///
/// The chunk list is copy-on-write behind an [`Arc`]: readers snapshot it
/// and always observe either the old or the new list, never a torn one.
/// That is what lets the block store's reclaim callback run on whichever
/// thread triggered an allocation.
#[derive(Debug)]
pub struct TimeSeriesPartition {
    id: PartitionId,
    key: PartitionKey,
    group: GroupId,
    buffer_pool: Arc<WriteBufferPool>,
    codec: Arc<dyn ChunkCodec>,
    buffers: Mutex<BufferState>,
    chunks: RwLock<Arc<Vec<ChunkRef>>>,
    last_chunk_id: AtomicI64,
    flushing: AtomicBool,
}

impl TimeSeriesPartition {
    pub(crate) fn new(
        id: PartitionId,
        key: PartitionKey,
        group: GroupId,
        buffer_pool: Arc<WriteBufferPool>,
        codec: Arc<dyn ChunkCodec>,
    ) -> Self {
        Self {
            id,
            key,
            group,
            buffer_pool,
            codec,
            buffers: Mutex::new(BufferState::default()),
            chunks: RwLock::new(Arc::new(Vec::new())),
            last_chunk_id: AtomicI64::new(i64::MIN),
            flushing: AtomicBool::new(false),
        }
    }

    /// This partition's dense shard-local ID.
    pub fn id(&self) -> PartitionId {
        self.id
    }

    /// The flush group this partition belongs to.
    pub fn group(&self) -> GroupId {
        self.group
    }

    /// The canonical binary partition key.
    pub fn bin_partition(&self) -> &PartitionKey {
        &self.key
    }

    /// Append one sample into the active buffer set, acquiring or growing
    /// buffers as needed and sealing a set that reached the chunk target.
    pub fn ingest(&self, row: &SampleRow, offset: SequenceNumber) -> Result<(), PartitionError> {
        let mut buffers = self.buffers.lock();
        if buffers.active.is_none() {
            buffers.active = Some(
                self.buffer_pool
                    .acquire()
                    .context(BuffersSnafu { id: self.id })?,
            );
        }

        let seal = {
            let active = buffers.active.as_mut().expect("installed above");
            if active.is_full() {
                !self
                    .buffer_pool
                    .try_grow(active)
                    .context(BuffersSnafu { id: self.id })?
            } else {
                false
            }
        };
        if seal {
            let sealed = buffers.active.take().expect("checked above");
            buffers.frozen.push(sealed);
            buffers.active = Some(
                self.buffer_pool
                    .acquire()
                    .context(BuffersSnafu { id: self.id })?,
            );
        }

        buffers
            .active
            .as_mut()
            .expect("installed above")
            .append(row);
        trace!(partition = %self.id, offset = offset.get(), "buffered sample");
        Ok(())
    }

    /// Seal the active buffer set: it joins the frozen list and will be
    /// encoded by the next flush. An empty active set goes back to the pool
    /// instead, which is what makes idle partitions evictable.
    pub fn switch_buffers(&self) {
        let mut buffers = self.buffers.lock();
        if let Some(active) = buffers.active.take() {
            if active.is_empty() {
                self.buffer_pool.release(active);
            } else {
                buffers.frozen.push(active);
            }
        }
    }

    /// Whether sealed data is waiting for a flush.
    pub(crate) fn has_unflushed(&self) -> bool {
        !self.buffers.lock().frozen.is_empty()
    }

    /// Encode every frozen buffer set into a chunk allocated from `holder`,
    /// expose the chunks to queries, and return the frozen sets to the
    /// buffer pool.
    ///
    /// Marks the partition as flushing until [`Self::flush_complete`].
    pub fn make_flush_chunks(
        &self,
        holder: &BlockMemFactory,
    ) -> Result<Vec<ChunkSet>, PartitionError> {
        self.flushing.store(true, Ordering::Release);
        let frozen = {
            let mut buffers = self.buffers.lock();
            std::mem::take(&mut buffers.frozen)
        };

        let mut out = Vec::with_capacity(frozen.len());
        let mut scratch = Vec::new();
        let mut frozen = frozen.into_iter();
        while let Some(set) = frozen.next() {
            if set.is_empty() {
                self.buffer_pool.release(set);
                continue;
            }
            scratch.clear();
            self.codec.encode(set.timestamps(), set.columns(), &mut scratch);
            let chunk_id = self.next_chunk_id(set.timestamps()[0]);
            let slot = encode_chunk_slot(self.id, chunk_id);
            match holder.write_chunk(&slot, &scratch) {
                Ok(location) => {
                    let chunk = ChunkRef::new(chunk_id, set.len() as u32, location);
                    self.attach_chunk(chunk.clone());
                    out.push(ChunkSet {
                        partition_id: self.id,
                        partition_key: self.key.clone(),
                        chunk,
                    });
                    self.buffer_pool.release(set);
                }
                Err(source) => {
                    // The samples in this and any remaining frozen set are
                    // lost; hand the buffers back so ingest keeps moving.
                    self.buffer_pool.release(set);
                    for rest in frozen {
                        self.buffer_pool.release(rest);
                    }
                    return Err(PartitionError::ChunkWrite {
                        id: self.id,
                        source,
                    });
                }
            }
        }
        Ok(out)
    }

    /// Clear the flushing flag set by [`Self::make_flush_chunks`].
    pub(crate) fn flush_complete(&self) {
        self.flushing.store(false, Ordering::Release);
    }

    /// Time-ordered chunk IDs: the first timestamp of the sealed buffer,
    /// forced strictly increasing across this partition's chunks.
    fn next_chunk_id(&self, first_ts: i64) -> ChunkId {
        let mut prev = self.last_chunk_id.load(Ordering::Relaxed);
        loop {
            let next = first_ts.max(prev.saturating_add(1));
            match self.last_chunk_id.compare_exchange_weak(
                prev,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return ChunkId::new(next),
                Err(seen) => prev = seen,
            }
        }
    }

    /// Add a chunk to the query-visible list, keeping chunk-ID order.
    /// Returns `false` if a chunk with the same ID is already present.
    pub(crate) fn attach_chunk(&self, chunk: ChunkRef) -> bool {
        let mut guard = self.chunks.write();
        if guard.iter().any(|c| c.chunk_id() == chunk.chunk_id()) {
            return false;
        }
        let mut next = Vec::with_capacity(guard.len() + 1);
        next.extend(guard.iter().cloned());
        next.push(chunk);
        next.sort_by_key(|c| c.chunk_id());
        *guard = Arc::new(next);
        true
    }

    /// Drop the chunk with the given ID, typically because the block store
    /// reclaimed its backing block. Unknown IDs are ignored.
    pub fn remove_chunks_at(&self, chunk_id: ChunkId) -> bool {
        let mut guard = self.chunks.write();
        if !guard.iter().any(|c| c.chunk_id() == chunk_id) {
            return false;
        }
        let next: Vec<_> = guard
            .iter()
            .filter(|c| c.chunk_id() != chunk_id)
            .cloned()
            .collect();
        *guard = Arc::new(next);
        true
    }

    /// Snapshot of the query-visible chunk list.
    pub fn chunks(&self) -> Arc<Vec<ChunkRef>> {
        Arc::clone(&self.chunks.read())
    }

    /// Whether this partition is ingesting, holds sealed data, or is part
    /// of an in-flight flush. Active partitions are never evicted.
    pub fn is_active(&self) -> bool {
        if self.flushing.load(Ordering::Acquire) {
            return true;
        }
        let buffers = self.buffers.lock();
        buffers.active.is_some() || !buffers.frozen.is_empty()
    }

    /// Return any held buffer sets to the pool. Used by shard reset, where
    /// partitions disappear without flushing.
    pub(crate) fn release_buffers(&self) {
        let mut buffers = self.buffers.lock();
        if let Some(active) = buffers.active.take() {
            self.buffer_pool.release(active);
        }
        for set in buffers.frozen.drain(..) {
            self.buffer_pool.release(set);
        }
    }
}
