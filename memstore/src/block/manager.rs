//! The block store: a fixed budget of page-aligned blocks, recycled under
//! allocation pressure with a reclaim callback per stored metadata slot.

use std::{collections::VecDeque, fmt, sync::Arc, time::Duration};

use memstore_time::{Time, TimeProvider};
use parking_lot::Mutex;
use snafu::Snafu;
use tracing::{debug, warn};

use super::arena::{BlockMem, PAGE_SIZE};

/// Bytes of length prefix preceding each metadata slot at a block's tail.
pub(super) const META_LEN_PREFIX: usize = 2;

/// Errors from the block store.
#[derive(Debug, Snafu)]
#[allow(missing_copy_implementations, missing_docs)]
pub enum BlockError {
    #[snafu(display("block store exhausted: all {} blocks in use, none reclaimable", total))]
    BlocksExhausted { total: usize },

    #[snafu(display("chunk of {} bytes does not fit a {} byte block", len, max))]
    ChunkTooLarge { len: usize, max: usize },

    #[snafu(display("block holder pool exhausted ({} holders outstanding)", capacity))]
    HoldersExhausted { capacity: usize },

    #[snafu(display("block store is shut down"))]
    ShutDown,
}

/// Identifier of a block within one shard's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockId(u32);

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One page-aligned span of the arena, filled front-to-back with chunk
/// payloads and back-to-front with length-prefixed metadata slots.
#[derive(Debug)]
pub struct Block {
    id: BlockId,
    mem: Arc<BlockMem>,
    payload_used: usize,
    meta_used: usize,
    time_ordered: bool,
    reclaimable_since: Option<Time>,
}

impl Block {
    fn new(id: BlockId, mem: Arc<BlockMem>, time_ordered: bool) -> Self {
        Self {
            id,
            mem,
            payload_used: 0,
            meta_used: 0,
            time_ordered,
            reclaimable_since: None,
        }
    }

    /// This block's ID.
    pub fn id(&self) -> BlockId {
        self.id
    }

    pub(crate) fn mem(&self) -> &Arc<BlockMem> {
        &self.mem
    }

    fn remaining(&self) -> usize {
        self.mem.capacity() - self.payload_used - self.meta_used
    }

    fn is_empty(&self) -> bool {
        self.payload_used == 0 && self.meta_used == 0
    }

    /// Can a `(metadata, payload)` pair of the given sizes still fit?
    pub(crate) fn has_capacity(&self, metadata_len: usize, payload_len: usize) -> bool {
        metadata_len + META_LEN_PREFIX + payload_len <= self.remaining()
    }

    /// Append payload bytes, returning the offset they were written at.
    ///
    /// The caller must have checked capacity via [`Self::has_capacity`].
    pub(crate) fn alloc_payload(&mut self, src: &[u8]) -> u32 {
        debug_assert!(self.payload_used + src.len() + self.meta_used <= self.mem.capacity());
        let offset = self.payload_used;
        self.mem.write(offset, src);
        self.payload_used += src.len();
        offset as u32
    }

    /// Append a metadata slot at the tail.
    ///
    /// The caller must have checked capacity via [`Self::has_capacity`].
    pub(crate) fn alloc_metadata(&mut self, slot: &[u8]) {
        let cap = self.mem.capacity();
        let end = cap - self.meta_used;
        let len = slot.len();
        debug_assert!(len <= u16::MAX as usize);
        debug_assert!(self.payload_used + self.meta_used + len + META_LEN_PREFIX <= cap);
        self.mem.write(end - META_LEN_PREFIX, &(len as u16).to_le_bytes());
        self.mem.write(end - META_LEN_PREFIX - len, slot);
        self.meta_used += len + META_LEN_PREFIX;
    }

    /// Walk every metadata slot written into this block.
    pub(crate) fn for_each_metadata(&self, mut f: impl FnMut(&[u8])) {
        let cap = self.mem.capacity();
        let floor = cap - self.meta_used;
        let mut pos = cap;
        while pos > floor {
            let prefix = self.mem.read(pos - META_LEN_PREFIX, META_LEN_PREFIX);
            let len = u16::from_le_bytes([prefix[0], prefix[1]]) as usize;
            let start = pos - META_LEN_PREFIX - len;
            f(self.mem.read(start, len));
            pos = start;
        }
    }

    fn reset(&mut self, time_ordered: bool) {
        self.payload_used = 0;
        self.meta_used = 0;
        self.time_ordered = time_ordered;
        self.reclaimable_since = None;
    }
}

/// Invoked once per metadata slot as its containing block is recycled.
///
/// Implementations must tolerate being called from whatever thread demanded
/// the allocation that triggered the reclaim, and must not re-enter the
/// block store.
pub trait ReclaimListener: fmt::Debug + Send + Sync {
    /// `metadata` is one slot exactly as written by the flush path.
    fn on_reclaim(&self, metadata: &[u8]);
}

#[derive(Debug)]
struct ManagerState {
    free: VecDeque<Block>,
    reclaimable: VecDeque<Block>,
    allocated: usize,
    next_id: u32,
    shut_down: bool,
}

/// Owns the shard's block budget.
///
/// Blocks are handed to holders for filling, come back through
/// [`Self::mark_reclaimable`], and are recycled on demand when the budget is
/// exhausted: the oldest eligible reclaimable block has its metadata slots
/// replayed through the [`ReclaimListener`] and is reused. Time-ordered
/// blocks (demand-paged chunks) are only eligible once they have sat in the
/// queue for the configured retention horizon.
///
/// A block's memory is reused only while its handle is sole-owned, so chunk
/// readers holding a reference to the old contents can never observe the
/// new writer.
#[derive(Debug)]
pub struct BlockManager {
    block_size: usize,
    max_blocks: usize,
    retention: Duration,
    time_provider: Arc<dyn TimeProvider>,
    listener: Arc<dyn ReclaimListener>,
    state: Mutex<ManagerState>,
}

enum Candidate {
    Ready(Block),
    Reclaim(Block),
}

impl BlockManager {
    /// Create a manager owning `total_bytes` of arena split into blocks of
    /// `pages_per_block` pages.
    ///
    /// # Panics
    ///
    /// If the budget does not hold at least two blocks.
    pub fn new(
        total_bytes: usize,
        pages_per_block: usize,
        retention: Duration,
        listener: Arc<dyn ReclaimListener>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        let block_size = pages_per_block
            .checked_mul(PAGE_SIZE)
            .expect("block size overflow");
        let max_blocks = total_bytes / block_size;
        assert!(
            max_blocks >= 2,
            "block arena of {} bytes holds fewer than two {} byte blocks",
            total_bytes,
            block_size
        );
        Self {
            block_size,
            max_blocks,
            retention,
            time_provider,
            listener,
            state: Mutex::new(ManagerState {
                free: VecDeque::new(),
                reclaimable: VecDeque::new(),
                allocated: 0,
                next_id: 0,
                shut_down: false,
            }),
        }
    }

    /// Bytes per block.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Blocks currently sitting in the free list.
    pub fn num_free(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Blocks currently awaiting reclamation.
    pub fn num_reclaimable(&self) -> usize {
        self.state.lock().reclaimable.len()
    }

    /// Hand out a block for filling, reclaiming under pressure.
    pub(crate) fn request_block(&self, time_ordered: bool) -> Result<Block, BlockError> {
        loop {
            let candidate = {
                let mut state = self.state.lock();
                if state.shut_down {
                    return Err(BlockError::ShutDown);
                }
                if let Some(pos) = state
                    .free
                    .iter()
                    .position(|b| Arc::strong_count(b.mem()) == 1)
                {
                    let mut block = state.free.remove(pos).expect("position just found");
                    block.reset(time_ordered);
                    Candidate::Ready(block)
                } else if state.allocated < self.max_blocks {
                    state.allocated += 1;
                    let id = BlockId(state.next_id);
                    state.next_id += 1;
                    Candidate::Ready(Block::new(
                        id,
                        Arc::new(BlockMem::new(self.block_size)),
                        time_ordered,
                    ))
                } else {
                    let now = self.time_provider.now();
                    match state.reclaimable.iter().position(|b| self.eligible(b, now)) {
                        Some(pos) => {
                            Candidate::Reclaim(state.reclaimable.remove(pos).expect("position just found"))
                        }
                        None => {
                            warn!(total = self.max_blocks, "block store exhausted");
                            return Err(BlockError::BlocksExhausted {
                                total: self.max_blocks,
                            });
                        }
                    }
                }
            };

            match candidate {
                Candidate::Ready(block) => return Ok(block),
                Candidate::Reclaim(mut block) => {
                    // Listener callbacks run outside the manager lock so the
                    // partitions they touch can be doing their own locking.
                    self.run_reclaim(&block);
                    if Arc::strong_count(block.mem()) == 1 {
                        block.reset(time_ordered);
                        return Ok(block);
                    }
                    // A query still holds the old contents; park the block in
                    // the free list and try the next reclaimable one.
                    self.state.lock().free.push_back(block);
                }
            }
        }
    }

    /// Queue a filled block for recycling. Empty blocks go straight back to
    /// the free list.
    pub(crate) fn mark_reclaimable(&self, mut block: Block) {
        let mut state = self.state.lock();
        if state.shut_down {
            return;
        }
        if block.is_empty() {
            state.free.push_back(block);
        } else {
            block.reclaimable_since = Some(self.time_provider.now());
            state.reclaimable.push_back(block);
        }
    }

    /// Immediately reclaim the oldest eligible block, if any, instead of
    /// waiting for allocation pressure.
    ///
    /// Returns the number of metadata slots replayed through the listener.
    pub fn reclaim_oldest(&self) -> Option<usize> {
        let block = {
            let mut state = self.state.lock();
            let now = self.time_provider.now();
            let pos = state.reclaimable.iter().position(|b| self.eligible(b, now))?;
            state.reclaimable.remove(pos).expect("position just found")
        };
        let slots = self.run_reclaim(&block);
        self.state.lock().free.push_back(block);
        Some(slots)
    }

    fn eligible(&self, block: &Block, now: Time) -> bool {
        if !block.time_ordered {
            return true;
        }
        block.reclaimable_since.map_or(true, |since| {
            now.checked_duration_since(since)
                .map_or(false, |age| age >= self.retention)
        })
    }

    fn run_reclaim(&self, block: &Block) -> usize {
        let mut slots = 0;
        block.for_each_metadata(|slot| {
            slots += 1;
            self.listener.on_reclaim(slot);
        });
        debug!(block = %block.id(), slots, "reclaimed block");
        slots
    }

    /// Drop every pooled block. Terminal: subsequent allocation fails.
    ///
    /// Memory physically returns to the OS once outstanding chunk references
    /// are gone.
    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shut_down = true;
        state.free.clear();
        state.reclaimable.clear();
        state.allocated = 0;
    }
}
