//! Flush-scoped allocation contexts ("holders") and their bounded pool.
//!
//! A holder is checked out for a single flush, writes (metadata, payload)
//! pairs into a private current block, and is returned to the pool once the
//! flush settles. Releasing a holder marks the blocks it wrote reclaimable,
//! which is what eventually lets the manager recycle them.

use std::{ops::Deref, sync::Arc};

use parking_lot::Mutex;

use super::arena::BlockMem;
use super::manager::{Block, BlockError, BlockManager, META_LEN_PREFIX};

/// Where one chunk's payload landed in the arena.
///
/// Holding a `ChunkLocation` pins the backing block memory: the manager
/// never reuses a block whose memory is still referenced.
#[derive(Debug, Clone)]
pub struct ChunkLocation {
    mem: Arc<BlockMem>,
    offset: u32,
    len: u32,
}

impl ChunkLocation {
    /// The payload bytes.
    pub fn bytes(&self) -> &[u8] {
        self.mem.read(self.offset as usize, self.len as usize)
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug, Default)]
struct FactoryState {
    current: Option<Block>,
    used: Vec<Block>,
}

/// A stateful allocation context writing into a private current block.
#[derive(Debug)]
pub struct BlockMemFactory {
    manager: Arc<BlockManager>,
    time_ordered: bool,
    state: Mutex<FactoryState>,
}

impl BlockMemFactory {
    pub(crate) fn new(manager: Arc<BlockManager>, time_ordered: bool) -> Self {
        Self {
            manager,
            time_ordered,
            state: Mutex::new(FactoryState::default()),
        }
    }

    /// Write one chunk: a metadata slot plus its payload, kept together in
    /// the same block. Rolls to a fresh block when the current one is full.
    pub fn write_chunk(&self, metadata: &[u8], payload: &[u8]) -> Result<ChunkLocation, BlockError> {
        let needed = metadata.len() + META_LEN_PREFIX + payload.len();
        if needed > self.manager.block_size() {
            return Err(BlockError::ChunkTooLarge {
                len: needed,
                max: self.manager.block_size(),
            });
        }

        let mut state = self.state.lock();
        let roll = state
            .current
            .as_ref()
            .map_or(true, |b| !b.has_capacity(metadata.len(), payload.len()));
        if roll {
            let fresh = self.manager.request_block(self.time_ordered)?;
            if let Some(prev) = state.current.replace(fresh) {
                state.used.push(prev);
            }
        }

        let block = state.current.as_mut().expect("block installed above");
        let offset = block.alloc_payload(payload);
        block.alloc_metadata(metadata);
        Ok(ChunkLocation {
            mem: Arc::clone(block.mem()),
            offset,
            len: payload.len() as u32,
        })
    }

    /// Queue every block this holder wrote (the current one included) for
    /// reclamation. Idempotent; called before release and again as the
    /// release backstop.
    pub fn mark_used_blocks_reclaimable(&self) {
        let mut state = self.state.lock();
        let used = std::mem::take(&mut state.used);
        for block in used {
            self.manager.mark_reclaimable(block);
        }
        if let Some(block) = state.current.take() {
            self.manager.mark_reclaimable(block);
        }
    }

    /// Queue only the filled (non-current) blocks for reclamation, keeping
    /// the current block open for further writes. Used by long-lived
    /// holders such as the demand-paged chunk store.
    pub fn mark_filled_blocks_reclaimable(&self) {
        let mut state = self.state.lock();
        let used = std::mem::take(&mut state.used);
        for block in used {
            self.manager.mark_reclaimable(block);
        }
    }
}

#[derive(Debug)]
struct PoolState {
    free: Vec<Arc<BlockMemFactory>>,
    created: usize,
}

/// Bounded pool of [`BlockMemFactory`] holders, one checkout per flush.
#[derive(Debug)]
pub struct BlockMemFactoryPool {
    manager: Arc<BlockManager>,
    capacity: usize,
    state: Mutex<PoolState>,
}

impl BlockMemFactoryPool {
    /// Create a pool of at most `capacity` holders over `manager`.
    pub fn new(manager: Arc<BlockManager>, capacity: usize) -> Self {
        assert!(capacity > 0, "holder pool capacity must be positive");
        Self {
            manager,
            capacity,
            state: Mutex::new(PoolState {
                free: Vec::new(),
                created: 0,
            }),
        }
    }

    /// Borrow a holder for one flush. The lease returns it on drop.
    pub fn checkout(self: &Arc<Self>) -> Result<FactoryLease, BlockError> {
        let factory = {
            let mut state = self.state.lock();
            match state.free.pop() {
                Some(f) => f,
                None => {
                    if state.created >= self.capacity {
                        return Err(BlockError::HoldersExhausted {
                            capacity: self.capacity,
                        });
                    }
                    state.created += 1;
                    Arc::new(BlockMemFactory::new(Arc::clone(&self.manager), false))
                }
            }
        };
        Ok(FactoryLease {
            pool: Arc::clone(self),
            factory: Some(factory),
        })
    }

    fn release(&self, factory: Arc<BlockMemFactory>) {
        factory.mark_used_blocks_reclaimable();
        self.state.lock().free.push(factory);
    }
}

/// RAII lease on a pooled holder.
///
/// Dropping the lease marks the holder's used blocks reclaimable and returns
/// it to the pool, which keeps holders from leaking out of failed flushes.
#[derive(Debug)]
pub struct FactoryLease {
    pool: Arc<BlockMemFactoryPool>,
    factory: Option<Arc<BlockMemFactory>>,
}

impl Deref for FactoryLease {
    type Target = BlockMemFactory;

    fn deref(&self) -> &Self::Target {
        self.factory.as_ref().expect("present until drop")
    }
}

impl Drop for FactoryLease {
    fn drop(&mut self) {
        if let Some(factory) = self.factory.take() {
            self.pool.release(factory);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::arena::PAGE_SIZE;
    use super::super::manager::ReclaimListener;
    use super::*;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct NopListener;

    impl ReclaimListener for NopListener {
        fn on_reclaim(&self, _metadata: &[u8]) {}
    }

    fn test_manager(blocks: usize) -> Arc<BlockManager> {
        Arc::new(BlockManager::new(
            blocks * PAGE_SIZE,
            1,
            Duration::ZERO,
            Arc::new(NopListener),
            Arc::new(memstore_time::SystemProvider::new()),
        ))
    }

    #[test]
    fn holder_rolls_blocks_as_they_fill() {
        let manager = test_manager(4);
        let factory = BlockMemFactory::new(Arc::clone(&manager), false);

        // Each chunk takes over half a block, so every write rolls.
        let payload = vec![7u8; PAGE_SIZE / 2 + 64];
        let a = factory.write_chunk(b"0123456789ab", &payload).unwrap();
        let b = factory.write_chunk(b"0123456789ab", &payload).unwrap();
        assert_eq!(a.bytes(), &payload[..]);
        assert_eq!(b.bytes(), &payload[..]);

        factory.mark_used_blocks_reclaimable();
        assert_eq!(manager.num_reclaimable(), 2);
        // Idempotent.
        factory.mark_used_blocks_reclaimable();
        assert_eq!(manager.num_reclaimable(), 2);
    }

    #[test]
    fn oversized_chunk_is_rejected() {
        let manager = test_manager(2);
        let factory = BlockMemFactory::new(manager, false);
        let err = factory
            .write_chunk(b"0123456789ab", &vec![0u8; PAGE_SIZE + 1])
            .unwrap_err();
        assert!(matches!(err, BlockError::ChunkTooLarge { .. }));
    }

    #[test]
    fn pool_is_bounded_and_leases_return_on_drop() {
        let manager = test_manager(4);
        let pool = Arc::new(BlockMemFactoryPool::new(manager, 1));

        let lease = pool.checkout().unwrap();
        assert!(matches!(
            pool.checkout(),
            Err(BlockError::HoldersExhausted { .. })
        ));
        drop(lease);
        pool.checkout().unwrap();
    }
}
