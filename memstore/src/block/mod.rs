//! Off-heap block store: page-aligned blocks, the reclaim protocol, and
//! flush-scoped allocation holders.

mod arena;
mod holder;
mod manager;

pub use arena::PAGE_SIZE;
pub use holder::{BlockMemFactory, BlockMemFactoryPool, ChunkLocation, FactoryLease};
pub use manager::{Block, BlockError, BlockId, BlockManager, ReclaimListener};
