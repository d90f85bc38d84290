//! Mutable ingestion buffers: a byte-budgeted buffer arena and a pool of
//! reusable per-partition vector sets.
//!
//! Buffer sets start small (`max_chunks_size / 8` samples) and grow toward
//! the chunk target while they stay within the arena budget. A partition
//! holds at most one active set; sealed sets travel to the flush path and
//! come back through [`WriteBufferPool::release`].

use data_types::SampleRow;
use metric::{Registry, U64Gauge};
use parking_lot::Mutex;
use snafu::Snafu;

/// Errors from the write buffer arena.
#[derive(Debug, Snafu)]
#[allow(missing_copy_implementations, missing_docs)]
pub enum BufferError {
    #[snafu(display(
        "write buffer arena exhausted: {} bytes requested, {} bytes free",
        requested,
        available
    ))]
    ArenaExhausted { requested: usize, available: usize },
}

/// Byte-budget accounting for the write buffer arena.
///
/// This is bookkeeping, not an allocator: vectors own their memory, the
/// manager just refuses growth beyond the configured budget so ingest
/// pressure surfaces as an error instead of unbounded growth.
#[derive(Debug)]
pub struct NativeMemoryManager {
    capacity: usize,
    used: Mutex<usize>,
}

impl NativeMemoryManager {
    /// Create a manager with a budget of `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            used: Mutex::new(0),
        }
    }

    /// The configured budget.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently reserved.
    pub fn used(&self) -> usize {
        *self.used.lock()
    }

    fn reserve(&self, bytes: usize) -> Result<(), BufferError> {
        let mut used = self.used.lock();
        let available = self.capacity - *used;
        if bytes > available {
            return Err(BufferError::ArenaExhausted {
                requested: bytes,
                available,
            });
        }
        *used += bytes;
        Ok(())
    }

    fn release(&self, bytes: usize) {
        let mut used = self.used.lock();
        *used = used.saturating_sub(bytes);
    }

    fn reset(&self) {
        *self.used.lock() = 0;
    }
}

/// One partition's mutable ingestion vectors: timestamps plus one value
/// vector per data column.
#[derive(Debug)]
pub struct WriteBufferSet {
    timestamps: Vec<i64>,
    columns: Vec<Vec<f64>>,
    capacity_samples: usize,
}

impl WriteBufferSet {
    fn new(num_columns: usize, capacity_samples: usize) -> Self {
        Self {
            timestamps: Vec::with_capacity(capacity_samples),
            columns: (0..num_columns)
                .map(|_| Vec::with_capacity(capacity_samples))
                .collect(),
            capacity_samples,
        }
    }

    /// Samples buffered so far.
    pub fn len(&self) -> usize {
        self.timestamps.len()
    }

    /// Whether no samples are buffered.
    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty()
    }

    /// Samples this set can hold before it must grow or seal.
    pub fn capacity(&self) -> usize {
        self.capacity_samples
    }

    /// Whether the set is at its current capacity.
    pub fn is_full(&self) -> bool {
        self.len() >= self.capacity_samples
    }

    /// The buffered timestamps.
    pub fn timestamps(&self) -> &[i64] {
        &self.timestamps
    }

    /// The buffered value vectors, positionally matching the schema's data
    /// columns.
    pub fn columns(&self) -> &[Vec<f64>] {
        &self.columns
    }

    pub(crate) fn append(&mut self, row: &SampleRow) {
        debug_assert!(!self.is_full());
        debug_assert_eq!(row.values.len(), self.columns.len());
        self.timestamps.push(row.timestamp);
        for (column, value) in self.columns.iter_mut().zip(&row.values) {
            column.push(*value);
        }
    }

    fn clear(&mut self) {
        self.timestamps.clear();
        for column in &mut self.columns {
            column.clear();
        }
    }

    fn resize_capacity(&mut self, samples: usize) {
        self.capacity_samples = samples;
        // Keep the vectors' real allocations tracking the accounted size.
        if self.timestamps.capacity() < samples {
            let additional = samples - self.timestamps.len();
            self.timestamps.reserve_exact(additional);
            for column in &mut self.columns {
                column.reserve_exact(additional);
            }
        } else {
            self.timestamps.shrink_to(samples);
            for column in &mut self.columns {
                column.shrink_to(samples);
            }
        }
    }
}

/// Pool of [`WriteBufferSet`]s over a [`NativeMemoryManager`] budget.
#[derive(Debug)]
pub struct WriteBufferPool {
    memory: NativeMemoryManager,
    num_columns: usize,
    initial_samples: usize,
    max_samples: usize,
    free: Mutex<Vec<WriteBufferSet>>,
    pool_size: U64Gauge,
}

impl WriteBufferPool {
    /// Create a pool for `num_columns` data columns.
    ///
    /// The arena budget is `max_chunks_size * 8 * max_num_partitions *
    /// num_total_columns` bytes, sized so every partition can hold a
    /// full-grown buffer set.
    pub fn new(
        max_chunks_size: usize,
        max_num_partitions: usize,
        num_columns: usize,
        registry: &Registry,
    ) -> Self {
        let budget = max_chunks_size * 8 * max_num_partitions * (num_columns + 1);
        let pool_size = registry
            .register_metric::<U64Gauge>(
                "memstore-writebuffer-pool-size",
                "Buffer sets sitting in the write buffer pool",
            )
            .recorder(&[]);
        Self {
            memory: NativeMemoryManager::new(budget),
            num_columns,
            initial_samples: (max_chunks_size / 8).max(8),
            max_samples: max_chunks_size.max(8),
            free: Mutex::new(Vec::new()),
            pool_size,
        }
    }

    /// Target samples per sealed chunk.
    pub fn max_samples(&self) -> usize {
        self.max_samples
    }

    /// The arena accounting.
    pub fn memory(&self) -> &NativeMemoryManager {
        &self.memory
    }

    fn bytes_for(&self, samples: usize) -> usize {
        samples * 8 * (self.num_columns + 1)
    }

    /// Borrow a buffer set, reusing a pooled one when available.
    pub fn acquire(&self) -> Result<WriteBufferSet, BufferError> {
        if let Some(set) = self.free.lock().pop() {
            self.pool_size.dec(1);
            return Ok(set);
        }
        // Pooled sets keep their initial reservation; only new sets cost.
        self.memory.reserve(self.bytes_for(self.initial_samples))?;
        Ok(WriteBufferSet::new(self.num_columns, self.initial_samples))
    }

    /// Grow `set` toward the chunk target. Returns `false` once the set is
    /// already at target size and must be sealed instead.
    pub fn try_grow(&self, set: &mut WriteBufferSet) -> Result<bool, BufferError> {
        if set.capacity() >= self.max_samples {
            return Ok(false);
        }
        let next = (set.capacity() * 2).min(self.max_samples);
        self.memory.reserve(self.bytes_for(next - set.capacity()))?;
        set.resize_capacity(next);
        Ok(true)
    }

    /// Return a set to the pool. Growth beyond the initial size is given
    /// back to the arena so pooled sets all cost the same.
    pub fn release(&self, mut set: WriteBufferSet) {
        set.clear();
        if set.capacity() > self.initial_samples {
            self.memory
                .release(self.bytes_for(set.capacity() - self.initial_samples));
            set.resize_capacity(self.initial_samples);
        }
        self.free.lock().push(set);
        self.pool_size.inc(1);
    }

    /// Drop pooled sets and zero the accounting. Terminal companion of the
    /// shard's shutdown.
    pub(crate) fn shutdown(&self) {
        self.free.lock().clear();
        self.pool_size.set(0);
        self.memory.reset();
    }
}
