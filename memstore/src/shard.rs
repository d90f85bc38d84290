//! The shard engine: partition identity, group bookkeeping, the ingest
//! path, eviction, grouped flush orchestration, checkpoints, and query
//! dispatch.
//!
//! All state-mutating operations hang off [`ShardWriter`], a non-clonable
//! handle created once per shard, which pins the single-writer discipline
//! into the type system. Flush I/O and queries take `&TimeSeriesShard` and
//! only ever read snapshots.

use std::{
    collections::{BTreeMap, HashMap},
    hash::Hasher,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering},
        Arc,
    },
};

use croaring::Bitmap;
use data_types::{
    DatasetSchema, FlushGroup, GroupId, IngestRecord, PartitionId, PartitionKey, SequenceNumber,
    ShardId,
};
use futures::{future::BoxFuture, stream, FutureExt, StreamExt};
use memstore_time::TimeProvider;
use metric::{Registry, U64Counter, U64Gauge};
use parking_lot::RwLock;
use siphasher::sip::SipHasher13;
use snafu::{ensure, Snafu};
use tracing::{debug, error, info, warn};

use crate::{
    block::{BlockManager, BlockMemFactoryPool, ReclaimListener},
    buffer::WriteBufferPool,
    chunk::{decode_chunk_slot, ChunkCodec, ChunkRef},
    config::MemStoreConfig,
    eviction::PartitionEvictionPolicy,
    index::{FilterExpr, PartitionKeyIndex},
    paged::DemandPagedChunkStore,
    partition::TimeSeriesPartition,
    sink::{ColumnSink, FlushResponse, MetaStore, SinkResponse},
};

/// Errors surfaced by shard operations.
#[derive(Debug, Snafu)]
#[allow(missing_copy_implementations, missing_docs)]
pub enum ShardError {
    #[snafu(display("shard {} is shut down", shard))]
    ShutDown { shard: ShardId },

    #[snafu(display("group {} out of range ({} groups per shard)", group, num_groups))]
    GroupOutOfRange { group: GroupId, num_groups: u16 },
}

/// The shard's observable counters and gauges.
#[derive(Debug)]
struct ShardMetrics {
    rows_ingested: U64Counter,
    rows_skipped: U64Counter,
    partitions_created: U64Counter,
    partitions_evicted: U64Counter,
    partitions_queried: U64Counter,
    chunks_encoded: U64Counter,
    chunks_queried: U64Counter,
    chunkids_evicted: U64Counter,
    samples_encoded: U64Counter,
    encoded_bytes: U64Counter,
    flushes_success: U64Counter,
    flushes_failed_partition_keys: U64Counter,
    flushes_failed_chunk_write: U64Counter,
    flushes_failed_other: U64Counter,
    offset_latest_inmem: U64Gauge,
    offset_flushed_latest: U64Gauge,
    offset_flushed_earliest: U64Gauge,
    num_partitions: U64Gauge,
}

impl ShardMetrics {
    fn new(registry: &Registry) -> Self {
        let counter = |name, description| {
            registry
                .register_metric::<U64Counter>(name, description)
                .recorder(&[])
        };
        let gauge = |name, description| {
            registry
                .register_metric::<U64Gauge>(name, description)
                .recorder(&[])
        };
        Self {
            rows_ingested: counter("memstore-rows-ingested", "Rows ingested into the shard"),
            rows_skipped: counter(
                "memstore-rows-skipped",
                "Rows dropped below a group watermark during replay",
            ),
            partitions_created: counter("memstore-partitions-created", "Partitions created"),
            partitions_evicted: counter("memstore-partitions-evicted", "Partitions evicted"),
            partitions_queried: counter("memstore-partitions-queried", "Partitions yielded to queries"),
            chunks_encoded: counter("memstore-chunks-encoded", "Chunks encoded by flushes"),
            chunks_queried: counter("memstore-chunks-queried", "Chunks yielded to queries"),
            chunkids_evicted: counter(
                "memstore-chunkids-evicted",
                "Chunk IDs dropped by reclamation or partition eviction",
            ),
            samples_encoded: counter("memstore-samples-encoded", "Samples encoded into chunks"),
            encoded_bytes: counter("memstore-encoded-bytes", "Encoded chunk payload bytes"),
            flushes_success: counter("memstore-flushes-success", "Flushes that committed a checkpoint"),
            flushes_failed_partition_keys: counter(
                "memstore-flushes-failed-partition-keys",
                "Flushes that failed writing partition keys",
            ),
            flushes_failed_chunk_write: counter(
                "memstore-flushes-failed-chunk-write",
                "Flushes that failed writing chunks",
            ),
            flushes_failed_other: counter(
                "memstore-flushes-failed-other",
                "Flushes that failed outside the sink writes",
            ),
            offset_latest_inmem: gauge(
                "shard-offset-latest-inmemory",
                "Latest source offset ingested into memory",
            ),
            offset_flushed_latest: gauge(
                "shard-offset-flushed-latest",
                "Highest group watermark made durable",
            ),
            offset_flushed_earliest: gauge(
                "shard-offset-flushed-earliest",
                "Lowest group watermark made durable",
            ),
            num_partitions: gauge("num-partitions", "Live partitions in the shard"),
        }
    }
}

#[derive(Debug)]
struct ShardState {
    partitions: BTreeMap<i32, Arc<TimeSeriesPartition>>,
    key_map: HashMap<PartitionKey, Arc<TimeSeriesPartition>>,
    key_index: PartitionKeyIndex,
    /// Per group: the IDs of its member partitions.
    partition_groups: Vec<Bitmap>,
    /// Per group: double-buffered pending-flush key sets. Slot 0 collects
    /// newly created partitions; slot 1 is what an in-flight flush persists.
    part_keys_to_flush: Vec<[Bitmap; 2]>,
    next_partition_id: i32,
    /// Rows ingested this shard generation (cleared by reset).
    ingested_rows: u64,
}

impl ShardState {
    fn new(num_groups: u16, registry: &Registry) -> Self {
        Self {
            partitions: BTreeMap::new(),
            key_map: HashMap::new(),
            key_index: PartitionKeyIndex::new(registry),
            partition_groups: (0..num_groups).map(|_| Bitmap::create()).collect(),
            part_keys_to_flush: (0..num_groups)
                .map(|_| [Bitmap::create(), Bitmap::create()])
                .collect(),
            next_partition_id: 0,
            ingested_rows: 0,
        }
    }
}

/// Resolves reclaimed block metadata slots back to partitions.
///
/// The block store holds no partition references; it reaches them through
/// the 12-byte slot plus this shard-scoped lookup, which keeps the arena a
/// pure byte store. The partition may be gone already (evicted); that is
/// fine, the chunk died with it.
#[derive(Debug)]
struct ShardReclaimListener {
    state: Arc<RwLock<ShardState>>,
    chunkids_evicted: U64Counter,
}

impl ReclaimListener for ShardReclaimListener {
    fn on_reclaim(&self, metadata: &[u8]) {
        let (partition_id, chunk_id) = decode_chunk_slot(metadata);
        let partition = self
            .state
            .read()
            .partitions
            .get(&partition_id.get())
            .map(Arc::clone);
        if let Some(partition) = partition {
            if partition.remove_chunks_at(chunk_id) {
                self.chunkids_evicted.inc(1);
            }
        }
    }
}

/// How [`TimeSeriesShard::scan_partitions`] selects partitions.
#[derive(Debug, Clone)]
pub enum PartitionScanMethod {
    /// One exact key.
    SingleKey(PartitionKey),
    /// Several exact keys, yielded in the given order.
    MultiKey(Vec<PartitionKey>),
    /// Key-index filters; an empty list scans every live partition.
    Filtered(Vec<FilterExpr>),
}

#[derive(Debug)]
enum ScanCandidate {
    Key(PartitionKey),
    Id(u32),
}

/// Lazy sequence of matched partitions. IDs that stop resolving mid-scan
/// (raced with eviction) are silently skipped.
#[derive(Debug)]
pub struct PartitionScan {
    shard: Arc<TimeSeriesShard>,
    candidates: std::vec::IntoIter<ScanCandidate>,
    residuals: Vec<FilterExpr>,
}

impl PartitionScan {
    /// Filters the key index could not resolve; the query layer applies
    /// them row-side.
    pub fn residual_filters(&self) -> &[FilterExpr] {
        &self.residuals
    }
}

impl Iterator for PartitionScan {
    type Item = Arc<TimeSeriesPartition>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let candidate = self.candidates.next()?;
            let resolved = {
                let state = self.shard.state.read();
                match &candidate {
                    ScanCandidate::Key(key) => state.key_map.get(key).map(Arc::clone),
                    ScanCandidate::Id(bit) => state.partitions.get(&(*bit as i32)).map(Arc::clone),
                }
            };
            if let Some(partition) = resolved {
                self.shard.metrics.partitions_queried.inc(1);
                return Some(partition);
            }
        }
    }
}

/// Point-in-time health snapshot of a shard.
#[derive(Debug, Clone)]
pub struct ShardStatus {
    /// The shard.
    pub shard: ShardId,
    /// Live partitions.
    pub num_partitions: usize,
    /// Latest ingested source offset.
    pub latest_offset: SequenceNumber,
    /// Durable watermark per group.
    pub group_watermarks: Vec<SequenceNumber>,
    /// Rows ingested this shard generation.
    pub rows_ingested: u64,
}

/// The in-memory shard: owns the partitions, both off-heap arenas, the key
/// index, group bookkeeping, and the flush/checkpoint machinery.
#[derive(Debug)]
pub struct TimeSeriesShard {
    dataset: Arc<DatasetSchema>,
    shard_id: ShardId,
    num_groups: u16,
    state: Arc<RwLock<ShardState>>,
    /// Durable offset per group; advanced only by a successful checkpoint,
    /// never rewound (outside `reset`).
    group_watermarks: Vec<AtomicI64>,
    latest_offset: AtomicI64,
    block_manager: Arc<BlockManager>,
    factory_pool: Arc<BlockMemFactoryPool>,
    buffer_pool: Arc<WriteBufferPool>,
    paged_store: Arc<DemandPagedChunkStore>,
    policy: Arc<dyn PartitionEvictionPolicy>,
    sink: Arc<dyn ColumnSink>,
    metastore: Arc<dyn MetaStore>,
    codec: Arc<dyn ChunkCodec>,
    metrics: ShardMetrics,
    shut_down: AtomicBool,
}

impl TimeSeriesShard {
    /// Create a shard and its unique writer handle.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        dataset: DatasetSchema,
        shard_id: ShardId,
        config: &MemStoreConfig,
        sink: Arc<dyn ColumnSink>,
        metastore: Arc<dyn MetaStore>,
        policy: Arc<dyn PartitionEvictionPolicy>,
        codec: Arc<dyn ChunkCodec>,
        time_provider: Arc<dyn TimeProvider>,
        registry: &Registry,
    ) -> (Arc<Self>, ShardWriter) {
        let num_groups = config.groups_per_shard.max(1);
        let metrics = ShardMetrics::new(registry);
        let state = Arc::new(RwLock::new(ShardState::new(num_groups, registry)));

        let listener = Arc::new(ShardReclaimListener {
            state: Arc::clone(&state),
            chunkids_evicted: metrics.chunkids_evicted.clone(),
        });
        let block_manager = Arc::new(BlockManager::new(
            config.shard_memory_mb * 1024 * 1024,
            config.num_block_pages,
            config.demand_paged_chunk_retention,
            listener,
            time_provider,
        ));
        let factory_pool = Arc::new(BlockMemFactoryPool::new(
            Arc::clone(&block_manager),
            usize::from(num_groups).max(2),
        ));
        let buffer_pool = Arc::new(WriteBufferPool::new(
            config.max_chunks_size,
            config.max_num_partitions,
            dataset.num_data_columns(),
            registry,
        ));
        let paged_store = Arc::new(DemandPagedChunkStore::new(
            Arc::clone(&block_manager),
            registry,
        ));

        let shard = Arc::new(Self {
            dataset: Arc::new(dataset),
            shard_id,
            num_groups,
            state,
            group_watermarks: (0..num_groups).map(|_| AtomicI64::new(0)).collect(),
            latest_offset: AtomicI64::new(0),
            block_manager,
            factory_pool,
            buffer_pool,
            paged_store,
            policy,
            sink,
            metastore,
            codec,
            metrics,
            shut_down: AtomicBool::new(false),
        });
        let writer = ShardWriter {
            shard: Arc::clone(&shard),
        };
        (shard, writer)
    }

    /// The dataset schema this shard serves.
    pub fn dataset(&self) -> &DatasetSchema {
        &self.dataset
    }

    /// This shard's number.
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Flush groups per shard.
    pub fn num_groups(&self) -> u16 {
        self.num_groups
    }

    /// The demand-paged chunk store sharing this shard's block arena.
    pub fn paged_store(&self) -> &Arc<DemandPagedChunkStore> {
        &self.paged_store
    }

    /// The group a key hashes to: a pure function of the key bytes.
    pub fn group_of(&self, key: &PartitionKey) -> GroupId {
        let mut hasher = SipHasher13::new();
        hasher.write(key.as_bytes());
        let hash = hasher.finish() as i64;
        GroupId::new((hash.unsigned_abs() % u64::from(self.num_groups)) as u16)
    }

    /// The durable watermark of `group`.
    pub fn group_watermark(&self, group: GroupId) -> SequenceNumber {
        SequenceNumber::new(self.group_watermarks[usize::from(group.get())].load(Ordering::Acquire))
    }

    /// Latest ingested source offset.
    pub fn latest_offset(&self) -> SequenceNumber {
        SequenceNumber::new(self.latest_offset.load(Ordering::Acquire))
    }

    /// Live partitions right now.
    pub fn num_partitions(&self) -> usize {
        self.state.read().partitions.len()
    }

    /// Health snapshot.
    pub fn status(&self) -> ShardStatus {
        let state = self.state.read();
        ShardStatus {
            shard: self.shard_id,
            num_partitions: state.partitions.len(),
            latest_offset: self.latest_offset(),
            group_watermarks: (0..self.num_groups)
                .map(|g| self.group_watermark(GroupId::new(g)))
                .collect(),
            rows_ingested: state.ingested_rows,
        }
    }

    /// Enumerate matching partitions lazily.
    pub fn scan_partitions(self: &Arc<Self>, method: PartitionScanMethod) -> PartitionScan {
        let mut residuals = Vec::new();
        let candidates: Vec<ScanCandidate> = match method {
            PartitionScanMethod::SingleKey(key) => vec![ScanCandidate::Key(key)],
            PartitionScanMethod::MultiKey(keys) => {
                keys.into_iter().map(ScanCandidate::Key).collect()
            }
            PartitionScanMethod::Filtered(filters) => {
                let state = self.state.read();
                let all = || {
                    state
                        .partitions
                        .keys()
                        .map(|id| ScanCandidate::Id(*id as u32))
                        .collect()
                };
                if filters.is_empty() {
                    all()
                } else {
                    let eval = state.key_index.parse_filters(&filters);
                    residuals = eval.residuals;
                    match eval.ids {
                        Some(ids) => ids.iter().map(ScanCandidate::Id).collect(),
                        None => all(),
                    }
                }
            }
        };
        PartitionScan {
            shard: Arc::clone(self),
            candidates: candidates.into_iter(),
            residuals,
        }
    }

    /// The chunks `partition` currently exposes, counted as queried.
    pub fn queryable_chunks(&self, partition: &TimeSeriesPartition) -> Arc<Vec<ChunkRef>> {
        let chunks = partition.chunks();
        self.metrics.chunks_queried.inc(chunks.len() as u64);
        chunks
    }

    /// Build the flush task for `flush_group`.
    ///
    /// The returned future is `'static` and runs on whatever executor the
    /// flush orchestrator spawns it on; the writer must have completed
    /// [`ShardWriter::switch_group_buffers`] for this group first.
    pub fn create_flush_task(
        self: &Arc<Self>,
        flush_group: FlushGroup,
    ) -> BoxFuture<'static, FlushResponse> {
        let shard = Arc::clone(self);
        async move { shard.flush(flush_group).await }.boxed()
    }

    async fn flush(&self, flush_group: FlushGroup) -> FlushResponse {
        let group = flush_group.group;
        if group.get() >= self.num_groups {
            return FlushResponse::Error(Box::new(
                GroupOutOfRangeSnafu {
                    group,
                    num_groups: self.num_groups,
                }
                .build(),
            ));
        }
        let g = usize::from(group.get());

        let (parts, keys) = {
            let state = self.state.read();
            let parts: Vec<_> = state.partition_groups[g]
                .iter()
                .filter_map(|bit| state.partitions.get(&(bit as i32)).map(Arc::clone))
                .collect();
            let keys: Vec<_> = state.part_keys_to_flush[g][1]
                .iter()
                .filter_map(|bit| {
                    state
                        .partitions
                        .get(&(bit as i32))
                        .map(|p| p.bin_partition().clone())
                })
                .collect();
            (parts, keys)
        };

        if parts.is_empty() {
            // An empty group still checkpoints so its watermark advances
            // and recovery does not rewind behind it.
            return self.commit_checkpoint(flush_group).await;
        }

        let holder = match self.factory_pool.checkout() {
            Ok(holder) => holder,
            Err(e) => {
                error!(group = %group, error = %e, "no flush holder available");
                self.metrics.flushes_failed_other.inc(1);
                return FlushResponse::DataDropped;
            }
        };

        let has_chunks = parts.iter().any(|p| p.has_unflushed());
        let encode_errors = AtomicU64::new(0);

        let chunks_fut = async {
            if !has_chunks {
                return SinkResponse::NotApplied;
            }
            let holder = &*holder;
            let encode_errors = &encode_errors;
            let chunk_stream = stream::iter(parts.clone())
                .flat_map(move |partition| {
                    let sets = match partition.make_flush_chunks(holder) {
                        Ok(sets) => sets,
                        Err(e) => {
                            warn!(partition = %partition.id(), error = %e, "encoding flush chunks failed");
                            encode_errors.fetch_add(1, Ordering::Relaxed);
                            Vec::new()
                        }
                    };
                    self.metrics.chunks_encoded.inc(sets.len() as u64);
                    for set in &sets {
                        self.metrics.samples_encoded.inc(u64::from(set.chunk.num_rows()));
                        self.metrics
                            .encoded_bytes
                            .inc(set.chunk.payload().len() as u64);
                    }
                    stream::iter(sets)
                })
                .boxed();
            self.sink.write_chunks(&self.dataset, chunk_stream).await
        };
        let keys_fut = async {
            if keys.is_empty() {
                return SinkResponse::Success;
            }
            self.sink
                .add_partitions(&self.dataset, keys, self.shard_id)
                .await
        };
        let (chunks_response, keys_response) = futures::join!(chunks_fut, keys_fut);

        holder.mark_used_blocks_reclaimable();
        drop(holder);
        for partition in &parts {
            partition.flush_complete();
        }

        let chunks_outcome = match chunks_response {
            SinkResponse::Success => Some(true),
            SinkResponse::NotApplied => Some(false),
            SinkResponse::Error(e) => {
                error!(group = %group, error = %e, "sink rejected chunk stream");
                self.metrics.flushes_failed_chunk_write.inc(1);
                None
            }
        };
        let keys_ok = match keys_response {
            SinkResponse::Success | SinkResponse::NotApplied => true,
            SinkResponse::Error(e) => {
                error!(group = %group, error = %e, "sink rejected partition keys");
                self.metrics.flushes_failed_partition_keys.inc(1);
                false
            }
        };
        let degraded = encode_errors.load(Ordering::Relaxed) > 0;
        if degraded {
            self.metrics.flushes_failed_other.inc(1);
        }

        match (chunks_outcome, keys_ok, degraded) {
            // Sink failures are swallowed: log + count above, keep ingest
            // moving, let recovery replay the window.
            (None, _, _) | (_, false, _) => FlushResponse::DataDropped,
            (Some(_), true, true) => FlushResponse::DataDropped,
            (Some(false), true, false) => FlushResponse::NotApplied,
            (Some(true), true, false) => self.commit_checkpoint(flush_group).await,
        }
    }

    async fn commit_checkpoint(&self, flush_group: FlushGroup) -> FlushResponse {
        let watermark = flush_group.flush_watermark;
        if watermark.get() <= 0 {
            return FlushResponse::NotApplied;
        }
        match self
            .metastore
            .write_checkpoint(&self.dataset, self.shard_id, flush_group.group, watermark)
            .await
        {
            Ok(()) => {
                self.group_watermarks[usize::from(flush_group.group.get())]
                    .fetch_max(watermark.get(), Ordering::AcqRel);
                self.publish_offset_gauges();
                self.metrics.flushes_success.inc(1);
                info!(
                    shard = %self.shard_id,
                    group = %flush_group.group,
                    watermark = watermark.get(),
                    "checkpoint committed"
                );
                FlushResponse::Success
            }
            Err(e) => {
                error!(
                    shard = %self.shard_id,
                    group = %flush_group.group,
                    error = %e,
                    "checkpoint write failed"
                );
                self.metrics.flushes_failed_other.inc(1);
                FlushResponse::DataDropped
            }
        }
    }

    fn publish_offset_gauges(&self) {
        let mut latest = i64::MIN;
        let mut earliest = i64::MAX;
        for watermark in &self.group_watermarks {
            let v = watermark.load(Ordering::Acquire);
            latest = latest.max(v);
            earliest = earliest.min(v);
        }
        self.metrics.offset_flushed_latest.set(latest.max(0) as u64);
        self.metrics.offset_flushed_earliest.set(earliest.max(0) as u64);
        self.metrics
            .offset_latest_inmem
            .set(self.latest_offset.load(Ordering::Acquire).max(0) as u64);
    }

    fn publish_partition_count(&self) {
        self.metrics
            .num_partitions
            .set(self.state.read().partitions.len() as u64);
    }
}

/// The single-writer handle. Every state-mutating operation lives here and
/// the type is deliberately not `Clone`: one shard, one writer.
#[derive(Debug)]
pub struct ShardWriter {
    shard: Arc<TimeSeriesShard>,
}

impl ShardWriter {
    /// The shard this handle writes to.
    pub fn shard(&self) -> &Arc<TimeSeriesShard> {
        &self.shard
    }

    /// Ingest one ordered batch of records.
    ///
    /// Records below their group's watermark are skipped (recovery
    /// idempotence); unknown keys create partitions, evicting first if the
    /// policy demands it. Returns the latest ingested offset. This path
    /// never fails on a per-record basis: bad rows are logged, counted and
    /// dropped.
    pub fn ingest(&mut self, batch: &[IngestRecord]) -> Result<SequenceNumber, ShardError> {
        let shard = Arc::clone(&self.shard);
        ensure!(
            !shard.shut_down.load(Ordering::Acquire),
            ShutDownSnafu {
                shard: shard.shard_id
            }
        );

        let mut ingested = 0u64;
        let mut skipped = 0u64;
        for record in batch {
            let group = shard.group_of(&record.key);
            if record.offset.get() < shard.group_watermark(group).get() {
                skipped += 1;
                continue;
            }
            if record.row.values.len() != shard.dataset.num_data_columns() {
                warn!(key = %record.key, "dropping row with mismatched column count");
                continue;
            }
            let partition = {
                let existing = shard.state.read().key_map.get(&record.key).map(Arc::clone);
                match existing {
                    Some(partition) => partition,
                    None => self.add_partition(record.key.clone(), true),
                }
            };
            if let Err(e) = partition.ingest(&record.row, record.offset) {
                warn!(partition = %partition.id(), error = %e, "dropping row under buffer pressure");
                continue;
            }
            ingested += 1;
        }

        shard.metrics.rows_ingested.inc(ingested);
        shard.metrics.rows_skipped.inc(skipped);
        shard.state.write().ingested_rows += ingested;
        if let Some(record) = batch.last() {
            shard.latest_offset.store(record.offset.get(), Ordering::Release);
            shard
                .metrics
                .offset_latest_inmem
                .set(record.offset.get().max(0) as u64);
        }
        Ok(shard.latest_offset())
    }

    /// Create and register a partition for `key`.
    ///
    /// # Panics
    ///
    /// If the partition ID space wrapped around onto a still-live ID. That
    /// means the shard outlived a full `i32` of partitions; the remedy is
    /// re-creating the shard.
    fn add_partition(&mut self, key: PartitionKey, needs_persistence: bool) -> Arc<TimeSeriesPartition> {
        self.check_and_evict_partitions();

        let shard = Arc::clone(&self.shard);
        let group = shard.group_of(&key);
        let partition = {
            let mut state = shard.state.write();
            let id = state.next_partition_id;
            assert!(
                !state.partitions.contains_key(&id),
                "partition ID {} wrapped around onto a live partition",
                id
            );
            let partition = Arc::new(TimeSeriesPartition::new(
                PartitionId::new(id),
                key.clone(),
                group,
                Arc::clone(&shard.buffer_pool),
                Arc::clone(&shard.codec),
            ));
            state.key_index.add_key(&key, partition.id());
            state.partitions.insert(id, Arc::clone(&partition));
            state.key_map.insert(key, Arc::clone(&partition));
            state.partition_groups[usize::from(group.get())].add(partition.id().bit());
            if needs_persistence {
                state.part_keys_to_flush[usize::from(group.get())][0].add(partition.id().bit());
            }
            state.next_partition_id = match state.next_partition_id.checked_add(1) {
                Some(next) => next,
                None => {
                    warn!(shard = %shard.shard_id, "partition ID space wrapped to zero");
                    0
                }
            };
            partition
        };
        shard.metrics.partitions_created.inc(1);
        shard.publish_partition_count();
        debug!(partition = %partition.id(), group = %group, "created partition");
        partition
    }

    /// Ask the eviction policy whether to shed partitions and do so.
    /// Runs in-stream on the writer, so there are no concurrent mutators.
    /// Returns how many partitions were evicted.
    pub fn check_and_evict_partitions(&mut self) -> usize {
        let shard = Arc::clone(&self.shard);
        let target = shard.policy.how_many_to_evict(shard.num_partitions());
        if target == 0 {
            return 0;
        }

        let evicted = {
            let mut state = shard.state.write();
            let mut evicted = Vec::new();
            let mut evicted_bits = Bitmap::create();
            // Iteration is creation order (IDs are allocated monotonically),
            // so the oldest partitions go first.
            for (id, partition) in &state.partitions {
                if evicted.len() >= target {
                    break;
                }
                if shard.policy.can_evict(partition) {
                    evicted.push(Arc::clone(partition));
                    evicted_bits.add(*id as u32);
                }
            }
            if evicted.is_empty() {
                debug!(target, "eviction requested but nothing is evictable");
                return 0;
            }

            state
                .key_index
                .remove_keys(evicted.iter().map(|p| p.bin_partition()), &evicted_bits);
            for g in 0..usize::from(shard.num_groups) {
                state.partition_groups[g].andnot_inplace(&evicted_bits);
                // Slot 1 is deliberately untouched: a concurrent flush may
                // be persisting exactly those keys.
                state.part_keys_to_flush[g][0].andnot_inplace(&evicted_bits);
            }
            let mut dropped_chunks = 0u64;
            for partition in &evicted {
                state.partitions.remove(&partition.id().get());
                state.key_map.remove(partition.bin_partition());
                dropped_chunks += partition.chunks().len() as u64;
            }
            shard.metrics.chunkids_evicted.inc(dropped_chunks);
            evicted
        };

        shard.metrics.partitions_evicted.inc(evicted.len() as u64);
        shard.publish_partition_count();
        info!(count = evicted.len(), "evicted partitions");
        evicted.len()
    }

    /// Seal every partition buffer in `group` and rotate the group's
    /// pending-flush bitmaps: slot 1 now holds the keys the next flush must
    /// persist, slot 0 starts collecting afresh.
    ///
    /// Ideally called on the ingest executor just before building the
    /// group's flush task, so no ingest tears a buffer mid-seal.
    pub fn switch_group_buffers(&mut self, group: GroupId) -> Result<(), ShardError> {
        let shard = Arc::clone(&self.shard);
        ensure!(
            group.get() < shard.num_groups,
            GroupOutOfRangeSnafu {
                group,
                num_groups: shard.num_groups
            }
        );

        let parts: Vec<_> = {
            let state = shard.state.read();
            state.partition_groups[usize::from(group.get())]
                .iter()
                .filter_map(|bit| state.partitions.get(&(bit as i32)).map(Arc::clone))
                .collect()
        };
        for partition in &parts {
            partition.switch_buffers();
        }

        let mut state = shard.state.write();
        let pair = &mut state.part_keys_to_flush[usize::from(group.get())];
        pair.swap(0, 1);
        pair[0] = Bitmap::create();
        Ok(())
    }

    /// Seed a group's watermark, e.g. from checkpoints read back at
    /// recovery. Monotonic: can only move the watermark forward.
    pub fn set_group_watermark(
        &mut self,
        group: GroupId,
        watermark: SequenceNumber,
    ) -> Result<(), ShardError> {
        let shard = &self.shard;
        ensure!(
            group.get() < shard.num_groups,
            GroupOutOfRangeSnafu {
                group,
                num_groups: shard.num_groups
            }
        );
        shard.group_watermarks[usize::from(group.get())]
            .fetch_max(watermark.get(), Ordering::AcqRel);
        Ok(())
    }

    /// Clear all logical state: partitions, key map, key index, group
    /// bitmaps, watermarks, and the generation's ingest count. The off-heap
    /// arenas stay allocated; the shard remains usable.
    pub fn reset(&mut self) {
        let shard = Arc::clone(&self.shard);
        {
            let mut state = shard.state.write();
            for partition in state.partitions.values() {
                partition.release_buffers();
            }
            state.partitions.clear();
            state.key_map.clear();
            state.key_index.clear();
            for g in 0..usize::from(shard.num_groups) {
                state.partition_groups[g] = Bitmap::create();
                state.part_keys_to_flush[g] = [Bitmap::create(), Bitmap::create()];
            }
            state.next_partition_id = 0;
            state.ingested_rows = 0;
        }
        for watermark in &shard.group_watermarks {
            watermark.store(0, Ordering::Release);
        }
        shard.latest_offset.store(0, Ordering::Release);
        shard.metrics.offset_latest_inmem.set(0);
        shard.publish_partition_count();
        info!(shard = %shard.shard_id, "shard reset");
    }

    /// Reset, then release both off-heap arenas. Terminal: the shard
    /// rejects ingest afterwards and the writer handle is consumed.
    pub fn shutdown(mut self) {
        self.reset();
        let shard = &self.shard;
        shard.shut_down.store(true, Ordering::Release);
        shard.buffer_pool.shutdown();
        shard.block_manager.shutdown();
        info!(shard = %shard.shard_id, "shard shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkSet, PlainCodec};
    use crate::eviction::WatermarkEvictionPolicy;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use data_types::SampleRow;
    use futures::stream::BoxStream;
    use memstore_time::{MockProvider, Time};
    use metric::{Attributes, Metric};
    use parking_lot::Mutex;
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct TestSink {
        chunk_batches: Mutex<Vec<Vec<ChunkSet>>>,
        key_batches: Mutex<Vec<Vec<PartitionKey>>>,
        fail_chunks: AtomicBool,
        fail_keys: AtomicBool,
    }

    #[async_trait]
    impl ColumnSink for TestSink {
        async fn write_chunks(
            &self,
            _dataset: &DatasetSchema,
            chunks: BoxStream<'_, ChunkSet>,
        ) -> SinkResponse {
            let collected: Vec<_> = chunks.collect().await;
            if self.fail_chunks.load(Ordering::Relaxed) {
                return SinkResponse::Error("chunk sink unavailable".into());
            }
            if collected.is_empty() {
                return SinkResponse::NotApplied;
            }
            self.chunk_batches.lock().push(collected);
            SinkResponse::Success
        }

        async fn add_partitions(
            &self,
            _dataset: &DatasetSchema,
            keys: Vec<PartitionKey>,
            _shard: ShardId,
        ) -> SinkResponse {
            if self.fail_keys.load(Ordering::Relaxed) {
                return SinkResponse::Error("key sink unavailable".into());
            }
            self.key_batches.lock().push(keys);
            SinkResponse::Success
        }
    }

    #[derive(Debug, Default)]
    struct TestMetaStore {
        checkpoints: Mutex<Vec<(GroupId, SequenceNumber)>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl MetaStore for TestMetaStore {
        async fn write_checkpoint(
            &self,
            _dataset: &DatasetSchema,
            _shard: ShardId,
            group: GroupId,
            offset: SequenceNumber,
        ) -> Result<(), crate::sink::DynError> {
            if self.fail.load(Ordering::Relaxed) {
                return Err("metastore unavailable".into());
            }
            assert!(offset.get() > 0, "checkpoint offset must be positive");
            self.checkpoints.lock().push((group, offset));
            Ok(())
        }
    }

    /// Evicts `evict` partitions once the live count reaches `upper`.
    #[derive(Debug)]
    struct StepEvictionPolicy {
        upper: usize,
        evict: usize,
    }

    impl PartitionEvictionPolicy for StepEvictionPolicy {
        fn how_many_to_evict(&self, num_partitions: usize) -> usize {
            if num_partitions >= self.upper {
                self.evict
            } else {
                0
            }
        }

        fn can_evict(&self, partition: &TimeSeriesPartition) -> bool {
            !partition.is_active()
        }
    }

    struct TestShard {
        shard: Arc<TimeSeriesShard>,
        writer: ShardWriter,
        sink: Arc<TestSink>,
        metastore: Arc<TestMetaStore>,
        registry: Arc<Registry>,
        schema: DatasetSchema,
    }

    fn test_config() -> MemStoreConfig {
        MemStoreConfig {
            max_chunks_size: 16,
            shard_memory_mb: 1,
            num_block_pages: 1,
            groups_per_shard: 4,
            max_num_partitions: 64,
            demand_paged_chunk_retention: Duration::from_secs(3600),
            flush_interval: Duration::from_millis(50),
            status_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            shutdown_timeout: Duration::from_secs(5),
            failures_channel_enabled: false,
            failures_topic: "memstore-failures".to_string(),
        }
    }

    fn new_shard(policy: Arc<dyn PartitionEvictionPolicy>) -> TestShard {
        test_helpers::maybe_start_logging();
        let schema = DatasetSchema::new("metrics", ["metric", "host"], ["value"]);
        let sink = Arc::new(TestSink::default());
        let metastore = Arc::new(TestMetaStore::default());
        let registry = Arc::new(Registry::new());
        let (shard, writer) = TimeSeriesShard::new(
            schema.clone(),
            ShardId::new(7),
            &test_config(),
            Arc::clone(&sink) as _,
            Arc::clone(&metastore) as _,
            policy,
            Arc::new(PlainCodec),
            Arc::new(MockProvider::new(Time::from_timestamp_nanos(0))),
            &registry,
        );
        TestShard {
            shard,
            writer,
            sink,
            metastore,
            registry,
            schema,
        }
    }

    fn default_shard() -> TestShard {
        new_shard(Arc::new(WatermarkEvictionPolicy::new(64, 48)))
    }

    impl TestShard {
        fn key(&self, metric: &str, host: &str) -> PartitionKey {
            self.schema
                .partition_key(&[("metric", metric), ("host", host)])
                .unwrap()
        }

        fn record(&self, metric: &str, host: &str, ts: i64, offset: i64) -> IngestRecord {
            IngestRecord {
                key: self.key(metric, host),
                row: SampleRow::new(ts, vec![1.0]),
                offset: SequenceNumber::new(offset),
            }
        }

        fn counter(&self, name: &'static str) -> u64 {
            self.registry
                .get_instrument::<Metric<U64Counter>>(name)
                .unwrap()
                .get_observer(&Attributes::default())
                .unwrap()
                .fetch()
        }

        fn gauge(&self, name: &'static str) -> u64 {
            self.registry
                .get_instrument::<Metric<U64Gauge>>(name)
                .unwrap()
                .get_observer(&Attributes::default())
                .unwrap()
                .fetch()
        }

        /// The shared invariants: the two partition maps agree and every
        /// bitmap bit resolves to a live partition.
        fn assert_invariants(&self) {
            let state = self.shard.state.read();
            assert_eq!(state.partitions.len(), state.key_map.len());
            for (id, partition) in &state.partitions {
                assert_eq!(partition.id().get(), *id);
                let by_key = state
                    .key_map
                    .get(partition.bin_partition())
                    .expect("key map entry for every partition");
                assert!(Arc::ptr_eq(partition, by_key));
            }
            for g in 0..usize::from(self.shard.num_groups) {
                for bit in state.partition_groups[g].iter() {
                    assert!(state.partitions.contains_key(&(bit as i32)));
                }
                for bit in state.part_keys_to_flush[g][0].iter() {
                    assert!(state.partitions.contains_key(&(bit as i32)));
                }
            }
        }
    }

    #[test]
    fn s1_fresh_ingest_creates_partitions() {
        let mut t = default_shard();
        let batch = vec![
            t.record("cpu", "a", 1, 10),
            t.record("cpu", "b", 2, 11),
            t.record("cpu", "c", 3, 12),
        ];
        let offset = t.writer.ingest(&batch).unwrap();

        assert_eq!(offset, SequenceNumber::new(12));
        assert_eq!(t.shard.latest_offset(), SequenceNumber::new(12));
        assert_eq!(t.shard.num_partitions(), 3);
        assert_eq!(t.counter("memstore-rows-ingested"), 3);
        assert_eq!(t.counter("memstore-rows-skipped"), 0);
        assert_eq!(t.counter("memstore-partitions-created"), 3);
        assert_eq!(t.gauge("num-partitions"), 3);
        assert_eq!(t.gauge("shard-offset-latest-inmemory"), 12);
        t.assert_invariants();
    }

    #[test]
    fn s2_records_below_the_watermark_are_skipped() {
        let mut t = default_shard();
        let key = t.key("cpu", "a");
        let group = t.shard.group_of(&key);
        t.writer
            .set_group_watermark(group, SequenceNumber::new(20))
            .unwrap();

        t.writer
            .ingest(&[t.record("cpu", "a", 1, 15)])
            .unwrap();

        assert_eq!(t.counter("memstore-rows-skipped"), 1);
        assert_eq!(t.counter("memstore-rows-ingested"), 0);
        assert_eq!(t.shard.num_partitions(), 0);
        t.assert_invariants();
    }

    #[tokio::test]
    async fn s3_flush_happy_path_commits_a_checkpoint() {
        let mut t = default_shard();
        let key = t.key("cpu", "a");
        let group = t.shard.group_of(&key);

        t.writer
            .ingest(&[t.record("cpu", "a", 1, 10), t.record("cpu", "a", 2, 11)])
            .unwrap();
        t.writer.switch_group_buffers(group).unwrap();

        let response = t
            .shard
            .create_flush_task(FlushGroup {
                group,
                flush_watermark: SequenceNumber::new(100),
            })
            .await;

        assert_matches!(response, FlushResponse::Success);
        assert_eq!(t.shard.group_watermark(group), SequenceNumber::new(100));
        assert_eq!(t.counter("memstore-flushes-success"), 1);
        assert_eq!(t.counter("memstore-chunks-encoded"), 1);
        assert_eq!(t.counter("memstore-samples-encoded"), 2);
        assert_eq!(t.gauge("shard-offset-flushed-latest"), 100);
        assert_eq!(t.metastore.checkpoints.lock().as_slice(), &[(group, SequenceNumber::new(100))]);

        // The new partition key went to the sink exactly once...
        assert_eq!(t.sink.key_batches.lock().len(), 1);
        let chunks = t.sink.chunk_batches.lock();
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0][0].chunk.num_rows(), 2);
        drop(chunks);

        // ...and the pending-flush set clears after the next switch: a
        // second flush has no keys left to persist.
        t.writer.switch_group_buffers(group).unwrap();
        let response = t
            .shard
            .create_flush_task(FlushGroup {
                group,
                flush_watermark: SequenceNumber::new(101),
            })
            .await;
        assert_matches!(response, FlushResponse::NotApplied);
        assert_eq!(t.sink.key_batches.lock().len(), 1);
        t.assert_invariants();
    }

    #[tokio::test]
    async fn s4_empty_group_still_checkpoints() {
        let t = default_shard();
        let group = GroupId::new(2);

        let response = t
            .shard
            .create_flush_task(FlushGroup {
                group,
                flush_watermark: SequenceNumber::new(50),
            })
            .await;

        assert_matches!(response, FlushResponse::Success);
        assert_eq!(t.shard.group_watermark(group), SequenceNumber::new(50));
        assert!(t.sink.chunk_batches.lock().is_empty());
        assert!(t.sink.key_batches.lock().is_empty());
        assert_eq!(t.metastore.checkpoints.lock().len(), 1);
    }

    #[tokio::test]
    async fn s5_sink_failure_drops_data_and_releases_the_holder() {
        let mut t = default_shard();
        let key = t.key("cpu", "a");
        let group = t.shard.group_of(&key);

        t.writer.ingest(&[t.record("cpu", "a", 1, 10)]).unwrap();
        t.writer.switch_group_buffers(group).unwrap();
        t.sink.fail_chunks.store(true, Ordering::Relaxed);

        let response = t
            .shard
            .create_flush_task(FlushGroup {
                group,
                flush_watermark: SequenceNumber::new(100),
            })
            .await;

        assert_matches!(response, FlushResponse::DataDropped);
        assert_eq!(t.shard.group_watermark(group), SequenceNumber::new(0));
        assert_eq!(t.counter("memstore-flushes-failed-chunk-write"), 1);
        assert_eq!(t.counter("memstore-flushes-success"), 0);
        assert!(t.metastore.checkpoints.lock().is_empty());

        // The holder went back to the pool: the next flush still works.
        t.sink.fail_chunks.store(false, Ordering::Relaxed);
        t.writer.ingest(&[t.record("cpu", "a", 5, 20)]).unwrap();
        t.writer.switch_group_buffers(group).unwrap();
        let response = t
            .shard
            .create_flush_task(FlushGroup {
                group,
                flush_watermark: SequenceNumber::new(200),
            })
            .await;
        assert_matches!(response, FlushResponse::Success);
    }

    #[tokio::test]
    async fn s5b_partition_key_write_failure_counts_separately() {
        let mut t = default_shard();
        let key = t.key("cpu", "a");
        let group = t.shard.group_of(&key);

        t.writer.ingest(&[t.record("cpu", "a", 1, 10)]).unwrap();
        t.writer.switch_group_buffers(group).unwrap();
        t.sink.fail_keys.store(true, Ordering::Relaxed);

        let response = t
            .shard
            .create_flush_task(FlushGroup {
                group,
                flush_watermark: SequenceNumber::new(100),
            })
            .await;

        assert_matches!(response, FlushResponse::DataDropped);
        assert_eq!(t.counter("memstore-flushes-failed-partition-keys"), 1);
        assert!(t.metastore.checkpoints.lock().is_empty());
    }

    #[tokio::test]
    async fn s6_eviction_under_pressure_removes_only_evictable_partitions() {
        let mut t = new_shard(Arc::new(StepEvictionPolicy { upper: 3, evict: 2 }));

        // Three partitions, made idle by flushing every group so the policy
        // may take them.
        t.writer
            .ingest(&[
                t.record("cpu", "a", 1, 1),
                t.record("cpu", "b", 2, 2),
                t.record("cpu", "c", 3, 3),
            ])
            .unwrap();
        for g in 0..t.shard.num_groups() {
            let group = GroupId::new(g);
            t.writer.switch_group_buffers(group).unwrap();
            t.shard
                .create_flush_task(FlushGroup {
                    group,
                    flush_watermark: SequenceNumber::new(10),
                })
                .await;
        }

        // The next unknown key triggers the policy: exactly two partitions
        // leave, oldest first, so c and the newcomer remain.
        t.writer.ingest(&[t.record("cpu", "d", 4, 40)]).unwrap();

        assert_eq!(t.counter("memstore-partitions-evicted"), 2);
        assert_eq!(t.shard.num_partitions(), 2);
        let remaining: Vec<_> = t
            .shard
            .scan_partitions(PartitionScanMethod::Filtered(vec![]))
            .map(|p| p.bin_partition().to_string())
            .collect();
        assert!(remaining.contains(&"metric=cpu,host=c".to_string()));
        assert!(remaining.contains(&"metric=cpu,host=d".to_string()));
        t.assert_invariants();

        // The evicted keys also left the index.
        let found: Vec<_> = t
            .shard
            .scan_partitions(PartitionScanMethod::Filtered(vec![FilterExpr::In {
                column: "host".to_string(),
                values: vec!["a".to_string(), "b".to_string()],
            }]))
            .collect();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn s7_reclaim_notifies_the_owning_partition_exactly_once() {
        let mut t = default_shard();
        let key = t.key("cpu", "a");
        let group = t.shard.group_of(&key);

        t.writer.ingest(&[t.record("cpu", "a", 1, 10)]).unwrap();
        t.writer.switch_group_buffers(group).unwrap();
        t.shard
            .create_flush_task(FlushGroup {
                group,
                flush_watermark: SequenceNumber::new(100),
            })
            .await;

        let partition = t
            .shard
            .scan_partitions(PartitionScanMethod::SingleKey(key))
            .next()
            .unwrap();
        assert_eq!(t.shard.queryable_chunks(&partition).len(), 1);

        // Force the block holding the chunk to be recycled.
        let slots = t.shard.block_manager.reclaim_oldest().unwrap();
        assert_eq!(slots, 1);
        assert!(t.shard.queryable_chunks(&partition).is_empty());
        assert_eq!(t.counter("memstore-chunkids-evicted"), 1);

        // A second reclaim pass finds nothing further to drop.
        assert!(t.shard.block_manager.reclaim_oldest().is_none());
    }

    #[test]
    fn group_assignment_is_pure_and_stable() {
        let t = default_shard();
        let a1 = t.key("cpu", "a");
        let a2 = t.key("cpu", "a");
        assert_eq!(t.shard.group_of(&a1), t.shard.group_of(&a2));
        assert!(t.shard.group_of(&a1).get() < t.shard.num_groups());
    }

    #[tokio::test]
    async fn watermarks_never_rewind() {
        let t = default_shard();
        let group = GroupId::new(1);

        for watermark in [50, 100, 70] {
            t.shard
                .create_flush_task(FlushGroup {
                    group,
                    flush_watermark: SequenceNumber::new(watermark),
                })
                .await;
        }
        assert_eq!(t.shard.group_watermark(group), SequenceNumber::new(100));
    }

    #[tokio::test]
    async fn non_positive_watermark_short_circuits_to_not_applied() {
        let t = default_shard();
        let response = t
            .shard
            .create_flush_task(FlushGroup {
                group: GroupId::new(0),
                flush_watermark: SequenceNumber::new(0),
            })
            .await;
        assert_matches!(response, FlushResponse::NotApplied);
        assert!(t.metastore.checkpoints.lock().is_empty());
    }

    #[tokio::test]
    async fn metastore_failure_leaves_the_watermark_alone() {
        let t = default_shard();
        t.metastore.fail.store(true, Ordering::Relaxed);

        let response = t
            .shard
            .create_flush_task(FlushGroup {
                group: GroupId::new(0),
                flush_watermark: SequenceNumber::new(99),
            })
            .await;

        assert_matches!(response, FlushResponse::DataDropped);
        assert_eq!(t.shard.group_watermark(GroupId::new(0)), SequenceNumber::new(0));
        assert_eq!(t.counter("memstore-flushes-failed-other"), 1);
    }

    #[tokio::test]
    async fn flush_for_an_unknown_group_is_an_error() {
        let t = default_shard();
        let response = t
            .shard
            .create_flush_task(FlushGroup {
                group: GroupId::new(99),
                flush_watermark: SequenceNumber::new(1),
            })
            .await;
        assert_matches!(response, FlushResponse::Error(_));
    }

    #[test]
    fn scan_by_key_and_filter() {
        let mut t = default_shard();
        t.writer
            .ingest(&[
                t.record("cpu", "a", 1, 1),
                t.record("cpu", "b", 2, 2),
                t.record("mem", "a", 3, 3),
            ])
            .unwrap();

        let single: Vec<_> = t
            .shard
            .scan_partitions(PartitionScanMethod::SingleKey(t.key("cpu", "a")))
            .collect();
        assert_eq!(single.len(), 1);

        let filtered = t.shard.scan_partitions(PartitionScanMethod::Filtered(vec![
            FilterExpr::Eq {
                column: "metric".to_string(),
                value: "cpu".to_string(),
            },
        ]));
        assert!(filtered.residual_filters().is_empty());
        assert_eq!(filtered.count(), 2);

        // Unknown keys are skipped silently.
        let missing: Vec<_> = t
            .shard
            .scan_partitions(PartitionScanMethod::MultiKey(vec![
                t.key("cpu", "a"),
                t.key("cpu", "nope"),
            ]))
            .collect();
        assert_eq!(missing.len(), 1);
        assert_eq!(t.counter("memstore-partitions-queried"), 4);
    }

    #[test]
    fn reset_clears_logical_state_but_keeps_the_shard_usable() {
        let mut t = default_shard();
        t.writer
            .ingest(&[t.record("cpu", "a", 1, 10), t.record("cpu", "b", 2, 11)])
            .unwrap();
        t.writer
            .set_group_watermark(GroupId::new(0), SequenceNumber::new(5))
            .unwrap();

        t.writer.reset();

        assert_eq!(t.shard.num_partitions(), 0);
        assert_eq!(t.shard.latest_offset(), SequenceNumber::new(0));
        assert_eq!(t.shard.group_watermark(GroupId::new(0)), SequenceNumber::new(0));
        assert_eq!(t.shard.status().rows_ingested, 0);

        // IDs restart from zero and ingest still works.
        t.writer.ingest(&[t.record("cpu", "c", 3, 12)]).unwrap();
        assert_eq!(t.shard.num_partitions(), 1);
        let p = t
            .shard
            .scan_partitions(PartitionScanMethod::SingleKey(t.key("cpu", "c")))
            .next()
            .unwrap();
        assert_eq!(p.id(), PartitionId::new(0));
        t.assert_invariants();
    }

    #[test]
    fn shutdown_is_terminal() {
        let mut t = default_shard();
        t.writer.ingest(&[t.record("cpu", "a", 1, 10)]).unwrap();

        let TestShard { writer, shard, .. } = t;
        writer.shutdown();

        // The shard is gone for good: a fresh writer handle cannot exist,
        // and ingest through a hypothetical one would fail; verify via the
        // public state instead.
        assert_eq!(shard.num_partitions(), 0);
        assert!(shard.shut_down.load(Ordering::Acquire));
    }

    #[test]
    #[should_panic(expected = "wrapped around onto a live partition")]
    fn partition_id_wraparound_collision_is_fatal() {
        let mut t = default_shard();
        t.writer.ingest(&[t.record("cpu", "a", 1, 1)]).unwrap();

        // Simulate an exhausted ID space: the next allocation wraps to zero,
        // which is still occupied by partition "a".
        t.shard.state.write().next_partition_id = i32::MAX;
        t.writer.ingest(&[t.record("cpu", "b", 2, 2)]).unwrap();
        assert_eq!(t.shard.num_partitions(), 2);
        t.writer.ingest(&[t.record("cpu", "c", 3, 3)]).unwrap();
    }

    #[test]
    fn ids_are_unique_across_eviction_churn() {
        let mut t = new_shard(Arc::new(StepEvictionPolicy { upper: 2, evict: 1 }));

        t.writer.ingest(&[t.record("cpu", "a", 1, 1)]).unwrap();
        t.writer.ingest(&[t.record("cpu", "b", 2, 2)]).unwrap();
        // Make everything idle so the policy may take the oldest.
        for g in 0..t.shard.num_groups() {
            t.writer.switch_group_buffers(GroupId::new(g)).unwrap();
        }
        {
            let state = t.shard.state.read();
            for p in state.partitions.values() {
                p.release_buffers();
            }
        }

        t.writer.ingest(&[t.record("cpu", "c", 3, 3)]).unwrap();

        let state = t.shard.state.read();
        let ids: Vec<_> = state.partitions.keys().copied().collect();
        assert_eq!(ids, vec![1, 2]);
        drop(state);
        t.assert_invariants();
    }
}
