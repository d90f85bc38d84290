//! Memstore configuration, exposed as a clap block so the embedding
//! service can splice it into its own CLI and environment handling.

use std::time::Duration;

/// Configuration for one memstore instance (all of its shards).
#[derive(Debug, Clone, clap::Parser)]
pub struct MemStoreConfig {
    /// Target samples per encoded chunk; also drives write buffer sizing,
    /// which starts at one eighth of this and grows.
    #[clap(
        long = "memstore-max-chunks-size",
        env = "MEMSTORE_MAX_CHUNKS_SIZE",
        default_value = "400"
    )]
    pub max_chunks_size: usize,

    /// Size of the off-heap block arena per shard, in MiB.
    #[clap(
        long = "memstore-shard-memory-mb",
        env = "MEMSTORE_SHARD_MEMORY_MB",
        default_value = "256"
    )]
    pub shard_memory_mb: usize,

    /// Pages per block in the block arena.
    #[clap(
        long = "memstore-num-block-pages",
        env = "MEMSTORE_NUM_BLOCK_PAGES",
        default_value = "1000"
    )]
    pub num_block_pages: usize,

    /// Flush groups per shard; partitions fan out over groups by key hash
    /// and flushes rotate through them.
    #[clap(
        long = "memstore-groups-per-shard",
        env = "MEMSTORE_GROUPS_PER_SHARD",
        default_value = "60"
    )]
    pub groups_per_shard: u16,

    /// Upper bound on live partitions per shard; sizes the write buffer
    /// arena and feeds the eviction policy.
    #[clap(
        long = "memstore-max-num-partitions",
        env = "MEMSTORE_MAX_NUM_PARTITIONS",
        default_value = "250000"
    )]
    pub max_num_partitions: usize,

    /// How long a demand-paged chunk stays resident before its block may be
    /// reclaimed.
    #[clap(
        long = "memstore-demand-paged-chunk-retention-period",
        env = "MEMSTORE_DEMAND_PAGED_CHUNK_RETENTION_PERIOD",
        default_value = "72h",
        parse(try_from_str = humantime::parse_duration)
    )]
    pub demand_paged_chunk_retention: Duration,

    /// How often the ingest driver seals and flushes the next group.
    #[clap(
        long = "memstore-flush-interval",
        env = "MEMSTORE_FLUSH_INTERVAL",
        default_value = "1m",
        parse(try_from_str = humantime::parse_duration)
    )]
    pub flush_interval: Duration,

    /// Health-probe deadline.
    #[clap(
        long = "memstore-status-timeout",
        env = "MEMSTORE_STATUS_TIMEOUT",
        default_value = "5s",
        parse(try_from_str = humantime::parse_duration)
    )]
    pub status_timeout: Duration,

    /// Deadline for connecting the source feed.
    #[clap(
        long = "memstore-lifecycle-connect-timeout",
        env = "MEMSTORE_LIFECYCLE_CONNECT_TIMEOUT",
        default_value = "30s",
        parse(try_from_str = humantime::parse_duration)
    )]
    pub connect_timeout: Duration,

    /// Deadline for the graceful-shutdown drain.
    #[clap(
        long = "memstore-lifecycle-shutdown-timeout",
        env = "MEMSTORE_LIFECYCLE_SHUTDOWN_TIMEOUT",
        default_value = "60s",
        parse(try_from_str = humantime::parse_duration)
    )]
    pub shutdown_timeout: Duration,

    /// Publish flush failures to the failures topic.
    #[clap(
        long = "memstore-failures-channel-enabled",
        env = "MEMSTORE_FAILURES_CHANNEL_ENABLED"
    )]
    pub failures_channel_enabled: bool,

    /// Topic name for flush-failure notifications.
    #[clap(
        long = "memstore-failures-topic",
        env = "MEMSTORE_FAILURES_TOPIC",
        default_value = "memstore-failures"
    )]
    pub failures_topic: String,
}

impl Default for MemStoreConfig {
    fn default() -> Self {
        Self {
            max_chunks_size: 400,
            shard_memory_mb: 256,
            num_block_pages: 1000,
            groups_per_shard: 60,
            max_num_partitions: 250_000,
            demand_paged_chunk_retention: Duration::from_secs(72 * 3600),
            flush_interval: Duration::from_secs(60),
            status_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(60),
            failures_channel_enabled: false,
            failures_topic: "memstore-failures".to_string(),
        }
    }
}
