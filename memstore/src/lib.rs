//! In-memory shard engine for a sharded, append-mostly time-series store.
//!
//! A shard owns a disjoint subset of a dataset's time series ("partitions").
//! It ingests ordered records into pooled write buffers, periodically seals
//! those buffers into immutable encoded chunks stored in a page-aligned
//! block arena, streams the chunks and newly seen partition keys to a
//! durable columnar sink one flush group at a time, and advances a
//! per-group watermark through checkpoint commits so recovery can replay
//! the feed idempotently. Queries are served from in-memory chunks plus
//! chunks demand-paged back from the sink.
//!
//! Start at [`shard::TimeSeriesShard`] and its single-writer handle,
//! [`shard::ShardWriter`]; [`lifecycle::run_ingest_loop`] wires a shard to
//! a source feed.

#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    missing_docs,
    clippy::explicit_iter_loop,
    clippy::future_not_send,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

pub mod block;
pub mod buffer;
pub mod chunk;
pub mod config;
pub mod eviction;
pub mod index;
pub mod lifecycle;
pub mod paged;
pub mod partition;
pub mod shard;
pub mod sink;

pub use config::MemStoreConfig;
pub use shard::{PartitionScan, PartitionScanMethod, ShardStatus, ShardWriter, TimeSeriesShard};
pub use sink::{ColumnSink, DynError, FlushResponse, MetaStore, SinkResponse};
