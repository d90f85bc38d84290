//! Chunk identity, the 12-byte block metadata slot, and payload codecs.

use std::fmt::Debug;

use data_types::{ChunkId, PartitionId, PartitionKey};
use snafu::{ensure, Snafu};

use crate::block::ChunkLocation;

/// Size of a chunk's block metadata slot: a 4-byte partition ID followed by
/// an 8-byte chunk ID, little-endian.
pub const CHUNK_META_SIZE: usize = 12;

/// Encode a chunk's block metadata slot.
pub fn encode_chunk_slot(partition: PartitionId, chunk: ChunkId) -> [u8; CHUNK_META_SIZE] {
    let mut slot = [0u8; CHUNK_META_SIZE];
    slot[..4].copy_from_slice(&partition.get().to_le_bytes());
    slot[4..].copy_from_slice(&chunk.get().to_le_bytes());
    slot
}

/// Decode a slot written by [`encode_chunk_slot`].
///
/// # Panics
///
/// Asserts the slot is exactly [`CHUNK_META_SIZE`] bytes; the reclaim path
/// relies on this to catch layout drift.
pub fn decode_chunk_slot(slot: &[u8]) -> (PartitionId, ChunkId) {
    assert_eq!(
        slot.len(),
        CHUNK_META_SIZE,
        "chunk metadata slot must be exactly {} bytes",
        CHUNK_META_SIZE
    );
    let partition = i32::from_le_bytes(slot[..4].try_into().expect("4 byte prefix"));
    let chunk = i64::from_le_bytes(slot[4..].try_into().expect("8 byte suffix"));
    (PartitionId::new(partition), ChunkId::new(chunk))
}

/// An encoded, immutable chunk resident in the block arena.
///
/// Cloning is cheap; clones pin the backing block memory until dropped.
#[derive(Debug, Clone)]
pub struct ChunkRef {
    chunk_id: ChunkId,
    num_rows: u32,
    location: ChunkLocation,
}

impl ChunkRef {
    pub(crate) fn new(chunk_id: ChunkId, num_rows: u32, location: ChunkLocation) -> Self {
        Self {
            chunk_id,
            num_rows,
            location,
        }
    }

    /// The chunk's time-ordered ID.
    pub fn chunk_id(&self) -> ChunkId {
        self.chunk_id
    }

    /// Samples encoded in this chunk.
    pub fn num_rows(&self) -> u32 {
        self.num_rows
    }

    /// The encoded payload bytes.
    pub fn payload(&self) -> &[u8] {
        self.location.bytes()
    }
}

/// One encoded chunk headed to the durable sink.
#[derive(Debug, Clone)]
pub struct ChunkSet {
    /// Shard-local ID of the owning partition.
    pub partition_id: PartitionId,
    /// Canonical key of the owning partition.
    pub partition_key: PartitionKey,
    /// The chunk itself.
    pub chunk: ChunkRef,
}

/// Errors decoding a chunk payload.
#[derive(Debug, Snafu)]
#[allow(missing_copy_implementations, missing_docs)]
pub enum CodecError {
    #[snafu(display("chunk payload truncated ({} bytes)", len))]
    Truncated { len: usize },

    #[snafu(display("unsupported chunk encoding {}", id))]
    UnsupportedEncoding { id: u8 },
}

/// Encodes sealed buffer vectors into one contiguous chunk payload.
///
/// The production compression codecs live outside this crate; the engine
/// only cares that a sealed buffer becomes opaque bytes and back.
pub trait ChunkCodec: Debug + Send + Sync {
    /// Append the encoded form of the vectors to `out`.
    fn encode(&self, timestamps: &[i64], columns: &[Vec<f64>], out: &mut Vec<u8>);

    /// Inverse of [`Self::encode`].
    fn decode(&self, payload: &[u8]) -> Result<(Vec<i64>, Vec<Vec<f64>>), CodecError>;
}

const PLAIN_ENCODING_ID: u8 = 0;

/// Uncompressed little-endian column vectors. The built-in fallback codec.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainCodec;

impl ChunkCodec for PlainCodec {
    fn encode(&self, timestamps: &[i64], columns: &[Vec<f64>], out: &mut Vec<u8>) {
        out.push(PLAIN_ENCODING_ID);
        out.extend_from_slice(&(columns.len() as u16).to_le_bytes());
        out.extend_from_slice(&(timestamps.len() as u32).to_le_bytes());
        for ts in timestamps {
            out.extend_from_slice(&ts.to_le_bytes());
        }
        for column in columns {
            debug_assert_eq!(column.len(), timestamps.len());
            for value in column {
                out.extend_from_slice(&value.to_le_bytes());
            }
        }
    }

    fn decode(&self, payload: &[u8]) -> Result<(Vec<i64>, Vec<Vec<f64>>), CodecError> {
        ensure!(payload.len() >= 7, TruncatedSnafu { len: payload.len() });
        ensure!(
            payload[0] == PLAIN_ENCODING_ID,
            UnsupportedEncodingSnafu { id: payload[0] }
        );
        let num_columns = u16::from_le_bytes([payload[1], payload[2]]) as usize;
        let num_rows = u32::from_le_bytes([payload[3], payload[4], payload[5], payload[6]]) as usize;
        let expected = 7 + 8 * num_rows * (num_columns + 1);
        ensure!(payload.len() == expected, TruncatedSnafu { len: payload.len() });

        let mut pos = 7;
        let mut read_i64 = |payload: &[u8]| {
            let v = i64::from_le_bytes(payload[pos..pos + 8].try_into().expect("8 bytes"));
            pos += 8;
            v
        };
        let timestamps = (0..num_rows).map(|_| read_i64(payload)).collect();
        let columns = (0..num_columns)
            .map(|_| (0..num_rows).map(|_| f64::from_bits(read_i64(payload) as u64)).collect())
            .collect();
        Ok((timestamps, columns))
    }
}
