//! Shared data types for the time-series memstore.

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

use std::{fmt, sync::Arc};

use percent_encoding::{percent_encode, AsciiSet, CONTROLS};
use snafu::{ensure, OptionExt, Snafu};

/// Unique ID of a shard. A shard owns a disjoint subset of the dataset's
/// time series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ShardId(i32);

impl ShardId {
    /// Create a new `ShardId`.
    pub fn new(v: i32) -> Self {
        Self(v)
    }

    /// The inner value.
    pub fn get(&self) -> i32 {
        self.0
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Dense, shard-local ID of a partition (an individual time series).
///
/// Non-negative for live partitions; dense on purpose so group membership
/// and pending-flush sets can be expressed as compressed bitmaps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PartitionId(i32);

impl PartitionId {
    /// Create a new `PartitionId`.
    pub fn new(v: i32) -> Self {
        Self(v)
    }

    /// The inner value.
    pub fn get(&self) -> i32 {
        self.0
    }

    /// The bit position of this ID in a partition bitmap.
    ///
    /// Live partition IDs are never negative, which makes the cast lossless.
    pub fn bit(&self) -> u32 {
        debug_assert!(self.0 >= 0);
        self.0 as u32
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Time-ordered ID of a sealed, encoded chunk within a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChunkId(i64);

impl ChunkId {
    /// Create a new `ChunkId`.
    pub fn new(v: i64) -> Self {
        Self(v)
    }

    /// The inner value.
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Flush group number within a shard, in `[0, groups_per_shard)`.
///
/// A partition's group is a pure function of its partition key; a partition
/// never migrates groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GroupId(u16);

impl GroupId {
    /// Create a new `GroupId`.
    pub fn new(v: u16) -> Self {
        Self(v)
    }

    /// The inner value.
    pub fn get(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A source feed offset. Offsets are monotonic within a shard's feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SequenceNumber(i64);

impl SequenceNumber {
    /// Create a new `SequenceNumber`.
    pub fn new(v: i64) -> Self {
        Self(v)
    }

    /// The inner value.
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for SequenceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Describes one flush invocation: which group to flush and the offset the
/// group's checkpoint should advance to on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlushGroup {
    /// The group to flush.
    pub group: GroupId,
    /// Checkpoint offset for a successful flush. Must be positive for a
    /// checkpoint to be written.
    pub flush_watermark: SequenceNumber,
}

/// Errors constructing or decoding a binary partition key.
#[derive(Debug, Snafu)]
#[allow(missing_docs)]
pub enum KeyError {
    #[snafu(display("unknown partition column: {}", column))]
    UnknownColumn { column: String },

    #[snafu(display("missing partition column: {}", column))]
    MissingColumn { column: String },

    #[snafu(display("duplicate partition column: {}", column))]
    DuplicateColumn { column: String },

    #[snafu(display("partition column {} exceeds {} bytes", column, MAX_COLUMN_LEN))]
    ColumnTooLong { column: String },

    #[snafu(display("partition key bytes truncated at offset {}", offset))]
    Truncated { offset: usize },

    #[snafu(display("partition key contains invalid UTF-8 at offset {}", offset))]
    InvalidUtf8 { offset: usize },
}

/// Upper bound on the encoded length of a single partition-key column name
/// or value.
pub const MAX_COLUMN_LEN: usize = u16::MAX as usize;

/// Characters escaped when rendering partition-key values for humans.
const VALUE_ESCAPES: &AsciiSet = &CONTROLS.add(b'%').add(b',').add(b'=');

/// The canonical binary form of a partition key.
///
/// Layout (all integers little-endian): a `u16` pair count, then per pair a
/// `u16` name length, the name bytes, a `u16` value length and the value
/// bytes. Pairs appear in the dataset schema's partition-column order, so
/// two keys over the same columns are byte-equal iff they identify the same
/// series. Construct through [`DatasetSchema::partition_key`] or
/// [`PartitionKey::try_from_canonical`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionKey(Arc<[u8]>);

impl PartitionKey {
    /// Re-admit previously canonicalised bytes, e.g. keys read back from the
    /// durable sink during recovery. Validates the layout and UTF-8.
    pub fn try_from_canonical(bytes: impl Into<Arc<[u8]>>) -> Result<Self, KeyError> {
        let bytes = bytes.into();
        Self::parse(&bytes)?;
        Ok(Self(bytes))
    }

    fn from_validated(bytes: Vec<u8>) -> Self {
        Self(bytes.into())
    }

    /// The canonical bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Iterate the `(column name, value)` pairs of this key.
    pub fn columns(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        // Construction validated the layout, so parsing cannot fail here.
        Self::parse(&self.0).unwrap_or_default().into_iter()
    }

    fn parse(bytes: &[u8]) -> Result<Vec<(&str, &str)>, KeyError> {
        let mut pos = 0;
        let count = read_u16(bytes, &mut pos)?;
        let mut pairs = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = read_str(bytes, &mut pos)?;
            let value = read_str(bytes, &mut pos)?;
            pairs.push((name, value));
        }
        ensure!(pos == bytes.len(), TruncatedSnafu { offset: pos });
        Ok(pairs)
    }
}

impl fmt::Display for PartitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (name, value) in self.columns() {
            if !first {
                write!(f, ",")?;
            }
            first = false;
            write!(f, "{}={}", name, percent_encode(value.as_bytes(), VALUE_ESCAPES))?;
        }
        Ok(())
    }
}

fn read_u16(bytes: &[u8], pos: &mut usize) -> Result<u16, KeyError> {
    let end = pos.checked_add(2).context(TruncatedSnafu { offset: *pos })?;
    ensure!(end <= bytes.len(), TruncatedSnafu { offset: *pos });
    let v = u16::from_le_bytes([bytes[*pos], bytes[*pos + 1]]);
    *pos = end;
    Ok(v)
}

fn read_str<'a>(bytes: &'a [u8], pos: &mut usize) -> Result<&'a str, KeyError> {
    let len = read_u16(bytes, pos)? as usize;
    let end = pos.checked_add(len).context(TruncatedSnafu { offset: *pos })?;
    ensure!(end <= bytes.len(), TruncatedSnafu { offset: *pos });
    let s = std::str::from_utf8(&bytes[*pos..end]).ok().context(InvalidUtf8Snafu { offset: *pos })?;
    *pos = end;
    Ok(s)
}

/// The schema of the dataset a shard serves: which columns form the
/// partition key and which columns carry sample data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetSchema {
    name: Arc<str>,
    partition_columns: Vec<Arc<str>>,
    data_columns: Vec<Arc<str>>,
}

impl DatasetSchema {
    /// Create a schema. Partition-column order defines the canonical key
    /// layout and must therefore stay stable for the life of the dataset.
    pub fn new(
        name: impl Into<Arc<str>>,
        partition_columns: impl IntoIterator<Item = impl Into<Arc<str>>>,
        data_columns: impl IntoIterator<Item = impl Into<Arc<str>>>,
    ) -> Self {
        Self {
            name: name.into(),
            partition_columns: partition_columns.into_iter().map(Into::into).collect(),
            data_columns: data_columns.into_iter().map(Into::into).collect(),
        }
    }

    /// The dataset name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Columns forming the partition key, in canonical order.
    pub fn partition_columns(&self) -> &[Arc<str>] {
        &self.partition_columns
    }

    /// Columns carrying sample values, in row order.
    pub fn data_columns(&self) -> &[Arc<str>] {
        &self.data_columns
    }

    /// Number of sample-value columns (the timestamp column not included).
    pub fn num_data_columns(&self) -> usize {
        self.data_columns.len()
    }

    /// Canonicalise unordered `(name, value)` pairs into the binary
    /// partition key for this schema.
    ///
    /// Every partition column must appear exactly once; unknown columns are
    /// rejected.
    pub fn partition_key(&self, pairs: &[(&str, &str)]) -> Result<PartitionKey, KeyError> {
        for (name, _) in pairs {
            ensure!(
                self.partition_columns.iter().any(|c| c.as_ref() == *name),
                UnknownColumnSnafu { column: *name }
            );
        }

        let mut out = Vec::with_capacity(16);
        out.extend_from_slice(&(self.partition_columns.len() as u16).to_le_bytes());
        for column in &self.partition_columns {
            let mut found = None;
            for (name, value) in pairs {
                if *name == column.as_ref() {
                    ensure!(found.is_none(), DuplicateColumnSnafu { column: *name });
                    found = Some(*value);
                }
            }
            let value = found.context(MissingColumnSnafu { column: column.as_ref() })?;
            for part in [column.as_ref(), value] {
                ensure!(part.len() <= MAX_COLUMN_LEN, ColumnTooLongSnafu { column: column.as_ref() });
                out.extend_from_slice(&(part.len() as u16).to_le_bytes());
                out.extend_from_slice(part.as_bytes());
            }
        }
        Ok(PartitionKey::from_validated(out))
    }
}

/// One sample: a timestamp plus one value per data column of the schema.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRow {
    /// Sample timestamp, nanoseconds since the epoch.
    pub timestamp: i64,
    /// Values, positionally matching [`DatasetSchema::data_columns`].
    pub values: Vec<f64>,
}

impl SampleRow {
    /// Create a new row.
    pub fn new(timestamp: i64, values: Vec<f64>) -> Self {
        Self { timestamp, values }
    }
}

/// One record delivered by the source feed.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestRecord {
    /// Canonical binary partition key of the series this record belongs to.
    pub key: PartitionKey,
    /// The sample itself.
    pub row: SampleRow,
    /// Source feed offset of this record.
    pub offset: SequenceNumber,
}
