//! Inverted partition-key index: `(column name, value)` to a compressed
//! bitmap of partition IDs, with set-algebra filter evaluation.

use std::{collections::BTreeMap, sync::Arc};

use croaring::Bitmap;
use data_types::{PartitionId, PartitionKey};
use metric::{Registry, U64Gauge};

/// A filter over partition-key columns.
///
/// Filters the index cannot resolve (unknown columns) are handed back as
/// residuals for the caller to apply row-side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterExpr {
    /// Column equals value.
    Eq {
        /// Column name.
        column: String,
        /// Expected value.
        value: String,
    },
    /// Column equals any of the values.
    In {
        /// Column name.
        column: String,
        /// Accepted values.
        values: Vec<String>,
    },
    /// All sub-filters hold.
    And(Vec<FilterExpr>),
    /// Any sub-filter holds.
    Or(Vec<FilterExpr>),
}

/// The result of pushing a filter tree down into the index.
#[derive(Debug)]
pub struct FilterEvaluation {
    /// Partition IDs matching the resolvable part of the filters, or `None`
    /// when nothing could be resolved (caller scans all partitions).
    pub ids: Option<Bitmap>,
    /// Filters the index could not resolve.
    pub residuals: Vec<FilterExpr>,
}

/// Inverted index from `(column name, value)` to partition IDs.
#[derive(Debug)]
pub struct PartitionKeyIndex {
    postings: BTreeMap<Arc<str>, BTreeMap<Vec<u8>, Bitmap>>,
    entries: U64Gauge,
    bytes: U64Gauge,
}

impl PartitionKeyIndex {
    /// Create an empty index.
    pub fn new(registry: &Registry) -> Self {
        let entries = registry
            .register_metric::<U64Gauge>(
                "memstore-index-entries",
                "Posting lists in the partition key index",
            )
            .recorder(&[]);
        let bytes = registry
            .register_metric::<U64Gauge>(
                "memstore-index-bytes",
                "Estimated bytes held by the partition key index",
            )
            .recorder(&[]);
        Self {
            postings: BTreeMap::new(),
            entries,
            bytes,
        }
    }

    /// Decompose `key` into its columns and insert `id` into each
    /// `(name, value)` posting list.
    pub fn add_key(&mut self, key: &PartitionKey, id: PartitionId) {
        for (name, value) in key.columns() {
            self.postings
                .entry(Arc::from(name))
                .or_default()
                .entry(value.as_bytes().to_vec())
                .or_insert_with(Bitmap::create)
                .add(id.bit());
        }
        self.publish_gauges();
    }

    /// Subtract `ids` from the posting lists of the given values under
    /// `column`, dropping entries that become empty.
    pub fn remove_entries(&mut self, column: &str, values: &[Vec<u8>], ids: &Bitmap) {
        if let Some(postings) = self.postings.get_mut(column) {
            for value in values {
                if let Some(bitmap) = postings.get_mut(value) {
                    bitmap.andnot_inplace(ids);
                    if bitmap.is_empty() {
                        postings.remove(value);
                    }
                }
            }
            if postings.is_empty() {
                self.postings.remove(column);
            }
        }
        self.publish_gauges();
    }

    /// Remove a set of evicted partitions given their keys.
    pub fn remove_keys<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a PartitionKey>,
        evicted: &Bitmap,
    ) {
        let mut by_column: BTreeMap<String, Vec<Vec<u8>>> = BTreeMap::new();
        for key in keys {
            for (name, value) in key.columns() {
                by_column
                    .entry(name.to_string())
                    .or_default()
                    .push(value.as_bytes().to_vec());
            }
        }
        for (column, values) in by_column {
            self.remove_entries(&column, &values, evicted);
        }
    }

    /// Evaluate a filter tree (implicitly ANDed) over the posting lists.
    pub fn parse_filters(&self, filters: &[FilterExpr]) -> FilterEvaluation {
        let mut ids: Option<Bitmap> = None;
        let mut residuals = Vec::new();
        for filter in filters {
            match self.eval(filter) {
                Some(matched) => {
                    ids = Some(match ids {
                        None => matched,
                        Some(mut acc) => {
                            acc.and_inplace(&matched);
                            acc
                        }
                    });
                }
                None => residuals.push(filter.clone()),
            }
        }
        FilterEvaluation { ids, residuals }
    }

    /// `None` when the filter touches a column this index does not know.
    fn eval(&self, filter: &FilterExpr) -> Option<Bitmap> {
        match filter {
            FilterExpr::Eq { column, value } => {
                let postings = self.postings.get(column.as_str())?;
                Some(
                    postings
                        .get(value.as_bytes())
                        .cloned()
                        .unwrap_or_else(Bitmap::create),
                )
            }
            FilterExpr::In { column, values } => {
                let postings = self.postings.get(column.as_str())?;
                let mut acc = Bitmap::create();
                for value in values {
                    if let Some(bitmap) = postings.get(value.as_bytes()) {
                        acc.or_inplace(bitmap);
                    }
                }
                Some(acc)
            }
            FilterExpr::And(children) => {
                // Unresolvable children poison the conjunction: a partial
                // AND would overmatch only, which is fine for an index, so
                // evaluate what we can and require at least one child.
                let mut acc: Option<Bitmap> = None;
                for child in children {
                    let matched = self.eval(child)?;
                    acc = Some(match acc {
                        None => matched,
                        Some(mut a) => {
                            a.and_inplace(&matched);
                            a
                        }
                    });
                }
                acc
            }
            FilterExpr::Or(children) => {
                // An OR with any unresolvable child cannot bound the result.
                let mut acc = Bitmap::create();
                for child in children {
                    acc.or_inplace(&self.eval(child)?);
                }
                Some(acc)
            }
        }
    }

    /// The indexed column names.
    pub fn index_names(&self) -> Vec<Arc<str>> {
        self.postings.keys().cloned().collect()
    }

    /// The indexed values under `column`.
    pub fn index_values(&self, column: &str) -> Vec<Vec<u8>> {
        self.postings
            .get(column)
            .map(|postings| postings.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop all postings.
    pub fn clear(&mut self) {
        self.postings.clear();
        self.publish_gauges();
    }

    fn publish_gauges(&self) {
        let mut entries = 0u64;
        let mut bytes = 0u64;
        for (name, postings) in &self.postings {
            for (value, bitmap) in postings {
                entries += 1;
                bytes += (name.len() + value.len()) as u64
                    + bitmap.get_serialized_size_in_bytes() as u64;
            }
        }
        self.entries.set(entries);
        self.bytes.set(bytes);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::DatasetSchema;

    fn schema() -> DatasetSchema {
        DatasetSchema::new("metrics", ["metric", "host"], ["value"])
    }

    fn key(schema: &DatasetSchema, metric: &str, host: &str) -> PartitionKey {
        schema
            .partition_key(&[("metric", metric), ("host", host)])
            .unwrap()
    }

    fn eq(column: &str, value: &str) -> FilterExpr {
        FilterExpr::Eq {
            column: column.to_string(),
            value: value.to_string(),
        }
    }

    fn populated() -> (PartitionKeyIndex, DatasetSchema) {
        let s = schema();
        let mut index = PartitionKeyIndex::new(&Registry::new());
        index.add_key(&key(&s, "cpu", "h0"), PartitionId::new(0));
        index.add_key(&key(&s, "cpu", "h1"), PartitionId::new(1));
        index.add_key(&key(&s, "mem", "h0"), PartitionId::new(2));
        (index, s)
    }

    #[test]
    fn eq_and_in_filters_hit_posting_lists() {
        let (index, _) = populated();

        let eval = index.parse_filters(&[eq("metric", "cpu")]);
        assert_eq!(eval.ids.unwrap().to_vec(), vec![0, 1]);
        assert!(eval.residuals.is_empty());

        let eval = index.parse_filters(&[FilterExpr::In {
            column: "host".to_string(),
            values: vec!["h0".to_string(), "h1".to_string()],
        }]);
        assert_eq!(eval.ids.unwrap().to_vec(), vec![0, 1, 2]);
    }

    #[test]
    fn top_level_filters_are_anded() {
        let (index, _) = populated();
        let eval = index.parse_filters(&[eq("metric", "cpu"), eq("host", "h0")]);
        assert_eq!(eval.ids.unwrap().to_vec(), vec![0]);
    }

    #[test]
    fn or_trees_union() {
        let (index, _) = populated();
        let eval = index.parse_filters(&[FilterExpr::Or(vec![
            FilterExpr::And(vec![eq("metric", "cpu"), eq("host", "h1")]),
            eq("metric", "mem"),
        ])]);
        assert_eq!(eval.ids.unwrap().to_vec(), vec![1, 2]);
    }

    #[test]
    fn unknown_columns_become_residuals() {
        let (index, _) = populated();
        let residual = eq("rack", "r1");
        let eval = index.parse_filters(&[eq("metric", "cpu"), residual.clone()]);
        assert_eq!(eval.ids.unwrap().to_vec(), vec![0, 1]);
        assert_eq!(eval.residuals, vec![residual]);

        // An OR touching an unknown column cannot bound anything.
        let eval = index.parse_filters(&[FilterExpr::Or(vec![eq("metric", "cpu"), eq("rack", "r1")])]);
        assert!(eval.ids.is_none());
        assert_eq!(eval.residuals.len(), 1);
    }

    #[test]
    fn eviction_subtracts_and_prunes_empty_entries() {
        let (mut index, s) = populated();
        let evicted = Bitmap::of(&[0]);
        index.remove_keys([&key(&s, "cpu", "h0")], &evicted);

        // id 0 is gone from both of its posting lists...
        let eval = index.parse_filters(&[eq("metric", "cpu")]);
        assert_eq!(eval.ids.unwrap().to_vec(), vec![1]);
        // ...and the now-empty (host, h0) entry kept only id 2.
        let eval = index.parse_filters(&[eq("host", "h0")]);
        assert_eq!(eval.ids.unwrap().to_vec(), vec![2]);

        index.remove_keys([&key(&s, "mem", "h0")], &Bitmap::of(&[2]));
        assert_eq!(index.index_values("host"), vec![b"h1".to_vec()]);
    }
}
