//! k-nearest-neighbor matching on labeled embedding vectors.
//!
//! The store keeps every example it was taught, grouped by label, and answers
//! queries with a majority vote over the most cosine-similar rows of a pooled
//! matrix. Labels with fewer than `k` examples are mirror-padded in the pooled
//! matrix so that labels with many examples do not unfairly win the vote.

use std::collections::HashMap;
use std::hash::Hash;

use ndarray::{Array1, Array2, ArrayView1, Axis};
use thiserror::Error;

/// Neighbor count used by [`EmbeddingStore::default`].
pub const DEFAULT_K: usize = 3;

/// Vector rejected at the store boundary.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidVector {
    /// The L2 norm is zero or not finite, normalization is undefined.
    #[error("embedding norm is zero or not finite")]
    UnusableNorm,
    /// The dimensionality differs from the embeddings already stored.
    #[error("embedding has dimension {got}, store holds dimension {expected}")]
    DimensionMismatch { expected: usize, got: usize },
}

/// Store of labeled embeddings answering k-nearest-neighbor queries.
///
/// Every embedding is unit-normalized on insertion, so the dot product of a
/// normalized query against the pooled matrix is the cosine similarity.
/// Mutation and queries must not interleave from concurrent callers; wrap the
/// store in a single lock if it is shared.
pub struct EmbeddingStore<L> {
    by_label: Vec<(L, Vec<Array1<f32>>)>,
    pooled_matrix: Option<Array2<f32>>,
    pooled_labels: Vec<L>,
    dim: Option<usize>,
    k: usize,
}

impl<L: Clone + Eq + Hash> EmbeddingStore<L> {
    /// Create an empty store voting over `k` nearest neighbors.
    pub fn new(k: usize) -> Self {
        Self {
            by_label: Vec::new(),
            pooled_matrix: None,
            pooled_labels: Vec::new(),
            dim: None,
            k,
        }
    }

    /// Drop all stored examples, including the learned dimensionality.
    pub fn clear(&mut self) {
        self.by_label.clear();
        self.pooled_matrix = None;
        self.pooled_labels.clear();
        self.dim = None;
    }

    /// Number of neighbors each query votes over.
    pub fn k(&self) -> usize {
        self.k
    }

    /// Total number of raw examples over all labels, padding excluded.
    pub fn example_count(&self) -> usize {
        self.by_label.iter().map(|(_, embs)| embs.len()).sum()
    }

    /// Labels of the pooled matrix rows, one entry per row.
    pub fn pooled_labels(&self) -> &[L] {
        &self.pooled_labels
    }

    /// Pooled matrix of normalized example rows, `None` while empty.
    pub fn pooled_matrix(&self) -> Option<&Array2<f32>> {
        self.pooled_matrix.as_ref()
    }

    /// Normalize `embedding` and store it as an example for `label`.
    ///
    /// Rebuilds the pooled matrix from all raw examples, which costs one pass
    /// over everything stored so far. Fine at interactive teaching scale.
    pub fn add_embedding(
        &mut self,
        embedding: ArrayView1<f32>,
        label: L,
    ) -> Result<(), InvalidVector> {
        let normal = self.normalized(embedding)?;
        self.dim = Some(normal.len());

        match self.by_label.iter_mut().find(|(known, _)| *known == label) {
            Some((_, embs)) => embs.push(normal),
            None => self.by_label.push((label, vec![normal])),
        }

        self.rebuild_pooled();
        Ok(())
    }

    /// Label winning the majority vote among the `min(k, rows)` pooled rows
    /// most similar to `query`, or `None` while no example is stored.
    pub fn knn_embedding(&self, query: ArrayView1<f32>) -> Result<Option<L>, InvalidVector> {
        let pooled = match &self.pooled_matrix {
            Some(pooled) => pooled,
            None => return Ok(None),
        };
        let query = self.normalized(query)?;

        // Both sides are unit vectors, the dot product is the cosine similarity.
        let dists = pooled.dot(&query);
        let knn = self.k.min(dists.len());
        if knn == 0 {
            return Ok(None);
        }

        // Partial selection of the `knn` largest similarities, ties arbitrary.
        let mut indices: Vec<usize> = (0..dists.len()).collect();
        indices.select_nth_unstable_by(knn - 1, |&a, &b| dists[b].total_cmp(&dists[a]));

        let mut tally: HashMap<&L, usize> = HashMap::new();
        for &row in &indices[..knn] {
            *tally.entry(&self.pooled_labels[row]).or_default() += 1;
        }

        Ok(tally
            .into_iter()
            .max_by_key(|(_, votes)| *votes)
            .map(|(label, _)| label.clone()))
    }

    fn normalized(&self, embedding: ArrayView1<f32>) -> Result<Array1<f32>, InvalidVector> {
        if let Some(expected) = self.dim {
            if embedding.len() != expected {
                return Err(InvalidVector::DimensionMismatch {
                    expected,
                    got: embedding.len(),
                });
            }
        }

        let norm = embedding.dot(&embedding).sqrt();
        if !(norm.is_finite() && norm > 0.0) {
            return Err(InvalidVector::UnusableNorm);
        }

        Ok(embedding.map(|v| v / norm))
    }

    fn rebuild_pooled(&mut self) {
        let mut rows: Vec<ArrayView1<f32>> = Vec::new();
        let mut labels: Vec<L> = Vec::new();

        for (label, embs) in &self.by_label {
            let block = reflected_block(embs, self.k);
            labels.extend(std::iter::repeat(label.clone()).take(block.len()));
            rows.extend(block);
        }

        let pooled = ndarray::stack(Axis(0), &rows).expect("stored rows share one dimension");
        log::debug!("pooled {} rows over {} labels", labels.len(), self.by_label.len());

        self.pooled_matrix = Some(pooled);
        self.pooled_labels = labels;
    }
}

impl<L: Clone + Eq + Hash> Default for EmbeddingStore<L> {
    fn default() -> Self {
        Self::new(DEFAULT_K)
    }
}

/// Row views of `embs` extended to at least `min_rows` by mirror-padding at
/// the tail: a block `[a, b]` padded to three rows yields `[a, b, a]`, a block
/// `[a, b, c]` padded to five yields `[a, b, c, b, a]`. A single-row block
/// repeats its only row.
fn reflected_block<'a>(embs: &'a [Array1<f32>], min_rows: usize) -> Vec<ArrayView1<'a, f32>> {
    let mut rows: Vec<ArrayView1<f32>> = embs.iter().map(|emb| emb.view()).collect();
    for pos in embs.len()..min_rows {
        rows.push(embs[reflect_index(pos, embs.len())].view());
    }
    rows
}

/// Source index for tail position `pos` when mirroring a block of `len` rows,
/// bouncing between the block ends without repeating the boundary row.
fn reflect_index(pos: usize, len: usize) -> usize {
    if len == 1 {
        return 0;
    }
    let period = 2 * (len - 1);
    let offset = pos % period;
    if offset < len {
        offset
    } else {
        period - offset
    }
}

#[cfg(test)]
mod tests {
    use ndarray::arr1;

    use super::{reflect_index, EmbeddingStore, InvalidVector};

    fn label_rows(store: &EmbeddingStore<&str>, label: &str) -> usize {
        store.pooled_labels().iter().filter(|l| **l == label).count()
    }

    #[test]
    fn stored_embeddings_are_unit_normalized() {
        let mut store = EmbeddingStore::new(1);
        store.add_embedding(arr1(&[3.0, 4.0]).view(), "a").unwrap();
        store.add_embedding(arr1(&[300.0, 400.0]).view(), "a").unwrap();

        let pooled = store.pooled_matrix().unwrap();
        for row in pooled.rows() {
            let norm = row.dot(&row).sqrt();
            assert!((norm - 1.0).abs() < 1e-5);
        }
        assert_eq!(pooled.row(0), arr1(&[0.6, 0.8]));
    }

    #[test]
    fn empty_store_returns_no_result() {
        let store: EmbeddingStore<&str> = EmbeddingStore::default();
        assert_eq!(store.knn_embedding(arr1(&[1.0, 0.0]).view()), Ok(None));
    }

    #[test]
    fn single_example_matches_itself() {
        let mut store = EmbeddingStore::default();
        store.add_embedding(arr1(&[0.5, 0.5, 0.0]).view(), "a").unwrap();

        let result = store.knn_embedding(arr1(&[0.5, 0.5, 0.0]).view()).unwrap();
        assert_eq!(result, Some("a"));
    }

    #[test]
    fn small_labels_are_padded_to_k_rows() {
        let mut store = EmbeddingStore::new(3);
        store.add_embedding(arr1(&[1.0, 0.0]).view(), "a").unwrap();
        for i in 0..5 {
            let v = arr1(&[0.1 * i as f32, 1.0]);
            store.add_embedding(v.view(), "b").unwrap();
        }

        assert_eq!(label_rows(&store, "a"), 3);
        assert_eq!(label_rows(&store, "b"), 5);
        assert_eq!(store.pooled_matrix().unwrap().nrows(), 8);
        assert_eq!(store.pooled_labels().len(), 8);
        assert_eq!(store.example_count(), 6);
    }

    #[test]
    fn padding_reflects_rows_back_to_front() {
        let a = arr1(&[1.0, 0.0, 0.0]);
        let b = arr1(&[0.0, 1.0, 0.0]);
        let c = arr1(&[0.0, 0.0, 1.0]);

        let mut store = EmbeddingStore::new(3);
        store.add_embedding(a.view(), "x").unwrap();
        store.add_embedding(b.view(), "x").unwrap();

        let pooled = store.pooled_matrix().unwrap();
        assert_eq!(pooled.nrows(), 3);
        assert_eq!(pooled.row(0), a.view());
        assert_eq!(pooled.row(1), b.view());
        assert_eq!(pooled.row(2), a.view());

        let mut store = EmbeddingStore::new(5);
        store.add_embedding(a.view(), "x").unwrap();
        store.add_embedding(b.view(), "x").unwrap();
        store.add_embedding(c.view(), "x").unwrap();

        let pooled = store.pooled_matrix().unwrap();
        assert_eq!(pooled.nrows(), 5);
        assert_eq!(pooled.row(3), b.view());
        assert_eq!(pooled.row(4), a.view());
    }

    #[test]
    fn reflect_index_bounces_between_ends() {
        assert_eq!(reflect_index(1, 1), 0);
        assert_eq!(reflect_index(2, 1), 0);
        assert_eq!(reflect_index(2, 2), 0);
        assert_eq!(reflect_index(3, 2), 1);
        assert_eq!(reflect_index(3, 3), 1);
        assert_eq!(reflect_index(4, 3), 0);
        assert_eq!(reflect_index(5, 3), 1);
    }

    #[test]
    fn example_count_grows_by_one_and_resets() {
        let mut store = EmbeddingStore::default();
        for i in 1..=4 {
            store.add_embedding(arr1(&[1.0, i as f32]).view(), "a").unwrap();
            assert_eq!(store.example_count(), i);
        }

        store.clear();
        assert_eq!(store.example_count(), 0);
        assert_eq!(store.knn_embedding(arr1(&[1.0, 0.0]).view()), Ok(None));
    }

    #[test]
    fn clear_forgets_the_dimensionality() {
        let mut store = EmbeddingStore::default();
        store.add_embedding(arr1(&[1.0, 0.0]).view(), "a").unwrap();
        store.clear();

        // A different dimensionality is acceptable after a reset.
        store.add_embedding(arr1(&[1.0, 2.0, 3.0]).view(), "b").unwrap();
        assert_eq!(store.example_count(), 1);
    }

    #[test]
    fn zero_and_non_finite_vectors_are_rejected() {
        let mut store = EmbeddingStore::default();
        assert_eq!(
            store.add_embedding(arr1(&[0.0, 0.0]).view(), "a"),
            Err(InvalidVector::UnusableNorm)
        );
        assert_eq!(
            store.add_embedding(arr1(&[f32::NAN, 1.0]).view(), "a"),
            Err(InvalidVector::UnusableNorm)
        );

        // Nothing was stored by the failed calls.
        assert_eq!(store.example_count(), 0);
        assert!(store.pooled_matrix().is_none());
    }

    #[test]
    fn dimension_mismatch_is_rejected_on_add_and_query() {
        let mut store = EmbeddingStore::default();
        store.add_embedding(arr1(&[1.0, 0.0]).view(), "a").unwrap();

        assert_eq!(
            store.add_embedding(arr1(&[1.0, 0.0, 0.0]).view(), "a"),
            Err(InvalidVector::DimensionMismatch { expected: 2, got: 3 })
        );
        assert_eq!(
            store.knn_embedding(arr1(&[1.0]).view()),
            Err(InvalidVector::DimensionMismatch { expected: 2, got: 1 })
        );
        assert_eq!(store.example_count(), 1);
    }

    #[test]
    fn query_picks_the_closer_label() {
        let mut store = EmbeddingStore::new(3);
        store.add_embedding(arr1(&[1.0, 0.0]).view(), "cat").unwrap();
        store.add_embedding(arr1(&[0.0, 1.0]).view(), "dog").unwrap();

        let result = store.knn_embedding(arr1(&[0.9, 0.1]).view()).unwrap();
        assert_eq!(result, Some("cat"));
    }

    #[test]
    fn equidistant_query_returns_one_of_the_tied_labels() {
        let mut store = EmbeddingStore::new(2);
        store.add_embedding(arr1(&[1.0, 0.0]).view(), "a").unwrap();
        store.add_embedding(arr1(&[0.0, 1.0]).view(), "b").unwrap();

        let result = store.knn_embedding(arr1(&[1.0, 1.0]).view()).unwrap();
        assert!(matches!(result, Some("a") | Some("b")));
    }

    #[test]
    fn integer_labels_work_as_well() {
        let mut store = EmbeddingStore::default();
        store.add_embedding(arr1(&[1.0, 0.0]).view(), 7_u32).unwrap();
        let result = store.knn_embedding(arr1(&[2.0, 0.1]).view()).unwrap();
        assert_eq!(result, Some(7));
    }
}
