//! Exact nearest-neighbour search over the embedding matrix.
//!
//! Distances are squared Euclidean, the quantity a flat L2 index reports.
//! The index is rebuilt wholesale on every fit and never mutated afterwards.

use ndarray::{Array2, ArrayView1};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::error::{ChatLensError, Result};
use crate::persistence::{read_bincode, write_bincode};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlatL2Index {
    dim: usize,
    ntotal: usize,
    /// Row-major vectors, `ntotal * dim` values
    data: Vec<f32>,
}

/// Result of a k-NN query batch; row `q` holds the neighbours of query `q`,
/// nearest first.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub distances: Array2<f32>,
    pub ids: Array2<usize>,
}

impl FlatL2Index {
    pub fn build(matrix: &Array2<f32>) -> Result<Self> {
        let (ntotal, dim) = matrix.dim();
        if ntotal == 0 || dim == 0 {
            return Err(ChatLensError::Index(format!(
                "cannot build an index over a {}x{} matrix",
                ntotal, dim
            )));
        }
        debug!("Building flat L2 index over {} vectors of dimension {}", ntotal, dim);
        Ok(Self {
            dim,
            ntotal,
            data: matrix.iter().copied().collect(),
        })
    }

    pub fn len(&self) -> usize {
        self.ntotal
    }

    pub fn is_empty(&self) -> bool {
        self.ntotal == 0
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    fn vector(&self, id: usize) -> &[f32] {
        &self.data[id * self.dim..(id + 1) * self.dim]
    }

    /// `k` nearest stored vectors for every query row. `k` is clamped to the
    /// index size; equal distances are ordered by ascending id.
    pub fn search(&self, queries: &Array2<f32>, k: usize) -> Result<SearchResult> {
        if k == 0 {
            return Err(ChatLensError::Config("k must be at least 1".to_string()));
        }
        if queries.ncols() != self.dim && queries.nrows() > 0 {
            return Err(ChatLensError::Index(format!(
                "query dimension {} does not match index dimension {}",
                queries.ncols(),
                self.dim
            )));
        }

        let k = k.min(self.ntotal);
        let nq = queries.nrows();

        let rows: Vec<Vec<(f32, usize)>> = (0..nq)
            .into_par_iter()
            .map(|qi| self.nearest(queries.row(qi), k))
            .collect();

        let mut distances = Array2::<f32>::zeros((nq, k));
        let mut ids = Array2::<usize>::zeros((nq, k));
        for (qi, row) in rows.into_iter().enumerate() {
            for (j, (d, id)) in row.into_iter().enumerate() {
                distances[[qi, j]] = d;
                ids[[qi, j]] = id;
            }
        }

        Ok(SearchResult { distances, ids })
    }

    fn nearest(&self, query: ArrayView1<f32>, k: usize) -> Vec<(f32, usize)> {
        let mut scored: Vec<(f32, usize)> = (0..self.ntotal)
            .map(|id| (squared_l2(query, self.vector(id)), id))
            .collect();

        let by_distance = |a: &(f32, usize), b: &(f32, usize)| {
            a.0.total_cmp(&b.0).then(a.1.cmp(&b.1))
        };
        if k < scored.len() {
            scored.select_nth_unstable_by(k - 1, by_distance);
            scored.truncate(k);
        }
        scored.sort_by(by_distance);
        scored
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        write_bincode(path.as_ref(), self)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let index: Self = read_bincode(path.as_ref())?;
        if index.data.len() != index.ntotal * index.dim {
            return Err(ChatLensError::persistence(
                path.as_ref(),
                anyhow::anyhow!("index holds {} values, expected {}", index.data.len(), index.ntotal * index.dim),
            ));
        }
        Ok(index)
    }
}

fn squared_l2(a: ArrayView1<f32>, b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn points() -> Array2<f32> {
        array![[0.0, 0.0], [1.0, 0.0], [0.0, 2.0], [5.0, 5.0]]
    }

    #[test]
    fn test_self_query_returns_self_first() {
        let data = points();
        let index = FlatL2Index::build(&data).unwrap();
        let result = index.search(&data, 1).unwrap();
        for i in 0..data.nrows() {
            assert_eq!(result.ids[[i, 0]], i);
            assert_eq!(result.distances[[i, 0]], 0.0);
        }
    }

    #[test]
    fn test_distances_are_squared_and_sorted() {
        let index = FlatL2Index::build(&points()).unwrap();
        let result = index.search(&array![[0.0, 0.0]], 3).unwrap();
        assert_eq!(result.ids.row(0).to_vec(), vec![0, 1, 2]);
        assert_eq!(result.distances.row(0).to_vec(), vec![0.0, 1.0, 4.0]);
    }

    #[test]
    fn test_k_is_clamped_and_ties_by_id() {
        let data = array![[1.0, 0.0], [-1.0, 0.0], [0.0, 1.0]];
        let index = FlatL2Index::build(&data).unwrap();
        let result = index.search(&array![[0.0, 0.0]], 10).unwrap();
        assert_eq!(result.ids.ncols(), 3);
        assert_eq!(result.ids.row(0).to_vec(), vec![0, 1, 2]);
    }

    #[test]
    fn test_rejects_zero_k_and_wrong_dimension() {
        let index = FlatL2Index::build(&points()).unwrap();
        assert!(index.search(&array![[0.0, 0.0]], 0).is_err());
        assert!(index.search(&array![[0.0, 0.0, 0.0]], 1).is_err());
    }

    #[test]
    fn test_save_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("similarity.index");
        let index = FlatL2Index::build(&points()).unwrap();
        index.save(&path).unwrap();
        let loaded = FlatL2Index::load(&path).unwrap();
        assert_eq!(loaded, index);
    }
}
