//! Density clustering of projected points and the indices derived from it.
//!
//! DBSCAN here matches the usual library semantics: a point's neighbourhood
//! includes the point itself, a point is core when its neighbourhood holds at
//! least `min_samples` points, clusters are grown from unvisited core points
//! in index order, and border points join the first cluster that reaches
//! them. Cluster ids are therefore contiguous from 0 in discovery order.

use ndarray::Array2;
use rayon::prelude::*;
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::config::ChatLensConfig;
use crate::error::{ChatLensError, Result};
use crate::types::ClusterLabel;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DbscanParams {
    eps: f32,
    min_samples: usize,
    workers: usize,
}

impl DbscanParams {
    pub fn new(eps: f32, min_samples: usize, workers: usize) -> Result<Self> {
        if !eps.is_finite() || eps <= 0.0 {
            return Err(ChatLensError::Clustering(format!("eps must be positive, got {}", eps)));
        }
        if min_samples == 0 {
            return Err(ChatLensError::Clustering("min_samples must be at least 1".to_string()));
        }
        if workers == 0 {
            return Err(ChatLensError::Clustering("worker count must be at least 1".to_string()));
        }
        Ok(Self { eps, min_samples, workers })
    }

    pub fn from_config(config: &ChatLensConfig) -> Result<Self> {
        Self::new(config.dbscan_eps, config.dbscan_min_samples, config.dbscan_workers)
    }

    pub fn eps(&self) -> f32 {
        self.eps
    }

    pub fn min_samples(&self) -> usize {
        self.min_samples
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

/// Label every row of `points`; rows outside any dense region are noise.
pub fn dbscan(points: &Array2<f32>, params: &DbscanParams) -> Result<Vec<ClusterLabel>> {
    let n = points.nrows();
    if n == 0 {
        return Ok(Vec::new());
    }
    if points.iter().any(|v| !v.is_finite()) {
        return Err(ChatLensError::Clustering("points contain non-finite coordinates".to_string()));
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(params.workers)
        .build()
        .map_err(|e| ChatLensError::Clustering(format!("failed to start worker pool: {}", e)))?;

    let neighborhoods = pool.install(|| region_queries(points, params.eps));
    let is_core: Vec<bool> = neighborhoods
        .iter()
        .map(|nb| nb.len() >= params.min_samples)
        .collect();

    debug!("DBSCAN: {} of {} points are core", is_core.iter().filter(|&&c| c).count(), n);

    let mut labels: Vec<Option<usize>> = vec![None; n];
    let mut next_cluster = 0usize;

    for start in 0..n {
        if labels[start].is_some() || !is_core[start] {
            continue;
        }

        let cluster = next_cluster;
        next_cluster += 1;
        labels[start] = Some(cluster);
        let mut stack = vec![start];

        while let Some(current) = stack.pop() {
            for &j in &neighborhoods[current] {
                if labels[j].is_some() {
                    continue;
                }
                labels[j] = Some(cluster);
                // border points join but do not expand
                if is_core[j] {
                    stack.push(j);
                }
            }
        }
    }

    Ok(labels
        .into_iter()
        .map(|l| l.map(ClusterLabel::Cluster).unwrap_or(ClusterLabel::Noise))
        .collect())
}

/// Indices within `eps` of each point (self included), ascending.
///
/// Points are swept in order of their first coordinate so only candidates
/// whose first coordinate lies within `eps` are compared in full.
fn region_queries(points: &Array2<f32>, eps: f32) -> Vec<Vec<usize>> {
    let n = points.nrows();
    let dim = points.ncols();
    let flat: Vec<f32> = points.iter().copied().collect();
    let row = |i: usize| &flat[i * dim..(i + 1) * dim];
    let eps_sq = eps * eps;

    let key = |i: usize| if dim == 0 { 0.0 } else { flat[i * dim] };
    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| key(a).total_cmp(&key(b)).then(a.cmp(&b)));
    let sorted_keys: Vec<f32> = order.iter().map(|&i| key(i)).collect();

    (0..n)
        .into_par_iter()
        .map(|i| {
            let x = key(i);
            let lo = sorted_keys.partition_point(|&k| k < x - eps);
            let hi = sorted_keys.partition_point(|&k| k <= x + eps);
            let mut neighbors: Vec<usize> = order[lo..hi]
                .iter()
                .copied()
                .filter(|&j| {
                    let d: f32 = row(i)
                        .iter()
                        .zip(row(j))
                        .map(|(a, b)| (a - b) * (a - b))
                        .sum();
                    d <= eps_sq
                })
                .collect();
            neighbors.sort_unstable();
            neighbors
        })
        .collect()
}

/// Document ids per label, ascending. Noise is included under its own key.
pub fn label_to_docs(labels: &[ClusterLabel]) -> BTreeMap<ClusterLabel, Vec<usize>> {
    let mut index: BTreeMap<ClusterLabel, Vec<usize>> = BTreeMap::new();
    for (doc, label) in labels.iter().enumerate() {
        index.entry(*label).or_default().push(doc);
    }
    index
}

/// Centroid of each non-noise cluster in projected space.
pub fn cluster_centers(
    projections: &Array2<f32>,
    label2docs: &BTreeMap<ClusterLabel, Vec<usize>>,
) -> BTreeMap<usize, Vec<f32>> {
    let dim = projections.ncols();
    label2docs
        .iter()
        .filter_map(|(label, docs)| label.cluster_id().map(|id| (id, docs)))
        .filter(|(_, docs)| !docs.is_empty())
        .map(|(id, docs)| {
            let mut center = vec![0.0f32; dim];
            for &doc in docs {
                for (c, v) in center.iter_mut().zip(projections.row(doc)) {
                    *c += *v;
                }
            }
            for c in center.iter_mut() {
                *c /= docs.len() as f32;
            }
            (id, center)
        })
        .collect()
}

/// Log noise count and per-cluster sizes.
pub fn report_cluster_sizes(label2docs: &BTreeMap<ClusterLabel, Vec<usize>>) {
    let noise = label2docs.get(&ClusterLabel::Noise).map(Vec::len).unwrap_or(0);
    let sizes: Vec<(usize, usize)> = label2docs
        .iter()
        .filter_map(|(l, docs)| l.cluster_id().map(|id| (id, docs.len())))
        .collect();
    info!("Found {} clusters and {} noise points", sizes.len(), noise);
    for (id, size) in sizes {
        debug!("Cluster {}: {} documents", id, size);
    }
}
