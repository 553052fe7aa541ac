//! Neighbourhood-preserving projection of embeddings to a low-dimensional space.
//!
//! The UMAP path follows the reference algorithm: exact kNN under the chosen
//! metric, per-point `rho`/`sigma` calibration, fuzzy-union symmetrisation,
//! `a`/`b` fitted to the `min_dist`/`spread` curve, PCA initialisation and
//! seeded SGD with negative sampling. PCA alone is available as a cheaper,
//! linear alternative.

use linfa::prelude::*;
use linfa_reduction::Pca;
use ndarray::{Array1, Array2};
use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256Plus;
use rayon::prelude::*;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use tracing::{debug, error, info, warn};

use crate::config::{ChatLensConfig, DistanceMetric, ProjectionMethod};
use crate::error::{ChatLensError, Result};

const SMOOTH_K_TOLERANCE: f32 = 1e-5;
const MIN_K_DIST_SCALE: f32 = 1e-3;
const BINARY_SEARCH_STEPS: usize = 64;
const INIT_MAX_COORD: f32 = 10.0;
const INIT_NOISE: f32 = 1e-4;
const GRADIENT_CLIP: f32 = 4.0;
const REPULSION_STRENGTH: f32 = 1.0;

#[derive(Debug, Clone, PartialEq)]
pub struct ProjectionParams {
    pub method: ProjectionMethod,
    pub n_neighbors: usize,
    pub min_dist: f32,
    pub spread: f32,
    pub n_components: usize,
    pub metric: DistanceMetric,
    pub n_epochs: Option<usize>,
    pub negative_sample_rate: usize,
    pub seed: u64,
}

impl ProjectionParams {
    pub fn from_config(config: &ChatLensConfig) -> Self {
        Self {
            method: config.projection_method,
            n_neighbors: config.umap_n_neighbors,
            min_dist: config.umap_min_dist,
            spread: config.umap_spread,
            n_components: config.umap_n_components,
            metric: config.umap_metric,
            n_epochs: config.umap_n_epochs,
            negative_sample_rate: config.umap_negative_sample_rate,
            seed: config.seed,
        }
    }
}

impl Default for ProjectionParams {
    fn default() -> Self {
        Self::from_config(&ChatLensConfig::default())
    }
}

/// Fitted reducer, able to place unseen points in the same space.
pub enum ProjectionModel {
    Umap(UmapModel),
    Pca(PcaModel),
}

impl fmt::Debug for ProjectionModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProjectionModel::Umap(m) => f
                .debug_struct("Umap")
                .field("n_train", &m.data.nrows())
                .field("n_neighbors", &m.n_neighbors)
                .field("n_components", &m.embedding.ncols())
                .finish(),
            ProjectionModel::Pca(m) => f
                .debug_struct("Pca")
                .field("n_components", &m.n_components)
                .finish(),
        }
    }
}

impl ProjectionModel {
    pub fn n_components(&self) -> usize {
        match self {
            ProjectionModel::Umap(m) => m.embedding.ncols(),
            ProjectionModel::Pca(m) => m.n_components,
        }
    }

    pub fn transform(&self, embeddings: &Array2<f32>) -> Result<Array2<f32>> {
        match self {
            ProjectionModel::Umap(m) => m.transform(embeddings),
            ProjectionModel::Pca(m) => m.transform(embeddings),
        }
    }
}

/// Project `embeddings` and return the coordinates with the fitted model.
/// Failures are logged here and returned as [`ChatLensError::Projection`].
pub fn project(
    params: &ProjectionParams,
    embeddings: &Array2<f32>,
) -> Result<(Array2<f32>, ProjectionModel)> {
    info!("Projecting {} points with {:?} to {} dimensions",
          embeddings.nrows(), params.method, params.n_components);

    let result = match params.method {
        ProjectionMethod::Umap => fit_umap(params, embeddings).map(|(coords, model)| (coords, ProjectionModel::Umap(model))),
        ProjectionMethod::Pca => fit_pca(params.n_components, embeddings).map(|(coords, model)| (coords, ProjectionModel::Pca(model))),
    };

    if let Err(e) = &result {
        error!("Projection of {} points failed: {}", embeddings.nrows(), e);
    }
    result
}

// PCA

pub struct PcaModel {
    pca: Pca<f64>,
    n_components: usize,
    dim: usize,
}

impl PcaModel {
    fn transform(&self, embeddings: &Array2<f32>) -> Result<Array2<f32>> {
        if embeddings.nrows() == 0 {
            return Ok(Array2::zeros((0, self.n_components)));
        }
        if embeddings.ncols() != self.dim {
            return Err(ChatLensError::Projection(format!(
                "expected {} input dimensions, got {}",
                self.dim,
                embeddings.ncols()
            )));
        }
        let data = embeddings.mapv(|v| v as f64);
        let projected: Array2<f64> = self.pca.predict(&data);
        Ok(projected.mapv(|v| v as f32))
    }
}

fn fit_pca(n_components: usize, embeddings: &Array2<f32>) -> Result<(Array2<f32>, PcaModel)> {
    let (n_points, dim) = embeddings.dim();
    if n_points < 2 {
        return Err(ChatLensError::Projection(format!("PCA needs at least 2 samples, got {}", n_points)));
    }
    if n_components > dim.min(n_points) {
        return Err(ChatLensError::Projection(format!(
            "cannot extract {} components from {} samples of dimension {}",
            n_components, n_points, dim
        )));
    }

    debug!("Running PCA on {} points with {} dimensions", n_points, dim);

    let data = embeddings.mapv(|v| v as f64);
    let targets = Array1::<usize>::zeros(n_points);
    let dataset = Dataset::new(data.clone(), targets);

    let pca = Pca::params(n_components)
        .fit(&dataset)
        .map_err(|e| ChatLensError::Projection(format!("failed to fit PCA model: {}", e)))?;

    let projected: Array2<f64> = pca.predict(&data);
    let model = PcaModel { pca, n_components, dim };
    Ok((projected.mapv(|v| v as f32), model))
}

// UMAP

pub struct UmapModel {
    /// Training inputs after metric preprocessing
    data: Array2<f32>,
    embedding: Array2<f32>,
    n_neighbors: usize,
    metric: DistanceMetric,
    mean_distance: f32,
}

impl UmapModel {
    pub fn embedding(&self) -> &Array2<f32> {
        &self.embedding
    }

    /// Membership-weighted average of the nearest training points' coordinates.
    fn transform(&self, embeddings: &Array2<f32>) -> Result<Array2<f32>> {
        let n_components = self.embedding.ncols();
        if embeddings.nrows() == 0 {
            return Ok(Array2::zeros((0, n_components)));
        }
        if embeddings.ncols() != self.data.ncols() {
            return Err(ChatLensError::Projection(format!(
                "expected {} input dimensions, got {}",
                self.data.ncols(),
                embeddings.ncols()
            )));
        }

        let queries = prepare(embeddings, self.metric);
        let dim = self.data.ncols();
        let train: Vec<f32> = self.data.iter().copied().collect();
        let mut out = Array2::<f32>::zeros((queries.nrows(), n_components));

        for (qi, query) in queries.rows().into_iter().enumerate() {
            let query = query.to_vec();
            let mut scored: Vec<(f32, usize)> = (0..self.data.nrows())
                .map(|j| (distance(self.metric, &query, &train[j * dim..(j + 1) * dim]), j))
                .collect();
            keep_nearest(&mut scored, self.n_neighbors);

            let dists: Vec<f32> = scored.iter().map(|(d, _)| *d).collect();
            let (sigma, rho) = smooth_knn_dist(&dists, self.mean_distance);

            let mut total = 0.0f32;
            for &(d, j) in &scored {
                let w = membership(d, rho, sigma);
                total += w;
                for c in 0..n_components {
                    out[[qi, c]] += w * self.embedding[[j, c]];
                }
            }
            if total > 0.0 {
                for c in 0..n_components {
                    out[[qi, c]] /= total;
                }
            } else if let Some(&(_, nearest)) = scored.first() {
                for c in 0..n_components {
                    out[[qi, c]] = self.embedding[[nearest, c]];
                }
            }
        }

        Ok(out)
    }
}

/// Sorted neighbours of every point, self excluded, nearest first.
struct KnnGraph {
    indices: Vec<Vec<usize>>,
    distances: Vec<Vec<f32>>,
}

fn fit_umap(params: &ProjectionParams, embeddings: &Array2<f32>) -> Result<(Array2<f32>, UmapModel)> {
    let (n_points, dim) = embeddings.dim();
    if n_points < 2 {
        return Err(ChatLensError::Projection(format!(
            "UMAP needs at least 2 samples, got {}",
            n_points
        )));
    }
    if dim == 0 || params.n_components == 0 {
        return Err(ChatLensError::Projection("zero-dimensional input or output".to_string()));
    }
    if params.n_neighbors < 2 {
        return Err(ChatLensError::Projection("n_neighbors must be at least 2".to_string()));
    }

    // n_neighbors counts the point itself
    let k = (params.n_neighbors - 1).min(n_points - 1);
    if k < params.n_neighbors - 1 {
        warn!("n_neighbors ({}) is larger than the dataset size; using {} neighbours",
              params.n_neighbors, k);
    }

    let data = prepare(embeddings, params.metric);
    let knn = nearest_neighbors(&data, k, params.metric);
    let mean_distance = mean_knn_distance(&knn);

    let n_epochs = params
        .n_epochs
        .unwrap_or(if n_points <= 10_000 { 500 } else { 200 });

    let mut edges = fuzzy_simplicial_set(&knn, mean_distance);
    let max_weight = edges.iter().map(|e| e.2).fold(0.0f32, f32::max);
    if max_weight <= 0.0 {
        return Err(ChatLensError::Projection("neighbourhood graph has no edges".to_string()));
    }
    edges.retain(|e| e.2 >= max_weight / n_epochs as f32);
    let epochs_per_sample: Vec<f32> = edges.iter().map(|e| max_weight / e.2).collect();

    let (a, b) = find_ab_params(params.spread, params.min_dist);
    debug!("UMAP: k={}, edges={}, epochs={}, a={:.4}, b={:.4}", k, edges.len(), n_epochs, a, b);

    let mut rng = Xoshiro256Plus::seed_from_u64(params.seed);
    let mut layout = initial_layout(embeddings, params.n_components, &mut rng);

    optimize_layout(
        &mut layout,
        params.n_components,
        &edges,
        &epochs_per_sample,
        a,
        b,
        n_epochs,
        params.negative_sample_rate,
        &mut rng,
    );

    let embedding = Array2::from_shape_vec((n_points, params.n_components), layout)
        .map_err(|e| ChatLensError::Projection(e.to_string()))?;

    if embedding.iter().any(|v| !v.is_finite()) {
        return Err(ChatLensError::Projection("optimisation diverged".to_string()));
    }

    let model = UmapModel {
        data,
        embedding: embedding.clone(),
        n_neighbors: k,
        metric: params.metric,
        mean_distance,
    };
    Ok((embedding, model))
}

/// Cosine distances are computed on unit rows, so rows are normalised up front.
fn prepare(embeddings: &Array2<f32>, metric: DistanceMetric) -> Array2<f32> {
    let mut data = embeddings.as_standard_layout().to_owned();
    if metric == DistanceMetric::Cosine {
        crate::embeddings::normalize_embeddings(&mut data);
    }
    data
}

fn distance(metric: DistanceMetric, a: &[f32], b: &[f32]) -> f32 {
    match metric {
        DistanceMetric::Cosine => {
            let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
            (1.0 - dot).max(0.0)
        }
        DistanceMetric::Euclidean => a
            .iter()
            .zip(b)
            .map(|(x, y)| (x - y) * (x - y))
            .sum::<f32>()
            .sqrt(),
    }
}

/// Keep the `k` closest `(distance, id)` pairs, sorted, ties to the lower id.
fn keep_nearest(scored: &mut Vec<(f32, usize)>, k: usize) {
    let by_distance = |a: &(f32, usize), b: &(f32, usize)| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1));
    if k == 0 {
        scored.clear();
        return;
    }
    if k < scored.len() {
        scored.select_nth_unstable_by(k - 1, by_distance);
        scored.truncate(k);
    }
    scored.sort_by(by_distance);
}

fn nearest_neighbors(data: &Array2<f32>, k: usize, metric: DistanceMetric) -> KnnGraph {
    let n = data.nrows();
    let dim = data.ncols();
    let flat: Vec<f32> = data.iter().copied().collect();
    let row = |i: usize| &flat[i * dim..(i + 1) * dim];

    let (indices, distances): (Vec<Vec<usize>>, Vec<Vec<f32>>) = (0..n)
        .into_par_iter()
        .map(|i| {
            let mut scored: Vec<(f32, usize)> = (0..n)
                .filter(|&j| j != i)
                .map(|j| (distance(metric, row(i), row(j)), j))
                .collect();
            keep_nearest(&mut scored, k);
            let row: (Vec<usize>, Vec<f32>) = scored.into_iter().map(|(d, j)| (j, d)).unzip();
            row
        })
        .unzip();

    KnnGraph { indices, distances }
}

fn mean_knn_distance(knn: &KnnGraph) -> f32 {
    let (sum, count) = knn
        .distances
        .iter()
        .flatten()
        .fold((0.0f64, 0usize), |(s, c), &d| (s + d as f64, c + 1));
    if count == 0 { 0.0 } else { (sum / count as f64) as f32 }
}

/// Binary search for the bandwidth making the neighbour memberships sum to
/// `log2(k + 1)`. Returns `(sigma, rho)`.
fn smooth_knn_dist(dists: &[f32], mean_distance: f32) -> (f32, f32) {
    let target = ((dists.len() + 1) as f32).log2();
    let rho = dists.iter().copied().find(|&d| d > 0.0).unwrap_or(0.0);

    let mut lo = 0.0f32;
    let mut hi = f32::INFINITY;
    let mut mid = 1.0f32;

    for _ in 0..BINARY_SEARCH_STEPS {
        let psum: f32 = dists.iter().map(|&d| membership(d, rho, mid)).sum();
        if (psum - target).abs() < SMOOTH_K_TOLERANCE {
            break;
        }
        if psum > target {
            hi = mid;
            mid = (lo + hi) / 2.0;
        } else {
            lo = mid;
            mid = if hi == f32::INFINITY { mid * 2.0 } else { (lo + hi) / 2.0 };
        }
    }

    let mut sigma = mid;
    if rho > 0.0 {
        let mean_i = dists.iter().sum::<f32>() / dists.len().max(1) as f32;
        sigma = sigma.max(MIN_K_DIST_SCALE * mean_i);
    } else {
        sigma = sigma.max(MIN_K_DIST_SCALE * mean_distance);
    }
    (sigma, rho)
}

fn membership(d: f32, rho: f32, sigma: f32) -> f32 {
    let x = d - rho;
    if x <= 0.0 || sigma <= 0.0 {
        1.0
    } else {
        (-x / sigma).exp()
    }
}

/// Symmetric edge list `(head, tail, weight)` sorted by `(head, tail)`,
/// combining both directions with the fuzzy union `a + b - ab`.
fn fuzzy_simplicial_set(knn: &KnnGraph, mean_distance: f32) -> Vec<(usize, usize, f32)> {
    let mut directed: HashMap<(usize, usize), f32> = HashMap::new();
    for (i, (neighbors, dists)) in knn.indices.iter().zip(&knn.distances).enumerate() {
        let (sigma, rho) = smooth_knn_dist(dists, mean_distance);
        for (&j, &d) in neighbors.iter().zip(dists) {
            directed.insert((i, j), membership(d, rho, sigma));
        }
    }

    let mut combined: BTreeMap<(usize, usize), f32> = BTreeMap::new();
    for (&(i, j), &w) in &directed {
        let back = directed.get(&(j, i)).copied().unwrap_or(0.0);
        let union = w + back - w * back;
        combined.insert((i, j), union);
        combined.insert((j, i), union);
    }

    combined
        .into_iter()
        .filter(|&(_, w)| w > 0.0)
        .map(|((i, j), w)| (i, j, w))
        .collect()
}

/// Fit `1 / (1 + a x^(2b))` to the target membership curve by
/// Levenberg-Marquardt on 300 points over `[0, 3 * spread]`.
pub fn find_ab_params(spread: f32, min_dist: f32) -> (f32, f32) {
    let spread = spread as f64;
    let min_dist = min_dist as f64;
    let xs: Vec<f64> = (0..300).map(|i| 3.0 * spread * i as f64 / 299.0).collect();
    let ys: Vec<f64> = xs
        .iter()
        .map(|&x| if x < min_dist { 1.0 } else { (-(x - min_dist) / spread).exp() })
        .collect();

    let loss = |a: f64, b: f64| -> f64 {
        xs.iter()
            .zip(&ys)
            .map(|(&x, &y)| {
                let r = 1.0 / (1.0 + a * x.powf(2.0 * b)) - y;
                r * r
            })
            .sum()
    };

    let (mut a, mut b) = (1.0f64, 1.0f64);
    let mut lambda = 1e-3;
    let mut current = loss(a, b);

    for _ in 0..200 {
        // normal equations J^T J and J^T r
        let (mut jaa, mut jab, mut jbb, mut ga, mut gb) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for (&x, &y) in xs.iter().zip(&ys) {
            if x <= 0.0 {
                continue;
            }
            let u = x.powf(2.0 * b);
            let denom = 1.0 + a * u;
            let r = 1.0 / denom - y;
            let da = -u / (denom * denom);
            let db = -a * u * 2.0 * x.ln() / (denom * denom);
            jaa += da * da;
            jab += da * db;
            jbb += db * db;
            ga += da * r;
            gb += db * r;
        }

        let m_aa = jaa * (1.0 + lambda);
        let m_bb = jbb * (1.0 + lambda);
        let det = m_aa * m_bb - jab * jab;
        if det.abs() < 1e-18 {
            break;
        }
        let step_a = -(m_bb * ga - jab * gb) / det;
        let step_b = -(m_aa * gb - jab * ga) / det;

        let (na, nb) = (a + step_a, b + step_b);
        if na > 0.0 && nb > 0.0 {
            let candidate = loss(na, nb);
            if candidate < current {
                let improvement = current - candidate;
                a = na;
                b = nb;
                current = candidate;
                lambda = (lambda / 10.0).max(1e-12);
                if improvement < 1e-14 {
                    break;
                }
                continue;
            }
        }
        lambda *= 10.0;
        if lambda > 1e12 {
            break;
        }
    }

    (a as f32, b as f32)
}

/// PCA coordinates scaled to `[-10, 10]` with a little seeded jitter,
/// or uniform random coordinates when PCA cannot run.
fn initial_layout(embeddings: &Array2<f32>, n_components: usize, rng: &mut Xoshiro256Plus) -> Vec<f32> {
    let n_points = embeddings.nrows();

    let pca_coords = fit_pca(n_components, embeddings)
        .map(|(coords, _)| coords)
        .and_then(|coords| {
            let max_abs = coords.iter().fold(0.0f32, |m, v| m.max(v.abs()));
            if max_abs > 0.0 && max_abs.is_finite() {
                Ok(coords.mapv(|v| v * INIT_MAX_COORD / max_abs))
            } else {
                Err(ChatLensError::Projection("degenerate PCA initialisation".to_string()))
            }
        });

    match pca_coords {
        Ok(coords) => coords
            .iter()
            .map(|&v| v + rng.gen_range(-INIT_NOISE..INIT_NOISE))
            .collect(),
        Err(e) => {
            warn!("PCA initialisation failed: {}, falling back to random layout", e);
            (0..n_points * n_components)
                .map(|_| rng.gen_range(-INIT_MAX_COORD..INIT_MAX_COORD))
                .collect()
        }
    }
}

fn clip(v: f32) -> f32 {
    v.clamp(-GRADIENT_CLIP, GRADIENT_CLIP)
}

#[allow(clippy::too_many_arguments)]
fn optimize_layout(
    layout: &mut [f32],
    dim: usize,
    edges: &[(usize, usize, f32)],
    epochs_per_sample: &[f32],
    a: f32,
    b: f32,
    n_epochs: usize,
    negative_sample_rate: usize,
    rng: &mut Xoshiro256Plus,
) {
    let n_vertices = layout.len() / dim;
    let neg_rate = negative_sample_rate.max(1) as f32;
    let epochs_per_negative_sample: Vec<f32> = epochs_per_sample.iter().map(|e| e / neg_rate).collect();
    let mut epoch_of_next_sample = epochs_per_sample.to_vec();
    let mut epoch_of_next_negative_sample = epochs_per_negative_sample.clone();

    for epoch in 0..n_epochs {
        let n = epoch as f32;
        let alpha = 1.0 - n / n_epochs as f32;

        for (e, &(j, k, _)) in edges.iter().enumerate() {
            if epoch_of_next_sample[e] > n {
                continue;
            }

            let dist_sq = squared_dist(layout, dim, j, k);
            let grad_coeff = if dist_sq > 0.0 {
                -2.0 * a * b * dist_sq.powf(b - 1.0) / (a * dist_sq.powf(b) + 1.0)
            } else {
                0.0
            };
            for d in 0..dim {
                let grad = clip(grad_coeff * (layout[j * dim + d] - layout[k * dim + d]));
                layout[j * dim + d] += grad * alpha;
                layout[k * dim + d] -= grad * alpha;
            }
            epoch_of_next_sample[e] += epochs_per_sample[e];

            let n_neg = ((n - epoch_of_next_negative_sample[e]) / epochs_per_negative_sample[e]).max(0.0) as usize;
            for _ in 0..n_neg {
                let other = rng.gen_range(0..n_vertices);
                if other == j {
                    continue;
                }
                let dist_sq = squared_dist(layout, dim, j, other);
                if dist_sq <= 0.0 {
                    continue;
                }
                let grad_coeff = 2.0 * REPULSION_STRENGTH * b
                    / ((0.001 + dist_sq) * (a * dist_sq.powf(b) + 1.0));
                for d in 0..dim {
                    let grad = clip(grad_coeff * (layout[j * dim + d] - layout[other * dim + d]));
                    layout[j * dim + d] += grad * alpha;
                }
            }
            epoch_of_next_negative_sample[e] += n_neg as f32 * epochs_per_negative_sample[e];
        }

        if epoch % 100 == 0 {
            debug!("UMAP epoch {}/{}", epoch, n_epochs);
        }
    }
}

fn squared_dist(layout: &[f32], dim: usize, i: usize, j: usize) -> f32 {
    (0..dim)
        .map(|d| {
            let diff = layout[i * dim + d] - layout[j * dim + d];
            diff * diff
        })
        .sum()
}
