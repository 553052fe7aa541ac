//! Directory-based artifact bundle.
//!
//! | file | contents |
//! |---|---|
//! | `embeddings.bin` | embedding matrix (N, D), bincode |
//! | `similarity.index` | [`FlatL2Index`], bincode |
//! | `projections.bin` | projection matrix (N, C), bincode |
//! | `cluster_labels.bin` | `i32` labels, `-1` for noise, bincode |
//! | `texts.json` | corpus as a JSON array of strings |
//! | `cluster_summaries.json` | optional, keys are stringified labels |
//!
//! Every file is written to a sibling temp file and renamed into place.

use anyhow::Context;
use ndarray::Array2;
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::error::{ChatLensError, Result};
use crate::index::FlatL2Index;
use crate::types::{ClusterLabel, ClusterLabels, ClusterSummaries};

pub const EMBEDDINGS_FILE: &str = "embeddings.bin";
pub const INDEX_FILE: &str = "similarity.index";
pub const PROJECTIONS_FILE: &str = "projections.bin";
pub const LABELS_FILE: &str = "cluster_labels.bin";
pub const TEXTS_FILE: &str = "texts.json";
pub const SUMMARIES_FILE: &str = "cluster_summaries.json";

/// Everything `fit` produces that is expensive to recompute.
#[derive(Debug, Clone)]
pub struct ArtifactBundle {
    pub texts: Vec<String>,
    pub embeddings: Array2<f32>,
    pub index: FlatL2Index,
    pub projections: Array2<f32>,
    pub labels: ClusterLabels,
    pub summaries: Option<ClusterSummaries>,
}

impl ArtifactBundle {
    /// Check that every per-document artifact has one row per text.
    pub fn check_shapes(&self) -> Result<()> {
        let n = self.texts.len();
        let checks = [
            ("embeddings", self.embeddings.nrows()),
            ("similarity index", self.index.len()),
            ("projections", self.projections.nrows()),
            ("cluster labels", self.labels.len()),
        ];
        for (what, actual) in checks {
            if actual != n {
                return Err(ChatLensError::ShapeMismatch { what, expected: n, actual });
            }
        }
        Ok(())
    }

    pub fn save(&self, folder: impl AsRef<Path>) -> Result<()> {
        let folder = folder.as_ref();
        std::fs::create_dir_all(folder)?;
        info!("Saving artifact bundle ({} documents) to {}", self.texts.len(), folder.display());

        write_bincode(&folder.join(EMBEDDINGS_FILE), &self.embeddings)?;
        self.index.save(folder.join(INDEX_FILE))?;
        write_bincode(&folder.join(PROJECTIONS_FILE), &self.projections)?;

        let raw_labels: Vec<i32> = self.labels.iter().map(|l| l.as_i64() as i32).collect();
        write_bincode(&folder.join(LABELS_FILE), &raw_labels)?;

        write_json(&folder.join(TEXTS_FILE), &self.texts)?;

        let summaries_path = folder.join(SUMMARIES_FILE);
        match &self.summaries {
            Some(summaries) => write_json(&summaries_path, summaries)?,
            // a stale file would be paired with the wrong labels on load
            None if summaries_path.exists() => std::fs::remove_file(&summaries_path)?,
            None => {}
        }

        Ok(())
    }

    pub fn load(folder: impl AsRef<Path>) -> Result<Self> {
        let folder = folder.as_ref();
        if !folder.is_dir() {
            return Err(ChatLensError::BundleNotFound(folder.to_path_buf()));
        }
        info!("Loading artifact bundle from {}", folder.display());

        let embeddings: Array2<f32> = read_bincode(&folder.join(EMBEDDINGS_FILE))?;
        let index = FlatL2Index::load(folder.join(INDEX_FILE))?;
        let projections: Array2<f32> = read_bincode(&folder.join(PROJECTIONS_FILE))?;

        let labels_path = folder.join(LABELS_FILE);
        let raw_labels: Vec<i32> = read_bincode(&labels_path)?;
        let labels = raw_labels
            .into_iter()
            .map(|l| ClusterLabel::try_from(l as i64))
            .collect::<std::result::Result<ClusterLabels, _>>()
            .map_err(|e| ChatLensError::persistence(&labels_path, anyhow::anyhow!(e)))?;

        let texts: Vec<String> = read_json(&folder.join(TEXTS_FILE))?;

        let summaries_path = folder.join(SUMMARIES_FILE);
        let summaries = if summaries_path.exists() {
            Some(read_json::<ClusterSummaries>(&summaries_path)?)
        } else {
            debug!("No cluster summaries in bundle");
            None
        };

        let bundle = Self { texts, embeddings, index, projections, labels, summaries };
        bundle.check_shapes()?;
        Ok(bundle)
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = temp_path(path);
    std::fs::write(&tmp, bytes)
        .and_then(|_| std::fs::rename(&tmp, path))
        .map_err(|e| ChatLensError::persistence(path, e))
}

pub(crate) fn write_bincode<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = bincode::serialize(value).map_err(|e| ChatLensError::persistence(path, e))?;
    write_atomic(path, &bytes)
}

pub(crate) fn read_bincode<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("reading {}", path.display()))
        .map_err(|e| ChatLensError::persistence(path, e))?;
    bincode::deserialize(&bytes).map_err(|e| ChatLensError::persistence(path, e))
}

pub(crate) fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value)?;
    write_atomic(path, &bytes)
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))
        .map_err(|e| ChatLensError::persistence(path, e))?;
    serde_json::from_str(&content).map_err(|e| ChatLensError::persistence(path, e))
}
