//! Embed → index → project → cluster → summarize over one corpus.

use ndarray::Array2;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

use crate::clustering::{cluster_centers, dbscan, label_to_docs, report_cluster_sizes, DbscanParams};
use crate::config::ChatLensConfig;
use crate::embeddings::EmbeddingGenerator;
use crate::error::{ChatLensError, Result};
use crate::index::FlatL2Index;
use crate::persistence::ArtifactBundle;
use crate::summarizer::{ClusterDescriber, LlmDescriber, SummaryParams, Summarizer};
use crate::types::{ClusterLabel, ClusterLabels, ClusterSummaries};
use crate::umap::{project, ProjectionModel, ProjectionParams};
use crate::utils::most_common;

pub type LabelIndex = BTreeMap<ClusterLabel, Vec<usize>>;
pub type ClusterCenters = BTreeMap<usize, Vec<f32>>;

struct Fitted {
    bundle: ArtifactBundle,
    label2docs: LabelIndex,
    centers: ClusterCenters,
    // only available straight after fit; bundles do not carry it
    projection_model: Option<ProjectionModel>,
}

impl Fitted {
    fn new(bundle: ArtifactBundle, projection_model: Option<ProjectionModel>) -> Self {
        let label2docs = label_to_docs(&bundle.labels);
        let centers = cluster_centers(&bundle.projections, &label2docs);
        Self { bundle, label2docs, centers, projection_model }
    }
}

enum State {
    Empty,
    Fitted(Box<Fitted>),
}

/// Topic clustering over a corpus of conversation texts.
///
/// Calls on one instance must be serialized; `fit` and `load` take
/// `&mut self`, `infer` only reads.
pub struct ConversationClusterer {
    config: ChatLensConfig,
    embedder: EmbeddingGenerator,
    describer: Option<Arc<dyn ClusterDescriber>>,
    state: State,
}

impl ConversationClusterer {
    /// Build the configured embedding backend and, when summaries are
    /// enabled, the language-model describer.
    pub async fn new(config: ChatLensConfig) -> Result<Self> {
        config.validate()?;
        let embedder = EmbeddingGenerator::new(&config).await?;
        let describer: Option<Arc<dyn ClusterDescriber>> = if config.summary_create {
            let describer = LlmDescriber::from_config(&config)
                .await
                .map_err(|e| ChatLensError::LlmProvider(format!("{:#}", e)))?;
            Some(Arc::new(describer))
        } else {
            None
        };
        Self::with_components(config, embedder, describer)
    }

    pub fn with_components(
        config: ChatLensConfig,
        embedder: EmbeddingGenerator,
        describer: Option<Arc<dyn ClusterDescriber>>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            embedder,
            describer,
            state: State::Empty,
        })
    }

    pub fn config(&self) -> &ChatLensConfig {
        &self.config
    }

    pub fn is_fitted(&self) -> bool {
        matches!(self.state, State::Fitted(_))
    }

    fn fitted(&self) -> Result<&Fitted> {
        match &self.state {
            State::Fitted(fitted) => Ok(fitted),
            State::Empty => Err(ChatLensError::NotFitted),
        }
    }

    /// Run the whole pipeline. Precomputed `embeddings`, when given, replace
    /// the embedding step and are used as is apart from the row count.
    pub async fn fit(
        &mut self,
        texts: &[String],
        embeddings: Option<Array2<f32>>,
    ) -> Result<(Array2<f32>, ClusterLabels, Option<ClusterSummaries>)> {
        self.state = State::Empty;
        if texts.is_empty() {
            return Err(ChatLensError::EmptyCorpus);
        }
        let started = Instant::now();
        info!("Fitting on {} texts", texts.len());

        let embeddings = match embeddings {
            Some(embeddings) => {
                if embeddings.nrows() != texts.len() {
                    return Err(ChatLensError::ShapeMismatch {
                        what: "embeddings",
                        expected: texts.len(),
                        actual: embeddings.nrows(),
                    });
                }
                info!("Using {} precomputed embeddings", embeddings.nrows());
                embeddings
            }
            None => self.embedder.embed(texts).await?,
        };

        let index = FlatL2Index::build(&embeddings)?;

        let (projections, projection_model) =
            project(&ProjectionParams::from_config(&self.config), &embeddings)?;

        let dbscan_params = DbscanParams::from_config(&self.config)?;
        let labels = dbscan(&projections, &dbscan_params)?;

        let fitted = Fitted::new(
            ArtifactBundle {
                texts: texts.to_vec(),
                embeddings,
                index,
                projections,
                labels,
                summaries: None,
            },
            Some(projection_model),
        );
        report_cluster_sizes(&fitted.label2docs);
        let mut fitted = Box::new(fitted);

        if self.config.summary_create {
            match &self.describer {
                Some(describer) => {
                    let summarizer = Summarizer::new(describer.clone(), SummaryParams::from_config(&self.config));
                    fitted.bundle.summaries = Some(summarizer.summarize(texts, &fitted.bundle.labels).await);
                }
                None => warn!("Summaries requested but no describer is configured; skipping"),
            }
        }

        let result = (
            fitted.bundle.embeddings.clone(),
            fitted.bundle.labels.clone(),
            fitted.bundle.summaries.clone(),
        );
        self.state = State::Fitted(fitted);
        info!("Fit finished in {:.2?}", started.elapsed());
        Ok(result)
    }

    /// Label new texts by majority vote over their `top_k` nearest corpus
    /// documents; ties go to the label met first in nearest-first order.
    pub async fn infer(&self, texts: &[String], top_k: usize) -> Result<(ClusterLabels, Array2<f32>)> {
        let fitted = self.fitted()?;
        if top_k == 0 {
            return Err(ChatLensError::Config("top_k must be at least 1".to_string()));
        }
        if texts.is_empty() {
            return Ok((Vec::new(), Array2::zeros((0, fitted.bundle.index.dim()))));
        }

        let embeddings = self.embedder.embed(texts).await?;
        let neighbors = fitted.bundle.index.search(&embeddings, top_k)?;

        let labels = neighbors
            .ids
            .rows()
            .into_iter()
            .map(|row| {
                let votes: Vec<ClusterLabel> = row.iter().map(|&doc| fitted.bundle.labels[doc]).collect();
                most_common(&votes).unwrap_or(ClusterLabel::Noise)
            })
            .collect();

        Ok((labels, embeddings))
    }

    pub fn save(&self, folder: impl AsRef<Path>) -> Result<()> {
        self.fitted()?.bundle.save(folder)
    }

    /// Replace any current state with a saved bundle.
    pub fn load(&mut self, folder: impl AsRef<Path>) -> Result<()> {
        let bundle = ArtifactBundle::load(folder)?;
        let fitted = Fitted::new(bundle, None);
        report_cluster_sizes(&fitted.label2docs);
        self.state = State::Fitted(Box::new(fitted));
        Ok(())
    }

    pub fn texts(&self) -> Option<&[String]> {
        self.fitted().ok().map(|f| f.bundle.texts.as_slice())
    }

    pub fn embeddings(&self) -> Option<&Array2<f32>> {
        self.fitted().ok().map(|f| &f.bundle.embeddings)
    }

    pub fn projections(&self) -> Option<&Array2<f32>> {
        self.fitted().ok().map(|f| &f.bundle.projections)
    }

    pub fn labels(&self) -> Option<&[ClusterLabel]> {
        self.fitted().ok().map(|f| f.bundle.labels.as_slice())
    }

    pub fn label2docs(&self) -> Option<&LabelIndex> {
        self.fitted().ok().map(|f| &f.label2docs)
    }

    pub fn cluster_centers(&self) -> Option<&ClusterCenters> {
        self.fitted().ok().map(|f| &f.centers)
    }

    pub fn summaries(&self) -> Option<&ClusterSummaries> {
        self.fitted().ok().and_then(|f| f.bundle.summaries.as_ref())
    }

    pub fn projection_model(&self) -> Option<&ProjectionModel> {
        self.fitted().ok().and_then(|f| f.projection_model.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectionMethod;
    use crate::embeddings::EmbeddingProviderTrait;

    struct AxisProvider;

    #[async_trait::async_trait]
    impl EmbeddingProviderTrait for AxisProvider {
        async fn generate(&self, texts: Vec<String>) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| if t.starts_with('a') { vec![1.0, 0.0, 0.0] } else { vec![0.0, 1.0, 0.0] })
                .collect())
        }

        fn name(&self) -> &str {
            "axis"
        }
    }

    fn clusterer() -> ConversationClusterer {
        let config = ChatLensConfig {
            projection_method: ProjectionMethod::Pca,
            dbscan_eps: 0.5,
            dbscan_min_samples: 2,
            dbscan_workers: 1,
            summary_create: false,
            verbose: false,
            ..Default::default()
        };
        let embedder = EmbeddingGenerator::with_provider(Arc::new(AxisProvider), 8, false);
        ConversationClusterer::with_components(config, embedder, None).unwrap()
    }

    fn texts(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_infer_before_fit() {
        let clusterer = clusterer();
        let err = clusterer.infer(&texts(&["a"]), 1).await.unwrap_err();
        assert!(matches!(err, ChatLensError::NotFitted));
        assert!(clusterer.labels().is_none());
    }

    #[tokio::test]
    async fn test_fit_rejects_empty_corpus() {
        let mut clusterer = clusterer();
        assert!(matches!(clusterer.fit(&[], None).await, Err(ChatLensError::EmptyCorpus)));
    }

    #[tokio::test]
    async fn test_precomputed_row_count_checked() {
        let mut clusterer = clusterer();
        let err = clusterer
            .fit(&texts(&["a", "b"]), Some(Array2::zeros((3, 4))))
            .await
            .unwrap_err();
        assert!(matches!(err, ChatLensError::ShapeMismatch { expected: 2, actual: 3, .. }));
    }

    #[tokio::test]
    async fn test_fit_then_infer() {
        let mut clusterer = clusterer();
        let corpus = texts(&["a1", "a2", "a3", "b1", "b2", "b3"]);
        let (embeddings, labels, summaries) = clusterer.fit(&corpus, None).await.unwrap();
        assert_eq!(embeddings.nrows(), 6);
        assert!(summaries.is_none());
        assert_eq!(labels[0], labels[2]);
        assert_eq!(labels[3], labels[5]);
        assert_ne!(labels[0], labels[3]);
        assert_eq!(clusterer.cluster_centers().unwrap().len(), 2);
        assert!(clusterer.projection_model().is_some());

        let (inferred, query_embeddings) = clusterer.infer(&texts(&["a9", "b9"]), 3).await.unwrap();
        assert_eq!(inferred, vec![labels[0], labels[3]]);
        assert_eq!(query_embeddings.nrows(), 2);

        assert!(matches!(
            clusterer.infer(&corpus, 0).await,
            Err(ChatLensError::Config(_))
        ));
        let (none, _) = clusterer.infer(&[], 1).await.unwrap();
        assert!(none.is_empty());
    }
}
