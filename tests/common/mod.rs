//! Common test utilities and fixtures
#![allow(dead_code)]

use anyhow::bail;
use async_trait::async_trait;
use chatlens::config::ProjectionMethod;
use chatlens::embeddings::{EmbeddingGenerator, EmbeddingProviderTrait};
use chatlens::{ChatLensConfig, ClusterDescriber, ConversationClusterer};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

pub const DIM: usize = 8;

/// Topic keyword vectors with a small text-dependent offset, so that texts
/// on one topic are close but not identical.
pub struct KeywordEmbedder;

fn fnv(text: &str) -> u64 {
    text.bytes().fold(0xcbf29ce484222325u64, |h, b| (h ^ b as u64).wrapping_mul(0x100000001b3))
}

pub fn keyword_vector(text: &str) -> Vec<f32> {
    let lower = text.to_lowercase();
    let mut v = vec![0.0f32; DIM];
    let axis = if lower.contains("pizza") {
        0
    } else if lower.contains("hiking") {
        1
    } else if lower.contains("rust") {
        2
    } else {
        3
    };
    v[axis] = 1.0;
    let h = fnv(text);
    for d in 4..DIM {
        v[d] = ((h >> (d * 4)) & 0x7) as f32 * 0.003;
    }
    v
}

#[async_trait]
impl EmbeddingProviderTrait for KeywordEmbedder {
    async fn generate(&self, texts: Vec<String>) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| keyword_vector(t)).collect())
    }

    fn name(&self) -> &str {
        "keyword"
    }
}

/// Describes a cluster by its most frequent keyword; fails whenever the
/// examples contain `fail_on`.
pub struct FakeDescriber {
    pub fail_on: Option<String>,
    pub calls: AtomicUsize,
}

impl FakeDescriber {
    pub fn new() -> Self {
        Self { fail_on: None, calls: AtomicUsize::new(0) }
    }

    pub fn failing_on(marker: &str) -> Self {
        Self { fail_on: Some(marker.to_string()), calls: AtomicUsize::new(0) }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ClusterDescriber for FakeDescriber {
    async fn describe(&self, examples: &str, _instruction: &str) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let lower = examples.to_lowercase();
        if let Some(marker) = &self.fail_on {
            if lower.contains(marker.as_str()) {
                bail!("simulated service outage");
            }
        }
        let topic = ["pizza", "hiking", "rust"]
            .into_iter()
            .find(|k| lower.contains(k))
            .unwrap_or("misc");
        Ok(format!("Topic: Conversations about {}.", topic))
    }
}

/// Small-corpus configuration: PCA projection, no summaries.
pub fn test_config() -> ChatLensConfig {
    ChatLensConfig {
        projection_method: ProjectionMethod::Pca,
        dbscan_eps: 0.3,
        dbscan_min_samples: 2,
        dbscan_workers: 2,
        summary_create: false,
        summary_seed: Some(7),
        verbose: false,
        ..Default::default()
    }
}

pub fn clusterer(config: ChatLensConfig, describer: Option<Arc<FakeDescriber>>) -> ConversationClusterer {
    let embedder = EmbeddingGenerator::with_provider(Arc::new(KeywordEmbedder), 2, false);
    let describer = describer.map(|d| d as Arc<dyn ClusterDescriber>);
    ConversationClusterer::with_components(config, embedder, describer).unwrap()
}

pub fn scenario_corpus() -> Vec<String> {
    ["I love pizza", "Pizza is great", "I enjoy hiking", "Hiking is fun", "Random unrelated text"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// Three topics of `per_topic` texts each.
pub fn topic_corpus(per_topic: usize) -> Vec<String> {
    let mut texts = Vec::new();
    for i in 0..per_topic {
        texts.push(format!("pizza night number {}", i));
        texts.push(format!("hiking trail report {}", i));
        texts.push(format!("rust compiler question {}", i));
    }
    texts
}
