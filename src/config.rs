use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{ChatLensError, Result};
use crate::prompts::{DEFAULT_INSTRUCTION, DEFAULT_SYSTEM_PROMPT};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatLensConfig {
    // General params
    #[serde(default = "default_seed")]
    pub seed: u64,
    #[serde(default = "default_verbose")]
    pub verbose: bool,

    // Embedding settings
    #[serde(default)]
    pub embedding_provider: EmbeddingProvider,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default)]
    pub embedding_api_key: Option<String>,
    #[serde(default)]
    pub embedding_base_url: Option<String>,
    #[serde(default = "default_embed_batch_size")]
    pub embed_batch_size: usize,
    #[serde(default = "default_embed_max_seq_length")]
    pub embed_max_seq_length: usize,

    // Projection settings
    #[serde(default)]
    pub projection_method: ProjectionMethod,
    #[serde(default = "default_umap_n_neighbors")]
    pub umap_n_neighbors: usize,
    #[serde(default = "default_umap_min_dist")]
    pub umap_min_dist: f32,
    #[serde(default = "default_umap_spread")]
    pub umap_spread: f32,
    #[serde(default = "default_umap_n_components")]
    pub umap_n_components: usize,
    #[serde(default)]
    pub umap_metric: DistanceMetric,
    #[serde(default)]
    pub umap_n_epochs: Option<usize>,
    #[serde(default = "default_umap_negative_sample_rate")]
    pub umap_negative_sample_rate: usize,

    // DBSCAN settings
    #[serde(default = "default_dbscan_eps")]
    pub dbscan_eps: f32,
    #[serde(default = "default_dbscan_min_samples")]
    pub dbscan_min_samples: usize,
    #[serde(default = "default_dbscan_workers")]
    pub dbscan_workers: usize,

    // Summary settings
    #[serde(default = "default_summary_create")]
    pub summary_create: bool,
    #[serde(default)]
    pub llm_provider: LlmProvider,
    #[serde(default = "default_summary_model")]
    pub summary_model: String,
    #[serde(default = "default_summary_model_base")]
    pub summary_model_base: String,
    #[serde(default)]
    pub summary_model_token: Option<String>,
    #[serde(default = "default_summary_n_examples")]
    pub summary_n_examples: usize,
    #[serde(default = "default_summary_chunk_size")]
    pub summary_chunk_size: usize,
    #[serde(default = "default_summary_instruction")]
    pub summary_instruction: String,
    #[serde(default = "default_summary_system_prompt")]
    pub summary_system_prompt: String,
    #[serde(default = "default_summary_temperature")]
    pub summary_temperature: f32,
    #[serde(default = "default_summary_max_tokens")]
    pub summary_max_tokens: u32,
    #[serde(default = "default_summary_concurrency")]
    pub summary_concurrency: usize,
    #[serde(default = "default_summary_timeout_secs")]
    pub summary_timeout_secs: u64,
    #[serde(default = "default_summary_max_attempts")]
    pub summary_max_attempts: u32,
    /// Seed for example sampling; `None` draws from entropy
    #[serde(default)]
    pub summary_seed: Option<u64>,

    // Statistics settings
    #[serde(default = "default_tokenizer_encoding")]
    pub tokenizer_encoding: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LlmProvider {
    #[default]
    OpenAI,
    Ollama,
}

impl LlmProvider {
    pub fn as_str(&self) -> &str {
        match self {
            LlmProvider::OpenAI => "openai",
            LlmProvider::Ollama => "ollama",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EmbeddingProvider {
    /// Local ONNX sentence-transformer model
    #[default]
    FastEmbed,
    /// Any OpenAI-compatible `/embeddings` endpoint
    OpenAI,
    Ollama,
}

impl std::fmt::Display for EmbeddingProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EmbeddingProvider::FastEmbed => write!(f, "FastEmbed"),
            EmbeddingProvider::OpenAI => write!(f, "OpenAI"),
            EmbeddingProvider::Ollama => write!(f, "Ollama"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ProjectionMethod {
    #[default]
    Umap,
    Pca,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum DistanceMetric {
    #[default]
    Cosine,
    Euclidean,
}

impl Default for ChatLensConfig {
    fn default() -> Self {
        Self {
            seed: default_seed(),
            verbose: default_verbose(),
            embedding_provider: EmbeddingProvider::default(),
            embedding_model: default_embedding_model(),
            embedding_api_key: None,
            embedding_base_url: None,
            embed_batch_size: default_embed_batch_size(),
            embed_max_seq_length: default_embed_max_seq_length(),
            projection_method: ProjectionMethod::default(),
            umap_n_neighbors: default_umap_n_neighbors(),
            umap_min_dist: default_umap_min_dist(),
            umap_spread: default_umap_spread(),
            umap_n_components: default_umap_n_components(),
            umap_metric: DistanceMetric::default(),
            umap_n_epochs: None,
            umap_negative_sample_rate: default_umap_negative_sample_rate(),
            dbscan_eps: default_dbscan_eps(),
            dbscan_min_samples: default_dbscan_min_samples(),
            dbscan_workers: default_dbscan_workers(),
            summary_create: default_summary_create(),
            llm_provider: LlmProvider::default(),
            summary_model: default_summary_model(),
            summary_model_base: default_summary_model_base(),
            summary_model_token: None,
            summary_n_examples: default_summary_n_examples(),
            summary_chunk_size: default_summary_chunk_size(),
            summary_instruction: default_summary_instruction(),
            summary_system_prompt: default_summary_system_prompt(),
            summary_temperature: default_summary_temperature(),
            summary_max_tokens: default_summary_max_tokens(),
            summary_concurrency: default_summary_concurrency(),
            summary_timeout_secs: default_summary_timeout_secs(),
            summary_max_attempts: default_summary_max_attempts(),
            summary_seed: None,
            tokenizer_encoding: default_tokenizer_encoding(),
        }
    }
}

impl ChatLensConfig {
    /// Load a JSON config file; absent fields take their defaults.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let config: ChatLensConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `OPENAI_API_KEY`, `OPENAI_API_BASE` and `OPENAI_MODEL_NAME` when set.
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            self.summary_model_token = Some(key);
        }
        if let Ok(base) = std::env::var("OPENAI_API_BASE") {
            self.summary_model_base = base;
        }
        if let Ok(model) = std::env::var("OPENAI_MODEL_NAME") {
            self.summary_model = model;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        fn invalid(msg: impl Into<String>) -> Result<()> {
            Err(ChatLensError::Config(msg.into()))
        }

        if self.embed_batch_size == 0 {
            return invalid("embed_batch_size must be at least 1");
        }
        if self.umap_n_neighbors < 2 {
            return invalid("umap_n_neighbors must be at least 2");
        }
        if !(self.umap_min_dist >= 0.0) {
            return invalid("umap_min_dist must be non-negative");
        }
        if !(self.umap_spread > 0.0) || self.umap_min_dist > self.umap_spread {
            return invalid("umap_min_dist must not exceed umap_spread, which must be positive");
        }
        if self.umap_n_components == 0 {
            return invalid("umap_n_components must be at least 1");
        }
        if self.umap_n_epochs == Some(0) {
            return invalid("umap_n_epochs must be at least 1 when set");
        }
        if !self.dbscan_eps.is_finite() || self.dbscan_eps <= 0.0 {
            return invalid(format!("dbscan_eps must be positive, got {}", self.dbscan_eps));
        }
        if self.dbscan_min_samples == 0 {
            return invalid("dbscan_min_samples must be at least 1");
        }
        if self.dbscan_workers == 0 {
            return invalid("dbscan_workers must be at least 1");
        }
        if self.summary_n_examples == 0 {
            return invalid("summary_n_examples must be at least 1");
        }
        if self.summary_chunk_size == 0 {
            return invalid("summary_chunk_size must be at least 1");
        }
        if self.summary_concurrency == 0 {
            return invalid("summary_concurrency must be at least 1");
        }
        if self.summary_timeout_secs == 0 {
            return invalid("summary_timeout_secs must be at least 1");
        }
        if self.summary_max_attempts == 0 {
            return invalid("summary_max_attempts must be at least 1");
        }
        if !(0.0..=2.0).contains(&self.summary_temperature) {
            return invalid("summary_temperature must be within [0, 2]");
        }
        Ok(())
    }
}

// Default value functions
fn default_seed() -> u64 { 42 }
fn default_verbose() -> bool { true }
fn default_embedding_model() -> String { "all-MiniLM-L6-v2".to_string() }
fn default_embed_batch_size() -> usize { 64 }
fn default_embed_max_seq_length() -> usize { 512 }
fn default_umap_n_neighbors() -> usize { 10 }
fn default_umap_min_dist() -> f32 { 0.1 }
fn default_umap_spread() -> f32 { 1.0 }
fn default_umap_n_components() -> usize { 2 }
fn default_umap_negative_sample_rate() -> usize { 5 }
fn default_dbscan_eps() -> f32 { 0.08 }
fn default_dbscan_min_samples() -> usize { 50 }
fn default_dbscan_workers() -> usize { 16 }
fn default_summary_create() -> bool { true }
fn default_summary_model() -> String { "gpt-3.5-turbo".to_string() }
fn default_summary_model_base() -> String { "https://api.openai.com/v1".to_string() }
fn default_summary_n_examples() -> usize { 10 }
fn default_summary_chunk_size() -> usize { 420 }
fn default_summary_instruction() -> String { DEFAULT_INSTRUCTION.to_string() }
fn default_summary_system_prompt() -> String { DEFAULT_SYSTEM_PROMPT.to_string() }
fn default_summary_temperature() -> f32 { 0.7 }
fn default_summary_max_tokens() -> u32 { 128 }
fn default_summary_concurrency() -> usize { 2 }
fn default_summary_timeout_secs() -> u64 { 30 }
fn default_summary_max_attempts() -> u32 { 1 }
fn default_tokenizer_encoding() -> String { "o200k_base".to_string() }

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = ChatLensConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.umap_n_neighbors, 10);
        assert_eq!(config.dbscan_min_samples, 50);
        assert_eq!(config.projection_method, ProjectionMethod::Umap);
    }

    #[test]
    fn test_rejects_bad_dbscan_params() {
        let config = ChatLensConfig { dbscan_eps: -0.5, ..Default::default() };
        assert!(matches!(config.validate(), Err(ChatLensError::Config(_))));

        let config = ChatLensConfig { dbscan_eps: f32::NAN, ..Default::default() };
        assert!(config.validate().is_err());

        let config = ChatLensConfig { dbscan_min_samples: 0, ..Default::default() };
        assert!(config.validate().is_err());

        let config = ChatLensConfig { dbscan_workers: 0, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_min_dist_above_spread() {
        let config = ChatLensConfig { umap_min_dist: 1.5, ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: ChatLensConfig =
            serde_json::from_str(r#"{"dbscan_eps": 0.3, "dbscan_min_samples": 3}"#).unwrap();
        assert_eq!(config.dbscan_eps, 0.3);
        assert_eq!(config.dbscan_min_samples, 3);
        assert_eq!(config.embed_batch_size, 64);
        assert_eq!(config.summary_chunk_size, 420);
        assert_eq!(config.summary_instruction, DEFAULT_INSTRUCTION);
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"projection_method": "Pca", "seed": 7}"#).unwrap();
        let config = ChatLensConfig::from_file(&path).unwrap();
        assert_eq!(config.projection_method, ProjectionMethod::Pca);
        assert_eq!(config.seed, 7);

        std::fs::write(&path, r#"{"summary_concurrency": 0}"#).unwrap();
        assert!(ChatLensConfig::from_file(&path).is_err());

        std::fs::write(&path, r#"{"summary_timeout_secs": 0}"#).unwrap();
        assert!(ChatLensConfig::from_file(&path).is_err());
    }
}
