use anyhow::{anyhow, Context, Result};
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use ndarray::Array2;
use ollama_rs::{
    generation::embeddings::request::{EmbeddingsInput, GenerateEmbeddingsRequest},
    Ollama,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::config::{ChatLensConfig, EmbeddingProvider};
use crate::error::ChatLensError;

/// Backend that turns a batch of texts into raw (unnormalized) vectors,
/// one per input, in input order.
#[async_trait::async_trait]
pub trait EmbeddingProviderTrait: Send + Sync {
    async fn generate(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>>;
    fn name(&self) -> &str;
}

/// Batches texts through a provider and returns the L2-normalized
/// embedding matrix, row `i` belonging to text `i`.
#[derive(Clone)]
pub struct EmbeddingGenerator {
    provider: Arc<dyn EmbeddingProviderTrait>,
    batch_size: usize,
    verbose: bool,
}

impl EmbeddingGenerator {
    pub async fn new(config: &ChatLensConfig) -> crate::error::Result<Self> {
        let provider: Arc<dyn EmbeddingProviderTrait> = match config.embedding_provider {
            EmbeddingProvider::FastEmbed => Arc::new(
                FastEmbedEmbeddings::new(
                    &config.embedding_model,
                    config.embed_max_seq_length,
                    config.verbose,
                )
                .await
                .map_err(ChatLensError::Embedding)?,
            ),
            EmbeddingProvider::OpenAI => Arc::new(
                OpenAIEmbeddings::new(
                    config.embedding_model.clone(),
                    config.embedding_api_key.clone(),
                    config.embedding_base_url.clone(),
                )
                .map_err(ChatLensError::Embedding)?,
            ),
            EmbeddingProvider::Ollama => Arc::new(
                OllamaEmbeddings::new(config.embedding_model.clone())
                    .await
                    .map_err(ChatLensError::Embedding)?,
            ),
        };

        info!("Initialized {} embedding provider with model {}",
              provider.name(), config.embedding_model);

        Ok(Self::with_provider(provider, config.embed_batch_size, config.verbose))
    }

    pub fn with_provider(
        provider: Arc<dyn EmbeddingProviderTrait>,
        batch_size: usize,
        verbose: bool,
    ) -> Self {
        Self {
            provider,
            batch_size: batch_size.max(1),
            verbose,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    pub async fn embed(&self, texts: &[String]) -> crate::error::Result<Array2<f32>> {
        if texts.is_empty() {
            return Ok(Array2::zeros((0, 0)));
        }

        info!("Embedding {} texts in batches of {}", texts.len(), self.batch_size);

        let pb = if self.verbose {
            Some(indicatif::ProgressBar::new(texts.len() as u64))
        } else {
            None
        };

        let mut rows: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(self.batch_size) {
            let vectors = self
                .provider
                .generate(chunk.to_vec())
                .await
                .with_context(|| format!("{} failed on a batch of {}", self.provider.name(), chunk.len()))
                .map_err(ChatLensError::Embedding)?;

            if vectors.len() != chunk.len() {
                return Err(ChatLensError::Embedding(anyhow!(
                    "{} returned {} vectors for {} texts",
                    self.provider.name(),
                    vectors.len(),
                    chunk.len()
                )));
            }
            rows.extend(vectors);

            if let Some(ref pb) = pb {
                pb.inc(chunk.len() as u64);
            }
        }

        if let Some(pb) = pb {
            pb.finish_with_message("Embeddings generated");
        }

        let mut matrix = rows_to_matrix(rows).map_err(ChatLensError::Embedding)?;
        normalize_embeddings(&mut matrix);
        debug!("Embedding matrix shape {:?}", matrix.dim());
        Ok(matrix)
    }
}

fn rows_to_matrix(rows: Vec<Vec<f32>>) -> Result<Array2<f32>> {
    let n = rows.len();
    let dim = rows.first().map(Vec::len).unwrap_or(0);
    if dim == 0 {
        return Err(anyhow!("embedding backend returned zero-length vectors"));
    }
    let mut flat = Vec::with_capacity(n * dim);
    for (i, row) in rows.into_iter().enumerate() {
        if row.len() != dim {
            return Err(anyhow!("inconsistent embedding dimension at row {}: {} vs {}", i, row.len(), dim));
        }
        flat.extend(row);
    }
    Ok(Array2::from_shape_vec((n, dim), flat)?)
}

/// Scale each row to unit L2 norm; all-zero rows are left as is.
pub fn normalize_embeddings(embeddings: &mut Array2<f32>) {
    for mut row in embeddings.rows_mut() {
        let norm = row.dot(&row).sqrt();
        if norm > 0.0 {
            row.mapv_inplace(|v| v / norm);
        }
    }
}

// Local sentence-transformer provider
pub struct FastEmbedEmbeddings {
    model_name: String,
    model: Arc<Mutex<TextEmbedding>>,
}

impl FastEmbedEmbeddings {
    pub async fn new(model_name: &str, max_length: usize, show_progress: bool) -> Result<Self> {
        let model_kind = fastembed_model(model_name)?;
        let model = tokio::task::spawn_blocking(move || {
            TextEmbedding::try_new(
                InitOptions::new(model_kind)
                    .with_max_length(max_length)
                    .with_show_download_progress(show_progress),
            )
        })
        .await
        .context("embedding model loader panicked")?
        .with_context(|| format!("Failed to load embedding model {}", model_name))?;

        Ok(Self {
            model_name: model_name.to_string(),
            model: Arc::new(Mutex::new(model)),
        })
    }
}

fn fastembed_model(name: &str) -> Result<EmbeddingModel> {
    let short = name.rsplit('/').next().unwrap_or(name);
    match short.to_ascii_lowercase().as_str() {
        "all-minilm-l6-v2" => Ok(EmbeddingModel::AllMiniLML6V2),
        "all-minilm-l12-v2" => Ok(EmbeddingModel::AllMiniLML12V2),
        "bge-small-en-v1.5" => Ok(EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(EmbeddingModel::BGEBaseENV15),
        "nomic-embed-text-v1.5" => Ok(EmbeddingModel::NomicEmbedTextV15),
        other => Err(anyhow!("unsupported local embedding model: {}", other)),
    }
}

#[async_trait::async_trait]
impl EmbeddingProviderTrait for FastEmbedEmbeddings {
    async fn generate(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let model = Arc::clone(&self.model);
        tokio::task::spawn_blocking(move || {
            let model = model
                .lock()
                .map_err(|_| anyhow!("embedding model lock poisoned"))?;
            model.embed(texts, None)
        })
        .await
        .context("embedding worker panicked")?
    }

    fn name(&self) -> &str {
        &self.model_name
    }
}

// OpenAI-compatible provider
#[derive(Clone, Debug)]
pub struct OpenAIEmbeddings {
    model: String,
    api_key: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIEmbeddings {
    pub fn new(model: String, api_key: Option<String>, base_url: Option<String>) -> Result<Self> {
        let api_key = api_key.context("OpenAI embedding API key not provided")?;
        let base_url = base_url
            .unwrap_or_else(|| "https://api.openai.com/v1".to_string())
            .trim_end_matches('/')
            .to_string();

        Ok(Self {
            model,
            api_key,
            base_url,
            client: reqwest::Client::new(),
        })
    }
}

#[derive(Serialize)]
struct OpenAIEmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Deserialize)]
struct OpenAIEmbeddingResponse {
    data: Vec<OpenAIEmbedding>,
}

#[derive(Deserialize)]
struct OpenAIEmbedding {
    #[serde(default)]
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait::async_trait]
impl EmbeddingProviderTrait for OpenAIEmbeddings {
    async fn generate(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let request = OpenAIEmbeddingRequest {
            model: self.model.clone(),
            input: texts,
        };

        let mut response = self.client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json::<OpenAIEmbeddingResponse>()
            .await?;

        response.data.sort_by_key(|e| e.index);
        Ok(response.data.into_iter().map(|e| e.embedding).collect())
    }

    fn name(&self) -> &str {
        "OpenAI"
    }
}

// Ollama provider
#[derive(Clone)]
pub struct OllamaEmbeddings {
    model: String,
    ollama: Arc<Ollama>,
}

impl OllamaEmbeddings {
    pub async fn new(model: String) -> Result<Self> {
        let ollama = Ollama::default();

        let models = ollama.list_local_models().await
            .context("Failed to connect to Ollama. Is it running?")?;

        if !models.iter().any(|m| m.name == model) {
            warn!("Model {} not found locally; requests will fail until it is pulled", model);
        }

        Ok(Self {
            model,
            ollama: Arc::new(ollama),
        })
    }
}

#[async_trait::async_trait]
impl EmbeddingProviderTrait for OllamaEmbeddings {
    async fn generate(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        let request = GenerateEmbeddingsRequest::new(self.model.clone(), EmbeddingsInput::Multiple(texts));
        let response = self.ollama.generate_embeddings(request).await?;
        Ok(response.embeddings)
    }

    fn name(&self) -> &str {
        "Ollama"
    }
}
