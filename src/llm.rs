use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use ollama_rs::{
    generation::chat::{request::ChatMessageRequest, ChatMessage},
    generation::options::GenerationOptions,
    Ollama,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::{ChatLensConfig, LlmProvider};

#[async_trait]
pub trait LlmProviderTrait: Send + Sync {
    async fn complete_with_system(&self, system: &str, prompt: &str, params: &LlmParams) -> Result<String>;
    fn name(&self) -> &str;
}

#[derive(Debug, Clone, Default)]
pub struct LlmParams {
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
}

#[derive(Clone)]
pub struct LlmClient {
    provider: Arc<dyn LlmProviderTrait>,
    params: LlmParams,
    max_attempts: u32,
    timeout: Duration,
}

impl LlmClient {
    pub async fn new(config: &ChatLensConfig) -> Result<Self> {
        let timeout = Duration::from_secs(config.summary_timeout_secs);
        let provider: Arc<dyn LlmProviderTrait> = match config.llm_provider {
            LlmProvider::OpenAI => Arc::new(OpenAIProvider::new(
                config.summary_model.clone(),
                config.summary_model_token.clone(),
                config.summary_model_base.clone(),
                timeout,
            )?),
            LlmProvider::Ollama => Arc::new(OllamaProvider::new(config.summary_model.clone()).await),
        };

        info!("Initialized {} LLM provider with model {}",
              provider.name(), config.summary_model);

        Ok(Self::with_provider(
            provider,
            LlmParams {
                temperature: Some(config.summary_temperature),
                max_tokens: Some(config.summary_max_tokens),
            },
            config.summary_max_attempts,
            timeout,
        ))
    }

    pub fn with_provider(
        provider: Arc<dyn LlmProviderTrait>,
        params: LlmParams,
        max_attempts: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            params,
            max_attempts: max_attempts.max(1),
            timeout,
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Each attempt is bounded by the client timeout; an elapsed attempt counts as a failure.
    pub async fn complete_with_system(&self, system: &str, prompt: &str) -> Result<String> {
        debug!("LLM completion requested: {} chars", prompt.len());

        let retry_config = crate::utils::RetryConfig {
            initial_delay: Duration::from_secs(2),
            ..crate::utils::RetryConfig::with_attempts(self.max_attempts)
        };

        crate::utils::retry_with_backoff(
            || async {
                let attempt = self.provider.complete_with_system(system, prompt, &self.params);
                match tokio::time::timeout(self.timeout, attempt).await {
                    Ok(result) => result,
                    Err(_) => Err(anyhow!("{} request timed out after {:?}", self.provider.name(), self.timeout)),
                }
            },
            retry_config,
            "LLM completion",
        )
        .await
    }
}

// OpenAI-compatible chat completions
#[derive(Clone)]
struct OpenAIProvider {
    model: String,
    api_key: Option<String>,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIProvider {
    fn new(model: String, api_key: Option<String>, base_url: String, timeout: Duration) -> Result<Self> {
        if api_key.is_none() {
            warn!("No API key configured for {}; sending unauthenticated requests", base_url);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            model,
            api_key,
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }
}

#[derive(Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    temperature: f32,
}

#[derive(Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Deserialize)]
struct OpenAIResponseMessage {
    content: Option<String>,
}

#[async_trait]
impl LlmProviderTrait for OpenAIProvider {
    async fn complete_with_system(&self, system: &str, prompt: &str, params: &LlmParams) -> Result<String> {
        let request = OpenAIRequest {
            model: self.model.clone(),
            messages: vec![
                OpenAIMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                OpenAIMessage {
                    role: "user".to_string(),
                    content: prompt.to_string(),
                },
            ],
            max_tokens: params.max_tokens,
            temperature: params.temperature.unwrap_or(0.7),
        };

        let mut builder = self.client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await?
            .error_for_status()?
            .json::<OpenAIResponse>()
            .await?;

        response.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .context("No response content from chat completion")
    }

    fn name(&self) -> &str {
        "OpenAI"
    }
}

// Ollama Provider
#[derive(Clone)]
struct OllamaProvider {
    model: String,
    ollama: Arc<Ollama>,
}

impl OllamaProvider {
    async fn new(model: String) -> Self {
        let ollama = Ollama::default();

        match ollama.list_local_models().await {
            Ok(models) if !models.iter().any(|m| m.name == model) => {
                warn!("Model {} not found locally. You may need to pull it first", model);
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Failed to connect to Ollama ({}); cluster descriptions will fall back until it is reachable", e);
            }
        }

        Self {
            model,
            ollama: Arc::new(ollama),
        }
    }
}

#[async_trait]
impl LlmProviderTrait for OllamaProvider {
    async fn complete_with_system(&self, system: &str, prompt: &str, params: &LlmParams) -> Result<String> {
        let messages = vec![
            ChatMessage::system(system.to_string()),
            ChatMessage::user(prompt.to_string()),
        ];

        let mut options = GenerationOptions::default();
        if let Some(temperature) = params.temperature {
            options = options.temperature(temperature);
        }
        if let Some(max_tokens) = params.max_tokens {
            options = options.num_predict(max_tokens as i32);
        }

        let request = ChatMessageRequest::new(self.model.clone(), messages).options(options);
        let response = self.ollama.send_chat_messages(request).await?;

        Ok(response.message.content)
    }

    fn name(&self) -> &str {
        "Ollama"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct EchoProvider {
        calls: AtomicUsize,
        fail_first: usize,
    }

    #[async_trait]
    impl LlmProviderTrait for EchoProvider {
        async fn complete_with_system(&self, system: &str, prompt: &str, params: &LlmParams) -> Result<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                anyhow::bail!("transient failure");
            }
            Ok(format!("{}|{}|{:?}", system, prompt, params.temperature))
        }

        fn name(&self) -> &str {
            "echo"
        }
    }

    #[tokio::test]
    async fn test_client_passes_params() {
        let provider = Arc::new(EchoProvider { calls: AtomicUsize::new(0), fail_first: 0 });
        let client = LlmClient::with_provider(
            provider,
            LlmParams { temperature: Some(0.7), max_tokens: Some(128) },
            1,
            Duration::from_secs(5),
        );
        let out = client.complete_with_system("sys", "hello").await.unwrap();
        assert_eq!(out, "sys|hello|Some(0.7)");
        assert_eq!(client.provider_name(), "echo");
    }

    #[tokio::test]
    async fn test_single_attempt_surfaces_failure() {
        let provider = Arc::new(EchoProvider { calls: AtomicUsize::new(0), fail_first: 1 });
        let client = LlmClient::with_provider(provider.clone(), LlmParams::default(), 1, Duration::from_secs(5));
        assert!(client.complete_with_system("s", "p").await.is_err());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 1);
    }

    struct StalledProvider;

    #[async_trait]
    impl LlmProviderTrait for StalledProvider {
        async fn complete_with_system(&self, _system: &str, _prompt: &str, _params: &LlmParams) -> Result<String> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok("too late".to_string())
        }

        fn name(&self) -> &str {
            "stalled"
        }
    }

    #[tokio::test]
    async fn test_stalled_request_times_out() {
        let client = LlmClient::with_provider(
            Arc::new(StalledProvider),
            LlmParams::default(),
            1,
            Duration::from_millis(200),
        );
        let started = std::time::Instant::now();
        let err = client.complete_with_system("s", "p").await.unwrap_err();
        assert!(err.to_string().contains("timed out"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_unreachable_ollama_does_not_fail_construction() {
        let mut config = ChatLensConfig::default();
        config.llm_provider = LlmProvider::Ollama;
        config.summary_timeout_secs = 1;
        let client = LlmClient::new(&config).await.unwrap();
        assert_eq!(client.provider_name(), "Ollama");
    }

    #[test]
    fn test_request_serialization() {
        let request = OpenAIRequest {
            model: "gpt-3.5-turbo".to_string(),
            messages: vec![OpenAIMessage { role: "user".to_string(), content: "hi".to_string() }],
            max_tokens: None,
            temperature: 0.7,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("max_tokens").is_none());
        assert_eq!(json["messages"][0]["role"], "user");
    }

    #[test]
    fn test_response_with_null_content() {
        let raw = r#"{"choices":[{"message":{"content":null}}]}"#;
        let parsed: OpenAIResponse = serde_json::from_str(raw).unwrap();
        assert!(parsed.choices[0].message.content.is_none());
    }
}
