use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::clustering::label_to_docs;
use crate::config::ChatLensConfig;
use crate::llm::LlmClient;
use crate::prompts::{clean_summary_response, format_examples, get_cluster_summary_prompt};
use crate::types::{ClusterLabel, ClusterSummaries, ClusterSummary};
use crate::utils::sample_items;

/// Produces a short topic description from a block of example texts.
#[async_trait]
pub trait ClusterDescriber: Send + Sync {
    async fn describe(&self, examples: &str, instruction: &str) -> Result<String>;
}

/// Describer backed by a chat-completion model.
pub struct LlmDescriber {
    client: LlmClient,
    system_prompt: String,
}

impl LlmDescriber {
    pub fn new(client: LlmClient, system_prompt: impl Into<String>) -> Self {
        Self {
            client,
            system_prompt: system_prompt.into(),
        }
    }

    pub async fn from_config(config: &ChatLensConfig) -> Result<Self> {
        let client = LlmClient::new(config).await?;
        Ok(Self::new(client, config.summary_system_prompt.clone()))
    }
}

#[async_trait]
impl ClusterDescriber for LlmDescriber {
    async fn describe(&self, examples: &str, instruction: &str) -> Result<String> {
        let prompt = get_cluster_summary_prompt(examples, instruction);
        self.client.complete_with_system(&self.system_prompt, &prompt).await
    }
}

#[derive(Debug, Clone)]
pub struct SummaryParams {
    pub n_examples: usize,
    pub chunk_size: usize,
    pub instruction: String,
    pub concurrency: usize,
    pub seed: Option<u64>,
}

impl SummaryParams {
    pub fn from_config(config: &ChatLensConfig) -> Self {
        Self {
            n_examples: config.summary_n_examples,
            chunk_size: config.summary_chunk_size,
            instruction: config.summary_instruction.clone(),
            concurrency: config.summary_concurrency,
            seed: config.summary_seed,
        }
    }
}

impl Default for SummaryParams {
    fn default() -> Self {
        Self::from_config(&ChatLensConfig::default())
    }
}

pub struct Summarizer {
    describer: Arc<dyn ClusterDescriber>,
    params: SummaryParams,
}

impl Summarizer {
    pub fn new(describer: Arc<dyn ClusterDescriber>, params: SummaryParams) -> Self {
        Self { describer, params }
    }

    /// Describe every non-noise cluster. A failed request yields a fallback
    /// entry for that cluster only; noise always maps to the fixed placeholder.
    pub async fn summarize(&self, texts: &[String], labels: &[ClusterLabel]) -> ClusterSummaries {
        let label2docs = label_to_docs(labels);

        let jobs: Vec<(usize, Vec<usize>)> = label2docs
            .into_iter()
            .filter_map(|(label, docs)| label.cluster_id().map(|id| (id, docs)))
            .collect();

        info!("Summarizing {} clusters", jobs.len());

        let results: Vec<(usize, ClusterSummary)> = stream::iter(jobs)
            .map(|(id, docs)| self.summarize_cluster(texts, id, docs))
            .buffer_unordered(self.params.concurrency.max(1))
            .collect()
            .await;

        let mut summaries = ClusterSummaries::new();
        summaries.insert(ClusterLabel::Noise, ClusterSummary::noise());
        for (id, summary) in results {
            summaries.insert(ClusterLabel::Cluster(id), summary);
        }

        let failed = summaries.values().filter(|s| s.is_fallback()).count();
        info!("Number of clusters is {} ({} fallbacks)", summaries.len(), failed);
        summaries
    }

    async fn summarize_cluster(&self, texts: &[String], id: usize, docs: Vec<usize>) -> (usize, ClusterSummary) {
        let count = docs.len();
        let seed = self.params.seed.map(|s| s.wrapping_add(id as u64));
        let sampled: Vec<&str> = sample_items(&docs, self.params.n_examples, seed)
            .into_iter()
            .map(|doc| texts[doc].as_str())
            .collect();
        let examples = format_examples(&sampled, self.params.chunk_size);

        let outcome = self
            .describer
            .describe(&examples, &self.params.instruction)
            .await
            .and_then(|raw| {
                let cleaned = clean_summary_response(&raw);
                if cleaned.is_empty() {
                    bail!("empty description");
                }
                Ok(cleaned)
            });

        match outcome {
            Ok(description) => {
                debug!("Cluster {} ({} docs): {}", id, count, description);
                (id, ClusterSummary::described(description, count))
            }
            Err(e) => {
                error!("Error summarizing cluster {}: {:#}", id, e);
                (id, ClusterSummary::fallback(id, count))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{LlmParams, LlmProviderTrait};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Answers with the first example line; fails when a marker is present.
    struct ScriptedDescriber {
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ClusterDescriber for ScriptedDescriber {
        async fn describe(&self, examples: &str, instruction: &str) -> Result<String> {
            self.prompts.lock().unwrap().push(format!("{}\n\n{}", examples, instruction));
            if examples.contains("FAIL") {
                bail!("simulated outage");
            }
            let first = examples.lines().nth(1).unwrap_or_default();
            Ok(format!("\"{} topic.\"", first))
        }
    }

    fn labels(raw: &[i64]) -> Vec<ClusterLabel> {
        raw.iter().map(|&l| ClusterLabel::try_from(l).unwrap()).collect()
    }

    fn texts(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let describer = Arc::new(ScriptedDescriber { prompts: Mutex::new(Vec::new()) });
        let summarizer = Summarizer::new(describer.clone(), SummaryParams { concurrency: 3, ..Default::default() });

        let corpus = texts(&["pizza", "pizza again", "FAIL here", "FAIL there", "hiking", "stray"]);
        let result = summarizer.summarize(&corpus, &labels(&[0, 0, 1, 1, 2, -1])).await;

        assert_eq!(result.len(), 4);
        assert_eq!(result[&ClusterLabel::Noise], ClusterSummary::noise());
        assert_eq!(result[&ClusterLabel::Cluster(0)].count(), Some(2));
        assert!(!result[&ClusterLabel::Cluster(0)].is_fallback());
        assert!(result[&ClusterLabel::Cluster(0)].description().ends_with("topic"));
        assert_eq!(result[&ClusterLabel::Cluster(1)], ClusterSummary::fallback(1, 2));
        assert_eq!(result[&ClusterLabel::Cluster(2)].description(), "hiking topic");
        assert_eq!(describer.prompts.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_non_contiguous_labels_are_all_summarized() {
        let describer = Arc::new(ScriptedDescriber { prompts: Mutex::new(Vec::new()) });
        let summarizer = Summarizer::new(describer, SummaryParams::default());
        let corpus = texts(&["a", "b", "c"]);
        let result = summarizer.summarize(&corpus, &labels(&[0, 5, 5])).await;
        assert!(result.contains_key(&ClusterLabel::Cluster(0)));
        assert!(result.contains_key(&ClusterLabel::Cluster(5)));
        assert!(!result.contains_key(&ClusterLabel::Cluster(1)));
    }

    #[tokio::test]
    async fn test_examples_are_sampled_and_truncated() {
        let describer = Arc::new(ScriptedDescriber { prompts: Mutex::new(Vec::new()) });
        let params = SummaryParams {
            n_examples: 3,
            chunk_size: 4,
            seed: Some(1),
            ..Default::default()
        };
        let summarizer = Summarizer::new(describer.clone(), params);
        let corpus: Vec<String> = (0..10).map(|i| format!("text number {}", i)).collect();
        summarizer.summarize(&corpus, &vec![ClusterLabel::Cluster(0); 10]).await;

        let prompts = describer.prompts.lock().unwrap();
        let prompt = &prompts[0];
        assert!(prompt.contains("Example 3:\ntext"));
        assert!(!prompt.contains("Example 4:"));
        assert!(!prompt.contains("number"));
        assert!(prompt.ends_with("No more than 10 words."));
    }

    /// Stalls on prompts that mention "SLOW", answers the rest immediately.
    struct StallingProvider;

    #[async_trait]
    impl LlmProviderTrait for StallingProvider {
        async fn complete_with_system(&self, _system: &str, prompt: &str, _params: &LlmParams) -> Result<String> {
            if prompt.contains("SLOW") {
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
            Ok("Quick topic".to_string())
        }

        fn name(&self) -> &str {
            "stalling"
        }
    }

    #[tokio::test]
    async fn test_stalled_cluster_falls_back_and_others_finish() {
        let client = LlmClient::with_provider(
            Arc::new(StallingProvider),
            LlmParams::default(),
            1,
            Duration::from_secs(1),
        );
        let describer = Arc::new(LlmDescriber::new(client, "system"));
        let summarizer = Summarizer::new(describer, SummaryParams { concurrency: 1, ..Default::default() });

        let corpus = texts(&["SLOW one", "SLOW two", "pasta", "pasta sauce", "trail", "trail map"]);
        let started = std::time::Instant::now();
        let result = summarizer.summarize(&corpus, &labels(&[0, 0, 1, 1, 2, 2])).await;

        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(result[&ClusterLabel::Cluster(0)], ClusterSummary::fallback(0, 2));
        for id in [1, 2] {
            let summary = &result[&ClusterLabel::Cluster(id)];
            assert!(!summary.is_fallback());
            assert_eq!(summary.description(), "Quick topic");
        }
    }

    #[derive(Default)]
    struct CountingDescriber {
        in_flight: std::sync::atomic::AtomicUsize,
        peak: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl ClusterDescriber for CountingDescriber {
        async fn describe(&self, _examples: &str, _instruction: &str) -> Result<String> {
            use std::sync::atomic::Ordering;
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok("Busy topic".to_string())
        }
    }

    #[tokio::test]
    async fn test_concurrency_limits_requests_in_flight() {
        let describer = Arc::new(CountingDescriber::default());
        let summarizer = Summarizer::new(describer.clone(), SummaryParams { concurrency: 2, ..Default::default() });

        let corpus: Vec<String> = (0..12).map(|i| format!("doc {}", i)).collect();
        let raw: Vec<i64> = (0..12).map(|i| i / 2).collect();
        let result = summarizer.summarize(&corpus, &labels(&raw)).await;

        assert_eq!(result.len(), 7);
        assert_eq!(describer.peak.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_only_noise() {
        let describer = Arc::new(ScriptedDescriber { prompts: Mutex::new(Vec::new()) });
        let summarizer = Summarizer::new(describer.clone(), SummaryParams::default());
        let result = summarizer.summarize(&texts(&["x"]), &labels(&[-1])).await;
        assert_eq!(result.len(), 1);
        assert!(describer.prompts.lock().unwrap().is_empty());
    }
}
