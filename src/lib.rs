//! # chatlens
//!
//! Topic clustering and usage statistics for exported chat conversations.
//!
//! ## Architecture Overview
//!
//! - **Clustering pipeline**: [`ConversationClusterer`] embeds a corpus,
//!   indexes it for nearest-neighbour lookup, projects it to two dimensions,
//!   clusters the projection with DBSCAN and optionally asks a language
//!   model to describe each cluster
//! - **Statistics**: [`stats::ChatAnalyzer`] computes durations, turn counts,
//!   token usage and time-of-day patterns from a chat export
//! - **Persistence**: fitted artifacts are saved as a directory bundle and
//!   can be loaded back without recomputation
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use chatlens::{ChatLensConfig, ConversationClusterer};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ChatLensConfig { summary_create: false, ..Default::default() };
//!     let mut clusterer = ConversationClusterer::new(config).await?;
//!     let texts = vec!["I love pizza".to_string(), "Pizza is great".to_string()];
//!     let (_embeddings, labels, _summaries) = clusterer.fit(&texts, None).await?;
//!     println!("{:?}", labels);
//!     clusterer.save("clusters")?;
//!     Ok(())
//! }
//! ```

pub mod clustering;
pub mod config;
pub mod embeddings;
pub mod error;
pub mod examples;
pub mod index;
pub mod llm;
pub mod logging;
pub mod persistence;
pub mod pipeline;
pub mod prompts;
pub mod stats;
pub mod summarizer;
pub mod tokenizer;
pub mod types;
pub mod umap;
pub mod utils;

// Re-export main types for convenience
pub use config::ChatLensConfig;
pub use error::{ChatLensError, Result};
pub use pipeline::ConversationClusterer;
pub use summarizer::ClusterDescriber;
pub use types::{ClusterLabel, ClusterSummaries, ClusterSummary, Conversation, TextSource};
