use anyhow::{Context, Result};
use chatlens::{
    examples::{generate_export, save_export},
    logging::{init_tracing, LogFormat, LoggingConfig},
    pipeline::LabelIndex,
    stats::{load_conversations, save_result, ChatAnalyzer},
    tokenizer::TokenCounter,
    ChatLensConfig, ClusterLabel, ClusterSummaries, Conversation, ConversationClusterer, TextSource,
};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Parser)]
#[clap(name = "chatlens")]
#[clap(about = "Topic clusters and usage statistics for exported chat conversations")]
#[clap(version)]
struct Cli {
    #[clap(subcommand)]
    command: Commands,

    /// Enable verbose output
    #[clap(short, long, global = true)]
    verbose: bool,

    /// Configuration file path (JSON)
    #[clap(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log output format
    #[clap(long, global = true, value_enum, default_value = "compact")]
    log_format: LogFormat,
}

#[derive(Subcommand)]
enum Commands {
    /// Statistics plus topic clusters for a chat export
    Analyze {
        /// conversations.json from the chat export
        #[clap(short, long)]
        input: PathBuf,

        /// Output directory
        #[clap(short, long, default_value = "output")]
        output: PathBuf,

        /// Which part of each conversation is clustered
        #[clap(long, value_enum, default_value = "name")]
        text_source: TextSource,

        /// Skip cluster descriptions
        #[clap(long)]
        no_summary: bool,
    },

    /// Statistics only
    Stats {
        #[clap(short, long)]
        input: PathBuf,

        #[clap(short, long, default_value = "output")]
        output: PathBuf,
    },

    /// Cluster a JSON array of strings and save the bundle
    Cluster {
        #[clap(short, long)]
        input: PathBuf,

        /// Bundle directory
        #[clap(short, long, default_value = "clusters")]
        output: PathBuf,

        #[clap(long)]
        no_summary: bool,
    },

    /// Assign new texts to the clusters of a saved bundle
    Infer {
        /// Bundle directory
        #[clap(short, long)]
        bundle: PathBuf,

        /// Neighbours consulted per text
        #[clap(short = 'k', long, default_value = "1")]
        top_k: usize,

        #[clap(required = true)]
        texts: Vec<String>,
    },

    /// Generate a synthetic chat export
    Example {
        #[clap(short, long, default_value = "conversations.json")]
        output: PathBuf,

        /// Number of conversations to generate
        #[clap(short = 'n', long, default_value = "50")]
        count: usize,

        #[clap(long, default_value = "42")]
        seed: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if it exists
    dotenv::dotenv().ok();

    let cli = Cli::parse();

    let logging = LoggingConfig {
        format: cli.log_format,
        ..Default::default()
    }
    .verbose(cli.verbose);
    init_tracing(&logging)?;

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Analyze { input, output, text_source, no_summary } => {
            let conversations = load_conversations(&input)
                .with_context(|| format!("Failed to read chat export {}", input.display()))?;
            info!("Loaded {} conversations", conversations.len());
            write_stats(&config, &conversations, &output)?;

            let texts: Vec<String> = conversations.iter().map(|c| text_source.extract(c)).collect();
            let config = ChatLensConfig { summary_create: config.summary_create && !no_summary, ..config };
            let clusterer = fit_and_save(config, &texts, &output.join("clusters")).await?;

            if let Some(summaries) = clusterer.summaries() {
                save_result(output.join("cluster_summaries.json"), summaries)?;
            }
            if let Some(label2docs) = clusterer.label2docs() {
                print_clusters(label2docs, clusterer.summaries());
            }
            info!("Analysis complete! Results saved to {}", output.display());
        }

        Commands::Stats { input, output } => {
            let conversations = load_conversations(&input)
                .with_context(|| format!("Failed to read chat export {}", input.display()))?;
            write_stats(&config, &conversations, &output)?;
        }

        Commands::Cluster { input, output, no_summary } => {
            let content = tokio::fs::read_to_string(&input)
                .await
                .with_context(|| format!("Failed to read {}", input.display()))?;
            let texts: Vec<String> = serde_json::from_str(&content)
                .context("Input must be a JSON array of strings")?;
            let config = ChatLensConfig { summary_create: config.summary_create && !no_summary, ..config };
            let clusterer = fit_and_save(config, &texts, &output).await?;
            if let Some(label2docs) = clusterer.label2docs() {
                print_clusters(label2docs, clusterer.summaries());
            }
        }

        Commands::Infer { bundle, top_k, texts } => {
            let config = ChatLensConfig { summary_create: false, ..config };
            let mut clusterer = ConversationClusterer::new(config).await?;
            clusterer.load(&bundle)?;
            let (labels, _) = clusterer.infer(&texts, top_k).await?;
            for (text, label) in texts.iter().zip(labels) {
                let description = clusterer
                    .summaries()
                    .and_then(|s| s.get(&label))
                    .map(|s| s.description().to_string())
                    .unwrap_or_else(|| label.to_string());
                println!("{}\t{}\t{}", label, description, text);
            }
        }

        Commands::Example { output, count, seed } => {
            info!("Generating {} example conversations", count);
            let export = generate_export(count, Some(seed));
            save_export(&export, &output)?;
            info!("Example data written to {}", output.display());
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<ChatLensConfig> {
    let config = match path {
        Some(path) => ChatLensConfig::from_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => ChatLensConfig::default(),
    };
    let config = config.with_env_overrides();
    config.validate()?;
    Ok(config)
}

fn write_stats(config: &ChatLensConfig, conversations: &[Conversation], output: &Path) -> Result<()> {
    std::fs::create_dir_all(output)?;
    let counter = TokenCounter::new(&config.tokenizer_encoding)?;
    let analyzer = ChatAnalyzer::new(conversations, &counter);

    let duration = analyzer.duration_stats();
    let tokens = analyzer.token_stats();
    save_result(output.join("conversation.json"), analyzer.records())?;
    save_result(output.join("duration_stats.json"), &duration)?;
    save_result(output.join("time_patterns.json"), &analyzer.time_patterns())?;
    save_result(output.join("token_stats.json"), &tokens)?;

    info!("Average duration {} over {} conversations, {} tokens in total",
          duration.average_duration, analyzer.records().len(), tokens.total_tokens);
    Ok(())
}

async fn fit_and_save(config: ChatLensConfig, texts: &[String], bundle: &Path) -> Result<ConversationClusterer> {
    let mut clusterer = ConversationClusterer::new(config).await?;
    clusterer.fit(texts, None).await?;
    clusterer.save(bundle)?;
    info!("Cluster bundle written to {}", bundle.display());
    Ok(clusterer)
}

fn print_clusters(label2docs: &LabelIndex, summaries: Option<&ClusterSummaries>) {
    let mut rows: Vec<(usize, String)> = label2docs
        .iter()
        .filter(|(label, _)| !label.is_noise())
        .map(|(label, docs)| {
            let description = summaries
                .and_then(|s| s.get(label))
                .map(|s| s.description().to_string())
                .unwrap_or_else(|| format!("Cluster {}", label));
            (docs.len(), description)
        })
        .collect();
    rows.sort_by(|a, b| b.0.cmp(&a.0));

    for (count, description) in rows {
        println!("{:>6}  {}", count, description);
    }
    let noise = label2docs.get(&ClusterLabel::Noise).map(Vec::len).unwrap_or(0);
    println!("{:>6}  (noise)", noise);
}
