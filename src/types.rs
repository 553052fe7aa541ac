use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Author of a message in a chat export
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    Human,
    Assistant,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub sender: Sender,
    #[serde(default)]
    pub text: String,
    /// ISO-8601, optionally `Z` suffixed
    pub created_at: String,
}

/// One conversation as it appears in a `conversations.json` export
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub uuid: String,
    #[serde(default)]
    pub name: String,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub chat_messages: Vec<ChatMessage>,
}

impl Conversation {
    pub fn len(&self) -> usize {
        self.chat_messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chat_messages.is_empty()
    }

    /// All message bodies of one role joined by a single space
    pub fn joined_text(&self, sender: Sender) -> String {
        self.chat_messages
            .iter()
            .filter(|m| m.sender == sender)
            .map(|m| m.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Human-readable transcript used as clustering input
    pub fn transcript(&self) -> String {
        let mut out = String::new();
        if !self.name.is_empty() {
            out.push_str(&self.name);
            out.push('\n');
        }
        for msg in &self.chat_messages {
            let role = match msg.sender {
                Sender::Human => "User",
                Sender::Assistant => "Assistant",
                Sender::Other => "Other",
            };
            out.push_str(role);
            out.push_str(": ");
            out.push_str(&msg.text);
            out.push('\n');
        }
        out
    }
}

/// Which field of a conversation is fed to the clustering pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TextSource {
    #[default]
    Name,
    Transcript,
}

impl TextSource {
    pub fn extract(&self, conversation: &Conversation) -> String {
        match self {
            TextSource::Name => conversation.name.clone(),
            TextSource::Transcript => conversation.transcript(),
        }
    }
}

/// Cluster identity of one document.
///
/// On disk and on the wire this is the integer label, with `-1` for noise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "i64", try_from = "i64")]
pub enum ClusterLabel {
    Noise,
    Cluster(usize),
}

impl ClusterLabel {
    pub const NOISE_ID: i64 = -1;

    pub fn is_noise(&self) -> bool {
        matches!(self, ClusterLabel::Noise)
    }

    pub fn cluster_id(&self) -> Option<usize> {
        match self {
            ClusterLabel::Noise => None,
            ClusterLabel::Cluster(id) => Some(*id),
        }
    }

    pub fn as_i64(&self) -> i64 {
        match self {
            ClusterLabel::Noise => Self::NOISE_ID,
            ClusterLabel::Cluster(id) => *id as i64,
        }
    }
}

impl From<ClusterLabel> for i64 {
    fn from(label: ClusterLabel) -> Self {
        label.as_i64()
    }
}

impl TryFrom<i64> for ClusterLabel {
    type Error = String;

    fn try_from(value: i64) -> std::result::Result<Self, Self::Error> {
        match value {
            ClusterLabel::NOISE_ID => Ok(ClusterLabel::Noise),
            v if v >= 0 => usize::try_from(v)
                .map(ClusterLabel::Cluster)
                .map_err(|e| e.to_string()),
            v => Err(format!("invalid cluster label {v}")),
        }
    }
}

impl fmt::Display for ClusterLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_i64())
    }
}

/// One label per document id
pub type ClusterLabels = Vec<ClusterLabel>;

/// Description of one non-noise cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicSummary {
    pub description: String,
    pub count: usize,
    /// Set when the description is the placeholder written after a failed request
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub fallback: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ClusterSummary {
    Topic(TopicSummary),
    Placeholder(String),
}

impl ClusterSummary {
    pub const NOISE_PLACEHOLDER: &'static str = "None";

    pub fn noise() -> Self {
        ClusterSummary::Placeholder(Self::NOISE_PLACEHOLDER.to_string())
    }

    pub fn described(description: impl Into<String>, count: usize) -> Self {
        ClusterSummary::Topic(TopicSummary {
            description: description.into(),
            count,
            fallback: false,
        })
    }

    pub fn fallback(cluster_id: usize, count: usize) -> Self {
        ClusterSummary::Topic(TopicSummary {
            description: format!("Cluster {cluster_id}"),
            count,
            fallback: true,
        })
    }

    pub fn description(&self) -> &str {
        match self {
            ClusterSummary::Topic(t) => &t.description,
            ClusterSummary::Placeholder(p) => p,
        }
    }

    pub fn count(&self) -> Option<usize> {
        match self {
            ClusterSummary::Topic(t) => Some(t.count),
            ClusterSummary::Placeholder(_) => None,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, ClusterSummary::Topic(t) if t.fallback)
    }
}

/// Summaries keyed by label; serializes with stringified integer keys
pub type ClusterSummaries = BTreeMap<ClusterLabel, ClusterSummary>;
