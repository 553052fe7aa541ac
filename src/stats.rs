//! Per-conversation statistics over a chat export and their aggregates.

use chrono::{DateTime, Datelike, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{info, warn};

use crate::error::Result;
use crate::persistence::{read_json, write_json};
use crate::tokenizer::TokenCounter;
use crate::types::{Conversation, Sender};

/// Parse an ISO-8601 timestamp; a trailing `Z` or any offset is accepted and
/// timestamps without an offset are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationRecord {
    pub uuid: String,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Seconds from the first human message to the last assistant message
    pub duration_secs: f64,
    pub dialogue_turns: usize,
    pub input_tokens: usize,
    pub output_tokens: usize,
}

impl ConversationRecord {
    pub fn from_conversation(conversation: &Conversation, counter: &TokenCounter) -> Option<Self> {
        let start_time = parse_timestamp(&conversation.created_at)?;
        let end_time = parse_timestamp(&conversation.updated_at)?;

        let mut timed: Vec<(DateTime<Utc>, u8, &crate::types::ChatMessage)> = Vec::new();
        for msg in &conversation.chat_messages {
            match parse_timestamp(&msg.created_at) {
                Some(ts) => {
                    let rank = if msg.sender == Sender::Human { 0 } else { 1 };
                    timed.push((ts, rank, msg));
                }
                None => warn!("Skipping message with bad timestamp {:?} in {}",
                              msg.created_at, conversation.uuid),
            }
        }
        // stable, so equal keys keep export order
        timed.sort_by(|a, b| (a.0, a.1).cmp(&(b.0, b.1)));

        let mut first_human = None;
        let mut last_assistant = None;
        let mut user_text = Vec::new();
        let mut bot_text = Vec::new();
        for (ts, _, msg) in &timed {
            match msg.sender {
                Sender::Human => {
                    first_human.get_or_insert(*ts);
                    user_text.push(msg.text.as_str());
                }
                Sender::Assistant => {
                    last_assistant = Some(*ts);
                    bot_text.push(msg.text.as_str());
                }
                Sender::Other => {}
            }
        }

        let duration_secs = match (first_human, last_assistant) {
            (Some(first), Some(last)) => (last - first).num_milliseconds() as f64 / 1000.0,
            _ => 0.0,
        };

        Some(Self {
            uuid: conversation.uuid.clone(),
            name: conversation.name.clone(),
            start_time,
            end_time,
            duration_secs,
            dialogue_turns: conversation.chat_messages.len() / 2 + 1,
            input_tokens: counter.count(&user_text.join(" ")),
            output_tokens: counter.count(&bot_text.join(" ")),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LongestChat {
    pub name: String,
    pub duration: String,
    pub duration_hours: f64,
    pub dialogue_turns: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationStats {
    pub average_duration: String,
    pub total_duration: String,
    pub average_duration_hours: f64,
    pub total_duration_hours: f64,
    pub average_turns: f64,
    pub longest_chat: Option<LongestChat>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimePatterns {
    /// Conversations started per UTC hour, only hours that occur
    pub hourly_pattern: BTreeMap<u32, usize>,
    /// Conversations per season: 1 winter, 2 spring, 3 summer, 4 autumn
    pub seasonal_pattern: BTreeMap<u32, usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenStats {
    pub input_tokens: usize,
    pub output_tokens: usize,
    pub total_tokens: usize,
    pub average_input_tokens: f64,
    pub average_output_tokens: f64,
    pub max_input_tokens: usize,
    pub max_output_tokens: usize,
}

fn hours(secs: f64) -> f64 {
    secs / 3600.0
}

fn format_hours(secs: f64) -> String {
    format!("{:.2} hrs", hours(secs))
}

pub fn season_of(month: u32) -> u32 {
    month % 12 / 3 + 1
}

pub struct ChatAnalyzer {
    records: Vec<ConversationRecord>,
}

impl ChatAnalyzer {
    pub fn new(conversations: &[Conversation], counter: &TokenCounter) -> Self {
        let records: Vec<ConversationRecord> = conversations
            .iter()
            .filter_map(|c| {
                let record = ConversationRecord::from_conversation(c, counter);
                if record.is_none() {
                    warn!("Skipping conversation {} with unparseable timestamps", c.uuid);
                }
                record
            })
            .collect();
        info!("Prepared {} of {} conversations", records.len(), conversations.len());
        Self { records }
    }

    pub fn from_records(records: Vec<ConversationRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[ConversationRecord] {
        &self.records
    }

    fn mean(&self, f: impl Fn(&ConversationRecord) -> f64) -> f64 {
        if self.records.is_empty() {
            0.0
        } else {
            self.records.iter().map(f).sum::<f64>() / self.records.len() as f64
        }
    }

    pub fn duration_stats(&self) -> DurationStats {
        let total: f64 = self.records.iter().map(|r| r.duration_secs).sum();
        let average = self.mean(|r| r.duration_secs);

        let mut longest: Option<&ConversationRecord> = None;
        for record in &self.records {
            if longest.map_or(true, |l| record.dialogue_turns > l.dialogue_turns) {
                longest = Some(record);
            }
        }

        DurationStats {
            average_duration: format_hours(average),
            total_duration: format_hours(total),
            average_duration_hours: hours(average),
            total_duration_hours: hours(total),
            average_turns: self.mean(|r| r.dialogue_turns as f64),
            longest_chat: longest.map(|r| LongestChat {
                name: r.name.clone(),
                duration: format_hours(r.duration_secs),
                duration_hours: hours(r.duration_secs),
                dialogue_turns: r.dialogue_turns,
            }),
        }
    }

    pub fn time_patterns(&self) -> TimePatterns {
        let mut hourly_pattern = BTreeMap::new();
        let mut seasonal_pattern = BTreeMap::new();
        for record in &self.records {
            *hourly_pattern.entry(record.start_time.hour()).or_insert(0) += 1;
            *seasonal_pattern.entry(season_of(record.start_time.month())).or_insert(0) += 1;
        }
        TimePatterns { hourly_pattern, seasonal_pattern }
    }

    pub fn token_stats(&self) -> TokenStats {
        let input_tokens: usize = self.records.iter().map(|r| r.input_tokens).sum();
        let output_tokens: usize = self.records.iter().map(|r| r.output_tokens).sum();
        TokenStats {
            input_tokens,
            output_tokens,
            total_tokens: input_tokens + output_tokens,
            average_input_tokens: self.mean(|r| r.input_tokens as f64),
            average_output_tokens: self.mean(|r| r.output_tokens as f64),
            max_input_tokens: self.records.iter().map(|r| r.input_tokens).max().unwrap_or(0),
            max_output_tokens: self.records.iter().map(|r| r.output_tokens).max().unwrap_or(0),
        }
    }
}

pub fn load_conversations(path: impl AsRef<Path>) -> Result<Vec<Conversation>> {
    read_json(path.as_ref())
}

/// Pretty JSON, non-ASCII text kept as is.
pub fn save_result<T: Serialize + ?Sized>(path: impl AsRef<Path>, data: &T) -> Result<()> {
    write_json(path.as_ref(), data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatMessage;

    fn msg(sender: Sender, text: &str, at: &str) -> ChatMessage {
        ChatMessage {
            sender,
            text: text.to_string(),
            created_at: at.to_string(),
        }
    }

    fn conversation(uuid: &str, name: &str, created: &str, messages: Vec<ChatMessage>) -> Conversation {
        Conversation {
            uuid: uuid.to_string(),
            name: name.to_string(),
            created_at: created.to_string(),
            updated_at: created.to_string(),
            chat_messages: messages,
        }
    }

    fn counter() -> TokenCounter {
        TokenCounter::new("o200k_base").unwrap()
    }

    #[test]
    fn test_parse_timestamp_variants() {
        assert!(parse_timestamp("2024-05-01T10:00:00Z").is_some());
        assert!(parse_timestamp("2024-05-01T10:00:00.123456+00:00").is_some());
        assert!(parse_timestamp("2024-05-01T10:00:00").is_some());
        assert!(parse_timestamp("yesterday").is_none());
    }

    #[test]
    fn test_duration_from_first_human_to_last_assistant() {
        let conv = conversation("a", "Chat", "2024-05-01T10:00:00Z", vec![
            msg(Sender::Assistant, "late reply", "2024-05-01T11:30:00Z"),
            msg(Sender::Human, "hello world", "2024-05-01T10:00:00Z"),
            msg(Sender::Assistant, "hi", "2024-05-01T10:00:00Z"),
        ]);
        let record = ConversationRecord::from_conversation(&conv, &counter()).unwrap();
        assert_eq!(record.duration_secs, 5400.0);
        assert_eq!(record.dialogue_turns, 2);
        assert_eq!(record.input_tokens, 2);
    }

    #[test]
    fn test_duration_zero_without_both_roles() {
        let conv = conversation("a", "Solo", "2024-05-01T10:00:00Z", vec![
            msg(Sender::Human, "one", "2024-05-01T10:00:00Z"),
            msg(Sender::Human, "two", "2024-05-01T10:05:00Z"),
        ]);
        let record = ConversationRecord::from_conversation(&conv, &counter()).unwrap();
        assert_eq!(record.duration_secs, 0.0);
        assert_eq!(record.output_tokens, 0);
    }

    #[test]
    fn test_bad_message_timestamp_is_skipped() {
        let conv = conversation("a", "Chat", "2024-05-01T10:00:00Z", vec![
            msg(Sender::Human, "q", "not a time"),
            msg(Sender::Human, "q2", "2024-05-01T10:00:00Z"),
            msg(Sender::Assistant, "a", "2024-05-01T10:01:00Z"),
        ]);
        let record = ConversationRecord::from_conversation(&conv, &counter()).unwrap();
        assert_eq!(record.duration_secs, 60.0);
        assert_eq!(record.dialogue_turns, 2);
    }

    #[test]
    fn test_aggregates() {
        let convs = vec![
            conversation("a", "Short", "2024-01-15T09:00:00Z", vec![
                msg(Sender::Human, "hi", "2024-01-15T09:00:00Z"),
                msg(Sender::Assistant, "hello", "2024-01-15T10:00:00Z"),
            ]),
            conversation("b", "Long", "2024-07-01T21:00:00Z", vec![
                msg(Sender::Human, "a", "2024-07-01T21:00:00Z"),
                msg(Sender::Assistant, "b", "2024-07-01T21:30:00Z"),
                msg(Sender::Human, "c", "2024-07-01T21:40:00Z"),
                msg(Sender::Assistant, "d", "2024-07-01T23:00:00Z"),
            ]),
            conversation("c", "Also long", "2024-12-01T09:30:00Z", vec![
                msg(Sender::Human, "a", "2024-12-01T09:30:00Z"),
                msg(Sender::Human, "b", "2024-12-01T09:31:00Z"),
                msg(Sender::Human, "c", "2024-12-01T09:32:00Z"),
                msg(Sender::Human, "d", "2024-12-01T09:33:00Z"),
            ]),
            conversation("bad", "Broken", "whenever", vec![]),
        ];
        let analyzer = ChatAnalyzer::new(&convs, &counter());
        assert_eq!(analyzer.records().len(), 3);

        let duration = analyzer.duration_stats();
        assert_eq!(duration.total_duration, "3.00 hrs");
        assert_eq!(duration.average_duration, "1.00 hrs");
        assert!((duration.average_turns - 8.0 / 3.0).abs() < 1e-9);
        let longest = duration.longest_chat.unwrap();
        assert_eq!(longest.name, "Long");
        assert_eq!(longest.duration, "2.00 hrs");

        let patterns = analyzer.time_patterns();
        assert_eq!(patterns.hourly_pattern[&9], 2);
        assert_eq!(patterns.hourly_pattern[&21], 1);
        // January and December are winter, July is summer
        assert_eq!(patterns.seasonal_pattern[&1], 2);
        assert_eq!(patterns.seasonal_pattern[&3], 1);

        let tokens = analyzer.token_stats();
        assert_eq!(tokens.total_tokens, tokens.input_tokens + tokens.output_tokens);
        assert!(tokens.max_input_tokens >= 1);
    }

    #[test]
    fn test_empty_analyzer() {
        let analyzer = ChatAnalyzer::from_records(Vec::new());
        let duration = analyzer.duration_stats();
        assert_eq!(duration.average_turns, 0.0);
        assert!(duration.longest_chat.is_none());
        assert!(analyzer.time_patterns().hourly_pattern.is_empty());
        assert_eq!(analyzer.token_stats().total_tokens, 0);
    }

    #[test]
    fn test_seasons() {
        assert_eq!(season_of(12), 1);
        assert_eq!(season_of(2), 1);
        assert_eq!(season_of(3), 2);
        assert_eq!(season_of(8), 3);
        assert_eq!(season_of(11), 4);
    }

    #[test]
    fn test_save_result_keeps_unicode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        save_result(&path, &serde_json::json!({"name": "对话"})).unwrap();
        let raw = std::fs::read_to_string(&path).unwrap();
        assert!(raw.contains("对话"));
    }
}
