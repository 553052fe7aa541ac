use crate::utils::truncate_chars;

pub const DEFAULT_INSTRUCTION: &str =
    "Use a phrase to describe the general topic in above texts. No more than 10 words.";

pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful assistant that summarizes text clusters.";

/// Numbered example block, each text cut to `chunk_size` characters.
pub fn format_examples<S: AsRef<str>>(examples: &[S], chunk_size: usize) -> String {
    examples
        .iter()
        .enumerate()
        .map(|(i, text)| format!("Example {}:\n{}", i + 1, truncate_chars(text.as_ref(), chunk_size)))
        .collect::<Vec<_>>()
        .join("\n\n")
}

pub fn get_cluster_summary_prompt(examples: &str, instruction: &str) -> String {
    format!("{}\n\n{}", examples, instruction)
}

/// Strip the wrapping a chat model tends to add around a short phrase.
pub fn clean_summary_response(response: &str) -> String {
    let line = response
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or_default();
    let line = line
        .strip_prefix("Topic:")
        .or_else(|| line.strip_prefix("topic:"))
        .unwrap_or(line)
        .trim();
    line.trim_matches(|c| c == '"' || c == '\'' || c == '*')
        .trim_end_matches('.')
        .trim()
        .to_string()
}
