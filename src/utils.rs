use anyhow::{Context, Result};
use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

/// Uniformly sample `n` items without replacement; all items when `n >= len`.
pub fn sample_items<T: Clone>(items: &[T], n: usize, seed: Option<u64>) -> Vec<T> {
    use rand::{seq::SliceRandom, SeedableRng};

    if items.len() <= n {
        return items.to_vec();
    }

    let mut rng = if let Some(seed) = seed {
        rand::rngs::StdRng::seed_from_u64(seed)
    } else {
        rand::rngs::StdRng::from_entropy()
    };

    let mut indices: Vec<usize> = (0..items.len()).collect();
    indices.shuffle(&mut rng);

    indices.into_iter()
        .take(n)
        .map(|i| items[i].clone())
        .collect()
}

/// Most frequent item; ties go to the item that appears first.
pub fn most_common<T: Eq + Hash + Clone>(items: &[T]) -> Option<T> {
    let mut counts: HashMap<&T, (usize, usize)> = HashMap::new();
    for (pos, item) in items.iter().enumerate() {
        counts.entry(item).or_insert((0, pos)).0 += 1;
    }

    counts
        .into_iter()
        .max_by(|(_, (ca, pa)), (_, (cb, pb))| ca.cmp(cb).then(pb.cmp(pa)))
        .map(|(item, _)| item.clone())
}

/// Prefix of at most `max_chars` characters, cut on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

// Retry configuration
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryConfig {
    pub fn with_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Default::default()
        }
    }
}

// Retry mechanism with exponential backoff
pub async fn retry_with_backoff<F, Fut, T>(
    mut operation: F,
    config: RetryConfig,
    operation_name: &str,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        attempt += 1;
        debug!("Attempting {} (attempt {}/{})", operation_name, attempt, config.max_attempts);

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    info!("{} succeeded after {} attempts", operation_name, attempt);
                }
                return Ok(result);
            }
            Err(e) if attempt >= config.max_attempts => {
                if config.max_attempts > 1 {
                    error!("{} failed after {} attempts: {}", operation_name, attempt, e);
                }
                return Err(e).context(format!("{} failed after {} attempts", operation_name, attempt));
            }
            Err(e) => {
                warn!("{} attempt {} failed: {}, retrying in {:?}",
                      operation_name, attempt, e, delay);

                sleep(delay).await;

                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * config.exponential_base).min(config.max_delay.as_secs_f64())
                );

                if config.jitter {
                    use rand::Rng;
                    let jitter = rand::thread_rng().gen_range(0.8..1.2);
                    delay = Duration::from_secs_f64(delay.as_secs_f64() * jitter);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_most_common() {
        let items = vec!["a", "b", "b", "c", "b", "c"];
        assert_eq!(most_common(&items), Some("b"));
        assert_eq!(most_common::<u8>(&[]), None);
    }

    #[test]
    fn test_most_common_tie_prefers_first_seen() {
        assert_eq!(most_common(&[3, 1, 1, 3]), Some(3));
        assert_eq!(most_common(&[1, 3, 3, 1]), Some(1));
        assert_eq!(most_common(&[5, 6, 7]), Some(5));
    }

    #[test]
    fn test_sample_items_without_replacement() {
        let items: Vec<usize> = (0..100).collect();
        let mut sample = sample_items(&items, 10, Some(42));
        assert_eq!(sample.len(), 10);
        assert_eq!(sample, sample_items(&items, 10, Some(42)));
        sample.sort();
        sample.dedup();
        assert_eq!(sample.len(), 10);

        assert_eq!(sample_items(&items[..3], 10, None), vec![0, 1, 2]);
    }

    #[test]
    fn test_truncate_chars_respects_boundaries() {
        assert_eq!(truncate_chars("hello", 3), "hel");
        assert_eq!(truncate_chars("hello", 10), "hello");
        assert_eq!(truncate_chars("héllo wörld", 7), "héllo w");
        assert_eq!(truncate_chars("日本語テキスト", 2), "日本");
        assert_eq!(truncate_chars("", 4), "");
    }

    #[tokio::test]
    async fn test_retry_with_backoff() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let attempt = AtomicUsize::new(0);
        let operation = || async {
            let current = attempt.fetch_add(1, Ordering::SeqCst);
            if current < 2 {
                Err(anyhow::anyhow!("Simulated failure"))
            } else {
                Ok("Success")
            }
        };

        let config = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            exponential_base: 2.0,
            jitter: false,
        };

        let result = retry_with_backoff(operation, config, "test operation").await;
        assert_eq!(result.unwrap(), "Success");
        assert_eq!(attempt.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_single_attempt_does_not_retry() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let attempt = AtomicUsize::new(0);
        let result: Result<()> = retry_with_backoff(
            || async {
                attempt.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("down"))
            },
            RetryConfig::with_attempts(1),
            "once",
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempt.load(Ordering::SeqCst), 1);
    }
}
