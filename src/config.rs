use crate::pipeline::FeeSplitPolicy;
use crate::queue::RetryConfig;

/// Runtime configuration, read from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub sqlite_path: String,
    pub queue_workers: usize,
    pub retry: RetryConfig,
    pub fee_split: FeeSplitPolicy,
    /// JSON-lines transaction input; stdin when unset.
    pub input_path: Option<String>,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            sqlite_path: std::env::var("SQLITE_PATH").unwrap_or_else(|_| "./indexer.sqlite".to_string()),
            queue_workers: std::env::var("QUEUE_WORKERS").ok().and_then(|v| v.parse().ok()).unwrap_or_else(num_cpus::get),
            retry: RetryConfig {
                max_attempts: std::env::var("RETRY_MAX_ATTEMPTS").ok().and_then(|v| v.parse().ok()).unwrap_or(8),
                base_delay_ms: std::env::var("RETRY_BASE_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(100),
                max_delay_ms: std::env::var("RETRY_MAX_MS").ok().and_then(|v| v.parse().ok()).unwrap_or(30_000),
                jitter_factor: std::env::var("RETRY_JITTER").ok().and_then(|v| v.parse().ok()).unwrap_or(0.3),
            },
            fee_split: std::env::var("FEE_SPLIT").ok().and_then(|v| FeeSplitPolicy::parse(&v)).unwrap_or_default(),
            input_path: std::env::var("INPUT_PATH").ok().filter(|v| !v.is_empty()),
        }
    }
}
