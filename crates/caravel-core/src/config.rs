//! Engine configuration, the `[transfers]` section of the node
//! configuration file. Key names follow the wire convention of the rest
//! of the protocol (PascalCase).

use serde::{Deserialize, Serialize};

use caravel_types::{CaravelError, Result, KB, MB};

fn default_threads() -> usize {
    4
}

fn default_bucket_size_kb() -> u64 {
    4096
}

fn default_cache_size_mb() -> u64 {
    512
}

fn default_max_push_transactions() -> usize {
    4
}

fn default_max_http_retries() -> u32 {
    0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct TransfersConfig {
    /// Size of the HTTP worker pool.
    #[serde(default = "default_threads")]
    pub threads: usize,

    /// Planner grouping threshold, in KB. The splitting threshold is
    /// fixed at twice this value.
    #[serde(default = "default_bucket_size_kb")]
    pub bucket_size: u64,

    /// Instance cache capacity, in MB.
    #[serde(default = "default_cache_size_mb")]
    pub cache_size: u64,

    /// Capacity of the active push-transaction registry. `0` disables
    /// the push endpoints entirely.
    #[serde(default = "default_max_push_transactions")]
    pub max_push_transactions: usize,

    /// Retry budget per HTTP request.
    #[serde(default = "default_max_http_retries")]
    pub max_http_retries: u32,
}

impl Default for TransfersConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            bucket_size: default_bucket_size_kb(),
            cache_size: default_cache_size_mb(),
            max_push_transactions: default_max_push_transactions(),
            max_http_retries: default_max_http_retries(),
        }
    }
}

impl TransfersConfig {
    /// Planner `group` threshold in bytes.
    pub fn bucket_size_bytes(&self) -> u64 {
        self.bucket_size * KB
    }

    /// Instance cache capacity in bytes.
    pub fn cache_size_bytes(&self) -> u64 {
        self.cache_size * MB
    }

    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(CaravelError::ParameterOutOfRange(
                "Threads must be at least 1".into(),
            ));
        }
        if self.bucket_size == 0 {
            return Err(CaravelError::ParameterOutOfRange(
                "BucketSize must be positive".into(),
            ));
        }
        if self.cache_size == 0 {
            return Err(CaravelError::ParameterOutOfRange(
                "CacheSize must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_table() {
        let config = TransfersConfig::default();
        assert_eq!(config.threads, 4);
        assert_eq!(config.bucket_size_bytes(), 4096 * KB);
        assert_eq!(config.cache_size_bytes(), 512 * MB);
        assert_eq!(config.max_push_transactions, 4);
        assert_eq!(config.max_http_retries, 0);
        config.validate().unwrap();
    }

    #[test]
    fn keys_are_pascal_case() {
        let config: TransfersConfig = serde_json::from_str(
            r#"{"Threads": 8, "BucketSize": 1024, "MaxHttpRetries": 3}"#,
        )
        .unwrap();
        assert_eq!(config.threads, 8);
        assert_eq!(config.bucket_size, 1024);
        assert_eq!(config.cache_size, 512);
        assert_eq!(config.max_http_retries, 3);

        assert!(serde_json::from_str::<TransfersConfig>(r#"{"threads": 8}"#).is_err());
    }

    #[test]
    fn zero_thread_pool_is_rejected() {
        let config = TransfersConfig {
            threads: 0,
            ..TransfersConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
