//! Centralized configuration for streamvault.
//!
//! All tunable parameters are defined here to avoid hard-coded values
//! scattered throughout the codebase.

use std::path::PathBuf;
use std::time::Duration;

/// Central configuration for all streamvault components.
///
/// Groups related settings into logical sections and supports environment
/// variable overrides for runtime customization.
#[derive(Debug, Clone, Default)]
pub struct StreamVaultConfig {
    pub cache: CacheConfig,
    pub fetch: FetchConfig,
}

/// Chunk cache sizing and placement.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Byte budget for cached chunks, accounted by target length
    pub max_cache_bytes: u64,
    /// Target size of one cached chunk
    pub chunk_size: u64,
    /// Directory holding the persistent blob tier
    pub blob_dir: PathBuf,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_cache_bytes: 1024 * 1024 * 1024, // 1 GiB
            chunk_size: 5 * 1024 * 1024,         // 5 MiB
            blob_dir: PathBuf::from("cache"),
        }
    }
}

/// Download worker pool and fetch behavior.
#[derive(Debug, Clone)]
pub struct FetchConfig {
    /// Number of concurrent download workers
    pub workers: usize,
    /// Network sub-chunk granularity requested from the media source
    pub net_chunk_size: u64,
    /// Maximum pending jobs before submission blocks
    pub queue_capacity: usize,
    /// Retries per fetch job on transient source errors
    pub max_retries: u32,
    /// Initial retry backoff, doubling per attempt
    pub retry_backoff: Duration,
    /// How long a reader waits on chunk growth before aborting the stream
    pub stall_timeout: Duration,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get().clamp(4, 8),
            net_chunk_size: 256 * 1024, // 256 KiB
            queue_capacity: 64,
            max_retries: 2,
            retry_backoff: Duration::from_millis(250),
            stall_timeout: Duration::from_secs(30),
        }
    }
}

impl StreamVaultConfig {
    /// Creates configuration with environment variable overrides.
    ///
    /// Allows runtime configuration via environment variables while
    /// maintaining sensible defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(bytes) = std::env::var("STREAMVAULT_MAX_CACHE_BYTES") {
            if let Ok(value) = bytes.parse::<u64>() {
                config.cache.max_cache_bytes = value;
            }
        }

        if let Ok(size) = std::env::var("STREAMVAULT_CHUNK_SIZE") {
            if let Ok(value) = size.parse::<u64>() {
                config.cache.chunk_size = value;
            }
        }

        if let Ok(dir) = std::env::var("STREAMVAULT_BLOB_DIR") {
            config.cache.blob_dir = PathBuf::from(dir);
        }

        if let Ok(workers) = std::env::var("STREAMVAULT_WORKERS") {
            if let Ok(count) = workers.parse::<usize>() {
                config.fetch.workers = count;
            }
        }

        if let Ok(timeout) = std::env::var("STREAMVAULT_STALL_TIMEOUT_SECS") {
            if let Ok(seconds) = timeout.parse::<u64>() {
                config.fetch.stall_timeout = Duration::from_secs(seconds);
            }
        }

        config
    }

    /// Creates a configuration with small budgets and fast timeouts for
    /// tests.
    pub fn for_testing() -> Self {
        Self {
            cache: CacheConfig {
                max_cache_bytes: 1024 * 1024,
                chunk_size: 64 * 1024,
                blob_dir: PathBuf::from("cache-test"),
            },
            fetch: FetchConfig {
                workers: 2,
                net_chunk_size: 4 * 1024,
                queue_capacity: 8,
                max_retries: 1,
                retry_backoff: Duration::from_millis(10),
                stall_timeout: Duration::from_secs(2),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_values() {
        let config = StreamVaultConfig::default();

        assert_eq!(config.cache.max_cache_bytes, 1024 * 1024 * 1024);
        assert_eq!(config.cache.chunk_size, 5 * 1024 * 1024);
        assert_eq!(config.fetch.net_chunk_size, 256 * 1024);
        assert!((4..=8).contains(&config.fetch.workers));
        assert_eq!(config.fetch.stall_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_testing_preset_is_small() {
        let config = StreamVaultConfig::for_testing();
        assert!(config.cache.max_cache_bytes < 16 * 1024 * 1024);
        assert!(config.fetch.stall_timeout < Duration::from_secs(10));
    }

    #[test]
    fn test_env_override() {
        unsafe {
            std::env::set_var("STREAMVAULT_MAX_CACHE_BYTES", "4096");
            std::env::set_var("STREAMVAULT_CHUNK_SIZE", "1024");
            std::env::set_var("STREAMVAULT_WORKERS", "3");
            std::env::set_var("STREAMVAULT_STALL_TIMEOUT_SECS", "7");
        }

        let config = StreamVaultConfig::from_env();

        assert_eq!(config.cache.max_cache_bytes, 4096);
        assert_eq!(config.cache.chunk_size, 1024);
        assert_eq!(config.fetch.workers, 3);
        assert_eq!(config.fetch.stall_timeout, Duration::from_secs(7));

        // Cleanup
        unsafe {
            std::env::remove_var("STREAMVAULT_MAX_CACHE_BYTES");
            std::env::remove_var("STREAMVAULT_CHUNK_SIZE");
            std::env::remove_var("STREAMVAULT_WORKERS");
            std::env::remove_var("STREAMVAULT_STALL_TIMEOUT_SECS");
        }
    }
}
