//! Sync engine configuration.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for sync behavior.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Delays between replicator push retries. After the last one the
    /// replicator is marked degraded.
    pub retry_intervals: Vec<Duration>,
    /// Timeout for a single request to a peer.
    pub request_timeout: Duration,
    /// Deadline for targeted sync when the caller gives none.
    pub default_sync_timeout: Duration,
    /// Maximum blocks per fetch response.
    pub fetch_batch_size: usize,
    /// Head advertisements remembered for deduplication.
    pub seen_cache_size: usize,
    /// Maximum fetch round trips for one pull.
    pub max_fetch_depth: usize,
    /// Accept replicator pushes for collections we know but did not subscribe to.
    pub accept_unsolicited_pushes: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            retry_intervals: [2, 4, 8, 16, 32].into_iter().map(Duration::from_secs).collect(),
            request_timeout: Duration::from_secs(5),
            default_sync_timeout: Duration::from_secs(30),
            fetch_batch_size: 256,
            seen_cache_size: 1024,
            max_fetch_depth: 64,
            accept_unsolicited_pushes: true,
        }
    }
}

impl SyncConfig {
    pub fn builder() -> SyncConfigBuilder {
        SyncConfigBuilder::new()
    }
}

/// Builder for sync configuration.
pub struct SyncConfigBuilder {
    config: SyncConfig,
}

impl SyncConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: SyncConfig::default(),
        }
    }

    pub fn retry_intervals(mut self, intervals: Vec<Duration>) -> Self {
        self.config.retry_intervals = intervals;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn default_sync_timeout(mut self, timeout: Duration) -> Self {
        self.config.default_sync_timeout = timeout;
        self
    }

    pub fn fetch_batch_size(mut self, size: usize) -> Self {
        self.config.fetch_batch_size = size.max(1);
        self
    }

    pub fn seen_cache_size(mut self, size: usize) -> Self {
        self.config.seen_cache_size = size.max(1);
        self
    }

    pub fn max_fetch_depth(mut self, depth: usize) -> Self {
        self.config.max_fetch_depth = depth.max(1);
        self
    }

    pub fn accept_unsolicited_pushes(mut self, enabled: bool) -> Self {
        self.config.accept_unsolicited_pushes = enabled;
        self
    }

    pub fn build(self) -> SyncConfig {
        self.config
    }
}

impl Default for SyncConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_config_builder() {
        let config = SyncConfigBuilder::new()
            .retry_intervals(vec![Duration::from_millis(10)])
            .request_timeout(Duration::from_millis(300))
            .fetch_batch_size(0)
            .max_fetch_depth(8)
            .accept_unsolicited_pushes(false)
            .build();

        assert_eq!(config.retry_intervals, vec![Duration::from_millis(10)]);
        assert_eq!(config.request_timeout, Duration::from_millis(300));
        assert_eq!(config.fetch_batch_size, 1);
        assert_eq!(config.max_fetch_depth, 8);
        assert!(!config.accept_unsolicited_pushes);
    }

    #[test]
    fn test_default_backoff_doubles() {
        let config = SyncConfig::default();
        let secs: Vec<u64> = config.retry_intervals.iter().map(|d| d.as_secs()).collect();
        assert_eq!(secs, vec![2, 4, 8, 16, 32]);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: SyncConfig = serde_json::from_str(r#"{"fetch_batch_size": 16}"#).unwrap();
        assert_eq!(config.fetch_batch_size, 16);
        assert_eq!(config.request_timeout, SyncConfig::default().request_timeout);
    }
}
