//! Database configuration.

use serde::{Deserialize, Serialize};

/// Configuration for the [`EventBroker`](crate::EventBroker).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Per-subscriber queue capacity. Events beyond it are dropped for that subscriber.
    pub subscriber_buffer: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            subscriber_buffer: 256,
        }
    }
}

/// Configuration for a [`DocumentStore`](crate::DocumentStore).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    pub broker: BrokerConfig,
    /// Idle per-document locks are pruned once the table grows past this size.
    pub lock_table_prune_threshold: usize,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            lock_table_prune_threshold: 4096,
        }
    }
}

impl DbConfig {
    pub fn builder() -> DbConfigBuilder {
        DbConfigBuilder::default()
    }
}

/// Builder for database configuration.
#[derive(Default)]
pub struct DbConfigBuilder {
    config: DbConfig,
}

impl DbConfigBuilder {
    pub fn subscriber_buffer(mut self, size: usize) -> Self {
        self.config.broker.subscriber_buffer = size.max(1);
        self
    }

    pub fn lock_table_prune_threshold(mut self, threshold: usize) -> Self {
        self.config.lock_table_prune_threshold = threshold;
        self
    }

    pub fn build(self) -> DbConfig {
        self.config
    }
}
