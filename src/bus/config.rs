//! Bus configuration

use crate::session::random_id;

/// Default subject prefix
pub const DEFAULT_PREFIX: &str = "channelling.trigger";

/// Bus configuration options
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Identifier of this node in triggers and reply subjects
    pub node_id: String,

    /// Prefix for every subject published by this node
    pub prefix: String,

    /// Redis URL; `None` selects the no-op bus
    pub redis_url: Option<String>,

    /// Pending triggers held before `trigger` fails fast
    pub trigger_queue_size: usize,

    /// Outbound entries buffered per sink
    pub sink_queue_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            node_id: random_id(12),
            prefix: DEFAULT_PREFIX.to_string(),
            redis_url: None,
            trigger_queue_size: 50,
            sink_queue_size: 100,
        }
    }
}

impl BusConfig {
    /// Load from `SIGNAL_RELAY_*` environment variables
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let var = |key: &str| {
            std::env::var(key)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        Self {
            node_id: var("SIGNAL_RELAY_NODE_ID").unwrap_or(defaults.node_id),
            prefix: var("SIGNAL_RELAY_BUS_PREFIX").unwrap_or(defaults.prefix),
            redis_url: var("SIGNAL_RELAY_REDIS_URL"),
            ..defaults
        }
    }

    /// Set the node id
    pub fn node_id(mut self, id: impl Into<String>) -> Self {
        self.node_id = id.into();
        self
    }

    /// Set the subject prefix
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    /// Use redis at `url`
    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    /// Set the trigger queue depth
    pub fn trigger_queue_size(mut self, size: usize) -> Self {
        self.trigger_queue_size = size.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BusConfig::default();

        assert_eq!(config.prefix, "channelling.trigger");
        assert_eq!(config.trigger_queue_size, 50);
        assert_eq!(config.sink_queue_size, 100);
        assert_eq!(config.node_id.len(), 12);
        assert!(config.redis_url.is_none());
    }

    #[test]
    fn test_builder_chaining() {
        let config = BusConfig::default()
            .node_id("node-a")
            .prefix("test")
            .redis_url("redis://127.0.0.1/")
            .trigger_queue_size(0);

        assert_eq!(config.node_id, "node-a");
        assert_eq!(config.prefix, "test");
        assert_eq!(config.redis_url.as_deref(), Some("redis://127.0.0.1/"));
        assert_eq!(config.trigger_queue_size, 1);
    }
}
