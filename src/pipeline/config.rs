//! Pipeline configuration

use std::time::Duration;

/// Pipeline configuration options
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Relay window, refreshed on every entry
    pub ttl: Duration,

    /// Capacity of the inbound queue fed by an attached sink
    pub recv_queue_size: usize,

    /// How often expired pipelines are reaped
    pub cleanup_interval: Duration,

    /// How long to wait for another node to claim a session
    pub lookup_timeout: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(30),
            recv_queue_size: 100,
            cleanup_interval: Duration::from_secs(10),
            lookup_timeout: Duration::from_secs(2),
        }
    }
}

impl PipelineConfig {
    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    pub fn recv_queue_size(mut self, size: usize) -> Self {
        self.recv_queue_size = size.max(1);
        self
    }

    pub fn cleanup_interval(mut self, interval: Duration) -> Self {
        self.cleanup_interval = interval;
        self
    }

    pub fn lookup_timeout(mut self, timeout: Duration) -> Self {
        self.lookup_timeout = timeout;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.ttl, Duration::from_secs(30));
        assert_eq!(config.recv_queue_size, 100);
    }

    #[test]
    fn test_queue_size_floor() {
        let config = PipelineConfig::default().recv_queue_size(0);
        assert_eq!(config.recv_queue_size, 1);
    }
}
