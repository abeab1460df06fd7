//! Replication tuning parameters

use std::time::Duration;

/// Configuration for replication timing and batching
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Interval between heartbeats sent by the leader (default: 150ms)
    pub heart_beat_interval: Duration,
    /// Minimum election timeout (default: 300ms)
    pub election_timeout_min: Duration,
    /// Maximum election timeout (default: 500ms)
    pub election_timeout_max: Duration,
    /// Maximum number of log entries shipped in one request (default: 100)
    pub max_append_size: usize,
    /// Heartbeat-interval multiplier after which an inactive peer connection
    /// is forcibly re-established (default: 20)
    pub reconnect_limit: u32,
    /// Heartbeat-interval multiplier after which a stuck busy flag is
    /// forcibly released (default: 20)
    pub busy_flag_limit: u32,
    /// Number of long-pause warnings logged per pause before they are
    /// suppressed (default: 20)
    pub warnings_limit: u32,
    /// Number of identical retries before a request is narrowed down to a
    /// single entry (default: 5)
    pub retry_narrow_threshold: u32,
    /// Number of long-pause recoveries after which the recovery counter
    /// starts over (default: 10)
    pub recovery_reset_threshold: u32,
    /// How long a client submit waits for its entry to commit (default: 5s)
    pub submit_timeout: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            heart_beat_interval: Duration::from_millis(150),
            election_timeout_min: Duration::from_millis(300),
            election_timeout_max: Duration::from_millis(500),
            max_append_size: 100,
            reconnect_limit: 20,
            busy_flag_limit: 20,
            warnings_limit: 20,
            retry_narrow_threshold: 5,
            recovery_reset_threshold: 10,
            submit_timeout: Duration::from_secs(5),
        }
    }
}

impl ReplicationConfig {
    /// Create a new config with a custom heartbeat interval
    pub fn with_heart_beat_interval(mut self, interval: Duration) -> Self {
        self.heart_beat_interval = interval;
        self
    }

    /// Create a new config with a custom election timeout range
    pub fn with_election_timeout(mut self, min: Duration, max: Duration) -> Self {
        self.election_timeout_min = min;
        self.election_timeout_max = max;
        self
    }

    /// Create a new config with a custom per-request batch limit
    pub fn with_max_append_size(mut self, max: usize) -> Self {
        self.max_append_size = max;
        self
    }

    /// Create a new config with a custom submit timeout
    pub fn with_submit_timeout(mut self, timeout: Duration) -> Self {
        self.submit_timeout = timeout;
        self
    }

    /// Generate a random election timeout within the configured range
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        let timeout_ms = rand::rng().random_range(min_ms..=max_ms);
        Duration::from_millis(timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let config = ReplicationConfig::default();
        assert_eq!(config.max_append_size, 100);
        assert_eq!(config.reconnect_limit, 20);
        assert_eq!(config.busy_flag_limit, 20);
        assert_eq!(config.warnings_limit, 20);
        assert_eq!(config.retry_narrow_threshold, 5);
        assert_eq!(config.recovery_reset_threshold, 10);
    }

    #[test]
    fn test_random_election_timeout_in_range() {
        let config = ReplicationConfig::default();
        for _ in 0..100 {
            let timeout = config.random_election_timeout();
            assert!(timeout >= config.election_timeout_min);
            assert!(timeout <= config.election_timeout_max);
        }
    }
}
