//! Configuration for the NSF replicator.

use crate::error::{NsfError, NsfResult};
use std::time::Duration;
use syncdb_protocol::{IE_HEADER_LEN, NSF_HEADER_LEN};

/// Replicator tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NsfConfig {
    /// Largest encoded message, header included.
    pub max_message_size: usize,
    /// Messages sent per burst and held until acknowledged.
    pub window: usize,
    /// Idle time after which an outstanding window is probed with an
    /// ACK request.
    pub idle_interval: Duration,
    /// Time without an ACK after which the window is retransmitted.
    pub ack_timeout: Duration,
}

impl NsfConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self {
            max_message_size: 16 * 1024,
            window: 16,
            idle_interval: Duration::from_secs(2),
            ack_timeout: Duration::from_secs(5),
        }
    }

    /// Sets the maximum message size.
    pub fn with_max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = size;
        self
    }

    /// Sets the window size.
    pub fn with_window(mut self, window: usize) -> Self {
        self.window = window;
        self
    }

    /// Sets the idle ACK-request interval.
    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    /// Sets the ACK timeout.
    pub fn with_ack_timeout(mut self, timeout: Duration) -> Self {
        self.ack_timeout = timeout;
        self
    }

    /// Smallest usable message size: one IE carrying one byte.
    pub const fn min_message_size() -> usize {
        NSF_HEADER_LEN + IE_HEADER_LEN + 1
    }

    /// Checks the configuration.
    pub fn validate(&self) -> NsfResult<()> {
        if self.max_message_size < Self::min_message_size() {
            return Err(NsfError::config(format!(
                "max message size {} below minimum {}",
                self.max_message_size,
                Self::min_message_size()
            )));
        }
        if self.window == 0 {
            return Err(NsfError::config("window must hold at least one message"));
        }
        Ok(())
    }
}

impl Default for NsfConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = NsfConfig::default();
        assert_eq!(config.max_message_size, 16 * 1024);
        assert_eq!(config.window, 16);
        config.validate().unwrap();
    }

    #[test]
    fn rejects_tiny_messages_and_empty_window() {
        assert!(NsfConfig::new().with_max_message_size(20).validate().is_err());
        assert!(NsfConfig::new().with_window(0).validate().is_err());
    }
}
