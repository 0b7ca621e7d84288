use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration_secs;

/// Timing and retry policy of the message queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MessageQueueConfig {
    /// How long to wait for a CallResult/CallError before a send counts as timed out.
    #[serde(with = "duration_secs")]
    pub message_timeout: Duration,
    /// Total transmissions allowed for a transaction message.
    pub transaction_message_attempts: u32,
    /// Base wait before retransmitting a transaction message. The n-th retry
    /// waits `n * transaction_message_retry_interval`.
    #[serde(with = "duration_secs")]
    pub transaction_message_retry_interval: Duration,
    /// Upper bound on any retry wait.
    #[serde(with = "duration_secs")]
    pub max_retry_interval: Duration,
    /// Hold every message (not only transaction messages) until registration is accepted.
    pub queue_all_messages: bool,
    /// Queued-message count above which transaction update messages
    /// (intermediate meter values) are dropped. `0` disables dropping.
    pub queues_total_size_threshold: usize,
}

impl Default for MessageQueueConfig {
    fn default() -> Self {
        Self {
            message_timeout: Duration::from_secs(30),
            transaction_message_attempts: 3,
            transaction_message_retry_interval: Duration::from_secs(60),
            max_retry_interval: Duration::from_secs(600),
            queue_all_messages: false,
            queues_total_size_threshold: 2000,
        }
    }
}

impl MessageQueueConfig {
    /// Allowed transmissions for a message.
    pub(super) fn max_attempts(&self, is_transaction_related: bool) -> u32 {
        if is_transaction_related {
            self.transaction_message_attempts.max(1)
        } else {
            1
        }
    }

    /// Wait after the `attempts`-th failed transmission.
    pub(super) fn retry_delay(&self, attempts: u32) -> Duration {
        self.transaction_message_retry_interval
            .saturating_mul(attempts.max(1))
            .min(self.max_retry_interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_is_linear_and_capped() {
        let cfg = MessageQueueConfig {
            transaction_message_retry_interval: Duration::from_secs(10),
            max_retry_interval: Duration::from_secs(25),
            ..Default::default()
        };
        assert_eq!(cfg.retry_delay(1), Duration::from_secs(10));
        assert_eq!(cfg.retry_delay(2), Duration::from_secs(20));
        assert_eq!(cfg.retry_delay(3), Duration::from_secs(25));
        assert_eq!(cfg.retry_delay(u32::MAX), Duration::from_secs(25));
    }

    #[test]
    fn only_transaction_messages_are_retried() {
        let cfg = MessageQueueConfig::default();
        assert_eq!(cfg.max_attempts(false), 1);
        assert_eq!(cfg.max_attempts(true), 3);

        let zero = MessageQueueConfig {
            transaction_message_attempts: 0,
            ..Default::default()
        };
        assert_eq!(zero.max_attempts(true), 1);
    }
}
