//! Persisted envelopes, channels and driver errors.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use keel_core::CodecError;
use serde::{Deserialize, Serialize};

/// An event serialized into a queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedEvent {
    pub unique_id: String,
    /// Topic of the original event.
    pub key: String,
    /// Encoded payload.
    pub value: Vec<u8>,
    pub handle_timeout: Duration,
    /// Delay applied before the current attempt.
    pub backoff: Duration,
    /// 1-based attempt counter.
    pub attempts: u32,
    pub max_attempts: u32,
}

impl PersistedEvent {
    /// Whether another attempt is allowed after the current one fails.
    #[must_use]
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }
}

/// One of the five channels a driver keeps per queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Waiting,
    Delayed,
    Reserved,
    Failed,
    Timeout,
}

impl Channel {
    pub const ALL: [Channel; 5] = [
        Channel::Waiting,
        Channel::Delayed,
        Channel::Reserved,
        Channel::Failed,
        Channel::Timeout,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Delayed => "delayed",
            Self::Reserved => "reserved",
            Self::Failed => "failed",
            Self::Timeout => "timeout",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Channel {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|c| c.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| QueueError::UnknownChannel(s.to_string()))
    }
}

/// Entry counts per channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueInfo {
    pub waiting: u64,
    pub delayed: u64,
    pub reserved: u64,
    pub failed: u64,
    pub timeout: u64,
}

impl QueueInfo {
    #[must_use]
    pub fn count(&self, channel: Channel) -> u64 {
        match channel {
            Channel::Waiting => self.waiting,
            Channel::Delayed => self.delayed,
            Channel::Reserved => self.reserved,
            Channel::Failed => self.failed,
            Channel::Timeout => self.timeout,
        }
    }
}

/// Queue driver and dispatcher errors.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("unknown queue channel {0:?}")]
    UnknownChannel(String),
    #[error("channel {0} cannot be reloaded")]
    NotReloadable(Channel),
    #[error("no decoder registered for topic {0:?}")]
    NoDecoder(String),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[cfg(feature = "redis")]
    #[error("redis: {0}")]
    Redis(#[from] redis::RedisError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channels_parse_case_insensitively() {
        assert_eq!("Failed".parse::<Channel>().unwrap(), Channel::Failed);
        assert_eq!(" timeout ".parse::<Channel>().unwrap(), Channel::Timeout);
        assert!("bogus".parse::<Channel>().is_err());
    }

    #[test]
    fn retry_budget() {
        let mut msg = PersistedEvent {
            unique_id: "u".into(),
            key: "k".into(),
            value: vec![],
            handle_timeout: Duration::from_secs(1),
            backoff: Duration::ZERO,
            attempts: 1,
            max_attempts: 2,
        };
        assert!(msg.can_retry());
        msg.attempts = 2;
        assert!(!msg.can_retry());
    }
}
