use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub const MAX_NAME_LEN: usize = 255;

/// Upper bound on `max_batch_size`.
pub const MAX_BATCH_SIZE: u32 = 1000;

/// Identifies a topic configuration. An empty subtopic addresses the
/// topic-wide configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicKey {
    pub topic: String,
    #[serde(default)]
    pub subtopic: String,
}

impl TopicKey {
    pub fn new(topic: impl Into<String>, subtopic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            subtopic: subtopic.into(),
        }
    }

    pub fn topic_wide(topic: impl Into<String>) -> Self {
        Self::new(topic, "")
    }

    pub fn is_topic_wide(&self) -> bool {
        self.subtopic.is_empty()
    }

    pub fn validate(&self) -> Result<(), Error> {
        validate_name("topic", &self.topic)?;
        if self.subtopic.len() > MAX_NAME_LEN {
            return Err(Error::validation(format!(
                "subtopic must be at most {MAX_NAME_LEN} bytes"
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for TopicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.subtopic.is_empty() {
            f.write_str(&self.topic)
        } else {
            write!(f, "{}/{}", self.topic, self.subtopic)
        }
    }
}

pub(crate) fn validate_name(what: &str, name: &str) -> Result<(), Error> {
    if name.trim().is_empty() {
        return Err(Error::validation(format!("{what} must not be empty")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::validation(format!(
            "{what} must be at most {MAX_NAME_LEN} bytes"
        )));
    }
    Ok(())
}

/// Delivery policy of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicConfig {
    /// Lease length used when a poller does not ask for one.
    pub default_visibility_timeout: TimeDelta,
    /// Redeliveries allowed before a message is dead-lettered.
    pub max_retry_count: u32,
    /// Upper bound on messages leased by one poll.
    pub max_batch_size: u32,
}

impl TopicConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.default_visibility_timeout <= TimeDelta::zero() {
            return Err(Error::validation(
                "default_visibility_timeout must be positive",
            ));
        }
        if self.max_batch_size == 0 {
            return Err(Error::validation("max_batch_size must be at least 1"));
        }
        if self.max_batch_size > MAX_BATCH_SIZE {
            return Err(Error::validation(format!(
                "max_batch_size must be at most {MAX_BATCH_SIZE}"
            )));
        }
        Ok(())
    }
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            default_visibility_timeout: TimeDelta::seconds(30),
            max_retry_count: 3,
            max_batch_size: 10,
        }
    }
}

/// A registered topic configuration record.
#[derive(Debug, Clone, PartialEq)]
pub struct Topic {
    pub key: TopicKey,
    pub config: TopicConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_key_display() {
        assert_eq!(TopicKey::topic_wide("ci-jobs").to_string(), "ci-jobs");
        assert_eq!(TopicKey::new("ci-jobs", "linux").to_string(), "ci-jobs/linux");
    }

    #[test]
    fn test_topic_key_validation() {
        assert!(TopicKey::topic_wide("ci-jobs").validate().is_ok());
        assert!(TopicKey::topic_wide("  ").validate().is_err());
        assert!(TopicKey::topic_wide("x".repeat(MAX_NAME_LEN + 1))
            .validate()
            .is_err());
        assert!(TopicKey::new("ci-jobs", "s".repeat(MAX_NAME_LEN + 1))
            .validate()
            .is_err());
    }

    #[test]
    fn test_config_validation() {
        assert!(TopicConfig::default().validate().is_ok());

        let zero_timeout = TopicConfig {
            default_visibility_timeout: TimeDelta::zero(),
            ..Default::default()
        };
        assert!(zero_timeout.validate().is_err());

        let zero_batch = TopicConfig {
            max_batch_size: 0,
            ..Default::default()
        };
        assert!(zero_batch.validate().is_err());

        let huge_batch = TopicConfig {
            max_batch_size: u32::MAX,
            ..Default::default()
        };
        assert!(matches!(
            huge_batch.validate(),
            Err(Error::Validation { .. })
        ));

        let largest_batch = TopicConfig {
            max_batch_size: MAX_BATCH_SIZE,
            ..Default::default()
        };
        assert!(largest_batch.validate().is_ok());

        // No retries at all is a valid policy.
        let no_retries = TopicConfig {
            max_retry_count: 0,
            ..Default::default()
        };
        assert!(no_retries.validate().is_ok());
    }
}
