//! Request and response bodies of the `/v1` routes.
//!
//! Durations are whole seconds on the wire and payloads are strings.

use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    error::Error,
    message::{LeaseToken, Message, MessageId},
};

pub(crate) fn seconds(field: &str, secs: u64) -> Result<TimeDelta, Error> {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .ok_or_else(|| Error::validation(format!("{field} is out of range")))
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

impl OkResponse {
    pub fn ok() -> Self {
        Self { ok: true }
    }
}

pub mod enqueue {
    use super::*;

    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    pub struct EnqueueRequest {
        pub topic: String,
        #[serde(default)]
        pub subtopic: String,
        pub payload: String,
        pub delay: Option<u64>,
        pub dedupe_key: Option<String>,
        pub producer_name: Option<String>,
    }

    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    pub struct EnqueueResponse {
        pub message_id: MessageId,
    }
}

pub mod dequeue {
    use super::*;

    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    pub struct DequeueRequest {
        pub topic: String,
        pub subtopic: Option<String>,
        pub batch_size: Option<u32>,
        pub visibility_timeout: Option<u64>,
        pub consumer_name: Option<String>,
    }

    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    pub struct DequeuedMessage {
        pub message_id: MessageId,
        pub topic: String,
        pub subtopic: String,
        pub payload: String,
        pub lease_token: LeaseToken,
        pub lease_expiry: DateTime<Utc>,
        pub retry_count: u32,
    }

    impl TryFrom<Message> for DequeuedMessage {
        type Error = Error;

        fn try_from(message: Message) -> Result<Self, Self::Error> {
            let (Some(lease_token), Some(lease_expiry)) =
                (message.lease_token, message.lease_expiry)
            else {
                return Err(Error::internal(eyre::eyre!(
                    "Dequeued message {} has no lease",
                    message.id
                )));
            };

            Ok(Self {
                message_id: message.id,
                topic: message.topic,
                subtopic: message.subtopic,
                payload: String::from_utf8_lossy(&message.payload).into_owned(),
                lease_token,
                lease_expiry,
                retry_count: message.retry_count,
            })
        }
    }

    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    pub struct DequeueResponse {
        pub messages: Vec<DequeuedMessage>,
    }
}

pub mod ack {
    use super::*;

    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    pub struct AckRequest {
        pub message_id: MessageId,
        pub lease_token: LeaseToken,
    }
}

pub mod unack {
    use super::*;
    use crate::engine::ReleaseResult;

    /// Either a single message (`message_id` and `lease_token`) or every
    /// leased message of a subtopic (`topic` and `subtopic`).
    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    pub struct UnAckRequest {
        pub message_id: Option<MessageId>,
        pub lease_token: Option<LeaseToken>,
        pub topic: Option<String>,
        pub subtopic: Option<String>,
        pub retry_after: Option<u64>,
    }

    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    #[serde(untagged)]
    pub enum UnAckResponse {
        Message { ok: bool, dead_lettered: bool },
        Subtopic { ok: bool, results: Vec<ReleaseResult> },
    }
}

pub mod register {
    use super::*;
    use crate::topic::TopicConfig;

    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    pub struct RegisterRequest {
        pub topic: String,
        #[serde(default)]
        pub subtopic: String,
        pub default_visibility_timeout: u64,
        pub max_retry_count: u32,
        pub max_batch_size: u32,
    }

    impl RegisterRequest {
        pub fn config(&self) -> Result<TopicConfig, Error> {
            Ok(TopicConfig {
                default_visibility_timeout: seconds(
                    "default_visibility_timeout",
                    self.default_visibility_timeout,
                )?,
                max_retry_count: self.max_retry_count,
                max_batch_size: self.max_batch_size,
            })
        }
    }
}

pub mod topics {
    use super::*;
    use crate::topic::Topic;

    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    pub struct TopicInfo {
        pub topic: String,
        pub subtopic: String,
        pub default_visibility_timeout: i64,
        pub max_retry_count: u32,
        pub max_batch_size: u32,
        pub created_at: DateTime<Utc>,
        pub updated_at: DateTime<Utc>,
    }

    impl From<Topic> for TopicInfo {
        fn from(topic: Topic) -> Self {
            Self {
                topic: topic.key.topic,
                subtopic: topic.key.subtopic,
                default_visibility_timeout: topic.config.default_visibility_timeout.num_seconds(),
                max_retry_count: topic.config.max_retry_count,
                max_batch_size: topic.config.max_batch_size,
                created_at: topic.created_at,
                updated_at: topic.updated_at,
            }
        }
    }

    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    pub struct ListTopicsResponse {
        pub topics: Vec<TopicInfo>,
    }
}

pub mod stats {
    use crate::store::QueueStatistics;

    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    pub struct StatsQuery {
        pub topic: Option<String>,
    }

    #[derive(Debug, serde::Serialize, serde::Deserialize)]
    pub struct StatsResponse {
        pub queues: Vec<QueueStatistics>,
    }
}
