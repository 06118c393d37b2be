//! Message records and their lifecycle states.
//!
//! A message is created `Available`, leased by a poller, and then either
//! acknowledged (`Acked`), released back to `Available`, or dead-lettered
//! (`Dead`) once its retry budget is exhausted.
//!
//! # Message Lifecycle
//!
//! ```text
//! Available --lease--> Leased --ack--> Acked (terminal)
//!                        |
//!                        +--expiry / unack--> Available (retry_count + 1)
//!                        +--expiry / unack, budget exhausted--> Dead (terminal)
//! ```
//!
//! Lease expiry is never written by a background task. A `Leased` record whose
//! `lease_expiry` has passed is treated as `Available` by every read path until
//! a poller actually re-leases it.

use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{auth::crypto::generate_token, error::Error};

/// Unique message identifier, assigned at enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl std::str::FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Opaque nonce proving ownership of a lease.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LeaseToken(String);

impl LeaseToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// A fresh random token, 24 bytes of entropy in base58.
    pub fn generate() -> Result<Self, Error> {
        generate_token::<24>(rand::thread_rng())
            .map(Self)
            .map_err(Error::internal)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Tokens authorize acks; keep them out of logs.
        f.write_str("LeaseToken(..)")
    }
}

impl fmt::Display for LeaseToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a message as persisted in the store.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    sqlx::Type,
    strum::Display,
    strum::EnumString,
)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum MessageState {
    /// Waiting to be leased, possibly not before `available_at`.
    Available,
    /// Held by a poller until `lease_expiry`.
    Leased,
    /// Processing completed. Terminal.
    Acked,
    /// Retry budget exhausted. Terminal.
    Dead,
}

impl MessageState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Acked | Self::Dead)
    }
}

/// A message record, the unit of compare-and-swap in the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub topic: String,
    /// Empty when the producer did not name a subtopic.
    pub subtopic: String,
    pub payload: Bytes,
    /// Position in the per-topic enqueue order. Breaks `available_at` ties.
    pub sequence: u64,
    pub available_at: DateTime<Utc>,
    pub state: MessageState,
    pub lease_token: Option<LeaseToken>,
    pub lease_expiry: Option<DateTime<Utc>>,
    /// Number of redeliveries so far.
    pub retry_count: u32,
    pub dedupe_key: Option<String>,
    pub producer: Option<String>,
    pub leased_by: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    /// Set when the message reaches `Acked` or `Dead`.
    pub finalized_at: Option<DateTime<Utc>>,
    /// Incremented by every successful conditional update.
    pub version: u64,
}

impl Message {
    /// A leased message whose lease ran out before `now`.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == MessageState::Leased && self.lease_expiry.is_some_and(|expiry| expiry < now)
    }

    /// Whether a poller may lease this message at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            MessageState::Available => self.available_at <= now,
            MessageState::Leased => self.lease_expired(now),
            MessageState::Acked | MessageState::Dead => false,
        }
    }

    /// The state as observed by readers, with lazily expired leases reported
    /// as available.
    pub fn effective_state(&self, now: DateTime<Utc>) -> MessageState {
        if self.lease_expired(now) {
            MessageState::Available
        } else {
            self.state
        }
    }

    /// Whether `token` currently authorizes an ack or release.
    pub fn lease_valid_for(&self, token: &LeaseToken, now: DateTime<Utc>) -> bool {
        self.state == MessageState::Leased
            && self.lease_token.as_ref() == Some(token)
            && self.lease_expiry.is_some_and(|expiry| now <= expiry)
    }

    /// Copy of this record with the version bumped, ready to be mutated and
    /// swapped in.
    pub(crate) fn next_version(&self) -> Self {
        let mut next = self.clone();
        next.version += 1;
        next
    }
}

/// Read-only projection of a message returned by direct lookups.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageView {
    pub message_id: MessageId,
    pub topic: String,
    pub subtopic: String,
    pub payload: String,
    pub state: MessageState,
    pub retry_count: u32,
    pub available_at: DateTime<Utc>,
    pub lease_expiry: Option<DateTime<Utc>>,
    pub leased_by: Option<String>,
    pub producer: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl MessageView {
    pub fn new(message: &Message, now: DateTime<Utc>) -> Self {
        let state = message.effective_state(now);
        let leased = state == MessageState::Leased;
        Self {
            message_id: message.id,
            topic: message.topic.clone(),
            subtopic: message.subtopic.clone(),
            payload: String::from_utf8_lossy(&message.payload).into_owned(),
            state,
            retry_count: message.retry_count,
            available_at: message.available_at,
            lease_expiry: message.lease_expiry.filter(|_| leased),
            leased_by: message.leased_by.clone().filter(|_| leased),
            producer: message.producer.clone(),
            enqueued_at: message.enqueued_at,
            finalized_at: message.finalized_at,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::TimeDelta;

    use super::*;

    pub(crate) fn available(topic: &str, sequence: u64, at: DateTime<Utc>) -> Message {
        Message {
            id: MessageId::new(),
            topic: topic.to_owned(),
            subtopic: String::new(),
            payload: Bytes::from_static(b"payload"),
            sequence,
            available_at: at,
            state: MessageState::Available,
            lease_token: None,
            lease_expiry: None,
            retry_count: 0,
            dedupe_key: None,
            producer: None,
            leased_by: None,
            enqueued_at: at,
            finalized_at: None,
            version: 0,
        }
    }

    fn leased_until(expiry: DateTime<Utc>) -> Message {
        let mut message = available("t", 1, expiry - TimeDelta::seconds(60));
        message.state = MessageState::Leased;
        message.lease_token = Some(LeaseToken::new("tok"));
        message.lease_expiry = Some(expiry);
        message
    }

    #[test]
    fn test_delayed_message_is_not_eligible_early() {
        let now = Utc::now();
        let message = available("t", 1, now + TimeDelta::seconds(5));

        assert!(!message.is_eligible(now));
        assert!(message.is_eligible(now + TimeDelta::seconds(5)));
    }

    #[test]
    fn test_expired_lease_reads_as_available() {
        let now = Utc::now();
        let message = leased_until(now);

        // Expiry is inclusive for the holder and exclusive for pollers.
        assert_eq!(message.effective_state(now), MessageState::Leased);
        assert!(!message.is_eligible(now));
        assert!(message.lease_valid_for(&LeaseToken::new("tok"), now));

        let later = now + TimeDelta::milliseconds(1);
        assert_eq!(message.effective_state(later), MessageState::Available);
        assert!(message.is_eligible(later));
        assert!(!message.lease_valid_for(&LeaseToken::new("tok"), later));
    }

    #[test]
    fn test_wrong_token_is_not_valid() {
        let now = Utc::now();
        let message = leased_until(now + TimeDelta::seconds(30));

        assert!(!message.lease_valid_for(&LeaseToken::new("other"), now));
    }

    #[test]
    fn test_terminal_states_never_eligible() {
        let now = Utc::now();
        for state in [MessageState::Acked, MessageState::Dead] {
            let mut message = available("t", 1, now - TimeDelta::seconds(1));
            message.state = state;
            assert!(state.is_terminal());
            assert!(!message.is_eligible(now));
        }
    }

    #[test]
    fn test_state_string_roundtrip_matches_storage_names() {
        assert_eq!(MessageState::Leased.to_string(), "leased");
        assert_eq!(
            "dead".parse::<MessageState>().unwrap(),
            MessageState::Dead
        );
    }

    #[test]
    fn test_lease_token_debug_is_redacted() {
        assert_eq!(format!("{:?}", LeaseToken::new("secret")), "LeaseToken(..)");
    }
}
