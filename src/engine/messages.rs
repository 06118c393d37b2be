use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};

use crate::{
    clock::offset,
    error::Error,
    message::{LeaseToken, Message, MessageId, MessageState},
    store::{Created, Store},
    topic::{validate_name, TopicKey, MAX_NAME_LEN},
};

/// A message to add to a topic.
#[derive(Debug, Clone, bon::Builder)]
pub struct Enqueue {
    #[builder(into)]
    pub topic: String,
    #[builder(into, default)]
    pub subtopic: String,
    #[builder(into)]
    pub payload: Bytes,
    /// Time before the message becomes deliverable.
    #[builder(default = TimeDelta::zero())]
    pub delay: TimeDelta,
    /// Makes the enqueue idempotent within the dedupe retention window.
    #[builder(into)]
    pub dedupe_key: Option<String>,
    #[builder(into)]
    pub producer: Option<String>,
}

/// Bounds applied to every enqueue.
#[derive(Debug, Clone, Copy)]
pub struct MessageLimits {
    pub max_payload_bytes: usize,
    pub max_delay: TimeDelta,
    /// How long a dedupe key keeps pointing at its message.
    pub dedupe_retention: TimeDelta,
}

impl Default for MessageLimits {
    fn default() -> Self {
        Self {
            max_payload_bytes: 256 * 1024,
            max_delay: TimeDelta::minutes(15),
            dedupe_retention: TimeDelta::minutes(5),
        }
    }
}

/// What a lease attempt should write.
#[derive(Debug, Clone)]
pub struct LeaseTerms {
    pub token: LeaseToken,
    pub expiry: DateTime<Utc>,
    pub consumer: Option<String>,
    /// Retry budget of the message's topic, consulted when the attempt
    /// redelivers an expired lease.
    pub max_retry_count: u32,
}

/// Outcome of [`MessageStore::try_lease`].
#[derive(Debug, Clone)]
pub enum LeaseAttempt {
    /// The caller now holds the lease described by the record.
    Leased(Message),
    /// The record was an expired lease with no retries left and has been
    /// moved to `Dead` instead.
    DeadLettered(Message),
    /// The record was no longer eligible or another writer got there first.
    Lost,
}

/// Message records and their lifecycle transitions.
///
/// Every transition reads a record, derives the next version and swaps it in
/// conditionally. A failed swap means a concurrent writer won; nothing is
/// retried here.
#[derive(Clone)]
pub struct MessageStore {
    store: Arc<dyn Store>,
    limits: MessageLimits,
}

impl MessageStore {
    pub fn new(store: Arc<dyn Store>, limits: MessageLimits) -> Self {
        Self { store, limits }
    }

    pub fn limits(&self) -> &MessageLimits {
        &self.limits
    }

    fn validate(&self, request: &Enqueue) -> Result<(), Error> {
        TopicKey::new(request.topic.as_str(), request.subtopic.as_str()).validate()?;

        if request.payload.len() > self.limits.max_payload_bytes {
            return Err(Error::PayloadTooLarge {
                size: request.payload.len(),
                limit: self.limits.max_payload_bytes,
            });
        }

        if request.delay < TimeDelta::zero() {
            return Err(Error::validation("delay must not be negative"));
        }
        if request.delay > self.limits.max_delay {
            return Err(Error::validation(format!(
                "delay must be at most {} seconds",
                self.limits.max_delay.num_seconds()
            )));
        }

        if let Some(key) = &request.dedupe_key {
            validate_name("dedupe_key", key)?;
        }
        if let Some(producer) = &request.producer {
            if producer.len() > MAX_NAME_LEN {
                return Err(Error::validation(format!(
                    "producer_name must be at most {MAX_NAME_LEN} bytes"
                )));
            }
        }

        Ok(())
    }

    /// Stores a new `Available` message and returns its id. A dedupe key
    /// that is still claimed returns the id of the message holding the claim
    /// and stores nothing.
    #[tracing::instrument(skip_all, fields(topic = %request.topic, subtopic = %request.subtopic))]
    pub async fn enqueue(&self, request: Enqueue, now: DateTime<Utc>) -> Result<MessageId, Error> {
        self.validate(&request)?;

        let available_at = offset(now, request.delay, "delay")?;
        let dedupe_expires_at = now
            .checked_add_signed(self.limits.dedupe_retention)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let sequence = self.store.next_sequence(&request.topic).await?;

        let message = Message {
            id: MessageId::new(),
            topic: request.topic,
            subtopic: request.subtopic,
            payload: request.payload,
            sequence,
            available_at,
            state: MessageState::Available,
            lease_token: None,
            lease_expiry: None,
            retry_count: 0,
            dedupe_key: request.dedupe_key,
            producer: request.producer,
            leased_by: None,
            enqueued_at: now,
            finalized_at: None,
            version: 0,
        };

        match self
            .store
            .create_message(&message, dedupe_expires_at)
            .await?
        {
            Created::New => {
                tracing::debug!(message_id = %message.id, sequence, "Enqueued message");
                Ok(message.id)
            }
            Created::Duplicate(existing) => {
                tracing::debug!(message_id = %existing, "Dedupe key already claimed");
                Ok(existing)
            }
        }
    }

    pub async fn get(&self, id: MessageId) -> Result<Message, Error> {
        self.store
            .get_message(id)
            .await?
            .ok_or_else(|| Error::message_not_found(id))
    }

    /// Leases `record` if it is still eligible at `now`.
    ///
    /// Redelivering an expired lease counts as a retry. When that retry would
    /// exceed `terms.max_retry_count` the record is dead-lettered instead.
    pub async fn try_lease(
        &self,
        record: &Message,
        terms: LeaseTerms,
        now: DateTime<Utc>,
    ) -> Result<LeaseAttempt, Error> {
        if !record.is_eligible(now) {
            return Ok(LeaseAttempt::Lost);
        }

        let mut next = record.next_version();

        if record.lease_expired(now) {
            next.retry_count += 1;

            if next.retry_count > terms.max_retry_count {
                next.state = MessageState::Dead;
                next.lease_token = None;
                next.lease_expiry = None;
                next.leased_by = None;
                next.finalized_at = Some(now);

                return Ok(if self.store.compare_and_swap(record, &next).await? {
                    LeaseAttempt::DeadLettered(next)
                } else {
                    LeaseAttempt::Lost
                });
            }
        }

        next.state = MessageState::Leased;
        next.lease_token = Some(terms.token);
        next.lease_expiry = Some(terms.expiry);
        next.leased_by = terms.consumer;

        Ok(if self.store.compare_and_swap(record, &next).await? {
            LeaseAttempt::Leased(next)
        } else {
            LeaseAttempt::Lost
        })
    }

    /// Marks a leased message `Acked`. Requires the current token and an
    /// unexpired lease.
    pub async fn try_ack(
        &self,
        id: MessageId,
        token: &LeaseToken,
        now: DateTime<Utc>,
    ) -> Result<Message, Error> {
        let record = self.get(id).await?;

        if !record.lease_valid_for(token, now) {
            return Err(Error::stale_token(id));
        }

        let mut next = record.next_version();
        next.state = MessageState::Acked;
        next.lease_token = None;
        next.lease_expiry = None;
        next.finalized_at = Some(now);

        if !self.store.compare_and_swap(&record, &next).await? {
            return Err(Error::stale_token(id));
        }

        Ok(next)
    }

    /// Ends the lease on `record`, counting one retry. The message becomes
    /// available again `retry_after` from now, or `Dead` when `to_dead` is set.
    pub async fn try_release(
        &self,
        record: &Message,
        to_dead: bool,
        retry_after: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<Message, Error> {
        if record.state != MessageState::Leased {
            return Err(Error::stale_token(record.id));
        }

        let mut next = record.next_version();
        next.retry_count += 1;
        next.lease_token = None;
        next.lease_expiry = None;
        next.leased_by = None;

        if to_dead {
            next.state = MessageState::Dead;
            next.finalized_at = Some(now);
        } else {
            next.state = MessageState::Available;
            next.available_at = offset(now, retry_after, "retry_after")?;
        }

        if !self.store.compare_and_swap(record, &next).await? {
            return Err(Error::stale_token(record.id));
        }

        Ok(next)
    }
}
