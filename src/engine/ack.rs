use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use super::{messages::MessageStore, registry::TopicRegistry};
use crate::{
    clock::offset,
    error::Error,
    message::{LeaseToken, Message, MessageId},
    store::Store,
    topic::TopicKey,
};

/// What happened to one message of a bulk release.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseStatus {
    Requeued,
    DeadLettered,
    /// Another writer changed the message first; it was left alone.
    Conflict,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseResult {
    pub message_id: MessageId,
    pub status: ReleaseStatus,
}

/// Positive and negative acknowledgement of leased messages.
#[derive(Clone)]
pub struct AckCoordinator {
    store: Arc<dyn Store>,
    registry: TopicRegistry,
    messages: MessageStore,
}

impl AckCoordinator {
    pub fn new(store: Arc<dyn Store>, registry: TopicRegistry, messages: MessageStore) -> Self {
        Self {
            store,
            registry,
            messages,
        }
    }

    /// Finalizes a leased message. A stale token means the lease expired or
    /// was reassigned and the work may already be running elsewhere.
    #[tracing::instrument(skip_all, fields(%id))]
    pub async fn ack(
        &self,
        id: MessageId,
        token: &LeaseToken,
        now: DateTime<Utc>,
    ) -> Result<(), Error> {
        self.messages.try_ack(id, token, now).await?;

        tracing::debug!("Acked message");

        Ok(())
    }

    /// Releases a leased message ahead of its expiry. Returns whether the
    /// release exhausted the retry budget and dead-lettered the message.
    #[tracing::instrument(skip_all, fields(%id))]
    pub async fn unack(
        &self,
        id: MessageId,
        token: &LeaseToken,
        retry_after: Option<TimeDelta>,
        now: DateTime<Utc>,
    ) -> Result<bool, Error> {
        let retry_after = validate_retry_after(retry_after, now)?;

        let record = self.messages.get(id).await?;
        if !record.lease_valid_for(token, now) {
            return Err(Error::stale_token(id));
        }

        let to_dead = self.exhausts_budget(&record).await?;
        let released = self
            .messages
            .try_release(&record, to_dead, retry_after, now)
            .await?;

        tracing::debug!(
            retry_count = released.retry_count,
            dead_lettered = to_dead,
            "Released message"
        );

        Ok(to_dead)
    }

    /// Releases every leased message of a subtopic, expired leases included.
    ///
    /// Messages are released one by one with no atomicity across them. A
    /// message that changed underneath is reported as a conflict and skipped.
    #[tracing::instrument(skip_all, fields(%key))]
    pub async fn unack_subtopic(
        &self,
        key: &TopicKey,
        retry_after: Option<TimeDelta>,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReleaseResult>, Error> {
        key.validate()?;
        let retry_after = validate_retry_after(retry_after, now)?;
        let max_retry_count = self
            .registry
            .lookup(&key.topic, &key.subtopic)
            .await?
            .config
            .max_retry_count;

        let leased = self.store.scan_leased(&key.topic, &key.subtopic).await?;
        let mut results = Vec::with_capacity(leased.len());

        for record in leased {
            let to_dead = record.retry_count + 1 > max_retry_count;

            let status = match self
                .messages
                .try_release(&record, to_dead, retry_after, now)
                .await
            {
                Ok(_) if to_dead => ReleaseStatus::DeadLettered,
                Ok(_) => ReleaseStatus::Requeued,
                Err(Error::StaleToken { .. }) => ReleaseStatus::Conflict,
                Err(e) => return Err(e),
            };

            results.push(ReleaseResult {
                message_id: record.id,
                status,
            });
        }

        tracing::info!(released = results.len(), "Released subtopic");

        Ok(results)
    }

    async fn exhausts_budget(&self, record: &Message) -> Result<bool, Error> {
        let topic = self.registry.lookup(&record.topic, &record.subtopic).await?;

        Ok(record.retry_count + 1 > topic.config.max_retry_count)
    }
}

fn validate_retry_after(
    retry_after: Option<TimeDelta>,
    now: DateTime<Utc>,
) -> Result<TimeDelta, Error> {
    match retry_after {
        Some(delay) if delay < TimeDelta::zero() => {
            Err(Error::validation("retry_after must not be negative"))
        }
        Some(delay) => offset(now, delay, "retry_after").map(|_| delay),
        None => Ok(TimeDelta::zero()),
    }
}
