use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, TimeDelta, Utc};

use super::{
    messages::{LeaseAttempt, LeaseTerms, MessageStore},
    registry::TopicRegistry,
};
use crate::{
    clock::offset,
    error::Error,
    message::{LeaseToken, Message},
    store::Store,
    topic::{validate_name, TopicConfig},
};

/// A poll for work.
#[derive(Debug, Clone, bon::Builder)]
pub struct Dequeue {
    #[builder(into)]
    pub topic: String,
    /// `None` polls every subtopic of the topic.
    #[builder(into)]
    pub subtopic: Option<String>,
    /// Defaults to 1, clamped to the topic's `max_batch_size`.
    pub batch_size: Option<u32>,
    /// Defaults to the topic's `default_visibility_timeout`.
    pub visibility_timeout: Option<TimeDelta>,
    #[builder(into)]
    pub consumer: Option<String>,
}

/// Hands out leases on eligible messages, oldest first.
#[derive(Clone)]
pub struct LeaseManager {
    store: Arc<dyn Store>,
    registry: TopicRegistry,
    messages: MessageStore,
}

impl LeaseManager {
    pub fn new(store: Arc<dyn Store>, registry: TopicRegistry, messages: MessageStore) -> Self {
        Self {
            store,
            registry,
            messages,
        }
    }

    /// Leases up to the requested batch of eligible messages.
    ///
    /// Candidates are taken in `available_at` order, ties broken by enqueue
    /// sequence. A candidate claimed by a concurrent poller is skipped. An
    /// empty result is a normal outcome; this never waits for new messages.
    #[tracing::instrument(skip_all, fields(topic = %request.topic, subtopic = ?request.subtopic))]
    pub async fn dequeue(
        &self,
        request: Dequeue,
        now: DateTime<Utc>,
    ) -> Result<Vec<Message>, Error> {
        validate_name("topic", &request.topic)?;
        if request.batch_size == Some(0) {
            return Err(Error::validation("batch_size must be at least 1"));
        }
        if request
            .visibility_timeout
            .is_some_and(|timeout| timeout <= TimeDelta::zero())
        {
            return Err(Error::validation("visibility_timeout must be positive"));
        }

        let subtopic = request.subtopic.as_deref();
        let topic = self
            .registry
            .lookup(&request.topic, subtopic.unwrap_or_default())
            .await?;

        let batch_size = request
            .batch_size
            .unwrap_or(1)
            .min(topic.config.max_batch_size) as usize;
        let expiry = offset(
            now,
            request
                .visibility_timeout
                .unwrap_or(topic.config.default_visibility_timeout),
            "visibility_timeout",
        )?;

        // Retry budgets are per subtopic; polling the whole topic may touch
        // several of them.
        let mut configs: HashMap<String, TopicConfig> = HashMap::new();
        if let Some(subtopic) = subtopic {
            configs.insert(subtopic.to_owned(), topic.config);
        }

        let mut leased = Vec::new();

        // A tried candidate is no longer eligible at `now`. Only a short page
        // means the topic ran dry.
        loop {
            let wanted = batch_size - leased.len();
            let candidates = self
                .store
                .scan_eligible(&request.topic, subtopic, now, wanted)
                .await?;
            let exhausted = candidates.len() < wanted;

            for candidate in candidates {
                if leased.len() == batch_size {
                    break;
                }

                let max_retry_count = match configs.get(&candidate.subtopic) {
                    Some(config) => config.max_retry_count,
                    None => {
                        let config = self
                            .registry
                            .lookup(&candidate.topic, &candidate.subtopic)
                            .await?
                            .config;
                        configs.insert(candidate.subtopic.clone(), config);
                        config.max_retry_count
                    }
                };

                let terms = LeaseTerms {
                    token: LeaseToken::generate()?,
                    expiry,
                    consumer: request.consumer.clone(),
                    max_retry_count,
                };

                match self.messages.try_lease(&candidate, terms, now).await? {
                    LeaseAttempt::Leased(message) => {
                        tracing::debug!(
                            message_id = %message.id,
                            retry_count = message.retry_count,
                            "Leased message"
                        );
                        leased.push(message);
                    }
                    LeaseAttempt::DeadLettered(message) => {
                        tracing::info!(
                            message_id = %message.id,
                            retry_count = message.retry_count,
                            "Retry budget exhausted, message dead-lettered"
                        );
                    }
                    LeaseAttempt::Lost => {
                        tracing::debug!(message_id = %candidate.id, "Lost lease race");
                    }
                }
            }

            if exhausted || leased.len() == batch_size {
                break;
            }
        }

        Ok(leased)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::{
        engine::messages::{Enqueue, MessageLimits},
        message::MessageState,
        store::memory::MemoryStore,
        topic::{TopicKey, MAX_BATCH_SIZE},
    };

    struct Fixture {
        messages: MessageStore,
        leases: LeaseManager,
    }

    async fn fixture(config: TopicConfig, now: DateTime<Utc>) -> Fixture {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let registry = TopicRegistry::new(store.clone());
        let messages = MessageStore::new(store.clone(), MessageLimits::default());

        registry
            .register(TopicKey::topic_wide("ci-jobs"), config, now)
            .await
            .unwrap();

        Fixture {
            leases: LeaseManager::new(store, registry, messages.clone()),
            messages,
        }
    }

    async fn enqueue(
        fixture: &Fixture,
        subtopic: &str,
        payload: &'static str,
        now: DateTime<Utc>,
    ) {
        fixture
            .messages
            .enqueue(
                Enqueue::builder()
                    .topic("ci-jobs")
                    .subtopic(subtopic)
                    .payload(payload)
                    .build(),
                now,
            )
            .await
            .unwrap();
    }

    fn poll(batch_size: u32) -> Dequeue {
        Dequeue::builder()
            .topic("ci-jobs")
            .batch_size(batch_size)
            .build()
    }

    #[tokio::test]
    async fn test_batch_is_clamped_and_ordered() {
        let now = Utc::now();
        let config = TopicConfig {
            max_batch_size: 2,
            ..Default::default()
        };
        let fixture = fixture(config, now).await;
        for payload in ["job-1", "job-2", "job-3"] {
            enqueue(&fixture, "", payload, now).await;
        }

        let batch = fixture.leases.dequeue(poll(10), now).await.unwrap();
        let payloads: Vec<_> = batch.iter().map(|m| m.payload.clone()).collect();
        assert_eq!(
            payloads,
            vec![Bytes::from_static(b"job-1"), Bytes::from_static(b"job-2")]
        );
        assert!(batch.iter().all(|m| m.state == MessageState::Leased));
        assert!(batch
            .iter()
            .all(|m| m.lease_expiry == Some(now + TimeDelta::seconds(30))));

        let rest = fixture.leases.dequeue(poll(10), now).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].payload, Bytes::from_static(b"job-3"));

        assert!(fixture.leases.dequeue(poll(10), now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_subtopic_filter() {
        let now = Utc::now();
        let fixture = fixture(TopicConfig::default(), now).await;
        enqueue(&fixture, "linux", "job-1", now).await;
        enqueue(&fixture, "macos", "job-2", now).await;

        let request = Dequeue::builder()
            .topic("ci-jobs")
            .subtopic("macos")
            .batch_size(10)
            .build();
        let batch = fixture.leases.dequeue(request, now).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].subtopic, "macos");

        let batch = fixture.leases.dequeue(poll(10), now).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].subtopic, "linux");
    }

    #[tokio::test]
    async fn test_dead_lettered_candidates_do_not_fill_batch() {
        let now = Utc::now();
        let config = TopicConfig {
            max_retry_count: 0,
            ..Default::default()
        };
        let fixture = fixture(config, now).await;
        enqueue(&fixture, "", "job-1", now).await;
        enqueue(&fixture, "", "job-2", now + TimeDelta::seconds(1)).await;

        let first = fixture.leases.dequeue(poll(1), now).await.unwrap();
        assert_eq!(first.len(), 1);

        // job-1's lease expired with no retries left; the poll moves on to job-2.
        let later = now + TimeDelta::seconds(31);
        let batch = fixture.leases.dequeue(poll(1), later).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, Bytes::from_static(b"job-2"));

        let dead = fixture.messages.get(first[0].id).await.unwrap();
        assert_eq!(dead.state, MessageState::Dead);
    }

    #[tokio::test]
    async fn test_poll_reaches_past_many_dead_letters() {
        let now = Utc::now();
        let config = TopicConfig {
            max_retry_count: 0,
            ..Default::default()
        };
        let fixture = fixture(config, now).await;
        for _ in 0..6 {
            enqueue(&fixture, "", "doomed", now).await;
        }
        assert_eq!(fixture.leases.dequeue(poll(10), now).await.unwrap().len(), 6);

        let later = now + TimeDelta::seconds(31);
        enqueue(&fixture, "", "fresh", later).await;

        // All six expired leases sort ahead of the fresh message and are
        // dead-lettered one page at a time before it is reached.
        let batch = fixture.leases.dequeue(poll(1), later).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].payload, Bytes::from_static(b"fresh"));
    }

    #[tokio::test]
    async fn test_batch_request_larger_than_topic_allows() {
        let now = Utc::now();
        let config = TopicConfig {
            max_batch_size: MAX_BATCH_SIZE,
            ..Default::default()
        };
        let fixture = fixture(config, now).await;
        enqueue(&fixture, "", "job-1", now).await;

        let batch = fixture.leases.dequeue(poll(u32::MAX), now).await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn test_out_of_range_visibility_timeout_is_rejected() {
        let now = Utc::now();
        let fixture = fixture(TopicConfig::default(), now).await;
        enqueue(&fixture, "", "job-1", now).await;

        let request = Dequeue::builder()
            .topic("ci-jobs")
            .visibility_timeout(TimeDelta::seconds(10_i64.pow(13)))
            .build();
        assert!(matches!(
            fixture.leases.dequeue(request, now).await,
            Err(Error::Validation { .. })
        ));

        // Nothing was leased by the rejected poll.
        assert_eq!(fixture.leases.dequeue(poll(1), now).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_invalid_polls() {
        let now = Utc::now();
        let fixture = fixture(TopicConfig::default(), now).await;

        assert!(matches!(
            fixture.leases.dequeue(poll(0), now).await,
            Err(Error::Validation { .. })
        ));

        let zero_timeout = Dequeue::builder()
            .topic("ci-jobs")
            .visibility_timeout(TimeDelta::zero())
            .build();
        assert!(matches!(
            fixture.leases.dequeue(zero_timeout, now).await,
            Err(Error::Validation { .. })
        ));

        let unknown = Dequeue::builder().topic("unknown").build();
        assert!(matches!(
            fixture.leases.dequeue(unknown, now).await,
            Err(Error::NotFound { .. })
        ));
    }
}
