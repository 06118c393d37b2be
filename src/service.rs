use std::sync::Arc;

use chrono::{DateTime, SubsecRound, TimeDelta, Utc};

use crate::{
    clock::{Clock, SystemClock},
    config::{Config, StoreKind},
    engine::{
        AckCoordinator, Dequeue, Enqueue, LeaseManager, MessageStore, ReleaseResult,
        TopicRegistry,
    },
    error::Error,
    message::{LeaseToken, Message, MessageId, MessageView},
    store::{
        memory::MemoryStore, sqlite::SqliteStore, QueueStatistics, ReapPolicy, ReapStats, Store,
    },
    topic::{Topic, TopicConfig, TopicKey},
};

/// Entry point to the queue engine, shared by the HTTP handlers and the
/// reaper.
#[derive(Clone)]
pub struct Service {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
    config: Config,
    registry: TopicRegistry,
    messages: MessageStore,
    leases: LeaseManager,
    acks: AckCoordinator,
}

#[bon::bon]
impl Service {
    /// Opens the store selected by `config` and wires the engine over it.
    #[builder]
    pub async fn connect_with(
        config: Config,
        clock: Option<Arc<dyn Clock>>,
    ) -> eyre::Result<Self> {
        let store: Arc<dyn Store> = match config.store {
            StoreKind::Sqlite => Arc::new(SqliteStore::connect(config.db_path()).await?),
            StoreKind::Memory => Arc::new(MemoryStore::new()),
        };

        tracing::info!(store = %config.store, "Store ready");

        Ok(Self::new(
            store,
            clock.unwrap_or_else(|| Arc::new(SystemClock)),
            config,
        ))
    }
}

impl Service {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>, config: Config) -> Self {
        let registry = TopicRegistry::new(store.clone());
        let messages = MessageStore::new(store.clone(), config.message_limits());
        let leases = LeaseManager::new(store.clone(), registry.clone(), messages.clone());
        let acks = AckCoordinator::new(store.clone(), registry.clone(), messages.clone());

        Self {
            store,
            clock,
            config,
            registry,
            messages,
            leases,
            acks,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current time at the millisecond precision the stores persist.
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now().trunc_subsecs(3)
    }

    pub async fn register(&self, key: TopicKey, config: TopicConfig) -> Result<Topic, Error> {
        self.registry.register(key, config, self.now()).await
    }

    pub async fn lookup(&self, topic: &str, subtopic: &str) -> Result<Topic, Error> {
        self.registry.lookup(topic, subtopic).await
    }

    pub async fn list_topics(&self) -> Result<Vec<Topic>, Error> {
        self.registry.list().await
    }

    /// Adds a message to a registered topic.
    pub async fn enqueue(&self, request: Enqueue) -> Result<MessageId, Error> {
        TopicKey::new(request.topic.as_str(), request.subtopic.as_str()).validate()?;
        self.registry
            .lookup(&request.topic, &request.subtopic)
            .await?;

        self.messages.enqueue(request, self.now()).await
    }

    pub async fn dequeue(&self, request: Dequeue) -> Result<Vec<Message>, Error> {
        self.leases.dequeue(request, self.now()).await
    }

    pub async fn ack(&self, id: MessageId, token: &LeaseToken) -> Result<(), Error> {
        self.acks.ack(id, token, self.now()).await
    }

    /// Returns whether the message was dead-lettered.
    pub async fn unack(
        &self,
        id: MessageId,
        token: &LeaseToken,
        retry_after: Option<TimeDelta>,
    ) -> Result<bool, Error> {
        self.acks.unack(id, token, retry_after, self.now()).await
    }

    pub async fn unack_subtopic(
        &self,
        key: &TopicKey,
        retry_after: Option<TimeDelta>,
    ) -> Result<Vec<ReleaseResult>, Error> {
        self.acks.unack_subtopic(key, retry_after, self.now()).await
    }

    pub async fn get_message(&self, id: MessageId) -> Result<MessageView, Error> {
        let message = self.messages.get(id).await?;

        Ok(MessageView::new(&message, self.now()))
    }

    pub async fn statistics(&self, topic: Option<&str>) -> Result<Vec<QueueStatistics>, Error> {
        self.store.statistics(topic, self.now()).await
    }

    /// Deletes finalized messages and dedupe claims past their retention.
    #[tracing::instrument(skip_all)]
    pub async fn reap(&self) -> Result<ReapStats, Error> {
        let now = self.now();
        // A retention reaching past the earliest representable date keeps
        // everything.
        let cutoff = |retention: TimeDelta| {
            now.checked_sub_signed(retention)
                .unwrap_or(DateTime::<Utc>::MIN_UTC)
        };
        let policy = ReapPolicy {
            now,
            acked_before: cutoff(self.config.dedupe_retention()),
            dead_before: cutoff(self.config.dead_letter_retention()),
        };

        self.store.reap(policy).await
    }
}
