use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::{
    error::Error,
    store::Store,
    topic::{Topic, TopicConfig, TopicKey},
};

/// Topic and subtopic delivery configuration.
///
/// Registration is an idempotent whole-record upsert. Changes only affect
/// future dequeues; leases already granted keep their expiry.
#[derive(Clone)]
pub struct TopicRegistry {
    store: Arc<dyn Store>,
}

impl TopicRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    #[tracing::instrument(skip_all, fields(%key))]
    pub async fn register(
        &self,
        key: TopicKey,
        config: TopicConfig,
        now: DateTime<Utc>,
    ) -> Result<Topic, Error> {
        key.validate()?;
        config.validate()?;

        let topic = Topic {
            key,
            config,
            created_at: now,
            updated_at: now,
        };

        self.store.upsert_topic(&topic).await?;

        tracing::info!(
            visibility_timeout_secs = config.default_visibility_timeout.num_seconds(),
            max_retry_count = config.max_retry_count,
            max_batch_size = config.max_batch_size,
            "Registered topic"
        );

        // Re-registration keeps the original `created_at`.
        let stored = self.store.get_topic(&topic.key).await?;

        Ok(stored.unwrap_or(topic))
    }

    /// The subtopic's own configuration if registered, otherwise the
    /// topic-wide one.
    pub async fn lookup(&self, topic: &str, subtopic: &str) -> Result<Topic, Error> {
        if !subtopic.is_empty() {
            if let Some(found) = self.store.get_topic(&TopicKey::new(topic, subtopic)).await? {
                return Ok(found);
            }
        }

        self.store
            .get_topic(&TopicKey::topic_wide(topic))
            .await?
            .ok_or_else(|| Error::topic_not_found(topic, subtopic))
    }

    pub async fn list(&self) -> Result<Vec<Topic>, Error> {
        self.store.list_topics().await
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;
    use crate::store::memory::MemoryStore;

    fn registry() -> TopicRegistry {
        TopicRegistry::new(Arc::new(MemoryStore::new()))
    }

    #[tokio::test]
    async fn test_lookup_falls_back_to_topic_wide() {
        let registry = registry();
        let now = Utc::now();

        registry
            .register(TopicKey::topic_wide("ci-jobs"), TopicConfig::default(), now)
            .await
            .unwrap();

        let linux = TopicConfig {
            max_retry_count: 9,
            ..Default::default()
        };
        registry
            .register(TopicKey::new("ci-jobs", "linux"), linux, now)
            .await
            .unwrap();

        let found = registry.lookup("ci-jobs", "linux").await.unwrap();
        assert_eq!(found.config.max_retry_count, 9);

        let found = registry.lookup("ci-jobs", "macos").await.unwrap();
        assert_eq!(found.key, TopicKey::topic_wide("ci-jobs"));
        assert_eq!(found.config, TopicConfig::default());
    }

    #[tokio::test]
    async fn test_lookup_unknown_topic() {
        let registry = registry();
        let now = Utc::now();

        registry
            .register(TopicKey::new("ci-jobs", "linux"), TopicConfig::default(), now)
            .await
            .unwrap();

        assert!(matches!(
            registry.lookup("other", "").await,
            Err(Error::NotFound { .. })
        ));
        // A subtopic registration does not make the topic-wide config exist.
        assert!(matches!(
            registry.lookup("ci-jobs", "macos").await,
            Err(Error::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_register_replaces_whole_record() {
        let registry = registry();
        let now = Utc::now();
        let key = TopicKey::topic_wide("ci-jobs");

        registry
            .register(key.clone(), TopicConfig::default(), now)
            .await
            .unwrap();

        let replacement = TopicConfig {
            default_visibility_timeout: TimeDelta::seconds(120),
            max_retry_count: 0,
            max_batch_size: 1,
        };
        registry
            .register(key.clone(), replacement, now + TimeDelta::seconds(5))
            .await
            .unwrap();

        let found = registry.lookup("ci-jobs", "").await.unwrap();
        assert_eq!(found.config, replacement);
        assert_eq!(found.created_at, now);
        assert_eq!(registry.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_register_rejects_invalid_input() {
        let registry = registry();
        let now = Utc::now();

        let result = registry
            .register(TopicKey::topic_wide(""), TopicConfig::default(), now)
            .await;
        assert!(matches!(result, Err(Error::Validation { .. })));

        let no_batch = TopicConfig {
            max_batch_size: 0,
            ..Default::default()
        };
        let result = registry
            .register(TopicKey::topic_wide("ci-jobs"), no_batch, now)
            .await;
        assert!(matches!(result, Err(Error::Validation { .. })));
        assert!(registry.list().await.unwrap().is_empty());
    }
}
