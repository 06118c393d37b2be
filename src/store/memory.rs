//! In-memory implementation of the store.
//!
//! Topic configurations live in a concurrent map, since they are read on
//! every enqueue and dequeue and only ever replaced whole. Message records,
//! counters and dedupe claims share one mutex; every operation takes it once,
//! which makes each of them trivially atomic.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use itertools::Itertools;

use super::{Created, QueueStatistics, ReapPolicy, ReapStats, Store, StoreFuture};
use crate::{
    error::Error,
    message::{Message, MessageId, MessageState},
    topic::{Topic, TopicKey},
};

struct DedupeClaim {
    message_id: MessageId,
    expires_at: DateTime<Utc>,
}

#[derive(Default)]
struct Records {
    messages: HashMap<MessageId, Message>,
    sequences: HashMap<String, u64>,
    dedupe: HashMap<(String, String), DedupeClaim>,
}

/// Thread-safe, non-durable store. Contents are lost when it is dropped.
pub struct MemoryStore {
    topics: papaya::HashMap<TopicKey, Topic>,
    records: Mutex<Records>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            topics: papaya::HashMap::new(),
            records: Mutex::new(Records::default()),
        }
    }

    fn records(&self) -> Result<MutexGuard<'_, Records>, Error> {
        self.records
            .lock()
            .map_err(|_| Error::store_unavailable("memory store lock poisoned"))
    }

    fn ready<'a, T: Send + 'a>(result: Result<T, Error>) -> StoreFuture<'a, T> {
        Box::pin(std::future::ready(result))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Store for MemoryStore {
    fn upsert_topic<'a>(&'a self, topic: &'a Topic) -> StoreFuture<'a, ()> {
        let guard = self.topics.guard();
        let mut record = topic.clone();
        if let Some(existing) = self.topics.get(&topic.key, &guard) {
            record.created_at = existing.created_at;
        }
        self.topics.insert(topic.key.clone(), record, &guard);
        Self::ready(Ok(()))
    }

    fn get_topic<'a>(&'a self, key: &'a TopicKey) -> StoreFuture<'a, Option<Topic>> {
        let guard = self.topics.guard();
        Self::ready(Ok(self.topics.get(key, &guard).cloned()))
    }

    fn list_topics(&self) -> StoreFuture<'_, Vec<Topic>> {
        let guard = self.topics.guard();
        let topics = self
            .topics
            .iter(&guard)
            .map(|(_, topic)| topic.clone())
            .sorted_by(|a, b| a.key.cmp(&b.key))
            .collect();
        Self::ready(Ok(topics))
    }

    fn next_sequence<'a>(&'a self, topic: &'a str) -> StoreFuture<'a, u64> {
        let result = self.records().map(|mut records| {
            let counter = records.sequences.entry(topic.to_owned()).or_insert(0);
            *counter += 1;
            *counter
        });
        Self::ready(result)
    }

    fn create_message<'a>(
        &'a self,
        message: &'a Message,
        dedupe_expires_at: DateTime<Utc>,
    ) -> StoreFuture<'a, Created> {
        let result = self.records().map(|mut records| {
            if let Some(key) = &message.dedupe_key {
                let claim_key = (message.topic.clone(), key.clone());
                let unexpired = records
                    .dedupe
                    .get(&claim_key)
                    .filter(|claim| claim.expires_at > message.enqueued_at)
                    .map(|claim| claim.message_id);
                if let Some(existing) = unexpired {
                    return Created::Duplicate(existing);
                }
                records.dedupe.insert(
                    claim_key,
                    DedupeClaim {
                        message_id: message.id,
                        expires_at: dedupe_expires_at,
                    },
                );
            }
            records.messages.insert(message.id, message.clone());
            Created::New
        });
        Self::ready(result)
    }

    fn get_message(&self, id: MessageId) -> StoreFuture<'_, Option<Message>> {
        let result = self
            .records()
            .map(|records| records.messages.get(&id).cloned());
        Self::ready(result)
    }

    fn compare_and_swap<'a>(
        &'a self,
        expected: &'a Message,
        new: &'a Message,
    ) -> StoreFuture<'a, bool> {
        let result = self.records().map(|mut records| {
            match records.messages.get_mut(&expected.id) {
                Some(current) if current.version == expected.version => {
                    *current = new.clone();
                    true
                }
                _ => false,
            }
        });
        Self::ready(result)
    }

    fn scan_eligible<'a>(
        &'a self,
        topic: &'a str,
        subtopic: Option<&'a str>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'a, Vec<Message>> {
        let result = self.records().map(|records| {
            records
                .messages
                .values()
                .filter(|m| m.topic == topic)
                .filter(|m| subtopic.map_or(true, |s| m.subtopic == s))
                .filter(|m| m.is_eligible(now))
                .sorted_by_key(|m| (m.available_at, m.sequence))
                .take(limit)
                .cloned()
                .collect()
        });
        Self::ready(result)
    }

    fn scan_leased<'a>(
        &'a self,
        topic: &'a str,
        subtopic: &'a str,
    ) -> StoreFuture<'a, Vec<Message>> {
        let result = self.records().map(|records| {
            records
                .messages
                .values()
                .filter(|m| m.topic == topic && m.subtopic == subtopic)
                .filter(|m| m.state == MessageState::Leased)
                .sorted_by_key(|m| (m.available_at, m.sequence))
                .cloned()
                .collect()
        });
        Self::ready(result)
    }

    fn statistics<'a>(
        &'a self,
        topic: Option<&'a str>,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, Vec<QueueStatistics>> {
        let result = self.records().map(|records| {
            let mut stats: BTreeMap<(String, String), QueueStatistics> = BTreeMap::new();
            for message in records
                .messages
                .values()
                .filter(|m| topic.map_or(true, |t| m.topic == t))
            {
                let entry = stats
                    .entry((message.topic.clone(), message.subtopic.clone()))
                    .or_insert_with(|| QueueStatistics {
                        topic: message.topic.clone(),
                        subtopic: message.subtopic.clone(),
                        ..Default::default()
                    });
                match message.effective_state(now) {
                    MessageState::Available => entry.available += 1,
                    MessageState::Leased => entry.leased += 1,
                    MessageState::Acked => entry.acked += 1,
                    MessageState::Dead => entry.dead += 1,
                }
            }
            stats.into_values().collect()
        });
        Self::ready(result)
    }

    fn reap(&self, policy: ReapPolicy) -> StoreFuture<'_, ReapStats> {
        let result = self.records().map(|mut records| {
            let mut stats = ReapStats::default();
            records.messages.retain(|_, m| {
                let expired = |cutoff: DateTime<Utc>| m.finalized_at.is_some_and(|at| at <= cutoff);
                match m.state {
                    MessageState::Acked if expired(policy.acked_before) => {
                        stats.acked += 1;
                        false
                    }
                    MessageState::Dead if expired(policy.dead_before) => {
                        stats.dead += 1;
                        false
                    }
                    _ => true,
                }
            });
            let before = records.dedupe.len();
            records
                .dedupe
                .retain(|_, claim| claim.expires_at > policy.now);
            stats.dedupe_keys = (before - records.dedupe.len()) as u64;
            stats
        });
        Self::ready(result)
    }
}
