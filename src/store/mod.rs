//! Durable store interface.
//!
//! The queue engine keeps no authoritative state of its own; every decision is
//! made against records held by a [`Store`]. The trait is the capability set
//! the engine needs from a backend:
//!
//! - record creation (topics, messages, per-topic sequence counters and dedupe
//!   claims),
//! - an atomic conditional update of a single message record
//!   ([`Store::compare_and_swap`]),
//! - an ordered scan of the messages eligible for delivery.
//!
//! Anything offering per-key compare-and-swap can implement it. Two
//! implementations ship with the crate: [`sqlite::SqliteStore`] for durable
//! deployments and [`memory::MemoryStore`] for tests and ephemeral use.

use std::{future::Future, pin::Pin};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::Error,
    message::{Message, MessageId},
    topic::{Topic, TopicKey},
};

pub mod memory;
pub mod sqlite;

pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, Error>> + Send + 'a>>;

/// Outcome of [`Store::create_message`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Created {
    /// The message was stored.
    New,
    /// An unexpired dedupe claim already exists for the message's dedupe key.
    /// Nothing was stored.
    Duplicate(MessageId),
}

/// Cut-off times for garbage collection of finalized records.
#[derive(Debug, Clone, Copy)]
pub struct ReapPolicy {
    /// Dedupe claims expiring at or before this instant are dropped.
    pub now: DateTime<Utc>,
    /// Acked messages finalized at or before this instant are deleted.
    pub acked_before: DateTime<Utc>,
    /// Dead messages finalized at or before this instant are deleted.
    pub dead_before: DateTime<Utc>,
}

/// Number of records removed by one reap pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReapStats {
    pub acked: u64,
    pub dead: u64,
    pub dedupe_keys: u64,
}

/// Message counts of one topic/subtopic pair by effective state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatistics {
    pub topic: String,
    pub subtopic: String,
    pub available: u64,
    pub leased: u64,
    pub acked: u64,
    pub dead: u64,
}

/// Storage backend for topics and messages.
///
/// Every mutating method is atomic on its own. No method spans more than one
/// message record, so implementations never need a topic-wide lock.
pub trait Store: Send + Sync + 'static {
    /// Inserts or wholly replaces a topic configuration. The original
    /// `created_at` of an existing record is kept.
    fn upsert_topic<'a>(&'a self, topic: &'a Topic) -> StoreFuture<'a, ()>;

    fn get_topic<'a>(&'a self, key: &'a TopicKey) -> StoreFuture<'a, Option<Topic>>;

    fn list_topics(&self) -> StoreFuture<'_, Vec<Topic>>;

    /// Atomically increments and returns the enqueue counter of `topic`.
    /// The first value handed out is 1.
    fn next_sequence<'a>(&'a self, topic: &'a str) -> StoreFuture<'a, u64>;

    /// Stores a new message.
    ///
    /// When the message carries a dedupe key, the store first claims
    /// `(topic, dedupe_key)` until `dedupe_expires_at`. A claim that has not
    /// expired by `message.enqueued_at` wins, and the id it points at is
    /// returned instead.
    fn create_message<'a>(
        &'a self,
        message: &'a Message,
        dedupe_expires_at: DateTime<Utc>,
    ) -> StoreFuture<'a, Created>;

    fn get_message(&self, id: MessageId) -> StoreFuture<'_, Option<Message>>;

    /// Replaces `expected` with `new` if, and only if, the stored record still
    /// has `expected.version`. Returns whether the swap happened.
    fn compare_and_swap<'a>(
        &'a self,
        expected: &'a Message,
        new: &'a Message,
    ) -> StoreFuture<'a, bool>;

    /// Messages eligible for delivery at `now`, oldest `available_at` first
    /// and ties broken by enqueue sequence. Includes leased messages whose
    /// lease expired before `now`. `subtopic = None` spans all subtopics.
    fn scan_eligible<'a>(
        &'a self,
        topic: &'a str,
        subtopic: Option<&'a str>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'a, Vec<Message>>;

    /// Every message of the subtopic currently in the `Leased` state,
    /// expired or not.
    fn scan_leased<'a>(
        &'a self,
        topic: &'a str,
        subtopic: &'a str,
    ) -> StoreFuture<'a, Vec<Message>>;

    /// Per topic/subtopic counts by effective state at `now`.
    fn statistics<'a>(
        &'a self,
        topic: Option<&'a str>,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, Vec<QueueStatistics>>;

    /// Deletes finalized messages and dedupe claims past their retention.
    fn reap(&self, policy: ReapPolicy) -> StoreFuture<'_, ReapStats>;
}
