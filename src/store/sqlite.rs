//! SQLite-backed store.
//!
//! Timestamps are persisted as Unix milliseconds. Compare-and-swap is a single
//! `UPDATE ... WHERE id = ? AND version = ?`, so SQLite's own write lock is the
//! only serialization point.

use std::{path::Path, time::Duration};

use bytes::Bytes;
use chrono::{DateTime, TimeDelta, Utc};
use sqlx::{
    prelude::FromRow,
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    SqlitePool,
};
use tokio_stream::StreamExt;
use uuid::Uuid;

use super::{Created, QueueStatistics, ReapPolicy, ReapStats, Store, StoreFuture};
use crate::{
    error::Error,
    message::{LeaseToken, Message, MessageId, MessageState},
    topic::{Topic, TopicConfig, TopicKey},
};

const MESSAGE_COLUMNS: &str = "id, topic, subtopic, payload, sequence, available_at, state, \
     lease_token, lease_expiry, retry_count, dedupe_key, producer, leased_by, enqueued_at, \
     finalized_at, version";

#[derive(Clone)]
pub struct SqliteStore {
    db: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `path` and applies pending
    /// migrations.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, Error> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .locking_mode(SqliteLockingMode::Normal)
            .busy_timeout(Duration::from_secs(5))
            .optimize_on_close(true, None)
            .auto_vacuum(SqliteAutoVacuum::Full);

        let pool = SqlitePoolOptions::new().connect_with(opts).await?;

        Self::from_pool(pool).await
    }

    pub async fn from_pool(db: SqlitePool) -> Result<Self, Error> {
        sqlx::migrate!("./migrations").run(&db).await?;

        Ok(Self { db })
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }
}

fn millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, Error> {
    DateTime::from_timestamp_millis(ms)
        .ok_or_else(|| Error::internal(eyre::eyre!("stored timestamp out of range: {ms}")))
}

#[derive(FromRow)]
struct TopicRow {
    topic: String,
    subtopic: String,
    default_visibility_timeout_ms: i64,
    max_retry_count: i64,
    max_batch_size: i64,
    created_at: i64,
    updated_at: i64,
}

impl TryFrom<TopicRow> for Topic {
    type Error = Error;

    fn try_from(row: TopicRow) -> Result<Self, Self::Error> {
        Ok(Topic {
            key: TopicKey::new(row.topic, row.subtopic),
            config: TopicConfig {
                default_visibility_timeout: TimeDelta::milliseconds(
                    row.default_visibility_timeout_ms,
                ),
                max_retry_count: u32::try_from(row.max_retry_count).map_err(Error::internal)?,
                max_batch_size: u32::try_from(row.max_batch_size).map_err(Error::internal)?,
            },
            created_at: from_millis(row.created_at)?,
            updated_at: from_millis(row.updated_at)?,
        })
    }
}

#[derive(FromRow)]
struct MessageRow {
    id: Uuid,
    topic: String,
    subtopic: String,
    payload: Vec<u8>,
    sequence: i64,
    available_at: i64,
    state: MessageState,
    lease_token: Option<String>,
    lease_expiry: Option<i64>,
    retry_count: i64,
    dedupe_key: Option<String>,
    producer: Option<String>,
    leased_by: Option<String>,
    enqueued_at: i64,
    finalized_at: Option<i64>,
    version: i64,
}

impl TryFrom<MessageRow> for Message {
    type Error = Error;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Message {
            id: MessageId::from_uuid(row.id),
            topic: row.topic,
            subtopic: row.subtopic,
            payload: Bytes::from(row.payload),
            sequence: row.sequence as u64,
            available_at: from_millis(row.available_at)?,
            state: row.state,
            lease_token: row.lease_token.map(LeaseToken::new),
            lease_expiry: row.lease_expiry.map(from_millis).transpose()?,
            retry_count: u32::try_from(row.retry_count).map_err(Error::internal)?,
            dedupe_key: row.dedupe_key,
            producer: row.producer,
            leased_by: row.leased_by,
            enqueued_at: from_millis(row.enqueued_at)?,
            finalized_at: row.finalized_at.map(from_millis).transpose()?,
            version: row.version as u64,
        })
    }
}

#[derive(FromRow)]
struct StatisticsRow {
    topic: String,
    subtopic: String,
    available: i64,
    leased: i64,
    acked: i64,
    dead: i64,
}

impl From<StatisticsRow> for QueueStatistics {
    fn from(row: StatisticsRow) -> Self {
        Self {
            topic: row.topic,
            subtopic: row.subtopic,
            available: row.available as u64,
            leased: row.leased as u64,
            acked: row.acked as u64,
            dead: row.dead as u64,
        }
    }
}

impl Store for SqliteStore {
    fn upsert_topic<'a>(&'a self, topic: &'a Topic) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            sqlx::query(
                "INSERT INTO topics (
                    topic, subtopic, default_visibility_timeout_ms, max_retry_count,
                    max_batch_size, created_at, updated_at
                ) VALUES ($1, $2, $3, $4, $5, $6, $7)
                ON CONFLICT (topic, subtopic) DO UPDATE SET
                    default_visibility_timeout_ms = excluded.default_visibility_timeout_ms,
                    max_retry_count = excluded.max_retry_count,
                    max_batch_size = excluded.max_batch_size,
                    updated_at = excluded.updated_at",
            )
            .bind(&topic.key.topic)
            .bind(&topic.key.subtopic)
            .bind(topic.config.default_visibility_timeout.num_milliseconds())
            .bind(topic.config.max_retry_count as i64)
            .bind(topic.config.max_batch_size as i64)
            .bind(millis(topic.created_at))
            .bind(millis(topic.updated_at))
            .execute(&self.db)
            .await?;

            Ok(())
        })
    }

    fn get_topic<'a>(&'a self, key: &'a TopicKey) -> StoreFuture<'a, Option<Topic>> {
        Box::pin(async move {
            sqlx::query_as::<_, TopicRow>("SELECT * FROM topics WHERE topic = $1 AND subtopic = $2")
                .bind(&key.topic)
                .bind(&key.subtopic)
                .fetch_optional(&self.db)
                .await?
                .map(Topic::try_from)
                .transpose()
        })
    }

    fn list_topics(&self) -> StoreFuture<'_, Vec<Topic>> {
        Box::pin(async move {
            let mut stream =
                sqlx::query_as::<_, TopicRow>("SELECT * FROM topics ORDER BY topic, subtopic")
                    .fetch(&self.db);

            let mut topics: Vec<Topic> = Vec::new();

            while let Some(row) = stream.next().await.transpose()? {
                topics.push(row.try_into()?);
            }

            Ok(topics)
        })
    }

    fn next_sequence<'a>(&'a self, topic: &'a str) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            let value: i64 = sqlx::query_scalar(
                "INSERT INTO sequences (topic, value) VALUES ($1, 1)
                ON CONFLICT (topic) DO UPDATE SET value = value + 1
                RETURNING value",
            )
            .bind(topic)
            .fetch_one(&self.db)
            .await?;

            Ok(value as u64)
        })
    }

    fn create_message<'a>(
        &'a self,
        message: &'a Message,
        dedupe_expires_at: DateTime<Utc>,
    ) -> StoreFuture<'a, Created> {
        Box::pin(async move {
            let mut tx = self.db.begin().await?;

            if let Some(key) = &message.dedupe_key {
                // Takes the claim unless an unexpired one exists. An expired
                // claim is overwritten in place.
                let claimed: Option<Uuid> = sqlx::query_scalar(
                    "INSERT INTO dedupe_keys (topic, dedupe_key, message_id, expires_at)
                    VALUES ($1, $2, $3, $4)
                    ON CONFLICT (topic, dedupe_key) DO UPDATE SET
                        message_id = excluded.message_id,
                        expires_at = excluded.expires_at
                    WHERE dedupe_keys.expires_at <= $5
                    RETURNING message_id",
                )
                .bind(&message.topic)
                .bind(key)
                .bind(message.id.as_uuid())
                .bind(millis(dedupe_expires_at))
                .bind(millis(message.enqueued_at))
                .fetch_optional(&mut *tx)
                .await?;

                if claimed.is_none() {
                    let existing: Uuid = sqlx::query_scalar(
                        "SELECT message_id FROM dedupe_keys WHERE topic = $1 AND dedupe_key = $2",
                    )
                    .bind(&message.topic)
                    .bind(key)
                    .fetch_one(&mut *tx)
                    .await?;

                    tx.rollback().await?;

                    return Ok(Created::Duplicate(MessageId::from_uuid(existing)));
                }
            }

            sqlx::query(&format!(
                "INSERT INTO messages ({MESSAGE_COLUMNS})
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)"
            ))
            .bind(message.id.as_uuid())
            .bind(&message.topic)
            .bind(&message.subtopic)
            .bind(message.payload.as_ref())
            .bind(message.sequence as i64)
            .bind(millis(message.available_at))
            .bind(message.state)
            .bind(message.lease_token.as_ref().map(LeaseToken::as_str))
            .bind(message.lease_expiry.map(millis))
            .bind(message.retry_count as i64)
            .bind(message.dedupe_key.as_deref())
            .bind(message.producer.as_deref())
            .bind(message.leased_by.as_deref())
            .bind(millis(message.enqueued_at))
            .bind(message.finalized_at.map(millis))
            .bind(message.version as i64)
            .execute(&mut *tx)
            .await?;

            tx.commit().await?;

            Ok(Created::New)
        })
    }

    fn get_message(&self, id: MessageId) -> StoreFuture<'_, Option<Message>> {
        Box::pin(async move {
            sqlx::query_as::<_, MessageRow>(&format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = $1"
            ))
            .bind(id.as_uuid())
            .fetch_optional(&self.db)
            .await?
            .map(Message::try_from)
            .transpose()
        })
    }

    fn compare_and_swap<'a>(
        &'a self,
        expected: &'a Message,
        new: &'a Message,
    ) -> StoreFuture<'a, bool> {
        Box::pin(async move {
            let result = sqlx::query(
                "UPDATE messages SET
                    available_at = $1,
                    state = $2,
                    lease_token = $3,
                    lease_expiry = $4,
                    retry_count = $5,
                    leased_by = $6,
                    finalized_at = $7,
                    version = $8
                WHERE id = $9 AND version = $10",
            )
            .bind(millis(new.available_at))
            .bind(new.state)
            .bind(new.lease_token.as_ref().map(LeaseToken::as_str))
            .bind(new.lease_expiry.map(millis))
            .bind(new.retry_count as i64)
            .bind(new.leased_by.as_deref())
            .bind(new.finalized_at.map(millis))
            .bind(new.version as i64)
            .bind(expected.id.as_uuid())
            .bind(expected.version as i64)
            .execute(&self.db)
            .await?;

            Ok(result.rows_affected() == 1)
        })
    }

    fn scan_eligible<'a>(
        &'a self,
        topic: &'a str,
        subtopic: Option<&'a str>,
        now: DateTime<Utc>,
        limit: usize,
    ) -> StoreFuture<'a, Vec<Message>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                WHERE topic = $1
                    AND ($2 IS NULL OR subtopic = $2)
                    AND (
                        (state = 'available' AND available_at <= $3)
                        OR (state = 'leased' AND lease_expiry < $3)
                    )
                ORDER BY available_at, sequence
                LIMIT $4"
            );
            let mut stream = sqlx::query_as::<_, MessageRow>(&sql)
                .bind(topic)
                .bind(subtopic)
                .bind(millis(now))
                .bind(i64::try_from(limit).unwrap_or(i64::MAX))
                .fetch(&self.db);

            let mut messages: Vec<Message> = Vec::new();

            while let Some(row) = stream.next().await.transpose()? {
                messages.push(row.try_into()?);
            }

            Ok(messages)
        })
    }

    fn scan_leased<'a>(
        &'a self,
        topic: &'a str,
        subtopic: &'a str,
    ) -> StoreFuture<'a, Vec<Message>> {
        Box::pin(async move {
            let sql = format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                WHERE topic = $1 AND subtopic = $2 AND state = 'leased'
                ORDER BY available_at, sequence"
            );
            let mut stream = sqlx::query_as::<_, MessageRow>(&sql)
                .bind(topic)
                .bind(subtopic)
                .fetch(&self.db);

            let mut messages: Vec<Message> = Vec::new();

            while let Some(row) = stream.next().await.transpose()? {
                messages.push(row.try_into()?);
            }

            Ok(messages)
        })
    }

    fn statistics<'a>(
        &'a self,
        topic: Option<&'a str>,
        now: DateTime<Utc>,
    ) -> StoreFuture<'a, Vec<QueueStatistics>> {
        Box::pin(async move {
            let mut stream = sqlx::query_as::<_, StatisticsRow>(
                "SELECT
                    topic,
                    subtopic,
                    SUM(CASE
                        WHEN state = 'available' THEN 1
                        WHEN state = 'leased' AND lease_expiry < $1 THEN 1
                        ELSE 0
                    END) AS available,
                    SUM(CASE WHEN state = 'leased' AND lease_expiry >= $1 THEN 1 ELSE 0 END)
                        AS leased,
                    SUM(CASE WHEN state = 'acked' THEN 1 ELSE 0 END) AS acked,
                    SUM(CASE WHEN state = 'dead' THEN 1 ELSE 0 END) AS dead
                FROM messages
                WHERE $2 IS NULL OR topic = $2
                GROUP BY topic, subtopic
                ORDER BY topic, subtopic",
            )
            .bind(millis(now))
            .bind(topic)
            .fetch(&self.db);

            let mut stats: Vec<QueueStatistics> = Vec::new();

            while let Some(row) = stream.next().await.transpose()? {
                stats.push(row.into());
            }

            Ok(stats)
        })
    }

    fn reap(&self, policy: ReapPolicy) -> StoreFuture<'_, ReapStats> {
        Box::pin(async move {
            let mut tx = self.db.begin().await?;

            let acked = sqlx::query(
                "DELETE FROM messages WHERE state = 'acked' AND finalized_at <= $1",
            )
            .bind(millis(policy.acked_before))
            .execute(&mut *tx)
            .await?
            .rows_affected();

            let dead =
                sqlx::query("DELETE FROM messages WHERE state = 'dead' AND finalized_at <= $1")
                    .bind(millis(policy.dead_before))
                    .execute(&mut *tx)
                    .await?
                    .rows_affected();

            let dedupe_keys = sqlx::query("DELETE FROM dedupe_keys WHERE expires_at <= $1")
                .bind(millis(policy.now))
                .execute(&mut *tx)
                .await?
                .rows_affected();

            tx.commit().await?;

            Ok(ReapStats {
                acked,
                dead,
                dedupe_keys,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use tempfile::TempDir;

    use super::*;
    use crate::store::conformance;

    async fn setup() -> (SqliteStore, TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::connect(dir.path().join("leasemq.db"))
            .await
            .unwrap();
        (store, dir)
    }

    #[tokio::test]
    async fn test_topics_upsert_keeps_created_at() {
        let (store, _dir) = setup().await;
        conformance::topics_upsert_keeps_created_at(&store).await;
    }

    #[tokio::test]
    async fn test_sequences_are_per_topic() {
        let (store, _dir) = setup().await;
        conformance::sequences_are_per_topic(&store).await;
    }

    #[tokio::test]
    async fn test_scan_orders_by_time_then_sequence() {
        let (store, _dir) = setup().await;
        conformance::scan_orders_by_time_then_sequence(&store).await;
    }

    #[tokio::test]
    async fn test_cas_requires_current_version() {
        let (store, _dir) = setup().await;
        conformance::cas_requires_current_version(&store).await;
    }

    #[tokio::test]
    async fn test_dedupe_claims_expire() {
        let (store, _dir) = setup().await;
        conformance::dedupe_claims_expire(&store).await;
    }

    #[tokio::test]
    async fn test_reap_respects_retention() {
        let (store, _dir) = setup().await;
        conformance::reap_respects_retention(&store).await;
    }

    #[tokio::test]
    async fn test_messages_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("leasemq.db");
        let now = DateTime::from_timestamp_millis(1_700_000_000_000).unwrap();
        let message = crate::message::tests::available("ci-jobs", 1, now);

        {
            let store = SqliteStore::connect(&path).await.unwrap();
            store.create_message(&message, now).await.unwrap();
            store.db().close().await;
        }

        let store = SqliteStore::connect(&path).await.unwrap();
        let stored = store.get_message(message.id).await.unwrap().unwrap();
        assert_eq!(stored, message);
    }
}
