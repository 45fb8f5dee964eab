use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::FutureExt;
use futures::future::BoxFuture;
use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};

use super::error::{
    ConflictSnafu, CreateSqliteDirectorySnafu, InvariantViolationSnafu, NotFoundSnafu,
    SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu, SqlitePragmaSnafu,
    SqliteQuerySnafu, StorageError, StorageResult,
};
use super::feed::{DEFAULT_FEED_CAPACITY, FeedHub, FeedSubscription};
use super::ids::{ConversationId, MessageId, ParticipantId};
use super::types::{
    ConversationDigest, ConversationRecord, HighWaterMark, MessageRecord, NewConversation,
};
use super::{ConversationStore, LiveFeed, MessageLog};

// SQLite's default bound-parameter limit is far above this; chunks keep statements short.
const READ_FLAG_CHUNK: usize = 500;

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    pool: SqlitePool,
    database_url: String,
    feed: FeedHub,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        Self::open_with_feed_capacity(database_location, DEFAULT_FEED_CAPACITY).await
    }

    pub async fn open_with_feed_capacity(
        database_location: &str,
        feed_capacity: usize,
    ) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        // A single long-lived connection keeps `:memory:` databases alive for the pool's lifetime.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;
        sqlx::query("PRAGMA busy_timeout = 5000;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-busy-timeout",
                pragma: "busy_timeout",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::info!(database_url = %database_url, "opened sqlite storage");

        Ok(Self {
            pool,
            database_url,
            feed: FeedHub::new(feed_capacity),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    pub fn feed(&self) -> &FeedHub {
        &self.feed
    }

    async fn create_conversation_inner(
        &self,
        input: NewConversation,
    ) -> StorageResult<ConversationRecord> {
        if input.homeowner_id == input.provider_id {
            return ConflictSnafu {
                stage: "conversation-create-same-participant",
                entity: "conversation",
                details: "a conversation needs two distinct participants".to_string(),
            }
            .fail();
        }

        let now = unix_timestamp_millis();
        let candidate_id = ConversationId::new_v7();

        // The pair is unique, so a concurrent creator wins and this insert becomes a no-op.
        sqlx::query(
            "INSERT INTO conversations (id, homeowner_id, provider_id, project_ref, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?) ON CONFLICT (homeowner_id, provider_id) DO NOTHING",
        )
        .bind(candidate_id.to_string())
        .bind(input.homeowner_id.to_string())
        .bind(input.provider_id.to_string())
        .bind(input.project_ref.clone())
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "conversation-create-insert",
        })?;

        let row = sqlx::query_as::<_, ConversationRow>(
            "SELECT id, homeowner_id, provider_id, project_ref, updated_at FROM conversations WHERE homeowner_id = ? AND provider_id = ?",
        )
        .bind(input.homeowner_id.to_string())
        .bind(input.provider_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "conversation-create-load",
        })?
        .context(InvariantViolationSnafu {
            stage: "conversation-create-load-missing",
            details: "conversation row missing right after insert".to_string(),
        })?;

        conversation_row_to_record(row)
    }

    async fn list_conversations_inner(
        &self,
        participant_id: ParticipantId,
    ) -> StorageResult<Vec<ConversationRecord>> {
        let rows = sqlx::query_as::<_, ConversationRow>(
            "SELECT id, homeowner_id, provider_id, project_ref, updated_at FROM conversations WHERE homeowner_id = ? OR provider_id = ? ORDER BY updated_at DESC, id DESC",
        )
        .bind(participant_id.to_string())
        .bind(participant_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "conversation-list-query",
        })?;

        rows.into_iter().map(conversation_row_to_record).collect()
    }

    async fn get_conversation_inner(
        &self,
        conversation_id: ConversationId,
    ) -> StorageResult<Option<ConversationRecord>> {
        let row = sqlx::query_as::<_, ConversationRow>(
            "SELECT id, homeowner_id, provider_id, project_ref, updated_at FROM conversations WHERE id = ?",
        )
        .bind(conversation_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "conversation-get-query",
        })?;

        row.map(conversation_row_to_record).transpose()
    }

    async fn conversation_digest_inner(
        &self,
        conversation_id: ConversationId,
        participant_id: ParticipantId,
    ) -> StorageResult<ConversationDigest> {
        self.require_conversation(conversation_id, "conversation-digest-load")
            .await?;

        let latest = sqlx::query_as::<_, MessageRow>(
            "SELECT id, conversation_id, sender_id, body, created_at, is_read FROM messages WHERE conversation_id = ? ORDER BY created_at DESC, id DESC LIMIT 1",
        )
        .bind(conversation_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "conversation-digest-latest",
        })?;

        let unread_count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ? AND sender_id <> ? AND is_read = 0",
        )
        .bind(conversation_id.to_string())
        .bind(participant_id.to_string())
        .fetch_one(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "conversation-digest-unread",
        })?;

        Ok(ConversationDigest {
            conversation_id,
            latest_message: latest.map(message_row_to_record).transpose()?,
            unread_count: i64_to_u64(unread_count, "conversation-digest-unread-count")?,
        })
    }

    async fn insert_message_inner(
        &self,
        conversation_id: ConversationId,
        sender_id: ParticipantId,
        body: String,
    ) -> StorageResult<MessageRecord> {
        let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
            stage: "message-insert-begin",
        })?;

        let conversation = sqlx::query_as::<_, ConversationRow>(
            "SELECT id, homeowner_id, provider_id, project_ref, updated_at FROM conversations WHERE id = ?",
        )
        .bind(conversation_id.to_string())
        .fetch_optional(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-insert-load-conversation",
        })?
        .context(NotFoundSnafu {
            stage: "message-insert-conversation-missing",
            entity: "conversation",
            id: conversation_id.to_string(),
        })?;
        let conversation = conversation_row_to_record(conversation)?;

        if !conversation.includes(sender_id) {
            return ConflictSnafu {
                stage: "message-insert-foreign-sender",
                entity: "message",
                details: format!("participant '{sender_id}' is not part of '{conversation_id}'"),
            }
            .fail();
        }

        let latest_created_at = sqlx::query_scalar::<_, Option<i64>>(
            "SELECT MAX(created_at) FROM messages WHERE conversation_id = ?",
        )
        .bind(conversation_id.to_string())
        .fetch_one(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-insert-latest-created-at",
        })?;

        // Wall clocks can step backwards; clamp so per-conversation timestamps never decrease.
        // A clamped insert can tie the previous `created_at`, so gap-fill falls back to `id`
        // order, which relies on `Uuid::now_v7` being monotonic within this process.
        let created_at = unix_timestamp_millis().max(latest_created_at.unwrap_or(0));
        let message_id = MessageId::new_v7();

        sqlx::query(
            "INSERT INTO messages (id, conversation_id, sender_id, body, created_at, is_read) VALUES (?, ?, ?, ?, ?, 0)",
        )
        .bind(message_id.to_string())
        .bind(conversation_id.to_string())
        .bind(sender_id.to_string())
        .bind(body.as_str())
        .bind(created_at)
        .execute(&mut *tx)
        .await
        .context(SqliteQuerySnafu {
            stage: "message-insert-apply",
        })?;

        sqlx::query("UPDATE conversations SET updated_at = MAX(updated_at, ?) WHERE id = ?")
            .bind(created_at)
            .bind(conversation_id.to_string())
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-insert-bump-conversation",
            })?;

        tx.commit().await.context(SqliteQuerySnafu {
            stage: "message-insert-commit",
        })?;

        let record = MessageRecord {
            id: message_id,
            conversation_id,
            sender_id,
            body,
            created_at_unix_millis: i64_to_u64(created_at, "message-insert-created-at")?,
            is_read: false,
        };

        let delivered = self.feed.publish(record.clone());
        tracing::debug!(
            conversation_id = %conversation_id,
            message_id = %message_id,
            subscribers = delivered,
            "published inserted message"
        );

        Ok(record)
    }

    async fn query_messages_inner(
        &self,
        conversation_id: ConversationId,
        after: Option<HighWaterMark>,
    ) -> StorageResult<Vec<MessageRecord>> {
        let rows = match after {
            Some(mark) => {
                let created_at =
                    u64_to_i64(mark.created_at_unix_millis, "message-query-after-created-at")?;
                sqlx::query_as::<_, MessageRow>(
                    "SELECT id, conversation_id, sender_id, body, created_at, is_read FROM messages WHERE conversation_id = ? AND (created_at > ? OR (created_at = ? AND id > ?)) ORDER BY created_at ASC, id ASC",
                )
                .bind(conversation_id.to_string())
                .bind(created_at)
                .bind(created_at)
                .bind(mark.message_id.to_string())
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, MessageRow>(
                    "SELECT id, conversation_id, sender_id, body, created_at, is_read FROM messages WHERE conversation_id = ? ORDER BY created_at ASC, id ASC",
                )
                .bind(conversation_id.to_string())
                .fetch_all(&self.pool)
                .await
            }
        }
        .context(SqliteQuerySnafu {
            stage: "message-query",
        })?;

        rows.into_iter().map(message_row_to_record).collect()
    }

    async fn update_read_flags_inner(
        &self,
        conversation_id: ConversationId,
        reader_id: ParticipantId,
        message_ids: Vec<MessageId>,
    ) -> StorageResult<u64> {
        let conversation = self
            .require_conversation(conversation_id, "read-flags-load-conversation")
            .await?;
        if !conversation.includes(reader_id) {
            return ConflictSnafu {
                stage: "read-flags-foreign-reader",
                entity: "conversation",
                details: format!("participant '{reader_id}' is not part of '{conversation_id}'"),
            }
            .fail();
        }

        if message_ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
            stage: "read-flags-begin",
        })?;

        let mut flipped = 0_u64;
        for chunk in message_ids.chunks(READ_FLAG_CHUNK) {
            let mut builder = QueryBuilder::<Sqlite>::new(
                "UPDATE messages SET is_read = 1 WHERE is_read = 0 AND conversation_id = ",
            );
            builder.push_bind(conversation_id.to_string());
            builder.push(" AND sender_id <> ");
            builder.push_bind(reader_id.to_string());
            builder.push(" AND id IN (");
            let mut separated = builder.separated(", ");
            for message_id in chunk {
                separated.push_bind(message_id.to_string());
            }
            separated.push_unseparated(")");

            let result = builder
                .build()
                .execute(&mut *tx)
                .await
                .context(SqliteQuerySnafu {
                    stage: "read-flags-apply",
                })?;
            flipped += result.rows_affected();
        }

        tx.commit().await.context(SqliteQuerySnafu {
            stage: "read-flags-commit",
        })?;

        Ok(flipped)
    }

    async fn require_conversation(
        &self,
        conversation_id: ConversationId,
        stage: &'static str,
    ) -> StorageResult<ConversationRecord> {
        self.get_conversation_inner(conversation_id)
            .await?
            .context(NotFoundSnafu {
                stage,
                entity: "conversation",
                id: conversation_id.to_string(),
            })
    }
}

impl ConversationStore for SqliteStorage {
    fn create_conversation(
        &self,
        input: NewConversation,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>> {
        self.create_conversation_inner(input).boxed()
    }

    fn list_conversations(
        &self,
        participant_id: ParticipantId,
    ) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>> {
        self.list_conversations_inner(participant_id).boxed()
    }

    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<ConversationRecord>>> {
        self.get_conversation_inner(conversation_id).boxed()
    }

    fn conversation_digest(
        &self,
        conversation_id: ConversationId,
        participant_id: ParticipantId,
    ) -> BoxFuture<'_, StorageResult<ConversationDigest>> {
        self.conversation_digest_inner(conversation_id, participant_id)
            .boxed()
    }
}

impl MessageLog for SqliteStorage {
    fn insert_message(
        &self,
        conversation_id: ConversationId,
        sender_id: ParticipantId,
        body: String,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        self.insert_message_inner(conversation_id, sender_id, body)
            .boxed()
    }

    fn query_messages(
        &self,
        conversation_id: ConversationId,
        after: Option<HighWaterMark>,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        self.query_messages_inner(conversation_id, after).boxed()
    }

    fn update_read_flags(
        &self,
        conversation_id: ConversationId,
        reader_id: ParticipantId,
        message_ids: Vec<MessageId>,
    ) -> BoxFuture<'_, StorageResult<u64>> {
        self.update_read_flags_inner(conversation_id, reader_id, message_ids)
            .boxed()
    }
}

impl LiveFeed for SqliteStorage {
    fn subscribe(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<FeedSubscription>> {
        let subscription = self.feed.subscribe(Some(conversation_id));
        async move { Ok(subscription) }.boxed()
    }

    fn subscribe_all(&self) -> BoxFuture<'_, StorageResult<FeedSubscription>> {
        let subscription = self.feed.subscribe(None);
        async move { Ok(subscription) }.boxed()
    }
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: String,
    homeowner_id: String,
    provider_id: String,
    project_ref: Option<String>,
    updated_at: i64,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    conversation_id: String,
    sender_id: String,
    body: String,
    created_at: i64,
    is_read: bool,
}

fn conversation_row_to_record(row: ConversationRow) -> StorageResult<ConversationRecord> {
    Ok(ConversationRecord {
        id: ConversationId::parse(&row.id)?,
        homeowner_id: ParticipantId::parse(&row.homeowner_id)?,
        provider_id: ParticipantId::parse(&row.provider_id)?,
        project_ref: row.project_ref,
        updated_at_unix_millis: i64_to_u64(row.updated_at, "conversation-row-updated-at")?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        conversation_id: ConversationId::parse(&row.conversation_id)?,
        sender_id: ParticipantId::parse(&row.sender_id)?,
        body: row.body,
        created_at_unix_millis: i64_to_u64(row.created_at, "message-row-created-at")?,
        is_read: row.is_read,
    })
}

fn unix_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_millis() as i64)
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("u64 '{value}' cannot map to sqlite i64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
