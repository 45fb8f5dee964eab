#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use homelink_messaging::{ConversationDirectory, DirectoryUpdate, MessagingSettings, SharedSettings};
use homelink_storage::{
    ConversationDigest, ConversationId, ConversationRecord, ConversationStore, FeedSubscription,
    HighWaterMark, LiveFeed, MessageId, MessageLog, MessageRecord, NewConversation,
    ParticipantId, SqliteStorage, StorageError, StorageResult,
};

pub const UPDATE_TIMEOUT: Duration = Duration::from_secs(5);

/// SQLite backend with switches that simulate a dropped network.
pub struct FlakyStorage {
    pub inner: SqliteStorage,
    offline_writes: AtomicBool,
    failing_subscribes: AtomicU32,
    failing_queries: AtomicU32,
}

impl FlakyStorage {
    pub async fn open() -> Arc<Self> {
        let inner = MessagingSettings {
            database_path: Some(PathBuf::from(":memory:")),
            ..fast_messaging_settings()
        }
        .open_storage()
        .await
        .expect("in-memory sqlite should open");
        Arc::new(Self {
            inner,
            offline_writes: AtomicBool::new(false),
            failing_subscribes: AtomicU32::new(0),
            failing_queries: AtomicU32::new(0),
        })
    }

    pub fn set_offline_writes(&self, offline: bool) {
        self.offline_writes.store(offline, Ordering::SeqCst);
    }

    /// The next `count` subscribe calls fail.
    pub fn fail_next_subscribes(&self, count: u32) {
        self.failing_subscribes.store(count, Ordering::SeqCst);
    }

    /// The next `count` message queries fail.
    pub fn fail_next_queries(&self, count: u32) {
        self.failing_queries.store(count, Ordering::SeqCst);
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |remaining| {
                remaining.checked_sub(1)
            })
            .is_ok()
    }
}

fn outage(stage: &'static str) -> StorageError {
    StorageError::InvariantViolation {
        stage,
        details: "simulated network outage".to_string(),
    }
}

impl ConversationStore for FlakyStorage {
    fn create_conversation(
        &self,
        input: NewConversation,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>> {
        self.inner.create_conversation(input)
    }

    fn list_conversations(
        &self,
        participant_id: ParticipantId,
    ) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>> {
        self.inner.list_conversations(participant_id)
    }

    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<ConversationRecord>>> {
        self.inner.get_conversation(conversation_id)
    }

    fn conversation_digest(
        &self,
        conversation_id: ConversationId,
        participant_id: ParticipantId,
    ) -> BoxFuture<'_, StorageResult<ConversationDigest>> {
        self.inner.conversation_digest(conversation_id, participant_id)
    }
}

impl MessageLog for FlakyStorage {
    fn insert_message(
        &self,
        conversation_id: ConversationId,
        sender_id: ParticipantId,
        body: String,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        if self.offline_writes.load(Ordering::SeqCst) {
            return async { Err(outage("flaky-insert-message")) }.boxed();
        }
        self.inner.insert_message(conversation_id, sender_id, body)
    }

    fn query_messages(
        &self,
        conversation_id: ConversationId,
        after: Option<HighWaterMark>,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        if Self::take_failure(&self.failing_queries) {
            return async { Err(outage("flaky-query-messages")) }.boxed();
        }
        self.inner.query_messages(conversation_id, after)
    }

    fn update_read_flags(
        &self,
        conversation_id: ConversationId,
        reader_id: ParticipantId,
        message_ids: Vec<MessageId>,
    ) -> BoxFuture<'_, StorageResult<u64>> {
        self.inner
            .update_read_flags(conversation_id, reader_id, message_ids)
    }
}

impl LiveFeed for FlakyStorage {
    fn subscribe(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<FeedSubscription>> {
        if Self::take_failure(&self.failing_subscribes) {
            return async { Err(outage("flaky-subscribe")) }.boxed();
        }
        self.inner.subscribe(conversation_id)
    }

    fn subscribe_all(&self) -> BoxFuture<'_, StorageResult<FeedSubscription>> {
        self.inner.subscribe_all()
    }
}

pub struct Pair {
    pub conversation: ConversationRecord,
    pub homeowner_id: ParticipantId,
    pub provider_id: ParticipantId,
}

pub async fn seed_pair(storage: &FlakyStorage) -> Pair {
    let homeowner_id = ParticipantId::new_v7();
    let provider_id = ParticipantId::new_v7();
    let conversation = storage
        .create_conversation(NewConversation {
            homeowner_id,
            provider_id,
            project_ref: Some("kitchen-remodel".to_string()),
        })
        .await
        .expect("conversation should be created");
    Pair {
        conversation,
        homeowner_id,
        provider_id,
    }
}

pub async fn insert(
    storage: &FlakyStorage,
    conversation_id: ConversationId,
    sender_id: ParticipantId,
    body: &str,
) -> MessageRecord {
    storage
        .insert_message(conversation_id, sender_id, body.to_string())
        .await
        .expect("message should insert")
}

pub fn fast_messaging_settings() -> MessagingSettings {
    MessagingSettings {
        backoff_initial_ms: 100,
        backoff_multiplier: 2.0,
        backoff_ceiling_ms: 400,
        unavailable_after_attempts: 3,
        feed_capacity: 64,
        ..MessagingSettings::default()
    }
}

pub fn fast_settings() -> SharedSettings {
    SharedSettings::new(fast_messaging_settings())
}

pub async fn directory_for(
    storage: &Arc<FlakyStorage>,
    participant_id: ParticipantId,
) -> ConversationDirectory {
    let mut directory =
        ConversationDirectory::new(participant_id, storage.clone(), fast_settings());
    directory.load().await.expect("directory should load");
    directory
}

/// Pulls updates until `accept` returns true, failing the test after [`UPDATE_TIMEOUT`].
pub async fn wait_for<F>(directory: &mut ConversationDirectory, mut accept: F) -> DirectoryUpdate
where
    F: FnMut(&DirectoryUpdate) -> bool,
{
    tokio::time::timeout(UPDATE_TIMEOUT, async {
        loop {
            let update = directory
                .next_update()
                .await
                .expect("directory queue never closes while it is alive");
            if accept(&update) {
                return update;
            }
        }
    })
    .await
    .expect("expected update did not arrive in time")
}

pub fn bodies(directory: &ConversationDirectory) -> Vec<String> {
    directory
        .active_snapshot()
        .unwrap_or_default()
        .iter()
        .map(|entry| entry.body().to_string())
        .collect()
}
