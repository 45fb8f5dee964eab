use std::sync::{Arc, Mutex, MutexGuard};

use futures::FutureExt;
use futures::future::BoxFuture;
use homelink_storage::{
    ConversationDigest, ConversationId, ConversationRecord, ConversationStore, FeedHub,
    FeedSubscription, HighWaterMark, LiveFeed, MessageId, MessageLog, MessageRecord,
    NewConversation, ParticipantId, StorageError, StorageResult,
};

/// In-memory backend with switchable outages for unit tests.
pub(crate) struct ScriptedStorage {
    state: Mutex<ScriptedState>,
    feed: FeedHub,
}

#[derive(Default)]
struct ScriptedState {
    conversations: Vec<ConversationRecord>,
    messages: Vec<MessageRecord>,
    clock: u64,
    fail_inserts: bool,
    fail_read_flags: bool,
    failing_subscribes: u32,
    read_flag_calls: Vec<Vec<MessageId>>,
}

fn outage(stage: &'static str) -> StorageError {
    StorageError::InvariantViolation {
        stage,
        details: "scripted outage".to_string(),
    }
}

impl ScriptedStorage {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ScriptedState::default()),
            feed: FeedHub::new(16),
        })
    }

    fn state(&self) -> MutexGuard<'_, ScriptedState> {
        self.state.lock().expect("scripted state lock")
    }

    /// Creates a conversation and returns it with `(viewer, other)` participant ids.
    pub(crate) fn seed_pair(&self) -> (ConversationRecord, ParticipantId, ParticipantId) {
        let homeowner_id = ParticipantId::new_v7();
        let provider_id = ParticipantId::new_v7();
        let record = ConversationRecord {
            id: ConversationId::new_v7(),
            homeowner_id,
            provider_id,
            project_ref: None,
            updated_at_unix_millis: 0,
        };
        self.state().conversations.push(record.clone());
        (record, homeowner_id, provider_id)
    }

    pub(crate) fn insert_conversation(&self, record: ConversationRecord) {
        self.state().conversations.push(record);
    }

    /// Persists a message with the next tick of the scripted clock and publishes it.
    pub(crate) fn push_message(
        &self,
        conversation_id: ConversationId,
        sender_id: ParticipantId,
        body: &str,
    ) -> MessageRecord {
        let record = {
            let mut state = self.state();
            state.clock += 1;
            let record = MessageRecord {
                id: MessageId::new_v7(),
                conversation_id,
                sender_id,
                body: body.to_string(),
                created_at_unix_millis: state.clock,
                is_read: false,
            };
            state.messages.push(record.clone());
            let clock = state.clock;
            if let Some(conversation) = state
                .conversations
                .iter_mut()
                .find(|conversation| conversation.id == conversation_id)
            {
                conversation.updated_at_unix_millis = clock;
            }
            record
        };
        self.feed.publish(record.clone());
        record
    }

    /// Stores a record as-is, bypassing the clock and the feed.
    pub(crate) fn push_raw(&self, record: MessageRecord) {
        self.state().messages.push(record);
    }

    pub(crate) fn messages(&self, conversation_id: ConversationId) -> Vec<MessageRecord> {
        self.state()
            .messages
            .iter()
            .filter(|message| message.conversation_id == conversation_id)
            .cloned()
            .collect()
    }

    pub(crate) fn fail_inserts(&self, fail: bool) {
        self.state().fail_inserts = fail;
    }

    pub(crate) fn fail_read_flags(&self, fail: bool) {
        self.state().fail_read_flags = fail;
    }

    pub(crate) fn fail_next_subscribes(&self, count: u32) {
        self.state().failing_subscribes = count;
    }

    pub(crate) fn read_flag_calls(&self) -> Vec<Vec<MessageId>> {
        self.state().read_flag_calls.clone()
    }
}

impl ConversationStore for ScriptedStorage {
    fn create_conversation(
        &self,
        input: NewConversation,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>> {
        async move {
            let mut state = self.state();
            let record = ConversationRecord {
                id: ConversationId::new_v7(),
                homeowner_id: input.homeowner_id,
                provider_id: input.provider_id,
                project_ref: input.project_ref,
                updated_at_unix_millis: state.clock,
            };
            state.conversations.push(record.clone());
            Ok(record)
        }
        .boxed()
    }

    fn list_conversations(
        &self,
        participant_id: ParticipantId,
    ) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>> {
        async move {
            let mut records: Vec<ConversationRecord> = self
                .state()
                .conversations
                .iter()
                .filter(|conversation| conversation.includes(participant_id))
                .cloned()
                .collect();
            records.sort_by(|left, right| {
                right
                    .updated_at_unix_millis
                    .cmp(&left.updated_at_unix_millis)
                    .then_with(|| right.id.cmp(&left.id))
            });
            Ok(records)
        }
        .boxed()
    }

    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<ConversationRecord>>> {
        async move {
            Ok(self
                .state()
                .conversations
                .iter()
                .find(|conversation| conversation.id == conversation_id)
                .cloned())
        }
        .boxed()
    }

    fn conversation_digest(
        &self,
        conversation_id: ConversationId,
        participant_id: ParticipantId,
    ) -> BoxFuture<'_, StorageResult<ConversationDigest>> {
        async move {
            let messages = self.messages(conversation_id);
            Ok(ConversationDigest {
                conversation_id,
                latest_message: messages.last().cloned(),
                unread_count: messages
                    .iter()
                    .filter(|message| message.is_unread_for(participant_id))
                    .count() as u64,
            })
        }
        .boxed()
    }
}

impl MessageLog for ScriptedStorage {
    fn insert_message(
        &self,
        conversation_id: ConversationId,
        sender_id: ParticipantId,
        body: String,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>> {
        async move {
            if self.state().fail_inserts {
                return Err(outage("scripted-insert-message"));
            }
            Ok(self.push_message(conversation_id, sender_id, &body))
        }
        .boxed()
    }

    fn query_messages(
        &self,
        conversation_id: ConversationId,
        after: Option<HighWaterMark>,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>> {
        async move {
            Ok(self
                .messages(conversation_id)
                .into_iter()
                .filter(|message| after.is_none_or(|mark| message.order_key() > mark))
                .collect())
        }
        .boxed()
    }

    fn update_read_flags(
        &self,
        conversation_id: ConversationId,
        reader_id: ParticipantId,
        message_ids: Vec<MessageId>,
    ) -> BoxFuture<'_, StorageResult<u64>> {
        async move {
            let mut state = self.state();
            state.read_flag_calls.push(message_ids.clone());
            if state.fail_read_flags {
                return Err(outage("scripted-update-read-flags"));
            }
            let mut updated = 0;
            for message in state.messages.iter_mut() {
                if message.conversation_id == conversation_id
                    && message_ids.contains(&message.id)
                    && message.is_unread_for(reader_id)
                {
                    message.is_read = true;
                    updated += 1;
                }
            }
            Ok(updated)
        }
        .boxed()
    }
}

impl LiveFeed for ScriptedStorage {
    fn subscribe(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<FeedSubscription>> {
        async move {
            let mut state = self.state();
            if state.failing_subscribes > 0 {
                state.failing_subscribes -= 1;
                return Err(outage("scripted-subscribe"));
            }
            Ok(self.feed.subscribe(Some(conversation_id)))
        }
        .boxed()
    }

    fn subscribe_all(&self) -> BoxFuture<'_, StorageResult<FeedSubscription>> {
        async move { Ok(self.feed.subscribe(None)) }.boxed()
    }
}
