pub mod error;
pub mod feed;
pub mod ids;
pub mod sqlite;
pub mod types;

use futures::future::BoxFuture;

pub use error::{StorageError, StorageResult};
pub use feed::{DEFAULT_FEED_CAPACITY, FeedHub, FeedSubscription};
pub use ids::{ConversationId, MessageId, ParticipantId};
pub use sqlite::SqliteStorage;
pub use types::{
    ConversationDigest, ConversationRecord, HighWaterMark, MessageRecord, NewConversation,
    Participant, ParticipantRole,
};

pub trait ConversationStore: Send + Sync {
    /// Returns the existing conversation when the pair already has one.
    fn create_conversation(
        &self,
        input: NewConversation,
    ) -> BoxFuture<'_, StorageResult<ConversationRecord>>;
    fn list_conversations(
        &self,
        participant_id: ParticipantId,
    ) -> BoxFuture<'_, StorageResult<Vec<ConversationRecord>>>;
    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<Option<ConversationRecord>>>;
    fn conversation_digest(
        &self,
        conversation_id: ConversationId,
        participant_id: ParticipantId,
    ) -> BoxFuture<'_, StorageResult<ConversationDigest>>;
}

pub trait MessageLog: Send + Sync {
    fn insert_message(
        &self,
        conversation_id: ConversationId,
        sender_id: ParticipantId,
        body: String,
    ) -> BoxFuture<'_, StorageResult<MessageRecord>>;
    /// Messages strictly after `after`, ascending by `(created_at, id)`.
    fn query_messages(
        &self,
        conversation_id: ConversationId,
        after: Option<HighWaterMark>,
    ) -> BoxFuture<'_, StorageResult<Vec<MessageRecord>>>;
    /// Flips the read flag for the listed messages in one batch and returns how many changed.
    fn update_read_flags(
        &self,
        conversation_id: ConversationId,
        reader_id: ParticipantId,
        message_ids: Vec<MessageId>,
    ) -> BoxFuture<'_, StorageResult<u64>>;
}

pub trait LiveFeed: Send + Sync {
    fn subscribe(
        &self,
        conversation_id: ConversationId,
    ) -> BoxFuture<'_, StorageResult<FeedSubscription>>;
    /// Change feed across every conversation.
    fn subscribe_all(&self) -> BoxFuture<'_, StorageResult<FeedSubscription>>;
}

pub trait Storage: ConversationStore + MessageLog + LiveFeed {}

impl<T> Storage for T where T: ConversationStore + MessageLog + LiveFeed {}
