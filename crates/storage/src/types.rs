use super::ids::{ConversationId, MessageId, ParticipantId};

/// Marketplace role of one side of a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ParticipantRole {
    Homeowner,
    Provider,
}

/// Identity is owned elsewhere; the messaging layer only needs a stable id and role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Participant {
    pub id: ParticipantId,
    pub role: ParticipantRole,
}

impl Participant {
    pub fn homeowner(id: ParticipantId) -> Self {
        Self {
            id,
            role: ParticipantRole::Homeowner,
        }
    }

    pub fn provider(id: ParticipantId) -> Self {
        Self {
            id,
            role: ParticipantRole::Provider,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub homeowner_id: ParticipantId,
    pub provider_id: ParticipantId,
    pub project_ref: Option<String>,
    pub updated_at_unix_millis: u64,
}

impl ConversationRecord {
    pub fn includes(&self, participant_id: ParticipantId) -> bool {
        self.homeowner_id == participant_id || self.provider_id == participant_id
    }

    /// Returns the other side of the pair, or `None` when `participant_id` is not a member.
    pub fn counterpart_of(&self, participant_id: ParticipantId) -> Option<ParticipantId> {
        if participant_id == self.homeowner_id {
            Some(self.provider_id)
        } else if participant_id == self.provider_id {
            Some(self.homeowner_id)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConversation {
    pub homeowner_id: ParticipantId,
    pub provider_id: ParticipantId,
    pub project_ref: Option<String>,
}

/// Position of one persisted message inside its conversation.
///
/// Ordering is lexicographic on `(created_at_unix_millis, message_id)`, which is the
/// total order messages are displayed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HighWaterMark {
    pub created_at_unix_millis: u64,
    pub message_id: MessageId,
}

impl HighWaterMark {
    pub fn new(created_at_unix_millis: u64, message_id: MessageId) -> Self {
        Self {
            created_at_unix_millis,
            message_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: ParticipantId,
    pub body: String,
    pub created_at_unix_millis: u64,
    // Recipient-scoped: the sender never reads their own message.
    pub is_read: bool,
}

impl MessageRecord {
    pub fn order_key(&self) -> HighWaterMark {
        HighWaterMark::new(self.created_at_unix_millis, self.id)
    }

    pub fn is_unread_for(&self, reader_id: ParticipantId) -> bool {
        !self.is_read && self.sender_id != reader_id
    }
}

/// Directory annotation for one conversation as seen by one participant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationDigest {
    pub conversation_id: ConversationId,
    pub latest_message: Option<MessageRecord>,
    pub unread_count: u64,
}
