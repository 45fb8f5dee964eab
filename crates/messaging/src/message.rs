use std::cmp::Ordering;

use homelink_storage::{ConversationId, HighWaterMark, MessageId, MessageRecord, ParticipantId};

/// Client-local identifier for a message the server has not confirmed yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TentativeId(pub u64);

impl TentativeId {
    /// Creates a typed tentative message identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Identifier for one live channel session.
///
/// A new session is minted on every `select_active`, so events from a closed channel
/// can be recognised even when the same conversation is reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChannelSessionId(pub u64);

impl ChannelSessionId {
    /// Creates a typed channel session identifier.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }
}

/// Routing key used for stale-event rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelTarget {
    pub conversation_id: ConversationId,
    pub session_id: ChannelSessionId,
}

impl ChannelTarget {
    /// Builds the routing key for one session of one conversation.
    pub const fn new(conversation_id: ConversationId, session_id: ChannelSessionId) -> Self {
        Self {
            conversation_id,
            session_id,
        }
    }
}

/// Delivery lifecycle of a tentative message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryState {
    Pending,
    Failed(String),
}

/// Optimistic local copy of an outgoing message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TentativeMessage {
    pub tentative_id: TentativeId,
    pub conversation_id: ConversationId,
    pub sender_id: ParticipantId,
    pub body: String,
    /// Local clock; only used to place the entry until the server timestamp arrives.
    pub created_at_unix_millis: u64,
    pub state: DeliveryState,
}

impl TentativeMessage {
    /// A freshly composed message that has not been written yet.
    pub fn pending(
        tentative_id: TentativeId,
        conversation_id: ConversationId,
        sender_id: ParticipantId,
        body: impl Into<String>,
        created_at_unix_millis: u64,
    ) -> Self {
        Self {
            tentative_id,
            conversation_id,
            sender_id,
            body: body.into(),
            created_at_unix_millis,
            state: DeliveryState::Pending,
        }
    }

    /// Whether the last write failed and the entry is waiting for a user retry.
    pub fn is_failed(&self) -> bool {
        matches!(self.state, DeliveryState::Failed(_))
    }
}

/// One row of a conversation timeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Tentative(TentativeMessage),
    Confirmed(MessageRecord),
}

impl Entry {
    /// Message text, identical for both kinds.
    pub fn body(&self) -> &str {
        match self {
            Self::Tentative(message) => &message.body,
            Self::Confirmed(record) => &record.body,
        }
    }

    pub fn sender_id(&self) -> ParticipantId {
        match self {
            Self::Tentative(message) => message.sender_id,
            Self::Confirmed(record) => record.sender_id,
        }
    }

    /// Server timestamp for confirmed entries, local placement time for tentative ones.
    pub fn created_at_unix_millis(&self) -> u64 {
        match self {
            Self::Tentative(message) => message.created_at_unix_millis,
            Self::Confirmed(record) => record.created_at_unix_millis,
        }
    }

    /// The persisted record, if the server has confirmed this entry.
    pub fn confirmed(&self) -> Option<&MessageRecord> {
        match self {
            Self::Confirmed(record) => Some(record),
            Self::Tentative(_) => None,
        }
    }

    /// The local copy, while the entry is still pending or failed.
    pub fn tentative(&self) -> Option<&TentativeMessage> {
        match self {
            Self::Tentative(message) => Some(message),
            Self::Confirmed(_) => None,
        }
    }

    /// Server id; `None` until confirmed.
    pub fn message_id(&self) -> Option<MessageId> {
        self.confirmed().map(|record| record.id)
    }

    pub fn tentative_id(&self) -> Option<TentativeId> {
        self.tentative().map(|message| message.tentative_id)
    }

    pub(crate) fn sort_key(&self) -> EntryKey {
        match self {
            Self::Confirmed(record) => EntryKey::Confirmed(record.order_key()),
            Self::Tentative(message) => {
                EntryKey::Tentative(message.created_at_unix_millis, message.tentative_id)
            }
        }
    }
}

/// Shared sort key for both entry kinds.
///
/// Timestamps compare first; at equal timestamps confirmed messages sort before
/// tentative ones, then each kind breaks ties on its own id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryKey {
    Confirmed(HighWaterMark),
    Tentative(u64, TentativeId),
}

impl EntryKey {
    fn timestamp(&self) -> u64 {
        match self {
            Self::Confirmed(mark) => mark.created_at_unix_millis,
            Self::Tentative(created_at, _) => *created_at,
        }
    }
}

impl PartialOrd for EntryKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EntryKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.timestamp()
            .cmp(&other.timestamp())
            .then_with(|| match (self, other) {
                (Self::Confirmed(left), Self::Confirmed(right)) => {
                    left.message_id.cmp(&right.message_id)
                }
                (Self::Tentative(_, left), Self::Tentative(_, right)) => left.cmp(right),
                (Self::Confirmed(_), Self::Tentative(..)) => Ordering::Less,
                (Self::Tentative(..), Self::Confirmed(_)) => Ordering::Greater,
            })
    }
}

/// Result of offering a confirmed message to a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    DuplicateIgnored,
    /// The message belongs to a different conversation than the store.
    ForeignIgnored,
}
