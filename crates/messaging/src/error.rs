use homelink_storage::{ConversationId, MessageId, StorageError};
use snafu::Snafu;

use crate::message::TentativeId;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum MessagingError {
    #[snafu(display("message body is empty"))]
    EmptyMessage { stage: &'static str },
    #[snafu(display(
        "history for conversation '{conversation_id}' is not strictly ordered at position {position} (message '{message_id}')"
    ))]
    CorruptOrdering {
        stage: &'static str,
        conversation_id: ConversationId,
        position: usize,
        message_id: MessageId,
    },
    #[snafu(display("failed to send tentative message {tentative_id:?}: {source}"))]
    SendFailure {
        stage: &'static str,
        tentative_id: TentativeId,
        source: StorageError,
    },
    #[snafu(display(
        "live channel for conversation '{conversation_id}' unavailable after {attempts} attempts"
    ))]
    ChannelUnavailable {
        stage: &'static str,
        conversation_id: ConversationId,
        attempts: u32,
    },
    #[snafu(display("no conversation is active"))]
    NoActiveConversation { stage: &'static str },
    #[snafu(display("conversation '{conversation_id}' is not in the directory"))]
    UnknownConversation {
        stage: &'static str,
        conversation_id: ConversationId,
    },
    #[snafu(display("tentative message {tentative_id:?} is not in the store"))]
    UnknownTentative {
        stage: &'static str,
        tentative_id: TentativeId,
    },
    #[snafu(display("tentative message {tentative_id:?} is still pending and cannot be retried"))]
    RetryNotAllowed {
        stage: &'static str,
        tentative_id: TentativeId,
    },
    #[snafu(display("storage call failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
}

pub type MessagingResult<T> = Result<T, MessagingError>;
