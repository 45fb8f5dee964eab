pub mod composer;
pub mod config;
pub mod directory;
pub mod error;
pub mod live_channel;
pub mod message;
pub mod message_store;
pub mod read_tracker;

#[cfg(test)]
pub(crate) mod test_support;

pub use composer::{Composer, OutgoingSend, SendReport, SendResolution};
pub use config::{ConfigError, MessagingSettings, SettingsStore, SharedSettings};
pub use directory::{
    Connectivity, ConversationDirectory, DirectoryEntry, DirectoryEvent, DirectoryUpdate,
    truncate_preview,
};
pub use error::{MessagingError, MessagingResult};
pub use live_channel::{
    Backoff, ChannelEnvelope, ChannelEvent, ChannelState, ChannelTransition,
    ChannelTransitionRejection, LiveChannel,
};
pub use message::{
    AppendOutcome, ChannelSessionId, ChannelTarget, DeliveryState, Entry, TentativeId,
    TentativeMessage,
};
pub use message_store::MessageStore;
pub use read_tracker::{ReadBatch, ReadReport, ReadTracker};
