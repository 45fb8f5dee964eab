use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use homelink_storage::{
    ConversationDigest, ConversationId, ConversationRecord, FeedSubscription, HighWaterMark,
    MessageId, MessageRecord, ParticipantId, Storage, StorageError,
};
use snafu::{OptionExt, ResultExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::composer::{Composer, SendReport, SendResolution};
use crate::config::SharedSettings;
use crate::error::{
    ChannelUnavailableSnafu, MessagingError, MessagingResult, NoActiveConversationSnafu,
    StorageSnafu, UnknownConversationSnafu,
};
use crate::live_channel::{ChannelEnvelope, ChannelEvent, ChannelState, LiveChannel};
use crate::message::{
    AppendOutcome, ChannelSessionId, ChannelTarget, DeliveryState, Entry, TentativeId,
    TentativeMessage,
};
use crate::message_store::MessageStore;
use crate::read_tracker::{ReadReport, ReadTracker};

const PREVIEW_ELLIPSIS: char = '…';

/// One row of the conversation list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub conversation: ConversationRecord,
    pub counterpart_id: Option<ParticipantId>,
    pub preview: Option<String>,
    pub unread_count: usize,
    /// Newest message already reflected in this row, used to drop change-feed repeats.
    pub latest: Option<HighWaterMark>,
}

impl DirectoryEntry {
    pub fn conversation_id(&self) -> ConversationId {
        self.conversation.id
    }

    fn from_digest(
        conversation: ConversationRecord,
        digest: ConversationDigest,
        participant_id: ParticipantId,
        preview_max_chars: usize,
    ) -> Self {
        Self {
            counterpart_id: conversation.counterpart_of(participant_id),
            preview: digest
                .latest_message
                .as_ref()
                .map(|message| truncate_preview(&message.body, preview_max_chars)),
            unread_count: usize::try_from(digest.unread_count).unwrap_or(usize::MAX),
            latest: digest.latest_message.as_ref().map(MessageRecord::order_key),
            conversation,
        }
    }
}

/// Connection status shown as a passive indicator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Connectivity {
    Inactive,
    Connecting { attempt: u32 },
    Live,
    Reconnecting { attempt: u32, retry_in: Duration },
    Unavailable { attempts: u32 },
}

/// Work delivered back to the directory from spawned tasks.
#[derive(Debug)]
pub enum DirectoryEvent {
    Channel(ChannelEnvelope),
    Activity(MessageRecord),
    ChangeFeedLagged(StorageError),
    SendCompleted(SendReport),
    ReadCompleted(ReadReport),
}

impl From<ChannelEnvelope> for DirectoryEvent {
    fn from(envelope: ChannelEnvelope) -> Self {
        Self::Channel(envelope)
    }
}

/// Something presentation code may want to re-render.
#[derive(Debug)]
pub enum DirectoryUpdate {
    MessageApplied {
        conversation_id: ConversationId,
        message_id: MessageId,
    },
    CaughtUp {
        conversation_id: ConversationId,
        replayed: usize,
    },
    EntryRefreshed {
        conversation_id: ConversationId,
    },
    EntryAdded {
        conversation_id: ConversationId,
    },
    Reloaded,
    Connectivity(Connectivity),
    ChannelUnavailable {
        error: MessagingError,
    },
    SendConfirmed(SendResolution),
    SendFailed {
        tentative_id: TentativeId,
        error: MessagingError,
    },
    ReadPersisted {
        conversation_id: ConversationId,
        updated: u64,
    },
    ReadFailed {
        conversation_id: ConversationId,
        error: MessagingError,
    },
}

struct ActiveConversation {
    store: MessageStore,
    channel: LiveChannel,
    unavailable_attempts: Option<u32>,
}

/// Conversation list for one participant plus the single active conversation.
///
/// All state changes happen through `&mut self`; I/O runs in spawned tasks that report
/// back through one queue drained by [`ConversationDirectory::next_update`].
pub struct ConversationDirectory {
    participant_id: ParticipantId,
    storage: Arc<dyn Storage>,
    settings: SharedSettings,
    entries: Vec<DirectoryEntry>,
    active: Option<ActiveConversation>,
    /// Unconfirmed sends of conversations that are not active, restored on selection.
    parked: HashMap<ConversationId, Vec<TentativeMessage>>,
    composer: Composer,
    read_tracker: ReadTracker,
    events_tx: mpsc::UnboundedSender<DirectoryEvent>,
    events_rx: mpsc::UnboundedReceiver<DirectoryEvent>,
    change_feed: Option<JoinHandle<()>>,
    next_session_id: u64,
}

impl ConversationDirectory {
    pub fn new(
        participant_id: ParticipantId,
        storage: Arc<dyn Storage>,
        settings: SharedSettings,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            participant_id,
            composer: Composer::new(Arc::clone(&storage)),
            read_tracker: ReadTracker::new(Arc::clone(&storage)),
            storage,
            settings,
            entries: Vec::new(),
            active: None,
            parked: HashMap::new(),
            events_tx,
            events_rx,
            change_feed: None,
            next_session_id: 1,
        }
    }

    pub fn participant_id(&self) -> ParticipantId {
        self.participant_id
    }

    /// Subscribes to the change feed, then lists conversations with previews and unread counts.
    pub async fn load(&mut self) -> MessagingResult<()> {
        if self.change_feed.is_none() {
            let subscription = self
                .storage
                .subscribe_all()
                .await
                .context(StorageSnafu {
                    stage: "directory-subscribe-change-feed",
                })?;
            self.change_feed = Some(tokio::spawn(pump_change_feed(
                subscription,
                self.events_tx.clone(),
            )));
        }

        let conversations = self
            .storage
            .list_conversations(self.participant_id)
            .await
            .context(StorageSnafu {
                stage: "directory-list-conversations",
            })?;

        let preview_max_chars = self.settings.current().preview_max_chars;
        let mut entries = Vec::with_capacity(conversations.len());
        for conversation in conversations {
            let digest = self
                .storage
                .conversation_digest(conversation.id, self.participant_id)
                .await
                .context(StorageSnafu {
                    stage: "directory-conversation-digest",
                })?;
            entries.push(DirectoryEntry::from_digest(
                conversation,
                digest,
                self.participant_id,
                preview_max_chars,
            ));
        }

        self.entries = entries;
        if let Some(active) = &self.active {
            let unread = ReadTracker::compute_unread_count(&active.store);
            let conversation_id = active.store.conversation_id();
            if let Some(entry) = self.entry_mut(conversation_id) {
                entry.unread_count = unread;
            }
        }
        self.sort_entries();
        tracing::info!(
            "loaded {} conversations for participant {}",
            self.entries.len(),
            self.participant_id
        );
        Ok(())
    }

    /// Closes the current channel, hydrates the target conversation, then opens its channel.
    ///
    /// If hydration fails no channel is left open.
    pub async fn select_active(&mut self, conversation_id: ConversationId) -> MessagingResult<()> {
        if self.entry(conversation_id).is_none() {
            return UnknownConversationSnafu {
                stage: "directory-select-active",
                conversation_id,
            }
            .fail();
        }

        self.close_active();

        let history = self
            .storage
            .query_messages(conversation_id, None)
            .await
            .context(StorageSnafu {
                stage: "directory-hydrate-history",
            })?;
        let mut store = MessageStore::new(conversation_id, self.participant_id);
        store.hydrate(history)?;
        for message in self.parked.remove(&conversation_id).unwrap_or_default() {
            store.insert_tentative(message);
        }

        let session_id = ChannelSessionId::new(self.next_session_id);
        self.next_session_id += 1;
        let channel = LiveChannel::open(
            ChannelTarget::new(conversation_id, session_id),
            store.high_water_mark(),
            Arc::clone(&self.storage),
            self.settings.clone(),
            self.events_tx.clone(),
        );

        let unread = ReadTracker::compute_unread_count(&store);
        if let Some(entry) = self.entry_mut(conversation_id) {
            entry.unread_count = unread;
        }
        self.active = Some(ActiveConversation {
            store,
            channel,
            unavailable_attempts: None,
        });
        tracing::info!("selected conversation {}", conversation_id);
        Ok(())
    }

    /// Closes the channel and drops the active store, keeping its unconfirmed sends.
    ///
    /// No-op when nothing is active.
    pub fn close_active(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.channel.close();
            let tentatives = active.store.take_tentatives();
            if !tentatives.is_empty() {
                self.parked
                    .entry(active.store.conversation_id())
                    .or_default()
                    .extend(tentatives);
            }
            tracing::info!(
                "closed active conversation {}",
                active.store.conversation_id()
            );
        }
    }

    /// Folds one new message into the directory row and re-sorts.
    ///
    /// The active conversation's unread count comes from its store; other rows count the
    /// message once, keyed by the row's high-water mark. Returns whether the row changed.
    pub fn refresh_after_activity(
        &mut self,
        conversation_id: ConversationId,
        message: &MessageRecord,
    ) -> bool {
        let participant_id = self.participant_id;
        let preview_max_chars = self.settings.current().preview_max_chars;
        let active_unread = self
            .active
            .as_ref()
            .filter(|active| active.store.conversation_id() == conversation_id)
            .map(|active| ReadTracker::compute_unread_count(&active.store));

        let Some(entry) = self.entry_mut(conversation_id) else {
            return false;
        };

        let key = message.order_key();
        let is_new = entry.latest.is_none_or(|latest| latest < key);
        let previous_unread = entry.unread_count;
        if is_new {
            entry.latest = Some(key);
            entry.conversation.updated_at_unix_millis = entry
                .conversation
                .updated_at_unix_millis
                .max(message.created_at_unix_millis);
            entry.preview = Some(truncate_preview(&message.body, preview_max_chars));
        }
        match active_unread {
            Some(unread) => entry.unread_count = unread,
            None if is_new && message.is_unread_for(participant_id) => entry.unread_count += 1,
            None => {}
        }
        let changed = is_new || entry.unread_count != previous_unread;

        if is_new {
            self.sort_entries();
        }
        changed
    }

    /// Shows the message as pending and writes it in the background.
    pub fn send(&mut self, body: &str) -> MessagingResult<TentativeId> {
        let active = self.active.as_mut().context(NoActiveConversationSnafu {
            stage: "directory-send",
        })?;
        let outgoing = self.composer.begin_send(&mut active.store, body)?;
        let tentative_id = outgoing.tentative_id;
        self.spawn_send(self.composer.dispatch(outgoing));
        Ok(tentative_id)
    }

    /// Re-issues a failed send. Only the user triggers this.
    pub fn retry(&mut self, tentative_id: TentativeId) -> MessagingResult<()> {
        let active = self.active.as_mut().context(NoActiveConversationSnafu {
            stage: "directory-retry",
        })?;
        let outgoing = self.composer.retry(&mut active.store, tentative_id)?;
        self.spawn_send(self.composer.dispatch(outgoing));
        Ok(())
    }

    /// Marks what is unread now and persists it in the background.
    ///
    /// Returns `false` when there was nothing to write.
    pub fn mark_active_read(&mut self) -> MessagingResult<bool> {
        let active = self.active.as_mut().context(NoActiveConversationSnafu {
            stage: "directory-mark-active-read",
        })?;
        let conversation_id = active.store.conversation_id();
        let batch = self.read_tracker.begin_mark(&mut active.store);
        let unread = ReadTracker::compute_unread_count(&active.store);
        if let Some(entry) = self.entry_mut(conversation_id) {
            entry.unread_count = unread;
        }

        let Some(batch) = batch else {
            return Ok(false);
        };
        let persist = self.read_tracker.persist(batch);
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let report = persist.await;
            if events.send(DirectoryEvent::ReadCompleted(report)).is_err() {
                tracing::error!("directory dropped before read flags were acknowledged");
            }
        });
        Ok(true)
    }

    /// Waits for the next queued event that changes something and applies it.
    pub async fn next_update(&mut self) -> Option<DirectoryUpdate> {
        loop {
            let event = self.events_rx.recv().await?;
            if let Some(update) = self.apply(event).await {
                return Some(update);
            }
        }
    }

    /// Applies every event already queued, in arrival order, without waiting for more.
    pub async fn drain_ready(&mut self) -> Vec<DirectoryUpdate> {
        let mut updates = Vec::new();
        while let Ok(event) = self.events_rx.try_recv() {
            if let Some(update) = self.apply(event).await {
                updates.push(update);
            }
        }
        updates
    }

    pub fn entries(&self) -> &[DirectoryEntry] {
        &self.entries
    }

    pub fn active_conversation(&self) -> Option<ConversationId> {
        self.active
            .as_ref()
            .map(|active| active.store.conversation_id())
    }

    pub fn active_snapshot(&self) -> Option<Vec<Entry>> {
        self.active.as_ref().map(|active| active.store.snapshot())
    }

    pub fn active_store(&self) -> Option<&MessageStore> {
        self.active.as_ref().map(|active| &active.store)
    }

    pub fn active_channel_state(&self) -> Option<ChannelState> {
        self.active.as_ref().map(|active| active.channel.state())
    }

    pub fn unread_count(&self, conversation_id: ConversationId) -> Option<usize> {
        self.entry(conversation_id).map(|entry| entry.unread_count)
    }

    pub fn total_unread(&self) -> usize {
        self.entries.iter().map(|entry| entry.unread_count).sum()
    }

    pub fn connectivity(&self) -> Connectivity {
        let Some(active) = &self.active else {
            return Connectivity::Inactive;
        };
        if let Some(attempts) = active.unavailable_attempts {
            return Connectivity::Unavailable { attempts };
        }
        match active.channel.state() {
            ChannelState::Closed => Connectivity::Inactive,
            ChannelState::Connecting { attempt } => Connectivity::Connecting { attempt },
            ChannelState::Open => Connectivity::Live,
            ChannelState::Errored { attempt, retry_in } => {
                Connectivity::Reconnecting { attempt, retry_in }
            }
        }
    }

    async fn apply(&mut self, event: DirectoryEvent) -> Option<DirectoryUpdate> {
        match event {
            DirectoryEvent::Channel(envelope) => self.apply_channel(envelope),
            DirectoryEvent::Activity(record) => self.apply_activity(record).await,
            DirectoryEvent::ChangeFeedLagged(error) => {
                tracing::warn!("change feed lagged, reloading directory: {}", error);
                match self.load().await {
                    Ok(()) => Some(DirectoryUpdate::Reloaded),
                    Err(error) => {
                        tracing::warn!("directory reload failed: {}", error);
                        None
                    }
                }
            }
            DirectoryEvent::SendCompleted(report) => self.apply_send(report),
            DirectoryEvent::ReadCompleted(report) => {
                let conversation_id = report.batch.conversation_id;
                Some(match self.read_tracker.complete(report) {
                    Ok(updated) => DirectoryUpdate::ReadPersisted {
                        conversation_id,
                        updated,
                    },
                    Err(error) => DirectoryUpdate::ReadFailed {
                        conversation_id,
                        error,
                    },
                })
            }
        }
    }

    fn apply_channel(&mut self, envelope: ChannelEnvelope) -> Option<DirectoryUpdate> {
        let Some(active) = self
            .active
            .as_mut()
            .filter(|active| active.channel.target() == envelope.target)
        else {
            tracing::debug!(
                "discarded stale channel event for {} (session {:?})",
                envelope.target.conversation_id,
                envelope.target.session_id
            );
            return None;
        };
        let conversation_id = envelope.target.conversation_id;

        match envelope.event {
            ChannelEvent::Message(record) => {
                let message_id = record.id;
                match active.store.append(record.clone()) {
                    AppendOutcome::Inserted => {
                        self.refresh_after_activity(conversation_id, &record);
                        Some(DirectoryUpdate::MessageApplied {
                            conversation_id,
                            message_id,
                        })
                    }
                    AppendOutcome::DuplicateIgnored | AppendOutcome::ForeignIgnored => None,
                }
            }
            ChannelEvent::CaughtUp { replayed } => Some(DirectoryUpdate::CaughtUp {
                conversation_id,
                replayed,
            }),
            ChannelEvent::Unavailable { attempts } => {
                active.unavailable_attempts = Some(attempts);
                Some(DirectoryUpdate::ChannelUnavailable {
                    error: ChannelUnavailableSnafu {
                        stage: "directory-channel-unavailable",
                        conversation_id,
                        attempts,
                    }
                    .build(),
                })
            }
            ChannelEvent::Recovered => {
                active.unavailable_attempts = None;
                tracing::info!("live channel for {} recovered", conversation_id);
                Some(DirectoryUpdate::Connectivity(self.connectivity()))
            }
            ChannelEvent::State(_) => Some(DirectoryUpdate::Connectivity(self.connectivity())),
        }
    }

    async fn apply_activity(&mut self, record: MessageRecord) -> Option<DirectoryUpdate> {
        let conversation_id = record.conversation_id;
        if self.entry(conversation_id).is_some() {
            return self
                .refresh_after_activity(conversation_id, &record)
                .then_some(DirectoryUpdate::EntryRefreshed { conversation_id });
        }

        // A conversation created after `load` shows up with its first message.
        let conversation = match self.storage.get_conversation(conversation_id).await {
            Ok(Some(conversation)) if conversation.includes(self.participant_id) => conversation,
            Ok(_) => return None,
            Err(error) => {
                tracing::warn!("failed to look up conversation {}: {}", conversation_id, error);
                return None;
            }
        };
        let digest = match self
            .storage
            .conversation_digest(conversation_id, self.participant_id)
            .await
        {
            Ok(digest) => digest,
            Err(error) => {
                tracing::warn!("failed to load digest for {}: {}", conversation_id, error);
                return None;
            }
        };
        if self.entry(conversation_id).is_some() {
            return None;
        }

        self.entries.push(DirectoryEntry::from_digest(
            conversation,
            digest,
            self.participant_id,
            self.settings.current().preview_max_chars,
        ));
        self.sort_entries();
        Some(DirectoryUpdate::EntryAdded { conversation_id })
    }

    fn apply_send(&mut self, report: SendReport) -> Option<DirectoryUpdate> {
        let conversation_id = report.outgoing.conversation_id;
        let tentative_id = report.outgoing.tentative_id;
        let is_active = self
            .active
            .as_ref()
            .is_some_and(|active| active.store.conversation_id() == conversation_id);
        if !is_active {
            return self.settle_parked(report);
        }
        let active = self.active.as_mut()?;

        let confirmed = report.outcome.as_ref().ok().cloned();
        match self.composer.reconcile(&mut active.store, report) {
            Ok(resolution) => {
                if let Some(record) = confirmed {
                    self.refresh_after_activity(conversation_id, &record);
                }
                Some(DirectoryUpdate::SendConfirmed(resolution))
            }
            Err(error) => Some(DirectoryUpdate::SendFailed {
                tentative_id,
                error,
            }),
        }
    }

    /// Resolves a send whose conversation was closed while the write was in flight.
    fn settle_parked(&mut self, report: SendReport) -> Option<DirectoryUpdate> {
        let conversation_id = report.outgoing.conversation_id;
        let tentative_id = report.outgoing.tentative_id;
        let parked = self.parked.entry(conversation_id).or_default();
        match report.outcome {
            Ok(record) => {
                parked.retain(|message| message.tentative_id != tentative_id);
                if parked.is_empty() {
                    self.parked.remove(&conversation_id);
                }
                tracing::debug!(
                    "send {:?} confirmed as {} after its conversation was closed",
                    tentative_id,
                    record.id
                );
                let message_id = record.id;
                self.refresh_after_activity(conversation_id, &record);
                Some(DirectoryUpdate::SendConfirmed(SendResolution {
                    tentative_id,
                    message_id,
                    append: AppendOutcome::Inserted,
                }))
            }
            Err(error) => {
                tracing::warn!(
                    "send {:?} failed after its conversation was closed: {}",
                    tentative_id,
                    error
                );
                match parked
                    .iter_mut()
                    .find(|message| message.tentative_id == tentative_id)
                {
                    Some(message) => message.state = DeliveryState::Failed(error.to_string()),
                    None => tracing::warn!("failed send {:?} has no parked entry", tentative_id),
                }
                if parked.is_empty() {
                    self.parked.remove(&conversation_id);
                }
                Some(DirectoryUpdate::SendFailed {
                    tentative_id,
                    error: MessagingError::SendFailure {
                        stage: "directory-settle-parked-send",
                        tentative_id,
                        source: error,
                    },
                })
            }
        }
    }

    fn spawn_send(&self, dispatch: futures::future::BoxFuture<'static, SendReport>) {
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let report = dispatch.await;
            if events.send(DirectoryEvent::SendCompleted(report)).is_err() {
                tracing::error!("directory dropped before a send was acknowledged");
            }
        });
    }

    fn entry(&self, conversation_id: ConversationId) -> Option<&DirectoryEntry> {
        self.entries
            .iter()
            .find(|entry| entry.conversation_id() == conversation_id)
    }

    fn entry_mut(&mut self, conversation_id: ConversationId) -> Option<&mut DirectoryEntry> {
        self.entries
            .iter_mut()
            .find(|entry| entry.conversation_id() == conversation_id)
    }

    fn sort_entries(&mut self) {
        self.entries.sort_by(|left, right| {
            right
                .conversation
                .updated_at_unix_millis
                .cmp(&left.conversation.updated_at_unix_millis)
                .then_with(|| right.conversation.id.cmp(&left.conversation.id))
        });
    }
}

impl Drop for ConversationDirectory {
    fn drop(&mut self) {
        if let Some(task) = self.change_feed.take() {
            task.abort();
        }
    }
}

async fn pump_change_feed(
    mut subscription: FeedSubscription,
    events: mpsc::UnboundedSender<DirectoryEvent>,
) {
    while let Some(item) = subscription.recv().await {
        let event = match item {
            Ok(record) => DirectoryEvent::Activity(record),
            Err(error) => DirectoryEvent::ChangeFeedLagged(error),
        };
        if events.send(event).is_err() {
            return;
        }
    }
    tracing::warn!("change feed closed");
}

/// Cuts `body` to at most `max_chars` characters, marking the cut with an ellipsis.
pub fn truncate_preview(body: &str, max_chars: usize) -> String {
    let single_line = body.split_whitespace().collect::<Vec<_>>().join(" ");
    if single_line.chars().count() <= max_chars {
        return single_line;
    }
    let mut preview: String = single_line.chars().take(max_chars.saturating_sub(1)).collect();
    preview.push(PREVIEW_ELLIPSIS);
    preview
}
