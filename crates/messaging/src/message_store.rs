use std::collections::HashSet;

use homelink_storage::{ConversationId, HighWaterMark, MessageId, MessageRecord, ParticipantId};
use snafu::ensure;

use crate::error::{CorruptOrderingSnafu, MessagingResult, UnknownTentativeSnafu};
use crate::message::{AppendOutcome, DeliveryState, Entry, TentativeId, TentativeMessage};

/// Ordered, de-duplicated timeline of one conversation as seen by one participant.
///
/// Entries stay sorted by `(created_at, kind, id)` at all times; confirmed message ids
/// appear at most once.
#[derive(Debug, Clone)]
pub struct MessageStore {
    conversation_id: ConversationId,
    viewer_id: ParticipantId,
    entries: Vec<Entry>,
    confirmed_ids: HashSet<MessageId>,
}

impl MessageStore {
    pub fn new(conversation_id: ConversationId, viewer_id: ParticipantId) -> Self {
        Self {
            conversation_id,
            viewer_id,
            entries: Vec::new(),
            confirmed_ids: HashSet::new(),
        }
    }

    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub fn viewer_id(&self) -> ParticipantId {
        self.viewer_id
    }

    /// Replaces the whole timeline with persisted history.
    ///
    /// The input must be strictly ascending by `(created_at, id)` and belong to this
    /// conversation. On failure the current contents are left untouched.
    pub fn hydrate(&mut self, messages: Vec<MessageRecord>) -> MessagingResult<()> {
        let mut previous: Option<HighWaterMark> = None;
        for (position, message) in messages.iter().enumerate() {
            let key = message.order_key();
            ensure!(
                message.conversation_id == self.conversation_id
                    && previous.is_none_or(|previous| previous < key),
                CorruptOrderingSnafu {
                    stage: "hydrate-message-store",
                    conversation_id: self.conversation_id,
                    position,
                    message_id: message.id,
                }
            );
            previous = Some(key);
        }

        self.confirmed_ids = messages.iter().map(|message| message.id).collect();
        self.entries = messages.into_iter().map(Entry::Confirmed).collect();
        tracing::debug!(
            "hydrated conversation {} with {} messages",
            self.conversation_id,
            self.entries.len()
        );
        Ok(())
    }

    /// Inserts a confirmed message at its ordered position. Re-deliveries are ignored.
    pub fn append(&mut self, message: MessageRecord) -> AppendOutcome {
        if message.conversation_id != self.conversation_id {
            tracing::warn!(
                "ignored message {} for conversation {} in store of {}",
                message.id,
                message.conversation_id,
                self.conversation_id
            );
            return AppendOutcome::ForeignIgnored;
        }
        if self.confirmed_ids.contains(&message.id) {
            return AppendOutcome::DuplicateIgnored;
        }

        self.confirmed_ids.insert(message.id);
        self.insert_sorted(Entry::Confirmed(message));
        AppendOutcome::Inserted
    }

    /// Flips the local read flag for unread messages from the other participant.
    ///
    /// Returns exactly the ids whose flag changed.
    pub fn mark_read(&mut self, ids: &HashSet<MessageId>) -> Vec<MessageId> {
        let viewer_id = self.viewer_id;
        let mut flipped = Vec::new();
        for entry in &mut self.entries {
            let Entry::Confirmed(record) = entry else {
                continue;
            };
            if ids.contains(&record.id) && record.is_unread_for(viewer_id) {
                record.is_read = true;
                flipped.push(record.id);
            }
        }
        flipped
    }

    pub fn insert_tentative(&mut self, message: TentativeMessage) {
        self.insert_sorted(Entry::Tentative(message));
    }

    pub fn remove_tentative(&mut self, tentative_id: TentativeId) -> Option<TentativeMessage> {
        let index = self
            .entries
            .iter()
            .position(|entry| entry.tentative_id() == Some(tentative_id))?;
        match self.entries.remove(index) {
            Entry::Tentative(message) => Some(message),
            Entry::Confirmed(_) => None,
        }
    }

    /// Removes every tentative entry, in timeline order, leaving confirmed history in place.
    pub fn take_tentatives(&mut self) -> Vec<TentativeMessage> {
        let mut tentatives = Vec::new();
        for entry in std::mem::take(&mut self.entries) {
            match entry {
                Entry::Tentative(message) => tentatives.push(message),
                confirmed @ Entry::Confirmed(_) => self.entries.push(confirmed),
            }
        }
        tentatives
    }

    pub fn set_delivery_state(
        &mut self,
        tentative_id: TentativeId,
        state: DeliveryState,
    ) -> MessagingResult<()> {
        let message = self
            .entries
            .iter_mut()
            .find_map(|entry| match entry {
                Entry::Tentative(message) if message.tentative_id == tentative_id => {
                    Some(message)
                }
                Entry::Tentative(_) | Entry::Confirmed(_) => None,
            })
            .ok_or_else(|| {
                UnknownTentativeSnafu {
                    stage: "set-delivery-state",
                    tentative_id,
                }
                .build()
            })?;
        message.state = state;
        Ok(())
    }

    pub fn tentative(&self, tentative_id: TentativeId) -> Option<&TentativeMessage> {
        self.entries
            .iter()
            .filter_map(Entry::tentative)
            .find(|message| message.tentative_id == tentative_id)
    }

    pub fn contains(&self, message_id: MessageId) -> bool {
        self.confirmed_ids.contains(&message_id)
    }

    /// Greatest confirmed position, the resume point for gap-fill.
    pub fn high_water_mark(&self) -> Option<HighWaterMark> {
        self.latest_confirmed().map(MessageRecord::order_key)
    }

    pub fn latest_confirmed(&self) -> Option<&MessageRecord> {
        self.entries.iter().rev().find_map(Entry::confirmed)
    }

    pub fn unread_ids(&self) -> Vec<MessageId> {
        self.confirmed()
            .filter(|record| record.is_unread_for(self.viewer_id))
            .map(|record| record.id)
            .collect()
    }

    pub fn confirmed(&self) -> impl Iterator<Item = &MessageRecord> {
        self.entries.iter().filter_map(Entry::confirmed)
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn snapshot(&self) -> Vec<Entry> {
        self.entries.clone()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn insert_sorted(&mut self, entry: Entry) {
        let key = entry.sort_key();
        let index = self
            .entries
            .partition_point(|existing| existing.sort_key() <= key);
        self.entries.insert(index, entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        conversation_id: ConversationId,
        viewer_id: ParticipantId,
        other_id: ParticipantId,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                conversation_id: ConversationId::new_v7(),
                viewer_id: ParticipantId::new_v7(),
                other_id: ParticipantId::new_v7(),
            }
        }

        fn store(&self) -> MessageStore {
            MessageStore::new(self.conversation_id, self.viewer_id)
        }

        fn inbound(&self, body: &str, created_at: u64) -> MessageRecord {
            self.record(self.other_id, body, created_at)
        }

        fn outbound(&self, body: &str, created_at: u64) -> MessageRecord {
            self.record(self.viewer_id, body, created_at)
        }

        fn record(&self, sender_id: ParticipantId, body: &str, created_at: u64) -> MessageRecord {
            MessageRecord {
                id: MessageId::new_v7(),
                conversation_id: self.conversation_id,
                sender_id,
                body: body.to_string(),
                created_at_unix_millis: created_at,
                is_read: false,
            }
        }
    }

    fn bodies(store: &MessageStore) -> Vec<&str> {
        store.entries().iter().map(Entry::body).collect()
    }

    #[test]
    fn hydrate_accepts_strictly_ordered_history() {
        let fixture = Fixture::new();
        let mut store = fixture.store();
        let history = vec![fixture.inbound("A", 1), fixture.outbound("B", 2)];

        store.hydrate(history).expect("ordered history");

        assert_eq!(bodies(&store), vec!["A", "B"]);
        assert_eq!(store.high_water_mark().map(|mark| mark.created_at_unix_millis), Some(2));
    }

    #[test]
    fn hydrate_rejects_out_of_order_history_without_replacing() {
        let fixture = Fixture::new();
        let mut store = fixture.store();
        store
            .hydrate(vec![fixture.inbound("kept", 1)])
            .expect("ordered history");

        let later = fixture.inbound("later", 5);
        let earlier = fixture.inbound("earlier", 3);
        let error = store
            .hydrate(vec![later, earlier])
            .expect_err("descending history must fail");

        assert!(matches!(
            error,
            crate::MessagingError::CorruptOrdering { position: 1, .. }
        ));
        assert_eq!(bodies(&store), vec!["kept"]);
    }

    #[test]
    fn hydrate_rejects_duplicate_keys() {
        let fixture = Fixture::new();
        let mut store = fixture.store();
        let message = fixture.inbound("A", 1);

        let error = store
            .hydrate(vec![message.clone(), message])
            .expect_err("repeated key is not strictly ascending");

        assert!(matches!(
            error,
            crate::MessagingError::CorruptOrdering { .. }
        ));
        assert!(store.is_empty());
    }

    #[test]
    fn append_places_late_message_in_order() {
        let fixture = Fixture::new();
        let mut store = fixture.store();
        store
            .hydrate(vec![fixture.inbound("A", 1), fixture.inbound("C", 3)])
            .expect("ordered history");

        let outcome = store.append(fixture.inbound("B", 2));

        assert_eq!(outcome, AppendOutcome::Inserted);
        assert_eq!(bodies(&store), vec!["A", "B", "C"]);
    }

    #[test]
    fn append_is_idempotent_for_redelivered_ids() {
        let fixture = Fixture::new();
        let mut store = fixture.store();
        let message = fixture.inbound("A", 1);

        assert_eq!(store.append(message.clone()), AppendOutcome::Inserted);
        let before = store.snapshot();
        assert_eq!(store.append(message), AppendOutcome::DuplicateIgnored);

        assert_eq!(store.snapshot(), before);
    }

    #[test]
    fn append_breaks_timestamp_ties_by_id() {
        let fixture = Fixture::new();
        let mut store = fixture.store();
        let mut first = fixture.inbound("first", 7);
        let mut second = fixture.inbound("second", 7);
        if second.id < first.id {
            std::mem::swap(&mut first.id, &mut second.id);
        }

        store.append(second);
        store.append(first);

        assert_eq!(bodies(&store), vec!["first", "second"]);
    }

    #[test]
    fn append_ignores_other_conversations() {
        let fixture = Fixture::new();
        let mut store = fixture.store();
        let mut stray = fixture.inbound("stray", 1);
        stray.conversation_id = ConversationId::new_v7();

        assert_eq!(store.append(stray), AppendOutcome::ForeignIgnored);
        assert!(store.is_empty());
    }

    #[test]
    fn mark_read_only_flips_inbound_unread() {
        let fixture = Fixture::new();
        let mut store = fixture.store();
        let inbound = fixture.inbound("in", 1);
        let outbound = fixture.outbound("out", 2);
        let ids: HashSet<MessageId> = [inbound.id, outbound.id].into_iter().collect();
        store
            .hydrate(vec![inbound.clone(), outbound])
            .expect("ordered history");

        assert_eq!(store.mark_read(&ids), vec![inbound.id]);
        assert!(store.mark_read(&ids).is_empty());
        assert!(store.unread_ids().is_empty());
    }

    #[test]
    fn tentative_entries_follow_confirmed_at_equal_timestamp() {
        let fixture = Fixture::new();
        let mut store = fixture.store();
        store.insert_tentative(TentativeMessage::pending(
            TentativeId::new(1),
            fixture.conversation_id,
            fixture.viewer_id,
            "draft",
            5,
        ));
        store.append(fixture.inbound("echo", 5));

        assert_eq!(bodies(&store), vec!["echo", "draft"]);
        assert_eq!(
            store.high_water_mark().map(|mark| mark.created_at_unix_millis),
            Some(5)
        );
    }

    #[test]
    fn delivery_state_updates_and_removal() {
        let fixture = Fixture::new();
        let mut store = fixture.store();
        let tentative_id = TentativeId::new(3);
        store.insert_tentative(TentativeMessage::pending(
            tentative_id,
            fixture.conversation_id,
            fixture.viewer_id,
            "draft",
            1,
        ));

        store
            .set_delivery_state(tentative_id, DeliveryState::Failed("offline".to_string()))
            .expect("known tentative");
        assert!(store.tentative(tentative_id).is_some_and(TentativeMessage::is_failed));

        assert!(store.remove_tentative(tentative_id).is_some());
        assert!(store.remove_tentative(tentative_id).is_none());
        assert!(matches!(
            store.set_delivery_state(tentative_id, DeliveryState::Pending),
            Err(crate::MessagingError::UnknownTentative { .. })
        ));
    }

    #[test]
    fn take_tentatives_keeps_confirmed_history() {
        let fixture = Fixture::new();
        let mut store = fixture.store();
        store.append(fixture.inbound("hi", 1));
        store.insert_tentative(TentativeMessage::pending(
            TentativeId::new(7),
            fixture.conversation_id,
            fixture.viewer_id,
            "on my way",
            2,
        ));

        let taken = store.take_tentatives();

        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].tentative_id, TentativeId::new(7));
        assert_eq!(bodies(&store), vec!["hi"]);
        assert!(store.take_tentatives().is_empty());
    }
}
