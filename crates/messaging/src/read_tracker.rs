use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use homelink_storage::{ConversationId, MessageId, ParticipantId, Storage, StorageResult};
use snafu::ResultExt;

use crate::error::{MessagingResult, StorageSnafu};
use crate::message_store::MessageStore;

/// Read-flag update for one conversation, captured at the moment marking began.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadBatch {
    pub conversation_id: ConversationId,
    pub reader_id: ParticipantId,
    pub message_ids: Vec<MessageId>,
}

/// Completion of one [`ReadBatch`] write.
#[derive(Debug)]
pub struct ReadReport {
    pub batch: ReadBatch,
    pub outcome: StorageResult<u64>,
}

/// Decides what counts as unread and persists read transitions in per-conversation batches.
///
/// Local flags flip immediately and never revert. Ids whose write failed stay queued and
/// ride along with the next batch for the same conversation.
pub struct ReadTracker {
    storage: Arc<dyn Storage>,
    queued: HashMap<ConversationId, Vec<MessageId>>,
}

impl ReadTracker {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            queued: HashMap::new(),
        }
    }

    pub fn compute_unread_count(store: &MessageStore) -> usize {
        store
            .confirmed()
            .filter(|record| record.is_unread_for(store.viewer_id()))
            .count()
    }

    /// Flips every message unread right now and returns the batch to persist.
    ///
    /// Messages appended after this call are not part of the batch. Returns `None` when
    /// there is nothing to write.
    pub fn begin_mark(&mut self, store: &mut MessageStore) -> Option<ReadBatch> {
        let unread: HashSet<MessageId> = store.unread_ids().into_iter().collect();
        let mut message_ids = self
            .queued
            .remove(&store.conversation_id())
            .unwrap_or_default();
        for message_id in store.mark_read(&unread) {
            if !message_ids.contains(&message_id) {
                message_ids.push(message_id);
            }
        }

        if message_ids.is_empty() {
            return None;
        }
        Some(ReadBatch {
            conversation_id: store.conversation_id(),
            reader_id: store.viewer_id(),
            message_ids,
        })
    }

    /// Issues the single batched write. The future owns its inputs so it can be spawned.
    pub fn persist(&self, batch: ReadBatch) -> BoxFuture<'static, ReadReport> {
        let storage = Arc::clone(&self.storage);
        async move {
            let outcome = storage
                .update_read_flags(
                    batch.conversation_id,
                    batch.reader_id,
                    batch.message_ids.clone(),
                )
                .await;
            ReadReport { batch, outcome }
        }
        .boxed()
    }

    /// Records the outcome of a write. Failed ids are queued for the next batch.
    pub fn complete(&mut self, report: ReadReport) -> MessagingResult<u64> {
        match report.outcome {
            Ok(updated) => {
                tracing::debug!(
                    "persisted read flags for {} messages in {} ({} changed)",
                    report.batch.message_ids.len(),
                    report.batch.conversation_id,
                    updated
                );
                Ok(updated)
            }
            Err(error) => {
                tracing::warn!(
                    "read flag write for {} failed, queued {} ids: {}",
                    report.batch.conversation_id,
                    report.batch.message_ids.len(),
                    error
                );
                let queued = self
                    .queued
                    .entry(report.batch.conversation_id)
                    .or_default();
                for message_id in report.batch.message_ids {
                    if !queued.contains(&message_id) {
                        queued.push(message_id);
                    }
                }
                Err(error).context(StorageSnafu {
                    stage: "persist-read-flags",
                })
            }
        }
    }

    /// Marks and persists in one step. `Ok(None)` means nothing was unread.
    pub async fn mark_conversation_read(
        &mut self,
        store: &mut MessageStore,
    ) -> MessagingResult<Option<u64>> {
        let Some(batch) = self.begin_mark(store) else {
            return Ok(None);
        };
        let report = self.persist(batch).await;
        self.complete(report).map(Some)
    }

    pub fn queued_ids(&self, conversation_id: ConversationId) -> &[MessageId] {
        self.queued
            .get(&conversation_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedStorage;

    #[tokio::test]
    async fn mark_reads_unread_inbound_once() {
        let backend = ScriptedStorage::new();
        let (conversation, viewer_id, other_id) = backend.seed_pair();
        backend.push_message(conversation.id, other_id, "one");
        backend.push_message(conversation.id, other_id, "two");
        backend.push_message(conversation.id, viewer_id, "mine");

        let mut store = MessageStore::new(conversation.id, viewer_id);
        store
            .hydrate(backend.messages(conversation.id))
            .expect("ordered history");
        let mut tracker = ReadTracker::new(backend.clone());
        assert_eq!(ReadTracker::compute_unread_count(&store), 2);

        let updated = tracker
            .mark_conversation_read(&mut store)
            .await
            .expect("write succeeds");
        assert_eq!(updated, Some(2));
        assert_eq!(ReadTracker::compute_unread_count(&store), 0);
        assert_eq!(backend.read_flag_calls().len(), 1);

        let second = tracker
            .mark_conversation_read(&mut store)
            .await
            .expect("nothing to write");
        assert_eq!(second, None);
        assert_eq!(backend.read_flag_calls().len(), 1);
    }

    #[test]
    fn batch_excludes_messages_arriving_after_begin() {
        let backend = ScriptedStorage::new();
        let (conversation, viewer_id, other_id) = backend.seed_pair();
        backend.push_message(conversation.id, other_id, "one");
        backend.push_message(conversation.id, other_id, "two");

        let mut store = MessageStore::new(conversation.id, viewer_id);
        store
            .hydrate(backend.messages(conversation.id))
            .expect("ordered history");
        let mut tracker = ReadTracker::new(backend.clone());

        let batch = tracker.begin_mark(&mut store).expect("two unread");
        let late = backend.push_message(conversation.id, other_id, "late");
        store.append(late.clone());

        assert_eq!(batch.message_ids.len(), 2);
        assert!(!batch.message_ids.contains(&late.id));
        assert_eq!(ReadTracker::compute_unread_count(&store), 1);
    }

    #[tokio::test]
    async fn failed_write_is_folded_into_next_batch() {
        let backend = ScriptedStorage::new();
        let (conversation, viewer_id, other_id) = backend.seed_pair();
        let first = backend.push_message(conversation.id, other_id, "one");

        let mut store = MessageStore::new(conversation.id, viewer_id);
        store
            .hydrate(backend.messages(conversation.id))
            .expect("ordered history");
        let mut tracker = ReadTracker::new(backend.clone());

        backend.fail_read_flags(true);
        let error = tracker
            .mark_conversation_read(&mut store)
            .await
            .expect_err("write fails");
        assert!(matches!(error, crate::MessagingError::Storage { .. }));
        assert_eq!(ReadTracker::compute_unread_count(&store), 0);
        assert_eq!(tracker.queued_ids(conversation.id), &[first.id]);

        backend.fail_read_flags(false);
        let second = backend.push_message(conversation.id, other_id, "two");
        store.append(second.clone());
        let batch = tracker.begin_mark(&mut store).expect("queued plus new");

        assert_eq!(batch.message_ids, vec![first.id, second.id]);
        assert!(tracker.queued_ids(conversation.id).is_empty());
    }
}
