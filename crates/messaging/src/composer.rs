use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use futures::FutureExt;
use futures::future::BoxFuture;
use homelink_storage::{
    ConversationId, MessageId, MessageRecord, ParticipantId, Storage, StorageResult,
};
use snafu::{ResultExt, ensure};

use crate::error::{
    EmptyMessageSnafu, MessagingResult, RetryNotAllowedSnafu, SendFailureSnafu,
    UnknownTentativeSnafu,
};
use crate::message::{AppendOutcome, DeliveryState, TentativeId, TentativeMessage};
use crate::message_store::MessageStore;

/// A tentative message that is ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingSend {
    pub tentative_id: TentativeId,
    pub conversation_id: ConversationId,
    pub sender_id: ParticipantId,
    pub body: String,
}

/// Completion of one persistence write.
#[derive(Debug)]
pub struct SendReport {
    pub outgoing: OutgoingSend,
    pub outcome: StorageResult<MessageRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendResolution {
    pub tentative_id: TentativeId,
    pub message_id: MessageId,
    /// `DuplicateIgnored` when the live echo landed before the write returned.
    pub append: AppendOutcome,
}

/// Optimistic send pipeline: tentative insert, write, reconcile.
pub struct Composer {
    storage: Arc<dyn Storage>,
    next_tentative_id: u64,
}

impl Composer {
    pub fn new(storage: Arc<dyn Storage>) -> Self {
        Self {
            storage,
            next_tentative_id: 1,
        }
    }

    /// Validates the body and shows it as `Pending`. Blank input has no side effects.
    pub fn begin_send(
        &mut self,
        store: &mut MessageStore,
        body: &str,
    ) -> MessagingResult<OutgoingSend> {
        ensure!(
            !body.trim().is_empty(),
            EmptyMessageSnafu {
                stage: "compose-validate-body",
            }
        );

        let tentative_id = TentativeId::new(self.next_tentative_id);
        self.next_tentative_id += 1;

        // Never place a pending entry above history the viewer has already seen.
        let created_at_unix_millis = local_clock_millis().max(
            store
                .latest_confirmed()
                .map_or(0, |record| record.created_at_unix_millis),
        );
        store.insert_tentative(TentativeMessage::pending(
            tentative_id,
            store.conversation_id(),
            store.viewer_id(),
            body,
            created_at_unix_millis,
        ));
        tracing::debug!(
            "queued tentative message {:?} in {}",
            tentative_id,
            store.conversation_id()
        );

        Ok(OutgoingSend {
            tentative_id,
            conversation_id: store.conversation_id(),
            sender_id: store.viewer_id(),
            body: body.to_string(),
        })
    }

    /// The persistence write. The future owns its inputs so it can be spawned.
    pub fn dispatch(&self, outgoing: OutgoingSend) -> BoxFuture<'static, SendReport> {
        let storage = Arc::clone(&self.storage);
        async move {
            let outcome = storage
                .insert_message(
                    outgoing.conversation_id,
                    outgoing.sender_id,
                    outgoing.body.clone(),
                )
                .await;
            SendReport { outgoing, outcome }
        }
        .boxed()
    }

    /// Swaps the tentative entry for the confirmed record, or marks it `Failed`.
    pub fn reconcile(
        &self,
        store: &mut MessageStore,
        report: SendReport,
    ) -> MessagingResult<SendResolution> {
        let tentative_id = report.outgoing.tentative_id;
        match report.outcome {
            Ok(record) => {
                store.remove_tentative(tentative_id);
                let message_id = record.id;
                let append = store.append(record);
                tracing::debug!(
                    "confirmed tentative message {:?} as {} ({:?})",
                    tentative_id,
                    message_id,
                    append
                );
                Ok(SendResolution {
                    tentative_id,
                    message_id,
                    append,
                })
            }
            Err(error) => {
                tracing::warn!("send of {:?} failed: {}", tentative_id, error);
                if let Err(missing) = store
                    .set_delivery_state(tentative_id, DeliveryState::Failed(error.to_string()))
                {
                    tracing::warn!("failed send has no local entry to flag: {}", missing);
                }
                Err(error).context(SendFailureSnafu {
                    stage: "compose-persist-message",
                    tentative_id,
                })
            }
        }
    }

    /// Moves a `Failed` entry back to `Pending` and returns the write to reissue.
    pub fn retry(
        &self,
        store: &mut MessageStore,
        tentative_id: TentativeId,
    ) -> MessagingResult<OutgoingSend> {
        let message = store.tentative(tentative_id).ok_or_else(|| {
            UnknownTentativeSnafu {
                stage: "compose-retry",
                tentative_id,
            }
            .build()
        })?;
        ensure!(
            message.is_failed(),
            RetryNotAllowedSnafu {
                stage: "compose-retry",
                tentative_id,
            }
        );

        let outgoing = OutgoingSend {
            tentative_id,
            conversation_id: message.conversation_id,
            sender_id: message.sender_id,
            body: message.body.clone(),
        };
        store.set_delivery_state(tentative_id, DeliveryState::Pending)?;
        tracing::info!("retrying tentative message {:?}", tentative_id);
        Ok(outgoing)
    }

    /// Runs validate, write and reconcile in order against one store.
    pub async fn send(
        &mut self,
        store: &mut MessageStore,
        body: &str,
    ) -> MessagingResult<SendResolution> {
        let outgoing = self.begin_send(store, body)?;
        let report = self.dispatch(outgoing).await;
        self.reconcile(store, report)
    }
}

fn local_clock_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
