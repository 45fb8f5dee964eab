use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};

use super::error::{StorageError, StorageResult};
use super::ids::ConversationId;
use super::types::MessageRecord;

pub const DEFAULT_FEED_CAPACITY: usize = 256;

/// Fan-out point for inserted messages.
///
/// Every subscriber sees every insert published after it subscribed. Subscribers that fall
/// more than `capacity` events behind observe `FeedLagged` and are expected to re-query.
#[derive(Debug, Clone)]
pub struct FeedHub {
    sender: broadcast::Sender<MessageRecord>,
    capacity: usize,
}

impl Default for FeedHub {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

impl FeedHub {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, capacity }
    }

    /// Events a subscriber may fall behind before it observes `FeedLagged`.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns how many live subscriptions received the record.
    pub fn publish(&self, record: MessageRecord) -> usize {
        self.sender.send(record).unwrap_or(0)
    }

    pub fn subscribe(&self, scope: Option<ConversationId>) -> FeedSubscription {
        FeedSubscription {
            scope,
            receiver: Some(self.sender.subscribe()),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Handle for one live subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct FeedSubscription {
    scope: Option<ConversationId>,
    receiver: Option<broadcast::Receiver<MessageRecord>>,
}

impl FeedSubscription {
    pub fn scope(&self) -> Option<ConversationId> {
        self.scope
    }

    pub fn is_attached(&self) -> bool {
        self.receiver.is_some()
    }

    /// Waits for the next in-scope insert.
    ///
    /// Returns `None` once the feed is closed or the subscription was detached.
    pub async fn recv(&mut self) -> Option<StorageResult<MessageRecord>> {
        loop {
            let receiver = self.receiver.as_mut()?;
            match receiver.recv().await {
                Ok(record) if self.accepts(&record) => return Some(Ok(record)),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    return Some(Err(StorageError::FeedLagged {
                        stage: "feed-recv-lagged",
                        skipped,
                    }));
                }
                Err(RecvError::Closed) => {
                    self.receiver = None;
                    return None;
                }
            }
        }
    }

    /// Non-blocking variant of [`FeedSubscription::recv`]; `None` means nothing is queued.
    pub fn try_recv(&mut self) -> Option<StorageResult<MessageRecord>> {
        loop {
            let receiver = self.receiver.as_mut()?;
            match receiver.try_recv() {
                Ok(record) if self.accepts(&record) => return Some(Ok(record)),
                Ok(_) => continue,
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Lagged(skipped)) => {
                    return Some(Err(StorageError::FeedLagged {
                        stage: "feed-try-recv-lagged",
                        skipped,
                    }));
                }
                Err(TryRecvError::Closed) => {
                    self.receiver = None;
                    return Some(Err(StorageError::FeedClosed {
                        stage: "feed-try-recv-closed",
                    }));
                }
            }
        }
    }

    pub fn unsubscribe(mut self) {
        self.receiver.take();
    }

    fn accepts(&self, record: &MessageRecord) -> bool {
        self.scope
            .is_none_or(|conversation_id| record.conversation_id == conversation_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{MessageId, ParticipantId};

    fn record(conversation_id: ConversationId, created_at_unix_millis: u64) -> MessageRecord {
        MessageRecord {
            id: MessageId::new_v7(),
            conversation_id,
            sender_id: ParticipantId::new_v7(),
            body: format!("at {created_at_unix_millis}"),
            created_at_unix_millis,
            is_read: false,
        }
    }

    #[tokio::test]
    async fn scoped_subscription_skips_other_conversations() {
        let hub = FeedHub::new(8);
        let watched = ConversationId::new_v7();
        let other = ConversationId::new_v7();
        let mut subscription = hub.subscribe(Some(watched));

        hub.publish(record(other, 1));
        let expected = record(watched, 2);
        hub.publish(expected.clone());

        let received = subscription.recv().await.expect("feed open").expect("no lag");
        assert_eq!(received, expected);
        assert!(subscription.try_recv().is_none());
    }

    #[tokio::test]
    async fn slow_subscriber_observes_lag() {
        let hub = FeedHub::new(2);
        let conversation_id = ConversationId::new_v7();
        let mut subscription = hub.subscribe(None);

        for index in 0..5 {
            hub.publish(record(conversation_id, index));
        }

        match subscription.recv().await {
            Some(Err(StorageError::FeedLagged { skipped, .. })) => assert_eq!(skipped, 3),
            other => panic!("expected lag, got {other:?}"),
        }
    }

    #[test]
    fn dropping_a_subscription_detaches_it() {
        let hub = FeedHub::new(4);
        let subscription = hub.subscribe(None);
        assert_eq!(hub.subscriber_count(), 1);
        subscription.unsubscribe();
        assert_eq!(hub.subscriber_count(), 0);
    }
}
