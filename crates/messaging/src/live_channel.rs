use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use homelink_storage::{FeedSubscription, HighWaterMark, MessageRecord, Storage, StorageError};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::SharedSettings;
use crate::message::ChannelTarget;

/// Liveness of the single subscription owned by a [`LiveChannel`].
///
/// `attempt` counts consecutive failed connects since the last successful catch-up, so
/// it keeps growing across `Errored -> Connecting` cycles until a gap-fill completes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ChannelState {
    #[default]
    Closed,
    Connecting {
        attempt: u32,
    },
    Open,
    Errored {
        attempt: u32,
        retry_in: Duration,
    },
}

/// State transition input for the channel lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelTransition {
    Connect { attempt: u32 },
    Connected,
    Fail { attempt: u32, retry_in: Duration },
    Close,
}

/// Rejection reason for illegal channel transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelTransitionRejection {
    AlreadyActive { state: ChannelState },
    NotConnecting { state: ChannelState },
    NotActive { state: ChannelState },
}

pub type ChannelTransitionResult = Result<ChannelState, ChannelTransitionRejection>;

impl ChannelState {
    /// True for `Connecting` and `Open`, the states that hold or acquire a subscription.
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Connecting { .. } | Self::Open)
    }

    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open)
    }

    /// Applies one transition without mutating `self`.
    pub fn apply(&self, transition: ChannelTransition) -> ChannelTransitionResult {
        match transition {
            ChannelTransition::Close => Ok(Self::Closed),
            ChannelTransition::Connect { attempt } => match self {
                Self::Closed | Self::Errored { .. } => Ok(Self::Connecting { attempt }),
                Self::Connecting { .. } | Self::Open => {
                    Err(ChannelTransitionRejection::AlreadyActive {
                        state: self.clone(),
                    })
                }
            },
            ChannelTransition::Connected => match self {
                Self::Connecting { .. } => Ok(Self::Open),
                Self::Closed | Self::Open | Self::Errored { .. } => {
                    Err(ChannelTransitionRejection::NotConnecting {
                        state: self.clone(),
                    })
                }
            },
            ChannelTransition::Fail { attempt, retry_in } => match self {
                Self::Connecting { .. } | Self::Open => Ok(Self::Errored { attempt, retry_in }),
                Self::Closed | Self::Errored { .. } => Err(ChannelTransitionRejection::NotActive {
                    state: self.clone(),
                }),
            },
        }
    }
}

/// Capped exponential reconnect delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    initial: Duration,
    multiplier: f64,
    ceiling: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, multiplier: f64, ceiling: Duration) -> Self {
        Self {
            initial,
            multiplier: if multiplier.is_finite() && multiplier >= 1.0 {
                multiplier
            } else {
                1.0
            },
            ceiling: ceiling.max(initial),
        }
    }

    /// Delay before the retry that follows the `failures`-th consecutive failure.
    ///
    /// `delay(1) == initial`, each further failure multiplies it, never past the ceiling.
    pub fn delay(&self, failures: u32) -> Duration {
        let exponent = i32::try_from(failures.saturating_sub(1)).unwrap_or(i32::MAX);
        let scaled = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        if !scaled.is_finite() || scaled >= self.ceiling.as_secs_f64() {
            return self.ceiling;
        }
        Duration::from_secs_f64(scaled)
    }
}

/// Output of a channel worker, always tagged with the channel that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEnvelope {
    pub target: ChannelTarget,
    pub event: ChannelEvent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    State(ChannelState),
    /// A confirmed message from gap-fill or the live feed. May be a re-delivery.
    Message(MessageRecord),
    /// Gap-fill finished; live events follow.
    CaughtUp { replayed: usize },
    /// Reported once per outage when consecutive failures reach the configured threshold.
    Unavailable { attempts: u32 },
    Recovered,
}

/// Owner handle of one running channel worker.
///
/// Exactly one subscription exists per handle while the worker runs. Dropping the handle
/// closes the channel.
pub struct LiveChannel {
    target: ChannelTarget,
    state: Arc<ArcSwap<ChannelState>>,
    cancel: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl LiveChannel {
    /// Starts the worker: connect, gap-fill from `high_water_mark`, then live forwarding.
    ///
    /// Must be called inside a tokio runtime.
    pub fn open<E>(
        target: ChannelTarget,
        high_water_mark: Option<HighWaterMark>,
        storage: Arc<dyn Storage>,
        settings: SharedSettings,
        events: mpsc::UnboundedSender<E>,
    ) -> Self
    where
        E: From<ChannelEnvelope> + Send + 'static,
    {
        let state = Arc::new(ArcSwap::from_pointee(ChannelState::Closed));
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let worker = ChannelWorker {
            target,
            high_water_mark,
            storage,
            settings,
            events,
            state: Arc::clone(&state),
            failures: 0,
            reported_unavailable: false,
        };

        let task = tokio::spawn(async move {
            tokio::select! {
                _ = cancel_rx => {
                    tracing::debug!("live channel worker for {} cancelled", target.conversation_id);
                }
                () = worker.run() => {}
            }
        });

        tracing::info!(
            "opened live channel for conversation {} (session {:?})",
            target.conversation_id,
            target.session_id
        );

        Self {
            target,
            state,
            cancel: Some(cancel_tx),
            task: Some(task),
        }
    }

    pub fn target(&self) -> ChannelTarget {
        self.target
    }

    pub fn state(&self) -> ChannelState {
        // An aborted worker may still publish one last state before it stops.
        if self.task.is_none() {
            return ChannelState::Closed;
        }
        self.state.load().as_ref().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_none()
    }

    /// Stops the worker, its retry timer and any in-flight gap-fill. Safe to call repeatedly.
    pub fn close(&mut self) {
        let was_running = self.task.is_some();
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        if let Some(task) = self.task.take() {
            task.abort();
        }
        self.state.store(Arc::new(ChannelState::Closed));
        if was_running {
            tracing::info!(
                "closed live channel for conversation {}",
                self.target.conversation_id
            );
        }
    }
}

impl Drop for LiveChannel {
    fn drop(&mut self) {
        self.close();
    }
}

/// Why a connected session ended.
enum SessionEnd {
    Failed(StorageError),
    SinkClosed,
}

struct ChannelWorker<E> {
    target: ChannelTarget,
    high_water_mark: Option<HighWaterMark>,
    storage: Arc<dyn Storage>,
    settings: SharedSettings,
    events: mpsc::UnboundedSender<E>,
    state: Arc<ArcSwap<ChannelState>>,
    failures: u32,
    reported_unavailable: bool,
}

impl<E> ChannelWorker<E>
where
    E: From<ChannelEnvelope> + Send + 'static,
{
    async fn run(mut self) {
        loop {
            if !self.transition(ChannelTransition::Connect {
                attempt: self.failures + 1,
            }) {
                return;
            }

            let error = match self.session().await {
                SessionEnd::SinkClosed => return,
                SessionEnd::Failed(error) => error,
            };

            self.failures = self.failures.saturating_add(1);
            let settings = self.settings.current();
            let retry_in = settings.backoff().delay(self.failures);
            tracing::warn!(
                "live channel for {} failed (attempt {}), retrying in {:?}: {}",
                self.target.conversation_id,
                self.failures,
                retry_in,
                error
            );
            if !self.transition(ChannelTransition::Fail {
                attempt: self.failures,
                retry_in,
            }) {
                return;
            }

            if self.failures >= settings.unavailable_after_attempts && !self.reported_unavailable {
                self.reported_unavailable = true;
                tracing::warn!(
                    "live channel for {} unavailable after {} attempts",
                    self.target.conversation_id,
                    self.failures
                );
                if !self.emit(ChannelEvent::Unavailable {
                    attempts: self.failures,
                }) {
                    return;
                }
            }

            tokio::time::sleep(retry_in).await;
        }
    }

    /// One connected period: subscribe, mark open, gap-fill, then forward live events.
    async fn session(&mut self) -> SessionEnd {
        let mut subscription = match self.storage.subscribe(self.target.conversation_id).await {
            Ok(subscription) => subscription,
            Err(error) => return SessionEnd::Failed(error),
        };
        if !self.transition(ChannelTransition::Connected) {
            return SessionEnd::SinkClosed;
        }

        let replay = match self
            .storage
            .query_messages(self.target.conversation_id, self.high_water_mark)
            .await
        {
            Ok(replay) => replay,
            Err(error) => return SessionEnd::Failed(error),
        };
        let replayed = replay.len();
        for record in replay {
            if !self.deliver(record) {
                return SessionEnd::SinkClosed;
            }
        }
        tracing::debug!(
            "live channel for {} caught up with {} messages",
            self.target.conversation_id,
            replayed
        );

        self.failures = 0;
        if !self.emit(ChannelEvent::CaughtUp { replayed }) {
            return SessionEnd::SinkClosed;
        }
        if std::mem::take(&mut self.reported_unavailable) && !self.emit(ChannelEvent::Recovered) {
            return SessionEnd::SinkClosed;
        }

        self.forward(&mut subscription).await
    }

    async fn forward(&mut self, subscription: &mut FeedSubscription) -> SessionEnd {
        loop {
            match subscription.recv().await {
                Some(Ok(record)) => {
                    if !self.deliver(record) {
                        return SessionEnd::SinkClosed;
                    }
                }
                Some(Err(error)) => return SessionEnd::Failed(error),
                None => {
                    return SessionEnd::Failed(StorageError::FeedClosed {
                        stage: "live-channel-forward",
                    });
                }
            }
        }
    }

    fn deliver(&mut self, record: MessageRecord) -> bool {
        let key = record.order_key();
        if self.high_water_mark.is_none_or(|mark| mark < key) {
            self.high_water_mark = Some(key);
        }
        self.emit(ChannelEvent::Message(record))
    }

    fn transition(&self, transition: ChannelTransition) -> bool {
        let current = self.state.load();
        match current.apply(transition) {
            Ok(next) => {
                tracing::debug!(
                    "live channel for {}: {:?} -> {:?}",
                    self.target.conversation_id,
                    current.as_ref(),
                    next
                );
                self.state.store(Arc::new(next.clone()));
                self.emit(ChannelEvent::State(next))
            }
            Err(rejection) => {
                tracing::warn!(
                    "live channel for {} rejected transition: {:?}",
                    self.target.conversation_id,
                    rejection
                );
                true
            }
        }
    }

    fn emit(&self, event: ChannelEvent) -> bool {
        self.events
            .send(E::from(ChannelEnvelope {
                target: self.target,
                event,
            }))
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MessagingSettings;
    use crate::message::ChannelSessionId;
    use crate::test_support::ScriptedStorage;

    async fn next_event(events: &mut mpsc::UnboundedReceiver<ChannelEnvelope>) -> ChannelEvent {
        events
            .recv()
            .await
            .expect("channel worker should still be running")
            .event
    }

    fn backoff() -> Backoff {
        Backoff::new(Duration::from_secs(1), 2.0, Duration::from_secs(30))
    }

    #[test]
    fn backoff_doubles_until_ceiling() {
        let backoff = backoff();
        let delays: Vec<u64> = (1..=7).map(|failures| backoff.delay(failures).as_secs()).collect();

        assert_eq!(delays, vec![1, 2, 4, 8, 16, 30, 30]);
        assert_eq!(backoff.delay(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn backoff_treats_zero_failures_as_first() {
        assert_eq!(backoff().delay(0), Duration::from_secs(1));
    }

    #[test]
    fn backoff_clamps_bad_inputs() {
        let backoff = Backoff::new(Duration::from_secs(5), f64::NAN, Duration::from_secs(1));

        assert_eq!(backoff.delay(1), Duration::from_secs(5));
        assert_eq!(backoff.delay(4), Duration::from_secs(5));
    }

    #[test]
    fn lifecycle_transitions_follow_the_state_machine() {
        let closed = ChannelState::Closed;
        let connecting = closed
            .apply(ChannelTransition::Connect { attempt: 1 })
            .expect("closed can connect");
        assert_eq!(connecting, ChannelState::Connecting { attempt: 1 });
        assert!(connecting.is_active());

        let open = connecting
            .apply(ChannelTransition::Connected)
            .expect("connecting can open");
        assert!(open.is_open());

        let errored = open
            .apply(ChannelTransition::Fail {
                attempt: 1,
                retry_in: Duration::from_secs(1),
            })
            .expect("open can fail");
        assert!(!errored.is_active());

        let reconnecting = errored
            .apply(ChannelTransition::Connect { attempt: 2 })
            .expect("errored reconnects");
        assert_eq!(reconnecting, ChannelState::Connecting { attempt: 2 });
    }

    #[test]
    fn close_is_accepted_from_every_state() {
        let states = [
            ChannelState::Closed,
            ChannelState::Connecting { attempt: 3 },
            ChannelState::Open,
            ChannelState::Errored {
                attempt: 2,
                retry_in: Duration::from_secs(2),
            },
        ];

        for state in states {
            assert_eq!(state.apply(ChannelTransition::Close), Ok(ChannelState::Closed));
        }
    }

    #[test]
    fn illegal_transitions_are_rejected() {
        assert!(matches!(
            ChannelState::Open.apply(ChannelTransition::Connect { attempt: 1 }),
            Err(ChannelTransitionRejection::AlreadyActive { .. })
        ));
        assert!(matches!(
            ChannelState::Closed.apply(ChannelTransition::Connected),
            Err(ChannelTransitionRejection::NotConnecting { .. })
        ));
        assert!(matches!(
            ChannelState::Closed.apply(ChannelTransition::Fail {
                attempt: 1,
                retry_in: Duration::ZERO,
            }),
            Err(ChannelTransitionRejection::NotActive { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_with_backoff_and_reports_unavailable_once() {
        let backend = ScriptedStorage::new();
        let (conversation, _, _) = backend.seed_pair();
        backend.fail_next_subscribes(3);
        let settings = SharedSettings::new(MessagingSettings {
            unavailable_after_attempts: 2,
            ..MessagingSettings::default()
        });
        let (events_tx, mut events) = mpsc::unbounded_channel::<ChannelEnvelope>();
        let target = ChannelTarget::new(conversation.id, ChannelSessionId::new(1));
        let started = tokio::time::Instant::now();

        let mut channel = LiveChannel::open(target, None, backend.clone(), settings, events_tx);

        let mut observed = Vec::new();
        loop {
            let event = next_event(&mut events).await;
            let done = event == ChannelEvent::Recovered;
            observed.push(event);
            if done {
                break;
            }
        }

        let errored = |attempt: u32, secs: u64| {
            ChannelEvent::State(ChannelState::Errored {
                attempt,
                retry_in: Duration::from_secs(secs),
            })
        };
        let connecting = |attempt: u32| ChannelEvent::State(ChannelState::Connecting { attempt });
        assert_eq!(
            observed,
            vec![
                connecting(1),
                errored(1, 1),
                connecting(2),
                errored(2, 2),
                ChannelEvent::Unavailable { attempts: 2 },
                connecting(3),
                errored(3, 4),
                connecting(4),
                ChannelEvent::State(ChannelState::Open),
                ChannelEvent::CaughtUp { replayed: 0 },
                ChannelEvent::Recovered,
            ]
        );
        assert_eq!(started.elapsed(), Duration::from_secs(7));
        assert!(channel.state().is_open());

        channel.close();
        assert_eq!(channel.state(), ChannelState::Closed);
        while events.recv().await.is_some() {}
        channel.close();
        assert!(channel.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn gap_fill_replays_missed_messages_before_live_events() {
        let backend = ScriptedStorage::new();
        let (conversation, _, other_id) = backend.seed_pair();
        let seen = backend.push_message(conversation.id, other_id, "seen");
        backend.fail_next_subscribes(1);
        let (events_tx, mut events) = mpsc::unbounded_channel::<ChannelEnvelope>();
        let target = ChannelTarget::new(conversation.id, ChannelSessionId::new(7));

        let _channel = LiveChannel::open(
            target,
            Some(seen.order_key()),
            backend.clone(),
            SharedSettings::default(),
            events_tx,
        );
        let missed = backend.push_message(conversation.id, other_id, "missed");

        let mut messages = Vec::new();
        loop {
            match next_event(&mut events).await {
                ChannelEvent::Message(record) => messages.push(record),
                ChannelEvent::CaughtUp { replayed } => {
                    assert_eq!(replayed, 1);
                    break;
                }
                _ => {}
            }
        }
        assert_eq!(messages, vec![missed]);

        let live = backend.push_message(conversation.id, other_id, "live");
        loop {
            if let ChannelEvent::Message(record) = next_event(&mut events).await {
                assert_eq!(record, live);
                break;
            }
        }
    }
}
