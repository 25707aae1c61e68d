//! System-wide notifications.
//!
//! Components publish [`RigEvent`]s on a tokio broadcast channel; any number
//! of collaborators (operator console, persistence triggers, tests) subscribe
//! without the core knowing about them. Slow subscribers lose the oldest
//! events rather than blocking publishers.

use crate::acquisition::SensorSample;
use crate::persistence::TestRunId;
use crate::safety::TripReason;
use tokio::sync::broadcast;
use tracing::trace;

/// Default channel depth.
pub const DEFAULT_EVENT_CAPACITY: usize = 1024;

/// How an automatic test ended.
#[derive(Debug, Clone, PartialEq)]
pub enum TestOutcome {
    /// Reached the end position; `run_id` is `None` when nothing was recorded.
    Completed {
        /// Identifier assigned by the store
        run_id: Option<TestRunId>,
        /// Samples in the persisted batch
        sample_count: usize,
    },
    /// Stopped by the operator or an E-stop.
    Cancelled,
    /// Any other failure, with its message.
    Failed(String),
}

/// Notification raised by the rig.
#[derive(Debug, Clone, PartialEq)]
pub enum RigEvent {
    /// A sample passed the displacement gate and was buffered.
    DataCollected(SensorSample),
    /// The safety monitor forced the safe state.
    EStopTriggered(TripReason),
    /// The reset sequence completed and polling resumed.
    SafetyReset,
    /// An automatic test started.
    TestStarted {
        /// Test name
        name: String,
    },
    /// An automatic test finished, whatever the outcome.
    TestCompleted {
        /// Test name
        name: String,
        /// How it ended
        outcome: TestOutcome,
    },
}

/// Cloneable publisher handle.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<RigEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    /// Bus holding up to `capacity` undelivered events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// New subscription; receives events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RigEvent> {
        self.tx.subscribe()
    }

    /// Publish to all current subscribers.
    pub fn emit(&self, event: RigEvent) {
        if self.tx.send(event).is_err() {
            trace!("Event dropped: no subscribers");
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(RigEvent::TestStarted {
            name: "a".to_string(),
        });
        bus.emit(RigEvent::SafetyReset);

        assert_eq!(
            rx.recv().await.unwrap(),
            RigEvent::TestStarted {
                name: "a".to_string()
            }
        );
        assert_eq!(rx.recv().await.unwrap(), RigEvent::SafetyReset);
    }

    #[test]
    fn emitting_without_subscribers_is_harmless() {
        let bus = EventBus::new(4);
        assert_eq!(bus.subscriber_count(), 0);
        bus.emit(RigEvent::SafetyReset);
    }
}
