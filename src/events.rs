//! Broadcast stream of activated states.

use std::sync::{Mutex, PoisonError};

use tokio::sync::broadcast;

use crate::state::StateRef;

/// Ring size for slow subscribers. A subscriber that falls further behind
/// than this skips ahead to the oldest retained state.
const CHANNEL_CAPACITY: usize = 64;

/// Push-based sequence of the states activated during one start/stop cycle.
///
/// One instance exists per cycle, carrying an explicit `generation` so the
/// lifecycle is visible in the type itself: `stop` completes the instance
/// exactly once and the coordinator substitutes a fresh one for the next
/// `start`. Subscriptions are live broadcasts, not replay logs — a late
/// subscriber does not see states published before it subscribed.
pub struct StateEventStream {
    generation: u64,
    sender: Mutex<Option<broadcast::Sender<StateRef>>>,
}

impl StateEventStream {
    pub(crate) fn new(generation: u64) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            generation,
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Cycle identifier; increments each time the coordinator is stopped.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether this cycle has completed (the coordinator was stopped).
    pub fn is_completed(&self) -> bool {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Subscribe to states activated from this point on.
    ///
    /// Subscribing to a completed cycle yields a subscription that ends
    /// immediately without values.
    pub fn subscribe(&self) -> StateSubscription {
        let receiver = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|sender| sender.subscribe());
        StateSubscription { receiver }
    }

    pub(crate) fn publish(&self, state: StateRef) {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = sender.as_ref() {
            // Send only fails when nobody is subscribed, which is fine for
            // a live broadcast.
            let _ = sender.send(state);
        }
    }

    /// Drop the sender so every open subscription ends once it has drained
    /// the states already delivered to it.
    pub(crate) fn complete(&self) {
        self.sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
    }
}

/// A single subscriber's view of a [`StateEventStream`] cycle.
pub struct StateSubscription {
    receiver: Option<broadcast::Receiver<StateRef>>,
}

impl StateSubscription {
    /// The next activated state, in activation order, or `None` once the
    /// cycle has completed.
    pub async fn next(&mut self) -> Option<StateRef> {
        let receiver = self.receiver.as_mut()?;
        loop {
            match receiver.recv().await {
                Ok(state) => return Some(state),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("[events] subscriber lagged, skipped {skipped} state(s)");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.receiver = None;
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::state::State;

    struct Named(&'static str);

    #[async_trait]
    impl State for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn run(&self, _cancel: CancellationToken) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn state(name: &'static str) -> StateRef {
        Arc::new(Named(name))
    }

    #[tokio::test]
    async fn delivers_states_in_order() {
        let stream = StateEventStream::new(0);
        let mut subscription = stream.subscribe();
        stream.publish(state("a"));
        stream.publish(state("b"));
        assert_eq!(subscription.next().await.unwrap().name(), "a");
        assert_eq!(subscription.next().await.unwrap().name(), "b");
    }

    #[tokio::test]
    async fn completion_ends_open_subscriptions() {
        let stream = StateEventStream::new(3);
        assert_eq!(stream.generation(), 3);

        let mut subscription = stream.subscribe();
        stream.publish(state("a"));
        stream.complete();
        assert!(stream.is_completed());

        // States delivered before completion are still drained.
        assert_eq!(subscription.next().await.unwrap().name(), "a");
        assert!(subscription.next().await.is_none());
    }

    #[tokio::test]
    async fn subscribing_after_completion_is_immediately_done() {
        let stream = StateEventStream::new(0);
        stream.complete();
        let mut subscription = stream.subscribe();
        assert!(subscription.next().await.is_none());
    }

    #[tokio::test]
    async fn late_subscribers_do_not_replay() {
        let stream = StateEventStream::new(0);
        stream.publish(state("early"));
        let mut subscription = stream.subscribe();
        stream.publish(state("late"));
        assert_eq!(subscription.next().await.unwrap().name(), "late");
    }
}
