use std::sync::{Arc, Mutex};

use crate::protocol::BusMessage;

/// A single subscription: the subject it listens on and its sending end.
struct Subscription {
    subject: String,
    tx: flume::Sender<BusMessage>,
}

/// A broadcast-style, subject-filtered event bus built on flume channels.
///
/// Each call to [`subscribe`] registers interest in one subject; published
/// messages are delivered to every live subscriber of that subject. The bus
/// is thread-safe and can be cloned cheaply (it wraps its internals in an
/// `Arc`). Disconnected subscribers are pruned on publish.
///
/// [`subscribe`]: EventBus::subscribe
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<Vec<Subscription>>>,
}

impl EventBus {
    /// Create a new, empty event bus with no subscribers.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Register a new subscriber on `subject` and return its receiving end.
    ///
    /// The returned `Receiver` will receive every message published to that
    /// subject from this point forward.
    pub fn subscribe(&self, subject: &str) -> flume::Receiver<BusMessage> {
        let (tx, rx) = flume::unbounded();
        let mut subs = self.inner.lock().expect("EventBus lock poisoned");
        subs.push(Subscription {
            subject: subject.to_string(),
            tx,
        });
        rx
    }

    /// Publish a message to all current subscribers of `subject`.
    ///
    /// Returns an error only when the subject has subscribers and none of
    /// them could be reached; a subject nobody listens on is not an error
    /// (the durable stream retains messages in production).
    pub fn publish(&self, subject: &str, msg: BusMessage) -> Result<(), BusError> {
        let mut subs = self.inner.lock().expect("EventBus lock poisoned");
        let mut matched = 0usize;
        let mut delivered = 0usize;
        subs.retain(|sub| {
            if sub.subject != subject {
                return true;
            }
            matched += 1;
            match sub.tx.send(msg.clone()) {
                Ok(()) => {
                    delivered += 1;
                    true
                }
                Err(_) => false,
            }
        });

        if matched > delivered {
            tracing::debug!(subject, pruned = matched - delivered, "pruned dead subscribers");
        }
        if matched > 0 && delivered == 0 {
            return Err(BusError::AllSubscribersGone {
                subject: subject.to_string(),
            });
        }
        Ok(())
    }

    /// Return the number of currently active subscribers across all subjects.
    pub fn subscriber_count(&self) -> usize {
        let subs = self.inner.lock().expect("EventBus lock poisoned");
        subs.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("all subscribers of `{subject}` have disconnected")]
    AllSubscribersGone { subject: String },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;

    use super::*;
    use crate::protocol::DispatchEvent;

    fn dispatch_msg(project: &str) -> BusMessage {
        BusMessage::Dispatch(DispatchEvent {
            project_id: project.into(),
            scanned: 0,
            dispatched: 0,
            skipped: BTreeMap::new(),
            escalations: vec![],
            duration_ms: 0,
            timestamp: Utc::now(),
        })
    }

    #[test]
    fn subscriber_receives_matching_subject_only() {
        let bus = EventBus::new();
        let rx_a = bus.subscribe("loom.tasks.a");
        let rx_b = bus.subscribe("loom.tasks.b");

        bus.publish("loom.tasks.a", dispatch_msg("a")).unwrap();

        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn publish_without_subscribers_is_ok() {
        let bus = EventBus::new();
        assert!(bus.publish("loom.events.dispatch", dispatch_msg("x")).is_ok());
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe("loom.tasks.a");
        assert_eq!(bus.subscriber_count(), 1);
        drop(rx);

        // First publish notices the dead receiver and reports failure since
        // the subject had subscribers but none were reachable.
        let err = bus.publish("loom.tasks.a", dispatch_msg("a")).unwrap_err();
        assert!(matches!(err, BusError::AllSubscribersGone { .. }));
        assert_eq!(bus.subscriber_count(), 0);

        // Subsequent publishes see an empty subject and succeed.
        assert!(bus.publish("loom.tasks.a", dispatch_msg("a")).is_ok());
    }

    #[test]
    fn multiple_subscribers_all_receive() {
        let bus = EventBus::new();
        let rx1 = bus.subscribe("loom.events.dispatch");
        let rx2 = bus.subscribe("loom.events.dispatch");

        bus.publish("loom.events.dispatch", dispatch_msg("x")).unwrap();

        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }
}
