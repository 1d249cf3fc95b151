//! Custom-event fan-out – named events to at most one listener per name.
//!
//! Registration is overwrite-on-conflict (single-listener-per-name, not
//! multi-subscriber). High-frequency streams register separately and receive
//! whole batches in arrival order, bounding callback overhead for per-frame
//! telemetry. Listener panics are contained at the dispatch boundary so one
//! faulty listener cannot block delivery of subsequent events.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::types::EventRecord;

pub type EventListener = Arc<dyn Fn(&EventRecord) + Send + Sync>;
pub type BatchEventListener = Arc<dyn Fn(&[EventRecord]) + Send + Sync>;

#[derive(Default)]
pub struct EventHub {
    single: Mutex<HashMap<String, EventListener>>,
    batched: Mutex<HashMap<String, BatchEventListener>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register for single-delivery events named `event_name`, replacing any
    /// previous listener for that name.
    pub fn register_listener(&self, event_name: impl Into<String>, listener: EventListener) {
        self.single.lock().insert(event_name.into(), listener);
    }

    pub fn unregister_listener(&self, event_name: &str) -> bool {
        self.single.lock().remove(event_name).is_some()
    }

    /// Register for batched high-frequency delivery of `event_name`.
    pub fn register_high_frequency_listener(
        &self,
        event_name: impl Into<String>,
        listener: BatchEventListener,
    ) {
        self.batched.lock().insert(event_name.into(), listener);
    }

    pub fn unregister_high_frequency_listener(&self, event_name: &str) -> bool {
        self.batched.lock().remove(event_name).is_some()
    }

    /// Deliver one event to its listener, if any. Fire-and-forget: the
    /// record is not retained after dispatch.
    pub fn dispatch(&self, event: &EventRecord) {
        // Clone the Arc out of the lock so the listener can re-register
        // without deadlocking.
        let listener = self.single.lock().get(&event.event_name).cloned();
        let Some(listener) = listener else {
            log::debug!("no listener for event `{}`, dropping", event.event_name);
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
            log::error!("listener for event `{}` panicked", event.event_name);
        }
    }

    /// Deliver a batch of same-named events as one call, preserving order.
    pub fn dispatch_batch(&self, events: &[EventRecord]) {
        let Some(first) = events.first() else {
            return;
        };
        let listener = self.batched.lock().get(&first.event_name).cloned();
        let Some(listener) = listener else {
            log::debug!(
                "no high-frequency listener for event `{}`, dropping batch of {}",
                first.event_name,
                events.len()
            );
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| listener(events))).is_err() {
            log::error!(
                "high-frequency listener for event `{}` panicked",
                first.event_name
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn event(name: &str, n: i64) -> EventRecord {
        EventRecord {
            event_name: name.into(),
            payload: json!({ "n": n }),
            scope: String::new(),
            author_id: 1,
        }
    }

    #[test]
    fn delivers_to_registered_listener() {
        let hub = EventHub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        hub.register_listener(
            "chat",
            Arc::new(move |ev| sink.lock().push(ev.payload.clone())),
        );

        hub.dispatch(&event("chat", 1));
        hub.dispatch(&event("other", 2)); // no listener, dropped
        assert_eq!(*seen.lock(), vec![json!({"n": 1})]);
    }

    #[test]
    fn registration_overwrites_previous_listener() {
        let hub = EventHub::new();
        let first = Arc::new(Mutex::new(0usize));
        let second = Arc::new(Mutex::new(0usize));
        {
            let sink = first.clone();
            hub.register_listener("chat", Arc::new(move |_| *sink.lock() += 1));
        }
        {
            let sink = second.clone();
            hub.register_listener("chat", Arc::new(move |_| *sink.lock() += 1));
        }

        hub.dispatch(&event("chat", 1));
        assert_eq!(*first.lock(), 0);
        assert_eq!(*second.lock(), 1);
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let hub = EventHub::new();
        hub.register_listener("x", Arc::new(|_| panic!("listener bug")));

        let seen = Arc::new(Mutex::new(0usize));
        let sink = seen.clone();
        hub.register_listener("y", Arc::new(move |_| *sink.lock() += 1));

        hub.dispatch(&event("x", 1));
        hub.dispatch(&event("y", 2));
        assert_eq!(*seen.lock(), 1);

        // A replacement listener for the faulty name still gets events.
        let fixed = Arc::new(Mutex::new(0usize));
        let sink = fixed.clone();
        hub.register_listener("x", Arc::new(move |_| *sink.lock() += 1));
        hub.dispatch(&event("x", 3));
        assert_eq!(*fixed.lock(), 1);
    }

    #[test]
    fn batch_preserves_order_and_arrives_once() {
        let hub = EventHub::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let calls = Arc::new(Mutex::new(0usize));
        {
            let seen = seen.clone();
            let calls = calls.clone();
            hub.register_high_frequency_listener(
                "telemetry",
                Arc::new(move |batch| {
                    *calls.lock() += 1;
                    seen.lock()
                        .extend(batch.iter().map(|ev| ev.payload["n"].as_i64().unwrap()));
                }),
            );
        }

        let batch: Vec<_> = (0..5).map(|n| event("telemetry", n)).collect();
        hub.dispatch_batch(&batch);

        assert_eq!(*calls.lock(), 1);
        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn empty_batch_is_a_noop() {
        let hub = EventHub::new();
        hub.dispatch_batch(&[]);
    }

    #[test]
    fn single_and_batched_registrations_are_independent() {
        let hub = EventHub::new();
        let singles = Arc::new(Mutex::new(0usize));
        {
            let sink = singles.clone();
            hub.register_listener("telemetry", Arc::new(move |_| *sink.lock() += 1));
        }

        // Batch delivery must not fall back to the single listener.
        hub.dispatch_batch(&[event("telemetry", 1)]);
        assert_eq!(*singles.lock(), 0);

        assert!(hub.unregister_listener("telemetry"));
        assert!(!hub.unregister_high_frequency_listener("telemetry"));
    }

    #[test]
    fn listener_can_reregister_from_callback() {
        let hub = Arc::new(EventHub::new());
        let inner = hub.clone();
        let replaced = Arc::new(Mutex::new(0usize));
        let replaced_sink = replaced.clone();
        hub.register_listener(
            "swap",
            Arc::new(move |_| {
                let sink = replaced_sink.clone();
                inner.register_listener("swap", Arc::new(move |_| *sink.lock() += 1));
            }),
        );

        hub.dispatch(&event("swap", 1)); // swaps the listener, no deadlock
        hub.dispatch(&event("swap", 2));
        assert_eq!(*replaced.lock(), 1);
    }
}
