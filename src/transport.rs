//! Bridge boundary – outbound command sink and inbound call routing.
//!
//! ## Contract
//!
//! | Direction        | Carrier                                   |
//! |------------------|-------------------------------------------|
//! | core → engine    | [`BridgeTransport::send`] (fire-and-forget) |
//! | core → engine    | [`BridgeTransport::send_expecting_reply`] (request/response) |
//! | engine → core    | [`BridgeRouter::deliver`] → [`ChannelHandler::on_call`] |
//!
//! The transport promises at-least-once delivery of a command and at-most-
//! once delivery of its reply, with FIFO ordering for replies on the same
//! logical channel. The reply handler must tolerate being invoked more than
//! once anyway – duplicate suppression lives in the call registry, not here.
//!
//! Inbound calls arrive as `channel.method` names with a raw JSON payload and
//! are processed one at a time per bridge instance.

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::SdkError;

/// Reply callback handed to the transport alongside a request/response
/// command. `Fn` rather than `FnOnce` so a misbehaving transport can invoke
/// it twice without UB – the registry ignores and flags the second call.
pub type ReplyHandler = Box<dyn Fn(&str) + Send + Sync>;

/// Outbound half of the bridge. Implemented by the embedding layer
/// (webview, JS runtime, test double); this crate is its only writer.
pub trait BridgeTransport: Send + Sync {
    /// Fire-and-forget command.
    fn send(&self, command: &str, args: &[Value]) -> Result<(), SdkError>;

    /// Request/response command. `on_reply` is invoked asynchronously with
    /// the engine's serialized reply; an `Err` return means the command never
    /// left the process and the handler was discarded.
    fn send_expecting_reply(
        &self,
        command: &str,
        args: &[Value],
        on_reply: ReplyHandler,
    ) -> Result<(), SdkError>;
}

// ---------------------------------------------------------------------------
// Inbound routing
// ---------------------------------------------------------------------------

/// Receiver of engine-initiated calls on one named channel.
pub trait ChannelHandler: Send + Sync {
    /// `method` is the name after the channel prefix; `payload` is the raw
    /// JSON argument string. Must never panic across this boundary – faults
    /// in downstream listeners are contained before they reach the caller.
    fn on_call(&self, method: &str, payload: &str);
}

/// Routes inbound `channel.method` calls to the handler registered for
/// `channel`. One handler per channel; registering again replaces the
/// previous handler (mirroring how a rejoined room supersedes the old one).
#[derive(Default)]
pub struct BridgeRouter {
    handlers: RwLock<HashMap<String, Arc<dyn ChannelHandler>>>,
}

impl BridgeRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_handler(&self, channel: impl Into<String>, handler: Arc<dyn ChannelHandler>) {
        let channel = channel.into();
        if self
            .handlers
            .write()
            .insert(channel.clone(), handler)
            .is_some()
        {
            log::debug!("replaced inbound handler for channel `{channel}`");
        }
    }

    /// Remove a channel's handler, e.g. when a room or player is released.
    pub fn unregister_handler(&self, channel: &str) -> bool {
        self.handlers.write().remove(channel).is_some()
    }

    /// Deliver one inbound call. Unroutable calls are logged and dropped –
    /// unsolicited streams are best-effort and never raise.
    pub fn deliver(&self, name: &str, payload: &str) {
        let Some((channel, method)) = name.split_once('.') else {
            log::warn!("inbound call `{name}` has no channel prefix, dropping");
            return;
        };

        // Clone the Arc out of the lock so a handler can re-register
        // from inside its own callback.
        let handler = self.handlers.read().get(channel).cloned();
        match handler {
            Some(h) => h.on_call(method, payload),
            None => log::debug!("no handler for channel `{channel}` (call `{name}`), dropping"),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recorder {
        calls: Mutex<Vec<(String, String)>>,
    }

    impl ChannelHandler for Recorder {
        fn on_call(&self, method: &str, payload: &str) {
            self.calls.lock().push((method.into(), payload.into()));
        }
    }

    #[test]
    fn routes_by_channel_prefix() {
        let router = BridgeRouter::new();
        let room = Arc::new(Recorder {
            calls: Mutex::new(Vec::new()),
        });
        router.register_handler("room", room.clone());

        router.deliver("room.firePhaseChanged", r#""connected""#);
        router.deliver("player.onPhaseChanged", r#""playing""#); // no handler, dropped
        router.deliver("nodots", "{}"); // malformed, dropped

        let calls = room.calls.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "firePhaseChanged");
    }

    #[test]
    fn reregistering_replaces_handler() {
        let router = BridgeRouter::new();
        let first = Arc::new(Recorder {
            calls: Mutex::new(Vec::new()),
        });
        let second = Arc::new(Recorder {
            calls: Mutex::new(Vec::new()),
        });
        router.register_handler("room", first.clone());
        router.register_handler("room", second.clone());

        router.deliver("room.fireRoomStateChanged", "{}");
        assert!(first.calls.lock().is_empty());
        assert_eq!(second.calls.lock().len(), 1);
    }

    #[test]
    fn unregister_stops_delivery() {
        let router = BridgeRouter::new();
        let room = Arc::new(Recorder {
            calls: Mutex::new(Vec::new()),
        });
        router.register_handler("room", room.clone());
        assert!(router.unregister_handler("room"));
        assert!(!router.unregister_handler("room"));

        router.deliver("room.firePhaseChanged", r#""connected""#);
        assert!(room.calls.lock().is_empty());
    }

    #[test]
    fn method_keeps_inner_dots() {
        // Only the first dot separates channel from method.
        let router = BridgeRouter::new();
        let room = Arc::new(Recorder {
            calls: Mutex::new(Vec::new()),
        });
        router.register_handler("room", room.clone());
        router.deliver("room.state.getDisplayerState", "{}");
        assert_eq!(room.calls.lock()[0].0, "state.getDisplayerState");
    }
}
