//! Typed state mirror – local copy of engine-held state plus change-set
//! computation.
//!
//! ## Merge rules
//!
//! 1. Updates are strictly partial: only the top-level keys present in the
//!    payload are touched.
//! 2. Replacement is whole-value per key; there is no deep merge below a
//!    top-level key.
//! 3. A key that fails to decode is skipped and logged – partial corruption
//!    never blocks unrelated keys.
//! 4. The changed-key report is value-blind: the engine is the source of
//!    truth for "did this change", so a key is reported even when the new
//!    value equals the old one.
//!
//! Readers get the snapshot as an `Arc` swapped atomically under a short
//! write lock, so a concurrent [`StateMirror::snapshot`] observes either the
//! pre-update or the post-update state, never a torn one.

use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use crate::error::SdkError;
use crate::types::{PlayerState, RoomState};

// ---------------------------------------------------------------------------
// DisplayerState
// ---------------------------------------------------------------------------

/// A state snapshot with a fixed set of top-level keys, each decodable
/// independently.
pub trait DisplayerState: Clone + Send + Sync + 'static {
    /// The fixed key set for this state kind.
    fn keys() -> &'static [&'static str];

    /// Replace the field for `key` with the decoded `raw` value.
    fn apply_key(&mut self, key: &str, raw: &Value) -> Result<(), SdkError>;
}

fn decode<T: DeserializeOwned>(raw: &Value) -> Result<T, SdkError> {
    serde_json::from_value(raw.clone()).map_err(SdkError::from)
}

impl DisplayerState for RoomState {
    fn keys() -> &'static [&'static str] {
        &[
            "globalState",
            "memberState",
            "roomMembers",
            "sceneState",
            "cameraState",
            "broadcastState",
            "zoomScale",
        ]
    }

    fn apply_key(&mut self, key: &str, raw: &Value) -> Result<(), SdkError> {
        match key {
            "globalState" => self.global_state = raw.clone(),
            "memberState" => self.member_state = decode(raw)?,
            "roomMembers" => self.room_members = decode(raw)?,
            "sceneState" => self.scene_state = decode(raw)?,
            "cameraState" => self.camera_state = decode(raw)?,
            "broadcastState" => self.broadcast_state = decode(raw)?,
            "zoomScale" => self.zoom_scale = decode(raw)?,
            other => return Err(SdkError::Parse(format!("unknown room state key `{other}`"))),
        }
        Ok(())
    }
}

impl DisplayerState for PlayerState {
    fn keys() -> &'static [&'static str] {
        &["globalState", "sceneState", "cameraState", "observerMode"]
    }

    fn apply_key(&mut self, key: &str, raw: &Value) -> Result<(), SdkError> {
        match key {
            "globalState" => self.global_state = raw.clone(),
            "sceneState" => self.scene_state = decode(raw)?,
            "cameraState" => self.camera_state = decode(raw)?,
            "observerMode" => self.observer_mode = decode(raw)?,
            other => {
                return Err(SdkError::Parse(format!(
                    "unknown player state key `{other}`"
                )))
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// StateMirror
// ---------------------------------------------------------------------------

/// Where an update came from. Local writes may be echo-suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// The local user's own write, echoed back through the setter path.
    Local,
    /// An engine-pushed update (another member, or server-side change).
    Remote,
}

/// Instance-scoped decoder for the application-defined `globalState` value,
/// applied before the value is stored. Replaces the original design's
/// process-wide custom-class registration.
pub type GlobalStateDecoder = Arc<dyn Fn(&Value) -> Result<Value, SdkError> + Send + Sync>;

pub type StateListener<S> = Arc<dyn Fn(&Arc<S>, &[String]) + Send + Sync>;

/// Last-known snapshot of one engine-held state object.
///
/// Exclusively owned by one room or player; the merge path is the only
/// writer. Application code gets read-only `Arc` views.
pub struct StateMirror<S: DisplayerState> {
    snapshot: RwLock<Arc<S>>,
    /// Fixed at construction: when set, local-origin updates merge but do
    /// not notify – only remotely originated changes surface to listeners.
    suppress_local_echo: bool,
    global_decoder: Option<GlobalStateDecoder>,
    listener: Mutex<Option<StateListener<S>>>,
}

impl<S: DisplayerState> StateMirror<S> {
    pub fn new(initial: S, suppress_local_echo: bool) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(initial)),
            suppress_local_echo,
            global_decoder: None,
            listener: Mutex::new(None),
        }
    }

    /// Build from the engine's initial full-state payload.
    pub fn from_json(raw: &str, suppress_local_echo: bool) -> Result<Self, SdkError>
    where
        S: DeserializeOwned,
    {
        let initial: S = serde_json::from_str(raw)?;
        Ok(Self::new(initial, suppress_local_echo))
    }

    pub fn with_global_decoder(mut self, decoder: GlobalStateDecoder) -> Self {
        self.global_decoder = Some(decoder);
        self
    }

    /// Register the change listener (one per mirror, replaces the previous).
    pub fn on_changed(&self, listener: StateListener<S>) {
        *self.listener.lock() = Some(listener);
    }

    /// Current snapshot; never triggers a remote fetch.
    pub fn snapshot(&self) -> Arc<S> {
        self.snapshot.read().clone()
    }

    /// Merge a partial update and notify the listener with the keys that
    /// changed (unless the origin is local and echoes are suppressed).
    ///
    /// Returns the applied key set. Keys outside the fixed set or failing to
    /// decode are dropped with a log entry and excluded from the report.
    pub fn apply_update(&self, partial: &Map<String, Value>, origin: UpdateOrigin) -> Vec<String> {
        let mut changed = Vec::with_capacity(partial.len());

        let next = {
            let mut guard = self.snapshot.write();
            let mut next: S = (**guard).clone();

            for (key, raw) in partial {
                if !S::keys().contains(&key.as_str()) {
                    log::warn!("dropping unknown state key `{key}`");
                    continue;
                }

                let decoded;
                let raw = if key == "globalState" {
                    match &self.global_decoder {
                        Some(dec) => match dec(raw) {
                            Ok(v) => {
                                decoded = v;
                                &decoded
                            }
                            Err(e) => {
                                log::warn!("custom globalState decoder rejected update: {e}");
                                continue;
                            }
                        },
                        None => raw,
                    }
                } else {
                    raw
                };

                match next.apply_key(key, raw) {
                    Ok(()) => changed.push(key.clone()),
                    Err(e) => log::warn!("dropping undecodable state key `{key}`: {e}"),
                }
            }

            let next = Arc::new(next);
            *guard = next.clone();
            next
        };

        if changed.is_empty() {
            return changed;
        }
        if origin == UpdateOrigin::Local && self.suppress_local_echo {
            log::debug!("suppressing local echo for keys {changed:?}");
            return changed;
        }

        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            if catch_unwind(AssertUnwindSafe(|| listener(&next, &changed))).is_err() {
                log::error!("state-change listener panicked; keys {changed:?}");
            }
        }

        changed
    }

    /// Merge a raw JSON object payload (the engine's push format).
    pub fn apply_update_json(&self, raw: &str, origin: UpdateOrigin) -> Vec<String> {
        match serde_json::from_str::<Value>(raw) {
            Ok(Value::Object(partial)) => self.apply_update(&partial, origin),
            Ok(other) => {
                log::warn!("state update is not an object ({other}), dropping");
                Vec::new()
            }
            Err(e) => {
                log::warn!("undecodable state update dropped: {e}");
                Vec::new()
            }
        }
    }

    /// Local write: serialize `value` under `key` and merge it with
    /// [`UpdateOrigin::Local`].
    pub fn put_property<T: serde::Serialize>(&self, key: &str, value: &T) {
        let raw = match serde_json::to_value(value) {
            Ok(v) => v,
            Err(e) => {
                log::error!("cannot serialize local write for `{key}`: {e}");
                return;
            }
        };
        let mut partial = Map::new();
        partial.insert(key.to_string(), raw);
        self.apply_update(&partial, UpdateOrigin::Local);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
