//! Live room – operations against a joined whiteboard room plus the inbound
//! `room.*` channel handler.
//!
//! ## Event contract (inbound, via [`BridgeRouter`](crate::BridgeRouter))
//!
//! | Method                    | Payload                   | Effect                          |
//! |---------------------------|---------------------------|---------------------------------|
//! | `firePhaseChanged`        | phase string              | phase machine + `PhaseChanged`  |
//! | `fireRoomStateChanged`    | partial state object      | mirror merge + `StateChanged`   |
//! | `fireDisconnectWithError` | message                   | `Closed` + `DisconnectedWithError` |
//! | `fireKickedWithReason`    | reason                    | `Kicked` + `KickedWithReason`   |
//! | `fireCanUndoStepsUpdate`  | integer                   | `CanUndoStepsUpdated`           |
//! | `fireCanRedoStepsUpdate`  | integer                   | `CanRedoStepsUpdated`           |
//! | `fireMagixEvent`          | [`EventRecord`]           | event hub dispatch              |
//! | `fireHighFrequencyEvent`  | `[EventRecord]`           | event hub batch dispatch        |
//!
//! All room lifecycle notifications funnel through one tagged [`RoomEvent`]
//! callback instead of a per-feature listener interface.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use crate::error::{payload_message, SdkError};
use crate::events::{BatchEventListener, EventHub, EventListener};
use crate::phase::{PhaseMachine, RoomPhase, RoomSignal};
use crate::registry::{parse_json, CallFuture, CallRegistry};
use crate::state::{GlobalStateDecoder, StateMirror, UpdateOrigin};
use crate::transport::{BridgeTransport, ChannelHandler};
use crate::types::{
    BroadcastState, CameraState, Command, EventRecord, MemberState, RoomMember, RoomState, Scene,
    SceneState, ViewMode,
};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Everything a live room can tell the application, as one tagged channel.
#[derive(Debug, Clone)]
pub enum RoomEvent {
    PhaseChanged(RoomPhase),
    /// The mirror accepted a remote update; `changed_keys` is the engine's
    /// authoritative change-set.
    StateChanged {
        state: Arc<RoomState>,
        changed_keys: Vec<String>,
    },
    DisconnectedWithError(String),
    KickedWithReason(String),
    CanUndoStepsUpdated(i64),
    CanRedoStepsUpdated(i64),
}

pub type RoomEventListener = Arc<dyn Fn(&RoomEvent) + Send + Sync>;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Construction-time knobs. Fixed for the lifetime of the room.
#[derive(Default)]
pub struct RoomOptions {
    /// When set, the local user's own writes merge into the snapshot but do
    /// not produce `StateChanged` events – only remote changes notify.
    pub suppress_local_echo: bool,
    /// Instance-scoped decoder for the application-defined `globalState`.
    pub global_state_decoder: Option<GlobalStateDecoder>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JoinReply {
    state: RoomState,
    observer_id: i64,
    is_writable: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WritableReply {
    is_writable: bool,
    observer_id: i64,
}

// ---------------------------------------------------------------------------
// Room
// ---------------------------------------------------------------------------

/// A joined live room. Owns exactly one state snapshot and one connection
/// phase; register it on the bridge router under the `room` channel to
/// receive engine pushes.
pub struct Room {
    uuid: String,
    calls: CallRegistry,
    state: StateMirror<RoomState>,
    phase: PhaseMachine<RoomPhase>,
    events: EventHub,
    listener: Mutex<Option<RoomEventListener>>,
    writable: Arc<AtomicBool>,
    observer_id: Arc<AtomicI64>,
    disconnected_by_self: AtomicBool,
    time_delay_secs: AtomicU32,
}

impl Room {
    /// Construct from an already-parsed initial snapshot.
    pub fn new(
        uuid: impl Into<String>,
        transport: Arc<dyn BridgeTransport>,
        initial: RoomState,
        writable: bool,
        observer_id: i64,
        options: RoomOptions,
    ) -> Arc<Room> {
        let mut mirror = StateMirror::new(initial, options.suppress_local_echo);
        if let Some(decoder) = options.global_state_decoder {
            mirror = mirror.with_global_decoder(decoder);
        }

        let room = Arc::new(Room {
            uuid: uuid.into(),
            calls: CallRegistry::new(transport),
            state: mirror,
            phase: PhaseMachine::new(RoomPhase::Connected),
            events: EventHub::new(),
            listener: Mutex::new(None),
            writable: Arc::new(AtomicBool::new(writable)),
            observer_id: Arc::new(AtomicI64::new(observer_id)),
            disconnected_by_self: AtomicBool::new(false),
            time_delay_secs: AtomicU32::new(0),
        });

        // Internal wiring: phase and state changes surface as RoomEvents.
        let weak: Weak<Room> = Arc::downgrade(&room);
        room.phase.on_change(Arc::new(move |phase| {
            if let Some(room) = weak.upgrade() {
                room.emit(RoomEvent::PhaseChanged(phase));
            }
        }));
        let weak: Weak<Room> = Arc::downgrade(&room);
        room.state.on_changed(Arc::new(move |snapshot, keys| {
            if let Some(room) = weak.upgrade() {
                room.emit(RoomEvent::StateChanged {
                    state: snapshot.clone(),
                    changed_keys: keys.to_vec(),
                });
            }
        }));

        room
    }

    /// Construct from the engine's raw join reply
    /// (`{state, observerId, isWritable}`); an error envelope in the reply
    /// fails the construction.
    pub fn from_join_reply(
        uuid: impl Into<String>,
        transport: Arc<dyn BridgeTransport>,
        raw_reply: &str,
        options: RoomOptions,
    ) -> Result<Arc<Room>, SdkError> {
        if let Some(err) = SdkError::from_reply(raw_reply) {
            return Err(err);
        }
        let reply: JoinReply = parse_json(raw_reply)?;
        Ok(Self::new(
            uuid,
            transport,
            reply.state,
            reply.is_writable,
            reply.observer_id,
            options,
        ))
    }

    /// Register the tagged event callback (one per room, replaces previous).
    pub fn on_event(&self, listener: RoomEventListener) {
        *self.listener.lock() = Some(listener);
    }

    fn emit(&self, event: RoomEvent) {
        let listener = self.listener.lock().clone();
        let Some(listener) = listener else {
            log::debug!("room {}: no event listener, dropping {event:?}", self.uuid);
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
            log::error!("room {}: event listener panicked on {event:?}", self.uuid);
        }
    }

    // -----------------------------------------------------------------------
    // Synchronous getters (local mirror, never touch the bridge)
    // -----------------------------------------------------------------------

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn state(&self) -> Arc<RoomState> {
        self.state.snapshot()
    }

    pub fn phase(&self) -> RoomPhase {
        self.phase.current()
    }

    pub fn global_state(&self) -> Value {
        self.state.snapshot().global_state.clone()
    }

    pub fn member_state(&self) -> MemberState {
        self.state.snapshot().member_state.clone()
    }

    pub fn room_members(&self) -> Vec<RoomMember> {
        self.state.snapshot().room_members.clone()
    }

    pub fn scene_state(&self) -> SceneState {
        self.state.snapshot().scene_state.clone()
    }

    pub fn broadcast_state(&self) -> BroadcastState {
        self.state.snapshot().broadcast_state.clone()
    }

    pub fn camera_state(&self) -> CameraState {
        self.state.snapshot().camera_state.clone()
    }

    pub fn zoom_scale(&self) -> f64 {
        self.state.snapshot().zoom_scale
    }

    pub fn writable(&self) -> bool {
        self.writable.load(Ordering::Acquire)
    }

    pub fn observer_id(&self) -> i64 {
        self.observer_id.load(Ordering::Acquire)
    }

    /// Whether the local user initiated the disconnect. Lets the embedding
    /// layer skip its reconnect loop for deliberate leaves.
    pub fn disconnected_by_self(&self) -> bool {
        self.disconnected_by_self.load(Ordering::Acquire)
    }

    pub fn time_delay(&self) -> u32 {
        self.time_delay_secs.load(Ordering::Acquire)
    }

    // -----------------------------------------------------------------------
    // State writes (merge locally, then tell the engine)
    // -----------------------------------------------------------------------

    /// Replace the room-wide shared global state.
    pub fn set_global_state<T: Serialize>(&self, global_state: &T) -> Result<(), SdkError> {
        self.state.put_property("globalState", global_state);
        self.calls
            .send(Command::new("room.setGlobalState").arg(global_state))
    }

    /// Replace the local member's tool state.
    pub fn set_member_state(&self, member_state: &MemberState) -> Result<(), SdkError> {
        self.state.put_property("memberState", member_state);
        self.calls
            .send(Command::new("room.setMemberState").arg(member_state))
    }

    /// Switch the perspective mode. The engine confirms through a later
    /// `broadcastState` update; the mirror is not written eagerly.
    pub fn set_view_mode(&self, mode: ViewMode) -> Result<(), SdkError> {
        self.calls.send(Command::new("room.setViewMode").arg(&mode))
    }

    /// Toggle write access. The reply also carries the (possibly new)
    /// observer id; both cached values update before the future resolves.
    pub fn set_writable(&self, writable: bool) -> CallFuture<bool> {
        let cached_writable = self.writable.clone();
        let cached_observer = self.observer_id.clone();
        self.calls.call(
            Command::new("room.setWritable").arg(&writable),
            move |raw| {
                let reply: WritableReply = parse_json(raw)?;
                cached_writable.store(reply.is_writable, Ordering::Release);
                cached_observer.store(reply.observer_id, Ordering::Release);
                Ok(reply.is_writable)
            },
        )
    }

    /// Delay rendering of remote content by `seconds` (local strokes still
    /// appear immediately).
    pub fn set_time_delay(&self, seconds: u32) -> Result<(), SdkError> {
        self.calls
            .send(Command::new("room.setTimeDelay").arg(&(u64::from(seconds) * 1000)))?;
        self.time_delay_secs.store(seconds, Ordering::Release);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Leave the room. Resolves with the engine's final global state once
    /// the engine acknowledges.
    pub fn disconnect(&self) -> CallFuture<Value> {
        self.disconnected_by_self.store(true, Ordering::Release);
        self.phase.transition(RoomSignal::DisconnectRequested);
        self.calls
            .call(Command::new("room.disconnect"), parse_json::<Value>)
    }

    // -----------------------------------------------------------------------
    // Scenes
    // -----------------------------------------------------------------------

    /// Switch every member to the scene at `path`, fire-and-forget.
    pub fn set_scene_path(&self, path: &str) -> Result<(), SdkError> {
        self.calls.send(Command::new("room.setScenePath").arg(path))
    }

    /// Switch scenes and learn whether the engine accepted the path.
    pub fn set_scene_path_checked(&self, path: &str) -> CallFuture<bool> {
        self.calls
            .call(Command::new("room.setScenePath").arg(path), |_raw| Ok(true))
    }

    /// Switch to the scene at `index` within the current directory.
    pub fn set_scene_index(&self, index: u32) -> CallFuture<bool> {
        self.calls
            .call(Command::new("room.setSceneIndex").arg(&index), |_raw| {
                Ok(true)
            })
    }

    /// Insert scenes under `dir` starting at `index`. Does not switch to
    /// them; follow with [`set_scene_path`](Self::set_scene_path).
    pub fn put_scenes(&self, dir: &str, scenes: &[Scene], index: u32) -> Result<(), SdkError> {
        self.calls.send(
            Command::new("room.putScenes")
                .arg(dir)
                .arg(&scenes)
                .arg(&index),
        )
    }

    /// Move or rename a scene.
    pub fn move_scene(&self, source_path: &str, target_dir_or_path: &str) -> Result<(), SdkError> {
        self.calls.send(
            Command::new("room.moveScene")
                .arg(source_path)
                .arg(target_dir_or_path),
        )
    }

    /// Remove a scene or a whole directory of scenes.
    pub fn remove_scenes(&self, dir_or_path: &str) -> Result<(), SdkError> {
        self.calls
            .send(Command::new("room.removeScenes").arg(dir_or_path))
    }

    /// Clear the current scene, optionally keeping its slide content.
    pub fn clean_scene(&self, retain_ppt: bool) -> Result<(), SdkError> {
        self.calls
            .send(Command::new("room.cleanScene").arg(&retain_ppt))
    }

    // -----------------------------------------------------------------------
    // Selection / history
    // -----------------------------------------------------------------------

    pub fn undo(&self) -> Result<(), SdkError> {
        self.calls.send(Command::new("room.undo"))
    }

    pub fn redo(&self) -> Result<(), SdkError> {
        self.calls.send(Command::new("room.redo"))
    }

    pub fn copy(&self) -> Result<(), SdkError> {
        self.calls.send(Command::new("room.sync.copy"))
    }

    pub fn paste(&self) -> Result<(), SdkError> {
        self.calls.send(Command::new("room.sync.paste"))
    }

    pub fn duplicate(&self) -> Result<(), SdkError> {
        self.calls.send(Command::new("room.sync.duplicate"))
    }

    pub fn delete_selection(&self) -> Result<(), SdkError> {
        self.calls.send(Command::new("room.sync.delete"))
    }

    /// History and clipboard operations only work while local serialization
    /// is enabled.
    pub fn disable_serialization(&self, disable: bool) -> Result<(), SdkError> {
        self.calls
            .send(Command::new("room.sync.disableSerialization").arg(&disable))
    }

    // -----------------------------------------------------------------------
    // Input gating
    // -----------------------------------------------------------------------

    /// Convenience toggle for both camera and tool input.
    pub fn disable_operations(&self, disable: bool) -> Result<(), SdkError> {
        self.disable_camera_transform(disable)?;
        self.disable_device_inputs(disable)
    }

    pub fn disable_camera_transform(&self, disable: bool) -> Result<(), SdkError> {
        self.calls
            .send(Command::new("room.disableCameraTransform").arg(&disable))
    }

    pub fn disable_device_inputs(&self, disable: bool) -> Result<(), SdkError> {
        self.calls
            .send(Command::new("room.disableDeviceInputs").arg(&disable))
    }

    pub fn disable_erase_image(&self, disable: bool) -> Result<(), SdkError> {
        self.calls
            .send(Command::new("room.sync.disableEraseImage").arg(&disable))
    }

    // -----------------------------------------------------------------------
    // Custom events
    // -----------------------------------------------------------------------

    /// Broadcast a custom event to every listening member.
    pub fn dispatch_magix_event<T: Serialize>(
        &self,
        event_name: &str,
        payload: &T,
    ) -> Result<(), SdkError> {
        self.calls.send(
            Command::new("room.dispatchMagixEvent")
                .arg(&json!({ "eventName": event_name, "payload": payload })),
        )
    }

    /// Listen for a named custom event (single-delivery).
    pub fn add_magix_event_listener(
        &self,
        event_name: &str,
        listener: EventListener,
    ) -> Result<(), SdkError> {
        self.events.register_listener(event_name, listener);
        self.calls
            .send(Command::new("room.addMagixEventListener").arg(event_name))
    }

    /// Listen for a named high-frequency event, batched at `fire_interval_ms`.
    pub fn add_high_frequency_event_listener(
        &self,
        event_name: &str,
        fire_interval_ms: u32,
        listener: BatchEventListener,
    ) -> Result<(), SdkError> {
        self.events
            .register_high_frequency_listener(event_name, listener);
        self.calls.send(
            Command::new("room.addHighFrequencyEventListener")
                .arg(event_name)
                .arg(&fire_interval_ms),
        )
    }

    pub fn remove_magix_event_listener(&self, event_name: &str) -> Result<(), SdkError> {
        self.events.unregister_listener(event_name);
        self.events.unregister_high_frequency_listener(event_name);
        self.calls
            .send(Command::new("room.removeMagixEventListener").arg(event_name))
    }

    // -----------------------------------------------------------------------
    // Authoritative fetches (request/response, bypass the mirror)
    // -----------------------------------------------------------------------

    /// Pull a fresh full snapshot from the engine. Deliberately does not
    /// write the local mirror – forced fetches are read-only views.
    pub fn fetch_state(&self) -> CallFuture<RoomState> {
        self.calls.call(
            Command::new("room.state.getDisplayerState"),
            parse_json::<RoomState>,
        )
    }

    pub fn fetch_global_state(&self) -> CallFuture<Value> {
        self.calls
            .call(Command::new("room.getGlobalState"), parse_json::<Value>)
    }

    pub fn fetch_member_state(&self) -> CallFuture<MemberState> {
        self.calls.call(
            Command::new("room.getMemberState"),
            parse_json::<MemberState>,
        )
    }

    pub fn fetch_room_members(&self) -> CallFuture<Vec<RoomMember>> {
        self.calls.call(
            Command::new("room.getRoomMembers"),
            parse_json::<Vec<RoomMember>>,
        )
    }

    pub fn fetch_broadcast_state(&self) -> CallFuture<BroadcastState> {
        self.calls.call(
            Command::new("room.getBroadcastState"),
            parse_json::<BroadcastState>,
        )
    }

    pub fn fetch_scene_state(&self) -> CallFuture<SceneState> {
        self.calls
            .call(Command::new("room.getSceneState"), parse_json::<SceneState>)
    }

    pub fn fetch_scenes(&self) -> CallFuture<Vec<Scene>> {
        self.calls
            .call(Command::new("room.getScenes"), parse_json::<Vec<Scene>>)
    }

    pub fn fetch_zoom_scale(&self) -> CallFuture<f64> {
        self.calls
            .call(Command::new("room.getZoomScale"), parse_json::<f64>)
    }

    pub fn fetch_phase(&self) -> CallFuture<RoomPhase> {
        self.calls
            .call(Command::new("room.getRoomPhase"), parse_phase)
    }
}

/// Engine phase reports arrive either as a JSON string or a bare literal.
fn parse_phase(raw: &str) -> Result<RoomPhase, SdkError> {
    serde_json::from_str(raw)
        .or_else(|_| serde_json::from_value(Value::String(raw.trim().to_string())))
        .map_err(|e| SdkError::Parse(format!("unrecognized room phase `{raw}`: {e}")))
}

// ---------------------------------------------------------------------------
// Inbound channel handler
// ---------------------------------------------------------------------------

impl ChannelHandler for Room {
    fn on_call(&self, method: &str, payload: &str) {
        match method {
            "firePhaseChanged" => match parse_phase(payload) {
                Ok(reported) => {
                    if let Some(signal) = RoomSignal::from_reported(reported) {
                        self.phase.transition(signal);
                    }
                }
                Err(e) => log::warn!("room {}: bad phase report: {e}", self.uuid),
            },
            "fireRoomStateChanged" => {
                self.state.apply_update_json(payload, UpdateOrigin::Remote);
            }
            "fireDisconnectWithError" => {
                self.phase.transition(RoomSignal::Closed);
                self.emit(RoomEvent::DisconnectedWithError(payload_message(payload)));
            }
            "fireKickedWithReason" => {
                self.phase.transition(RoomSignal::Kicked);
                self.emit(RoomEvent::KickedWithReason(payload_message(payload)));
            }
            "fireCanUndoStepsUpdate" => match parse_json::<i64>(payload) {
                Ok(steps) => self.emit(RoomEvent::CanUndoStepsUpdated(steps)),
                Err(e) => log::warn!("room {}: bad undo-steps payload: {e}", self.uuid),
            },
            "fireCanRedoStepsUpdate" => match parse_json::<i64>(payload) {
                Ok(steps) => self.emit(RoomEvent::CanRedoStepsUpdated(steps)),
                Err(e) => log::warn!("room {}: bad redo-steps payload: {e}", self.uuid),
            },
            "fireMagixEvent" => match parse_json::<EventRecord>(payload) {
                Ok(event) => self.events.dispatch(&event),
                Err(e) => log::warn!("room {}: bad custom event dropped: {e}", self.uuid),
            },
            "fireHighFrequencyEvent" => match parse_json::<Vec<EventRecord>>(payload) {
                Ok(events) => self.events.dispatch_batch(&events),
                Err(e) => log::warn!("room {}: bad event batch dropped: {e}", self.uuid),
            },
            other => log::debug!("room {}: unhandled inbound call `{other}`", self.uuid),
        }
    }
}
