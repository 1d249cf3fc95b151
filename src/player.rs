//! Playback room – transport controls for a recorded session plus the
//! inbound `player.*` channel handler.
//!
//! ## Event contract (inbound, via [`BridgeRouter`](crate::BridgeRouter))
//!
//! | Method                  | Payload               | Effect                         |
//! |-------------------------|-----------------------|--------------------------------|
//! | `onPhaseChanged`        | phase string          | phase machine + `PhaseChanged` |
//! | `onPlayerStateChanged`  | partial state object  | mirror merge + `StateChanged`  |
//! | `onLoadFirstFrame`      | (none)                | `FirstFrameReady` + `LoadFirstFrame` |
//! | `onSliceChanged`        | slice id string       | `SliceChanged`                 |
//! | `onScheduleTimeChanged` | integer ms            | time cache + `ScheduleTimeChanged` |
//! | `onStoppedWithError`    | message               | `Stop` + `StoppedWithError`    |
//! | `fireMagixEvent`        | [`EventRecord`]       | event hub dispatch             |
//! | `fireHighFrequencyEvent`| `[EventRecord]`       | event hub batch dispatch       |
//!
//! Playback state questions split the same way as live rooms: the mirror and
//! caches answer synchronously from the last confirmed values, the `fetch_*`
//! calls round-trip to the engine.

use parking_lot::Mutex;
use serde_json::Value;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};

use crate::error::{payload_message, SdkError};
use crate::events::{BatchEventListener, EventHub, EventListener};
use crate::phase::{PhaseMachine, PlaybackSignal, PlayerPhase};
use crate::registry::{parse_json, CallFuture, CallRegistry};
use crate::state::{GlobalStateDecoder, StateMirror, UpdateOrigin};
use crate::transport::{BridgeTransport, ChannelHandler};
use crate::types::{Command, EventRecord, ObserverMode, PlayerState, PlayerTimeInfo};

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Everything a playback session can tell the application, as one tagged
/// channel.
#[derive(Debug, Clone)]
pub enum PlayerEvent {
    PhaseChanged(PlayerPhase),
    StateChanged {
        state: Arc<PlayerState>,
        changed_keys: Vec<String>,
    },
    /// The first frame is decoded; the session is ready to play.
    LoadFirstFrame,
    /// Playback crossed into another recording slice.
    SliceChanged(String),
    /// Timeline position report, milliseconds from the recording start.
    ScheduleTimeChanged(i64),
    StoppedWithError(String),
}

pub type PlayerEventListener = Arc<dyn Fn(&PlayerEvent) + Send + Sync>;

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct PlayerOptions {
    /// Instance-scoped decoder for the application-defined `globalState`.
    pub global_state_decoder: Option<GlobalStateDecoder>,
}

// ---------------------------------------------------------------------------
// Player
// ---------------------------------------------------------------------------

/// A constructed playback session. Register it on the bridge router under
/// the `player` channel to receive engine pushes.
pub struct Player {
    uuid: String,
    calls: CallRegistry,
    state: StateMirror<PlayerState>,
    phase: PhaseMachine<PlayerPhase>,
    events: EventHub,
    listener: Mutex<Option<PlayerEventListener>>,
    /// Last confirmed playback speed multiplier.
    playback_speed: Mutex<f64>,
    /// Timeline facts, position refreshed from schedule-time pushes.
    time_info: Mutex<PlayerTimeInfo>,
}

impl Player {
    pub fn new(
        uuid: impl Into<String>,
        transport: Arc<dyn BridgeTransport>,
        time_info: PlayerTimeInfo,
        options: PlayerOptions,
    ) -> Arc<Player> {
        let mut mirror = StateMirror::new(PlayerState::default(), false);
        if let Some(decoder) = options.global_state_decoder {
            mirror = mirror.with_global_decoder(decoder);
        }

        let player = Arc::new(Player {
            uuid: uuid.into(),
            calls: CallRegistry::new(transport),
            state: mirror,
            phase: PhaseMachine::new(PlayerPhase::WaitingFirstFrame),
            events: EventHub::new(),
            listener: Mutex::new(None),
            playback_speed: Mutex::new(1.0),
            time_info: Mutex::new(time_info),
        });

        let weak: Weak<Player> = Arc::downgrade(&player);
        player.phase.on_change(Arc::new(move |phase| {
            if let Some(player) = weak.upgrade() {
                player.emit(PlayerEvent::PhaseChanged(phase));
            }
        }));
        let weak: Weak<Player> = Arc::downgrade(&player);
        player.state.on_changed(Arc::new(move |snapshot, keys| {
            if let Some(player) = weak.upgrade() {
                player.emit(PlayerEvent::StateChanged {
                    state: snapshot.clone(),
                    changed_keys: keys.to_vec(),
                });
            }
        }));

        player
    }

    /// Register the tagged event callback (one per player, replaces previous).
    pub fn on_event(&self, listener: PlayerEventListener) {
        *self.listener.lock() = Some(listener);
    }

    fn emit(&self, event: PlayerEvent) {
        let listener = self.listener.lock().clone();
        let Some(listener) = listener else {
            log::debug!("player {}: no event listener, dropping {event:?}", self.uuid);
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
            log::error!("player {}: event listener panicked on {event:?}", self.uuid);
        }
    }

    // -----------------------------------------------------------------------
    // Synchronous getters
    // -----------------------------------------------------------------------

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn state(&self) -> Arc<PlayerState> {
        self.state.snapshot()
    }

    pub fn phase(&self) -> PlayerPhase {
        self.phase.current()
    }

    pub fn observer_mode(&self) -> ObserverMode {
        self.state.snapshot().observer_mode
    }

    pub fn playback_speed(&self) -> f64 {
        *self.playback_speed.lock()
    }

    /// Timeline facts with the last reported position. Durations are static;
    /// only `schedule_time` moves.
    pub fn time_info(&self) -> PlayerTimeInfo {
        self.time_info.lock().clone()
    }

    // -----------------------------------------------------------------------
    // Transport controls
    // -----------------------------------------------------------------------

    /// Start or resume playback. Phase confirmation arrives through
    /// `onPhaseChanged`; nothing changes locally until then.
    pub fn play(&self) -> Result<(), SdkError> {
        self.calls.send(Command::new("player.play"))
    }

    pub fn pause(&self) -> Result<(), SdkError> {
        self.calls.send(Command::new("player.pause"))
    }

    /// Stop and release playback resources. Terminal until the session is
    /// reconstructed.
    pub fn stop(&self) -> Result<(), SdkError> {
        self.calls.send(Command::new("player.stop"))
    }

    /// Jump to `schedule_time_ms` on the timeline.
    pub fn seek_to_schedule_time(&self, schedule_time_ms: i64) -> Result<(), SdkError> {
        self.calls
            .send(Command::new("player.seekToScheduleTime").arg(&schedule_time_ms))
    }

    /// Set the playback speed multiplier (1.0 = recorded speed). The cache
    /// updates eagerly; pauses retain the value.
    pub fn set_playback_speed(&self, multiplier: f64) -> Result<(), SdkError> {
        self.calls
            .send(Command::new("player.setPlaybackSpeed").arg(&multiplier))?;
        *self.playback_speed.lock() = multiplier;
        Ok(())
    }

    /// Switch between following the recording's perspective and free viewing.
    pub fn set_observer_mode(&self, mode: ObserverMode) -> Result<(), SdkError> {
        self.calls
            .send(Command::new("player.setObserverMode").arg(&mode))
    }

    // -----------------------------------------------------------------------
    // Custom events
    // -----------------------------------------------------------------------

    /// Listen for a named custom event recorded in the session.
    pub fn add_magix_event_listener(
        &self,
        event_name: &str,
        listener: EventListener,
    ) -> Result<(), SdkError> {
        self.events.register_listener(event_name, listener);
        self.calls
            .send(Command::new("player.addMagixEventListener").arg(event_name))
    }

    pub fn add_high_frequency_event_listener(
        &self,
        event_name: &str,
        fire_interval_ms: u32,
        listener: BatchEventListener,
    ) -> Result<(), SdkError> {
        self.events
            .register_high_frequency_listener(event_name, listener);
        self.calls.send(
            Command::new("player.addHighFrequencyEventListener")
                .arg(event_name)
                .arg(&fire_interval_ms),
        )
    }

    pub fn remove_magix_event_listener(&self, event_name: &str) -> Result<(), SdkError> {
        self.events.unregister_listener(event_name);
        self.events.unregister_high_frequency_listener(event_name);
        self.calls
            .send(Command::new("player.removeMagixEventListener").arg(event_name))
    }

    // -----------------------------------------------------------------------
    // Authoritative fetches
    // -----------------------------------------------------------------------

    pub fn fetch_phase(&self) -> CallFuture<PlayerPhase> {
        self.calls
            .call(Command::new("player.state.phase"), parse_phase)
    }

    /// Pull a fresh full snapshot. Read-only view; the mirror is not written.
    pub fn fetch_state(&self) -> CallFuture<PlayerState> {
        self.calls.call(
            Command::new("player.state.playerState"),
            parse_json::<PlayerState>,
        )
    }

    pub fn fetch_time_info(&self) -> CallFuture<PlayerTimeInfo> {
        self.calls.call(
            Command::new("player.state.timeInfo"),
            parse_json::<PlayerTimeInfo>,
        )
    }

    pub fn fetch_playback_speed(&self) -> CallFuture<f64> {
        self.calls.call(
            Command::new("player.state.playbackSpeed"),
            parse_json::<f64>,
        )
    }
}

/// Engine phase reports arrive either as a JSON string or a bare literal.
fn parse_phase(raw: &str) -> Result<PlayerPhase, SdkError> {
    serde_json::from_str(raw)
        .or_else(|_| serde_json::from_value(Value::String(raw.trim().to_string())))
        .map_err(|e| SdkError::Parse(format!("unrecognized player phase `{raw}`: {e}")))
}

fn parse_string(raw: &str) -> String {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::String(s)) => s,
        _ => raw.trim().to_string(),
    }
}

// ---------------------------------------------------------------------------
// Inbound channel handler
// ---------------------------------------------------------------------------

impl ChannelHandler for Player {
    fn on_call(&self, method: &str, payload: &str) {
        match method {
            "onPhaseChanged" => match parse_phase(payload) {
                Ok(reported) => {
                    if let Some(signal) = PlaybackSignal::from_reported(reported) {
                        self.phase.transition(signal);
                    }
                }
                Err(e) => log::warn!("player {}: bad phase report: {e}", self.uuid),
            },
            "onPlayerStateChanged" => {
                self.state.apply_update_json(payload, UpdateOrigin::Remote);
            }
            "onLoadFirstFrame" => {
                self.phase.transition(PlaybackSignal::FirstFrameReady);
                self.emit(PlayerEvent::LoadFirstFrame);
            }
            "onSliceChanged" => {
                self.emit(PlayerEvent::SliceChanged(parse_string(payload)));
            }
            "onScheduleTimeChanged" => match parse_json::<i64>(payload) {
                Ok(ms) => {
                    self.time_info.lock().schedule_time = ms;
                    self.emit(PlayerEvent::ScheduleTimeChanged(ms));
                }
                Err(e) => log::warn!("player {}: bad schedule-time payload: {e}", self.uuid),
            },
            "onStoppedWithError" => {
                self.phase.transition(PlaybackSignal::Stop);
                self.emit(PlayerEvent::StoppedWithError(payload_message(payload)));
            }
            "fireMagixEvent" => match parse_json::<EventRecord>(payload) {
                Ok(event) => self.events.dispatch(&event),
                Err(e) => log::warn!("player {}: bad custom event dropped: {e}", self.uuid),
            },
            "fireHighFrequencyEvent" => match parse_json::<Vec<EventRecord>>(payload) {
                Ok(events) => self.events.dispatch_batch(&events),
                Err(e) => log::warn!("player {}: bad event batch dropped: {e}", self.uuid),
            },
            other => log::debug!("player {}: unhandled inbound call `{other}`", self.uuid),
        }
    }
}
