//! Lifecycle phase machines for connection and playback state.
//!
//! A phase is a single authoritative enum, distinct from the data snapshot,
//! transitioned only by explicit triggers. Undefined `(phase, trigger)` pairs
//! are tolerated silently (with a debug log): lifecycle events routinely
//! arrive duplicated or out of order, and the engine's reports remain
//! authoritative between confirmations.
//!
//! ## Room connection
//!
//! ```text
//! connecting ──connected──▶ connected ──lost──▶ reconnecting ──connected──▶ connected
//!                 │                                    │
//!          disconnect req                            closed
//!                 ▼                                    ▼
//!           disconnecting ──closed──▶ disconnected (terminal)
//!
//! any non-terminal ──kicked──▶ kicked (terminal)
//! ```
//!
//! ## Playback
//!
//! ```text
//! waitingFirstFrame ──first frame──▶ buffering ⇄ playing ⇄ pause
//!                      playing/buffering ──ended──▶ ended ──play/stalled──▶ (seek resume)
//!                      any ──stop──▶ stopped (terminal)
//! ```

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

// ---------------------------------------------------------------------------
// Phase tables
// ---------------------------------------------------------------------------

/// A lifecycle enum with a deterministic transition table.
pub trait PhaseTable: Copy + PartialEq + fmt::Debug + Send + Sync + 'static {
    type Trigger: Copy + fmt::Debug + Send;

    /// `Some(next)` if the table defines a transition, `None` otherwise.
    /// Self-transitions should be expressed as `None`; the machine treats
    /// `Some(current)` the same way (no notification).
    fn apply(self, trigger: Self::Trigger) -> Option<Self>;

    /// Terminal phases only leave via [`PhaseMachine::reset`].
    fn is_terminal(self) -> bool;
}

/// Connection state of a live room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RoomPhase {
    Connecting,
    Connected,
    Reconnecting,
    Disconnecting,
    Disconnected,
    Kicked,
}

/// Named triggers for the room connection table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomSignal {
    /// Connection (re-)established and confirmed by the engine.
    Connected,
    /// Connection dropped; the engine is retrying.
    ConnectionLost,
    /// The local user asked to leave.
    DisconnectRequested,
    /// The connection is fully torn down.
    Closed,
    /// The server removed this member.
    Kicked,
}

impl RoomSignal {
    /// Map an engine-reported phase onto the trigger that produces it.
    /// `connecting` is the construction-time phase and maps to no trigger.
    pub fn from_reported(phase: RoomPhase) -> Option<RoomSignal> {
        match phase {
            RoomPhase::Connecting => None,
            RoomPhase::Connected => Some(RoomSignal::Connected),
            RoomPhase::Reconnecting => Some(RoomSignal::ConnectionLost),
            RoomPhase::Disconnecting => Some(RoomSignal::DisconnectRequested),
            RoomPhase::Disconnected => Some(RoomSignal::Closed),
            RoomPhase::Kicked => Some(RoomSignal::Kicked),
        }
    }
}

impl PhaseTable for RoomPhase {
    type Trigger = RoomSignal;

    fn apply(self, trigger: RoomSignal) -> Option<RoomPhase> {
        type P = RoomPhase;
        type S = RoomSignal;
        match (self, trigger) {
            (P::Connecting | P::Reconnecting, S::Connected) => Some(P::Connected),
            (P::Connecting | P::Connected, S::ConnectionLost) => Some(P::Reconnecting),
            (P::Connected, S::DisconnectRequested) => Some(P::Disconnecting),
            (P::Connected | P::Disconnecting | P::Reconnecting, S::Closed) => Some(P::Disconnected),
            (p, S::Kicked) if !p.is_terminal() => Some(P::Kicked),
            _ => None,
        }
    }

    fn is_terminal(self) -> bool {
        matches!(self, RoomPhase::Disconnected | RoomPhase::Kicked)
    }
}

/// Playback state of a replay session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PlayerPhase {
    WaitingFirstFrame,
    Playing,
    Pause,
    /// The wire name is historical.
    #[serde(rename = "stop")]
    Stopped,
    Ended,
    Buffering,
}

/// Named triggers for the playback table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackSignal {
    /// First frame decoded; playback may leave the initial phase.
    FirstFrameReady,
    Play,
    Pause,
    /// Ran out of buffered frames mid-play.
    Stalled,
    /// Buffer refilled.
    Recovered,
    /// Reached the end of the recording.
    Ended,
    /// Explicit stop; terminal until reset.
    Stop,
}

impl PlaybackSignal {
    /// Map an engine-reported phase onto the trigger that produces it.
    /// Reported `playing` maps to `Play`, which every pre-play phase
    /// accepts – the engine's reports are authoritative regardless of
    /// whether play or a buffer refill got it there.
    pub fn from_reported(phase: PlayerPhase) -> Option<PlaybackSignal> {
        match phase {
            PlayerPhase::WaitingFirstFrame => None,
            PlayerPhase::Playing => Some(PlaybackSignal::Play),
            PlayerPhase::Pause => Some(PlaybackSignal::Pause),
            PlayerPhase::Buffering => Some(PlaybackSignal::Stalled),
            PlayerPhase::Ended => Some(PlaybackSignal::Ended),
            PlayerPhase::Stopped => Some(PlaybackSignal::Stop),
        }
    }
}

impl PhaseTable for PlayerPhase {
    type Trigger = PlaybackSignal;

    fn apply(self, trigger: PlaybackSignal) -> Option<PlayerPhase> {
        type P = PlayerPhase;
        type S = PlaybackSignal;
        match (self, trigger) {
            (P::WaitingFirstFrame, S::FirstFrameReady | S::Play | S::Stalled) => {
                Some(P::Buffering)
            }
            (P::Buffering, S::Recovered | S::Play) => Some(P::Playing),
            (P::Buffering, S::Pause) => Some(P::Pause),
            (P::Playing, S::Stalled) => Some(P::Buffering),
            (P::Playing, S::Pause) => Some(P::Pause),
            (P::Pause, S::Play) => Some(P::Playing),
            (P::Pause, S::Stalled) => Some(P::Buffering),
            (P::Playing | P::Buffering, S::Ended) => Some(P::Ended),
            // A seek after the end resumes playback.
            (P::Ended, S::Play | S::Recovered) => Some(P::Playing),
            (P::Ended, S::Stalled) => Some(P::Buffering),
            (p, S::Stop) if p != P::Stopped => Some(P::Stopped),
            _ => None,
        }
    }

    fn is_terminal(self) -> bool {
        self == PlayerPhase::Stopped
    }
}

// ---------------------------------------------------------------------------
// PhaseMachine
// ---------------------------------------------------------------------------

pub type PhaseListener<P> = Arc<dyn Fn(P) + Send + Sync>;

/// Holds the last confirmed phase and applies triggers through the table.
///
/// This component never fails: invalid triggers are dropped with a log entry,
/// and the listener fires exactly once per accepted transition (old ≠ new).
pub struct PhaseMachine<P: PhaseTable> {
    current: Mutex<P>,
    listener: Mutex<Option<PhaseListener<P>>>,
}

impl<P: PhaseTable> PhaseMachine<P> {
    pub fn new(initial: P) -> Self {
        Self {
            current: Mutex::new(initial),
            listener: Mutex::new(None),
        }
    }

    /// Register the phase-change listener (one per machine, replaces any
    /// previous one).
    pub fn on_change(&self, listener: PhaseListener<P>) {
        *self.listener.lock() = Some(listener);
    }

    /// Last confirmed phase. Never blocks on anything but the internal lock,
    /// never touches the network.
    pub fn current(&self) -> P {
        *self.current.lock()
    }

    /// Apply one trigger. Returns `Some((old, new))` for an accepted
    /// transition, `None` for a no-op.
    pub fn transition(&self, trigger: P::Trigger) -> Option<(P, P)> {
        let (old, new) = {
            let mut current = self.current.lock();
            let old = *current;
            let Some(new) = old.apply(trigger) else {
                log::debug!("ignoring trigger {trigger:?} in phase {old:?}");
                return None;
            };
            if new == old {
                return None;
            }
            *current = new;
            (old, new)
        };

        let listener = self.listener.lock().clone();
        if let Some(listener) = listener {
            if catch_unwind(AssertUnwindSafe(|| listener(new))).is_err() {
                log::error!("phase listener panicked on {old:?} → {new:?}");
            }
        }
        Some((old, new))
    }

    /// Force the phase without consulting the table and without notifying.
    /// This is the reconstruction escape hatch for terminal phases.
    pub fn reset(&self, phase: P) {
        let mut current = self.current.lock();
        log::info!("phase reset {:?} → {phase:?}", *current);
        *current = phase;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
