//! Slate Bridge
//!
//! Client core for a shared-whiteboard engine reached over an asynchronous
//! JSON string bridge: typed mirrors of engine-held state, exactly-once
//! request/response correlation, lifecycle phase machines, and custom-event
//! fan-out. The real transport (webview, JS runtime) and all rendering live
//! in the embedding layer.
//!
//! ## Architecture
//!
//! ```text
//! Room / Player  (room.rs, player.rs)   ← operations + inbound handlers
//!   ├── CallRegistry  (registry.rs)     ← request/response correlation
//!   │     └── BridgeTransport (transport.rs, outbound trait)
//!   ├── StateMirror   (state.rs)        ← copy-on-write snapshot + change-set
//!   ├── PhaseMachine  (phase.rs)        ← connection / playback lifecycle
//!   └── EventHub      (events.rs)       ← named custom-event dispatch
//!
//! BridgeRouter (transport.rs) ← engine-initiated `channel.method` calls
//! ```
//!
//! Synchronous getters answer from the local mirror and never block on the
//! engine; `fetch_*` methods round-trip and resolve a [`CallFuture`].

pub mod error;
pub mod events;
pub mod phase;
pub mod player;
pub mod registry;
pub mod room;
pub mod state;
pub mod transport;
pub mod types;

// Convenience re-exports: the whole public surface at the crate root.
pub use error::SdkError;
pub use events::{BatchEventListener, EventHub, EventListener};
pub use phase::{
    PhaseListener, PhaseMachine, PhaseTable, PlaybackSignal, PlayerPhase, RoomPhase, RoomSignal,
};
pub use player::{Player, PlayerEvent, PlayerEventListener, PlayerOptions};
pub use registry::{parse_json, CallFuture, CallRegistry};
pub use room::{Room, RoomEvent, RoomEventListener, RoomOptions};
pub use state::{DisplayerState, GlobalStateDecoder, StateListener, StateMirror, UpdateOrigin};
pub use transport::{BridgeRouter, BridgeTransport, ChannelHandler, ReplyHandler};
pub use types::{
    BroadcastState, CameraState, Command, EventRecord, MemberState, ObserverMode, PlayerState,
    PlayerTimeInfo, RoomMember, RoomState, Scene, SceneState, ViewMode,
};
