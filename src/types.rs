//! Core wire types shared across all modules.
//!
//! Everything here crosses the bridge as camelCase JSON. The structs are
//! deliberately thin: the engine owns the full shape of each state property,
//! this side only types the fields the client core actually reads.

use crate::error::SdkError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Command
// ---------------------------------------------------------------------------

/// A named command with positional JSON arguments, immutable once issued.
///
/// Argument serialization failures are captured on the command itself and
/// surface as an immediately-failed call when the command is sent – the
/// builder chain stays infallible so call sites read linearly.
#[derive(Debug)]
pub struct Command {
    name: String,
    args: Vec<Value>,
    defect: Option<SdkError>,
}

impl Command {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            args: Vec::new(),
            defect: None,
        }
    }

    /// Append one positional argument.
    pub fn arg<T: Serialize + ?Sized>(mut self, value: &T) -> Self {
        match serde_json::to_value(value) {
            Ok(v) => self.args.push(v),
            Err(e) => {
                log::error!("failed to serialize argument for `{}`: {e}", self.name);
                // First defect wins; the command is already unusable.
                if self.defect.is_none() {
                    self.defect = Some(SdkError::Transport(format!(
                        "cannot serialize argument for `{}`: {e}",
                        self.name
                    )));
                }
            }
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    /// Consume the command, splitting it into send parts or its defect.
    pub(crate) fn into_parts(self) -> Result<(String, Vec<Value>), SdkError> {
        match self.defect {
            Some(e) => Err(e),
            None => Ok((self.name, self.args)),
        }
    }
}

// ---------------------------------------------------------------------------
// Custom events
// ---------------------------------------------------------------------------

/// One inbound custom event, fire-and-forget after dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub event_name: String,
    /// Opaque application payload.
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub scope: String,
    /// Member ID of the sender.
    #[serde(default)]
    pub author_id: i64,
}

// ---------------------------------------------------------------------------
// Shared state fragments
// ---------------------------------------------------------------------------

/// Perspective mode for live-room members.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ViewMode {
    Broadcaster,
    Follower,
    #[default]
    Freedom,
}

/// Tool state of the local member (stroke settings and active appliance).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MemberState {
    pub current_appliance_name: String,
    /// RGB, 0–255 per channel.
    pub stroke_color: Vec<u8>,
    pub stroke_width: f64,
    pub text_size: f64,
}

/// One writable member of a live room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomMember {
    pub member_id: i64,
    /// Application-defined payload attached at join time.
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Scene {
    pub name: String,
    pub component_count: u64,
}

/// Current scene directory contents plus the active scene.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SceneState {
    pub scenes: Vec<Scene>,
    pub scene_path: String,
    pub index: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CameraState {
    pub center_x: f64,
    pub center_y: f64,
    pub scale: f64,
}

impl Default for CameraState {
    fn default() -> Self {
        Self {
            center_x: 0.0,
            center_y: 0.0,
            scale: 1.0,
        }
    }
}

/// Perspective-sharing state of the room.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BroadcastState {
    pub mode: ViewMode,
    pub broadcaster_id: Option<i64>,
}

/// Observer behaviour during playback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ObserverMode {
    /// Follow whoever the recording followed.
    #[default]
    Directory,
    Freedom,
}

/// Static timeline facts about a playback session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlayerTimeInfo {
    /// Current position on the timeline, milliseconds.
    pub schedule_time: i64,
    /// Total duration, milliseconds.
    pub time_duration: i64,
    pub frames_count: i64,
    /// Wall-clock start of the recording, unix milliseconds.
    pub begin_timestamp: i64,
}

// ---------------------------------------------------------------------------
// Top-level snapshots
// ---------------------------------------------------------------------------

/// Full live-room state snapshot mirrored from the engine.
///
/// `global_state` stays an opaque [`Value`]: its shape is application-defined
/// and an injectable decoder on the mirror may normalize it (see
/// [`StateMirror`](crate::StateMirror)).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RoomState {
    pub global_state: Value,
    pub member_state: MemberState,
    pub room_members: Vec<RoomMember>,
    pub scene_state: SceneState,
    pub camera_state: CameraState,
    pub broadcast_state: BroadcastState,
    pub zoom_scale: f64,
}

/// Full playback state snapshot mirrored from the engine.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlayerState {
    pub global_state: Value,
    pub scene_state: SceneState,
    pub camera_state: CameraState,
    pub observer_mode: ObserverMode,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_collects_args_in_order() {
        let cmd = Command::new("room.putScenes")
            .arg("dir")
            .arg(&vec![Scene::default()])
            .arg(&0);
        assert_eq!(cmd.name(), "room.putScenes");
        assert_eq!(cmd.args().len(), 3);
        let (name, args) = cmd.into_parts().unwrap();
        assert_eq!(name, "room.putScenes");
        assert_eq!(args[2], serde_json::json!(0));
    }

    #[test]
    fn command_defect_surfaces_on_send() {
        // f64::NAN is not representable in JSON.
        let cmd = Command::new("room.moveCamera").arg(&f64::NAN);
        match cmd.into_parts() {
            Err(SdkError::Transport(msg)) => assert!(msg.contains("room.moveCamera")),
            other => panic!("expected transport error, got {other:?}"),
        }
    }

    #[test]
    fn event_record_decodes_with_defaults() {
        let raw = r#"{"eventName": "ping", "payload": {"n": 1}}"#;
        let ev: EventRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(ev.event_name, "ping");
        assert_eq!(ev.author_id, 0);
        assert_eq!(ev.scope, "");
    }

    #[test]
    fn room_state_decodes_camel_case() {
        let raw = r#"{
            "globalState": {"lesson": 3},
            "memberState": {"currentApplianceName": "pencil", "strokeColor": [255, 0, 0]},
            "roomMembers": [{"memberId": 7, "payload": {"nickname": "ada"}}],
            "sceneState": {"scenePath": "/init", "index": 0, "scenes": [{"name": "init"}]},
            "broadcastState": {"mode": "broadcaster", "broadcasterId": 7},
            "zoomScale": 2.0
        }"#;
        let state: RoomState = serde_json::from_str(raw).unwrap();
        assert_eq!(state.member_state.current_appliance_name, "pencil");
        assert_eq!(state.room_members[0].member_id, 7);
        assert_eq!(state.broadcast_state.mode, ViewMode::Broadcaster);
        assert_eq!(state.zoom_scale, 2.0);
        // Field absent from the payload falls back to its default.
        assert_eq!(state.camera_state.scale, 1.0);
    }

    #[test]
    fn player_state_defaults() {
        let state: PlayerState = serde_json::from_str("{}").unwrap();
        assert_eq!(state.observer_mode, ObserverMode::Directory);
    }
}
