//! Live-room integration tests: public API against a scripted transport.

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;
    use serde_json::{json, Value};
    use slate_bridge::{
        BridgeRouter, BridgeTransport, MemberState, ReplyHandler, Room, RoomEvent, RoomOptions,
        RoomPhase, RoomState, SdkError, ViewMode,
    };
    use std::sync::Arc;

    /// Transport double: records outbound traffic, parks reply handlers for
    /// manual triggering from the test body.
    #[derive(Default)]
    struct ScriptedBridge {
        sent: Mutex<Vec<(String, Vec<Value>)>>,
        handlers: Mutex<Vec<(String, ReplyHandler)>>,
    }

    impl ScriptedBridge {
        fn sent_commands(&self) -> Vec<String> {
            self.sent.lock().iter().map(|(c, _)| c.clone()).collect()
        }

        fn reply_to(&self, command: &str, raw: &str) {
            let handlers = self.handlers.lock();
            let (_, handler) = handlers
                .iter()
                .find(|(c, _)| c == command)
                .unwrap_or_else(|| panic!("no pending reply handler for `{command}`"));
            handler(raw);
        }
    }

    impl BridgeTransport for ScriptedBridge {
        fn send(&self, command: &str, args: &[Value]) -> Result<(), SdkError> {
            self.sent.lock().push((command.to_string(), args.to_vec()));
            Ok(())
        }

        fn send_expecting_reply(
            &self,
            command: &str,
            args: &[Value],
            on_reply: ReplyHandler,
        ) -> Result<(), SdkError> {
            self.sent.lock().push((command.to_string(), args.to_vec()));
            self.handlers.lock().push((command.to_string(), on_reply));
            Ok(())
        }
    }

    const JOIN_REPLY: &str = r#"{
        "state": {
            "globalState": {"lesson": 1},
            "memberState": {"currentApplianceName": "pencil"},
            "zoomScale": 1.0
        },
        "observerId": 7,
        "isWritable": true
    }"#;

    fn joined_room() -> (Arc<ScriptedBridge>, Arc<Room>, Arc<Mutex<Vec<RoomEvent>>>) {
        let bridge = Arc::new(ScriptedBridge::default());
        let room = Room::from_join_reply("uuid-1", bridge.clone(), JOIN_REPLY, RoomOptions::default())
            .unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        room.on_event(Arc::new(move |ev| sink.lock().push(ev.clone())));
        (bridge, room, events)
    }

    // -----------------------------------------------------------------------
    // Construction
    // -----------------------------------------------------------------------

    #[test]
    fn join_reply_materializes_room() {
        let (_bridge, room, _events) = joined_room();
        assert_eq!(room.uuid(), "uuid-1");
        assert_eq!(room.phase(), RoomPhase::Connected);
        assert!(room.writable());
        assert_eq!(room.observer_id(), 7);
        assert_eq!(room.global_state(), json!({"lesson": 1}));
        assert_eq!(room.member_state().current_appliance_name, "pencil");
        assert!(!room.disconnected_by_self());
    }

    #[test]
    fn join_reply_error_envelope_fails_construction() {
        let bridge = Arc::new(ScriptedBridge::default());
        let result = Room::from_join_reply(
            "uuid-1",
            bridge,
            r#"{"__error": {"message": "token expired"}}"#,
            RoomOptions::default(),
        );
        match result {
            Err(SdkError::Engine { message, .. }) => assert_eq!(message, "token expired"),
            other => panic!("expected engine error, got {:?}", other.map(|_| ())),
        }
    }

    // -----------------------------------------------------------------------
    // Local writes
    // -----------------------------------------------------------------------

    #[test]
    fn set_global_state_merges_locally_and_sends() {
        let (bridge, room, events) = joined_room();
        room.set_global_state(&json!({"lesson": 2})).unwrap();

        assert_eq!(room.global_state(), json!({"lesson": 2}));
        assert_eq!(bridge.sent_commands(), vec!["room.setGlobalState"]);
        // Echo not suppressed by default: the write surfaces as an event.
        assert!(matches!(
            events.lock().as_slice(),
            [RoomEvent::StateChanged { .. }]
        ));
    }

    #[test]
    fn local_echo_suppressed_when_requested() {
        let bridge = Arc::new(ScriptedBridge::default());
        let room = Room::from_join_reply(
            "uuid-1",
            bridge.clone(),
            JOIN_REPLY,
            RoomOptions {
                suppress_local_echo: true,
                ..Default::default()
            },
        )
        .unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        room.on_event(Arc::new(move |ev| sink.lock().push(ev.clone())));

        let mut member = MemberState::default();
        member.current_appliance_name = "eraser".into();
        room.set_member_state(&member).unwrap();

        // Merged but silent.
        assert_eq!(room.member_state().current_appliance_name, "eraser");
        assert!(events.lock().is_empty());

        // Remote pushes still notify.
        let router = BridgeRouter::new();
        router.register_handler("room", room.clone());
        router.deliver("room.fireRoomStateChanged", r#"{"zoomScale": 2.0}"#);
        assert_eq!(events.lock().len(), 1);
    }

    #[test]
    fn set_view_mode_does_not_write_the_mirror() {
        let (bridge, room, _events) = joined_room();
        room.set_view_mode(ViewMode::Broadcaster).unwrap();
        assert_eq!(bridge.sent_commands(), vec!["room.setViewMode"]);
        // Confirmation comes through a later broadcastState push.
        assert_eq!(room.broadcast_state().mode, ViewMode::Freedom);
    }

    // -----------------------------------------------------------------------
    // Inbound pushes
    // -----------------------------------------------------------------------

    #[test]
    fn remote_state_push_reports_changed_keys() {
        let (_bridge, room, events) = joined_room();
        let router = BridgeRouter::new();
        router.register_handler("room", room.clone());

        router.deliver(
            "room.fireRoomStateChanged",
            r#"{"zoomScale": 2.5, "broadcastState": {"mode": "follower"}}"#,
        );

        assert_eq!(room.zoom_scale(), 2.5);
        assert_eq!(room.broadcast_state().mode, ViewMode::Follower);
        match events.lock().as_slice() {
            [RoomEvent::StateChanged {
                state,
                changed_keys,
            }] => {
                assert_eq!(state.zoom_scale, 2.5);
                let mut keys = changed_keys.clone();
                keys.sort();
                assert_eq!(keys, vec!["broadcastState", "zoomScale"]);
            }
            other => panic!("expected one StateChanged, got {other:?}"),
        };
    }

    #[test]
    fn phase_pushes_drive_the_machine_once() {
        let (_bridge, room, events) = joined_room();
        let router = BridgeRouter::new();
        router.register_handler("room", room.clone());

        router.deliver("room.firePhaseChanged", r#""reconnecting""#);
        router.deliver("room.firePhaseChanged", r#""reconnecting""#); // duplicate
        router.deliver("room.firePhaseChanged", r#""connected""#);

        assert_eq!(room.phase(), RoomPhase::Connected);
        let phases: Vec<_> = events
            .lock()
            .iter()
            .filter_map(|ev| match ev {
                RoomEvent::PhaseChanged(p) => Some(*p),
                _ => None,
            })
            .collect();
        assert_eq!(phases, vec![RoomPhase::Reconnecting, RoomPhase::Connected]);
    }

    #[test]
    fn kick_is_terminal_and_carries_the_reason() {
        let (_bridge, room, events) = joined_room();
        let router = BridgeRouter::new();
        router.register_handler("room", room.clone());

        router.deliver("room.fireKickedWithReason", r#""room closed by admin""#);
        assert_eq!(room.phase(), RoomPhase::Kicked);

        // Terminal: later lifecycle pushes are ignored.
        router.deliver("room.firePhaseChanged", r#""connected""#);
        assert_eq!(room.phase(), RoomPhase::Kicked);

        assert!(events.lock().iter().any(|ev| matches!(
            ev,
            RoomEvent::KickedWithReason(reason) if reason == "room closed by admin"
        )));
    }

    #[test]
    fn disconnect_with_error_reaches_disconnected() {
        let (_bridge, room, events) = joined_room();
        let router = BridgeRouter::new();
        router.register_handler("room", room.clone());

        router.deliver(
            "room.fireDisconnectWithError",
            r#"{"message": "websocket torn down"}"#,
        );
        assert_eq!(room.phase(), RoomPhase::Disconnected);
        assert!(!room.disconnected_by_self());
        assert!(events.lock().iter().any(|ev| matches!(
            ev,
            RoomEvent::DisconnectedWithError(msg) if msg == "websocket torn down"
        )));
    }

    #[test]
    fn undo_redo_step_counts_surface_as_events() {
        let (_bridge, room, events) = joined_room();
        let router = BridgeRouter::new();
        router.register_handler("room", room.clone());

        router.deliver("room.fireCanUndoStepsUpdate", "3");
        router.deliver("room.fireCanRedoStepsUpdate", "0");

        let events = events.lock();
        assert!(events
            .iter()
            .any(|ev| matches!(ev, RoomEvent::CanUndoStepsUpdated(3))));
        assert!(events
            .iter()
            .any(|ev| matches!(ev, RoomEvent::CanRedoStepsUpdated(0))));
    }

    #[test]
    fn malformed_push_is_dropped_silently() {
        let (_bridge, room, events) = joined_room();
        let router = BridgeRouter::new();
        router.register_handler("room", room.clone());

        router.deliver("room.fireRoomStateChanged", "not json");
        router.deliver("room.firePhaseChanged", "[]");
        router.deliver("room.fireCanUndoStepsUpdate", r#"{"nope": 1}"#);

        assert!(events.lock().is_empty());
        assert_eq!(room.phase(), RoomPhase::Connected);
    }

    // -----------------------------------------------------------------------
    // Request/response
    // -----------------------------------------------------------------------

    #[test]
    fn set_writable_updates_cached_identity() {
        let (bridge, room, _events) = joined_room();
        let fut = room.set_writable(false);
        bridge.reply_to(
            "room.setWritable",
            r#"{"isWritable": false, "observerId": 42}"#,
        );

        assert!(!tokio_test::block_on(fut).unwrap());
        assert!(!room.writable());
        assert_eq!(room.observer_id(), 42);
    }

    #[test]
    fn disconnect_marks_self_initiated_and_drives_phase() {
        let (bridge, room, _events) = joined_room();
        let fut = room.disconnect();

        assert!(room.disconnected_by_self());
        assert_eq!(room.phase(), RoomPhase::Disconnecting);

        bridge.reply_to("room.disconnect", r#"{"lesson": 1}"#);
        assert_eq!(tokio_test::block_on(fut).unwrap(), json!({"lesson": 1}));
    }

    #[test]
    fn fetch_state_resolves_without_touching_the_mirror() {
        let (bridge, room, _events) = joined_room();
        let fut = room.fetch_state();
        bridge.reply_to(
            "room.state.getDisplayerState",
            r#"{"zoomScale": 9.0, "globalState": {"lesson": 99}}"#,
        );

        let fetched: RoomState = tokio_test::block_on(fut).unwrap();
        assert_eq!(fetched.zoom_scale, 9.0);
        // Forced fetches are read-only views.
        assert_eq!(room.zoom_scale(), 1.0);
        assert_eq!(room.global_state(), json!({"lesson": 1}));
    }

    #[test]
    fn fetch_phase_parses_the_report() {
        let (bridge, room, _events) = joined_room();
        let fut = room.fetch_phase();
        bridge.reply_to("room.getRoomPhase", r#""reconnecting""#);
        assert_eq!(tokio_test::block_on(fut).unwrap(), RoomPhase::Reconnecting);
        // The fetch reports; it does not transition the machine.
        assert_eq!(room.phase(), RoomPhase::Connected);
    }

    #[test]
    fn time_delay_sends_milliseconds_for_any_value() {
        let (bridge, room, _events) = joined_room();
        room.set_time_delay(u32::MAX).unwrap();

        assert_eq!(room.time_delay(), u32::MAX);
        let sent = bridge.sent.lock();
        assert_eq!(sent[0].0, "room.setTimeDelay");
        assert_eq!(sent[0].1, vec![json!(4_294_967_295_000u64)]);
    }

    #[test]
    fn scene_commands_carry_positional_args() {
        let (bridge, room, _events) = joined_room();
        room.set_scene_path("/lesson/2").unwrap();
        room.clean_scene(true).unwrap();

        let sent = bridge.sent.lock();
        assert_eq!(sent[0].0, "room.setScenePath");
        assert_eq!(sent[0].1, vec![json!("/lesson/2")]);
        assert_eq!(sent[1].0, "room.cleanScene");
        assert_eq!(sent[1].1, vec![json!(true)]);
    }

    // -----------------------------------------------------------------------
    // Custom events
    // -----------------------------------------------------------------------

    #[test]
    fn magix_events_round_trip_through_the_hub() {
        let (bridge, room, _events) = joined_room();
        let router = BridgeRouter::new();
        router.register_handler("room", room.clone());

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        room.add_magix_event_listener("chat", Arc::new(move |ev| sink.lock().push(ev.payload.clone())))
            .unwrap();
        assert!(bridge
            .sent_commands()
            .contains(&"room.addMagixEventListener".to_string()));

        router.deliver(
            "room.fireMagixEvent",
            r#"{"eventName": "chat", "payload": {"text": "hi"}, "authorId": 7}"#,
        );
        router.deliver(
            "room.fireMagixEvent",
            r#"{"eventName": "unsubscribed", "payload": {}}"#,
        );
        assert_eq!(*seen.lock(), vec![json!({"text": "hi"})]);
    }

    #[test]
    fn high_frequency_events_arrive_as_one_batch() {
        let (_bridge, room, _events) = joined_room();
        let router = BridgeRouter::new();
        router.register_handler("room", room.clone());

        let sizes = Arc::new(Mutex::new(Vec::new()));
        let sink = sizes.clone();
        room.add_high_frequency_event_listener(
            "cursor",
            500,
            Arc::new(move |batch| sink.lock().push(batch.len())),
        )
        .unwrap();

        router.deliver(
            "room.fireHighFrequencyEvent",
            r#"[
                {"eventName": "cursor", "payload": {"x": 1}},
                {"eventName": "cursor", "payload": {"x": 2}},
                {"eventName": "cursor", "payload": {"x": 3}}
            ]"#,
        );
        assert_eq!(*sizes.lock(), vec![3]);
    }

    #[test]
    fn removing_a_listener_stops_delivery() {
        let (_bridge, room, _events) = joined_room();
        let router = BridgeRouter::new();
        router.register_handler("room", room.clone());

        let count = Arc::new(Mutex::new(0usize));
        let sink = count.clone();
        room.add_magix_event_listener("chat", Arc::new(move |_| *sink.lock() += 1))
            .unwrap();
        room.remove_magix_event_listener("chat").unwrap();

        router.deliver("room.fireMagixEvent", r#"{"eventName": "chat"}"#);
        assert_eq!(*count.lock(), 0);
    }
}
