// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Control-plane state transitions.

use super::*;

#[test]
fn ping_is_acked_immediately() {
    let mut t = test_daemon();
    let mut reply = t.ctrl(Request::Ping);
    assert_eq!(reply.try_recv().ok(), Some(Response::Ok));
}

#[test]
fn set_log_level_restarts_workers_with_the_new_level() {
    let mut t = test_daemon();
    t.push_uevent(device(1, "/devices/a"));
    t.receive_and_schedule();
    let pid = t.spawned_pids()[0];

    let mut reply = t.ctrl(Request::SetLogLevel { level: "debug".into() });
    assert_eq!(reply.try_recv().ok(), Some(Response::Ok));

    let state = t.spawner.lock();
    assert_eq!(state.log_level.as_deref(), Some("debug"));
    assert_eq!(state.killed_with(KillSignal::Term), vec![pid]);
}

#[test]
fn set_env_updates_overrides_and_restarts_workers() {
    let mut t = test_daemon();
    t.push_uevent(device(1, "/devices/a"));
    t.receive_and_schedule();

    let mut reply = t.ctrl(Request::SetEnv { assignment: "ID_SEAT=seat1".into() });
    assert_eq!(reply.try_recv().ok(), Some(Response::Ok));
    assert_eq!(
        t.daemon.properties.get("ID_SEAT"),
        Some(&Some("seat1".to_string()))
    );
    assert_eq!(
        t.spawner.lock().properties.get("ID_SEAT"),
        Some(&Some("seat1".to_string()))
    );
    assert_eq!(t.spawner.lock().killed_with(KillSignal::Term).len(), 1);

    // trailing '=' unsets
    t.ctrl(Request::SetEnv { assignment: "ID_SEAT=".into() });
    assert_eq!(t.daemon.properties.get("ID_SEAT"), Some(&None));
}

#[test]
fn malformed_set_env_is_rejected_without_side_effects() {
    let mut t = test_daemon();
    let mut reply = t.ctrl(Request::SetEnv { assignment: "NOEQUALS".into() });
    assert!(matches!(reply.try_recv().ok(), Some(Response::Error { .. })));
    assert!(t.daemon.properties.is_empty());
    assert!(t.spawner.lock().kills.is_empty());
}

#[test]
fn set_children_max_applies_to_the_next_dispatch() {
    let mut t = test_daemon();
    t.ctrl(Request::SetChildrenMax { max: 1 });
    assert_eq!(t.daemon.children_max, 1);

    t.push_uevent(device(1, "/devices/a"));
    t.push_uevent(device(2, "/devices/b"));
    t.receive_and_schedule();
    assert_eq!(t.spawned_pids().len(), 1);
}

#[test]
fn reload_is_idempotent() {
    let mut t = test_daemon();
    t.push_uevent(device(1, "/devices/a"));
    t.receive_and_schedule();
    assert!(t.daemon.rules.is_some());

    t.ctrl(Request::Reload);
    assert!(t.daemon.reload);
    t.daemon.do_reload();
    let kills_after_first = t.spawner.lock().kills.len();
    assert!(t.daemon.rules.is_none());
    assert!(!t.daemon.reload);

    // a second reload lands in the same post-state
    t.ctrl(Request::Reload);
    t.daemon.do_reload();
    assert!(t.daemon.rules.is_none());
    assert!(!t.daemon.reload);
    // the already-killed workers are not re-signalled
    assert_eq!(t.spawner.lock().kills.len(), kills_after_first);
}

#[test]
fn sighup_requests_a_reload() {
    let mut t = test_daemon();
    t.daemon.on_signal(crate::signals::SignalEvent::Reload);
    assert!(t.daemon.reload);
}

#[test]
fn stale_rules_inventory_triggers_reload_on_the_config_poll() {
    let mut t = test_daemon();
    let rules_dir = t.runtime.path().join("rules.d");
    std::fs::create_dir_all(&rules_dir).unwrap();

    t.push_uevent(device(1, "/devices/a"));
    t.receive_and_schedule();
    t.daemon.check_config_stamp();
    assert!(!t.daemon.reload);

    std::fs::write(rules_dir.join("99-new.rules"), "# new").unwrap();

    // throttled: an immediate re-check does nothing
    t.daemon.check_config_stamp();
    assert!(!t.daemon.reload);

    t.clock.advance(Duration::from_secs(4));
    t.daemon.check_config_stamp();
    assert!(t.daemon.reload);
}
