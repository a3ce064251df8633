// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Graceful shutdown and the exit drain budget.

use super::*;

#[test]
fn exit_cancels_queued_events_and_terms_running_workers() {
    let mut t = test_daemon_with(2);
    for (seqnum, path) in [
        (1, "/devices/a"),
        (2, "/devices/b"),
        (3, "/devices/c"),
        (4, "/devices/d"),
        (5, "/devices/e"),
    ] {
        t.push_uevent(device(seqnum, path));
    }
    t.receive_and_schedule();
    assert_eq!(t.daemon.queue.len(), 5);
    assert_eq!(t.daemon.pool.len(), 2);

    t.daemon.on_request_exit();
    let phase = t.daemon.prepare_phase();
    assert!(matches!(phase, Phase::Wait(Some(_))));

    // the three queued events are gone, the two running ones drain
    assert_eq!(t.daemon.queue.len(), 2);
    assert_eq!(t.spawner.lock().killed_with(KillSignal::Term).len(), 2);

    // workers exit on the SIGTERM
    for pid in t.spawned_pids() {
        t.reap(pid, ExitOutcome::Clean);
    }
    assert!(matches!(t.daemon.prepare_phase(), Phase::Done));
}

#[test]
fn exit_drain_budget_expiry_is_fatal() {
    let mut t = test_daemon();
    t.push_uevent(device(1, "/devices/a"));
    t.receive_and_schedule();

    t.daemon.on_request_exit();
    assert!(matches!(t.daemon.prepare_phase(), Phase::Wait(Some(_))));

    // the worker never exits; the budget runs out
    t.clock.advance(Duration::from_secs(31));
    assert!(matches!(t.daemon.prepare_phase(), Phase::Wait(Some(_))));
    assert!(matches!(t.daemon.on_timeout(), Err(DaemonError::DrainTimeout)));
}

#[test]
fn idle_daemon_exits_immediately() {
    let mut t = test_daemon();
    t.daemon.on_request_exit();
    assert!(matches!(t.daemon.prepare_phase(), Phase::Done));
}

#[test]
fn exit_closes_the_uevent_source() {
    let mut t = test_daemon();
    t.daemon.on_request_exit();
    let _ = t.daemon.prepare_phase();

    // events arriving after the source closed are not picked up
    t.push_uevent(device(1, "/devices/a"));
    t.daemon.drain_uevents();
    assert!(t.daemon.queue.is_empty());
}

#[test]
fn shutdown_cleanup_removes_the_marker_and_answers_exit() {
    let mut t = test_daemon();
    t.push_uevent(device(1, "/devices/a"));
    t.receive_and_schedule();
    assert!(t.marker_exists());

    let mut reply = t.ctrl(Request::Exit);
    assert!(t.daemon.exit_requested);
    // the client stays blocked while cleanup has not run
    assert!(reply.try_recv().is_err());

    t.daemon.shutdown_cleanup();
    assert!(!t.marker_exists());
    assert_eq!(reply.try_recv().ok(), Some(Response::Ok));
}

#[test]
fn sigterm_like_exit_still_reaps_during_drain() {
    let mut t = test_daemon();
    t.push_uevent(device(1, "/devices/a"));
    t.receive_and_schedule();
    let pid = t.spawned_pids()[0];

    t.daemon.on_request_exit();
    let _ = t.daemon.prepare_phase();

    t.reap(pid, ExitOutcome::Signaled(15));
    assert!(matches!(t.daemon.prepare_phase(), Phase::Done));
}
