// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker crashes and event timeouts.

use super::*;
use crate::db::DeviceDb;
use devd_core::Devnum;

#[test]
fn crashed_worker_scrubs_state_and_forwards_the_raw_event() {
    let mut t = test_daemon();
    let mut dev = block_device(30, "/devices/pci0000:00/block/sdc", Devnum::new(8, 32));
    dev.properties.insert("TAGS".into(), ":systemd:".into());
    t.push_uevent(dev.clone());
    t.push_uevent(device(31, "/devices/other"));
    t.receive_and_schedule();

    // the worker persisted its record before dying
    let db = DeviceDb::new(t.runtime.path());
    db.write(&dev).unwrap();
    db.tag(&dev).unwrap();
    assert!(t.runtime.path().join("data/b8:32").exists());

    let pid = t.spawned_pids()[0];
    t.reap(pid, ExitOutcome::Signaled(11));

    // persisted state is gone, the raw kernel form went out to listeners
    assert!(!t.runtime.path().join("data/b8:32").exists());
    assert!(!t.runtime.path().join("tags/systemd/b8:32").exists());
    let broadcasts = t.monitor.lock().broadcasts.clone();
    assert_eq!(broadcasts.len(), 1);
    assert_eq!(broadcasts[0].seqnum, 30);
    assert_eq!(broadcasts[0].devpath, "/devices/pci0000:00/block/sdc");

    // worker and event are gone; the unrelated event remains, as does the marker
    assert!(t.daemon.pool.get(pid).is_none());
    assert!(t.daemon.queue.get(30).is_none());
    assert!(t.daemon.queue.get(31).is_some());
    assert!(t.marker_exists());
}

#[test]
fn clean_exit_with_attached_event_frees_it_without_forwarding() {
    let mut t = test_daemon();
    t.push_uevent(device(1, "/devices/a"));
    t.receive_and_schedule();
    let pid = t.spawned_pids()[0];

    t.reap(pid, ExitOutcome::Clean);

    assert!(t.daemon.queue.is_empty());
    assert!(t.monitor.lock().broadcasts.is_empty());
}

#[test]
fn nonzero_exit_counts_as_failure() {
    let mut t = test_daemon();
    t.push_uevent(device(1, "/devices/a"));
    t.receive_and_schedule();
    let pid = t.spawned_pids()[0];

    t.reap(pid, ExitOutcome::Exited(1));
    assert_eq!(t.monitor.lock().broadcasts.len(), 1);
}

#[test]
fn hanging_event_warns_once_then_is_killed() {
    let mut t = test_daemon();
    t.push_uevent(device(1, "/devices/a"));
    t.receive_and_schedule();
    let pid = t.spawned_pids()[0];

    // past the warn threshold (60s), below the kill threshold (180s)
    t.clock.advance(Duration::from_secs(90));
    t.daemon.sweep_hanging_events();
    assert!(t.daemon.queue.get(1).unwrap().warned);
    assert!(t.spawner.lock().killed_with(KillSignal::Kill).is_empty());

    // sweeping again does not warn twice
    t.daemon.sweep_hanging_events();

    // past the kill threshold
    t.clock.advance(Duration::from_secs(120));
    t.daemon.sweep_hanging_events();
    assert_eq!(t.spawner.lock().killed_with(KillSignal::Kill), vec![pid]);
    assert_eq!(t.daemon.pool.get(pid).unwrap().state, WorkerState::Killed);

    // the SIGKILL is followed by the usual crash handling
    t.reap(pid, ExitOutcome::Signaled(9));
    assert!(t.daemon.queue.is_empty());
    assert_eq!(t.monitor.lock().broadcasts.len(), 1);
}

#[test]
fn fresh_events_are_not_swept() {
    let mut t = test_daemon();
    t.push_uevent(device(1, "/devices/a"));
    t.receive_and_schedule();

    t.clock.advance(Duration::from_secs(30));
    t.daemon.sweep_hanging_events();
    assert!(!t.daemon.queue.get(1).unwrap().warned);
    assert!(t.spawner.lock().kills.is_empty());
}

#[test]
fn reaping_an_unknown_pid_is_harmless() {
    let mut t = test_daemon();
    t.reap(31337, ExitOutcome::Signaled(9));
    assert!(t.daemon.pool.is_empty());
}
