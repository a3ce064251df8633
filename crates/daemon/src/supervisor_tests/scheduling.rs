// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Queue-order dispatch filtered by the busy predicate.

use super::*;

#[test]
fn parent_and_child_events_serialize_on_one_worker() {
    let mut t = test_daemon();
    t.push_uevent(device(10, "/devices/pci0000:00/block/sda"));
    t.push_uevent(device(11, "/devices/pci0000:00/block/sda/sda1"));
    t.receive_and_schedule();

    // only the parent may run; the child waits on the same subtree
    assert_eq!(t.spawned_pids().len(), 1);
    let pid = t.spawned_pids()[0];
    assert_eq!(t.daemon.queue.get(10).unwrap().state, EventState::Running);
    assert_eq!(t.daemon.queue.get(11).unwrap().state, EventState::Queued);
    assert_eq!(t.daemon.queue.get(11).unwrap().delaying_seqnum, 10);

    t.complete(pid);
    assert!(t.daemon.queue.get(10).is_none());

    t.daemon.start_queued_events();
    // the idle worker is reused for the child event
    assert_eq!(t.spawned_pids().len(), 1);
    assert_eq!(t.daemon.queue.get(11).unwrap().state, EventState::Running);
    assert_eq!(t.spawner.lock().links[&pid].lock().sent, vec![10, 11]);
}

#[test]
fn disjoint_subtrees_run_in_parallel() {
    let mut t = test_daemon();
    t.push_uevent(device(20, "/devices/pci0000:00/block/sda"));
    t.push_uevent(device(21, "/devices/pci0000:00/block/sdb"));
    t.receive_and_schedule();

    assert_eq!(t.spawned_pids().len(), 2);
    assert_eq!(t.daemon.queue.get(20).unwrap().state, EventState::Running);
    assert_eq!(t.daemon.queue.get(21).unwrap().state, EventState::Running);
}

#[test]
fn rename_collision_waits_for_the_old_name() {
    let mut t = test_daemon();
    let mut old = device(5, "/devices/virtual/net/eth0");
    old.subsystem = Some("net".into());
    old.ifindex = 7;
    t.push_uevent(old);

    let mut renamed = device(6, "/devices/virtual/net/lan0");
    renamed.subsystem = Some("net".into());
    renamed.ifindex = 8;
    renamed.devpath_old = Some("/devices/virtual/net/eth0".into());
    t.push_uevent(renamed);

    t.receive_and_schedule();
    assert_eq!(t.daemon.queue.get(6).unwrap().state, EventState::Queued);
    assert_eq!(t.daemon.queue.get(6).unwrap().delaying_seqnum, 5);

    let pid = t.spawned_pids()[0];
    t.complete(pid);
    t.daemon.start_queued_events();
    assert_eq!(t.daemon.queue.get(6).unwrap().state, EventState::Running);
}

#[test]
fn children_max_bounds_concurrency() {
    let mut t = test_daemon_with(2);
    for (seqnum, path) in
        [(1, "/devices/a"), (2, "/devices/b"), (3, "/devices/c"), (4, "/devices/d")]
    {
        t.push_uevent(device(seqnum, path));
    }
    t.receive_and_schedule();

    assert_eq!(t.spawned_pids().len(), 2);
    assert_eq!(t.daemon.queue.iter().filter(|e| e.state == EventState::Running).count(), 2);

    // a completion frees a slot for the next queued event
    let pid = t.spawned_pids()[0];
    t.complete(pid);
    t.daemon.start_queued_events();
    assert_eq!(t.daemon.queue.iter().filter(|e| e.state == EventState::Running).count(), 2);
}

#[test]
fn stop_exec_queue_pauses_dispatch() {
    let mut t = test_daemon();
    t.ctrl(Request::StopExecQueue);
    t.push_uevent(device(1, "/devices/a"));
    t.receive_and_schedule();
    assert!(t.spawned_pids().is_empty());
    assert_eq!(t.daemon.queue.get(1).unwrap().state, EventState::Queued);

    t.ctrl(Request::StartExecQueue);
    t.daemon.start_queued_events();
    assert_eq!(t.daemon.queue.get(1).unwrap().state, EventState::Running);
}

#[test]
fn dispatch_loads_rules_inventory_lazily() {
    let mut t = test_daemon();
    assert!(t.daemon.rules.is_none());
    t.push_uevent(device(1, "/devices/a"));
    t.receive_and_schedule();
    assert!(t.daemon.rules.is_some());
}

#[test]
fn queue_marker_follows_pending_work() {
    let mut t = test_daemon();
    assert!(!t.marker_exists());

    t.push_uevent(device(1, "/devices/a"));
    t.receive_and_schedule();
    assert!(t.marker_exists());

    let pid = t.spawned_pids()[0];
    t.complete(pid);
    assert!(!t.marker_exists());
}

#[test]
fn spawn_failure_keeps_the_event_for_the_next_pass() {
    let mut t = test_daemon();
    t.spawner.lock().fail_next_spawn = true;
    t.push_uevent(device(1, "/devices/a"));
    t.receive_and_schedule();

    assert_eq!(t.daemon.queue.get(1).unwrap().state, EventState::Queued);

    t.daemon.start_queued_events();
    assert_eq!(t.daemon.queue.get(1).unwrap().state, EventState::Running);
}

#[test]
fn received_events_are_stamped_with_their_arrival_time() {
    let mut t = test_daemon();
    t.push_uevent(device(1, "/devices/a"));
    t.daemon.drain_uevents();

    let event = t.daemon.queue.get(1).unwrap();
    let stamp = event.dev.property("USEC_INITIALIZED").unwrap();
    assert_eq!(stamp, t.clock.epoch_usec().to_string());
    // the kernel clone carries the stamp too
    assert_eq!(event.dev_kernel.property("USEC_INITIALIZED"), Some(stamp));
}

#[test]
fn completions_from_unknown_pids_are_ignored() {
    let mut t = test_daemon();
    t.complete(4711);
    assert!(t.daemon.pool.is_empty());
    assert!(t.daemon.queue.is_empty());
}
