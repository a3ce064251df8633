// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Device-node notifications and their visibility ordering.

use super::*;
use notify::event::{AccessKind, AccessMode, EventKind, RemoveKind};

/// A watched tty-style device backed by the fake sysfs tree and a real
/// node file the watch handler can register.
fn watched_device(t: &mut TestDaemon, seqnum: u64) -> (Device, std::path::PathBuf) {
    let devpath = "/devices/virtual/tty/tty0";
    let sys_dir = t.sysfs_dir.path().join("devices/virtual/tty/tty0");
    std::fs::create_dir_all(&sys_dir).unwrap();
    std::fs::write(sys_dir.join("uevent"), "").unwrap();

    let node = t.runtime.path().join("tty0");
    std::fs::write(&node, "").unwrap();

    let mut dev = device(seqnum, devpath);
    dev.subsystem = Some("tty".into());
    dev.devnode = Some(node.clone());
    t.daemon.watch.begin(&dev);
    (dev, node)
}

fn close_write(node: &std::path::Path) -> notify::Event {
    let mut event = notify::Event::new(EventKind::Access(AccessKind::Close(AccessMode::Write)));
    event.paths.push(node.to_path_buf());
    event
}

#[test]
fn close_write_synthesizes_a_change_event() {
    let mut t = test_daemon();
    let (_dev, node) = watched_device(&mut t, 1);

    t.daemon.handle_inotify(close_write(&node));

    let uevent = t.sysfs_dir.path().join("devices/virtual/tty/tty0/uevent");
    assert_eq!(std::fs::read_to_string(uevent).unwrap(), "change");
}

#[test]
fn synthesized_change_is_pulled_in_before_control_replies() {
    let mut t = test_daemon();
    let (dev, node) = watched_device(&mut t, 1);

    // the kernel reacts to the uevent write with a change event
    let mut change = dev.clone();
    change.seqnum = 2;
    change.action = devd_core::Action::Change;
    t.push_uevent(change);

    // one loop slice: inotify, marker, then control — the PING must observe
    // the change event already queued
    t.daemon.handle_inotify(close_write(&node));
    t.daemon.queue.update_marker();
    let mut reply = t.ctrl(Request::Ping);

    assert_eq!(reply.try_recv().ok(), Some(Response::Ok));
    assert!(t.daemon.queue.get(2).is_some());
    assert!(t.marker_exists());
}

#[test]
fn exactly_one_event_is_queued_per_synthesized_change() {
    let mut t = test_daemon();
    let (dev, node) = watched_device(&mut t, 1);

    let mut change = dev.clone();
    change.seqnum = 2;
    change.action = devd_core::Action::Change;
    t.push_uevent(change);

    t.daemon.handle_inotify(close_write(&node));
    assert_eq!(t.daemon.queue.len(), 1);
}

#[test]
fn removed_node_tears_the_watch_down() {
    let mut t = test_daemon();
    let (_dev, node) = watched_device(&mut t, 1);
    assert_eq!(t.daemon.watch.watched_count(), 1);

    let mut gone = notify::Event::new(EventKind::Remove(RemoveKind::File));
    gone.paths.push(node.clone());
    t.daemon.handle_inotify(gone);

    assert_eq!(t.daemon.watch.watched_count(), 0);
}

#[test]
fn notifications_for_unwatched_paths_are_ignored() {
    let mut t = test_daemon();
    let node = t.runtime.path().join("unwatched");
    std::fs::write(&node, "").unwrap();

    t.daemon.handle_inotify(close_write(&node));
    assert!(t.daemon.queue.is_empty());
}

#[test]
fn completed_block_events_begin_a_watch_and_removal_ends_it() {
    let mut t = test_daemon();

    let node = t.runtime.path().join("sdd");
    std::fs::write(&node, "").unwrap();
    let mut dev = block_device(1, "/devices/pci0000:00/block/sdd", devd_core::Devnum::new(8, 48));
    dev.devnode = Some(node.clone());
    t.push_uevent(dev.clone());
    t.receive_and_schedule();

    let pid = t.spawned_pids()[0];
    t.complete(pid);
    assert_eq!(t.daemon.watch.watched_count(), 1);

    let mut removal = dev.clone();
    removal.seqnum = 2;
    removal.action = devd_core::Action::Remove;
    t.push_uevent(removal);
    t.receive_and_schedule();
    t.complete(pid);
    assert_eq!(t.daemon.watch.watched_count(), 0);
}
