// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use devd_core::Action;
use proptest::prelude::*;
use tempfile::TempDir;

fn test_queue() -> (EventQueue, TempDir) {
    let dir = TempDir::new().unwrap();
    let queue = EventQueue::new(QueueMarker::new(dir.path().join("queue")));
    (queue, dir)
}

fn dev(seqnum: u64, devpath: impl Into<String>) -> Device {
    Device::new(seqnum, Action::Add, devpath)
}

fn block_dev(seqnum: u64, devpath: &str, devnum: Devnum) -> Device {
    let mut d = dev(seqnum, devpath);
    d.subsystem = Some("block".into());
    d.devnum = Some(devnum);
    d
}

fn net_dev(seqnum: u64, devpath: &str, ifindex: u32) -> Device {
    let mut d = dev(seqnum, devpath);
    d.subsystem = Some("net".into());
    d.ifindex = ifindex;
    d
}

#[test]
fn insert_appends_in_seqnum_order() {
    let (mut queue, _dir) = test_queue();
    queue.insert(dev(10, "/devices/a"));
    queue.insert(dev(11, "/devices/b"));
    queue.insert(dev(12, "/devices/c"));

    let order: Vec<u64> = queue.iter().map(|e| e.seqnum).collect();
    assert_eq!(order, vec![10, 11, 12]);
    assert!(queue.iter().all(|e| e.state == EventState::Queued));
}

#[test]
fn insert_drops_out_of_order_seqnum() {
    let (mut queue, _dir) = test_queue();
    assert_eq!(queue.insert(dev(10, "/devices/a")), Some(10));
    assert_eq!(queue.insert(dev(9, "/devices/b")), None);
    assert_eq!(queue.len(), 1);
}

#[test]
fn marker_tracks_queue_occupancy() {
    let (mut queue, dir) = test_queue();
    let marker = dir.path().join("queue");
    assert!(!marker.exists());

    queue.insert(dev(1, "/devices/a"));
    assert!(marker.exists());

    queue.remove(1);
    assert!(!marker.exists());
}

#[test]
fn cleanup_queued_spares_running_events() {
    let (mut queue, _dir) = test_queue();
    queue.insert(dev(1, "/devices/a"));
    queue.insert(dev(2, "/devices/b"));
    queue.get_mut(1).unwrap().state = EventState::Running;

    let removed = queue.cleanup(CleanupFilter::Queued);
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].seqnum, 2);
    assert_eq!(queue.len(), 1);

    let removed = queue.cleanup(CleanupFilter::All);
    assert_eq!(removed.len(), 1);
    assert!(queue.is_empty());
}

#[test]
fn kernel_clone_is_taken_at_insert() {
    let (mut queue, _dir) = test_queue();
    queue.insert(dev(1, "/devices/a"));
    let event = queue.get(1).unwrap();
    assert_eq!(event.dev_kernel, event.dev);
}

// --- busy predicate ---

#[test]
fn child_is_blocked_by_queued_parent() {
    let (mut queue, _dir) = test_queue();
    queue.insert(dev(10, "/devices/pci0000:00/block/sda"));
    queue.insert(dev(11, "/devices/pci0000:00/block/sda/sda1"));

    assert!(queue.is_devpath_busy(11));
    assert_eq!(queue.get(11).unwrap().delaying_seqnum, 10);
    assert!(!queue.is_devpath_busy(10));
}

#[test]
fn parent_is_blocked_by_queued_child() {
    let (mut queue, _dir) = test_queue();
    queue.insert(dev(10, "/devices/pci0000:00/block/sda/sda1"));
    queue.insert(dev(11, "/devices/pci0000:00/block/sda"));

    assert!(queue.is_devpath_busy(11));
    assert_eq!(queue.get(11).unwrap().delaying_seqnum, 10);
}

#[test]
fn disjoint_subtrees_do_not_block() {
    let (mut queue, _dir) = test_queue();
    queue.insert(dev(20, "/devices/pci0000:00/block/sda"));
    queue.insert(dev(21, "/devices/pci0000:00/block/sdb"));

    assert!(!queue.is_devpath_busy(20));
    assert!(!queue.is_devpath_busy(21));
}

#[test]
fn shared_prefix_without_slash_boundary_is_unrelated() {
    let (mut queue, _dir) = test_queue();
    queue.insert(dev(1, "/devices/virtual/block/sda"));
    queue.insert(dev(2, "/devices/virtual/block/sda1"));

    assert!(!queue.is_devpath_busy(2));
}

#[test]
fn identical_devpath_blocks_and_memoizes() {
    let (mut queue, _dir) = test_queue();
    queue.insert(dev(1, "/devices/virtual/tty/tty0"));
    queue.insert(dev(2, "/devices/virtual/tty/tty0"));

    assert!(queue.is_devpath_busy(2));
    assert_eq!(queue.get(2).unwrap().delaying_seqnum, 1);
}

#[test]
fn identical_devpath_with_different_devnum_is_a_reused_name() {
    let (mut queue, _dir) = test_queue();
    queue.insert(block_dev(1, "/devices/virtual/block/sda", Devnum::new(8, 0)));
    queue.insert(block_dev(2, "/devices/virtual/block/sda", Devnum::new(8, 16)));

    assert!(!queue.is_devpath_busy(2));
}

#[test]
fn same_devnum_blocks_across_unrelated_paths() {
    let (mut queue, _dir) = test_queue();
    queue.insert(block_dev(1, "/devices/a", Devnum::new(8, 0)));
    queue.insert(block_dev(2, "/devices/b", Devnum::new(8, 0)));

    assert!(queue.is_devpath_busy(2));
    // devnum blocking does not memoize
    assert_eq!(queue.get(2).unwrap().delaying_seqnum, 0);
}

#[test]
fn same_devnum_different_class_does_not_block() {
    let (mut queue, _dir) = test_queue();
    let mut char_side = dev(1, "/devices/a");
    char_side.subsystem = Some("tty".into());
    char_side.devnum = Some(Devnum::new(8, 0));
    queue.insert(char_side);
    queue.insert(block_dev(2, "/devices/b", Devnum::new(8, 0)));

    assert!(!queue.is_devpath_busy(2));
}

#[test]
fn same_ifindex_blocks() {
    let (mut queue, _dir) = test_queue();
    queue.insert(net_dev(1, "/devices/virtual/net/eth0", 3));
    queue.insert(net_dev(2, "/devices/pci0000:00/net/enp0s3", 3));

    assert!(queue.is_devpath_busy(2));
}

#[test]
fn rename_collision_blocks_on_old_name() {
    let (mut queue, _dir) = test_queue();
    queue.insert(net_dev(5, "/devices/virtual/net/eth0", 7));
    let mut renamed = net_dev(6, "/devices/virtual/net/lan0", 8);
    renamed.action = Action::Move;
    renamed.devpath_old = Some("/devices/virtual/net/eth0".into());
    queue.insert(renamed);

    assert!(queue.is_devpath_busy(6));
    assert_eq!(queue.get(6).unwrap().delaying_seqnum, 5);
}

#[test]
fn memo_unblocks_once_blocker_is_gone() {
    let (mut queue, _dir) = test_queue();
    queue.insert(dev(10, "/devices/a"));
    queue.insert(dev(11, "/devices/a/b"));

    assert!(queue.is_devpath_busy(11));
    queue.remove(10);
    assert!(!queue.is_devpath_busy(11));
}

#[test]
fn memo_skips_already_cleared_predecessors() {
    let (mut queue, _dir) = test_queue();
    queue.insert(dev(10, "/devices/x"));
    queue.insert(dev(11, "/devices/a"));
    queue.insert(dev(12, "/devices/a/b"));

    // memo lands on 11; the unrelated 10 is below the memo afterwards
    assert!(queue.is_devpath_busy(12));
    assert_eq!(queue.get(12).unwrap().delaying_seqnum, 11);
    assert!(queue.is_devpath_busy(12));
    assert_eq!(queue.get(12).unwrap().delaying_seqnum, 11);
}

#[test]
fn running_events_still_block_descendants() {
    let (mut queue, _dir) = test_queue();
    queue.insert(dev(10, "/devices/a"));
    queue.insert(dev(11, "/devices/a/b"));
    let parent = queue.get_mut(10).unwrap();
    parent.state = EventState::Running;
    parent.worker = Some(4242);

    assert!(queue.is_devpath_busy(11));
}

proptest! {
    #[test]
    fn disjoint_top_level_paths_never_block(count in 2usize..8) {
        let (mut queue, _dir) = test_queue();
        for i in 0..count {
            queue.insert(dev(i as u64 + 1, format!("/devices/dev{}", i)));
        }
        for i in 0..count {
            prop_assert!(!queue.is_devpath_busy(i as u64 + 1));
        }
    }

    #[test]
    fn delaying_seqnum_never_decreases(
        paths in proptest::collection::vec(
            proptest::sample::select(vec![
                "/devices/a", "/devices/a/b", "/devices/a/b/c", "/devices/d", "/devices/d/e",
            ]),
            2..10,
        ),
        removals in proptest::collection::vec(any::<u8>(), 0..6),
    ) {
        let (mut queue, _dir) = test_queue();
        for (i, path) in paths.iter().enumerate() {
            queue.insert(dev(i as u64 + 1, *path));
        }
        let last = paths.len() as u64;
        let mut previous = 0;
        for victim in removals {
            queue.is_devpath_busy(last);
            let memo = queue.get(last).map(|e| e.delaying_seqnum).unwrap_or(previous);
            prop_assert!(memo >= previous);
            previous = memo;
            let victim = victim as u64 % last;
            if victim + 1 < last {
                queue.remove(victim + 1);
            }
        }
    }
}
