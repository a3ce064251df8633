// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use devd_core::Devnum;
use tempfile::TempDir;

fn sysfs_with_disk() -> (Sysfs, TempDir) {
    let dir = TempDir::new().unwrap();
    let disk = dir.path().join("devices/virtual/block/sda");
    std::fs::create_dir_all(disk.join("sda1")).unwrap();
    std::fs::write(disk.join("uevent"), "MAJOR=8\nMINOR=0\nDEVNAME=sda\n").unwrap();
    std::fs::write(disk.join("sda1/uevent"), "MAJOR=8\nMINOR=1\nDEVNAME=sda1\n").unwrap();
    (Sysfs::new(dir.path()), dir)
}

fn block(devpath: &str, devtype: &str, devnode: &str) -> Device {
    let mut dev = Device::new(1, Action::Add, devpath);
    dev.subsystem = Some("block".into());
    dev.devtype = Some(devtype.into());
    dev.devnode = Some(devnode.into());
    dev.devnum = Some(Devnum::new(8, 0));
    dev
}

#[test]
fn lock_target_is_own_node_for_a_disk() {
    let (sysfs, _dir) = sysfs_with_disk();
    let dev = block("/devices/virtual/block/sda", "disk", "/dev/sda");
    assert_eq!(lock_target(&dev, &sysfs), Some(PathBuf::from("/dev/sda")));
}

#[test]
fn lock_target_is_parent_disk_for_a_partition() {
    let (sysfs, _dir) = sysfs_with_disk();
    let dev = block("/devices/virtual/block/sda/sda1", "partition", "/dev/sda1");
    assert_eq!(lock_target(&dev, &sysfs), Some(PathBuf::from("/dev/sda")));
}

#[test]
fn lock_target_skips_remove_events() {
    let (sysfs, _dir) = sysfs_with_disk();
    let mut dev = block("/devices/virtual/block/sda", "disk", "/dev/sda");
    dev.action = Action::Remove;
    assert_eq!(lock_target(&dev, &sysfs), None);
}

#[test]
fn lock_target_skips_non_block_devices() {
    let (sysfs, _dir) = sysfs_with_disk();
    let mut dev = Device::new(1, Action::Add, "/devices/virtual/tty/tty0");
    dev.subsystem = Some("tty".into());
    dev.devnode = Some("/dev/tty0".into());
    assert_eq!(lock_target(&dev, &sysfs), None);
}

#[test]
fn lock_target_skips_dm_and_md_devices() {
    let (sysfs, _dir) = sysfs_with_disk();
    for name in ["dm-3", "md0", "md127"] {
        let dev = block(
            &format!("/devices/virtual/block/{}", name),
            "disk",
            &format!("/dev/{}", name),
        );
        assert_eq!(lock_target(&dev, &sysfs), None, "{} must not be locked", name);
    }
}

#[test]
fn overrides_set_and_unset_properties() {
    let mut dev = Device::new(1, Action::Add, "/devices/a");
    dev.properties.insert("ID_SEAT".into(), "seat0".into());
    dev.properties.insert("STALE".into(), "yes".into());

    let mut overrides = BTreeMap::new();
    overrides.insert("ID_SEAT".into(), Some("seat1".into()));
    overrides.insert("STALE".into(), None);
    overrides.insert("FRESH".into(), Some("1".into()));
    apply_overrides(&mut dev, &overrides);

    assert_eq!(dev.property("ID_SEAT"), Some("seat1"));
    assert_eq!(dev.property("STALE"), None);
    assert_eq!(dev.property("FRESH"), Some("1"));
}

#[test]
fn devnode_of_resolves_through_uevent_attribute() {
    let (sysfs, _dir) = sysfs_with_disk();
    assert_eq!(
        sysfs.devnode_of("/devices/virtual/block/sda"),
        Some(PathBuf::from("/dev/sda"))
    );
    assert_eq!(sysfs.devnode_of("/devices/missing"), None);
}
