// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use devd_core::{Action, Devnum};
use tempfile::TempDir;

fn tagged_disk() -> Device {
    let mut dev = Device::new(1, Action::Add, "/devices/virtual/block/sda");
    dev.subsystem = Some("block".into());
    dev.devnum = Some(Devnum::new(8, 0));
    dev.properties.insert("ID_FS_TYPE".into(), "ext4".into());
    dev.properties.insert("TAGS".into(), ":systemd:seat:".into());
    dev
}

#[test]
fn write_then_delete_record() {
    let dir = TempDir::new().unwrap();
    let db = DeviceDb::new(dir.path());
    let dev = tagged_disk();

    db.write(&dev).unwrap();
    let record = dir.path().join("data/b8:0");
    let content = std::fs::read_to_string(&record).unwrap();
    assert!(content.contains("ID_FS_TYPE=ext4\n"));

    db.delete(&dev);
    assert!(!record.exists());
    // idempotent
    db.delete(&dev);
}

#[test]
fn tag_and_untag_index_entries() {
    let dir = TempDir::new().unwrap();
    let db = DeviceDb::new(dir.path());
    let dev = tagged_disk();

    db.tag(&dev).unwrap();
    assert!(dir.path().join("tags/systemd/b8:0").exists());
    assert!(dir.path().join("tags/seat/b8:0").exists());

    db.untag(&dev);
    assert!(!dir.path().join("tags/systemd/b8:0").exists());
    assert!(!dir.path().join("tags/seat/b8:0").exists());
}

#[test]
fn untag_without_tags_property_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let db = DeviceDb::new(dir.path());
    let mut dev = tagged_disk();
    dev.properties.remove("TAGS");
    db.untag(&dev);
}
