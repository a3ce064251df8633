// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use yare::parameterized;

fn disk(seqnum: u64, devpath: &str) -> Device {
    let mut dev = Device::new(seqnum, Action::Add, devpath);
    dev.subsystem = Some("block".into());
    dev.devtype = Some("disk".into());
    dev.devnum = Some(Devnum::new(8, 0));
    dev.devnode = Some("/dev/sda".into());
    dev
}

#[parameterized(
    add = { "add", Action::Add },
    remove = { "remove", Action::Remove },
    change = { "change", Action::Change },
    r#move = { "move", Action::Move },
    bind = { "bind", Action::Bind },
    unknown = { "frobnicate", Action::Other("frobnicate".into()) },
)]
fn action_parse_round_trips(text: &str, expected: Action) {
    let action = Action::parse(text);
    assert_eq!(action, expected);
    assert_eq!(action.as_str(), text);
}

#[test]
fn sysname_is_last_devpath_component() {
    let dev = disk(1, "/devices/pci0000:00/0000:00:1f.2/ata1/host0/target0:0:0/0:0:0:0/block/sda");
    assert_eq!(dev.sysname(), "sda");
}

#[test]
fn parent_devpath_strips_one_component() {
    let dev = disk(1, "/devices/virtual/block/sda/sda1");
    assert_eq!(dev.parent_devpath(), Some("/devices/virtual/block/sda"));
}

#[test]
fn device_id_for_block_node() {
    let dev = disk(1, "/devices/virtual/block/sda");
    assert_eq!(dev.device_id(), "b8:0");
}

#[test]
fn device_id_for_char_node() {
    let mut dev = Device::new(1, Action::Add, "/devices/virtual/tty/tty0");
    dev.subsystem = Some("tty".into());
    dev.devnum = Some(Devnum::new(4, 0));
    assert_eq!(dev.device_id(), "c4:0");
}

#[test]
fn device_id_for_net_interface() {
    let mut dev = Device::new(1, Action::Add, "/devices/virtual/net/lo");
    dev.subsystem = Some("net".into());
    dev.ifindex = 2;
    assert_eq!(dev.device_id(), "n2");
}

#[test]
fn device_id_falls_back_to_subsystem_and_sysname() {
    let mut dev = Device::new(1, Action::Add, "/devices/platform/serial8250");
    dev.subsystem = Some("platform".into());
    assert_eq!(dev.device_id(), "+platform:serial8250");
}

#[test]
fn zero_major_devnum_is_not_significant() {
    let mut dev = Device::new(1, Action::Add, "/devices/foo");
    dev.devnum = Some(Devnum::new(0, 5));
    assert!(!dev.devnum.unwrap().is_significant());
    assert_eq!(dev.device_id(), "+:foo");
}

#[test]
fn serde_round_trip_preserves_all_fields() {
    let mut dev = disk(42, "/devices/virtual/block/sda");
    dev.devpath_old = Some("/devices/virtual/block/sdz".into());
    dev.properties.insert("ID_FS_TYPE".into(), "ext4".into());

    let json = serde_json::to_string(&dev).unwrap();
    let back: Device = serde_json::from_str(&json).unwrap();
    assert_eq!(back, dev);
}

#[test]
fn action_serializes_as_plain_verb() {
    let json = serde_json::to_string(&Action::Change).unwrap();
    assert_eq!(json, "\"change\"");
    let other: Action = serde_json::from_str("\"weird\"").unwrap();
    assert_eq!(other, Action::Other("weird".into()));
}
