// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;

fn datagram(parts: &[&str]) -> Vec<u8> {
    let mut buf = Vec::new();
    for part in parts {
        buf.extend_from_slice(part.as_bytes());
        buf.push(0);
    }
    buf
}

#[test]
fn parses_block_device_uevent() {
    let buf = datagram(&[
        "add@/devices/pci0000:00/block/sda",
        "ACTION=add",
        "DEVPATH=/devices/pci0000:00/block/sda",
        "SUBSYSTEM=block",
        "DEVTYPE=disk",
        "DEVNAME=sda",
        "MAJOR=8",
        "MINOR=0",
        "SEQNUM=4711",
    ]);

    let dev = parse_uevent(&buf).unwrap();
    assert_eq!(dev.seqnum, 4711);
    assert_eq!(dev.action, Action::Add);
    assert_eq!(dev.devpath, "/devices/pci0000:00/block/sda");
    assert_eq!(dev.subsystem.as_deref(), Some("block"));
    assert_eq!(dev.devtype.as_deref(), Some("disk"));
    assert_eq!(dev.devnode.as_deref(), Some(std::path::Path::new("/dev/sda")));
    assert_eq!(dev.devnum, Some(Devnum::new(8, 0)));
    assert_eq!(dev.ifindex, 0);
}

#[test]
fn parses_network_move_uevent() {
    let buf = datagram(&[
        "move@/devices/virtual/net/lan0",
        "ACTION=move",
        "DEVPATH=/devices/virtual/net/lan0",
        "DEVPATH_OLD=/devices/virtual/net/eth0",
        "SUBSYSTEM=net",
        "IFINDEX=3",
        "SEQNUM=99",
    ]);

    let dev = parse_uevent(&buf).unwrap();
    assert_eq!(dev.action, Action::Move);
    assert_eq!(dev.devpath_old.as_deref(), Some("/devices/virtual/net/eth0"));
    assert_eq!(dev.ifindex, 3);
    assert_eq!(dev.devnum, None);
}

#[test]
fn rejects_datagram_without_header() {
    assert!(parse_uevent(b"ACTION=add\0SEQNUM=1\0").is_none());
}

#[test]
fn rejects_datagram_without_seqnum() {
    let buf = datagram(&["add@/devices/a", "ACTION=add", "DEVPATH=/devices/a"]);
    assert!(parse_uevent(&buf).is_none());
}

#[test]
fn header_fills_in_missing_action_and_devpath() {
    let buf = datagram(&["change@/devices/a", "SEQNUM=8"]);
    let dev = parse_uevent(&buf).unwrap();
    assert_eq!(dev.action, Action::Change);
    assert_eq!(dev.devpath, "/devices/a");
}

#[test]
fn format_then_parse_round_trips() {
    let mut dev = Device::new(1234, Action::Change, "/devices/virtual/block/sda");
    dev.subsystem = Some("block".into());
    dev.devtype = Some("disk".into());
    dev.devnode = Some("/dev/sda".into());
    dev.devnum = Some(Devnum::new(8, 0));
    dev.properties.insert("ID_FS_TYPE".into(), "ext4".into());

    let wire = format_uevent(&dev);
    let back = parse_uevent(&wire).unwrap();
    assert_eq!(back.seqnum, dev.seqnum);
    assert_eq!(back.action, dev.action);
    assert_eq!(back.devpath, dev.devpath);
    assert_eq!(back.devnum, dev.devnum);
    assert_eq!(back.property("ID_FS_TYPE"), Some("ext4"));
}
