// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use serial_test::serial;
use std::time::Duration;

#[test]
fn cmdline_parses_all_recognized_keys() {
    let opts = CmdlineOptions::parse(
        "BOOT_IMAGE=/vmlinuz root=/dev/sda1 devd.log-level=debug \
         devd.children-max=4 devd.exec-delay=2 devd.event-timeout=60 quiet",
    );
    assert_eq!(opts.log_level.as_deref(), Some("debug"));
    assert_eq!(opts.children_max, Some(4));
    assert_eq!(opts.exec_delay, Some(Duration::from_secs(2)));
    assert_eq!(opts.event_timeout, Some(Duration::from_secs(60)));
}

#[test]
fn cmdline_accepts_rd_prefix() {
    let opts = CmdlineOptions::parse("rd.devd.children-max=1");
    assert_eq!(opts.children_max, Some(1));
}

#[test]
fn cmdline_ignores_invalid_values() {
    let opts = CmdlineOptions::parse("devd.children-max=lots devd.event-timeout=-1");
    assert_eq!(opts, CmdlineOptions::default());
}

#[test]
fn cmdline_ignores_foreign_keys_and_bare_words() {
    let opts = CmdlineOptions::parse("ro single udev.children-max=9 devd.unknown=1");
    assert_eq!(opts, CmdlineOptions::default());
}

#[test]
#[serial]
fn runtime_dir_honors_override() {
    std::env::set_var("DEVD_RUNTIME_DIR", "/tmp/devd-test");
    assert_eq!(runtime_dir(), PathBuf::from("/tmp/devd-test"));
    std::env::remove_var("DEVD_RUNTIME_DIR");
    assert_eq!(runtime_dir(), PathBuf::from("/run/devd"));
}

#[test]
#[serial]
fn rules_dirs_split_on_colon() {
    std::env::set_var("DEVD_RULES_DIRS", "/tmp/a:/tmp/b");
    assert_eq!(rules_dirs(), vec![PathBuf::from("/tmp/a"), PathBuf::from("/tmp/b")]);
    std::env::remove_var("DEVD_RULES_DIRS");
    assert_eq!(rules_dirs().len(), 3);
}
