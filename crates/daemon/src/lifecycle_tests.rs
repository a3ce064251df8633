// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use serial_test::serial;

#[test]
#[serial]
fn defaults_apply_without_overrides() {
    std::env::remove_var("DEVD_RUNTIME_DIR");
    let config = Config::resolve(&Overrides::default(), CmdlineOptions::default());

    assert_eq!(config.event_timeout, DEFAULT_EVENT_TIMEOUT);
    assert_eq!(config.event_timeout_warn, DEFAULT_EVENT_TIMEOUT / 3);
    assert!(config.children_max >= 8 + 2);
    assert_eq!(config.exec_delay, Duration::ZERO);
    assert_eq!(config.log_level, "info");
    assert_eq!(config.socket_path, PathBuf::from("/run/devd/control"));
    assert_eq!(config.lock_path, PathBuf::from("/run/devd/pid"));
}

#[test]
#[serial]
fn flags_beat_cmdline_beat_defaults() {
    let cmdline = CmdlineOptions::parse(
        "devd.children-max=2 devd.event-timeout=60 devd.log-level=trace devd.exec-delay=5",
    );
    let overrides = Overrides {
        debug: false,
        children_max: Some(9),
        exec_delay: None,
        event_timeout: None,
    };
    let config = Config::resolve(&overrides, cmdline);

    assert_eq!(config.children_max, 9);
    assert_eq!(config.event_timeout, Duration::from_secs(60));
    assert_eq!(config.event_timeout_warn, Duration::from_secs(20));
    assert_eq!(config.exec_delay, Duration::from_secs(5));
    assert_eq!(config.log_level, "trace");
}

#[test]
#[serial]
fn debug_flag_overrides_log_level() {
    let cmdline = CmdlineOptions::parse("devd.log-level=warn");
    let overrides = Overrides { debug: true, ..Default::default() };
    let config = Config::resolve(&overrides, cmdline);
    assert_eq!(config.log_level, "debug");
}

#[test]
#[serial]
fn warn_timeout_never_collapses_to_zero() {
    let overrides = Overrides {
        event_timeout: Some(Duration::from_nanos(1)),
        ..Default::default()
    };
    let config = Config::resolve(&overrides, CmdlineOptions::default());
    assert!(config.event_timeout_warn > Duration::ZERO);
}
