// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Centralized environment and kernel-cmdline access for the daemon crate.

use std::path::PathBuf;
use std::time::Duration;

/// Resolve the runtime directory: `DEVD_RUNTIME_DIR` > `/run/devd`.
///
/// Holds the control socket, the queue marker, the pidfile, the device db
/// and the tag index.
pub fn runtime_dir() -> PathBuf {
    std::env::var("DEVD_RUNTIME_DIR").map(PathBuf::from).unwrap_or_else(|_| "/run/devd".into())
}

/// Rules directories, newest-mtime-wins for reload detection.
/// `DEVD_RULES_DIRS` is colon-separated and overrides the defaults.
pub fn rules_dirs() -> Vec<PathBuf> {
    if let Ok(dirs) = std::env::var("DEVD_RULES_DIRS") {
        return dirs.split(':').filter(|s| !s.is_empty()).map(PathBuf::from).collect();
    }
    vec![
        PathBuf::from("/etc/devd/rules.d"),
        PathBuf::from("/run/devd/rules.d"),
        PathBuf::from("/usr/lib/devd/rules.d"),
    ]
}

/// Options recognized on the kernel command line.
///
/// Keys use the `devd.` prefix, with `rd.devd.` accepted as an alias so the
/// same flags work from an initrd:
///   devd.log-level=<level>        tracing filter level
///   devd.children-max=<n>         events are fully serialized if set to 1
///   devd.exec-delay=<seconds>     delay execution of every worker action
///   devd.event-timeout=<seconds>  seconds to wait before killing an event
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CmdlineOptions {
    pub log_level: Option<String>,
    pub children_max: Option<u32>,
    pub exec_delay: Option<Duration>,
    pub event_timeout: Option<Duration>,
}

impl CmdlineOptions {
    /// Read and parse `/proc/cmdline`. Missing file (non-Linux test hosts,
    /// containers) yields the defaults.
    pub fn from_proc() -> Self {
        match std::fs::read_to_string("/proc/cmdline") {
            Ok(text) => Self::parse(&text),
            Err(_) => Self::default(),
        }
    }

    pub fn parse(cmdline: &str) -> Self {
        let mut opts = Self::default();
        for word in cmdline.split_whitespace() {
            let Some((key, value)) = word.split_once('=') else {
                continue;
            };
            let key = key.strip_prefix("rd.").unwrap_or(key);
            let Some(key) = key.strip_prefix("devd.") else {
                continue;
            };
            match key {
                "log-level" => opts.log_level = Some(value.to_string()),
                "children-max" => match value.parse() {
                    Ok(n) => opts.children_max = Some(n),
                    Err(_) => tracing::warn!(value, "invalid devd.children-max ignored"),
                },
                "exec-delay" => match value.parse() {
                    Ok(secs) => opts.exec_delay = Some(Duration::from_secs(secs)),
                    Err(_) => tracing::warn!(value, "invalid devd.exec-delay ignored"),
                },
                "event-timeout" => match value.parse::<u64>() {
                    Ok(secs) => opts.event_timeout = Some(Duration::from_secs(secs)),
                    Err(_) => tracing::warn!(value, "invalid devd.event-timeout ignored"),
                },
                _ => {}
            }
        }
        opts
    }
}

#[cfg(test)]
#[path = "env_tests.rs"]
mod tests;
