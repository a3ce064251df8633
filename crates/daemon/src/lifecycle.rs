// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Daemon startup: configuration resolution, single-instance locking,
//! socket binding and wiring the supervisor together.

use std::fs::File;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use devd_core::SystemClock;
use fs2::FileExt;
use thiserror::Error;
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::channel::CredChannel;
use crate::env::{self, CmdlineOptions};
use crate::listener::{ListenCtx, Listener};
use crate::logging::LogHandle;
use crate::monitor::NetlinkMonitor;
use crate::process::{self, ProcessSpawner};
use crate::signals::Signals;
use crate::supervisor::{Daemon, DaemonDeps, Settings};
use crate::watch::Sysfs;

/// Default event kill timeout; warn fires at a third of it.
pub const DEFAULT_EVENT_TIMEOUT: Duration = Duration::from_secs(180);

/// Daemon configuration, resolved from flags > kernel cmdline > defaults.
#[derive(Debug, Clone)]
pub struct Config {
    pub runtime_dir: PathBuf,
    pub socket_path: PathBuf,
    pub lock_path: PathBuf,
    pub rules_dirs: Vec<PathBuf>,
    pub children_max: u32,
    pub exec_delay: Duration,
    pub event_timeout: Duration,
    pub event_timeout_warn: Duration,
    pub log_level: String,
}

/// Command-line overrides collected by `main`.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub debug: bool,
    pub children_max: Option<u32>,
    pub exec_delay: Option<Duration>,
    pub event_timeout: Option<Duration>,
}

impl Config {
    pub fn load(overrides: &Overrides) -> Self {
        Self::resolve(overrides, CmdlineOptions::from_proc())
    }

    fn resolve(overrides: &Overrides, cmdline: CmdlineOptions) -> Self {
        let runtime_dir = env::runtime_dir();
        let event_timeout = overrides
            .event_timeout
            .or(cmdline.event_timeout)
            .unwrap_or(DEFAULT_EVENT_TIMEOUT);
        let event_timeout_warn =
            (event_timeout / 3).max(Duration::from_micros(1));
        let children_max = overrides
            .children_max
            .or(cmdline.children_max)
            .unwrap_or_else(default_children_max);
        let log_level = if overrides.debug {
            "debug".to_string()
        } else {
            cmdline.log_level.unwrap_or_else(|| "info".to_string())
        };

        Self {
            socket_path: runtime_dir.join("control"),
            lock_path: runtime_dir.join("pid"),
            rules_dirs: env::rules_dirs(),
            children_max,
            exec_delay: overrides.exec_delay.or(cmdline.exec_delay).unwrap_or(Duration::ZERO),
            event_timeout,
            event_timeout_warn,
            log_level,
            runtime_dir,
        }
    }
}

/// Default pool cap: 8 plus two workers per cpu.
fn default_children_max() -> u32 {
    let cpus = std::thread::available_parallelism().map(|n| n.get() as u32).unwrap_or(1);
    8 + 2 * cpus
}

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("root privileges required")]
    RootRequired,

    #[error("failed to acquire lock: daemon already running?")]
    LockFailed(#[source] std::io::Error),

    #[error("failed to bind control socket at {0}: {1}")]
    BindFailed(PathBuf, std::io::Error),

    #[error("error binding netlink uevent socket: {0}")]
    Monitor(std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Fully wired daemon plus the listener task to spawn.
pub struct StartupResult {
    pub daemon: Daemon<NetlinkMonitor, CredChannel, ProcessSpawner, SystemClock>,
    pub listener: Listener,
    // NOTE(lifetime): held to keep the exclusive pidfile lock; released on drop
    #[allow(dead_code)]
    lock_file: File,
}

/// Bring the daemon up. Must run inside the tokio runtime (socket
/// registration). All failures here are fatal.
pub fn startup(config: &Config, log_handle: LogHandle) -> Result<StartupResult, LifecycleError> {
    if !nix::unistd::geteuid().is_root() {
        return Err(LifecycleError::RootRequired);
    }

    std::fs::create_dir_all(&config.runtime_dir)?;

    let mut lock_file = File::create(&config.lock_path)?;
    lock_file.try_lock_exclusive().map_err(LifecycleError::LockFailed)?;
    lock_file.set_len(0)?;
    writeln!(lock_file, "{}", std::process::id())?;

    // a previous instance may have left its socket behind
    let _ = std::fs::remove_file(&config.socket_path);
    let unix = UnixListener::bind(&config.socket_path)
        .map_err(|e| LifecycleError::BindFailed(config.socket_path.clone(), e))?;

    let monitor = NetlinkMonitor::new().map_err(LifecycleError::Monitor)?;
    let (completions, completion_tx) = CredChannel::new()?;
    let spawner = ProcessSpawner::new(
        completion_tx,
        config.runtime_dir.clone(),
        PathBuf::from("/sys"),
        config.exec_delay,
        config.log_level.clone(),
    );
    let signals = Signals::new()?;

    let (ctrl_tx, ctrl_rx) = mpsc::channel(64);
    let cancel = CancellationToken::new();
    let listener =
        Listener::new(unix, Arc::new(ListenCtx { ctrl_tx, cancel: cancel.clone() }));

    let settings = Settings {
        runtime_dir: config.runtime_dir.clone(),
        rules_dirs: config.rules_dirs.clone(),
        children_max: config.children_max,
        event_timeout: config.event_timeout,
        event_timeout_warn: config.event_timeout_warn,
        cgroup: process::current_cgroup(),
    };

    info!(
        children_max = config.children_max,
        socket = %config.socket_path.display(),
        "daemon starting"
    );

    let daemon = Daemon::new(DaemonDeps {
        monitor,
        completions,
        spawner,
        clock: SystemClock,
        signals: Some(signals),
        ctrl_rx,
        cancel,
        log_handle,
        sysfs: Sysfs::system(),
        settings,
    });

    Ok(StartupResult { daemon, listener, lock_file })
}

#[cfg(test)]
#[path = "lifecycle_tests.rs"]
mod tests;
