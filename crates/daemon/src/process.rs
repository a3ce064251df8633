// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker process creation and reaping.
//!
//! Workers are separate OS processes: they exec rule programs and must not
//! share the supervisor's address space. Each spawn re-executes the daemon
//! binary in worker mode with two inherited fds at fixed numbers: the
//! device channel receive side and the shared completion channel write side.

use crate::pool::{DeviceLink, ExitOutcome, KillSignal, SpawnError, SpawnedWorker, WorkerSpawner};
use devd_core::Device;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{close, dup, dup2, Pid};
use std::collections::BTreeMap;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixDatagram;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Fd the worker child receives devices on.
pub const WORKER_DEVICE_FD: RawFd = 3;
/// Fd the worker child posts completions to.
pub const WORKER_COMPLETION_FD: RawFd = 4;

/// Supervisor-held send side of one worker's device channel.
pub struct DatagramLink {
    sock: UnixDatagram,
}

impl DeviceLink for DatagramLink {
    fn send(&self, dev: &Device) -> io::Result<()> {
        let payload = serde_json::to_vec(dev).map_err(io::Error::other)?;
        self.sock.send(&payload)?;
        Ok(())
    }
}

/// Spawns worker children by re-executing the daemon binary.
pub struct ProcessSpawner {
    completion_tx: OwnedFd,
    runtime_dir: PathBuf,
    sysfs_root: PathBuf,
    exec_delay: Duration,
    properties: BTreeMap<String, Option<String>>,
    log_level: String,
}

impl ProcessSpawner {
    pub fn new(
        completion_tx: OwnedFd,
        runtime_dir: PathBuf,
        sysfs_root: PathBuf,
        exec_delay: Duration,
        log_level: String,
    ) -> Self {
        Self {
            completion_tx,
            runtime_dir,
            sysfs_root,
            exec_delay,
            properties: BTreeMap::new(),
            log_level,
        }
    }
}

impl WorkerSpawner for ProcessSpawner {
    fn spawn(&mut self, initial: &Device) -> Result<SpawnedWorker, SpawnError> {
        let (supervisor_end, worker_end) = UnixDatagram::pair()?;
        supervisor_end.set_nonblocking(true)?;

        let mut cmd = std::process::Command::new(std::env::current_exe()?);
        cmd.arg("worker");
        cmd.env("DEVD_RUNTIME_DIR", &self.runtime_dir);
        cmd.env("DEVD_SYSFS_ROOT", &self.sysfs_root);
        cmd.env("DEVD_LOG", &self.log_level);
        cmd.env(
            "DEVD_PROPERTIES",
            serde_json::to_string(&self.properties).map_err(io::Error::other)?,
        );
        if !self.exec_delay.is_zero() {
            cmd.env("DEVD_EXEC_DELAY", self.exec_delay.as_secs().to_string());
        }

        let device_fd = worker_end.as_raw_fd();
        let completion_fd = self.completion_tx.as_raw_fd();
        #[allow(unsafe_code)]
        // runs between fork and exec; only async-signal-safe fd calls
        unsafe {
            cmd.pre_exec(move || {
                inherit_fd(device_fd, WORKER_DEVICE_FD)?;
                inherit_fd(completion_fd, WORKER_COMPLETION_FD)?;
                Ok(())
            });
        }

        let child = cmd.spawn()?;
        let pid = child.id() as i32;
        drop(child); // reaped via waitpid on SIGCHLD, not through the handle

        // hand over the initial device; the pair buffers it until the
        // child's receive loop starts
        let link = DatagramLink { sock: supervisor_end };
        if let Err(e) = link.send(initial) {
            let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            return Err(e.into());
        }

        Ok(SpawnedWorker { pid, link: Box::new(link) })
    }

    fn reap(&mut self) -> Vec<(i32, ExitOutcome)> {
        let mut reaped = Vec::new();
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, 0)) => reaped.push((pid.as_raw(), ExitOutcome::Clean)),
                Ok(WaitStatus::Exited(pid, code)) => {
                    reaped.push((pid.as_raw(), ExitOutcome::Exited(code)))
                }
                Ok(WaitStatus::Signaled(pid, signal, _)) => {
                    reaped.push((pid.as_raw(), ExitOutcome::Signaled(signal as i32)))
                }
                Ok(WaitStatus::StillAlive) | Err(_) => break,
                Ok(_) => continue,
            }
        }
        reaped
    }

    fn kill(&self, pid: i32, signal: KillSignal) {
        let signal = match signal {
            KillSignal::Term => Signal::SIGTERM,
            KillSignal::Kill => Signal::SIGKILL,
        };
        let _ = kill(Pid::from_raw(pid), signal);
    }

    fn set_properties(&mut self, properties: &BTreeMap<String, Option<String>>) {
        self.properties = properties.clone();
    }

    fn set_log_level(&mut self, level: &str) {
        self.log_level = level.to_string();
    }
}

/// Pin an inherited fd to its agreed number and make it survive exec.
/// `dup2` clears close-on-exec on the copy; when the fd already sits at the
/// target number, bounce it through a scratch fd to get the same effect.
fn inherit_fd(from: RawFd, to: RawFd) -> io::Result<()> {
    if from == to {
        let scratch = dup(from)?;
        dup2(scratch, to)?;
        close(scratch)?;
    } else {
        dup2(from, to)?;
    }
    Ok(())
}

/// Cgroup directory this process lives in (unified hierarchy).
pub fn current_cgroup() -> Option<PathBuf> {
    let content = std::fs::read_to_string("/proc/self/cgroup").ok()?;
    for line in content.lines() {
        if let Some(path) = line.strip_prefix("0::") {
            return Some(Path::new("/sys/fs/cgroup").join(path.trim_start_matches('/')));
        }
    }
    None
}

/// Kill processes left behind in the daemon's cgroup. Run only while fully
/// idle, so anything found is a straggler from a killed worker's session.
pub fn kill_cgroup_stragglers(cgroup_dir: &Path) {
    let own_pid = std::process::id() as i32;
    let Ok(procs) = std::fs::read_to_string(cgroup_dir.join("cgroup.procs")) else {
        return;
    };
    for pid in procs.lines().filter_map(|l| l.trim().parse::<i32>().ok()) {
        if pid == own_pid {
            continue;
        }
        debug!(pid, "killing stray process in cgroup");
        let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
    }
}
