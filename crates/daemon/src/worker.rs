// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker child process.
//!
//! Each worker handles one device at a time to completion: receive, lock
//! the node, process, publish, report done, then park on the channel until
//! the supervisor sends the next device or SIGTERM. Rule execution proper
//! is the executor's business; the worker applies the supervisor's property
//! overrides, persists the device record and re-publishes the device.

use crate::channel::send_completion;
use crate::db::DeviceDb;
use crate::monitor::{Monitor, NetlinkMonitor};
use crate::process::{WORKER_COMPLETION_FD, WORKER_DEVICE_FD};
use crate::watch::{node_open_flags, Sysfs};
use devd_core::{Action, Device};
use nix::fcntl::{Flock, FlockArg};
use std::collections::BTreeMap;
use std::fs::File;
use std::os::fd::FromRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, warn};

struct WorkerContext {
    db: DeviceDb,
    sysfs: Sysfs,
    properties: BTreeMap<String, Option<String>>,
    exec_delay: Duration,
    monitor: Option<NetlinkMonitor>,
}

impl WorkerContext {
    fn from_env() -> Self {
        let runtime_dir = crate::env::runtime_dir();
        let sysfs_root =
            std::env::var("DEVD_SYSFS_ROOT").unwrap_or_else(|_| "/sys".to_string());
        let properties = std::env::var("DEVD_PROPERTIES")
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();
        let exec_delay = std::env::var("DEVD_EXEC_DELAY")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::ZERO);
        let monitor = match NetlinkMonitor::sender() {
            Ok(monitor) => Some(monitor),
            Err(e) => {
                warn!(error = %e, "no listener fan-out, processed events will not be published");
                None
            }
        };
        Self {
            db: DeviceDb::new(&runtime_dir),
            sysfs: Sysfs::new(sysfs_root),
            properties,
            exec_delay,
            monitor,
        }
    }

    async fn handle(&self, mut dev: Device) {
        debug!(seqnum = dev.seqnum, "event running");

        if !self.exec_delay.is_zero() {
            tokio::time::sleep(self.exec_delay).await;
        }

        let _lock = match take_device_lock(&dev, &self.sysfs) {
            LockVerdict::Busy(node) => {
                debug!(node = %node.display(), "device is locked, skipping event handling");
                return;
            }
            LockVerdict::Locked(lock) => Some(lock),
            LockVerdict::NotNeeded => None,
        };

        apply_overrides(&mut dev, &self.properties);

        if let Err(e) = self.db.write(&dev) {
            warn!(error = %e, "could not persist device record");
        }
        if let Err(e) = self.db.tag(&dev) {
            warn!(error = %e, "could not index device tags");
        }

        if let Some(monitor) = &self.monitor {
            if let Err(e) = monitor.broadcast(&dev) {
                warn!(error = %e, "could not publish processed device");
            }
        }

        debug!(seqnum = dev.seqnum, "event processed");
    }
}

/// Overlay the supervisor's property overrides onto the device.
pub(crate) fn apply_overrides(dev: &mut Device, overrides: &BTreeMap<String, Option<String>>) {
    for (key, value) in overrides {
        match value {
            Some(value) => {
                dev.properties.insert(key.clone(), value.clone());
            }
            None => {
                dev.properties.remove(key);
            }
        }
    }
}

enum LockVerdict {
    NotNeeded,
    Locked(Flock<File>),
    Busy(PathBuf),
}

/// Node whose advisory lock serializes access to the device: the device's
/// own node, or the parent disk's for a partition. Only plain block devices
/// are locked; device-mapper and md have their own coordination.
pub(crate) fn lock_target(dev: &Device, sysfs: &Sysfs) -> Option<PathBuf> {
    if dev.action == Action::Remove || !dev.is_block() {
        return None;
    }
    let sysname = dev.sysname();
    if sysname.starts_with("dm-") || sysname.starts_with("md") {
        return None;
    }
    if dev.is_partition() {
        return sysfs.devnode_of(dev.parent_devpath()?);
    }
    dev.devnode().map(PathBuf::from)
}

/// Take a shared lock on the device node. An external process holding the
/// node exclusively means the whole event is skipped.
fn take_device_lock(dev: &Device, sysfs: &Sysfs) -> LockVerdict {
    let Some(node) = lock_target(dev, sysfs) else {
        return LockVerdict::NotNeeded;
    };
    let file = match std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(node_open_flags())
        .open(&node)
    {
        Ok(file) => file,
        Err(_) => return LockVerdict::NotNeeded,
    };
    match Flock::lock(file, FlockArg::LockSharedNonblock) {
        Ok(lock) => LockVerdict::Locked(lock),
        Err(_) => LockVerdict::Busy(node),
    }
}

/// Worker entry point. Fds 3 and 4 are inherited from the supervisor.
pub async fn run() -> i32 {
    #[allow(unsafe_code)]
    // fd 3 is handed to us by the supervisor, exclusively ours
    let device_rx = unsafe { std::os::unix::net::UnixDatagram::from_raw_fd(WORKER_DEVICE_FD) };
    if device_rx.set_nonblocking(true).is_err() {
        return 1;
    }
    let device_rx = match tokio::net::UnixDatagram::from_std(device_rx) {
        Ok(sock) => sock,
        Err(e) => {
            warn!(error = %e, "could not adopt device channel");
            return 1;
        }
    };

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(_) => return 1,
    };

    let ctx = WorkerContext::from_env();
    let mut buf = vec![0u8; 64 * 1024];

    loop {
        tokio::select! {
            _ = sigterm.recv() => {
                debug!("worker terminating");
                return 0;
            }
            received = device_rx.recv(&mut buf) => {
                let len = match received {
                    Ok(len) => len,
                    Err(e) => {
                        warn!(error = %e, "device channel failed");
                        return 1;
                    }
                };
                // zero-length read means the supervisor is gone
                if len == 0 {
                    return 0;
                }
                match serde_json::from_slice::<Device>(&buf[..len]) {
                    Ok(dev) => ctx.handle(dev).await,
                    Err(e) => warn!(error = %e, "dropping undecodable device message"),
                }
                if let Err(e) = send_completion(WORKER_COMPLETION_FD) {
                    warn!(error = %e, "failed to report completion to the daemon");
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
