// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Device-node watching.
//!
//! Watched nodes (block devices a worker processed) report close-after-write
//! so the daemon can react when a partitioner or mkfs finishes: either the
//! kernel re-reads the partition table itself, or a `change` event is
//! synthesized through sysfs and re-enters through the netlink path.

use devd_core::Device;
use nix::fcntl::{Flock, FlockArg};
use notify::{RecursiveMode, Watcher};
use std::collections::HashMap;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// What a filesystem notification means for a watched device node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    /// An exclusive-write opener closed the node.
    CloseWrite,
    /// The node is gone; tear the watch down.
    Gone,
}

pub fn classify(kind: &notify::EventKind) -> Option<WatchKind> {
    use notify::event::{AccessKind, AccessMode, EventKind};
    match kind {
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => Some(WatchKind::CloseWrite),
        EventKind::Remove(_) => Some(WatchKind::Gone),
        _ => None,
    }
}

/// Watches device nodes and maps notifications back to their devices.
pub struct WatchHandler {
    watcher: Option<notify::RecommendedWatcher>,
    devices: HashMap<PathBuf, Device>,
    rx: mpsc::UnboundedReceiver<notify::Event>,
}

impl WatchHandler {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if let Ok(event) = res {
                let _ = tx.send(event);
            }
        });
        let watcher = match watcher {
            Ok(w) => Some(w),
            Err(e) => {
                warn!(error = %e, "could not initialize device node watching");
                None
            }
        };
        Self { watcher, devices: HashMap::new(), rx }
    }

    /// Start watching a device's node.
    pub fn begin(&mut self, dev: &Device) {
        let Some(node) = dev.devnode() else {
            return;
        };
        let Some(watcher) = self.watcher.as_mut() else {
            return;
        };
        match watcher.watch(node, RecursiveMode::NonRecursive) {
            Ok(()) => {
                debug!(node = %node.display(), "watching device node");
                self.devices.insert(node.to_path_buf(), dev.clone());
            }
            Err(e) => debug!(node = %node.display(), error = %e, "could not watch device node"),
        }
    }

    /// Stop watching a device's node.
    pub fn end(&mut self, node: &Path) {
        if self.devices.remove(node).is_some() {
            debug!(node = %node.display(), "no longer watching device node");
            if let Some(watcher) = self.watcher.as_mut() {
                let _ = watcher.unwatch(node);
            }
        }
    }

    pub fn lookup(&self, node: &Path) -> Option<&Device> {
        self.devices.get(node)
    }

    pub fn watched_count(&self) -> usize {
        self.devices.len()
    }

    /// Wait for the next notification batch.
    pub async fn next(&mut self) -> Option<notify::Event> {
        self.rx.recv().await
    }

    /// Drain without waiting.
    pub fn try_next(&mut self) -> Option<notify::Event> {
        self.rx.try_recv().ok()
    }

    /// Drop all watches (shutdown).
    pub fn close(&mut self) {
        self.watcher = None;
        self.devices.clear();
    }
}

impl Default for WatchHandler {
    fn default() -> Self {
        Self::new()
    }
}

/// Sysfs access, rooted for tests.
#[derive(Debug, Clone)]
pub struct Sysfs {
    root: PathBuf,
}

impl Sysfs {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn system() -> Self {
        Self::new("/sys")
    }

    fn dir(&self, devpath: &str) -> PathBuf {
        self.root.join(devpath.trim_start_matches('/'))
    }

    /// Ask the kernel to emit an event for the device by writing its
    /// `uevent` attribute.
    pub fn write_uevent(&self, devpath: &str, action: &str) -> io::Result<()> {
        std::fs::write(self.dir(devpath).join("uevent"), action)
    }

    /// Resolve a device's node from its sysfs `uevent` attribute
    /// (`DEVNAME=` line).
    pub fn devnode_of(&self, devpath: &str) -> Option<PathBuf> {
        let content = std::fs::read_to_string(self.dir(devpath).join("uevent")).ok()?;
        let name = content.lines().find_map(|line| line.strip_prefix("DEVNAME="))?;
        if name.starts_with('/') {
            Some(PathBuf::from(name))
        } else {
            Some(Path::new("/dev").join(name))
        }
    }

    /// Devpaths of the partitions of a disk: child directories carrying a
    /// `partition` attribute.
    pub fn partitions(&self, disk_devpath: &str) -> Vec<String> {
        let mut partitions = Vec::new();
        let Ok(entries) = std::fs::read_dir(self.dir(disk_devpath)) else {
            return partitions;
        };
        for entry in entries.flatten() {
            if !entry.path().join("partition").exists() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                partitions.push(format!("{}/{}", disk_devpath, name));
            }
        }
        partitions.sort();
        partitions
    }
}

mod ioctl {
    #![allow(unsafe_code)]
    // BLKRRPART: _IO(0x12, 95), re-read partition table
    nix::ioctl_none!(blkrrpart, 0x12, 95);
}

/// Try to make the kernel re-read a disk's partition table.
///
/// Succeeds only when no other opener holds the device; the exclusive
/// non-blocking flock probes that without stalling the supervisor.
pub fn reread_partition_table(node: &Path) -> bool {
    let file = match std::fs::OpenOptions::new()
        .read(true)
        .custom_flags(node_open_flags())
        .open(node)
    {
        Ok(f) => f,
        Err(_) => return false,
    };
    let lock = match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(lock) => lock,
        Err(_) => return false,
    };
    #[allow(unsafe_code)]
    let result = unsafe { ioctl::blkrrpart(std::os::fd::AsRawFd::as_raw_fd(&*lock)) };
    result.is_ok()
}

/// Open flags for device nodes: never block, never follow symlinks.
pub(crate) fn node_open_flags() -> i32 {
    use nix::fcntl::OFlag;
    (OFlag::O_CLOEXEC | OFlag::O_NOFOLLOW | OFlag::O_NONBLOCK).bits()
}

/// React to a close-after-write on a watched device node.
///
/// For a whole disk (not device-mapper), try the partition re-read first: if
/// it works and partitions exist the kernel has already sent change/remove/
/// add events and nothing more is needed. Otherwise write `change` to the
/// disk and each partition. Any other device just gets a `change`.
pub fn synthesize_change(dev: &Device, sysfs: &Sysfs) -> io::Result<()> {
    if dev.is_block()
        && dev.devtype.as_deref() == Some("disk")
        && !dev.sysname().starts_with("dm-")
    {
        let partitions = sysfs.partitions(&dev.devpath);
        let part_table_read = dev.devnode().map(reread_partition_table).unwrap_or(false);

        if part_table_read && !partitions.is_empty() {
            return Ok(());
        }

        debug!(devpath = %dev.devpath, "device closed, synthesising change");
        sysfs.write_uevent(&dev.devpath, "change")?;
        for partition in &partitions {
            debug!(devpath = %partition, "synthesising partition change");
            sysfs.write_uevent(partition, "change")?;
        }
        return Ok(());
    }

    debug!(devpath = %dev.devpath, "device closed, synthesising change");
    sysfs.write_uevent(&dev.devpath, "change")
}

#[cfg(test)]
#[path = "watch_tests.rs"]
mod tests;
