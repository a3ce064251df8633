// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Snapshot of one kernel device event.
//!
//! A `Device` is immutable once it enters the event queue; workers receive a
//! serialized copy and the supervisor keeps the original (plus a clone of the
//! raw kernel form for crash forwarding).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

/// Kernel-assigned uevent sequence number. Strictly monotonically increasing
/// across all events received from the kernel source.
pub type Seqnum = u64;

/// Uevent action verb.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Add,
    Remove,
    Change,
    Move,
    Online,
    Offline,
    Bind,
    Unbind,
    #[serde(untagged)]
    Other(String),
}

impl Action {
    pub fn parse(s: &str) -> Self {
        match s {
            "add" => Action::Add,
            "remove" => Action::Remove,
            "change" => Action::Change,
            "move" => Action::Move,
            "online" => Action::Online,
            "offline" => Action::Offline,
            "bind" => Action::Bind,
            "unbind" => Action::Unbind,
            other => Action::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Action::Add => "add",
            Action::Remove => "remove",
            Action::Change => "change",
            Action::Move => "move",
            Action::Online => "online",
            Action::Offline => "offline",
            Action::Bind => "bind",
            Action::Unbind => "unbind",
            Action::Other(s) => s,
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Major/minor pair of a device node. Significant only when major is non-zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Devnum {
    pub major: u32,
    pub minor: u32,
}

impl Devnum {
    pub fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    pub fn is_significant(&self) -> bool {
        self.major != 0
    }
}

impl fmt::Display for Devnum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.major, self.minor)
    }
}

/// One device event as received from the kernel (or synthesized through
/// sysfs `uevent` writes, which re-enter through the kernel path).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub seqnum: Seqnum,
    pub action: Action,
    /// Absolute sysfs path, e.g. `/devices/pci0000:00/.../sda`.
    pub devpath: String,
    /// Previous devpath for `move` events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devpath_old: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subsystem: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devtype: Option<String>,
    /// Device node under /dev, when the device has one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devnode: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub devnum: Option<Devnum>,
    /// Network interface index; 0 means not a network device.
    #[serde(default)]
    pub ifindex: u32,
    /// Full uevent property set (KEY=VALUE pairs from the kernel, plus
    /// whatever a worker adds while processing).
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

impl Device {
    pub fn new(seqnum: Seqnum, action: Action, devpath: impl Into<String>) -> Self {
        Self {
            seqnum,
            action,
            devpath: devpath.into(),
            devpath_old: None,
            subsystem: None,
            devtype: None,
            devnode: None,
            devnum: None,
            ifindex: 0,
            properties: BTreeMap::new(),
        }
    }

    /// Kernel object name: the last component of the devpath.
    pub fn sysname(&self) -> &str {
        self.devpath.rsplit('/').next().unwrap_or(&self.devpath)
    }

    /// Sysfs path of the parent device, if any.
    pub fn parent_devpath(&self) -> Option<&str> {
        let (parent, _) = self.devpath.rsplit_once('/')?;
        if parent.is_empty() {
            None
        } else {
            Some(parent)
        }
    }

    pub fn is_block(&self) -> bool {
        self.subsystem.as_deref() == Some("block")
    }

    pub fn is_partition(&self) -> bool {
        self.devtype.as_deref() == Some("partition")
    }

    /// Stable identity string used for the device db and tag index:
    /// `b<maj>:<min>` / `c<maj>:<min>` for nodes, `n<ifindex>` for network
    /// interfaces, `+<subsystem>:<sysname>` otherwise.
    pub fn device_id(&self) -> String {
        if let Some(devnum) = self.devnum.filter(|d| d.is_significant()) {
            let kind = if self.is_block() { 'b' } else { 'c' };
            return format!("{}{}", kind, devnum);
        }
        if self.ifindex != 0 {
            return format!("n{}", self.ifindex);
        }
        format!("+{}:{}", self.subsystem.as_deref().unwrap_or(""), self.sysname())
    }

    /// Clone carrying only what the kernel sent, used to forward the raw
    /// event when a worker dies before finishing. Worker-added properties
    /// never reach this copy because the supervisor's snapshot is taken at
    /// enqueue time.
    pub fn kernel_clone(&self) -> Device {
        self.clone()
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn devnode(&self) -> Option<&Path> {
        self.devnode.as_deref()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seq {} {} {}", self.seqnum, self.action, self.devpath)
    }
}

#[cfg(test)]
#[path = "device_tests.rs"]
mod tests;
