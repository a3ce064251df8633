// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Kernel uevent source and listener fan-out.
//!
//! The kernel multicasts one datagram per device event on the
//! `NETLINK_KOBJECT_UEVENT` family, group 1. Processed devices are
//! re-broadcast on group 2 for libudev-style listeners. The supervisor only
//! ever talks to the [`Monitor`] trait so tests can substitute a fake.

use async_trait::async_trait;
use devd_core::{Action, Device, Devnum};
use nix::sys::socket::{
    bind, recvfrom, sendto, setsockopt, socket, sockopt, AddressFamily, MsgFlags, NetlinkAddr,
    SockFlag, SockProtocol, SockType,
};
use std::collections::BTreeMap;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use tokio::io::unix::AsyncFd;
use tracing::{debug, warn};

/// Netlink multicast group the kernel publishes uevents on.
const GROUP_KERNEL: u32 = 1;
/// Group processed events are re-published on for listeners.
const GROUP_LISTENERS: u32 = 2;

/// Receive buffer request; uevent bursts (coldplug, disk rescan) far outrun
/// event processing.
const RECEIVE_BUFFER_SIZE: usize = 128 * 1024 * 1024;

/// Uevent source plus listener fan-out.
#[async_trait]
pub trait Monitor: Send {
    /// Wait until at least one datagram is ready.
    async fn readable(&self) -> io::Result<()>;

    /// Non-blocking receive; `Ok(None)` when the socket is drained.
    fn try_receive(&mut self) -> io::Result<Option<Device>>;

    /// Publish a device to listeners (processed result, or the raw kernel
    /// form when a worker died with it).
    fn broadcast(&self, dev: &Device) -> io::Result<()>;
}

/// Real netlink-backed monitor.
pub struct NetlinkMonitor {
    fd: AsyncFd<OwnedFd>,
    buf: Vec<u8>,
}

impl NetlinkMonitor {
    /// Open and bind the kernel uevent socket. Requires a tokio runtime.
    pub fn new() -> io::Result<Self> {
        let fd = Self::open(GROUP_KERNEL)?;

        // uevent floods must be buffered, not dropped; the forced variant
        // needs CAP_NET_ADMIN, fall back to the plain one
        if setsockopt(&fd, sockopt::RcvBufForce, &RECEIVE_BUFFER_SIZE).is_err() {
            let _ = setsockopt(&fd, sockopt::RcvBuf, &RECEIVE_BUFFER_SIZE);
        }

        Ok(Self { fd: AsyncFd::new(fd)?, buf: vec![0u8; 8192] })
    }

    /// Send-only endpoint used by workers to publish processed devices.
    pub fn sender() -> io::Result<Self> {
        let fd = Self::open(0)?;
        Ok(Self { fd: AsyncFd::new(fd)?, buf: vec![0u8; 8192] })
    }

    fn open(groups: u32) -> io::Result<OwnedFd> {
        let fd = socket(
            AddressFamily::Netlink,
            SockType::Datagram,
            SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
            SockProtocol::NetlinkKObjectUEvent,
        )?;
        bind(fd.as_raw_fd(), &NetlinkAddr::new(0, groups))?;
        Ok(fd)
    }
}

#[async_trait]
impl Monitor for NetlinkMonitor {
    async fn readable(&self) -> io::Result<()> {
        let mut guard = self.fd.readable().await?;
        guard.clear_ready();
        Ok(())
    }

    fn try_receive(&mut self) -> io::Result<Option<Device>> {
        loop {
            let (len, addr) =
                match recvfrom::<NetlinkAddr>(self.fd.get_ref().as_raw_fd(), &mut self.buf) {
                    Ok(r) => r,
                    Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EINTR) => {
                        return Ok(None)
                    }
                    Err(e) => return Err(e.into()),
                };

            // only the kernel (netlink pid 0) is a trusted sender
            if addr.map(|a| a.pid()) != Some(0) {
                debug!("ignoring uevent from userspace sender");
                continue;
            }

            match parse_uevent(&self.buf[..len]) {
                Some(dev) => return Ok(Some(dev)),
                None => {
                    warn!(len, "ignoring malformed uevent datagram");
                    continue;
                }
            }
        }
    }

    fn broadcast(&self, dev: &Device) -> io::Result<()> {
        let payload = format_uevent(dev);
        sendto(
            self.fd.get_ref().as_raw_fd(),
            &payload,
            &NetlinkAddr::new(0, GROUP_LISTENERS),
            MsgFlags::empty(),
        )?;
        Ok(())
    }
}

/// Decode one kernel uevent datagram: `action@devpath\0KEY=VALUE\0...`.
pub fn parse_uevent(buf: &[u8]) -> Option<Device> {
    let text = std::str::from_utf8(buf).ok()?;
    let mut parts = text.split('\0');

    let header = parts.next()?;
    let (header_action, header_devpath) = header.split_once('@')?;

    let mut properties = BTreeMap::new();
    for part in parts {
        if part.is_empty() {
            continue;
        }
        let Some((key, value)) = part.split_once('=') else {
            continue;
        };
        properties.insert(key.to_string(), value.to_string());
    }

    let seqnum = properties.get("SEQNUM")?.parse().ok()?;
    let action = Action::parse(properties.get("ACTION").map_or(header_action, String::as_str));
    let devpath =
        properties.get("DEVPATH").map_or(header_devpath, String::as_str).to_string();

    let mut dev = Device::new(seqnum, action, devpath);
    dev.devpath_old = properties.get("DEVPATH_OLD").cloned();
    dev.subsystem = properties.get("SUBSYSTEM").cloned();
    dev.devtype = properties.get("DEVTYPE").cloned();
    dev.devnode = properties.get("DEVNAME").map(|name| {
        if name.starts_with('/') {
            name.into()
        } else {
            format!("/dev/{}", name).into()
        }
    });
    if let (Some(major), Some(minor)) = (properties.get("MAJOR"), properties.get("MINOR")) {
        if let (Ok(major), Ok(minor)) = (major.parse(), minor.parse()) {
            dev.devnum = Some(Devnum::new(major, minor));
        }
    }
    dev.ifindex = properties.get("IFINDEX").and_then(|s| s.parse().ok()).unwrap_or(0);
    dev.properties = properties;
    Some(dev)
}

/// Encode a device back into the kernel wire form for listener fan-out.
pub fn format_uevent(dev: &Device) -> Vec<u8> {
    let mut properties = dev.properties.clone();
    properties.insert("ACTION".into(), dev.action.as_str().to_string());
    properties.insert("DEVPATH".into(), dev.devpath.clone());
    properties.insert("SEQNUM".into(), dev.seqnum.to_string());
    if let Some(subsystem) = &dev.subsystem {
        properties.insert("SUBSYSTEM".into(), subsystem.clone());
    }
    if let Some(devtype) = &dev.devtype {
        properties.insert("DEVTYPE".into(), devtype.clone());
    }
    if let Some(old) = &dev.devpath_old {
        properties.insert("DEVPATH_OLD".into(), old.clone());
    }
    if let Some(node) = &dev.devnode {
        properties.insert("DEVNAME".into(), node.display().to_string());
    }
    if let Some(devnum) = dev.devnum {
        properties.insert("MAJOR".into(), devnum.major.to_string());
        properties.insert("MINOR".into(), devnum.minor.to_string());
    }
    if dev.ifindex != 0 {
        properties.insert("IFINDEX".into(), dev.ifindex.to_string());
    }

    let mut out = Vec::with_capacity(512);
    out.extend_from_slice(dev.action.as_str().as_bytes());
    out.push(b'@');
    out.extend_from_slice(dev.devpath.as_bytes());
    out.push(0);
    for (key, value) in &properties {
        out.extend_from_slice(key.as_bytes());
        out.push(b'=');
        out.extend_from_slice(value.as_bytes());
        out.push(0);
    }
    out
}

#[cfg(test)]
#[path = "monitor_tests.rs"]
mod tests;
