// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Worker→supervisor completion channel.
//!
//! One datagram socket pair shared by all workers: the supervisor reads,
//! every worker inherits the write end. The payload is empty; the sender's
//! pid arrives out-of-band as `SCM_CREDENTIALS`, which the kernel fills in
//! and a worker cannot forge.

use async_trait::async_trait;
use nix::sys::socket::{recvmsg, send, setsockopt, sockopt, MsgFlags, UnixAddr, UnixCredentials};
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixDatagram;
use tokio::io::unix::AsyncFd;
use tracing::warn;

/// Supervisor-side receiver of worker completion messages.
#[async_trait]
pub trait CompletionChannel: Send {
    /// Wait until at least one message is ready.
    async fn readable(&self) -> io::Result<()>;

    /// Non-blocking receive of the next validated sender pid; `Ok(None)`
    /// when the socket is drained. Malformed messages are dropped inside.
    fn try_receive(&mut self) -> io::Result<Option<i32>>;
}

/// Real credential-passing datagram channel.
pub struct CredChannel {
    rx: AsyncFd<UnixDatagram>,
}

impl CredChannel {
    /// Create the socket pair. Returns the supervisor receiver and the write
    /// end that worker children inherit.
    pub fn new() -> io::Result<(Self, OwnedFd)> {
        let (rx, tx) = UnixDatagram::pair()?;
        rx.set_nonblocking(true)?;
        setsockopt(&rx, sockopt::PassCred, &true)?;
        Ok((Self { rx: AsyncFd::new(rx)? }, tx.into()))
    }
}

#[async_trait]
impl CompletionChannel for CredChannel {
    async fn readable(&self) -> io::Result<()> {
        let mut guard = self.rx.readable().await?;
        guard.clear_ready();
        Ok(())
    }

    fn try_receive(&mut self) -> io::Result<Option<i32>> {
        loop {
            let mut cmsg_buf = nix::cmsg_space!(UnixCredentials);
            // one byte of slack so an oversized payload is detectable
            let mut data = [0u8; 8];
            let mut iov = [io::IoSliceMut::new(&mut data)];

            let msg = match recvmsg::<UnixAddr>(
                self.rx.get_ref().as_raw_fd(),
                &mut iov,
                Some(&mut cmsg_buf),
                MsgFlags::MSG_DONTWAIT,
            ) {
                Ok(msg) => msg,
                Err(nix::errno::Errno::EAGAIN) | Err(nix::errno::Errno::EINTR) => return Ok(None),
                Err(e) => return Err(e.into()),
            };

            if msg.bytes != 0 {
                warn!(size = msg.bytes, "ignoring worker message with invalid size");
                continue;
            }

            let creds = msg.cmsgs().ok().and_then(|mut cmsgs| {
                cmsgs.find_map(|c| match c {
                    nix::sys::socket::ControlMessageOwned::ScmCredentials(creds) => Some(creds),
                    _ => None,
                })
            });
            match creds {
                Some(creds) if creds.pid() > 0 => return Ok(Some(creds.pid())),
                _ => {
                    warn!("ignoring worker message without valid sender credentials");
                    continue;
                }
            }
        }
    }
}

/// Worker-side send of the zero-length "I am done" marker.
pub fn send_completion(fd: RawFd) -> nix::Result<()> {
    send(fd, &[], MsgFlags::empty())?;
    Ok(())
}
