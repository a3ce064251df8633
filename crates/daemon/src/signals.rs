// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Signal delivery as an awaitable stream, so the supervisor sees signals
//! atomically with its other event sources.

use tokio::signal::unix::{signal, Signal, SignalKind};

/// Signals the supervisor reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalEvent {
    /// SIGINT / SIGTERM: graceful exit.
    Exit,
    /// SIGHUP: reload rules and restart workers.
    Reload,
    /// SIGCHLD: reap exited workers.
    Child,
}

pub struct Signals {
    terminate: Signal,
    interrupt: Signal,
    hangup: Signal,
    child: Signal,
}

impl Signals {
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            terminate: signal(SignalKind::terminate())?,
            interrupt: signal(SignalKind::interrupt())?,
            hangup: signal(SignalKind::hangup())?,
            child: signal(SignalKind::child())?,
        })
    }

    pub async fn recv(&mut self) -> SignalEvent {
        tokio::select! {
            _ = self.terminate.recv() => SignalEvent::Exit,
            _ = self.interrupt.recv() => SignalEvent::Exit,
            _ = self.hangup.recv() => SignalEvent::Reload,
            _ = self.child.recv() => SignalEvent::Child,
        }
    }
}
