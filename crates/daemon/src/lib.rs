// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! devd-daemon: the devd supervisor and its worker processes.
//!
//! Architecture:
//! - Listener task: spawned task handling control socket I/O, forwards
//!   requests to the supervisor
//! - Supervisor loop: single task multiplexing uevents, worker completions,
//!   signals, device-node watches, control requests and timeouts
//! - Workers: separate processes, one device at a time, reused while idle

pub mod channel;
pub mod db;
pub mod env;
pub mod lifecycle;
pub mod listener;
pub mod logging;
pub mod monitor;
pub mod pool;
pub mod process;
pub mod protocol;
pub mod queue;
pub mod rules;
pub mod signals;
pub mod supervisor;
pub mod watch;
pub mod worker;

#[cfg(test)]
mod test_support;
