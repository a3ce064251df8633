// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! devctl — control client for the devd daemon.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

mod client;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use devd_daemon::env::runtime_dir;
use devd_daemon::protocol::{Request, Response};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "devctl", version, about = "Control the devd daemon")]
struct Cli {
    /// Control socket path (default: <runtime dir>/control)
    #[arg(long, global = true)]
    socket: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Adjust the running daemon
    Control(ControlArgs),

    /// Wait for the event queue to drain
    Settle(SettleArgs),
}

#[derive(Args)]
struct ControlArgs {
    /// Set the daemon log level
    #[arg(short = 'l', long)]
    log_level: Option<String>,

    /// Stop dispatching events; they accumulate in the queue
    #[arg(short = 's', long)]
    stop_exec_queue: bool,

    /// Resume dispatching events
    #[arg(short = 'S', long)]
    start_exec_queue: bool,

    /// Reload rules at the next event
    #[arg(short = 'R', long)]
    reload: bool,

    /// Set a global property (KEY=VALUE; empty VALUE or bare '=' unsets)
    #[arg(short = 'p', long = "property", value_name = "KEY=VALUE")]
    properties: Vec<String>,

    /// Maximum number of worker processes
    #[arg(short = 'm', long, value_name = "N")]
    children_max: Option<u32>,

    /// Check whether the daemon is alive and caught up
    #[arg(long)]
    ping: bool,

    /// Ask the daemon to exit; blocks until it is gone
    #[arg(short = 'e', long)]
    exit: bool,
}

#[derive(Args)]
struct SettleArgs {
    /// Maximum seconds to wait for the queue to empty
    #[arg(short = 't', long, default_value = "120")]
    timeout: u64,
}

impl ControlArgs {
    /// Requests in the order they take effect.
    fn requests(&self) -> Vec<Request> {
        let mut requests = Vec::new();
        if let Some(level) = &self.log_level {
            requests.push(Request::SetLogLevel { level: level.clone() });
        }
        if self.stop_exec_queue {
            requests.push(Request::StopExecQueue);
        }
        if self.start_exec_queue {
            requests.push(Request::StartExecQueue);
        }
        if self.reload {
            requests.push(Request::Reload);
        }
        for assignment in &self.properties {
            requests.push(Request::SetEnv { assignment: assignment.clone() });
        }
        if let Some(max) = self.children_max {
            requests.push(Request::SetChildrenMax { max });
        }
        if self.ping {
            requests.push(Request::Ping);
        }
        if self.exit {
            requests.push(Request::Exit);
        }
        requests
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let socket = cli.socket.unwrap_or_else(|| runtime_dir().join("control"));

    match cli.command {
        Command::Control(args) => control(&socket, &args).await,
        Command::Settle(args) => settle(&socket, &args).await,
    }
}

async fn control(socket: &Path, args: &ControlArgs) -> Result<()> {
    let requests = args.requests();
    if requests.is_empty() {
        bail!("no control option given; see 'devctl control --help'");
    }
    for request in requests {
        match client::send(socket, request).await? {
            Response::Ok => {}
            Response::Error { message } => bail!("daemon refused: {message}"),
        }
    }
    Ok(())
}

/// Wait until the queue marker disappears, meaning all currently-known
/// events have been handled.
async fn settle(socket: &Path, args: &SettleArgs) -> Result<()> {
    // a ping first: its reply proves the daemon has caught up with
    // everything it had already received
    match client::send(socket, Request::Ping).await {
        Ok(Response::Ok) => {}
        Ok(Response::Error { message }) => bail!("daemon refused ping: {message}"),
        Err(e) => return Err(e).context("daemon not reachable"),
    }

    let marker = runtime_dir().join("queue");
    let deadline = std::time::Instant::now() + Duration::from_secs(args.timeout);
    loop {
        if !marker.exists() {
            return Ok(());
        }
        if std::time::Instant::now() >= deadline {
            bail!("timed out waiting for the event queue to empty");
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
