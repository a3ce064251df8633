// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! devdd — device-event dispatch daemon.

// Allow panic!/unwrap/expect in test code
#![cfg_attr(test, allow(clippy::panic))]
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

use std::process::ExitCode;
use std::time::Duration;

use devd_daemon::lifecycle::{self, Config, LifecycleError, Overrides, StartupResult};
use devd_daemon::{logging, worker};
use tracing::{error, info};

#[tokio::main]
async fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // hidden worker mode, entered only via the supervisor's spawn
    if args.first().map(String::as_str) == Some("worker") {
        let (_handle, _guard) = logging::init("info");
        return ExitCode::from(worker::run().await as u8);
    }

    let overrides = match parse_args(&args) {
        Ok(Some(overrides)) => overrides,
        Ok(None) => return ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            eprintln!("Try 'devdd --help' for more information.");
            return ExitCode::FAILURE;
        }
    };

    let config = Config::load(&overrides);
    let (log_handle, _log_guard) = logging::init(&config.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "starting devdd");

    let StartupResult { mut daemon, listener, .. } = match lifecycle::startup(&config, log_handle)
    {
        Ok(result) => result,
        Err(LifecycleError::LockFailed(_)) => {
            eprintln!("devdd is already running");
            if let Ok(pid) = std::fs::read_to_string(&config.lock_path) {
                eprintln!("  pid: {}", pid.trim());
            }
            return ExitCode::FAILURE;
        }
        Err(e) => {
            error!(error = %e, "failed to start daemon");
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    tokio::spawn(listener.run());

    let result = daemon.run().await;

    // give the parked EXIT reply a beat to flush before the process goes
    tokio::time::sleep(Duration::from_millis(50)).await;

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = %e, "daemon failed");
            ExitCode::FAILURE
        }
    }
}

/// Parse daemon flags. Returns `Ok(None)` when a help/version request was
/// already answered.
fn parse_args(args: &[String]) -> Result<Option<Overrides>, String> {
    let mut overrides = Overrides::default();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        let (flag, inline_value) = match arg.split_once('=') {
            Some((flag, value)) => (flag, Some(value.to_string())),
            None => (arg.as_str(), None),
        };
        let mut value = |name: &str| -> Result<String, String> {
            inline_value
                .clone()
                .or_else(|| iter.next().cloned())
                .ok_or_else(|| format!("{name} requires a value"))
        };

        match flag {
            "--help" | "-h" => {
                print_help();
                return Ok(None);
            }
            "--version" | "-V" => {
                println!("devdd {}", env!("CARGO_PKG_VERSION"));
                return Ok(None);
            }
            "--debug" | "-D" => overrides.debug = true,
            "--children-max" | "-c" => {
                overrides.children_max =
                    Some(value("--children-max")?.parse().map_err(|_| {
                        "--children-max expects a number".to_string()
                    })?);
            }
            "--exec-delay" | "-e" => {
                let secs: u64 = value("--exec-delay")?
                    .parse()
                    .map_err(|_| "--exec-delay expects seconds".to_string())?;
                overrides.exec_delay = Some(Duration::from_secs(secs));
            }
            "--event-timeout" | "-t" => {
                let secs: u64 = value("--event-timeout")?
                    .parse()
                    .map_err(|_| "--event-timeout expects seconds".to_string())?;
                overrides.event_timeout = Some(Duration::from_secs(secs));
            }
            other => return Err(format!("unexpected argument '{other}'")),
        }
    }

    Ok(Some(overrides))
}

fn print_help() {
    println!("devdd [OPTIONS...]");
    println!();
    println!("Dispatches kernel device events to a pool of worker processes.");
    println!();
    println!("  -h --help                   Print this message");
    println!("  -V --version                Print version of the program");
    println!("  -D --debug                  Enable debug output");
    println!("  -c --children-max=INT       Maximum number of worker processes");
    println!("  -e --exec-delay=SECONDS     Seconds to delay each event's handling");
    println!("  -t --event-timeout=SECONDS  Seconds to wait before killing an event");
}

#[cfg(test)]
#[path = "main_tests.rs"]
mod tests;
