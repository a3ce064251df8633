// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use clap::CommandFactory;

#[test]
fn cli_definition_is_consistent() {
    Cli::command().debug_assert();
}

#[test]
fn control_options_map_to_requests_in_order() {
    let cli = Cli::parse_from([
        "devctl",
        "control",
        "--log-level",
        "debug",
        "--stop-exec-queue",
        "--property",
        "ID_SEAT=seat1",
        "--children-max",
        "4",
        "--ping",
    ]);
    let Command::Control(args) = cli.command else {
        panic!("expected control subcommand");
    };
    assert_eq!(
        args.requests(),
        vec![
            Request::SetLogLevel { level: "debug".into() },
            Request::StopExecQueue,
            Request::SetEnv { assignment: "ID_SEAT=seat1".into() },
            Request::SetChildrenMax { max: 4 },
            Request::Ping,
        ]
    );
}

#[test]
fn exit_is_sent_last() {
    let cli = Cli::parse_from(["devctl", "control", "--exit", "--reload"]);
    let Command::Control(args) = cli.command else {
        panic!("expected control subcommand");
    };
    assert_eq!(args.requests(), vec![Request::Reload, Request::Exit]);
}

#[test]
fn settle_has_a_default_timeout() {
    let cli = Cli::parse_from(["devctl", "settle"]);
    let Command::Settle(args) = cli.command else {
        panic!("expected settle subcommand");
    };
    assert_eq!(args.timeout, 120);
}

#[test]
fn socket_override_is_global() {
    let cli = Cli::parse_from(["devctl", "--socket", "/tmp/devd.sock", "control", "--ping"]);
    assert_eq!(cli.socket, Some(PathBuf::from("/tmp/devd.sock")));
}
