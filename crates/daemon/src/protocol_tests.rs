// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use super::*;
use yare::parameterized;

#[parameterized(
    ping = { Request::Ping },
    log_level = { Request::SetLogLevel { level: "debug".into() } },
    stop = { Request::StopExecQueue },
    start = { Request::StartExecQueue },
    reload = { Request::Reload },
    set_env = { Request::SetEnv { assignment: "ID_SEAT=seat1".into() } },
    children_max = { Request::SetChildrenMax { max: 12 } },
    exit = { Request::Exit },
)]
fn request_round_trips(request: Request) {
    let bytes = encode(&request).unwrap();
    let back: Request = decode(&bytes).unwrap();
    assert_eq!(back, request);
}

#[test]
fn response_round_trips() {
    for response in [Response::Ok, Response::Error { message: "nope".into() }] {
        let bytes = encode(&response).unwrap();
        let back: Response = decode(&bytes).unwrap();
        assert_eq!(back, response);
    }
}

#[test]
fn requests_are_tagged_by_type() {
    let bytes = encode(&Request::SetChildrenMax { max: 3 }).unwrap();
    let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(json["type"], "SetChildrenMax");
    assert_eq!(json["max"], 3);
}

#[tokio::test]
async fn wire_round_trip_through_duplex() {
    let (mut client, mut server) = tokio::io::duplex(1024);

    let data = encode(&Request::Ping).unwrap();
    write_message(&mut client, &data).await.unwrap();

    let request = read_request(&mut server, DEFAULT_TIMEOUT).await.unwrap();
    assert_eq!(request, Request::Ping);

    write_response(&mut server, &Response::Ok).await.unwrap();
    let bytes = read_message(&mut client).await.unwrap();
    let response: Response = decode(&bytes).unwrap();
    assert_eq!(response, Response::Ok);
}

#[tokio::test]
async fn read_rejects_oversized_length_prefix() {
    let (mut client, mut server) = tokio::io::duplex(64);
    let huge = (MAX_MESSAGE_SIZE as u32 + 1).to_be_bytes();
    tokio::io::AsyncWriteExt::write_all(&mut client, &huge).await.unwrap();

    let err = read_message(&mut server).await.unwrap_err();
    assert!(matches!(err, ProtocolError::MessageTooLarge { .. }));
}

#[tokio::test]
async fn closed_connection_reports_as_such() {
    let (client, mut server) = tokio::io::duplex(64);
    drop(client);

    let err = read_message(&mut server).await.unwrap_err();
    assert!(matches!(err, ProtocolError::ConnectionClosed));
}
