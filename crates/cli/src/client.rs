// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! One-shot request/response exchange with the daemon's control socket.

use anyhow::{Context, Result};
use devd_daemon::protocol::{decode, encode, read_message, write_message, Request, Response};
use std::path::Path;
use tokio::net::UnixStream;

/// Send one request and wait for the reply. `Exit` replies only arrive once
/// the daemon has fully shut down, so this intentionally has no timeout.
pub async fn send(socket: &Path, request: Request) -> Result<Response> {
    let stream = UnixStream::connect(socket)
        .await
        .with_context(|| format!("could not connect to {}", socket.display()))?;
    let (mut reader, mut writer) = stream.into_split();

    let payload = encode(&request).context("could not encode request")?;
    write_message(&mut writer, &payload).await.context("could not send request")?;

    let reply = read_message(&mut reader).await.context("no reply from daemon")?;
    decode(&reply).context("could not decode reply")
}
