// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Listener task for the control socket.
//!
//! Runs in a spawned task so socket I/O never blocks the supervisor loop.
//! Each connection carries one request, which is forwarded to the
//! supervisor over a channel together with a reply slot; the supervisor
//! answers at the fixed point in its iteration, which is what gives PING
//! its ordering guarantee.

use std::sync::Arc;

use thiserror::Error;
use tokio::net::UnixListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::protocol::{self, read_request, write_response, Response, DEFAULT_TIMEOUT};
use crate::supervisor::CtrlRequest;

/// Shared context for connection handlers.
pub struct ListenCtx {
    pub ctrl_tx: mpsc::Sender<CtrlRequest>,
    pub cancel: CancellationToken,
}

/// Accept loop over the control socket.
pub struct Listener {
    unix: UnixListener,
    ctx: Arc<ListenCtx>,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Protocol error: {0}")]
    Protocol(#[from] protocol::ProtocolError),

    #[error("Daemon is shutting down")]
    ShuttingDown,
}

impl Listener {
    pub fn new(unix: UnixListener, ctx: Arc<ListenCtx>) -> Self {
        Self { unix, ctx }
    }

    /// Accept connections until shutdown, spawning a task for each.
    pub async fn run(self) {
        loop {
            tokio::select! {
                _ = self.ctx.cancel.cancelled() => break,
                result = self.unix.accept() => match result {
                    Ok((stream, _)) => {
                        let ctx = Arc::clone(&self.ctx);
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(stream, &ctx).await {
                                log_connection_error(e);
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "control accept error"),
                },
            }
        }
    }
}

fn log_connection_error(e: ConnectionError) {
    match e {
        ConnectionError::Protocol(protocol::ProtocolError::ConnectionClosed) => {
            debug!("control client disconnected")
        }
        ConnectionError::Protocol(protocol::ProtocolError::Timeout) => {
            warn!("control connection timeout")
        }
        _ => error!(error = %e, "control connection error"),
    }
}

/// Handle a single control connection: one request, one (possibly delayed)
/// reply. For `Exit` the supervisor parks the reply until cleanup is done,
/// so this task — and with it the client — blocks until the daemon is gone.
async fn handle_connection(
    stream: tokio::net::UnixStream,
    ctx: &ListenCtx,
) -> Result<(), ConnectionError> {
    let (mut reader, mut writer) = stream.into_split();

    let request = read_request(&mut reader, DEFAULT_TIMEOUT).await?;
    debug!(?request, "control request");

    let (reply_tx, reply_rx) = oneshot::channel();
    ctx.ctrl_tx
        .send(CtrlRequest { request, reply: reply_tx })
        .await
        .map_err(|_| ConnectionError::ShuttingDown)?;

    let response = reply_rx.await.unwrap_or(Response::Error {
        message: "daemon shutting down".to_string(),
    });
    write_response(&mut writer, &response).await?;
    Ok(())
}
