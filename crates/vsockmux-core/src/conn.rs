// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Connection plumbing: one task is the sole reader of the peer connection,
//! another the sole writer. The engine talks to both over channels.

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, trace};
use vsockmux_proto::{read_frame, write_frame, CodecError, Message};

/// Spawns the task that pulls frames off the connection and feeds them to
/// the engine. A clean peer close drops the sender, which the engine sees
/// as the end of the inbound channel. A decode failure is forwarded and
/// ends the task; nothing after a malformed frame can be trusted.
pub(crate) fn spawn_frame_reader<R>(
    mut reader: R,
    tx: mpsc::Sender<Result<Message, CodecError>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            match read_frame(&mut reader).await {
                Ok(Some(message)) => {
                    trace!(kind = message.kind(), "received message");
                    if tx.send(Ok(message)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    let _ = tx.send(Err(err)).await;
                    break;
                }
            }
        }
    })
}

/// Spawns the task that drains the outbound queue onto the connection, so
/// the engine never waits for the peer to make room. After a write error
/// the task exits and drops the queue; the engine notices when its next
/// send fails. When every sender is gone the task flushes what is queued
/// and closes the write half.
pub(crate) fn spawn_frame_writer<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Message>,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(message) = outbound.recv().await {
            trace!(kind = message.kind(), "sending message");
            if let Err(err) = write_frame(&mut writer, &message).await {
                error!(error = %err, "connection write failed");
                break;
            }
        }
    })
}
