// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Length-prefixed framing for [`Message`] values.

use std::io;

use ssz::{Decode, Encode};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::messages::Message;

/// Upper bound on the SSZ body of a single frame. A longer announced length
/// means the framing state is corrupt and the connection must be abandoned.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Largest payload read from a local descriptor per `Data` message.
pub const DATA_CHUNK_SIZE: usize = 4096;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame length {0} exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge(u32),
    #[error("ssz decode error: {0:?}")]
    Decode(ssz::DecodeError),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Write one message as a `u32` little-endian length prefix plus SSZ body.
pub async fn write_frame<W>(writer: &mut W, msg: &Message) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let body = msg.as_ssz_bytes();
    if body.len() > MAX_FRAME_LEN as usize {
        return Err(CodecError::FrameTooLarge(body.len() as u32));
    }
    let len = body.len() as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one message. Returns `Ok(None)` on a clean close at a frame
/// boundary; a close mid-frame or an undecodable body is an error.
pub async fn read_frame<R>(reader: &mut R) -> Result<Option<Message>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    let mut filled = 0;
    while filled < len_buf.len() {
        let n = reader.read(&mut len_buf[filled..]).await?;
        if n == 0 {
            if filled == 0 {
                return Ok(None);
            }
            return Err(CodecError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-frame",
            )));
        }
        filled += n;
    }

    let len = u32::from_le_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len as usize];
    reader.read_exact(&mut body).await?;
    Message::from_ssz_bytes(&body)
        .map(Some)
        .map_err(CodecError::Decode)
}
