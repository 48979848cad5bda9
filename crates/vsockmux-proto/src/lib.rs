// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! vsockmux wire protocol — message schema and framing.
//!
//! One proxy instance on each side of a VSOCK connection exchanges framed
//! SSZ-encoded [`Message`] values. Every frame is a `u32` little-endian byte
//! length followed by exactly that many SSZ bytes; exactly one message per
//! frame.
//!
//! Identifier conventions (part of the wire contract):
//! - Handles are signed 64-bit values carried as two's-complement `u64`.
//!   Zero is never a valid handle on the wire; it is the "allocate fresh"
//!   sentinel at registration boundaries. The connection initiator allocates
//!   odd handles, the acceptor even ones, so independently generated values
//!   never collide.
//! - Cookies are per-instance monotonic signed 64-bit values carried the same
//!   way. The responder echoes the cookie unchanged.
//! - Error codes are POSIX errno values; `0` means success.

pub mod framing;
pub mod messages;

pub use framing::{read_frame, write_frame, CodecError, DATA_CHUNK_SIZE, MAX_FRAME_LEN};
pub use messages::{
    CloseMessage,
    ConnectRequest,
    ConnectResponse,
    DataMessage,
    FstatRequest,
    FstatResponse,
    Message,
    PreadRequest,
    PreadResponse,
    WireFileDescriptor,
};
