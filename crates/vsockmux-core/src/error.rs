// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Error types surfaced by the proxy engine.

use std::io;

use nix::errno::Errno;
use thiserror::Error;
use vsockmux_proto::CodecError;

/// Errors produced by proxy operations.
///
/// `Remote` carries the errno a peer reported in a response frame; the
/// other variants originate locally. Requests still in flight when the
/// engine stops all resolve to `Stopped`.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("proxy stopped")]
    Stopped,

    #[error("remote operation failed: {0}")]
    Remote(Errno),

    #[error("handle {0} is already registered")]
    HandleInUse(i64),

    #[error("descriptor kind is not supported")]
    Unsupported,

    #[error("protocol error: {0}")]
    Codec(#[from] CodecError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type ProxyResult<T> = Result<T, ProxyError>;

impl From<Errno> for ProxyError {
    fn from(errno: Errno) -> Self {
        ProxyError::Io(io::Error::from_raw_os_error(errno as i32))
    }
}

impl ProxyError {
    /// Errno to report in a response frame when this error answers a peer
    /// request. Zero is reserved for success, so every variant maps to a
    /// nonzero value.
    pub fn errno(&self) -> Errno {
        match self {
            ProxyError::Stopped => Errno::ECANCELED,
            ProxyError::Remote(errno) => *errno,
            ProxyError::HandleInUse(_) => Errno::EEXIST,
            ProxyError::Unsupported => Errno::EOPNOTSUPP,
            ProxyError::Codec(_) => Errno::EPROTO,
            ProxyError::Io(err) => err
                .raw_os_error()
                .map(Errno::from_raw)
                .unwrap_or(Errno::EIO),
        }
    }

    /// Reconstructs the error a peer reported through the `error_code`
    /// field of a response message.
    pub fn from_wire(error_code: u32) -> Self {
        ProxyError::Remote(Errno::from_raw(error_code as i32))
    }
}
