// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Message types exchanged over the shared proxy connection.

use ssz::{Decode, Encode};
use ssz_derive::{Decode, Encode};

// SSZ union-based message type. Selector values are fixed by variant order:
// Close=0, Data=1, ConnectRequest=2, ConnectResponse=3, PreadRequest=4,
// PreadResponse=5, FstatRequest=6, FstatResponse=7.

/// One framed message on the shared connection.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
#[ssz(enum_behaviour = "union")]
pub enum Message {
    Close(CloseMessage),
    Data(DataMessage),
    ConnectRequest(ConnectRequest),
    ConnectResponse(ConnectResponse),
    PreadRequest(PreadRequest),
    PreadResponse(PreadResponse),
    FstatRequest(FstatRequest),
    FstatResponse(FstatResponse),
}

/// Descriptor embedded in a [`DataMessage`].
///
/// Real descriptors never cross the VSOCK connection; each transferred
/// descriptor is registered under a fresh handle on the sending side and
/// reconstructed from `(kind, handle)` on the receiving side. For `Dmabuf`
/// the value is an opaque device resource id rather than a proxy handle.
/// Selector values: Socket=0, SocketStream=1, FifoRead=2, RegularFile=3,
/// Dmabuf=4.
#[derive(Clone, Copy, Debug, PartialEq, Encode, Decode)]
#[ssz(enum_behaviour = "union")]
pub enum WireFileDescriptor {
    /// Message-preserving (seqpacket) unix socket.
    Socket(u64),
    /// Byte-stream unix socket.
    SocketStream(u64),
    /// Read end of a pipe.
    FifoRead(u64),
    /// Regular file, accessed remotely via pread/fstat.
    RegularFile(u64),
    /// Device buffer requiring host/guest-specific translation.
    Dmabuf(u64),
}

/// Drop the registry entry for `handle`.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct CloseMessage {
    pub handle: u64,
}

/// Payload read from the descriptor registered under `handle`.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct DataMessage {
    pub handle: u64,
    pub payload: Vec<u8>,
    pub fds: Vec<WireFileDescriptor>,
}

/// Ask the peer to connect to a unix socket at `path` on its side.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct ConnectRequest {
    pub cookie: u64,
    pub path: Vec<u8>,
}

/// Reply to [`ConnectRequest`]; `handle` is peer-assigned and `0` on failure.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct ConnectResponse {
    pub cookie: u64,
    pub error_code: u32,
    pub handle: u64,
}

/// Ask the peer to pread from the regular file it registered under `handle`.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct PreadRequest {
    pub cookie: u64,
    pub handle: u64,
    pub count: u64,
    pub offset: u64,
}

/// Reply to [`PreadRequest`].
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct PreadResponse {
    pub cookie: u64,
    pub error_code: u32,
    pub data: Vec<u8>,
}

/// Ask the peer for the size of the regular file it registered under `handle`.
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct FstatRequest {
    pub cookie: u64,
    pub handle: u64,
}

/// Reply to [`FstatRequest`].
#[derive(Clone, Debug, PartialEq, Encode, Decode)]
pub struct FstatResponse {
    pub cookie: u64,
    pub error_code: u32,
    pub size: u64,
}

// Constructors for SSZ union variants
impl Message {
    pub fn close(handle: u64) -> Self {
        Self::Close(CloseMessage { handle })
    }

    pub fn data(handle: u64, payload: Vec<u8>, fds: Vec<WireFileDescriptor>) -> Self {
        Self::Data(DataMessage {
            handle,
            payload,
            fds,
        })
    }

    pub fn connect_request(cookie: u64, path: Vec<u8>) -> Self {
        Self::ConnectRequest(ConnectRequest { cookie, path })
    }

    pub fn connect_response(cookie: u64, error_code: u32, handle: u64) -> Self {
        Self::ConnectResponse(ConnectResponse {
            cookie,
            error_code,
            handle,
        })
    }

    pub fn pread_request(cookie: u64, handle: u64, count: u64, offset: u64) -> Self {
        Self::PreadRequest(PreadRequest {
            cookie,
            handle,
            count,
            offset,
        })
    }

    pub fn pread_response(cookie: u64, error_code: u32, data: Vec<u8>) -> Self {
        Self::PreadResponse(PreadResponse {
            cookie,
            error_code,
            data,
        })
    }

    pub fn fstat_request(cookie: u64, handle: u64) -> Self {
        Self::FstatRequest(FstatRequest { cookie, handle })
    }

    pub fn fstat_response(cookie: u64, error_code: u32, size: u64) -> Self {
        Self::FstatResponse(FstatResponse {
            cookie,
            error_code,
            size,
        })
    }

    /// Short name of the message kind, for log output.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Close(_) => "close",
            Message::Data(_) => "data",
            Message::ConnectRequest(_) => "connect_request",
            Message::ConnectResponse(_) => "connect_response",
            Message::PreadRequest(_) => "pread_request",
            Message::PreadResponse(_) => "pread_response",
            Message::FstatRequest(_) => "fstat_request",
            Message::FstatResponse(_) => "fstat_response",
        }
    }
}

impl WireFileDescriptor {
    /// The handle (or opaque resource id, for dmabufs) binding this
    /// descriptor across the proxy boundary.
    pub fn handle(&self) -> u64 {
        match self {
            WireFileDescriptor::Socket(h)
            | WireFileDescriptor::SocketStream(h)
            | WireFileDescriptor::FifoRead(h)
            | WireFileDescriptor::RegularFile(h)
            | WireFileDescriptor::Dmabuf(h) => *h,
        }
    }
}
