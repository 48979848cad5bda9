// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Core identifier types shared by the proxy engine and the wire protocol.

use std::fmt;

use vsockmux_proto::WireFileDescriptor;

/// Identifier a proxied file descriptor is known by on both sides of the
/// connection.
///
/// Handles are signed and never zero; [`Handle::ANY`] is the reserved
/// sentinel that asks the registry to allocate a fresh value. The two peers
/// draw from disjoint ranges so they can both mint handles without a
/// round trip: the initiator uses odd values, the acceptor even ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Handle(pub i64);

impl Handle {
    /// Sentinel passed to registration when the caller wants a fresh handle.
    pub const ANY: Handle = Handle(0);

    pub fn is_any(self) -> bool {
        self.0 == 0
    }

    pub fn raw(self) -> i64 {
        self.0
    }

    /// Two's-complement carrier value used on the wire.
    pub fn to_wire(self) -> u64 {
        self.0 as u64
    }

    pub fn from_wire(value: u64) -> Self {
        Handle(value as i64)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Correlates a request message with the response it eventually produces.
///
/// Cookies are scoped per request kind: a connect cookie and a pread cookie
/// with the same value are unrelated entries. Within one engine instance the
/// counter is monotonic, so a value is never reused for the lifetime of the
/// connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Cookie(pub i64);

impl Cookie {
    pub fn raw(self) -> i64 {
        self.0
    }

    pub fn to_wire(self) -> u64 {
        self.0 as u64
    }

    pub fn from_wire(value: u64) -> Self {
        Cookie(value as i64)
    }
}

impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which side of the connection this engine instance plays.
///
/// The role decides the handle parity: initiators allocate odd handles,
/// acceptors even ones. Beyond allocation the engine is symmetric.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Acceptor,
}

/// How a registered descriptor behaves locally.
///
/// The watched kinds get a reader task that pumps local bytes toward the
/// peer. Regular files and dmabufs are request-driven only and must stay off
/// the epoll set. `FifoWrite` never appears on the wire: it is the local
/// write end materialized when the peer transfers a `FifoRead` descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FdKind {
    /// Datagram-preserving socket (`SOCK_SEQPACKET`).
    Socket,
    /// Byte-stream socket (`SOCK_STREAM`).
    SocketStream,
    /// Read end of a pipe.
    FifoRead,
    /// Write end of a pipe, local side only.
    FifoWrite,
    /// Seekable file served via pread/fstat.
    RegularFile,
    /// Device buffer; only a delegate knows how to move one across.
    Dmabuf,
}

impl FdKind {
    /// Kinds that get a reader task pumping local data to the peer.
    pub fn is_watched(self) -> bool {
        matches!(self, FdKind::Socket | FdKind::SocketStream | FdKind::FifoRead)
    }

    /// Kinds that may sit on the epoll set. Regular files and dmabufs are
    /// always ready and the kernel refuses to watch them.
    pub fn is_pollable(self) -> bool {
        !matches!(self, FdKind::RegularFile | FdKind::Dmabuf)
    }

    /// The wire representation announcing a transferred descriptor, if the
    /// kind has a generic one. `FifoWrite` is local-only and `Dmabuf`
    /// transfer needs delegate cooperation, so both return `None`.
    pub fn wire_descriptor(self, handle: Handle) -> Option<WireFileDescriptor> {
        let carrier = handle.to_wire();
        match self {
            FdKind::Socket => Some(WireFileDescriptor::Socket(carrier)),
            FdKind::SocketStream => Some(WireFileDescriptor::SocketStream(carrier)),
            FdKind::FifoRead => Some(WireFileDescriptor::FifoRead(carrier)),
            FdKind::RegularFile => Some(WireFileDescriptor::RegularFile(carrier)),
            FdKind::FifoWrite | FdKind::Dmabuf => None,
        }
    }
}

impl fmt::Display for FdKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FdKind::Socket => "socket",
            FdKind::SocketStream => "socket-stream",
            FdKind::FifoRead => "fifo-read",
            FdKind::FifoWrite => "fifo-write",
            FdKind::RegularFile => "regular-file",
            FdKind::Dmabuf => "dmabuf",
        };
        f.write_str(name)
    }
}

/// Hands out fresh handles from the range owned by this side.
#[derive(Debug)]
pub struct HandleAllocator {
    next: i64,
}

impl HandleAllocator {
    pub fn new(role: Role) -> Self {
        let next = match role {
            Role::Initiator => 1,
            Role::Acceptor => 2,
        };
        HandleAllocator { next }
    }

    pub fn next(&mut self) -> Handle {
        let handle = Handle(self.next);
        self.next += 2;
        handle
    }
}

/// Monotonic cookie source, starting at 1 so that zero never appears in a
/// request and stays available as an obviously-dead value in logs.
#[derive(Debug)]
pub struct CookieCounter {
    next: i64,
}

impl CookieCounter {
    pub fn new() -> Self {
        CookieCounter { next: 1 }
    }

    pub fn next(&mut self) -> Cookie {
        let cookie = Cookie(self.next);
        self.next += 1;
        cookie
    }
}

impl Default for CookieCounter {
    fn default() -> Self {
        Self::new()
    }
}
