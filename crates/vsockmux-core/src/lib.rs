// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Proxy engine multiplexing local file descriptors over one peer
//! connection.
//!
//! An engine instance owns one side of a framed connection (typically a
//! vsock stream between a VM guest and its host). Local sockets, pipe read
//! ends, and regular files are registered under shared handles; bytes and
//! transferred descriptors flow as data messages, while connect, pread, and
//! fstat run as cookie-correlated request/response pairs. Both sides run
//! the same engine; only the handle parity differs by role.
//!
//! Construction goes through [`VsockProxy::spawn`], which starts the engine
//! task and returns a [`ProxyClient`] for issuing operations.

mod conn;
pub mod delegate;
pub mod error;
pub mod pending;
pub mod proxy;
pub mod registry;
pub mod stream;
pub mod types;

pub use delegate::{BasicDelegate, Delegate};
pub use error::{ProxyError, ProxyResult};
pub use pending::PendingRequestTable;
pub use proxy::{ProxyClient, ProxyConfig, VsockProxy};
pub use registry::{HandleRegistry, LocalEvent, WriteOp};
pub use stream::{
    classify_fd, connect_unix_socket, ReadOutcome, Stream, DATA_CHUNK_SIZE, MAX_PREAD_CHUNK,
    MAX_TRANSFER_FDS,
};
pub use types::{Cookie, CookieCounter, FdKind, Handle, HandleAllocator, Role};
