// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Embedder hooks for descriptor kinds the engine cannot move generically.

use std::os::fd::OwnedFd;

use tracing::{debug, warn};
use vsockmux_proto::WireFileDescriptor;

use crate::error::{ProxyError, ProxyResult};
use crate::types::Role;

/// Embedder-provided policy for an engine instance.
///
/// Sockets and pipes cross the connection generically; regular files and
/// dmabufs need help from whoever embeds the engine. The delegate supplies
/// that help plus the side assignment used for handle allocation.
pub trait Delegate: Send + 'static {
    /// Which side of the connection this instance plays.
    fn role(&self) -> Role;

    /// Produces the wire announcement for a local descriptor the engine
    /// could not classify as a socket, pipe read end, or regular file.
    /// Ownership of the descriptor moves to the delegate; returning an
    /// error makes the engine tear down the stream that carried it.
    fn to_wire_descriptor(&self, fd: OwnedFd) -> ProxyResult<WireFileDescriptor>;

    /// Materializes a local descriptor for a wire announcement the engine
    /// has no generic recipe for (regular files and dmabufs sent by the
    /// peer).
    fn from_wire_descriptor(&self, wire: &WireFileDescriptor) -> ProxyResult<OwnedFd>;

    /// Called exactly once after the engine has cancelled its pending
    /// requests and dropped every registered descriptor.
    fn on_stopped(&self) {}
}

/// Delegate for deployments without device side channels: every descriptor
/// that needs delegate cooperation is rejected.
pub struct BasicDelegate {
    role: Role,
}

impl BasicDelegate {
    pub fn new(role: Role) -> Self {
        BasicDelegate { role }
    }
}

impl Delegate for BasicDelegate {
    fn role(&self) -> Role {
        self.role
    }

    fn to_wire_descriptor(&self, fd: OwnedFd) -> ProxyResult<WireFileDescriptor> {
        warn!(?fd, "dropping descriptor with no transfer recipe");
        Err(ProxyError::Unsupported)
    }

    fn from_wire_descriptor(&self, wire: &WireFileDescriptor) -> ProxyResult<OwnedFd> {
        warn!(handle = wire.handle(), "rejecting descriptor announcement");
        Err(ProxyError::Unsupported)
    }

    fn on_stopped(&self) {
        debug!("proxy stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};

    #[test]
    fn basic_delegate_rejects_both_directions() {
        let delegate = BasicDelegate::new(Role::Initiator);
        let (fd, _peer) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::SOCK_CLOEXEC,
        )
        .unwrap();
        assert!(matches!(
            delegate.to_wire_descriptor(fd),
            Err(ProxyError::Unsupported)
        ));
        assert!(matches!(
            delegate.from_wire_descriptor(&WireFileDescriptor::Dmabuf(9)),
            Err(ProxyError::Unsupported)
        ));
        assert_eq!(delegate.role(), Role::Initiator);
    }
}
