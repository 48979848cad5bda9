// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! The proxy engine: one task owning all connection state.
//!
//! The engine multiplexes registered local descriptors over a single peer
//! connection. Everything that touches the registry or the pending-request
//! table happens on the engine task; the public [`ProxyClient`] talks to it
//! over a command channel. Dedicated tasks are the only reader and the only
//! writer of the connection, so the engine itself never waits on the peer.

use std::os::fd::OwnedFd;
use std::path::{Component, Path, PathBuf};

use nix::errno::Errno;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn, Instrument};
use vsockmux_proto::{
    CodecError, ConnectRequest, DataMessage, FstatRequest, Message, PreadRequest,
    WireFileDescriptor,
};

use crate::conn::{spawn_frame_reader, spawn_frame_writer};
use crate::delegate::Delegate;
use crate::error::{ProxyError, ProxyResult};
use crate::pending::PendingRequestTable;
use crate::registry::{HandleRegistry, LocalEvent, WriteOp};
use crate::stream::{self, Stream};
use crate::types::{Cookie, FdKind, Handle};

const INBOUND_CAPACITY: usize = 64;
const COMMAND_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 64;

/// Engine configuration supplied by the embedder.
#[derive(Clone, Debug, Default)]
pub struct ProxyConfig {
    /// When set, peer connect requests must name a path under this
    /// directory; anything else is refused with `EACCES`.
    pub connect_root: Option<PathBuf>,
}

enum Command {
    Register {
        fd: OwnedFd,
        kind: FdKind,
        requested: Handle,
        reply: oneshot::Sender<ProxyResult<Handle>>,
    },
    Connect {
        path: Vec<u8>,
        reply: oneshot::Sender<ProxyResult<Handle>>,
    },
    Pread {
        handle: Handle,
        count: u64,
        offset: u64,
        reply: oneshot::Sender<ProxyResult<Vec<u8>>>,
    },
    Fstat {
        handle: Handle,
        reply: oneshot::Sender<ProxyResult<u64>>,
    },
    Close {
        handle: Handle,
    },
    Stop,
}

/// Why the engine left its dispatch loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StopReason {
    PeerClosed,
    ProtocolError,
    ConnectionError,
    Requested,
}

/// Cheap clonable handle to a running engine.
///
/// Every method fails with [`ProxyError::Stopped`] once the engine is gone;
/// dropping all clients does not stop the engine.
#[derive(Clone)]
pub struct ProxyClient {
    commands: mpsc::Sender<Command>,
}

impl ProxyClient {
    /// Adds a local descriptor to the proxied set. Pass [`Handle::ANY`] to
    /// have a fresh handle allocated from this side's range, or a handle
    /// learned from the peer to complete that peer's transfer.
    pub async fn register_file_descriptor(
        &self,
        fd: OwnedFd,
        kind: FdKind,
        handle: Handle,
    ) -> ProxyResult<Handle> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Register {
            fd,
            kind,
            requested: handle,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ProxyError::Stopped)?
    }

    /// Asks the peer to connect to a unix socket on its side. On success
    /// the returned handle is registered on both sides and ready for data.
    pub async fn connect(&self, path: impl Into<Vec<u8>>) -> ProxyResult<Handle> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Connect {
            path: path.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| ProxyError::Stopped)?
    }

    /// Reads up to `count` bytes at `offset` from a regular file registered
    /// on the peer side. Short reads are valid.
    pub async fn pread(&self, handle: Handle, count: u64, offset: u64) -> ProxyResult<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Pread {
            handle,
            count,
            offset,
            reply,
        })
        .await?;
        rx.await.map_err(|_| ProxyError::Stopped)?
    }

    /// Asks the peer for the size of a regular file it has registered.
    pub async fn fstat(&self, handle: Handle) -> ProxyResult<u64> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Fstat { handle, reply }).await?;
        rx.await.map_err(|_| ProxyError::Stopped)?
    }

    /// Drops the local entry for `handle` and tells the peer to do the
    /// same. Closing an unknown handle is a no-op.
    pub async fn close(&self, handle: Handle) {
        let _ = self.commands.send(Command::Close { handle }).await;
    }

    /// Stops the engine: pending requests are cancelled, every registered
    /// descriptor is dropped, and the connection is closed.
    pub async fn stop(&self) {
        let _ = self.commands.send(Command::Stop).await;
    }

    async fn send(&self, command: Command) -> ProxyResult<()> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ProxyError::Stopped)
    }
}

/// The engine state machine. Constructed with [`VsockProxy::spawn`], which
/// hands back the client and the engine task handle.
pub struct VsockProxy<D> {
    outbound: mpsc::UnboundedSender<Message>,
    delegate: D,
    config: ProxyConfig,
    registry: HandleRegistry,
    pending: PendingRequestTable,
    inbound: mpsc::Receiver<Result<Message, CodecError>>,
    commands: mpsc::Receiver<Command>,
    // Held so the command channel never closes while the engine runs;
    // clients may come and go.
    _commands_tx: mpsc::Sender<Command>,
    events: mpsc::Receiver<LocalEvent>,
    events_tx: mpsc::Sender<LocalEvent>,
    reader: JoinHandle<()>,
}

enum Tick {
    Inbound(Option<Result<Message, CodecError>>),
    Command(Command),
    Local(LocalEvent),
}

impl<D> VsockProxy<D>
where
    D: Delegate,
{
    /// Starts an engine over `conn` and returns the client plus the engine
    /// task. The task finishes once the engine has stopped and torn down.
    pub fn spawn<C>(conn: C, delegate: D, config: ProxyConfig) -> (ProxyClient, JoinHandle<()>)
    where
        C: AsyncRead + AsyncWrite + Send + 'static,
    {
        let role = delegate.role();
        let (read_half, write_half) = tokio::io::split(conn);
        let (inbound_tx, inbound) = mpsc::channel(INBOUND_CAPACITY);
        let reader = spawn_frame_reader(read_half, inbound_tx);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        spawn_frame_writer(write_half, outbound_rx);
        let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (events_tx, events) = mpsc::channel(EVENT_CAPACITY);

        let proxy = VsockProxy {
            outbound,
            delegate,
            config,
            registry: HandleRegistry::new(role),
            pending: PendingRequestTable::new(),
            inbound,
            commands,
            _commands_tx: commands_tx.clone(),
            events,
            events_tx,
            reader,
        };
        let span = tracing::info_span!("proxy", role = ?role);
        let task = tokio::spawn(proxy.run().instrument(span));
        (ProxyClient { commands: commands_tx }, task)
    }

    async fn run(mut self) {
        debug!("engine running");
        let reason = self.dispatch_loop().await;
        self.shutdown(reason);
    }

    async fn dispatch_loop(&mut self) -> StopReason {
        loop {
            let tick = tokio::select! {
                frame = self.inbound.recv() => Tick::Inbound(frame),
                Some(command) = self.commands.recv() => Tick::Command(command),
                Some(event) = self.events.recv() => Tick::Local(event),
            };
            let step = match tick {
                Tick::Inbound(Some(Ok(message))) => self.handle_message(message),
                Tick::Inbound(Some(Err(err))) => {
                    error!(error = %err, "malformed frame, stopping");
                    return StopReason::ProtocolError;
                }
                Tick::Inbound(None) => {
                    info!("peer closed the connection");
                    return StopReason::PeerClosed;
                }
                Tick::Command(Command::Stop) => {
                    debug!("stop requested");
                    return StopReason::Requested;
                }
                Tick::Command(command) => self.handle_command(command),
                Tick::Local(event) => self.handle_local_event(event),
            };
            if let Err(reason) = step {
                return reason;
            }
        }
    }

    fn handle_message(&mut self, message: Message) -> Result<(), StopReason> {
        trace!(kind = message.kind(), "dispatching message");
        match message {
            Message::Close(m) => {
                let handle = Handle::from_wire(m.handle);
                if !self.registry.unregister(handle) {
                    debug!(%handle, "peer close for unknown handle");
                }
                Ok(())
            }
            Message::Data(m) => self.handle_data(m),
            Message::ConnectRequest(m) => self.handle_connect_request(m),
            Message::ConnectResponse(m) => {
                let cookie = Cookie::from_wire(m.cookie);
                let result = response_result(m.error_code, Handle::from_wire(m.handle));
                self.pending.complete_connect(cookie, result);
                Ok(())
            }
            Message::PreadRequest(m) => self.handle_pread_request(m),
            Message::PreadResponse(m) => {
                let cookie = Cookie::from_wire(m.cookie);
                let result = response_result(m.error_code, m.data);
                self.pending.complete_pread(cookie, result);
                Ok(())
            }
            Message::FstatRequest(m) => self.handle_fstat_request(m),
            Message::FstatResponse(m) => {
                let cookie = Cookie::from_wire(m.cookie);
                let result = response_result(m.error_code, m.size);
                self.pending.complete_fstat(cookie, result);
                Ok(())
            }
        }
    }

    fn handle_data(&mut self, m: DataMessage) -> Result<(), StopReason> {
        let handle = Handle::from_wire(m.handle);
        if !self.registry.contains(handle) {
            // Routine teardown race: the peer sent data before it saw our
            // close for this handle.
            debug!(%handle, "data for unknown handle");
            return Ok(());
        }

        let mut fds = Vec::with_capacity(m.fds.len());
        let mut created = Vec::new();
        let mut failure = None;
        for wire in &m.fds {
            match self.materialize_fd(wire) {
                Ok((fd, registered)) => {
                    fds.push(fd);
                    if let Some(registered) = registered {
                        created.push(registered);
                    }
                }
                Err(err) => {
                    failure = Some(err);
                    break;
                }
            }
        }
        if let Some(err) = failure {
            warn!(%handle, error = %err, "cannot materialize transferred descriptors");
            for registered in created {
                if self.registry.unregister(registered) {
                    self.send(Message::close(registered.to_wire()))?;
                }
            }
            return self.close_local(handle);
        }

        if !self.registry.enqueue_write(
            handle,
            WriteOp {
                payload: m.payload,
                fds,
            },
        ) {
            debug!(%handle, "write queue already closed");
        }
        Ok(())
    }

    /// Builds the local descriptor for one wire announcement. For sockets
    /// and pipes this registers the bridging end under the peer-chosen
    /// handle and returns the end destined for the local recipient;
    /// regular files and dmabufs are delegate territory.
    fn materialize_fd(
        &mut self,
        wire: &WireFileDescriptor,
    ) -> ProxyResult<(OwnedFd, Option<Handle>)> {
        match wire {
            WireFileDescriptor::Socket(h) | WireFileDescriptor::SocketStream(h) => {
                let kind = match wire {
                    WireFileDescriptor::Socket(_) => FdKind::Socket,
                    _ => FdKind::SocketStream,
                };
                let (ours, theirs) = stream::socket_pair(kind)?;
                let handle = self.register_local(Stream::new(ours, kind)?, Handle::from_wire(*h))?;
                Ok((theirs, Some(handle)))
            }
            WireFileDescriptor::FifoRead(h) => {
                let (read_end, write_end) = stream::fifo_pair()?;
                let handle = self.register_local(
                    Stream::new(write_end, FdKind::FifoWrite)?,
                    Handle::from_wire(*h),
                )?;
                Ok((read_end, Some(handle)))
            }
            WireFileDescriptor::RegularFile(_) | WireFileDescriptor::Dmabuf(_) => {
                let fd = self.delegate.from_wire_descriptor(wire)?;
                Ok((fd, None))
            }
        }
    }

    fn handle_connect_request(&mut self, m: ConnectRequest) -> Result<(), StopReason> {
        let reply = match self.local_connect(&m.path) {
            Ok(handle) => {
                debug!(%handle, "peer connect succeeded");
                Message::connect_response(m.cookie, 0, handle.to_wire())
            }
            Err(errno) => {
                debug!(%errno, "peer connect failed");
                Message::connect_response(m.cookie, errno as u32, 0)
            }
        };
        self.send(reply)
    }

    fn local_connect(&mut self, raw_path: &[u8]) -> Result<Handle, Errno> {
        use std::os::unix::ffi::OsStrExt;
        let path = Path::new(std::ffi::OsStr::from_bytes(raw_path));

        if let Some(root) = &self.config.connect_root {
            if !path_within(root, path) {
                warn!(path = %path.display(), root = %root.display(), "peer connect outside allowed root");
                return Err(Errno::EACCES);
            }
        }
        let fd = stream::connect_unix_socket(path).map_err(io_errno)?;
        let stream = Stream::new(fd, FdKind::SocketStream).map_err(|err| err.errno())?;
        self.register_local(stream, Handle::ANY).map_err(|err| {
            warn!(error = %err, "cannot register connected socket");
            err.errno()
        })
    }

    fn handle_pread_request(&mut self, m: PreadRequest) -> Result<(), StopReason> {
        let handle = Handle::from_wire(m.handle);
        let reply = match self.registry.lookup(handle) {
            None => {
                debug!(%handle, "pread for unknown handle");
                Message::pread_response(m.cookie, Errno::EBADF as u32, Vec::new())
            }
            Some(entry) if entry.kind() != FdKind::RegularFile => {
                Message::pread_response(m.cookie, Errno::EOPNOTSUPP as u32, Vec::new())
            }
            Some(entry) => match entry.stream().pread(m.count, m.offset) {
                Ok(data) => Message::pread_response(m.cookie, 0, data),
                Err(err) => {
                    debug!(%handle, error = %err, "pread failed");
                    Message::pread_response(m.cookie, err.errno() as u32, Vec::new())
                }
            },
        };
        self.send(reply)
    }

    fn handle_fstat_request(&mut self, m: FstatRequest) -> Result<(), StopReason> {
        let handle = Handle::from_wire(m.handle);
        let reply = match self.registry.lookup(handle) {
            None => {
                debug!(%handle, "fstat for unknown handle");
                Message::fstat_response(m.cookie, Errno::EBADF as u32, 0)
            }
            Some(entry) if entry.kind() != FdKind::RegularFile => {
                Message::fstat_response(m.cookie, Errno::EOPNOTSUPP as u32, 0)
            }
            Some(entry) => match entry.stream().fstat_size() {
                Ok(size) => Message::fstat_response(m.cookie, 0, size),
                Err(err) => {
                    debug!(%handle, error = %err, "fstat failed");
                    Message::fstat_response(m.cookie, err.errno() as u32, 0)
                }
            },
        };
        self.send(reply)
    }

    fn handle_command(&mut self, command: Command) -> Result<(), StopReason> {
        match command {
            Command::Register {
                fd,
                kind,
                requested,
                reply,
            } => {
                let result = Stream::new(fd, kind)
                    .and_then(|stream| self.register_local(stream, requested));
                let _ = reply.send(result);
                Ok(())
            }
            Command::Connect { path, reply } => {
                let cookie = self.pending.insert_connect(reply);
                debug!(%cookie, "sending connect request");
                self.send(Message::connect_request(cookie.to_wire(), path))
            }
            Command::Pread {
                handle,
                count,
                offset,
                reply,
            } => {
                let cookie = self.pending.insert_pread(reply);
                self.send(Message::pread_request(
                    cookie.to_wire(),
                    handle.to_wire(),
                    count,
                    offset,
                ))
            }
            Command::Fstat { handle, reply } => {
                let cookie = self.pending.insert_fstat(reply);
                self.send(Message::fstat_request(cookie.to_wire(), handle.to_wire()))
            }
            Command::Close { handle } => {
                if self.registry.unregister(handle) {
                    self.send(Message::close(handle.to_wire()))
                } else {
                    debug!(%handle, "close for unregistered handle ignored");
                    Ok(())
                }
            }
            // Stop is intercepted by the dispatch loop.
            Command::Stop => Ok(()),
        }
    }

    fn handle_local_event(&mut self, event: LocalEvent) -> Result<(), StopReason> {
        match event {
            LocalEvent::Data {
                handle,
                payload,
                fds,
            } => {
                if !self.registry.contains(handle) {
                    debug!(%handle, "event for unregistered handle");
                    return Ok(());
                }
                let wire_fds = match self.wire_fds(fds) {
                    Ok(wire_fds) => wire_fds,
                    Err(err) => {
                        warn!(%handle, error = %err, "cannot forward transferred descriptors");
                        return self.close_local(handle);
                    }
                };
                self.send(Message::data(handle.to_wire(), payload, wire_fds))
            }
            LocalEvent::Eof { handle } => {
                debug!(%handle, "local end of stream");
                self.close_local(handle)
            }
            LocalEvent::ReadFailed { handle, error } => {
                debug!(%handle, error = %error, "local read failed");
                self.close_local(handle)
            }
            LocalEvent::WriteFailed { handle, error } => {
                debug!(%handle, error = %error, "local write failed");
                self.close_local(handle)
            }
        }
    }

    /// Announces local descriptors picked up by a reader task. Each one is
    /// registered under a fresh handle so the peer can mirror it; on
    /// failure the handles registered so far are rolled back. Nothing has
    /// been announced to the peer at that point, so no close frames go out
    /// for them.
    fn wire_fds(&mut self, fds: Vec<OwnedFd>) -> ProxyResult<Vec<WireFileDescriptor>> {
        let mut out = Vec::with_capacity(fds.len());
        let mut created = Vec::new();
        for fd in fds {
            match self.wire_fd(fd) {
                Ok((wire, registered)) => {
                    out.push(wire);
                    if let Some(registered) = registered {
                        created.push(registered);
                    }
                }
                Err(err) => {
                    for registered in created {
                        self.registry.unregister(registered);
                    }
                    return Err(err);
                }
            }
        }
        Ok(out)
    }

    fn wire_fd(&mut self, fd: OwnedFd) -> ProxyResult<(WireFileDescriptor, Option<Handle>)> {
        match stream::classify_fd(&fd)? {
            Some(kind) => {
                let handle = self.register_local(Stream::new(fd, kind)?, Handle::ANY)?;
                trace!(%handle, %kind, "registered transferred descriptor");
                match kind.wire_descriptor(handle) {
                    Some(wire) => Ok((wire, Some(handle))),
                    None => {
                        self.registry.unregister(handle);
                        Err(ProxyError::Unsupported)
                    }
                }
            }
            None => {
                let wire = self.delegate.to_wire_descriptor(fd)?;
                Ok((wire, None))
            }
        }
    }

    fn register_local(&mut self, stream: Stream, requested: Handle) -> ProxyResult<Handle> {
        self.registry.register(stream, requested, &self.events_tx)
    }

    /// Drops a local entry and tells the peer. Used when the local side of
    /// a proxied stream ends, errors, or refuses a delivery.
    fn close_local(&mut self, handle: Handle) -> Result<(), StopReason> {
        if self.registry.unregister(handle) {
            self.send(Message::close(handle.to_wire()))
        } else {
            Ok(())
        }
    }

    /// Queues a frame for the writer task. Failure means the writer died on
    /// a connection error; the queue it dropped is how the engine finds out.
    fn send(&self, message: Message) -> Result<(), StopReason> {
        if self.outbound.send(message).is_err() {
            error!("connection writer gone, stopping");
            return Err(StopReason::ConnectionError);
        }
        Ok(())
    }

    fn shutdown(mut self, reason: StopReason) {
        info!(
            ?reason,
            pending = self.pending.pending_count(),
            handles = self.registry.len(),
            "engine stopping"
        );
        // Order matters: in-flight requests resolve before the connection
        // state is torn down, then descriptors drop, then the embedder
        // hears about it. Dropping the outbound sender afterwards lets the
        // writer flush any close frames before the connection goes away.
        self.pending.cancel_all();
        self.registry.clear();
        self.reader.abort();
        self.delegate.on_stopped();
    }
}

fn response_result<T>(error_code: u32, value: T) -> ProxyResult<T> {
    if error_code == 0 {
        Ok(value)
    } else {
        Err(ProxyError::from_wire(error_code))
    }
}

fn io_errno(err: std::io::Error) -> Errno {
    err.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO)
}

/// Lexical containment check for peer connect paths. Relative paths and
/// anything with a `..` component are refused outright.
fn path_within(root: &Path, path: &Path) -> bool {
    path.is_absolute()
        && path.components().all(|c| c != Component::ParentDir)
        && path.starts_with(root)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_root_containment_is_lexical() {
        let root = Path::new("/run/proxied");
        assert!(path_within(root, Path::new("/run/proxied/app.sock")));
        assert!(path_within(root, Path::new("/run/proxied/sub/dir.sock")));
        assert!(!path_within(root, Path::new("/run/other/app.sock")));
        assert!(!path_within(root, Path::new("/run/proxied/../other.sock")));
        assert!(!path_within(root, Path::new("relative.sock")));
    }

    #[test]
    fn error_codes_split_success_from_failure() {
        assert_eq!(response_result(0, 7u64).unwrap(), 7);
        let err = response_result(Errno::ENOENT as u32, 0u64).unwrap_err();
        assert!(matches!(err, ProxyError::Remote(Errno::ENOENT)));
    }
}
