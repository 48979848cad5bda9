// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Handle-to-descriptor map plus the per-descriptor pump tasks.
//!
//! Registering a descriptor spawns a writer task draining its outbound
//! queue and, for watched kinds, a reader task feeding local bytes to the
//! engine. Unregistering drops the entry; the entry's drop cancels both
//! tasks, which in turn releases the last references to the descriptor and
//! closes it.

use std::collections::HashMap;
use std::os::fd::OwnedFd;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{ProxyError, ProxyResult};
use crate::stream::{ReadOutcome, Stream};
use crate::types::{FdKind, Handle, HandleAllocator, Role};

/// Something a descriptor's pump tasks need the engine to act on.
pub enum LocalEvent {
    /// Local bytes (and possibly descriptors) to relay to the peer.
    Data {
        handle: Handle,
        payload: Vec<u8>,
        fds: Vec<OwnedFd>,
    },
    /// The local endpoint reached end of stream.
    Eof { handle: Handle },
    /// Reading the local endpoint failed.
    ReadFailed { handle: Handle, error: ProxyError },
    /// Writing peer data into the local endpoint failed.
    WriteFailed { handle: Handle, error: ProxyError },
}

/// One queued delivery toward the local endpoint.
pub struct WriteOp {
    pub payload: Vec<u8>,
    pub fds: Vec<OwnedFd>,
}

pub struct RegistryEntry {
    stream: Arc<Stream>,
    writer: mpsc::UnboundedSender<WriteOp>,
    shutdown: CancellationToken,
}

impl RegistryEntry {
    fn spawn(handle: Handle, stream: Stream, events: mpsc::Sender<LocalEvent>) -> Self {
        let stream = Arc::new(stream);
        let shutdown = CancellationToken::new();
        let (writer_tx, writer_rx) = mpsc::unbounded_channel();

        tokio::spawn(writer_task(
            handle,
            stream.clone(),
            writer_rx,
            events.clone(),
            shutdown.clone(),
        ));
        if stream.kind().is_watched() {
            tokio::spawn(reader_task(handle, stream.clone(), events, shutdown.clone()));
        }

        RegistryEntry {
            stream,
            writer: writer_tx,
            shutdown,
        }
    }

    pub fn kind(&self) -> FdKind {
        self.stream.kind()
    }

    pub fn stream(&self) -> &Stream {
        &self.stream
    }

    pub fn enqueue_write(&self, op: WriteOp) -> bool {
        self.writer.send(op).is_ok()
    }
}

impl Drop for RegistryEntry {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Maps live handles to their registered descriptors.
pub struct HandleRegistry {
    entries: HashMap<Handle, RegistryEntry>,
    allocator: HandleAllocator,
}

impl HandleRegistry {
    pub fn new(role: Role) -> Self {
        HandleRegistry {
            entries: HashMap::new(),
            allocator: HandleAllocator::new(role),
        }
    }

    /// Adds a descriptor under `requested`, or under a freshly allocated
    /// handle when `requested` is [`Handle::ANY`]. Spawns the entry's pump
    /// tasks on success.
    pub fn register(
        &mut self,
        stream: Stream,
        requested: Handle,
        events: &mpsc::Sender<LocalEvent>,
    ) -> ProxyResult<Handle> {
        let handle = if requested.is_any() {
            loop {
                let candidate = self.allocator.next();
                if !self.entries.contains_key(&candidate) {
                    break candidate;
                }
            }
        } else {
            if self.entries.contains_key(&requested) {
                return Err(ProxyError::HandleInUse(requested.raw()));
            }
            requested
        };

        let kind = stream.kind();
        let entry = RegistryEntry::spawn(handle, stream, events.clone());
        self.entries.insert(handle, entry);
        debug!(%handle, %kind, "registered descriptor");
        Ok(handle)
    }

    /// Removes a handle, cancelling its pump tasks and closing the
    /// descriptor. Unknown handles are a no-op; teardown paths race each
    /// other by design of the protocol.
    pub fn unregister(&mut self, handle: Handle) -> bool {
        match self.entries.remove(&handle) {
            Some(_entry) => {
                debug!(%handle, "unregistered descriptor");
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.entries.contains_key(&handle)
    }

    pub fn lookup(&self, handle: Handle) -> Option<&RegistryEntry> {
        self.entries.get(&handle)
    }

    pub fn enqueue_write(&self, handle: Handle, op: WriteOp) -> bool {
        match self.entries.get(&handle) {
            Some(entry) => entry.enqueue_write(op),
            None => false,
        }
    }

    /// Drops every entry. Used at engine shutdown after pending requests
    /// have been cancelled.
    pub fn clear(&mut self) {
        if !self.entries.is_empty() {
            debug!(count = self.entries.len(), "dropping all registered descriptors");
        }
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn handles(&self) -> impl Iterator<Item = Handle> + '_ {
        self.entries.keys().copied()
    }
}

async fn reader_task(
    handle: Handle,
    stream: Arc<Stream>,
    events: mpsc::Sender<LocalEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let outcome = tokio::select! {
            _ = shutdown.cancelled() => break,
            outcome = stream.read_local() => outcome,
        };
        let event = match outcome {
            Ok(ReadOutcome::Data { payload, fds }) => LocalEvent::Data {
                handle,
                payload,
                fds,
            },
            Ok(ReadOutcome::Eof) => {
                let _ = events.send(LocalEvent::Eof { handle }).await;
                break;
            }
            Err(error) => {
                let _ = events.send(LocalEvent::ReadFailed { handle, error }).await;
                break;
            }
        };
        if events.send(event).await.is_err() {
            break;
        }
    }
    trace!(%handle, "reader task finished");
}

async fn writer_task(
    handle: Handle,
    stream: Arc<Stream>,
    mut ops: mpsc::UnboundedReceiver<WriteOp>,
    events: mpsc::Sender<LocalEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let op = tokio::select! {
            _ = shutdown.cancelled() => break,
            op = ops.recv() => match op {
                Some(op) => op,
                None => break,
            },
        };
        let result = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = stream.write_local(&op.payload, op.fds) => result,
        };
        if let Err(error) = result {
            let _ = events.send(LocalEvent::WriteFailed { handle, error }).await;
            break;
        }
    }
    trace!(%handle, "writer task finished");
}
