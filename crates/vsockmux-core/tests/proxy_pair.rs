// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! End-to-end tests running two engines against each other over a unix
//! socketpair, plus scripted-peer tests that assert the wire contract
//! frame by frame.

use std::fs::File;
use std::io::Write as _;
use std::os::fd::OwnedFd;
use std::os::unix::ffi::OsStrExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio::time::timeout;

use vsockmux_core::{
    Delegate, FdKind, Handle, ProxyClient, ProxyConfig, ProxyError, ProxyResult, ReadOutcome,
    Role, Stream, VsockProxy,
};
use vsockmux_proto::{read_frame, write_frame, Message, WireFileDescriptor};

const TEST_TIMEOUT: Duration = Duration::from_secs(5);

async fn within<T, F>(fut: F) -> T
where
    F: std::future::Future<Output = T>,
{
    timeout(TEST_TIMEOUT, fut).await.expect("test timed out")
}

struct CountingDelegate {
    role: Role,
    stopped: Arc<AtomicUsize>,
}

impl Delegate for CountingDelegate {
    fn role(&self) -> Role {
        self.role
    }

    fn to_wire_descriptor(&self, _fd: OwnedFd) -> ProxyResult<WireFileDescriptor> {
        Err(ProxyError::Unsupported)
    }

    fn from_wire_descriptor(&self, _wire: &WireFileDescriptor) -> ProxyResult<OwnedFd> {
        Err(ProxyError::Unsupported)
    }

    fn on_stopped(&self) {
        self.stopped.fetch_add(1, Ordering::SeqCst);
    }
}

struct ProxyPair {
    initiator: ProxyClient,
    acceptor: ProxyClient,
    initiator_task: JoinHandle<()>,
    acceptor_task: JoinHandle<()>,
    initiator_stopped: Arc<AtomicUsize>,
    acceptor_stopped: Arc<AtomicUsize>,
}

fn spawn_pair() -> ProxyPair {
    spawn_pair_with(ProxyConfig::default(), ProxyConfig::default())
}

fn spawn_pair_with(initiator_config: ProxyConfig, acceptor_config: ProxyConfig) -> ProxyPair {
    let (a, b) = UnixStream::pair().expect("socketpair");
    let initiator_stopped = Arc::new(AtomicUsize::new(0));
    let acceptor_stopped = Arc::new(AtomicUsize::new(0));
    let (initiator, initiator_task) = VsockProxy::spawn(
        a,
        CountingDelegate {
            role: Role::Initiator,
            stopped: initiator_stopped.clone(),
        },
        initiator_config,
    );
    let (acceptor, acceptor_task) = VsockProxy::spawn(
        b,
        CountingDelegate {
            role: Role::Acceptor,
            stopped: acceptor_stopped.clone(),
        },
        acceptor_config,
    );
    ProxyPair {
        initiator,
        acceptor,
        initiator_task,
        acceptor_task,
        initiator_stopped,
        acceptor_stopped,
    }
}

/// A local endpoint pair: the test keeps the async end, the proxy gets the
/// other.
fn app_pair() -> (UnixStream, OwnedFd) {
    let (ours, theirs) = std::os::unix::net::UnixStream::pair().expect("pair");
    ours.set_nonblocking(true).expect("nonblocking");
    (
        UnixStream::from_std(ours).expect("from_std"),
        theirs.into(),
    )
}

/// Like [`app_pair`] but the test end is wrapped as a [`Stream`] so the
/// test can send and receive descriptors.
fn stream_app_pair() -> (Stream, OwnedFd) {
    let (ours, theirs) = std::os::unix::net::UnixStream::pair().expect("pair");
    (
        Stream::new(ours.into(), FdKind::SocketStream).expect("stream"),
        theirs.into(),
    )
}

#[tokio::test]
async fn bytes_flow_between_mirrored_endpoints() {
    let pair = spawn_pair();
    let (mut app_a, fd_a) = app_pair();
    let (mut app_b, fd_b) = app_pair();

    let handle = pair
        .initiator
        .register_file_descriptor(fd_a, FdKind::SocketStream, Handle::ANY)
        .await
        .unwrap();
    let mirrored = pair
        .acceptor
        .register_file_descriptor(fd_b, FdKind::SocketStream, handle)
        .await
        .unwrap();
    assert_eq!(mirrored, handle);

    app_a.write_all(b"abcdefg\0").await.unwrap();
    let mut buf = vec![0u8; 8];
    within(app_b.read_exact(&mut buf)).await.unwrap();
    assert_eq!(buf, b"abcdefg\0");

    app_b.write_all(b"response").await.unwrap();
    let mut buf = vec![0u8; 8];
    within(app_a.read_exact(&mut buf)).await.unwrap();
    assert_eq!(buf, b"response");
}

#[tokio::test]
async fn allocated_handles_are_disjoint_between_sides() {
    let pair = spawn_pair();

    let mut initiator_handles = Vec::new();
    let mut acceptor_handles = Vec::new();
    for _ in 0..3 {
        let (_app, fd) = app_pair();
        initiator_handles.push(
            pair.initiator
                .register_file_descriptor(fd, FdKind::SocketStream, Handle::ANY)
                .await
                .unwrap(),
        );
        let (_app, fd) = app_pair();
        acceptor_handles.push(
            pair.acceptor
                .register_file_descriptor(fd, FdKind::SocketStream, Handle::ANY)
                .await
                .unwrap(),
        );
    }

    for handle in &initiator_handles {
        assert_eq!(handle.raw() % 2, 1, "initiator handles are odd");
    }
    for handle in &acceptor_handles {
        assert_eq!(handle.raw() % 2, 0, "acceptor handles are even");
    }
}

#[tokio::test]
async fn registering_a_taken_handle_fails() {
    let pair = spawn_pair();
    let (_app_a, fd_a) = app_pair();
    let (_app_b, fd_b) = app_pair();

    let handle = pair
        .initiator
        .register_file_descriptor(fd_a, FdKind::SocketStream, Handle::ANY)
        .await
        .unwrap();
    let err = pair
        .initiator
        .register_file_descriptor(fd_b, FdKind::SocketStream, handle)
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::HandleInUse(h) if h == handle.raw()));
}

#[tokio::test]
async fn pread_reads_remote_file_windows() {
    let pair = spawn_pair();
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(b"abcdefghijklmnopqrstuvwxyz").unwrap();

    let handle = pair
        .acceptor
        .register_file_descriptor(OwnedFd::from(file), FdKind::RegularFile, Handle::ANY)
        .await
        .unwrap();

    let data = within(pair.initiator.pread(handle, 10, 10)).await.unwrap();
    assert_eq!(data, b"klmnopqrst");
    let size = within(pair.initiator.fstat(handle)).await.unwrap();
    assert_eq!(size, 26);
    // Past the end is a short read, then empty, never an error.
    let tail = within(pair.initiator.pread(handle, 10, 24)).await.unwrap();
    assert_eq!(tail, b"yz");
    assert!(within(pair.initiator.pread(handle, 10, 100))
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn pread_of_unknown_handle_reports_ebadf() {
    let pair = spawn_pair();
    let err = within(pair.initiator.pread(Handle(999), 10, 0))
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::Remote(Errno::EBADF)));
}

#[tokio::test]
async fn file_requests_against_a_socket_report_eopnotsupp() {
    let pair = spawn_pair();
    let (_app, fd) = app_pair();
    let handle = pair
        .acceptor
        .register_file_descriptor(fd, FdKind::SocketStream, Handle::ANY)
        .await
        .unwrap();

    let err = within(pair.initiator.fstat(handle)).await.unwrap_err();
    assert!(matches!(err, ProxyError::Remote(Errno::EOPNOTSUPP)));
    let err = within(pair.initiator.pread(handle, 4, 0)).await.unwrap_err();
    assert!(matches!(err, ProxyError::Remote(Errno::EOPNOTSUPP)));
}

#[tokio::test]
async fn connect_reaches_a_listener_inside_the_allowed_root() {
    let dir = tempfile::tempdir().unwrap();
    let socket_path = dir.path().join("svc.sock");
    let listener = UnixListener::bind(&socket_path).unwrap();
    let accept_task = tokio::spawn(async move { listener.accept().await.unwrap().0 });

    let pair = spawn_pair_with(
        ProxyConfig::default(),
        ProxyConfig {
            connect_root: Some(dir.path().to_path_buf()),
        },
    );

    let handle = within(pair.initiator.connect(socket_path.as_os_str().as_bytes().to_vec()))
        .await
        .unwrap();
    // The connected socket is registered on the acceptor side, so the
    // handle comes from the acceptor's even range.
    assert_eq!(handle.raw() % 2, 0);

    let mut server_end = within(accept_task).await.unwrap();
    let (mut app, fd) = app_pair();
    pair.initiator
        .register_file_descriptor(fd, FdKind::SocketStream, handle)
        .await
        .unwrap();

    app.write_all(b"hello service").await.unwrap();
    let mut buf = vec![0u8; 13];
    within(server_end.read_exact(&mut buf)).await.unwrap();
    assert_eq!(buf, b"hello service");

    server_end.write_all(b"ack").await.unwrap();
    let mut buf = vec![0u8; 3];
    within(app.read_exact(&mut buf)).await.unwrap();
    assert_eq!(&buf, b"ack");
}

#[tokio::test]
async fn connect_outside_the_allowed_root_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let pair = spawn_pair_with(
        ProxyConfig::default(),
        ProxyConfig {
            connect_root: Some(dir.path().to_path_buf()),
        },
    );

    let err = within(pair.initiator.connect(&b"/tmp/elsewhere.sock"[..]))
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::Remote(Errno::EACCES)));
}

#[tokio::test]
async fn connect_to_a_missing_socket_reports_the_errno() {
    let pair = spawn_pair();
    let err = within(
        pair.initiator
            .connect(&b"/nonexistent/never-there.sock"[..]),
    )
    .await
    .unwrap_err();
    assert!(matches!(err, ProxyError::Remote(Errno::ENOENT)));
}

#[tokio::test]
async fn descriptors_transfer_across_the_proxy() {
    let pair = spawn_pair();
    let (app_a, fd_a) = stream_app_pair();
    let (app_b, fd_b) = stream_app_pair();

    let handle = pair
        .initiator
        .register_file_descriptor(fd_a, FdKind::SocketStream, Handle::ANY)
        .await
        .unwrap();
    pair.acceptor
        .register_file_descriptor(fd_b, FdKind::SocketStream, handle)
        .await
        .unwrap();

    // Send a pipe read end along with a byte of payload.
    let (pipe_read, pipe_write) = nix::unistd::pipe().unwrap();
    app_a.write_local(b"x", vec![pipe_read]).await.unwrap();

    let received = match within(app_b.read_local()).await.unwrap() {
        ReadOutcome::Data { payload, mut fds } => {
            assert_eq!(payload, b"x");
            assert_eq!(fds.len(), 1);
            fds.pop().unwrap()
        }
        ReadOutcome::Eof => panic!("expected data"),
    };

    // Bytes written into the original pipe surface on the transferred end.
    let mut writer = File::from(pipe_write);
    writer.write_all(b"across the bridge").unwrap();
    drop(writer);

    let bridged = Stream::new(received, FdKind::FifoRead).unwrap();
    let mut collected = Vec::new();
    loop {
        match within(bridged.read_local()).await.unwrap() {
            ReadOutcome::Data { payload, .. } => collected.extend_from_slice(&payload),
            ReadOutcome::Eof => break,
        }
    }
    assert_eq!(collected, b"across the bridge");
}

#[tokio::test]
async fn failed_local_delivery_closes_the_stream() {
    let pair = spawn_pair();
    let (mut app_a, fd_a) = app_pair();

    let handle = pair
        .initiator
        .register_file_descriptor(fd_a, FdKind::SocketStream, Handle::ANY)
        .await
        .unwrap();

    // The acceptor mirrors the handle with a read-only file, so delivering
    // peer bytes into it must fail.
    let mut named = tempfile::NamedTempFile::new().unwrap();
    named.write_all(b"sealed").unwrap();
    let read_only = File::open(named.path()).unwrap();
    pair.acceptor
        .register_file_descriptor(OwnedFd::from(read_only), FdKind::RegularFile, handle)
        .await
        .unwrap();

    app_a.write_all(b"doomed bytes").await.unwrap();

    // The delivery failure travels back as a close; our end goes away.
    let mut buf = [0u8; 16];
    let n = within(app_a.read(&mut buf)).await.unwrap();
    assert_eq!(n, 0, "expected eof after the peer closed the handle");
}

#[tokio::test]
async fn closing_unknown_handles_is_harmless() {
    let pair = spawn_pair();
    pair.initiator.close(Handle(77)).await;

    // Both engines stay functional afterwards.
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(b"still alive").unwrap();
    let handle = pair
        .acceptor
        .register_file_descriptor(OwnedFd::from(file), FdKind::RegularFile, Handle::ANY)
        .await
        .unwrap();
    let size = within(pair.initiator.fstat(handle)).await.unwrap();
    assert_eq!(size, 11);
}

#[tokio::test]
async fn stop_tears_down_both_sides() {
    let pair = spawn_pair();
    let (mut app_a, fd_a) = app_pair();
    let (mut app_b, fd_b) = app_pair();

    let handle = pair
        .initiator
        .register_file_descriptor(fd_a, FdKind::SocketStream, Handle::ANY)
        .await
        .unwrap();
    pair.acceptor
        .register_file_descriptor(fd_b, FdKind::SocketStream, handle)
        .await
        .unwrap();

    pair.initiator.stop().await;
    within(pair.initiator_task).await.unwrap();
    assert_eq!(pair.initiator_stopped.load(Ordering::SeqCst), 1);

    // Registered descriptors were dropped, so the local end reads EOF.
    let mut buf = [0u8; 8];
    let n = within(app_a.read(&mut buf)).await.unwrap();
    assert_eq!(n, 0);

    // The peer engine observes the closed connection and stops as well.
    within(pair.acceptor_task).await.unwrap();
    assert_eq!(pair.acceptor_stopped.load(Ordering::SeqCst), 1);
    let n = within(app_b.read(&mut buf)).await.unwrap();
    assert_eq!(n, 0);

    // Operations against a stopped engine fail with the designated error.
    let err = pair.initiator.pread(handle, 1, 0).await.unwrap_err();
    assert!(matches!(err, ProxyError::Stopped));
    let err = pair
        .acceptor
        .connect(&b"/anywhere.sock"[..])
        .await
        .unwrap_err();
    assert!(matches!(err, ProxyError::Stopped));
}

// Scripted-peer tests: the test plays the remote engine and checks frames.

fn spawn_scripted(role: Role) -> (ProxyClient, JoinHandle<()>, Arc<AtomicUsize>, UnixStream) {
    let (conn, peer) = UnixStream::pair().expect("socketpair");
    let stopped = Arc::new(AtomicUsize::new(0));
    let (client, task) = VsockProxy::spawn(
        conn,
        CountingDelegate {
            role,
            stopped: stopped.clone(),
        },
        ProxyConfig::default(),
    );
    (client, task, stopped, peer)
}

#[tokio::test]
async fn requests_carry_echoable_cookies() {
    let (client, _task, _stopped, mut peer) = spawn_scripted(Role::Initiator);

    let pread_task = tokio::spawn({
        let client = client.clone();
        async move { client.pread(Handle(7), 4, 32).await }
    });

    let request = match within(read_frame(&mut peer)).await.unwrap().unwrap() {
        Message::PreadRequest(m) => m,
        other => panic!("expected pread request, got {}", other.kind()),
    };
    assert_eq!(request.handle, 7);
    assert_eq!(request.count, 4);
    assert_eq!(request.offset, 32);

    // A response for a cookie nobody is waiting on is tolerated…
    write_frame(
        &mut peer,
        &Message::pread_response(request.cookie + 100, 0, b"bogus".to_vec()),
    )
    .await
    .unwrap();
    // …and the real answer still finds its caller.
    write_frame(
        &mut peer,
        &Message::pread_response(request.cookie, 0, b"real".to_vec()),
    )
    .await
    .unwrap();

    let data = within(pread_task).await.unwrap().unwrap();
    assert_eq!(data, b"real");
}

#[tokio::test]
async fn responder_echoes_cookies_and_reports_errno() {
    let (_client, _task, _stopped, mut peer) = spawn_scripted(Role::Acceptor);

    write_frame(&mut peer, &Message::pread_request(42, 999, 16, 0))
        .await
        .unwrap();
    match within(read_frame(&mut peer)).await.unwrap().unwrap() {
        Message::PreadResponse(m) => {
            assert_eq!(m.cookie, 42);
            assert_eq!(m.error_code, Errno::EBADF as u32);
            assert!(m.data.is_empty());
        }
        other => panic!("expected pread response, got {}", other.kind()),
    }

    write_frame(&mut peer, &Message::fstat_request(43, 999))
        .await
        .unwrap();
    match within(read_frame(&mut peer)).await.unwrap().unwrap() {
        Message::FstatResponse(m) => {
            assert_eq!(m.cookie, 43);
            assert_eq!(m.error_code, Errno::EBADF as u32);
            assert_eq!(m.size, 0);
        }
        other => panic!("expected fstat response, got {}", other.kind()),
    }
}

#[tokio::test]
async fn data_for_unknown_handles_is_ignored() {
    let (_client, _task, _stopped, mut peer) = spawn_scripted(Role::Acceptor);

    write_frame(&mut peer, &Message::data(123, b"stray".to_vec(), Vec::new()))
        .await
        .unwrap();
    write_frame(&mut peer, &Message::close(456)).await.unwrap();

    // The engine is still answering requests afterwards.
    write_frame(&mut peer, &Message::fstat_request(1, 5)).await.unwrap();
    match within(read_frame(&mut peer)).await.unwrap().unwrap() {
        Message::FstatResponse(m) => assert_eq!(m.cookie, 1),
        other => panic!("expected fstat response, got {}", other.kind()),
    }
}

#[tokio::test]
async fn teardown_cancels_every_pending_request() {
    let (client, task, stopped, mut peer) = spawn_scripted(Role::Initiator);

    let connect_task = tokio::spawn({
        let client = client.clone();
        async move { client.connect(&b"/svc.sock"[..]).await }
    });
    let pread_task = tokio::spawn({
        let client = client.clone();
        async move { client.pread(Handle(5), 10, 0).await }
    });
    let fstat_task = tokio::spawn({
        let client = client.clone();
        async move { client.fstat(Handle(5)).await }
    });

    // All three requests hit the wire; the scripted peer never answers.
    let mut kinds = Vec::new();
    for _ in 0..3 {
        let message = within(read_frame(&mut peer)).await.unwrap().unwrap();
        kinds.push(message.kind());
    }
    kinds.sort_unstable();
    assert_eq!(kinds, ["connect_request", "fstat_request", "pread_request"]);

    client.stop().await;
    within(task).await.unwrap();
    assert_eq!(stopped.load(Ordering::SeqCst), 1);

    assert!(matches!(
        within(connect_task).await.unwrap(),
        Err(ProxyError::Stopped)
    ));
    assert!(matches!(
        within(pread_task).await.unwrap(),
        Err(ProxyError::Stopped)
    ));
    assert!(matches!(
        within(fstat_task).await.unwrap(),
        Err(ProxyError::Stopped)
    ));
}

#[tokio::test]
async fn malformed_frames_are_fatal() {
    let (client, task, stopped, mut peer) = spawn_scripted(Role::Initiator);

    // Valid length prefix, unknown union selector.
    peer.write_all(&4u32.to_le_bytes()).await.unwrap();
    peer.write_all(&[0xff, 0, 0, 0]).await.unwrap();

    within(task).await.unwrap();
    assert_eq!(stopped.load(Ordering::SeqCst), 1);

    let err = within(client.fstat(Handle(1))).await.unwrap_err();
    assert!(matches!(err, ProxyError::Stopped));
}
