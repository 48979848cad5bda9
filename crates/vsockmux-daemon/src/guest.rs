// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Guest-side daemon loop.
//!
//! Connects to the host daemon over vsock, then listens on a local unix
//! socket. Every connection accepted there is forwarded to the host: a
//! connect request names the remote socket path, and the accepted descriptor
//! is registered under the handle the host answers with.

use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use tokio::net::{UnixListener, UnixStream};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, info, warn};

use vsockmux_core::{BasicDelegate, FdKind, ProxyClient, ProxyConfig, Role, VsockProxy};

use crate::vsock::{VsockAddr, VsockStream};
use crate::GuestArgs;

pub async fn run(args: GuestArgs) -> anyhow::Result<()> {
    let addr = VsockAddr::new(args.cid, args.port);
    let conn = connect_with_retry(addr, args.connect_attempts)
        .await
        .with_context(|| format!("connecting to host at {addr}"))?;
    info!(%addr, "connected to host");

    let (proxy, mut engine_task) =
        VsockProxy::spawn(conn, BasicDelegate::new(Role::Initiator), ProxyConfig::default());

    let listener = bind_unix_listener(&args.socket_path)
        .with_context(|| format!("binding {}", args.socket_path.display()))?;
    info!(socket = %args.socket_path.display(), "listening for local connections");

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let proxy = proxy.clone();
                    let remote = args.remote_path.clone();
                    tokio::spawn(async move {
                        if let Err(err) = forward(proxy, stream, &remote).await {
                            warn!(remote = %remote.display(), error = %err, "forwarding failed");
                        }
                    });
                }
                Err(err) => warn!(error = %err, "accept failed"),
            },
            _ = &mut engine_task => {
                info!("host connection finished, exiting");
                break;
            }
            _ = sigint.recv() => {
                info!(signal = "SIGINT", "shutting down");
                proxy.stop().await;
                let _ = (&mut engine_task).await;
                break;
            }
            _ = sigterm.recv() => {
                info!(signal = "SIGTERM", "shutting down");
                proxy.stop().await;
                let _ = (&mut engine_task).await;
                break;
            }
        }
    }

    let _ = std::fs::remove_file(&args.socket_path);
    Ok(())
}

/// Bridges one accepted local connection to the remote socket at `remote`.
async fn forward(proxy: ProxyClient, stream: UnixStream, remote: &Path) -> anyhow::Result<()> {
    let handle = proxy
        .connect(remote.as_os_str().as_bytes())
        .await
        .with_context(|| format!("remote connect to {}", remote.display()))?;
    debug!(%handle, remote = %remote.display(), "remote connect succeeded");

    let fd: OwnedFd = stream.into_std()?.into();
    if let Err(err) = proxy
        .register_file_descriptor(fd, FdKind::SocketStream, handle)
        .await
    {
        // The remote side already holds its end; tell it to let go.
        proxy.close(handle).await;
        return Err(err).context("registering accepted connection");
    }
    Ok(())
}

async fn connect_with_retry(addr: VsockAddr, attempts: u32) -> io::Result<VsockStream> {
    let mut delay = Duration::from_millis(200);
    let mut last_err = None;
    for attempt in 1..=attempts.max(1) {
        match VsockStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(err) => {
                debug!(%addr, attempt, error = %err, "host not reachable yet");
                last_err = Some(err);
            }
        }
        tokio::time::sleep(delay).await;
        delay = (delay * 2).min(Duration::from_secs(2));
    }
    Err(last_err
        .unwrap_or_else(|| io::Error::new(io::ErrorKind::Other, "no connection attempts made")))
}

fn bind_unix_listener(path: &Path) -> io::Result<UnixListener> {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(err),
    }
    UnixListener::bind(path)
}
