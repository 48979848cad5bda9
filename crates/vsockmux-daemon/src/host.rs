// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Host-side daemon loop.
//!
//! Listens on a vsock port and runs one proxy engine per guest connection.
//! The host side is passive: it answers connect, pread, and fstat requests
//! and relays stream data, optionally confined to a connect root.

use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use vsockmux_core::{BasicDelegate, ProxyClient, ProxyConfig, Role, VsockProxy};

use crate::vsock::{VsockAddr, VsockListener};
use crate::HostArgs;

pub async fn run(args: HostArgs) -> anyhow::Result<()> {
    let listener = VsockListener::bind(VsockAddr::new(libc::VMADDR_CID_ANY, args.port))?;
    let addr = listener.local_addr()?;
    info!(%addr, "listening for guest connections");
    if let Some(root) = &args.connect_root {
        info!(root = %root.display(), "connect requests confined");
    }

    let config = ProxyConfig {
        connect_root: args.connect_root.clone(),
    };

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut engines: Vec<(ProxyClient, JoinHandle<()>)> = Vec::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((conn, peer)) => {
                    info!(%peer, "guest connected");
                    let (client, task) = VsockProxy::spawn(
                        conn,
                        BasicDelegate::new(Role::Acceptor),
                        config.clone(),
                    );
                    engines.retain(|(_, task)| !task.is_finished());
                    engines.push((client, task));
                }
                Err(err) => warn!(error = %err, "accept failed"),
            },
            _ = sigint.recv() => {
                info!(signal = "SIGINT", "shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!(signal = "SIGTERM", "shutting down");
                break;
            }
        }
    }

    for (client, task) in engines {
        client.stop().await;
        let _ = task.await;
    }
    Ok(())
}
