// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Daemon bridging unix sockets, pipes, and files between a VM guest and
//! its host over a single vsock connection.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

mod guest;
mod host;
mod vsock;

#[derive(Parser, Debug)]
#[command(name = "vsockmux-daemon")]
#[command(about = "Multiplexes unix sockets, pipes, and file reads between a VM guest and its host over vsock")]
struct Cli {
    #[command(flatten)]
    logging: vsockmux_logging::CliLoggingArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run inside the guest: connect to the host and expose a unix socket
    Guest(GuestArgs),
    /// Run on the host: accept guest connections and serve their requests
    Host(HostArgs),
}

#[derive(Args, Debug)]
struct GuestArgs {
    /// Context id of the host to connect to
    #[arg(long, default_value_t = libc::VMADDR_CID_HOST)]
    cid: u32,

    /// Vsock port the host daemon listens on
    #[arg(long, default_value_t = 9055)]
    port: u32,

    /// Unix socket exposed to guest applications
    #[arg(long, default_value = "/run/vsockmux.sock")]
    socket_path: PathBuf,

    /// Host-side unix socket every accepted connection is forwarded to
    #[arg(long)]
    remote_path: PathBuf,

    /// Connection attempts before giving up on the host
    #[arg(long, default_value_t = 10)]
    connect_attempts: u32,
}

#[derive(Args, Debug)]
struct HostArgs {
    /// Vsock port to listen on
    #[arg(long, default_value_t = 9055)]
    port: u32,

    /// Refuse guest connect requests naming paths outside this directory
    #[arg(long)]
    connect_root: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cli.logging.init("vsockmux-daemon")?;

    let span = tracing::info_span!("daemon", component = "vsockmux-daemon");
    let _enter = span.enter();

    match cli.command {
        Commands::Guest(args) => guest::run(args).await,
        Commands::Host(args) => host::run(args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guest_subcommand_parses_paths_and_defaults() {
        let cli = Cli::try_parse_from([
            "vsockmux-daemon",
            "guest",
            "--remote-path",
            "/srv/app.sock",
        ])
        .unwrap();
        match cli.command {
            Commands::Guest(args) => {
                assert_eq!(args.cid, libc::VMADDR_CID_HOST);
                assert_eq!(args.port, 9055);
                assert_eq!(args.socket_path, PathBuf::from("/run/vsockmux.sock"));
                assert_eq!(args.remote_path, PathBuf::from("/srv/app.sock"));
                assert_eq!(args.connect_attempts, 10);
            }
            other => panic!("expected guest command, got {other:?}"),
        }
    }

    #[test]
    fn host_subcommand_accepts_a_connect_root() {
        let cli = Cli::try_parse_from([
            "vsockmux-daemon",
            "host",
            "--port",
            "7000",
            "--connect-root",
            "/srv/sockets",
        ])
        .unwrap();
        match cli.command {
            Commands::Host(args) => {
                assert_eq!(args.port, 7000);
                assert_eq!(args.connect_root, Some(PathBuf::from("/srv/sockets")));
            }
            other => panic!("expected host command, got {other:?}"),
        }
    }

    #[test]
    fn guest_requires_the_remote_path() {
        assert!(Cli::try_parse_from(["vsockmux-daemon", "guest"]).is_err());
    }
}
