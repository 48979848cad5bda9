// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Nonblocking wrappers around the local descriptors the proxy relays.
//!
//! A [`Stream`] owns one registered descriptor. Sockets and pipe ends are
//! armed on the tokio reactor; regular files and dmabufs are kept off it
//! because the kernel refuses to epoll them (and they are always ready
//! anyway). Control-message plumbing for `SCM_RIGHTS` is done with raw
//! `libc` calls since the payload and descriptor list have to travel in a
//! single `sendmsg`.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::Path;

use nix::fcntl::OFlag;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use nix::unistd::pipe2;
use tokio::io::unix::AsyncFd;

use crate::error::{ProxyError, ProxyResult};
use crate::types::FdKind;

/// Largest number of descriptors one data message may carry. The receive
/// side sizes its control buffer for this many; anything beyond it arrives
/// truncated and tears the stream down.
pub const MAX_TRANSFER_FDS: usize = 16;

/// Upper bound on the bytes served by a single pread. Keeps a full response
/// frame comfortably under the frame size limit; shorter-than-requested
/// reads are part of the contract.
pub const MAX_PREAD_CHUNK: usize = 4 * 1024 * 1024;

pub use vsockmux_proto::DATA_CHUNK_SIZE;

/// What one local read produced.
pub enum ReadOutcome {
    Data {
        payload: Vec<u8>,
        fds: Vec<OwnedFd>,
    },
    Eof,
}

enum StreamFd {
    Watched(AsyncFd<OwnedFd>),
    Plain(OwnedFd),
}

/// One registered local descriptor with kind-appropriate I/O paths.
pub struct Stream {
    fd: StreamFd,
    kind: FdKind,
}

impl Stream {
    pub fn new(fd: OwnedFd, kind: FdKind) -> ProxyResult<Self> {
        let fd = if kind.is_pollable() {
            set_nonblocking(fd.as_raw_fd())?;
            StreamFd::Watched(AsyncFd::new(fd).map_err(ProxyError::Io)?)
        } else {
            StreamFd::Plain(fd)
        };
        Ok(Stream { fd, kind })
    }

    pub fn kind(&self) -> FdKind {
        self.kind
    }

    /// Waits for readability and pulls one chunk off the descriptor.
    /// Only valid for watched kinds; the reader task is the sole caller.
    pub async fn read_local(&self) -> ProxyResult<ReadOutcome> {
        let afd = match &self.fd {
            StreamFd::Watched(afd) => afd,
            StreamFd::Plain(_) => return Err(ProxyError::Unsupported),
        };
        loop {
            let mut guard = afd.readable().await?;
            match guard.try_io(|inner| self.read_once(inner.get_ref().as_raw_fd())) {
                Ok(Ok(outcome)) => return Ok(outcome),
                Ok(Err(err)) if err.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(err)) => return Err(ProxyError::Io(err)),
                Err(_would_block) => continue,
            }
        }
    }

    fn read_once(&self, raw: RawFd) -> io::Result<ReadOutcome> {
        match self.kind {
            FdKind::Socket | FdKind::SocketStream => recv_with_fds(raw),
            FdKind::FifoRead => {
                let mut buf = vec![0u8; DATA_CHUNK_SIZE];
                let n = read_bytes(raw, &mut buf)?;
                if n == 0 {
                    return Ok(ReadOutcome::Eof);
                }
                buf.truncate(n);
                Ok(ReadOutcome::Data {
                    payload: buf,
                    fds: Vec::new(),
                })
            }
            _ => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "descriptor kind has no local read path",
            )),
        }
    }

    /// Delivers one message worth of bytes (and any descriptors) to the
    /// local endpoint. Descriptors ride the first successful send.
    pub async fn write_local(&self, payload: &[u8], fds: Vec<OwnedFd>) -> ProxyResult<()> {
        match &self.fd {
            StreamFd::Watched(afd) => self.write_watched(afd, payload, fds).await,
            StreamFd::Plain(fd) => self.write_plain(fd.as_raw_fd(), payload, &fds),
        }
    }

    async fn write_watched(
        &self,
        afd: &AsyncFd<OwnedFd>,
        payload: &[u8],
        mut fds: Vec<OwnedFd>,
    ) -> ProxyResult<()> {
        let mut offset = 0;
        loop {
            let mut guard = afd.writable().await?;
            let chunk = &payload[offset..];
            let result = guard.try_io(|inner| {
                let raw = inner.get_ref().as_raw_fd();
                match self.kind {
                    FdKind::Socket | FdKind::SocketStream => send_with_fds(raw, chunk, &fds),
                    FdKind::FifoRead | FdKind::FifoWrite => {
                        if fds.is_empty() {
                            write_bytes(raw, chunk)
                        } else {
                            Err(io::Error::new(
                                io::ErrorKind::Unsupported,
                                "pipes cannot carry descriptors",
                            ))
                        }
                    }
                    FdKind::RegularFile | FdKind::Dmabuf => Err(io::Error::new(
                        io::ErrorKind::Unsupported,
                        "descriptor kind has no watched write path",
                    )),
                }
            });
            match result {
                Ok(Ok(n)) => {
                    fds.clear();
                    offset += n;
                    if offset >= payload.len() {
                        return Ok(());
                    }
                }
                Ok(Err(err)) if err.kind() == io::ErrorKind::Interrupted => continue,
                Ok(Err(err)) => return Err(ProxyError::Io(err)),
                Err(_would_block) => continue,
            }
        }
    }

    fn write_plain(&self, raw: RawFd, payload: &[u8], fds: &[OwnedFd]) -> ProxyResult<()> {
        if !fds.is_empty() {
            return Err(ProxyError::Unsupported);
        }
        let mut offset = 0;
        while offset < payload.len() {
            match write_bytes(raw, &payload[offset..]) {
                Ok(0) => {
                    return Err(ProxyError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "descriptor accepted no bytes",
                    )))
                }
                Ok(n) => offset += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(ProxyError::Io(err)),
            }
        }
        Ok(())
    }

    /// Positional read used to answer a peer pread request. The byte count
    /// is clamped to [`MAX_PREAD_CHUNK`]; a short read is a valid answer.
    pub fn pread(&self, count: u64, offset: u64) -> ProxyResult<Vec<u8>> {
        let len = count.min(MAX_PREAD_CHUNK as u64) as usize;
        let mut buf = vec![0u8; len];
        let raw = self.as_raw_fd();
        loop {
            let n = unsafe {
                libc::pread(
                    raw,
                    buf.as_mut_ptr() as *mut libc::c_void,
                    buf.len(),
                    offset as libc::off_t,
                )
            };
            if n >= 0 {
                buf.truncate(n as usize);
                return Ok(buf);
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(ProxyError::Io(err));
            }
        }
    }

    /// Size in bytes, used to answer a peer fstat request.
    pub fn fstat_size(&self) -> ProxyResult<u64> {
        let st = stat_fd(self.as_raw_fd())?;
        Ok(st.st_size as u64)
    }
}

impl AsRawFd for Stream {
    fn as_raw_fd(&self) -> RawFd {
        match &self.fd {
            StreamFd::Watched(afd) => afd.get_ref().as_raw_fd(),
            StreamFd::Plain(fd) => fd.as_raw_fd(),
        }
    }
}

/// Determines how a descriptor should be proxied, or `None` when only a
/// delegate can say. Write ends of pipes and exotic file types have no
/// generic recipe.
pub fn classify_fd(fd: &OwnedFd) -> ProxyResult<Option<FdKind>> {
    let raw = fd.as_raw_fd();
    let st = stat_fd(raw)?;
    let kind = match st.st_mode & libc::S_IFMT {
        libc::S_IFSOCK => match socket_type(raw)? {
            libc::SOCK_STREAM => Some(FdKind::SocketStream),
            libc::SOCK_SEQPACKET => Some(FdKind::Socket),
            _ => None,
        },
        libc::S_IFIFO => {
            let flags = get_status_flags(raw)?;
            if flags & libc::O_ACCMODE == libc::O_RDONLY {
                Some(FdKind::FifoRead)
            } else {
                None
            }
        }
        libc::S_IFREG => Some(FdKind::RegularFile),
        _ => None,
    };
    Ok(kind)
}

/// Fresh socketpair for mirroring a transferred socket: one end goes to the
/// registry, the other to the local recipient.
pub fn socket_pair(kind: FdKind) -> ProxyResult<(OwnedFd, OwnedFd)> {
    let ty = match kind {
        FdKind::Socket => SockType::SeqPacket,
        FdKind::SocketStream => SockType::Stream,
        _ => return Err(ProxyError::Unsupported),
    };
    let (a, b) = socketpair(
        AddressFamily::Unix,
        ty,
        None,
        SockFlag::SOCK_NONBLOCK | SockFlag::SOCK_CLOEXEC,
    )?;
    Ok((a, b))
}

/// Fresh pipe for mirroring a transferred pipe read end. Returns
/// `(read_end, write_end)`; the write end goes to the registry and the read
/// end to the local recipient.
pub fn fifo_pair() -> ProxyResult<(OwnedFd, OwnedFd)> {
    let (read_end, write_end) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)?;
    Ok((read_end, write_end))
}

/// Connects to a local unix stream socket on behalf of the peer.
pub fn connect_unix_socket(path: &Path) -> io::Result<OwnedFd> {
    let stream = std::os::unix::net::UnixStream::connect(path)?;
    stream.set_nonblocking(true)?;
    Ok(stream.into())
}

fn set_nonblocking(raw: RawFd) -> io::Result<()> {
    let flags = get_status_flags(raw)?;
    if flags & libc::O_NONBLOCK == 0 {
        let rc = unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

fn get_status_flags(raw: RawFd) -> io::Result<libc::c_int> {
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(flags)
}

fn stat_fd(raw: RawFd) -> io::Result<libc::stat> {
    let mut st = unsafe { std::mem::zeroed::<libc::stat>() };
    if unsafe { libc::fstat(raw, &mut st) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(st)
}

fn socket_type(raw: RawFd) -> io::Result<libc::c_int> {
    let mut ty: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            raw,
            libc::SOL_SOCKET,
            libc::SO_TYPE,
            &mut ty as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(ty)
}

fn read_bytes(raw: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::read(raw, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn write_bytes(raw: RawFd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe { libc::write(raw, buf.as_ptr() as *const libc::c_void, buf.len()) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn send_with_fds(raw: RawFd, chunk: &[u8], fds: &[OwnedFd]) -> io::Result<usize> {
    if fds.len() > MAX_TRANSFER_FDS {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "too many descriptors in one message",
        ));
    }
    let mut iov = libc::iovec {
        iov_base: chunk.as_ptr() as *mut libc::c_void,
        iov_len: chunk.len(),
    };
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    let rights_len = fds.len() * std::mem::size_of::<RawFd>();
    let cmsg_space = if fds.is_empty() {
        0
    } else {
        unsafe { libc::CMSG_SPACE(rights_len as libc::c_uint) as usize }
    };
    let mut cmsg_buf = vec![0u8; cmsg_space];
    if !fds.is_empty() {
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = cmsg_buf.len() as _;
        let cmsg = unsafe { libc::CMSG_FIRSTHDR(&msg) };
        if cmsg.is_null() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "no room for control message header",
            ));
        }
        unsafe {
            (*cmsg).cmsg_len = libc::CMSG_LEN(rights_len as libc::c_uint) as _;
            (*cmsg).cmsg_level = libc::SOL_SOCKET;
            (*cmsg).cmsg_type = libc::SCM_RIGHTS;
            let data = libc::CMSG_DATA(cmsg) as *mut RawFd;
            for (i, fd) in fds.iter().enumerate() {
                std::ptr::write_unaligned(data.add(i), fd.as_raw_fd());
            }
        }
    }

    let n = unsafe { libc::sendmsg(raw, &msg, libc::MSG_NOSIGNAL) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn recv_with_fds(raw: RawFd) -> io::Result<ReadOutcome> {
    let mut buf = vec![0u8; DATA_CHUNK_SIZE];
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let cmsg_space = unsafe {
        libc::CMSG_SPACE((MAX_TRANSFER_FDS * std::mem::size_of::<RawFd>()) as libc::c_uint) as usize
    };
    let mut cmsg_buf = vec![0u8; cmsg_space];
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = cmsg_buf.len() as _;

    let n = unsafe { libc::recvmsg(raw, &mut msg, libc::MSG_CMSG_CLOEXEC) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    let fds = collect_rights(&msg);
    if msg.msg_flags & libc::MSG_CTRUNC != 0 {
        // Already-received descriptors are dropped (closed) with the error.
        return Err(io::Error::new(
            io::ErrorKind::Other,
            "control data truncated, descriptors lost",
        ));
    }
    let n = n as usize;
    if n == 0 && fds.is_empty() {
        return Ok(ReadOutcome::Eof);
    }
    buf.truncate(n);
    Ok(ReadOutcome::Data { payload: buf, fds })
}

fn collect_rights(msg: &libc::msghdr) -> Vec<OwnedFd> {
    let mut fds = Vec::new();
    let mut cmsg = unsafe { libc::CMSG_FIRSTHDR(msg) };
    while !cmsg.is_null() {
        let (level, ty, len) = unsafe { ((*cmsg).cmsg_level, (*cmsg).cmsg_type, (*cmsg).cmsg_len) };
        if level == libc::SOL_SOCKET && ty == libc::SCM_RIGHTS {
            let header = unsafe { libc::CMSG_LEN(0) } as usize;
            let count = (len as usize).saturating_sub(header) / std::mem::size_of::<RawFd>();
            let data = unsafe { libc::CMSG_DATA(cmsg) } as *const RawFd;
            for i in 0..count {
                let raw = unsafe { std::ptr::read_unaligned(data.add(i)) };
                fds.push(unsafe { OwnedFd::from_raw_fd(raw) });
            }
        }
        cmsg = unsafe { libc::CMSG_NXTHDR(msg, cmsg) };
    }
    fds
}
