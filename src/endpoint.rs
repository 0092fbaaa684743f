use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr};
use std::os::unix::io::{AsRawFd, RawFd};

use log::*;
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::DEFAULT_BUFFER_SIZE;
use crate::error::{Error, Result};

/// Outcome of one non-blocking receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// bytes appended to the buffer (0 when the buffer was already full)
    Bytes(usize),
    /// nothing to read yet; not an error
    WouldBlock,
    /// orderly peer shutdown
    Closed,
}

/// A non-blocking socket endpoint owning a fixed-capacity read buffer.
///
/// The buffer holds bytes received from this endpoint's socket that have not
/// yet been relayed to the paired endpoint. `pending` holds synthesized bytes
/// (rewritten commands) awaiting write to this endpoint's socket; it is
/// flushed before any relayed bytes so per-direction ordering is preserved.
#[derive(Debug)]
pub struct Endpoint {
    sock: Option<Socket>,
    fd: RawFd,
    addr: SocketAddr,
    buf: Box<[u8]>,
    used: usize,
    pending: Vec<u8>,
    listening: bool,
}

fn effective_size(buffer_size: usize) -> usize {
    if buffer_size == 0 {
        DEFAULT_BUFFER_SIZE
    } else {
        buffer_size
    }
}

impl Endpoint {
    fn new(sock: Socket, addr: SocketAddr, buffer_size: usize, listening: bool) -> Result<Self> {
        sock.set_nonblocking(true).map_err(Error::NonBlocking)?;
        let fd = sock.as_raw_fd();
        Ok(Self {
            sock: Some(sock),
            fd,
            addr,
            buf: vec![0u8; effective_size(buffer_size)].into_boxed_slice(),
            used: 0,
            pending: Vec::new(),
            listening,
        })
    }

    fn socket_for(addr: &SocketAddr) -> Result<Socket> {
        let domain = match addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        Socket::new(domain, Type::STREAM, Some(Protocol::TCP)).map_err(Error::SocketOption)
    }

    /// Active-connect mode: begin a non-blocking connect toward `addr`.
    ///
    /// `EINPROGRESS` is the expected outcome; the socket becomes writable
    /// once the connection is established.
    pub fn connect(addr: SocketAddr, buffer_size: usize) -> Result<Self> {
        let sock = Self::socket_for(&addr)?;
        sock.set_nonblocking(true).map_err(Error::NonBlocking)?;
        match sock.connect(&addr.into()) {
            Ok(()) => {}
            Err(err)
                if err.raw_os_error() == Some(libc::EINPROGRESS)
                    || err.kind() == io::ErrorKind::WouldBlock => {}
            Err(err) => return Err(Error::connect(addr, err)),
        }
        Self::new(sock, addr, buffer_size, false)
    }

    /// Passive-listen mode: bind and listen on `addr`.
    pub fn listen(addr: SocketAddr, backlog: i32, buffer_size: usize) -> Result<Self> {
        let sock = Self::socket_for(&addr)?;
        sock.set_reuse_address(true).map_err(Error::SocketOption)?;
        sock.bind(&addr.into())
            .map_err(|err| Error::bind_listen(addr, err))?;
        sock.listen(backlog.max(0))
            .map_err(|err| Error::bind_listen(addr, err))?;
        let local = sock
            .local_addr()
            .ok()
            .and_then(|a| a.as_socket())
            .unwrap_or(addr);
        Self::new(sock, local, buffer_size, true)
    }

    /// Accept one pending connection from a listening endpoint.
    ///
    /// `Ok(None)` means no connection is ready, which is not an error.
    pub fn accept_from(listener: &Endpoint, buffer_size: usize) -> Result<Option<Self>> {
        let sock = listener.sock.as_ref().ok_or(Error::Closed)?;
        match sock.accept() {
            Ok((accepted, peer)) => {
                let peer = peer
                    .as_socket()
                    .ok_or_else(|| Error::SocketOption(io::ErrorKind::InvalidInput.into()))?;
                let ep = Self::new(accepted, peer, buffer_size, false)?;
                trace!("accepted fd {} from {}", ep.fd, peer);
                Ok(Some(ep))
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    pub fn handle(&self) -> RawFd {
        self.fd
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Local address of the underlying socket (the bound address for
    /// listeners, including a kernel-assigned ephemeral port).
    pub fn local_addr(&self) -> Result<SocketAddr> {
        let sock = self.sock.as_ref().ok_or(Error::Closed)?;
        sock.local_addr()?
            .as_socket()
            .ok_or_else(|| Error::SocketOption(io::ErrorKind::InvalidInput.into()))
    }

    pub fn is_listening(&self) -> bool {
        self.listening
    }

    pub fn is_closed(&self) -> bool {
        self.sock.is_none()
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buf[..self.used]
    }

    pub fn buffer_is_full(&self) -> bool {
        self.used == self.buf.len()
    }

    /// Drop the first `n` buffered bytes, shifting the remainder down.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.used);
        self.buf.copy_within(n..self.used, 0);
        self.used -= n;
    }

    /// Non-blocking receive appending to the buffer, up to remaining
    /// capacity. Never blocks; a full buffer reads zero bytes and defers to
    /// the next readiness notification (back-pressure, input is not dropped).
    pub fn read_into_buffer(&mut self) -> Result<ReadOutcome> {
        let sock = self.sock.as_mut().ok_or(Error::Closed)?;
        if self.used == self.buf.len() {
            return Ok(ReadOutcome::Bytes(0));
        }
        match sock.read(&mut self.buf[self.used..]) {
            Ok(0) => Ok(ReadOutcome::Closed),
            Ok(n) => {
                self.used += n;
                debug_assert!(self.used <= self.buf.len());
                Ok(ReadOutcome::Bytes(n))
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(ReadOutcome::WouldBlock),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(ReadOutcome::WouldBlock),
            Err(err) => Err(err.into()),
        }
    }

    /// Non-blocking send of `bytes` to this endpoint's socket.
    /// Returns the number written; would-block counts as zero.
    fn send(&mut self, bytes: &[u8]) -> Result<usize> {
        let sock = self.sock.as_mut().ok_or(Error::Closed)?;
        match sock.write(bytes) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => Ok(0),
            Err(err) => Err(err.into()),
        }
    }

    /// Send up to `n` of self's buffered bytes into `dst`'s socket.
    /// Partial writes consume only what was sent; the remainder stays
    /// buffered for the next write-readiness notification.
    pub fn write_from_buffer(&mut self, dst: &mut Endpoint, n: usize) -> Result<usize> {
        let n = n.min(self.used);
        if n == 0 {
            return Ok(0);
        }
        let written = dst.send(&self.buf[..n])?;
        self.consume(written);
        Ok(written)
    }

    /// Queue synthesized bytes for this endpoint's socket.
    pub fn queue(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Flush queued synthesized bytes; returns true once the queue is empty.
    pub fn flush_pending(&mut self) -> Result<bool> {
        if self.pending.is_empty() {
            return Ok(true);
        }
        let pending = std::mem::take(&mut self.pending);
        let written = self.send(&pending)?;
        if written < pending.len() {
            self.pending.extend_from_slice(&pending[written..]);
        }
        Ok(self.pending.is_empty())
    }

    /// Detached endpoint with a fabricated handle, for registry tests that
    /// need overlapping fds without real sockets.
    #[cfg(test)]
    pub(crate) fn stub(fd: RawFd) -> Self {
        Self {
            sock: None,
            fd,
            addr: "0.0.0.0:0".parse().expect("static addr"),
            buf: Box::new([]),
            used: 0,
            pending: Vec::new(),
            listening: false,
        }
    }

    /// Shut down both directions and close the descriptor, releasing the
    /// buffer. Safe to call more than once.
    pub fn close(&mut self) {
        if let Some(sock) = self.sock.take() {
            sock.shutdown(Shutdown::Both).ok();
            trace!("closed fd {} ({})", self.fd, self.addr);
            // descriptor is closed when `sock` drops here
        }
        self.buf = Box::new([]);
        self.used = 0;
        self.pending = Vec::new();
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        self.close();
    }
}
