//! The socket abstraction consumed by connections and connectors.
//!
//! The engine never touches an fd directly outside this module: a
//! `Conn` drives whatever implements `Socket`. `TcpSocket` wraps a
//! non-blocking fd from the dispatcher; `MemorySocket` is an in-memory
//! implementation used by the test suites and by embedding hosts that
//! feed the engine from their own transport (TLS terminators, test
//! harnesses).

use std::fs::File;
use std::io;
use std::net::SocketAddr;
use std::os::fd::AsRawFd;

use crate::syscalls;

/// Outcome of a non-blocking transfer.
pub type IoOutcome = io::Result<Option<usize>>;

/// A non-blocking byte stream.
///
/// `Ok(None)` from any transfer means the operation would block and
/// the caller must wait for the next readiness event. `Ok(Some(0))`
/// from `read` is end-of-stream.
pub trait Socket: Send {
    fn read(&mut self, buf: &mut [u8]) -> IoOutcome;

    fn write(&mut self, buf: &[u8]) -> IoOutcome;

    /// Vectored write. The default loops over `write` one buffer at a
    /// time; fd-backed sockets override with a real `writev`.
    fn writev(&mut self, bufs: &[&[u8]]) -> IoOutcome {
        let mut total = 0;
        for buf in bufs {
            match self.write(buf)? {
                Some(n) => {
                    total += n;
                    if n < buf.len() {
                        return Ok(Some(total));
                    }
                }
                None => {
                    if total > 0 {
                        return Ok(Some(total));
                    }
                    return Ok(None);
                }
            }
        }
        Ok(Some(total))
    }

    /// Transmit `len` bytes of `file` starting at `offset`. The default
    /// buffers through userspace; fd-backed sockets use the kernel path.
    fn sendfile(&mut self, file: &mut File, offset: u64, len: usize) -> IoOutcome {
        use std::io::{Read, Seek, SeekFrom};
        let mut buf = vec![0u8; len.min(64 * 1024)];
        file.seek(SeekFrom::Start(offset))?;
        let n = file.read(&mut buf)?;
        if n == 0 {
            return Ok(Some(0));
        }
        self.write(&buf[..n])
    }

    fn peer_addr(&self) -> Option<SocketAddr>;

    fn is_secure(&self) -> bool {
        false
    }

    fn close(&mut self);
}

// ── fd-backed socket ──

/// A non-blocking TCP socket owned by the dispatcher.
pub struct TcpSocket {
    fd: i32,
    peer: Option<SocketAddr>,
    closed: bool,
}

impl TcpSocket {
    pub fn new(fd: i32, peer: Option<SocketAddr>) -> Self {
        Self { fd, peer, closed: false }
    }

    /// Connect to `addr`, returning a socket already switched to
    /// non-blocking mode. Used by the client.
    pub fn connect(addr: SocketAddr) -> io::Result<TcpSocket> {
        let stream = std::net::TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;
        let fd = stream.as_raw_fd();
        std::mem::forget(stream);
        Ok(TcpSocket::new(fd, Some(addr)))
    }

    pub fn fd(&self) -> i32 {
        self.fd
    }
}

impl Socket for TcpSocket {
    fn read(&mut self, buf: &mut [u8]) -> IoOutcome {
        syscalls::read(self.fd, buf)
    }

    fn write(&mut self, buf: &[u8]) -> IoOutcome {
        syscalls::write(self.fd, buf)
    }

    fn writev(&mut self, bufs: &[&[u8]]) -> IoOutcome {
        syscalls::writev(self.fd, bufs)
    }

    fn sendfile(&mut self, file: &mut File, offset: u64, len: usize) -> IoOutcome {
        syscalls::sendfile(self.fd, file.as_raw_fd(), offset, len)
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn close(&mut self) {
        if !self.closed {
            syscalls::close(self.fd);
            self.closed = true;
        }
    }
}

impl Drop for TcpSocket {
    fn drop(&mut self) {
        self.close();
    }
}

// ── in-memory socket ──

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Default)]
struct MemoryShared {
    input: Mutex<Vec<u8>>,
    input_closed: AtomicBool,
    output: Mutex<Vec<u8>>,
    /// Maximum bytes accepted per write call; 0 disables the cap.
    write_cap: AtomicUsize,
    closed: AtomicBool,
}

/// An in-memory `Socket` with scripted input and captured output.
///
/// Reads drain from the shared input buffer; once it is empty, reads
/// report would-block until `close_input` marks EOF. Writes append to
/// the shared output, optionally capped per call to exercise
/// partial-write handling in the connectors. A `MemoryHandle` keeps
/// access to both buffers after the socket moves into a connection.
pub struct MemorySocket {
    shared: Arc<MemoryShared>,
    input_pos: usize,
    peer: Option<SocketAddr>,
    secure: bool,
}

/// The test/driver side of a `MemorySocket`.
#[derive(Clone)]
pub struct MemoryHandle {
    shared: Arc<MemoryShared>,
}

impl MemoryHandle {
    /// Queue more inbound bytes.
    pub fn feed(&self, bytes: &[u8]) {
        self.shared.input.lock().expect("memory socket poisoned").extend_from_slice(bytes);
    }

    /// Mark end-of-stream after the queued input drains.
    pub fn close_input(&self) {
        self.shared.input_closed.store(true, Ordering::Release);
    }

    pub fn output(&self) -> Vec<u8> {
        self.shared.output.lock().expect("memory socket poisoned").clone()
    }

    pub fn take_output(&self) -> Vec<u8> {
        std::mem::take(&mut *self.shared.output.lock().expect("memory socket poisoned"))
    }

    /// Cap bytes accepted per write call (0 removes the cap).
    pub fn set_write_cap(&self, cap: usize) {
        self.shared.write_cap.store(cap, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

impl MemorySocket {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(MemoryShared::default()),
            input_pos: 0,
            peer: "127.0.0.1:40000".parse().ok(),
            secure: false,
        }
    }

    pub fn with_input(input: impl Into<Vec<u8>>) -> Self {
        let sock = Self::new();
        *sock.shared.input.lock().expect("memory socket poisoned") = input.into();
        sock
    }

    pub fn secure(mut self) -> Self {
        self.secure = true;
        self
    }

    pub fn peer(mut self, addr: SocketAddr) -> Self {
        self.peer = Some(addr);
        self
    }

    /// A handle retaining buffer access once the socket is moved into
    /// a connection.
    pub fn handle(&self) -> MemoryHandle {
        MemoryHandle { shared: self.shared.clone() }
    }

    pub fn output(&self) -> Vec<u8> {
        self.handle().output()
    }

    /// See `MemoryHandle::feed`.
    pub fn feed(&self, bytes: &[u8]) {
        self.handle().feed(bytes);
    }

    /// See `MemoryHandle::close_input`.
    pub fn close_input(&self) {
        self.handle().close_input();
    }
}

impl Default for MemorySocket {
    fn default() -> Self {
        Self::new()
    }
}

impl Socket for MemorySocket {
    fn read(&mut self, buf: &mut [u8]) -> IoOutcome {
        let input = self.shared.input.lock().expect("memory socket poisoned");
        let pending = &input[self.input_pos..];
        if pending.is_empty() {
            if self.shared.input_closed.load(Ordering::Acquire) {
                return Ok(Some(0));
            }
            return Ok(None);
        }
        let n = pending.len().min(buf.len());
        buf[..n].copy_from_slice(&pending[..n]);
        self.input_pos += n;
        Ok(Some(n))
    }

    fn write(&mut self, buf: &[u8]) -> IoOutcome {
        let cap = match self.shared.write_cap.load(Ordering::Acquire) {
            0 => usize::MAX,
            cap => cap,
        };
        let n = buf.len().min(cap);
        self.shared
            .output
            .lock()
            .expect("memory socket poisoned")
            .extend_from_slice(&buf[..n]);
        Ok(Some(n))
    }

    fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    fn close(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_socket_reports_would_block_then_eof() {
        let mut sock = MemorySocket::with_input(b"ab".to_vec());
        let mut buf = [0u8; 8];
        assert_eq!(sock.read(&mut buf).unwrap(), Some(2));
        assert_eq!(sock.read(&mut buf).unwrap(), None);
        sock.close_input();
        assert_eq!(sock.read(&mut buf).unwrap(), Some(0));
    }

    #[test]
    fn default_writev_stops_at_partial_write() {
        let mut sock = MemorySocket::new();
        sock.handle().set_write_cap(3);
        let n = sock.writev(&[b"abcd", b"ef"]).unwrap();
        assert_eq!(n, Some(3));
        assert_eq!(sock.output(), b"abc");
    }
}
