//! Thin non-blocking syscall wrappers used by the dispatcher and the
//! socket layer. Linux is the primary target; macOS gets a kqueue shim
//! with the same surface so development builds run unchanged.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::ptr;

use libc::{c_int, c_void, socklen_t};

use crate::error::HttpResult;

/// Create a non-blocking listener with SO_REUSEADDR + SO_REUSEPORT so
/// each worker binds its own accept queue. TCP_NODELAY is set on the
/// listener and inherited by accepted sockets.
pub fn listen_socket(addr: &SocketAddr, backlog: i32) -> HttpResult<c_int> {
    let domain = if addr.is_ipv6() { libc::AF_INET6 } else { libc::AF_INET };
    unsafe {
        #[cfg(target_os = "linux")]
        let fd = libc::socket(domain, libc::SOCK_STREAM | libc::SOCK_NONBLOCK, 0);
        #[cfg(not(target_os = "linux"))]
        let fd = libc::socket(domain, libc::SOCK_STREAM, 0);
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        #[cfg(not(target_os = "linux"))]
        set_nonblocking(fd)?;

        let one: c_int = 1;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEPORT,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        );

        bind_addr(fd, addr)?;

        if libc::listen(fd, backlog) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }
        Ok(fd)
    }
}

fn bind_addr(fd: c_int, addr: &SocketAddr) -> HttpResult<()> {
    unsafe {
        let rc = match addr {
            SocketAddr::V4(a) => {
                let mut sin: libc::sockaddr_in = mem::zeroed();
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = a.port().to_be();
                sin.sin_addr = libc::in_addr { s_addr: u32::from_ne_bytes(a.ip().octets()) };
                libc::bind(fd, &sin as *const _ as *const libc::sockaddr, mem::size_of_val(&sin) as socklen_t)
            }
            SocketAddr::V6(a) => {
                let mut sin6: libc::sockaddr_in6 = mem::zeroed();
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = a.port().to_be();
                sin6.sin6_flowinfo = a.flowinfo();
                sin6.sin6_addr = libc::in6_addr { s6_addr: a.ip().octets() };
                sin6.sin6_scope_id = a.scope_id();
                libc::bind(fd, &sin6 as *const _ as *const libc::sockaddr, mem::size_of_val(&sin6) as socklen_t)
            }
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
fn set_nonblocking(fd: c_int) -> HttpResult<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }
    }
    Ok(())
}

/// Accept one pending connection, returning the peer address alongside
/// the fd. `None` when the accept queue is drained.
pub fn accept(listen_fd: c_int) -> HttpResult<Option<(c_int, Option<SocketAddr>)>> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        #[cfg(target_os = "linux")]
        let fd = libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK,
        );
        #[cfg(not(target_os = "linux"))]
        let fd = libc::accept(listen_fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len);

        if fd < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err.into());
        }
        #[cfg(not(target_os = "linux"))]
        set_nonblocking(fd)?;
        Ok(Some((fd, sockaddr_to_addr(&storage, len as usize))))
    }
}

fn sockaddr_to_addr(storage: &libc::sockaddr_storage, _len: usize) -> Option<SocketAddr> {
    unsafe {
        match storage.ss_family as c_int {
            libc::AF_INET => {
                let sin = &*(storage as *const _ as *const libc::sockaddr_in);
                let ip = std::net::Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes());
                Some(SocketAddr::new(ip.into(), u16::from_be(sin.sin_port)))
            }
            libc::AF_INET6 => {
                let sin6 = &*(storage as *const _ as *const libc::sockaddr_in6);
                let ip = std::net::Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                Some(SocketAddr::new(ip.into(), u16::from_be(sin6.sin6_port)))
            }
            _ => None,
        }
    }
}

/// Read into `buf`. `Ok(None)` means the socket would block; `Ok(Some(0))`
/// is EOF.
pub fn read(fd: c_int, buf: &mut [u8]) -> io::Result<Option<usize>> {
    unsafe {
        let rc = libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }
        Ok(Some(rc as usize))
    }
}

pub fn write(fd: c_int, buf: &[u8]) -> io::Result<Option<usize>> {
    unsafe {
        let rc = libc::write(fd, buf.as_ptr() as *const c_void, buf.len());
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }
        Ok(Some(rc as usize))
    }
}

pub const IOVEC_MAX: usize = 16;

/// Scatter-gather write of up to `IOVEC_MAX` buffers in one syscall.
pub fn writev(fd: c_int, bufs: &[&[u8]]) -> io::Result<Option<usize>> {
    if bufs.is_empty() {
        return Ok(Some(0));
    }
    let mut iovecs: [libc::iovec; IOVEC_MAX] = unsafe { mem::zeroed() };
    let count = bufs.len().min(IOVEC_MAX);
    for (i, buf) in bufs.iter().take(count).enumerate() {
        iovecs[i] = libc::iovec {
            iov_base: buf.as_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
    }
    unsafe {
        let rc = libc::writev(fd, iovecs.as_ptr(), count as c_int);
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }
        Ok(Some(rc as usize))
    }
}

/// Zero-copy file transmission. Falls back to `Err(ENOSYS)` semantics on
/// platforms without a usable sendfile; callers then read + write.
#[cfg(target_os = "linux")]
pub fn sendfile(out_fd: c_int, in_fd: c_int, offset: u64, len: usize) -> io::Result<Option<usize>> {
    unsafe {
        let mut off = offset as libc::off_t;
        let rc = libc::sendfile(out_fd, in_fd, &mut off, len);
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err);
        }
        Ok(Some(rc as usize))
    }
}

#[cfg(target_os = "macos")]
pub fn sendfile(out_fd: c_int, in_fd: c_int, offset: u64, len: usize) -> io::Result<Option<usize>> {
    unsafe {
        let mut sent = len as libc::off_t;
        let rc = libc::sendfile(in_fd, out_fd, offset as libc::off_t, &mut sent, ptr::null_mut(), 0);
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                if sent > 0 {
                    return Ok(Some(sent as usize));
                }
                return Ok(None);
            }
            return Err(err);
        }
        Ok(Some(sent as usize))
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn sendfile(_out_fd: c_int, _in_fd: c_int, _offset: u64, _len: usize) -> io::Result<Option<usize>> {
    Err(io::Error::from_raw_os_error(libc::ENOSYS))
}

pub fn close(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

// ── Event polling ──

#[cfg(target_os = "linux")]
pub use linux_poll::*;

#[cfg(target_os = "linux")]
mod linux_poll {
    use super::*;
    pub use libc::{EPOLLIN, EPOLLOUT, epoll_event};
    use libc::EPOLLET;

    /// Edge-triggered epoll wrapper.
    pub struct Poller {
        fd: c_int,
    }

    impl Poller {
        pub fn new() -> HttpResult<Self> {
            unsafe {
                let fd = libc::epoll_create1(0);
                if fd < 0 {
                    return Err(io::Error::last_os_error().into());
                }
                Ok(Self { fd })
            }
        }

        pub fn add(&self, fd: c_int, token: u64, interests: i32) -> HttpResult<()> {
            self.ctl(libc::EPOLL_CTL_ADD, fd, token, interests)
        }

        pub fn modify(&self, fd: c_int, token: u64, interests: i32) -> HttpResult<()> {
            self.ctl(libc::EPOLL_CTL_MOD, fd, token, interests)
        }

        fn ctl(&self, op: c_int, fd: c_int, token: u64, interests: i32) -> HttpResult<()> {
            let mut event = epoll_event {
                events: (interests | EPOLLET) as u32,
                u64: token,
            };
            unsafe {
                if libc::epoll_ctl(self.fd, op, fd, &mut event) < 0 {
                    return Err(io::Error::last_os_error().into());
                }
            }
            Ok(())
        }

        pub fn delete(&self, fd: c_int) -> HttpResult<()> {
            unsafe {
                if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() != Some(libc::ENOENT) {
                        return Err(err.into());
                    }
                }
            }
            Ok(())
        }

        pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> HttpResult<usize> {
            unsafe {
                let rc = libc::epoll_wait(self.fd, events.as_mut_ptr(), events.len() as c_int, timeout_ms);
                if rc < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        return Ok(0);
                    }
                    return Err(err.into());
                }
                Ok(rc as usize)
            }
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use kqueue_poll::*;

#[cfg(not(target_os = "linux"))]
mod kqueue_poll {
    use super::*;
    use libc::{EV_ADD, EV_CLEAR, EV_DELETE, EV_ENABLE, EVFILT_READ, EVFILT_WRITE, kevent, kqueue, timespec};

    #[allow(non_camel_case_types)]
    #[derive(Clone, Copy)]
    pub struct epoll_event {
        pub events: u32,
        pub u64: u64,
    }

    pub const EPOLLIN: i32 = 1;
    pub const EPOLLOUT: i32 = 4;

    /// kqueue shim presenting the epoll surface used by the dispatcher.
    pub struct Poller {
        fd: c_int,
    }

    impl Poller {
        pub fn new() -> HttpResult<Self> {
            unsafe {
                let fd = kqueue();
                if fd < 0 {
                    return Err(io::Error::last_os_error().into());
                }
                Ok(Self { fd })
            }
        }

        pub fn add(&self, fd: c_int, token: u64, interests: i32) -> HttpResult<()> {
            self.change(fd, token, interests, EV_ADD | EV_ENABLE | EV_CLEAR)
        }

        pub fn modify(&self, fd: c_int, token: u64, interests: i32) -> HttpResult<()> {
            self.change(fd, token, interests, EV_ADD | EV_ENABLE | EV_CLEAR)
        }

        pub fn delete(&self, fd: c_int) -> HttpResult<()> {
            self.change(fd, 0, EPOLLIN | EPOLLOUT, EV_DELETE)
        }

        fn change(&self, fd: c_int, token: u64, interests: i32, action: u16) -> HttpResult<()> {
            let mut changes = [unsafe { mem::zeroed::<kevent>() }; 2];
            let mut n = 0;
            if (interests & EPOLLIN) != 0 || action == EV_DELETE {
                changes[n] = kevent {
                    ident: fd as usize,
                    filter: EVFILT_READ,
                    flags: action,
                    fflags: 0,
                    data: 0,
                    udata: token as *mut c_void,
                };
                n += 1;
            }
            if (interests & EPOLLOUT) != 0 || action == EV_DELETE {
                changes[n] = kevent {
                    ident: fd as usize,
                    filter: EVFILT_WRITE,
                    flags: action,
                    fflags: 0,
                    data: 0,
                    udata: token as *mut c_void,
                };
                n += 1;
            }
            unsafe {
                let rc = libc::kevent(self.fd, changes.as_ptr(), n as c_int, ptr::null_mut(), 0, ptr::null());
                if rc < 0 && action != EV_DELETE {
                    return Err(io::Error::last_os_error().into());
                }
            }
            Ok(())
        }

        pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> HttpResult<usize> {
            const BATCH: usize = 128;
            let mut kevents = [unsafe { mem::zeroed::<kevent>() }; BATCH];
            let batch = events.len().min(BATCH);
            let ts = timespec {
                tv_sec: (timeout_ms / 1000) as libc::time_t,
                tv_nsec: ((timeout_ms % 1000) * 1_000_000) as libc::c_long,
            };
            unsafe {
                let rc = libc::kevent(self.fd, ptr::null(), 0, kevents.as_mut_ptr(), batch as c_int, &ts);
                if rc < 0 {
                    let err = io::Error::last_os_error();
                    if err.raw_os_error() == Some(libc::EINTR) {
                        return Ok(0);
                    }
                    return Err(err.into());
                }
                let n = rc as usize;
                for i in 0..n {
                    let mut ev = 0;
                    if kevents[i].filter == EVFILT_READ {
                        ev |= EPOLLIN;
                    }
                    if kevents[i].filter == EVFILT_WRITE {
                        ev |= EPOLLOUT;
                    }
                    events[i] = epoll_event {
                        events: ev as u32,
                        u64: kevents[i].udata as u64,
                    };
                }
                Ok(n)
            }
        }
    }

    impl Drop for Poller {
        fn drop(&mut self) {
            unsafe {
                libc::close(self.fd);
            }
        }
    }
}
