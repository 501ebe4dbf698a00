//! The per-worker dispatcher: an edge-triggered event loop owning a
//! slab of connections. All pipeline processing for a connection runs
//! on its dispatcher; the 1 Hz maintenance pass handles timeouts,
//! delayed admissions, WebSocket pings and session pruning.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use libc::c_int;

use crate::conn::Conn;
use crate::context::Http;
use crate::endpoint::Endpoint;
use crate::error::HttpResult;
use crate::filters::websocket;
use crate::http::status_message;
use crate::socket::TcpSocket;
use crate::syscalls::{self, EPOLLIN, EPOLLOUT, Poller, epoll_event};

const LISTEN_TOKEN: u64 = u64::MAX;

struct Slot {
    conn: Box<Conn>,
    fd: c_int,
    writable_armed: bool,
}

/// A connection admitted from a delayed address, parked until its
/// release time.
struct DelayedAccept {
    release: Instant,
    fd: c_int,
    peer: Option<SocketAddr>,
}

pub struct Worker {
    id: usize,
    http: Arc<Http>,
    endpoint: Arc<Endpoint>,
    listen_fd: c_int,
    slots: Vec<Option<Slot>>,
    free: Vec<usize>,
    delayed: Vec<DelayedAccept>,
}

impl Worker {
    pub fn new(id: usize, http: Arc<Http>, endpoint: Arc<Endpoint>, listen_fd: c_int) -> Worker {
        Worker {
            id,
            http,
            endpoint,
            listen_fd,
            slots: Vec::new(),
            free: Vec::new(),
            delayed: Vec::new(),
        }
    }

    pub fn run(&mut self, shutdown: Arc<AtomicBool>) -> HttpResult<()> {
        let poller = Poller::new()?;
        poller.add(self.listen_fd, LISTEN_TOKEN, EPOLLIN)?;
        let mut events = vec![epoll_event { events: 0, u64: 0 }; 1024];
        let mut last_tick = Instant::now();
        tracing::debug!(worker = self.id, addr = %self.endpoint.addr(), "dispatcher running");

        loop {
            let draining = shutdown.load(Ordering::Acquire);
            let timeout = if draining { 100 } else { 1000 };
            let n = poller.wait(&mut events, timeout)?;
            let now = Instant::now();

            for event in events.iter().take(n) {
                let token = event.u64;
                let readable = (event.events & EPOLLIN as u32) != 0;
                let writable = (event.events & EPOLLOUT as u32) != 0;
                if token == LISTEN_TOKEN {
                    if !draining {
                        self.accept_ready(&poller, now);
                    }
                    continue;
                }
                self.drive(&poller, token as usize, readable, writable);
            }

            if now.duration_since(last_tick) >= Duration::from_secs(1) {
                self.maintenance(&poller, now);
                last_tick = now;
            }

            if draining && self.active() == 0 {
                break;
            }
        }

        tracing::debug!(worker = self.id, "dispatcher drained");
        self.teardown();
        Ok(())
    }

    fn active(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Drain the accept queue, vetting each address against ban and
    /// delay state.
    fn accept_ready(&mut self, poller: &Poller, now: Instant) {
        loop {
            let accepted = match syscalls::accept(self.listen_fd) {
                Ok(Some(accepted)) => accepted,
                Ok(None) => break,
                Err(_) => break,
            };
            let (fd, peer) = accepted;
            if let Some(ip) = peer.map(|p| p.ip()) {
                if let Some((status, message)) = self.http.monitor.banned(ip) {
                    refuse(fd, status, &message);
                    self.http
                        .trace()
                        .event("conn.banned", 2, &[("ip", &ip.to_string())]);
                    continue;
                }
                if let Some(delay) = self.http.monitor.delay(ip) {
                    self.delayed.push(DelayedAccept {
                        release: now + delay,
                        fd,
                        peer,
                    });
                    continue;
                }
            }
            self.admit(poller, fd, peer);
        }
    }

    fn admit(&mut self, poller: &Poller, fd: c_int, peer: Option<SocketAddr>) {
        if self.active() >= self.http.limits().connections_max {
            syscalls::close(fd);
            return;
        }
        let socket = TcpSocket::new(fd, peer);
        let mut conn = Box::new(Conn::accept(self.http.clone(), Box::new(socket)));
        conn.endpoint = Some(self.endpoint.clone());
        conn.secure = self.endpoint.is_secure();
        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        if poller.add(fd, idx as u64, EPOLLIN).is_err() {
            conn.abort();
            self.free.push(idx);
            return;
        }
        self.http.trace().event(
            "conn.accept",
            4,
            &[("ip", &peer.map(|p| p.ip().to_string()).unwrap_or_default())],
        );
        self.slots[idx] = Some(Slot { conn, fd, writable_armed: false });
    }

    /// Run one connection's event and settle its registration state.
    fn drive(&mut self, poller: &Poller, idx: usize, readable: bool, writable: bool) {
        let Some(slot) = self.slots.get_mut(idx).and_then(|s| s.as_mut()) else {
            return;
        };
        slot.conn.io_event(readable, writable);

        if slot.conn.closed {
            let _ = poller.delete(slot.fd);
            self.slots[idx] = None;
            self.free.push(idx);
            return;
        }
        if slot.conn.wants_writable && !slot.writable_armed {
            if poller.modify(slot.fd, idx as u64, EPOLLIN | EPOLLOUT).is_ok() {
                slot.writable_armed = true;
            }
            slot.conn.wants_writable = false;
        } else if slot.writable_armed && !slot.conn.tx.write_blocked {
            if poller.modify(slot.fd, idx as u64, EPOLLIN).is_ok() {
                slot.writable_armed = false;
            }
        }
    }

    /// 1 Hz pass: timeouts, delayed admissions, pings, session prune.
    fn maintenance(&mut self, poller: &Poller, now: Instant) {
        for idx in 0..self.slots.len() {
            let Some(slot) = self.slots[idx].as_mut() else { continue };
            websocket::maybe_ping(&mut slot.conn, now);
            if slot.conn.check_timeouts(now) || slot.conn.closed {
                let fd = slot.fd;
                let _ = poller.delete(fd);
                self.slots[idx] = None;
                self.free.push(idx);
            }
        }

        let due: Vec<DelayedAccept> = {
            let (due, pending): (Vec<_>, Vec<_>) =
                self.delayed.drain(..).partition(|d| d.release <= now);
            self.delayed = pending;
            due
        };
        for delayed in due {
            self.admit(poller, delayed.fd, delayed.peer);
        }

        self.http.sessions.prune();
    }

    fn teardown(&mut self) {
        for slot in self.slots.iter_mut().filter_map(|s| s.take()) {
            let mut conn = slot.conn;
            conn.close();
        }
        for delayed in self.delayed.drain(..) {
            syscalls::close(delayed.fd);
        }
    }
}

/// Answer a banned client with its configured status, then hang up.
fn refuse(fd: c_int, status: u16, message: &str) {
    let body = if message.is_empty() {
        status_message(status).to_string()
    } else {
        message.to_string()
    };
    let response = format!(
        "HTTP/1.1 {status} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        status_message(status),
        body.len(),
    );
    let _ = syscalls::write(fd, response.as_bytes());
    syscalls::close(fd);
}
