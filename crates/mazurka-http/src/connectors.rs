//! Network-end connectors: the vectored-write net connector and the
//! sendfile fast path.
//!
//! Both render the response header block into the header packet's
//! prefix on first service, then trim the packet chain by the bytes the
//! socket actually accepted. On would-block they mark the transmitter
//! write-blocked so the dispatcher registers for writability.

use std::io::{Read, Seek, SeekFrom};

use arrayvec::ArrayVec;

use crate::conn::Conn;
use crate::error::{HttpError, HttpResult};
use crate::packet::PacketTag;
use crate::queue::QueueId;
use crate::stage::{Dir, Stage, StageKind};
use crate::syscalls::IOVEC_MAX;

pub struct NetConnector;

pub struct SendConnector;

impl Stage for NetConnector {
    fn name(&self) -> &'static str {
        "net"
    }

    fn kind(&self) -> StageKind {
        StageKind::Connector
    }

    fn outgoing_service(&self, conn: &mut Conn, q: QueueId) -> HttpResult<()> {
        service_connector(conn, q, false)
    }
}

impl Stage for SendConnector {
    fn name(&self) -> &'static str {
        "send"
    }

    fn kind(&self) -> StageKind {
        StageKind::Connector
    }

    fn matches(&self, conn: &Conn, _dir: Dir) -> bool {
        !conn.secure
    }

    fn outgoing_service(&self, conn: &mut Conn, q: QueueId) -> HttpResult<()> {
        service_connector(conn, q, true)
    }
}

fn service_connector(conn: &mut Conn, q: QueueId, sendfile: bool) -> HttpResult<()> {
    if conn.tx.write_blocked || conn.conn_error {
        return Ok(());
    }
    render_headers_into_prefix(conn, q);
    if conn.omit_body() {
        suppress_body(conn, q);
    }

    loop {
        // End markers (and any fully-written packet) carry no bytes;
        // clear them so a bare END still completes the response.
        while conn.pipeline.queues[q]
            .first()
            .map(|p| p.is_consumed())
            .unwrap_or(false)
        {
            conn.pipeline.queues[q].dequeue();
        }

        if !sendfile {
            fill_entity(conn, q)?;
        }

        // Transmit the sendfile region when it reaches the front.
        if sendfile
            && let Some(front) = conn.pipeline.queues[q].first()
            && front.prefix.is_empty()
            && front.content.is_empty()
            && front.entity.is_some()
        {
            let written = transmit_entity(conn, q)?;
            if written == 0 {
                return Ok(());
            }
            continue;
        }

        let written = {
            let queue = &conn.pipeline.queues[q];
            let mut bufs: ArrayVec<&[u8], IOVEC_MAX> = ArrayVec::new();
            for packet in queue.packets.iter() {
                if bufs.len() + 2 > IOVEC_MAX {
                    break;
                }
                if !packet.prefix.is_empty() {
                    bufs.push(&packet.prefix);
                }
                if !packet.content.is_empty() {
                    bufs.push(&packet.content);
                }
                if packet.entity.is_some() {
                    break;
                }
            }
            if bufs.is_empty() {
                None
            } else {
                match conn.socket.writev(&bufs) {
                    Ok(Some(n)) => Some(n),
                    Ok(None) => {
                        conn.tx.write_blocked = true;
                        conn.wants_writable = true;
                        return Ok(());
                    }
                    Err(err) => {
                        return Err(HttpError::Comms(format!("socket write failed: {err}")));
                    }
                }
            }
        };

        match written {
            Some(0) | None => break,
            Some(n) => {
                trim_queue(conn, q, n);
                conn.tx.bytes_written += n as u64;
            }
        }
    }

    finish_if_drained(conn, q);
    conn.resume_upstream_if_drained(q);
    Ok(())
}

/// Render the header block into the header packet's prefix the first
/// time the connector runs. The prefix is framing, so queue counts stay
/// untouched.
fn render_headers_into_prefix(conn: &mut Conn, q: QueueId) {
    if conn.tx.headers_created {
        return;
    }
    let is_header_front = conn.pipeline.queues[q]
        .first()
        .map(|p| p.tag == PacketTag::Header)
        .unwrap_or(false);
    if !is_header_front {
        return;
    }
    let mut block = Vec::new();
    if conn.server_side {
        conn.render_headers(&mut block);
    } else {
        conn.render_request_headers(&mut block);
    }
    if let Some(front) = conn.pipeline.queues[q].packets.front_mut() {
        front.prefix = block;
    }
}

/// HEAD responses keep their headers but drop every body byte,
/// including framing prefixes added by filters.
fn suppress_body(conn: &mut Conn, q: QueueId) {
    let queue = &mut conn.pipeline.queues[q];
    for packet in queue.packets.iter_mut() {
        if packet.tag != PacketTag::Header {
            queue.count -= packet.len();
            packet.prefix.clear();
            packet.content.clear();
            packet.entity = None;
        }
    }
}

/// Read buffered bytes for the front entity packet (net connector
/// path: the file data goes through userspace).
fn fill_entity(conn: &mut Conn, q: QueueId) -> HttpResult<()> {
    let packet_size = conn.pipeline.queues[q].packet_size.max(1024);
    let needs_fill = conn.pipeline.queues[q]
        .first()
        .map(|p| p.content.is_empty() && p.entity.is_some())
        .unwrap_or(false);
    if !needs_fill {
        return Ok(());
    }
    let entity = conn.pipeline.queues[q]
        .first()
        .and_then(|p| p.entity)
        .ok_or_else(|| HttpError::Internal("entity packet disappeared".into()))?;
    let file = conn
        .tx
        .file
        .as_mut()
        .ok_or_else(|| HttpError::Internal("entity packet without an open file".into()))?;
    let take = (entity.size).min(packet_size as u64) as usize;
    let mut buf = vec![0u8; take];
    file.seek(SeekFrom::Start(entity.pos))?;
    let n = file.read(&mut buf)?;
    buf.truncate(n);
    let packet = conn.pipeline.queues[q]
        .packets
        .front_mut()
        .ok_or_else(|| HttpError::Internal("entity packet disappeared".into()))?;
    if n == 0 {
        // File shrank underneath us; truncate the entity.
        let lost = packet.entity.take().map(|e| e.size).unwrap_or(0);
        conn.pipeline.queues[q].count -= lost as usize;
        return Ok(());
    }
    packet.content = buf;
    if let Some(ref mut entity) = packet.entity {
        entity.pos += n as u64;
        entity.size -= n as u64;
        if entity.size == 0 {
            packet.entity = None;
        }
    }
    Ok(())
}

/// Kernel-path transmission of the front entity region.
fn transmit_entity(conn: &mut Conn, q: QueueId) -> HttpResult<usize> {
    let entity = conn.pipeline.queues[q]
        .first()
        .and_then(|p| p.entity)
        .ok_or_else(|| HttpError::Internal("entity packet disappeared".into()))?;
    let file = conn
        .tx
        .file
        .as_mut()
        .ok_or_else(|| HttpError::Internal("entity packet without an open file".into()))?;
    let len = entity.size.min(512 * 1024) as usize;
    match conn.socket.sendfile(file, entity.pos, len) {
        Ok(Some(0)) => {
            // Nothing left in the file; drop the stale region.
            let queue = &mut conn.pipeline.queues[q];
            if let Some(front) = queue.packets.front_mut() {
                let lost = front.entity.take().map(|e| e.size).unwrap_or(0);
                queue.count -= lost as usize;
            }
            Ok(1)
        }
        Ok(Some(n)) => {
            trim_queue(conn, q, n);
            conn.tx.bytes_written += n as u64;
            Ok(n)
        }
        Ok(None) => {
            conn.tx.write_blocked = true;
            conn.wants_writable = true;
            Ok(0)
        }
        Err(err) => Err(HttpError::Comms(format!("sendfile failed: {err}"))),
    }
}

/// Trim `n` written bytes off the front of the connector queue,
/// keeping the count invariant intact and popping consumed packets.
fn trim_queue(conn: &mut Conn, q: QueueId, n: usize) {
    let queue = &mut conn.pipeline.queues[q];
    let mut remaining = n;
    loop {
        let Some(front) = queue.packets.front_mut() else { break };
        let before = front.len();
        remaining = front.consume(remaining);
        let after = front.len();
        queue.count -= before - after;
        if front.is_consumed() {
            queue.packets.pop_front();
            continue;
        }
        if remaining == 0 {
            break;
        }
    }
}

/// Once the queue drains completely after the end-of-stream packet has
/// passed through, the connector side of the response is done.
fn finish_if_drained(conn: &mut Conn, q: QueueId) {
    if conn.tx.finalized_output && conn.pipeline.queues[q].is_drained() && conn.tx_drained() {
        conn.tx.finalized_connector = true;
    }
}
