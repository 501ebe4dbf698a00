//! Outgoing chunked transfer encoding.
//!
//! The filter is resident in every non-upgraded TX pipeline and decides
//! at runtime: responses with a known length pass through untouched,
//! unknown-length HTTP/1.1 responses get chunk prefixes and the
//! terminating trailer. (Incoming chunked decoding lives in the Rx
//! parser, not here.)

use crate::conn::Conn;
use crate::error::HttpResult;
use crate::http::Protocol;
use crate::packet::PacketTag;
use crate::queue::QueueId;
use crate::stage::{Dir, Stage, StageKind};

#[derive(Default)]
struct ChunkEncoder {
    decided: bool,
    wrote_chunk: bool,
}

pub struct ChunkFilter;

impl Stage for ChunkFilter {
    fn name(&self) -> &'static str {
        "chunk"
    }

    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    fn matches(&self, conn: &Conn, dir: Dir) -> bool {
        dir == Dir::Tx && !conn.rx.upgrade_websocket
    }

    fn open(&self, conn: &mut Conn, q: QueueId) -> HttpResult<()> {
        conn.queue_mut(q).state = Some(Box::new(ChunkEncoder::default()));
        Ok(())
    }

    fn outgoing_service(&self, conn: &mut Conn, q: QueueId) -> HttpResult<()> {
        decide(conn, q);
        if !conn.tx.chunked {
            return conn.default_outgoing_service(q);
        }
        let chunk_size = conn.limits.chunk_size.min(conn.queue(q).max).max(1);
        while let Some(mut packet) = conn.queue_mut(q).dequeue() {
            // Keep chunks no larger than the configured size.
            if packet.tag == PacketTag::Data && packet.len() > chunk_size {
                let tail = packet.split(chunk_size);
                conn.queue_mut(q).enqueue_front(tail);
            }
            if !conn.will_next_accept(q, &mut packet) {
                conn.queue_mut(q).enqueue_front(packet);
                break;
            }
            match packet.tag {
                PacketTag::Data | PacketTag::Range if packet.len() > 0 => {
                    let first = !wrote_chunk(conn, q);
                    let lead = if first { "" } else { "\r\n" };
                    packet.prefix = {
                        let mut prefix = format!("{lead}{:x}\r\n", packet.len()).into_bytes();
                        prefix.extend_from_slice(&packet.prefix);
                        prefix
                    };
                    set_wrote_chunk(conn, q);
                    conn.put_next(q, packet)?;
                }
                PacketTag::End => {
                    let trailer = if wrote_chunk(conn, q) { "\r\n0\r\n\r\n" } else { "0\r\n\r\n" };
                    packet.prefix = trailer.as_bytes().to_vec();
                    conn.put_next(q, packet)?;
                }
                _ => conn.put_next(q, packet)?,
            }
        }
        conn.resume_upstream_if_drained(q);
        Ok(())
    }
}

/// Claim the response for chunking once, before headers render.
fn decide(conn: &mut Conn, q: QueueId) {
    let already = conn
        .queue_mut(q)
        .state
        .as_mut()
        .and_then(|s| s.downcast_mut::<ChunkEncoder>())
        .map(|s| {
            let was = s.decided;
            s.decided = true;
            was
        })
        .unwrap_or(true);
    if already || conn.tx.headers_created {
        return;
    }
    if conn.tx.length < 0
        && conn.rx.protocol == Protocol::Http11
        && conn.limits.chunk_size > 0
        && !conn.upgraded
    {
        conn.tx.chunked = true;
    }
}

fn wrote_chunk(conn: &mut Conn, q: QueueId) -> bool {
    conn.queue_mut(q)
        .state
        .as_mut()
        .and_then(|s| s.downcast_mut::<ChunkEncoder>())
        .map(|s| s.wrote_chunk)
        .unwrap_or(false)
}

fn set_wrote_chunk(conn: &mut Conn, q: QueueId) {
    if let Some(state) = conn
        .queue_mut(q)
        .state
        .as_mut()
        .and_then(|s| s.downcast_mut::<ChunkEncoder>())
    {
        state.wrote_chunk = true;
    }
}
