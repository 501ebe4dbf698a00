//! Ranged 206 responses.
//!
//! The handler resolves the requested ranges against the entity length
//! and stores them on the transmitter; this filter then slices the
//! passing entity stream into the requested windows, adding multipart
//! boundaries when more than one range was asked for.

use rand::Rng;

use crate::conn::Conn;
use crate::error::HttpResult;
use crate::packet::{Packet, PacketTag};
use crate::queue::QueueId;
use crate::rx::ResolvedRange;
use crate::stage::{Dir, Stage, StageKind};

#[derive(Default)]
struct RangeState {
    /// Entity bytes seen so far across all packets.
    seen: u64,
    /// Ranges whose part header has been emitted.
    started: Vec<bool>,
}

pub struct RangeFilter;

impl Stage for RangeFilter {
    fn name(&self) -> &'static str {
        "range"
    }

    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    fn matches(&self, conn: &Conn, dir: Dir) -> bool {
        dir == Dir::Tx && !conn.rx.ranges.is_empty()
    }

    /// The handler's open ran first and resolved the ranges; settle the
    /// response shape here.
    fn open(&self, conn: &mut Conn, q: QueueId) -> HttpResult<()> {
        if conn.tx.output_ranges.is_empty() || conn.tx.status != 200 {
            return Ok(());
        }
        let total = conn.tx.entity_length;
        let ranges = conn.tx.output_ranges.clone();
        conn.tx.status = 206;
        if ranges.len() == 1 {
            let range = ranges[0];
            conn.tx.headers.set(
                "Content-Range",
                format!("bytes {}-{}/{}", range.offset, range.end() - 1, total),
            );
            conn.tx.length = range.len as i64;
        } else {
            let boundary = make_boundary();
            conn.tx.length = multipart_length(&ranges, total, &boundary) as i64;
            conn.tx.range_boundary = Some(boundary.clone());
            conn.tx.mime_type = Some(format!("multipart/byteranges; boundary={boundary}"));
        }
        conn.queue_mut(q).state = Some(Box::new(RangeState {
            seen: 0,
            started: vec![false; ranges.len()],
        }));
        Ok(())
    }

    fn outgoing_service(&self, conn: &mut Conn, q: QueueId) -> HttpResult<()> {
        if conn.tx.output_ranges.is_empty() || conn.queue(q).state.is_none() {
            return conn.default_outgoing_service(q);
        }
        let ranges = conn.tx.output_ranges.clone();
        let total = conn.tx.entity_length;
        let boundary = conn.tx.range_boundary.clone();
        while let Some(mut packet) = conn.queue_mut(q).dequeue() {
            if !conn.will_next_accept(q, &mut packet) {
                conn.queue_mut(q).enqueue_front(packet);
                break;
            }
            match packet.tag {
                PacketTag::Data => {
                    let len = packet.len() as u64;
                    let seen = state_seen(conn, q);
                    for (idx, range) in ranges.iter().enumerate() {
                        let ov_start = seen.max(range.offset);
                        let ov_end = (seen + len).min(range.end());
                        if ov_start >= ov_end {
                            continue;
                        }
                        let mut slice = slice_packet(&packet, ov_start - seen, ov_end - ov_start);
                        if let Some(ref boundary) = boundary
                            && ov_start == range.offset
                            && !state_started(conn, q, idx)
                        {
                            let lead = if first_part(conn, q) { "" } else { "\r\n" };
                            slice.prefix = format!(
                                "{lead}--{boundary}\r\nContent-Range: bytes {}-{}/{}\r\n\r\n",
                                range.offset,
                                range.end() - 1,
                                total
                            )
                            .into_bytes();
                            mark_started(conn, q, idx);
                        }
                        conn.put_next(q, slice)?;
                    }
                    add_seen(conn, q, len);
                }
                PacketTag::End => {
                    if let Some(ref boundary) = boundary {
                        let mut closing =
                            Packet::data(format!("\r\n--{boundary}--\r\n").into_bytes());
                        closing.tag = PacketTag::Range;
                        conn.put_next(q, closing)?;
                    }
                    conn.put_next(q, packet)?;
                }
                _ => conn.put_next(q, packet)?,
            }
        }
        conn.resume_upstream_if_drained(q);
        Ok(())
    }
}

/// Project a window out of a data packet, preserving the entity-region
/// representation when the source is lazy.
fn slice_packet(packet: &Packet, offset: u64, len: u64) -> Packet {
    if let Some(entity) = packet.entity {
        Packet::entity(entity.pos + offset, len)
    } else {
        let start = offset as usize;
        let end = (offset + len) as usize;
        Packet::data(packet.content[start..end].to_vec())
    }
}

/// Exact length of the multipart/byteranges body, so the response
/// carries a Content-Length instead of chunking.
fn multipart_length(ranges: &[ResolvedRange], total: u64, boundary: &str) -> u64 {
    let mut length = 0u64;
    for (idx, range) in ranges.iter().enumerate() {
        let lead = if idx == 0 { 0 } else { 2 };
        let header = format!(
            "--{boundary}\r\nContent-Range: bytes {}-{}/{}\r\n\r\n",
            range.offset,
            range.end() - 1,
            total
        );
        length += lead + header.len() as u64 + range.len;
    }
    length + format!("\r\n--{boundary}--\r\n").len() as u64
}

fn make_boundary() -> String {
    let token: u64 = rand::thread_rng().r#gen();
    format!("{token:016x}")
}

fn state_seen(conn: &mut Conn, q: QueueId) -> u64 {
    range_state(conn, q).map(|s| s.seen).unwrap_or(0)
}

fn add_seen(conn: &mut Conn, q: QueueId, len: u64) {
    if let Some(state) = range_state(conn, q) {
        state.seen += len;
    }
}

fn state_started(conn: &mut Conn, q: QueueId, idx: usize) -> bool {
    range_state(conn, q)
        .and_then(|s| s.started.get(idx).copied())
        .unwrap_or(false)
}

fn first_part(conn: &mut Conn, q: QueueId) -> bool {
    range_state(conn, q)
        .map(|s| s.started.iter().all(|b| !*b))
        .unwrap_or(true)
}

fn mark_started(conn: &mut Conn, q: QueueId, idx: usize) {
    if let Some(state) = range_state(conn, q)
        && let Some(flag) = state.started.get_mut(idx)
    {
        *flag = true;
    }
}

fn range_state<'a>(conn: &'a mut Conn, q: QueueId) -> Option<&'a mut RangeState> {
    conn.queue_mut(q)
        .state
        .as_mut()
        .and_then(|s| s.downcast_mut::<RangeState>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multipart_length_is_exact() {
        let ranges = [
            ResolvedRange { offset: 0, len: 10 },
            ResolvedRange { offset: 50, len: 10 },
        ];
        let boundary = "deadbeefdeadbeef";
        let mut body = Vec::new();
        for (idx, range) in ranges.iter().enumerate() {
            if idx > 0 {
                body.extend_from_slice(b"\r\n");
            }
            body.extend_from_slice(
                format!(
                    "--{boundary}\r\nContent-Range: bytes {}-{}/100\r\n\r\n",
                    range.offset,
                    range.end() - 1
                )
                .as_bytes(),
            );
            body.extend_from_slice(&vec![0u8; range.len as usize]);
        }
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());
        assert_eq!(multipart_length(&ranges, 100, boundary) as usize, body.len());
    }

    #[test]
    fn slice_preserves_entity_regions() {
        let packet = Packet::entity(100, 50);
        let slice = slice_packet(&packet, 10, 20);
        let entity = slice.entity.unwrap();
        assert_eq!(entity.pos, 110);
        assert_eq!(entity.size, 20);
    }
}
