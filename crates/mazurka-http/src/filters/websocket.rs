//! WebSocket upgrade and RFC 6455 frame codec.
//!
//! The filter validates the handshake while the pipeline opens, turning
//! the connection into a frame stream: inbound bytes decode into
//! messages delivered to the handler, outbound data packets encode into
//! text frames (pre-framed control messages pass through as solo
//! packets).

use base64::Engine;
use sha1::{Digest, Sha1};

use crate::conn::Conn;
use crate::error::{HttpError, HttpResult};
use crate::http::Method;
use crate::packet::{Packet, PacketTag};
use crate::queue::QueueId;
use crate::stage::{Dir, Stage, StageKind};

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub const OP_CONT: u8 = 0;
pub const OP_TEXT: u8 = 1;
pub const OP_BINARY: u8 = 2;
pub const OP_CLOSE: u8 = 8;
pub const OP_PING: u8 = 9;
pub const OP_PONG: u8 = 10;

/// Close codes: 1000-4999 minus the reserved holes.
fn close_code_valid(code: u16) -> bool {
    matches!(code, 1000..=4999)
        && !matches!(code, 1004..=1006 | 1012..=1016 | 1100..=2999)
}

struct WsCodec {
    buf: Vec<u8>,
    /// Message assembly across continuation frames.
    message: Vec<u8>,
    message_opcode: u8,
    assembling: bool,
    utf8: Utf8State,
    close_sent: bool,
    close_received: bool,
}

impl WsCodec {
    fn new() -> Self {
        Self {
            buf: Vec::new(),
            message: Vec::new(),
            message_opcode: 0,
            assembling: false,
            utf8: Utf8State::new(),
            close_sent: false,
            close_received: false,
        }
    }
}

pub struct WebSocketFilter;

impl Stage for WebSocketFilter {
    fn name(&self) -> &'static str {
        "websocket"
    }

    fn kind(&self) -> StageKind {
        StageKind::Filter
    }

    fn matches(&self, conn: &Conn, _dir: Dir) -> bool {
        conn.server_side && conn.rx.upgrade_websocket
    }

    /// Handshake. Runs once, on whichever of this filter's queues
    /// opens first; the RX queue additionally gets the frame codec.
    fn open(&self, conn: &mut Conn, q: QueueId) -> HttpResult<()> {
        if conn.queue(q).dir == Dir::Rx {
            conn.queue_mut(q).state = Some(Box::new(WsCodec::new()));
        }
        if conn.upgraded {
            return Ok(());
        }
        if conn.rx.method != Method::Get {
            return Err(HttpError::Parse("websocket upgrade requires GET".into()));
        }
        if conn.rx.websocket_version < 13 {
            return Err(HttpError::Protocol(426, "unsupported websocket version".into()));
        }
        let key = conn
            .rx
            .websocket_key
            .clone()
            .ok_or_else(|| HttpError::Parse("missing Sec-WebSocket-Key".into()))?;

        let accept = accept_key(&key);
        conn.tx.status = 101;
        conn.tx.headers.set("Upgrade", "websocket");
        conn.tx.headers.set("Connection", "Upgrade");
        conn.tx.headers.set("Sec-WebSocket-Accept", accept);

        // First client-offered subprotocol the route also speaks.
        if let Some(route) = conn.rx.route.clone() {
            let chosen = conn
                .rx
                .websocket_protocols
                .iter()
                .find(|p| route.websocket_protocols.iter().any(|r| r.eq_ignore_ascii_case(p)));
            if let Some(protocol) = chosen {
                conn.tx.headers.set("Sec-WebSocket-Protocol", protocol.clone());
            }
        }
        conn.upgraded = true;
        conn.must_close = true;
        // Flush the 101 even if the handler stays quiet.
        if let Some(head) = conn.pipeline.tx_head {
            conn.schedule_queue(head);
        }
        Ok(())
    }

    /// Decode inbound bytes into frames and messages.
    fn incoming(&self, conn: &mut Conn, q: QueueId, packet: Packet) -> HttpResult<()> {
        if packet.tag == PacketTag::End {
            return conn.put_next(q, packet);
        }
        {
            let state = codec_mut(conn, q)?;
            state.buf.extend_from_slice(&packet.content);
        }
        decode_frames(conn, q)
    }

    /// Encode outbound data packets as text messages, fragmenting at
    /// the configured frame size; solo packets are already framed by
    /// the send helpers.
    fn outgoing_service(&self, conn: &mut Conn, q: QueueId) -> HttpResult<()> {
        let frame_size = conn.limits.web_sockets_frame_size.max(1);
        while let Some(mut packet) = conn.queue_mut(q).dequeue() {
            if !conn.will_next_accept(q, &mut packet) {
                conn.queue_mut(q).enqueue_front(packet);
                break;
            }
            match packet.tag {
                PacketTag::Data if conn.upgraded && !packet.content.is_empty() => {
                    let content = std::mem::take(&mut packet.content);
                    let chunks: Vec<&[u8]> = content.chunks(frame_size).collect();
                    let last = chunks.len() - 1;
                    for (i, chunk) in chunks.iter().enumerate() {
                        let opcode = if i == 0 { OP_TEXT } else { OP_CONT };
                        let framed = encode_frame(i == last, opcode, None, chunk);
                        conn.put_next(q, Packet::data(framed))?;
                    }
                }
                _ => conn.put_next(q, packet)?,
            }
        }
        conn.resume_upstream_if_drained(q);
        Ok(())
    }
}

/// `base64(SHA1(key + GUID))` per RFC 6455.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

fn decode_frames(conn: &mut Conn, q: QueueId) -> HttpResult<()> {
    loop {
        let frame = {
            let limits_frame = conn.limits.web_sockets_frame_size;
            let state = codec_mut(conn, q)?;
            match parse_frame(&state.buf, limits_frame) {
                FrameParse::Incomplete => return Ok(()),
                FrameParse::TooLarge => {
                    drop_codec_input(state);
                    Frame::protocol_error(1009, "frame exceeds limit")
                }
                FrameParse::Invalid(reason) => {
                    drop_codec_input(state);
                    Frame::protocol_error(1002, reason)
                }
                FrameParse::Done(frame, consumed) => {
                    state.buf.drain(..consumed);
                    frame
                }
            }
        };

        if let Some((code, reason)) = frame.error {
            fail_connection(conn, q, code, reason)?;
            return Ok(());
        }
        handle_frame(conn, q, frame)?;
        if codec_mut(conn, q)?.close_received {
            return Ok(());
        }
    }
}

struct Frame {
    fin: bool,
    opcode: u8,
    payload: Vec<u8>,
    error: Option<(u16, &'static str)>,
}

impl Frame {
    fn protocol_error(code: u16, reason: &'static str) -> Frame {
        Frame { fin: true, opcode: 0, payload: Vec::new(), error: Some((code, reason)) }
    }
}

enum FrameParse {
    Incomplete,
    TooLarge,
    Invalid(&'static str),
    Done(Frame, usize),
}

fn parse_frame(buf: &[u8], frame_limit: usize) -> FrameParse {
    if buf.len() < 2 {
        return FrameParse::Incomplete;
    }
    let b0 = buf[0];
    let b1 = buf[1];
    let fin = b0 & 0x80 != 0;
    let rsv = b0 & 0x70;
    let opcode = b0 & 0x0f;
    let masked = b1 & 0x80 != 0;
    let len7 = (b1 & 0x7f) as u64;

    if rsv != 0 {
        return FrameParse::Invalid("reserved bits set");
    }
    if !matches!(opcode, OP_CONT | OP_TEXT | OP_BINARY | OP_CLOSE | OP_PING | OP_PONG) {
        return FrameParse::Invalid("reserved opcode");
    }
    if !masked {
        // Clients must mask; treat unmasked input as a protocol error.
        return FrameParse::Invalid("unmasked client frame");
    }

    let (len, ext) = match len7 {
        126 => {
            if buf.len() < 4 {
                return FrameParse::Incomplete;
            }
            (u16::from_be_bytes([buf[2], buf[3]]) as u64, 2)
        }
        127 => {
            if buf.len() < 10 {
                return FrameParse::Incomplete;
            }
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(bytes), 8)
        }
        n => (n, 0),
    };

    if opcode >= OP_CLOSE {
        if !fin {
            return FrameParse::Invalid("fragmented control frame");
        }
        if len > 125 {
            return FrameParse::Invalid("oversized control frame");
        }
    }
    if len > frame_limit as u64 {
        return FrameParse::TooLarge;
    }

    let header = 2 + ext + 4;
    let total = header + len as usize;
    if buf.len() < total {
        return FrameParse::Incomplete;
    }
    let mask: [u8; 4] = [
        buf[2 + ext],
        buf[3 + ext],
        buf[4 + ext],
        buf[5 + ext],
    ];
    let mut payload = buf[header..total].to_vec();
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
    FrameParse::Done(Frame { fin, opcode, payload, error: None }, total)
}

fn handle_frame(conn: &mut Conn, q: QueueId, frame: Frame) -> HttpResult<()> {
    match frame.opcode {
        OP_TEXT | OP_BINARY | OP_CONT => handle_data_frame(conn, q, frame),
        OP_PING => {
            let pong = encode_frame(true, OP_PONG, None, &frame.payload);
            send_solo(conn, pong);
            Ok(())
        }
        OP_PONG => Ok(()),
        OP_CLOSE => handle_close(conn, q, frame),
        _ => fail_connection(conn, q, 1002, "reserved opcode"),
    }
}

fn handle_data_frame(conn: &mut Conn, q: QueueId, frame: Frame) -> HttpResult<()> {
    let preserve = conn
        .rx
        .route
        .as_ref()
        .map(|r| r.preserve_frames)
        .unwrap_or(false);
    let message_limit = conn.limits.web_sockets_message_size;

    let deliver = {
        let state = codec_mut(conn, q)?;
        if frame.opcode == OP_CONT && !state.assembling {
            None
        } else if frame.opcode != OP_CONT && state.assembling && !preserve {
            // A new data frame may not interleave with an unfinished message.
            return fail_connection(conn, q, 1002, "interleaved message");
        } else {
            if frame.opcode != OP_CONT {
                state.message_opcode = frame.opcode;
                state.utf8 = Utf8State::new();
            }
            state.assembling = !frame.fin;

            if state.message_opcode == OP_TEXT && !state.utf8.advance(&frame.payload) {
                return fail_connection(conn, q, 1007, "invalid utf-8");
            }

            if preserve {
                Some(frame.payload)
            } else {
                if state.message.len() + frame.payload.len() > message_limit {
                    return fail_connection(conn, q, 1009, "message exceeds limit");
                }
                state.message.extend_from_slice(&frame.payload);
                if frame.fin {
                    if state.message_opcode == OP_TEXT && !state.utf8.is_complete() {
                        return fail_connection(conn, q, 1007, "truncated utf-8");
                    }
                    Some(std::mem::take(&mut state.message))
                } else {
                    None
                }
            }
        }
    };
    let Some(payload) = deliver else {
        // Either buffered into the message, or a stray continuation
        // with nothing in flight.
        if frame.opcode == OP_CONT {
            let assembling = codec_mut(conn, q)?.assembling;
            if !assembling && !frame.fin {
                return fail_connection(conn, q, 1002, "continuation without message");
            }
        }
        return Ok(());
    };
    let packet = Packet::data(payload);
    conn.put_next(q, packet)
}

fn handle_close(conn: &mut Conn, q: QueueId, frame: Frame) -> HttpResult<()> {
    let mut code = 1000u16;
    let mut valid = true;
    if frame.payload.len() == 1 {
        valid = false;
        code = 1002;
    } else if frame.payload.len() >= 2 {
        code = u16::from_be_bytes([frame.payload[0], frame.payload[1]]);
        if !close_code_valid(code) {
            valid = false;
            code = 1002;
        } else if std::str::from_utf8(&frame.payload[2..]).is_err() {
            valid = false;
            code = 1007;
        }
    }
    {
        let state = codec_mut(conn, q)?;
        state.close_received = true;
    }
    conn.http.trace().event("websocket.close", 3, &[("code", &code.to_string())]);
    if !valid {
        return fail_connection(conn, q, code, "invalid close frame");
    }
    echo_close(conn, q, code)?;
    Ok(())
}

/// Send our close (echo or initiated), then finalize the exchange.
fn echo_close(conn: &mut Conn, q: QueueId, code: u16) -> HttpResult<()> {
    let already = {
        let state = codec_mut(conn, q)?;
        let was = state.close_sent;
        state.close_sent = true;
        was
    };
    if !already {
        let close = encode_frame(true, OP_CLOSE, None, &code.to_be_bytes());
        send_solo(conn, close);
    }
    conn.finalize_output();
    Ok(())
}

/// Protocol failure: close with `code`, then tear down.
fn fail_connection(conn: &mut Conn, q: QueueId, code: u16, reason: &str) -> HttpResult<()> {
    tracing::debug!(code, reason, "websocket protocol failure");
    echo_close(conn, q, code)?;
    Ok(())
}

fn send_solo(conn: &mut Conn, framed: Vec<u8>) {
    if let Some(head) = conn.pipeline.tx_head {
        conn.pipeline.queues[head].enqueue(Packet::solo(framed));
        conn.schedule_queue(head);
    }
}

/// Encode one frame. `mask` is used by client-side senders.
pub fn encode_frame(fin: bool, opcode: u8, mask: Option<[u8; 4]>, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 14);
    let b0 = if fin { 0x80 } else { 0 } | (opcode & 0x0f);
    out.push(b0);
    let masked_bit = if mask.is_some() { 0x80 } else { 0 };
    match payload.len() {
        n if n < 126 => out.push(masked_bit | n as u8),
        n if n <= u16::MAX as usize => {
            out.push(masked_bit | 126);
            out.extend_from_slice(&(n as u16).to_be_bytes());
        }
        n => {
            out.push(masked_bit | 127);
            out.extend_from_slice(&(n as u64).to_be_bytes());
        }
    }
    match mask {
        Some(mask) => {
            out.extend_from_slice(&mask);
            out.extend(payload.iter().enumerate().map(|(i, b)| b ^ mask[i % 4]));
        }
        None => out.extend_from_slice(payload),
    }
    out
}

// ── send helpers for handler code ──

pub fn send_text(conn: &mut Conn, text: &str) {
    let framed = encode_frame(true, OP_TEXT, None, text.as_bytes());
    send_solo(conn, framed);
}

pub fn send_binary(conn: &mut Conn, data: &[u8]) {
    let framed = encode_frame(true, OP_BINARY, None, data);
    send_solo(conn, framed);
}

pub fn send_ping(conn: &mut Conn, payload: &[u8]) {
    let framed = encode_frame(true, OP_PING, None, payload);
    send_solo(conn, framed);
}

/// Periodic keep-alive ping, driven from the dispatcher tick when the
/// route configures a period.
pub fn maybe_ping(conn: &mut Conn, now: std::time::Instant) {
    if !conn.upgraded {
        return;
    }
    let Some(period) = conn.rx.route.as_ref().and_then(|r| r.websocket_ping_period) else {
        return;
    };
    let due = match conn.last_ping {
        Some(last) => now.duration_since(last) >= period,
        None => true,
    };
    if due {
        send_ping(conn, b"");
        conn.last_ping = Some(now);
        conn.protocol();
    }
}

fn codec_mut<'a>(conn: &'a mut Conn, q: QueueId) -> HttpResult<&'a mut WsCodec> {
    conn.queue_mut(q)
        .state
        .as_mut()
        .and_then(|s| s.downcast_mut::<WsCodec>())
        .ok_or_else(|| HttpError::Internal("websocket codec state missing".into()))
}

fn drop_codec_input(state: &mut WsCodec) {
    state.buf.clear();
}

// ── incremental UTF-8 validation ──

/// Small-table DFA: ACCEPT when a codepoint boundary has been reached,
/// REJECT on malformed input, intermediate otherwise. Incomplete
/// codepoints are tolerated across frame boundaries until `is_complete`
/// is asked.
#[derive(Clone, Copy)]
struct Utf8State {
    state: u8,
}

const UTF8_ACCEPT: u8 = 0;
const UTF8_REJECT: u8 = 12;

#[rustfmt::skip]
const UTF8_CLASS: [u8; 256] = [
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0, 0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0, 0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0, 0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0, 0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,0,
    1,1,1,1,1,1,1,1,1,1,1,1,1,1,1,1, 9,9,9,9,9,9,9,9,9,9,9,9,9,9,9,9,
    7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7, 7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,7,
    8,8,2,2,2,2,2,2,2,2,2,2,2,2,2,2, 2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,2,
    10,3,3,3,3,3,3,3,3,3,3,3,3,4,3,3, 11,6,6,6,5,8,8,8,8,8,8,8,8,8,8,8,
];

#[rustfmt::skip]
const UTF8_TRANSITION: [u8; 108] = [
     0,12,24,36,60,96,84,12,12,12,48,72, 12,12,12,12,12,12,12,12,12,12,12,12,
    12, 0,12,12,12,12,12, 0,12, 0,12,12, 12,24,12,12,12,12,12,24,12,24,12,12,
    12,12,12,12,12,12,12,24,12,12,12,12, 12,24,12,12,12,12,12,12,12,24,12,12,
    12,12,12,12,12,12,12,36,12,36,12,12, 12,36,12,12,12,12,12,36,12,36,12,12,
    12,36,12,12,12,12,12,12,12,12,12,12,
];

impl Utf8State {
    fn new() -> Self {
        Self { state: UTF8_ACCEPT }
    }

    /// Feed bytes; false on malformed input.
    fn advance(&mut self, bytes: &[u8]) -> bool {
        for &byte in bytes {
            let class = UTF8_CLASS[byte as usize];
            self.state = UTF8_TRANSITION[(self.state + class) as usize];
            if self.state == UTF8_REJECT {
                return false;
            }
        }
        true
    }

    /// True when no codepoint is left dangling.
    fn is_complete(&self) -> bool {
        self.state == UTF8_ACCEPT
    }
}
