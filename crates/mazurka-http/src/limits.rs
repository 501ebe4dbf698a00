//! Per-route and per-connection resource limits.
//!
//! A `Limits` value is attached to every connection. Routes may carry
//! their own copy with tightened or loosened values; the connection
//! picks up the route's limits once the request is routed.

use std::sync::Arc;
use std::time::Duration;

pub const MAX_REWRITE: usize = 16;

/// Size and time limits enforced by the engine.
#[derive(Debug, Clone)]
pub struct Limits {
    /// Maximum length of the request URI.
    pub uri_size: usize,
    /// Maximum total size of the request headers.
    pub header_size: usize,
    /// Maximum number of request headers.
    pub header_max: usize,
    /// Maximum size of a received request body.
    pub receive_body_size: u64,
    /// Maximum size of a received urlencoded form body.
    pub receive_form_size: u64,
    /// Maximum accumulated size of a multipart upload.
    pub upload_size: u64,
    /// Maximum size of a transmitted body. Negative means unlimited.
    pub transmit_body_size: u64,
    /// Maximum size of one chunk produced by the chunk filter.
    pub chunk_size: usize,
    /// Preferred packet size for pipeline queues.
    pub packet_size: usize,
    /// High watermark for pipeline queues.
    pub queue_max: usize,
    /// Number of keep-alive requests allowed per connection.
    pub keep_alive_max: u32,
    /// Maximum concurrent connections per endpoint.
    pub connections_max: usize,
    /// Maximum size of one item in the response cache.
    pub cache_item_size: usize,
    /// Maximum size of a single WebSocket frame.
    pub web_sockets_frame_size: usize,
    /// Maximum size of an assembled WebSocket message.
    pub web_sockets_message_size: usize,
    /// Maximum number of sessions retained in the session cache.
    pub session_max: usize,
    /// Session lifespan before eviction.
    pub session_lifespan: Duration,
    /// Time allowed between the first byte and a fully parsed header block.
    pub request_parse_timeout: Duration,
    /// Time allowed with no socket activity at all.
    pub inactivity_timeout: Duration,
    /// Time allowed for a whole request/response exchange.
    pub request_timeout: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            uri_size: 512,
            header_size: 32 * 1024,
            header_max: 64,
            receive_body_size: 128 * 1024 * 1024,
            receive_form_size: 32 * 1024,
            upload_size: 256 * 1024 * 1024,
            transmit_body_size: u64::MAX,
            chunk_size: 8 * 1024,
            packet_size: 8 * 1024,
            queue_max: 64 * 1024,
            keep_alive_max: 200,
            connections_max: 50_000,
            cache_item_size: 256 * 1024,
            web_sockets_frame_size: 8 * 1024,
            web_sockets_message_size: 2 * 1024 * 1024,
            session_max: 100_000,
            session_lifespan: Duration::from_secs(1800),
            request_parse_timeout: Duration::from_secs(5),
            inactivity_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(5 * 60),
        }
    }
}

impl Limits {
    pub fn shared() -> Arc<Limits> {
        Arc::new(Limits::default())
    }
}
