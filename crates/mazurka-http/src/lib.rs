//! Mazurka's embeddable HTTP/1.1 server and client engine.
//!
//! Requests flow through per-connection pipelines of stages (handlers,
//! filters, connectors) linked by watermarked queues, driven by an
//! explicit non-blocking state machine over an epoll dispatcher. The
//! engine covers routing with conditions and rewrites, basic/digest/
//! form authentication, sessions with CSRF tokens, response caching,
//! ranged and chunked transfer, multipart uploads, WebSockets, and a
//! monitor/defense subsystem for operational protection.

pub mod auth;
pub mod cache;
pub mod client;
pub mod conn;
pub mod connectors;
pub mod context;
pub mod dispatch;
pub mod endpoint;
pub mod error;
pub mod filters;
pub mod handlers;
pub mod headers;
pub mod host;
pub mod http;
pub mod limits;
pub mod logging;
pub mod monitor;
pub mod packet;
pub mod pipeline;
pub mod queue;
pub mod router;
pub mod rx;
pub mod server;
pub mod session;
pub mod socket;
pub mod stage;
pub mod syscalls;
pub mod trace;
pub mod tx;
pub mod uri;

// Re-exports for users
pub use client::{Client, ClientResponse};
pub use conn::{Conn, ConnState};
pub use context::Http;
pub use endpoint::Endpoint;
pub use error::{HttpError, HttpResult};
pub use headers::HeaderMap;
pub use host::Host;
pub use http::{Method, Protocol};
pub use limits::Limits;
pub use logging::{init_logging, init_logging_with_level};
pub use monitor::{Counter, Relation};
pub use packet::{Packet, PacketTag};
pub use router::{Condition, Route, Target, Update};
pub use server::Server;
pub use session::Session;
pub use socket::{MemorySocket, Socket};
pub use stage::{Dir, Stage, StageKind};
pub use trace::{Trace, TraceFormat};
pub use uri::Uri;
