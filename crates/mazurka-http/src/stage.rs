//! Processing stages: handlers, filters and connectors.
//!
//! A stage is a named, shareable processor; per-request mutable state
//! lives in the queue that hosts the stage, not in the stage itself.
//! The default method bodies implement a pass-through filter, so most
//! stages override only the callbacks they care about.

use std::collections::HashMap;
use std::sync::Arc;

use crate::conn::Conn;
use crate::error::HttpResult;
use crate::packet::Packet;
use crate::queue::QueueId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    /// Terminal producer of the response (or consumer of the request).
    Handler,
    /// Transformer in either direction.
    Filter,
    /// Socket writer at the network end of the TX pipeline.
    Connector,
}

/// Pipeline direction a queue belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dir {
    /// Toward the network.
    Tx,
    /// Toward the handler.
    Rx,
}

pub trait Stage: Send + Sync {
    fn name(&self) -> &'static str;

    fn kind(&self) -> StageKind;

    /// Whether this stage joins the pipeline for the given direction.
    /// Handlers are asked once with `Dir::Tx` during handler selection.
    fn matches(&self, conn: &Conn, dir: Dir) -> bool {
        let _ = (conn, dir);
        true
    }

    /// Called once when the queue is created.
    fn open(&self, conn: &mut Conn, q: QueueId) -> HttpResult<()> {
        let _ = (conn, q);
        Ok(())
    }

    /// Called when the pipeline closes.
    fn close(&self, conn: &mut Conn, q: QueueId) {
        let _ = (conn, q);
    }

    /// Handlers only: the request body has been fully received.
    fn ready(&self, conn: &mut Conn) -> HttpResult<()> {
        let _ = conn;
        Ok(())
    }

    /// Handlers only: output is not finalized and downstream drained.
    fn writable(&self, conn: &mut Conn) -> HttpResult<()> {
        let _ = conn;
        Ok(())
    }

    /// Accept one packet travelling toward the handler.
    fn incoming(&self, conn: &mut Conn, q: QueueId, packet: Packet) -> HttpResult<()> {
        if conn.queue(q).next.is_some() {
            conn.put_next(q, packet)
        } else {
            // Terminal queue: hold the body for the handler.
            conn.put_for_service(q, packet, false);
            Ok(())
        }
    }

    /// Accept one packet travelling toward the network. The default
    /// queues it for this stage's service pass.
    fn outgoing(&self, conn: &mut Conn, q: QueueId, packet: Packet) -> HttpResult<()> {
        conn.put_for_service(q, packet, true);
        Ok(())
    }

    /// Drain queued TX packets toward downstream, honoring backpressure.
    fn outgoing_service(&self, conn: &mut Conn, q: QueueId) -> HttpResult<()> {
        conn.default_outgoing_service(q)
    }

    /// Drain queued RX packets toward the handler.
    fn incoming_service(&self, conn: &mut Conn, q: QueueId) -> HttpResult<()> {
        let _ = (conn, q);
        Ok(())
    }
}

/// The named stage registry held by the `Http` context.
#[derive(Default)]
pub struct StageRegistry {
    stages: HashMap<&'static str, Arc<dyn Stage>>,
}

impl StageRegistry {
    pub fn new() -> Self {
        Self { stages: HashMap::new() }
    }

    pub fn register(&mut self, stage: Arc<dyn Stage>) {
        self.stages.insert(stage.name(), stage);
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Stage>> {
        self.stages.get(name).cloned()
    }

    pub fn handlers(&self) -> impl Iterator<Item = &Arc<dyn Stage>> {
        self.stages.values().filter(|s| s.kind() == StageKind::Handler)
    }
}
