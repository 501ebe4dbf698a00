//! Pipeline queues and the per-connection queue scheduler.
//!
//! Queues live in a small arena owned by the connection's pipeline and
//! link to each other by index, which keeps the doubly-linked pipeline
//! representable without shared ownership. The invariant maintained
//! here: a queue's `count` always equals the sum of the payload lengths
//! of the packets sitting on it.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::conn::Conn;
use crate::error::HttpResult;
use crate::packet::{Packet, PacketTag};
use crate::stage::{Dir, Stage};

pub type QueueId = usize;

pub struct Queue {
    pub stage: Arc<dyn Stage>,
    pub dir: Dir,
    pub packets: VecDeque<Packet>,
    /// Sum of payload lengths of queued packets.
    pub count: usize,
    /// High watermark: refuse packets that would push `count` past this.
    pub max: usize,
    /// Low watermark: resume a suspended upstream once drained to here.
    pub low: usize,
    /// Preferred packet size for resizing inbound packets.
    pub packet_size: usize,
    pub suspended: bool,
    pub scheduled: bool,
    /// Index of the downstream queue (toward the network for TX, toward
    /// the handler for RX).
    pub next: Option<QueueId>,
    pub prev: Option<QueueId>,
    /// The same stage's queue in the opposite direction, when present.
    pub pair: Option<QueueId>,
    /// Per-request stage state (chunk encoder, WebSocket assembler, ...).
    pub state: Option<Box<dyn Any + Send>>,
}

impl Queue {
    pub fn new(stage: Arc<dyn Stage>, dir: Dir, max: usize, packet_size: usize) -> Self {
        Self {
            stage,
            dir,
            packets: VecDeque::new(),
            count: 0,
            max,
            low: max / 2,
            packet_size,
            suspended: false,
            scheduled: false,
            next: None,
            prev: None,
            pair: None,
            state: None,
        }
    }

    pub fn enqueue(&mut self, packet: Packet) {
        self.count += packet.len();
        self.packets.push_back(packet);
    }

    pub fn enqueue_front(&mut self, packet: Packet) {
        self.count += packet.len();
        self.packets.push_front(packet);
    }

    pub fn dequeue(&mut self) -> Option<Packet> {
        let packet = self.packets.pop_front()?;
        self.count -= packet.len();
        Some(packet)
    }

    pub fn first(&self) -> Option<&Packet> {
        self.packets.front()
    }

    pub fn is_drained(&self) -> bool {
        self.packets.is_empty()
    }

    /// Whether the final packet of the message has passed or is queued.
    pub fn saw_last(&self) -> bool {
        self.packets.iter().any(|p| p.last)
    }
}

/// The per-request pair of queue chains plus the service scheduler.
#[derive(Default)]
pub struct Pipeline {
    pub queues: Vec<Queue>,
    /// Handler-side head of the TX chain.
    pub tx_head: Option<QueueId>,
    /// Connector queue (network end of the TX chain).
    pub tx_tail: Option<QueueId>,
    /// Network-side head of the RX chain.
    pub rx_head: Option<QueueId>,
    /// Handler-side tail of the RX chain.
    pub rx_tail: Option<QueueId>,
    /// FIFO of queues scheduled for service.
    pub service_list: VecDeque<QueueId>,
    pub created: bool,
}

impl Pipeline {
    pub fn clear(&mut self) {
        self.queues.clear();
        self.tx_head = None;
        self.tx_tail = None;
        self.rx_head = None;
        self.rx_tail = None;
        self.service_list.clear();
        self.created = false;
    }
}

impl Conn {
    pub fn queue(&self, q: QueueId) -> &Queue {
        &self.pipeline.queues[q]
    }

    pub fn queue_mut(&mut self, q: QueueId) -> &mut Queue {
        &mut self.pipeline.queues[q]
    }

    fn stage_of(&self, q: QueueId) -> Arc<dyn Stage> {
        self.pipeline.queues[q].stage.clone()
    }

    /// Hand a packet to the downstream queue's stage.
    pub fn put_next(&mut self, q: QueueId, packet: Packet) -> HttpResult<()> {
        let Some(next) = self.pipeline.queues[q].next else {
            return Ok(());
        };
        let stage = self.stage_of(next);
        match self.pipeline.queues[next].dir {
            Dir::Tx => stage.outgoing(self, next, packet),
            Dir::Rx => stage.incoming(self, next, packet),
        }
    }

    /// Queue a packet on `q` itself and optionally schedule a service pass.
    pub fn put_for_service(&mut self, q: QueueId, packet: Packet, schedule: bool) {
        self.pipeline.queues[q].enqueue(packet);
        if schedule {
            self.schedule_queue(q);
        }
    }

    pub fn schedule_queue(&mut self, q: QueueId) {
        let queue = &mut self.pipeline.queues[q];
        if !queue.scheduled && !queue.suspended {
            queue.scheduled = true;
            self.pipeline.service_list.push_back(q);
        }
    }

    pub fn suspend_queue(&mut self, q: QueueId) {
        let queue = &mut self.pipeline.queues[q];
        queue.suspended = true;
        queue.scheduled = false;
    }

    pub fn resume_queue(&mut self, q: QueueId) {
        let queue = &mut self.pipeline.queues[q];
        if queue.suspended {
            queue.suspended = false;
            self.schedule_queue(q);
        }
    }

    /// Backpressure gate. Splits the packet down to the next queue's
    /// preferred size first; if the next queue still cannot take it,
    /// suspends `q` and schedules the next queue so it drains.
    pub fn will_next_accept(&mut self, q: QueueId, packet: &mut Packet) -> bool {
        let Some(next) = self.pipeline.queues[q].next else {
            return true;
        };
        let next_q = &self.pipeline.queues[next];
        let size = next_q.packet_size;
        if size > 0 && packet.len() > size {
            let tail = packet.split(size);
            // Requeue the tail so it follows the resized head.
            self.pipeline.queues[q].enqueue_front(tail);
        }
        let next_q = &self.pipeline.queues[next];
        if next_q.count + packet.len() <= next_q.max {
            return true;
        }
        self.suspend_queue(q);
        self.schedule_queue(next);
        trace_suspend(self, q);
        false
    }

    /// The standard service pass: move packets downstream until the
    /// queue drains or downstream pushes back, then resume a suspended
    /// upstream once below the low watermark.
    pub fn default_outgoing_service(&mut self, q: QueueId) -> HttpResult<()> {
        while let Some(mut packet) = self.pipeline.queues[q].dequeue() {
            if !self.will_next_accept(q, &mut packet) {
                self.pipeline.queues[q].enqueue_front(packet);
                break;
            }
            self.put_next(q, packet)?;
        }
        self.resume_upstream_if_drained(q);
        Ok(())
    }

    pub fn resume_upstream_if_drained(&mut self, q: QueueId) {
        let queue = &self.pipeline.queues[q];
        let below_low = queue.count <= queue.low;
        let prev = queue.prev;
        if below_low
            && let Some(prev) = prev
        {
            self.resume_queue(prev);
        }
    }

    /// Run scheduled queues in FIFO order. Returns true if any service
    /// callback ran.
    pub fn service_queues(&mut self) -> HttpResult<bool> {
        let mut worked = false;
        // A service pass may reschedule queues; bound the loop to avoid
        // spinning when a stage keeps rescheduling without progress.
        let mut budget = self.pipeline.queues.len() * 4 + 8;
        while let Some(q) = self.pipeline.service_list.pop_front() {
            let queue = &mut self.pipeline.queues[q];
            queue.scheduled = false;
            if queue.suspended {
                continue;
            }
            let stage = queue.stage.clone();
            let dir = queue.dir;
            worked = true;
            match dir {
                Dir::Tx => stage.outgoing_service(self, q)?,
                Dir::Rx => stage.incoming_service(self, q)?,
            }
            budget -= 1;
            if budget == 0 {
                break;
            }
        }
        Ok(worked)
    }

    /// Sum of bytes buffered across the TX chain, used when computing a
    /// Content-Length for fully-buffered responses.
    pub fn tx_buffered_bytes(&self) -> usize {
        self.pipeline
            .queues
            .iter()
            .filter(|q| q.dir == Dir::Tx)
            .map(|q| q.count)
            .sum()
    }

    /// Whether every TX queue upstream of the connector has drained,
    /// meaning the connector queue holds the complete response.
    pub fn tx_upstream_drained(&self) -> bool {
        self.pipeline
            .queues
            .iter()
            .enumerate()
            .filter(|(id, q)| q.dir == Dir::Tx && Some(*id) != self.pipeline.tx_tail)
            .all(|(_, q)| q.is_drained())
    }

    /// Whether every TX queue has drained and the end marker was sent.
    pub fn tx_drained(&self) -> bool {
        self.pipeline
            .queues
            .iter()
            .filter(|q| q.dir == Dir::Tx)
            .all(|q| q.is_drained())
    }

    /// Discard all queued TX data (error substitution path). Header
    /// packets are preserved so the connector still writes headers.
    pub fn discard_tx_data(&mut self) {
        for queue in self.pipeline.queues.iter_mut() {
            if queue.dir == Dir::Tx {
                queue.packets.retain(|p| p.tag == PacketTag::Header);
                queue.count = queue.packets.iter().map(|p| p.len()).sum();
            }
        }
    }
}

// Kept out of line so will_next_accept stays readable.
fn trace_suspend(conn: &Conn, q: QueueId) {
    tracing::trace!(queue = conn.pipeline.queues[q].stage.name(), "queue suspended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageKind;

    struct Nop;

    impl Stage for Nop {
        fn name(&self) -> &'static str {
            "nop"
        }

        fn kind(&self) -> StageKind {
            StageKind::Filter
        }
    }

    fn queue() -> Queue {
        Queue::new(Arc::new(Nop), Dir::Tx, 1024, 256)
    }

    #[test]
    fn count_tracks_enqueue_and_dequeue() {
        let mut q = queue();
        q.enqueue(Packet::data(vec![0u8; 100]));
        q.enqueue(Packet::entity(0, 50));
        assert_eq!(q.count, 150);

        let first = q.dequeue().unwrap();
        assert_eq!(first.content.len(), 100);
        assert_eq!(q.count, 50);

        q.enqueue_front(first);
        assert_eq!(q.count, 150);
    }

    #[test]
    fn end_markers_do_not_count() {
        let mut q = queue();
        q.enqueue(Packet::header());
        q.enqueue(Packet::end());
        assert_eq!(q.count, 0);
        assert!(q.saw_last());
    }

    #[test]
    fn watermarks_default_to_half_max() {
        let q = queue();
        assert_eq!(q.max, 1024);
        assert_eq!(q.low, 512);
        assert!(!q.suspended);
        assert!(!q.scheduled);
    }
}
