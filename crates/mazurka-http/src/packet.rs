//! Pipeline packets.
//!
//! A packet is the unit of data moving through the TX and RX pipelines.
//! It carries a content buffer, an optional prefix that framing filters
//! (chunk, range) prepend at send time, and for entity packets a lazy
//! file region that the send connector transmits without buffering.

/// Classifies what a packet represents on a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketTag {
    /// Response or request header block. Exactly one per pipeline.
    Header,
    /// Entity data.
    Data,
    /// End of stream. No content.
    End,
    /// Range boundary marker produced by the range filter.
    Range,
    /// Self-contained message, bypasses aggregation (WebSocket control frames).
    Solo,
}

/// A byte region of an open file, transmitted lazily by the send connector.
#[derive(Debug, Clone, Copy)]
pub struct EntityRef {
    pub pos: u64,
    pub size: u64,
}

/// One unit of pipeline data.
#[derive(Debug)]
pub struct Packet {
    pub tag: PacketTag,
    /// Framing bytes written before `content` (chunk size lines, range
    /// boundaries). Not counted by queue watermarks.
    pub prefix: Vec<u8>,
    pub content: Vec<u8>,
    /// Lazy entity region; its size contributes to the payload length
    /// but not to queue counts.
    pub entity: Option<EntityRef>,
    /// Marks the final packet of the message.
    pub last: bool,
}

impl Packet {
    pub fn data(content: impl Into<Vec<u8>>) -> Self {
        Self {
            tag: PacketTag::Data,
            prefix: Vec::new(),
            content: content.into(),
            entity: None,
            last: false,
        }
    }

    pub fn header() -> Self {
        Self {
            tag: PacketTag::Header,
            prefix: Vec::new(),
            content: Vec::new(),
            entity: None,
            last: false,
        }
    }

    /// End-of-stream marker.
    pub fn end() -> Self {
        Self {
            tag: PacketTag::End,
            prefix: Vec::new(),
            content: Vec::new(),
            entity: None,
            last: true,
        }
    }

    pub fn solo(content: impl Into<Vec<u8>>) -> Self {
        Self {
            tag: PacketTag::Solo,
            prefix: Vec::new(),
            content: content.into(),
            entity: None,
            last: false,
        }
    }

    /// A lazily-filled file region for the send connector.
    pub fn entity(pos: u64, size: u64) -> Self {
        Self {
            tag: PacketTag::Data,
            prefix: Vec::new(),
            content: Vec::new(),
            entity: Some(EntityRef { pos, size }),
            last: false,
        }
    }

    /// Payload length: buffered content plus any lazy entity region.
    /// The prefix is framing, not payload.
    pub fn len(&self) -> usize {
        self.content.len() + self.entity.map_or(0, |e| e.size as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Split off everything past `at` payload bytes into a new packet
    /// that inherits the tag and the `last` marker. The original keeps
    /// the prefix and loses the `last` marker. Works on buffered
    /// content and on lazy entity regions.
    pub fn split(&mut self, at: usize) -> Packet {
        debug_assert!(at <= self.len());
        let mut tail = Packet {
            tag: self.tag,
            prefix: Vec::new(),
            content: Vec::new(),
            entity: None,
            last: self.last,
        };
        self.last = false;
        if at <= self.content.len() {
            tail.content = self.content.split_off(at);
            tail.entity = self.entity.take();
        } else if let Some(ref mut entity) = self.entity {
            let keep = (at - self.content.len()) as u64;
            tail.entity = Some(EntityRef {
                pos: entity.pos + keep,
                size: entity.size - keep,
            });
            entity.size = keep;
        }
        tail
    }

    /// Consume `n` bytes from the front, prefix first, then content,
    /// then the entity region. Used by connectors to trim after a
    /// partial write.
    pub fn consume(&mut self, mut n: usize) -> usize {
        let take = n.min(self.prefix.len());
        self.prefix.drain(..take);
        n -= take;

        let take = n.min(self.content.len());
        self.content.drain(..take);
        n -= take;

        if let Some(ref mut entity) = self.entity {
            let take = (n as u64).min(entity.size);
            entity.pos += take;
            entity.size -= take;
            n -= take as usize;
            if entity.size == 0 {
                self.entity = None;
            }
        }
        n
    }

    /// True when prefix, content and entity have all been written.
    pub fn is_consumed(&self) -> bool {
        self.prefix.is_empty() && self.content.is_empty() && self.entity.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_length_counts_entity_not_prefix() {
        let mut p = Packet::data(vec![1, 2, 3]);
        p.prefix = b"5\r\n".to_vec();
        assert_eq!(p.len(), 3);

        let e = Packet::entity(100, 50);
        assert_eq!(e.len(), 50);
    }

    #[test]
    fn split_moves_last_marker() {
        let mut p = Packet::data(b"hello world".to_vec());
        p.last = true;
        let tail = p.split(5);
        assert_eq!(p.content, b"hello");
        assert!(!p.last);
        assert_eq!(tail.content, b" world");
        assert!(tail.last);
    }

    #[test]
    fn consume_eats_prefix_then_content_then_entity() {
        let mut p = Packet::entity(0, 10);
        p.prefix = b"ab".to_vec();
        p.content = b"cd".to_vec();

        let left = p.consume(3);
        assert_eq!(left, 0);
        assert!(p.prefix.is_empty());
        assert_eq!(p.content, b"d");

        p.consume(1 + 4);
        let e = p.entity.unwrap();
        assert_eq!(e.pos, 4);
        assert_eq!(e.size, 6);

        p.consume(6);
        assert!(p.is_consumed());
    }
}
