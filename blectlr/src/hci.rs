//! HCI transport queues.
//!
//! Commands and outgoing data are queued towards the link layer, events and
//! incoming data are queued towards the host. Queue storage is carved from
//! the caller's memory region at enable time. Every queued message carries
//! its kind and length in a small slot header so the host side can fetch
//! without knowing what is next.
use crate::error::Error;
use crate::lpwq::{WorkEvent, WorkQueue};

/// HCI command packet header size: opcode (2) plus parameter length (1).
pub const CMD_HEADER_SIZE: usize = 3;

/// HCI ACL data packet header size: handle and flags (2) plus length (2).
pub const DATA_HEADER_SIZE: usize = 4;

/// HCI event packet header size: event code (1) plus parameter length (1).
pub const EVENT_HEADER_SIZE: usize = 2;

/// Largest HCI command parameter payload.
pub const CMD_PARAM_MAX_SIZE: usize = 255;

/// Largest ACL data payload.
pub const DATA_PAYLOAD_MAX_SIZE: usize = 251;

/// Largest event parameter payload.
pub const EVENT_PARAM_MAX_SIZE: usize = 255;

/// Largest complete HCI message, header included.
pub const MSG_BUFFER_MAX_SIZE: usize = 258;

// Slot layout: kind byte, little-endian length, then the message.
const SLOT_HEADER: usize = 3;

/// Size of one queue slot in the memory region.
pub const SLOT_SIZE: usize = SLOT_HEADER + MSG_BUFFER_MAX_SIZE;

/// What kind of HCI message a slot holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MsgKind {
    Data,
    Event,
}

/// Total length of the command packet starting at `buf`, header included.
///
/// Checks that the declared parameter length is present and in range.
pub fn cmd_packet_len(buf: &[u8]) -> Result<usize, Error> {
    if buf.len() < CMD_HEADER_SIZE {
        return Err(Error::EINVAL);
    }
    let param_len = usize::from(buf[2]);
    let total = CMD_HEADER_SIZE + param_len;
    if buf.len() < total {
        return Err(Error::EINVAL);
    }
    Ok(total)
}

/// Total length of the ACL data packet starting at `buf`, header included.
pub fn data_packet_len(buf: &[u8]) -> Result<usize, Error> {
    if buf.len() < DATA_HEADER_SIZE {
        return Err(Error::EINVAL);
    }
    let payload_len = usize::from(u16::from_le_bytes([buf[2], buf[3]]));
    if payload_len > DATA_PAYLOAD_MAX_SIZE {
        return Err(Error::EINVAL);
    }
    let total = DATA_HEADER_SIZE + payload_len;
    if buf.len() < total {
        return Err(Error::EINVAL);
    }
    Ok(total)
}

/// A fixed-slot message ring over a carved byte region.
pub struct MsgQueue<'a> {
    mem: &'a mut [u8],
    count: usize,
    head: usize,
    tail: usize,
    len: usize,
}

impl<'a> MsgQueue<'a> {
    /// Bytes of region memory needed for a queue of `slots` messages.
    pub const fn required_memory(slots: usize) -> usize {
        slots * SLOT_SIZE
    }

    pub fn new(mem: &'a mut [u8]) -> Self {
        let count = mem.len() / SLOT_SIZE;
        MsgQueue {
            mem,
            count,
            head: 0,
            tail: 0,
            len: 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.count
    }

    /// Append a message. Fails with [`Error::ENOBUFS`] when full.
    pub fn push(&mut self, kind: MsgKind, msg: &[u8]) -> Result<(), Error> {
        if msg.len() > MSG_BUFFER_MAX_SIZE {
            return Err(Error::EINVAL);
        }
        if self.is_full() {
            return Err(Error::ENOBUFS);
        }
        let slot = &mut self.mem[self.tail * SLOT_SIZE..(self.tail + 1) * SLOT_SIZE];
        slot[0] = match kind {
            MsgKind::Data => 0,
            MsgKind::Event => 1,
        };
        slot[1..3].copy_from_slice(&(msg.len() as u16).to_le_bytes());
        slot[SLOT_HEADER..SLOT_HEADER + msg.len()].copy_from_slice(msg);
        self.tail = (self.tail + 1) % self.count;
        self.len += 1;
        Ok(())
    }

    /// Pop the oldest message into `buf`. Returns its kind and length.
    ///
    /// Fails with [`Error::EAGAIN`] when the queue is empty and with
    /// [`Error::EINVAL`] when `buf` cannot hold the next message. The
    /// message stays queued in both cases.
    pub fn pop(&mut self, buf: &mut [u8]) -> Result<(MsgKind, usize), Error> {
        if self.is_empty() {
            return Err(Error::EAGAIN);
        }
        let slot = &self.mem[self.head * SLOT_SIZE..(self.head + 1) * SLOT_SIZE];
        let kind = if slot[0] == 0 { MsgKind::Data } else { MsgKind::Event };
        let len = usize::from(u16::from_le_bytes([slot[1], slot[2]]));
        if buf.len() < len {
            return Err(Error::EINVAL);
        }
        buf[..len].copy_from_slice(&slot[SLOT_HEADER..SLOT_HEADER + len]);
        self.head = (self.head + 1) % self.count;
        self.len -= 1;
        Ok((kind, len))
    }
}

/// The host-facing side of the transport: events and incoming data.
///
/// Pushing into an empty queue raises the availability notification so the
/// host knows there is something to fetch.
pub struct HostQueue<'a> {
    queue: MsgQueue<'a>,
}

impl<'a> HostQueue<'a> {
    pub fn new(mem: &'a mut [u8]) -> Self {
        HostQueue { queue: MsgQueue::new(mem) }
    }

    pub fn push(&mut self, kind: MsgKind, msg: &[u8], wq: &WorkQueue) -> Result<(), Error> {
        let was_empty = self.queue.is_empty();
        self.queue.push(kind, msg)?;
        if was_empty {
            wq.post(WorkEvent::HciAvailable);
        }
        Ok(())
    }

    pub fn pop(&mut self, buf: &mut [u8]) -> Result<(MsgKind, usize), Error> {
        self.queue.pop(buf)
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cmd_length_comes_from_header() {
        let pkt = [0x03, 0x0C, 0x00]; // HCI Reset, no parameters
        assert_eq!(cmd_packet_len(&pkt), Ok(3));
        let pkt = [0x01, 0x04, 0x02, 0xAA, 0xBB];
        assert_eq!(cmd_packet_len(&pkt), Ok(5));
        // Declared parameters missing from the buffer.
        let pkt = [0x01, 0x04, 0x05, 0xAA];
        assert_eq!(cmd_packet_len(&pkt), Err(Error::EINVAL));
        assert_eq!(cmd_packet_len(&[0x01]), Err(Error::EINVAL));
    }

    #[test]
    fn data_length_is_little_endian() {
        let mut pkt = [0u8; 8];
        pkt[2..4].copy_from_slice(&4u16.to_le_bytes());
        assert_eq!(data_packet_len(&pkt), Ok(8));
        // Payload longer than the largest LL packet.
        let mut pkt = [0u8; 300];
        pkt[2..4].copy_from_slice(&260u16.to_le_bytes());
        assert_eq!(data_packet_len(&pkt), Err(Error::EINVAL));
    }

    #[test]
    fn queue_is_fifo_and_preserves_kind() {
        let mut mem = [0u8; MsgQueue::required_memory(2)];
        let mut q = MsgQueue::new(&mut mem);
        q.push(MsgKind::Event, &[0x0E, 0x01, 0x00]).unwrap();
        q.push(MsgKind::Data, &[0x01, 0x00, 0x01, 0x00, 0xFF]).unwrap();
        let mut buf = [0u8; MSG_BUFFER_MAX_SIZE];
        let (kind, len) = q.pop(&mut buf).unwrap();
        assert_eq!((kind, len), (MsgKind::Event, 3));
        assert_eq!(&buf[..3], &[0x0E, 0x01, 0x00]);
        let (kind, len) = q.pop(&mut buf).unwrap();
        assert_eq!((kind, len), (MsgKind::Data, 5));
        assert_eq!(q.pop(&mut buf), Err(Error::EAGAIN));
    }

    #[test]
    fn undersized_buffer_leaves_message_queued() {
        let mut mem = [0u8; MsgQueue::required_memory(1)];
        let mut q = MsgQueue::new(&mut mem);
        q.push(MsgKind::Event, &[0x0E, 0x01, 0x00]).unwrap();
        let mut small = [0u8; 2];
        assert_eq!(q.pop(&mut small), Err(Error::EINVAL));
        // A large enough buffer still gets the message afterwards.
        let mut buf = [0u8; MSG_BUFFER_MAX_SIZE];
        assert_eq!(q.pop(&mut buf), Ok((MsgKind::Event, 3)));
    }

    #[test]
    fn acl_packets_flow_host_to_link_layer() {
        // The host-to-controller data queue is drained packet by packet on
        // the link-layer side.
        let mut mem = [0u8; MsgQueue::required_memory(2)];
        let mut q = MsgQueue::new(&mut mem);
        let mut pkt = [0u8; 8];
        pkt[0] = 0x01; // handle
        pkt[2..4].copy_from_slice(&4u16.to_le_bytes());
        pkt[4..8].copy_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF]);
        let total = data_packet_len(&pkt).unwrap();
        q.push(MsgKind::Data, &pkt[..total]).unwrap();
        let mut buf = [0u8; MSG_BUFFER_MAX_SIZE];
        assert_eq!(q.pop(&mut buf), Ok((MsgKind::Data, 8)));
        assert_eq!(&buf[..8], &pkt);
        assert_eq!(q.pop(&mut buf), Err(Error::EAGAIN));
    }

    #[test]
    fn full_queue_reports_enobufs() {
        let mut mem = [0u8; MsgQueue::required_memory(1)];
        let mut q = MsgQueue::new(&mut mem);
        q.push(MsgKind::Event, &[0x0E]).unwrap();
        assert_eq!(q.push(MsgKind::Event, &[0x0E]), Err(Error::ENOBUFS));
        let mut buf = [0u8; MSG_BUFFER_MAX_SIZE];
        q.pop(&mut buf).unwrap();
        q.push(MsgKind::Event, &[0x0E]).unwrap();
    }

    #[test]
    fn availability_raised_only_on_empty_to_nonempty() {
        let mut mem = [0u8; MsgQueue::required_memory(4)];
        let mut q = HostQueue::new(&mut mem);
        let wq = WorkQueue::new();
        q.push(MsgKind::Event, &[0x0E], &wq).unwrap();
        q.push(MsgKind::Event, &[0x0F], &wq).unwrap();
        let mut seen = 0;
        wq.drain(|e| {
            assert_eq!(e, WorkEvent::HciAvailable);
            seen += 1;
        });
        assert_eq!(seen, 1);
        // Draining to empty re-arms the notification.
        let mut buf = [0u8; MSG_BUFFER_MAX_SIZE];
        q.pop(&mut buf).unwrap();
        q.pop(&mut buf).unwrap();
        q.push(MsgKind::Event, &[0x10], &wq).unwrap();
        assert!(wq.is_pending());
    }
}
