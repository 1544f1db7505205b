//! Per-peer lane state.
//!
//! A [`Lane`] is one logical, independently flow-controlled channel to one
//! peer. It owns the receive and send ring buffers with their monotonic
//! cursors, the selective-ack and in-flight tables, the bounded unreliable
//! queue, the ring of completed-but-undrained messages, and the lane's RTT
//! window and statistics.
//!
//! Cursor invariants, maintained by the protocol engine:
//! - `send_peer_recv <= send_cursor <= send_head`
//! - `recv_tail <= recv_seq_cursor`
//! - offsets only ever advance; ring index = offset mod buffer length

mod ring;
mod rtt;

pub use ring::RingBuffer;
pub use rtt::{RttWindow, floor_sample};

use std::time::Instant;

use crate::core::ConfigError;
use crate::core::constants::{
    DEFAULT_BUFFER_SIZE, DEFAULT_SLOTS, MAX_ACK_RANGES, MAX_BUFFER_SIZE, MAX_IN_FLIGHT,
};

/// Sizing for a lane's buffers and queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneConfig {
    /// Size in bytes of each of the send and receive ring buffers. Doubles
    /// as the receive window the lane advertises to its peer.
    pub buffer_size: usize,

    /// Capacity of the unreliable outgoing queue and of the done ring.
    pub slots: usize,
}

impl LaneConfig {
    /// Check the configuration for values the lane cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::ZeroBufferSize);
        }
        if self.buffer_size > MAX_BUFFER_SIZE {
            return Err(ConfigError::BufferTooLarge {
                size: self.buffer_size,
                max: MAX_BUFFER_SIZE,
            });
        }
        if self.slots == 0 {
            return Err(ConfigError::ZeroSlots);
        }
        Ok(())
    }
}

impl Default for LaneConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            slots: DEFAULT_SLOTS,
        }
    }
}

/// A gap of receive-buffer bytes that arrived ahead of the contiguous
/// cursor, advertised to the peer as a future ack. Half-open `[begin, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckRange {
    /// First byte offset of the range.
    pub begin: u32,
    /// One past the last byte offset of the range.
    pub end: u32,
}

/// A sent-but-unacknowledged range of the send stream.
///
/// `end == 0` marks a free (tombstoned) slot; compaction removes tombstones
/// each send cycle while preserving order.
#[derive(Debug, Clone, Copy)]
pub struct InFlight {
    /// First byte offset of the segment.
    pub begin: u32,
    /// One past the last byte offset; zero for a free slot.
    pub end: u32,
    /// When the segment was first transmitted.
    pub first_send_time: Instant,
    /// When the segment is next due for retransmission.
    pub resend_time: Instant,
    /// Retransmissions so far; the first ack of an untouched segment yields
    /// an RTT sample.
    pub resend_count: u8,
}

impl InFlight {
    fn idle(at: Instant) -> Self {
        Self {
            begin: 0,
            end: 0,
            first_send_time: at,
            resend_time: at,
            resend_count: 0,
        }
    }

    /// True when this slot holds no segment.
    pub fn is_free(&self) -> bool {
        self.end == 0
    }
}

/// One queued unreliable payload. `len == 0` marks a free slot; the backing
/// allocation is kept and reused by later payloads.
#[derive(Debug, Default)]
pub(crate) struct UnreliableEntry {
    pub(crate) data: Vec<u8>,
    pub(crate) len: usize,
}

/// A completed incoming message, reliable or unreliable, ready for the
/// application. Yielded exactly once by the drain.
#[derive(Debug)]
pub struct Done {
    /// Index of the lane within the caller's lane slice.
    pub lane: usize,
    /// The lane's user-assigned identity.
    pub lane_id: u64,
    /// Packet sequence the message arrived on; zero for reliable messages,
    /// which have no single carrying packet.
    pub seq_id: u32,
    /// Whether the message traveled on the reliable stream.
    pub reliable: bool,
    /// Message payload; borrowed from the buffer factory.
    pub payload: Vec<u8>,
    /// When the carrying datagram arrived.
    pub arrival_time: Instant,
    /// When the message became deliverable.
    pub completion_time: Instant,
}

/// Per-lane traffic counters.
///
/// These are the loss-detection side channel: dropped sends and discarded
/// chunks never surface as errors, so callers compare counters across the
/// two ends instead.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LaneStats {
    /// Datagrams emitted.
    pub sent_packets: u64,
    /// Total datagram bytes emitted, reserved prefix included.
    pub sent_bytes_total: u64,
    /// Reliable messages accepted into the send ring.
    pub sent_messages_reliable: u64,
    /// Unreliable messages packed into datagrams.
    pub sent_messages_unreliable: u64,
    /// Reliable stream bytes placed into segments, resends included.
    pub sent_bytes_reliable: u64,
    /// Unreliable payload bytes packed into datagrams.
    pub sent_bytes_unreliable: u64,
    /// Datagrams parsed.
    pub recv_packets: u64,
    /// Total datagram bytes parsed.
    pub recv_bytes_total: u64,
    /// Reliable messages drained.
    pub recv_messages_reliable: u64,
    /// Unreliable messages accepted into the done ring.
    pub recv_messages_unreliable: u64,
    /// Reliable segment bytes written into the receive ring.
    pub recv_bytes_reliable: u64,
    /// Unreliable payload bytes accepted.
    pub recv_bytes_unreliable: u64,
}

/// One logical channel to one peer.
#[derive(Debug)]
pub struct Lane {
    pub(crate) id: u64,

    // Receive side
    pub(crate) recv: RingBuffer,
    /// Highest offset with fully contiguous received bytes.
    pub(crate) recv_seq_cursor: u32,
    /// Read/decode cursor; trails `recv_seq_cursor`.
    pub(crate) recv_tail: u32,
    /// Highest observed packet sequence, echoed back in headers.
    pub(crate) recv_last_seen_seq: u32,

    // Send side
    pub(crate) send: RingBuffer,
    /// Highest enqueued offset.
    pub(crate) send_head: u32,
    /// Offset the peer has fully acknowledged.
    pub(crate) send_peer_recv: u32,
    /// Peer-advertised receive ceiling.
    pub(crate) send_peer_recv_max: u32,
    /// Highest offset already placed into an in-flight segment.
    pub(crate) send_cursor: u32,

    pub(crate) future_acks: [AckRange; MAX_ACK_RANGES],
    pub(crate) future_ack_count: usize,
    pub(crate) in_flights: [InFlight; MAX_IN_FLIGHT],
    pub(crate) in_flight_count: usize,
    pub(crate) do_send_acks: bool,

    pub(crate) out_u: Box<[UnreliableEntry]>,
    pub(crate) out_u_count: usize,

    pub(crate) done: Box<[Option<Done>]>,
    pub(crate) done_head: u32,
    pub(crate) done_tail: u32,

    pub(crate) outgoing_seq: u32,
    pub(crate) rtt: RttWindow,

    pub(crate) errors: u32,
    pub(crate) stats: LaneStats,
    pub(crate) last_incoming_time: Option<Instant>,
}

impl Lane {
    /// Create a lane for the peer channel identified by `id`.
    ///
    /// The id is opaque user data; it tags drained messages so the
    /// application can route them.
    pub fn new(id: u64, config: &LaneConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let now = Instant::now();
        Ok(Self {
            id,
            recv: RingBuffer::new(config.buffer_size),
            recv_seq_cursor: 0,
            recv_tail: 0,
            recv_last_seen_seq: 0,
            send: RingBuffer::new(config.buffer_size),
            send_head: 0,
            send_peer_recv: 0,
            // Until the first ack arrives, assume the peer accepts at least
            // one buffer's worth.
            send_peer_recv_max: config.buffer_size as u32,
            send_cursor: 0,
            future_acks: [AckRange::default(); MAX_ACK_RANGES],
            future_ack_count: 0,
            in_flights: [InFlight::idle(now); MAX_IN_FLIGHT],
            in_flight_count: 0,
            do_send_acks: false,
            out_u: std::iter::repeat_with(UnreliableEntry::default)
                .take(config.slots)
                .collect(),
            out_u_count: 0,
            done: std::iter::repeat_with(|| None).take(config.slots).collect(),
            done_head: 0,
            done_tail: 0,
            outgoing_seq: 0,
            rtt: RttWindow::new(),
            errors: 0,
            stats: LaneStats::default(),
            last_incoming_time: None,
        })
    }

    /// The user-assigned lane identity.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Traffic counters for this lane.
    pub fn stats(&self) -> &LaneStats {
        &self.stats
    }

    /// Protocol malformations and capacity drops observed on this lane.
    pub fn errors(&self) -> u32 {
        self.errors
    }

    /// Arrival time of the most recent datagram, if any was ever received.
    pub fn last_incoming_time(&self) -> Option<Instant> {
        self.last_incoming_time
    }

    /// True while reliable bytes are enqueued but not yet fully acked, or
    /// unreliable messages await packing.
    pub fn has_backlog(&self) -> bool {
        self.send_head != self.send_peer_recv
            || self.in_flight_count > 0
            || self.out_u_count > 0
    }

    pub(crate) fn done_capacity(&self) -> usize {
        self.done.len()
    }

    pub(crate) fn done_is_full(&self) -> bool {
        self.done_head.wrapping_sub(self.done_tail) as usize == self.done.len()
    }

    pub(crate) fn push_done(&mut self, entry: Done) {
        debug_assert!(!self.done_is_full());
        let ix = self.done_head as usize % self.done.len();
        self.done[ix] = Some(entry);
        self.done_head = self.done_head.wrapping_add(1);
    }

    pub(crate) fn pop_done(&mut self) -> Option<Done> {
        if self.done_tail == self.done_head {
            return None;
        }
        let ix = self.done_tail as usize % self.done.len();
        self.done_tail = self.done_tail.wrapping_add(1);
        self.done[ix].take()
    }

    /// Drop tombstoned in-flight slots, preserving relative order.
    pub(crate) fn compact_in_flights(&mut self) {
        let mut out = 0;
        for j in 0..self.in_flight_count {
            if self.in_flights[j].is_free() {
                continue;
            }
            if j != out {
                self.in_flights[out] = self.in_flights[j];
            }
            out += 1;
        }
        self.in_flight_count = out;
    }

    /// Drop sent unreliable entries, preserving relative order.
    pub(crate) fn compact_unreliable(&mut self) {
        let mut write = 0;
        for u in 0..self.out_u_count {
            if self.out_u[u].len == 0 {
                continue;
            }
            if u != write {
                self.out_u.swap(u, write);
            }
            write += 1;
        }
        self.out_u_count = write;
    }
}
