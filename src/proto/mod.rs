//! Protocol engine.
//!
//! [`LaneEndpoint`] ties the four protocol operations to one configuration
//! and one buffer factory. Lanes stay caller-owned; datagrams and drained
//! messages are tagged with the lane's index in the slice the caller passes.
//!
//! A typical network tick:
//!
//! 1. [`LaneEndpoint::handle_incoming`] with everything the socket delivered
//! 2. [`LaneEndpoint::drain_completed`], dispatching messages to the app
//! 3. application calls to [`LaneEndpoint::send_reliable`] /
//!    [`LaneEndpoint::send_unreliable`]
//! 4. [`LaneEndpoint::build_outgoing`], handing datagrams to the socket;
//!    repeat while it reports more backlog than fit

mod drain;
mod enqueue;
mod incoming;
mod outgoing;
pub(crate) mod wire;

use std::time::Instant;

use tracing::warn;

use crate::buffer::BufferFactory;
use crate::core::ConfigError;
use crate::core::constants::{
    ACK_BLOCK_MAX_SIZE, DEFAULT_MAX_PACKET_SIZE, PACKET_HEADER_SIZE, SEGMENT_OVERHEAD,
};
use crate::lane::{Done, Lane};

/// Endpoint-wide protocol settings, shared by every lane.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EndpointConfig {
    /// Datagram size budget, reserved prefix included. Externally
    /// configured; the protocol does no path MTU discovery.
    pub max_packet_size: usize,

    /// Bytes at the front of every datagram owned by the outer transport.
    /// The engine neither reads nor writes them.
    pub reserved_header_bytes: usize,

    /// Floor in milliseconds applied to every round-trip sample, for paths
    /// whose measured RTT is known to undershoot.
    pub min_round_trip_ms: f32,
}

impl EndpointConfig {
    /// Check the configuration for values the engine cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let required =
            self.reserved_header_bytes + PACKET_HEADER_SIZE + ACK_BLOCK_MAX_SIZE + SEGMENT_OVERHEAD + 1;
        if self.max_packet_size < required {
            return Err(ConfigError::PacketBudgetTooSmall {
                required,
                actual: self.max_packet_size,
            });
        }
        if !self.min_round_trip_ms.is_finite() || self.min_round_trip_ms < 0.0 {
            return Err(ConfigError::InvalidMinRoundTrip(self.min_round_trip_ms));
        }
        Ok(())
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            reserved_header_bytes: 0,
            min_round_trip_ms: 0.0,
        }
    }
}

/// One received datagram, tagged with its lane and arrival time.
#[derive(Debug)]
pub struct IncomingPacket {
    /// Index of the target lane in the caller's lane slice.
    pub lane: usize,
    /// When the transport delivered the datagram.
    pub arrival: Instant,
    /// Datagram buffer; returned to the factory after processing.
    pub data: Vec<u8>,
    /// Offset of the packet header within `data` (past any outer-transport
    /// prefix).
    pub offset: usize,
    /// Bytes of protocol data starting at `offset`.
    pub len: usize,
}

/// One datagram ready for the transport.
#[derive(Debug)]
pub struct OutgoingPacket {
    /// Index of the originating lane in the caller's lane slice.
    pub lane: usize,
    /// Full datagram, reserved prefix included. Recycle through
    /// [`LaneEndpoint::recycle_buffer`] once sent.
    pub data: Vec<u8>,
}

/// One payload in a batched send.
#[derive(Debug)]
pub struct ToSend {
    /// Index of the target lane in the caller's lane slice.
    pub lane: usize,
    /// Reliable stream or best-effort delivery.
    pub reliable: bool,
    /// Application payload.
    pub payload: Vec<u8>,
}

/// The protocol engine: configuration plus buffer factory.
///
/// All operations are synchronous and touch only the lanes passed in; the
/// caller serializes access per lane set, typically one tick at a time.
#[derive(Debug)]
pub struct LaneEndpoint<F: BufferFactory> {
    config: EndpointConfig,
    factory: F,
}

impl<F: BufferFactory> LaneEndpoint<F> {
    /// Create an endpoint after validating `config`.
    pub fn new(config: EndpointConfig, factory: F) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config, factory })
    }

    /// The endpoint's settings.
    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Return a delivered datagram buffer or a drained payload to the pool.
    pub fn recycle_buffer(&mut self, buf: Vec<u8>) {
        self.factory.return_buffer(buf);
    }

    /// Frame `payload` and append it to `lane`'s reliable stream.
    ///
    /// Dropped (logged, counted) when the send ring lacks room or the
    /// payload exceeds 65535 bytes.
    pub fn send_reliable(&mut self, lane: &mut Lane, payload: &[u8]) {
        enqueue::insert_reliable(lane, payload);
    }

    /// Queue `payload` for best-effort delivery on `lane`.
    ///
    /// A full queue is discarded wholesale in favor of this payload.
    pub fn send_unreliable(&mut self, lane: &mut Lane, payload: &[u8]) {
        enqueue::insert_unreliable(lane, payload);
    }

    /// Enqueue a batch of payloads across lanes.
    pub fn schedule_send(&mut self, lanes: &mut [Lane], batch: Vec<ToSend>) {
        for entry in batch {
            let Some(lane) = lanes.get_mut(entry.lane) else {
                warn!(lane = entry.lane, "schedule_send for unknown lane");
                continue;
            };
            if entry.reliable {
                enqueue::insert_reliable(lane, &entry.payload);
            } else {
                enqueue::insert_unreliable(lane, &entry.payload);
            }
        }
    }

    /// Parse a batch of received datagrams and apply them to lane state.
    ///
    /// Malformed data never fails the call: a bad chunk aborts the rest of
    /// its own datagram only. Every buffer in `packets` is returned to the
    /// factory.
    pub fn handle_incoming(&mut self, lanes: &mut [Lane], packets: Vec<IncomingPacket>) {
        incoming::process(&self.config, &mut self.factory, lanes, packets);
    }

    /// Build up to `max_packets` outgoing datagrams, at most one per lane.
    ///
    /// Returns the datagrams and whether backlog remains that did not fit
    /// this cycle (resends, windowed data, or unreliable messages).
    pub fn build_outgoing(
        &mut self,
        lanes: &mut [Lane],
        now: Instant,
        max_packets: usize,
    ) -> (Vec<OutgoingPacket>, bool) {
        outgoing::build(&self.config, &mut self.factory, lanes, now, max_packets)
    }

    /// Extract up to `max_messages` completed messages across all lanes.
    ///
    /// Reliable messages come out in send order per lane; unreliable follow
    /// in arrival order. Returns the messages and whether more remain.
    pub fn drain_completed(
        &mut self,
        lanes: &mut [Lane],
        now: Instant,
        max_messages: usize,
    ) -> (Vec<Done>, bool) {
        drain::drain(&mut self.factory, lanes, now, max_messages)
    }
}
