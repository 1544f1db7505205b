//! # Lanelink
//!
//! Lane-multiplexed reliable/unreliable datagram transport core.
//!
//! Lanelink carries ordered reliable byte-streams and best-effort unreliable
//! messages over any unreliable, datagram-oriented, MTU-bounded transport
//! (typically UDP). Each peer channel is a **lane**: an independently
//! flow-controlled unit with its own sliding window, selective-ack gap
//! tracking, and adaptive resend pacing derived from measured round trips.
//!
//! The crate is sans-IO: it never opens a socket, spawns a thread, or sleeps.
//! The caller owns the transport and the tick loop, and drives four
//! synchronous entry points on [`LaneEndpoint`]:
//!
//! - [`LaneEndpoint::send_reliable`] / [`LaneEndpoint::send_unreliable`] —
//!   enqueue application payloads on a lane
//! - [`LaneEndpoint::build_outgoing`] — pack acks, due resends, windowed new
//!   data, and unreliable messages into size-bounded datagrams
//! - [`LaneEndpoint::handle_incoming`] — apply received datagrams to lane
//!   state
//! - [`LaneEndpoint::drain_completed`] — extract reassembled reliable
//!   messages and arrived unreliable messages
//!
//! Failure policy favors availability: malformed chunks abort the remainder
//! of their datagram, capacity overflows drop the offending payload, and both
//! are reported through logs and [`LaneStats`] rather than error returns.
//!
//! ## Example
//!
//! ```rust
//! use std::time::Instant;
//! use lanelink::prelude::*;
//!
//! let mut endpoint = LaneEndpoint::new(
//!     EndpointConfig::default(),
//!     PooledBufferFactory::default(),
//! ).unwrap();
//!
//! let mut lanes = vec![Lane::new(7, &LaneConfig::default()).unwrap()];
//!
//! endpoint.send_reliable(&mut lanes[0], b"hello");
//! let (datagrams, _more) = endpoint.build_outgoing(&mut lanes, Instant::now(), 8);
//! assert_eq!(datagrams.len(), 1);
//! // hand `datagrams[0].data` to the transport, then recycle the buffer
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

// Core constants and configuration errors (always included)
pub mod core;

// Pooled buffer lending
pub mod buffer;

// Per-peer lane state: ring accounting, RTT window, tables
pub mod lane;

// Protocol engine: wire codec, packet processing, packing, drain
pub mod proto;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::buffer::{BufferFactory, PooledBufferFactory};
    pub use crate::core::{ConfigError, constants};
    pub use crate::lane::{AckRange, Done, InFlight, Lane, LaneConfig, LaneStats};
    pub use crate::proto::{
        EndpointConfig, IncomingPacket, LaneEndpoint, OutgoingPacket, ToSend,
    };
}

// Re-export commonly used items at crate root
pub use crate::buffer::{BufferFactory, PooledBufferFactory};
pub use crate::core::ConfigError;
pub use crate::lane::{Done, Lane, LaneConfig, LaneStats};
pub use crate::proto::{EndpointConfig, IncomingPacket, LaneEndpoint, OutgoingPacket, ToSend};
