//! Error types for lanelink.
//!
//! Only caller setup mistakes surface as typed errors. Runtime protocol
//! failures (malformed chunks, exhausted tables, full rings) are logged and
//! counted on the lane instead; the affected payload is dropped and the
//! caller observes the loss through [`crate::lane::LaneStats`].

use thiserror::Error;

/// Errors raised while validating endpoint or lane configuration.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ConfigError {
    /// Lane ring buffers cannot be empty.
    #[error("lane buffer size must be non-zero")]
    ZeroBufferSize,

    /// Lane ring buffers must stay far away from u32 offset wraparound.
    #[error("lane buffer size {size} exceeds the maximum of {max} bytes")]
    BufferTooLarge {
        /// Requested buffer size.
        size: usize,
        /// Largest supported buffer size.
        max: usize,
    },

    /// The unreliable queue and done ring need at least one slot.
    #[error("lane slot count must be non-zero")]
    ZeroSlots,

    /// The datagram budget cannot hold the packet header, a full ack block,
    /// and at least one byte of segment payload.
    #[error("max packet size {actual} is too small: need at least {required} bytes")]
    PacketBudgetTooSmall {
        /// Minimum workable datagram budget for this configuration.
        required: usize,
        /// Configured budget.
        actual: usize,
    },

    /// The configured minimum round trip must be a finite, non-negative
    /// number of milliseconds.
    #[error("min round trip of {0} ms is not a finite non-negative value")]
    InvalidMinRoundTrip(f32),
}
