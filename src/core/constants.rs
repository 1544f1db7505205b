//! Protocol constants.
//!
//! The wire-format values are fixed by the protocol and MUST NOT be changed.

// =============================================================================
// PACKET LAYOUT
// =============================================================================

/// Packet header size: outgoing sequence + last-seen sequence (2 x u32 LE).
pub const PACKET_HEADER_SIZE: usize = 8;

/// Minimum bytes that must remain in a datagram for another chunk to be
/// parsed; anything shorter is trailing junk and is discarded.
pub const CHUNK_MIN_REMAINING: usize = 5;

// =============================================================================
// CHUNK TYPES
// =============================================================================

/// Ack chunk: receive cursor, window ceiling, and future-ack ranges.
pub const CHUNK_ACK: u8 = 0x00;

/// Reliable stream segment chunk.
pub const CHUNK_SEGMENT: u8 = 0x01;

/// Unreliable message chunk.
pub const CHUNK_UNRELIABLE: u8 = 0x02;

// =============================================================================
// CHUNK SIZES
// =============================================================================

/// Fixed body of an ack chunk after the type byte: cursor + ceiling + count.
pub const ACK_CHUNK_FIXED_SIZE: usize = 9;

/// Size of one serialized future-ack range (begin + end).
pub const ACK_RANGE_SIZE: usize = 8;

/// Largest possible ack block: type byte, fixed body, all ranges.
pub const ACK_BLOCK_MAX_SIZE: usize =
    1 + ACK_CHUNK_FIXED_SIZE + MAX_ACK_RANGES * ACK_RANGE_SIZE;

/// Framing overhead of a segment chunk: type byte + begin + end.
pub const SEGMENT_OVERHEAD: usize = 9;

/// Framing overhead of an unreliable chunk: type byte + u16 length.
pub const UNRELIABLE_OVERHEAD: usize = 3;

// =============================================================================
// MESSAGE FRAMING (inside the reliable byte stream)
// =============================================================================

/// Largest payload the length prefix can carry, reliable or unreliable.
pub const MAX_MESSAGE_SIZE: usize = 65535;

/// Longest payload encodable with the single-byte length prefix.
pub const FRAME_SHORT_MAX: usize = 254;

/// Prefix byte announcing the extended (u32) length form.
pub const FRAME_EXTENDED_SENTINEL: u8 = 0xFF;

/// Size of the extended length prefix: sentinel + u32 LE.
pub const FRAME_EXTENDED_SIZE: usize = 5;

// =============================================================================
// TABLE CAPACITIES
// =============================================================================

/// In-flight segment slots per lane.
pub const MAX_IN_FLIGHT: usize = 64;

/// Future-ack range slots per lane.
pub const MAX_ACK_RANGES: usize = 4;

/// Circular RTT sample window length per lane.
pub const RTT_WINDOW: usize = 16;

// =============================================================================
// TIMING
// =============================================================================

/// Resend interval used until enough RTT samples exist.
pub const FALLBACK_RESEND_MS: f32 = 1000.0;

/// RTT samples are never recorded below this floor.
pub const RTT_SAMPLE_FLOOR_MS: f32 = 15.0;

/// Samples required before the measured resend interval is trusted.
pub const MIN_RESEND_SAMPLES: u32 = 3;

/// Scale applied to the blended min/avg round trip to obtain the resend
/// interval.
pub const RESEND_SCALE: f32 = 2.05;

/// Floor for the minimum sample inside the resend-interval computation.
pub const RESEND_MIN_FLOOR_MS: f32 = 1.0;

// =============================================================================
// DEFAULTS
// =============================================================================

/// Default ring buffer size for a lane's send and receive streams.
pub const DEFAULT_BUFFER_SIZE: usize = 2048;

/// Default slot count for a lane's unreliable queue and done ring.
pub const DEFAULT_SLOTS: usize = 32;

/// Default datagram size budget.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 1200;

/// Largest supported lane buffer; keeps window arithmetic far from u32 wrap.
pub const MAX_BUFFER_SIZE: usize = 1 << 30;
