//! Payload ingestion.
//!
//! Reliable payloads are length-framed and appended to the lane's send ring;
//! the packet builder later slices the stream into segments without regard
//! for message boundaries. Unreliable payloads go into the lane's bounded
//! queue. Neither path blocks: when the ring or the queue cannot take the
//! payload it is dropped (or, for the unreliable queue, displaces everything
//! queued) with a log entry and an error count.

use tracing::{debug, warn};

use crate::core::constants::MAX_MESSAGE_SIZE;
use crate::lane::Lane;
use crate::proto::wire;

/// Frame `payload` and append it to the reliable send stream.
pub(super) fn insert_reliable(lane: &mut Lane, payload: &[u8]) {
    if payload.len() > MAX_MESSAGE_SIZE {
        warn!(
            lane = lane.id,
            size = payload.len(),
            "reliable payload exceeds framing limit, dropping"
        );
        lane.errors += 1;
        return;
    }

    let bytes_left = lane
        .send_peer_recv
        .wrapping_add(lane.send.capacity_u32())
        .wrapping_sub(lane.send_head);
    let required = (payload.len() + wire::frame_prefix_len(payload.len())) as u32;

    if required >= bytes_left {
        debug!(
            lane = lane.id,
            size = payload.len(),
            bytes_left,
            "send ring full, dropping reliable payload"
        );
        lane.errors += 1;
        return;
    }

    lane.send_head = wire::write_message_prefix(&mut lane.send, lane.send_head, payload.len());
    lane.send.write(lane.send_head, payload);
    lane.send_head = lane.send_head.wrapping_add(payload.len() as u32);
    lane.stats.sent_messages_reliable += 1;
}

/// Queue `payload` for unreliable delivery.
///
/// A full queue is flushed wholesale and restarted with this payload: stale
/// best-effort data is worth less than the newest message.
pub(super) fn insert_unreliable(lane: &mut Lane, payload: &[u8]) {
    if payload.is_empty() {
        debug!(lane = lane.id, "ignoring empty unreliable payload");
        return;
    }
    if payload.len() > MAX_MESSAGE_SIZE {
        warn!(
            lane = lane.id,
            size = payload.len(),
            "unreliable payload exceeds framing limit, dropping"
        );
        lane.errors += 1;
        return;
    }

    let ix = if lane.out_u_count < lane.out_u.len() {
        let ix = lane.out_u_count;
        lane.out_u_count += 1;
        ix
    } else {
        debug!(
            lane = lane.id,
            discarded = lane.out_u_count,
            "unreliable queue full, discarding queued messages"
        );
        lane.errors += 1;
        lane.out_u_count = 1;
        0
    };

    let entry = &mut lane.out_u[ix];
    if entry.data.len() < payload.len() {
        entry.data.resize(payload.len(), 0);
    }
    entry.data[..payload.len()].copy_from_slice(payload);
    entry.len = payload.len();
}
