//! Incoming packet processing.
//!
//! Applies a batch of received datagrams to lane state: ack bookkeeping
//! against the in-flight table, reliable segment insertion with out-of-order
//! gap tracking, and unreliable message intake. Malformed or truncated chunks
//! abort parsing of the rest of their datagram; everything applied up to that
//! point stays applied.

use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::buffer::BufferFactory;
use crate::core::constants::{
    CHUNK_ACK, CHUNK_MIN_REMAINING, CHUNK_SEGMENT, CHUNK_UNRELIABLE, MAX_ACK_RANGES,
    PACKET_HEADER_SIZE,
};
use crate::lane::{AckRange, Done, Lane, floor_sample};
use crate::proto::wire::read_u32;
use crate::proto::{EndpointConfig, IncomingPacket};

pub(super) fn process<F: BufferFactory>(
    config: &EndpointConfig,
    factory: &mut F,
    lanes: &mut [Lane],
    packets: Vec<IncomingPacket>,
) {
    for packet in packets {
        let IncomingPacket {
            lane: lane_ix,
            arrival,
            data,
            offset,
            len,
        } = packet;

        if lane_ix >= lanes.len() {
            warn!(lane = lane_ix, "dropping datagram for unknown lane");
        } else if offset + len > data.len() {
            warn!(lane = lanes[lane_ix].id, "dropping datagram with bad extent");
            lanes[lane_ix].errors += 1;
        } else {
            parse_datagram(
                config,
                factory,
                &mut lanes[lane_ix],
                lane_ix,
                arrival,
                &data[..offset + len],
                offset,
            );
        }

        factory.return_buffer(data);
    }
}

fn parse_datagram<F: BufferFactory>(
    config: &EndpointConfig,
    factory: &mut F,
    lane: &mut Lane,
    lane_ix: usize,
    arrival: Instant,
    data: &[u8],
    mut pos: usize,
) {
    let end = data.len();
    if end - pos < PACKET_HEADER_SIZE {
        debug!(lane = lane.id, "datagram shorter than packet header");
        lane.errors += 1;
        return;
    }

    lane.stats.recv_packets += 1;
    lane.stats.recv_bytes_total += (end - pos) as u64;
    lane.last_incoming_time = Some(arrival);

    let seq = read_u32(data, pos);
    // The peer's echo of our own sequence; nothing downstream consumes it.
    let _last_seen_seq = read_u32(data, pos + 4);
    pos += PACKET_HEADER_SIZE;

    while end - pos >= CHUNK_MIN_REMAINING {
        let chunk_type = data[pos];
        pos += 1;

        match chunk_type {
            CHUNK_ACK => {
                let Some(next) = apply_ack_chunk(config, lane, seq, arrival, data, pos) else {
                    break;
                };
                pos = next;
            }
            CHUNK_SEGMENT => {
                let Some(next) = apply_segment_chunk(lane, seq, data, pos) else {
                    break;
                };
                pos = next;
            }
            CHUNK_UNRELIABLE => {
                let Some(next) =
                    apply_unreliable_chunk(factory, lane, lane_ix, seq, arrival, data, pos)
                else {
                    break;
                };
                pos = next;
            }
            other => {
                trace!(lane = lane.id, chunk = other, "unknown chunk type, discarding remainder");
                break;
            }
        }
    }
}

/// Parse and apply one ack chunk. Returns the position after the chunk, or
/// `None` when the chunk is truncated and the datagram must be abandoned.
fn apply_ack_chunk(
    config: &EndpointConfig,
    lane: &mut Lane,
    seq: u32,
    arrival: Instant,
    data: &[u8],
    mut pos: usize,
) -> Option<usize> {
    let end = data.len();
    if end - pos < 9 {
        debug!(lane = lane.id, "truncated ack chunk");
        lane.errors += 1;
        return None;
    }

    let recv_seq_cursor = read_u32(data, pos);
    let max_recv = read_u32(data, pos + 4);
    let count = data[pos + 8] as usize;
    pos += 9;

    if end - pos < count * 8 {
        debug!(lane = lane.id, count, "ack chunk too short for its ranges");
        lane.errors += 1;
        return None;
    }

    if max_recv >= lane.send_peer_recv_max {
        lane.send_peer_recv_max = max_recv;
        trace!(lane = lane.id, max_recv, "peer receive ceiling raised");
    } else {
        debug!(
            lane = lane.id,
            max_recv,
            current = lane.send_peer_recv_max,
            "out of order ack, ignoring regressed ceiling"
        );
    }

    if recv_seq_cursor >= lane.send_peer_recv {
        lane.send_peer_recv = recv_seq_cursor;
        trace!(lane = lane.id, acked = recv_seq_cursor, "peer contiguous ack raised");
    } else {
        debug!(lane = lane.id, "out of order ack, ignoring regressed cursor");
    }

    if seq > lane.recv_last_seen_seq {
        lane.recv_last_seen_seq = seq;
    }

    // Everything below the peer's contiguous cursor is delivered.
    for k in 0..lane.in_flight_count {
        let flight = lane.in_flights[k];
        if flight.is_free() {
            continue;
        }
        if flight.begin < recv_seq_cursor && flight.end <= recv_seq_cursor {
            trace!(
                lane = lane.id,
                begin = flight.begin,
                end = flight.end,
                "clearing in-flight segment"
            );
            if flight.resend_count == 0 {
                record_round_trip(config, lane, arrival, flight.first_send_time);
            }
            lane.in_flights[k].end = 0;
        }
    }

    for _ in 0..count {
        let ack_begin = read_u32(data, pos);
        let ack_end = read_u32(data, pos + 4);
        pos += 8;

        if ack_end <= ack_begin {
            trace!(lane = lane.id, "discarding empty ack range");
            continue;
        }
        apply_range_ack(config, lane, ack_begin, ack_end, arrival);
    }

    Some(pos)
}

/// Clear or shrink in-flight entries covered by one explicit ack range.
///
/// Every comparison derives from the acked range's own bounds: full cover
/// clears the entry, prefix cover advances its begin, suffix cover retreats
/// its end. An interior overlap would split the entry in two; it is left
/// whole for the contiguous cursor to retire.
fn apply_range_ack(
    config: &EndpointConfig,
    lane: &mut Lane,
    ack_begin: u32,
    ack_end: u32,
    arrival: Instant,
) {
    for k in 0..lane.in_flight_count {
        let flight = lane.in_flights[k];
        if flight.is_free() {
            continue;
        }

        if ack_begin <= flight.begin && ack_end >= flight.end {
            trace!(
                lane = lane.id,
                begin = flight.begin,
                end = flight.end,
                "ack range clears in-flight segment"
            );
            if flight.resend_count == 0 {
                record_round_trip(config, lane, arrival, flight.first_send_time);
            }
            lane.in_flights[k].end = 0;
        } else if ack_begin <= flight.begin && ack_end > flight.begin {
            trace!(
                lane = lane.id,
                begin = flight.begin,
                end = flight.end,
                remaining = ack_end,
                "ack range shrinks in-flight head"
            );
            lane.in_flights[k].begin = ack_end;
        } else if ack_end >= flight.end && ack_begin < flight.end {
            trace!(
                lane = lane.id,
                begin = flight.begin,
                end = flight.end,
                remaining = ack_begin,
                "ack range shrinks in-flight tail"
            );
            lane.in_flights[k].end = ack_begin;
        }
    }
}

fn record_round_trip(config: &EndpointConfig, lane: &mut Lane, arrival: Instant, sent: Instant) {
    let raw_ms = arrival.saturating_duration_since(sent).as_secs_f32() * 1000.0;
    let sample = floor_sample(raw_ms, config.min_round_trip_ms);
    trace!(lane = lane.id, sample, "recorded round trip");
    lane.rtt.record(sample);
}

/// Parse and apply one reliable segment chunk.
fn apply_segment_chunk(lane: &mut Lane, seq: u32, data: &[u8], mut pos: usize) -> Option<usize> {
    let end = data.len();
    if end - pos < 8 {
        debug!(lane = lane.id, "truncated segment chunk");
        lane.errors += 1;
        return None;
    }

    let seg_begin = read_u32(data, pos);
    let seg_end = read_u32(data, pos + 4);
    pos += 8;

    if seg_end < seg_begin {
        debug!(lane = lane.id, seg_begin, seg_end, "inconsistent segment bounds");
        lane.errors += 1;
        return None;
    }
    let len = (seg_end - seg_begin) as usize;
    if len > end - pos {
        debug!(lane = lane.id, seg_begin, seg_end, "truncated segment payload");
        lane.errors += 1;
        return None;
    }
    if len > lane.recv.capacity() {
        debug!(lane = lane.id, seg_begin, seg_end, "segment longer than receive buffer");
        lane.errors += 1;
        return None;
    }

    trace!(lane = lane.id, seg_begin, seg_end, "receiving stream segment");
    lane.recv.write(seg_begin, &data[pos..pos + len]);
    pos += len;
    lane.stats.recv_bytes_reliable += len as u64;

    if seg_end <= lane.recv_seq_cursor {
        trace!(lane = lane.id, "duplicate segment, re-acking");
    }
    if seg_begin == lane.recv_seq_cursor {
        lane.recv_seq_cursor = seg_end;
    }
    if seq > lane.recv_last_seen_seq {
        lane.recv_last_seen_seq = seq;
    }

    merge_future_acks(lane);
    promote_future_acks(lane);
    prune_future_acks(lane);

    if lane.future_ack_count < MAX_ACK_RANGES && seg_begin > lane.recv_seq_cursor {
        lane.future_acks[lane.future_ack_count] = AckRange {
            begin: seg_begin,
            end: seg_end,
        };
        lane.future_ack_count += 1;
    }

    lane.do_send_acks = true;
    Some(pos)
}

/// Join future-ack ranges that touch end-to-begin until none remain.
fn merge_future_acks(lane: &mut Lane) {
    loop {
        let mut merged = false;
        for a in 0..lane.future_ack_count {
            for b in 0..lane.future_ack_count {
                if a == b {
                    continue;
                }
                let ra = lane.future_acks[a];
                let rb = lane.future_acks[b];
                if rb.begin == ra.end && rb.end > rb.begin && ra.end > ra.begin {
                    trace!(
                        lane = lane.id,
                        begin = ra.begin,
                        end = rb.end,
                        "merging adjacent ack ranges"
                    );
                    lane.future_acks[a].end = rb.end;
                    lane.future_acks[b] = AckRange::default();
                    merged = true;
                }
            }
        }
        if !merged {
            break;
        }
    }
}

/// Fold any range starting at the contiguous cursor into it, repeating until
/// no range applies.
fn promote_future_acks(lane: &mut Lane) {
    loop {
        let mut promoted = false;
        for k in 0..lane.future_ack_count {
            let range = lane.future_acks[k];
            if range.begin == lane.recv_seq_cursor && lane.recv_seq_cursor < range.end {
                lane.recv_seq_cursor = range.end;
                promoted = true;
            }
        }
        if !promoted {
            break;
        }
    }
}

/// Clamp ranges to the cursor and drop the ones that no longer describe
/// future data.
fn prune_future_acks(lane: &mut Lane) {
    let capacity = lane.recv.capacity_u32();
    let mut write = 0;
    for k in 0..lane.future_ack_count {
        let mut range = lane.future_acks[k];
        if range.begin < lane.recv_seq_cursor {
            range.begin = lane.recv_seq_cursor;
        }
        let span = range.end.wrapping_sub(range.begin);
        if span > 0 && span <= capacity {
            lane.future_acks[write] = range;
            write += 1;
        }
    }
    lane.future_ack_count = write;
}

/// Parse one unreliable chunk and queue it for the drain.
fn apply_unreliable_chunk<F: BufferFactory>(
    factory: &mut F,
    lane: &mut Lane,
    lane_ix: usize,
    seq: u32,
    arrival: Instant,
    data: &[u8],
    mut pos: usize,
) -> Option<usize> {
    let end = data.len();
    if end - pos < 2 {
        debug!(lane = lane.id, "truncated unreliable chunk");
        lane.errors += 1;
        return None;
    }

    let size = data[pos] as usize + 256 * data[pos + 1] as usize;
    pos += 2;

    if end - pos < size {
        debug!(lane = lane.id, size, "truncated unreliable payload");
        lane.errors += 1;
        return None;
    }

    if lane.done_is_full() {
        debug!(
            lane = lane.id,
            capacity = lane.done_capacity(),
            "done ring full, dropping unreliable message"
        );
        lane.errors += 1;
    } else {
        let mut payload = factory.get_buffer(size);
        payload[..size].copy_from_slice(&data[pos..pos + size]);
        payload.truncate(size);
        lane.push_done(Done {
            lane: lane_ix,
            lane_id: lane.id,
            seq_id: seq,
            reliable: false,
            payload,
            arrival_time: arrival,
            completion_time: arrival,
        });
        lane.stats.recv_messages_unreliable += 1;
        lane.stats.recv_bytes_unreliable += size as u64;
        trace!(lane = lane.id, size, seq, "unreliable message arrived");
    }

    Some(pos + size)
}
