//! Outgoing packet building.
//!
//! Packs one datagram per lane per call: pending acks first, then due
//! retransmissions, then new reliable data up to the peer's advertised
//! window, then queued unreliable messages. Whatever does not fit stays
//! queued and is reported through the `has_more` flag so the caller can run
//! another build cycle within the same tick.

use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::buffer::BufferFactory;
use crate::core::constants::{
    FALLBACK_RESEND_MS, MAX_IN_FLIGHT, PACKET_HEADER_SIZE, UNRELIABLE_OVERHEAD,
};
use crate::lane::{InFlight, Lane};
use crate::proto::{EndpointConfig, OutgoingPacket, wire};

fn millis(ms: f32) -> Duration {
    Duration::from_secs_f32(ms.max(0.0) / 1000.0)
}

pub(super) fn build<F: BufferFactory>(
    config: &EndpointConfig,
    factory: &mut F,
    lanes: &mut [Lane],
    now: Instant,
    max_packets: usize,
) -> (Vec<OutgoingPacket>, bool) {
    let mut output = Vec::new();
    let mut has_more = false;

    for (lane_ix, lane) in lanes.iter_mut().enumerate() {
        if output.len() >= max_packets {
            return (output, true);
        }

        let mut data = factory.get_buffer(config.max_packet_size);
        let mut write_pos = config.reserved_header_bytes + PACKET_HEADER_SIZE;
        let max_write_pos = config.max_packet_size;
        let mut contains_anything = false;

        // 1. Pending acks ride ahead of everything else.
        if lane.do_send_acks {
            let ceiling = lane.recv_tail.wrapping_add(lane.recv.capacity_u32());
            trace!(
                lane = lane.id,
                cursor = lane.recv_seq_cursor,
                ceiling,
                ranges = lane.future_ack_count,
                "emitting ack chunk"
            );
            write_pos = wire::write_ack_chunk(
                &mut data,
                write_pos,
                lane.recv_seq_cursor,
                ceiling,
                &lane.future_acks[..lane.future_ack_count],
            );
            lane.do_send_acks = false;
            contains_anything = true;
        }

        // 2. Drop tombstones left by ack processing.
        lane.compact_in_flights();

        // 3. Resend pacing from measured round trips, once warmed up.
        let mut resend_ms = FALLBACK_RESEND_MS;
        if (lane.in_flight_count > 0 || lane.send_head != lane.send_cursor) && lane.rtt.is_warm() {
            resend_ms = lane.rtt.resend_interval_ms();
            trace!(lane = lane.id, resend_ms, "resend interval from rtt window");
        }

        // 4. Due retransmissions.
        let mut did_resends = false;
        for j in 0..lane.in_flight_count {
            let flight = lane.in_flights[j];
            if flight.resend_time >= now {
                continue;
            }

            let count = flight.end.wrapping_sub(flight.begin);
            if max_write_pos - write_pos < wire::segment_size_requirement(count) {
                debug!(
                    lane = lane.id,
                    begin = flight.begin,
                    end = flight.end,
                    "resend does not fit this datagram"
                );
                has_more = true;
                continue;
            }

            debug!(
                lane = lane.id,
                begin = flight.begin,
                end = flight.end,
                resend_count = flight.resend_count,
                "resending segment"
            );
            let (next_pos, written) =
                wire::write_segment_chunk(&mut data, write_pos, max_write_pos, &lane.send, flight.begin, count);
            write_pos = next_pos;
            debug_assert_eq!(written, count, "pre-checked resend did not fit");

            lane.stats.sent_bytes_reliable += written as u64;
            let attempts = flight.resend_count.saturating_add(1);
            lane.in_flights[j].resend_count = attempts;
            lane.in_flights[j].resend_time = now + millis(resend_ms * attempts as f32);

            did_resends = true;
            contains_anything = true;
        }

        // 5. New data, only on cycles with no resends and free table slots.
        if !did_resends && lane.send_head != lane.send_cursor && lane.in_flight_count < MAX_IN_FLIGHT
        {
            let in_queue = lane.send_head.wrapping_sub(lane.send_cursor);
            let max_send = lane.send_peer_recv_max.wrapping_sub(lane.send_cursor);
            let to_insert = in_queue.min(max_send);
            trace!(
                lane = lane.id,
                cursor = lane.send_cursor,
                head = lane.send_head,
                window = max_send,
                to_insert,
                "packing new reliable data"
            );

            if to_insert > 0 {
                let mut begin = lane.send_cursor;
                let fin = lane.send_cursor.wrapping_add(to_insert);
                while begin != fin {
                    if lane.in_flight_count == MAX_IN_FLIGHT {
                        has_more = true;
                        break;
                    }
                    let count = fin.wrapping_sub(begin);
                    let (next_pos, written) =
                        wire::write_segment_chunk(&mut data, write_pos, max_write_pos, &lane.send, begin, count);
                    write_pos = next_pos;

                    if written > 0 {
                        let ix = lane.in_flight_count;
                        lane.in_flights[ix] = InFlight {
                            begin,
                            end: begin.wrapping_add(written),
                            first_send_time: now,
                            resend_time: now + millis(resend_ms),
                            resend_count: 0,
                        };
                        lane.in_flight_count += 1;
                        lane.stats.sent_bytes_reliable += written as u64;
                        contains_anything = true;
                        begin = begin.wrapping_add(written);
                    }

                    if written != count {
                        has_more = true;
                        break;
                    }
                }
                lane.send_cursor = begin;
            }
        }

        // Enqueued bytes the window or this cycle could not take.
        if lane.send_head != lane.send_cursor {
            has_more = true;
        }

        // 6. Unreliable messages, in order, as space allows.
        for k in 0..lane.out_u_count {
            let len = lane.out_u[k].len;
            if len == 0 {
                continue;
            }
            if len + UNRELIABLE_OVERHEAD >= max_write_pos - write_pos {
                has_more = true;
            } else {
                trace!(lane = lane.id, size = len, "packing unreliable message");
                write_pos = wire::write_unreliable_chunk(&mut data, write_pos, &lane.out_u[k].data[..len]);
                lane.stats.sent_messages_unreliable += 1;
                lane.stats.sent_bytes_unreliable += len as u64;
                lane.out_u[k].len = 0;
                contains_anything = true;
            }
        }
        lane.compact_unreliable();

        // 7. Ship it, or hand the untouched buffer straight back.
        if !contains_anything {
            factory.return_buffer(data);
        } else {
            wire::write_packet_header(
                &mut data,
                config.reserved_header_bytes,
                lane.outgoing_seq,
                lane.recv_last_seen_seq,
            );
            lane.outgoing_seq = lane.outgoing_seq.wrapping_add(1);
            data.truncate(write_pos);
            lane.stats.sent_packets += 1;
            lane.stats.sent_bytes_total += write_pos as u64;
            output.push(OutgoingPacket {
                lane: lane_ix,
                data,
            });
        }
    }

    (output, has_more)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PooledBufferFactory;
    use crate::core::constants::{CHUNK_ACK, CHUNK_SEGMENT, CHUNK_UNRELIABLE};
    use crate::lane::{AckRange, LaneConfig};
    use crate::proto::enqueue;
    use crate::proto::wire::read_u32;

    fn config() -> EndpointConfig {
        EndpointConfig {
            max_packet_size: 256,
            reserved_header_bytes: 0,
            min_round_trip_ms: 0.0,
        }
    }

    fn lane() -> Lane {
        Lane::new(3, &LaneConfig::default()).unwrap()
    }

    fn build_one(
        config: &EndpointConfig,
        lane: &mut Lane,
        now: Instant,
    ) -> (Option<Vec<u8>>, bool) {
        let mut factory = PooledBufferFactory::default();
        let (mut packets, more) = build(
            config,
            &mut factory,
            std::slice::from_mut(lane),
            now,
            8,
        );
        assert!(packets.len() <= 1);
        (packets.pop().map(|p| p.data), more)
    }

    #[test]
    fn test_idle_lane_emits_nothing() {
        let mut lane = lane();
        let (packet, more) = build_one(&config(), &mut lane, Instant::now());
        assert!(packet.is_none());
        assert!(!more);
        assert_eq!(lane.stats().sent_packets, 0);
    }

    #[test]
    fn test_unsent_buffer_goes_back_to_pool() {
        let mut lane = lane();
        let mut factory = PooledBufferFactory::default();
        build(&config(), &mut factory, std::slice::from_mut(&mut lane), Instant::now(), 8);
        assert_eq!(factory.free_count(), 1);
    }

    #[test]
    fn test_header_stamping_and_seq_increment() {
        let mut lane = lane();
        let now = Instant::now();
        lane.recv_last_seen_seq = 77;

        enqueue::insert_reliable(&mut lane, b"abc");
        let (packet, _) = build_one(&config(), &mut lane, now);
        let packet = packet.unwrap();
        assert_eq!(read_u32(&packet, 0), 0);
        assert_eq!(read_u32(&packet, 4), 77);
        assert_eq!(lane.outgoing_seq, 1);

        lane.do_send_acks = true;
        let (packet, _) = build_one(&config(), &mut lane, now);
        assert_eq!(read_u32(&packet.unwrap(), 0), 1);
    }

    #[test]
    fn test_reserved_prefix_left_alone() {
        let cfg = EndpointConfig {
            max_packet_size: 256,
            reserved_header_bytes: 16,
            min_round_trip_ms: 0.0,
        };
        let mut lane = lane();
        enqueue::insert_reliable(&mut lane, b"abc");

        let (packet, _) = build_one(&cfg, &mut lane, Instant::now());
        let packet = packet.unwrap();
        assert_eq!(read_u32(&packet, 16), 0);
        assert_eq!(packet[24], CHUNK_SEGMENT);
    }

    #[test]
    fn test_ack_chunk_emitted_and_flag_cleared() {
        let mut lane = lane();
        lane.recv_seq_cursor = 40;
        lane.recv_tail = 20;
        lane.future_acks[0] = AckRange { begin: 60, end: 80 };
        lane.future_ack_count = 1;
        lane.do_send_acks = true;

        let (packet, _) = build_one(&config(), &mut lane, Instant::now());
        let packet = packet.unwrap();

        assert!(!lane.do_send_acks);
        assert_eq!(packet[8], CHUNK_ACK);
        assert_eq!(read_u32(&packet, 9), 40);
        assert_eq!(read_u32(&packet, 13), 20 + 2048);
        assert_eq!(packet[17], 1);
        assert_eq!(read_u32(&packet, 18), 60);
        assert_eq!(read_u32(&packet, 22), 80);
    }

    #[test]
    fn test_new_data_creates_in_flight() {
        let mut lane = lane();
        let now = Instant::now();
        enqueue::insert_reliable(&mut lane, b"hello");

        let (packet, more) = build_one(&config(), &mut lane, now);
        let packet = packet.unwrap();

        assert!(!more);
        assert_eq!(packet[8], CHUNK_SEGMENT);
        assert_eq!(read_u32(&packet, 9), 0);
        assert_eq!(read_u32(&packet, 13), 6);
        assert_eq!(&packet[17..23], b"\x05hello");

        assert_eq!(lane.in_flight_count, 1);
        assert_eq!(lane.in_flights[0].begin, 0);
        assert_eq!(lane.in_flights[0].end, 6);
        assert_eq!(lane.in_flights[0].resend_count, 0);
        assert_eq!(lane.send_cursor, 6);
    }

    #[test]
    fn test_window_limits_new_data() {
        let mut lane = lane();
        lane.send_peer_recv_max = 100;
        enqueue::insert_reliable(&mut lane, &[0xAA; 199]);
        assert_eq!(lane.send_head, 200);

        let (packet, more) = build_one(&config(), &mut lane, Instant::now());
        let packet = packet.unwrap();

        assert!(more);
        assert_eq!(lane.send_cursor, 100);
        assert_eq!(read_u32(&packet, 9), 0);
        assert_eq!(read_u32(&packet, 13), 100);
    }

    #[test]
    fn test_packet_budget_limits_new_data() {
        let cfg = EndpointConfig {
            max_packet_size: 64,
            reserved_header_bytes: 0,
            min_round_trip_ms: 0.0,
        };
        let mut lane = lane();
        enqueue::insert_reliable(&mut lane, &[0xBB; 200]);

        let (packet, more) = build_one(&cfg, &mut lane, Instant::now());
        assert!(more);
        assert_eq!(packet.unwrap().len(), 64);
        // 64 budget - 8 header - 9 segment overhead
        assert_eq!(lane.send_cursor, 47);
        assert_eq!(lane.in_flight_count, 1);
    }

    #[test]
    fn test_no_new_data_without_free_slots() {
        let mut lane = lane();
        let now = Instant::now();
        lane.in_flight_count = MAX_IN_FLIGHT;
        for j in 0..MAX_IN_FLIGHT {
            lane.in_flights[j] = InFlight {
                begin: j as u32,
                end: j as u32 + 1,
                first_send_time: now,
                resend_time: now + Duration::from_secs(60),
                resend_count: 0,
            };
        }
        enqueue::insert_reliable(&mut lane, b"stuck");

        let (packet, _) = build_one(&config(), &mut lane, now);
        assert!(packet.is_none());
        assert_eq!(lane.send_cursor, 0);
    }

    #[test]
    fn test_due_segment_resent_with_backoff() {
        let mut lane = lane();
        let start = Instant::now();
        enqueue::insert_reliable(&mut lane, b"hi");
        build_one(&config(), &mut lane, start);
        let first_resend_at = lane.in_flights[0].resend_time;

        // Not due yet: nothing to send.
        let (packet, _) = build_one(&config(), &mut lane, start);
        assert!(packet.is_none());

        // Past due: the same range goes out again and backs off linearly.
        let (packet, _) = build_one(&config(), &mut lane, first_resend_at + millis(1.0));
        let packet = packet.unwrap();
        assert_eq!(packet[8], CHUNK_SEGMENT);
        assert_eq!(read_u32(&packet, 9), 0);
        assert_eq!(lane.in_flights[0].resend_count, 1);
        let gap1 = lane.in_flights[0].resend_time - (first_resend_at + millis(1.0));

        let second_due = lane.in_flights[0].resend_time;
        build_one(&config(), &mut lane, second_due + millis(1.0));
        assert_eq!(lane.in_flights[0].resend_count, 2);
        let gap2 = lane.in_flights[0].resend_time - (second_due + millis(1.0));

        assert!(gap2 >= gap1);
    }

    #[test]
    fn test_resend_blocks_new_data_that_cycle() {
        let mut lane = lane();
        let start = Instant::now();
        enqueue::insert_reliable(&mut lane, b"first");
        build_one(&config(), &mut lane, start);

        enqueue::insert_reliable(&mut lane, b"second");
        let due = lane.in_flights[0].resend_time + millis(1.0);
        build_one(&config(), &mut lane, due);

        // Only the resend went out; the new bytes wait for the next cycle.
        assert_eq!(lane.in_flight_count, 1);
        assert_eq!(lane.send_cursor, 6);
    }

    #[test]
    fn test_oversized_resend_skipped_and_flagged() {
        let cfg = EndpointConfig {
            max_packet_size: 64,
            reserved_header_bytes: 0,
            min_round_trip_ms: 0.0,
        };
        let mut lane = lane();
        let now = Instant::now();
        // An in-flight range bigger than the datagram budget.
        lane.in_flights[0] = InFlight {
            begin: 0,
            end: 120,
            first_send_time: now,
            resend_time: now - Duration::from_millis(5),
            resend_count: 0,
        };
        lane.in_flight_count = 1;

        let (packet, more) = build_one(&cfg, &mut lane, now);
        assert!(packet.is_none());
        assert!(more);
        assert_eq!(lane.in_flights[0].resend_count, 0);
    }

    #[test]
    fn test_unreliable_packed_in_order() {
        let mut lane = lane();
        enqueue::insert_unreliable(&mut lane, b"one");
        enqueue::insert_unreliable(&mut lane, b"two");

        let (packet, more) = build_one(&config(), &mut lane, Instant::now());
        let packet = packet.unwrap();

        assert!(!more);
        assert_eq!(packet[8], CHUNK_UNRELIABLE);
        assert_eq!(&packet[11..14], b"one");
        assert_eq!(packet[14], CHUNK_UNRELIABLE);
        assert_eq!(&packet[17..20], b"two");
        assert_eq!(lane.out_u_count, 0);
        assert_eq!(lane.stats().sent_messages_unreliable, 2);
    }

    #[test]
    fn test_unreliable_without_room_stays_queued() {
        let cfg = EndpointConfig {
            max_packet_size: 64,
            reserved_header_bytes: 0,
            min_round_trip_ms: 0.0,
        };
        let mut lane = lane();
        enqueue::insert_unreliable(&mut lane, &[1u8; 40]);
        enqueue::insert_unreliable(&mut lane, &[2u8; 40]);

        let (packet, more) = build_one(&cfg, &mut lane, Instant::now());
        assert!(packet.is_some());
        assert!(more);
        assert_eq!(lane.out_u_count, 1);
        assert_eq!(lane.out_u[0].data[0], 2);

        let (packet, more) = build_one(&cfg, &mut lane, Instant::now());
        assert!(packet.is_some());
        assert!(!more);
        assert_eq!(lane.out_u_count, 0);
    }

    #[test]
    fn test_packet_budget_truncates_lane_sweep() {
        let mut lanes = vec![lane(), lane()];
        for lane in &mut lanes {
            enqueue::insert_reliable(lane, b"x");
        }

        let mut factory = PooledBufferFactory::default();
        let (packets, more) = build(&config(), &mut factory, &mut lanes, Instant::now(), 1);
        assert_eq!(packets.len(), 1);
        assert!(more);

        let (packets, more) = build(&config(), &mut factory, &mut lanes, Instant::now(), 8);
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].lane, 1);
        assert!(!more);
    }
}
