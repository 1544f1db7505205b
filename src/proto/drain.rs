//! Completed-message extraction.
//!
//! Walks each lane's contiguous received bytes, peeling length-framed
//! reliable messages off the read cursor, then hands out arrived unreliable
//! messages in order. Each message is yielded exactly once; moving the read
//! cursor frees receive-window space, so a drained lane re-advertises its
//! window on the next outgoing packet.

use std::time::Instant;

use tracing::trace;

use crate::buffer::BufferFactory;
use crate::lane::{Done, Lane};
use crate::proto::wire;

pub(super) fn drain<F: BufferFactory>(
    factory: &mut F,
    lanes: &mut [Lane],
    now: Instant,
    max_messages: usize,
) -> (Vec<Done>, bool) {
    let mut output = Vec::new();

    for (lane_ix, lane) in lanes.iter_mut().enumerate() {
        // Reliable messages, in stream order.
        loop {
            let available = lane.recv_seq_cursor.wrapping_sub(lane.recv_tail);
            let Some((size, start)) = wire::peek_message_prefix(&lane.recv, lane.recv_tail, available)
            else {
                break;
            };
            if output.len() >= max_messages {
                return (output, true);
            }

            let mut payload = factory.get_buffer(size);
            lane.recv.read(start, &mut payload[..size]);
            payload.truncate(size);

            lane.recv_tail = start.wrapping_add(size as u32);
            // The read cursor moved, so the advertised window changed.
            lane.do_send_acks = true;
            lane.stats.recv_messages_reliable += 1;
            trace!(lane = lane.id, size, "reliable message complete");

            output.push(Done {
                lane: lane_ix,
                lane_id: lane.id,
                seq_id: 0,
                reliable: true,
                payload,
                arrival_time: now,
                completion_time: now,
            });
        }

        // Unreliable messages, in arrival order.
        while lane.done_tail != lane.done_head {
            if output.len() >= max_messages {
                return (output, true);
            }
            match lane.pop_done() {
                Some(done) => output.push(done),
                None => break,
            }
        }
    }

    (output, false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::PooledBufferFactory;
    use crate::lane::LaneConfig;
    use crate::proto::enqueue;

    fn lane() -> Lane {
        Lane::new(11, &LaneConfig::default()).unwrap()
    }

    /// Feed framed messages straight into the receive ring, as if segments
    /// had already been applied contiguously.
    fn receive_framed(lane: &mut Lane, payload: &[u8]) {
        let mut cursor = lane.recv_seq_cursor;
        cursor = wire::write_message_prefix(&mut lane.recv, cursor, payload.len());
        lane.recv.write(cursor, payload);
        lane.recv_seq_cursor = cursor.wrapping_add(payload.len() as u32);
    }

    fn drain_all(lane: &mut Lane) -> Vec<Done> {
        let mut factory = PooledBufferFactory::default();
        let (done, more) = drain(
            &mut factory,
            std::slice::from_mut(lane),
            Instant::now(),
            64,
        );
        assert!(!more);
        done
    }

    #[test]
    fn test_single_message() {
        let mut lane = lane();
        receive_framed(&mut lane, b"hello");

        let done = drain_all(&mut lane);
        assert_eq!(done.len(), 1);
        assert!(done[0].reliable);
        assert_eq!(done[0].lane_id, 11);
        assert_eq!(done[0].payload, b"hello");
        assert_eq!(lane.recv_tail, 6);
        assert!(lane.do_send_acks);
    }

    #[test]
    fn test_messages_in_send_order() {
        let mut lane = lane();
        receive_framed(&mut lane, b"first");
        receive_framed(&mut lane, b"second");

        let done = drain_all(&mut lane);
        assert_eq!(done.len(), 2);
        assert_eq!(done[0].payload, b"first");
        assert_eq!(done[1].payload, b"second");
    }

    #[test]
    fn test_zero_length_message_drains() {
        let mut lane = lane();
        receive_framed(&mut lane, b"");

        let done = drain_all(&mut lane);
        assert_eq!(done.len(), 1);
        assert!(done[0].payload.is_empty());
        assert_eq!(lane.recv_tail, 1);
    }

    #[test]
    fn test_extended_frame_drains() {
        let mut lane = lane();
        let payload = vec![0xEE; 300];
        receive_framed(&mut lane, &payload);

        let done = drain_all(&mut lane);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].payload, payload);
        assert_eq!(lane.recv_tail, 305);
    }

    #[test]
    fn test_partial_message_waits() {
        let mut lane = lane();
        receive_framed(&mut lane, b"abcdef");
        // Only the prefix and half the payload have arrived.
        lane.recv_seq_cursor = 4;

        let done = drain_all(&mut lane);
        assert!(done.is_empty());
        assert_eq!(lane.recv_tail, 0);
        assert!(!lane.do_send_acks);

        // Remainder arrives.
        lane.recv_seq_cursor = 7;
        let done = drain_all(&mut lane);
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].payload, b"abcdef");
    }

    #[test]
    fn test_bare_extended_prefix_waits() {
        let mut lane = lane();
        receive_framed(&mut lane, &[1u8; 300]);
        lane.recv_seq_cursor = 3; // sentinel + 2 of 4 length bytes

        assert!(drain_all(&mut lane).is_empty());
    }

    #[test]
    fn test_unreliable_drained_after_reliable() {
        let mut lane = lane();
        let now = Instant::now();
        lane.push_done(Done {
            lane: 0,
            lane_id: 11,
            seq_id: 3,
            reliable: false,
            payload: b"u".to_vec(),
            arrival_time: now,
            completion_time: now,
        });
        receive_framed(&mut lane, b"r");

        let done = drain_all(&mut lane);
        assert_eq!(done.len(), 2);
        assert!(done[0].reliable);
        assert!(!done[1].reliable);
        assert_eq!(done[1].seq_id, 3);
    }

    #[test]
    fn test_budget_reports_more() {
        let mut lane = lane();
        receive_framed(&mut lane, b"one");
        receive_framed(&mut lane, b"two");
        receive_framed(&mut lane, b"three");

        let mut factory = PooledBufferFactory::default();
        let (done, more) = drain(
            &mut factory,
            std::slice::from_mut(&mut lane),
            Instant::now(),
            2,
        );
        assert_eq!(done.len(), 2);
        assert!(more);

        let (done, more) = drain(
            &mut factory,
            std::slice::from_mut(&mut lane),
            Instant::now(),
            2,
        );
        assert_eq!(done.len(), 1);
        assert!(!more);
        assert_eq!(done[0].payload, b"three");
    }

    #[test]
    fn test_roundtrip_from_enqueue() {
        // Frame with the send path, copy the stream across, drain.
        let mut sender = lane();
        let mut receiver = lane();
        for len in [0usize, 1, 254, 255, 256, 1024] {
            enqueue::insert_reliable(&mut sender, &vec![0xABu8; len]);
        }

        let total = sender.send_head;
        let mut stream = vec![0u8; total as usize];
        sender.send.read(0, &mut stream);
        receiver.recv.write(0, &stream);
        receiver.recv_seq_cursor = total;

        let done = drain_all(&mut receiver);
        assert_eq!(done.len(), 6);
        for (entry, len) in done.iter().zip([0usize, 1, 254, 255, 256, 1024]) {
            assert_eq!(entry.payload.len(), len);
            assert!(entry.payload.iter().all(|b| *b == 0xAB));
        }
    }
}
