//! Forwarding loop (C7): a thin two-port forward-and-drop consumer of
//! the core. Kept generic over [`NicDevice`] so it is fully testable
//! without real hardware; the binary wires it to real [`DeviceHandle`]s.

use crate::ring::NicDevice;

pub const BATCH_SIZE: usize = 32;

/// Only sample the clock every `STATS_SAMPLE_MASK + 1` iterations, "so
/// we don't poll the time unnecessarily" (the original forwarding app's
/// own rationale, carried over verbatim).
pub const STATS_SAMPLE_MASK: u64 = 0xFFF;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ForwardStats {
    pub rx: usize,
    pub tx: usize,
}

/// One iteration of the forward-and-drop loop: drain up to
/// [`BATCH_SIZE`] buffers from `rx_dev`'s `rx_queue`, touch each packet's
/// second byte (so the workload can't be optimized away as "packet never
/// leaves L3"), then hand them to `tx_dev`'s `tx_queue`. Whatever the
/// transmitter does not accept is dropped immediately rather than
/// retried — blocking on TX would amplify latency without raising
/// throughput once the egress link is saturated.
pub fn forward_once(
    rx_dev: &mut dyn NicDevice,
    rx_queue: u16,
    tx_dev: &mut dyn NicDevice,
    tx_queue: u16,
) -> ForwardStats {
    let mut bufs = Vec::with_capacity(BATCH_SIZE);
    let num_rx = rx_dev.rx_batch(rx_queue, &mut bufs, BATCH_SIZE);

    let mut num_tx = 0;
    if num_rx > 0 {
        for buf in bufs.iter_mut() {
            if let Some(byte) = buf.get_mut(1) {
                *byte = byte.wrapping_add(1);
            }
        }
        num_tx = tx_dev.tx_batch(tx_queue, &mut bufs, num_rx);
        // whatever tx_batch left in `bufs` (bufs[num_tx..]) is dropped
        // here, returning those slots to their pool rather than
        // backpressuring the receive side.
        bufs.clear();
    }

    ForwardStats {
        rx: num_rx,
        tx: num_tx,
    }
}

/// Whether iteration `counter` should trigger a stats sample, matching
/// the original app's `(counter & 0xFFF) == 0` cadence.
pub fn should_sample_stats(counter: u64) -> bool {
    counter & STATS_SAMPLE_MASK == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::test_pool;
    use crate::ring::LoopbackDevice;

    fn filled_packet(pool: &std::rc::Rc<crate::pool::Pool>) -> crate::pool::PacketBuffer {
        let mut buf = pool.alloc_one().expect("pool not exhausted in test");
        buf.set_len(60);
        buf
    }

    /// spec.md §8 scenario 5 ("Forwarding steady state"): rx always
    /// yields a full batch, tx always accepts everything. After N
    /// iterations the pool's free_top returns to its initial value and
    /// no buffer is ever dropped.
    #[test]
    fn forwarding_steady_state_conserves_pool() {
        let iterations = 10;
        let pool = test_pool(BATCH_SIZE * 2, 128);
        let initial_free_top = pool.free_top();

        let mut a = LoopbackDevice::new();
        let mut b = LoopbackDevice::new(); // unlimited accept capacity

        let mut total_dropped = 0usize;
        for _ in 0..iterations {
            for _ in 0..BATCH_SIZE {
                a.enqueue_rx(filled_packet(&pool));
            }
            let stats = forward_once(&mut a, 0, &mut b, 0);
            assert_eq!(stats.rx, BATCH_SIZE);
            assert_eq!(stats.tx, BATCH_SIZE);
            total_dropped += stats.rx - stats.tx;
            // tx_batch on LoopbackDevice drops what it accepts
            // immediately (simulating instant hardware completion), so
            // the pool should be fully replenished after each iteration.
            assert_eq!(pool.free_top(), initial_free_top);
        }
        assert_eq!(total_dropped, 0);
    }

    /// spec.md §8 scenario 6 ("Forwarding with congestion"): tx only
    /// accepts 20 of 32 per iteration; the caller frees exactly 12 per
    /// iteration and num_tx < num_rx by exactly 12.
    #[test]
    fn forwarding_congestion_drops_exact_remainder() {
        let pool = test_pool(BATCH_SIZE * 2, 128);
        let initial_free_top = pool.free_top();

        let mut a = LoopbackDevice::new();
        let mut b = LoopbackDevice::new().with_accept_capacity(20);

        for _ in 0..BATCH_SIZE {
            a.enqueue_rx(filled_packet(&pool));
        }
        let stats = forward_once(&mut a, 0, &mut b, 0);

        assert_eq!(stats.rx, BATCH_SIZE);
        assert_eq!(stats.tx, 20);
        assert_eq!(stats.rx - stats.tx, 12);
        // the 20 sent are freed by the (simulated) hardware, and the 12
        // unaccepted ones are freed by the forwarding loop itself: the
        // pool should still be back to its initial free count.
        assert_eq!(pool.free_top(), initial_free_top);
    }

    #[test]
    fn stats_sample_cadence_matches_mask() {
        assert!(should_sample_stats(0));
        assert!(!should_sample_stats(1));
        assert!(should_sample_stats(STATS_SAMPLE_MASK + 1));
    }
}
