//! RX/TX ring interface (C6): the contract a concrete NIC driver
//! provides over its hardware descriptor rings. Register layouts, link
//! training, and PHY init for any specific NIC family are out of scope
//! for this core — a real driver specializes this trait for one family
//! (e.g. the 82599) the way spec.md §1 calls for.
//!
//! Both operations are non-blocking: they reflect whatever the hardware
//! head/tail pointers say at call time, and never sleep or yield.

use crate::pool::PacketBuffer;

/// A NIC bound to one or more RX/TX queue pairs.
pub trait NicDevice {
    /// Drains up to `max` received buffers from `queue_id` into `out`,
    /// returning how many were appended. Ownership of the appended
    /// buffers transfers to the caller.
    fn rx_batch(&mut self, queue_id: u16, out: &mut Vec<PacketBuffer>, max: usize) -> usize;

    /// Transmits the first `n` buffers of `bufs` on `queue_id`,
    /// returning how many were accepted (`sent <= n`). Ownership of the
    /// accepted prefix transfers to the device; the remaining
    /// `bufs[sent..n]` are left in place, still owned by the caller.
    fn tx_batch(&mut self, queue_id: u16, bufs: &mut Vec<PacketBuffer>, n: usize) -> usize;
}

/// An in-memory loopback `NicDevice`, useful for exercising the
/// forwarding loop and the pool without real hardware: `rx_batch`
/// returns whatever a test or demo previously queued with
/// [`LoopbackDevice::enqueue_rx`], and `tx_batch` accepts up to
/// `accept_capacity` buffers per call before refusing the rest — the
/// same "some buffers are not accepted" shape a real NIC's TX ring
/// presents once it saturates the link. Accepted buffers are dropped
/// (and so returned to their pool) immediately, simulating hardware
/// that completes transmission instantly.
#[derive(Default)]
pub struct LoopbackDevice {
    pending_rx: std::collections::VecDeque<PacketBuffer>,
    accept_capacity: Option<usize>,
}

impl LoopbackDevice {
    pub fn new() -> Self {
        LoopbackDevice {
            pending_rx: std::collections::VecDeque::new(),
            accept_capacity: None,
        }
    }

    /// Limits how many buffers a single `tx_batch` call accepts,
    /// modeling TX-ring congestion.
    pub fn with_accept_capacity(mut self, capacity: usize) -> Self {
        self.accept_capacity = Some(capacity);
        self
    }

    pub fn enqueue_rx(&mut self, buf: PacketBuffer) {
        self.pending_rx.push_back(buf);
    }

    pub fn pending_rx_len(&self) -> usize {
        self.pending_rx.len()
    }
}

impl NicDevice for LoopbackDevice {
    fn rx_batch(&mut self, _queue_id: u16, out: &mut Vec<PacketBuffer>, max: usize) -> usize {
        let mut count = 0;
        while count < max {
            match self.pending_rx.pop_front() {
                Some(buf) => {
                    out.push(buf);
                    count += 1;
                }
                None => break,
            }
        }
        count
    }

    fn tx_batch(&mut self, _queue_id: u16, bufs: &mut Vec<PacketBuffer>, n: usize) -> usize {
        let capacity = self.accept_capacity.unwrap_or(usize::MAX);
        let sent = n.min(capacity).min(bufs.len());
        bufs.drain(0..sent);
        sent
    }
}
