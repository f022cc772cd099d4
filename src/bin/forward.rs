//! Two-port forwarding app: `corenic-fwd <pci-addr-1> <pci-addr-2>`.
//!
//! Binds both devices (auto-selecting direct-PCI or vfio per
//! `iommu_group` presence), allocates one packet pool per device, and
//! runs the forward-and-drop loop forever. All initialization failures
//! are fatal: a userspace driver cannot proceed with partial hardware
//! init.
//!
//! No concrete NIC family driver ships with this core (register layouts
//! for a specific chip are out of scope; see [`corenic::ring::NicDevice`]).
//! The loop below still exercises real BAR0 mappings and pools, driven
//! through the exact contract a real driver would implement, via an
//! in-memory loopback device that always has a packet ready to forward.

use std::rc::Rc;

use corenic::forward::{self, BATCH_SIZE};
use corenic::platform::monotonic_now;
use corenic::ring::LoopbackDevice;
use corenic::{BindMode, DeviceHandle, Pool};

const NUM_POOL_ENTRIES: usize = 4096;
const STATS_INTERVAL_NS: u64 = 1_000_000_000;

fn main() {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() != 3 {
        eprintln!("{} forwards packets between two ports.", args[0]);
        eprintln!("Usage: {} <pci bus id 1> <pci bus id 2>", args[0]);
        std::process::exit(1);
    }
    let pci_a = args[1].clone();
    let pci_b = args[2].clone();

    let dev_a = DeviceHandle::bind(&pci_a, BindMode::Auto)
        .unwrap_or_else(|e| panic!("failed to bind {pci_a}: {e}"));
    let dev_b = DeviceHandle::bind(&pci_b, BindMode::Auto)
        .unwrap_or_else(|e| panic!("failed to bind {pci_b}: {e}"));
    log::info!(
        "bound {pci_a} (bar0 {} bytes), {pci_b} (bar0 {} bytes)",
        dev_a.bar0().len,
        dev_b.bar0().len
    );

    let pool_a = Pool::new(NUM_POOL_ENTRIES, 0, dev_a.address_space(), dev_a.iommu())
        .unwrap_or_else(|e| panic!("failed to allocate packet pool for {pci_a}: {e}"));
    let pool_b = Pool::new(NUM_POOL_ENTRIES, 0, dev_b.address_space(), dev_b.iommu())
        .unwrap_or_else(|e| panic!("failed to allocate packet pool for {pci_b}: {e}"));

    let mut nic_a = LoopbackDevice::new();
    let mut nic_b = LoopbackDevice::new();

    let mut counter: u64 = 0;
    let mut last_stats = monotonic_now();
    let (mut rx_a, mut tx_a, mut rx_b, mut tx_b) = (0u64, 0u64, 0u64, 0u64);

    loop {
        refill(&mut nic_a, &pool_a);
        refill(&mut nic_b, &pool_b);

        let stats_a_to_b = forward::forward_once(&mut nic_a, 0, &mut nic_b, 0);
        let stats_b_to_a = forward::forward_once(&mut nic_b, 0, &mut nic_a, 0);
        rx_a += stats_a_to_b.rx as u64;
        tx_a += stats_a_to_b.tx as u64;
        rx_b += stats_b_to_a.rx as u64;
        tx_b += stats_b_to_a.tx as u64;

        // don't poll the time unnecessarily
        counter = counter.wrapping_add(1);
        if forward::should_sample_stats(counter) {
            let now = monotonic_now();
            if now.saturating_sub(last_stats) > STATS_INTERVAL_NS {
                log::info!(
                    "{pci_a}: rx={rx_a} tx={tx_a} ({:.2} Mpps)",
                    rx_a as f64 / 1e6
                );
                log::info!(
                    "{pci_b}: rx={rx_b} tx={tx_b} ({:.2} Mpps)",
                    rx_b as f64 / 1e6
                );
                rx_a = 0;
                tx_a = 0;
                rx_b = 0;
                tx_b = 0;
                last_stats = now;
            }
        }
    }
}

/// Keeps a loopback device's pending-RX queue topped up from its pool,
/// standing in for a real driver's ring replenishment.
fn refill(nic: &mut LoopbackDevice, pool: &Rc<Pool>) {
    while nic.pending_rx_len() < BATCH_SIZE {
        match pool.alloc_one() {
            Some(mut buf) => {
                buf.set_len(64);
                nic.enqueue_rx(buf);
            }
            None => break,
        }
    }
}
