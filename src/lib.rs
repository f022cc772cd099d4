//! Userspace poll-mode NIC driver core.
//!
//! Binds a PCIe Ethernet NIC away from the kernel, maps its device
//! registers and DMA-capable packet buffers directly into this process,
//! and exposes a batched receive/transmit interface over a single
//! thread. A forwarding application ([`forward`]) is included as a thin
//! consumer; concrete NIC register layouts, link training, and stats
//! counter readout for any specific silicon family are out of scope —
//! those belong to a driver implementing [`ring::NicDevice`].

pub mod device;
pub mod error;
pub mod forward;
pub mod iommu;
pub mod memory;
pub mod pci;
pub mod platform;
pub mod pool;
pub mod ring;

pub use device::{BindMode, DeviceHandle};
pub use error::{DriverError, Result};
pub use memory::AddressSpace;
pub use pool::{PacketBuffer, Pool};
pub use ring::NicDevice;
