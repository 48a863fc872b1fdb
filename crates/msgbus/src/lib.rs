//! Message-bus device-model fabric (spec component C5).
//!
//! Device models never hold a pointer to each other or to a shared
//! "motherboard" object; they hold [`BusHandle`] clones handed to them at
//! construction (see [`motherboard::Motherboard`]), and talk to the rest of
//! the virtual machine only by sending typed messages.

mod bus;
mod messages;
mod motherboard;

pub use bus::{Bus, BusDevice, BusHandle, DeviceId, DispatchOrder};
pub use messages::{
    Bios, Console, DiskCommit, DiskOp, DiskRequest, DiskStatus, Discovery, HostOp, Irq,
    LegacyEvent, MemRegion, MemRegionGrant, Mmio, PciConfig, PortIo,
};
pub use motherboard::Motherboard;
