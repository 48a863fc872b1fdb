//! The motherboard: owns every named bus and hands out `BusHandle` clones to
//! devices at construction time.
//!
//! The original C/C++ device model gave every device a raw pointer back to
//! its owning motherboard so it could reach any other bus. spec.md §9 flags
//! that as a cyclic device-graph problem: here a device is handed exactly
//! the handles it needs, by value, and never sees the `Motherboard` itself.

use std::sync::Arc;

use crate::bus::{Bus, BusHandle, DispatchOrder};
use crate::messages::{
    Bios, Console, DiskCommit, DiskRequest, Discovery, HostOp, Irq, LegacyEvent, MemRegion, Mmio,
    PciConfig, PortIo,
};

/// Every bus a device model might need, already wired with its dispatch
/// discipline (spec.md §4.5 names the discipline per family).
pub struct Motherboard {
    pub port_io: BusHandle<PortIo>,
    pub mmio: BusHandle<Mmio>,
    pub mem_region: BusHandle<MemRegion>,
    pub pci_config: BusHandle<PciConfig>,
    pub irq: BusHandle<Irq>,
    pub legacy_event: BusHandle<LegacyEvent>,
    pub disk_request: BusHandle<DiskRequest>,
    pub disk_commit: BusHandle<DiskCommit>,
    pub console: BusHandle<Console>,
    pub discovery: BusHandle<Discovery>,
    pub host_op: BusHandle<HostOp>,
    pub bios: BusHandle<Bios>,
}

impl Motherboard {
    /// Build a fresh motherboard with every bus empty. Devices are
    /// constructed afterward and given `Arc::clone`s of the handles they
    /// need (see `devices::Device::attach` in the device crate).
    pub fn new() -> Arc<Motherboard> {
        Arc::new(Motherboard {
            // Port-IO and MMIO are address-range claims: the first device
            // whose decode matches wins, so LIFO with early-out lets a
            // later-registered overlay (e.g. a debug shim) shadow an
            // earlier one without removing it.
            port_io: Bus::new(DispatchOrder::Lifo { early_out: true }),
            mmio: Bus::new(DispatchOrder::Lifo { early_out: true }),
            // Memory-region publication is cooperative bookkeeping: every
            // subscriber (TLB, DMA-capable devices) must see every publish.
            mem_region: Bus::new(DispatchOrder::Fifo),
            // PCI config space is decoded by exactly one host bridge model.
            pci_config: Bus::new(DispatchOrder::Lifo { early_out: true }),
            // IRQ lines fan out to every PIC/IOAPIC model that cares.
            irq: Bus::new(DispatchOrder::Fifo),
            legacy_event: Bus::new(DispatchOrder::Fifo),
            // Disk completions are matched by usertag, not by claiming
            // handler, so every listener must see every commit.
            disk_request: Bus::new(DispatchOrder::Lifo { early_out: true }),
            disk_commit: Bus::new(DispatchOrder::Fifo),
            console: Bus::new(DispatchOrder::Fifo),
            discovery: Bus::new(DispatchOrder::Fifo),
            // Host-op requests are serviced round-robin across whichever
            // root-task proxies are registered, to spread load evenly.
            host_op: Bus::new(DispatchOrder::RoundRobin),
            // Exactly one BIOS façade answers a given vector; early-out so a
            // more specific overlay can shadow the generic handler.
            bios: Bus::new(DispatchOrder::Lifo { early_out: true }),
        })
    }
}
