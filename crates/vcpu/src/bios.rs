//! BIOS re-entry trampoline (spec.md §4.6).
//!
//! The VBIOS installs a 16-byte reset stub at a high real-mode address.
//! When the guest executes an `INT n` whose vector falls inside the
//! stub's claimed range, the VCPU core raises [`msgbus::Bios`] on the BIOS
//! bus instead of trying to decode whatever the stub's body contains;
//! the handler fills in the guest's register mirror and patches the
//! IRET frame on the guest's own stack so `IF` propagates correctly on
//! return. Calls that must block (disk I/O) park the VCPU by reducing
//! EIP to the stub's single-byte `HLT` and re-arm on the next edge of
//! legacy IRQ 1 (spec.md §5's "BIOS disk: may suspend via HLT-loop until
//! commit arrives or timeout fires").

use msgbus::{Bios, BusHandle};

/// Real-mode IRET frame as it sits on the guest stack: IP, CS, FLAGS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IretFrame {
    pub ip: u16,
    pub cs: u16,
    pub flags: u16,
}

const FLAGS_IF: u16 = 1 << 9;

impl IretFrame {
    /// Patch the flags word so the interrupt flag the guest had before the
    /// trap is restored on return, exactly as a real `INT`/`IRET` pair
    /// would leave it.
    pub fn with_restored_if(mut self, interrupt_flag_was_set: bool) -> Self {
        if interrupt_flag_was_set {
            self.flags |= FLAGS_IF;
        } else {
            self.flags &= !FLAGS_IF;
        }
        self
    }
}

/// Whether the stub's claimed vector range covers `vector`.
#[derive(Debug, Clone, Copy)]
pub struct StubRange {
    pub low: u8,
    pub high: u8,
}

impl StubRange {
    pub fn covers(&self, vector: u8) -> bool {
        (self.low..=self.high).contains(&vector)
    }
}

/// A BIOS call still waiting on a disk commit. The VCPU parks at
/// `halt_eip` (the stub's single-byte `HLT`) until `wake` fires (an IRQ 1
/// edge) or the timeout elapses.
#[derive(Debug, Clone, Copy)]
pub struct PendingDiskCall {
    pub halt_eip: u32,
    pub usertag: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskCallOutcome {
    Resumed { carry: bool, ah: u8 },
    TimedOut,
}

/// Dispatch `vector` to the BIOS bus and return the real-mode register
/// values the handler produced, plus whether the carry flag (BIOS's
/// failure convention) should be set on return.
pub fn service_int(bus: &BusHandle<Bios>, vector: u8, regs_in: [u16; 6]) -> ([u16; 6], bool) {
    let mut msg = Bios { vector, regs_in, regs_out: [0; 6], carry_out: false };
    bus.send(&mut msg);
    (msg.regs_out, msg.carry_out)
}

/// Deadline for a parked BIOS disk call (spec.md §5: "a periodic BIOS-disk
/// timeout (5 s) marks the in-progress operation failed and wakes the
/// guest").
pub const DISK_TIMEOUT_SECS: u64 = 5;
