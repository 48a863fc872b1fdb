//! Event queue and prioritisation (spec.md §4.6).
//!
//! Events arrive asynchronously — IRQ handlers, IPI senders, the LAPIC
//! model, the console kill command — and are OR'd into a single atomic
//! word. A VCPU worker thread drains the word on every VM-exit and acts on
//! the highest-priority bit it finds, clearing only the bits it actually
//! delivered.

use std::sync::atomic::{AtomicU16, Ordering};

bitflags::bitflags! {
    /// Named event bits, in the order spec.md §4.6 prioritises them.
    pub struct EventBits: u16 {
        const DEBUG        = 1 << 0;
        const HOST         = 1 << 1;
        const RESET        = 1 << 2;
        const INIT         = 1 << 3;
        const SIPI         = 1 << 4;
        const SMI          = 1 << 5;
        const NMI          = 1 << 6;
        const EXTINT       = 1 << 7;
        const INTR         = 1 << 8;
        const STATE_BLOCK  = 1 << 9;
        const STATE_WAKEUP = 1 << 10;
    }
}

/// The event the VCPU core should act on next, per spec.md §4.6's 10-step
/// list. Everything not covered by a concrete variant falls out as `None`
/// (no event ready to deliver this exit).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prioritized {
    Debug,
    Host,
    Reset,
    Init,
    Sipi,
    Smi,
    Nmi,
    Extint,
    Intr,
}

/// The pieces of VCPU state the prioritisation rules need to read, other
/// than the event word itself. Cheap to construct fresh per exit; callers
/// own the authoritative copies.
#[derive(Debug, Clone, Copy)]
pub struct CpuGate {
    pub interrupt_flag: bool,
    pub sti_shadow: bool,
    pub nmi_shadow: bool,
    pub halted: bool,
    pub smi_inhibited: bool,
    pub injection_pending: bool,
}

/// Atomic event word. `raise` is `fetch_or`; `ack` is `fetch_and(!bits)` so
/// a raiser racing an acknowledger can never cause a lost update (spec.md
/// §5's "event bits are combined with atomic OR ... consumers
/// read-modify-write with atomic AND").
#[derive(Debug, Default)]
pub struct EventWord(AtomicU16);

impl EventWord {
    pub fn new() -> Self {
        EventWord(AtomicU16::new(0))
    }

    pub fn raise(&self, bits: EventBits) {
        self.0.fetch_or(bits.bits(), Ordering::SeqCst);
    }

    pub fn ack(&self, bits: EventBits) {
        self.0.fetch_and(!bits.bits(), Ordering::SeqCst);
    }

    pub fn pending(&self) -> EventBits {
        EventBits::from_bits_truncate(self.0.load(Ordering::SeqCst))
    }

    /// Apply spec.md §4.6's 10-step priority list against the current
    /// pending bits and `gate`, acknowledging whatever bit is delivered.
    /// Steps 6 and 8 ("do nothing" / "do not inject maskable") are encoded
    /// as early `None` returns rather than bits, since they deliver
    /// nothing this exit.
    pub fn prioritize(&self, gate: CpuGate) -> Option<Prioritized> {
        let pending = self.pending();

        if pending.contains(EventBits::DEBUG) {
            self.ack(EventBits::DEBUG);
            return Some(Prioritized::Debug);
        }
        if pending.contains(EventBits::HOST) {
            self.ack(EventBits::HOST);
            return Some(Prioritized::Host);
        }
        if pending.contains(EventBits::RESET) {
            self.ack(EventBits::RESET);
            return Some(Prioritized::Reset);
        }
        if pending.contains(EventBits::INIT) {
            self.ack(EventBits::INIT);
            return Some(Prioritized::Init);
        }
        if pending.contains(EventBits::SIPI) {
            self.ack(EventBits::SIPI);
            return Some(Prioritized::Sipi);
        }
        if pending.contains(EventBits::SMI) && !gate.smi_inhibited {
            self.ack(EventBits::SMI);
            return Some(Prioritized::Smi);
        }
        if gate.injection_pending {
            return None;
        }
        if pending.contains(EventBits::NMI) && !gate.sti_shadow && !gate.nmi_shadow {
            self.ack(EventBits::NMI);
            return Some(Prioritized::Nmi);
        }
        if !gate.interrupt_flag || gate.sti_shadow || gate.halted {
            return None;
        }
        if pending.contains(EventBits::EXTINT) {
            self.ack(EventBits::EXTINT);
            return Some(Prioritized::Extint);
        }
        if pending.contains(EventBits::INTR) {
            // INTR is additionally cleared by an explicit DEASS_INTR
            // message (spec.md §4.6); the priority pass itself still acks
            // it here once delivery is committed.
            self.ack(EventBits::INTR);
            return Some(Prioritized::Intr);
        }
        None
    }
}
