//! Injection word, triple-fault collapse, and TSC/MSR modelling
//! (spec.md §4.6 "Injection, TSC, and MSRs").

/// Why a vector is being injected. Hard/soft exceptions distinguish
/// whether the instruction length must be added to the return address;
/// ext-int/soft-interrupt track the two external-vector sources named in
/// the event-priority list (EXTINT, INTR).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectionKind {
    ExtInt,
    Nmi,
    HardException,
    SoftException,
    SoftInterrupt,
}

/// One pending injection. `valid` is cleared on successful delivery;
/// `prioritize`'s step 6 ("if an injection is already pending, do nothing
/// until the guest acks it") reads this flag, not the event word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Injection {
    pub vector: u8,
    pub kind: InjectionKind,
    pub error_code: Option<u32>,
    pub valid: bool,
}

impl Injection {
    pub fn new(vector: u8, kind: InjectionKind, error_code: Option<u32>) -> Self {
        Injection { vector, kind, error_code, valid: true }
    }

    pub fn ack(&mut self) {
        self.valid = false;
    }
}

/// Vectors for the standard double/triple-fault collapse.
pub const VECTOR_DOUBLE_FAULT: u8 = 8;
pub const VECTOR_TRIPLE_FAULT_RESET: u8 = 0xff;

/// Outcome of delivering `new_fault` while `pending` is still unacked, per
/// the Intel double-fault contributory-exception table (spec.md §4.6 /
/// §7): "PF + PF collapses to double-fault; double-fault + fault collapses
/// to triple-fault, resetting the VCPU."
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collapse {
    /// No pre-existing fault to collapse with; deliver `new_fault` as-is.
    Deliver(u8),
    /// Collapsed into a double-fault (vector 8, error code 0).
    DoubleFault,
    /// A fault arrived while already delivering a double-fault: triple
    /// fault. The VCPU resets (spec.md §7: "triple-fault raises RESET on
    /// the VCPU's own event queue").
    TripleFault,
}

/// Whether `vector` is one of the contributory exceptions that chain into
/// a double-fault (divide error, invalid TSS, segment-not-present,
/// stack-fault, general-protection, page-fault — the set the Intel SDM's
/// double-fault table treats as "first event" contributory classes).
fn is_contributory(vector: u8) -> bool {
    matches!(vector, 0 | 10 | 11 | 12 | 13 | 14)
}

/// Collapse `new_fault` against whatever fault (if any) is still pending
/// delivery.
pub fn collapse_fault(pending: Option<u8>, new_fault: u8) -> Collapse {
    match pending {
        None => Collapse::Deliver(new_fault),
        Some(VECTOR_DOUBLE_FAULT) => Collapse::TripleFault,
        Some(p) if is_contributory(p) && (is_contributory(new_fault) || new_fault == VECTOR_DOUBLE_FAULT) => {
            Collapse::DoubleFault
        }
        Some(_) => Collapse::Deliver(new_fault),
    }
}

/// Per-VCPU TSC model: a base offset plus an optional WRMSR-applied delta.
/// `read()` reproduces whatever value was last WRMSR'd, drifting forward
/// at the same rate as the host's own clock thereafter (spec.md §4.6:
/// "WRMSR to TSC stores the delta so that subsequent reads reproduce the
/// written value, with drift compensation applied whenever the kernel
/// provides a fresh TSC snapshot").
#[derive(Debug, Clone, Copy, Default)]
pub struct TscModel {
    offset: i64,
}

impl TscModel {
    pub fn new() -> Self {
        TscModel { offset: 0 }
    }

    /// Guest reads TSC: host_tsc + offset.
    pub fn read(&self, host_tsc: u64) -> u64 {
        host_tsc.wrapping_add(self.offset as u64)
    }

    /// Guest WRMSR'd the TSC to `value` while the host clock reads
    /// `host_tsc`; recompute the offset so the next `read` reproduces it.
    pub fn write(&mut self, value: u64, host_tsc: u64) {
        self.offset = value.wrapping_sub(host_tsc) as i64;
    }

    /// Re-anchor the offset against a fresh host TSC snapshot without
    /// changing the guest-visible value, compensating for any drift
    /// accumulated between kernel snapshots.
    pub fn rebase(&mut self, old_host_tsc: u64, new_host_tsc: u64) {
        let drift = new_host_tsc.wrapping_sub(old_host_tsc) as i64;
        self.offset = self.offset.wrapping_sub(drift);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_pending_fault_delivers_as_is() {
        assert_eq!(collapse_fault(None, 14), Collapse::Deliver(14));
    }

    #[test]
    fn two_contributory_faults_collapse_to_double_fault() {
        assert_eq!(collapse_fault(Some(14), 14), Collapse::DoubleFault);
        assert_eq!(collapse_fault(Some(13), 14), Collapse::DoubleFault);
    }

    #[test]
    fn double_fault_plus_any_fault_is_triple_fault() {
        assert_eq!(collapse_fault(Some(VECTOR_DOUBLE_FAULT), 14), Collapse::TripleFault);
    }

    #[test]
    fn unrelated_vector_does_not_collapse() {
        // A breakpoint (#BP, vector 3) arriving while a PF is pending
        // isn't a contributory pair, so it delivers normally.
        assert_eq!(collapse_fault(Some(14), 3), Collapse::Deliver(3));
    }

    #[test]
    fn tsc_write_then_read_reproduces_value() {
        let mut tsc = TscModel::new();
        tsc.write(1_000_000, 500);
        assert_eq!(tsc.read(500), 1_000_000);
        // Time moves on by 10 host ticks; guest sees the same delta.
        assert_eq!(tsc.read(510), 1_000_010);
    }

    #[test]
    fn rebase_preserves_guest_visible_value() {
        let mut tsc = TscModel::new();
        tsc.write(1_000_000, 500);
        let before = tsc.read(700);
        tsc.rebase(700, 10_700);
        let after = tsc.read(10_700);
        assert_eq!(before, after);
    }

    #[test]
    fn injection_ack_clears_valid() {
        let mut inj = Injection::new(0x21, InjectionKind::ExtInt, None);
        assert!(inj.valid);
        inj.ack();
        assert!(!inj.valid);
    }
}
