//! Ties the instruction cache, TLB, memory cache, event queue, and
//! injection/fault machinery into the single per-VCPU value spec.md §9
//! calls for ("move to a single `Core` value constructed at entry").

use crate::events::{CpuGate, EventBits, EventWord, Prioritized};
use crate::injection::{collapse_fault, Collapse, Injection, InjectionKind, TscModel};

/// The guest-visible register file. `power_on_reset` always produces the
/// same values (the round-trip law in spec.md §8: "Power-on-reset of a
/// VCPU produces the same initial register state on every call"), matching
/// the architectural x86 reset state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterFile {
    pub eax: u32,
    pub ebx: u32,
    pub ecx: u32,
    pub edx: u32,
    pub esi: u32,
    pub edi: u32,
    pub ebp: u32,
    pub esp: u32,
    pub eip: u32,
    pub eflags: u32,
    pub cs_selector: u16,
    pub cs_base: u32,
    pub cr0: u32,
    pub cr3: u32,
    pub cr4: u32,
}

impl RegisterFile {
    pub fn power_on_reset() -> Self {
        RegisterFile {
            eax: 0,
            ebx: 0,
            ecx: 0,
            edx: 0,
            esi: 0,
            edi: 0,
            ebp: 0,
            esp: 0,
            eip: 0x0000_fff0,
            eflags: 0x0000_0002,
            cs_selector: 0xf000,
            cs_base: 0xffff_0000,
            cr0: 0x6000_0010,
            cr3: 0,
            cr4: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActivityState {
    Running,
    Halted,
    WaitForSipi,
}

/// Per-VCPU state threaded through a worker thread's exit loop. Built once
/// at VCPU creation and never reached through a global (spec.md §9's
/// "global singletons" redesign flag).
pub struct VcpuCore {
    pub registers: RegisterFile,
    pub activity: ActivityState,
    pub events: EventWord,
    pub tsc: TscModel,
    pending_fault: Option<u8>,
    injection: Option<Injection>,
}

impl VcpuCore {
    pub fn new() -> Self {
        VcpuCore {
            registers: RegisterFile::power_on_reset(),
            activity: ActivityState::Running,
            events: EventWord::new(),
            tsc: TscModel::new(),
            pending_fault: None,
            injection: None,
        }
    }

    fn gate(&self, interrupt_flag: bool, sti_shadow: bool, nmi_shadow: bool) -> CpuGate {
        CpuGate {
            interrupt_flag,
            sti_shadow,
            nmi_shadow,
            halted: self.activity == ActivityState::Halted,
            smi_inhibited: false,
            injection_pending: self.injection.map(|i| i.valid).unwrap_or(false),
        }
    }

    /// Drive one VM-exit's worth of event prioritisation (spec.md §4.6's
    /// 10-step list), returning whichever event was delivered.
    pub fn prioritize_exit(&mut self, interrupt_flag: bool, sti_shadow: bool, nmi_shadow: bool) -> Option<Prioritized> {
        let gate = self.gate(interrupt_flag, sti_shadow, nmi_shadow);
        let result = self.events.prioritize(gate);
        match result {
            Some(Prioritized::Reset) => self.reset(),
            Some(Prioritized::Sipi) => self.activity = ActivityState::Running,
            Some(Prioritized::Init) => self.activity = ActivityState::WaitForSipi,
            _ => {}
        }
        result
    }

    /// Reset to power-on state: spec.md §4.6 step 2 ("clears registers to
    /// power-on, reseeds CPUID, sends a LAPIC RESET event"). CPUID reseed
    /// and the LAPIC notification are the device model's responsibility;
    /// this crate owns only the register/activity/fault-state reset.
    pub fn reset(&mut self) {
        self.registers = RegisterFile::power_on_reset();
        self.activity = ActivityState::WaitForSipi;
        self.pending_fault = None;
        self.injection = None;
    }

    /// Deliver `vector` through the double/triple-fault collapse table
    /// (spec.md §4.6 / §7). A triple fault resets the VCPU and raises
    /// `RESET` on its own event queue so the next exit re-enters through
    /// the BIOS/MBI path from the reset vector, exactly as spec.md §8
    /// scenario 6 describes.
    pub fn raise_fault(&mut self, vector: u8, error_code: Option<u32>) {
        match collapse_fault(self.pending_fault, vector) {
            Collapse::Deliver(v) => {
                self.pending_fault = Some(v);
                self.injection = Some(Injection::new(v, InjectionKind::HardException, error_code));
            }
            Collapse::DoubleFault => {
                self.pending_fault = Some(crate::injection::VECTOR_DOUBLE_FAULT);
                self.injection = Some(Injection::new(crate::injection::VECTOR_DOUBLE_FAULT, InjectionKind::HardException, Some(0)));
            }
            Collapse::TripleFault => {
                self.reset();
                self.events.raise(EventBits::RESET);
            }
        }
    }

    /// Acknowledge the currently pending injection (the guest consumed it
    /// via a real interrupt-window exit) and clear the collapse state.
    pub fn ack_injection(&mut self) {
        if let Some(inj) = self.injection.as_mut() {
            inj.ack();
        }
        self.pending_fault = None;
        self.injection = None;
    }

    pub fn pending_injection(&self) -> Option<Injection> {
        self.injection
    }
}

impl Default for VcpuCore {
    fn default() -> Self {
        Self::new()
    }
}
