//! VCPU core (spec component C6): instruction cache/decoder, software
//! memory TLB, event queue, injection/TSC/MSR modelling, and the BIOS
//! re-entry trampoline.
//!
//! This crate stands on its own: every piece here is exercised by unit
//! tests without a real KVM vCPU. The `vmm` binary wires it in alongside
//! KVM's hardware-accelerated execution, using it specifically for the
//! paths KVM doesn't model on its own (real-mode BIOS service calls,
//! event-queue prioritisation feeding interrupt injection, and the memory
//! cache backing device DMA).

pub mod bios;
pub mod cache;
pub mod core;
pub mod decoder;
pub mod events;
pub mod injection;
pub mod memcache;
pub mod tlb;

pub use bios::{service_int, DiskCallOutcome, IretFrame, PendingDiskCall, StubRange, DISK_TIMEOUT_SECS};
pub use cache::{Fingerprint, InstrCache};
pub use core::{ActivityState, RegisterFile, VcpuCore};
pub use decoder::{decode, ArithOp, DecodeError, Instruction, ModRmInfo, PortOperand, Width};
pub use events::{CpuGate, EventBits, EventWord, Prioritized};
pub use injection::{collapse_fault, Collapse, Injection, InjectionKind, TscModel};
pub use memcache::{MemCache, MemCacheError};
pub use tlb::{translate, Access, FaultCode, PageFault, PagingFeatures, PhysReader};
