//! Parent protocol dispatcher (spec component C4, spec.md §4.4): the
//! process-wide registry that mediates every "I am client X; I want to
//! talk to service Y" request, gated by the command-line permission model
//! in `nulcfg` and backed by the `registry` client tables.

pub mod dispatch;
pub mod quota;
pub mod session;
pub mod wire;

pub use dispatch::Parent;
pub use quota::{QuotaGuard, QuotaLedger};
pub use session::{ServiceExtra, SessionExtra};
pub use wire::{Op, ProtoError};
