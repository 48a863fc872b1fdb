//! External interfaces the core relies on (spec.md §6): command-line token
//! policy, the Nulconfig boot-configuration file format, and the
//! Multiboot-style MBI a module's initial address space is built around.

pub mod cmdline;
pub mod mbi;
pub mod nulconfig;

pub use cmdline::{get_quota, Cmdline, QuotaDecision};
pub use mbi::{MbiBuilder, MemMapEntry, MemMapType, Module as MbiModule};
pub use nulconfig::{parse, ModuleEntry, NulconfigError};
