//! Session and service extra data (spec.md §3 "Client entry (session)" /
//! "Service entry"), stored in `registry::Entry::extra` alongside the
//! identity/pseudonym fields `registry::Table` already manages.

use std::sync::Arc;

use kernel_iface::Semaphore;

/// Role-specific fields for a row in the session table. `registry::Entry`
/// already carries `pseudonym`/`identity`/`name` (the service name a
/// session was opened against); this holds the rest of spec.md §3's
/// client-entry fields.
pub struct SessionExtra {
    /// Client-provided singleton cap, or 0 if none has been SET yet.
    pub singleton: u32,
    /// Posted when a matching REGISTER arrives, so a caller blocked in
    /// GET_PORTAL after a `Retry` wakes up and retries (spec.md §8 seed
    /// scenario 3).
    pub wake: Arc<dyn Semaphore>,
    /// The CPU this session's client is pinned to, used by GET_PORTAL to
    /// match against a service's `cpu_id`.
    pub cpu_id: u32,
}

/// Role-specific fields for a row in the service table.
pub struct ServiceExtra {
    pub cpu_id: u32,
    pub portal: u32,
    /// Memory/cap amounts this REGISTER charged, so UNREGISTER can refund
    /// the exact amounts (spec.md §8: "killing C frees exactly the
    /// physical memory C was charged").
    pub charged_mem: i64,
    pub charged_caps: i64,
}
