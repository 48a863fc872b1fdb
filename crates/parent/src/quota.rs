//! Quota ledger and the `QuotaGuard` two-phase commit helper (spec.md §4.4
//! REGISTER: "charge memory and cap quotas through `QuotaGuard` ...
//! roll back on failure").

use std::sync::atomic::{AtomicI64, Ordering};

use crate::wire::ProtoError;

/// Global memory/capability budget. A client's REGISTER (and the root
/// task's own module admission) charges against this before any table
/// entry is linked in; an uncommitted [`QuotaGuard`] refunds both amounts
/// on drop, so every early-return failure path is automatically
/// exception-safe.
#[derive(Debug, Default)]
pub struct QuotaLedger {
    mem_available: AtomicI64,
    caps_available: AtomicI64,
}

impl QuotaLedger {
    pub fn new(mem_budget: i64, cap_budget: i64) -> Self {
        QuotaLedger {
            mem_available: AtomicI64::new(mem_budget),
            caps_available: AtomicI64::new(cap_budget),
        }
    }

    fn try_charge(counter: &AtomicI64, amount: i64) -> bool {
        let mut current = counter.load(Ordering::SeqCst);
        loop {
            if current < amount {
                return false;
            }
            match counter.compare_exchange_weak(
                current,
                current - amount,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    fn refund_counter(counter: &AtomicI64, amount: i64) {
        counter.fetch_add(amount, Ordering::SeqCst);
    }

    pub fn mem_available(&self) -> i64 {
        self.mem_available.load(Ordering::SeqCst)
    }

    pub fn caps_available(&self) -> i64 {
        self.caps_available.load(Ordering::SeqCst)
    }

    /// Unconditional refund, used by UNREGISTER to return exactly the
    /// amounts its matching REGISTER charged (spec.md §8: "killing C frees
    /// exactly the physical memory C was charged").
    pub fn refund(&self, mem: i64, caps: i64) {
        Self::refund_counter(&self.mem_available, mem);
        Self::refund_counter(&self.caps_available, caps);
    }
}

/// RAII two-phase commit over a mem charge followed by a cap charge,
/// modelling the original's nested `QuotaGuard<ServerData>` pair. Charges
/// both resources at construction; an un-committed guard refunds both on
/// drop. `commit()` consumes the guard, suppressing the rollback.
pub struct QuotaGuard<'a> {
    ledger: &'a QuotaLedger,
    mem: i64,
    caps: i64,
    committed: bool,
}

impl<'a> QuotaGuard<'a> {
    pub fn charge(ledger: &'a QuotaLedger, mem: i64, caps: i64) -> Result<Self, ProtoError> {
        if !QuotaLedger::try_charge(&ledger.mem_available, mem) {
            return Err(ProtoError::Resource);
        }
        if !QuotaLedger::try_charge(&ledger.caps_available, caps) {
            QuotaLedger::refund_counter(&ledger.mem_available, mem);
            return Err(ProtoError::Resource);
        }
        Ok(QuotaGuard { ledger, mem, caps, committed: false })
    }

    pub fn commit(mut self) {
        self.committed = true;
    }
}

impl Drop for QuotaGuard<'_> {
    fn drop(&mut self) {
        if !self.committed {
            QuotaLedger::refund_counter(&self.ledger.mem_available, self.mem);
            QuotaLedger::refund_counter(&self.ledger.caps_available, self.caps);
        }
    }
}
