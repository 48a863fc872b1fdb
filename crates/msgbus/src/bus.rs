//! The generic publish-dispatch fabric (spec component C5).
//!
//! A `Bus<M>` is one statically typed message family (port-IO, MMIO,
//! PCI-config, ...). Handlers are registered against an arena index
//! ([`DeviceId`]), never a raw pointer or a back-reference to a shared
//! motherboard (spec.md §9's "cyclic device-graph" redesign flag): devices
//! are handed `BusHandle<M>` clones at construction and never see the
//! motherboard itself.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Arena index identifying a device on a bus, per spec.md §9: identity is an
/// index, not a pointer, so `(bus_kind, DeviceId)` names a handler uniquely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceId(pub u32);

/// A message handler. `handle` returns `true` iff it consumed or claimed the
/// message (spec.md §4.5 contract); handlers must not block except on the
/// buses documented as blocking (host-op, BIOS).
pub trait BusDevice<M>: Send {
    fn handle(&mut self, msg: &mut M) -> bool;
}

/// Blanket impl so a plain closure can serve as a handler in tests.
impl<M, F: FnMut(&mut M) -> bool + Send> BusDevice<M> for F {
    fn handle(&mut self, msg: &mut M) -> bool {
        self(msg)
    }
}

/// Dispatch discipline, selected per bus at construction (spec.md §4.5).
#[derive(Debug, Clone, Copy)]
pub enum DispatchOrder {
    /// Latest-registered handler first. `early_out`: stop at the first
    /// handler that returns `true`.
    Lifo { early_out: bool },
    /// Oldest-registered handler first; every handler runs (the reported
    /// result is the logical OR of all handler results).
    Fifo,
    /// Resume from a per-bus cursor; the first handler returning `true`
    /// advances the cursor past itself.
    RoundRobin,
}

struct Handlers<M> {
    entries: Vec<(DeviceId, Arc<Mutex<dyn BusDevice<M>>>)>,
}

/// One statically typed bus. Cheaply `Arc`-cloned into a [`BusHandle`] and
/// handed to devices; the bus itself never references a device by anything
/// but its `DeviceId`.
pub struct Bus<M> {
    order: DispatchOrder,
    handlers: Mutex<Handlers<M>>,
    round_robin_cursor: AtomicUsize,
}

/// Cheap, clonable reference to a bus — what devices actually hold.
pub type BusHandle<M> = Arc<Bus<M>>;

impl<M> Bus<M> {
    pub fn new(order: DispatchOrder) -> BusHandle<M> {
        Arc::new(Bus {
            order,
            handlers: Mutex::new(Handlers { entries: Vec::new() }),
            round_robin_cursor: AtomicUsize::new(0),
        })
    }

    pub fn register(&self, id: DeviceId, handler: Arc<Mutex<dyn BusDevice<M>>>) {
        self.handlers.lock().unwrap().entries.push((id, handler));
    }

    pub fn unregister(&self, id: DeviceId) {
        self.handlers.lock().unwrap().entries.retain(|(i, _)| *i != id);
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Dispatch `msg` per this bus's discipline. Returns whether any handler
    /// claimed the message.
    pub fn send(&self, msg: &mut M) -> bool {
        // Snapshot handler Arcs under the lock, then call them without
        // holding it, so a handler may itself post to another bus (the
        // re-entrancy the contract in spec.md §4.5 allows) without
        // deadlocking against this bus's own registration lock.
        let entries: Vec<(DeviceId, Arc<Mutex<dyn BusDevice<M>>>)> =
            self.handlers.lock().unwrap().entries.clone();

        match self.order {
            DispatchOrder::Lifo { early_out } => {
                let mut handled = false;
                for (_, handler) in entries.iter().rev() {
                    if handler.lock().unwrap().handle(msg) {
                        handled = true;
                        if early_out {
                            break;
                        }
                    }
                }
                handled
            }
            DispatchOrder::Fifo => {
                let mut handled = false;
                for (_, handler) in entries.iter() {
                    if handler.lock().unwrap().handle(msg) {
                        handled = true;
                    }
                }
                handled
            }
            DispatchOrder::RoundRobin => {
                if entries.is_empty() {
                    return false;
                }
                let n = entries.len();
                let start = self.round_robin_cursor.load(Ordering::Relaxed) % n;
                for offset in 0..n {
                    let idx = (start + offset) % n;
                    if entries[idx].1.lock().unwrap().handle(msg) {
                        self.round_robin_cursor.store((idx + 1) % n, Ordering::Relaxed);
                        return true;
                    }
                }
                false
            }
        }
    }
}

impl<M> Clone for Handlers<M> {
    fn clone(&self) -> Self {
        Handlers { entries: self.entries.clone() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn counting_handler(counter: Arc<AtomicU32>, claims: bool) -> Arc<Mutex<dyn BusDevice<u32>>> {
        Arc::new(Mutex::new(move |_: &mut u32| {
            counter.fetch_add(1, Ordering::SeqCst);
            claims
        }))
    }

    #[test]
    fn lifo_dispatches_latest_first_and_stops_on_early_out() {
        let bus: BusHandle<u32> = Bus::new(DispatchOrder::Lifo { early_out: true });
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3u32 {
            let order = order.clone();
            bus.register(
                DeviceId(i),
                Arc::new(Mutex::new(move |_: &mut u32| {
                    order.lock().unwrap().push(i);
                    i == 1 // only the middle-registered handler claims
                })),
            );
        }
        let mut msg = 0u32;
        assert!(bus.send(&mut msg));
        // Latest-registered (2) runs first, then 1 which claims and stops.
        assert_eq!(*order.lock().unwrap(), vec![2, 1]);
    }

    #[test]
    fn fifo_runs_every_handler_without_short_circuiting() {
        let bus: BusHandle<u32> = Bus::new(DispatchOrder::Fifo);
        let counter = Arc::new(AtomicU32::new(0));
        bus.register(DeviceId(0), counting_handler(counter.clone(), true));
        bus.register(DeviceId(1), counting_handler(counter.clone(), false));
        bus.register(DeviceId(2), counting_handler(counter.clone(), true));
        let mut msg = 0u32;
        assert!(bus.send(&mut msg));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn round_robin_resumes_past_the_last_claiming_handler() {
        let bus: BusHandle<u32> = Bus::new(DispatchOrder::RoundRobin);
        let claimed_by = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3u32 {
            let claimed_by = claimed_by.clone();
            bus.register(
                DeviceId(i),
                Arc::new(Mutex::new(move |_: &mut u32| {
                    claimed_by.lock().unwrap().push(i);
                    true
                })),
            );
        }
        let mut msg = 0u32;
        bus.send(&mut msg); // handler 0 claims, cursor advances to 1
        bus.send(&mut msg); // handler 1 claims, cursor advances to 2
        bus.send(&mut msg); // handler 2 claims, cursor wraps to 0
        assert_eq!(*claimed_by.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn unregister_removes_a_handler() {
        let bus: BusHandle<u32> = Bus::new(DispatchOrder::Fifo);
        bus.register(DeviceId(0), Arc::new(Mutex::new(|_: &mut u32| true)));
        assert_eq!(bus.len(), 1);
        bus.unregister(DeviceId(0));
        assert!(bus.is_empty());
    }

    #[test]
    fn handler_may_reentrantly_post_to_another_bus() {
        let inner: BusHandle<u32> = Bus::new(DispatchOrder::Fifo);
        inner.register(DeviceId(0), Arc::new(Mutex::new(|m: &mut u32| { *m += 1; true })));

        let outer: BusHandle<u32> = Bus::new(DispatchOrder::Fifo);
        let inner_clone = inner.clone();
        outer.register(
            DeviceId(0),
            Arc::new(Mutex::new(move |m: &mut u32| {
                inner_clone.send(m);
                true
            })),
        );

        let mut msg = 41u32;
        outer.send(&mut msg);
        assert_eq!(msg, 42);
    }
}
