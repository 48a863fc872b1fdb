//! Client registry (spec component C3): a generic table of entries keyed by
//! an identity capability, shared by the parent protocol's session table and
//! service table (spec.md §4.3).
//!
//! Per the "shared mutable per-client state" redesign flag (spec.md §9), an
//! entry is never referenced by raw pointer: the table hands out a
//! generational [`ClientId`] plus an `Arc<Entry<T>>`, so a caller that keeps
//! the `Arc` around across the table's own lock can never observe it
//! recycled into someone else's entry even if the underlying slot is reused.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};

use kernel_iface::CapLookup;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("no matching entry")]
    NotFound,
    #[error("client data storage exhausted")]
    NoResource,
}

/// Generational handle into a [`Table`]. The generation changes every time a
/// slot is reused, so a stale `ClientId` from a freed entry can never be
/// mistaken for the new occupant of the same slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId {
    index: u32,
    generation: u32,
}

/// A registry entry. `pseudonym`/`identity` are set at construction and
/// never change; `name` is published once, after the entry is otherwise
/// complete, via [`Entry::publish_name`] — readers gate on
/// `name.get().is_some()` exactly as the original's `len > 0` check, and
/// `OnceLock` gives the publish the Release/Acquire ordering the original's
/// hand-written `MEMORY_BARRIER` was standing in for. `extra` carries
/// role-specific mutable fields (e.g. the service table's `cpu`/`portal`, or
/// the session table's `singleton`) behind its own mutex so table-wide
/// iteration does not need to hold a write lock just to read them.
pub struct Entry<T> {
    pub pseudonym: u32,
    pub identity: u32,
    name: OnceLock<Vec<u8>>,
    pub extra: Mutex<T>,
}

impl<T> Entry<T> {
    pub fn name(&self) -> Option<&[u8]> {
        self.name.get().map(|v| v.as_slice())
    }

    /// Publish this entry's name. Idempotent: a second call is a no-op,
    /// matching the fact that the original never re-publishes `len`/`name`
    /// once set.
    pub fn publish_name(&self, name: Vec<u8>) {
        let _ = self.name.set(name);
    }
}

struct Slot<T> {
    generation: u32,
    entry: Option<Arc<Entry<T>>>,
}

struct Inner<T> {
    slots: Vec<Slot<T>>,
    free: Vec<usize>,
    by_identity: HashMap<u32, usize>,
}

/// A client-data table (used once for sessions, once for services).
pub struct Table<T> {
    inner: Mutex<Inner<T>>,
}

impl<T> Default for Table<T> {
    fn default() -> Self {
        Table {
            inner: Mutex::new(Inner {
                slots: Vec::new(),
                free: Vec::new(),
                by_identity: HashMap::new(),
            }),
        }
    }
}

impl<T> Table<T> {
    pub fn new() -> Self {
        Table::default()
    }

    /// Insert a new entry, keyed by `identity`. The caller is responsible for
    /// allocating `identity` up front (from the capability allocator) so
    /// that allocation failures are visible to the caller as
    /// `RegistryError::NoResource` *before* any entry is linked in, matching
    /// the original's `alloc_client_data` returning `ERESOURCE` without
    /// touching the table.
    pub fn alloc_client_data(
        &self,
        pseudonym: u32,
        identity: u32,
        extra: T,
    ) -> (ClientId, Arc<Entry<T>>) {
        let mut inner = self.inner.lock().unwrap();
        let entry = Arc::new(Entry {
            pseudonym,
            identity,
            name: OnceLock::new(),
            extra: Mutex::new(extra),
        });

        let index = if let Some(index) = inner.free.pop() {
            inner.slots[index].generation += 1;
            inner.slots[index].entry = Some(entry.clone());
            index
        } else {
            let index = inner.slots.len();
            inner.slots.push(Slot { generation: 0, entry: Some(entry.clone()) });
            index
        };
        let generation = inner.slots[index].generation;
        inner.by_identity.insert(identity, index);
        (ClientId { index: index as u32, generation }, entry)
    }

    /// Look up an entry by its identity capability.
    pub fn get_client_data(&self, identity: u32) -> Result<Arc<Entry<T>>, RegistryError> {
        let inner = self.inner.lock().unwrap();
        let index = *inner.by_identity.get(&identity).ok_or(RegistryError::NotFound)?;
        inner.slots[index]
            .entry
            .clone()
            .ok_or(RegistryError::NotFound)
    }

    /// Release an entry: unlinks it from the table. The caller still owns
    /// revoking `identity` with the kernel and releasing the capability back
    /// to the allocator — those cross into other crates and are kept out of
    /// `registry` itself.
    pub fn free_client_data(&self, identity: u32) -> Result<Arc<Entry<T>>, RegistryError> {
        let mut inner = self.inner.lock().unwrap();
        let index = inner
            .by_identity
            .remove(&identity)
            .ok_or(RegistryError::NotFound)?;
        let entry = inner.slots[index].entry.take().ok_or(RegistryError::NotFound)?;
        inner.free.push(index);
        Ok(entry)
    }

    /// Iterate in slot (insertion) order. `prev` resumes after that entry.
    pub fn next(&self, prev: Option<ClientId>) -> Option<(ClientId, Arc<Entry<T>>)> {
        let inner = self.inner.lock().unwrap();
        let start = match prev {
            Some(id) => id.index as usize + 1,
            None => 0,
        };
        for index in start..inner.slots.len() {
            if let Some(entry) = &inner.slots[index].entry {
                return Some((
                    ClientId { index: index as u32, generation: inner.slots[index].generation },
                    entry.clone(),
                ));
            }
        }
        None
    }

    /// Collect every entry, consuming the caller-supplied closure.
    pub fn for_each(&self, mut f: impl FnMut(ClientId, &Arc<Entry<T>>)) {
        let mut cursor = None;
        while let Some((id, entry)) = self.next(cursor) {
            f(id, &entry);
            cursor = Some(id);
        }
    }

    /// Death-detection sweep (spec.md §4.3): called opportunistically after
    /// `alloc_client_data`-adjacent allocation hits `NoResource` elsewhere;
    /// reclaims every entry whose identity capability no longer resolves and
    /// returns them so the caller can notify dependents before dropping them.
    pub fn reap_dead(&self, kernel: &dyn CapLookup) -> Vec<Arc<Entry<T>>> {
        let dead_identities: Vec<u32> = {
            let inner = self.inner.lock().unwrap();
            inner
                .slots
                .iter()
                .filter_map(|s| s.entry.as_ref())
                .filter(|e| !kernel.resolves(e.identity))
                .map(|e| e.identity)
                .collect()
        };
        dead_identities
            .into_iter()
            .filter_map(|identity| self.free_client_data(identity).ok())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().by_identity.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_iface::MockKernel;

    #[test]
    fn alloc_then_lookup_by_identity() {
        let t: Table<()> = Table::new();
        let (_, entry) = t.alloc_client_data(1, 100, ());
        entry.publish_name(b"timer".to_vec());
        let found = t.get_client_data(100).unwrap();
        assert_eq!(found.name(), Some(b"timer".as_slice()));
    }

    #[test]
    fn name_is_not_visible_before_publish() {
        let t: Table<()> = Table::new();
        let (_, entry) = t.alloc_client_data(1, 100, ());
        let found = t.get_client_data(100).unwrap();
        assert!(found.name().is_none());
        entry.publish_name(b"disk".to_vec());
        assert_eq!(found.name(), Some(b"disk".as_slice()));
    }

    #[test]
    fn free_then_lookup_fails() {
        let t: Table<()> = Table::new();
        t.alloc_client_data(1, 100, ());
        t.free_client_data(100).unwrap();
        assert_eq!(t.get_client_data(100), Err(RegistryError::NotFound));
    }

    #[test]
    fn double_free_is_rejected() {
        let t: Table<()> = Table::new();
        t.alloc_client_data(1, 100, ());
        t.free_client_data(100).unwrap();
        assert_eq!(t.free_client_data(100), Err(RegistryError::NotFound));
    }

    #[test]
    fn next_iterates_in_insertion_order() {
        let t: Table<()> = Table::new();
        t.alloc_client_data(1, 10, ());
        t.alloc_client_data(1, 20, ());
        t.alloc_client_data(1, 30, ());
        let mut seen = Vec::new();
        t.for_each(|_, e| seen.push(e.identity));
        assert_eq!(seen, vec![10, 20, 30]);
    }

    #[test]
    fn freed_slot_is_reused_with_a_bumped_generation() {
        let t: Table<()> = Table::new();
        let (id1, _) = t.alloc_client_data(1, 10, ());
        t.free_client_data(10).unwrap();
        let (id2, _) = t.alloc_client_data(1, 20, ());
        assert_eq!(id1.index, id2.index);
        assert_ne!(id1.generation, id2.generation);
    }

    #[test]
    fn reap_dead_reclaims_only_entries_whose_identity_no_longer_resolves() {
        let t: Table<()> = Table::new();
        let k = MockKernel::new();
        k.birth(1);
        k.birth(2);
        t.alloc_client_data(100, 1, ());
        t.alloc_client_data(200, 2, ());
        k.kill(1);
        let reaped = t.reap_dead(&k);
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].identity, 1);
        assert_eq!(t.len(), 1);
        assert!(t.get_client_data(2).is_ok());
    }

    #[test]
    fn stress_publication_is_observed_by_a_concurrent_reader() {
        use std::sync::Arc as StdArc;
        use std::thread;

        for _ in 0..200 {
            let t = StdArc::new(Table::<()>::new());
            let (_, entry) = t.alloc_client_data(1, 1, ());
            let reader_table = t.clone();
            let writer_entry = entry.clone();
            let reader = thread::spawn(move || {
                let found = reader_table.get_client_data(1).unwrap();
                // Whatever we observe must be either "not yet published" or
                // the fully-formed name -- never a partial write, since
                // `OnceLock` only ever exposes a complete value.
                if let Some(name) = found.name() {
                    assert_eq!(name, b"svc");
                }
            });
            writer_entry.publish_name(b"svc".to_vec());
            reader.join().unwrap();
        }
    }
}
