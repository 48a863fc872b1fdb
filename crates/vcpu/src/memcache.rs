//! Memory cache: the layer between the TLB's physical addresses and actual
//! bytes (spec.md §4.6: "feeds the memory cache above — C5 region bus →
//! direct host pointer; else small MMIO buffer").
//!
//! A small, direct-mapped set of cache lines remembers the last few guest
//! physical ranges resolved through [`msgbus::MemRegion`]'s lookup
//! message, each pairing the guest range with the stable host pointer the
//! region bus handed back. Ranges that don't resolve to host memory (true
//! MMIO) fall back to a tiny write-back buffer that coalesces sub-word
//! accesses before forwarding them on the MMIO bus.

use msgbus::{BusHandle, MemRegion, MemRegionGrant, Mmio};

const NUM_LINES: usize = 8;
const MMIO_BUFFER_BYTES: usize = 20;

/// One resolved guest-physical range. `phys1`/`phys2` bound the covered
/// range (`phys2` exclusive); `host_ptr`/`length` are the backing host
/// allocation the region bus published. `age_link_older` threads the LRU
/// chain: the index of the next-older line, or `None` at the tail.
#[derive(Debug, Clone, Copy)]
struct CacheLine {
    phys1: u64,
    phys2: u64,
    host_ptr: *mut u8,
    length: usize,
    age_link_older: Option<usize>,
}

unsafe impl Send for CacheLine {}

impl CacheLine {
    fn covers(&self, addr: u64, len: usize) -> bool {
        addr >= self.phys1 && addr.saturating_add(len as u64) <= self.phys2
    }
}

/// Coalescing buffer for writes that don't resolve to host memory (spec's
/// "small MMIO buffer", capped at the widest access the VCPU core ever
/// issues plus headroom).
struct MmioWriteBuffer {
    base: u64,
    bytes: [u8; MMIO_BUFFER_BYTES],
    len: u8,
}

impl MmioWriteBuffer {
    fn empty() -> Self {
        MmioWriteBuffer { base: 0, bytes: [0; MMIO_BUFFER_BYTES], len: 0 }
    }

    fn stage(&mut self, addr: u64, data: &[u8]) {
        self.base = addr;
        self.len = data.len().min(MMIO_BUFFER_BYTES) as u8;
        self.bytes[..self.len as usize].copy_from_slice(&data[..self.len as usize]);
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MemCacheError {
    #[error("address {0:#x} is outside any mapped region")]
    Unmapped(u64),
}

pub struct MemCache {
    mem_region: BusHandle<MemRegion>,
    mmio: BusHandle<Mmio>,
    lines: [Option<CacheLine>; NUM_LINES],
    lru_head: Option<usize>,
    mmio_write_buffer: MmioWriteBuffer,
}

impl MemCache {
    pub fn new(mem_region: BusHandle<MemRegion>, mmio: BusHandle<Mmio>) -> Self {
        MemCache {
            mem_region,
            mmio,
            lines: [None; NUM_LINES],
            lru_head: None,
            mmio_write_buffer: MmioWriteBuffer::empty(),
        }
    }

    fn find_line(&self, addr: u64, len: usize) -> Option<usize> {
        self.lines
            .iter()
            .position(|l| l.map(|l| l.covers(addr, len)).unwrap_or(false))
    }

    /// Resolve `addr` via an existing cache line, or by publishing a fresh
    /// `MemRegion::Lookup` and installing the result as the new
    /// least-recently-used-evicted line.
    fn resolve(&mut self, addr: u64, len: usize) -> Option<CacheLine> {
        if let Some(idx) = self.find_line(addr, len) {
            return self.lines[idx];
        }

        let gfn = addr >> 12;
        let mut msg = MemRegion::Lookup { gfn, result: None };
        self.mem_region.send(&mut msg);
        let MemRegion::Lookup { result, .. } = msg else { unreachable!() };
        let grant: MemRegionGrant = result?;

        let phys1 = gfn << 12;
        let line = CacheLine {
            phys1,
            phys2: phys1 + (grant.pages * 4096) as u64,
            host_ptr: grant.host_ptr,
            length: grant.pages * 4096,
            age_link_older: self.lru_head,
        };
        let slot = self.evict_slot();
        self.lines[slot] = Some(line);
        self.lru_head = Some(slot);
        Some(line)
    }

    fn evict_slot(&self) -> usize {
        self.lines
            .iter()
            .position(|l| l.is_none())
            .unwrap_or_else(|| {
                // No free slot: evict the chain tail (oldest line).
                let mut idx = self.lru_head.unwrap_or(0);
                while let Some(Some(line)) = self.lines.get(idx) {
                    match line.age_link_older {
                        Some(older) => idx = older,
                        None => break,
                    }
                }
                idx
            })
    }

    pub fn read(&mut self, addr: u64, len: usize) -> Result<[u8; 8], MemCacheError> {
        debug_assert!(len <= 8);
        if let Some(line) = self.resolve(addr, len) {
            let offset = (addr - line.phys1) as usize;
            let mut out = [0u8; 8];
            unsafe {
                std::ptr::copy_nonoverlapping(line.host_ptr.add(offset), out.as_mut_ptr(), len);
            }
            return Ok(out);
        }

        // Not backed by host memory: true MMIO, forward on the MMIO bus.
        let mut msg = Mmio { addr, write: false, data: [0u8; 8], len: len as u8 };
        if !self.mmio.send(&mut msg) {
            return Err(MemCacheError::Unmapped(addr));
        }
        Ok(msg.data)
    }

    pub fn write(&mut self, addr: u64, data: &[u8]) -> Result<(), MemCacheError> {
        debug_assert!(data.len() <= 8);
        if let Some(line) = self.resolve(addr, data.len()) {
            let offset = (addr - line.phys1) as usize;
            unsafe {
                std::ptr::copy_nonoverlapping(data.as_ptr(), line.host_ptr.add(offset), data.len());
            }
            return Ok(());
        }

        self.mmio_write_buffer.stage(addr, data);
        let mut buf = [0u8; 8];
        buf[..data.len()].copy_from_slice(data);
        let mut msg = Mmio { addr, write: true, data: buf, len: data.len() as u8 };
        if !self.mmio.send(&mut msg) {
            return Err(MemCacheError::Unmapped(addr));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use msgbus::{Bus, BusDevice, DeviceId, DispatchOrder};
    use std::sync::{Arc, Mutex};

    fn leaked_page() -> *mut u8 {
        Box::leak(Box::new([0u8; 4096])).as_mut_ptr()
    }

    fn publisher_bus(host_ptr: *mut u8, pages: usize) -> BusHandle<MemRegion> {
        let bus: BusHandle<MemRegion> = Bus::new(DispatchOrder::Fifo);
        bus.register(
            DeviceId(0),
            Arc::new(Mutex::new(move |msg: &mut MemRegion| match msg {
                MemRegion::Lookup { gfn, result } if *gfn == 0 => {
                    *result = Some(MemRegionGrant { host_ptr, pages });
                    true
                }
                _ => false,
            })),
        );
        bus
    }

    #[test]
    fn resolves_and_reads_through_a_published_region() {
        let page = leaked_page();
        unsafe {
            *page.add(4) = 0xab;
        }
        let mem_region = publisher_bus(page, 1);
        let mmio: BusHandle<Mmio> = Bus::new(DispatchOrder::Fifo);
        let mut cache = MemCache::new(mem_region, mmio);

        let bytes = cache.read(4, 1).unwrap();
        assert_eq!(bytes[0], 0xab);
    }

    #[test]
    fn write_then_read_round_trips_through_the_cache_line() {
        let page = leaked_page();
        let mem_region = publisher_bus(page, 1);
        let mmio: BusHandle<Mmio> = Bus::new(DispatchOrder::Fifo);
        let mut cache = MemCache::new(mem_region, mmio);

        cache.write(8, &[1, 2, 3, 4]).unwrap();
        let bytes = cache.read(8, 4).unwrap();
        assert_eq!(&bytes[..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn unmapped_address_falls_back_to_mmio_bus() {
        let mem_region: BusHandle<MemRegion> = Bus::new(DispatchOrder::Fifo);
        let mmio: BusHandle<Mmio> = Bus::new(DispatchOrder::Fifo);
        mmio.register(
            DeviceId(0),
            Arc::new(Mutex::new(|msg: &mut Mmio| {
                msg.data[0] = 0x42;
                true
            })),
        );
        let mut cache = MemCache::new(mem_region, mmio);
        let bytes = cache.read(0xfee0_0000, 1).unwrap();
        assert_eq!(bytes[0], 0x42);
    }

    #[test]
    fn address_with_no_host_memory_and_no_mmio_handler_is_unmapped() {
        let mem_region: BusHandle<MemRegion> = Bus::new(DispatchOrder::Fifo);
        let mmio: BusHandle<Mmio> = Bus::new(DispatchOrder::Fifo);
        let mut cache = MemCache::new(mem_region, mmio);

        assert_eq!(cache.read(0xdead_0000, 1), Err(MemCacheError::Unmapped(0xdead_0000)));
        assert_eq!(cache.write(0xdead_0000, &[1]), Err(MemCacheError::Unmapped(0xdead_0000)));
    }
}
