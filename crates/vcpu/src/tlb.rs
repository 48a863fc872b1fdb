//! Software memory TLB: a page-table walker parameterised by the guest's
//! active paging mode (spec.md §4.6 "Memory TLB").
//!
//! The walker never touches guest memory directly; it goes through a
//! [`PhysReader`] seam so tests can supply an in-memory page-table fixture
//! instead of a real guest address space.

use bitflags::bitflags;

bitflags! {
    /// Which paging extensions are active for this walk. Spec.md names
    /// exactly these five; `SMALL_PDPT` relaxes the upper-bits-must-be-zero
    /// check on the four-entry PAE PDPT the way 32-bit PAE mode requires.
    pub struct PagingFeatures: u32 {
        const PSE         = 1 << 0;
        const PSE36       = 1 << 1;
        const PAE         = 1 << 2;
        const SMALL_PDPT  = 1 << 3;
        const LONG        = 1 << 4;
    }
}

bitflags! {
    /// Page-fault error-code bits, matching the x86 `#PF` error word
    /// (spec.md §3 / §4.6).
    pub struct FaultCode: u32 {
        const PRESENT     = 1 << 0;
        const WRITE       = 1 << 1;
        const USER        = 1 << 2;
        const RESERVED    = 1 << 3;
        const INSTR_FETCH = 1 << 4;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    pub write: bool,
    pub user: bool,
    pub fetch: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("page fault: {code:?}")]
pub struct PageFault {
    pub code: FaultCode,
}

/// Seam over guest physical memory so the walker is independently
/// testable. The real implementation backs this with the memory cache
/// (`crate::memcache`).
pub trait PhysReader {
    fn read_u64(&self, phys: u64) -> u64;
    /// Compare-and-swap a page-table entry, used to set accessed/dirty
    /// bits without a read-modify-write race against another VCPU walking
    /// the same tables (spec.md §4.6: "updates accessed/dirty bits with
    /// compare-and-swap").
    fn cmpxchg_u64(&self, phys: u64, current: u64, new: u64) -> Result<u64, u64>;
}

const PTE_PRESENT: u64 = 1 << 0;
const PTE_WRITE: u64 = 1 << 1;
const PTE_USER: u64 = 1 << 2;
const PTE_ACCESSED: u64 = 1 << 5;
const PTE_DIRTY: u64 = 1 << 6;
const PTE_PS: u64 = 1 << 7;

const PAGE_4K: u64 = 1 << 12;
const PAGE_2M: u64 = 1 << 21;
const PAGE_4M: u64 = 1 << 22;
const PAGE_1G: u64 = 1 << 30;

fn mark_accessed<R: PhysReader>(reader: &R, entry_phys: u64, entry: u64, make_dirty: bool) -> u64 {
    let mut want = entry | PTE_ACCESSED;
    if make_dirty {
        want |= PTE_DIRTY;
    }
    if want == entry {
        return entry;
    }
    // A losing CAS means a concurrent walker already set at least as much;
    // either outcome is a fine view for this walk to proceed with.
    reader.cmpxchg_u64(entry_phys, entry, want).unwrap_or(entry)
}

fn check_permission(entry: u64, access: Access) -> Result<(), PageFault> {
    if entry & PTE_PRESENT == 0 {
        return Err(PageFault { code: FaultCode::empty() });
    }
    let mut code = FaultCode::PRESENT;
    if access.fetch {
        code |= FaultCode::INSTR_FETCH;
    }
    if access.write {
        code |= FaultCode::WRITE;
    }
    if access.user {
        code |= FaultCode::USER;
    }
    if access.write && entry & PTE_WRITE == 0 && access.user {
        return Err(PageFault { code });
    }
    if access.user && entry & PTE_USER == 0 {
        return Err(PageFault { code });
    }
    Ok(())
}

fn reserved_fault(access: Access) -> PageFault {
    let mut code = FaultCode::PRESENT | FaultCode::RESERVED;
    if access.fetch {
        code |= FaultCode::INSTR_FETCH;
    }
    if access.write {
        code |= FaultCode::WRITE;
    }
    if access.user {
        code |= FaultCode::USER;
    }
    PageFault { code }
}

/// Translate `linear` under CR3 `cr3`, for the given `access` and
/// `features`. Walks up to four levels depending on mode.
pub fn translate<R: PhysReader>(
    reader: &R,
    cr3: u64,
    linear: u64,
    access: Access,
    features: PagingFeatures,
) -> Result<u64, PageFault> {
    if features.contains(PagingFeatures::LONG) {
        walk_4level(reader, cr3, linear, access)
    } else if features.contains(PagingFeatures::PAE) {
        walk_pae(reader, cr3, linear, access, features)
    } else {
        walk_2level(reader, cr3, linear, access, features)
    }
}

fn walk_2level<R: PhysReader>(
    reader: &R,
    cr3: u64,
    linear: u64,
    access: Access,
    features: PagingFeatures,
) -> Result<u64, PageFault> {
    let pde_phys = (cr3 & !0xfff) + ((linear >> 22) & 0x3ff) * 4;
    let pde = reader.read_u64(pde_phys & !0x7) >> (if pde_phys & 4 != 0 { 32 } else { 0 }) & 0xffff_ffff;
    check_permission(pde, access)?;

    if features.contains(PagingFeatures::PSE) && pde & PTE_PS != 0 {
        mark_accessed(reader, pde_phys, pde, access.write);
        let mut base = (pde & 0xffc0_0000) as u64;
        if features.contains(PagingFeatures::PSE36) {
            // Bits 20:13 of a PSE-36 PDE supply physical address bits 39:32.
            base |= ((pde >> 13) & 0xff) << 32;
        } else if pde & 0x003f_e000 != 0 {
            return Err(reserved_fault(access));
        }
        return Ok(base | (linear & (PAGE_4M - 1)));
    }

    mark_accessed(reader, pde_phys, pde, false);
    let pt_base = pde & 0xffff_f000;
    let pte_phys = pt_base + ((linear >> 12) & 0x3ff) * 4;
    let pte = reader.read_u64(pte_phys & !0x7) & 0xffff_ffff;
    check_permission(pte, access)?;
    mark_accessed(reader, pte_phys, pte, access.write);
    Ok((pte & 0xffff_f000) | (linear & (PAGE_4K - 1)))
}

fn walk_pae<R: PhysReader>(
    reader: &R,
    cr3: u64,
    linear: u64,
    access: Access,
    features: PagingFeatures,
) -> Result<u64, PageFault> {
    let pdpte_idx = (linear >> 30) & 0x3;
    let pdpte_phys = (cr3 & !0x1f) + pdpte_idx * 8;
    let pdpte = reader.read_u64(pdpte_phys);
    if pdpte & PTE_PRESENT == 0 {
        return Err(PageFault { code: FaultCode::empty() });
    }
    if !features.contains(PagingFeatures::SMALL_PDPT) && pdpte & 0x1e6 != 0 {
        return Err(reserved_fault(access));
    }

    let pde_phys = (pdpte & 0x000f_ffff_ffff_f000) + ((linear >> 21) & 0x1ff) * 8;
    let pde = reader.read_u64(pde_phys);
    check_permission(pde, access)?;

    if pde & PTE_PS != 0 {
        mark_accessed(reader, pde_phys, pde, access.write);
        let base = pde & 0x000f_ffff_ffe0_0000;
        return Ok(base | (linear & (PAGE_2M - 1)));
    }

    mark_accessed(reader, pde_phys, pde, false);
    let pt_base = pde & 0x000f_ffff_ffff_f000;
    let pte_phys = pt_base + ((linear >> 12) & 0x1ff) * 8;
    let pte = reader.read_u64(pte_phys);
    check_permission(pte, access)?;
    mark_accessed(reader, pte_phys, pte, access.write);
    Ok((pte & 0x000f_ffff_ffff_f000) | (linear & (PAGE_4K - 1)))
}

fn walk_4level<R: PhysReader>(reader: &R, cr3: u64, linear: u64, access: Access) -> Result<u64, PageFault> {
    let pml4_phys = (cr3 & 0x000f_ffff_ffff_f000) + ((linear >> 39) & 0x1ff) * 8;
    let pml4e = reader.read_u64(pml4_phys);
    check_permission(pml4e, access)?;
    mark_accessed(reader, pml4_phys, pml4e, false);

    let pdpt_phys = (pml4e & 0x000f_ffff_ffff_f000) + ((linear >> 30) & 0x1ff) * 8;
    let pdpte = reader.read_u64(pdpt_phys);
    check_permission(pdpte, access)?;

    if pdpte & PTE_PS != 0 {
        mark_accessed(reader, pdpt_phys, pdpte, access.write);
        let base = pdpte & 0x000f_ffff_c000_0000;
        return Ok(base | (linear & (PAGE_1G - 1)));
    }
    mark_accessed(reader, pdpt_phys, pdpte, false);

    let pde_phys = (pdpte & 0x000f_ffff_ffff_f000) + ((linear >> 21) & 0x1ff) * 8;
    let pde = reader.read_u64(pde_phys);
    check_permission(pde, access)?;

    if pde & PTE_PS != 0 {
        mark_accessed(reader, pde_phys, pde, access.write);
        let base = pde & 0x000f_ffff_ffe0_0000;
        return Ok(base | (linear & (PAGE_2M - 1)));
    }
    mark_accessed(reader, pde_phys, pde, false);

    let pt_base = pde & 0x000f_ffff_ffff_f000;
    let pte_phys = pt_base + ((linear >> 12) & 0x1ff) * 8;
    let pte = reader.read_u64(pte_phys);
    check_permission(pte, access)?;
    mark_accessed(reader, pte_phys, pte, access.write);
    Ok((pte & 0x000f_ffff_ffff_f000) | (linear & (PAGE_4K - 1)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    struct FixtureMem(Mutex<HashMap<u64, u64>>);

    impl FixtureMem {
        fn new() -> Self {
            FixtureMem(Mutex::new(HashMap::new()))
        }

        fn set(&self, phys: u64, value: u64) {
            self.0.lock().unwrap().insert(phys, value);
        }
    }

    impl PhysReader for FixtureMem {
        fn read_u64(&self, phys: u64) -> u64 {
            *self.0.lock().unwrap().get(&phys).unwrap_or(&0)
        }

        fn cmpxchg_u64(&self, phys: u64, current: u64, new: u64) -> Result<u64, u64> {
            let mut map = self.0.lock().unwrap();
            let slot = map.entry(phys).or_insert(0);
            if *slot == current {
                *slot = new;
                Ok(new)
            } else {
                Err(*slot)
            }
        }
    }

    fn rw_user_access() -> Access {
        Access { write: false, user: true, fetch: false }
    }

    #[test]
    fn long_mode_4k_page_translates_and_sets_accessed() {
        let mem = FixtureMem::new();
        let cr3 = 0x1000;
        mem.set(cr3, 0x2000 | PTE_PRESENT | PTE_WRITE | PTE_USER);
        mem.set(0x2000, 0x3000 | PTE_PRESENT | PTE_WRITE | PTE_USER);
        mem.set(0x3000, 0x4000 | PTE_PRESENT | PTE_WRITE | PTE_USER);
        mem.set(0x4000, 0x5000 | PTE_PRESENT | PTE_WRITE | PTE_USER);

        let phys = translate(&mem, cr3, 0xabc, rw_user_access(), PagingFeatures::LONG).unwrap();
        assert_eq!(phys, 0x5abc);
        assert_eq!(mem.read_u64(0x4000) & PTE_ACCESSED, PTE_ACCESSED);
    }

    #[test]
    fn not_present_page_faults_with_empty_code() {
        let mem = FixtureMem::new();
        let err = translate(&mem, 0x1000, 0, rw_user_access(), PagingFeatures::LONG).unwrap_err();
        assert_eq!(err.code, FaultCode::empty());
    }

    #[test]
    fn pae_reserved_bits_rejected_unless_small_pdpt() {
        let mem = FixtureMem::new();
        let cr3 = 0x1000;
        // Set a reserved bit (bit 5) in the PDPTE.
        mem.set(cr3, PTE_PRESENT | (1 << 5));
        let err = translate(&mem, cr3, 0, rw_user_access(), PagingFeatures::PAE).unwrap_err();
        assert!(err.code.contains(FaultCode::RESERVED));

        mem.set(0x2000 & !0xfff, 0x3000 | PTE_PRESENT | PTE_WRITE | PTE_USER);
        mem.set(cr3, PTE_PRESENT | (1 << 5));
        // With SMALL_PDPT the reserved-bits check on the PDPTE is relaxed.
        let pdpte_phys = 0;
        mem.set(pdpte_phys, 0x2000 | PTE_PRESENT);
        mem.set(0x2000, 0x3000 | PTE_PRESENT | PTE_WRITE | PTE_USER);
        mem.set(0x3000, 0x4000 | PTE_PRESENT | PTE_WRITE | PTE_USER);
        let phys = translate(
            &mem,
            cr3,
            0,
            rw_user_access(),
            PagingFeatures::PAE | PagingFeatures::SMALL_PDPT,
        );
        assert!(phys.is_ok());
    }

    #[test]
    fn user_write_without_write_bit_faults() {
        let mem = FixtureMem::new();
        let cr3 = 0x1000;
        mem.set(cr3, 0x2000 | PTE_PRESENT | PTE_WRITE | PTE_USER);
        mem.set(0x2000, 0x3000 | PTE_PRESENT | PTE_WRITE | PTE_USER);
        mem.set(0x3000, 0x4000 | PTE_PRESENT | PTE_WRITE | PTE_USER);
        // Page table entry is read-only.
        mem.set(0x4000, 0x5000 | PTE_PRESENT | PTE_USER);

        let access = Access { write: true, user: true, fetch: false };
        let err = translate(&mem, cr3, 0, access, PagingFeatures::LONG).unwrap_err();
        assert!(err.code.contains(FaultCode::WRITE));
    }
}
