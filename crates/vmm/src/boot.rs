//! Guest address-space assembly: the generalization of the teacher's
//! `kernel.rs` (which loaded an ELF Linux kernel and wrote a Linux
//! `boot_params` zero page) into a real-mode module loader that writes a
//! Multiboot-style MBI (spec.md §6, built with `nulcfg::MbiBuilder`) and a
//! BIOS re-entry trampoline in the interrupt vector table instead.
//!
//! There is no ROM image backing the architectural reset vector
//! (`cs_base=0xffff_0000, eip=0x0000fff0`, see `vcpu::core::RegisterFile`)
//! in this stack, so unlike real hardware, the loader points the vCPU's
//! initial `CS:IP` straight at the loaded module rather than a BIOS POST
//! routine living at the reset vector (recorded as an Open Question
//! decision in DESIGN.md).

use std::fs;
use std::path::Path;

use kvm_bindings::{kvm_segment, kvm_sregs};
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

use nulcfg::{MbiBuilder, MbiModule, MemMapEntry, MemMapType};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read module image: {0}")]
    Io(#[from] std::io::Error),
    #[error("guest memory error: {0}")]
    Memory(String),
    #[error("module does not fit in guest memory ({0} bytes requested, {1} bytes free above load address)")]
    ModuleTooLarge(usize, usize),
}

/// Real-mode segment:offset the module is loaded at — a conventional-memory
/// address comfortably past the IVT/BDA and low free area the BIOS
/// trampoline and MBI occupy.
pub const MODULE_SEGMENT: u16 = 0x1000;
pub const MODULE_LOAD_ADDR: u64 = (MODULE_SEGMENT as u64) * 16;

/// Real-mode segment the BIOS re-entry stub table lives at, one 4-byte
/// `HLT; IRET; pad; pad` entry per interrupt vector (spec.md §4.6's
/// "16-byte reset stub" generalized to a fixed per-vector stride since we
/// claim the entire 0x00-0xff vector space rather than a narrow range).
pub const STUB_SEGMENT: u16 = 0xf000;
pub const STUB_BASE: u64 = (STUB_SEGMENT as u64) * 16;
pub const STUB_STRIDE: u64 = 4;

const STUB_HLT: u8 = 0xf4;
const STUB_IRET: u8 = 0xcf;

const MBI_HEADER_ADDR: u64 = 0x1000;
const MBI_CMDLINE_ADDR: u64 = 0x1200;
const MBI_MODS_ADDR: u64 = 0x1400;
const MBI_MMAP_ADDR: u64 = 0x1500;
const MBI_BOOT_LOADER_NAME_ADDR: u64 = 0x1600;
const BOOT_LOADER_NAME: &[u8] = b"vmm\0";

/// Initial real-mode stack pointer: just below the BIOS stub segment, well
/// clear of the module and the MBI records.
pub const BOOT_STACK_POINTER: u64 = 0x9000;

/// Write `STUB_HLT, STUB_IRET` at every one of the 256 vector slots and
/// point every IVT entry (`seg:off`, 4 bytes each at `vector * 4`) at its
/// own stub. A guest `INT n` in real mode pushes `flags:cs:ip` and jumps
/// here; the resulting `HLT` is what the vCPU loop recognizes as a BIOS
/// call (`vcpu::bios::StubRange`) rather than a guest halt.
pub fn install_bios_trampoline(mem: &GuestMemoryMmap) -> Result<(), Error> {
    for vector in 0u32..256 {
        let stub_addr = STUB_BASE + vector as u64 * STUB_STRIDE;
        mem.write_slice(&[STUB_HLT, STUB_IRET, 0x90, 0x90], GuestAddress(stub_addr))
            .map_err(|e| Error::Memory(e.to_string()))?;

        let ivt_entry = vector as u64 * 4;
        let offset = (stub_addr - STUB_BASE) as u16;
        mem.write_obj(offset, GuestAddress(ivt_entry)).map_err(|e| Error::Memory(e.to_string()))?;
        mem.write_obj(STUB_SEGMENT, GuestAddress(ivt_entry + 2)).map_err(|e| Error::Memory(e.to_string()))?;
    }
    Ok(())
}

/// Given the stub region's base, recover which vector a halted `RIP`
/// belongs to, or `None` if it falls outside the stub table.
pub fn vector_for_stub_address(linear_addr: u64) -> Option<u8> {
    if linear_addr < STUB_BASE || linear_addr >= STUB_BASE + 256 * STUB_STRIDE {
        return None;
    }
    Some(((linear_addr - STUB_BASE) / STUB_STRIDE) as u8)
}

/// Load the flat module image at [`MODULE_LOAD_ADDR`] and write the MBI
/// (flags, fixed header, one module record, a two-entry E820-style memory
/// map, command line and boot-loader-name strings) describing it.
pub fn load_module(mem: &GuestMemoryMmap, path: &Path, cmdline: &str, mem_size_mb: u32) -> Result<(), Error> {
    let image = fs::read(path)?;
    let mem_size = (mem_size_mb as u64) << 20;
    let free_above_load = mem_size.saturating_sub(MODULE_LOAD_ADDR);
    if image.len() as u64 > free_above_load {
        return Err(Error::ModuleTooLarge(image.len(), free_above_load as usize));
    }
    mem.write_slice(&image, GuestAddress(MODULE_LOAD_ADDR)).map_err(|e| Error::Memory(e.to_string()))?;

    let mut cmdline_bytes = cmdline.as_bytes().to_vec();
    cmdline_bytes.push(0);
    mem.write_slice(&cmdline_bytes, GuestAddress(MBI_CMDLINE_ADDR)).map_err(|e| Error::Memory(e.to_string()))?;
    mem.write_slice(BOOT_LOADER_NAME, GuestAddress(MBI_BOOT_LOADER_NAME_ADDR)).map_err(|e| Error::Memory(e.to_string()))?;

    let mut mbi = MbiBuilder::new();
    mbi.mem_lower_kb = 640;
    mbi.mem_upper_kb = ((mem_size.saturating_sub(0x10_0000)) / 1024) as u32;
    mbi.cmdline_ptr = MBI_CMDLINE_ADDR as u32;
    mbi.mods_addr = MBI_MODS_ADDR as u32;
    mbi.mmap_addr = MBI_MMAP_ADDR as u32;
    mbi.boot_loader_name_ptr = MBI_BOOT_LOADER_NAME_ADDR as u32;
    mbi.modules.push(MbiModule {
        mod_start: MODULE_LOAD_ADDR as u32,
        mod_end: (MODULE_LOAD_ADDR + image.len() as u64) as u32,
        string_ptr: MBI_CMDLINE_ADDR as u32,
    });
    mbi.mmap.push(MemMapEntry { base: 0, length: 0x9_fc00, ty: MemMapType::Usable });
    mbi.mmap.push(MemMapEntry { base: 0x9_fc00, length: mem_size.saturating_sub(0x9_fc00), ty: MemMapType::Usable });

    let mmap_bytes = mbi.encode_mmap();
    mem.write_slice(&mmap_bytes, GuestAddress(MBI_MMAP_ADDR)).map_err(|e| Error::Memory(e.to_string()))?;
    let mods_bytes = mbi.encode_modules();
    mem.write_slice(&mods_bytes, GuestAddress(MBI_MODS_ADDR)).map_err(|e| Error::Memory(e.to_string()))?;
    let header = mbi.header(mmap_bytes.len() as u32);
    mem.write_slice(&header, GuestAddress(MBI_HEADER_ADDR)).map_err(|e| Error::Memory(e.to_string()))?;

    Ok(())
}

fn real_mode_segment(selector: u16, base: u64, type_: u8) -> kvm_segment {
    kvm_segment {
        base,
        limit: 0xffff,
        selector,
        type_,
        present: 1,
        dpl: 0,
        db: 0,
        s: 1,
        l: 0,
        g: 0,
        avl: 0,
        unusable: 0,
        padding: 0,
    }
}

/// Real-mode `sregs`: every segment's base is `selector * 16` and its limit
/// is the conventional real-mode 0xffff, matching the architectural
/// power-on state `vcpu::core::RegisterFile::power_on_reset` models in
/// software (`cr0` with `PE` clear, i.e. real mode).
pub fn real_mode_sregs(entry_segment: u16) -> kvm_sregs {
    let mut sregs: kvm_sregs = unsafe { std::mem::zeroed() };
    sregs.cs = real_mode_segment(entry_segment, (entry_segment as u64) * 16, 0xb); // Execute/Read, Accessed
    let flat_data = real_mode_segment(0, 0, 0x3); // Read/Write, Accessed
    sregs.ds = flat_data;
    sregs.es = flat_data;
    sregs.fs = flat_data;
    sregs.gs = flat_data;
    sregs.ss = flat_data;
    sregs.cr0 = 0x6000_0010; // ET | reserved bits, PE clear: real mode.
    sregs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vector_for_stub_address_recovers_the_original_vector() {
        let addr = STUB_BASE + 0x13 * STUB_STRIDE;
        assert_eq!(vector_for_stub_address(addr), Some(0x13));
        assert_eq!(vector_for_stub_address(STUB_BASE - 1), None);
        assert_eq!(vector_for_stub_address(STUB_BASE + 256 * STUB_STRIDE), None);
    }

    #[test]
    fn real_mode_sregs_place_cs_base_at_segment_times_sixteen() {
        let sregs = real_mode_sregs(0x1000);
        assert_eq!(sregs.cs.base, 0x10000);
        assert_eq!(sregs.cs.selector, 0x1000);
        assert_eq!(sregs.cr0 & 0x1, 0); // PE clear
    }
}
