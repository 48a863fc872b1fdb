//! Multiboot-style MBI (multiboot information block) assembly (spec.md §6).
//!
//! The VBIOS hands a loaded module a standard Multiboot v1 information
//! block with `MEM | CMDLINE | MODS | MMAP | BOOT_LOADER_NAME` set. This
//! crate only assembles the byte layout; writing it into guest memory at a
//! chosen address and patching in the pointers to the strings/module list
//! it references is the caller's job (`roottask`'s module loader), since
//! `nulcfg` itself has no notion of guest memory.

/// `flags` bit for each MBI field the VBIOS populates (spec.md §6).
pub const FLAG_MEM: u32 = 1 << 0;
pub const FLAG_BOOT_DEVICE: u32 = 1 << 1;
pub const FLAG_CMDLINE: u32 = 1 << 2;
pub const FLAG_MODS: u32 = 1 << 3;
pub const FLAG_MMAP: u32 = 1 << 6;
pub const FLAG_BOOT_LOADER_NAME: u32 = 1 << 9;

/// `{mod_start, mod_end, string, 0}` (spec.md §6). `string` is a guest
/// pointer to the module's command line, resolved by the caller once it has
/// chosen where to place that string in guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Module {
    pub mod_start: u32,
    pub mod_end: u32,
    pub string_ptr: u32,
}

impl Module {
    const ENCODED_LEN: usize = 16;

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.mod_start.to_le_bytes());
        out.extend_from_slice(&self.mod_end.to_le_bytes());
        out.extend_from_slice(&self.string_ptr.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes()); // reserved, always 0
    }
}

/// E820-style memory map entry type (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemMapType {
    Usable,
    Reserved,
}

impl MemMapType {
    fn as_u32(self) -> u32 {
        match self {
            MemMapType::Usable => 1,
            MemMapType::Reserved => 2,
        }
    }
}

/// `{size=20, base:u64, length:u64, type:u32}` (spec.md §6). `size` is the
/// byte count of the fields *following* it (the Multiboot convention), so
/// the full on-the-wire record is `4 + size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemMapEntry {
    pub base: u64,
    pub length: u64,
    pub ty: MemMapType,
}

impl MemMapEntry {
    const SIZE_FIELD: u32 = 20;
    const ENCODED_LEN: usize = 4 + Self::SIZE_FIELD as usize;

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&Self::SIZE_FIELD.to_le_bytes());
        out.extend_from_slice(&self.base.to_le_bytes());
        out.extend_from_slice(&self.length.to_le_bytes());
        out.extend_from_slice(&self.ty.as_u32().to_le_bytes());
    }
}

/// Byte offsets of the fields this builder populates within the fixed MBI
/// header, matching the standard Multiboot v1 `multiboot_info` layout.
mod offset {
    pub const FLAGS: usize = 0x00;
    pub const MEM_LOWER: usize = 0x04;
    pub const MEM_UPPER: usize = 0x08;
    pub const CMDLINE: usize = 0x10;
    pub const MODS_COUNT: usize = 0x14;
    pub const MODS_ADDR: usize = 0x18;
    pub const MMAP_LENGTH: usize = 0x2c;
    pub const MMAP_ADDR: usize = 0x30;
    pub const BOOT_LOADER_NAME: usize = 0x40;
    pub const HEADER_LEN: usize = 0x48;
}

fn patch_u32(buf: &mut [u8], at: usize, value: u32) {
    buf[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

/// Assembles the fixed-size MBI header plus the variable-length module list
/// and memory map records it points into. Every guest pointer (`cmdline`,
/// `mods_addr`, `mmap_addr`, `boot_loader_name`) is a guest-physical address
/// the caller has already decided on before calling [`MbiBuilder::header`] --
/// this crate does not allocate guest memory itself (spec.md §1 Non-goals).
#[derive(Debug, Default)]
pub struct MbiBuilder {
    pub mem_lower_kb: u32,
    pub mem_upper_kb: u32,
    pub cmdline_ptr: u32,
    pub modules: Vec<Module>,
    pub mods_addr: u32,
    pub mmap: Vec<MemMapEntry>,
    pub mmap_addr: u32,
    pub boot_loader_name_ptr: u32,
}

impl MbiBuilder {
    pub fn new() -> Self {
        MbiBuilder::default()
    }

    /// `MEM | CMDLINE | MODS | MMAP | BOOT_LOADER_NAME`, exactly as spec.md
    /// §6 names them -- this builder does not support `BOOT_DEVICE` since no
    /// caller in this repo populates a BIOS boot-device byte.
    pub fn flags(&self) -> u32 {
        FLAG_MEM | FLAG_CMDLINE | FLAG_MODS | FLAG_MMAP | FLAG_BOOT_LOADER_NAME
    }

    /// Serialize the fixed-size MBI header. `mmap_bytes_len` is the total
    /// encoded length of the memory map (callers get it from
    /// [`MbiBuilder::encode_mmap`]) since the header records it as a byte
    /// count, not an entry count.
    pub fn header(&self, mmap_bytes_len: u32) -> Vec<u8> {
        let mut buf = vec![0u8; offset::HEADER_LEN];
        patch_u32(&mut buf, offset::FLAGS, self.flags());
        patch_u32(&mut buf, offset::MEM_LOWER, self.mem_lower_kb);
        patch_u32(&mut buf, offset::MEM_UPPER, self.mem_upper_kb);
        patch_u32(&mut buf, offset::CMDLINE, self.cmdline_ptr);
        patch_u32(&mut buf, offset::MODS_COUNT, self.modules.len() as u32);
        patch_u32(&mut buf, offset::MODS_ADDR, self.mods_addr);
        patch_u32(&mut buf, offset::MMAP_LENGTH, mmap_bytes_len);
        patch_u32(&mut buf, offset::MMAP_ADDR, self.mmap_addr);
        patch_u32(&mut buf, offset::BOOT_LOADER_NAME, self.boot_loader_name_ptr);
        buf
    }

    /// Encode the `{mod_start, mod_end, string, 0}` module list.
    pub fn encode_modules(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.modules.len() * Module::ENCODED_LEN);
        for m in &self.modules {
            m.encode(&mut out);
        }
        out
    }

    /// Encode the `{size=20, base, length, type}` memory map.
    pub fn encode_mmap(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.mmap.len() * MemMapEntry::ENCODED_LEN);
        for e in &self.mmap {
            e.encode(&mut out);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_match_spec_required_set() {
        let mbi = MbiBuilder::new();
        let f = mbi.flags();
        assert_ne!(f & FLAG_MEM, 0);
        assert_ne!(f & FLAG_CMDLINE, 0);
        assert_ne!(f & FLAG_MODS, 0);
        assert_ne!(f & FLAG_MMAP, 0);
        assert_ne!(f & FLAG_BOOT_LOADER_NAME, 0);
        assert_eq!(f & FLAG_BOOT_DEVICE, 0);
    }

    #[test]
    fn header_places_fields_at_documented_offsets() {
        let mut mbi = MbiBuilder::new();
        mbi.mem_lower_kb = 640;
        mbi.mem_upper_kb = 130048;
        mbi.cmdline_ptr = 0x1000;
        mbi.mods_addr = 0x2000;
        mbi.mmap_addr = 0x3000;
        mbi.boot_loader_name_ptr = 0x4000;
        mbi.modules.push(Module { mod_start: 0x10_0000, mod_end: 0x10_1000, string_ptr: 0x5000 });

        let header = mbi.header(24);
        assert_eq!(u32::from_le_bytes(header[0x00..0x04].try_into().unwrap()), mbi.flags());
        assert_eq!(u32::from_le_bytes(header[0x04..0x08].try_into().unwrap()), 640);
        assert_eq!(u32::from_le_bytes(header[0x08..0x0c].try_into().unwrap()), 130048);
        assert_eq!(u32::from_le_bytes(header[0x10..0x14].try_into().unwrap()), 0x1000);
        assert_eq!(u32::from_le_bytes(header[0x14..0x18].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(header[0x18..0x1c].try_into().unwrap()), 0x2000);
        assert_eq!(u32::from_le_bytes(header[0x2c..0x30].try_into().unwrap()), 24);
        assert_eq!(u32::from_le_bytes(header[0x30..0x34].try_into().unwrap()), 0x3000);
        assert_eq!(u32::from_le_bytes(header[0x40..0x44].try_into().unwrap()), 0x4000);
    }

    #[test]
    fn module_list_encodes_as_four_words_with_zero_reserved() {
        let mut mbi = MbiBuilder::new();
        mbi.modules.push(Module { mod_start: 0x1000, mod_end: 0x2000, string_ptr: 0x3000 });
        let encoded = mbi.encode_modules();
        assert_eq!(encoded.len(), 16);
        assert_eq!(u32::from_le_bytes(encoded[0..4].try_into().unwrap()), 0x1000);
        assert_eq!(u32::from_le_bytes(encoded[4..8].try_into().unwrap()), 0x2000);
        assert_eq!(u32::from_le_bytes(encoded[8..12].try_into().unwrap()), 0x3000);
        assert_eq!(u32::from_le_bytes(encoded[12..16].try_into().unwrap()), 0);
    }

    #[test]
    fn mmap_entry_records_size_twenty_and_the_correct_type() {
        let mut mbi = MbiBuilder::new();
        mbi.mmap.push(MemMapEntry { base: 0, length: 0x9_fc00, ty: MemMapType::Usable });
        mbi.mmap.push(MemMapEntry { base: 0x9_fc00, length: 0x400, ty: MemMapType::Reserved });
        let encoded = mbi.encode_mmap();
        assert_eq!(encoded.len(), 48);
        assert_eq!(u32::from_le_bytes(encoded[0..4].try_into().unwrap()), 20);
        assert_eq!(u64::from_le_bytes(encoded[4..12].try_into().unwrap()), 0);
        assert_eq!(u64::from_le_bytes(encoded[12..20].try_into().unwrap()), 0x9_fc00);
        assert_eq!(u32::from_le_bytes(encoded[20..24].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(encoded[24..28].try_into().unwrap()), 20);
        assert_eq!(u32::from_le_bytes(encoded[44..48].try_into().unwrap()), 2);
    }
}
