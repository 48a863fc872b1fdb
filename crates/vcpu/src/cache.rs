//! Instruction cache: direct-mapped 64-set, 4-way, keyed by the decoded
//! instruction's fingerprint (spec.md §4.6 "Instruction cache and
//! decoder"; §9 "Instruction-cache self-modifying code").
//!
//! Entries revalidate on every lookup by re-fetching their raw bytes and
//! comparing against the stored golden copy; a mismatch is treated as a
//! miss and the caller re-decodes. Spec.md §9 is explicit that this
//! golden-copy check must stay — there is no hardware watchpoint facility
//! here to replace it with a notify-on-write scheme.

use crate::decoder::{self, DecodeError, Instruction};

const SETS: usize = 64;
const WAYS: usize = 4;
const MAX_INSTR_LEN: usize = 15;

/// Identifies a cached instruction: the linear IP it was fetched at, plus
/// the code-segment access-rights byte (so the same bytes under a
/// different segment descriptor, e.g. real vs. protected mode, don't
/// collide).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub linear_ip: u64,
    pub cs_ar: u16,
}

impl Fingerprint {
    fn set_index(&self) -> usize {
        (self.linear_ip as usize) % SETS
    }
}

#[derive(Debug, Clone)]
struct Entry {
    fingerprint: Fingerprint,
    raw_bytes: [u8; MAX_INSTR_LEN],
    raw_len: u8,
    instruction: Instruction,
    decoded_len: usize,
}

#[derive(Debug, Default, Clone, Copy)]
struct Set {
    entries: [Option<usize>; WAYS],
    next_way: usize,
}

pub struct InstrCache {
    sets: Vec<Set>,
    storage: Vec<Entry>,
}

impl InstrCache {
    pub fn new() -> Self {
        InstrCache { sets: vec![Set::default(); SETS], storage: Vec::new() }
    }

    /// Look up `fingerprint`, verifying the cached entry's golden copy
    /// against `current_bytes` (exactly what the VCPU core just fetched
    /// from the memory cache). On a hit, returns the cached decode
    /// instantly; on a miss (not present, or the guest wrote over the
    /// code), decodes fresh via `current_bytes` and inserts the result.
    pub fn lookup(
        &mut self,
        fingerprint: Fingerprint,
        current_bytes: &[u8],
    ) -> Result<(Instruction, usize), DecodeError> {
        let set_idx = fingerprint.set_index();

        for way in 0..WAYS {
            if let Some(storage_idx) = self.sets[set_idx].entries[way] {
                let entry = &self.storage[storage_idx];
                if entry.fingerprint == fingerprint {
                    let len = entry.raw_len as usize;
                    if current_bytes.len() >= len && &entry.raw_bytes[..len] == &current_bytes[..len] {
                        return Ok((entry.instruction, entry.decoded_len));
                    }
                    // Golden copy mismatch: guest self-modified this code.
                    break;
                }
            }
        }

        let (instruction, decoded_len) = decoder::decode(current_bytes)?;
        self.insert(fingerprint, current_bytes, decoded_len, instruction);
        Ok((instruction, decoded_len))
    }

    fn insert(&mut self, fingerprint: Fingerprint, bytes: &[u8], decoded_len: usize, instruction: Instruction) {
        let mut raw_bytes = [0u8; MAX_INSTR_LEN];
        let raw_len = decoded_len.min(bytes.len()).min(MAX_INSTR_LEN);
        raw_bytes[..raw_len].copy_from_slice(&bytes[..raw_len]);

        let entry = Entry { fingerprint, raw_bytes, raw_len: raw_len as u8, instruction, decoded_len };
        let storage_idx = self.storage.len();
        self.storage.push(entry);

        let set_idx = fingerprint.set_index();
        let set = &mut self.sets[set_idx];
        let way = set.next_way;
        set.entries[way] = Some(storage_idx);
        set.next_way = (way + 1) % WAYS;
    }
}

impl Default for InstrCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fp(ip: u64) -> Fingerprint {
        Fingerprint { linear_ip: ip, cs_ar: 0x9b }
    }

    #[test]
    fn same_fingerprint_and_bytes_returns_the_same_decode_every_time() {
        let mut cache = InstrCache::new();
        let bytes = [0xcd, 0x13];
        let (a, _) = cache.lookup(fp(0x1000), &bytes).unwrap();
        let (b, _) = cache.lookup(fp(0x1000), &bytes).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn self_modified_code_is_treated_as_a_miss_and_redecoded() {
        let mut cache = InstrCache::new();
        let original = [0xcd, 0x13];
        cache.lookup(fp(0x2000), &original).unwrap();

        let modified = [0xcd, 0x21];
        let (instr, _) = cache.lookup(fp(0x2000), &modified).unwrap();
        assert_eq!(instr, Instruction::IntN { vector: 0x21 });
    }

    #[test]
    fn four_way_set_does_not_collide_with_a_fifth_alias() {
        // All five fingerprints below hash into the same set (linear_ip %
        // 64 == 0); the fifth eviction must not corrupt the first four.
        let mut cache = InstrCache::new();
        for i in 0..4u64 {
            let bytes = [0xcd, i as u8];
            cache.lookup(fp(i * SETS as u64), &bytes).unwrap();
        }
        let (instr, _) = cache.lookup(fp(0), &[0xcd, 0]).unwrap();
        assert_eq!(instr, Instruction::IntN { vector: 0 });
    }

    #[test]
    fn unsupported_opcode_propagates_as_an_error_not_a_cached_entry() {
        let mut cache = InstrCache::new();
        let err = cache.lookup(fp(0x3000), &[0x0f, 0x05]).unwrap_err();
        assert_eq!(err, DecodeError::Unsupported(0x05));
    }
}
