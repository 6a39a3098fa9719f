use std::collections::BTreeSet;

use encoding_rs::SHIFT_JIS;
use rand::rngs::StdRng;
use rand::Rng;
use thiserror::Error;

use crate::scramble::scramble_word;

/// Errors from executable-image addressing and patching.
#[derive(Debug, Error)]
pub enum ExeError {
    #[error("read past end of image at address {addr:#x}")]
    EndOfImage { addr: u32 },

    #[error("invalid patch byte '{token}'")]
    BadPatchByte { token: String },
}

const PE_MAGIC: &[u8] = &[0x4d, 0x5a, 0x90, 0x00];
const PE_HEADER_PTR: usize = 0x3c;
const IMAGE_BASE_OFFSET: usize = 0x34;
const SECTION_TABLE_OFFSET: usize = 0xf8;
const SECTION_ENTRY_SIZE: usize = 0x28;
const SECTION_SCAN_END: usize = 0x1000;
const SECTION_VIRTUAL_OFFSET: usize = 12;
const SECTION_RAW_OFFSET: usize = 20;

/// Probe bytes identifying the engine build whose map table and text-speed
/// routine the patcher knows.
pub const ENGINE_PROBE_ADDR: u32 = 0x420c55;
pub const ENGINE_PROBE: &str = "E8 76 B3 FE FF";

// Pointer to the map table, and the layout of its name records.
const MAP_TABLE_PTR_ADDR: u32 = 0x420c2f;
const MAP_NAME_OFFSET: u32 = 165;
const MAP_RECORD_STRIDE: u32 = 200;
const MAP_NAME_FIELD: usize = 35;

// Text-speed hack: zero the per-frame wait counter init, then rewrite the
// wait loop to render a whole line per tick.
const SPEED_PATCH_ADDR: u32 = 0x4215de;
const SPEED_PATCH_EXPECTED: &str = "C7 45 F0 F9 FF FF FF";
const SPEED_PATCH_REPLACEMENT: &str = "C7 45 F0 00 00 00 00";
const SPEED_AUX_PATCH_ADDR: u32 = 0x421639;
const SPEED_AUX_PATCH: &str = "74 05 8B 4D F4 EB 0E 03 45 08 80 38 00 75 0E B1 0D 90 90 90 90";

fn le_u16_at(b: &[u8], off: usize) -> u16 {
    let mut out = [0u8; 2];
    let avail = b.get(off..).unwrap_or(&[]);
    let n = avail.len().min(2);
    out[..n].copy_from_slice(&avail[..n]);
    u16::from_le_bytes(out)
}

fn le_u32_at(b: &[u8], off: usize) -> u32 {
    let mut out = [0u8; 4];
    let avail = b.get(off..).unwrap_or(&[]);
    let n = avail.len().min(4);
    out[..n].copy_from_slice(&avail[..n]);
    u32::from_le_bytes(out)
}

fn le_u32(bytes: &[u8]) -> u32 {
    let mut out = [0u8; 4];
    let n = bytes.len().min(4);
    out[..n].copy_from_slice(&bytes[..n]);
    u32::from_le_bytes(out)
}

/// Parse a hex-encoded patch string ("E8 76 B3 FE FF") into bytes.
pub fn parse_patch(text: &str) -> Result<Vec<u8>, ExeError> {
    text.split_whitespace()
        .map(|token| {
            u8::from_str_radix(token, 16).map_err(|_| ExeError::BadPatchByte {
                token: token.to_string(),
            })
        })
        .collect()
}

/// Ordered mapping from section virtual base addresses to raw file
/// offsets. Non-PE buffers get the trivial identity map, so raw data files
/// are still addressable at literal offsets.
#[derive(Debug)]
pub struct SectionMap {
    entries: Vec<(u32, u32)>,
}

impl SectionMap {
    pub fn parse(b: &[u8]) -> SectionMap {
        let mut entries = vec![(0u32, 0u32)];
        if b.len() < PE_MAGIC.len() || &b[..PE_MAGIC.len()] != PE_MAGIC {
            return SectionMap { entries };
        }

        let header = le_u16_at(b, PE_HEADER_PTR) as usize;
        let base = le_u32_at(b, header + IMAGE_BASE_OFFSET);
        let mut off = header + SECTION_TABLE_OFFSET;
        while off + SECTION_ENTRY_SIZE <= SECTION_SCAN_END {
            if b.get(off).copied().unwrap_or(0) == 0 {
                break;
            }
            let virtual_base =
                le_u32_at(b, off + SECTION_VIRTUAL_OFFSET).wrapping_add(base);
            let raw = le_u32_at(b, off + SECTION_RAW_OFFSET);
            entries.push((virtual_base, raw));
            off += SECTION_ENTRY_SIZE;
        }

        entries.sort_unstable();
        SectionMap { entries }
    }

    /// File offset for a virtual address: the greatest recorded base at or
    /// below it, plus the delta.
    pub fn translate(&self, addr: u32) -> usize {
        let i = self.entries.partition_point(|&(base, _)| base <= addr);
        // entries[0] is (0, 0), so i is at least 1.
        let (base, raw) = self.entries[i - 1];
        (addr - base) as usize + raw as usize
    }

    /// The bytes at virtual `[start, end)`, clamped to the buffer.
    pub fn read<'a>(&self, b: &'a [u8], start: u32, end: u32) -> &'a [u8] {
        if end <= start {
            return &[];
        }
        let off = self.translate(start);
        if off >= b.len() {
            return &[];
        }
        let stop = (off + (end - start) as usize).min(b.len());
        &b[off..stop]
    }

    pub fn read_byte(&self, b: &[u8], addr: u32) -> Result<u8, ExeError> {
        let off = self.translate(addr);
        b.get(off).copied().ok_or(ExeError::EndOfImage { addr })
    }

    /// Overwrite bytes at a virtual address in place; empty data is a
    /// no-op, and writes are clamped to the buffer end.
    pub fn write(&self, b: &mut [u8], start: u32, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let off = self.translate(start);
        if off >= b.len() {
            return;
        }
        let n = data.len().min(b.len() - off);
        b[off..off + n].copy_from_slice(&data[..n]);
    }

    /// Write `replacement` at a virtual address when `expected` is empty or
    /// matches the bytes already there. Returns whether the site was
    /// eligible at all (an empty replacement never is), not whether the
    /// expected bytes matched.
    pub fn conditional_patch(
        &self,
        b: &mut [u8],
        start: u32,
        expected: &[u8],
        replacement: &[u8],
    ) -> bool {
        if replacement.is_empty() {
            return false;
        }
        let off = self.translate(start);
        if expected.is_empty() || b.get(off..off + expected.len()) == Some(expected) {
            if off < b.len() {
                let n = replacement.len().min(b.len() - off);
                b[off..off + n].copy_from_slice(&replacement[..n]);
            }
        }
        true
    }
}

/// Whether this image is the engine build the patcher knows.
pub fn is_known_engine(b: &[u8], segs: &SectionMap) -> Result<bool, ExeError> {
    let probe = parse_patch(ENGINE_PROBE)?;
    Ok(segs.read(b, ENGINE_PROBE_ADDR, ENGINE_PROBE_ADDR + probe.len() as u32) == probe)
}

// Walk the map table: (record address, name length) per entry. The name
// field is NUL-terminated within its 35 bytes; a NUL at offset 35 ends the
// table.
fn map_name_records(b: &[u8], segs: &SectionMap) -> Result<Vec<(u32, usize)>, ExeError> {
    let table = le_u32(segs.read(b, MAP_TABLE_PTR_ADDR, MAP_TABLE_PTR_ADDR + 4));
    let mut records = Vec::new();
    let mut curr = table + MAP_NAME_OFFSET;
    loop {
        let mut len = MAP_NAME_FIELD - 1;
        for k in 0..MAP_NAME_FIELD {
            if segs.read_byte(b, curr + k as u32)? == 0 {
                len = k;
                break;
            }
        }
        records.push((curr, len));
        if segs.read_byte(b, curr + MAP_NAME_FIELD as u32)? == 0 {
            break;
        }
        curr += MAP_RECORD_STRIDE;
    }
    Ok(records)
}

/// Add the lowercased words of every map name to the dictionary set.
/// Returns false untouched when the image is not the known engine build.
pub fn harvest_map_names(
    b: &[u8],
    segs: &SectionMap,
    words: &mut BTreeSet<String>,
) -> Result<bool, ExeError> {
    if !is_known_engine(b, segs)? {
        return Ok(false);
    }
    for (addr, len) in map_name_records(b, segs)? {
        if len == 0 {
            continue;
        }
        let (name, _, _) = SHIFT_JIS.decode(segs.read(b, addr, addr + len as u32));
        let cleaned: String = name
            .to_lowercase()
            .chars()
            .filter(|c| *c != '\u{FFFD}')
            .collect();
        for word in cleaned.split_whitespace() {
            words.insert(word.to_string());
        }
    }
    Ok(true)
}

/// Scramble the words of every map name in place, at triple the dialogue
/// word rate, and re-encode each name NUL-terminated.
pub fn scramble_map_names(
    b: &mut [u8],
    segs: &SectionMap,
    dictionary: &[String],
    rate: f64,
    rng: &mut StdRng,
) -> Result<(), ExeError> {
    for (addr, len) in map_name_records(b, segs)? {
        if len == 0 {
            continue;
        }
        let (name, _, _) = SHIFT_JIS.decode(segs.read(b, addr, addr + len as u32));
        let cleaned: String = name.chars().filter(|c| *c != '\u{FFFD}').collect();
        let mut parts: Vec<String> = cleaned
            .split_whitespace()
            .map(|w| w.to_string())
            .collect();
        for part in parts.iter_mut() {
            if rng.gen::<f64>() < rate * 3.0 {
                let replaced = scramble_word(part.as_bytes(), dictionary, rng);
                *part = String::from_utf8_lossy(&replaced).into_owned();
            }
        }
        let joined = parts.join(" ");
        let (encoded, _, _) = SHIFT_JIS.encode(&joined);
        let mut new_name = encoded.into_owned();
        new_name.push(0);
        segs.write(b, addr, &new_name);
    }
    Ok(())
}

/// Apply the text-speed patches: the counter init must match before either
/// site is touched.
pub fn apply_speed_patches(b: &mut [u8], segs: &SectionMap) -> Result<(), ExeError> {
    let expected = parse_patch(SPEED_PATCH_EXPECTED)?;
    let replacement = parse_patch(SPEED_PATCH_REPLACEMENT)?;
    if segs.conditional_patch(b, SPEED_PATCH_ADDR, &expected, &replacement) {
        let aux = parse_patch(SPEED_AUX_PATCH)?;
        segs.conditional_patch(b, SPEED_AUX_PATCH_ADDR, &[], &aux);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::{
        apply_speed_patches, harvest_map_names, is_known_engine, parse_patch,
        scramble_map_names, SectionMap,
    };

    // Minimal PE image: one section, virtual 0x1000 + base 0x400000,
    // raw offset 0x400.
    fn pe_image() -> Vec<u8> {
        let mut b = vec![0u8; 0x800];
        b[..4].copy_from_slice(&[0x4d, 0x5a, 0x90, 0x00]);
        let header = 0x80usize;
        b[0x3c..0x3e].copy_from_slice(&(header as u16).to_le_bytes());
        b[header + 0x34..header + 0x38].copy_from_slice(&0x400000u32.to_le_bytes());
        let entry = header + 0xf8;
        b[entry..entry + 6].copy_from_slice(b".text\0");
        b[entry + 12..entry + 16].copy_from_slice(&0x1000u32.to_le_bytes());
        b[entry + 20..entry + 24].copy_from_slice(&0x400u32.to_le_bytes());
        b
    }

    // Engine-shaped image: one section mapping virtual 0x420000 to raw
    // 0x200, with the probe bytes, map-table pointer and one map record.
    fn engine_image() -> Vec<u8> {
        let mut b = vec![0u8; 0x2000];
        b[..4].copy_from_slice(&[0x4d, 0x5a, 0x90, 0x00]);
        let header = 0x80usize;
        b[0x3c..0x3e].copy_from_slice(&(header as u16).to_le_bytes());
        b[header + 0x34..header + 0x38].copy_from_slice(&0x400000u32.to_le_bytes());
        let entry = header + 0xf8;
        b[entry..entry + 6].copy_from_slice(b".text\0");
        b[entry + 12..entry + 16].copy_from_slice(&0x20000u32.to_le_bytes());
        b[entry + 20..entry + 24].copy_from_slice(&0x200u32.to_le_bytes());

        // Probe at virtual 0x420c55 -> raw 0xe55.
        b[0xe55..0xe5a].copy_from_slice(&[0xE8, 0x76, 0xB3, 0xFE, 0xFF]);
        // Map table pointer at virtual 0x420c2f -> raw 0xe2f, pointing at
        // virtual 0x420000; first name record sits 165 bytes in.
        b[0xe2f..0xe33].copy_from_slice(&0x420000u32.to_le_bytes());
        let record = 0x200 + 165;
        b[record..record + 10].copy_from_slice(b"First Cave");
        // Name is NUL-terminated and the byte at +35 ends the table.
        b[record + 10] = 0;
        b[record + 35] = 0;
        b
    }

    #[test]
    fn recognizes_the_engine_probe() {
        let b = engine_image();
        let segs = SectionMap::parse(&b);
        assert!(is_known_engine(&b, &segs).unwrap());

        let plain = pe_image();
        let segs = SectionMap::parse(&plain);
        assert!(!is_known_engine(&plain, &segs).unwrap());
    }

    #[test]
    fn harvests_map_name_words() {
        let b = engine_image();
        let segs = SectionMap::parse(&b);
        let mut words = BTreeSet::new();
        assert!(harvest_map_names(&b, &segs, &mut words).unwrap());
        let words: Vec<String> = words.into_iter().collect();
        assert_eq!(words, vec!["cave", "first"]);
    }

    #[test]
    fn scrambles_map_names_in_place() {
        let mut b = engine_image();
        let segs = SectionMap::parse(&b);
        let dict = vec!["zzz".to_string()];
        let mut rng = StdRng::seed_from_u64(1);
        // rate 1.0 means every word is replaced (3x rate saturates).
        scramble_map_names(&mut b, &segs, &dict, 1.0, &mut rng).unwrap();
        let record = 0x200 + 165;
        assert_eq!(&b[record..record + 8], b"Zzz Zzz\0");
    }

    #[test]
    fn speed_patches_apply_when_the_counter_matches() {
        let mut b = engine_image();
        // Counter init at virtual 0x4215de -> raw 0x17de.
        b[0x17de..0x17e5].copy_from_slice(&[0xC7, 0x45, 0xF0, 0xF9, 0xFF, 0xFF, 0xFF]);
        let segs = SectionMap::parse(&b);
        apply_speed_patches(&mut b, &segs).unwrap();
        assert_eq!(&b[0x17de..0x17e5], &[0xC7, 0x45, 0xF0, 0x00, 0x00, 0x00, 0x00]);
        // The wait-loop rewrite at 0x421639 -> raw 0x1839 follows.
        assert_eq!(&b[0x1839..0x183c], &[0x74, 0x05, 0x8B]);
    }

    #[test]
    fn speed_patches_leave_unknown_counters_alone() {
        let mut b = engine_image();
        let before = b.clone();
        let segs = SectionMap::parse(&b);
        apply_speed_patches(&mut b, &segs).unwrap();
        // First site did not match, but the aux patch is unconditional
        // once the pair is attempted, so only that site changes.
        assert_eq!(&b[0x17de..0x17e5], &before[0x17de..0x17e5]);
    }

    #[test]
    fn non_pe_buffers_map_to_identity() {
        let segs = SectionMap::parse(b"just some data");
        assert_eq!(segs.translate(0), 0);
        assert_eq!(segs.translate(5), 5);
        assert_eq!(segs.read(b"just some data", 5, 9), b"some");
    }

    #[test]
    fn pe_sections_translate_virtual_to_raw() {
        let b = pe_image();
        let segs = SectionMap::parse(&b);
        assert_eq!(segs.translate(0x401000), 0x400);
        assert_eq!(segs.translate(0x401234), 0x634);
        // Below every section base, the identity entry applies.
        assert_eq!(segs.translate(0x100), 0x100);
    }

    #[test]
    fn read_clamps_and_read_byte_fails_past_end() {
        let mut b = pe_image();
        b[0x400..0x404].copy_from_slice(b"ABCD");
        let segs = SectionMap::parse(&b);
        assert_eq!(segs.read(&b, 0x401000, 0x401004), b"ABCD");
        assert_eq!(segs.read(&b, 0x401000, 0x401000), b"");
        assert!(segs.read_byte(&b, 0x401000).is_ok());
        // 0x400 + (end - 0x1000) runs past the 0x800-byte buffer.
        assert!(segs.read_byte(&b, 0x401500).is_err());
    }

    #[test]
    fn write_is_a_noop_on_empty_data() {
        let mut b = pe_image();
        let segs = SectionMap::parse(&b);
        let before = b.clone();
        segs.write(&mut b, 0x401000, &[]);
        assert_eq!(b, before);

        segs.write(&mut b, 0x401000, b"XY");
        assert_eq!(&b[0x400..0x402], b"XY");
    }

    #[test]
    fn empty_replacement_is_never_eligible() {
        let mut b = pe_image();
        let segs = SectionMap::parse(&b);
        let before = b.clone();
        assert!(!segs.conditional_patch(&mut b, 0x401000, b"AB", &[]));
        assert_eq!(b, before);
    }

    #[test]
    fn empty_expected_always_writes() {
        let mut b = pe_image();
        let segs = SectionMap::parse(&b);
        assert!(segs.conditional_patch(&mut b, 0x401000, &[], b"ZZ"));
        assert_eq!(&b[0x400..0x402], b"ZZ");
    }

    #[test]
    fn mismatched_expected_skips_the_write_but_stays_eligible() {
        let mut b = pe_image();
        b[0x400..0x402].copy_from_slice(b"AB");
        let segs = SectionMap::parse(&b);
        assert!(segs.conditional_patch(&mut b, 0x401000, b"XY", b"ZZ"));
        assert_eq!(&b[0x400..0x402], b"AB");

        assert!(segs.conditional_patch(&mut b, 0x401000, b"AB", b"ZZ"));
        assert_eq!(&b[0x400..0x402], b"ZZ");
    }

    #[test]
    fn patch_strings_parse_to_bytes() {
        assert_eq!(
            parse_patch("E8 76 B3 FE FF").unwrap(),
            vec![0xE8, 0x76, 0xB3, 0xFE, 0xFF]
        );
        assert!(parse_patch("GG").is_err());
    }
}
