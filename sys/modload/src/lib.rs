// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Relocatable module loader.
//!
//! A *module* is a flat position-independent image produced by external
//! tooling: a 64-byte header, a binary section, relocation and symbol
//! tables, and a BSS extent (see `abi` for the exact layout). Loading
//! copies the binary into heap memory handed in by the caller, zeroes
//! the BSS, and patches every relocation against the final load address,
//! including the ARM Thumb-2 instruction encodings for `BL`/`BLX` and
//! `MOVW`/`MOVT`.
//!
//! A *bundle* is an offset index over a concatenation of module images,
//! for shipping several modules as one blob.

#![cfg_attr(not(test), no_std)]

pub mod crc32;
pub mod thumb;

use abi::sdk::ModuleEntry;
use abi::{
    BundleHeader, ImageHeader, RelocationEntry, SymbolEntry,
    BUNDLE_SIGNATURE, MODULE_SIGNATURE, R_ARM_ABS32, R_ARM_NONE,
    R_ARM_THM_CALL, R_ARM_THM_MOVT_ABS, R_ARM_THM_MOVW_ABS_NC, STT_SECTION,
};
use byteorder::{ByteOrder, LittleEndian};

/// Why a module refused to load. Unsupported relocation types are *not*
/// here: a half-relocated image must not be run, so they panic instead.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum LoadError {
    BadSignature,
    /// Header size embedded in the version word doesn't match ours: the
    /// image was packed for a different ABI.
    BadAbiVersion,
    /// Image checksum mismatch.
    BadChecksum,
    /// Nothing to load.
    EmptyBinary,
}

/// A module image sitting at some base address (flash or RAM).
pub struct Module {
    base: usize,
    load_addr: usize,
}

impl Module {
    /// Wraps the image at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point at readable memory large enough for the header
    /// it claims; every accessor trusts the header's section extents.
    pub unsafe fn new(base: usize) -> Self {
        Self { base, load_addr: 0 }
    }

    /// Quick signature probe, for scanning memory for images.
    pub unsafe fn is_module_address(addr: usize) -> bool {
        (addr as *const u32).read_unaligned() == MODULE_SIGNATURE
    }

    fn header(&self) -> ImageHeader {
        // Safety: per the constructor contract the header is readable.
        unsafe { (self.base as *const ImageHeader).read_unaligned() }
    }

    pub fn binary_size(&self) -> usize {
        self.header().binary.size as usize
    }

    pub fn relocation_count(&self) -> usize {
        self.header().relocs.size as usize
    }

    pub fn symbol_count(&self) -> usize {
        self.header().symbols.size as usize
    }

    pub fn relocation(&self, idx: usize) -> Option<RelocationEntry> {
        let hdr = self.header();
        if idx >= hdr.relocs.size as usize {
            return None;
        }
        let addr = self.base
            + hdr.relocs.offset as usize
            + idx * core::mem::size_of::<RelocationEntry>();
        // Safety: in bounds of the relocation section per the header.
        Some(unsafe { (addr as *const RelocationEntry).read_unaligned() })
    }

    pub fn symbol(&self, idx: usize) -> Option<SymbolEntry> {
        let hdr = self.header();
        if idx >= hdr.symbols.size as usize {
            return None;
        }
        let addr = self.base
            + hdr.symbols.offset as usize
            + idx * core::mem::size_of::<SymbolEntry>();
        // Safety: in bounds of the symbol section per the header.
        Some(unsafe { (addr as *const SymbolEntry).read_unaligned() })
    }

    /// The free-form text the packer places between the header and the
    /// binary section, typically a name and version.
    pub fn description(&self) -> &[u8] {
        let hdr = self.header();
        let start = core::mem::size_of::<ImageHeader>();
        let end = hdr.binary.offset as usize;
        if end <= start {
            return &[];
        }
        // Safety: within the image per the header.
        unsafe {
            core::slice::from_raw_parts(
                (self.base + start) as *const u8,
                end - start,
            )
        }
    }

    /// Checks the image CRC: poly `0xEDB88320` (reflected), computed
    /// over `total_size` bytes with the stored CRC field read as zero.
    pub fn verify_crc(&self) -> bool {
        let hdr = self.header();
        if hdr.signature != MODULE_SIGNATURE {
            return false;
        }
        // Safety: total_size bytes are readable per the constructor
        // contract.
        let image = unsafe {
            core::slice::from_raw_parts(
                self.base as *const u8,
                hdr.total_size as usize,
            )
        };
        crc32::over_image_with_zeroed_crc(image) == hdr.crc
    }

    /// Validates the image, copies the binary to `destination`, zeroes
    /// the BSS, and applies every relocation against the final address.
    ///
    /// # Safety
    ///
    /// `destination` must be writable for the binary plus BSS extent and
    /// 4-byte aligned (instruction patching assumes at least halfword
    /// alignment throughout).
    pub unsafe fn load(&mut self, destination: usize) -> Result<(), LoadError> {
        let hdr = self.header();
        if hdr.signature != MODULE_SIGNATURE {
            return Err(LoadError::BadSignature);
        }
        if (hdr.version & 0xFFFF) as usize
            != core::mem::size_of::<ImageHeader>()
        {
            return Err(LoadError::BadAbiVersion);
        }
        if hdr.binary.size == 0 {
            return Err(LoadError::EmptyBinary);
        }
        if !self.verify_crc() {
            return Err(LoadError::BadChecksum);
        }

        core::ptr::copy_nonoverlapping(
            (self.base + hdr.binary.offset as usize) as *const u8,
            destination as *mut u8,
            hdr.binary.size as usize,
        );
        core::ptr::write_bytes(
            (destination + hdr.bss.offset as usize) as *mut u8,
            0,
            hdr.bss.size as usize,
        );
        self.load_addr = destination;
        self.apply_relocations();
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.load_addr != 0
    }

    pub fn load_address(&self) -> usize {
        self.load_addr
    }

    /// Entry address for Thumb interworking: bit 0 of the stored offset
    /// is cleared for the address arithmetic, then the result's bit 0 is
    /// set so a `BLX` lands in Thumb state.
    pub fn entry_address(&self) -> usize {
        let hdr = self.header();
        (self.load_addr + (hdr.entry_offset as usize & !1)) | 1
    }

    /// The entry as a callable function pointer.
    ///
    /// # Safety
    ///
    /// Only meaningful after a successful [`Module::load`], on a target
    /// that can execute the loaded code.
    pub unsafe fn entry(&self) -> ModuleEntry {
        core::mem::transmute(self.entry_address())
    }

    /// Walks the relocation table and patches the loaded image. Called
    /// with `load_addr` already set.
    unsafe fn apply_relocations(&mut self) {
        for idx in 0..self.relocation_count() {
            let reloc = match self.relocation(idx) {
                Some(r) => r,
                None => break,
            };
            let Some(symbol) = self.symbol(reloc.symbol_idx as usize)
            else {
                panic!("relocation names a symbol outside the table");
            };

            let patch = self.load_addr + reloc.offset as usize;
            let symbol_value =
                (self.load_addr as u32).wrapping_add(symbol.value);

            match reloc.rtype {
                R_ARM_NONE => {}
                R_ARM_ABS32 => {
                    let site = patch as *mut u32;
                    if symbol.stype == STT_SECTION {
                        // Section-relative: the word already holds the
                        // addend.
                        site.write_unaligned(
                            site.read_unaligned()
                                .wrapping_add(symbol_value),
                        );
                    } else {
                        site.write_unaligned(symbol_value);
                    }
                }
                R_ARM_THM_CALL => {
                    let (hw0, hw1) =
                        thumb::encode_bl(patch as u32, symbol_value);
                    (patch as *mut u16).write_unaligned(hw0);
                    ((patch + 2) as *mut u16).write_unaligned(hw1);
                }
                R_ARM_THM_MOVW_ABS_NC => {
                    thumb::patch_mov(patch, symbol_value & 0xFFFF);
                }
                R_ARM_THM_MOVT_ABS => {
                    thumb::patch_mov(patch, symbol_value >> 16);
                }
                other => {
                    // A partially relocated module must never run.
                    panic!("unsupported relocation type {other}");
                }
            }
        }
    }
}

/// A bundle: `BundleHeader`, then `module_count` little-endian `u32`
/// offsets, each pointing at a module image within the blob.
pub struct Bundle {
    base: usize,
}

impl Bundle {
    /// # Safety
    ///
    /// Same contract as [`Module::new`], for the whole blob.
    pub unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    pub unsafe fn is_bundle_address(addr: usize) -> bool {
        (addr as *const u32).read_unaligned() == BUNDLE_SIGNATURE
    }

    fn header(&self) -> BundleHeader {
        // Safety: per the constructor contract.
        unsafe { (self.base as *const BundleHeader).read_unaligned() }
    }

    pub fn is_valid(&self) -> bool {
        self.header().signature == BUNDLE_SIGNATURE
    }

    pub fn count(&self) -> usize {
        self.header().module_count as usize
    }

    pub fn module(&self, idx: usize) -> Option<Module> {
        if !self.is_valid() || idx >= self.count() {
            return None;
        }
        let table = self.base + core::mem::size_of::<BundleHeader>();
        // Safety: the offset table follows the header per the format.
        let entry = unsafe {
            core::slice::from_raw_parts((table + idx * 4) as *const u8, 4)
        };
        // Offsets are little-endian on every side of this format,
        // including tooling running on foreign hosts.
        let offset = LittleEndian::read_u32(entry) as usize;
        // Safety: offsets index into the blob the constructor vouched
        // for.
        Some(unsafe { Module::new(self.base + offset) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    /// Builds a loadable image in memory: header, description, binary,
    /// relocation and symbol tables, with a correct CRC.
    struct ImageBuilder {
        description: Vec<u8>,
        binary: Vec<u8>,
        bss_size: u32,
        entry_offset: u32,
        relocs: Vec<RelocationEntry>,
        symbols: Vec<SymbolEntry>,
    }

    impl ImageBuilder {
        fn new(binary: Vec<u8>) -> Self {
            Self {
                description: b"test module".to_vec(),
                binary,
                bss_size: 0,
                entry_offset: 0,
                relocs: vec![],
                symbols: vec![],
            }
        }

        fn reloc(mut self, offset: u32, rtype: u32, symbol_idx: u32) -> Self {
            self.relocs.push(RelocationEntry {
                offset,
                rtype,
                section_idx: 0,
                symbol_idx,
            });
            self
        }

        fn symbol(mut self, value: u32, stype: u32) -> Self {
            self.symbols.push(SymbolEntry {
                value,
                section_idx: 0,
                stype,
                reserved: 0,
            });
            self
        }

        fn build(self) -> Vec<u8> {
            let hdr_len = core::mem::size_of::<ImageHeader>() as u32;
            let binary_off = hdr_len + self.description.len() as u32;
            let relocs_off = binary_off + self.binary.len() as u32;
            let symbols_off =
                relocs_off + (self.relocs.len() * 16) as u32;
            let total = symbols_off + (self.symbols.len() * 16) as u32;

            let mut hdr = ImageHeader {
                signature: MODULE_SIGNATURE,
                version: (1 << 16) | hdr_len,
                binary: abi::SectionDesc {
                    offset: binary_off,
                    size: self.binary.len() as u32,
                },
                relocs: abi::SectionDesc {
                    offset: relocs_off,
                    size: self.relocs.len() as u32,
                },
                symbols: abi::SectionDesc {
                    offset: symbols_off,
                    size: self.symbols.len() as u32,
                },
                bss: abi::SectionDesc {
                    offset: self.binary.len() as u32,
                    size: self.bss_size,
                },
                crc: 0,
                total_size: total,
                entry_offset: self.entry_offset,
                reserved: [0; 3],
            };

            let mut image = vec![];
            image.extend_from_slice(hdr.as_bytes());
            image.extend_from_slice(&self.description);
            image.extend_from_slice(&self.binary);
            for r in &self.relocs {
                image.extend_from_slice(r.as_bytes());
            }
            for s in &self.symbols {
                image.extend_from_slice(s.as_bytes());
            }

            // Stamp the CRC over the zero-field image.
            hdr.crc = crc32::over_image_with_zeroed_crc(&image);
            image[..64].copy_from_slice(hdr.as_bytes());
            image
        }
    }

    fn dest_buffer(len: usize) -> (Vec<u32>, usize) {
        let buf = vec![0u32; len.div_ceil(4)];
        let addr = buf.as_ptr() as usize;
        (buf, addr)
    }

    #[test]
    fn crc_roundtrip_property() {
        let image = ImageBuilder::new(vec![1, 2, 3, 4]).build();
        let m = unsafe { Module::new(image.as_ptr() as usize) };
        assert!(m.verify_crc());

        // Any flipped byte must break the check.
        let mut corrupt = image.clone();
        corrupt[70] ^= 0x40;
        let m2 = unsafe { Module::new(corrupt.as_ptr() as usize) };
        assert!(!m2.verify_crc());
    }

    #[test]
    fn rejects_bad_signature_version_and_checksum() {
        let image = ImageBuilder::new(vec![0; 16]).build();
        let (_buf, dest) = dest_buffer(64);

        let mut bad_sig = image.clone();
        bad_sig[0] ^= 0xFF;
        let mut m = unsafe { Module::new(bad_sig.as_ptr() as usize) };
        assert_eq!(
            unsafe { m.load(dest) },
            Err(LoadError::BadSignature)
        );

        let mut bad_ver = image.clone();
        bad_ver[4] = 0x63; // header-size field no longer 64
        let mut m = unsafe { Module::new(bad_ver.as_ptr() as usize) };
        assert_eq!(
            unsafe { m.load(dest) },
            Err(LoadError::BadAbiVersion)
        );

        let mut bad_crc = image.clone();
        bad_crc[66] ^= 1; // flip a binary byte, CRC now stale
        let mut m = unsafe { Module::new(bad_crc.as_ptr() as usize) };
        assert_eq!(
            unsafe { m.load(dest) },
            Err(LoadError::BadChecksum)
        );
    }

    #[test]
    fn load_copies_binary_and_zeroes_bss() {
        let payload: Vec<u8> = (1..=32).collect();
        let mut builder = ImageBuilder::new(payload.clone());
        builder.bss_size = 16;
        let image = builder.build();

        let (buf, dest) = dest_buffer(64);
        // Pre-dirty the BSS area to prove it gets zeroed.
        unsafe {
            core::ptr::write_bytes(dest as *mut u8, 0xAA, 48);
        }
        let mut m = unsafe { Module::new(image.as_ptr() as usize) };
        unsafe { m.load(dest).unwrap() };

        let out =
            unsafe { core::slice::from_raw_parts(dest as *const u8, 48) };
        assert_eq!(&out[..32], &payload[..]);
        assert!(out[32..48].iter().all(|&b| b == 0));
        assert!(m.is_loaded());
        drop(buf);
    }

    #[test]
    fn abs32_relocation_patches_and_adds() {
        // Word 0: absolute slot (overwritten). Word 1: section-relative
        // slot holding addend 0x10.
        let mut binary = vec![0u8; 8];
        binary[4] = 0x10;
        let image = ImageBuilder::new(binary)
            .symbol(0x100, 0) // plain symbol
            .symbol(0, STT_SECTION) // section symbol
            .reloc(0, R_ARM_ABS32, 0)
            .reloc(4, R_ARM_ABS32, 1)
            .build();

        let (buf, dest) = dest_buffer(16);
        let mut m = unsafe { Module::new(image.as_ptr() as usize) };
        unsafe { m.load(dest).unwrap() };

        let words = unsafe {
            core::slice::from_raw_parts(dest as *const u32, 2)
        };
        assert_eq!(words[0], dest as u32 + 0x100);
        assert_eq!(words[1], dest as u32 + 0x10);
        drop(buf);
    }

    #[test]
    fn mov_pair_rebuilds_the_load_address() {
        // MOVW r0, #0 ; MOVT r0, #0 -- fields to be filled by the loader.
        let movw: [u16; 2] = [0xF240, 0x0000];
        let movt: [u16; 2] = [0xF2C0, 0x0000];
        let mut binary = vec![];
        for hw in movw.iter().chain(movt.iter()) {
            binary.extend_from_slice(&hw.to_le_bytes());
        }

        let image = ImageBuilder::new(binary)
            .symbol(0x24, 0)
            .reloc(0, R_ARM_THM_MOVW_ABS_NC, 0)
            .reloc(4, R_ARM_THM_MOVT_ABS, 0)
            .build();

        let (buf, dest) = dest_buffer(16);
        let mut m = unsafe { Module::new(image.as_ptr() as usize) };
        unsafe { m.load(dest).unwrap() };

        let target = dest as u32 + 0x24;
        unsafe {
            let lo = thumb::decode_mov_imm16(
                (dest as *const u16).read(),
                ((dest + 2) as *const u16).read(),
            );
            let hi = thumb::decode_mov_imm16(
                ((dest + 4) as *const u16).read(),
                ((dest + 6) as *const u16).read(),
            );
            assert_eq!(lo, (target & 0xFFFF) as u16);
            assert_eq!(hi, (target >> 16) as u16);
        }
        drop(buf);
    }

    #[test]
    fn bl_relocation_reaches_the_symbol() {
        // A BL placeholder followed by the "function" it should reach.
        let mut binary = vec![0u8; 16];
        binary[0] = 0x00;
        binary[1] = 0xF0; // BL with zero offset, to be rewritten
        let image = ImageBuilder::new(binary)
            .symbol(12, 0) // function at +12 from load address
            .reloc(0, R_ARM_THM_CALL, 0)
            .build();

        let (buf, dest) = dest_buffer(32);
        let mut m = unsafe { Module::new(image.as_ptr() as usize) };
        unsafe { m.load(dest).unwrap() };

        unsafe {
            let hw0 = (dest as *const u16).read();
            let hw1 = ((dest + 2) as *const u16).read();
            let offset = thumb::decode_bl(hw0, hw1);
            // PC-relative: target = patch + 4 + offset.
            let target =
                (dest as u32 + 4).wrapping_add(offset as u32);
            assert_eq!(target, dest as u32 + 12);
        }
        drop(buf);
    }

    #[test]
    fn entry_address_keeps_thumb_bit() {
        let image = {
            let mut b = ImageBuilder::new(vec![0; 8]);
            b.entry_offset = 5; // odd: packer already set the thumb bit
            b.build()
        };
        let (buf, dest) = dest_buffer(16);
        let mut m = unsafe { Module::new(image.as_ptr() as usize) };
        unsafe { m.load(dest).unwrap() };
        // Bit 0 cleared for the sum, then set for interworking.
        assert_eq!(m.entry_address(), (dest + 4) | 1);
        drop(buf);
    }

    #[test]
    fn bundle_indexes_concatenated_modules() {
        let img_a = ImageBuilder::new(vec![0xAA; 8]).build();
        let img_b = ImageBuilder::new(vec![0xBB; 24]).build();

        let hdr = BundleHeader {
            signature: BUNDLE_SIGNATURE,
            module_count: 2,
            reserved: [0; 6],
        };
        let mut blob = vec![];
        blob.extend_from_slice(hdr.as_bytes());
        let table_at = blob.len();
        blob.extend_from_slice(&[0u8; 8]); // offset table, patched below
        let off_a = blob.len() as u32;
        blob.extend_from_slice(&img_a);
        let off_b = blob.len() as u32;
        blob.extend_from_slice(&img_b);
        blob[table_at..table_at + 4]
            .copy_from_slice(&off_a.to_le_bytes());
        blob[table_at + 4..table_at + 8]
            .copy_from_slice(&off_b.to_le_bytes());

        let bundle = unsafe { Bundle::new(blob.as_ptr() as usize) };
        assert!(bundle.is_valid());
        assert_eq!(bundle.count(), 2);
        assert_eq!(bundle.module(0).unwrap().binary_size(), 8);
        assert_eq!(bundle.module(1).unwrap().binary_size(), 24);
        assert!(bundle.module(2).is_none());
        assert!(bundle.module(0).unwrap().verify_crc());
        assert_eq!(
            bundle.module(0).unwrap().description(),
            b"test module"
        );
    }
}
