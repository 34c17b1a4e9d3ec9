// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! CRC-32 as used by the module image format: reflected polynomial
//! `0xEDB88320`, initial value `0xFFFFFFFF`, final XOR `0xFFFFFFFF` --
//! i.e. the ubiquitous zlib/IEEE 802.3 parameters, computed bitwise.
//! Images are checked rarely (at load), so the table-free form is the
//! right size/speed tradeoff for flash-resident kernels.

const POLY: u32 = 0xEDB8_8320;

/// Plain CRC-32 over `data`.
pub fn crc32(data: &[u8]) -> u32 {
    finish(data.iter().fold(0xFFFF_FFFF, |crc, &b| step(crc, b)))
}

/// CRC-32 over a module image with the header's CRC field (bytes 40..44)
/// read as zero, which is how the packer computed the stored value. The
/// image itself is not modified.
pub fn over_image_with_zeroed_crc(image: &[u8]) -> u32 {
    const CRC_FIELD: core::ops::Range<usize> = 40..44;
    let mut crc = 0xFFFF_FFFF;
    for (idx, &byte) in image.iter().enumerate() {
        let byte = if CRC_FIELD.contains(&idx) { 0 } else { byte };
        crc = step(crc, byte);
    }
    finish(crc)
}

fn step(mut crc: u32, byte: u8) -> u32 {
    crc ^= byte as u32;
    for _ in 0..8 {
        crc = (crc >> 1) ^ (POLY * (crc & 1));
    }
    crc
}

fn finish(crc: u32) -> u32 {
    crc ^ 0xFFFF_FFFF
}
