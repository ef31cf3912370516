// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The executable image header.
//!
//! A loadable program starts with a fixed-layout header: a magic word
//! followed by three segment records (code, initialized data, uninitialized
//! data), each a (virtualAddr, inFileAddr, size) triple. Words in the file
//! are canonically little-endian; images produced on a big-endian host are
//! detected by the reversed magic and byte-swapped on parse.

use byteorder::{ByteOrder, LittleEndian};

/// Magic word at offset 0 of every valid image.
pub const NOFF_MAGIC: u32 = 0xBAD_FAD;

/// Number of header words: the magic plus three words per segment.
const HEADER_WORDS: usize = 10;

/// One segment of an image: where it lands in the virtual address space,
/// where its bytes sit in the file, and how many there are.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Segment {
    pub virtual_addr: i32,
    pub in_file_addr: i32,
    pub size: i32,
}

/// A parsed, endianness-normalized image header.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct NoffHeader {
    pub code: Segment,
    pub init_data: Segment,
    pub uninit_data: Segment,
}

/// Ways a header can fail to parse.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NoffError {
    /// Fewer than `NoffHeader::SIZE` bytes available.
    TooShort,
    /// The magic word matched in neither byte order.
    BadMagic(u32),
}

impl NoffHeader {
    /// Byte length of the on-disk header.
    pub const SIZE: usize = HEADER_WORDS * 4;

    /// Parses a header from the front of `bytes`, normalizing byte order.
    pub fn parse(bytes: &[u8]) -> Result<Self, NoffError> {
        if bytes.len() < Self::SIZE {
            return Err(NoffError::TooShort);
        }
        let word = |i: usize| LittleEndian::read_u32(&bytes[4 * i..]);

        let magic = word(0);
        let swapped = magic != NOFF_MAGIC && magic.swap_bytes() == NOFF_MAGIC;
        if !swapped && magic != NOFF_MAGIC {
            return Err(NoffError::BadMagic(magic));
        }

        let norm = |i: usize| {
            let w = word(i);
            if swapped {
                w.swap_bytes() as i32
            } else {
                w as i32
            }
        };
        let seg = |base: usize| Segment {
            virtual_addr: norm(base),
            in_file_addr: norm(base + 1),
            size: norm(base + 2),
        };

        Ok(NoffHeader {
            code: seg(1),
            init_data: seg(4),
            uninit_data: seg(7),
        })
    }

    /// Serializes the header in the canonical byte order. Used by image
    /// builders and test fixtures.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut out = [0; Self::SIZE];
        LittleEndian::write_u32(&mut out[..4], NOFF_MAGIC);
        for (base, seg) in [
            (1, &self.code),
            (4, &self.init_data),
            (7, &self.uninit_data),
        ] {
            let words = [seg.virtual_addr, seg.in_file_addr, seg.size];
            for (k, w) in words.iter().enumerate() {
                let at = 4 * (base + k);
                LittleEndian::write_i32(&mut out[at..at + 4], *w);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> NoffHeader {
        NoffHeader {
            code: Segment {
                virtual_addr: 0,
                in_file_addr: NoffHeader::SIZE as i32,
                size: 256,
            },
            init_data: Segment {
                virtual_addr: 256,
                in_file_addr: NoffHeader::SIZE as i32 + 256,
                size: 40,
            },
            uninit_data: Segment {
                virtual_addr: 296,
                in_file_addr: 0,
                size: 12,
            },
        }
    }

    #[test]
    fn parse_rejects_short_input() {
        assert_eq!(NoffHeader::parse(&[0; 8]), Err(NoffError::TooShort));
    }

    #[test]
    fn parse_rejects_garbage_magic() {
        let mut bytes = sample().to_bytes();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            NoffHeader::parse(&bytes),
            Err(NoffError::BadMagic(_))
        ));
    }

    #[test]
    fn canonical_round_trip() {
        let h = sample();
        assert_eq!(NoffHeader::parse(&h.to_bytes()), Ok(h));
    }

    #[test]
    fn big_endian_image_normalizes() {
        let h = sample();
        let le = h.to_bytes();
        // Byte-swap every word, as a big-endian producer would have laid
        // them out.
        let mut be = [0; NoffHeader::SIZE];
        for (dst, src) in be.chunks_mut(4).zip(le.chunks(4)) {
            dst.copy_from_slice(src);
            dst.reverse();
        }
        assert_eq!(NoffHeader::parse(&be), Ok(h));
    }
}
