/*
    fluxtap
    https://github.com/dbalsom/fluxtap

    Copyright 2024-2025 Daniel Balsom

    Permission is hereby granted, free of charge, to any person obtaining a
    copy of this software and associated documentation files (the “Software”),
    to deal in the Software without restriction, including without limitation
    the rights to use, copy, modify, merge, publish, distribute, sublicense,
    and/or sell copies of the Software, and to permit persons to whom the
    Software is furnished to do so, subject to the following conditions:

    The above copyright notice and this permission notice shall be included in
    all copies or substantial portions of the Software.

    THE SOFTWARE IS PROVIDED “AS IS”, WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
    IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
    FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
    AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
    LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING
    FROM, OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER
    DEALINGS IN THE SOFTWARE.

    --------------------------------------------------------------------------
*/

//! The GCR (6-and-2) sector codec used by Macintosh 400K/800K drives.
//!
//! On-disk symbols are 8-bit bytes constrained so the IWM can clock them;
//! each valid symbol decodes to a 6-bit value through a 128-entry table.
//! Sector payloads are scrambled by a rolling three-accumulator checksum:
//! decoding the checksum and descrambling the data are the same pass, with
//! the payload bytes XOR-mutated in place as the accumulators roll.

use thiserror::Error;

use crate::{SectorGeometry, GCR_ADDRESS_MARK_LEN, GCR_DATA_MARK_LEN};

/// Address mark signature bytes.
pub const ADDRESS_PROLOG: [u8; 3] = [0xD5, 0xAA, 0x96];
/// Data mark signature bytes.
pub const DATA_PROLOG: [u8; 3] = [0xD5, 0xAA, 0xAD];
/// Bit-slip bytes terminating both mark types.
pub const BIT_SLIP: [u8; 2] = [0xDE, 0xAA];

/// Nibble-encoded bytes in a data mark: 699 payload nibbles followed by a
/// 4-nibble checksum trailer.
pub const DATA_NIBBLES: usize = 703;
const PAYLOAD_NIBBLES: usize = 699;

const INVALID_NIBBLE: u8 = 0xFF;

/// Maps the low 7 bits of an on-disk symbol to its 6-bit value, or
/// `INVALID_NIBBLE` where the IWM defines no symbol.
#[rustfmt::skip]
const IWM_TO_NIBBLE: [u8; 128] = [
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF,
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00, 0x01, 0xFF, 0xFF, 0x02, 0x03, 0xFF, 0x04, 0x05, 0x06,
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x07, 0x08, 0xFF, 0xFF, 0xFF, 0x09, 0x0A, 0x0B, 0x0C, 0x0D,
    0xFF, 0xFF, 0x0E, 0x0F, 0x10, 0x11, 0x12, 0x13, 0xFF, 0x14, 0x15, 0x16, 0x17, 0x18, 0x19, 0x1A,
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x1B, 0xFF, 0x1C, 0x1D, 0x1E,
    0xFF, 0xFF, 0xFF, 0x1F, 0xFF, 0xFF, 0x20, 0x21, 0xFF, 0x22, 0x23, 0x24, 0x25, 0x26, 0x27, 0x28,
    0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x29, 0x2A, 0x2B, 0xFF, 0x2C, 0x2D, 0x2E, 0x2F, 0x30, 0x31, 0x32,
    0xFF, 0xFF, 0x33, 0x34, 0x35, 0x36, 0x37, 0x38, 0xFF, 0x39, 0x3A, 0x3B, 0x3C, 0x3D, 0x3E, 0x3F,
];

/// The inverse table: 6-bit value to on-disk symbol.
#[rustfmt::skip]
const NIBBLE_TO_IWM: [u8; 64] = [
    0x96, 0x97, 0x9A, 0x9B, 0x9D, 0x9E, 0x9F, 0xA6,
    0xA7, 0xAB, 0xAC, 0xAD, 0xAE, 0xAF, 0xB2, 0xB3,
    0xB4, 0xB5, 0xB6, 0xB7, 0xB9, 0xBA, 0xBB, 0xBC,
    0xBD, 0xBE, 0xBF, 0xCB, 0xCD, 0xCE, 0xCF, 0xD3,
    0xD6, 0xD7, 0xD9, 0xDA, 0xDB, 0xDC, 0xDD, 0xDE,
    0xDF, 0xE5, 0xE6, 0xE7, 0xE9, 0xEA, 0xEB, 0xEC,
    0xED, 0xEE, 0xEF, 0xF2, 0xF3, 0xF4, 0xF5, 0xF6,
    0xF7, 0xF9, 0xFA, 0xFB, 0xFC, 0xFD, 0xFE, 0xFF,
];

/// Decode one on-disk symbol to its 6-bit value. The top bit is ignored; it
/// carries the capture direction flag.
#[inline]
pub fn decode_nibble(byte: u8) -> Option<u8> {
    match IWM_TO_NIBBLE[(byte & 0x7F) as usize] {
        INVALID_NIBBLE => None,
        nibble => Some(nibble),
    }
}

/// Encode a 6-bit value as an on-disk symbol.
#[inline]
pub fn encode_nibble(value: u8) -> u8 {
    NIBBLE_TO_IWM[(value & 0x3F) as usize]
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Error)]
pub enum DenibblizeError {
    #[error("denibblization ended on unused hi-bits nibble (0x{0:02X})")]
    UnusedHiBits(u8),
    #[error("denibblization ended on partially-unused hi-bits nibble (0x{0:02X})")]
    PartiallyUnusedHiBits(u8),
}

/// Restartable denibblizing producer over a stream of 6-bit values.
///
/// Input comes in runs of up to four: a "hi-bits" value supplying, two bits
/// at a time, the missing top bits of up to three following values that each
/// carry their low six bits directly. A run that ends while bits of the
/// hi-bits value are still pending is a [DenibblizeError]; after an error the
/// producer is exhausted.
pub struct Denibblizer<'a> {
    input: &'a [u8],
    pos: usize,
    hi_bits: u8,
    phase: u8,
    failed: bool,
}

impl<'a> Denibblizer<'a> {
    pub fn new(input: &'a [u8]) -> Denibblizer<'a> {
        Denibblizer {
            input,
            pos: 0,
            hi_bits: 0,
            phase: 0,
            failed: false,
        }
    }

    fn take(&mut self) -> Option<u8> {
        let byte = self.input.get(self.pos).copied();
        if byte.is_some() {
            self.pos += 1;
        }
        byte
    }
}

impl Iterator for Denibblizer<'_> {
    type Item = Result<u8, DenibblizeError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.phase == 0 {
            self.hi_bits = match self.take() {
                Some(byte) => byte,
                None => return None,
            };
            self.phase = 1;
        }
        match self.take() {
            Some(byte) => {
                let shift = 2 * self.phase;
                let out = byte | ((self.hi_bits << shift) & 0xC0);
                self.phase = if self.phase == 3 { 0 } else { self.phase + 1 };
                Some(Ok(out))
            }
            None => {
                self.failed = true;
                match self.phase {
                    1 => Some(Err(DenibblizeError::UnusedHiBits(self.hi_bits))),
                    2 if self.hi_bits & 0x0F != 0 => {
                        Some(Err(DenibblizeError::PartiallyUnusedHiBits(self.hi_bits)))
                    }
                    3 if self.hi_bits & 0x03 != 0 => {
                        Some(Err(DenibblizeError::PartiallyUnusedHiBits(self.hi_bits)))
                    }
                    _ => None,
                }
            }
        }
    }
}

/// Materialize a denibblized stream into a buffer.
pub fn denibblize(input: &[u8]) -> Result<Vec<u8>, DenibblizeError> {
    Denibblizer::new(input).collect()
}

/// The inverse packing: group bytes in runs of up to three, each run led by
/// a hi-bits value collecting the top two bits of every byte in the run.
pub fn nibblize(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity((data.len() + 2) / 3 * 4);
    for chunk in data.chunks(3) {
        let mut hi_bits = 0u8;
        for (i, byte) in chunk.iter().enumerate() {
            hi_bits |= (byte & 0xC0) >> (2 * (i as u8 + 1));
        }
        out.push(hi_bits);
        for byte in chunk {
            out.push(byte & 0x3F);
        }
    }
    out
}

/// Descramble `data` in place and return the computed checksum (A, B, C).
///
/// Per 3-byte group: C rotates left one bit; the first byte XORs with the
/// rotated C and is carry-added into A; the second XORs with the updated A
/// and adds into B; the third XORs with the updated B and adds into C,
/// seeding the next rotation. The XOR step is what descrambles the payload;
/// the checksum falls out of the same pass.
pub fn descramble(data: &mut [u8]) -> [u8; 3] {
    let mut a: u8 = 0;
    let mut b: u8 = 0;
    let mut c: u8 = 0;
    for trio in data.chunks_mut(3) {
        let mut carry = c >> 7;
        c = c.rotate_left(1);

        trio[0] ^= c;
        let sum = a as u16 + trio[0] as u16 + carry as u16;
        carry = (sum >> 8) as u8;
        a = sum as u8;
        if trio.len() < 2 {
            break;
        }

        trio[1] ^= a;
        let sum = b as u16 + trio[1] as u16 + carry as u16;
        carry = (sum >> 8) as u8;
        b = sum as u8;
        if trio.len() < 3 {
            break;
        }

        trio[2] ^= b;
        let sum = c as u16 + trio[2] as u16 + carry as u16;
        c = sum as u8;
    }
    [a, b, c]
}

/// Scramble `data` in place and return the checksum the matching
/// [descramble] pass will compute. The checksum runs over the plaintext, so
/// the accumulators are fed before each XOR.
pub fn scramble(data: &mut [u8]) -> [u8; 3] {
    let mut a: u8 = 0;
    let mut b: u8 = 0;
    let mut c: u8 = 0;
    for trio in data.chunks_mut(3) {
        let mut carry = c >> 7;
        c = c.rotate_left(1);

        let plain = trio[0];
        let sum = a as u16 + plain as u16 + carry as u16;
        carry = (sum >> 8) as u8;
        a = sum as u8;
        trio[0] = plain ^ c;
        if trio.len() < 2 {
            break;
        }

        let plain = trio[1];
        let sum = b as u16 + plain as u16 + carry as u16;
        carry = (sum >> 8) as u8;
        b = sum as u8;
        trio[1] = plain ^ a;
        if trio.len() < 3 {
            break;
        }

        let plain = trio[2];
        let sum = c as u16 + plain as u16 + carry as u16;
        c = sum as u8;
        trio[2] = plain ^ b;
    }
    [a, b, c]
}

/// Recoverable faults raised while decoding a GCR mark candidate. None is
/// fatal to the stream; the session loop logs the fault and resynchronizes.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum GcrFault {
    MissingBitSlip,
    /// The offending on-disk symbols, as captured (direction bit set).
    InvalidNibbles(Vec<u8>),
    InvalidSectorNibble(u8),
    BadAddressChecksum {
        stored:   u8,
        computed: u8,
    },
    Denibblize(DenibblizeError),
}

/// A decoded data mark, checksums not yet compared: the session loop owns
/// the sector-match and checksum-match policy so it can log each failure
/// distinctly.
#[derive(Clone, Debug)]
pub struct DataMark {
    pub sector: u8,
    pub payload: Vec<u8>,
    pub actual_checksum: [u8; 3],
    pub target_checksum: [u8; 3],
}

impl DataMark {
    pub fn checksum_ok(&self) -> bool {
        self.actual_checksum == self.target_checksum
    }
}

fn check_bit_slip(record: &[u8]) -> Result<(), GcrFault> {
    let tail = &record[record.len() - 2..];
    if tail[0] & 0x7F != BIT_SLIP[0] & 0x7F || tail[1] & 0x7F != BIT_SLIP[1] & 0x7F {
        return Err(GcrFault::MissingBitSlip);
    }
    Ok(())
}

/// Decode a complete 10-byte address mark record (signature included).
/// A valid mark yields the geometry that subsequent data marks are checked
/// against.
pub fn decode_address_mark(record: &[u8]) -> Result<SectorGeometry, GcrFault> {
    debug_assert_eq!(record.len(), GCR_ADDRESS_MARK_LEN);
    check_bit_slip(record)?;

    let mut nibbles = [0u8; 5];
    let mut invalid = Vec::new();
    for (i, byte) in record[3..8].iter().enumerate() {
        match decode_nibble(*byte) {
            Some(nibble) => nibbles[i] = nibble,
            None => invalid.push(byte | 0x80),
        }
    }
    if !invalid.is_empty() {
        return Err(GcrFault::InvalidNibbles(invalid));
    }

    let [track, sector, side, format, stored] = nibbles;
    let computed = track ^ sector ^ side ^ format;
    if stored != computed {
        return Err(GcrFault::BadAddressChecksum { stored, computed });
    }

    // The side nibble packs the physical side in bit 5 and the track's high
    // bits in its low bits.
    let track = (((side as u16) << 6) | track as u16) & 0x7FF;
    let side = side >> 5;
    Ok(SectorGeometry {
        track,
        sector,
        side,
        format,
    })
}

/// Decode a complete 709-byte data mark record (signature included) up to,
/// but not including, the checksum/sector-match policy.
pub fn decode_data_mark(record: &[u8]) -> Result<DataMark, GcrFault> {
    debug_assert_eq!(record.len(), GCR_DATA_MARK_LEN);
    check_bit_slip(record)?;

    let sector = decode_nibble(record[3]).ok_or(GcrFault::InvalidSectorNibble(record[3] | 0x80))?;

    let mut nibbles = Vec::with_capacity(DATA_NIBBLES);
    let mut invalid = Vec::new();
    for byte in &record[4..4 + DATA_NIBBLES] {
        match decode_nibble(*byte) {
            Some(nibble) => nibbles.push(nibble),
            None => invalid.push(byte | 0x80),
        }
    }
    if !invalid.is_empty() {
        return Err(GcrFault::InvalidNibbles(invalid));
    }

    // The 4-nibble trailer denibblizes into the 3-byte target checksum; it
    // cannot fault (a full run always decodes cleanly).
    let target = denibblize(&nibbles[PAYLOAD_NIBBLES..]).map_err(GcrFault::Denibblize)?;
    let mut payload = denibblize(&nibbles[..PAYLOAD_NIBBLES]).map_err(GcrFault::Denibblize)?;
    let actual = descramble(&mut payload);

    let mut target_checksum = [0u8; 3];
    target_checksum.copy_from_slice(&target);
    Ok(DataMark {
        sector,
        payload,
        actual_checksum: actual,
        target_checksum,
    })
}

/// Encode a 10-byte address mark for the given geometry. The counterpart of
/// [decode_address_mark], used to synthesize captures.
pub fn encode_address_mark(geometry: SectorGeometry) -> [u8; GCR_ADDRESS_MARK_LEN] {
    let track_low = (geometry.track & 0x3F) as u8;
    let side = ((geometry.side & 0x01) << 5) | ((geometry.track >> 6) as u8 & 0x1F);
    let checksum = track_low ^ geometry.sector ^ side ^ geometry.format;

    let mut record = [0u8; GCR_ADDRESS_MARK_LEN];
    record[..3].copy_from_slice(&ADDRESS_PROLOG);
    record[3] = encode_nibble(track_low);
    record[4] = encode_nibble(geometry.sector);
    record[5] = encode_nibble(side);
    record[6] = encode_nibble(geometry.format);
    record[7] = encode_nibble(checksum);
    record[8..].copy_from_slice(&BIT_SLIP);
    record
}

/// Encode a 709-byte data mark carrying `payload` (which must be 524 bytes:
/// 12 tag bytes plus 512 data bytes) for the given sector.
pub fn encode_data_mark(sector: u8, payload: &[u8]) -> Result<Vec<u8>, crate::AnalyzerError> {
    if payload.len() != crate::GCR_SECTOR_LEN {
        log::error!("data mark payload must be {} bytes", crate::GCR_SECTOR_LEN);
        return Err(crate::AnalyzerError::ParameterError);
    }
    let mut scrambled = payload.to_vec();
    let checksum = scramble(&mut scrambled);

    let mut nibbles = nibblize(&scrambled);
    nibbles.extend(nibblize(&checksum));
    debug_assert_eq!(nibbles.len(), DATA_NIBBLES);

    let mut record = Vec::with_capacity(GCR_DATA_MARK_LEN);
    record.extend_from_slice(&DATA_PROLOG);
    record.push(encode_nibble(sector));
    record.extend(nibbles.iter().map(|n| encode_nibble(*n)));
    record.extend_from_slice(&BIT_SLIP);
    debug_assert_eq!(record.len(), GCR_DATA_MARK_LEN);
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nibble_table_round_trips() {
        for value in 0..64u8 {
            let symbol = encode_nibble(value);
            assert_eq!(decode_nibble(symbol), Some(value));
        }
        assert_eq!(decode_nibble(0x96), Some(0x00));
        assert_eq!(decode_nibble(0xFF), Some(0x3F));
        // 0xD5 and 0xAA are reserved for mark signatures.
        assert_eq!(decode_nibble(0xD5), None);
        assert_eq!(decode_nibble(0xAA), None);
    }

    #[test]
    fn denibblize_inverts_nibblize() {
        let data: Vec<u8> = (0..=255u8).cycle().take(524).collect();
        let nibbles = nibblize(&data);
        assert_eq!(nibbles.len(), 699);
        assert!(nibbles.iter().all(|n| *n < 0x40));
        assert_eq!(denibblize(&nibbles).unwrap(), data);
    }

    #[test]
    fn denibblize_flags_pending_hi_bits() {
        // Hi-bits value with all four bit pairs populated, but only one
        // following byte.
        let err = denibblize(&[0x3F, 0x01]).unwrap_err();
        assert_eq!(err, DenibblizeError::PartiallyUnusedHiBits(0x3F));

        // A lone hi-bits value is always an error.
        let err = denibblize(&[0x00]).unwrap_err();
        assert_eq!(err, DenibblizeError::UnusedHiBits(0x00));

        // A clean partial run: top bits pending for consumed bytes only.
        assert_eq!(denibblize(&[0x30, 0x01, 0x02]).unwrap(), vec![0xC1, 0x02]);
    }

    #[test]
    fn scramble_round_trips() {
        let mut data: Vec<u8> = (0..524u16).map(|i| (i * 7 + 13) as u8).collect();
        let original = data.clone();
        let encode_checksum = scramble(&mut data);
        assert_ne!(data, original);
        let decode_checksum = descramble(&mut data);
        assert_eq!(data, original);
        assert_eq!(encode_checksum, decode_checksum);
    }

    #[test]
    fn address_mark_round_trips() {
        let geometry = SectorGeometry {
            track: 75,
            sector: 9,
            side: 1,
            format: 0x22,
        };
        let record = encode_address_mark(geometry);
        assert_eq!(decode_address_mark(&record).unwrap(), geometry);
    }

    #[test]
    fn address_mark_rejects_bad_checksum() {
        let geometry = SectorGeometry {
            track: 3,
            sector: 1,
            side: 0,
            format: 0x22,
        };
        let mut record = encode_address_mark(geometry);
        // Swap the sector symbol for a different valid symbol.
        record[4] = encode_nibble(2);
        match decode_address_mark(&record) {
            Err(GcrFault::BadAddressChecksum { .. }) => {}
            other => panic!("expected checksum fault, got {:?}", other),
        }
    }

    #[test]
    fn data_mark_round_trips() {
        let payload: Vec<u8> = (0..524u16).map(|i| (i ^ (i >> 3)) as u8).collect();
        let record = encode_data_mark(5, &payload).unwrap();
        let mark = decode_data_mark(&record).unwrap();
        assert_eq!(mark.sector, 5);
        assert!(mark.checksum_ok());
        assert_eq!(mark.payload, payload);
    }

    #[test]
    fn data_mark_reports_invalid_nibbles() {
        let payload = vec![0u8; 524];
        let mut record = encode_data_mark(0, &payload).unwrap();
        // 0xD5 is not a data symbol.
        record[10] = 0xD5;
        match decode_data_mark(&record) {
            Err(GcrFault::InvalidNibbles(list)) => assert_eq!(list, vec![0xD5]),
            other => panic!("expected invalid nibble fault, got {:?}", other),
        }
    }
}
