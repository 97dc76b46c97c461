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

    src/protocol/mfm.rs

    The MFM (IBM System/34-style) record codec used by 720K/1.44M drives.
    Records on the wire arrive byte-aligned with their sync/clock prefix
    already collapsed to the familiar A1*3 / C2*3 signatures.
*/

use crate::{MfmGeometry, MFM_ADDRESS_MARK_LEN, MFM_DATA_MARK_LEN, MFM_SECTOR_LEN};

/// Index mark signature (C2 sync run + FC).
pub const INDEX_MARK: [u8; 4] = [0xC2, 0xC2, 0xC2, 0xFC];
/// Address mark signature (A1 sync run + FE).
pub const ADDRESS_MARK: [u8; 4] = [0xA1, 0xA1, 0xA1, 0xFE];
/// Data mark signature (A1 sync run + FB).
pub const DATA_MARK: [u8; 4] = [0xA1, 0xA1, 0xA1, 0xFB];

const CRC_INIT: u16 = 0xFFFF;
const CRC_POLY: u16 = 0x1021;

/// CCITT CRC-16 as the floppy controller computes it: MSB-first, initial
/// value 0xFFFF, no final XOR.
pub fn crc16(data: &[u8]) -> u16 {
    let mut crc = CRC_INIT;
    for byte in data {
        crc ^= (*byte as u16) << 8;
        for _ in 0..8 {
            if crc & 0x8000 != 0 {
                crc = (crc << 1) ^ CRC_POLY;
            }
            else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// A record's CRC field is the value that zeroes the running CRC, so a clean
/// record checks as 0 over its full length, signature included.
pub fn crc_ok(record: &[u8]) -> bool {
    crc16(record) == 0
}

/// Extract the geometry fields of an address mark record. Call only after
/// [crc_ok] has accepted the record.
pub fn decode_address_mark(record: &[u8]) -> MfmGeometry {
    debug_assert_eq!(record.len(), MFM_ADDRESS_MARK_LEN);
    MfmGeometry {
        track: record[4],
        side: record[5],
        sector: record[6],
        size_code: record[7],
    }
}

/// The sector payload of a data mark record, CRC excluded.
pub fn data_mark_payload(record: &[u8]) -> &[u8] {
    debug_assert_eq!(record.len(), MFM_DATA_MARK_LEN);
    &record[4..4 + MFM_SECTOR_LEN]
}

fn append_crc(record: &mut Vec<u8>) {
    let crc = crc16(record);
    record.extend_from_slice(&crc.to_be_bytes());
}

/// Build a complete address mark record for `geometry`, CRC appended.
pub fn encode_address_mark(geometry: MfmGeometry) -> Vec<u8> {
    let mut record = Vec::with_capacity(MFM_ADDRESS_MARK_LEN);
    record.extend_from_slice(&ADDRESS_MARK);
    record.push(geometry.track);
    record.push(geometry.side);
    record.push(geometry.sector);
    record.push(geometry.size_code);
    append_crc(&mut record);
    debug_assert_eq!(record.len(), MFM_ADDRESS_MARK_LEN);
    record
}

/// Build a complete data mark record for a 512-byte sector, CRC appended.
pub fn encode_data_mark(payload: &[u8]) -> Result<Vec<u8>, crate::AnalyzerError> {
    if payload.len() != MFM_SECTOR_LEN {
        log::error!("data mark payload must be {} bytes", MFM_SECTOR_LEN);
        return Err(crate::AnalyzerError::ParameterError);
    }
    let mut record = Vec::with_capacity(MFM_DATA_MARK_LEN);
    record.extend_from_slice(&DATA_MARK);
    record.extend_from_slice(payload);
    append_crc(&mut record);
    debug_assert_eq!(record.len(), MFM_DATA_MARK_LEN);
    Ok(record)
}
