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

//! fluxtap decodes raw byte captures taken off the physical bus between a
//! Macintosh-family disk controller (IWM/SWIM) and a floppy drive, or between
//! the host and a DCD companion chip, reconstructing the structured records
//! that crossed the bus - sector address marks, sector data, and inter-chip
//! link frames - together with their validity checksums.
//!
//! The crate is organized around three streaming protocol decoders that share
//! one architectural pattern: byte-at-a-time state machines that acquire
//! synchronization inside an untrusted stream, frame fixed- or computed-length
//! records, validate each record against an embedded checksum, and recover
//! from any framing failure by resynchronizing without losing the rest of the
//! stream.
//!
//! Hardware I/O is deliberately outside the crate: a capture session is driven
//! through the [ByteSource] seam, and artifacts leave through the
//! [CaptureSink] and [RecordSink] seams.

pub mod analyzer;
pub mod framer;
pub mod protocol;
pub mod sink;
pub mod source;
pub mod window;

use std::fmt::{self, Display, Formatter};

use thiserror::Error;

/// Length of a GCR address mark record: D5 AA 96, five nibbles, DE AA.
pub const GCR_ADDRESS_MARK_LEN: usize = 10;
/// Length of a GCR data mark record: D5 AA AD, sector nibble, 703 nibbles, DE AA.
pub const GCR_DATA_MARK_LEN: usize = 709;
/// Decoded GCR sector payload: 12 tag bytes followed by 512 data bytes.
pub const GCR_SECTOR_LEN: usize = 524;

/// Length of an MFM index mark: C2 C2 C2 FC.
pub const MFM_INDEX_MARK_LEN: usize = 4;
/// Length of an MFM address mark: A1 A1 A1 FE, track, side, sector, size, CRC16.
pub const MFM_ADDRESS_MARK_LEN: usize = 10;
/// Length of an MFM data mark: A1 A1 A1 FB, 512 data bytes, CRC16.
pub const MFM_DATA_MARK_LEN: usize = 518;
/// MFM sector payload size in bytes.
pub const MFM_SECTOR_LEN: usize = 512;

/// Number of payload bytes carried per DCD link group.
pub const DCD_GROUP_LEN: usize = 7;

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("An IO error occurred reading the byte source or writing an artifact: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid parameters were specified to a library function")]
    ParameterError,
}

/// The protocol a capture session was taken under. Determines transaction
/// framing and how directions and artifacts are labeled.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Protocol {
    /// Host <-> DCD companion chip link.
    Dcd,
    /// GCR floppy bus (400K/800K drives).
    Gcr,
    /// MFM floppy bus (1.44MB drives).
    Mfm,
}

impl Display for Protocol {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Protocol::Dcd => write!(f, "DCD"),
            Protocol::Gcr => write!(f, "GCR"),
            Protocol::Mfm => write!(f, "MFM"),
        }
    }
}

/// Transmission direction of a captured byte. The analyzer firmware reports
/// direction in the top bit of each byte for disk protocols; for the DCD link
/// the direction is implied by which link decoder completes a frame.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Direction {
    /// Host to device: controller writing to the drive, or Mac to DCD.
    Host,
    /// Device to host: data read off the drive, or DCD replying to the Mac.
    Device,
}

impl Direction {
    /// Interpret the direction bit carried in a captured byte's top bit.
    pub fn from_bit(bit: bool) -> Direction {
        match bit {
            false => Direction::Host,
            true => Direction::Device,
        }
    }
}

/// Where a framed byte came from: the transaction it belongs to, the
/// transmission direction, and its byte offset within the transaction's own
/// capture record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Provenance {
    pub transaction: u32,
    pub direction:   Direction,
    pub tell:        u64,
}

/// A single captured byte, tagged with its provenance by the transaction
/// framer.
#[derive(Copy, Clone, Debug)]
pub struct FramedByte {
    pub provenance: Provenance,
    pub byte:       u8,
}

/// Geometry decoded from a GCR address mark. Address marks write the current
/// geometry; subsequent data marks only read it.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct SectorGeometry {
    pub track:  u16,
    pub sector: u8,
    pub side:   u8,
    pub format: u8,
}

impl Display for SectorGeometry {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "tk {:03}  sec {:03}  side {}  fmt 0x{:02X}",
            self.track, self.sector, self.side, self.format
        )
    }
}

/// Geometry decoded from an MFM address mark.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MfmGeometry {
    pub track:     u8,
    pub side:      u8,
    pub sector:    u8,
    pub size_code: u8,
}

impl MfmGeometry {
    /// Sector size in bytes as declared by the address mark's size code.
    pub fn size_bytes(&self) -> usize {
        self.size_code as usize * 256
    }
}

impl Display for MfmGeometry {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(
            f,
            "tk {:03}  side {}  sec {:03}  size {:03}",
            self.track,
            self.side,
            self.sector,
            self.size_bytes()
        )
    }
}

pub use crate::{
    analyzer::{dcd::DcdAnalyzer, gcr::GcrAnalyzer, mfm::MfmAnalyzer, CancelToken},
    framer::{Framer, FramerMode, FramerStep},
    sink::{CaptureSink, DecodedRecord, DirCapture, DirSink, MemoryCapture, MemorySink, RecordSink},
    source::{ByteSource, SliceSource},
    window::LookaheadWindow,
};
