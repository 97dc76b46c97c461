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

    src/analyzer/gcr.rs

    GCR session loop: scans the framed stream for address and data mark
    signatures, resynchronizing one byte at a time on any decode failure.
    Address marks set the current geometry; data marks are checked against it.
*/

use std::time::Duration;

use crate::{
    analyzer::CancelToken,
    framer::{Framer, FramerMode},
    protocol::gcr::{self, GcrFault},
    sink::{CaptureSink, DecodedRecord, RecordSink},
    source::ByteSource,
    window::LookaheadWindow,
    AnalyzerError,
    Provenance,
    SectorGeometry,
    GCR_ADDRESS_MARK_LEN,
    GCR_DATA_MARK_LEN,
};

fn fault_text(fault: &GcrFault) -> String {
    match fault {
        GcrFault::MissingBitSlip => "MISSING BIT SLIP BYTES".to_string(),
        GcrFault::InvalidNibbles(bytes) => {
            let list: Vec<String> = bytes.iter().map(|b| format!("0x{:02X}", b)).collect();
            format!("INVALID NIBBLE(S) {}", list.join(", "))
        }
        GcrFault::InvalidSectorNibble(byte) => format!("INVALID SECTOR NIBBLE 0x{:02X}", byte),
        GcrFault::BadAddressChecksum { stored, computed } => {
            format!("BAD CHECKSUM, 0x{:02X} != 0x{:02X}", stored, computed)
        }
        GcrFault::Denibblize(e) => format!("DENIBBLIZE ERROR: {}", e),
    }
}

pub struct GcrAnalyzer<'a> {
    window: LookaheadWindow<'a>,
    sink:   &'a mut dyn RecordSink,
    geometry: Option<SectorGeometry>,
}

impl<'a> GcrAnalyzer<'a> {
    pub fn new(
        source: &'a mut dyn ByteSource,
        capture: &'a mut dyn CaptureSink,
        sink: &'a mut dyn RecordSink,
        cancel: CancelToken,
        poll: Duration,
    ) -> GcrAnalyzer<'a> {
        let framer = Framer::new(FramerMode::DirectionBit, source, capture, cancel, poll);
        GcrAnalyzer {
            window: LookaheadWindow::new(framer),
            sink,
            geometry: None,
        }
    }

    /// Run the session until the source is exhausted or the session is
    /// cancelled, then flush all sinks.
    pub fn run(&mut self) -> Result<(), AnalyzerError> {
        loop {
            let (_, sig) = self.window.peek(3)?;
            if sig.is_empty() && self.window.source_finished() {
                break;
            }
            if sig == gcr::ADDRESS_PROLOG {
                self.address_mark()?;
            }
            else if sig == gcr::DATA_PROLOG {
                self.data_mark()?;
            }
            else {
                self.window.pop(1);
            }
        }
        self.window.flush()?;
        self.sink.flush()
    }

    fn address_mark(&mut self) -> Result<(), AnalyzerError> {
        let (provenance, data) = self.window.peek(GCR_ADDRESS_MARK_LEN)?;
        let provenance = provenance.as_ref();
        if data.len() != GCR_ADDRESS_MARK_LEN {
            self.sink.event(
                provenance,
                &format!(
                    "AM  TRUNCATED (length {}, should be {})",
                    data.len(),
                    GCR_ADDRESS_MARK_LEN
                ),
            )?;
            self.window.pop(1);
            return Ok(());
        }
        match gcr::decode_address_mark(&data) {
            Ok(geometry) => {
                self.sink.event(provenance, &format!("AM  {}", geometry))?;
                self.geometry = Some(geometry);
                self.window.pop(GCR_ADDRESS_MARK_LEN);
            }
            Err(fault) => {
                self.sink.event(provenance, &format!("AM  {}", fault_text(&fault)))?;
                self.window.pop(1);
            }
        }
        Ok(())
    }

    fn data_mark(&mut self) -> Result<(), AnalyzerError> {
        let (provenance, data) = self.window.peek(GCR_DATA_MARK_LEN)?;
        let provenance = provenance.unwrap_or(Provenance {
            transaction: 0,
            direction:   crate::Direction::Host,
            tell:        0,
        });
        if data.len() != GCR_DATA_MARK_LEN {
            self.sink.event(
                Some(&provenance),
                &format!(
                    "DM  TRUNCATED (length {}, should be {})",
                    data.len(),
                    GCR_DATA_MARK_LEN
                ),
            )?;
            self.window.pop(1);
            return Ok(());
        }
        match gcr::decode_data_mark(&data) {
            Err(fault @ GcrFault::Denibblize(_)) => {
                // The candidate was structurally sound enough to consume
                // whole before the payload failed.
                self.window.pop(GCR_DATA_MARK_LEN);
                self.sink.event(Some(&provenance), &format!("DM  {}", fault_text(&fault)))?;
            }
            Err(fault) => {
                self.sink.event(Some(&provenance), &format!("DM  {}", fault_text(&fault)))?;
                self.window.pop(1);
            }
            Ok(mark) => {
                self.window.pop(GCR_DATA_MARK_LEN);
                let geometry = match self.geometry {
                    Some(g) if g.sector == mark.sector => g,
                    Some(g) => {
                        self.sink.event(
                            Some(&provenance),
                            &format!("DM  WRONG SECTOR: {}, should be {}", mark.sector, g.sector),
                        )?;
                        return Ok(());
                    }
                    None => {
                        self.sink.event(
                            Some(&provenance),
                            &format!("DM  WRONG SECTOR: {}, no address mark seen", mark.sector),
                        )?;
                        return Ok(());
                    }
                };
                if !mark.checksum_ok() {
                    let [aa, ab, ac] = mark.actual_checksum;
                    let [ta, tb, tc] = mark.target_checksum;
                    self.sink.event(
                        Some(&provenance),
                        &format!(
                            "DM  BAD CHECKSUM: ({}, {}, {}), should be ({}, {}, {})",
                            aa, ab, ac, ta, tb, tc
                        ),
                    )?;
                    return Ok(());
                }
                self.sink.record(
                    &provenance,
                    DecodedRecord::GcrSector {
                        geometry,
                        data: &mark.payload,
                    },
                )?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        sink::{MemoryCapture, MemorySink, RecordKind},
        source::{SliceSource, DEFAULT_POLL_TIMEOUT},
        Protocol,
    };

    fn run_capture(stream: Vec<u8>, sink: &mut MemorySink) {
        let mut source = SliceSource::new(stream);
        let mut capture = MemoryCapture::new();
        let mut analyzer = GcrAnalyzer::new(
            &mut source,
            &mut capture,
            sink,
            CancelToken::new(),
            DEFAULT_POLL_TIMEOUT,
        );
        analyzer.run().unwrap();
    }

    #[test]
    fn address_then_data_mark_is_accepted() {
        let geometry = SectorGeometry {
            track: 12,
            sector: 4,
            side: 0,
            format: 0x22,
        };
        let payload: Vec<u8> = (0..524u16).map(|i| (i * 11) as u8).collect();

        let mut stream = gcr::encode_address_mark(geometry).to_vec();
        stream.extend(gcr::encode_data_mark(4, &payload).unwrap());

        let mut sink = MemorySink::new(Protocol::Gcr);
        run_capture(stream, &mut sink);

        assert_eq!(sink.count_events("AM  tk 012  sec 004  side 0  fmt 0x22"), 1);
        assert_eq!(sink.records.len(), 1);
        assert_eq!(sink.records[0].kind, RecordKind::GcrSector(geometry));
        assert_eq!(sink.records[0].data, payload);
    }

    #[test]
    fn data_mark_for_other_sector_is_rejected() {
        let geometry = SectorGeometry {
            track: 1,
            sector: 2,
            side: 0,
            format: 0x22,
        };
        let mut stream = gcr::encode_address_mark(geometry).to_vec();
        stream.extend(gcr::encode_data_mark(3, &vec![0u8; 524]).unwrap());

        let mut sink = MemorySink::new(Protocol::Gcr);
        run_capture(stream, &mut sink);

        assert_eq!(sink.count_events("DM  WRONG SECTOR: 3, should be 2"), 1);
        assert!(sink.records.is_empty());
    }

    #[test]
    fn truncated_address_mark_resyncs_by_one_byte() {
        let geometry = SectorGeometry {
            track: 0,
            sector: 0,
            side: 0,
            format: 0x22,
        };
        // Cut the mark short; the stream ends mid-record.
        let stream = gcr::encode_address_mark(geometry)[..6].to_vec();

        let mut sink = MemorySink::new(Protocol::Gcr);
        run_capture(stream, &mut sink);

        assert_eq!(sink.count_events("AM  TRUNCATED (length 6, should be 10)"), 1);
    }
}
