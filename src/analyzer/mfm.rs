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

    src/analyzer/mfm.rs

    MFM session loop. The capture is one continuous stream with no direction
    or transaction structure; index marks are logged as-is, address marks set
    the current geometry, and CRC-clean data marks are delivered against it.
*/

use std::time::Duration;

use crate::{
    analyzer::CancelToken,
    framer::{Framer, FramerMode},
    protocol::mfm,
    sink::{CaptureSink, DecodedRecord, RecordSink},
    source::ByteSource,
    window::LookaheadWindow,
    AnalyzerError,
    MfmGeometry,
    MFM_ADDRESS_MARK_LEN,
    MFM_DATA_MARK_LEN,
    MFM_INDEX_MARK_LEN,
};

pub struct MfmAnalyzer<'a> {
    window:   LookaheadWindow<'a>,
    sink:     &'a mut dyn RecordSink,
    geometry: MfmGeometry,
}

impl<'a> MfmAnalyzer<'a> {
    pub fn new(
        source: &'a mut dyn ByteSource,
        capture: &'a mut dyn CaptureSink,
        sink: &'a mut dyn RecordSink,
        cancel: CancelToken,
        poll: Duration,
    ) -> MfmAnalyzer<'a> {
        let framer = Framer::new(FramerMode::Continuous, source, capture, cancel, poll);
        MfmAnalyzer {
            window: LookaheadWindow::new(framer),
            sink,
            geometry: MfmGeometry::default(),
        }
    }

    pub fn run(&mut self) -> Result<(), AnalyzerError> {
        loop {
            let (_, sig) = self.window.peek(4)?;
            if sig.is_empty() && self.window.source_finished() {
                break;
            }
            if sig == mfm::INDEX_MARK {
                let (provenance, _) = self.window.peek(MFM_INDEX_MARK_LEN)?;
                self.window.pop(MFM_INDEX_MARK_LEN);
                self.sink.event(provenance.as_ref(), "IM")?;
            }
            else if sig == mfm::ADDRESS_MARK {
                self.address_mark()?;
            }
            else if sig == mfm::DATA_MARK {
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
        let (provenance, data) = self.window.peek(MFM_ADDRESS_MARK_LEN)?;
        let provenance = provenance.as_ref();
        if data.len() != MFM_ADDRESS_MARK_LEN {
            self.sink.event(
                provenance,
                &format!(
                    "AM  TRUNCATED (length {}, should be {})",
                    data.len(),
                    MFM_ADDRESS_MARK_LEN
                ),
            )?;
            self.window.pop(1);
            return Ok(());
        }
        if !mfm::crc_ok(&data) {
            self.sink.event(provenance, "AM  BAD CRC")?;
            self.window.pop(1);
            return Ok(());
        }
        let geometry = mfm::decode_address_mark(&data);
        self.sink.event(provenance, &format!("AM  {}", geometry))?;
        self.geometry = geometry;
        self.window.pop(MFM_ADDRESS_MARK_LEN);
        Ok(())
    }

    fn data_mark(&mut self) -> Result<(), AnalyzerError> {
        let (provenance, data) = self.window.peek(MFM_DATA_MARK_LEN)?;
        if data.len() != MFM_DATA_MARK_LEN {
            self.sink.event(
                provenance.as_ref(),
                &format!(
                    "DM  TRUNCATED (length {}, should be {})",
                    data.len(),
                    MFM_DATA_MARK_LEN
                ),
            )?;
            self.window.pop(1);
            return Ok(());
        }
        if !mfm::crc_ok(&data) {
            self.sink.event(provenance.as_ref(), "DM  BAD CRC")?;
            self.window.pop(1);
            return Ok(());
        }
        self.window.pop(MFM_DATA_MARK_LEN);
        if let Some(provenance) = provenance {
            self.sink.record(
                &provenance,
                DecodedRecord::MfmSector {
                    geometry: self.geometry,
                    data:     mfm::data_mark_payload(&data),
                },
            )?;
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
        let mut analyzer = MfmAnalyzer::new(
            &mut source,
            &mut capture,
            sink,
            CancelToken::new(),
            DEFAULT_POLL_TIMEOUT,
        );
        analyzer.run().unwrap();
    }

    #[test]
    fn corrupt_crc_resyncs_by_one_byte() {
        let geometry = MfmGeometry {
            track: 1,
            side: 0,
            sector: 9,
            size_code: 2,
        };
        let mut stream = mfm::encode_address_mark(geometry);
        stream[4] ^= 0x10;

        let mut sink = MemorySink::new(Protocol::Mfm);
        run_capture(stream, &mut sink);

        assert_eq!(sink.count_events("AM  BAD CRC"), 1);
        assert!(sink.records.is_empty());
    }

    #[test]
    fn data_mark_before_address_mark_uses_default_geometry() {
        let payload = vec![0x5Au8; crate::MFM_SECTOR_LEN];
        let stream = mfm::encode_data_mark(&payload).unwrap();

        let mut sink = MemorySink::new(Protocol::Mfm);
        run_capture(stream, &mut sink);

        assert_eq!(sink.records.len(), 1);
        assert_eq!(sink.records[0].kind, RecordKind::MfmSector(MfmGeometry::default()));
    }
}
