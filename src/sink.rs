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

    src/sink.rs

    Artifact seams for a capture session: the CaptureSink receives every raw
    byte exactly once, segmented per transaction; the RecordSink receives
    decoded records and the human-readable event log. Memory-backed
    implementations support tests, directory-backed implementations write the
    artifact set the analyzer hardware's host tooling expects.
*/

use std::{
    fs::File,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};

use crate::{AnalyzerError, Direction, MfmGeometry, Protocol, Provenance, SectorGeometry};

/// Append-only sink for the raw capture. Every byte read from the source is
/// pushed through `serial_byte` before interpretation, then through
/// `transaction_byte` once the framer has assigned it to a transaction. A
/// byte held back at a transaction boundary reaches the serial record
/// immediately but its transaction record only when re-emitted.
pub trait CaptureSink {
    /// Begin a new transaction record. `direction` is set for protocols that
    /// segment per direction (GCR) and `None` otherwise.
    fn begin_transaction(&mut self, transaction: u32, direction: Option<Direction>)
        -> Result<(), AnalyzerError>;

    /// Append one byte, exactly as it arrived off the wire, to the raw serial
    /// record.
    fn serial_byte(&mut self, byte: u8) -> Result<(), AnalyzerError>;

    /// Append one framed byte to the current transaction record, returning the
    /// offset ("tell") at which it was written. Called exactly once per byte,
    /// after `serial_byte`.
    fn transaction_byte(&mut self, byte: u8) -> Result<u64, AnalyzerError>;

    fn flush(&mut self) -> Result<(), AnalyzerError> {
        Ok(())
    }
}

/// A fully decoded, accepted record on its way to persistence.
#[derive(Clone, Debug)]
pub enum DecodedRecord<'a> {
    GcrSector {
        geometry: SectorGeometry,
        data:     &'a [u8],
    },
    MfmSector {
        geometry: MfmGeometry,
        data:     &'a [u8],
    },
    LinkFrame {
        direction: Direction,
        data:      &'a [u8],
    },
}

impl DecodedRecord<'_> {
    fn data(&self) -> &[u8] {
        match self {
            DecodedRecord::GcrSector { data, .. } => data,
            DecodedRecord::MfmSector { data, .. } => data,
            DecodedRecord::LinkFrame { data, .. } => data,
        }
    }

    fn direction(&self, provenance: &Provenance) -> Direction {
        match self {
            DecodedRecord::LinkFrame { direction, .. } => *direction,
            _ => provenance.direction,
        }
    }
}

/// Receives decode events and accepted records.
///
/// Events are one human-readable line each: synchronization losses,
/// truncations, checksum failures, invalid-nibble lists, and accepted records
/// with their geometry. Records are persisted as individually addressable
/// artifacts keyed by an increasing sequence number.
pub trait RecordSink {
    /// Log one event line, optionally tagged with record provenance.
    fn event(&mut self, provenance: Option<&Provenance>, msg: &str) -> Result<(), AnalyzerError>;

    /// Persist an accepted record and log its sequence line.
    fn record(&mut self, provenance: &Provenance, record: DecodedRecord)
        -> Result<(), AnalyzerError>;

    fn flush(&mut self) -> Result<(), AnalyzerError> {
        Ok(())
    }
}

fn dir_label(protocol: Protocol, direction: Direction) -> &'static str {
    match (protocol, direction) {
        (Protocol::Dcd, Direction::Host) => "Mac",
        (Protocol::Dcd, Direction::Device) => "DCD",
        (_, Direction::Host) => "wr",
        (_, Direction::Device) => "rd",
    }
}

/// Suffix used to segment per-direction artifact files, or None for protocols
/// that do not distinguish direction in filenames.
fn dir_tag(protocol: Protocol, direction: Direction) -> Option<&'static str> {
    match (protocol, direction) {
        (Protocol::Dcd, Direction::Host) => Some("mac"),
        (Protocol::Dcd, Direction::Device) => Some("dcd"),
        (Protocol::Gcr, Direction::Host) => Some("wr"),
        (Protocol::Gcr, Direction::Device) => Some("rd"),
        (Protocol::Mfm, _) => None,
    }
}

/// Format an event line the way the analyzer log expects it: MFM captures are
/// one continuous stream so only the tell is shown; DCD and GCR lines carry
/// the transaction number and direction label as well.
fn format_line(protocol: Protocol, provenance: Option<&Provenance>, msg: &str) -> String {
    match provenance {
        Some(p) if protocol == Protocol::Mfm => format!("{:08}: {}", p.tell, msg),
        Some(p) => format!(
            "{:08} {} {:08}: {}",
            p.transaction,
            dir_label(protocol, p.direction),
            p.tell,
            msg
        ),
        None => msg.to_string(),
    }
}

fn sequence_line(record: &DecodedRecord, seq: u32) -> String {
    match record {
        DecodedRecord::GcrSector { .. } | DecodedRecord::MfmSector { .. } => {
            format!("DM  {:08}", seq)
        }
        DecodedRecord::LinkFrame { data, .. } => {
            let preview: Vec<String> = data.iter().take(7).map(|b| format!("{:02X}", b)).collect();
            format!("Data  {:08}: {}", seq, preview.join(" "))
        }
    }
}

/// In-memory [CaptureSink], for tests and programmatic use.
#[derive(Debug, Default)]
pub struct MemoryCapture {
    pub serial: Vec<u8>,
    pub transactions: Vec<TransactionRecord>,
}

#[derive(Debug)]
pub struct TransactionRecord {
    pub transaction: u32,
    pub direction:   Option<Direction>,
    pub data:        Vec<u8>,
}

impl MemoryCapture {
    pub fn new() -> MemoryCapture {
        MemoryCapture::default()
    }
}

impl CaptureSink for MemoryCapture {
    fn begin_transaction(
        &mut self,
        transaction: u32,
        direction: Option<Direction>,
    ) -> Result<(), AnalyzerError> {
        self.transactions.push(TransactionRecord {
            transaction,
            direction,
            data: Vec::new(),
        });
        Ok(())
    }

    fn serial_byte(&mut self, byte: u8) -> Result<(), AnalyzerError> {
        self.serial.push(byte);
        Ok(())
    }

    fn transaction_byte(&mut self, byte: u8) -> Result<u64, AnalyzerError> {
        let record = self.transactions.last_mut().ok_or(AnalyzerError::ParameterError)?;
        let tell = record.data.len() as u64;
        record.data.push(byte);
        Ok(tell)
    }
}

/// Owned copy of an accepted record, as retained by [MemorySink].
#[derive(Clone, Debug)]
pub struct StoredRecord {
    pub provenance: Provenance,
    pub seq:        u32,
    pub kind:       RecordKind,
    pub data:       Vec<u8>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum RecordKind {
    GcrSector(SectorGeometry),
    MfmSector(MfmGeometry),
    LinkFrame(Direction),
}

/// In-memory [RecordSink] retaining formatted event lines and accepted
/// records, for tests and programmatic use.
#[derive(Debug)]
pub struct MemorySink {
    protocol: Protocol,
    seq: u32,
    pub events:  Vec<String>,
    pub records: Vec<StoredRecord>,
}

impl MemorySink {
    pub fn new(protocol: Protocol) -> MemorySink {
        MemorySink {
            protocol,
            seq: 0,
            events: Vec::new(),
            records: Vec::new(),
        }
    }

    /// Count event lines containing `needle`.
    pub fn count_events(&self, needle: &str) -> usize {
        self.events.iter().filter(|line| line.contains(needle)).count()
    }
}

impl RecordSink for MemorySink {
    fn event(&mut self, provenance: Option<&Provenance>, msg: &str) -> Result<(), AnalyzerError> {
        let line = format_line(self.protocol, provenance, msg);
        log::debug!("{}", line);
        self.events.push(line);
        Ok(())
    }

    fn record(&mut self, provenance: &Provenance, record: DecodedRecord)
        -> Result<(), AnalyzerError> {
        let seq = self.seq;
        self.seq += 1;

        let direction = record.direction(provenance);
        let line_provenance = Provenance { direction, ..*provenance };
        self.event(Some(&line_provenance), &sequence_line(&record, seq))?;

        let kind = match &record {
            DecodedRecord::GcrSector { geometry, .. } => RecordKind::GcrSector(*geometry),
            DecodedRecord::MfmSector { geometry, .. } => RecordKind::MfmSector(*geometry),
            DecodedRecord::LinkFrame { direction, .. } => RecordKind::LinkFrame(*direction),
        };
        self.records.push(StoredRecord {
            provenance: line_provenance,
            seq,
            kind,
            data: record.data().to_vec(),
        });
        Ok(())
    }
}

/// [CaptureSink] writing the capture artifact set into a
/// directory: `<prefix>_serial.bin` for the raw stream and
/// `<prefix>_trans_NNNNNNNN[_rd|_wr].bin` per transaction.
pub struct DirCapture {
    protocol:  Protocol,
    prefix:    PathBuf,
    serial:    BufWriter<File>,
    serial_len: u64,
    trans:     Option<BufWriter<File>>,
    trans_len: u64,
}

impl DirCapture {
    pub fn create(protocol: Protocol, prefix: impl AsRef<Path>) -> Result<DirCapture, AnalyzerError> {
        let prefix = prefix.as_ref().to_path_buf();
        let serial = BufWriter::new(File::create(artifact_path(&prefix, "_serial.bin"))?);
        Ok(DirCapture {
            protocol,
            prefix,
            serial,
            serial_len: 0,
            trans: None,
            trans_len: 0,
        })
    }
}

fn artifact_path(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

impl CaptureSink for DirCapture {
    fn begin_transaction(
        &mut self,
        transaction: u32,
        direction: Option<Direction>,
    ) -> Result<(), AnalyzerError> {
        // The MFM capture is one continuous stream; the serial record is the
        // transaction record.
        if self.protocol == Protocol::Mfm {
            return Ok(());
        }
        if let Some(mut old) = self.trans.take() {
            old.flush()?;
        }
        let suffix = match direction.and_then(|d| dir_tag(self.protocol, d)) {
            Some(tag) => format!("_trans_{:08}_{}.bin", transaction, tag),
            None => format!("_trans_{:08}.bin", transaction),
        };
        log::trace!("opening transaction record {}", suffix);
        self.trans = Some(BufWriter::new(File::create(artifact_path(&self.prefix, &suffix))?));
        self.trans_len = 0;
        Ok(())
    }

    fn serial_byte(&mut self, byte: u8) -> Result<(), AnalyzerError> {
        self.serial.write_all(&[byte])?;
        self.serial_len += 1;
        Ok(())
    }

    fn transaction_byte(&mut self, byte: u8) -> Result<u64, AnalyzerError> {
        if self.protocol == Protocol::Mfm {
            // serial_byte has already run for this byte.
            return Ok(self.serial_len - 1);
        }
        let trans = self.trans.as_mut().ok_or(AnalyzerError::ParameterError)?;
        let tell = self.trans_len;
        trans.write_all(&[byte])?;
        self.trans_len += 1;
        Ok(tell)
    }

    fn flush(&mut self) -> Result<(), AnalyzerError> {
        self.serial.flush()?;
        if let Some(trans) = self.trans.as_mut() {
            trans.flush()?;
        }
        Ok(())
    }
}

/// [RecordSink] writing `<prefix>.log` (one timestamped line per event) and
/// one `<prefix>_data_NNNNNNNN[_tag].bin` file per accepted record.
pub struct DirSink {
    protocol: Protocol,
    prefix:   PathBuf,
    log:      BufWriter<File>,
    seq:      u32,
    echo:     bool,
}

impl DirSink {
    pub fn create(protocol: Protocol, prefix: impl AsRef<Path>) -> Result<DirSink, AnalyzerError> {
        let prefix = prefix.as_ref().to_path_buf();
        let log = BufWriter::new(File::create(artifact_path(&prefix, ".log"))?);
        Ok(DirSink {
            protocol,
            prefix,
            log,
            seq: 0,
            echo: true,
        })
    }

    /// Suppress echoing event lines to stdout.
    pub fn quiet(mut self) -> DirSink {
        self.echo = false;
        self
    }

    fn write_line(&mut self, line: &str) -> Result<(), AnalyzerError> {
        let stamped = format!("({}) {}", chrono::Local::now().format("%H:%M:%S"), line);
        writeln!(self.log, "{}", stamped)?;
        if self.echo {
            println!("{}", stamped);
        }
        Ok(())
    }
}

impl RecordSink for DirSink {
    fn event(&mut self, provenance: Option<&Provenance>, msg: &str) -> Result<(), AnalyzerError> {
        let line = format_line(self.protocol, provenance, msg);
        self.write_line(&line)
    }

    fn record(&mut self, provenance: &Provenance, record: DecodedRecord)
        -> Result<(), AnalyzerError> {
        let seq = self.seq;
        self.seq += 1;

        let direction = record.direction(provenance);
        let line_provenance = Provenance { direction, ..*provenance };
        self.event(Some(&line_provenance), &sequence_line(&record, seq))?;

        let suffix = match dir_tag(self.protocol, direction) {
            Some(tag) => format!("_data_{:08}_{}.bin", seq, tag),
            None => format!("_data_{:08}.bin", seq),
        };
        let mut file = File::create(artifact_path(&self.prefix, &suffix))?;
        file.write_all(record.data())?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), AnalyzerError> {
        self.log.flush()?;
        Ok(())
    }
}
