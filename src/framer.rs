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

    src/framer.rs

    The transaction framer groups the raw byte stream into bus transactions
    and tags every byte with (transaction, direction, tell) provenance. Every
    raw byte is persisted to the capture sink before interpretation,
    regardless of decode outcome.
*/

use std::time::Duration;

use crate::{
    analyzer::CancelToken,
    sink::CaptureSink,
    source::ByteSource,
    AnalyzerError,
    Direction,
    FramedByte,
    Provenance,
};

/// How transaction boundaries are detected.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FramerMode {
    /// A transaction starts on the first byte after an idle timeout and ends
    /// at the next idle timeout (DCD link).
    IdleGap,
    /// A transaction boundary occurs whenever the direction bit (bit 7) of
    /// the incoming byte differs from the previous byte's (GCR bus). Framed
    /// bytes have bit 7 restored, since the firmware repurposes it to report
    /// direction.
    DirectionBit,
    /// No transaction boundaries; the whole capture is one stream (MFM bus).
    Continuous,
}

/// One step of framer output.
#[derive(Debug)]
pub enum FramerStep {
    Byte(FramedByte),
    /// A transaction boundary: an idle gap (IdleGap mode) or a direction
    /// change (DirectionBit mode). Buffered lookahead should be drained
    /// before more bytes are requested.
    Pause,
    /// The source is exhausted or the session was cancelled.
    End,
}

pub struct Framer<'a> {
    mode:    FramerMode,
    source:  &'a mut dyn ByteSource,
    capture: &'a mut dyn CaptureSink,
    cancel:  CancelToken,
    poll:    Duration,

    transaction: u32,
    started: bool,
    mid_transaction: bool,
    last_direction: Option<Direction>,
    pending: Option<u8>,
    finished: bool,
}

impl<'a> Framer<'a> {
    pub fn new(
        mode: FramerMode,
        source: &'a mut dyn ByteSource,
        capture: &'a mut dyn CaptureSink,
        cancel: CancelToken,
        poll: Duration,
    ) -> Framer<'a> {
        Framer {
            mode,
            source,
            capture,
            cancel,
            poll,
            transaction: 0,
            started: false,
            mid_transaction: false,
            last_direction: None,
            pending: None,
            finished: false,
        }
    }

    /// The id of the transaction currently being framed.
    pub fn transaction(&self) -> u32 {
        self.transaction
    }

    /// Force the next byte to begin a new transaction. Used by the DCD
    /// session loop after a desynchronized transaction.
    pub fn force_transaction_break(&mut self) {
        self.mid_transaction = false;
    }

    pub fn flush(&mut self) -> Result<(), AnalyzerError> {
        self.capture.flush()
    }

    /// Produce the next framed byte or boundary event, polling the source
    /// through idle timeouts that do not delimit a transaction.
    pub fn step(&mut self) -> Result<FramerStep, AnalyzerError> {
        if self.finished {
            return Ok(FramerStep::End);
        }
        loop {
            if self.cancel.is_cancelled() {
                log::debug!("session cancelled, ending capture");
                self.finished = true;
                return Ok(FramerStep::End);
            }

            let byte = match self.pending.take() {
                Some(byte) => byte,
                None => match self.source.read_byte(self.poll)? {
                    Some(byte) => {
                        // Capture first, interpret later.
                        self.capture.serial_byte(byte)?;
                        byte
                    }
                    None => {
                        if self.source.exhausted() {
                            self.finished = true;
                            return Ok(FramerStep::End);
                        }
                        if self.mode == FramerMode::IdleGap && self.mid_transaction {
                            self.mid_transaction = false;
                            return Ok(FramerStep::Pause);
                        }
                        continue;
                    }
                },
            };

            match self.mode {
                FramerMode::IdleGap => {
                    if !self.mid_transaction {
                        self.mid_transaction = true;
                        self.begin(None)?;
                    }
                    return self.emit(byte, Direction::Host);
                }
                FramerMode::DirectionBit => {
                    let direction = Direction::from_bit(byte & 0x80 != 0);
                    if self.last_direction != Some(direction) {
                        let boundary = self.last_direction.is_some();
                        self.last_direction = Some(direction);
                        self.begin(Some(direction))?;
                        if boundary {
                            // Hold the byte over; the boundary is delivered
                            // first so buffered lookahead drains.
                            self.pending = Some(byte);
                            return Ok(FramerStep::Pause);
                        }
                    }
                    // On-disk bytes always have bit 7 set; the firmware
                    // borrowed it for the direction flag.
                    return self.emit(byte | 0x80, direction);
                }
                FramerMode::Continuous => {
                    if !self.started {
                        self.begin(None)?;
                    }
                    return self.emit(byte, Direction::Host);
                }
            }
        }
    }

    fn begin(&mut self, direction: Option<Direction>) -> Result<(), AnalyzerError> {
        if self.started {
            self.transaction += 1;
        }
        self.started = true;
        log::trace!("transaction {} begins ({:?})", self.transaction, direction);
        self.capture.begin_transaction(self.transaction, direction)
    }

    fn emit(&mut self, byte: u8, direction: Direction) -> Result<FramerStep, AnalyzerError> {
        let tell = self.capture.transaction_byte(byte)?;
        Ok(FramerStep::Byte(FramedByte {
            provenance: Provenance {
                transaction: self.transaction,
                direction,
                tell,
            },
            byte,
        }))
    }
}
