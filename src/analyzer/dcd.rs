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

    src/analyzer/dcd.rs

    DCD session loop. Both direction decoders are fed every byte in lockstep:
    only one of them can make sense of a given burst, and a completed host
    frame seeds the device decoder with the expected reply length. An idle
    gap ends the transaction; both decoders giving up mid-burst marks it
    desynchronized and forces a fresh transaction on the next byte.
*/

use std::time::Duration;

use crate::{
    analyzer::CancelToken,
    framer::{Framer, FramerMode, FramerStep},
    protocol::dcd::{DcdToMac, FeedOutcome, MacToDcd},
    sink::{CaptureSink, DecodedRecord, RecordSink},
    source::ByteSource,
    AnalyzerError,
    Direction,
    Provenance,
};

pub struct DcdAnalyzer<'a> {
    framer: Framer<'a>,
    sink:   &'a mut dyn RecordSink,
}

impl<'a> DcdAnalyzer<'a> {
    pub fn new(
        source: &'a mut dyn ByteSource,
        capture: &'a mut dyn CaptureSink,
        sink: &'a mut dyn RecordSink,
        cancel: CancelToken,
        poll: Duration,
    ) -> DcdAnalyzer<'a> {
        DcdAnalyzer {
            framer: Framer::new(FramerMode::IdleGap, source, capture, cancel, poll),
            sink,
        }
    }

    pub fn run(&mut self) -> Result<(), AnalyzerError> {
        let mut host = MacToDcd::new();
        let mut device = DcdToMac::new();
        let mut host_origin: Option<Provenance> = None;
        let mut device_origin: Option<Provenance> = None;

        loop {
            let fb = match self.framer.step()? {
                FramerStep::End => break,
                FramerStep::Pause => {
                    host.reset();
                    device.reset(0);
                    self.sink
                        .event(None, &format!("{:08} end of transaction", self.framer.transaction()))?;
                    continue;
                }
                FramerStep::Byte(fb) => fb,
            };

            let host_step = host.feed(fb.byte);
            let device_step = device.feed(fb.byte);
            if host_step.synced {
                host_origin = Some(fb.provenance);
            }
            if device_step.synced {
                device_origin = Some(fb.provenance);
            }

            if host_step.outcome == (FeedOutcome::Complete { valid: true }) {
                let (in_groups, data) = host.result();
                let origin = host_origin.unwrap_or(fb.provenance);
                self.sink.record(
                    &origin,
                    DecodedRecord::LinkFrame {
                        direction: Direction::Host,
                        data,
                    },
                )?;
                host.reset();
                device.reset(in_groups);
                continue;
            }
            if device_step.outcome == (FeedOutcome::Complete { valid: true }) {
                let (in_groups, data) = device.result();
                let origin = device_origin.unwrap_or(fb.provenance);
                self.sink.record(
                    &origin,
                    DecodedRecord::LinkFrame {
                        direction: Direction::Device,
                        data,
                    },
                )?;
                let data_len = data.len();
                log::trace!("device frame of {} bytes complete, re-arming", data_len);
                host.reset();
                device.reset(in_groups);
                continue;
            }

            if host_step.outcome == (FeedOutcome::Complete { valid: false }) {
                self.sink.event(host_origin.as_ref(), "Data  BAD CHECKSUM")?;
            }
            if device_step.outcome == (FeedOutcome::Complete { valid: false }) {
                let origin = device_origin.map(|p| Provenance {
                    direction: Direction::Device,
                    ..p
                });
                self.sink.event(origin.as_ref(), "Data  BAD CHECKSUM")?;
            }

            if host_step.outcome != FeedOutcome::Hopeful && device_step.outcome != FeedOutcome::Hopeful {
                host.reset();
                device.reset(0);
                self.sink.event(
                    None,
                    &format!("{:08} DESYNCHRONIZED TRANSACTION", self.framer.transaction()),
                )?;
                self.framer.force_transaction_break();
            }
        }
        self.framer.flush()?;
        self.sink.flush()
    }
}
