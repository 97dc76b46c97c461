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

    src/source.rs

    The ByteSource seam. Live analyzer hardware sits behind this trait; the
    crate itself only ships SliceSource, which replays a capture from memory.
*/

use std::{collections::VecDeque, time::Duration};

use crate::AnalyzerError;

/// Default read timeout used by the session loops to distinguish "more data
/// pending" from "bus idle". Matches the analyzer firmware's serial timeout.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(250);

/// A source of captured bus bytes.
///
/// `read_byte` must return within roughly `timeout`: `Ok(Some(byte))` if a
/// byte arrived, `Ok(None)` if the timeout elapsed with the bus idle. A
/// timeout firing repeatedly with no byte is not an error, only an idle
/// signal - the DCD framer uses it to delimit transactions.
pub trait ByteSource {
    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>, AnalyzerError>;

    /// True once the source can never produce another byte. Live hardware
    /// sources never report exhaustion; replayed captures do.
    fn exhausted(&self) -> bool {
        false
    }
}

/// Replays an in-memory capture as a [ByteSource], optionally simulating idle
/// timeouts at chosen byte offsets so that transaction framing can be
/// exercised without hardware.
pub struct SliceSource {
    data: Vec<u8>,
    pos:  usize,
    idle: VecDeque<usize>,
}

impl SliceSource {
    pub fn new(data: impl Into<Vec<u8>>) -> SliceSource {
        SliceSource {
            data: data.into(),
            pos:  0,
            idle: VecDeque::new(),
        }
    }

    /// `gaps` lists byte offsets before which a single idle timeout fires.
    /// Offsets must be in ascending order; an offset equal to the capture
    /// length fires after the final byte.
    pub fn with_idle_gaps(data: impl Into<Vec<u8>>, gaps: &[usize]) -> SliceSource {
        SliceSource {
            data: data.into(),
            pos:  0,
            idle: gaps.iter().copied().collect(),
        }
    }
}

impl ByteSource for SliceSource {
    fn read_byte(&mut self, _timeout: Duration) -> Result<Option<u8>, AnalyzerError> {
        if let Some(&gap) = self.idle.front() {
            if gap <= self.pos {
                self.idle.pop_front();
                return Ok(None);
            }
        }
        match self.data.get(self.pos) {
            Some(&byte) => {
                self.pos += 1;
                Ok(Some(byte))
            }
            None => Ok(None),
        }
    }

    fn exhausted(&self) -> bool {
        self.pos >= self.data.len() && self.idle.is_empty()
    }
}
