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

    src/window.rs

    The lookahead window buffers framed bytes so marker-signature search can
    peek ahead without consuming, and can roll forward one byte at a time on
    a mismatch without re-fetching already-seen bytes.
*/

use std::collections::VecDeque;

use crate::{
    framer::{Framer, FramerStep},
    AnalyzerError,
    FramedByte,
    Provenance,
};

pub struct LookaheadWindow<'a> {
    framer: Framer<'a>,
    buf: VecDeque<FramedByte>,
    /// Set when the framer could not supply a requested byte (boundary or end
    /// of stream). While latched, peeks serve only buffered bytes; the latch
    /// clears when the window drains, so input can resume.
    end_latch: bool,
    finished:  bool,
}

impl<'a> LookaheadWindow<'a> {
    pub fn new(framer: Framer<'a>) -> LookaheadWindow<'a> {
        LookaheadWindow {
            framer,
            buf: VecDeque::new(),
            end_latch: false,
            finished: false,
        }
    }

    /// True once the framer has reported the end of the capture. Buffered
    /// bytes may still remain to be peeked and popped.
    pub fn source_finished(&self) -> bool {
        self.finished
    }

    pub fn flush(&mut self) -> Result<(), AnalyzerError> {
        self.framer.flush()
    }

    /// Return the provenance of the oldest buffered byte and up to `n` bytes
    /// of lookahead, pulling from the framer as needed. A short result means
    /// the framer hit a boundary or the end of the stream; the window will
    /// not pull again until drained.
    pub fn peek(&mut self, n: usize) -> Result<(Option<Provenance>, Vec<u8>), AnalyzerError> {
        while !self.end_latch && self.buf.len() < n {
            match self.framer.step()? {
                FramerStep::Byte(fb) => self.buf.push_back(fb),
                FramerStep::Pause => {
                    self.end_latch = true;
                }
                FramerStep::End => {
                    self.end_latch = true;
                    self.finished = true;
                }
            }
        }
        let provenance = self.buf.front().map(|fb| fb.provenance);
        let bytes = self.buf.iter().take(n).map(|fb| fb.byte).collect();
        Ok((provenance, bytes))
    }

    /// Discard up to `n` bytes from the front of the window. Emptying the
    /// window clears the end-of-stream latch.
    pub fn pop(&mut self, n: usize) {
        for _ in 0..n {
            if self.buf.pop_front().is_none() {
                break;
            }
        }
        if self.buf.is_empty() {
            self.end_latch = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analyzer::CancelToken,
        framer::FramerMode,
        sink::MemoryCapture,
        source::{SliceSource, DEFAULT_POLL_TIMEOUT},
    };

    #[test]
    fn peek_is_stable_and_pop_advances() {
        let mut source = SliceSource::new(vec![1, 2, 3, 4, 5]);
        let mut capture = MemoryCapture::new();
        let framer = Framer::new(
            FramerMode::Continuous,
            &mut source,
            &mut capture,
            CancelToken::new(),
            DEFAULT_POLL_TIMEOUT,
        );
        let mut window = LookaheadWindow::new(framer);

        let (p, bytes) = window.peek(3).unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);
        assert_eq!(p.unwrap().tell, 0);

        // Peeking again returns the same bytes without consuming.
        let (_, bytes) = window.peek(3).unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);

        window.pop(1);
        let (p, bytes) = window.peek(3).unwrap();
        assert_eq!(bytes, vec![2, 3, 4]);
        assert_eq!(p.unwrap().tell, 1);
    }

    #[test]
    fn short_peek_latches_until_drained() {
        let mut source = SliceSource::new(vec![1, 2]);
        let mut capture = MemoryCapture::new();
        let framer = Framer::new(
            FramerMode::Continuous,
            &mut source,
            &mut capture,
            CancelToken::new(),
            DEFAULT_POLL_TIMEOUT,
        );
        let mut window = LookaheadWindow::new(framer);

        let (_, bytes) = window.peek(4).unwrap();
        assert_eq!(bytes, vec![1, 2]);
        assert!(window.source_finished());

        window.pop(1);
        let (_, bytes) = window.peek(4).unwrap();
        assert_eq!(bytes, vec![2]);

        window.pop(1);
        let (p, bytes) = window.peek(4).unwrap();
        assert!(bytes.is_empty());
        assert!(p.is_none());
    }
}
