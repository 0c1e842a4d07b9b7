//! Incremental frame reassembly
//!
//! The framer consumes receive segments in arrival order and emits complete
//! bodies through a callback. A frame that arrives whole inside one segment is
//! emitted straight from that segment; only frames split across segments are
//! copied into the framer's own buffer, which is sized once for the largest
//! frame the session accepts.
//!
//! The slice handed to the callback is only valid for the duration of the call.

use super::frame::{read_frame_header, FRAME_HEADER_LEN};
use crate::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FramerState {
    AccumulatingHeader,
    AccumulatingMessage,
}

#[derive(Debug)]
pub struct MessageFramer {
    state: FramerState,
    header: [u8; FRAME_HEADER_LEN],
    header_filled: usize,
    body: Box<[u8]>,
    body_len: usize,
    body_filled: usize,
    max_frame_length: usize,
    padding_frames: u64,
}

impl MessageFramer {
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            state: FramerState::AccumulatingHeader,
            header: [0; FRAME_HEADER_LEN],
            header_filled: 0,
            body: vec![0u8; max_frame_length].into_boxed_slice(),
            body_len: 0,
            body_filled: 0,
            max_frame_length,
            padding_frames: 0,
        }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    /// Padding frames absorbed since construction
    pub fn padding_frames(&self) -> u64 {
        self.padding_frames
    }

    /// True when no partial frame is buffered
    pub fn is_idle(&self) -> bool {
        self.state == FramerState::AccumulatingHeader && self.header_filled == 0
    }

    /// Drop any partial frame
    pub fn reset(&mut self) {
        self.state = FramerState::AccumulatingHeader;
        self.header_filled = 0;
        self.body_len = 0;
        self.body_filled = 0;
    }

    /// Feed received bytes, invoking `on_message` for every complete body.
    /// Returns the number of messages emitted. A length prefix above the
    /// maximum frame length is a protocol violation; the framer is reset and
    /// the session should be closed.
    pub fn submit_bytes<F>(&mut self, mut data: &[u8], mut on_message: F) -> Result<usize>
    where
        F: FnMut(&[u8]),
    {
        let mut emitted = 0;
        while !data.is_empty() {
            match self.state {
                FramerState::AccumulatingHeader => {
                    if self.header_filled == 0 && data.len() >= FRAME_HEADER_LEN {
                        let body_len = self.check_length(read_frame_header(data))?;
                        data = &data[FRAME_HEADER_LEN..];
                        if body_len == 0 {
                            self.padding_frames += 1;
                        } else if data.len() >= body_len {
                            on_message(&data[..body_len]);
                            emitted += 1;
                            data = &data[body_len..];
                        } else {
                            self.begin_body(body_len);
                        }
                        continue;
                    }

                    let take = (FRAME_HEADER_LEN - self.header_filled).min(data.len());
                    self.header[self.header_filled..self.header_filled + take]
                        .copy_from_slice(&data[..take]);
                    self.header_filled += take;
                    data = &data[take..];

                    if self.header_filled == FRAME_HEADER_LEN {
                        self.header_filled = 0;
                        let body_len = self.check_length(read_frame_header(&self.header))?;
                        if body_len == 0 {
                            self.padding_frames += 1;
                        } else {
                            self.begin_body(body_len);
                        }
                    }
                }
                FramerState::AccumulatingMessage => {
                    let take = (self.body_len - self.body_filled).min(data.len());
                    self.body[self.body_filled..self.body_filled + take]
                        .copy_from_slice(&data[..take]);
                    self.body_filled += take;
                    data = &data[take..];

                    if self.body_filled == self.body_len {
                        on_message(&self.body[..self.body_len]);
                        emitted += 1;
                        self.state = FramerState::AccumulatingHeader;
                        self.body_len = 0;
                        self.body_filled = 0;
                    }
                }
            }
        }
        Ok(emitted)
    }

    fn begin_body(&mut self, body_len: usize) {
        self.state = FramerState::AccumulatingMessage;
        self.body_len = body_len;
        self.body_filled = 0;
    }

    fn check_length(&mut self, body_len: u32) -> Result<usize> {
        let body_len = body_len as usize;
        if body_len > self.max_frame_length {
            self.reset();
            return Err(EngineError::protocol(format!(
                "frame length {} exceeds maximum {}",
                body_len, self.max_frame_length
            )));
        }
        Ok(body_len)
    }
}
