//! Incremental frame decoder for the audio server.
//!
//! The server reads whatever bytes a connection has ready and feeds them
//! here; a frame is returned only once its header and whole payload have
//! arrived. Partial frames stay buffered per connection, so a slow producer
//! never holds up the event loop. Header parsing is shared with the blocking
//! reader in `murmur_core::protocol`.

use murmur_core::protocol::{
    Frame, FrameHeader, HeaderAccumulator, HeaderLine, ProtocolError, parse_header_line,
};

#[derive(Debug)]
enum State {
    Header(HeaderAccumulator),
    /// Payload of a valid frame, `data.len()` bytes filled so far.
    Payload { header: FrameHeader, data: Vec<u8> },
    /// Payload of a rejected frame being skipped.
    Skip {
        reason: String,
        len: usize,
        left: usize,
    },
}

impl State {
    fn header() -> Self {
        State::Header(HeaderAccumulator::new())
    }
}

/// Per-connection decode state.
#[derive(Debug)]
pub struct FrameDecoder {
    state: State,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: State::header(),
        }
    }

    /// Consume bytes from the front of `input` until one frame or one frame
    /// error completes. Returns `None` once `input` is used up with the
    /// current frame still incomplete.
    ///
    /// A rejected frame has its payload skipped before the error is returned,
    /// so non-fatal errors leave the decoder aligned on the next header.
    pub fn decode(&mut self, input: &mut &[u8]) -> Option<Result<Frame, ProtocolError>> {
        loop {
            match &mut self.state {
                State::Header(acc) => {
                    let (&byte, rest) = input.split_first()?;
                    *input = rest;
                    let line = match acc.push(byte) {
                        Ok(Some(line)) => line,
                        Ok(None) => continue,
                        Err(e) => {
                            self.state = State::header();
                            return Some(Err(e));
                        }
                    };
                    match parse_header_line(&line) {
                        Ok(HeaderLine::Ack) => return Some(Ok(Frame::Ack)),
                        Ok(HeaderLine::Frame(header)) => {
                            self.state = State::Payload {
                                header,
                                data: Vec::with_capacity(header.payload_len()),
                            };
                        }
                        Ok(HeaderLine::Invalid { reason, discard }) => {
                            self.state = State::Skip {
                                reason,
                                len: discard,
                                left: discard,
                            };
                        }
                        Err(e) => return Some(Err(e)),
                    }
                }
                State::Payload { header, data } => {
                    let want = header.payload_len() - data.len();
                    let (head, rest) = input.split_at(want.min(input.len()));
                    data.extend_from_slice(head);
                    *input = rest;
                    if data.len() < header.payload_len() {
                        return None;
                    }
                    let chunk = header.into_chunk(std::mem::take(data));
                    self.state = State::header();
                    return Some(Ok(Frame::Chunk(chunk)));
                }
                State::Skip { reason, left, .. } => {
                    let skipped = (*left).min(input.len());
                    *input = &input[skipped..];
                    *left -= skipped;
                    if *left > 0 {
                        return None;
                    }
                    let reason = std::mem::take(reason);
                    self.state = State::header();
                    return Some(Err(ProtocolError::Rejected(reason)));
                }
            }
        }
    }

    /// Error to report when the peer closes the connection now.
    pub fn eof_error(&self) -> ProtocolError {
        match &self.state {
            State::Header(acc) => acc.eof_error(),
            State::Payload { header, data } => ProtocolError::Truncated {
                expected: header.payload_len(),
                got: data.len(),
            },
            State::Skip { len, left, .. } => ProtocolError::Truncated {
                expected: *len,
                got: len - left,
            },
        }
    }
}
