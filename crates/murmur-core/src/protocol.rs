//! Audio transport protocol between producer processes and the audio server.
//!
//! Each frame is one header line followed by raw sample bytes:
//!
//! ```text
//! <format>:<bits>:<channels>:<rate>:<num_samples>\r\n
//! <num_samples * 2 bytes of 16-bit PCM>
//! ```
//!
//! `format` is `0` for little endian and `1` for big endian. A bare `ACK\r\n`
//! line is a keep-alive with no payload.
//!
//! Header parsing is shared by the blocking reader here and the async reader
//! in the daemon; only the byte source differs.

use std::io::{self, Read, Write};

use thiserror::Error;

use crate::types::{AudioChunk, BITS_PER_SAMPLE, SAMPLE_BYTES, SampleFormat};

/// Keep-alive line.
pub const ACK: &[u8] = b"ACK\r\n";

/// Longest header line accepted, terminator included.
pub const MAX_HEADER_LEN: usize = 4096;

/// Largest sample count a single frame may declare (32 MiB of payload).
pub const MAX_FRAME_SAMPLES: i64 = 1 << 24;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("peer closed the connection")]
    Disconnected,
    #[error("connection closed inside a header line")]
    UnterminatedHeader,
    #[error("connection closed mid-payload ({got} of {expected} bytes)")]
    Truncated { expected: usize, got: usize },
    #[error("header line exceeds 4096 bytes")]
    HeaderTooLong,
    #[error("malformed header {0:?}")]
    MalformedHeader(String),
    #[error("rejected frame: {0}")]
    Rejected(String),
    #[error("read failed: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Whether the byte stream is unusable after this error.
    ///
    /// Header-level errors leave the stream aligned on the next line, so the
    /// connection can keep going; everything else means the peer is gone or
    /// out of sync.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ProtocolError::MalformedHeader(_) | ProtocolError::Rejected(_)
        )
    }
}

/// Validated frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub format: SampleFormat,
    pub bits: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub num_samples: usize,
}

impl FrameHeader {
    pub fn for_chunk(chunk: &AudioChunk) -> Self {
        Self {
            format: chunk.format,
            bits: chunk.bits,
            channels: chunk.channels,
            sample_rate: chunk.sample_rate,
            num_samples: chunk.num_samples(),
        }
    }

    pub fn payload_len(&self) -> usize {
        self.num_samples * SAMPLE_BYTES
    }

    /// Header line including the CR LF terminator.
    pub fn encode(&self) -> String {
        format!(
            "{}:{}:{}:{}:{}\r\n",
            self.format.wire_code(),
            self.bits,
            self.channels,
            self.sample_rate,
            self.num_samples
        )
    }

    /// Attach a payload read off the wire. `data` must be `payload_len()` long.
    pub fn into_chunk(self, data: Vec<u8>) -> AudioChunk {
        debug_assert_eq!(data.len(), self.payload_len());
        AudioChunk {
            format: self.format,
            bits: self.bits,
            channels: self.channels,
            sample_rate: self.sample_rate,
            data,
        }
    }
}

/// Outcome of parsing one header line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderLine {
    Ack,
    Frame(FrameHeader),
    /// Well-formed integers with unusable values. `discard` payload bytes
    /// follow and must be skipped to stay aligned.
    Invalid { reason: String, discard: usize },
}

/// Decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Ack,
    Chunk(AudioChunk),
}

/// Collects header bytes until the CR LF terminator.
#[derive(Debug, Default)]
pub struct HeaderAccumulator {
    buf: Vec<u8>,
}

impl HeaderAccumulator {
    pub fn new() -> Self {
        Self {
            buf: Vec::with_capacity(64),
        }
    }

    /// Feed one byte. Returns the line (without CR LF) once it is complete.
    ///
    /// An embedded NUL is stored as `?` so it cannot cut the line short.
    pub fn push(&mut self, byte: u8) -> Result<Option<String>, ProtocolError> {
        if byte == b'\n' && self.buf.last() == Some(&b'\r') {
            self.buf.pop();
            let line = String::from_utf8_lossy(&self.buf).into_owned();
            self.buf.clear();
            return Ok(Some(line));
        }
        if self.buf.len() + 1 >= MAX_HEADER_LEN {
            return Err(ProtocolError::HeaderTooLong);
        }
        self.buf.push(if byte == 0 { b'?' } else { byte });
        Ok(None)
    }

    /// Error to report when the stream ends before the line is complete.
    pub fn eof_error(&self) -> ProtocolError {
        if self.buf.is_empty() {
            ProtocolError::Disconnected
        } else {
            ProtocolError::UnterminatedHeader
        }
    }
}

/// Parse a header line (terminator already stripped).
pub fn parse_header_line(line: &str) -> Result<HeaderLine, ProtocolError> {
    if line == "ACK" {
        return Ok(HeaderLine::Ack);
    }

    let fields: Vec<&str> = line.splitn(5, ':').collect();
    if fields.len() != 5 {
        return Err(ProtocolError::MalformedHeader(line.to_string()));
    }
    let mut values = [0i64; 5];
    for (slot, field) in values.iter_mut().zip(&fields) {
        *slot = field
            .trim()
            .parse()
            .map_err(|_| ProtocolError::MalformedHeader(line.to_string()))?;
    }
    let [format, bits, channels, rate, num_samples] = values;

    let discard = if (0..=MAX_FRAME_SAMPLES).contains(&num_samples) {
        num_samples as usize * SAMPLE_BYTES
    } else {
        0
    };
    let invalid = |reason: String| Ok(HeaderLine::Invalid { reason, discard });

    let Some(format) = SampleFormat::from_wire_code(format) else {
        return invalid(format!("unknown sample format {format}"));
    };
    if bits != i64::from(BITS_PER_SAMPLE) {
        return invalid(format!("unsupported sample width {bits}"));
    }
    if !(1..=i64::from(u16::MAX)).contains(&channels) {
        return invalid(format!("invalid channel count {channels}"));
    }
    if !(1..=i64::from(u32::MAX)).contains(&rate) {
        return invalid(format!("invalid sample rate {rate}"));
    }
    if !(0..=MAX_FRAME_SAMPLES).contains(&num_samples) {
        return invalid(format!("invalid sample count {num_samples}"));
    }

    Ok(HeaderLine::Frame(FrameHeader {
        format,
        bits: BITS_PER_SAMPLE,
        channels: channels as u16,
        sample_rate: rate as u32,
        num_samples: num_samples as usize,
    }))
}

/// Serialize one chunk as header + payload.
pub fn encode_frame(chunk: &AudioChunk) -> Vec<u8> {
    let header = FrameHeader::for_chunk(chunk).encode();
    let mut out = Vec::with_capacity(header.len() + chunk.data.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&chunk.data);
    out
}

/// Write one chunk frame and flush.
pub fn write_frame<W: Write>(writer: &mut W, chunk: &AudioChunk) -> io::Result<()> {
    writer.write_all(FrameHeader::for_chunk(chunk).encode().as_bytes())?;
    writer.write_all(&chunk.data)?;
    writer.flush()
}

pub fn write_ack<W: Write>(writer: &mut W) -> io::Result<()> {
    writer.write_all(ACK)?;
    writer.flush()
}

/// Read one header line byte by byte.
pub fn read_header_line<R: Read>(reader: &mut R) -> Result<String, ProtocolError> {
    let mut acc = HeaderAccumulator::new();
    let mut byte = [0u8; 1];
    loop {
        match reader.read(&mut byte) {
            Ok(0) => return Err(acc.eof_error()),
            Ok(_) => {
                if let Some(line) = acc.push(byte[0])? {
                    return Ok(line);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
}

/// Read exactly `len` payload bytes.
pub fn read_payload<R: Read>(reader: &mut R, len: usize) -> Result<Vec<u8>, ProtocolError> {
    let mut data = vec![0u8; len];
    let mut got = 0;
    while got < len {
        match reader.read(&mut data[got..]) {
            Ok(0) => return Err(ProtocolError::Truncated { expected: len, got }),
            Ok(n) => got += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e.into()),
        }
    }
    Ok(data)
}

/// Read one complete frame from a blocking reader.
pub fn read_frame<R: Read>(reader: &mut R) -> Result<Frame, ProtocolError> {
    let line = read_header_line(reader)?;
    match parse_header_line(&line)? {
        HeaderLine::Ack => Ok(Frame::Ack),
        HeaderLine::Frame(header) => {
            let data = read_payload(reader, header.payload_len())?;
            Ok(Frame::Chunk(header.into_chunk(data)))
        }
        HeaderLine::Invalid { reason, discard } => {
            read_payload(reader, discard)?;
            Err(ProtocolError::Rejected(reason))
        }
    }
}
