//! Shared types for the murmur audio pipeline.
//!
//! These types travel between the synthesis session, the wire codec and the
//! audio server. Keeping them here means producer processes can depend on them
//! without pulling in tokio, rodio, or other heavy deps.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ─── Audio ────────────────────────────────────────────────────────────────

/// Only 16-bit linear PCM is carried end to end.
pub const BITS_PER_SAMPLE: u16 = 16;

/// Bytes per 16-bit sample.
pub const SAMPLE_BYTES: usize = 2;

/// Byte order of the 16-bit samples in a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    Le,
    Be,
}

impl SampleFormat {
    /// Byte order of the running CPU.
    pub const fn native() -> Self {
        if cfg!(target_endian = "big") {
            SampleFormat::Be
        } else {
            SampleFormat::Le
        }
    }

    /// Numeric code used in the transport header.
    pub const fn wire_code(self) -> u32 {
        match self {
            SampleFormat::Le => 0,
            SampleFormat::Be => 1,
        }
    }

    pub const fn from_wire_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(SampleFormat::Le),
            1 => Some(SampleFormat::Be),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("sample data has odd length {0}")]
    OddLength(usize),
    #[error("channel count must be at least 1")]
    NoChannels,
    #[error("sample rate must be positive")]
    NoSampleRate,
}

/// One buffer of interleaved 16-bit PCM samples.
///
/// `data` holds the raw bytes in the order declared by `format`. The chunk is
/// owned by exactly one pipeline stage at a time and dropped once the device
/// has consumed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioChunk {
    pub format: SampleFormat,
    pub bits: u16,
    pub channels: u16,
    pub sample_rate: u32,
    pub data: Vec<u8>,
}

impl AudioChunk {
    /// Wrap raw sample bytes already in `format` byte order.
    pub fn new(
        format: SampleFormat,
        channels: u16,
        sample_rate: u32,
        data: Vec<u8>,
    ) -> Result<Self, ChunkError> {
        if channels == 0 {
            return Err(ChunkError::NoChannels);
        }
        if sample_rate == 0 {
            return Err(ChunkError::NoSampleRate);
        }
        if data.len() % SAMPLE_BYTES != 0 {
            return Err(ChunkError::OddLength(data.len()));
        }
        Ok(Self {
            format,
            bits: BITS_PER_SAMPLE,
            channels,
            sample_rate,
            data,
        })
    }

    /// Encode `samples` into a chunk with the given byte order.
    pub fn from_samples(
        samples: &[i16],
        channels: u16,
        sample_rate: u32,
        format: SampleFormat,
    ) -> Result<Self, ChunkError> {
        let mut data = Vec::with_capacity(samples.len() * SAMPLE_BYTES);
        for &s in samples {
            match format {
                SampleFormat::Le => data.extend_from_slice(&s.to_le_bytes()),
                SampleFormat::Be => data.extend_from_slice(&s.to_be_bytes()),
            }
        }
        Self::new(format, channels, sample_rate, data)
    }

    /// Decode the samples according to the declared byte order.
    pub fn samples(&self) -> Vec<i16> {
        self.data
            .chunks_exact(SAMPLE_BYTES)
            .map(|pair| match self.format {
                SampleFormat::Le => i16::from_le_bytes([pair[0], pair[1]]),
                SampleFormat::Be => i16::from_be_bytes([pair[0], pair[1]]),
            })
            .collect()
    }

    /// Number of 16-bit samples across all channels.
    pub fn num_samples(&self) -> usize {
        self.data.len() / SAMPLE_BYTES
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Wall-clock length of the chunk.
    pub fn duration(&self) -> Duration {
        let frames = self.num_samples() as u64 / u64::from(self.channels.max(1));
        Duration::from_micros(frames * 1_000_000 / u64::from(self.sample_rate.max(1)))
    }

    /// Convert the chunk to `target` byte order in place.
    ///
    /// Returns the number of samples swapped: all of them when the orders
    /// differ, zero when they already match.
    pub fn convert_to(&mut self, target: SampleFormat) -> usize {
        if self.format == target {
            return 0;
        }
        self.format = target;
        crate::pcm::swap_bytes16(&mut self.data)
    }
}

// ─── Voices ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

/// One voice offered by a synthesis engine. Immutable once enumerated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceDescriptor {
    pub name: String,
    pub language: String,
    #[serde(default)]
    pub variant: Option<String>,
    #[serde(default)]
    pub gender: Option<Gender>,
    #[serde(default)]
    pub age: Option<u8>,
}

/// Requested voice character, independent of any engine's voice names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceType {
    #[default]
    Male1,
    Male2,
    Male3,
    Female1,
    Female2,
    Female3,
    ChildMale,
    ChildFemale,
}

impl VoiceType {
    pub fn gender(self) -> Gender {
        match self {
            VoiceType::Female1
            | VoiceType::Female2
            | VoiceType::Female3
            | VoiceType::ChildFemale => Gender::Female,
            _ => Gender::Male,
        }
    }

    pub fn is_child(self) -> bool {
        matches!(self, VoiceType::ChildMale | VoiceType::ChildFemale)
    }

    /// Which of several equally good voices to pick (0-based).
    pub fn rank(self) -> usize {
        match self {
            VoiceType::Male2 | VoiceType::Female2 => 1,
            VoiceType::Male3 | VoiceType::Female3 => 2,
            _ => 0,
        }
    }
}

/// Kind of payload handed to `speak`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    #[default]
    Text,
    SoundIcon,
    Char,
    Key,
    Spell,
}

pub const PARAM_MIN: i32 = -100;
pub const PARAM_MAX: i32 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{name} {value} out of range [-100, 100]")]
pub struct RangeError {
    pub name: &'static str,
    pub value: i32,
}

/// Check that a rate/pitch/volume value lies in [-100, 100].
pub fn check_range(name: &'static str, value: i32) -> Result<i32, RangeError> {
    if (PARAM_MIN..=PARAM_MAX).contains(&value) {
        Ok(value)
    } else {
        Err(RangeError { name, value })
    }
}

/// Voice and prosody settings bound to the engine for one utterance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceParams {
    pub language: String,
    pub voice_type: VoiceType,
    /// Engine voice name; wins over language/type when it matches exactly.
    pub synthesis_voice: Option<String>,
    pub rate: i32,
    pub pitch: i32,
    pub volume: i32,
}

impl Default for VoiceParams {
    fn default() -> Self {
        Self {
            language: "en".into(),
            voice_type: VoiceType::Male1,
            synthesis_voice: None,
            rate: 0,
            pitch: 0,
            volume: PARAM_MAX,
        }
    }
}

impl VoiceParams {
    pub fn validate(&self) -> Result<(), RangeError> {
        check_range("rate", self.rate)?;
        check_range("pitch", self.pitch)?;
        check_range("volume", self.volume)?;
        Ok(())
    }
}

// ─── Session / server status ──────────────────────────────────────────────

/// Lifecycle phase of a synthesis session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    Idle,
    Speaking,
    Stopping,
    Draining,
    Closing,
}

/// Session status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub phase: SessionPhase,
    pub voice: Option<String>,
    pub utterances: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionEventKind {
    Begin,
    End,
}

/// Lifecycle event reported to the surrounding system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionEvent {
    pub session: u64,
    pub kind: SessionEventKind,
}

/// Audio server status snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ServerStatus {
    /// Name of the open backend, `None` when running without a device.
    pub device: Option<String>,
    /// Open producer connections.
    pub connections: usize,
    /// Connections accepted since startup.
    pub accepted: u64,
    pub chunks_played: u64,
}
