//! Synthesis engine seam.
//!
//! The session drives an engine from its own thread: `load` one utterance,
//! then call `process` repeatedly with a time budget until it reports `Done`.
//! Audio leaves the engine through [`ChunkSink::push`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Sender, SyncSender};
use std::time::Duration;

use thiserror::Error;

use murmur_core::pcm::apply_volume;
use murmur_core::types::{AudioChunk, PARAM_MAX, VoiceDescriptor, VoiceParams};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine setup failed: {0}")]
    Setup(String),
    #[error("no voice at index {0}")]
    NoVoice(usize),
    #[error("synthesis failed: {0}")]
    Synthesis(String),
}

/// Rate, pitch and volume for one utterance, each in [-100, 100].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Prosody {
    pub rate: i32,
    pub pitch: i32,
    pub volume: i32,
}

impl Default for Prosody {
    fn default() -> Self {
        Self {
            rate: 0,
            pitch: 0,
            volume: PARAM_MAX,
        }
    }
}

impl From<&VoiceParams> for Prosody {
    fn from(p: &VoiceParams) -> Self {
        Self {
            rate: p.rate,
            pitch: p.pitch,
            volume: p.volume,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// More audio to come; call `process` again.
    Running,
    /// The utterance is fully synthesized.
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushResult {
    Queued,
    /// Not played: a stop is pending or the session has moved on.
    Dropped,
}

pub trait SynthesisEngine: Send {
    /// Every voice the engine offers. Called once when the session opens.
    fn voices(&self) -> Vec<VoiceDescriptor>;

    /// Prepare `text` for synthesis with the voice at `voice` in `voices()`.
    fn load(&mut self, text: &str, voice: usize, prosody: &Prosody) -> Result<(), EngineError>;

    /// Synthesize for roughly `budget`, pushing audio into `sink`.
    fn process(&mut self, budget: Duration, sink: &ChunkSink) -> Result<EngineState, EngineError>;

    /// Drop any partially synthesized audio and the loaded text.
    fn purge(&mut self);
}

/// Work item for the delivery stage.
pub(crate) enum Delivery {
    Chunk { epoch: u64, chunk: AudioChunk },
    /// Acknowledged once every earlier item has been handled.
    Flush(Sender<()>),
}

/// Bounded hand-off from the engine to the delivery stage.
///
/// Chunks are tagged with the epoch the utterance started in; a stop bumps
/// the epoch so anything still queued is discarded.
pub struct ChunkSink {
    tx: SyncSender<Delivery>,
    stop: Arc<AtomicBool>,
    epoch: Arc<AtomicU64>,
    utterance_epoch: u64,
    volume: i32,
}

impl ChunkSink {
    pub(crate) fn new(
        tx: SyncSender<Delivery>,
        stop: Arc<AtomicBool>,
        epoch: Arc<AtomicU64>,
        volume: i32,
    ) -> Self {
        let utterance_epoch = epoch.load(Ordering::SeqCst);
        Self {
            tx,
            stop,
            epoch,
            utterance_epoch,
            volume,
        }
    }

    fn cancelled(&self) -> bool {
        self.stop.load(Ordering::SeqCst) || self.epoch.load(Ordering::SeqCst) != self.utterance_epoch
    }

    /// Queue one chunk for playback, blocking while the queue is full.
    pub fn push(&self, mut chunk: AudioChunk) -> PushResult {
        if self.cancelled() {
            return PushResult::Dropped;
        }
        apply_volume(&mut chunk.data, chunk.format, self.volume);
        let item = Delivery::Chunk {
            epoch: self.utterance_epoch,
            chunk,
        };
        match self.tx.send(item) {
            Ok(()) => PushResult::Queued,
            Err(_) => PushResult::Dropped,
        }
    }
}
