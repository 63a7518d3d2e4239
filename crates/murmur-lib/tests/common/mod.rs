//! Test doubles shared by the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use murmur_lib::backend::{AudioBackend, BackendError, PlayOutcome, PlaybackStopper};
use murmur_lib::engine::{ChunkSink, EngineError, EngineState, Prosody, SynthesisEngine};
use murmur_lib::murmur_core::types::{AudioChunk, Gender, SampleFormat, SessionEvent, VoiceDescriptor};
use murmur_lib::output::{AudioOutput, OutputError};
use tokio::sync::broadcast;

/// Backend that records every chunk it is asked to play.
pub struct RecordingBackend {
    pub native: SampleFormat,
    pub played: Mutex<Vec<AudioChunk>>,
}

impl RecordingBackend {
    pub fn new(native: SampleFormat) -> Arc<Self> {
        Arc::new(Self {
            native,
            played: Mutex::new(Vec::new()),
        })
    }

    pub fn played(&self) -> Vec<AudioChunk> {
        self.played.lock().unwrap().clone()
    }
}

impl AudioBackend for RecordingBackend {
    fn name(&self) -> &'static str {
        "recording"
    }

    fn native_format(&self) -> SampleFormat {
        self.native
    }

    fn play(&self, chunk: &AudioChunk) -> Result<PlayOutcome, BackendError> {
        self.played.lock().unwrap().push(chunk.clone());
        Ok(PlayOutcome::Completed)
    }

    fn stop(&self) {}
}

/// Session output that records delivered chunks, taking `delay` per chunk.
#[derive(Clone)]
pub struct RecordingOutput {
    pub delivered: Arc<Mutex<Vec<AudioChunk>>>,
    pub delay: Duration,
}

impl RecordingOutput {
    pub fn new(delay: Duration) -> Self {
        Self {
            delivered: Arc::new(Mutex::new(Vec::new())),
            delay,
        }
    }

    pub fn count(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }
}

impl AudioOutput for RecordingOutput {
    fn deliver(&mut self, chunk: AudioChunk) -> Result<PlayOutcome, OutputError> {
        std::thread::sleep(self.delay);
        self.delivered.lock().unwrap().push(chunk);
        Ok(PlayOutcome::Completed)
    }

    fn stopper(&self) -> Option<PlaybackStopper> {
        None
    }
}

/// Engine that emits `chunks` small chunks per utterance, one per `process`
/// call, sleeping `pace` before each.
pub struct ScriptedEngine {
    pub chunks: usize,
    pub pace: Duration,
    pub loaded: Arc<Mutex<Vec<String>>>,
    pub purges: Arc<AtomicUsize>,
    remaining: usize,
}

impl ScriptedEngine {
    pub fn new(chunks: usize, pace: Duration) -> Self {
        Self {
            chunks,
            pace,
            loaded: Arc::new(Mutex::new(Vec::new())),
            purges: Arc::new(AtomicUsize::new(0)),
            remaining: 0,
        }
    }
}

impl SynthesisEngine for ScriptedEngine {
    fn voices(&self) -> Vec<VoiceDescriptor> {
        vec![
            VoiceDescriptor {
                name: "alto".into(),
                language: "en".into(),
                variant: None,
                gender: Some(Gender::Female),
                age: None,
            },
            VoiceDescriptor {
                name: "basso".into(),
                language: "en".into(),
                variant: None,
                gender: Some(Gender::Male),
                age: None,
            },
        ]
    }

    fn load(&mut self, text: &str, _voice: usize, _prosody: &Prosody) -> Result<(), EngineError> {
        self.loaded.lock().unwrap().push(text.to_string());
        self.remaining = self.chunks;
        Ok(())
    }

    fn process(&mut self, _budget: Duration, sink: &ChunkSink) -> Result<EngineState, EngineError> {
        if self.remaining == 0 {
            return Ok(EngineState::Done);
        }
        std::thread::sleep(self.pace);
        let chunk = AudioChunk::from_samples(&[100; 32], 1, 16000, SampleFormat::Le)
            .map_err(|e| EngineError::Synthesis(e.to_string()))?;
        sink.push(chunk);
        self.remaining -= 1;
        Ok(if self.remaining == 0 {
            EngineState::Done
        } else {
            EngineState::Running
        })
    }

    fn purge(&mut self) {
        self.remaining = 0;
        self.purges.fetch_add(1, Ordering::SeqCst);
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}

/// Next session event, or `None` after `timeout`.
pub fn next_event(rx: &mut broadcast::Receiver<SessionEvent>, timeout: Duration) -> Option<SessionEvent> {
    let deadline = Instant::now() + timeout;
    loop {
        match rx.try_recv() {
            Ok(event) => return Some(event),
            Err(broadcast::error::TryRecvError::Empty) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(5));
            }
            Err(_) => return None,
        }
    }
}
