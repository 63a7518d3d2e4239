//! Synthesis session: speak/stop/pause/close over an engine and an output.
//!
//! Two worker threads per session:
//!
//! - **engine** parks on a counting semaphore posted by `speak`, `stop` and
//!   `close`, loads the pending utterance and drives the engine in time
//!   slices, pushing chunks into a bounded channel.
//! - **delivery** pops chunks in order and hands them to the output, dropping
//!   any whose epoch is stale.
//!
//! Caller threads only take the state lock briefly, flip atomics and post the
//! semaphore; none of the public methods except `close` ever wait on the
//! workers.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use murmur_core::config::SessionConfig;
use murmur_core::text_prep::prepare_input;
use murmur_core::types::{
    MessageType, RangeError, SessionEvent, SessionEventKind, SessionPhase, SessionStatus,
    VoiceDescriptor, VoiceParams,
};

use crate::backend::{PlayOutcome, PlaybackStopper};
use crate::engine::{ChunkSink, Delivery, EngineError, EngineState, Prosody, SynthesisEngine};
use crate::output::AudioOutput;
use crate::voice::select_voice;

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

const EVENT_CAPACITY: usize = 64;
const JOIN_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is closed")]
    Closed,
    #[error("invalid parameter: {0}")]
    Params(#[from] RangeError),
    #[error("pause is not supported; speech was stopped")]
    PauseUnsupported,
    #[error("engine offers no voices")]
    NoVoices,
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("cannot start session thread: {0}")]
    Spawn(std::io::Error),
}

// ─── Semaphore ─────────────────────────────────────────────────────────────

#[derive(Default)]
struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    fn post(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count += 1;
        self.cond.notify_one();
    }

    fn wait(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count == 0 {
            count = self.cond.wait(count).unwrap_or_else(PoisonError::into_inner);
        }
        *count -= 1;
    }
}

// ─── Shared state ──────────────────────────────────────────────────────────

struct Utterance {
    text: String,
    voice: usize,
    prosody: Prosody,
}

struct Shared {
    phase: SessionPhase,
    pending: Option<Utterance>,
}

struct Inner {
    id: u64,
    state: Mutex<Shared>,
    stop: Arc<AtomicBool>,
    close: AtomicBool,
    epoch: Arc<AtomicU64>,
    wake: Semaphore,
    current_voice: AtomicUsize,
    stopper: Option<PlaybackStopper>,
    status_tx: watch::Sender<SessionStatus>,
    events_tx: broadcast::Sender<SessionEvent>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Set the phase and publish it. Caller holds the state lock.
    fn set_phase(&self, shared: &mut Shared, phase: SessionPhase) {
        shared.phase = phase;
        self.status_tx.send_modify(|s| s.phase = phase);
    }

    fn emit(&self, kind: SessionEventKind) {
        debug!("session {}: {kind:?}", self.id);
        // No subscribers is fine.
        let _ = self.events_tx.send(SessionEvent {
            session: self.id,
            kind,
        });
    }

    /// Bump the epoch and cut short whatever the device is playing.
    fn interrupt(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(stopper) = &self.stopper {
            stopper.stop();
        }
    }

    /// Acknowledge a pending stop and fall back to idle unless a new
    /// utterance is already waiting.
    fn settle(&self) -> Option<Utterance> {
        let mut shared = self.lock();
        if self.stop.swap(false, Ordering::SeqCst) {
            debug!("session {}: stop acknowledged", self.id);
        }
        let next = shared.pending.take();
        if next.is_none() && shared.phase != SessionPhase::Closing {
            self.set_phase(&mut shared, SessionPhase::Idle);
        }
        next
    }
}

// ─── Session ───────────────────────────────────────────────────────────────

/// A running synthesis session. Share it behind an `Arc`.
pub struct SynthesisSession {
    inner: Arc<Inner>,
    voices: Mutex<Option<Arc<[VoiceDescriptor]>>>,
    status_rx: watch::Receiver<SessionStatus>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    grace: Duration,
}

impl SynthesisSession {
    /// Enumerate the engine's voices and start the worker threads.
    pub fn open(
        engine: Box<dyn SynthesisEngine>,
        output: Box<dyn AudioOutput>,
        config: &SessionConfig,
    ) -> Result<Self, SessionError> {
        let voices: Arc<[VoiceDescriptor]> = engine.voices().into();
        if voices.is_empty() {
            return Err(SessionError::NoVoices);
        }

        let id = NEXT_SESSION.fetch_add(1, Ordering::Relaxed);
        let (status_tx, status_rx) = watch::channel(SessionStatus {
            phase: SessionPhase::Idle,
            voice: Some(voices[0].name.clone()),
            utterances: 0,
        });
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);

        let inner = Arc::new(Inner {
            id,
            state: Mutex::new(Shared {
                phase: SessionPhase::Idle,
                pending: None,
            }),
            stop: Arc::new(AtomicBool::new(false)),
            close: AtomicBool::new(false),
            epoch: Arc::new(AtomicU64::new(0)),
            wake: Semaphore::default(),
            current_voice: AtomicUsize::new(0),
            stopper: output.stopper(),
            status_tx,
            events_tx,
        });

        let (tx, rx) = mpsc::sync_channel(config.channel_capacity.max(1));

        let delivery_inner = inner.clone();
        let delivery = std::thread::Builder::new()
            .name("murmur-delivery".into())
            .spawn(move || delivery_loop(delivery_inner, rx, output))
            .map_err(SessionError::Spawn)?;

        let engine_inner = inner.clone();
        let slice = config.slice();
        let engine_thread = std::thread::Builder::new()
            .name("murmur-engine".into())
            .spawn(move || engine_loop(engine_inner, engine, tx, slice))
            .map_err(SessionError::Spawn)?;

        info!("session {id} opened with {} voices", voices.len());
        Ok(Self {
            inner,
            voices: Mutex::new(Some(voices)),
            status_rx,
            threads: Mutex::new(vec![engine_thread, delivery]),
            grace: config.grace_period(),
        })
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Start speaking `data`.
    ///
    /// Returns the number of bytes accepted, or `0` when an utterance is
    /// already in progress.
    pub fn speak(
        &self,
        data: &[u8],
        msg_type: MessageType,
        params: &VoiceParams,
    ) -> Result<usize, SessionError> {
        let voices = self.list_voices()?;
        let mut shared = self.inner.lock();
        match shared.phase {
            SessionPhase::Closing => return Err(SessionError::Closed),
            SessionPhase::Idle => {}
            SessionPhase::Stopping if shared.pending.is_none() => {}
            phase => {
                debug!("session {}: busy ({phase:?}), rejecting speak", self.inner.id);
                return Ok(0);
            }
        }
        params.validate()?;

        let current = self.inner.current_voice.load(Ordering::Relaxed);
        let voice = select_voice(&voices, params, current);
        self.inner.current_voice.store(voice, Ordering::Relaxed);

        let text = prepare_input(data, msg_type);
        debug!(
            "session {}: speak {} bytes as {msg_type:?} with {}",
            self.inner.id,
            data.len(),
            voices[voice].name
        );
        shared.pending = Some(Utterance {
            text,
            voice,
            prosody: Prosody::from(params),
        });
        let name = voices[voice].name.clone();
        self.inner.status_tx.send_modify(|s| s.voice = Some(name));
        self.inner.set_phase(&mut shared, SessionPhase::Speaking);
        drop(shared);

        self.inner.wake.post();
        Ok(data.len())
    }

    /// Stop the current utterance. A no-op when idle.
    pub fn stop(&self) -> Result<(), SessionError> {
        let mut shared = self.inner.lock();
        match shared.phase {
            SessionPhase::Closing => return Err(SessionError::Closed),
            SessionPhase::Idle | SessionPhase::Stopping => return Ok(()),
            SessionPhase::Speaking | SessionPhase::Draining => {}
        }
        shared.pending = None;
        self.inner.stop.store(true, Ordering::SeqCst);
        self.inner.set_phase(&mut shared, SessionPhase::Stopping);
        drop(shared);

        self.inner.interrupt();
        self.inner.wake.post();
        debug!("session {}: stop requested", self.inner.id);
        Ok(())
    }

    /// Pausing is not supported. Idle sessions report success; otherwise
    /// speech is stopped and `PauseUnsupported` returned.
    pub fn pause(&self) -> Result<(), SessionError> {
        let phase = self.inner.lock().phase;
        match phase {
            SessionPhase::Closing => Err(SessionError::Closed),
            SessionPhase::Idle => Ok(()),
            _ => {
                self.stop()?;
                Err(SessionError::PauseUnsupported)
            }
        }
    }

    /// Shut the session down, waiting up to the grace period for the worker
    /// threads before detaching them.
    pub fn close(&self) -> Result<(), SessionError> {
        {
            let mut shared = self.inner.lock();
            if shared.phase == SessionPhase::Closing {
                return Err(SessionError::Closed);
            }
            shared.pending = None;
            self.inner.close.store(true, Ordering::SeqCst);
            self.inner.stop.store(true, Ordering::SeqCst);
            self.inner.set_phase(&mut shared, SessionPhase::Closing);
        }
        self.inner.interrupt();
        self.inner.wake.post();

        let threads = std::mem::take(&mut *self.threads.lock().unwrap_or_else(PoisonError::into_inner));
        let deadline = Instant::now() + self.grace;
        while Instant::now() < deadline && !threads.iter().all(JoinHandle::is_finished) {
            std::thread::sleep(JOIN_POLL);
        }
        for thread in threads {
            let name = thread.thread().name().unwrap_or("worker").to_string();
            if thread.is_finished() {
                if thread.join().is_err() {
                    warn!("session {}: {name} thread panicked", self.inner.id);
                }
            } else {
                warn!(
                    "session {}: {name} thread still running after {:?}, detaching",
                    self.inner.id, self.grace
                );
            }
        }

        self.voices.lock().unwrap_or_else(PoisonError::into_inner).take();
        info!("session {} closed", self.inner.id);
        Ok(())
    }

    /// The voices enumerated when the session opened.
    pub fn list_voices(&self) -> Result<Arc<[VoiceDescriptor]>, SessionError> {
        self.voices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(SessionError::Closed)
    }

    pub fn status(&self) -> SessionStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_rx.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events_tx.subscribe()
    }
}

impl Drop for SynthesisSession {
    fn drop(&mut self) {
        if self.inner.lock().phase != SessionPhase::Closing {
            let _ = self.close();
        }
    }
}

// ─── Worker threads ────────────────────────────────────────────────────────

fn engine_loop(
    inner: Arc<Inner>,
    mut engine: Box<dyn SynthesisEngine>,
    tx: SyncSender<Delivery>,
    slice: Duration,
) {
    loop {
        inner.wake.wait();
        if inner.close.load(Ordering::SeqCst) {
            break;
        }
        let mut next = {
            let stopping = inner.stop.load(Ordering::SeqCst);
            let next = inner.settle();
            if stopping {
                engine.purge();
            }
            next
        };
        while let Some(utterance) = next.take() {
            if !speak_one(&inner, engine.as_mut(), &tx, utterance, slice) {
                debug!("session {}: engine thread exiting", inner.id);
                return;
            }
            next = inner.settle();
        }
    }
    debug!("session {}: engine thread exiting", inner.id);
}

/// Run one utterance to completion or stop. Returns `false` when the session
/// is closing.
fn speak_one(
    inner: &Inner,
    engine: &mut dyn SynthesisEngine,
    tx: &SyncSender<Delivery>,
    utterance: Utterance,
    slice: Duration,
) -> bool {
    let sink = ChunkSink::new(
        tx.clone(),
        inner.stop.clone(),
        inner.epoch.clone(),
        utterance.prosody.volume,
    );
    if let Err(e) = engine.load(&utterance.text, utterance.voice, &utterance.prosody) {
        warn!("session {}: cannot load utterance: {e}", inner.id);
        engine.purge();
        return !inner.close.load(Ordering::SeqCst);
    }
    inner.emit(SessionEventKind::Begin);

    loop {
        if inner.close.load(Ordering::SeqCst) {
            return false;
        }
        if inner.stop.load(Ordering::SeqCst) {
            engine.purge();
            break;
        }
        match engine.process(slice, &sink) {
            Ok(EngineState::Running) => {}
            Ok(EngineState::Done) => {
                let mut shared = inner.lock();
                if shared.phase == SessionPhase::Speaking && !inner.stop.load(Ordering::SeqCst) {
                    inner.set_phase(&mut shared, SessionPhase::Draining);
                }
                break;
            }
            Err(e) => {
                warn!("session {}: synthesis failed: {e}", inner.id);
                engine.purge();
                break;
            }
        }
    }
    drop(sink);

    // Wait until delivery has handled (played or discarded) every chunk.
    let (ack_tx, ack_rx) = mpsc::channel();
    if tx.send(Delivery::Flush(ack_tx)).is_ok() {
        let _ = ack_rx.recv();
    }
    if inner.close.load(Ordering::SeqCst) {
        return false;
    }

    inner.status_tx.send_modify(|s| s.utterances += 1);
    {
        let mut shared = inner.lock();
        if shared.pending.is_none() && shared.phase != SessionPhase::Closing {
            inner.set_phase(&mut shared, SessionPhase::Idle);
        }
    }
    inner.emit(SessionEventKind::End);
    true
}

fn delivery_loop(inner: Arc<Inner>, rx: Receiver<Delivery>, mut output: Box<dyn AudioOutput>) {
    for item in rx {
        if inner.close.load(Ordering::SeqCst) {
            break;
        }
        match item {
            Delivery::Chunk { epoch, chunk } => {
                if epoch != inner.epoch.load(Ordering::SeqCst) {
                    debug!("session {}: discarding stale chunk", inner.id);
                    continue;
                }
                match output.deliver(chunk) {
                    Ok(PlayOutcome::Completed) => {}
                    Ok(PlayOutcome::Interrupted) => debug!("session {}: chunk interrupted", inner.id),
                    Err(e) => warn!("session {}: delivery failed: {e}", inner.id),
                }
            }
            Delivery::Flush(ack) => {
                let _ = ack.send(());
            }
        }
    }
    debug!("session {}: delivery thread exiting", inner.id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_core::types::{AudioChunk, SampleFormat};

    #[test]
    fn semaphore_counts_posts() {
        let sem = Arc::new(Semaphore::default());
        sem.post();
        sem.post();
        sem.wait();
        sem.wait();

        let waiter = sem.clone();
        let t = std::thread::spawn(move || waiter.wait());
        std::thread::sleep(Duration::from_millis(20));
        assert!(!t.is_finished());
        sem.post();
        t.join().unwrap();
    }

    struct Silent;

    impl SynthesisEngine for Silent {
        fn voices(&self) -> Vec<VoiceDescriptor> {
            Vec::new()
        }
        fn load(&mut self, _: &str, _: usize, _: &Prosody) -> Result<(), EngineError> {
            Ok(())
        }
        fn process(&mut self, _: Duration, _: &ChunkSink) -> Result<EngineState, EngineError> {
            Ok(EngineState::Done)
        }
        fn purge(&mut self) {}
    }

    struct Sink;

    impl AudioOutput for Sink {
        fn deliver(&mut self, _: AudioChunk) -> Result<PlayOutcome, crate::output::OutputError> {
            Ok(PlayOutcome::Completed)
        }
        fn stopper(&self) -> Option<PlaybackStopper> {
            None
        }
    }

    #[test]
    fn engine_without_voices_is_rejected() {
        let err = SynthesisSession::open(Box::new(Silent), Box::new(Sink), &SessionConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, SessionError::NoVoices));
    }

    struct OneShot;

    impl SynthesisEngine for OneShot {
        fn voices(&self) -> Vec<VoiceDescriptor> {
            vec![VoiceDescriptor {
                name: "only".into(),
                language: "en".into(),
                variant: None,
                gender: None,
                age: None,
            }]
        }
        fn load(&mut self, _: &str, _: usize, _: &Prosody) -> Result<(), EngineError> {
            Ok(())
        }
        fn process(&mut self, _: Duration, sink: &ChunkSink) -> Result<EngineState, EngineError> {
            let chunk = AudioChunk::from_samples(&[1, 2], 1, 8000, SampleFormat::Le)
                .map_err(|e| EngineError::Synthesis(e.to_string()))?;
            sink.push(chunk);
            Ok(EngineState::Done)
        }
        fn purge(&mut self) {}
    }

    #[test]
    fn closed_session_rejects_everything() {
        let session =
            SynthesisSession::open(Box::new(OneShot), Box::new(Sink), &SessionConfig::default()).unwrap();
        assert_eq!(session.list_voices().unwrap().len(), 1);
        session.close().unwrap();

        assert_eq!(session.status().phase, SessionPhase::Closing);
        assert!(matches!(session.close(), Err(SessionError::Closed)));
        assert!(matches!(session.stop(), Err(SessionError::Closed)));
        assert!(matches!(session.pause(), Err(SessionError::Closed)));
        assert!(matches!(session.list_voices(), Err(SessionError::Closed)));
        assert!(matches!(
            session.speak(b"hi", MessageType::Text, &VoiceParams::default()),
            Err(SessionError::Closed)
        ));
    }

    #[test]
    fn idle_pause_and_stop_are_noops() {
        let session =
            SynthesisSession::open(Box::new(OneShot), Box::new(Sink), &SessionConfig::default()).unwrap();
        session.pause().unwrap();
        session.stop().unwrap();
        session.stop().unwrap();
        assert_eq!(session.status().phase, SessionPhase::Idle);
    }

    #[test]
    fn invalid_params_are_rejected() {
        let session =
            SynthesisSession::open(Box::new(OneShot), Box::new(Sink), &SessionConfig::default()).unwrap();
        let params = VoiceParams {
            rate: 150,
            ..Default::default()
        };
        assert!(matches!(
            session.speak(b"hi", MessageType::Text, &params),
            Err(SessionError::Params(_))
        ));
        assert_eq!(session.status().phase, SessionPhase::Idle);
    }
}
