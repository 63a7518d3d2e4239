//! Audio output backends and the exclusive device handle.
//!
//! A backend is one output technology behind the [`AudioBackend`] trait.
//! Backends are picked by name through [`open_backend`]; the server tries its
//! configured list in order and keeps the first one that opens, wrapped in a
//! [`DeviceHandle`].
//!
//! `play` blocks until the device has consumed the chunk. `stop` may be called
//! from any other thread while `play` is blocked and makes it return
//! [`PlayOutcome::Interrupted`]. Stops are epoch-based: a stop only affects the
//! play that is in progress when it is issued, never a later one.

pub mod command;
pub mod device_file;
pub mod null;
pub mod rodio_sink;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use murmur_core::config::BackendParams;
use murmur_core::pcm::apply_volume;
use murmur_core::types::{AudioChunk, PARAM_MAX, RangeError, SampleFormat, check_range};

pub use command::CommandBackend;
pub use device_file::DeviceFileBackend;
pub use null::NullBackend;
pub use rodio_sink::RodioBackend;

/// Names accepted by [`open_backend`].
pub const BACKENDS: &[&str] = &["rodio", "command", "file", "null"];

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("unknown audio backend {0:?}")]
    Unknown(String),
    #[error("no audio backend configured")]
    NoneConfigured,
    #[error("cannot open {backend}: {reason}")]
    Open {
        backend: &'static str,
        reason: String,
    },
    #[error("invalid volume: {0}")]
    Volume(#[from] RangeError),
    #[error("playback failed: {0}")]
    Playback(String),
    #[error("device is closed")]
    Closed,
    #[error("device I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// How a blocking `play` ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlayOutcome {
    /// The device consumed the whole chunk.
    Completed,
    /// A concurrent `stop` cut playback short.
    Interrupted,
}

/// One audio output technology.
pub trait AudioBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Sample byte order the device accepts.
    fn native_format(&self) -> SampleFormat {
        SampleFormat::native()
    }

    /// Play `chunk`, blocking until it has been consumed or interrupted.
    fn play(&self, chunk: &AudioChunk) -> Result<PlayOutcome, BackendError>;

    /// Interrupt the play in progress. No-op when nothing is playing.
    fn stop(&self);

    /// Release the device. Callers must not have a `play` running.
    fn close(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn set_loglevel(&self, _level: u8) {}

    /// External command used for playback, if the backend shells out.
    fn playcmd(&self) -> Option<&str> {
        None
    }
}

/// Open the backend registered under `name`.
pub fn open_backend(
    name: &str,
    params: &BackendParams,
) -> Result<Arc<dyn AudioBackend>, BackendError> {
    debug!("opening audio backend {name}");
    let backend: Arc<dyn AudioBackend> = match name {
        "rodio" => Arc::new(RodioBackend::open(params)?),
        "command" => Arc::new(CommandBackend::open(params)?),
        "file" => Arc::new(DeviceFileBackend::open(params)?),
        "null" => Arc::new(NullBackend::open(params)),
        other => return Err(BackendError::Unknown(other.to_string())),
    };
    Ok(backend)
}

// ─── Interrupt ────────────────────────────────────────────────────────────

/// Epoch counter plus a condvar so blocked plays can wait on it.
#[derive(Debug, Default)]
pub(crate) struct Interrupt {
    epoch: AtomicU64,
    lock: Mutex<()>,
    wake: Condvar,
}

impl Interrupt {
    /// Snapshot taken at the start of a play.
    pub(crate) fn ticket(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub(crate) fn trigger(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.wake.notify_all();
    }

    pub(crate) fn fired(&self, ticket: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) != ticket
    }

    /// Sleep for `timeout` unless interrupted first. Returns whether the
    /// interrupt fired.
    pub(crate) fn sleep(&self, ticket: u64, timeout: Duration) -> bool {
        let guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let _ = self
            .wake
            .wait_timeout_while(guard, timeout, |_| !self.fired(ticket))
            .unwrap_or_else(PoisonError::into_inner);
        self.fired(ticket)
    }
}

// ─── Pacer ────────────────────────────────────────────────────────────────

/// How far ahead of the queued audio running out a buffered backend asks for
/// the next chunk.
pub(crate) const REFILL_LEAD: Duration = Duration::from_millis(100);

/// Estimates when audio queued on a buffered device (a player pipe, a rodio
/// sink) runs out, so `play` can block for its chunk without letting the
/// device drain between chunks.
#[derive(Debug, Default)]
pub(crate) struct Pacer {
    queued_until: Option<Instant>,
}

impl Pacer {
    /// Account for `duration` more audio queued at `now`. Returns when the
    /// caller should return from `play`: `REFILL_LEAD` before the queue runs
    /// dry, and never before `now`.
    pub(crate) fn queue(&mut self, now: Instant, duration: Duration) -> Instant {
        let start = self.queued_until.filter(|t| *t > now).unwrap_or(now);
        let end = start + duration;
        self.queued_until = Some(end);
        end.checked_sub(REFILL_LEAD).map_or(now, |t| t.max(now))
    }

    /// The device queue was dropped.
    pub(crate) fn reset(&mut self) {
        self.queued_until = None;
    }
}

// ─── Device handle ────────────────────────────────────────────────────────

/// The one open backend of a server process.
///
/// Applies endianness conversion and volume before handing chunks to the
/// backend. Closing consumes the handle, so the device is released once.
pub struct DeviceHandle {
    backend: Arc<dyn AudioBackend>,
    native: SampleFormat,
    volume: i32,
    closed: bool,
}

impl DeviceHandle {
    pub fn new(backend: Arc<dyn AudioBackend>) -> Self {
        let native = backend.native_format();
        Self {
            backend,
            native,
            volume: PARAM_MAX,
            closed: false,
        }
    }

    pub fn open(name: &str, params: &BackendParams) -> Result<Self, BackendError> {
        open_backend(name, params).map(Self::new)
    }

    /// Try each backend in order and keep the first that opens.
    ///
    /// Returns the last error when none does.
    pub fn open_first(methods: &[String], params: &BackendParams) -> Result<Self, BackendError> {
        let mut last_err = BackendError::NoneConfigured;
        for name in methods {
            match Self::open(name, params) {
                Ok(handle) => {
                    info!("using {name} audio output");
                    return Ok(handle);
                }
                Err(e) => {
                    warn!("audio output {name} unavailable: {e}");
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    pub fn name(&self) -> &'static str {
        self.backend.name()
    }

    pub fn native_format(&self) -> SampleFormat {
        self.native
    }

    pub fn volume(&self) -> i32 {
        self.volume
    }

    /// Set the device volume. Out-of-range values are rejected and the
    /// previous volume is kept.
    pub fn set_volume(&mut self, volume: i32) -> Result<(), BackendError> {
        self.volume = check_range("volume", volume)?;
        Ok(())
    }

    /// Forward a log level to the backend. Zero means "leave unchanged".
    pub fn set_loglevel(&self, level: u8) {
        if level > 0 {
            self.backend.set_loglevel(level);
        }
    }

    pub fn playcmd(&self) -> Option<&str> {
        self.backend.playcmd()
    }

    /// Play one chunk, converting it to the device byte order first.
    pub fn play(&self, mut chunk: AudioChunk) -> Result<PlayOutcome, BackendError> {
        if self.closed {
            return Err(BackendError::Closed);
        }
        let swapped = chunk.convert_to(self.native);
        if swapped > 0 {
            debug!("swapped {swapped} samples to device byte order");
        }
        apply_volume(&mut chunk.data, self.native, self.volume);
        self.backend.play(&chunk)
    }

    pub fn stop(&self) {
        self.backend.stop();
    }

    /// A cloneable handle that can interrupt playback from another thread.
    ///
    /// Holds the backend alive, so stopping after the handle closed is a no-op
    /// rather than a use of a released device.
    pub fn stopper(&self) -> PlaybackStopper {
        let backend = self.backend.clone();
        PlaybackStopper::new(move || backend.stop())
    }

    pub fn close(mut self) -> Result<(), BackendError> {
        self.closed = true;
        self.backend.close()
    }
}

impl Drop for DeviceHandle {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            if let Err(e) = self.backend.close() {
                warn!("closing {} failed: {e}", self.backend.name());
            }
        }
    }
}

/// Interrupts the current play of a device or output from any thread.
#[derive(Clone)]
pub struct PlaybackStopper {
    stop: Arc<dyn Fn() + Send + Sync>,
}

impl PlaybackStopper {
    pub fn new(stop: impl Fn() + Send + Sync + 'static) -> Self {
        Self {
            stop: Arc::new(stop),
        }
    }

    pub fn stop(&self) {
        (self.stop)();
    }

    /// A stopper that fires `self`, then `other`.
    pub fn chain(self, other: PlaybackStopper) -> Self {
        Self::new(move || {
            self.stop();
            other.stop();
        })
    }
}
