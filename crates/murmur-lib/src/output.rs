//! Where a session's audio goes: an in-process device or the audio server.

use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::debug;

use murmur_core::protocol::write_frame;
use murmur_core::types::AudioChunk;

use crate::backend::{BackendError, DeviceHandle, Interrupt, PlayOutcome, PlaybackStopper};

#[derive(Debug, Error)]
pub enum OutputError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("cannot connect to audio server at {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("sending audio failed: {0}")]
    Send(#[from] std::io::Error),
}

pub trait AudioOutput: Send {
    /// Hand one chunk to the output, blocking until it has been accepted.
    fn deliver(&mut self, chunk: AudioChunk) -> Result<PlayOutcome, OutputError>;

    /// Handle that can cut short a `deliver` in progress, when the output
    /// supports it.
    fn stopper(&self) -> Option<PlaybackStopper>;
}

/// Plays directly on a device owned by the session.
pub struct LocalOutput {
    device: DeviceHandle,
}

impl LocalOutput {
    pub fn new(device: DeviceHandle) -> Self {
        Self { device }
    }
}

impl AudioOutput for LocalOutput {
    fn deliver(&mut self, chunk: AudioChunk) -> Result<PlayOutcome, OutputError> {
        Ok(self.device.play(chunk)?)
    }

    fn stopper(&self) -> Option<PlaybackStopper> {
        Some(self.device.stopper())
    }
}

/// Streams frames to an audio server over its Unix socket.
///
/// `deliver` blocks for the chunk's playing time after sending it, so only
/// one chunk per session is ever in flight to the server. Its stopper cuts
/// that wait short and, when the server runs in this process, also the chunk
/// on the server's device.
pub struct SocketOutput {
    stream: UnixStream,
    interrupt: Arc<Interrupt>,
    server: Option<PlaybackStopper>,
}

impl SocketOutput {
    pub fn connect(path: &Path) -> Result<Self, OutputError> {
        let stream = UnixStream::connect(path).map_err(|source| OutputError::Connect {
            path: path.to_path_buf(),
            source,
        })?;
        debug!("connected to audio server at {}", path.display());
        Ok(Self {
            stream,
            interrupt: Arc::new(Interrupt::default()),
            server: None,
        })
    }

    /// Also stop the server's device when this output is stopped.
    pub fn with_server_stopper(mut self, stopper: PlaybackStopper) -> Self {
        self.server = Some(stopper);
        self
    }
}

impl AudioOutput for SocketOutput {
    fn deliver(&mut self, chunk: AudioChunk) -> Result<PlayOutcome, OutputError> {
        let ticket = self.interrupt.ticket();
        write_frame(&mut self.stream, &chunk)?;
        if self.interrupt.sleep(ticket, chunk.duration()) {
            Ok(PlayOutcome::Interrupted)
        } else {
            Ok(PlayOutcome::Completed)
        }
    }

    fn stopper(&self) -> Option<PlaybackStopper> {
        let interrupt = self.interrupt.clone();
        let local = PlaybackStopper::new(move || interrupt.trigger());
        Some(match &self.server {
            Some(server) => local.chain(server.clone()),
            None => local,
        })
    }
}
