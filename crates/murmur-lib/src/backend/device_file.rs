//! Raw writes to a character device or plain file (OSS style `/dev/dsp`).

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};

use murmur_core::config::BackendParams;
use murmur_core::types::AudioChunk;

use super::{AudioBackend, BackendError, Interrupt, PlayOutcome};

const DEFAULT_DEVICE: &str = "/dev/dsp";
const BLOCK: usize = 4096;

pub struct DeviceFileBackend {
    file: Mutex<Option<File>>,
    interrupt: Interrupt,
}

impl DeviceFileBackend {
    pub fn open(params: &BackendParams) -> Result<Self, BackendError> {
        let path = PathBuf::from(params.device.as_deref().unwrap_or(DEFAULT_DEVICE));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| BackendError::Open {
                backend: "file",
                reason: format!("{}: {e}", path.display()),
            })?;
        Ok(Self {
            file: Mutex::new(Some(file)),
            interrupt: Interrupt::default(),
        })
    }
}

impl AudioBackend for DeviceFileBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn play(&self, chunk: &AudioChunk) -> Result<PlayOutcome, BackendError> {
        let ticket = self.interrupt.ticket();
        let mut guard = self.file.lock().unwrap_or_else(PoisonError::into_inner);
        let file = guard.as_mut().ok_or(BackendError::Closed)?;
        for block in chunk.data.chunks(BLOCK) {
            if self.interrupt.fired(ticket) {
                file.flush()?;
                return Ok(PlayOutcome::Interrupted);
            }
            file.write_all(block)?;
        }
        file.flush()?;
        Ok(PlayOutcome::Completed)
    }

    fn stop(&self) {
        self.interrupt.trigger();
    }

    fn close(&self) -> Result<(), BackendError> {
        let file = self.file.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(file) = file {
            file.sync_all().or_else(|e| {
                // Character devices commonly refuse fsync.
                if e.kind() == std::io::ErrorKind::InvalidInput {
                    Ok(())
                } else {
                    Err(e)
                }
            })?;
        }
        Ok(())
    }
}
