//! Discards audio while keeping real-time pacing, for headless hosts and tests.

use murmur_core::config::BackendParams;
use murmur_core::types::AudioChunk;

use super::{AudioBackend, BackendError, Interrupt, PlayOutcome};

#[derive(Default)]
pub struct NullBackend {
    interrupt: Interrupt,
}

impl NullBackend {
    pub fn open(_params: &BackendParams) -> Self {
        Self::default()
    }
}

impl AudioBackend for NullBackend {
    fn name(&self) -> &'static str {
        "null"
    }

    fn play(&self, chunk: &AudioChunk) -> Result<PlayOutcome, BackendError> {
        let ticket = self.interrupt.ticket();
        if self.interrupt.sleep(ticket, chunk.duration()) {
            Ok(PlayOutcome::Interrupted)
        } else {
            Ok(PlayOutcome::Completed)
        }
    }

    fn stop(&self) {
        self.interrupt.trigger();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_core::types::SampleFormat;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    #[test]
    fn stop_cuts_playback_short() {
        let backend = Arc::new(NullBackend::default());
        // 10 seconds of mono 8 kHz silence.
        let chunk = AudioChunk::new(SampleFormat::Le, 1, 8000, vec![0; 160_000]).unwrap();

        let stopper = backend.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            stopper.stop();
        });

        let started = Instant::now();
        assert_eq!(backend.play(&chunk).unwrap(), PlayOutcome::Interrupted);
        assert!(started.elapsed() < Duration::from_secs(5));
        t.join().unwrap();
    }

    #[test]
    fn earlier_stop_does_not_affect_later_play() {
        let backend = NullBackend::default();
        backend.stop();
        let chunk = AudioChunk::new(SampleFormat::Le, 1, 8000, vec![0; 16]).unwrap();
        assert_eq!(backend.play(&chunk).unwrap(), PlayOutcome::Completed);
    }
}
