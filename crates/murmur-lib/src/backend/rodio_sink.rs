//! rodio output. The `OutputStream` is `!Send`, so it lives on a dedicated
//! playback thread driven over a command channel.
//!
//! Chunks are appended to one sink and `play` returns shortly before the
//! queued audio runs out, so the next chunk lands in the sink while the
//! current one is still sounding.

use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use cpal::traits::{DeviceTrait, HostTrait};
use rodio::buffer::SamplesBuffer;
use rodio::{OutputStream, OutputStreamHandle, Sink};
use tracing::{debug, error, warn};

use murmur_core::config::BackendParams;
use murmur_core::types::AudioChunk;

use super::{AudioBackend, BackendError, Interrupt, Pacer, PlayOutcome};

const POLL: Duration = Duration::from_millis(10);

enum SinkCmd {
    Play {
        samples: Vec<i16>,
        channels: u16,
        sample_rate: u32,
        duration: Duration,
        ticket: u64,
        done: Sender<PlayOutcome>,
    },
    Stop,
    Close,
}

pub struct RodioBackend {
    cmd_tx: Sender<SinkCmd>,
    interrupt: Arc<Interrupt>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl RodioBackend {
    pub fn open(params: &BackendParams) -> Result<Self, BackendError> {
        let (cmd_tx, cmd_rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::channel();
        let interrupt = Arc::new(Interrupt::default());
        let device = params.device.clone();
        let thread_interrupt = interrupt.clone();

        let thread = std::thread::Builder::new()
            .name("murmur-rodio".into())
            .spawn(move || playback_thread(device, cmd_rx, ready_tx, thread_interrupt))?;

        match ready_rx.recv() {
            Ok(Ok(())) => Ok(Self {
                cmd_tx,
                interrupt,
                thread: Mutex::new(Some(thread)),
            }),
            Ok(Err(reason)) => {
                let _ = thread.join();
                Err(BackendError::Open {
                    backend: "rodio",
                    reason,
                })
            }
            Err(_) => Err(BackendError::Open {
                backend: "rodio",
                reason: "playback thread exited during startup".into(),
            }),
        }
    }
}

impl AudioBackend for RodioBackend {
    fn name(&self) -> &'static str {
        "rodio"
    }

    fn play(&self, chunk: &AudioChunk) -> Result<PlayOutcome, BackendError> {
        if chunk.is_empty() {
            return Ok(PlayOutcome::Completed);
        }
        let ticket = self.interrupt.ticket();
        let (done_tx, done_rx) = mpsc::channel();
        self.cmd_tx
            .send(SinkCmd::Play {
                samples: chunk.samples(),
                channels: chunk.channels,
                sample_rate: chunk.sample_rate,
                duration: chunk.duration(),
                ticket,
                done: done_tx,
            })
            .map_err(|_| BackendError::Closed)?;
        done_rx
            .recv()
            .map_err(|_| BackendError::Playback("playback thread went away".into()))
    }

    fn stop(&self) {
        self.interrupt.trigger();
        let _ = self.cmd_tx.send(SinkCmd::Stop);
    }

    fn close(&self) -> Result<(), BackendError> {
        let _ = self.cmd_tx.send(SinkCmd::Close);
        let thread = self
            .thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(thread) = thread {
            if thread.join().is_err() {
                return Err(BackendError::Playback("playback thread panicked".into()));
            }
        }
        Ok(())
    }
}

fn open_stream(device: Option<&str>) -> Result<(OutputStream, OutputStreamHandle), String> {
    let Some(wanted) = device else {
        return OutputStream::try_default().map_err(|e| e.to_string());
    };
    let host = cpal::default_host();
    let found = host
        .output_devices()
        .map_err(|e| e.to_string())?
        .find(|d| d.name().is_ok_and(|n| n == wanted));
    match found {
        Some(dev) => OutputStream::try_from_device(&dev).map_err(|e| e.to_string()),
        None => Err(format!("no output device named {wanted:?}")),
    }
}

struct Active {
    ticket: u64,
    due: Instant,
    done: Sender<PlayOutcome>,
}

fn playback_thread(
    device: Option<String>,
    cmd_rx: Receiver<SinkCmd>,
    ready_tx: Sender<Result<(), String>>,
    interrupt: Arc<Interrupt>,
) {
    let (_stream, handle) = match open_stream(device.as_deref()) {
        Ok(pair) => pair,
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };
    let mut sink = match Sink::try_new(&handle) {
        Ok(sink) => sink,
        Err(e) => {
            let _ = ready_tx.send(Err(e.to_string()));
            return;
        }
    };
    let _ = ready_tx.send(Ok(()));

    let mut active: Option<Active> = None;
    let mut pacer = Pacer::default();

    loop {
        let cmd = if active.is_some() {
            match cmd_rx.recv_timeout(POLL) {
                Ok(cmd) => Some(cmd),
                Err(RecvTimeoutError::Timeout) => None,
                Err(RecvTimeoutError::Disconnected) => Some(SinkCmd::Close),
            }
        } else {
            Some(cmd_rx.recv().unwrap_or(SinkCmd::Close))
        };

        match cmd {
            None => {}
            Some(SinkCmd::Play {
                samples,
                channels,
                sample_rate,
                duration,
                ticket,
                done,
            }) => {
                if interrupt.fired(ticket) {
                    let _ = done.send(PlayOutcome::Interrupted);
                    continue;
                }
                let due = pacer.queue(Instant::now(), duration);
                sink.append(SamplesBuffer::new(channels, sample_rate, samples));
                sink.play();
                active = Some(Active { ticket, due, done });
            }
            Some(SinkCmd::Stop) => {
                pacer.reset();
                let play = active.take();
                // Audio queued ahead of a finished play still has to go.
                if play.is_some() || !sink.empty() {
                    debug!("rodio: stopping playback");
                    sink.stop();
                    match Sink::try_new(&handle) {
                        Ok(fresh) => sink = fresh,
                        Err(e) => {
                            error!("rodio: cannot recreate sink: {e}");
                            if let Some(play) = play {
                                let _ = play.done.send(PlayOutcome::Interrupted);
                            }
                            return;
                        }
                    }
                }
                if let Some(play) = play {
                    let _ = play.done.send(PlayOutcome::Interrupted);
                }
            }
            Some(SinkCmd::Close) => {
                sink.stop();
                if let Some(play) = active.take() {
                    warn!("rodio: closed during playback");
                    let _ = play.done.send(PlayOutcome::Interrupted);
                }
                break;
            }
        }

        if let Some(play) = &active {
            if interrupt.fired(play.ticket) {
                // Stop command is still queued behind us; let it clean up.
                continue;
            }
            if sink.empty() || Instant::now() >= play.due {
                if let Some(play) = active.take() {
                    let _ = play.done.send(PlayOutcome::Completed);
                }
            }
        }
    }
}
