//! Playback through an external player fed raw PCM on stdin.
//!
//! Defaults to `aplay`; `BackendParams::server` names another binary that
//! accepts the same flags. One player process stays up while the sample
//! format is unchanged and is fed chunk after chunk, so consecutive chunks
//! play without a gap. It is replaced on a format change and killed on stop.

use std::io::Write;
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use murmur_core::config::BackendParams;
use murmur_core::types::{AudioChunk, SampleFormat};

use super::{AudioBackend, BackendError, Interrupt, Pacer, PlayOutcome};

const DEFAULT_PLAYER: &str = "aplay";
const POLL: Duration = Duration::from_millis(10);

/// A running player and the format it was started for.
struct Player {
    child: Child,
    /// Taken while a chunk is being written; `None` once closed for draining.
    stdin: Option<ChildStdin>,
    channels: u16,
    sample_rate: u32,
}

impl Player {
    fn plays(&self, chunk: &AudioChunk) -> bool {
        self.channels == chunk.channels && self.sample_rate == chunk.sample_rate
    }

    fn kill(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[derive(Default)]
struct Running {
    player: Option<Player>,
    pacer: Pacer,
}

pub struct CommandBackend {
    player: String,
    device: Option<String>,
    buffer_ms: Option<u32>,
    loglevel: AtomicU8,
    running: Mutex<Running>,
    interrupt: Interrupt,
}

impl CommandBackend {
    pub fn open(params: &BackendParams) -> Result<Self, BackendError> {
        let player = params
            .server
            .clone()
            .unwrap_or_else(|| DEFAULT_PLAYER.to_string());

        let version = Command::new(&player)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if let Err(e) = version {
            return Err(BackendError::Open {
                backend: "command",
                reason: format!("{player}: {e}"),
            });
        }
        Ok(Self::new(player, params))
    }

    fn new(player: String, params: &BackendParams) -> Self {
        Self {
            player,
            device: params.device.clone(),
            buffer_ms: params.min_buffer_len,
            loglevel: AtomicU8::new(3),
            running: Mutex::new(Running::default()),
            interrupt: Interrupt::default(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Running> {
        self.running.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn command(&self, chunk: &AudioChunk) -> Command {
        let mut cmd = Command::new(&self.player);
        cmd.args(["-t", "raw", "-f", "S16_LE"])
            .arg("-c")
            .arg(chunk.channels.to_string())
            .arg("-r")
            .arg(chunk.sample_rate.to_string());
        if self.loglevel.load(Ordering::Relaxed) < 4 {
            cmd.arg("-q");
        }
        if let Some(device) = &self.device {
            cmd.arg("-D").arg(device);
        }
        if let Some(ms) = self.buffer_ms {
            cmd.arg("-B").arg((u64::from(ms) * 1000).to_string());
        }
        cmd.arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }

    fn spawn(&self, chunk: &AudioChunk) -> Result<Player, BackendError> {
        debug!(
            "starting {} for {} ch at {} Hz",
            self.player, chunk.channels, chunk.sample_rate
        );
        let mut child = self.command(chunk).spawn()?;
        let stdin = child.stdin.take();
        Ok(Player {
            child,
            stdin,
            channels: chunk.channels,
            sample_rate: chunk.sample_rate,
        })
    }

    /// Close the stdin of a player started for another format and wait for
    /// it to play out and exit. Returns whether a stop cut the wait short.
    fn retire_other_format(&self, chunk: &AudioChunk, ticket: u64) -> Result<bool, BackendError> {
        {
            let mut running = self.lock();
            match running.player.as_mut() {
                Some(player) if !player.plays(chunk) => {
                    debug!("{}: format change, draining", self.player);
                    player.stdin = None;
                }
                _ => return Ok(false),
            }
        }
        loop {
            {
                let mut running = self.lock();
                let Some(player) = running.player.as_mut() else {
                    return Ok(self.interrupt.fired(ticket));
                };
                if player.child.try_wait()?.is_some() {
                    running.player = None;
                    running.pacer.reset();
                    return Ok(false);
                }
            }
            if self.interrupt.sleep(ticket, POLL) {
                return Ok(true);
            }
        }
    }

    /// Take the stdin of a player for this chunk's format, starting one when
    /// needed. `None` means a stop arrived first.
    fn writer(&self, chunk: &AudioChunk, ticket: u64) -> Result<Option<ChildStdin>, BackendError> {
        let mut running = self.lock();
        if self.interrupt.fired(ticket) {
            return Ok(None);
        }
        if let Some(player) = running.player.as_mut() {
            if let Some(status) = player.child.try_wait()? {
                warn!("{} exited with {status}, restarting", self.player);
                running.player = None;
                running.pacer.reset();
            }
        }
        if running.player.is_none() {
            running.player = Some(self.spawn(chunk)?);
            running.pacer.reset();
        }
        running
            .player
            .as_mut()
            .and_then(|p| p.stdin.take())
            .map(Some)
            .ok_or_else(|| BackendError::Playback(format!("{} has no stdin", self.player)))
    }
}

impl AudioBackend for CommandBackend {
    fn name(&self) -> &'static str {
        "command"
    }

    fn native_format(&self) -> SampleFormat {
        SampleFormat::Le
    }

    fn play(&self, chunk: &AudioChunk) -> Result<PlayOutcome, BackendError> {
        if chunk.is_empty() {
            return Ok(PlayOutcome::Completed);
        }
        let ticket = self.interrupt.ticket();

        if self.retire_other_format(chunk, ticket)? {
            return Ok(PlayOutcome::Interrupted);
        }
        let Some(mut stdin) = self.writer(chunk, ticket)? else {
            return Ok(PlayOutcome::Interrupted);
        };

        // Written without the lock, so `stop` can kill a player that is not
        // reading. A broken pipe then just means it was killed.
        let written = stdin.write_all(&chunk.data);
        let due = {
            let mut running = self.lock();
            if self.interrupt.fired(ticket) {
                return Ok(PlayOutcome::Interrupted);
            }
            if let Err(e) = written {
                if let Some(player) = running.player.take() {
                    player.kill();
                }
                running.pacer.reset();
                return Err(BackendError::Playback(format!("{}: {e}", self.player)));
            }
            if let Some(player) = running.player.as_mut() {
                player.stdin = Some(stdin);
            }
            running.pacer.queue(Instant::now(), chunk.duration())
        };

        if self.interrupt.sleep(ticket, due.saturating_duration_since(Instant::now())) {
            Ok(PlayOutcome::Interrupted)
        } else {
            Ok(PlayOutcome::Completed)
        }
    }

    fn stop(&self) {
        self.interrupt.trigger();
        let mut running = self.lock();
        running.pacer.reset();
        if let Some(player) = running.player.take() {
            debug!("killing {}", self.player);
            player.kill();
        }
    }

    fn close(&self) -> Result<(), BackendError> {
        self.stop();
        Ok(())
    }

    fn set_loglevel(&self, level: u8) {
        self.loglevel.store(level, Ordering::Relaxed);
    }

    fn playcmd(&self) -> Option<&str> {
        Some(&self.player)
    }
}
