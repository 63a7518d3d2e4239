//! Audio server: Unix socket → frame decoder → the one open device.
//!
//! Runs on its own OS thread with a current-thread tokio runtime. Every loop
//! turn waits for the first of: the close flag, a new connection, or a
//! readable connection. A readable connection gets one non-blocking read; the
//! bytes go to that connection's decoder and every frame they complete is
//! played synchronously, so at most one chunk is ever on the device. A
//! producer that stops mid-frame only parks its own decoder.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;

use futures_util::future::select_all;
use thiserror::Error;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use murmur_core::config::{AudioConfig, DEVICE_VOLUME, ServerConfig};
use murmur_core::protocol::{Frame, ProtocolError};
use murmur_core::types::{AudioChunk, ServerStatus};

use crate::backend::{DeviceHandle, PlayOutcome, PlaybackStopper};
use crate::codec::FrameDecoder;

/// Bytes taken from one connection per loop turn.
const READ_BUF: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot create runtime directory {path}: {source}")]
    RuntimeDir {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot remove stale socket {path}: {source}")]
    StaleSocket {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot bind {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot start server thread: {0}")]
    Spawn(std::io::Error),
    #[error("server thread panicked")]
    Panicked,
}

/// One accepted producer connection.
struct ConnectionRecord {
    stream: UnixStream,
    id: RawFd,
    label: String,
    decoder: FrameDecoder,
}

impl ConnectionRecord {
    fn new(stream: UnixStream) -> Self {
        let id = stream.as_raw_fd();
        let label = match stream.peer_cred().ok().and_then(|c| c.pid()) {
            Some(pid) => format!("pid {pid}"),
            None => format!("conn-{id}"),
        };
        Self {
            stream,
            id,
            label,
            decoder: FrameDecoder::new(),
        }
    }
}

/// What servicing a readable connection left behind.
enum Serviced {
    Open,
    /// The connection is finished; `None` for an orderly close.
    Dropped(Option<ProtocolError>),
    /// The close flag went up between frames.
    Closing,
}

/// Try the configured backends in order, then apply log level and the
/// configured volume. `None` means the server runs degraded.
pub fn open_device(audio: &AudioConfig) -> Option<DeviceHandle> {
    let params = audio.backend_params();
    let mut device = match DeviceHandle::open_first(&audio.output_methods, &params) {
        Ok(device) => device,
        Err(e) => {
            error!("no audio output could be opened ({e}); frames will be discarded");
            return None;
        }
    };
    device.set_loglevel(audio.log_level);
    if let Some(cmd) = device.playcmd() {
        debug!("playing through {cmd}");
    }
    if let Err(e) = device.set_volume(audio.volume) {
        warn!("{e}; using volume {DEVICE_VOLUME}");
        if let Err(e) = device.set_volume(DEVICE_VOLUME) {
            warn!("cannot set device volume: {e}");
        }
    }
    Some(device)
}

pub struct AudioServer;

impl AudioServer {
    /// Open the configured device and start serving on the configured socket.
    pub fn spawn(config: &ServerConfig) -> Result<AudioServerHandle, ServerError> {
        let device = open_device(&config.audio);
        Self::spawn_with_device(config.socket_path(), device)
    }

    /// Start serving on `socket_path` with an already-opened device.
    pub fn spawn_with_device(
        socket_path: PathBuf,
        device: Option<DeviceHandle>,
    ) -> Result<AudioServerHandle, ServerError> {
        if let Some(dir) = socket_path.parent() {
            std::fs::create_dir_all(dir).map_err(|source| ServerError::RuntimeDir {
                path: dir.to_path_buf(),
                source,
            })?;
        }
        match std::fs::remove_file(&socket_path) {
            Ok(()) => debug!("removed stale socket {}", socket_path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(ServerError::StaleSocket {
                    path: socket_path,
                    source,
                });
            }
        }

        let bind_err = |source| ServerError::Bind {
            path: socket_path.clone(),
            source,
        };
        let listener = std::os::unix::net::UnixListener::bind(&socket_path).map_err(bind_err)?;
        listener.set_nonblocking(true).map_err(bind_err)?;

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(ServerError::Spawn)?;

        let (close_tx, close_rx) = watch::channel(false);
        let (status_tx, status_rx) = watch::channel(ServerStatus {
            device: device.as_ref().map(|d| d.name().to_string()),
            ..Default::default()
        });
        let stopper = device.as_ref().map(DeviceHandle::stopper);

        let loop_path = socket_path.clone();
        let thread = std::thread::Builder::new()
            .name("murmur-audio".into())
            .spawn(move || {
                runtime.block_on(async move {
                    let listener = match UnixListener::from_std(listener) {
                        Ok(l) => l,
                        Err(e) => {
                            error!("cannot register listener: {e}");
                            return;
                        }
                    };
                    event_loop(listener, device, close_rx, status_tx).await;
                });
                if let Err(e) = std::fs::remove_file(&loop_path) {
                    debug!("socket cleanup: {e}");
                }
                info!("audio server stopped");
            })
            .map_err(ServerError::Spawn)?;

        info!("audio server listening on {}", socket_path.display());
        Ok(AudioServerHandle {
            close_tx,
            status_rx,
            stopper,
            socket_path,
            thread: Some(thread),
        })
    }
}

/// Control handle for a running audio server. Dropping it shuts the server down.
pub struct AudioServerHandle {
    close_tx: watch::Sender<bool>,
    status_rx: watch::Receiver<ServerStatus>,
    stopper: Option<PlaybackStopper>,
    socket_path: PathBuf,
    thread: Option<JoinHandle<()>>,
}

impl AudioServerHandle {
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn status(&self) -> ServerStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ServerStatus> {
        self.status_rx.clone()
    }

    /// Handle that interrupts the device's current chunk from any thread.
    /// `None` when the server runs degraded.
    pub fn stopper(&self) -> Option<PlaybackStopper> {
        self.stopper.clone()
    }

    /// Interrupt the chunk currently playing, if any.
    pub fn stop_playback(&self) {
        if let Some(stopper) = &self.stopper {
            stopper.stop();
        }
    }

    /// Set the close flag, interrupt playback and wait for the loop to exit.
    pub fn shutdown(mut self) -> Result<(), ServerError> {
        self.finish()
    }

    fn finish(&mut self) -> Result<(), ServerError> {
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        let _ = self.close_tx.send(true);
        self.stop_playback();
        thread.join().map_err(|_| ServerError::Panicked)
    }
}

impl Drop for AudioServerHandle {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            warn!("audio server shutdown: {e}");
        }
    }
}

fn update_status(tx: &watch::Sender<ServerStatus>, f: impl FnOnce(&mut ServerStatus)) {
    tx.send_modify(f);
}

/// Resolves with the id of the first readable connection; never resolves
/// while there are none.
async fn next_readable(connections: &HashMap<RawFd, ConnectionRecord>) -> RawFd {
    if connections.is_empty() {
        return std::future::pending().await;
    }
    let waits = connections.values().map(|rec| {
        Box::pin(async move {
            if let Err(e) = rec.stream.readable().await {
                debug!("{}: readiness failed: {e}", rec.label);
            }
            rec.id
        })
    });
    select_all(waits).await.0
}

async fn event_loop(
    listener: UnixListener,
    mut device: Option<DeviceHandle>,
    mut close_rx: watch::Receiver<bool>,
    status_tx: watch::Sender<ServerStatus>,
) {
    let mut connections: HashMap<RawFd, ConnectionRecord> = HashMap::new();
    let mut buf = vec![0u8; READ_BUF];

    loop {
        if *close_rx.borrow() {
            break;
        }

        tokio::select! {
            biased;

            changed = close_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }

            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    let record = ConnectionRecord::new(stream);
                    info!("{}: connected", record.label);
                    connections.insert(record.id, record);
                    update_status(&status_tx, |s| {
                        s.connections = connections.len();
                        s.accepted += 1;
                    });
                }
                Err(e) => warn!("accept failed: {e}"),
            },

            id = next_readable(&connections) => {
                let Some(record) = connections.get_mut(&id) else {
                    continue;
                };
                let outcome = service(record, &mut buf, device.as_ref(), &close_rx, &status_tx);
                match outcome {
                    Serviced::Open => {}
                    Serviced::Closing => break,
                    Serviced::Dropped(reason) => {
                        match reason {
                            None | Some(ProtocolError::Disconnected) => {
                                info!("{}: disconnected", record.label)
                            }
                            Some(e) => warn!("{}: dropping connection: {e}", record.label),
                        }
                        // Removing by value closes the descriptor exactly once.
                        drop(connections.remove(&id));
                        update_status(&status_tx, |s| s.connections = connections.len());
                    }
                }
            }
        }
    }

    info!("audio server shutting down ({} connections)", connections.len());
    drop(listener);
    connections.clear();
    if let Some(device) = device.take() {
        if let Err(e) = device.close() {
            warn!("closing audio device: {e}");
        }
    }
    update_status(&status_tx, |s| {
        s.connections = 0;
        s.device = None;
    });
}

/// Take what a readable connection has ready without blocking, and play every
/// frame it completes.
fn service(
    record: &mut ConnectionRecord,
    buf: &mut [u8],
    device: Option<&DeviceHandle>,
    close_rx: &watch::Receiver<bool>,
    status_tx: &watch::Sender<ServerStatus>,
) -> Serviced {
    let n = match record.stream.try_read(buf) {
        Ok(0) => {
            return match record.decoder.eof_error() {
                ProtocolError::Disconnected => Serviced::Dropped(None),
                e => Serviced::Dropped(Some(e)),
            };
        }
        Ok(n) => n,
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return Serviced::Open,
        Err(e) if e.kind() == std::io::ErrorKind::Interrupted => return Serviced::Open,
        Err(e) => return Serviced::Dropped(Some(e.into())),
    };

    let mut input = &buf[..n];
    while let Some(decoded) = record.decoder.decode(&mut input) {
        match decoded {
            Ok(Frame::Ack) => debug!("{}: keep-alive", record.label),
            Ok(Frame::Chunk(chunk)) => {
                if *close_rx.borrow() {
                    return Serviced::Closing;
                }
                if play(device, chunk, &record.label) {
                    update_status(status_tx, |s| s.chunks_played += 1);
                }
            }
            Err(e) if e.is_fatal() => return Serviced::Dropped(Some(e)),
            Err(e) => warn!("{}: {e}", record.label),
        }
    }
    Serviced::Open
}

/// Play one decoded chunk. Returns whether it reached the device.
fn play(device: Option<&DeviceHandle>, chunk: AudioChunk, label: &str) -> bool {
    let Some(device) = device else {
        debug!("{label}: no device, discarding {} samples", chunk.num_samples());
        return false;
    };
    debug!(
        "{label}: playing {} samples at {} Hz",
        chunk.num_samples(),
        chunk.sample_rate
    );
    match device.play(chunk) {
        Ok(PlayOutcome::Completed) => true,
        Ok(PlayOutcome::Interrupted) => {
            debug!("{label}: playback interrupted");
            true
        }
        Err(e) => {
            warn!("{label}: playback failed: {e}");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::NullBackend;
    use murmur_core::protocol::write_frame;
    use std::io::Write;
    use std::os::unix::net::UnixStream as StdStream;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    async fn wait_for(
        rx: &mut watch::Receiver<ServerStatus>,
        f: impl Fn(&ServerStatus) -> bool,
    ) -> ServerStatus {
        tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| f(s)))
            .await
            .expect("status never matched")
            .expect("server gone")
            .clone()
    }

    #[tokio::test]
    async fn plays_frames_and_tracks_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio.sock");
        let device = DeviceHandle::new(Arc::new(NullBackend::default()));
        let server = AudioServer::spawn_with_device(path.clone(), Some(device)).unwrap();
        let mut status = server.subscribe_status();
        assert_eq!(server.status().device.as_deref(), Some("null"));

        let mut client = StdStream::connect(&path).unwrap();
        let chunk = AudioChunk::new(murmur_core::types::SampleFormat::Le, 1, 8000, vec![0; 16]).unwrap();
        write_frame(&mut client, &chunk).unwrap();
        write_frame(&mut client, &chunk).unwrap();

        let s = wait_for(&mut status, |s| s.chunks_played == 2).await;
        assert_eq!(s.connections, 1);

        drop(client);
        wait_for(&mut status, |s| s.connections == 0).await;
        server.shutdown().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn malformed_header_keeps_connection() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio.sock");
        let device = DeviceHandle::new(Arc::new(NullBackend::default()));
        let server = AudioServer::spawn_with_device(path.clone(), Some(device)).unwrap();
        let mut status = server.subscribe_status();

        let mut client = StdStream::connect(&path).unwrap();
        client.write_all(b"not a header\r\n").unwrap();
        let chunk = AudioChunk::new(murmur_core::types::SampleFormat::Le, 1, 8000, vec![0; 4]).unwrap();
        write_frame(&mut client, &chunk).unwrap();

        let s = wait_for(&mut status, |s| s.chunks_played == 1).await;
        assert_eq!(s.connections, 1);
        server.shutdown().unwrap();
    }

    #[tokio::test]
    async fn degraded_mode_discards_frames() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio.sock");
        let server = AudioServer::spawn_with_device(path.clone(), None).unwrap();
        let mut status = server.subscribe_status();
        assert_eq!(server.status().device, None);

        let mut client = StdStream::connect(&path).unwrap();
        let chunk = AudioChunk::new(murmur_core::types::SampleFormat::Le, 1, 8000, vec![0; 4]).unwrap();
        write_frame(&mut client, &chunk).unwrap();
        drop(client);

        let s = wait_for(&mut status, |s| s.connections == 0).await;
        assert_eq!(s.chunks_played, 0);
        server.shutdown().unwrap();
    }

    #[test]
    fn configured_volume_reaches_the_device() {
        let audio = AudioConfig {
            output_methods: vec!["null".into()],
            volume: 40,
            ..Default::default()
        };
        assert_eq!(open_device(&audio).unwrap().volume(), 40);

        let out_of_range = AudioConfig {
            volume: 250,
            ..audio
        };
        assert_eq!(open_device(&out_of_range).unwrap().volume(), DEVICE_VOLUME);
    }

    #[test]
    fn stale_socket_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio.sock");
        std::fs::write(&path, b"stale").unwrap();
        let server = AudioServer::spawn_with_device(path.clone(), None).unwrap();
        assert!(StdStream::connect(&path).is_ok());
        drop(server);
        assert!(!path.exists());
    }

    #[test]
    fn shutdown_interrupts_long_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audio.sock");
        let device = DeviceHandle::new(Arc::new(NullBackend::default()));
        let server = AudioServer::spawn_with_device(path.clone(), Some(device)).unwrap();

        // 30 seconds of audio.
        let mut client = StdStream::connect(&path).unwrap();
        let chunk = AudioChunk::new(murmur_core::types::SampleFormat::Le, 1, 8000, vec![0; 480_000]).unwrap();
        write_frame(&mut client, &chunk).unwrap();
        std::thread::sleep(Duration::from_millis(100));

        let started = Instant::now();
        server.shutdown().unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}
