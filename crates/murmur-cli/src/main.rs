//! murmur CLI: speech audio daemon and its client commands.
//!
//! ```text
//! murmur serve [--output-methods rodio,command] [--port 2003] [--local]
//! murmur send speech.wav [--runtime-dir ...]
//! murmur speak "hello world" [--url http://localhost:2003]
//! murmur stop / pause / status / voices [--url ...]
//! ```

use std::error::Error;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use murmur_core::config::{AudioConfig, DEVICE_VOLUME, ServerConfig, SessionConfig};
use murmur_core::pcm::parse_wav_header;
use murmur_core::protocol::write_frame;
use murmur_core::types::{AudioChunk, BITS_PER_SAMPLE, SampleFormat};
use murmur_lib::backend::BACKENDS;
use murmur_lib::kokoro::{KokoroConfig, KokoroEngine};
use murmur_lib::output::{AudioOutput, LocalOutput, SocketOutput};
use murmur_lib::server::{AudioServer, AudioServerHandle, open_device};
use murmur_lib::session::SynthesisSession;

type CliResult<T = ()> = Result<T, Box<dyn Error + Send + Sync>>;

const DEFAULT_URL: &str = "http://localhost:2003";

/// Frames sent per second of audio by `murmur send`.
const SEND_FRAMES_PER_SEC: u32 = 10;

/// murmur: speech audio delivery daemon
#[derive(Parser)]
#[command(name = "murmur", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the audio server, a Kokoro synthesis session and the control API
    Serve {
        /// Listen port for the control API
        #[arg(long, default_value = "2003")]
        port: u16,
        /// Listen host for the control API
        #[arg(long, default_value = "127.0.0.1")]
        host: String,
        #[command(flatten)]
        audio: AudioArgs,
        /// Play synthesized speech in-process instead of through the audio server
        #[arg(long)]
        local: bool,
        /// Run only the audio server, without a synthesis session
        #[arg(long, conflicts_with = "local")]
        no_session: bool,
        /// Engine config file (JSON); overrides $MURMUR_ENGINE_CONFIG
        #[arg(long)]
        engine_config: Option<PathBuf>,
        /// Default Kokoro voice
        #[arg(long)]
        voice: Option<String>,
    },
    /// Stream a 16-bit PCM WAV file to the running audio server
    Send {
        /// WAV file to play
        file: PathBuf,
        /// Directory holding the server socket
        #[arg(long)]
        runtime_dir: Option<PathBuf>,
    },
    /// Ask the running session to speak
    Speak {
        /// Text to speak
        text: String,
        /// Message type: text, char, key, sound_icon or spell
        #[arg(long = "type")]
        msg_type: Option<String>,
        /// Language code
        #[arg(long)]
        language: Option<String>,
        /// Voice type such as female1 or male2
        #[arg(long)]
        voice_type: Option<String>,
        /// Synthesis voice name
        #[arg(long)]
        voice: Option<String>,
        #[arg(long, allow_hyphen_values = true)]
        rate: Option<i32>,
        #[arg(long, allow_hyphen_values = true)]
        pitch: Option<i32>,
        #[arg(long, allow_hyphen_values = true)]
        volume: Option<i32>,
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,
    },
    /// Stop speech
    Stop {
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,
    },
    /// Pause speech (stops it; resume is not supported)
    Pause {
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,
    },
    /// Get session status
    Status {
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,
    },
    /// List the session's voices
    Voices {
        #[arg(long, default_value = DEFAULT_URL)]
        url: String,
    },
}

#[derive(clap::Args)]
struct AudioArgs {
    /// Directory holding the server socket
    #[arg(long)]
    runtime_dir: Option<PathBuf>,
    /// Comma-separated backends tried in order (rodio, command, file, null)
    #[arg(long, default_value = "rodio,command")]
    output_methods: String,
    /// Output device name or path
    #[arg(long)]
    device: Option<String>,
    /// Sound server address, or the player binary for the command backend
    #[arg(long)]
    sound_server: Option<String>,
    /// Minimum buffering in milliseconds
    #[arg(long, default_value = "0")]
    min_buffer_len: u32,
    /// Device volume, -100 to 100
    #[arg(long, default_value_t = DEVICE_VOLUME, allow_hyphen_values = true)]
    volume: i32,
    /// Backend verbosity, 0 to 5
    #[arg(long, default_value = "3", value_parser = clap::value_parser!(u8).range(0..=5))]
    log_level: u8,
}

impl AudioArgs {
    fn server_config(self) -> CliResult<ServerConfig> {
        let output_methods = AudioConfig::parse_methods(&self.output_methods);
        if let Some(unknown) = output_methods.iter().find(|m| !BACKENDS.contains(&m.as_str())) {
            return Err(format!(
                "unknown output method {unknown:?}; expected one of {}",
                BACKENDS.join(", ")
            )
            .into());
        }

        let mut config = ServerConfig::default();
        if let Some(dir) = self.runtime_dir {
            config.runtime_dir = dir;
        }
        config.audio = AudioConfig {
            output_methods,
            device: self.device,
            server: self.sound_server,
            min_buffer_len: self.min_buffer_len,
            volume: self.volume,
            log_level: self.log_level,
        };
        Ok(config)
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("murmur=info,murmur_lib=info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli.command).await {
        eprintln!("murmur: {e}");
        std::process::exit(1);
    }
}

async fn run(command: Command) -> CliResult {
    match command {
        Command::Serve {
            port,
            host,
            audio,
            local,
            no_session,
            engine_config,
            voice,
        } => {
            let config = audio.server_config()?;
            serve(config, &host, port, local, no_session, engine_config, voice).await
        }

        Command::Send { file, runtime_dir } => {
            let mut config = ServerConfig::default();
            if let Some(dir) = runtime_dir {
                config.runtime_dir = dir;
            }
            send_wav(&file, &config.socket_path())
        }

        Command::Speak {
            text,
            msg_type,
            language,
            voice_type,
            voice,
            rate,
            pitch,
            volume,
            url,
        } => {
            let mut body = serde_json::Map::new();
            body.insert("text".into(), text.into());
            let optional: [(&str, Option<serde_json::Value>); 7] = [
                ("type", msg_type.map(Into::into)),
                ("language", language.map(Into::into)),
                ("voice_type", voice_type.map(Into::into)),
                ("voice", voice.map(Into::into)),
                ("rate", rate.map(Into::into)),
                ("pitch", pitch.map(Into::into)),
                ("volume", volume.map(Into::into)),
            ];
            for (key, value) in optional {
                if let Some(value) = value {
                    body.insert(key.into(), value);
                }
            }
            let resp = reqwest::Client::new()
                .post(format!("{url}/speak"))
                .json(&body)
                .send()
                .await?;
            print_response(resp).await
        }

        Command::Stop { url } => post_simple(&url, "stop").await,
        Command::Pause { url } => post_simple(&url, "pause").await,
        Command::Status { url } => get_simple(&url, "status").await,
        Command::Voices { url } => get_simple(&url, "voices").await,
    }
}

async fn serve(
    config: ServerConfig,
    host: &str,
    port: u16,
    local: bool,
    no_session: bool,
    engine_config: Option<PathBuf>,
    voice: Option<String>,
) -> CliResult {
    let server = if local {
        None
    } else {
        Some(AudioServer::spawn(&config)?)
    };

    if no_session {
        info!("running audio server only; Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;
        return tokio::task::spawn_blocking(move || shutdown(None, server)).await?;
    }

    let output: Box<dyn AudioOutput> = match &server {
        Some(server) => {
            let output = SocketOutput::connect(server.socket_path())?;
            // Session stops also cut the chunk on the server's device.
            let output = match server.stopper() {
                Some(stopper) => output.with_server_stopper(stopper),
                None => output,
            };
            Box::new(output)
        }
        None => {
            let device = open_device(&config.audio).ok_or("no audio output could be opened")?;
            Box::new(LocalOutput::new(device))
        }
    };

    let mut kokoro = match &engine_config {
        Some(path) => KokoroConfig::load_from(path)?,
        None => KokoroConfig::load()?,
    };
    if let Some(voice) = voice {
        kokoro.voice = voice;
    }
    let engine = KokoroEngine::new(kokoro)?;
    let session = Arc::new(SynthesisSession::open(
        Box::new(engine),
        output,
        &SessionConfig::default(),
    )?);

    let app = murmur_lib::control::router(session.clone());
    let addr = format!("{host}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("control API listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("cannot listen for Ctrl-C: {e}");
            }
        })
        .await?;

    tokio::task::spawn_blocking(move || shutdown(Some(session), server)).await?
}

/// Close the session, then the audio server. Blocks on both.
fn shutdown(session: Option<Arc<SynthesisSession>>, server: Option<AudioServerHandle>) -> CliResult {
    info!("shutting down");
    if let Some(session) = session {
        session.close()?;
    }
    if let Some(server) = server {
        server.shutdown()?;
    }
    Ok(())
}

/// Stream a WAV file to the audio server in ~100 ms frames.
fn send_wav(file: &Path, socket: &Path) -> CliResult {
    let buf = std::fs::read(file)?;
    let header = parse_wav_header(&buf).map_err(|e| format!("{}: {e}", file.display()))?;
    if header.bits_per_sample != BITS_PER_SAMPLE {
        return Err(format!(
            "{}: {}-bit samples, only 16-bit PCM is supported",
            file.display(),
            header.bits_per_sample
        )
        .into());
    }

    let pcm = header.data(&buf);
    let frame_bytes = (header.sample_rate / SEND_FRAMES_PER_SEC).max(1) as usize
        * usize::from(header.channels.max(1))
        * 2;

    let mut stream = UnixStream::connect(socket)
        .map_err(|e| format!("cannot connect to {}: {e}", socket.display()))?;
    let mut sent = 0usize;
    for block in pcm.chunks(frame_bytes) {
        // Drop a trailing odd byte.
        let even = block.len() & !1;
        let chunk = AudioChunk::new(
            SampleFormat::Le,
            header.channels,
            header.sample_rate,
            block[..even].to_vec(),
        )?;
        write_frame(&mut stream, &chunk)?;
        sent += chunk.num_samples();
    }
    info!("sent {sent} samples from {}", file.display());
    Ok(())
}

async fn post_simple(url: &str, endpoint: &str) -> CliResult {
    let resp = reqwest::Client::new()
        .post(format!("{url}/{endpoint}"))
        .send()
        .await?;
    print_response(resp).await
}

async fn get_simple(url: &str, endpoint: &str) -> CliResult {
    let resp = reqwest::Client::new()
        .get(format!("{url}/{endpoint}"))
        .send()
        .await?;
    print_response(resp).await
}

async fn print_response(resp: reqwest::Response) -> CliResult {
    let status = resp.status();
    let text = resp.text().await?;
    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
        Err(_) => println!("{text}"),
    }
    if !status.is_success() {
        return Err(format!("server answered {status}").into());
    }
    Ok(())
}
