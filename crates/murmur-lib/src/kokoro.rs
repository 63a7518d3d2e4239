//! Kokoro engine: text → OpenAI-compatible speech endpoint → PCM chunks.
//!
//! The server streams raw 24 kHz mono 16-bit little-endian PCM. Each network
//! read becomes one chunk. The HTTP client runs on a current-thread runtime
//! owned by the engine, created on first use so it lives and dies on the
//! session's engine thread. Every step, including waiting for the response
//! headers, is bounded by the time slice, so a stop is seen promptly even
//! when the server is slow to answer.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::runtime::Runtime;
use tracing::{debug, info};

use murmur_core::pcm::le_bytes_to_i16;
use murmur_core::types::{AudioChunk, Gender, SampleFormat, VoiceDescriptor};

use crate::engine::{ChunkSink, EngineError, EngineState, Prosody, PushResult, SynthesisEngine};

/// Environment variable overriding the engine config path.
pub const CONFIG_ENV: &str = "MURMUR_ENGINE_CONFIG";

const SAMPLE_RATE: u32 = 24_000;
const CHANNELS: u16 = 1;

/// Voice ids shipped with Kokoro v1.0.
const VOICE_IDS: &[&str] = &[
    "af_heart", "af_alloy", "af_aoede", "af_bella", "af_jessica", "af_kore", "af_nicole",
    "af_nova", "af_river", "af_sarah", "af_sky", "am_adam", "am_echo", "am_eric", "am_fenrir",
    "am_liam", "am_michael", "am_onyx", "am_puck", "bf_alice", "bf_emma", "bf_isabella",
    "bf_lily", "bm_daniel", "bm_fable", "bm_george", "bm_lewis", "ef_dora", "em_alex",
    "ff_siwis", "hf_alpha", "hf_beta", "hm_omega", "hm_psi", "if_sara", "im_nicola",
    "jf_alpha", "jf_gongitsune", "jm_kumo", "pf_dora", "pm_alex", "zf_xiaobei", "zf_xiaoni",
    "zm_yunjian", "zm_yunxi",
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KokoroConfig {
    pub url: String,
    /// Voice listed first, so it wins ties during voice selection.
    pub voice: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl Default for KokoroConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:3001".into(),
            voice: "af_heart".into(),
            model: "kokoro".into(),
            timeout_secs: 30,
        }
    }
}

impl KokoroConfig {
    /// `$MURMUR_ENGINE_CONFIG`, else `$XDG_CONFIG_HOME/murmur/engine.json`,
    /// else `~/.config/murmur/engine.json`.
    pub fn default_path() -> Option<PathBuf> {
        if let Some(path) = std::env::var_os(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("murmur").join("engine.json"))
    }

    /// Load from the default path. A missing file yields the defaults.
    pub fn load() -> Result<Self, EngineError> {
        match Self::default_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self, EngineError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!("no engine config at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => return Err(EngineError::Setup(format!("{}: {e}", path.display()))),
        };
        serde_json::from_str(&text)
            .map_err(|e| EngineError::Setup(format!("{}: {e}", path.display())))
    }
}

/// Describe a Kokoro voice id such as `bf_emma`: the first letter encodes
/// the language, the second the gender.
pub fn describe_voice(id: &str) -> VoiceDescriptor {
    let mut prefix = id.chars();
    let (language, variant) = match prefix.next() {
        Some('a') => ("en", Some("us")),
        Some('b') => ("en", Some("gb")),
        Some('e') => ("es", None),
        Some('f') => ("fr", None),
        Some('h') => ("hi", None),
        Some('i') => ("it", None),
        Some('j') => ("ja", None),
        Some('p') => ("pt", Some("br")),
        Some('z') => ("zh", None),
        _ => ("en", None),
    };
    let gender = match prefix.next() {
        Some('f') => Some(Gender::Female),
        Some('m') => Some(Gender::Male),
        _ => None,
    };
    VoiceDescriptor {
        name: id.to_string(),
        language: language.into(),
        variant: variant.map(String::from),
        gender,
        age: None,
    }
}

/// Kokoro speed multiplier for a rate in [-100, 100]: half to double speed.
pub fn speed_for_rate(rate: i32) -> f32 {
    2f32.powf(rate as f32 / 100.0)
}

struct Request {
    text: String,
    voice: String,
    speed: f32,
}

type PcmStream = BoxStream<'static, reqwest::Result<Vec<u8>>>;

enum Transfer {
    NotStarted,
    /// Request sent, waiting for the response headers.
    Connecting(BoxFuture<'static, Result<PcmStream, EngineError>>),
    Streaming(PcmStream),
}

struct Job {
    request: Request,
    transfer: Transfer,
    leftover: Option<u8>,
}

pub struct KokoroEngine {
    config: KokoroConfig,
    voices: Vec<VoiceDescriptor>,
    client: reqwest::Client,
    runtime: Option<Runtime>,
    job: Option<Job>,
}

impl KokoroEngine {
    pub fn new(config: KokoroConfig) -> Result<Self, EngineError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| EngineError::Setup(e.to_string()))?;

        let mut voices: Vec<VoiceDescriptor> = VOICE_IDS.iter().map(|id| describe_voice(id)).collect();
        match voices.iter().position(|v| v.name == config.voice) {
            Some(i) => voices[..=i].rotate_right(1),
            None => voices.insert(0, describe_voice(&config.voice)),
        }

        info!("kokoro engine at {} (default voice {})", config.url, config.voice);
        Ok(Self {
            config,
            voices,
            client,
            runtime: None,
            job: None,
        })
    }
}

fn runtime_for(slot: &mut Option<Runtime>) -> Result<&Runtime, EngineError> {
    if slot.is_none() {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| EngineError::Setup(e.to_string()))?;
        *slot = Some(rt);
    }
    slot.as_ref()
        .ok_or_else(|| EngineError::Setup("no runtime".into()))
}

fn start_request(
    client: &reqwest::Client,
    config: &KokoroConfig,
    job: &Request,
) -> BoxFuture<'static, Result<PcmStream, EngineError>> {
    let url = format!("{}/v1/audio/speech", config.url);
    let body = serde_json::json!({
        "input": job.text,
        "voice": job.voice,
        "model": config.model,
        "response_format": "pcm",
        "stream": true,
        "speed": job.speed,
    });
    debug!("kokoro: POST {} chars as {}", job.text.len(), job.voice);

    let request = client.post(url).json(&body);
    async move {
        let resp = request
            .send()
            .await
            .map_err(|e| EngineError::Synthesis(format!("request failed: {e}")))?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(EngineError::Synthesis(format!("kokoro error {status}: {text}")));
        }
        Ok(resp.bytes_stream().map(|r| r.map(|b| b.to_vec())).boxed())
    }
    .boxed()
}

impl SynthesisEngine for KokoroEngine {
    fn voices(&self) -> Vec<VoiceDescriptor> {
        self.voices.clone()
    }

    fn load(&mut self, text: &str, voice: usize, prosody: &Prosody) -> Result<(), EngineError> {
        let voice = self.voices.get(voice).ok_or(EngineError::NoVoice(voice))?;
        if prosody.pitch != 0 {
            debug!("kokoro: pitch {} ignored", prosody.pitch);
        }
        self.job = Some(Job {
            request: Request {
                text: text.to_string(),
                voice: voice.name.clone(),
                speed: speed_for_rate(prosody.rate),
            },
            transfer: Transfer::NotStarted,
            leftover: None,
        });
        Ok(())
    }

    fn process(&mut self, budget: Duration, sink: &ChunkSink) -> Result<EngineState, EngineError> {
        let Self {
            config,
            client,
            runtime,
            job,
            ..
        } = self;
        let Some(current) = job.as_mut() else {
            return Ok(EngineState::Done);
        };
        if current.request.text.is_empty() {
            *job = None;
            return Ok(EngineState::Done);
        }
        let rt = runtime_for(runtime)?;
        let deadline = tokio::time::Instant::from_std(Instant::now() + budget);

        if let Transfer::NotStarted = current.transfer {
            current.transfer = Transfer::Connecting(start_request(client, config, &current.request));
        }

        let state: Result<EngineState, EngineError> = rt.block_on(async {
            if let Transfer::Connecting(pending) = &mut current.transfer {
                let connected = tokio::time::timeout_at(deadline, pending).await;
                match connected {
                    Err(_) => return Ok(EngineState::Running),
                    Ok(stream) => current.transfer = Transfer::Streaming(stream?),
                }
            }
            let Transfer::Streaming(stream) = &mut current.transfer else {
                return Ok(EngineState::Done);
            };
            loop {
                let bytes = match tokio::time::timeout_at(deadline, stream.next()).await {
                    Err(_) => return Ok(EngineState::Running),
                    Ok(None) => return Ok(EngineState::Done),
                    Ok(Some(Err(e))) => return Err(EngineError::Synthesis(format!("stream error: {e}"))),
                    Ok(Some(Ok(bytes))) => bytes,
                };
                let (samples, leftover) = le_bytes_to_i16(&bytes, current.leftover.take());
                current.leftover = leftover;
                if samples.is_empty() {
                    continue;
                }
                let chunk = AudioChunk::from_samples(&samples, CHANNELS, SAMPLE_RATE, SampleFormat::Le)
                    .map_err(|e| EngineError::Synthesis(e.to_string()))?;
                if sink.push(chunk) == PushResult::Dropped {
                    return Ok(EngineState::Running);
                }
            }
        });

        if !matches!(state, Ok(EngineState::Running)) {
            *job = None;
        }
        state
    }

    fn purge(&mut self) {
        if self.job.take().is_some() {
            debug!("kokoro: purged");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::Delivery;
    use axum::Router;
    use axum::routing::post;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicU64};
    use std::sync::mpsc::sync_channel;

    #[test]
    fn voice_ids_encode_language_and_gender() {
        let v = describe_voice("bf_emma");
        assert_eq!(v.language, "en");
        assert_eq!(v.variant.as_deref(), Some("gb"));
        assert_eq!(v.gender, Some(Gender::Female));
        let v = describe_voice("jm_kumo");
        assert_eq!(v.language, "ja");
        assert_eq!(v.gender, Some(Gender::Male));
    }

    #[test]
    fn rate_maps_to_speed() {
        let close = |a: f32, b: f32| (a - b).abs() < 1e-6;
        assert!(close(speed_for_rate(0), 1.0));
        assert!(close(speed_for_rate(100), 2.0));
        assert!(close(speed_for_rate(-100), 0.5));
    }

    #[test]
    fn configured_voice_is_listed_first() {
        let engine = KokoroEngine::new(KokoroConfig {
            voice: "bm_george".into(),
            ..Default::default()
        })
        .unwrap();
        let voices = engine.voices();
        assert_eq!(voices[0].name, "bm_george");
        assert_eq!(voices.len(), VOICE_IDS.len());
        assert_eq!(voices.iter().filter(|v| v.name == "bm_george").count(), 1);
    }

    #[test]
    fn config_file_handling() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("engine.json");
        assert_eq!(KokoroConfig::load_from(&missing).unwrap(), KokoroConfig::default());

        std::fs::write(&missing, r#"{"url": "http://tts:8880", "voice": "am_adam"}"#).unwrap();
        let config = KokoroConfig::load_from(&missing).unwrap();
        assert_eq!(config.url, "http://tts:8880");
        assert_eq!(config.voice, "am_adam");
        assert_eq!(config.model, "kokoro");

        std::fs::write(&missing, "not json").unwrap();
        assert!(matches!(
            KokoroConfig::load_from(&missing),
            Err(EngineError::Setup(_))
        ));
    }

    #[test]
    fn load_rejects_unknown_voice_index() {
        let mut engine = KokoroEngine::new(KokoroConfig::default()).unwrap();
        assert!(matches!(
            engine.load("hi", 10_000, &Prosody::default()),
            Err(EngineError::NoVoice(10_000))
        ));
    }

    /// Serve a fixed PCM body on `/v1/audio/speech` from a background thread.
    fn fake_kokoro(body: Vec<u8>) -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.set_nonblocking(true).unwrap();
        let addr = listener.local_addr().unwrap();
        std::thread::spawn(move || {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();
            rt.block_on(async move {
                let listener = tokio::net::TcpListener::from_std(listener).unwrap();
                let app = Router::new().route("/v1/audio/speech", post(move || {
                    let body = body.clone();
                    async move { body }
                }));
                axum::serve(listener, app).await.unwrap();
            });
        });
        format!("http://{addr}")
    }

    #[test]
    fn streams_pcm_into_chunks() {
        let samples: [i16; 4] = [1, 2, 3, -4];
        let body: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        let url = fake_kokoro(body);

        let mut engine = KokoroEngine::new(KokoroConfig {
            url,
            ..Default::default()
        })
        .unwrap();
        let (tx, rx) = sync_channel(16);
        let sink = ChunkSink::new(
            tx,
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicU64::new(0)),
            100,
        );

        engine.load("hello", 0, &Prosody::default()).unwrap();
        let mut rounds = 0;
        while engine.process(Duration::from_secs(1), &sink).unwrap() == EngineState::Running {
            rounds += 1;
            assert!(rounds < 20, "engine never finished");
        }
        drop(sink);

        let mut got = Vec::new();
        for item in rx {
            if let Delivery::Chunk { chunk, .. } = item {
                assert_eq!(chunk.sample_rate, SAMPLE_RATE);
                assert_eq!(chunk.channels, CHANNELS);
                got.extend(chunk.samples());
            }
        }
        assert_eq!(got, samples);
    }

    #[test]
    fn silent_server_does_not_hold_the_engine_past_its_slice() {
        // Accepts connections through the backlog but never answers.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let mut engine = KokoroEngine::new(KokoroConfig {
            url: format!("http://{}", listener.local_addr().unwrap()),
            ..Default::default()
        })
        .unwrap();
        let (tx, _rx) = sync_channel(1);
        let sink = ChunkSink::new(
            tx,
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicU64::new(0)),
            100,
        );

        engine.load("hello", 0, &Prosody::default()).unwrap();
        let started = Instant::now();
        for _ in 0..3 {
            assert_eq!(
                engine.process(Duration::from_millis(50), &sink).unwrap(),
                EngineState::Running
            );
        }
        assert!(started.elapsed() < Duration::from_secs(2));

        engine.purge();
        assert_eq!(
            engine.process(Duration::from_millis(50), &sink).unwrap(),
            EngineState::Done
        );
        drop(listener);
    }

    #[test]
    fn http_errors_surface_as_synthesis_errors() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        drop(listener);

        let mut engine = KokoroEngine::new(KokoroConfig {
            url,
            ..Default::default()
        })
        .unwrap();
        let (tx, _rx) = sync_channel(1);
        let sink = ChunkSink::new(
            tx,
            Arc::new(AtomicBool::new(false)),
            Arc::new(AtomicU64::new(0)),
            100,
        );
        engine.load("hello", 0, &Prosody::default()).unwrap();
        assert!(matches!(
            engine.process(Duration::from_secs(1), &sink),
            Err(EngineError::Synthesis(_))
        ));
    }
}
