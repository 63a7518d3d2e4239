//! Configuration types for the audio server and synthesis sessions.
//!
//! Every struct deserializes with `#[serde(default)]`, so a partial config
//! file or a handful of CLI flags is enough; absent values fall back to the
//! defaults below.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default operating volume of the output device. Speech volume is applied
/// upstream by the synthesis session.
pub const DEVICE_VOLUME: i32 = 85;

/// Buffer lengths at or below this are treated as "use the backend default".
const MIN_BUFFER_FLOOR: u32 = 9;

/// Parameters handed to a backend's `open`. Unknown or absent values mean
/// "use the backend default".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendParams {
    /// Device path or device name.
    pub device: Option<String>,
    /// Sound server address, or player binary for the command backend.
    pub server: Option<String>,
    /// Minimum buffering in milliseconds.
    pub min_buffer_len: Option<u32>,
}

/// Audio output selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Backend names tried in order until one opens.
    pub output_methods: Vec<String>,
    pub device: Option<String>,
    pub server: Option<String>,
    pub min_buffer_len: u32,
    /// Device volume, -100 to 100. Out-of-range values fall back to
    /// [`DEVICE_VOLUME`] when the device opens.
    pub volume: i32,
    /// Verbosity forwarded to the backend (0–5).
    pub log_level: u8,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            output_methods: vec!["rodio".into(), "command".into()],
            device: None,
            server: None,
            min_buffer_len: 0,
            volume: DEVICE_VOLUME,
            log_level: 3,
        }
    }
}

impl AudioConfig {
    /// Split a comma-separated backend list such as `"rodio,command,null"`.
    pub fn parse_methods(list: &str) -> Vec<String> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }

    pub fn backend_params(&self) -> BackendParams {
        BackendParams {
            device: self.device.clone(),
            server: self.server.clone(),
            min_buffer_len: (self.min_buffer_len > MIN_BUFFER_FLOOR).then_some(self.min_buffer_len),
        }
    }
}

/// Audio server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Directory holding `audio.sock`.
    pub runtime_dir: PathBuf,
    pub audio: AudioConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let base = std::env::var_os("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);
        Self {
            runtime_dir: base.join("murmur"),
            audio: AudioConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn socket_path(&self) -> PathBuf {
        self.runtime_dir.join("audio.sock")
    }
}

/// Synthesis session tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Time slice the engine is driven for between flag checks.
    pub slice_ms: u64,
    /// Chunks buffered between the engine and the delivery stage.
    pub channel_capacity: usize,
    /// How long `close` waits for the worker threads before detaching them.
    pub grace_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            slice_ms: 100,
            channel_capacity: 4,
            grace_ms: 250,
        }
    }
}

impl SessionConfig {
    pub fn slice(&self) -> Duration {
        Duration::from_millis(self.slice_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_methods_trims_and_skips_empty() {
        assert_eq!(
            AudioConfig::parse_methods(" rodio, ,command,null "),
            vec!["rodio", "command", "null"]
        );
        assert!(AudioConfig::parse_methods("").is_empty());
    }

    #[test]
    fn small_buffer_lengths_use_backend_default() {
        let mut config = AudioConfig {
            min_buffer_len: 9,
            ..Default::default()
        };
        assert_eq!(config.backend_params().min_buffer_len, None);
        config.min_buffer_len = 100;
        assert_eq!(config.backend_params().min_buffer_len, Some(100));
    }

    #[test]
    fn socket_lives_in_runtime_dir() {
        let config = ServerConfig {
            runtime_dir: PathBuf::from("/run/user/1000/murmur"),
            ..Default::default()
        };
        assert_eq!(
            config.socket_path(),
            PathBuf::from("/run/user/1000/murmur/audio.sock")
        );
    }

    #[test]
    fn partial_session_config_fills_defaults() {
        let config: SessionConfig = serde_json::from_str(r#"{"grace_ms": 10}"#).unwrap();
        assert_eq!(config.grace_period(), Duration::from_millis(10));
        assert_eq!(config.channel_capacity, 4);
        assert_eq!(config.slice(), Duration::from_millis(100));
    }

    #[test]
    fn audio_config_from_json() {
        let config: AudioConfig =
            serde_json::from_str(r#"{"output_methods": ["null"], "device": "/dev/dsp"}"#).unwrap();
        assert_eq!(config.output_methods, vec!["null"]);
        assert_eq!(config.volume, DEVICE_VOLUME);
        assert_eq!(config.backend_params().device.as_deref(), Some("/dev/dsp"));
    }
}
