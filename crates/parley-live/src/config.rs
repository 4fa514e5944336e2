//! Session configuration loaded from an optional TOML file and `PARLEY_*`
//! environment variables.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | PARLEY_ENDPOINT | Gemini Live websocket | Endpoint URL (`ws://` or `wss://`). |
//! | PARLEY_MODEL | gemini-2.5-flash-native-audio-preview-12-2025 | Model name. |
//! | PARLEY_VOICE | Zephyr | Prebuilt voice for spoken responses. |
//! | PARLEY_API_KEY | unset | Key to use directly. Otherwise read from `api_key_env`. |
//! | PARLEY_API_KEY_ENV | GEMINI_API_KEY | Variable the key is read from. |
//! | PARLEY_INPUT_SAMPLE_RATE | 16000 | Microphone rate sent upstream. |
//! | PARLEY_OUTPUT_SAMPLE_RATE | 24000 | Playback rate; incoming audio must match it. |
//! | PARLEY_CHANNELS | 1 | Channels captured and played. |
//! | PARLEY_FRAME_SIZE | 4096 | Samples per outbound frame. |
//! | PARLEY_MAX_BUFFERED_FRAMES | 8 | Frames that may wait before a capture overrun. |
//! | PARLEY_BACKLOG_WARN_SECS | 30 | Warn when queued playback exceeds this. |
//! | PARLEY_CONNECT_TIMEOUT_SECS | 15 | Give up connecting after this long. |

use crate::audio::AudioConfig;
use crate::capture::CaptureConfig;
use crate::codec::OutputFormat;
use crate::error::{VoiceError, VoiceResult};
use crate::scheduler::SchedulerConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_ENDPOINT: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";
pub const DEFAULT_MODEL: &str = "gemini-2.5-flash-native-audio-preview-12-2025";
pub const DEFAULT_VOICE: &str = "Zephyr";
pub const DEFAULT_API_KEY_ENV: &str = "GEMINI_API_KEY";
pub const DEFAULT_BACKLOG_WARN_SECS: f64 = 30.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LiveConfig {
    pub endpoint: String,
    pub model: String,
    pub voice: String,
    /// Never written back out by `to_toml`.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    pub api_key_env: String,
    pub input_sample_rate: u32,
    pub output_sample_rate: u32,
    pub channels: u16,
    pub frame_size: usize,
    pub max_buffered_frames: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backlog_warn_secs: Option<f64>,
    pub connect_timeout_secs: u64,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            voice: DEFAULT_VOICE.to_string(),
            api_key: None,
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            input_sample_rate: 16000,
            output_sample_rate: 24000,
            channels: 1,
            frame_size: 4096,
            max_buffered_frames: 8,
            backlog_warn_secs: Some(DEFAULT_BACKLOG_WARN_SECS),
            connect_timeout_secs: 15,
        }
    }
}

impl LiveConfig {
    /// Load defaults, then `path` (if given, it must exist), then `PARLEY_*`
    /// environment overrides. The result is validated.
    pub fn load(path: Option<&Path>) -> VoiceResult<Self> {
        let defaults = Self::default();
        let builder = config::Config::builder()
            .set_default("endpoint", defaults.endpoint)?
            .set_default("model", defaults.model)?
            .set_default("voice", defaults.voice)?
            .set_default("api_key_env", defaults.api_key_env)?
            .set_default("input_sample_rate", i64::from(defaults.input_sample_rate))?
            .set_default("output_sample_rate", i64::from(defaults.output_sample_rate))?
            .set_default("channels", i64::from(defaults.channels))?
            .set_default("frame_size", defaults.frame_size as i64)?
            .set_default("max_buffered_frames", defaults.max_buffered_frames as i64)?
            .set_default("backlog_warn_secs", DEFAULT_BACKLOG_WARN_SECS)?
            .set_default("connect_timeout_secs", defaults.connect_timeout_secs as i64)?;

        let builder = match path {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder,
        };

        let loaded: Self = builder
            .add_source(config::Environment::with_prefix("PARLEY").try_parsing(true))
            .build()?
            .try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> VoiceResult<()> {
        let fail = |msg: String| Err(VoiceError::Config(msg));
        if !(self.endpoint.starts_with("ws://") || self.endpoint.starts_with("wss://")) {
            return fail(format!("endpoint must be a ws:// or wss:// URL, got {}", self.endpoint));
        }
        if self.model.trim().is_empty() {
            return fail("model must not be empty".to_string());
        }
        if self.input_sample_rate == 0 || self.output_sample_rate == 0 {
            return fail("sample rates must be positive".to_string());
        }
        if self.channels == 0 {
            return fail("channels must be at least 1".to_string());
        }
        if self.frame_size == 0 {
            return fail("frame_size must be at least 1".to_string());
        }
        if self.max_buffered_frames == 0 {
            return fail("max_buffered_frames must be at least 1".to_string());
        }
        if let Some(limit) = self.backlog_warn_secs {
            if !(limit.is_finite() && limit > 0.0) {
                return fail(format!("backlog_warn_secs must be positive, got {}", limit));
            }
        }
        if self.connect_timeout_secs == 0 {
            return fail("connect_timeout_secs must be at least 1".to_string());
        }
        Ok(())
    }

    /// Effective configuration as TOML, without the API key.
    pub fn to_toml(&self) -> VoiceResult<String> {
        toml::to_string_pretty(self).map_err(|e| VoiceError::Config(e.to_string()))
    }

    pub fn audio_input(&self) -> AudioConfig {
        AudioConfig {
            sample_rate: self.input_sample_rate,
            channels: self.channels,
        }
    }

    pub fn output_format(&self) -> OutputFormat {
        OutputFormat {
            sample_rate: self.output_sample_rate,
            channels: self.channels,
        }
    }

    pub fn capture(&self) -> CaptureConfig {
        CaptureConfig {
            frame_size: self.frame_size,
            max_buffered_frames: self.max_buffered_frames,
        }
    }

    pub fn scheduler(&self) -> SchedulerConfig {
        SchedulerConfig {
            backlog_warn_secs: self.backlog_warn_secs,
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}
