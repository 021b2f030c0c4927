//! Call configuration: every timing constant in one place.
//!
//! Loaded from defaults, then an optional TOML file, then the environment.
//!
//! | Env | Default | Description |
//! |-----|---------|-------------|
//! | PARLEY_CONFIG | config/parley.toml | Path of the optional TOML file. |
//! | PARLEY__VAD__SILENCE_DEBOUNCE_MS | 600 | Silence needed to close a segment. |
//! | PARLEY__VAD__MIN_SPEECH_MS | 400 | Shorter segments are dropped as noise. |
//! | PARLEY__RETRY__DELAYS_MS | 1000,2000,4000 | Backoff between retries; its length is the retry budget. |
//! | PARLEY__PROVIDERS__BASE_URL | http://127.0.0.1:1234/v1 | OpenAI-compatible endpoint (LM Studio by default). |
//! | PARLEY__PROVIDERS__API_KEY | unset | Bearer key; also read from OPENAI_API_KEY. |

use crate::error::{VoiceError, VoiceResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Capture format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Sample rate in Hz (default: 16000)
    pub sample_rate: u32,

    /// Frame length in milliseconds; also the VAD tick (default: 50)
    pub frame_ms: u32,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 16000,
            frame_ms: 50,
        }
    }
}

impl AudioConfig {
    /// Samples per frame (800 at 16kHz / 50ms).
    pub fn frame_samples(&self) -> usize {
        (self.sample_rate as u64 * self.frame_ms as u64 / 1000) as usize
    }
}

/// Energy VAD tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VadConfig {
    /// Ambient-noise measurement window at session start (default: 2000ms)
    pub calibration_ms: u64,

    /// adaptive_threshold = max(threshold_factor * baseline, energy_floor)
    pub threshold_factor: f32,

    /// Lowest threshold ever used, as normalized RMS (default: 0.02)
    pub energy_floor: f32,

    /// Silence that must follow speech before the segment closes (default: 600ms)
    pub silence_debounce_ms: u64,

    /// Voiced time a segment needs to be emitted (default: 400ms)
    pub min_speech_ms: u64,

    /// Segments are force-closed at this length (default: 30s)
    pub max_segment_ms: u64,

    /// Idle drift window before silent re-calibration (default: 30s)
    pub recalibration_after_ms: u64,

    /// Energy ratio versus baseline (either direction) that counts as drift
    pub drift_ratio: f32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            calibration_ms: 2000,
            threshold_factor: 1.5,
            energy_floor: 0.02,
            silence_debounce_ms: 600,
            min_speech_ms: 400,
            max_segment_ms: 30_000,
            recalibration_after_ms: 30_000,
            drift_ratio: 1.5,
        }
    }
}

/// Barge-in detection while the assistant is speaking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterruptConfig {
    /// Desensitized factor over the calibrated baseline (default: 2.0)
    pub threshold_factor: f32,

    /// Consecutive loud frames needed to confirm (default: 3, ~150ms)
    pub confirm_frames: usize,
}

impl Default for InterruptConfig {
    fn default() -> Self {
        Self {
            threshold_factor: 2.0,
            confirm_frames: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before each retry; the number of entries is the retry budget.
    pub delays_ms: Vec<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            delays_ms: vec![1000, 2000, 4000],
        }
    }
}

impl RetryConfig {
    pub fn delays(&self) -> Vec<Duration> {
        self.delays_ms.iter().map(|ms| Duration::from_millis(*ms)).collect()
    }
}

/// Per-turn pipeline behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    /// Sentences longer than this are cut at a word boundary for synthesis.
    pub max_sentence_chars: usize,

    /// Conversation messages kept as model context (user + assistant).
    pub max_context_messages: usize,

    /// Speak a short cue when a turn fails (text cue is always emitted).
    pub spoken_fallback_cues: bool,

    /// Cue after transcription gave up on transient errors.
    pub cue_not_understood: String,

    /// Cue after generation or synthesis gave up on transient errors.
    pub cue_connection: String,

    /// Cue after a non-transient provider failure.
    pub cue_unavailable: String,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            max_sentence_chars: 180,
            max_context_messages: 20,
            spoken_fallback_cues: true,
            cue_not_understood: "Sorry, I'm having trouble hearing you. Please try again.".to_string(),
            cue_connection: "Sorry, I lost the connection for a moment. Could you say that again?"
                .to_string(),
            cue_unavailable: "The voice service is unavailable right now. Please try again later."
                .to_string(),
        }
    }
}

/// OpenAI-compatible endpoints for the three providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Base URL without trailing slash.
    pub base_url: String,
    pub api_key: Option<String>,
    /// Overrides `base_url` for transcription (e.g. a local whisper server).
    pub transcription_url: Option<String>,
    /// Overrides `base_url` for synthesis (e.g. a local piper server).
    pub synthesis_url: Option<String>,
    pub transcription_model: String,
    pub chat_model: String,
    pub speech_model: String,
    pub voice: String,
    pub language: String,
    pub temperature: f32,
    pub system_prompt: String,
    pub request_timeout_secs: u64,
    pub chat_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:1234/v1".to_string(),
            api_key: None,
            transcription_url: None,
            synthesis_url: None,
            transcription_model: "whisper-1".to_string(),
            chat_model: "default".to_string(),
            speech_model: "tts-1".to_string(),
            voice: "alloy".to_string(),
            language: "en".to_string(),
            temperature: 0.2,
            system_prompt: "You are a helpful voice assistant. Answer in short, spoken sentences."
                .to_string(),
            request_timeout_secs: 30,
            chat_timeout_secs: 120,
        }
    }
}

/// Complete configuration for a call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub audio: AudioConfig,
    pub vad: VadConfig,
    pub interrupt: InterruptConfig,
    pub retry: RetryConfig,
    pub turn: TurnConfig,
    pub providers: ProviderConfig,
}

impl CallConfig {
    /// Load config. Precedence: env `PARLEY__*` > TOML at `PARLEY_CONFIG` (or `config/parley.toml`) > defaults.
    pub fn load() -> VoiceResult<Self> {
        let path = std::env::var("PARLEY_CONFIG").unwrap_or_else(|_| "config/parley.toml".to_string());
        Self::load_from(Path::new(&path))
    }

    pub fn load_from(path: &Path) -> VoiceResult<Self> {
        let defaults = config::Config::try_from(&CallConfig::default()).map_err(config_error)?;
        let builder = config::Config::builder().add_source(defaults);

        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(
                config::Environment::with_prefix("PARLEY")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("retry.delays_ms")
                    .try_parsing(true),
            )
            .build()
            .map_err(config_error)?;

        let mut cfg: CallConfig = built.try_deserialize().map_err(config_error)?;
        if cfg.providers.api_key.is_none() {
            cfg.providers.api_key = std::env::var("OPENAI_API_KEY").ok().filter(|k| !k.trim().is_empty());
        }
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject values that would break the frame loop or the retry policy.
    pub fn validate(&self) -> VoiceResult<()> {
        if self.audio.sample_rate == 0 || self.audio.frame_ms == 0 {
            return Err(VoiceError::Config("sample_rate and frame_ms must be positive".to_string()));
        }
        if self.audio.frame_samples() == 0 {
            return Err(VoiceError::Config(format!(
                "frame of {}ms at {}Hz holds no samples",
                self.audio.frame_ms, self.audio.sample_rate
            )));
        }
        if self.vad.calibration_ms < self.audio.frame_ms as u64 {
            return Err(VoiceError::Config(
                "calibration_ms must cover at least one frame".to_string(),
            ));
        }
        if self.vad.threshold_factor <= 0.0 || self.interrupt.threshold_factor <= 0.0 {
            return Err(VoiceError::Config("threshold factors must be positive".to_string()));
        }
        if !(0.0..1.0).contains(&self.vad.energy_floor) {
            return Err(VoiceError::Config(format!(
                "energy_floor must be in [0, 1), got {}",
                self.vad.energy_floor
            )));
        }
        if self.vad.drift_ratio <= 1.0 {
            return Err(VoiceError::Config("drift_ratio must be greater than 1".to_string()));
        }
        if self.interrupt.confirm_frames == 0 {
            return Err(VoiceError::Config("confirm_frames must be at least 1".to_string()));
        }
        if self.turn.max_sentence_chars < 16 {
            return Err(VoiceError::Config("max_sentence_chars must be at least 16".to_string()));
        }
        Ok(())
    }
}

fn config_error(err: config::ConfigError) -> VoiceError {
    VoiceError::Config(err.to_string())
}
