//! Error types for the Parley voice pipeline
//!
//! Two layers: [`VoiceError`] for session-level failures (device, permission,
//! configuration) and [`ProviderError`] for outbound provider calls, which the
//! retry policy classifies as transient or not.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for voice operations
pub type VoiceResult<T> = Result<T, VoiceError>;

/// Errors that can occur in the voice call system
#[derive(Error, Debug)]
pub enum VoiceError {
    #[error("Microphone permission denied: {0}")]
    Permission(String),

    #[error("Audio device error: {0}")]
    AudioDevice(String),

    #[error("Audio stream error: {0}")]
    AudioStream(String),

    #[error("Audio playback error: {0}")]
    Playback(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Voice calls are not enabled for this account")]
    NotAllowed,

    #[error("Audio encoding error: {0}")]
    Encoding(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl VoiceError {
    /// User-facing category for the host/UI layer.
    pub fn category(&self) -> ErrorCategory {
        match self {
            VoiceError::Permission(_) => ErrorCategory::PermissionError,
            VoiceError::AudioDevice(_)
            | VoiceError::AudioStream(_)
            | VoiceError::Playback(_)
            | VoiceError::Io(_) => ErrorCategory::DeviceError,
            VoiceError::Provider(e) => e.category(),
            VoiceError::Config(_) | VoiceError::NotAllowed | VoiceError::Encoding(_) => {
                ErrorCategory::ProviderError
            }
        }
    }

    /// Short, non-technical message with a recovery hint.
    pub fn user_message(&self) -> &'static str {
        match self {
            VoiceError::Permission(_) => {
                "Microphone access was denied. Allow microphone access in your settings and start the call again."
            }
            VoiceError::AudioDevice(_) | VoiceError::AudioStream(_) | VoiceError::Io(_) => {
                "No working microphone was found. Check your audio device and try again."
            }
            VoiceError::Playback(_) => "Audio output is not available. Check your speakers.",
            VoiceError::NotAllowed => "Voice calls are not available on your plan.",
            VoiceError::Config(_) | VoiceError::Encoding(_) => {
                "The voice service is misconfigured. Please try again later."
            }
            VoiceError::Provider(e) => e.user_message(),
        }
    }
}

impl From<hound::Error> for VoiceError {
    fn from(err: hound::Error) -> Self {
        VoiceError::Encoding(err.to_string())
    }
}

impl From<cpal::DevicesError> for VoiceError {
    fn from(err: cpal::DevicesError) -> Self {
        VoiceError::AudioDevice(err.to_string())
    }
}

impl From<cpal::DefaultStreamConfigError> for VoiceError {
    fn from(err: cpal::DefaultStreamConfigError) -> Self {
        match err {
            cpal::DefaultStreamConfigError::BackendSpecific { err } => backend_error(err.description),
            other => VoiceError::AudioDevice(other.to_string()),
        }
    }
}

impl From<cpal::BuildStreamError> for VoiceError {
    fn from(err: cpal::BuildStreamError) -> Self {
        match err {
            cpal::BuildStreamError::BackendSpecific { err } => backend_error(err.description),
            cpal::BuildStreamError::DeviceNotAvailable => {
                VoiceError::AudioDevice("input device is no longer available".to_string())
            }
            other => VoiceError::AudioStream(other.to_string()),
        }
    }
}

impl From<cpal::PlayStreamError> for VoiceError {
    fn from(err: cpal::PlayStreamError) -> Self {
        match err {
            cpal::PlayStreamError::BackendSpecific { err } => backend_error(err.description),
            other => VoiceError::AudioStream(other.to_string()),
        }
    }
}

/// Backends report denied capture as free-form text.
fn backend_error(description: String) -> VoiceError {
    let lower = description.to_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized") {
        VoiceError::Permission(description)
    } else {
        VoiceError::AudioDevice(description)
    }
}

/// Errors from transcription, language-model and synthesis providers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server error (status {status}): {message}")]
    Server { status: u16, message: String },

    #[error("Rate limited (retry after {retry_after_ms:?}ms)")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("Authentication failed (status {status}): {message}")]
    Auth { status: u16, message: String },

    #[error("Invalid request (status {status}): {message}")]
    InvalidRequest { status: u16, message: String },

    #[error("Malformed provider response: {0}")]
    Malformed(String),

    #[error("Request cancelled")]
    Cancelled,
}

impl ProviderError {
    /// Whether a retry has a reasonable chance of succeeding.
    ///
    /// A rate limit is only transient when the provider told us when to come back.
    pub fn is_transient(&self) -> bool {
        match self {
            ProviderError::Timeout(_) | ProviderError::Network(_) | ProviderError::Server { .. } => true,
            ProviderError::RateLimited { retry_after_ms } => retry_after_ms.is_some(),
            ProviderError::Auth { .. }
            | ProviderError::InvalidRequest { .. }
            | ProviderError::Malformed(_)
            | ProviderError::Cancelled => false,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ProviderError::Cancelled)
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ProviderError::Timeout(_) | ProviderError::Network(_) => ErrorCategory::NetworkError,
            _ => ErrorCategory::ProviderError,
        }
    }

    pub fn user_message(&self) -> &'static str {
        if self.is_transient() {
            "Having trouble reaching the voice service. Try again in a moment."
        } else {
            "The voice service is unavailable right now."
        }
    }

    /// Map an HTTP status (with optional `Retry-After` seconds) to an error.
    pub fn from_status(status: u16, retry_after_secs: Option<u64>, body: String) -> Self {
        match status {
            401 | 403 => ProviderError::Auth { status, message: body },
            408 => ProviderError::Timeout(body),
            429 => ProviderError::RateLimited {
                retry_after_ms: retry_after_secs.map(|s| s * 1000),
            },
            500..=599 => ProviderError::Server { status, message: body },
            _ => ProviderError::InvalidRequest { status, message: body },
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ProviderError::Timeout(err.to_string())
        } else if err.is_connect() || err.is_request() || err.is_body() {
            ProviderError::Network(err.to_string())
        } else if err.is_decode() {
            ProviderError::Malformed(err.to_string())
        } else if let Some(status) = err.status() {
            ProviderError::from_status(status.as_u16(), None, err.to_string())
        } else {
            ProviderError::Network(err.to_string())
        }
    }
}

/// Error category surfaced to the UI/host layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    PermissionError,
    DeviceError,
    NetworkError,
    ProviderError,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(ProviderError::Timeout("t".into()).is_transient());
        assert!(ProviderError::Network("reset".into()).is_transient());
        assert!(ProviderError::Server { status: 503, message: "busy".into() }.is_transient());
        assert!(ProviderError::RateLimited { retry_after_ms: Some(2000) }.is_transient());

        assert!(!ProviderError::RateLimited { retry_after_ms: None }.is_transient());
        assert!(!ProviderError::Auth { status: 401, message: "bad key".into() }.is_transient());
        assert!(!ProviderError::InvalidRequest { status: 400, message: "nope".into() }.is_transient());
        assert!(!ProviderError::Cancelled.is_transient());
    }

    #[test]
    fn status_mapping() {
        assert!(matches!(
            ProviderError::from_status(401, None, String::new()),
            ProviderError::Auth { status: 401, .. }
        ));
        assert_eq!(
            ProviderError::from_status(429, Some(3), String::new()),
            ProviderError::RateLimited { retry_after_ms: Some(3000) }
        );
        assert!(ProviderError::from_status(502, None, String::new()).is_transient());
        assert!(!ProviderError::from_status(422, None, String::new()).is_transient());
    }

    #[test]
    fn categories() {
        assert_eq!(
            VoiceError::Permission("denied".into()).category(),
            ErrorCategory::PermissionError
        );
        assert_eq!(VoiceError::AudioDevice("none".into()).category(), ErrorCategory::DeviceError);
        assert_eq!(
            VoiceError::from(ProviderError::Timeout("slow".into())).category(),
            ErrorCategory::NetworkError
        );
        assert_eq!(
            VoiceError::from(ProviderError::Auth { status: 403, message: String::new() }).category(),
            ErrorCategory::ProviderError
        );
    }

    #[test]
    fn backend_permission_text_maps_to_permission() {
        assert!(matches!(
            backend_error("Access denied by the OS".to_string()),
            VoiceError::Permission(_)
        ));
        assert!(matches!(
            backend_error("device unplugged".to_string()),
            VoiceError::AudioDevice(_)
        ));
    }
}
