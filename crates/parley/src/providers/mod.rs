//! Provider capabilities used by a turn: transcription, streamed generation
//! and speech synthesis.
//!
//! Every call takes the turn's cancellation token; implementations must return
//! [`ProviderError::Cancelled`] promptly once it fires.

pub mod openai;
pub mod placeholder;

use crate::error::ProviderError;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub use openai::{probe_health, HealthReport, OpenAiChatModel, OpenAiSpeech, OpenAiTranscriber};
pub use placeholder::{EchoLanguageModel, PlaceholderSynthesizer, PlaceholderTranscriber};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message of conversation context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// A piece of streamed model output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextDelta {
    pub text: String,
}

pub type TextDeltaStream = BoxStream<'static, Result<TextDelta, ProviderError>>;

#[async_trait::async_trait]
pub trait Transcriber: Send + Sync {
    fn name(&self) -> &str;

    /// Transcribe a 16-bit mono WAV clip. An empty string means nothing was said.
    async fn transcribe(&self, audio_wav: &[u8], cancel: &CancellationToken) -> Result<String, ProviderError>;
}

#[async_trait::async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    /// Open a streamed response. Errors while opening are retried by the
    /// caller; errors mid-stream end the turn.
    async fn generate_stream(
        &self,
        transcript: &str,
        context: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<TextDeltaStream, ProviderError>;
}

#[async_trait::async_trait]
pub trait Synthesizer: Send + Sync {
    fn name(&self) -> &str;

    /// Synthesize one sentence to encoded audio (WAV preferred).
    async fn synthesize(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<u8>, ProviderError>;
}

/// The three providers a session talks to.
#[derive(Clone)]
pub struct Providers {
    pub transcriber: Arc<dyn Transcriber>,
    pub language_model: Arc<dyn LanguageModel>,
    pub synthesizer: Arc<dyn Synthesizer>,
}

impl Providers {
    pub fn new(
        transcriber: Arc<dyn Transcriber>,
        language_model: Arc<dyn LanguageModel>,
        synthesizer: Arc<dyn Synthesizer>,
    ) -> Self {
        Self {
            transcriber,
            language_model,
            synthesizer,
        }
    }

    /// OpenAI-compatible HTTP providers.
    pub fn openai(config: &crate::config::ProviderConfig) -> crate::error::VoiceResult<Self> {
        Ok(Self::new(
            Arc::new(OpenAiTranscriber::new(config)?),
            Arc::new(OpenAiChatModel::new(config)?),
            Arc::new(OpenAiSpeech::new(config)?),
        ))
    }

    /// Offline providers: fixed transcript, echo model, silent audio.
    pub fn placeholder() -> Self {
        Self::new(
            Arc::new(PlaceholderTranscriber::new()),
            Arc::new(EchoLanguageModel),
            Arc::new(PlaceholderSynthesizer::default()),
        )
    }
}

/// Provider calls made for one turn, retries included.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderCallCounts {
    pub transcribe: u32,
    pub generate: u32,
    pub synthesize: u32,
}

impl ProviderCallCounts {
    pub fn total(&self) -> u32 {
        self.transcribe + self.generate + self.synthesize
    }
}
