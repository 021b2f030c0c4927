//! # Parley - Real-time Voice Calls
//!
//! Captures the microphone, detects when the user speaks, runs each utterance
//! through transcription → language model → speech synthesis, and plays the
//! answer back while still listening, so the user can interrupt at any time.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          CallSession                              │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────────────┐    │
//! │  │   Audio In   │→ │  Energy VAD  │→ │ StreamingOrchestrator │    │
//! │  │ (cpal/feed)  │  │ (calibrated) │  │ STT → LLM → TTS       │    │
//! │  └──────────────┘  └──────────────┘  └──────────────────────┘    │
//! │         ↓                                       ↓                 │
//! │  ┌──────────────┐   interrupt()   ┌──────────────────────┐       │
//! │  │  Interrupt   │ ──────────────→ │  AudioPlaybackQueue   │       │
//! │  │  Controller  │  cancel turn    │  (rodio, in order)    │       │
//! │  └──────────────┘                 └──────────────────────┘       │
//! └──────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod config;
pub mod error;
pub mod events;
pub mod interrupt;
pub mod orchestrator;
pub mod playback;
pub mod providers;
pub mod retry;
pub mod sentence;
pub mod session;
pub mod vad;

pub use audio::{encode_wav, AudioFrame, AudioFrameSource, ChannelFrameSource, CpalFrameSource, FrameFeeder, FrameReceiver};
pub use config::{AudioConfig, CallConfig, InterruptConfig, ProviderConfig, RetryConfig, TurnConfig, VadConfig};
pub use error::{ErrorCategory, ProviderError, VoiceError, VoiceResult};
pub use events::{
    BillingEvent, BillingSink, ChannelBillingSink, EndReason, EventEmitter, SessionEvent, TracingBillingSink, UiState,
};
pub use interrupt::InterruptController;
pub use orchestrator::{StreamingOrchestrator, Turn, TurnReport, TurnStage, TurnState};
pub use playback::{AudioPlaybackQueue, AudioSink, PlaybackItem, PlaybackWait, RodioSink};
pub use providers::{
    ChatMessage, LanguageModel, ProviderCallCounts, Providers, Synthesizer, TextDelta, TextDeltaStream, Transcriber,
};
pub use retry::RetryPolicy;
pub use sentence::SentenceSplitter;
pub use session::{ActivePhase, CallSession, CallSummary, SessionHandle, SessionState, VoiceEntitlement};
pub use vad::{CalibrationProfile, SpeechSegment, VadEvent, VoiceActivityDetector};
