//! Shared fixtures: a scripted microphone, a recording speaker and
//! deterministic providers. All timing runs on tokio's paused clock.

#![allow(dead_code)]

use futures::StreamExt;
use parley::{
    AudioFrameSource, AudioSink, BillingEvent, CallConfig, CallSession, ChannelBillingSink, ChannelFrameSource,
    ChatMessage, EventEmitter, FrameFeeder, FrameReceiver, LanguageModel, PlaybackItem, ProviderError, Providers,
    SessionEvent, SessionHandle, Synthesizer, TextDelta, TextDeltaStream, Transcriber, VoiceEntitlement, VoiceError,
    VoiceResult,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Room noise, well under the 0.02 energy floor.
pub const QUIET: i16 = 100;
/// Close-talking speech, ~0.24 normalized RMS.
pub const LOUD: i16 = 8000;

pub const FRAME_SAMPLES: usize = 800;
pub const FRAME_MS: u64 = 50;

// ---------------------------------------------------------------------------
// Microphone
// ---------------------------------------------------------------------------

/// Channel-fed source that counts lifecycle calls.
pub struct CountingSource {
    inner: ChannelFrameSource,
    pub starts: Arc<AtomicUsize>,
    pub stops: Arc<AtomicUsize>,
}

impl AudioFrameSource for CountingSource {
    fn start(&mut self) -> VoiceResult<FrameReceiver> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.inner.start()
    }

    fn stop(&mut self) {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.inner.stop();
    }
}

/// A microphone the OS refused to open.
pub struct DeniedSource;

impl AudioFrameSource for DeniedSource {
    fn start(&mut self) -> VoiceResult<FrameReceiver> {
        Err(VoiceError::Permission("access denied by user".to_string()))
    }

    fn stop(&mut self) {}
}

/// Feed `(amplitude, frames)` steps in real time, then keep the room quiet
/// until the session stops listening. Returns the instant each step began.
pub fn spawn_mic(feeder: FrameFeeder, script: Vec<(i16, usize)>) -> (JoinHandle<()>, Arc<Mutex<Vec<Instant>>>) {
    let marks = Arc::new(Mutex::new(Vec::new()));
    let step_marks = marks.clone();

    let handle = tokio::spawn(async move {
        for (amplitude, frames) in script {
            step_marks.lock().unwrap().push(Instant::now());
            for _ in 0..frames {
                if !feeder.push_samples(&[amplitude; FRAME_SAMPLES]) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(FRAME_MS)).await;
            }
        }
        while feeder.push_samples(&[QUIET; FRAME_SAMPLES]) {
            tokio::time::sleep(Duration::from_millis(FRAME_MS)).await;
        }
    });
    (handle, marks)
}

// ---------------------------------------------------------------------------
// Speaker
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct RecordingSink {
    pub played: Mutex<Vec<u64>>,
    pub stops: Mutex<Vec<Instant>>,
}

impl RecordingSink {
    pub fn played(&self) -> Vec<u64> {
        self.played.lock().unwrap().clone()
    }

    pub fn stops(&self) -> Vec<Instant> {
        self.stops.lock().unwrap().clone()
    }
}

impl AudioSink for RecordingSink {
    fn play(&self, item: &PlaybackItem) -> VoiceResult<()> {
        self.played.lock().unwrap().push(item.sequence_no);
        Ok(())
    }

    fn stop(&self) {
        self.stops.lock().unwrap().push(Instant::now());
    }
}

// ---------------------------------------------------------------------------
// Providers
// ---------------------------------------------------------------------------

pub struct FixedTranscriber(pub String);

#[async_trait::async_trait]
impl Transcriber for FixedTranscriber {
    fn name(&self) -> &str {
        "fixed"
    }

    async fn transcribe(&self, audio_wav: &[u8], _cancel: &CancellationToken) -> Result<String, ProviderError> {
        assert!(!audio_wav.is_empty(), "segment uploaded without audio");
        Ok(self.0.clone())
    }
}

/// Streams fixed deltas and records the context length of every call.
pub struct ScriptedModel {
    deltas: Vec<String>,
    pub contexts: Mutex<Vec<usize>>,
}

impl ScriptedModel {
    pub fn new(deltas: &[&str]) -> Self {
        Self {
            deltas: deltas.iter().map(|d| d.to_string()).collect(),
            contexts: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait::async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn generate_stream(
        &self,
        _transcript: &str,
        context: &[ChatMessage],
        _cancel: &CancellationToken,
    ) -> Result<TextDeltaStream, ProviderError> {
        self.contexts.lock().unwrap().push(context.len());
        let deltas: Vec<Result<TextDelta, ProviderError>> =
            self.deltas.iter().map(|text| Ok(TextDelta { text: text.clone() })).collect();
        Ok(futures::stream::iter(deltas).boxed())
    }
}

/// Returns opaque audio lasting `duration_ms` per sentence.
pub struct ToneSynth {
    duration_ms: u64,
    pub calls: AtomicUsize,
}

impl ToneSynth {
    pub fn new(duration_ms: u64) -> Self {
        Self {
            duration_ms,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl Synthesizer for ToneSynth {
    fn name(&self) -> &str {
        "tone"
    }

    async fn synthesize(&self, _text: &str, _cancel: &CancellationToken) -> Result<Vec<u8>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        // Not WAV, so the queue estimates 16 bytes per millisecond.
        Ok(vec![0x55; (self.duration_ms * 16) as usize])
    }
}

pub fn providers(model: Arc<ScriptedModel>, synth_ms: u64) -> Providers {
    Providers::new(
        Arc::new(FixedTranscriber("hello there".to_string())),
        model,
        Arc::new(ToneSynth::new(synth_ms)),
    )
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub struct Harness {
    pub session: CallSession,
    pub handle: SessionHandle,
    pub feeder: FrameFeeder,
    pub sink: Arc<RecordingSink>,
    pub events: UnboundedReceiver<SessionEvent>,
    pub billing: UnboundedReceiver<BillingEvent>,
    pub starts: Arc<AtomicUsize>,
    pub stops: Arc<AtomicUsize>,
}

pub fn test_config() -> CallConfig {
    let mut config = CallConfig::default();
    config.retry.delays_ms = vec![10, 20];
    config
}

pub fn harness(providers: Providers, entitlement: VoiceEntitlement) -> Harness {
    let config = test_config();
    let (inner, feeder) = ChannelFrameSource::new(&config.audio);
    let starts = Arc::new(AtomicUsize::new(0));
    let stops = Arc::new(AtomicUsize::new(0));
    let source = CountingSource {
        inner,
        starts: starts.clone(),
        stops: stops.clone(),
    };
    let sink = Arc::new(RecordingSink::default());
    let (events, events_rx) = EventEmitter::channel();
    let (billing, billing_rx) = ChannelBillingSink::new();

    let session = CallSession::new(
        config,
        entitlement,
        Box::new(source),
        providers,
        sink.clone(),
        events,
        billing,
    );
    let handle = session.handle();

    Harness {
        session,
        handle,
        feeder,
        sink,
        events: events_rx,
        billing: billing_rx,
        starts,
        stops,
    }
}

/// Receive events until one matches; returns everything seen, match included.
pub async fn events_until(
    rx: &mut UnboundedReceiver<SessionEvent>,
    mut done: impl FnMut(&SessionEvent) -> bool,
) -> Vec<SessionEvent> {
    let mut seen = Vec::new();
    while let Some(event) = rx.recv().await {
        let stop = done(&event);
        seen.push(event);
        if stop {
            return seen;
        }
    }
    panic!("event stream closed before the expected event; saw {:?}", seen);
}

/// Whatever is still buffered.
pub fn drain<T>(rx: &mut UnboundedReceiver<T>) -> Vec<T> {
    let mut out = Vec::new();
    while let Ok(item) = rx.try_recv() {
        out.push(item);
    }
    out
}

pub fn ui_states(events: &[SessionEvent]) -> Vec<parley::UiState> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::State { state, .. } => Some(*state),
            _ => None,
        })
        .collect()
}
