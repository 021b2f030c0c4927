//! Turn pipeline: transcribe → generate (streamed) → synthesize per sentence → play.
//!
//! Sentences are synthesized while the model is still generating, and each
//! finished clip goes straight to the playback queue under the turn's
//! generation. The turn's cancellation token cuts every stage: the in-flight
//! request, the retry backoff, pending synthesis tasks and the playback wait.

use crate::audio::encode_wav;
use crate::config::TurnConfig;
use crate::error::ProviderError;
use crate::events::{BillingEvent, BillingSink, EventEmitter, SessionEvent, UiState};
use crate::playback::{AudioPlaybackQueue, PlaybackItem, PlaybackWait};
use crate::providers::{ChatMessage, ProviderCallCounts, Providers};
use crate::retry::RetryPolicy;
use crate::sentence::SentenceSplitter;
use crate::vad::SpeechSegment;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    Transcribing,
    Generating,
    Synthesizing,
    Playing,
    Done,
    Cancelled,
    Failed,
}

impl TurnState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnState::Done | TurnState::Cancelled | TurnState::Failed)
    }
}

/// Pipeline stage a failure came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStage {
    Transcription,
    Generation,
    Synthesis,
    Playback,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TurnFailure {
    pub stage: TurnStage,
    pub error: ProviderError,
}

impl TurnFailure {
    fn new(stage: TurnStage, error: ProviderError) -> Self {
        Self { stage, error }
    }

    fn cancelled(stage: TurnStage) -> Self {
        Self::new(stage, ProviderError::Cancelled)
    }
}

/// A sentence that made it into the playback queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedChunk {
    pub sequence_no: u64,
    pub text: String,
    pub duration_ms: u64,
}

/// One request/response cycle.
#[derive(Debug, Clone)]
pub struct Turn {
    pub id: u64,
    pub segment: SpeechSegment,
    pub transcript: String,
    pub model_response_text: String,
    pub queued_chunks: Vec<QueuedChunk>,
    pub state: TurnState,
    pub cancelled: bool,
    pub failure: Option<TurnFailure>,
}

impl Turn {
    pub fn new(id: u64, segment: SpeechSegment) -> Self {
        Self {
            id,
            segment,
            transcript: String::new(),
            model_response_text: String::new(),
            queued_chunks: Vec::new(),
            state: TurnState::Transcribing,
            cancelled: false,
            failure: None,
        }
    }
}

/// Finished turn plus the provider calls it cost.
#[derive(Debug, Clone)]
pub struct TurnReport {
    pub turn: Turn,
    pub calls: ProviderCallCounts,
}

#[derive(Debug, Default)]
struct CallCounter {
    transcribe: AtomicU32,
    generate: AtomicU32,
    synthesize: AtomicU32,
}

impl CallCounter {
    fn snapshot(&self) -> ProviderCallCounts {
        ProviderCallCounts {
            transcribe: self.transcribe.load(Ordering::Relaxed),
            generate: self.generate.load(Ordering::Relaxed),
            synthesize: self.synthesize.load(Ordering::Relaxed),
        }
    }
}

/// Runs turns against the providers and feeds the playback queue.
#[derive(Clone)]
pub struct StreamingOrchestrator {
    providers: Providers,
    retry: RetryPolicy,
    playback: AudioPlaybackQueue,
    config: TurnConfig,
    sample_rate: u32,
    events: EventEmitter,
    billing: Arc<dyn BillingSink>,
    session_id: Uuid,
}

impl StreamingOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        providers: Providers,
        retry: RetryPolicy,
        playback: AudioPlaybackQueue,
        config: TurnConfig,
        sample_rate: u32,
        events: EventEmitter,
        billing: Arc<dyn BillingSink>,
        session_id: Uuid,
    ) -> Self {
        Self {
            providers,
            retry,
            playback,
            config,
            sample_rate,
            events,
            billing,
            session_id,
        }
    }

    /// Drive a turn to a terminal state. Never fails the call: provider errors
    /// end the turn as `Failed`, cancellation as `Cancelled`.
    pub async fn run_turn(&self, mut turn: Turn, context: &[ChatMessage], cancel: CancellationToken) -> TurnReport {
        let counter = Arc::new(CallCounter::default());
        info!("▶️ Turn {} started ({}ms of speech)", turn.id, turn.segment.speech_ms);

        match self.drive(&mut turn, context, &cancel, &counter).await {
            Ok(()) => {
                turn.state = TurnState::Done;
                info!("✅ Turn {} done ({} chunks)", turn.id, turn.queued_chunks.len());
            }
            Err(failure) if failure.error.is_cancelled() || cancel.is_cancelled() => {
                turn.cancelled = true;
                turn.state = TurnState::Cancelled;
                debug!("Turn {} cancelled during {:?}", turn.id, failure.stage);
            }
            Err(failure) => {
                turn.state = TurnState::Failed;
                warn!("❌ Turn {} failed during {:?}: {}", turn.id, failure.stage, failure.error);
                // Later sentences may already be queued behind the one that failed.
                self.playback.interrupt();
                self.report_failure(&turn, &failure, &cancel, &counter).await;
                turn.failure = Some(failure);
            }
        }

        let calls = counter.snapshot();
        self.events.emit(SessionEvent::TurnFinished {
            turn_id: turn.id,
            state: turn.state,
        });
        self.billing.emit(BillingEvent::TurnCompleted {
            session_id: self.session_id,
            turn_id: turn.id,
            provider_call_counts: calls,
            outcome: turn.state,
        });
        TurnReport { turn, calls }
    }

    async fn drive(
        &self,
        turn: &mut Turn,
        context: &[ChatMessage],
        cancel: &CancellationToken,
        counter: &Arc<CallCounter>,
    ) -> Result<(), TurnFailure> {
        // Transcribing
        turn.state = TurnState::Transcribing;
        self.ui_state(UiState::Transcribing);

        let wav = encode_wav(&turn.segment.frames, self.sample_rate)
            .map_err(|e| TurnFailure::new(TurnStage::Transcription, ProviderError::Malformed(e.to_string())))?;
        let transcriber = &self.providers.transcriber;
        let label = format!("{}/transcribe", transcriber.name());
        let transcript = self
            .retry
            .execute(&label, cancel, || {
                counter.transcribe.fetch_add(1, Ordering::Relaxed);
                transcriber.transcribe(&wav, cancel)
            })
            .await
            .map_err(|e| TurnFailure::new(TurnStage::Transcription, e))?;

        let transcript = transcript.trim().to_string();
        turn.transcript = transcript.clone();
        if transcript.is_empty() {
            info!("Turn {}: empty transcript, nothing to answer", turn.id);
            return Ok(());
        }
        info!("📝 Turn {} transcript: {}", turn.id, transcript);
        self.events.emit(SessionEvent::Transcript {
            turn_id: turn.id,
            text: transcript.clone(),
        });

        // Generating (+ Synthesizing in parallel)
        turn.state = TurnState::Generating;
        self.ui_state(UiState::Thinking);
        let generation = self.playback.begin_turn();

        let model = &self.providers.language_model;
        let label = format!("{}/generate", model.name());
        let mut stream = self
            .retry
            .execute(&label, cancel, || {
                counter.generate.fetch_add(1, Ordering::Relaxed);
                model.generate_stream(&transcript, context, cancel)
            })
            .await
            .map_err(|e| TurnFailure::new(TurnStage::Generation, e))?;

        let mut splitter = SentenceSplitter::new(self.config.max_sentence_chars);
        let mut tasks: JoinSet<Result<QueuedChunk, ProviderError>> = JoinSet::new();
        let mut next_seq = 0u64;
        let mut stream_done = false;

        loop {
            if stream_done && tasks.is_empty() {
                break;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(TurnFailure::cancelled(turn_stage(turn.state)));
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    let chunk = match joined {
                        Ok(Ok(chunk)) => chunk,
                        Ok(Err(e)) => return Err(TurnFailure::new(TurnStage::Synthesis, e)),
                        Err(e) => {
                            return Err(TurnFailure::new(
                                TurnStage::Synthesis,
                                ProviderError::Malformed(format!("synthesis task failed: {}", e)),
                            ))
                        }
                    };
                    if turn.queued_chunks.is_empty() {
                        self.ui_state(UiState::Speaking);
                    }
                    debug!("Turn {}: chunk {} queued ({}ms)", turn.id, chunk.sequence_no, chunk.duration_ms);
                    turn.queued_chunks.push(chunk);
                }
                delta = stream.next(), if !stream_done => {
                    match delta {
                        Some(Ok(delta)) => {
                            turn.model_response_text.push_str(&delta.text);
                            self.events.emit(SessionEvent::ResponseText {
                                turn_id: turn.id,
                                text: turn.model_response_text.clone(),
                            });
                            for sentence in splitter.push(&delta.text) {
                                next_seq += 1;
                                self.spawn_synthesis(&mut tasks, next_seq, sentence, generation, cancel, counter);
                            }
                        }
                        Some(Err(e)) => return Err(TurnFailure::new(TurnStage::Generation, e)),
                        None => {
                            stream_done = true;
                            if let Some(rest) = splitter.finish() {
                                next_seq += 1;
                                self.spawn_synthesis(&mut tasks, next_seq, rest, generation, cancel, counter);
                            }
                            turn.state = TurnState::Synthesizing;
                            debug!("Turn {}: generation complete, {} sentences", turn.id, next_seq);
                        }
                    }
                }
            }
        }

        // Playing
        turn.state = TurnState::Playing;
        turn.queued_chunks.sort_by_key(|c| c.sequence_no);
        if next_seq == 0 {
            return Ok(());
        }
        match self.playback.wait_played(generation, next_seq, cancel).await {
            PlaybackWait::Finished => Ok(()),
            PlaybackWait::Interrupted | PlaybackWait::Cancelled => Err(TurnFailure::cancelled(TurnStage::Playback)),
        }
    }

    fn spawn_synthesis(
        &self,
        tasks: &mut JoinSet<Result<QueuedChunk, ProviderError>>,
        sequence_no: u64,
        text: String,
        generation: u64,
        cancel: &CancellationToken,
        counter: &Arc<CallCounter>,
    ) {
        let synthesizer = self.providers.synthesizer.clone();
        let retry = self.retry.clone();
        let playback = self.playback.clone();
        let cancel = cancel.clone();
        let counter = counter.clone();
        let label = format!("{}/synthesize", synthesizer.name());

        tasks.spawn(
            async move {
                let audio = retry
                    .execute(&label, &cancel, || {
                        counter.synthesize.fetch_add(1, Ordering::Relaxed);
                        synthesizer.synthesize(&text, &cancel)
                    })
                    .await?;

                let item = PlaybackItem::new(sequence_no, audio);
                let duration_ms = item.duration_ms;
                if !playback.enqueue_for(generation, item) {
                    // Generation moved on: the turn was interrupted.
                    return Err(ProviderError::Cancelled);
                }
                Ok(QueuedChunk {
                    sequence_no,
                    text,
                    duration_ms,
                })
            }
            .in_current_span(),
        );
    }

    /// Tell the user the turn failed; optionally speak a short cue.
    async fn report_failure(
        &self,
        turn: &Turn,
        failure: &TurnFailure,
        cancel: &CancellationToken,
        counter: &Arc<CallCounter>,
    ) {
        let cue = self.cue_for(failure);
        self.events.emit(SessionEvent::Error {
            category: failure.error.category(),
            message: cue.to_string(),
            turn_id: Some(turn.id),
        });

        if !self.config.spoken_fallback_cues || cancel.is_cancelled() {
            return;
        }

        // One attempt only: the synthesizer may be what just failed.
        let generation = self.playback.begin_turn();
        counter.synthesize.fetch_add(1, Ordering::Relaxed);
        let audio = match self.providers.synthesizer.synthesize(cue, cancel).await {
            Ok(audio) if !audio.is_empty() => audio,
            Ok(_) => return,
            Err(e) => {
                debug!("Fallback cue not spoken: {}", e);
                return;
            }
        };
        if self.playback.enqueue_for(generation, PlaybackItem::new(1, audio)) {
            self.ui_state(UiState::Speaking);
            let _ = self.playback.wait_played(generation, 1, cancel).await;
        }
    }

    fn cue_for(&self, failure: &TurnFailure) -> &str {
        if !failure.error.is_transient() {
            return &self.config.cue_unavailable;
        }
        match failure.stage {
            TurnStage::Transcription => &self.config.cue_not_understood,
            _ => &self.config.cue_connection,
        }
    }

    fn ui_state(&self, state: UiState) {
        self.events.emit(SessionEvent::State {
            session_id: self.session_id,
            state,
        });
    }
}

fn turn_stage(state: TurnState) -> TurnStage {
    match state {
        TurnState::Transcribing => TurnStage::Transcription,
        TurnState::Generating => TurnStage::Generation,
        TurnState::Synthesizing => TurnStage::Synthesis,
        _ => TurnStage::Playback,
    }
}
