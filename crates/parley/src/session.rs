//! Call session: owns the microphone, the playback queue and the turn in
//! flight, and is the only place session state changes.
//!
//! ```text
//! Idle → Calibrating → Active(Listening ⇄ TurnInFlight) → Ending → Ended
//!             └──────────────┴── device/permission failure ──→ Error
//! ```
//!
//! One `tokio::select!` loop handles the max-duration timer, hangup, turn
//! completion and microphone frames. Frame handling (VAD, barge-in) never
//! awaits a provider, so barge-in is decided within the frame that confirms it.

use crate::audio::{AudioFrame, AudioFrameSource};
use crate::config::CallConfig;
use crate::error::{VoiceError, VoiceResult};
use crate::events::{BillingEvent, BillingSink, EndReason, EventEmitter, SessionEvent, UiState};
use crate::interrupt::InterruptController;
use crate::orchestrator::{StreamingOrchestrator, Turn, TurnReport, TurnState};
use crate::playback::{AudioPlaybackQueue, AudioSink};
use crate::providers::{ChatMessage, Providers};
use crate::retry::RetryPolicy;
use crate::vad::{SpeechSegment, VadEvent, VoiceActivityDetector};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// What the account may do, read once when the call starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VoiceEntitlement {
    pub voice_allowed: bool,

    /// Hard cap on call length; negative means unlimited.
    pub max_call_duration_ms: i64,
}

impl Default for VoiceEntitlement {
    fn default() -> Self {
        Self {
            voice_allowed: true,
            max_call_duration_ms: -1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActivePhase {
    Listening,
    TurnInFlight,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Idle,
    Calibrating,
    Active(ActivePhase),
    Ending,
    Ended,
    Error,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Ended | SessionState::Error)
    }
}

/// Control handle for a running session. Cheap to clone.
#[derive(Clone)]
pub struct SessionHandle {
    session_id: Uuid,
    hangup: CancellationToken,
    state: watch::Receiver<SessionState>,
}

impl SessionHandle {
    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    /// Ask the session to end. Safe to call any number of times.
    pub fn hangup(&self) {
        self.hangup.cancel();
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Wait until the session reaches `target`. Returns false if the session
    /// finished without getting there.
    pub async fn wait_for(&self, target: SessionState) -> bool {
        let mut rx = self.state.clone();
        let reached = rx
            .wait_for(|s| *s == target || s.is_terminal())
            .await
            .map(|s| *s == target);
        match reached {
            Ok(hit) => hit,
            Err(_) => *rx.borrow() == target,
        }
    }
}

/// How the call went.
#[derive(Debug, Clone, Serialize)]
pub struct CallSummary {
    pub session_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub reason: EndReason,
    pub final_state: SessionState,
    pub turns_completed: u32,
    pub turns_cancelled: u32,
    pub turns_failed: u32,
}

#[derive(Debug, Default, Clone, Copy)]
struct TurnStats {
    completed: u32,
    cancelled: u32,
    failed: u32,
}

struct InFlight {
    id: u64,
    cancel: CancellationToken,
    handle: JoinHandle<TurnReport>,
}

/// A single voice call.
pub struct CallSession {
    id: Uuid,
    config: CallConfig,
    entitlement: VoiceEntitlement,
    source: Box<dyn AudioFrameSource>,
    source_stopped: bool,
    providers: Providers,
    sink: Arc<dyn AudioSink>,
    events: EventEmitter,
    billing: Arc<dyn BillingSink>,
    hangup: CancellationToken,
    state_tx: Arc<watch::Sender<SessionState>>,
}

impl CallSession {
    pub fn new(
        config: CallConfig,
        entitlement: VoiceEntitlement,
        source: Box<dyn AudioFrameSource>,
        providers: Providers,
        sink: Arc<dyn AudioSink>,
        events: EventEmitter,
        billing: Arc<dyn BillingSink>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        let state_tx = Arc::new(state_tx);
        Self {
            id: Uuid::new_v4(),
            config,
            entitlement,
            source,
            source_stopped: false,
            providers,
            sink,
            events,
            billing,
            hangup: CancellationToken::new(),
            state_tx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            session_id: self.id,
            hangup: self.hangup.clone(),
            state: self.state_tx.subscribe(),
        }
    }

    /// Run the call to completion.
    pub async fn run(self) -> CallSummary {
        let span = info_span!("call", session_id = %self.id);
        self.run_call().instrument(span).await
    }

    async fn run_call(mut self) -> CallSummary {
        let started = Instant::now();
        let started_at = Utc::now();
        let entitlement = self.entitlement;

        if !entitlement.voice_allowed {
            info!("🚫 Voice not allowed for this account; ending call");
            self.emit_error(&VoiceError::NotAllowed, None);
            self.set_state(SessionState::Ended);
            return self.finish(started, started_at, EndReason::NotAllowed, TurnStats::default());
        }

        info!("📞 Call started (max duration: {}ms)", entitlement.max_call_duration_ms);
        self.billing.emit(BillingEvent::CallStarted { session_id: self.id });
        self.set_state(SessionState::Calibrating);

        let frames = match self.source.start() {
            Ok(frames) => frames,
            Err(e) => {
                error!("Microphone unavailable: {}", e);
                self.emit_error(&e, None);
                self.release_source();
                self.set_state(SessionState::Error);
                return self.finish(started, started_at, EndReason::Error, TurnStats::default());
            }
        };

        let deadline = (entitlement.max_call_duration_ms >= 0)
            .then(|| started + std::time::Duration::from_millis(entitlement.max_call_duration_ms as u64));

        let playback = AudioPlaybackQueue::new(self.sink.clone());
        let orchestrator = StreamingOrchestrator::new(
            self.providers.clone(),
            RetryPolicy::from_config(&self.config.retry),
            playback.clone(),
            self.config.turn.clone(),
            self.config.audio.sample_rate,
            self.events.clone(),
            self.billing.clone(),
            self.id,
        );
        let mut call = ActiveCall {
            session_id: self.id,
            max_context_messages: self.config.turn.max_context_messages,
            vad: VoiceActivityDetector::new(self.config.vad.clone()),
            interrupter: InterruptController::new(self.config.interrupt.clone(), self.config.vad.energy_floor),
            playback,
            orchestrator,
            session_token: CancellationToken::new(),
            in_flight: None,
            retiring: Vec::new(),
            context: Vec::new(),
            next_turn_id: 0,
            monitoring_playback: false,
            stats: TurnStats::default(),
            events: self.events.clone(),
            state_tx: self.state_tx.clone(),
        };

        let outcome = call.run_loop(frames, deadline, &self.hangup).await;
        let (reason, final_state) = match outcome {
            Ok(reason) => (reason, SessionState::Ended),
            Err(e) => {
                error!("Call failed: {}", e);
                self.emit_error(&e, None);
                (EndReason::Error, SessionState::Error)
            }
        };

        self.set_state(SessionState::Ending);
        call.wind_down().await;
        self.release_source();
        call.playback.shutdown().await;
        self.set_state(final_state);

        self.finish(started, started_at, reason, call.stats)
    }

    /// Stop the microphone exactly once.
    fn release_source(&mut self) {
        if self.source_stopped {
            return;
        }
        self.source_stopped = true;
        self.source.stop();
        debug!("Audio source released");
    }

    fn finish(&self, started: Instant, started_at: DateTime<Utc>, reason: EndReason, stats: TurnStats) -> CallSummary {
        let duration_ms = started.elapsed().as_millis() as i64;
        self.billing.emit(BillingEvent::CallEnded {
            session_id: self.id,
            duration_ms,
            reason,
        });
        info!("📴 Call ended after {}ms ({:?})", duration_ms, reason);
        CallSummary {
            session_id: self.id,
            started_at,
            duration_ms,
            reason,
            final_state: *self.state_tx.borrow(),
            turns_completed: stats.completed,
            turns_cancelled: stats.cancelled,
            turns_failed: stats.failed,
        }
    }

    fn set_state(&self, state: SessionState) {
        publish_state(&self.state_tx, &self.events, self.id, state);
    }

    fn emit_error(&self, err: &VoiceError, turn_id: Option<u64>) {
        self.events.emit(SessionEvent::Error {
            category: err.category(),
            message: err.user_message().to_string(),
            turn_id,
        });
    }
}

fn publish_state(
    state_tx: &watch::Sender<SessionState>,
    events: &EventEmitter,
    session_id: Uuid,
    state: SessionState,
) {
    let previous = state_tx.send_replace(state);
    if previous == state {
        return;
    }
    debug!("Session state {:?} -> {:?}", previous, state);

    let ui = match state {
        SessionState::Idle | SessionState::Active(ActivePhase::TurnInFlight) => return,
        SessionState::Calibrating => UiState::Calibrating,
        SessionState::Active(ActivePhase::Listening) => UiState::Listening,
        SessionState::Ending => UiState::Ending,
        SessionState::Ended => UiState::Ended,
        SessionState::Error => UiState::Error,
    };
    events.emit(SessionEvent::State { session_id, state: ui });
}

/// Everything that exists only while the microphone is open.
struct ActiveCall {
    session_id: Uuid,
    max_context_messages: usize,
    vad: VoiceActivityDetector,
    interrupter: InterruptController,
    playback: AudioPlaybackQueue,
    orchestrator: StreamingOrchestrator,
    session_token: CancellationToken,
    in_flight: Option<InFlight>,
    retiring: Vec<JoinHandle<TurnReport>>,
    context: Vec<ChatMessage>,
    next_turn_id: u64,
    monitoring_playback: bool,
    stats: TurnStats,
    events: EventEmitter,
    state_tx: Arc<watch::Sender<SessionState>>,
}

impl ActiveCall {
    async fn run_loop(
        &mut self,
        mut frames: crate::audio::FrameReceiver,
        deadline: Option<Instant>,
        hangup: &CancellationToken,
    ) -> VoiceResult<EndReason> {
        loop {
            enum Event {
                Deadline,
                Hangup,
                TurnFinished(Result<TurnReport, JoinError>),
                Frame(Option<AudioFrame>),
            }

            let event = tokio::select! {
                biased;
                _ = sleep_until(deadline) => Event::Deadline,
                _ = hangup.cancelled() => Event::Hangup,
                res = join_in_flight(&mut self.in_flight) => Event::TurnFinished(res),
                frame = frames.recv() => Event::Frame(frame),
            };

            match event {
                Event::Deadline => {
                    info!("⏱️ Max call duration reached");
                    return Ok(EndReason::MaxDuration);
                }
                Event::Hangup => {
                    info!("Hangup requested");
                    return Ok(EndReason::Hangup);
                }
                Event::TurnFinished(res) => {
                    self.in_flight = None;
                    self.on_turn_finished(res);
                }
                Event::Frame(Some(frame)) => self.on_frame(frame),
                Event::Frame(None) => {
                    return Err(VoiceError::AudioDevice("microphone stream closed".to_string()));
                }
            }
        }
    }

    fn on_frame(&mut self, frame: AudioFrame) {
        self.retiring.retain(|h| !h.is_finished());

        if self.vad.is_calibrated() && self.playback.is_playing() {
            if !self.monitoring_playback {
                self.monitoring_playback = true;
                self.interrupter.reset();
                if self.vad.hold_segment() {
                    debug!("Holding partial segment; assistant started speaking");
                }
            }
            if let Some(run) = self.interrupter.observe(&frame) {
                self.barge_in(run);
            }
            return;
        }
        if self.monitoring_playback {
            self.monitoring_playback = false;
            if self.vad.release_held() {
                debug!("Dropped held segment; playback ended without barge-in");
            }
        }

        match self.vad.process(frame) {
            Some(VadEvent::Calibrated(profile)) => {
                self.interrupter.calibrate(&profile);
                if *self.state_tx.borrow() == SessionState::Calibrating {
                    self.set_state(SessionState::Active(ActivePhase::Listening));
                }
            }
            Some(VadEvent::Recalibrating) => debug!("Re-calibrating ambient noise"),
            Some(VadEvent::SpeechStarted { at_ms }) => debug!("User speaking at {}ms", at_ms),
            Some(VadEvent::SpeechEnded(segment)) => self.on_segment(segment),
            Some(VadEvent::SpeechDiscarded { speech_ms }) => debug!("Ignored {}ms of noise", speech_ms),
            None => {}
        }
    }

    /// Barge-in confirmed: silence the assistant, cancel its turn, and let the
    /// VAD continue from the interrupting speech.
    fn barge_in(&mut self, run: Vec<AudioFrame>) {
        self.playback.interrupt();
        if let Some(turn) = self.in_flight.take() {
            info!("✋ Turn {} interrupted by the user", turn.id);
            turn.cancel.cancel();
            self.stats.cancelled += 1;
            self.retiring.push(turn.handle);
        }
        self.monitoring_playback = false;
        self.vad.start_segment_from(run);
        self.set_state(SessionState::Active(ActivePhase::Listening));
    }

    fn on_segment(&mut self, segment: SpeechSegment) {
        if let Some(turn) = &self.in_flight {
            info!(
                "Dropping {}ms segment: turn {} still in flight",
                segment.duration_ms(),
                turn.id
            );
            return;
        }

        self.next_turn_id += 1;
        let turn_id = self.next_turn_id;
        let cancel = self.session_token.child_token();
        let orchestrator = self.orchestrator.clone();
        let context = self.context.clone();
        let turn_cancel = cancel.clone();
        let span = info_span!("turn", session_id = %self.session_id, turn_id);

        let handle = tokio::spawn(
            async move {
                orchestrator
                    .run_turn(Turn::new(turn_id, segment), &context, turn_cancel)
                    .await
            }
            .instrument(span),
        );
        self.in_flight = Some(InFlight {
            id: turn_id,
            cancel,
            handle,
        });
        self.set_state(SessionState::Active(ActivePhase::TurnInFlight));
    }

    fn on_turn_finished(&mut self, res: Result<TurnReport, JoinError>) {
        match res {
            Ok(report) => {
                let turn = report.turn;
                match turn.state {
                    TurnState::Done => {
                        self.stats.completed += 1;
                        if !turn.transcript.is_empty() && !turn.model_response_text.is_empty() {
                            self.remember(turn.transcript, turn.model_response_text);
                        }
                    }
                    TurnState::Cancelled => self.stats.cancelled += 1,
                    _ => self.stats.failed += 1,
                }
            }
            Err(e) => {
                warn!("Turn task ended abnormally: {}", e);
                self.stats.failed += 1;
            }
        }
        self.set_state(SessionState::Active(ActivePhase::Listening));
    }

    fn remember(&mut self, user: String, assistant: String) {
        self.context.push(ChatMessage::user(user));
        self.context.push(ChatMessage::assistant(assistant));
        if self.context.len() > self.max_context_messages {
            let excess = self.context.len() - self.max_context_messages;
            self.context.drain(..excess);
        }
    }

    /// Cancel everything in flight and wait for it to settle.
    async fn wind_down(&mut self) {
        self.session_token.cancel();
        self.playback.interrupt();

        if let Some(turn) = self.in_flight.take() {
            debug!("Cancelling turn {} for shutdown", turn.id);
            turn.cancel.cancel();
            match turn.handle.await {
                Ok(report) if report.turn.state == TurnState::Done => self.stats.completed += 1,
                Ok(report) if report.turn.state == TurnState::Failed => self.stats.failed += 1,
                Ok(_) => self.stats.cancelled += 1,
                Err(e) => {
                    warn!("Turn task ended abnormally: {}", e);
                    self.stats.failed += 1;
                }
            }
        }
        for handle in self.retiring.drain(..) {
            let _ = handle.await;
        }
    }

    fn set_state(&self, state: SessionState) {
        publish_state(&self.state_tx, &self.events, self.session_id, state);
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn join_in_flight(in_flight: &mut Option<InFlight>) -> Result<TurnReport, JoinError> {
    match in_flight {
        Some(turn) => (&mut turn.handle).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_entitlement_is_unlimited() {
        let e = VoiceEntitlement::default();
        assert!(e.voice_allowed);
        assert!(e.max_call_duration_ms < 0);
    }

    #[test]
    fn test_terminal_states() {
        assert!(SessionState::Ended.is_terminal());
        assert!(SessionState::Error.is_terminal());
        assert!(!SessionState::Ending.is_terminal());
        assert!(!SessionState::Active(ActivePhase::Listening).is_terminal());
    }

    #[test]
    fn test_wait_for_resolves_on_target() {
        let (tx, rx) = watch::channel(SessionState::Idle);
        let handle = SessionHandle {
            session_id: Uuid::nil(),
            hangup: CancellationToken::new(),
            state: rx,
        };

        let mut wait = tokio_test::task::spawn(handle.wait_for(SessionState::Active(ActivePhase::Listening)));
        tokio_test::assert_pending!(wait.poll());

        tx.send_replace(SessionState::Calibrating);
        tokio_test::assert_pending!(wait.poll());

        tx.send_replace(SessionState::Active(ActivePhase::Listening));
        assert!(wait.is_woken());
        assert!(tokio_test::assert_ready!(wait.poll()));
    }

    #[test]
    fn test_wait_for_gives_up_on_terminal_state() {
        let (tx, rx) = watch::channel(SessionState::Calibrating);
        let handle = SessionHandle {
            session_id: Uuid::nil(),
            hangup: CancellationToken::new(),
            state: rx,
        };

        let mut wait = tokio_test::task::spawn(handle.wait_for(SessionState::Active(ActivePhase::Listening)));
        tokio_test::assert_pending!(wait.poll());
        tx.send_replace(SessionState::Error);
        assert!(!tokio_test::assert_ready!(wait.poll()));
    }

    #[test]
    fn test_state_publishing_maps_ui_states() {
        let (tx, _rx) = watch::channel(SessionState::Idle);
        let (events, mut rx) = EventEmitter::channel();
        let id = Uuid::nil();

        publish_state(&tx, &events, id, SessionState::Calibrating);
        publish_state(&tx, &events, id, SessionState::Calibrating);
        publish_state(&tx, &events, id, SessionState::Active(ActivePhase::TurnInFlight));
        publish_state(&tx, &events, id, SessionState::Ending);

        let mut seen = Vec::new();
        while let Ok(SessionEvent::State { state, .. }) = rx.try_recv() {
            seen.push(state);
        }
        assert_eq!(seen, vec![UiState::Calibrating, UiState::Ending]);
        assert_eq!(*tx.borrow(), SessionState::Ending);
    }
}
