//! Ordered playback of synthesized audio with an immediate kill-switch.
//!
//! The queue owns its buffer and its output sink. Items are played strictly by
//! `sequence_no`; `interrupt()` stops the sink and clears the buffer under the
//! same lock the player uses to start an item, so nothing queued before the
//! interrupt can start afterwards.
//!
//! Each turn plays under a *generation*. Interrupting bumps the generation, so
//! a synthesis task of a cancelled turn that finishes late is rejected instead
//! of talking over the user.

use crate::error::{VoiceError, VoiceResult};
use rodio::{OutputStream, Sink, Source};
use std::collections::BTreeMap;
use std::io::Cursor;
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often a device that reports completion is asked whether it is done.
const COMPLETION_POLL: Duration = Duration::from_millis(20);

/// One synthesized chunk of a turn's response.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackItem {
    /// 1-based, strictly increasing within a turn
    pub sequence_no: u64,
    pub audio_bytes: Vec<u8>,
    pub duration_ms: u64,
}

impl PlaybackItem {
    pub fn new(sequence_no: u64, audio_bytes: Vec<u8>) -> Self {
        let duration_ms = estimate_duration_ms(&audio_bytes);
        Self {
            sequence_no,
            audio_bytes,
            duration_ms,
        }
    }
}

/// Output device abstraction. `play` must not block for the item's duration.
pub trait AudioSink: Send + Sync {
    fn play(&self, item: &PlaybackItem) -> VoiceResult<()>;

    /// Silence output immediately and drop anything buffered in the device.
    fn stop(&self);

    /// Whether the device has finished everything handed to `play`.
    ///
    /// `None` means the device cannot tell, and items are timed by their
    /// estimated duration instead.
    fn is_idle(&self) -> Option<bool> {
        None
    }
}

/// Progress of the current generation, published after every change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PlaybackProgress {
    pub generation: u64,
    pub played: u64,
}

/// Outcome of waiting for a turn's audio.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackWait {
    Finished,
    Interrupted,
    Cancelled,
}

#[derive(Default)]
struct QueueState {
    pending: BTreeMap<u64, PlaybackItem>,
    next_seq: u64,
    current: Option<u64>,
    played: u64,
    generation: u64,
    closed: bool,
}

impl QueueState {
    fn progress(&self) -> PlaybackProgress {
        PlaybackProgress {
            generation: self.generation,
            played: self.played,
        }
    }
}

struct Shared {
    state: Mutex<QueueState>,
    wake: Notify,
    progress: watch::Sender<PlaybackProgress>,
    sink: Arc<dyn AudioSink>,
    shutdown: CancellationToken,
    player: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Ordered, interruptible playback buffer. Cheap to clone.
#[derive(Clone)]
pub struct AudioPlaybackQueue {
    shared: Arc<Shared>,
}

impl AudioPlaybackQueue {
    /// Create the queue and spawn its player task. Must be called inside a tokio runtime.
    pub fn new(sink: Arc<dyn AudioSink>) -> Self {
        let (progress, _) = watch::channel(PlaybackProgress::default());
        let shared = Arc::new(Shared {
            state: Mutex::new(QueueState {
                next_seq: 1,
                ..Default::default()
            }),
            wake: Notify::new(),
            progress,
            sink,
            shutdown: CancellationToken::new(),
            player: Mutex::new(None),
        });

        let handle = tokio::spawn(run_player(shared.clone()));
        *shared.player.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);

        Self { shared }
    }

    /// Start a new turn: sequence numbers restart at 1 and anything left from
    /// the previous turn is dropped. Returns the generation the turn must
    /// enqueue under.
    pub fn begin_turn(&self) -> u64 {
        let mut state = self.shared.lock();
        if state.current.is_some() || !state.pending.is_empty() {
            self.shared.sink.stop();
        }
        state.generation += 1;
        state.next_seq = 1;
        state.played = 0;
        state.current = None;
        state.pending.clear();
        self.shared.progress.send_replace(state.progress());
        state.generation
    }

    /// Enqueue under the current generation.
    pub fn enqueue(&self, item: PlaybackItem) -> bool {
        let generation = self.shared.lock().generation;
        self.enqueue_for(generation, item)
    }

    /// Enqueue for a specific turn. Rejected when the turn was interrupted,
    /// the sequence number was already played or queued, or the queue is shut down.
    pub fn enqueue_for(&self, generation: u64, item: PlaybackItem) -> bool {
        let mut state = self.shared.lock();
        if state.closed || state.generation != generation {
            debug!(
                "Rejecting item {} for stale generation {} (current {})",
                item.sequence_no, generation, state.generation
            );
            return false;
        }
        if item.sequence_no < state.next_seq
            || state.current == Some(item.sequence_no)
            || state.pending.contains_key(&item.sequence_no)
        {
            warn!("Rejecting duplicate playback item {}", item.sequence_no);
            return false;
        }
        debug!("Queued item {} ({}ms)", item.sequence_no, item.duration_ms);
        state.pending.insert(item.sequence_no, item);
        drop(state);
        self.shared.wake.notify_one();
        true
    }

    /// Stop output now and discard everything queued. Safe to call repeatedly;
    /// returns whether anything was playing or queued.
    pub fn interrupt(&self) -> bool {
        let mut state = self.shared.lock();
        let was_active = state.current.is_some() || !state.pending.is_empty();
        self.shared.sink.stop();
        state.pending.clear();
        state.current = None;
        state.next_seq = 1;
        state.played = 0;
        state.generation += 1;
        self.shared.progress.send_replace(state.progress());
        drop(state);

        if was_active {
            info!("🔇 Playback interrupted");
        }
        was_active
    }

    /// Whether an item is playing or waiting to play.
    pub fn is_playing(&self) -> bool {
        let state = self.shared.lock();
        state.current.is_some() || !state.pending.is_empty()
    }

    pub fn progress(&self) -> PlaybackProgress {
        *self.shared.progress.borrow()
    }

    /// Wait until `count` items of `generation` have played.
    pub async fn wait_played(&self, generation: u64, count: u64, cancel: &CancellationToken) -> PlaybackWait {
        let mut rx = self.shared.progress.subscribe();
        let reached = async {
            rx.wait_for(|p| p.generation != generation || p.played >= count)
                .await
                .map(|p| *p)
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => PlaybackWait::Cancelled,
            res = reached => match res {
                Ok(p) if p.generation == generation => PlaybackWait::Finished,
                _ => PlaybackWait::Interrupted,
            },
        }
    }

    /// Stop playback and the player task. Further enqueues are rejected.
    pub async fn shutdown(&self) {
        {
            let mut state = self.shared.lock();
            if !state.closed {
                state.closed = true;
                state.pending.clear();
                state.current = None;
                state.generation += 1;
                self.shared.sink.stop();
                self.shared.progress.send_replace(state.progress());
            }
        }
        self.shared.shutdown.cancel();

        let handle = self.shared.player.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(handle) = handle {
            let _ = handle.await;
            debug!("Playback player stopped");
        }
    }
}

/// An item handed to the sink.
struct Started {
    generation: u64,
    sequence_no: u64,
    duration_ms: u64,
    audible: bool,
}

/// Pick the next in-order item and hand it to the sink, atomically with
/// respect to `interrupt()`.
fn start_next(shared: &Shared) -> Option<Started> {
    let mut state = shared.lock();
    if state.closed || state.current.is_some() {
        return None;
    }
    let next_seq = state.next_seq;
    let item = state.pending.remove(&next_seq)?;
    state.current = Some(next_seq);
    state.next_seq += 1;

    let audible = match shared.sink.play(&item) {
        Ok(()) => true,
        Err(e) => {
            warn!("Skipping item {}: {}", item.sequence_no, e);
            false
        }
    };
    Some(Started {
        generation: state.generation,
        sequence_no: item.sequence_no,
        duration_ms: item.duration_ms,
        audible,
    })
}

fn finish_current(shared: &Shared, generation: u64, sequence_no: u64) {
    let mut state = shared.lock();
    if state.generation != generation || state.current != Some(sequence_no) {
        return;
    }
    state.current = None;
    state.played += 1;
    debug!("Finished item {} ({} played)", sequence_no, state.played);
    shared.progress.send_replace(state.progress());
}

/// Resolve once the device is done with `started`. Devices that report
/// completion are polled; the rest are trusted for the estimated duration.
async fn played_out(shared: &Shared, started: &Started) {
    if !started.audible {
        return;
    }
    if shared.sink.is_idle().is_none() {
        tokio::time::sleep(Duration::from_millis(started.duration_ms)).await;
        return;
    }
    let mut poll = tokio::time::interval(COMPLETION_POLL);
    poll.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        poll.tick().await;
        if shared.sink.is_idle() != Some(false) {
            return;
        }
    }
}

async fn run_player(shared: Arc<Shared>) {
    loop {
        let Some(started) = start_next(&shared) else {
            tokio::select! {
                _ = shared.wake.notified() => {}
                _ = shared.shutdown.cancelled() => return,
            }
            continue;
        };

        let generation = started.generation;
        let mut rx = shared.progress.subscribe();
        let interrupted = async {
            let _ = rx.wait_for(|p| p.generation != generation).await;
        };

        tokio::select! {
            _ = played_out(&shared, &started) => {
                finish_current(&shared, generation, started.sequence_no);
            }
            _ = interrupted => {}
            _ = shared.shutdown.cancelled() => return,
        }
    }
}

/// Best-effort duration of an encoded clip: exact for WAV, otherwise a
/// 128kbps estimate.
pub fn estimate_duration_ms(bytes: &[u8]) -> u64 {
    if bytes.is_empty() {
        return 0;
    }
    if let Ok(reader) = hound::WavReader::new(Cursor::new(bytes)) {
        let rate = reader.spec().sample_rate as u64;
        if rate > 0 {
            return reader.duration() as u64 * 1000 / rate;
        }
    }
    bytes.len() as u64 / 16
}

/// Speaker output through rodio (default output device).
///
/// `OutputStream` is not `Send`, so a dedicated thread owns it for as long as
/// this sink lives; the `Sink` itself is shared.
pub struct RodioSink {
    sink: Arc<Sink>,
    _keepalive: std_mpsc::Sender<()>,
}

impl RodioSink {
    pub fn open_default() -> VoiceResult<Self> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<Arc<Sink>>>();
        let (keepalive_tx, keepalive_rx) = std_mpsc::channel::<()>();

        thread::Builder::new()
            .name("parley-playback".to_string())
            .spawn(move || {
                let (stream, handle) = match OutputStream::try_default() {
                    Ok(pair) => pair,
                    Err(e) => {
                        let _ = ready_tx.send(Err(VoiceError::Playback(e.to_string())));
                        return;
                    }
                };
                match Sink::try_new(&handle) {
                    Ok(sink) => {
                        let _ = ready_tx.send(Ok(Arc::new(sink)));
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(VoiceError::Playback(e.to_string())));
                        return;
                    }
                }
                // Returns once the RodioSink (and its sender) is dropped.
                let _ = keepalive_rx.recv();
                drop(stream);
            })?;

        let sink = ready_rx
            .recv()
            .map_err(|_| VoiceError::Playback("output thread exited during startup".to_string()))??;
        info!("🔊 Output sink ready");

        Ok(Self {
            sink,
            _keepalive: keepalive_tx,
        })
    }
}

impl AudioSink for RodioSink {
    fn play(&self, item: &PlaybackItem) -> VoiceResult<()> {
        if item.audio_bytes.is_empty() {
            return Ok(());
        }
        let cursor = Cursor::new(item.audio_bytes.clone());
        let source = rodio::Decoder::new(cursor)
            .map_err(|e| VoiceError::Playback(format!("Decode failed: {}", e)))?;
        self.sink.append(source.convert_samples::<f32>());
        Ok(())
    }

    fn stop(&self) {
        self.sink.stop();
    }

    fn is_idle(&self) -> Option<bool> {
        Some(self.sink.empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        played: Mutex<Vec<u64>>,
        stops: Mutex<usize>,
    }

    impl AudioSink for RecordingSink {
        fn play(&self, item: &PlaybackItem) -> VoiceResult<()> {
            self.played.lock().unwrap().push(item.sequence_no);
            Ok(())
        }

        fn stop(&self) {
            *self.stops.lock().unwrap() += 1;
        }
    }

    /// A device that says when it has run out of audio.
    #[derive(Default)]
    struct DeviceSink {
        played: Mutex<Vec<u64>>,
        busy: std::sync::atomic::AtomicBool,
    }

    impl DeviceSink {
        fn drain(&self) {
            self.busy.store(false, std::sync::atomic::Ordering::SeqCst);
        }
    }

    impl AudioSink for DeviceSink {
        fn play(&self, item: &PlaybackItem) -> VoiceResult<()> {
            self.played.lock().unwrap().push(item.sequence_no);
            self.busy.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }

        fn stop(&self) {
            self.drain();
        }

        fn is_idle(&self) -> Option<bool> {
            Some(!self.busy.load(std::sync::atomic::Ordering::SeqCst))
        }
    }

    fn item(seq: u64, ms: u64) -> PlaybackItem {
        PlaybackItem {
            sequence_no: seq,
            audio_bytes: vec![0; 4],
            duration_ms: ms,
        }
    }

    fn queue() -> (AudioPlaybackQueue, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        (AudioPlaybackQueue::new(sink.clone()), sink)
    }

    #[tokio::test(start_paused = true)]
    async fn test_out_of_order_items_play_in_sequence() {
        let (q, sink) = queue();
        let generation = q.begin_turn();
        assert!(q.enqueue_for(generation, item(2, 100)));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(sink.played.lock().unwrap().is_empty());

        assert!(q.enqueue_for(generation, item(1, 100)));
        let done = q.wait_played(generation, 2, &CancellationToken::new()).await;
        assert_eq!(done, PlaybackWait::Finished);
        assert_eq!(*sink.played.lock().unwrap(), vec![1, 2]);
        assert!(!q.is_playing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupt_clears_and_rejects_stale() {
        let (q, sink) = queue();
        let generation = q.begin_turn();
        q.enqueue_for(generation, item(1, 1000));
        q.enqueue_for(generation, item(2, 1000));
        tokio::task::yield_now().await;
        assert!(q.is_playing());

        assert!(q.interrupt());
        assert!(!q.is_playing());
        assert!(!q.interrupt());
        assert!(!q.enqueue_for(generation, item(3, 100)));

        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!sink.played.lock().unwrap().contains(&2));
        assert!(*sink.stops.lock().unwrap() >= 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_reports_interruption() {
        let (q, _sink) = queue();
        let generation = q.begin_turn();
        q.enqueue_for(generation, item(1, 5000));

        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.wait_played(generation, 1, &CancellationToken::new()).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        q.interrupt();
        assert_eq!(waiter.await.unwrap(), PlaybackWait::Interrupted);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_sequence_rejected() {
        let (q, _sink) = queue();
        let generation = q.begin_turn();
        assert!(q.enqueue_for(generation, item(1, 100)));
        assert!(!q.enqueue_for(generation, item(1, 100)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_idempotent() {
        let (q, _sink) = queue();
        q.shutdown().await;
        q.shutdown().await;
        assert!(!q.enqueue(item(1, 10)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_completion_follows_the_device() {
        let sink = Arc::new(DeviceSink::default());
        let q = AudioPlaybackQueue::new(sink.clone());
        let generation = q.begin_turn();

        // Estimated 100ms, but the device keeps playing.
        q.enqueue_for(generation, item(1, 100));
        // Estimated 5s, but the device finishes early.
        q.enqueue_for(generation, item(2, 5000));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(q.is_playing());
        assert_eq!(*sink.played.lock().unwrap(), vec![1]);

        sink.drain();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*sink.played.lock().unwrap(), vec![1, 2]);
        assert!(q.is_playing());

        sink.drain();
        let done = tokio::time::timeout(
            Duration::from_millis(100),
            q.wait_played(generation, 2, &CancellationToken::new()),
        )
        .await;
        assert_eq!(done, Ok(PlaybackWait::Finished));
        assert!(!q.is_playing());
    }

    #[test]
    fn test_wav_duration_probe() {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: 16000,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut cursor = Cursor::new(Vec::new());
        {
            let mut w = hound::WavWriter::new(&mut cursor, spec).unwrap();
            for _ in 0..8000 {
                w.write_sample(0i16).unwrap();
            }
            w.finalize().unwrap();
        }
        assert_eq!(estimate_duration_ms(&cursor.into_inner()), 500);
        assert_eq!(estimate_duration_ms(&[1u8; 1600]), 100);
        assert_eq!(estimate_duration_ms(&[]), 0);
    }
}
