//! Audio capture: fixed-size PCM frames with timestamp and energy.
//!
//! The capture stream is owned exclusively by the frame source; everything
//! downstream only ever sees [`AudioFrame`] values.

use crate::config::AudioConfig;
use crate::error::{VoiceError, VoiceResult};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::StreamConfig;
use std::io::Cursor;
use std::sync::mpsc as std_mpsc;
use std::thread;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Receiving half of a started frame source.
pub type FrameReceiver = mpsc::UnboundedReceiver<AudioFrame>;

/// One frame of mono PCM16 audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// PCM samples (i16, mono)
    pub samples: Vec<i16>,

    pub sample_rate_hz: u32,

    /// Capture time of the first sample, relative to capture start
    pub timestamp_ms: i64,

    /// Normalized RMS (0.0 to 1.0)
    pub rms_energy: f32,
}

impl AudioFrame {
    pub fn new(samples: Vec<i16>, sample_rate_hz: u32, timestamp_ms: i64) -> Self {
        let rms_energy = rms_energy(&samples);
        Self {
            samples,
            sample_rate_hz,
            timestamp_ms,
            rms_energy,
        }
    }

    pub fn duration_ms(&self) -> i64 {
        if self.sample_rate_hz == 0 {
            return 0;
        }
        (self.samples.len() as i64 * 1000) / self.sample_rate_hz as i64
    }

    pub fn end_ms(&self) -> i64 {
        self.timestamp_ms + self.duration_ms()
    }
}

/// Root-mean-square of PCM16 samples, normalized to full scale.
pub fn rms_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples
        .iter()
        .map(|&s| {
            let v = s as f64 / 32768.0;
            v * v
        })
        .sum();
    (sum / samples.len() as f64).sqrt() as f32
}

/// Source of microphone frames.
///
/// `stop()` must release every capture resource before it returns and must be
/// safe to call more than once.
pub trait AudioFrameSource: Send {
    fn start(&mut self) -> VoiceResult<FrameReceiver>;

    fn stop(&mut self);
}

/// Cuts an arbitrary sample stream into fixed frames and stamps them.
struct FrameAssembler {
    frame_samples: usize,
    sample_rate: u32,
    buffer: Vec<i16>,
    emitted_samples: u64,
}

impl FrameAssembler {
    fn new(config: &AudioConfig) -> Self {
        let frame_samples = config.frame_samples().max(1);
        Self {
            frame_samples,
            sample_rate: config.sample_rate,
            buffer: Vec::with_capacity(frame_samples),
            emitted_samples: 0,
        }
    }

    fn push(&mut self, samples: impl IntoIterator<Item = i16>, mut emit: impl FnMut(AudioFrame)) {
        for sample in samples {
            self.buffer.push(sample);
            if self.buffer.len() >= self.frame_samples {
                let timestamp_ms = (self.emitted_samples * 1000 / self.sample_rate as u64) as i64;
                let samples = std::mem::replace(&mut self.buffer, Vec::with_capacity(self.frame_samples));
                self.emitted_samples += samples.len() as u64;
                emit(AudioFrame::new(samples, self.sample_rate, timestamp_ms));
            }
        }
    }
}

/// Capture thread bookkeeping. The `cpal::Stream` itself never leaves that thread.
struct CaptureWorker {
    stop_tx: std_mpsc::Sender<()>,
    handle: thread::JoinHandle<()>,
}

/// Microphone capture through CPAL (default input device).
pub struct CpalFrameSource {
    config: AudioConfig,
    worker: Option<CaptureWorker>,
}

impl CpalFrameSource {
    pub fn new(config: AudioConfig) -> Self {
        Self { config, worker: None }
    }

    /// List available input devices
    pub fn list_input_devices() -> VoiceResult<Vec<String>> {
        let host = cpal::default_host();
        let devices = host.input_devices()?;

        let mut device_names = Vec::new();
        for device in devices {
            if let Ok(name) = device.name() {
                device_names.push(name);
            }
        }

        Ok(device_names)
    }

    pub fn is_capturing(&self) -> bool {
        self.worker.is_some()
    }
}

fn open_input_stream(config: &AudioConfig, frame_tx: mpsc::UnboundedSender<AudioFrame>) -> VoiceResult<cpal::Stream> {
    let device = cpal::default_host()
        .default_input_device()
        .ok_or_else(|| VoiceError::AudioDevice("No input device available".to_string()))?;

    info!("🎤 Using input device: {}", device.name().unwrap_or_else(|_| "Unknown".to_string()));

    // Probing the default config surfaces permission problems before we build anything.
    let default_config = device.default_input_config()?;
    debug!("Default input config: {:?}", default_config);

    let stream_config = StreamConfig {
        channels: 1,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let mut assembler = FrameAssembler::new(config);
    let stream = device.build_input_stream(
        &stream_config,
        move |data: &[f32], _: &cpal::InputCallbackInfo| {
            let samples = data.iter().map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16);
            assembler.push(samples, |frame| {
                if frame_tx.send(frame).is_err() {
                    debug!("Frame receiver dropped; discarding frame");
                }
            });
        },
        move |err| {
            warn!("Audio stream error: {}", err);
        },
        None,
    )?;

    stream.play()?;
    Ok(stream)
}

impl AudioFrameSource for CpalFrameSource {
    fn start(&mut self) -> VoiceResult<FrameReceiver> {
        if self.worker.is_some() {
            return Err(VoiceError::AudioStream("capture already started".to_string()));
        }

        info!(
            "▶️ Starting audio capture ({}Hz, {}ms frames)",
            self.config.sample_rate, self.config.frame_ms
        );

        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std_mpsc::channel::<VoiceResult<()>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let config = self.config.clone();

        // cpal::Stream is !Send on some platforms, so it lives and dies on this thread.
        let handle = thread::Builder::new()
            .name("parley-capture".to_string())
            .spawn(move || {
                let stream = match open_input_stream(&config, frame_tx) {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(()));
                // Blocks until stop() or until the source is dropped.
                let _ = stop_rx.recv();
                drop(stream);
            })?;

        match ready_rx.recv() {
            Ok(Ok(())) => {
                self.worker = Some(CaptureWorker { stop_tx, handle });
                info!("✅ Audio capture started");
                Ok(frame_rx)
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(VoiceError::AudioStream("capture thread exited during startup".to_string()))
            }
        }
    }

    fn stop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = worker.stop_tx.send(());
        if worker.handle.join().is_err() {
            warn!("Capture thread panicked during shutdown");
        }
        info!("⏹️ Audio capture released");
    }
}

impl Drop for CpalFrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Frame source fed by the host (e.g. PCM arriving over a socket).
pub struct ChannelFrameSource {
    pending_rx: Option<FrameReceiver>,
    feeder: FrameFeeder,
    stopped: bool,
}

/// Producer side of a [`ChannelFrameSource`]. Cheap to clone.
#[derive(Clone)]
pub struct FrameFeeder {
    frame_tx: mpsc::UnboundedSender<AudioFrame>,
    assembler: std::sync::Arc<std::sync::Mutex<FrameAssembler>>,
}

impl FrameFeeder {
    /// Append raw PCM; complete frames are emitted immediately.
    /// Returns false once the session has stopped listening.
    pub fn push_samples(&self, samples: &[i16]) -> bool {
        let mut assembler = self.assembler.lock().unwrap_or_else(|e| e.into_inner());
        let mut open = true;
        assembler.push(samples.iter().copied(), |frame| {
            open &= self.frame_tx.send(frame).is_ok();
        });
        open && !self.frame_tx.is_closed()
    }

    /// Send a pre-built frame as-is.
    pub fn push_frame(&self, frame: AudioFrame) -> bool {
        self.frame_tx.send(frame).is_ok()
    }
}

impl ChannelFrameSource {
    pub fn new(config: &AudioConfig) -> (Self, FrameFeeder) {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let feeder = FrameFeeder {
            frame_tx,
            assembler: std::sync::Arc::new(std::sync::Mutex::new(FrameAssembler::new(config))),
        };
        let source = Self {
            pending_rx: Some(frame_rx),
            feeder: feeder.clone(),
            stopped: false,
        };
        (source, feeder)
    }

    pub fn feeder(&self) -> FrameFeeder {
        self.feeder.clone()
    }
}

impl AudioFrameSource for ChannelFrameSource {
    fn start(&mut self) -> VoiceResult<FrameReceiver> {
        if self.stopped {
            return Err(VoiceError::AudioStream("source already stopped".to_string()));
        }
        self.pending_rx
            .take()
            .ok_or_else(|| VoiceError::AudioStream("source already started".to_string()))
    }

    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        self.pending_rx = None;
        debug!("Channel frame source stopped");
    }
}

/// Encode frames as 16-bit mono WAV for upload.
pub fn encode_wav(frames: &[AudioFrame], sample_rate: u32) -> VoiceResult<Vec<u8>> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = hound::WavWriter::new(&mut cursor, spec)?;
        for frame in frames {
            for &sample in &frame.samples {
                writer.write_sample(sample)?;
            }
        }
        writer.finalize()?;
    }
    Ok(cursor.into_inner())
}
