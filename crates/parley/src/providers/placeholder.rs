//! Offline providers for running a call without any backend.

use super::{ChatMessage, LanguageModel, Synthesizer, TextDelta, TextDeltaStream, Transcriber};
use crate::error::ProviderError;
use futures::stream::{self, StreamExt};
use std::io::Cursor;
use tokio_util::sync::CancellationToken;

/// Placeholder STT: returns a fixed string, or a description of the clip.
#[derive(Debug, Default)]
pub struct PlaceholderTranscriber {
    /// If set, return this instead of the default message.
    pub response: Option<String>,
}

impl PlaceholderTranscriber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_response(s: impl Into<String>) -> Self {
        Self {
            response: Some(s.into()),
        }
    }
}

#[async_trait::async_trait]
impl Transcriber for PlaceholderTranscriber {
    fn name(&self) -> &str {
        "placeholder-transcription"
    }

    async fn transcribe(&self, audio_wav: &[u8], _cancel: &CancellationToken) -> Result<String, ProviderError> {
        if let Some(ref r) = self.response {
            return Ok(r.clone());
        }
        Ok(format!("I heard {} bytes of audio", audio_wav.len()))
    }
}

/// Echoes the transcript back, streamed in small chunks like a real model.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoLanguageModel;

const ECHO_CHUNK_CHARS: usize = 40;

#[async_trait::async_trait]
impl LanguageModel for EchoLanguageModel {
    fn name(&self) -> &str {
        "echo"
    }

    async fn generate_stream(
        &self,
        transcript: &str,
        _context: &[ChatMessage],
        _cancel: &CancellationToken,
    ) -> Result<TextDeltaStream, ProviderError> {
        let reply = format!("You said: {}.", transcript.trim().trim_end_matches(['.', '!', '?']));
        let chars: Vec<char> = reply.chars().collect();
        let chunks: Vec<Result<TextDelta, ProviderError>> = chars
            .chunks(ECHO_CHUNK_CHARS)
            .map(|c| {
                Ok(TextDelta {
                    text: c.iter().collect(),
                })
            })
            .collect();
        Ok(stream::iter(chunks).boxed())
    }
}

/// Produces silent 16kHz WAV clips, roughly as long as the text would take to say.
#[derive(Debug, Clone)]
pub struct PlaceholderSynthesizer {
    pub ms_per_word: u32,
    pub sample_rate: u32,
}

impl Default for PlaceholderSynthesizer {
    fn default() -> Self {
        Self {
            ms_per_word: 60,
            sample_rate: 16000,
        }
    }
}

impl PlaceholderSynthesizer {
    fn silence_wav(&self, duration_ms: u32) -> Result<Vec<u8>, ProviderError> {
        let spec = hound::WavSpec {
            channels: 1,
            sample_rate: self.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let samples = self.sample_rate as u64 * duration_ms as u64 / 1000;
        let mut cursor = Cursor::new(Vec::new());
        let encode = |cursor: &mut Cursor<Vec<u8>>| -> Result<(), hound::Error> {
            let mut writer = hound::WavWriter::new(cursor, spec)?;
            for _ in 0..samples {
                writer.write_sample(0i16)?;
            }
            writer.finalize()
        };
        encode(&mut cursor).map_err(|e| ProviderError::Malformed(e.to_string()))?;
        Ok(cursor.into_inner())
    }
}

#[async_trait::async_trait]
impl Synthesizer for PlaceholderSynthesizer {
    fn name(&self) -> &str {
        "placeholder-speech"
    }

    async fn synthesize(&self, text: &str, _cancel: &CancellationToken) -> Result<Vec<u8>, ProviderError> {
        let words = text.split_whitespace().count() as u32;
        if words == 0 {
            return Ok(Vec::new());
        }
        self.silence_wav(words * self.ms_per_word)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::playback::estimate_duration_ms;

    #[tokio::test]
    async fn test_placeholder_transcriber_fixed_response() {
        let t = PlaceholderTranscriber::with_response("hello there");
        let text = t.transcribe(b"RIFF", &CancellationToken::new()).await.unwrap();
        assert_eq!(text, "hello there");
    }

    #[tokio::test]
    async fn test_echo_streams_in_chunks() {
        let model = EchoLanguageModel;
        let long = "a fairly long sentence that should be split into more than one chunk";
        let stream = model.generate_stream(long, &[], &CancellationToken::new()).await.unwrap();
        let parts: Vec<String> = stream.map(|d| d.unwrap().text).collect().await;
        assert!(parts.len() > 1);
        assert!(parts.iter().all(|p| p.chars().count() <= ECHO_CHUNK_CHARS));
        assert_eq!(parts.concat(), format!("You said: {}.", long));
    }

    #[tokio::test]
    async fn test_silence_length_tracks_words() {
        let s = PlaceholderSynthesizer::default();
        let wav = s.synthesize("one two three four five", &CancellationToken::new()).await.unwrap();
        assert_eq!(estimate_duration_ms(&wav), 300);
        assert!(s.synthesize("   ", &CancellationToken::new()).await.unwrap().is_empty());
    }
}
