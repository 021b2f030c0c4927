//! OpenAI-compatible HTTP providers (OpenAI, OpenRouter, LM Studio, local
//! whisper/piper servers exposing the same routes).
//!
//! - `POST {base}/audio/transcriptions` (multipart)
//! - `POST {base}/chat/completions` with `stream: true` (SSE)
//! - `POST {base}/audio/speech`
//! - `GET {base}/models` (health probe)

use super::{ChatMessage, LanguageModel, Synthesizer, TextDelta, TextDeltaStream, Transcriber};
use crate::config::ProviderConfig;
use crate::error::{ProviderError, VoiceError, VoiceResult};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

const HEALTH_TIMEOUT: Duration = Duration::from_secs(3);

fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path)
}

fn build_client(timeout: Duration) -> VoiceResult<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(5))
        .build()
        .map_err(|e| VoiceError::Config(format!("HTTP client: {}", e)))
}

fn authorize(request: reqwest::RequestBuilder, api_key: Option<&str>) -> reqwest::RequestBuilder {
    match api_key {
        Some(key) => request.bearer_auth(key),
        None => request,
    }
}

/// Race a request against the turn's cancellation.
async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, ProviderError>
where
    F: Future<Output = Result<T, ProviderError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ProviderError::Cancelled),
        res = fut => res,
    }
}

/// Turn a non-2xx response into a classified error.
async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let body = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
    warn!(target: "parley::providers", status = %status, "Provider returned HTTP {}: {}", status, body);
    Err(ProviderError::from_status(status.as_u16(), retry_after, body))
}

/// Speech-to-text through `/audio/transcriptions`.
#[derive(Debug, Clone)]
pub struct OpenAiTranscriber {
    url: String,
    api_key: Option<String>,
    model: String,
    language: String,
    client: reqwest::Client,
}

impl OpenAiTranscriber {
    pub fn new(config: &ProviderConfig) -> VoiceResult<Self> {
        let base = config.transcription_url.as_deref().unwrap_or(&config.base_url);
        Ok(Self {
            url: endpoint(base, "audio/transcriptions"),
            api_key: config.api_key.clone(),
            model: config.transcription_model.clone(),
            language: config.language.clone(),
            client: build_client(Duration::from_secs(config.request_timeout_secs))?,
        })
    }
}

#[async_trait::async_trait]
impl Transcriber for OpenAiTranscriber {
    fn name(&self) -> &str {
        "openai-transcription"
    }

    async fn transcribe(&self, audio_wav: &[u8], cancel: &CancellationToken) -> Result<String, ProviderError> {
        if audio_wav.is_empty() {
            return Ok(String::new());
        }
        let part = reqwest::multipart::Part::bytes(audio_wav.to_vec())
            .file_name("audio.wav")
            .mime_str("audio/wav")
            .map_err(|e| ProviderError::Malformed(e.to_string()))?;
        let form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("model", self.model.clone())
            .text("language", self.language.clone())
            .text("response_format", "json");

        let request = authorize(self.client.post(&self.url), self.api_key.as_deref()).multipart(form);

        cancellable(cancel, async {
            let response = check_status(request.send().await?).await?;
            let json: serde_json::Value = response.json().await?;
            let text = json
                .get("text")
                .and_then(|t| t.as_str())
                .ok_or_else(|| ProviderError::Malformed("transcription response has no text".to_string()))?;
            Ok::<_, ProviderError>(text.trim().to_string())
        })
        .await
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
    stream: bool,
}

#[derive(Deserialize, Debug)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize, Debug)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Debug, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// One decoded server-sent event of a chat completion stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Delta(String),
    Done,
}

/// Line-buffered decoder for `data: {...}` SSE frames. Bytes are buffered
/// until a newline so multi-byte characters split across chunks survive.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
}

impl SseDecoder {
    pub fn push(&mut self, bytes: &[u8]) -> Vec<SseEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = parse_sse_line(line.trim()) {
                events.push(event);
            }
        }
        events
    }
}

fn parse_sse_line(line: &str) -> Option<SseEvent> {
    let data = line.strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return Some(SseEvent::Done);
    }
    match serde_json::from_str::<StreamChunk>(data) {
        Ok(chunk) => chunk
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.delta.content)
            .filter(|content| !content.is_empty())
            .map(SseEvent::Delta),
        Err(e) => {
            debug!(target: "parley::providers", "Failed to parse SSE chunk: {} - data: {}", e, data);
            None
        }
    }
}

/// Streaming chat completions.
#[derive(Debug, Clone)]
pub struct OpenAiChatModel {
    url: String,
    api_key: Option<String>,
    model: String,
    temperature: f32,
    system_prompt: String,
    client: reqwest::Client,
}

impl OpenAiChatModel {
    pub fn new(config: &ProviderConfig) -> VoiceResult<Self> {
        Ok(Self {
            url: endpoint(&config.base_url, "chat/completions"),
            api_key: config.api_key.clone(),
            model: config.chat_model.clone(),
            temperature: config.temperature,
            system_prompt: config.system_prompt.clone(),
            client: build_client(Duration::from_secs(config.chat_timeout_secs))?,
        })
    }

    fn build_messages(&self, transcript: &str, context: &[ChatMessage]) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(context.len() + 2);
        if !self.system_prompt.trim().is_empty() {
            messages.push(ChatMessage::system(self.system_prompt.clone()));
        }
        messages.extend(context.iter().cloned());
        messages.push(ChatMessage::user(transcript));
        messages
    }
}

#[async_trait::async_trait]
impl LanguageModel for OpenAiChatModel {
    fn name(&self) -> &str {
        "openai-chat"
    }

    async fn generate_stream(
        &self,
        transcript: &str,
        context: &[ChatMessage],
        cancel: &CancellationToken,
    ) -> Result<TextDeltaStream, ProviderError> {
        let body = ChatRequest {
            model: &self.model,
            messages: self.build_messages(transcript, context),
            temperature: self.temperature,
            stream: true,
        };
        let request = authorize(self.client.post(&self.url), self.api_key.as_deref()).json(&body);

        let response = cancellable(cancel, async {
            let response = request.send().await?;
            check_status(response).await
        })
        .await?;
        info!(target: "parley::providers", model = %self.model, "SSE stream established");

        let (tx, rx) = mpsc::channel::<Result<TextDelta, ProviderError>>(64);
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            let mut decoder = SseDecoder::default();
            loop {
                let chunk = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        let _ = tx.send(Err(ProviderError::Cancelled)).await;
                        return;
                    }
                    _ = tx.closed() => return,
                    chunk = bytes.next() => chunk,
                };
                let chunk = match chunk {
                    Some(Ok(chunk)) => chunk,
                    Some(Err(e)) => {
                        let _ = tx.send(Err(ProviderError::from(e))).await;
                        return;
                    }
                    None => return,
                };
                for event in decoder.push(&chunk) {
                    match event {
                        SseEvent::Delta(text) => {
                            if tx.send(Ok(TextDelta { text })).await.is_err() {
                                return;
                            }
                        }
                        SseEvent::Done => {
                            debug!(target: "parley::providers", "Chat stream completed");
                            return;
                        }
                    }
                }
            }
        }
        .in_current_span());

        Ok(ReceiverStream::new(rx).boxed())
    }
}

#[derive(Serialize)]
struct SpeechRequest<'a> {
    model: &'a str,
    input: &'a str,
    voice: &'a str,
    response_format: &'a str,
}

/// Text-to-speech through `/audio/speech`, requesting WAV.
#[derive(Debug, Clone)]
pub struct OpenAiSpeech {
    url: String,
    api_key: Option<String>,
    model: String,
    voice: String,
    client: reqwest::Client,
}

impl OpenAiSpeech {
    pub fn new(config: &ProviderConfig) -> VoiceResult<Self> {
        let base = config.synthesis_url.as_deref().unwrap_or(&config.base_url);
        Ok(Self {
            url: endpoint(base, "audio/speech"),
            api_key: config.api_key.clone(),
            model: config.speech_model.clone(),
            voice: config.voice.clone(),
            client: build_client(Duration::from_secs(config.request_timeout_secs))?,
        })
    }
}

#[async_trait::async_trait]
impl Synthesizer for OpenAiSpeech {
    fn name(&self) -> &str {
        "openai-speech"
    }

    async fn synthesize(&self, text: &str, cancel: &CancellationToken) -> Result<Vec<u8>, ProviderError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(Vec::new());
        }
        let body = SpeechRequest {
            model: &self.model,
            input: text,
            voice: &self.voice,
            response_format: "wav",
        };
        let request = authorize(self.client.post(&self.url), self.api_key.as_deref()).json(&body);

        cancellable(cancel, async {
            let response = check_status(request.send().await?).await?;
            Ok::<_, ProviderError>(response.bytes().await?.to_vec())
        })
        .await
    }
}

/// Result of probing the provider endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub url: String,
    pub reachable: bool,
    pub status: Option<u16>,
    pub models: Vec<String>,
    pub error: Option<String>,
}

/// `GET {base}/models` with a short timeout.
pub async fn probe_health(config: &ProviderConfig) -> HealthReport {
    let url = endpoint(&config.base_url, "models");
    let mut report = HealthReport {
        url: url.clone(),
        reachable: false,
        status: None,
        models: Vec::new(),
        error: None,
    };

    let client = match build_client(HEALTH_TIMEOUT) {
        Ok(client) => client,
        Err(e) => {
            report.error = Some(e.to_string());
            return report;
        }
    };

    match authorize(client.get(&url), config.api_key.as_deref()).send().await {
        Ok(response) => {
            report.reachable = true;
            report.status = Some(response.status().as_u16());
            if response.status().is_success() {
                if let Ok(json) = response.json::<serde_json::Value>().await {
                    report.models = json
                        .get("data")
                        .and_then(|d| d.as_array())
                        .map(|models| {
                            models
                                .iter()
                                .filter_map(|m| m.get("id").and_then(|id| id.as_str()).map(str::to_string))
                                .collect()
                        })
                        .unwrap_or_default();
                }
            }
        }
        Err(e) => report.error = Some(e.to_string()),
    }
    report
}
