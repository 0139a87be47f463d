//! Speech synthesis backends.
//!
//! A synthesizer turns one line of text into a stream of 16-bit little-endian
//! PCM chunks. Chunk sizes are arbitrary; the playback engine re-slices them
//! into fixed frames.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use kokoro_tiny::TtsEngine;
use serde_json::json;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::SynthesisConfig;
use crate::error::ShowError;
use crate::host::HostPersona;

/// PCM byte chunks for one utterance.
pub type PcmStream = BoxStream<'static, Result<Vec<u8>, ShowError>>;

#[async_trait]
pub trait SpeechSynthesizer: Send + Sync {
    /// Start synthesizing `text`; chunks arrive as they are produced.
    async fn synthesize(&self, text: &str, voice: &str) -> Result<PcmStream, ShowError>;

    /// Which of the host's voices this backend speaks with.
    fn voice_for<'a>(&self, host: &'a HostPersona) -> &'a str {
        &host.voice_id
    }
}

/// ElevenLabs streaming text-to-speech.
pub struct ElevenLabsSynthesizer {
    client: reqwest::Client,
    api_key: String,
    api_base: String,
    model_id: String,
    sample_rate: u32,
}

impl ElevenLabsSynthesizer {
    pub fn new(
        config: &SynthesisConfig,
        api_key: impl Into<String>,
        sample_rate: u32,
    ) -> Result<Self, ShowError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            client,
            api_key: api_key.into(),
            api_base: config.api_base.trim_end_matches('/').to_string(),
            model_id: config.model_id.clone(),
            sample_rate,
        })
    }
}

#[async_trait]
impl SpeechSynthesizer for ElevenLabsSynthesizer {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<PcmStream, ShowError> {
        let url = format!("{}/v1/text-to-speech/{}/stream", self.api_base, voice);
        let response = self
            .client
            .post(&url)
            .query(&[("output_format", format!("pcm_{}", self.sample_rate))])
            .header("xi-api-key", &self.api_key)
            .json(&json!({ "text": text, "model_id": self.model_id }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ShowError::Synthesis(format!(
                "ElevenLabs returned {}: {}",
                status, body
            )));
        }

        debug!("Streaming speech for voice {}", voice);
        Ok(response
            .bytes_stream()
            .map(|chunk| {
                chunk
                    .map(|bytes| bytes.to_vec())
                    .map_err(|e| ShowError::Synthesis(format!("Stream interrupted: {}", e)))
            })
            .boxed())
    }
}

/// Native sample rate of the kokoro model.
pub const KOKORO_SAMPLE_RATE: u32 = 24_000;

/// Silence between text chunks (0.3 seconds at 24kHz).
const CHUNK_PAUSE_SAMPLES: usize = 7_200;

/// Kokoro has a ~200 char safe limit per call.
const KOKORO_MAX_CHARS: usize = 200;

struct KokoroRequest {
    text: String,
    voice: String,
    chunks: mpsc::Sender<Result<Vec<u8>, ShowError>>,
}

/// Local kokoro-tiny synthesis on a dedicated thread.
///
/// The engine is not shareable across tasks, so it lives on its own OS
/// thread and serves one utterance at a time. Each sentence group is sent as
/// soon as it is synthesized.
pub struct KokoroSynthesizer {
    requests: std::sync::mpsc::Sender<KokoroRequest>,
    voices: Arc<Vec<String>>,
}

impl KokoroSynthesizer {
    /// Load the model (downloads on first run) and start the worker thread.
    pub async fn new(output_rate: u32) -> Result<Self, ShowError> {
        let (requests, inbox) = std::sync::mpsc::channel::<KokoroRequest>();
        let (ready_tx, ready_rx) = oneshot::channel();

        std::thread::Builder::new()
            .name("kokoro-tts".to_string())
            .spawn(move || kokoro_worker(inbox, ready_tx, output_rate))?;

        let voices = ready_rx
            .await
            .map_err(|_| ShowError::Synthesis("TTS worker exited during startup".to_string()))??;

        info!("Kokoro TTS ready with {} voices", voices.len());
        Ok(Self {
            requests,
            voices: Arc::new(voices),
        })
    }

    /// Validate that a voice ID exists.
    pub fn validate_voice(&self, voice_id: &str) -> Result<(), ShowError> {
        if voice_id.is_empty() || !self.voices.iter().any(|v| v == voice_id) {
            return Err(ShowError::Synthesis(format!(
                "Unknown voice '{}'. Available voices:\n{}",
                voice_id,
                format_english_voices(&self.voices)
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl SpeechSynthesizer for KokoroSynthesizer {
    async fn synthesize(&self, text: &str, voice: &str) -> Result<PcmStream, ShowError> {
        self.validate_voice(voice)?;

        let (chunks, rx) = mpsc::channel(4);
        self.requests
            .send(KokoroRequest {
                text: text.to_string(),
                voice: voice.to_string(),
                chunks,
            })
            .map_err(|_| ShowError::Synthesis("TTS worker is not running".to_string()))?;

        Ok(receiver_stream(rx))
    }

    fn voice_for<'a>(&self, host: &'a HostPersona) -> &'a str {
        &host.local_voice
    }
}

fn kokoro_worker(
    inbox: std::sync::mpsc::Receiver<KokoroRequest>,
    ready: oneshot::Sender<Result<Vec<String>, ShowError>>,
    output_rate: u32,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send(Err(ShowError::Io(e)));
            return;
        }
    };

    let mut engine = match runtime.block_on(TtsEngine::new()) {
        Ok(engine) => engine,
        Err(e) => {
            let _ = ready.send(Err(ShowError::Synthesis(format!(
                "Failed to initialize TTS: {}",
                e
            ))));
            return;
        }
    };
    if ready.send(Ok(engine.voices())).is_err() {
        return;
    }

    while let Ok(request) = inbox.recv() {
        for chunk in split_into_chunks(&request.text, KOKORO_MAX_CHARS) {
            let result = engine
                .synthesize(&chunk, Some(request.voice.as_str()))
                .map(|mut samples| {
                    samples.extend(std::iter::repeat_n(0.0, CHUNK_PAUSE_SAMPLES));
                    f32_to_pcm16(&resample(samples, KOKORO_SAMPLE_RATE, output_rate))
                })
                .map_err(|e| ShowError::Synthesis(format!("Synthesis failed: {}", e)));

            let failed = result.is_err();
            if let Err(e) = &result {
                error!("Kokoro synthesis failed: {}", e);
            }
            if request.chunks.blocking_send(result).is_err() {
                // Listener went away, drop the rest of the utterance.
                warn!("Speech consumer dropped mid-utterance");
                break;
            }
            if failed {
                break;
            }
        }
    }
    debug!("Kokoro worker stopped");
}

fn receiver_stream<T: Send + 'static>(rx: mpsc::Receiver<T>) -> BoxStream<'static, T> {
    stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed()
}

fn format_english_voices(voices: &[String]) -> String {
    let mut english: Vec<&String> = voices
        .iter()
        .filter(|v| {
            v.starts_with("af_") || v.starts_with("am_") || v.starts_with("bf_") || v.starts_with("bm_")
        })
        .collect();
    english.sort();

    english
        .iter()
        .map(|v| format!("  - {}", v))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Split text into chunks that are safe for TTS synthesis.
pub fn split_into_chunks(text: &str, max_chars: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current_chunk = String::new();

    for sentence in text.split_inclusive(&['.', '!', '?', ';'][..]) {
        let sentence = sentence.trim();
        if sentence.is_empty() {
            continue;
        }

        if current_chunk.len() + sentence.len() > max_chars {
            if !current_chunk.is_empty() {
                chunks.push(current_chunk.trim().to_string());
                current_chunk = String::new();
            }

            // A single overlong sentence is split on commas.
            if sentence.len() > max_chars {
                for part in sentence.split_inclusive(',') {
                    if current_chunk.len() + part.len() > max_chars && !current_chunk.is_empty() {
                        chunks.push(current_chunk.trim().to_string());
                        current_chunk = String::new();
                    }
                    current_chunk.push_str(part.trim());
                    current_chunk.push(' ');
                }
                continue;
            }
        }

        current_chunk.push_str(sentence);
        current_chunk.push(' ');
    }

    if !current_chunk.trim().is_empty() {
        chunks.push(current_chunk.trim().to_string());
    }

    chunks
}

/// Resample with linear interpolation.
pub fn resample(samples: Vec<f32>, from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 {
        return samples;
    }

    let step = from_rate as f64 / to_rate as f64;
    let new_len = (samples.len() as f64 / step) as usize;
    let mut result = Vec::with_capacity(new_len);

    for i in 0..new_len {
        let src_pos = i as f64 * step;
        let src_idx = src_pos as usize;
        let frac = (src_pos - src_idx as f64) as f32;

        if src_idx + 1 < samples.len() {
            result.push(samples[src_idx] * (1.0 - frac) + samples[src_idx + 1] * frac);
        } else if src_idx < samples.len() {
            result.push(samples[src_idx]);
        }
    }

    result
}

/// Convert float samples in [-1, 1] to 16-bit little-endian PCM bytes.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        let value = (sample.clamp(-1.0, 1.0) * i16::MAX as f32) as i16;
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}
