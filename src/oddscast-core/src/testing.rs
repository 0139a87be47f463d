//! In-memory fakes for the external seams, used by unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream;
use tokio::time::Instant;

use crate::audio::{AudioFormat, AudioFrame, AudioSink, ChannelId};
use crate::dialogue::{DialogueGenerator, DialogueTurn};
use crate::error::ShowError;
use crate::topic::{Topic, TopicProvider};
use crate::tts::{PcmStream, SpeechSynthesizer};

/// Topics with the given ids, ranked in order.
pub fn topics(ids: &[&str]) -> Vec<Arc<Topic>> {
    ids.iter()
        .enumerate()
        .map(|(rank, id)| {
            Arc::new(
                Topic::new(*id, format!("Will {} happen?", id))
                    .with_volume(1_000_000.0 / (rank as f64 + 1.0))
                    .with_outcomes(vec![("Yes", 0.5), ("No", 0.5)]),
            )
        })
        .collect()
}

/// Serves a fixed ranked list, or fails every call.
pub struct ScriptedProvider {
    topics: Option<Vec<Arc<Topic>>>,
    calls: Mutex<usize>,
}

impl ScriptedProvider {
    pub fn new(topics: Vec<Arc<Topic>>) -> Self {
        Self {
            topics: Some(topics),
            calls: Mutex::new(0),
        }
    }

    pub fn failing() -> Self {
        Self {
            topics: None,
            calls: Mutex::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

#[async_trait]
impl TopicProvider for ScriptedProvider {
    async fn fetch_trending(&self, limit: usize) -> Result<Vec<Arc<Topic>>, ShowError> {
        *self.calls.lock().unwrap() += 1;
        match &self.topics {
            Some(topics) => Ok(topics.iter().take(limit).cloned().collect()),
            None => Err(ShowError::ExternalFetch("provider unavailable".to_string())),
        }
    }
}

/// Produces "<topic id> line <n>" after an optional delay.
pub struct ScriptedGenerator {
    delay: Duration,
    fail_at: Option<usize>,
    prior_lengths: Mutex<Vec<usize>>,
}

impl ScriptedGenerator {
    pub fn instant() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            fail_at: None,
            prior_lengths: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_at(index: usize) -> Self {
        Self {
            fail_at: Some(index),
            ..Self::instant()
        }
    }

    pub fn prior_lengths(&self) -> Vec<usize> {
        self.prior_lengths.lock().unwrap().clone()
    }
}

#[async_trait]
impl DialogueGenerator for ScriptedGenerator {
    async fn generate_turn(
        &self,
        topic: &Topic,
        prior: &[DialogueTurn],
        index: usize,
    ) -> Result<String, ShowError> {
        self.prior_lengths.lock().unwrap().push(prior.len());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail_at == Some(index) {
            return Err(ShowError::GenerationFailed {
                index,
                reason: "model unavailable".to_string(),
            });
        }
        Ok(format!("{} line {}", topic.id, index))
    }
}

/// Emits a fixed number of PCM bytes per utterance in uneven chunks.
pub struct ToneSynthesizer {
    bytes_per_utterance: usize,
    chunk_size: usize,
    fail_after_chunks: Option<usize>,
    stall_after_chunks: Option<usize>,
    voices: Mutex<Vec<String>>,
}

impl ToneSynthesizer {
    pub fn new(bytes_per_utterance: usize) -> Self {
        Self {
            bytes_per_utterance,
            chunk_size: 700,
            fail_after_chunks: None,
            stall_after_chunks: None,
            voices: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_after(mut self, chunks: usize) -> Self {
        self.fail_after_chunks = Some(chunks);
        self
    }

    /// Go silent after `chunks` without ending the stream.
    pub fn stalling_after(mut self, chunks: usize) -> Self {
        self.stall_after_chunks = Some(chunks);
        self
    }

    pub fn voices(&self) -> Vec<String> {
        self.voices.lock().unwrap().clone()
    }
}

#[async_trait]
impl SpeechSynthesizer for ToneSynthesizer {
    async fn synthesize(&self, _text: &str, voice: &str) -> Result<PcmStream, ShowError> {
        self.voices.lock().unwrap().push(voice.to_string());

        let mut chunks: Vec<Result<Vec<u8>, ShowError>> = Vec::new();
        let mut remaining = self.bytes_per_utterance;
        while remaining > 0 {
            let size = remaining.min(self.chunk_size);
            chunks.push(Ok(vec![1u8; size]));
            remaining -= size;
        }
        if let Some(after) = self.fail_after_chunks {
            chunks.truncate(after);
            chunks.push(Err(ShowError::Synthesis("voice crashed".to_string())));
        }
        if let Some(after) = self.stall_after_chunks {
            chunks.truncate(after);
            return Ok(stream::iter(chunks).chain(stream::pending()).boxed());
        }
        Ok(stream::iter(chunks).boxed())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SinkEntry {
    Opened,
    Frame(usize),
    Drained,
}

/// Logs every call with its (virtual) timestamp and simulates real-time
/// playout: a drain resolves one frame after the last publish.
pub struct RecordingSink {
    format: AudioFormat,
    log: Mutex<Vec<(String, SinkEntry, Instant)>>,
    last_publish: Mutex<HashMap<String, Instant>>,
    stall_drain: bool,
    closes: Mutex<usize>,
}

impl RecordingSink {
    pub fn new(format: AudioFormat) -> Self {
        Self {
            format,
            log: Mutex::new(Vec::new()),
            last_publish: Mutex::new(HashMap::new()),
            stall_drain: false,
            closes: Mutex::new(0),
        }
    }

    /// A sink whose playout never completes.
    pub fn stalled(format: AudioFormat) -> Self {
        Self {
            stall_drain: true,
            ..Self::new(format)
        }
    }

    pub fn log(&self) -> Vec<(String, SinkEntry, Instant)> {
        self.log.lock().unwrap().clone()
    }

    pub fn opened(&self, channel: &str) -> usize {
        self.count(channel, |e| *e == SinkEntry::Opened)
    }

    pub fn frames(&self, channel: &str) -> usize {
        self.count(channel, |e| matches!(e, SinkEntry::Frame(_)))
    }

    pub fn closes(&self) -> usize {
        *self.closes.lock().unwrap()
    }

    /// Time between each drain and the next frame on any channel.
    pub fn gaps_between_utterances(&self) -> Vec<Duration> {
        let log = self.log();
        let mut gaps = Vec::new();
        let mut drained_at = None;
        for (_, entry, at) in &log {
            match entry {
                SinkEntry::Drained => drained_at = Some(*at),
                SinkEntry::Frame(_) => {
                    if let Some(drained) = drained_at.take() {
                        gaps.push(at.duration_since(drained));
                    }
                }
                SinkEntry::Opened => {}
            }
        }
        gaps
    }

    fn count(&self, channel: &str, pred: impl Fn(&SinkEntry) -> bool) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, entry, _)| name == channel && pred(entry))
            .count()
    }

    fn record(&self, channel: &str, entry: SinkEntry) {
        self.log
            .lock()
            .unwrap()
            .push((channel.to_string(), entry, Instant::now()));
    }
}

#[async_trait]
impl AudioSink for RecordingSink {
    async fn open_channel(&self, name: &str, _format: AudioFormat) -> Result<ChannelId, ShowError> {
        self.record(name, SinkEntry::Opened);
        Ok(ChannelId(name.to_string()))
    }

    async fn publish(&self, channel: &ChannelId, frame: AudioFrame) -> Result<(), ShowError> {
        self.record(&channel.0, SinkEntry::Frame(frame.len()));
        self.last_publish
            .lock()
            .unwrap()
            .insert(channel.0.clone(), Instant::now());
        Ok(())
    }

    async fn wait_for_playout(&self, channel: &ChannelId) -> Result<(), ShowError> {
        if self.stall_drain {
            std::future::pending::<()>().await;
        }
        let last = self.last_publish.lock().unwrap().get(&channel.0).copied();
        if let Some(last) = last {
            tokio::time::sleep_until(last + self.format.frame_duration()).await;
        }
        self.record(&channel.0, SinkEntry::Drained);
        Ok(())
    }

    async fn close(&self) -> Result<(), ShowError> {
        *self.closes.lock().unwrap() += 1;
        Ok(())
    }
}
