//! Audio frames and output sinks.
//!
//! All audio is 16-bit little-endian PCM. Every frame published to a sink
//! holds exactly `AudioFormat::bytes_per_frame()` bytes.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

use crate::config::AudioConfig;
use crate::error::ShowError;

const BYTES_PER_SAMPLE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_duration_ms: u32,
}

impl AudioFormat {
    pub fn from_config(config: &AudioConfig) -> Self {
        Self {
            sample_rate: config.sample_rate,
            channels: config.channels,
            frame_duration_ms: config.frame_duration_ms,
        }
    }

    /// Samples per channel in one frame.
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate as usize * self.frame_duration_ms as usize) / 1000
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.samples_per_frame() * self.channels as usize * BYTES_PER_SAMPLE
    }

    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_duration_ms as u64)
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::from_config(&AudioConfig::default())
    }
}

/// One fixed-length frame of interleaved PCM.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    data: Vec<u8>,
}

impl AudioFrame {
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Decoded samples.
    pub fn samples(&self) -> impl Iterator<Item = i16> + '_ {
        self.data
            .chunks_exact(BYTES_PER_SAMPLE)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
    }
}

/// Re-slices arbitrarily sized PCM chunks into fixed frames.
#[derive(Debug)]
pub struct FrameSlicer {
    frame_bytes: usize,
    buffer: Vec<u8>,
}

impl FrameSlicer {
    pub fn new(format: AudioFormat) -> Self {
        let frame_bytes = format.bytes_per_frame();
        Self {
            frame_bytes,
            buffer: Vec::with_capacity(frame_bytes * 2),
        }
    }

    /// Append `chunk`, returning every frame that is now complete.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<AudioFrame> {
        self.buffer.extend_from_slice(chunk);

        let complete = self.buffer.len() / self.frame_bytes;
        if complete == 0 {
            return Vec::new();
        }

        let tail = self.buffer.split_off(complete * self.frame_bytes);
        let frames = self
            .buffer
            .chunks_exact(self.frame_bytes)
            .map(|data| AudioFrame {
                data: data.to_vec(),
            })
            .collect();
        self.buffer = tail;
        frames
    }

    /// Bytes waiting for the next frame.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Zero-pad whatever is left into a final frame.
    pub fn finish(&mut self) -> Option<AudioFrame> {
        if self.buffer.is_empty() {
            return None;
        }
        let mut data = std::mem::take(&mut self.buffer);
        data.resize(self.frame_bytes, 0);
        Some(AudioFrame { data })
    }
}

/// Handle to a channel opened on a sink.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelId(pub String);

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Where host audio ends up: a broadcast room, a file, a pipe.
#[async_trait]
pub trait AudioSink: Send + Sync {
    /// Create a named output channel.
    async fn open_channel(&self, name: &str, format: AudioFormat) -> Result<ChannelId, ShowError>;

    async fn publish(&self, channel: &ChannelId, frame: AudioFrame) -> Result<(), ShowError>;

    /// Resolve once everything published on `channel` has been played out.
    async fn wait_for_playout(&self, channel: &ChannelId) -> Result<(), ShowError>;

    /// Release the sink. Later calls are no-ops.
    async fn close(&self) -> Result<(), ShowError>;
}

/// Records the whole show into a single WAV file. Both hosts share one
/// track; they never speak at the same time.
pub struct WavRecorder {
    writer: Mutex<Option<hound::WavWriter<BufWriter<File>>>>,
    format: AudioFormat,
}

impl WavRecorder {
    pub fn create<P: AsRef<Path>>(path: P, format: AudioFormat) -> Result<Self, ShowError> {
        let spec = hound::WavSpec {
            channels: format.channels,
            sample_rate: format.sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let writer = hound::WavWriter::create(path.as_ref(), spec)?;
        info!("Recording show audio to {}", path.as_ref().display());

        Ok(Self {
            writer: Mutex::new(Some(writer)),
            format,
        })
    }

    fn with_writer<T>(
        &self,
        f: impl FnOnce(&mut hound::WavWriter<BufWriter<File>>) -> Result<T, ShowError>,
    ) -> Result<T, ShowError> {
        let mut guard = self
            .writer
            .lock()
            .map_err(|_| ShowError::Sink("WAV writer lock poisoned".to_string()))?;
        match guard.as_mut() {
            Some(writer) => f(writer),
            None => Err(ShowError::Sink("recorder already closed".to_string())),
        }
    }
}

#[async_trait]
impl AudioSink for WavRecorder {
    async fn open_channel(&self, name: &str, format: AudioFormat) -> Result<ChannelId, ShowError> {
        if format.sample_rate != self.format.sample_rate || format.channels != self.format.channels {
            return Err(ShowError::Sink(format!(
                "channel {} wants {} Hz x{}, recorder is {} Hz x{}",
                name, format.sample_rate, format.channels, self.format.sample_rate, self.format.channels
            )));
        }
        debug!("Recording channel {}", name);
        Ok(ChannelId(name.to_string()))
    }

    async fn publish(&self, _channel: &ChannelId, frame: AudioFrame) -> Result<(), ShowError> {
        self.with_writer(|writer| {
            for sample in frame.samples() {
                writer.write_sample(sample)?;
            }
            Ok(())
        })
    }

    async fn wait_for_playout(&self, _channel: &ChannelId) -> Result<(), ShowError> {
        self.with_writer(|writer| Ok(writer.flush()?))
    }

    async fn close(&self) -> Result<(), ShowError> {
        let writer = self
            .writer
            .lock()
            .map_err(|_| ShowError::Sink("WAV writer lock poisoned".to_string()))?
            .take();
        if let Some(writer) = writer {
            writer.finalize()?;
            info!("Recording finalized");
        }
        Ok(())
    }
}

/// Streams raw PCM to any async writer, e.g. stdout piped into a player.
pub struct PcmPipeSink<W> {
    writer: tokio::sync::Mutex<Option<W>>,
}

impl<W: AsyncWrite + Unpin + Send> PcmPipeSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: tokio::sync::Mutex::new(Some(writer)),
        }
    }
}

impl PcmPipeSink<tokio::io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(tokio::io::stdout())
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> AudioSink for PcmPipeSink<W> {
    async fn open_channel(&self, name: &str, _format: AudioFormat) -> Result<ChannelId, ShowError> {
        Ok(ChannelId(name.to_string()))
    }

    async fn publish(&self, _channel: &ChannelId, frame: AudioFrame) -> Result<(), ShowError> {
        match self.writer.lock().await.as_mut() {
            Some(writer) => Ok(writer.write_all(frame.data()).await?),
            None => Err(ShowError::Sink("pipe already closed".to_string())),
        }
    }

    async fn wait_for_playout(&self, _channel: &ChannelId) -> Result<(), ShowError> {
        match self.writer.lock().await.as_mut() {
            Some(writer) => Ok(writer.flush().await?),
            None => Ok(()),
        }
    }

    async fn close(&self) -> Result<(), ShowError> {
        if let Some(mut writer) = self.writer.lock().await.take() {
            writer.shutdown().await?;
        }
        Ok(())
    }
}
