//! Per-host playback: synthesize, slice, pace, drain.

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, info, warn};

use crate::audio::{AudioFormat, AudioFrame, AudioSink, ChannelId, FrameSlicer};
use crate::dialogue::DialogueTurn;
use crate::error::ShowError;
use crate::host::{HostPersona, Speaker};
use crate::tts::SpeechSynthesizer;

/// What one utterance cost on the wire.
#[derive(Debug, Clone, Copy)]
pub struct PlaybackReport {
    pub frames: usize,
    pub started_at: Instant,
    pub drained_at: Instant,
}

impl PlaybackReport {
    pub fn duration(&self) -> Duration {
        self.drained_at.duration_since(self.started_at)
    }
}

/// Owns one host's output channel. At most one utterance plays on it at a
/// time; the channel is opened on first use and kept for the whole show.
pub struct PlaybackEngine {
    speaker: Speaker,
    host: HostPersona,
    format: AudioFormat,
    synthesizer: Arc<dyn SpeechSynthesizer>,
    sink: Arc<dyn AudioSink>,
    channel: OnceCell<ChannelId>,
    writer: Mutex<()>,
    chunk_timeout: Duration,
    drain_timeout: Duration,
}

impl PlaybackEngine {
    pub fn new(
        speaker: Speaker,
        host: HostPersona,
        format: AudioFormat,
        synthesizer: Arc<dyn SpeechSynthesizer>,
        sink: Arc<dyn AudioSink>,
        chunk_timeout: Duration,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            speaker,
            host,
            format,
            synthesizer,
            sink,
            channel: OnceCell::new(),
            writer: Mutex::new(()),
            chunk_timeout,
            drain_timeout,
        }
    }

    pub fn speaker(&self) -> Speaker {
        self.speaker
    }

    pub fn host(&self) -> &HostPersona {
        &self.host
    }

    pub async fn speak(&self, turn: &DialogueTurn) -> Result<PlaybackReport, ShowError> {
        debug!(
            "{} speaking turn {}: {}",
            self.host.name, turn.sequence_index, turn.text
        );
        self.speak_text(&turn.text).await
    }

    /// Play `text` and return once it has fully drained.
    ///
    /// Frames go out no faster than real time. A synthesis error, or a
    /// synthesizer that goes quiet for longer than the chunk timeout, ends
    /// the utterance but leaves the channel usable for the next one.
    pub async fn speak_text(&self, text: &str) -> Result<PlaybackReport, ShowError> {
        let _writer = self
            .writer
            .try_lock()
            .map_err(|_| ShowError::ChannelBusy(self.host.name.clone()))?;

        let channel = self
            .channel
            .get_or_try_init(|| async {
                let name = self.host.channel_name();
                let id = self.sink.open_channel(&name, self.format).await?;
                info!("Opened output channel {} for {}", id, self.host.name);
                Ok::<_, ShowError>(id)
            })
            .await?;

        let voice = self.synthesizer.voice_for(&self.host);
        let mut audio = timeout(self.chunk_timeout, self.synthesizer.synthesize(text, voice))
            .await
            .map_err(|_| self.stalled(0))??;

        let mut slicer = FrameSlicer::new(self.format);
        let mut pacer = FramePacer::new(self.format.frame_duration());
        let started_at = Instant::now();

        loop {
            let next = match timeout(self.chunk_timeout, audio.next()).await {
                Ok(next) => next,
                Err(_) => return Err(self.stalled(pacer.sent())),
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!(
                        "Synthesis for {} failed after {} frames: {}",
                        self.host.name,
                        pacer.sent(),
                        e
                    );
                    return Err(e);
                }
            };
            for frame in slicer.push(&chunk) {
                self.emit(channel, frame, &mut pacer).await?;
            }
        }
        if let Some(frame) = slicer.finish() {
            self.emit(channel, frame, &mut pacer).await?;
        }

        match timeout(self.drain_timeout, self.sink.wait_for_playout(channel)).await {
            Ok(drained) => drained?,
            Err(_) => {
                return Err(ShowError::PlaybackDrainTimeout {
                    speaker: self.host.name.clone(),
                    waited: self.drain_timeout,
                });
            }
        }

        let report = PlaybackReport {
            frames: pacer.sent(),
            started_at,
            drained_at: Instant::now(),
        };
        debug!(
            "{} finished {} frames in {:?}",
            self.host.name,
            report.frames,
            report.duration()
        );
        Ok(report)
    }

    fn stalled(&self, frames: usize) -> ShowError {
        warn!(
            "Synthesis for {} stalled for {:?} after {} frames",
            self.host.name, self.chunk_timeout, frames
        );
        ShowError::Synthesis(format!(
            "no audio for {} within {:?}",
            self.host.name, self.chunk_timeout
        ))
    }

    async fn emit(
        &self,
        channel: &ChannelId,
        frame: AudioFrame,
        pacer: &mut FramePacer,
    ) -> Result<(), ShowError> {
        pacer.wait().await;
        self.sink.publish(channel, frame).await
    }
}

/// Holds frames to one per frame duration, measured from the previous send.
struct FramePacer {
    frame: Duration,
    last: Option<Instant>,
    sent: usize,
}

impl FramePacer {
    fn new(frame: Duration) -> Self {
        Self {
            frame,
            last: None,
            sent: 0,
        }
    }

    async fn wait(&mut self) {
        if let Some(last) = self.last {
            sleep_until(last + self.frame).await;
        }
        self.last = Some(Instant::now());
        self.sent += 1;
    }

    fn sent(&self) -> usize {
        self.sent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{RecordingSink, SinkEntry, ToneSynthesizer};

    fn format() -> AudioFormat {
        AudioFormat {
            sample_rate: 24_000,
            channels: 1,
            frame_duration_ms: 20,
        }
    }

    fn host() -> HostPersona {
        HostPersona {
            id: "max".to_string(),
            name: "Mad Money Max".to_string(),
            voice_id: "cloud-voice".to_string(),
            local_voice: "am_michael".to_string(),
            persona: String::new(),
        }
    }

    fn engine(
        synth: Arc<dyn SpeechSynthesizer>,
        sink: Arc<dyn AudioSink>,
    ) -> PlaybackEngine {
        PlaybackEngine::new(
            Speaker::A,
            host(),
            format(),
            synth,
            sink,
            Duration::from_secs(10),
            Duration::from_secs(30),
        )
    }

    fn turn(text: &str) -> DialogueTurn {
        DialogueTurn {
            speaker: Speaker::A,
            sequence_index: 0,
            text: text.to_string(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_are_paced_in_real_time() {
        let sink = Arc::new(RecordingSink::new(format()));
        // 10 full frames.
        let engine = engine(Arc::new(ToneSynthesizer::new(9600)), sink.clone());

        let report = engine.speak(&turn("hello")).await.unwrap();
        assert_eq!(report.frames, 10);
        // Nine paced gaps plus the final frame playing out.
        assert_eq!(report.duration(), Duration::from_millis(200));

        let stamps: Vec<Instant> = sink
            .log()
            .into_iter()
            .filter(|(_, e, _)| matches!(e, SinkEntry::Frame(_)))
            .map(|(_, _, at)| at)
            .collect();
        for pair in stamps.windows(2) {
            assert_eq!(pair[1] - pair[0], Duration::from_millis(20));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_frame_has_fixed_length() {
        let sink = Arc::new(RecordingSink::new(format()));
        let engine = engine(Arc::new(ToneSynthesizer::new(2500)), sink.clone());

        engine.speak(&turn("short")).await.unwrap();

        let lengths: Vec<usize> = sink
            .log()
            .into_iter()
            .filter_map(|(_, e, _)| match e {
                SinkEntry::Frame(len) => Some(len),
                _ => None,
            })
            .collect();
        assert_eq!(lengths, vec![960, 960, 960]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_opened_once() {
        let sink = Arc::new(RecordingSink::new(format()));
        let engine = engine(Arc::new(ToneSynthesizer::new(960)), sink.clone());

        engine.speak(&turn("one")).await.unwrap();
        engine.speak(&turn("two")).await.unwrap();

        assert_eq!(sink.opened("max-audio"), 1);
        assert_eq!(sink.frames("max-audio"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_synthesis_error_keeps_channel() {
        let sink = Arc::new(RecordingSink::new(format()));
        let failing = engine(
            Arc::new(ToneSynthesizer::new(9600).failing_after(2)),
            sink.clone(),
        );

        let result = failing.speak(&turn("boom")).await;
        assert!(matches!(result, Err(ShowError::Synthesis(_))));
        // 1400 bytes made it through: one full frame.
        assert_eq!(sink.frames("max-audio"), 1);

        // The channel and writer slot are still usable.
        let result = failing.speak(&turn("again")).await;
        assert!(matches!(result, Err(ShowError::Synthesis(_))));
        assert_eq!(sink.opened("max-audio"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_synthesis_times_out() {
        let sink = Arc::new(RecordingSink::new(format()));
        // Two 700-byte chunks, then silence with the stream left open.
        let engine = engine(
            Arc::new(ToneSynthesizer::new(9600).stalling_after(2)),
            sink.clone(),
        );

        let start = Instant::now();
        let result = engine.speak(&turn("hang")).await;
        assert!(matches!(result, Err(ShowError::Synthesis(_))));
        assert_eq!(start.elapsed(), Duration::from_secs(10));
        assert_eq!(sink.frames("max-audio"), 1);

        // The writer slot was released.
        let result = engine.speak(&turn("again")).await;
        assert!(matches!(result, Err(ShowError::Synthesis(_))));
        assert_eq!(sink.opened("max-audio"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_timeout() {
        let sink = Arc::new(RecordingSink::stalled(format()));
        let engine = PlaybackEngine::new(
            Speaker::B,
            host(),
            format(),
            Arc::new(ToneSynthesizer::new(960)),
            sink,
            Duration::from_secs(10),
            Duration::from_secs(5),
        );

        let start = Instant::now();
        match engine.speak(&turn("stuck")).await {
            Err(ShowError::PlaybackDrainTimeout { waited, .. }) => {
                assert_eq!(waited, Duration::from_secs(5));
            }
            other => panic!("expected drain timeout, got {:?}", other.map(|r| r.frames)),
        }
        assert_eq!(start.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_speak_is_rejected() {
        let sink = Arc::new(RecordingSink::new(format()));
        let engine = engine(Arc::new(ToneSynthesizer::new(9600)), sink);

        let (a, b) = (turn("a"), turn("b"));
        let (first, second) = tokio::join!(engine.speak(&a), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            engine.speak(&b).await
        });

        assert!(first.is_ok());
        assert!(matches!(second, Err(ShowError::ChannelBusy(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_picks_voice() {
        let synth = Arc::new(ToneSynthesizer::new(960));
        let sink = Arc::new(RecordingSink::new(format()));
        let engine = engine(synth.clone(), sink);

        assert_eq!(engine.speaker(), Speaker::A);
        engine.speak(&turn("hi")).await.unwrap();
        assert_eq!(synth.voices(), vec!["cloud-voice"]);
    }
}
