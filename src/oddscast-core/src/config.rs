//! Configuration module for loading TOML config files.

use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::error::ShowError;
use crate::host::{HostPersona, Speaker};
use crate::phase::PhaseDurations;
use crate::topic::Topic;

/// Root configuration structure.
#[derive(Debug, Clone, Deserialize)]
pub struct ShowConfig {
    #[serde(default)]
    pub show: ShowSection,
    #[serde(default)]
    pub audio: AudioConfig,
    #[serde(default)]
    pub voting: VotingConfig,
    #[serde(default)]
    pub hosts: HostsConfig,
    #[serde(default)]
    pub generator: GeneratorConfig,
    #[serde(default)]
    pub provider: ProviderConfig,
    #[serde(default)]
    pub synthesis: SynthesisConfig,
}

/// Cycle shape and history.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ShowSection {
    /// Turns spoken per discussion cycle, alternating A, B, A, ...
    pub turns_per_discussion: usize,
    /// How many recently discussed topic ids are kept out of the vote.
    pub history_size: usize,
    /// Line host A speaks when the winning topic is announced.
    pub announce_template: String,
    pub durations: DurationsConfig,
}

impl Default for ShowSection {
    fn default() -> Self {
        Self {
            turns_per_discussion: 2,
            history_size: 20,
            announce_template: "The people have spoken! Let's dive into: {question}!".to_string(),
            durations: DurationsConfig::default(),
        }
    }
}

/// Phase durations in whole seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DurationsConfig {
    pub discussion_secs: u64,
    pub voting_secs: u64,
    pub transition_secs: u64,
}

impl Default for DurationsConfig {
    fn default() -> Self {
        Self {
            discussion_secs: 300,
            voting_secs: 60,
            transition_secs: 5,
        }
    }
}

/// PCM layout shared by the synthesizer and the broadcast output.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_duration_ms: u32,
    pub drain_timeout_secs: u64,
    /// Longest gap allowed between two chunks of one synthesized utterance.
    pub chunk_timeout_secs: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            channels: 1,
            frame_duration_ms: 20,
            drain_timeout_secs: 30,
            chunk_timeout_secs: 10,
        }
    }
}

/// Candidate selection and vote window behaviour.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VotingConfig {
    /// Name of the candidate strategy (see `candidates::available_strategies`).
    pub strategy: String,
    pub pool_size: usize,
    pub expanded_pool_size: usize,
    /// Seconds between tally snapshots while a window is open.
    pub tally_interval_secs: u64,
    /// Chat identity allowed to pause and resume the show.
    pub operator: Option<String>,
}

impl Default for VotingConfig {
    fn default() -> Self {
        Self {
            strategy: "top_ranked".to_string(),
            pool_size: 20,
            expanded_pool_size: 50,
            tally_interval_secs: 5,
            operator: None,
        }
    }
}

/// The two hosts.
#[derive(Debug, Clone, Deserialize)]
pub struct HostsConfig {
    pub a: HostPersona,
    pub b: HostPersona,
}

impl Default for HostsConfig {
    fn default() -> Self {
        Self {
            a: HostPersona {
                id: "max".to_string(),
                name: "Mad Money Max".to_string(),
                voice_id: "ebViKUYy9kJJVwmW3D1A".to_string(),
                local_voice: "am_michael".to_string(),
                persona: "bullish and energetic, always uses tags like [yells], [shouts] or [excited]"
                    .to_string(),
            },
            b: HostPersona {
                id: "ben".to_string(),
                name: "Bull Bear Ben".to_string(),
                voice_id: "uZWdqLmeWkBTtxKzvZ9D".to_string(),
                local_voice: "bm_george".to_string(),
                persona: "skeptical and analytical, uses tags like [sighs], [deadpan] or [whispers intensely]"
                    .to_string(),
            },
        }
    }
}

/// Dialogue model settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub system_prompt: String,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            model: "gpt-4o".to_string(),
            max_tokens: 300,
            temperature: 0.9,
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
        }
    }
}

/// Topic provider endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub gamma_base: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            gamma_base: "https://gamma-api.polymarket.com".to_string(),
            timeout_secs: 15,
            max_retries: 3,
        }
    }
}

/// Which speech backend to use.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SynthesisConfig {
    /// `elevenlabs` or `kokoro`.
    pub backend: String,
    pub model_id: String,
    pub api_base: String,
    /// Whole-request limit for one streamed utterance.
    pub timeout_secs: u64,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            backend: "elevenlabs".to_string(),
            model_id: "eleven_v3".to_string(),
            api_base: "https://api.elevenlabs.io".to_string(),
            timeout_secs: 120,
        }
    }
}

impl ShowConfig {
    /// Load configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ShowError> {
        let content = fs::read_to_string(path.as_ref())
            .map_err(|e| ShowError::ConfigError(format!("Failed to read config: {}", e)))?;

        Self::from_str(&content)
    }

    /// Load configuration from string content.
    pub fn from_str(content: &str) -> Result<Self, ShowError> {
        let config: ShowConfig = toml::from_str(content)
            .map_err(|e| ShowError::ConfigError(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the show loop cannot run with.
    pub fn validate(&self) -> Result<(), ShowError> {
        if self.show.turns_per_discussion == 0 {
            return Err(ShowError::ConfigError(
                "show.turns_per_discussion must be at least 1".to_string(),
            ));
        }
        if self.audio.frame_duration_ms == 0 || self.audio.chunk_timeout_secs == 0 {
            return Err(ShowError::ConfigError(
                "audio.frame_duration_ms and audio.chunk_timeout_secs must be non-zero".to_string(),
            ));
        }
        // Both speech backends produce mono PCM.
        if self.audio.channels != 1 {
            return Err(ShowError::ConfigError(format!(
                "audio.channels must be 1, got {}",
                self.audio.channels
            )));
        }
        if (self.audio.sample_rate as u64 * self.audio.frame_duration_ms as u64) % 1000 != 0 {
            return Err(ShowError::ConfigError(format!(
                "{} Hz does not divide into whole {} ms frames",
                self.audio.sample_rate, self.audio.frame_duration_ms
            )));
        }
        if self.hosts.a.id == self.hosts.b.id {
            return Err(ShowError::ConfigError(format!(
                "hosts.a and hosts.b share the id '{}'",
                self.hosts.a.id
            )));
        }
        if self.voting.expanded_pool_size < self.voting.pool_size {
            return Err(ShowError::ConfigError(
                "voting.expanded_pool_size must not be smaller than voting.pool_size".to_string(),
            ));
        }
        Ok(())
    }

    pub fn host(&self, speaker: Speaker) -> &HostPersona {
        match speaker {
            Speaker::A => &self.hosts.a,
            Speaker::B => &self.hosts.b,
        }
    }

    pub fn phase_durations(&self) -> PhaseDurations {
        let d = &self.show.durations;
        PhaseDurations {
            discussion: Duration::from_secs(d.discussion_secs),
            voting: Duration::from_secs(d.voting_secs),
            transition: Duration::from_secs(d.transition_secs),
        }
    }

    pub fn voting_duration(&self) -> Duration {
        Duration::from_secs(self.show.durations.voting_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.audio.drain_timeout_secs)
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_secs(self.audio.chunk_timeout_secs)
    }

    /// Build the dialogue system prompt for a topic, with placeholders replaced.
    pub fn system_prompt(&self, topic: &Topic) -> String {
        let odds = topic
            .formatted_odds()
            .iter()
            .map(|(name, pct)| format!("{}: {}", name, pct))
            .collect::<Vec<_>>()
            .join(", ");

        self.generator
            .system_prompt
            .replace("{question}", &topic.question)
            .replace("{odds}", &odds)
            .replace("{description}", &topic.description)
            .replace("{volume}", &topic.formatted_volume())
            .replace("{host_a}", &self.hosts.a.name)
            .replace("{host_a_persona}", &self.hosts.a.persona)
            .replace("{host_b}", &self.hosts.b.name)
            .replace("{host_b_persona}", &self.hosts.b.persona)
    }

    /// The transition line announcing the next topic.
    pub fn announcement(&self, topic: &Topic) -> String {
        self.show.announce_template.replace("{question}", &topic.question)
    }
}

/// Default configuration embedded in the binary.
pub fn default_config() -> ShowConfig {
    ShowConfig {
        show: ShowSection::default(),
        audio: AudioConfig::default(),
        voting: VotingConfig::default(),
        hosts: HostsConfig::default(),
        generator: GeneratorConfig::default(),
        provider: ProviderConfig::default(),
        synthesis: SynthesisConfig::default(),
    }
}

const DEFAULT_SYSTEM_PROMPT: &str = r#"You are a conversation writer for a fast-paced trading show.
Write dialogue between two hosts discussing this prediction market:

MARKET: {question}
CURRENT ODDS: {odds}
24H VOLUME: {volume}
DESCRIPTION: {description}

HOSTS:
- {host_a} is {host_a_persona}.
- {host_b} is {host_b_persona}.

RULES:
- Each line is about 60 seconds of speech (150-200 words)
- Every line MUST include [emotion brackets]
- Reference the specific odds and what they mean
- React to the other host's energy and answer their last point
- Each line is a complete thought or argument

CRITICAL OUTPUT RULES:
- Output ONLY the spoken words of the requested host
- Do NOT prefix the line with the speaker's name
- Do NOT include markdown formatting or asterisks
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(default_config().validate().is_ok());
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config = ShowConfig::from_str(
            r#"
            [show]
            turns_per_discussion = 4

            [show.durations]
            voting_secs = 30
            "#,
        )
        .unwrap();

        assert_eq!(config.show.turns_per_discussion, 4);
        assert_eq!(config.show.history_size, 20);
        assert_eq!(config.voting_duration(), Duration::from_secs(30));
        assert_eq!(config.show.durations.discussion_secs, 300);
        assert_eq!(config.hosts.a.name, "Mad Money Max");
    }

    #[test]
    fn test_rejects_zero_turns() {
        let err = ShowConfig::from_str("[show]\nturns_per_discussion = 0\n").unwrap_err();
        assert!(matches!(err, ShowError::ConfigError(_)));
    }

    #[test]
    fn test_rejects_fractional_frames() {
        let err = ShowConfig::from_str("[audio]\nsample_rate = 22050\nframe_duration_ms = 7\n")
            .unwrap_err();
        assert!(err.to_string().contains("whole"));
    }

    #[test]
    fn test_rejects_multichannel_audio() {
        let err = ShowConfig::from_str("[audio]\nchannels = 2\n").unwrap_err();
        assert!(err.to_string().contains("audio.channels must be 1"));
    }

    #[test]
    fn test_rejects_zero_chunk_timeout() {
        let err = ShowConfig::from_str("[audio]\nchunk_timeout_secs = 0\n").unwrap_err();
        assert!(matches!(err, ShowError::ConfigError(_)));
        assert_eq!(default_config().chunk_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn test_rejects_shared_host_ids() {
        let mut config = default_config();
        config.hosts.b.id = config.hosts.a.id.clone();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_system_prompt_placeholders() {
        let config = default_config();
        let topic = Topic::new("1", "Will it rain?")
            .with_outcomes(vec![("Yes", 0.65), ("No", 0.35)])
            .with_volume(1_500_000.0);
        let prompt = config.system_prompt(&topic);

        assert!(prompt.contains("MARKET: Will it rain?"));
        assert!(prompt.contains("Yes: 65.0%, No: 35.0%"));
        assert!(prompt.contains("$1.5M"));
        assert!(prompt.contains("Mad Money Max"));
        assert!(!prompt.contains("{question}"));
    }

    #[test]
    fn test_announcement_template() {
        let config = default_config();
        let topic = Topic::new("2", "Who wins the cup?");
        assert_eq!(
            config.announcement(&topic),
            "The people have spoken! Let's dive into: Who wins the cup?!"
        );
    }
}
