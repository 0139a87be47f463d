//! Oddscast Core Library
//!
//! Runs a looping live show: two hosts discuss a trending prediction market
//! while the audience votes on what they discuss next.

pub mod audio;
pub mod candidates;
pub mod config;
pub mod dialogue;
pub mod error;
pub mod events;
pub mod host;
pub mod orchestrator;
pub mod phase;
pub mod playback;
pub mod state;
pub mod topic;
pub mod tts;
pub mod voting;

#[cfg(test)]
mod testing;

pub use audio::{AudioFormat, AudioFrame, AudioSink, ChannelId, PcmPipeSink, WavRecorder};
pub use candidates::{CandidateSelector, CandidateSet, CandidateSource, CandidateStrategy};
pub use config::{ShowConfig, default_config};
pub use dialogue::{DialogueApiConfig, DialogueGenerator, DialoguePipeline, DialogueTurn, OpenAiDialogue};
pub use error::ShowError;
pub use events::ShowEvent;
pub use host::{HostPersona, Speaker};
pub use orchestrator::{ShowControl, ShowOrchestrator, ShowServices};
pub use phase::Phase;
pub use state::ShowStatus;
pub use topic::{GammaClient, Topic, TopicProvider};
pub use tts::{ElevenLabsSynthesizer, KokoroSynthesizer, SpeechSynthesizer};
pub use voting::{VoteHandle, VoteTally, parse_chat_vote};
