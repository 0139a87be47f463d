//! Show host definitions.
//!
//! Exactly two hosts alternate: speaker A opens every discussion.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which of the two fixed hosts is speaking.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum Speaker {
    A,
    B,
}

impl Speaker {
    /// Speaker for the given turn index: A, B, A, B, ...
    pub fn for_turn(index: usize) -> Self {
        if index % 2 == 0 { Speaker::A } else { Speaker::B }
    }

    pub fn other(self) -> Self {
        match self {
            Speaker::A => Speaker::B,
            Speaker::B => Speaker::A,
        }
    }
}

impl fmt::Display for Speaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Speaker::A => write!(f, "A"),
            Speaker::B => write!(f, "B"),
        }
    }
}

/// A host's identity, voice and personality.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostPersona {
    /// Short id, also used to name the host's output channel.
    pub id: String,
    /// Display name ("Mad Money Max").
    pub name: String,
    /// Voice id for the streaming synthesizer.
    pub voice_id: String,
    /// Voice id for the local synthesizer.
    pub local_voice: String,
    /// Personality description woven into the dialogue prompt.
    pub persona: String,
}

impl HostPersona {
    /// Name of the broadcast channel this host publishes on.
    pub fn channel_name(&self) -> String {
        format!("{}-audio", self.id)
    }
}
