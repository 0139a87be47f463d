//! Events the show publishes for consoles and overlays.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use crate::candidates::CandidateSource;
use crate::host::Speaker;
use crate::phase::Phase;
use crate::state::ShowStatus;
use crate::topic::Topic;
use crate::voting::VoteTally;

#[derive(Debug, Clone)]
pub enum ShowEvent {
    /// The phase machine moved; carries a full status snapshot.
    Status { phase: Phase, status: ShowStatus },
    /// A new topic became current.
    TopicSelected { topic: Arc<Topic> },
    /// A host is about to speak.
    TurnStarted {
        speaker: Speaker,
        host_name: String,
        index: usize,
        text: String,
    },
    /// A host's audio fully drained.
    SpeechComplete { speaker: Speaker, index: usize },
    /// A turn could not be generated or played.
    TurnFailed { index: usize, reason: String },
    VotingOpened {
        option_1: Arc<Topic>,
        option_2: Arc<Topic>,
        source: CandidateSource,
        closes_in: Duration,
    },
    VoteTally { tally: VoteTally, remaining: Duration },
    VotingClosed {
        winner_option: u8,
        winner: Arc<Topic>,
        tally: VoteTally,
    },
    /// Show stopped.
    Ended,
}

/// Optional fan-out of show events; sending never blocks and never fails the show.
#[derive(Debug, Clone, Default)]
pub struct EventSender {
    tx: Option<mpsc::UnboundedSender<ShowEvent>>,
}

impl EventSender {
    pub fn new(tx: mpsc::UnboundedSender<ShowEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn none() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: ShowEvent) {
        if let Some(tx) = &self.tx {
            // Receiver gone means nobody is watching.
            let _ = tx.send(event);
        }
    }
}
