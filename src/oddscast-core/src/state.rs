//! Show state owned by the orchestrator.
//!
//! Every mutation goes through an explicit transition method so the phase
//! clock, the current topic and the history stay consistent.

use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::info;

use crate::phase::{Phase, PhaseDurations, PhaseStateMachine};
use crate::topic::Topic;
use crate::voting::VoteTally;

/// Recently discussed topic ids, oldest first, capped at `capacity`.
#[derive(Debug, Clone)]
pub struct DiscussionHistory {
    ids: VecDeque<String>,
    capacity: usize,
}

impl DiscussionHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            ids: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Record `id` as most recent; a repeat moves to the back instead of duplicating.
    pub fn push(&mut self, id: &str) {
        if self.capacity == 0 {
            return;
        }
        self.ids.retain(|existing| existing != id);
        self.ids.push_back(id.to_string());
        while self.ids.len() > self.capacity {
            self.ids.pop_front();
        }
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.iter().any(|existing| existing == id)
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn ids(&self) -> Vec<String> {
        self.ids.iter().cloned().collect()
    }
}

/// Serializable snapshot for overlays and status output.
#[derive(Debug, Clone, Serialize)]
pub struct ShowStatus {
    pub phase: String,
    pub current_topic: Option<String>,
    pub discussion_number: u64,
    pub phase_elapsed_secs: f64,
    pub time_remaining_secs: Option<f64>,
    pub total_votes: u64,
    pub topics_discussed: usize,
    pub last_tally: VoteTally,
}

#[derive(Debug)]
pub struct ShowState {
    machine: PhaseStateMachine,
    current_topic: Option<Arc<Topic>>,
    discussion_count: u64,
    discussed: DiscussionHistory,
    vote_tally: VoteTally,
    total_votes: u64,
}

impl ShowState {
    pub fn new(durations: PhaseDurations, history_size: usize) -> Self {
        Self {
            machine: PhaseStateMachine::new(durations),
            current_topic: None,
            discussion_count: 0,
            discussed: DiscussionHistory::new(history_size),
            vote_tally: VoteTally::default(),
            total_votes: 0,
        }
    }

    pub fn phase(&self) -> Phase {
        self.machine.phase()
    }

    pub fn machine(&self) -> &PhaseStateMachine {
        &self.machine
    }

    pub fn current_topic(&self) -> Option<&Arc<Topic>> {
        self.current_topic.as_ref()
    }

    pub fn discussion_count(&self) -> u64 {
        self.discussion_count
    }

    pub fn discussed(&self) -> &DiscussionHistory {
        &self.discussed
    }

    pub fn discussed_mut(&mut self) -> &mut DiscussionHistory {
        &mut self.discussed
    }

    pub fn vote_tally(&self) -> VoteTally {
        self.vote_tally
    }

    /// Set `topic` as current, mark it discussed and enter DISCUSSION.
    pub fn begin_discussion(&mut self, topic: Arc<Topic>) {
        self.discussed.push(&topic.id);
        self.discussion_count += 1;
        info!(
            "Starting discussion #{}: {}",
            self.discussion_count,
            topic.short_question()
        );
        self.current_topic = Some(topic);
        self.machine.enter(Phase::Discussion);
    }

    pub fn start_voting(&mut self) {
        self.vote_tally = VoteTally::default();
        self.machine.enter(Phase::Voting);
    }

    /// Store the final tally of a closed window.
    pub fn record_votes(&mut self, tally: VoteTally) {
        self.total_votes += tally.total() as u64;
        self.vote_tally = tally;
    }

    pub fn start_transition(&mut self) {
        self.machine.enter(Phase::Transition);
    }

    pub fn pause(&mut self) {
        self.machine.pause();
    }

    /// Resume the saved phase, or STARTING if no topic was ever set.
    pub fn resume(&mut self) -> Phase {
        let fallback = if self.current_topic.is_some() {
            Phase::Discussion
        } else {
            Phase::Starting
        };
        self.machine.resume(fallback)
    }

    pub fn end(&mut self) {
        info!("Show ended after {} discussions", self.discussion_count);
        self.machine.enter(Phase::Ended);
    }

    pub fn status(&self) -> ShowStatus {
        ShowStatus {
            phase: self.phase().name().to_string(),
            current_topic: self.current_topic.as_ref().map(|t| t.question.clone()),
            discussion_number: self.discussion_count,
            phase_elapsed_secs: self.machine.elapsed().as_secs_f64(),
            time_remaining_secs: self.machine.remaining().map(|d| d.as_secs_f64()),
            total_votes: self.total_votes,
            topics_discussed: self.discussed.len(),
            last_tally: self.vote_tally,
        }
    }
}
