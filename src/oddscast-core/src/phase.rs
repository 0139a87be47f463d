//! Show phases and per-phase timing.
//!
//! Pure bookkeeping: nothing here blocks. The orchestrator consults the
//! machine to decide how long to wait and what to report.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Current phase of the show.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Phase {
    /// Initial setup, no topic yet.
    Starting,
    /// Hosts discussing the current topic.
    Discussion,
    /// Chat voting on the next topic.
    Voting,
    /// Announcing the winner.
    Transition,
    /// Held between cycles.
    Paused,
    /// Terminal.
    Ended,
}

impl Phase {
    pub fn name(&self) -> &'static str {
        match self {
            Phase::Starting => "STARTING",
            Phase::Discussion => "DISCUSSION",
            Phase::Voting => "VOTING",
            Phase::Transition => "TRANSITION",
            Phase::Paused => "PAUSED",
            Phase::Ended => "ENDED",
        }
    }

    /// Whether the show is producing content in this phase.
    pub fn is_active(&self) -> bool {
        !matches!(self, Phase::Paused | Phase::Ended)
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Configured length of each bounded phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseDurations {
    pub discussion: Duration,
    pub voting: Duration,
    pub transition: Duration,
}

impl PhaseDurations {
    /// `None` for the unbounded phases (STARTING, PAUSED, ENDED).
    pub fn for_phase(&self, phase: Phase) -> Option<Duration> {
        match phase {
            Phase::Discussion => Some(self.discussion),
            Phase::Voting => Some(self.voting),
            Phase::Transition => Some(self.transition),
            Phase::Starting | Phase::Paused | Phase::Ended => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PhaseStateMachine {
    phase: Phase,
    phase_start: Instant,
    durations: PhaseDurations,
    /// Phase that was active when `pause` was called.
    paused_from: Option<Phase>,
}

impl PhaseStateMachine {
    pub fn new(durations: PhaseDurations) -> Self {
        Self {
            phase: Phase::Starting,
            phase_start: Instant::now(),
            durations,
            paused_from: None,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Record `phase` and restart the phase clock. Returns `false` once ENDED.
    pub fn enter(&mut self, phase: Phase) -> bool {
        if self.phase == Phase::Ended {
            warn!("Ignoring transition to {} after the show ended", phase);
            return false;
        }
        if phase != self.phase {
            info!("Phase {} -> {}", self.phase, phase);
        }
        self.phase = phase;
        self.phase_start = Instant::now();
        true
    }

    pub fn elapsed(&self) -> Duration {
        self.phase_start.elapsed()
    }

    /// Time left in a bounded phase, saturating at zero; `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.durations
            .for_phase(self.phase)
            .map(|d| d.saturating_sub(self.elapsed()))
    }

    pub fn should_transition(&self) -> bool {
        self.remaining().is_some_and(|r| r.is_zero())
    }

    /// Hold the show, remembering which phase to come back to.
    pub fn pause(&mut self) {
        if !self.phase.is_active() {
            return;
        }
        self.paused_from = Some(self.phase);
        self.enter(Phase::Paused);
    }

    /// Leave PAUSED, restoring the saved phase or `fallback` if none was saved.
    pub fn resume(&mut self, fallback: Phase) -> Phase {
        if self.phase != Phase::Paused {
            return self.phase;
        }
        let restored = self.paused_from.take().unwrap_or(fallback);
        self.enter(restored);
        restored
    }
}
