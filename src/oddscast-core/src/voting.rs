//! Vote windows over two candidate topics.
//!
//! `VotingWindow` is the bookkeeping: one ballot per voter, overwritable,
//! and a winner rule where an exact tie (including 0-0) goes to option 1.
//! `VotingCoordinator` drives a window in real time by dispatching a closed
//! set of messages until the window's deadline.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior, interval_at, sleep_until};
use tracing::{debug, info};

use crate::candidates::CandidateSet;
use crate::error::ShowError;
use crate::events::{EventSender, ShowEvent};
use crate::topic::Topic;

/// Count of unique voters per option.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct VoteTally {
    pub option_1: u32,
    pub option_2: u32,
}

impl VoteTally {
    pub fn total(&self) -> u32 {
        self.option_1 + self.option_2
    }

    pub fn count(&self, option: u8) -> u32 {
        match option {
            1 => self.option_1,
            2 => self.option_2,
            _ => 0,
        }
    }

    /// Option 2 only wins with strictly more votes; ties and 0-0 go to option 1.
    pub fn winner(&self) -> u8 {
        if self.option_2 > self.option_1 { 2 } else { 1 }
    }
}

/// Parse a chat message into a vote option.
///
/// Accepts `!vote 1`, `!vote 2`, or a bare `1` / `2`, case-insensitive.
pub fn parse_chat_vote(message: &str) -> Option<u8> {
    let content = message.trim().to_lowercase();
    let candidate = match content.strip_prefix("!vote") {
        Some(rest) if rest.starts_with(char::is_whitespace) => rest.split_whitespace().next()?,
        Some(_) => return None,
        None => content.as_str(),
    };
    match candidate {
        "1" => Some(1),
        "2" => Some(2),
        _ => None,
    }
}

/// What happened to a cast vote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteReceipt {
    /// First ballot from this voter in the window.
    Counted,
    /// Voter changed their ballot.
    Replaced { previous: u8 },
    /// Window closed or option out of range.
    Ignored,
}

/// Resolved result of a closed window.
#[derive(Debug, Clone)]
pub struct VoteOutcome {
    pub winner_option: u8,
    pub winner: Arc<Topic>,
    pub tally: VoteTally,
    pub candidates: CandidateSet,
}

#[derive(Debug, Default)]
pub struct VotingWindow {
    candidates: Option<CandidateSet>,
    ballots: HashMap<String, u8>,
    open: bool,
}

impl VotingWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset ballots, record the candidates and start accepting votes.
    pub fn open(&mut self, candidates: CandidateSet) {
        self.ballots.clear();
        self.candidates = Some(candidates);
        self.open = true;
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn cast_vote(&mut self, voter_id: &str, option: u8) -> VoteReceipt {
        if !self.open || !matches!(option, 1 | 2) {
            return VoteReceipt::Ignored;
        }
        match self.ballots.insert(voter_id.to_string(), option) {
            None => VoteReceipt::Counted,
            Some(previous) => VoteReceipt::Replaced { previous },
        }
    }

    pub fn tally(&self) -> VoteTally {
        let mut tally = VoteTally::default();
        for option in self.ballots.values() {
            match option {
                1 => tally.option_1 += 1,
                _ => tally.option_2 += 1,
            }
        }
        tally
    }

    /// Stop accepting votes and resolve the winner.
    pub fn close(&mut self) -> Result<VoteOutcome, ShowError> {
        if !self.open {
            return Err(ShowError::VotingNotOpen);
        }
        self.open = false;
        let candidates = self.candidates.take().ok_or(ShowError::VotingNotOpen)?;
        let tally = self.tally();
        let winner_option = tally.winner();

        Ok(VoteOutcome {
            winner_option,
            winner: candidates.get(winner_option).clone(),
            tally,
            candidates,
        })
    }
}

/// A ballot arriving from the ingestion transport.
#[derive(Debug, Clone)]
pub struct VoteCast {
    pub voter_id: String,
    pub option: u8,
}

/// Closed set of messages the coordinator dispatches while a window is open.
#[derive(Debug)]
enum WindowMessage {
    VoteCast(VoteCast),
    Tick,
}

/// Cloneable entry point for vote transports.
#[derive(Debug, Clone)]
pub struct VoteHandle {
    tx: mpsc::UnboundedSender<VoteCast>,
    open: Arc<AtomicBool>,
}

impl VoteHandle {
    /// Queue a vote. Returns `false` when no window is open and the vote was dropped.
    pub fn cast(&self, voter_id: impl Into<String>, option: u8) -> bool {
        if !self.open.load(Ordering::Acquire) {
            return false;
        }
        self.tx
            .send(VoteCast {
                voter_id: voter_id.into(),
                option,
            })
            .is_ok()
    }

    /// Parse a chat line and queue it if it is a vote.
    pub fn cast_chat(&self, voter_id: &str, message: &str) -> bool {
        match parse_chat_vote(message) {
            Some(option) => self.cast(voter_id, option),
            None => false,
        }
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

pub struct VotingCoordinator {
    window: VotingWindow,
    inbox: mpsc::UnboundedReceiver<VoteCast>,
    handle: VoteHandle,
    tick_every: Duration,
    events: EventSender,
}

impl VotingCoordinator {
    pub fn new(tick_every: Duration, events: EventSender) -> Self {
        let (tx, inbox) = mpsc::unbounded_channel();
        Self {
            window: VotingWindow::new(),
            inbox,
            handle: VoteHandle {
                tx,
                open: Arc::new(AtomicBool::new(false)),
            },
            tick_every: tick_every.max(Duration::from_millis(100)),
            events,
        }
    }

    /// Handle for transports to submit votes through.
    pub fn handle(&self) -> VoteHandle {
        self.handle.clone()
    }

    pub fn is_open(&self) -> bool {
        self.window.is_open()
    }

    pub fn tally(&self) -> VoteTally {
        self.window.tally()
    }

    /// Reset per-window state and start accepting votes. Does not block.
    pub fn open_window(&mut self, candidates: CandidateSet, duration: Duration) {
        let mut stale = 0;
        while self.inbox.try_recv().is_ok() {
            stale += 1;
        }
        if stale > 0 {
            debug!("Discarded {} votes queued while no window was open", stale);
        }

        info!(
            "Voting open for {:?}: 1) {} | 2) {}",
            duration,
            candidates.first.short_question(),
            candidates.second.short_question()
        );
        self.events.emit(ShowEvent::VotingOpened {
            option_1: candidates.first.clone(),
            option_2: candidates.second.clone(),
            source: candidates.source,
            closes_in: duration,
        });
        self.window.open(candidates);
        self.handle.open.store(true, Ordering::Release);
    }

    /// Record a vote directly, bypassing the transport queue.
    pub fn cast_vote(&mut self, voter_id: &str, option: u8) -> VoteReceipt {
        let receipt = self.window.cast_vote(voter_id, option);
        debug!("Vote from {} for option {}: {:?}", voter_id, option, receipt);
        receipt
    }

    /// Stop accepting votes and resolve the winner.
    pub fn close_window(&mut self) -> Result<VoteOutcome, ShowError> {
        self.handle.open.store(false, Ordering::Release);
        // Votes that made it into the queue before the flag flipped still count.
        while let Ok(vote) = self.inbox.try_recv() {
            self.cast_vote(&vote.voter_id, vote.option);
        }
        let outcome = self.window.close()?;
        info!(
            "Voting closed: option {} wins ({} - {}, {} voters): {}",
            outcome.winner_option,
            outcome.tally.option_1,
            outcome.tally.option_2,
            outcome.tally.total(),
            outcome.winner.short_question()
        );
        self.events.emit(ShowEvent::VotingClosed {
            winner_option: outcome.winner_option,
            winner: outcome.winner.clone(),
            tally: outcome.tally,
        });
        Ok(outcome)
    }

    /// Drop the open window without resolving it. Used on shutdown.
    pub fn cancel_window(&mut self) {
        self.handle.open.store(false, Ordering::Release);
        while self.inbox.try_recv().is_ok() {}
        if self.window.is_open() {
            info!("Voting window cancelled at {:?}", self.window.tally());
            self.window = VotingWindow::new();
        }
    }

    pub(crate) fn set_events(&mut self, events: EventSender) {
        self.events = events;
    }

    /// Open a window, dispatch votes and tally ticks until `duration` has
    /// passed, then close it. Always resolves at the deadline.
    pub async fn run_window(
        &mut self,
        candidates: CandidateSet,
        duration: Duration,
    ) -> Result<VoteOutcome, ShowError> {
        self.open_window(candidates, duration);

        let deadline = Instant::now() + duration;
        let mut ticker = interval_at(Instant::now() + self.tick_every, self.tick_every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let message = tokio::select! {
                biased;
                _ = sleep_until(deadline) => break,
                Some(vote) = self.inbox.recv() => WindowMessage::VoteCast(vote),
                _ = ticker.tick() => WindowMessage::Tick,
            };
            self.dispatch(message, deadline);
        }

        self.close_window()
    }

    fn dispatch(&mut self, message: WindowMessage, deadline: Instant) {
        match message {
            WindowMessage::VoteCast(vote) => {
                self.cast_vote(&vote.voter_id, vote.option);
            }
            WindowMessage::Tick => {
                let tally = self.window.tally();
                debug!("Tally {} - {}", tally.option_1, tally.option_2);
                self.events.emit(ShowEvent::VoteTally {
                    tally,
                    remaining: deadline.saturating_duration_since(Instant::now()),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidates::CandidateSource;

    fn candidates() -> CandidateSet {
        CandidateSet {
            first: Arc::new(Topic::new("B", "Option B?")),
            second: Arc::new(Topic::new("C", "Option C?")),
            source: CandidateSource::Fresh,
        }
    }

    #[test]
    fn test_parse_chat_vote() {
        assert_eq!(parse_chat_vote("1"), Some(1));
        assert_eq!(parse_chat_vote("  2 "), Some(2));
        assert_eq!(parse_chat_vote("!vote 1"), Some(1));
        assert_eq!(parse_chat_vote("!VOTE   2"), Some(2));
        assert_eq!(parse_chat_vote("!vote 3"), None);
        assert_eq!(parse_chat_vote("!vote1"), None);
        assert_eq!(parse_chat_vote("!vote"), None);
        assert_eq!(parse_chat_vote("12"), None);
        assert_eq!(parse_chat_vote("vote for 1 pls"), None);
    }

    #[test]
    fn test_tie_and_empty_go_to_option_one() {
        assert_eq!(VoteTally::default().winner(), 1);
        assert_eq!(VoteTally { option_1: 2, option_2: 2 }.winner(), 1);
        assert_eq!(VoteTally { option_1: 2, option_2: 3 }.winner(), 2);
        assert_eq!(VoteTally { option_1: 3, option_2: 2 }.winner(), 1);
    }

    #[test]
    fn test_revote_replaces_ballot() {
        let mut window = VotingWindow::new();
        window.open(candidates());

        assert_eq!(window.cast_vote("alice", 1), VoteReceipt::Counted);
        assert_eq!(window.cast_vote("alice", 2), VoteReceipt::Replaced { previous: 1 });
        assert_eq!(window.cast_vote("alice", 2), VoteReceipt::Replaced { previous: 2 });
        assert_eq!(window.cast_vote("bob", 1), VoteReceipt::Counted);

        let tally = window.tally();
        assert_eq!(tally.total(), 2);
        assert_eq!(tally, VoteTally { option_1: 1, option_2: 1 });
    }

    #[test]
    fn test_tally_total_equals_distinct_voters() {
        let mut window = VotingWindow::new();
        window.open(candidates());
        let voters = ["a", "b", "c", "a", "d", "b", "e", "a"];
        for (i, voter) in voters.iter().enumerate() {
            window.cast_vote(voter, (i % 2) as u8 + 1);
        }
        assert_eq!(window.tally().total(), 5);
    }

    #[test]
    fn test_invalid_and_closed_votes_ignored() {
        let mut window = VotingWindow::new();
        assert_eq!(window.cast_vote("early", 1), VoteReceipt::Ignored);

        window.open(candidates());
        assert_eq!(window.cast_vote("x", 0), VoteReceipt::Ignored);
        assert_eq!(window.cast_vote("x", 3), VoteReceipt::Ignored);
        window.cast_vote("y", 2);

        let outcome = window.close().unwrap();
        assert_eq!(outcome.winner_option, 2);
        assert_eq!(outcome.winner.id, "C");
        assert_eq!(window.cast_vote("late", 1), VoteReceipt::Ignored);
        assert!(matches!(window.close(), Err(ShowError::VotingNotOpen)));
    }

    #[test]
    fn test_reopen_clears_previous_ballots() {
        let mut window = VotingWindow::new();
        window.open(candidates());
        window.cast_vote("a", 2);
        window.close().unwrap();

        window.open(candidates());
        assert_eq!(window.tally().total(), 0);
        let outcome = window.close().unwrap();
        assert_eq!(outcome.winner_option, 1);
        assert_eq!(outcome.winner.id, "B");
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_window_counts_handle_votes_until_deadline() {
        let mut coordinator = VotingCoordinator::new(Duration::from_secs(5), EventSender::none());
        let handle = coordinator.handle();
        assert!(!handle.cast("too-early", 2));

        let voters = tokio::spawn({
            let handle = handle.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                for voter in ["a", "b", "c"] {
                    handle.cast(voter, 1);
                }
                handle.cast_chat("d", "!vote 2");
                handle.cast_chat("e", "2");
                handle.cast_chat("d", "hello");
            }
        });

        let started = Instant::now();
        let outcome = coordinator
            .run_window(candidates(), Duration::from_secs(60))
            .await
            .unwrap();
        voters.await.unwrap();

        assert_eq!(started.elapsed(), Duration::from_secs(60));
        assert_eq!(outcome.tally, VoteTally { option_1: 3, option_2: 2 });
        assert_eq!(outcome.winner.id, "B");
        assert!(!handle.is_open());
        assert!(!handle.cast("too-late", 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_window_emits_tally_ticks() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut coordinator = VotingCoordinator::new(Duration::from_secs(5), EventSender::new(tx));

        coordinator
            .run_window(candidates(), Duration::from_secs(12))
            .await
            .unwrap();

        let mut ticks = 0;
        let mut opened = false;
        let mut closed = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                ShowEvent::VotingOpened { .. } => opened = true,
                ShowEvent::VoteTally { .. } => ticks += 1,
                ShowEvent::VotingClosed { winner_option, .. } => {
                    closed = true;
                    assert_eq!(winner_option, 1);
                }
                _ => {}
            }
        }
        assert!(opened && closed);
        assert_eq!(ticks, 2);
    }
}
