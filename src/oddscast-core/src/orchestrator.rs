//! Show orchestration.
//!
//! Drives the endless discussion → voting → transition cycle. Within a cycle
//! the first turn plays alone; after it drains, the remaining turns and the
//! vote window run side by side and the cycle waits for both before picking
//! the next topic.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::audio::{AudioFormat, AudioSink};
use crate::candidates::{CandidateSelector, available_strategies, get_strategy};
use crate::config::ShowConfig;
use crate::dialogue::{DialogueGenerator, DialoguePipeline, DialogueStream, DialogueTurn};
use crate::error::ShowError;
use crate::events::{EventSender, ShowEvent};
use crate::host::Speaker;
use crate::playback::PlaybackEngine;
use crate::state::{ShowState, ShowStatus};
use crate::topic::{Topic, TopicProvider};
use crate::tts::SpeechSynthesizer;
use crate::voting::{VoteHandle, VoteOutcome, VotingCoordinator};

/// External run control, sent over a `watch` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShowControl {
    Running,
    /// Hold before the next discussion starts.
    Paused,
    /// Stop as soon as possible.
    Shutdown,
}

/// The external collaborators a show needs.
pub struct ShowServices {
    pub provider: Arc<dyn TopicProvider>,
    pub generator: Arc<dyn DialogueGenerator>,
    pub synthesizer: Arc<dyn SpeechSynthesizer>,
    pub sink: Arc<dyn AudioSink>,
}

struct Hosts {
    a: PlaybackEngine,
    b: PlaybackEngine,
}

impl Hosts {
    fn engine(&self, speaker: Speaker) -> &PlaybackEngine {
        match speaker {
            Speaker::A => &self.a,
            Speaker::B => &self.b,
        }
    }
}

/// Runs the live show until told to stop.
pub struct ShowOrchestrator {
    config: Arc<ShowConfig>,
    state: ShowState,
    pipeline: DialoguePipeline,
    hosts: Hosts,
    selector: CandidateSelector,
    voting: VotingCoordinator,
    sink: Arc<dyn AudioSink>,
    events: EventSender,
    released: bool,
}

impl ShowOrchestrator {
    pub fn new(config: Arc<ShowConfig>, services: ShowServices) -> Result<Self, ShowError> {
        config.validate()?;

        let strategy = get_strategy(&config.voting.strategy).ok_or_else(|| {
            ShowError::ConfigError(format!(
                "Unknown candidate strategy '{}'. Available: {}",
                config.voting.strategy,
                available_strategies().join(", ")
            ))
        })?;

        let format = AudioFormat::from_config(&config.audio);
        let engine = |speaker: Speaker| {
            PlaybackEngine::new(
                speaker,
                config.host(speaker).clone(),
                format,
                services.synthesizer.clone(),
                services.sink.clone(),
                config.chunk_timeout(),
                config.drain_timeout(),
            )
        };
        let hosts = Hosts {
            a: engine(Speaker::A),
            b: engine(Speaker::B),
        };

        let selector = CandidateSelector::new(
            services.provider,
            strategy,
            config.voting.pool_size,
            config.voting.expanded_pool_size,
        );
        let voting = VotingCoordinator::new(
            std::time::Duration::from_secs(config.voting.tally_interval_secs),
            EventSender::none(),
        );

        Ok(Self {
            state: ShowState::new(config.phase_durations(), config.show.history_size),
            pipeline: DialoguePipeline::new(services.generator),
            hosts,
            selector,
            voting,
            sink: services.sink,
            events: EventSender::none(),
            released: false,
            config,
        })
    }

    /// Publish show events on `tx`.
    pub fn with_events(mut self, tx: mpsc::UnboundedSender<ShowEvent>) -> Self {
        self.events = EventSender::new(tx);
        self.voting.set_events(self.events.clone());
        self
    }

    /// Handle for chat transports to submit votes through.
    pub fn vote_handle(&self) -> VoteHandle {
        self.voting.handle()
    }

    pub fn status(&self) -> ShowStatus {
        self.state.status()
    }

    /// Run the show until `control` says `Shutdown` (or its sender is gone
    /// and the show is left running forever).
    ///
    /// Only a failed startup fetch is returned as an error; everything that
    /// goes wrong inside a cycle is logged and degraded around.
    pub async fn run(&mut self, mut control: watch::Receiver<ShowControl>) -> Result<(), ShowError> {
        info!(
            "Starting show with {} and {} (strategy: {})",
            self.config.hosts.a.name,
            self.config.hosts.b.name,
            self.selector.strategy_name()
        );

        let initial = tokio::select! {
            topic = self.selector.initial_topic() => Some(topic),
            _ = shutdown_requested(&mut control) => None,
        };

        let mut topic = match initial {
            Some(Ok(topic)) => topic,
            Some(Err(e)) => {
                error!("{}", e);
                self.shutdown().await;
                return Err(e);
            }
            None => {
                self.shutdown().await;
                return Ok(());
            }
        };
        self.events.emit(ShowEvent::TopicSelected {
            topic: topic.clone(),
        });

        loop {
            if !self.hold_while_paused(&mut control).await {
                break;
            }

            let next = tokio::select! {
                next = self.run_cycle(topic.clone()) => Some(next),
                _ = shutdown_requested(&mut control) => None,
            };
            match next {
                Some(next) => topic = next,
                None => break,
            }
        }

        self.shutdown().await;
        Ok(())
    }

    /// One discussion → voting → transition cycle. Returns the next topic.
    async fn run_cycle(&mut self, topic: Arc<Topic>) -> Arc<Topic> {
        self.state.begin_discussion(topic.clone());
        self.emit_status();

        let turns = self.config.show.turns_per_discussion;
        let mut dialogue = self.pipeline.start(topic.clone(), turns);

        match dialogue.next_turn().await {
            Some(Ok(turn)) => play_turn(&self.hosts, &turn, &self.events).await,
            Some(Err(e)) => report_turn_failure(&self.events, e),
            None => {}
        }

        let Self {
            ref config,
            ref mut state,
            ref hosts,
            ref selector,
            ref mut voting,
            ref events,
            ..
        } = *self;
        let ((), outcome) = tokio::join!(
            play_remaining(hosts, &mut dialogue, events),
            run_vote(config, state, selector, voting, events, &topic),
        );
        drop(dialogue);

        let next = self.resolve_next(&topic, outcome).await;
        self.transition(&next).await;
        next
    }

    /// Winner of the vote, unless it is the topic just discussed or there
    /// was no vote; then a fresh replacement, and failing that `current`.
    async fn resolve_next(&mut self, current: &Arc<Topic>, outcome: Option<VoteOutcome>) -> Arc<Topic> {
        match outcome {
            Some(outcome) if outcome.winner.id != current.id => return outcome.winner,
            Some(_) => warn!(
                "Vote resolved to the topic just discussed ({}), fetching a replacement",
                current.id
            ),
            None => warn!("No vote result this cycle, fetching a replacement topic"),
        }

        match self
            .selector
            .replacement_for(current, self.state.discussed())
            .await
        {
            Some(topic) => topic,
            None => {
                warn!(
                    "No other topic available, discussing again: {}",
                    current.short_question()
                );
                current.clone()
            }
        }
    }

    async fn transition(&mut self, next: &Arc<Topic>) {
        self.state.start_transition();
        self.emit_status();
        self.events.emit(ShowEvent::TopicSelected {
            topic: next.clone(),
        });

        let announcement = self.config.announcement(next);
        if !announcement.trim().is_empty() {
            if let Err(e) = self.hosts.a.speak_text(&announcement).await {
                warn!("Transition announcement failed: {}", e);
            }
        }

        if let Some(remaining) = self.state.machine().remaining() {
            if !remaining.is_zero() {
                debug!("Waiting {:?} before the next discussion", remaining);
                tokio::time::sleep(remaining).await;
            }
        }
    }

    /// Returns `false` if shutdown was requested while paused.
    async fn hold_while_paused(&mut self, control: &mut watch::Receiver<ShowControl>) -> bool {
        let current = *control.borrow_and_update();
        match current {
            ShowControl::Running => return true,
            ShowControl::Shutdown => return false,
            ShowControl::Paused => {}
        }

        self.state.pause();
        self.emit_status();
        info!("Show paused");

        loop {
            if control.changed().await.is_err() {
                break;
            }
            let current = *control.borrow_and_update();
            match current {
                ShowControl::Running => break,
                ShowControl::Shutdown => return false,
                ShowControl::Paused => {}
            }
        }

        let phase = self.state.resume();
        info!("Show resumed ({})", phase);
        self.emit_status();
        true
    }

    /// Stop taking votes, release the sink once, and end.
    async fn shutdown(&mut self) {
        self.voting.cancel_window();
        if !self.released {
            self.released = true;
            if let Err(e) = self.sink.close().await {
                warn!("Failed to close audio output: {}", e);
            }
        }
        self.state.end();
        self.emit_status();
        self.events.emit(ShowEvent::Ended);
    }

    fn emit_status(&self) {
        self.events.emit(status_event(&self.state));
    }
}

fn status_event(state: &ShowState) -> ShowEvent {
    ShowEvent::Status {
        phase: state.phase(),
        status: state.status(),
    }
}

/// Resolves once `control` reads `Shutdown`. Never resolves if the sender is dropped.
async fn shutdown_requested(control: &mut watch::Receiver<ShowControl>) {
    loop {
        if *control.borrow_and_update() == ShowControl::Shutdown {
            return;
        }
        if control.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn play_turn(hosts: &Hosts, turn: &DialogueTurn, events: &EventSender) {
    let engine = hosts.engine(turn.speaker);
    info!("[{}] {}", engine.host().name, turn.text);
    events.emit(ShowEvent::TurnStarted {
        speaker: turn.speaker,
        host_name: engine.host().name.clone(),
        index: turn.sequence_index,
        text: turn.text.clone(),
    });

    match engine.speak(turn).await {
        Ok(_) => {}
        Err(e @ ShowError::PlaybackDrainTimeout { .. }) => {
            warn!("{}; continuing as if playback finished", e);
        }
        Err(e) => {
            warn!("Turn {} playback failed: {}", turn.sequence_index, e);
            events.emit(ShowEvent::TurnFailed {
                index: turn.sequence_index,
                reason: e.to_string(),
            });
            return;
        }
    }
    events.emit(ShowEvent::SpeechComplete {
        speaker: turn.speaker,
        index: turn.sequence_index,
    });
}

/// Play every turn left in `dialogue`, each only after the previous drained.
async fn play_remaining(hosts: &Hosts, dialogue: &mut DialogueStream, events: &EventSender) {
    while let Some(next) = dialogue.next_turn().await {
        match next {
            Ok(turn) => play_turn(hosts, &turn, events).await,
            Err(e) => {
                report_turn_failure(events, e);
                break;
            }
        }
    }
}

fn report_turn_failure(events: &EventSender, e: ShowError) {
    warn!("Dialogue cut short: {}", e);
    let index = match &e {
        ShowError::GenerationFailed { index, .. } => *index,
        _ => 0,
    };
    events.emit(ShowEvent::TurnFailed {
        index,
        reason: e.to_string(),
    });
}

/// Pick candidates and run the full vote window. `None` if no vote could be held.
async fn run_vote(
    config: &ShowConfig,
    state: &mut ShowState,
    selector: &CandidateSelector,
    voting: &mut VotingCoordinator,
    events: &EventSender,
    current: &Topic,
) -> Option<VoteOutcome> {
    let candidates = match selector.select(Some(current), state.discussed_mut()).await {
        Ok(candidates) => candidates,
        Err(e) => {
            warn!("Skipping vote this cycle: {}", e);
            return None;
        }
    };
    if candidates.source.is_fallback() {
        warn!("Voting on fallback candidates ({:?})", candidates.source);
    }

    state.start_voting();
    events.emit(status_event(state));

    match voting.run_window(candidates, config.voting_duration()).await {
        Ok(outcome) => {
            state.record_votes(outcome.tally);
            Some(outcome)
        }
        Err(e) => {
            warn!("Vote window failed: {}", e);
            None
        }
    }
}
