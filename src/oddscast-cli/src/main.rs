//! Oddscast CLI - live prediction market show
//!
//! Runs the two-host show against Polymarket's trending markets, recording
//! or streaming the audio and taking votes over a line-based chat socket.

mod chat;

use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use oddscast_core::{
    AudioFormat, AudioSink, DialogueApiConfig, ElevenLabsSynthesizer, GammaClient,
    KokoroSynthesizer, OpenAiDialogue, PcmPipeSink, ShowConfig, ShowControl, ShowEvent,
    ShowOrchestrator, ShowServices, SpeechSynthesizer, WavRecorder, default_config,
};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::chat::ChatRouter;

#[derive(Parser)]
#[command(
    name = "oddscast",
    version,
    about = "Live AI show about trending prediction markets",
    long_about = "Two AI hosts discuss a trending market while the audience votes on the next one."
)]
struct Cli {
    /// Show configuration file (TOML); built-in defaults when omitted
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log filter, e.g. "info" or "oddscast_core=debug" (overrides RUST_LOG)
    #[arg(long, value_name = "FILTER")]
    log_level: Option<String>,

    /// Address for the chat listener
    #[arg(long, default_value = "127.0.0.1:7000", value_name = "ADDR")]
    chat_addr: String,

    /// Record the show to this WAV file
    #[arg(long, default_value = "oddscast.wav", value_name = "FILE")]
    record: PathBuf,

    /// Write raw 16-bit PCM to stdout instead of recording
    #[arg(long)]
    pcm_stdout: bool,

    /// Speech backend: elevenlabs or kokoro (overrides the config file)
    #[arg(long, value_name = "BACKEND")]
    backend: Option<String>,

    /// Print every status snapshot as a JSON line
    #[arg(long)]
    json_status: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from .env file if present
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref())?;
    let console = Console::for_cli(&cli);

    let mut config = match &cli.config {
        Some(path) => ShowConfig::load(path)?,
        None => default_config(),
    };
    if let Some(backend) = &cli.backend {
        config.synthesis.backend = backend.clone();
    }
    let config = Arc::new(config);

    // Get API configuration from environment
    let api_base = env::var("OPENAI_API_BASE")
        .or_else(|_| env::var("OPENAI_BASE_URL"))
        .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());

    let api_key = env::var("OPENAI_API_KEY").unwrap_or_else(|_| {
        eprintln!(
            "{}",
            "Warning: OPENAI_API_KEY not set. API calls may fail.".yellow()
        );
        String::new()
    });

    let generator = OpenAiDialogue::new(DialogueApiConfig::new(api_base, api_key), config.clone())?;
    let synthesizer = build_synthesizer(&config, console).await?;
    let sink = build_sink(&cli, &config)?;
    let provider = GammaClient::new(&config.provider)?;

    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let mut show = ShowOrchestrator::new(
        config.clone(),
        ShowServices {
            provider: Arc::new(provider),
            generator: Arc::new(generator),
            synthesizer,
            sink,
        },
    )?
    .with_events(events_tx);

    let (control_tx, control_rx) = watch::channel(ShowControl::Running);
    let control_tx = Arc::new(control_tx);

    let router = ChatRouter::new(
        show.vote_handle(),
        control_tx.clone(),
        config.voting.operator.clone(),
    );
    let chat_addr = cli.chat_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = chat::serve(chat_addr, router).await {
            error!("Chat listener stopped: {}", e);
        }
    });

    {
        let control = control_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown requested");
                control.send_replace(ShowControl::Shutdown);
            }
        });
    }

    console.header(&config, &cli);
    let printer = tokio::spawn(print_events(events_rx, console));

    let result = show.run(control_rx).await;
    drop(show);
    if let Err(e) = printer.await {
        warn!("Console printer failed: {}", e);
    }
    result?;

    console.footer();
    Ok(())
}

fn init_logging(level: Option<&str>) -> Result<(), Box<dyn std::error::Error>> {
    let filter = match level {
        Some(level) => EnvFilter::try_new(level)?,
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("oddscast_core=info,oddscast=info")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

async fn build_synthesizer(
    config: &ShowConfig,
    console: Console,
) -> Result<Arc<dyn SpeechSynthesizer>, Box<dyn std::error::Error>> {
    match config.synthesis.backend.as_str() {
        "elevenlabs" => {
            let key = env::var("ELEVEN_API_KEY").unwrap_or_else(|_| {
                eprintln!(
                    "{}",
                    "Warning: ELEVEN_API_KEY not set. Speech will fail.".yellow()
                );
                String::new()
            });
            Ok(Arc::new(ElevenLabsSynthesizer::new(
                &config.synthesis,
                key,
                config.audio.sample_rate,
            )?))
        }
        "kokoro" => {
            console.line("Initializing TTS engine...".dimmed());
            let kokoro = KokoroSynthesizer::new(config.audio.sample_rate).await?;
            kokoro.validate_voice(&config.hosts.a.local_voice)?;
            kokoro.validate_voice(&config.hosts.b.local_voice)?;
            Ok(Arc::new(kokoro))
        }
        other => Err(format!(
            "Unknown synthesis backend: '{}'. Available backends: elevenlabs, kokoro",
            other
        )
        .into()),
    }
}

fn build_sink(cli: &Cli, config: &ShowConfig) -> Result<Arc<dyn AudioSink>, Box<dyn std::error::Error>> {
    if cli.pcm_stdout {
        return Ok(Arc::new(PcmPipeSink::stdout()));
    }
    let format = AudioFormat::from_config(&config.audio);
    Ok(Arc::new(WavRecorder::create(&cli.record, format)?))
}

/// Console rendering of show events. Goes to stderr when stdout carries audio.
#[derive(Clone, Copy)]
struct Console {
    to_stderr: bool,
    json_status: bool,
}

impl Console {
    fn for_cli(cli: &Cli) -> Self {
        Self {
            to_stderr: cli.pcm_stdout,
            json_status: cli.json_status,
        }
    }

    fn line(&self, text: impl std::fmt::Display) {
        if self.to_stderr {
            eprintln!("{}", text);
        } else {
            println!("{}", text);
        }
    }

    fn header(&self, config: &ShowConfig, cli: &Cli) {
        self.line("");
        self.line("═".repeat(70).bright_blue());
        self.line(format!("  {}", "ODDSCAST - Live Market Show".bold()).bright_blue().bold());
        self.line("═".repeat(70).bright_blue());
        self.line("");
        self.line("Hosts:".bold());
        for host in [&config.hosts.a, &config.hosts.b] {
            self.line(format!("  - {} ({})", host.name.bright_cyan(), host.id.dimmed()));
        }
        let output = if cli.pcm_stdout {
            "raw PCM on stdout".to_string()
        } else {
            cli.record.display().to_string()
        };
        self.line(format!("{} {}", "Audio:".bold(), output));
        self.line(format!("{} {}", "Chat:".bold(), cli.chat_addr));
        self.line(format!(
            "{} {}",
            "Voice:".bold(),
            config.synthesis.backend.yellow()
        ));
        self.line("");
        self.line("─".repeat(70).dimmed());
    }

    fn footer(&self) {
        self.line("");
        self.line("═".repeat(70).bright_blue());
        self.line("  Show ended.".bright_green().bold());
        self.line("═".repeat(70).bright_blue());
        self.line("");
    }

    fn event(&self, event: ShowEvent) {
        match event {
            ShowEvent::Status { status, .. } => {
                if self.json_status {
                    if let Ok(json) = serde_json::to_string(&status) {
                        self.line(json);
                    }
                }
            }
            ShowEvent::TopicSelected { topic } => {
                self.line("");
                self.line("═".repeat(70).bright_magenta());
                self.line(
                    format!("  📢 NOW DISCUSSING: {}", topic.question)
                        .bright_magenta()
                        .bold(),
                );
                let odds = topic
                    .formatted_odds()
                    .into_iter()
                    .map(|(name, price)| format!("{}: {}", name, price))
                    .collect::<Vec<_>>()
                    .join(" | ");
                self.line(format!("  {} | Vol: {}", odds, topic.formatted_volume()).dimmed());
                self.line("═".repeat(70).bright_magenta());
                self.line("");
            }
            ShowEvent::TurnStarted {
                speaker,
                host_name,
                text,
                ..
            } => {
                self.line(format!(
                    "{} {} {}",
                    "▶".bright_cyan(),
                    host_name.bright_cyan().bold(),
                    format!("({})", speaker).yellow()
                ));
                // Word wrap and indent the content
                for line in textwrap(&text, 66).lines() {
                    self.line(format!("  {}", line));
                }
                self.line("");
            }
            ShowEvent::SpeechComplete { .. } => {}
            ShowEvent::TurnFailed { index, reason } => {
                self.line(format!("  [Turn {} skipped] {}", index + 1, reason).yellow());
            }
            ShowEvent::VotingOpened {
                option_1,
                option_2,
                source,
                closes_in,
            } => {
                self.line("─".repeat(70).bright_yellow());
                self.line(
                    format!("  🗳  VOTE NOW ({}s): type 1 or 2", closes_in.as_secs())
                        .bright_yellow()
                        .bold(),
                );
                self.line(format!("  1) {}", option_1.question));
                self.line(format!("  2) {}", option_2.question));
                if source.is_fallback() {
                    self.line(format!("  (fallback candidates: {:?})", source).dimmed());
                }
                self.line("─".repeat(70).bright_yellow());
            }
            ShowEvent::VoteTally { tally, remaining } => {
                self.line(
                    format!(
                        "  votes  1) {}  2) {}  ({}s left)",
                        tally.option_1,
                        tally.option_2,
                        remaining.as_secs()
                    )
                    .dimmed(),
                );
            }
            ShowEvent::VotingClosed {
                winner_option,
                winner,
                tally,
            } => {
                self.line(
                    format!(
                        "  Option {} wins ({} - {}): {}",
                        winner_option,
                        tally.option_1,
                        tally.option_2,
                        winner.short_question()
                    )
                    .bright_green()
                    .bold(),
                );
            }
            ShowEvent::Ended => {
                // Handled in main
            }
        }
    }
}

async fn print_events(mut events: mpsc::UnboundedReceiver<ShowEvent>, console: Console) {
    while let Some(event) = events.recv().await {
        console.event(event);
    }
}

/// Simple text wrapping function.
fn textwrap(text: &str, width: usize) -> String {
    let mut result = String::new();
    let mut current_line_len = 0;

    for word in text.split_whitespace() {
        if current_line_len + word.len() + 1 > width && current_line_len > 0 {
            result.push('\n');
            current_line_len = 0;
        }
        if current_line_len > 0 {
            result.push(' ');
            current_line_len += 1;
        }
        result.push_str(word);
        current_line_len += word.len();
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_textwrap() {
        let wrapped = textwrap("one two three four five", 9);
        assert_eq!(wrapped, "one two\nthree\nfour five");
    }

    #[test]
    fn test_cli_parses_flags() {
        let cli = Cli::parse_from(["oddscast", "--pcm-stdout", "--json-status", "--backend", "kokoro"]);
        assert!(cli.pcm_stdout);
        assert!(cli.json_status);
        assert_eq!(cli.backend.as_deref(), Some("kokoro"));
        assert_eq!(cli.chat_addr, "127.0.0.1:7000");
    }

    #[test]
    fn test_console_leaves_stdout_to_pcm() {
        let piped = Cli::parse_from(["oddscast", "--pcm-stdout", "--backend", "kokoro"]);
        assert!(Console::for_cli(&piped).to_stderr);

        let recorded = Cli::parse_from(["oddscast", "--record", "show.wav"]);
        assert!(!Console::for_cli(&recorded).to_stderr);
    }
}
