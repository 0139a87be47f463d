//! Dialogue generation for the two hosts.
//!
//! `DialoguePipeline` hands out a `DialogueStream` per discussion. The stream
//! keeps exactly one turn in flight: as soon as turn `i` is handed to the
//! caller, turn `i + 1` starts generating in the background, so its text is
//! ready by the time turn `i` has finished playing.

use std::sync::Arc;
use std::time::Duration;

use async_openai::Client;
use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestAssistantMessage, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
    CreateChatCompletionRequestArgs,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::ShowConfig;
use crate::error::ShowError;
use crate::host::Speaker;
use crate::topic::{Topic, with_retries};

/// One host's utterance within a discussion.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DialogueTurn {
    pub speaker: Speaker,
    pub sequence_index: usize,
    pub text: String,
}

/// Writes the next line of a discussion.
#[async_trait]
pub trait DialogueGenerator: Send + Sync {
    /// Text for turn `index`, given every turn already produced for `topic`.
    async fn generate_turn(
        &self,
        topic: &Topic,
        prior: &[DialogueTurn],
        index: usize,
    ) -> Result<String, ShowError>;
}

/// Settings for the dialogue API.
#[derive(Debug, Clone)]
pub struct DialogueApiConfig {
    /// OpenAI-compatible API base URL.
    pub api_base: String,
    /// API key for authentication.
    pub api_key: String,
}

impl DialogueApiConfig {
    pub fn new(api_base: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            api_key: api_key.into(),
        }
    }
}

/// Dialogue from an OpenAI-compatible chat completion endpoint.
pub struct OpenAiDialogue {
    client: Client<OpenAIConfig>,
    config: Arc<ShowConfig>,
}

const MAX_EMPTY_RETRIES: usize = 3;
const MAX_API_ATTEMPTS: u32 = 3;

impl OpenAiDialogue {
    pub fn new(api: DialogueApiConfig, config: Arc<ShowConfig>) -> Result<Self, ShowError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(120))
            .connect_timeout(Duration::from_secs(30))
            .build()?;

        let openai_config = OpenAIConfig::new()
            .with_api_key(&api.api_key)
            .with_api_base(&api.api_base);

        Ok(Self {
            client: Client::with_config(openai_config).with_http_client(http_client),
            config,
        })
    }

    fn build_messages(
        &self,
        topic: &Topic,
        prior: &[DialogueTurn],
        index: usize,
    ) -> Vec<ChatCompletionRequestMessage> {
        let mut messages = vec![ChatCompletionRequestMessage::System(
            ChatCompletionRequestSystemMessage {
                content: self.config.system_prompt(topic).into(),
                name: None,
            },
        )];

        for turn in prior {
            let host = self.config.host(turn.speaker);
            messages.push(ChatCompletionRequestMessage::Assistant(
                ChatCompletionRequestAssistantMessage {
                    content: Some(format!("{}: {}", host.name.to_uppercase(), turn.text).into()),
                    name: None,
                    tool_calls: None,
                    refusal: None,
                    audio: None,
                    function_call: None,
                },
            ));
        }

        let speaker = self.config.host(Speaker::for_turn(index));
        messages.push(ChatCompletionRequestMessage::User(
            ChatCompletionRequestUserMessage {
                content: format!(
                    "Write {}'s next line (line {}).",
                    speaker.name.to_uppercase(),
                    index + 1
                )
                .into(),
                name: None,
            },
        ));

        messages
    }

    async fn complete(&self, messages: Vec<ChatCompletionRequestMessage>) -> Result<String, ShowError> {
        let generator = &self.config.generator;
        let request = CreateChatCompletionRequestArgs::default()
            .model(&generator.model)
            .max_completion_tokens(generator.max_tokens)
            .temperature(generator.temperature)
            .messages(messages)
            .build()?;

        with_retries("dialogue completion", MAX_API_ATTEMPTS, || async {
            let response = self.client.chat().create(request.clone()).await?;
            Ok::<_, ShowError>(
                response
                    .choices
                    .first()
                    .and_then(|c| c.message.content.clone())
                    .unwrap_or_default(),
            )
        })
        .await
    }
}

#[async_trait]
impl DialogueGenerator for OpenAiDialogue {
    async fn generate_turn(
        &self,
        topic: &Topic,
        prior: &[DialogueTurn],
        index: usize,
    ) -> Result<String, ShowError> {
        let speaker = self.config.host(Speaker::for_turn(index));
        let messages = self.build_messages(topic, prior, index);

        for attempt in 0..MAX_EMPTY_RETRIES {
            let raw = self.complete(messages.clone()).await?;
            let line = sanitize_response(&raw, &speaker.name);

            if line.len() > 10 {
                return Ok(line);
            }

            if attempt < MAX_EMPTY_RETRIES - 1 {
                warn!(
                    "[Retry {}/{}] Empty line for {}, retrying...",
                    attempt + 1,
                    MAX_EMPTY_RETRIES,
                    speaker.name
                );
                tokio::time::sleep(Duration::from_secs(2)).await;
            }
        }

        Err(ShowError::GenerationFailed {
            index,
            reason: format!(
                "{} returned an empty line after {} attempts",
                speaker.name, MAX_EMPTY_RETRIES
            ),
        })
    }
}

/// Creates one-shot dialogue streams.
#[derive(Clone)]
pub struct DialoguePipeline {
    generator: Arc<dyn DialogueGenerator>,
}

impl DialoguePipeline {
    pub fn new(generator: Arc<dyn DialogueGenerator>) -> Self {
        Self { generator }
    }

    /// Begin a fresh `turns`-long discussion of `topic`. Turn 0 starts
    /// generating immediately.
    pub fn start(&self, topic: Arc<Topic>, turns: usize) -> DialogueStream {
        let mut stream = DialogueStream {
            generator: self.generator.clone(),
            topic,
            total: turns,
            transcript: Vec::new(),
            in_flight: None,
            finished: false,
        };
        stream.spawn_next();
        stream
    }
}

/// Ordered, finite, non-restartable turn sequence for one topic.
pub struct DialogueStream {
    generator: Arc<dyn DialogueGenerator>,
    topic: Arc<Topic>,
    total: usize,
    transcript: Vec<DialogueTurn>,
    in_flight: Option<(usize, JoinHandle<Result<String, ShowError>>)>,
    finished: bool,
}

impl DialogueStream {
    /// Next turn, `Some(Err(GenerationFailed))` once if generation broke,
    /// then `None` forever.
    pub async fn next_turn(&mut self) -> Option<Result<DialogueTurn, ShowError>> {
        if self.finished {
            return None;
        }
        let Some((index, handle)) = self.in_flight.take() else {
            self.finished = true;
            return None;
        };

        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(ShowError::GenerationFailed {
                index,
                reason: e.to_string(),
            }),
        };

        match result {
            Ok(text) => {
                let turn = DialogueTurn {
                    speaker: Speaker::for_turn(index),
                    sequence_index: index,
                    text,
                };
                self.transcript.push(turn.clone());
                self.spawn_next();
                Some(Ok(turn))
            }
            Err(e) => {
                self.finished = true;
                warn!("Dialogue stopped at turn {}: {}", index, e);
                Some(Err(match e {
                    ShowError::GenerationFailed { .. } => e,
                    other => ShowError::GenerationFailed {
                        index,
                        reason: other.to_string(),
                    },
                }))
            }
        }
    }

    /// Turns produced so far.
    pub fn transcript(&self) -> &[DialogueTurn] {
        &self.transcript
    }

    /// Whether a turn is currently being generated ahead of the caller.
    pub fn has_turn_in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    fn spawn_next(&mut self) {
        let index = self.transcript.len();
        if index >= self.total {
            return;
        }
        let generator = self.generator.clone();
        let topic = self.topic.clone();
        let prior = self.transcript.clone();

        debug!("Generating turn {} ahead", index);
        let handle =
            tokio::spawn(async move { generator.generate_turn(&topic, &prior, index).await });
        self.in_flight = Some((index, handle));
    }
}

impl Drop for DialogueStream {
    fn drop(&mut self) {
        if let Some((_, handle)) = self.in_flight.take() {
            handle.abort();
        }
    }
}

/// Sanitize a generated line by stripping reasoning tags, markdown and a
/// leading speaker label.
///
/// Removes patterns like <thinking>...</thinking>, <reflection>...</reflection>, etc.
pub fn sanitize_response(response: &str, speaker_name: &str) -> String {
    let tags_to_strip = [
        "thinking",
        "think",
        "reflection",
        "reflect",
        "internal",
        "reasoning",
        "thought",
        "scratchpad",
        "plan",
        "analysis",
    ];

    let mut result = response.to_string();

    for tag in &tags_to_strip {
        let pattern = format!(r"(?is)<{tag}[^>]*>.*?</{tag}>", tag = tag);
        if let Ok(re) = regex::Regex::new(&pattern) {
            result = re.replace_all(&result, "").to_string();
        }
    }

    if let Ok(orphan_re) = regex::Regex::new(r"</?[\w]+[^>]*>") {
        result = orphan_re.replace_all(&result, "").to_string();
    }

    result = result.replace('*', "");

    if let Ok(ws_re) = regex::Regex::new(r"\s+") {
        result = ws_re.replace_all(&result, " ").to_string();
    }

    // "MAX: ..." or "Mad Money Max: ..." at the start of the line.
    let first_name = speaker_name.split_whitespace().last().unwrap_or(speaker_name);
    let label = format!(
        r"(?i)^\s*({}|{})\s*:\s*",
        regex::escape(speaker_name),
        regex::escape(first_name)
    );
    if let Ok(label_re) = regex::Regex::new(&label) {
        result = label_re.replace(&result, "").to_string();
    }

    result.trim().trim_matches('"').trim().to_string()
}
