//! Text generation for turns.
//!
//! [`TextGenerator`] is the narrow seam to the language model;
//! [`TurnGenerator`] builds the per-turn prompt, retries, post-processes and
//! falls back to the persona's bridge phrase when the model stays silent.

use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_openai::Client;
use async_openai::config::OpenAIConfig;
use async_openai::types::chat::{
    ChatCompletionRequestMessage, ChatCompletionRequestSystemMessage,
    ChatCompletionRequestUserMessage, CreateChatCompletionRequestArgs,
};
use async_trait::async_trait;
use regex::Regex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::LlmConfig;
use crate::error::StreamError;
use crate::participant::{Personas, Speaker};
use crate::retry::{RetryPolicy, retry_or_else};
use crate::turn::HistoryEntry;

/// History lines shown to the model.
pub const CONTEXT_LINES: usize = 12;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait TextGenerator: Send + Sync {
    /// One system + user exchange; returns the raw completion text.
    async fn complete(&self, model: &str, system: &str, user: &str) -> Result<String, StreamError>;
}

/// Chat-completions backed generator.
pub struct OpenAiTextGenerator {
    client: Client<OpenAIConfig>,
    max_tokens: Option<u32>,
}

impl OpenAiTextGenerator {
    pub fn new(config: &LlmConfig) -> Result<Self, StreamError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_s))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| StreamError::ConfigError(format!("Failed to create HTTP client: {}", e)))?;

        let openai = OpenAIConfig::new()
            .with_api_key(&config.api_key)
            .with_api_base(&config.api_base);

        Ok(Self {
            client: Client::with_config(openai).with_http_client(http_client),
            max_tokens: config.max_tokens,
        })
    }
}

#[async_trait]
impl TextGenerator for OpenAiTextGenerator {
    async fn complete(&self, model: &str, system: &str, user: &str) -> Result<String, StreamError> {
        let messages = vec![
            ChatCompletionRequestMessage::System(ChatCompletionRequestSystemMessage {
                content: system.to_string().into(),
                name: None,
            }),
            ChatCompletionRequestMessage::User(ChatCompletionRequestUserMessage {
                content: user.to_string().into(),
                name: None,
            }),
        ];

        let mut args = CreateChatCompletionRequestArgs::default();
        args.model(model).messages(messages);
        if let Some(max_tokens) = self.max_tokens {
            args.max_completion_tokens(max_tokens);
        }
        let request = args.build()?;

        let response = self.client.chat().create(request).await?;
        Ok(response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default())
    }
}

/// Everything the generator needs for one turn.
#[derive(Debug, Clone, Copy)]
pub struct TurnRequest<'a> {
    pub turn_id: u64,
    pub speaker: Speaker,
    pub topic: &'a str,
    pub summary: &'a str,
    pub history: &'a [HistoryEntry],
    pub directives: &'a [String],
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedText {
    pub text: String,
    pub latency_s: f64,
    /// The bridge phrase was substituted.
    pub fallback: bool,
}

pub struct TurnGenerator {
    llm: Arc<dyn TextGenerator>,
    personas: Personas,
    model: String,
    anchor_case: String,
    max_sentences: usize,
    policy: RetryPolicy,
}

impl TurnGenerator {
    pub fn new(
        llm: Arc<dyn TextGenerator>,
        personas: Personas,
        model: impl Into<String>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            llm,
            personas,
            model: model.into(),
            anchor_case: String::new(),
            max_sentences: 2,
            policy,
        }
    }

    pub fn with_anchor_case(mut self, anchor_case: impl Into<String>) -> Self {
        self.anchor_case = anchor_case.into();
        self
    }

    pub fn with_max_sentences(mut self, max_sentences: usize) -> Self {
        self.max_sentences = max_sentences;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Generate the spoken text for a turn. Never fails.
    pub async fn generate(&self, request: &TurnRequest<'_>) -> GeneratedText {
        let started = Instant::now();
        let persona = self.personas.get(request.speaker);
        let system = persona.render_system_prompt(request.topic);
        let user = build_prompt(request, &self.anchor_case);
        let op_name = format!("llm_{}", request.speaker);

        let (llm, model, system, user) = (&self.llm, self.model.as_str(), system.as_str(), user.as_str());
        let mut fallback = false;
        let raw = retry_or_else(
            &self.policy,
            &op_name,
            move || async move {
                let text = sanitize_response(&llm.complete(model, system, user).await?);
                if text.is_empty() {
                    return Err(StreamError::GenerationError("empty response".to_string()));
                }
                Ok(text)
            },
            |err| {
                warn!(
                    target: "prefetch",
                    turn = request.turn_id,
                    speaker = %request.speaker,
                    error = %err,
                    "text generation failed, using bridge phrase"
                );
                fallback = true;
                persona.bridge_phrase.clone()
            },
        )
        .await;

        let text = limit_sentences(&raw, self.max_sentences);
        let latency_s = started.elapsed().as_secs_f64();
        debug!(target: "prefetch", turn = request.turn_id, latency_s, chars = text.len(), "text ready");

        GeneratedText {
            text,
            latency_s,
            fallback,
        }
    }
}

/// User prompt for one turn.
pub fn build_prompt(request: &TurnRequest<'_>, anchor_case: &str) -> String {
    let mut parts = vec![format!("Discussion topic: {}", request.topic)];
    if !anchor_case.is_empty() {
        parts.push(format!("Anchor case: {}", anchor_case));
    }
    parts.push(format!("Turn number: {}", request.turn_id));
    if !request.directives.is_empty() {
        let rules: Vec<String> = request.directives.iter().map(|d| format!("- {d}")).collect();
        parts.push(format!("Extra rules for this turn:\n{}", rules.join("\n")));
    }
    let summary = if request.summary.is_empty() {
        "(empty)"
    } else {
        request.summary
    };
    parts.push(format!("Running summary (may be empty): {}", summary));
    parts.push(format!("Latest lines:\n{}", render_history(request.history, CONTEXT_LINES)));
    parts.push("Your next turn:".to_string());
    parts.join("\n\n")
}

/// Last `n` entries as `speaker: text` lines.
pub fn render_history(history: &[HistoryEntry], n: usize) -> String {
    let start = history.len().saturating_sub(n);
    let lines: Vec<String> = history[start..]
        .iter()
        .map(|h| format!("{}: {}", h.speaker, h.text))
        .collect();
    if lines.is_empty() {
        "(nothing yet)".to_string()
    } else {
        lines.join("\n")
    }
}

static SENTENCE_RE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"[^.!?…]+(?:[.!?…]+|$)").ok());

/// Keep the first `max_sentences` sentences; `0` keeps everything.
pub fn limit_sentences(text: &str, max_sentences: usize) -> String {
    let Some(re) = SENTENCE_RE.as_ref().filter(|_| max_sentences > 0) else {
        return text.trim().to_string();
    };
    let parts: Vec<&str> = re
        .find_iter(text)
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
        .collect();
    if parts.is_empty() {
        return text.trim().to_string();
    }
    parts
        .into_iter()
        .take(max_sentences)
        .collect::<Vec<_>>()
        .join(" ")
}

const HIDDEN_TAGS: [&str; 10] = [
    "thinking",
    "think",
    "reflection",
    "reasoning",
    "thought",
    "scratchpad",
    "plan",
    "analysis",
    "internal",
    "deliberation",
];

static HIDDEN_BLOCK_RES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    HIDDEN_TAGS
        .iter()
        .filter_map(|tag| Regex::new(&format!(r"(?is)<{tag}[^>]*>.*?</{tag}>")).ok())
        .collect()
});

static STRAY_TAG_RE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"</?[\w]+[^>]*>").ok());
static WHITESPACE_RE: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"\s+").ok());

/// Strip reasoning blocks, stray tags, markdown emphasis and extra whitespace.
pub fn sanitize_response(response: &str) -> String {
    let mut result = response.to_string();

    for re in HIDDEN_BLOCK_RES.iter() {
        result = re.replace_all(&result, "").into_owned();
    }
    if let Some(re) = STRAY_TAG_RE.as_ref() {
        result = re.replace_all(&result, "").into_owned();
    }
    result = result.replace('*', "");
    if let Some(re) = WHITESPACE_RE.as_ref() {
        result = re.replace_all(&result, " ").into_owned();
    }

    result.trim().to_string()
}
