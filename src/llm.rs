//! Chat-style generation with tool calls.
//!
//! - **[`OpenAIChatProvider`]**: OpenAI-compatible `/chat/completions`
//!   with function calling. Requires `OPENAI_API_KEY`.
//! - **[`ExtractiveProvider`]**: offline fallback. Answers with the
//!   context sentence sharing the most words with the question and never
//!   requests tools.
//!
//! Providers make one attempt per call; the orchestrator owns retries and
//! timeouts. Failures are classified the same way as embedding providers.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use memex_core::models::{ConversationTurn, Role, ToolCall};
use memex_core::{MemexError, Result};

use crate::config::LlmConfig;
use crate::embedding::{classify_network_error, read_json_response};
use crate::tools::ToolSpec;

const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";

/// Everything the model sees for one generation step.
#[derive(Debug, Clone, Default)]
pub struct ChatRequest {
    pub system: String,
    /// Composed retrieval context, appended to the system prompt.
    pub context: String,
    /// History window, the user query, and any tool-loop turns.
    pub messages: Vec<ConversationTurn>,
    pub tools: Vec<ToolSpec>,
}

impl ChatRequest {
    /// The most recent user message.
    pub fn last_user_message(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.content.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LlmReply {
    pub content: String,
    /// Calls in the order the model requested them.
    pub tool_calls: Vec<ToolCall>,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Confidence reported for every grounded answer, for providers whose
    /// answers do not depend on retrieval scores. `None` derives it from
    /// the retrieved results.
    fn fixed_confidence(&self) -> Option<f64> {
        None
    }

    async fn complete(&self, request: &ChatRequest) -> Result<LlmReply>;
}

// ============ OpenAI ============

pub struct OpenAIChatProvider {
    model: String,
    url: String,
    api_key: String,
    temperature: f32,
    max_tokens: u32,
    client: reqwest::Client,
}

impl OpenAIChatProvider {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| MemexError::configuration("llm.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| MemexError::configuration("OPENAI_API_KEY environment variable not set"))?;
        let base = config.url.as_deref().unwrap_or(DEFAULT_OPENAI_URL);
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| MemexError::configuration(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            model,
            url: format!("{}/chat/completions", base.trim_end_matches('/')),
            api_key,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            client,
        })
    }

    fn build_request_body(&self, request: &ChatRequest) -> Value {
        let mut body = json!({
            "model": self.model,
            "messages": build_messages(request),
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
        });
        if !request.tools.is_empty() {
            let tools: Vec<Value> = request.tools.iter().map(tool_to_openai).collect();
            body["tools"] = Value::Array(tools);
        }
        body
    }
}

#[async_trait]
impl LlmProvider for OpenAIChatProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: &ChatRequest) -> Result<LlmReply> {
        let body = self.build_request_body(request);
        let response = self
            .client
            .post(&self.url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| classify_network_error("openai", e))?;

        let json = read_json_response("openai", response).await?;
        parse_chat_response(&json)
    }
}

fn build_messages(request: &ChatRequest) -> Vec<Value> {
    let system = if request.context.is_empty() {
        request.system.clone()
    } else {
        format!("{}\n\n{}", request.system, request.context)
    };

    let mut messages = vec![json!({ "role": "system", "content": system })];
    for turn in &request.messages {
        messages.push(turn_to_openai(turn));
    }
    messages
}

fn turn_to_openai(turn: &ConversationTurn) -> Value {
    match turn.role {
        Role::User => json!({ "role": "user", "content": turn.content }),
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": turn.tool_call_id,
            "content": turn.content,
        }),
        Role::Assistant if turn.tool_calls.is_empty() => {
            json!({ "role": "assistant", "content": turn.content })
        }
        Role::Assistant => {
            let calls: Vec<Value> = turn
                .tool_calls
                .iter()
                .map(|c| {
                    json!({
                        "id": c.id,
                        "type": "function",
                        "function": {
                            "name": c.tool_name,
                            "arguments": c.arguments.to_string(),
                        }
                    })
                })
                .collect();
            let content = if turn.content.is_empty() {
                Value::Null
            } else {
                Value::String(turn.content.clone())
            };
            json!({ "role": "assistant", "content": content, "tool_calls": calls })
        }
    }
}

fn tool_to_openai(tool: &ToolSpec) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": tool.name,
            "description": tool.description,
            "parameters": tool.parameters,
        }
    })
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ResponseToolCall>,
}

#[derive(Debug, Deserialize)]
struct ResponseToolCall {
    id: String,
    function: ResponseFunction,
}

#[derive(Debug, Deserialize)]
struct ResponseFunction {
    name: String,
    arguments: String,
}

/// Parse a chat completion. Arguments that are not valid JSON are kept as
/// a raw string so that schema validation reports them to the model.
fn parse_chat_response(json: &Value) -> Result<LlmReply> {
    let response: ChatResponse = serde_json::from_value(json.clone())
        .map_err(|e| MemexError::provider("openai", format!("invalid chat response: {}", e)))?;
    let message = response
        .choices
        .into_iter()
        .next()
        .map(|c| c.message)
        .ok_or_else(|| MemexError::provider("openai", "chat response has no choices"))?;

    let tool_calls = message
        .tool_calls
        .into_iter()
        .map(|tc| ToolCall {
            id: tc.id,
            tool_name: tc.function.name,
            arguments: serde_json::from_str(&tc.function.arguments)
                .unwrap_or(Value::String(tc.function.arguments)),
        })
        .collect();

    Ok(LlmReply {
        content: message.content.unwrap_or_default(),
        tool_calls,
    })
}

// ============ Extractive ============

const EXTRACTIVE_CONFIDENCE: f64 = 0.7;

pub const NO_ANSWER: &str = "I couldn't find anything relevant in your documents.";

pub struct ExtractiveProvider;

#[async_trait]
impl LlmProvider for ExtractiveProvider {
    fn name(&self) -> &str {
        "extractive"
    }

    fn fixed_confidence(&self) -> Option<f64> {
        Some(EXTRACTIVE_CONFIDENCE)
    }

    async fn complete(&self, request: &ChatRequest) -> Result<LlmReply> {
        let question = request.last_user_message().unwrap_or_default();
        let content = best_sentence(question, &request.context)
            .map(|(sentence, source)| match source {
                Some(tag) => format!("{} [{}]", sentence, tag),
                None => sentence,
            })
            .unwrap_or_else(|| NO_ANSWER.to_string());
        Ok(LlmReply {
            content,
            tool_calls: Vec::new(),
        })
    }
}

/// The context sentence with the most distinct question words, and the
/// `Source N` tag of the block it came from. Ties go to the earlier
/// sentence, which belongs to the higher-ranked source.
fn best_sentence(question: &str, context: &str) -> Option<(String, Option<String>)> {
    let wanted: HashSet<String> = words(question).collect();
    if wanted.is_empty() {
        return None;
    }

    let mut best: Option<(usize, String, Option<String>)> = None;
    let mut current_tag: Option<String> = None;

    for line in context.lines() {
        if let Some(tag) = source_tag(line) {
            current_tag = Some(tag);
            continue;
        }
        for sentence in split_sentences(line) {
            let found: HashSet<String> = words(sentence).filter(|w| wanted.contains(w)).collect();
            let score = found.len();
            if score > 0 && best.as_ref().map_or(true, |(s, _, _)| score > *s) {
                best = Some((score, sentence.to_string(), current_tag.clone()));
            }
        }
    }

    best.map(|(_, sentence, tag)| (sentence, tag))
}

/// `[Source 2: gmail msg-1]` → `Source 2`.
fn source_tag(line: &str) -> Option<String> {
    let inner = line.trim().strip_prefix('[')?.strip_suffix(']')?;
    let (label, _) = inner.split_once(':')?;
    label.starts_with("Source ").then(|| label.to_string())
}

fn split_sentences(line: &str) -> impl Iterator<Item = &str> {
    line.split_inclusive(['.', '!', '?'])
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| w.chars().count() >= 3)
        .map(str::to_lowercase)
}

/// Create the configured [`LlmProvider`].
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"extractive"` | [`ExtractiveProvider`] |
/// | `"openai"` | [`OpenAIChatProvider`] |
pub fn create_provider(config: &LlmConfig) -> Result<Arc<dyn LlmProvider>> {
    match config.provider.as_str() {
        "extractive" => Ok(Arc::new(ExtractiveProvider)),
        "openai" => Ok(Arc::new(OpenAIChatProvider::new(config)?)),
        other => Err(MemexError::configuration(format!(
            "unknown llm provider: {}",
            other
        ))),
    }
}
