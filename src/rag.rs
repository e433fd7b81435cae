//! Retrieval-augmented answering with a bounded tool loop.
//!
//! A query moves through these stages:
//!
//! ```text
//! INTENT → RETRIEVE → COMPOSE → GENERATE ─┬─→ RESPOND
//!                                 ▲       │ tool calls
//!                                 └─ TOOL_LOOP ──→ PENDING_CONFIRMATION
//! ```
//!
//! - **Intent**: keyword heuristics decide whether the query asks for an
//!   action. Informational queries are only offered read-only tools.
//! - **Retrieve / Compose**: semantic search, then a context of tagged
//!   blocks (`[Source N: <source> <document_id>]`) within
//!   `max_context_length` characters. Lowest-scoring chunks are dropped
//!   first; a lone oversized chunk is truncated.
//! - **Generate / Tool loop**: requested calls are validated and handled in
//!   order. Read-only tools run immediately with retries. A mutating tool
//!   suspends the loop and hands a [`LoopState`] back to the caller, who
//!   resumes it with a [`Confirmation`]. At most `max_tool_iterations`
//!   rounds are run.
//!
//! Failures end in [`QueryOutcome::Failed`] with a message naming how far
//! the query got, e.g. `retrieved 4 sources, generation failed: ...`.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use memex_core::models::{
    ConversationTurn, SearchResult, SourceKind, ToolCall, ToolError, ToolErrorKind, ToolResult,
};
use memex_core::search::SearchOptions;
use memex_core::MemexError;

use crate::config::{Config, LlmConfig, RagConfig, RetrievalConfig, RetryConfig};
use crate::llm::{ChatRequest, LlmProvider, LlmReply};
use crate::retry::{with_timeout, RetryPolicy};
use crate::search::SemanticSearchEngine;
use crate::tools::{Tool, ToolContext, ToolRegistry, ToolSpec};

const SYSTEM_PROMPT: &str = "You are a personal assistant with access to the user's files, \
email, calendar, and documents. Answer using the provided sources and cite them as \
[Source N]. If the sources do not contain the answer, say so. Use tools only when needed.";

const NO_CONTEXT: &str = "No supporting context was found in the user's documents.";

const EXCERPT_CHARS: usize = 200;

const ACTION_KEYWORDS: &[&str] = &[
    "add", "create", "schedule", "send", "delete", "update", "remind", "book", "invite", "cancel",
];

const TIME_KEYWORDS: &[&str] = &[
    "today", "tomorrow", "yesterday", "tonight", "now", "soon", "upcoming", "recent", "recently",
    "week", "month", "next", "last", "monday", "tuesday", "wednesday", "thursday", "friday",
    "saturday", "sunday",
];

const ENTITY_HINTS: &[(&str, &[&str])] = &[
    ("email", &["email", "emails", "mail", "inbox", "message", "messages"]),
    ("calendar", &["calendar", "meeting", "meetings", "event", "events", "appointment", "schedule"]),
    ("document", &["document", "documents", "doc", "docs", "file", "files", "note", "notes", "drive"]),
];

// ============ Intent ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    Informational,
    Action,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryIntent {
    pub kind: IntentKind,
    pub time_sensitive: bool,
    /// Subset of `email`, `calendar`, `document`.
    pub entities: Vec<String>,
}

impl QueryIntent {
    pub fn is_action(&self) -> bool {
        self.kind == IntentKind::Action
    }
}

pub fn analyze_intent(query: &str) -> QueryIntent {
    let words: Vec<String> = query
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .collect();
    let has_any = |set: &[&str]| words.iter().any(|w| set.contains(&w.as_str()));

    let kind = if has_any(ACTION_KEYWORDS) {
        IntentKind::Action
    } else {
        IntentKind::Informational
    };
    let entities = ENTITY_HINTS
        .iter()
        .filter(|(_, hints)| has_any(hints))
        .map(|(name, _)| name.to_string())
        .collect();

    QueryIntent {
        kind,
        time_sensitive: has_any(TIME_KEYWORDS),
        entities,
    }
}

// ============ Loop state ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Intent,
    Retrieve,
    Compose,
    Generate,
    ToolLoop,
    Respond,
}

impl Stage {
    fn failure_label(self) -> &'static str {
        match self {
            Stage::Intent => "intent analysis",
            Stage::Retrieve => "retrieval",
            Stage::Compose => "context composition",
            Stage::Generate => "generation",
            Stage::ToolLoop => "tool loop",
            Stage::Respond => "response",
        }
    }
}

/// Source attribution for one chunk of the composed context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Attribution {
    pub chunk_id: String,
    pub document_id: String,
    pub source: Option<SourceKind>,
    pub url: Option<String>,
    /// First characters of the chunk text.
    pub excerpt: String,
    pub score: f64,
}

/// A mutating call awaiting the user's decision.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PendingConfirmation {
    pub call_id: String,
    pub tool_name: String,
    /// Arguments after schema validation.
    pub arguments: Value,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub call_id: String,
    pub approved: bool,
}

/// Everything needed to continue a query, passed into and out of each step.
///
/// Not `Clone`: a suspended query is resumed at most once, so a confirmed
/// call cannot be replayed from a copy.
#[derive(Debug)]
pub struct LoopState {
    query: String,
    intent: QueryIntent,
    context: String,
    source_count: usize,
    turns: Vec<ConversationTurn>,
    queue: VecDeque<ToolCall>,
    pending: Option<PendingConfirmation>,
    iterations: usize,
    attributions: Vec<Attribution>,
    tool_results: Vec<ToolResult>,
    /// Call ids that already have a result.
    resolved: HashSet<String>,
    confidence: f64,
    stage: Stage,
}

impl LoopState {
    pub fn query(&self) -> &str {
        &self.query
    }

    pub fn intent(&self) -> &QueryIntent {
        &self.intent
    }

    pub fn pending(&self) -> Option<&PendingConfirmation> {
        self.pending.as_ref()
    }

    /// Tool rounds run so far.
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    /// Last stage that completed.
    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn tool_results(&self) -> &[ToolResult] {
        &self.tool_results
    }

    fn progress(&self) -> String {
        match self.stage {
            Stage::Intent => "analyzed the query".to_string(),
            _ if self.tool_results.is_empty() => {
                format!("retrieved {}", plural(self.source_count, "source"))
            }
            _ => format!(
                "retrieved {} and ran {}",
                plural(self.source_count, "source"),
                plural(self.tool_results.len(), "tool call")
            ),
        }
    }

    fn failure(&self, failed: Stage, reason: impl std::fmt::Display) -> String {
        format!("{}, {} failed: {}", self.progress(), failed.failure_label(), reason)
    }

    fn record(&mut self, result: ToolResult) {
        self.resolved.insert(result.call_id.clone());
        self.turns.push(ConversationTurn::tool(&result));
        self.tool_results.push(result);
    }

    /// Partial response listing the tool calls that ran, if any did.
    fn partial(&self) -> Option<RagResponse> {
        (!self.tool_results.is_empty())
            .then(|| self.response(summarize_tool_calls(&self.tool_results), false))
    }

    fn response(&self, answer: String, complete: bool) -> RagResponse {
        RagResponse {
            answer,
            attributions: self.attributions.clone(),
            tool_calls: self.tool_results.clone(),
            intent: self.intent.clone(),
            confidence: self.confidence,
            complete,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RagResponse {
    pub answer: String,
    pub attributions: Vec<Attribution>,
    pub tool_calls: Vec<ToolResult>,
    pub intent: QueryIntent,
    /// In [0, 1]; see [`answer_confidence`].
    pub confidence: f64,
    /// `false` for a partial response after a failure.
    pub complete: bool,
}

#[derive(Debug)]
pub enum QueryOutcome {
    Answered(RagResponse),
    /// A mutating tool call needs confirmation; see [`LoopState::pending`].
    PendingConfirmation(LoopState),
    Failed {
        message: String,
        stage: Stage,
        partial: Option<RagResponse>,
    },
}

// ============ Orchestrator ============

#[derive(Debug, Clone)]
pub struct RagSettings {
    pub max_results: usize,
    pub similarity_threshold: f64,
    pub max_context_length: usize,
    pub history_window: usize,
    pub max_tool_iterations: usize,
    pub llm_timeout: Duration,
    pub tool_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for RagSettings {
    fn default() -> Self {
        Self::from_sections(
            &RagConfig::default(),
            &RetrievalConfig::default(),
            &LlmConfig::default(),
            &RetryConfig::default(),
        )
    }
}

impl RagSettings {
    pub fn from_config(config: &Config) -> Self {
        Self::from_sections(&config.rag, &config.retrieval, &config.llm, &config.retry)
    }

    fn from_sections(
        rag: &RagConfig,
        retrieval: &RetrievalConfig,
        llm: &LlmConfig,
        retry: &RetryConfig,
    ) -> Self {
        Self {
            max_results: rag.max_results,
            similarity_threshold: retrieval.similarity_threshold,
            max_context_length: rag.max_context_length,
            history_window: rag.history_window,
            max_tool_iterations: rag.max_tool_iterations,
            llm_timeout: llm.timeout(),
            tool_timeout: Duration::from_secs(rag.tool_timeout_secs),
            retry: RetryPolicy::from_config(retry),
        }
    }
}

pub struct RagOrchestrator {
    search: Arc<SemanticSearchEngine>,
    llm: Arc<dyn LlmProvider>,
    tools: Arc<ToolRegistry>,
    ctx: ToolContext,
    settings: RagSettings,
}

impl RagOrchestrator {
    pub fn new(
        search: Arc<SemanticSearchEngine>,
        llm: Arc<dyn LlmProvider>,
        tools: Arc<ToolRegistry>,
        settings: RagSettings,
    ) -> Self {
        let ctx = ToolContext::new(search.clone());
        Self {
            search,
            llm,
            tools,
            ctx,
            settings,
        }
    }

    /// Answer `query` given the caller's conversation `history`.
    pub async fn answer(&self, query: &str, history: &[ConversationTurn]) -> QueryOutcome {
        let intent = analyze_intent(query);
        debug!(?intent, "analyzed query");

        let window_start = history.len().saturating_sub(self.settings.history_window);
        let mut turns: Vec<ConversationTurn> = history[window_start..].to_vec();
        turns.push(ConversationTurn::user(query));

        let mut state = LoopState {
            query: query.to_string(),
            intent,
            context: String::new(),
            source_count: 0,
            turns,
            queue: VecDeque::new(),
            pending: None,
            iterations: 0,
            attributions: Vec::new(),
            tool_results: Vec::new(),
            resolved: HashSet::new(),
            confidence: 0.0,
            stage: Stage::Intent,
        };

        let opts = SearchOptions {
            max_results: self.settings.max_results,
            similarity_threshold: self.settings.similarity_threshold,
            ..self.search.default_options()
        };
        let results = match self.search.search(query, &opts).await {
            Ok(results) => results,
            Err(e) => return fail(&state, Stage::Retrieve, e),
        };
        state.source_count = results.len();
        state.confidence = match self.llm.fixed_confidence() {
            Some(fixed) if !results.is_empty() => fixed,
            _ => answer_confidence(&results),
        };
        state.stage = Stage::Retrieve;

        let (context, used) = compose_context(&results, self.settings.max_context_length);
        state.context = if used.is_empty() {
            NO_CONTEXT.to_string()
        } else {
            context
        };
        state.attributions = used.iter().map(|r| attribution(r)).collect();
        state.stage = Stage::Compose;
        debug!(
            sources = state.source_count,
            used = used.len(),
            chars = state.context.chars().count(),
            "composed context"
        );

        self.run_loop(state).await
    }

    /// Continue a suspended query with the user's decision on the pending
    /// call. A confirmation for any other call id leaves the state pending.
    pub async fn resume(&self, mut state: LoopState, confirmation: Confirmation) -> QueryOutcome {
        let Some(pending) = state.pending.take() else {
            let message = state.failure(Stage::ToolLoop, "no tool call is awaiting confirmation");
            return QueryOutcome::Failed {
                message,
                stage: state.stage,
                partial: state.partial(),
            };
        };

        if pending.call_id != confirmation.call_id {
            warn!(
                expected = %pending.call_id,
                got = %confirmation.call_id,
                "confirmation does not match the pending call"
            );
            state.pending = Some(pending);
            return QueryOutcome::PendingConfirmation(state);
        }

        let outcome = if confirmation.approved {
            info!(tool = %pending.tool_name, call_id = %pending.call_id, "executing confirmed tool call");
            self.run_mutating(&pending.tool_name, pending.arguments.clone()).await
        } else {
            info!(tool = %pending.tool_name, call_id = %pending.call_id, "tool call declined");
            Err(ToolError::new(ToolErrorKind::Declined, "declined by user"))
        };
        state.record(ToolResult {
            call_id: pending.call_id,
            tool_name: pending.tool_name,
            outcome,
        });

        self.run_loop(state).await
    }

    async fn run_loop(&self, mut state: LoopState) -> QueryOutcome {
        loop {
            while let Some(call) = state.queue.pop_front() {
                if state.resolved.contains(&call.id) {
                    warn!(call_id = %call.id, tool = %call.tool_name, "call id already resolved");
                    let err = ToolError::new(
                        ToolErrorKind::Validation,
                        format!("call '{}' already has a result and is not run again", call.id),
                    );
                    state.turns.push(ConversationTurn::tool(&ToolResult {
                        call_id: call.id,
                        tool_name: call.tool_name,
                        outcome: Err(err),
                    }));
                    continue;
                }
                match self.tools.prepare(&call.tool_name, &call.arguments) {
                    Err(err) => {
                        debug!(tool = %call.tool_name, error = %err, "rejected tool call");
                        state.record(ToolResult {
                            call_id: call.id,
                            tool_name: call.tool_name,
                            outcome: Err(err),
                        });
                    }
                    Ok((tool, _)) if tool.is_mutating() && !state.intent.is_action() => {
                        let err = ToolError::new(
                            ToolErrorKind::UnknownTool,
                            format!("tool '{}' is not available for this query", call.tool_name),
                        );
                        state.record(ToolResult {
                            call_id: call.id,
                            tool_name: call.tool_name,
                            outcome: Err(err),
                        });
                    }
                    Ok((tool, args)) if tool.is_mutating() => {
                        state.pending = Some(PendingConfirmation {
                            call_id: call.id,
                            tool_name: call.tool_name,
                            arguments: args,
                        });
                        return QueryOutcome::PendingConfirmation(state);
                    }
                    Ok((tool, args)) => {
                        let outcome = self.run_read_only(tool, args).await;
                        state.record(ToolResult {
                            call_id: call.id,
                            tool_name: call.tool_name,
                            outcome,
                        });
                    }
                }
            }
            if state.iterations > 0 {
                state.stage = Stage::ToolLoop;
            }

            let reply = match self.generate(&state).await {
                Ok(reply) => reply,
                Err(e) => return fail(&state, Stage::Generate, e),
            };
            if state.iterations == 0 {
                state.stage = Stage::Generate;
            }

            if reply.tool_calls.is_empty() {
                state.turns.push(ConversationTurn::assistant(reply.content.clone(), Vec::new()));
                state.stage = Stage::Respond;
                info!(
                    sources = state.attributions.len(),
                    tool_calls = state.tool_results.len(),
                    "answered query"
                );
                return QueryOutcome::Answered(state.response(reply.content, true));
            }

            state.iterations += 1;
            if state.iterations > self.settings.max_tool_iterations {
                let reason = format!(
                    "exceeded {} tool iterations",
                    self.settings.max_tool_iterations
                );
                warn!(query = %state.query, "{}", reason);
                let message = state.failure(Stage::ToolLoop, &reason);
                let partial = state.response(summarize_tool_calls(&state.tool_results), false);
                return QueryOutcome::Failed {
                    message,
                    stage: state.stage,
                    partial: Some(partial),
                };
            }

            debug!(
                iteration = state.iterations,
                calls = reply.tool_calls.len(),
                "model requested tools"
            );
            state
                .turns
                .push(ConversationTurn::assistant(reply.content, reply.tool_calls.clone()));
            state.queue = reply.tool_calls.into();
        }
    }

    async fn generate(&self, state: &LoopState) -> Result<LlmReply, MemexError> {
        let request = ChatRequest {
            system: SYSTEM_PROMPT.to_string(),
            context: state.context.clone(),
            messages: state.turns.clone(),
            tools: self.offered_tools(&state.intent),
        };
        let llm = &self.llm;
        let request = &request;
        self.settings
            .retry
            .run("generation", self.settings.llm_timeout, move || llm.complete(request))
            .await
    }

    fn offered_tools(&self, intent: &QueryIntent) -> Vec<ToolSpec> {
        self.tools
            .list_tools()
            .into_iter()
            .filter(|t| intent.is_action() || !t.mutating)
            .collect()
    }

    async fn run_read_only(&self, tool: &dyn Tool, args: Value) -> Result<Value, ToolError> {
        let operation = format!("tool {}", tool.name());
        let ctx = &self.ctx;
        let args = &args;
        self.settings
            .retry
            .run(&operation, self.settings.tool_timeout, move || {
                tool.execute(args.clone(), ctx)
            })
            .await
            .map_err(|e| ToolError::new(ToolErrorKind::Execution, e.to_string()))
    }

    /// Single attempt, no retry.
    async fn run_mutating(&self, name: &str, args: Value) -> Result<Value, ToolError> {
        let tool = self.tools.find(name).ok_or_else(|| {
            ToolError::new(ToolErrorKind::UnknownTool, format!("unknown tool: {}", name))
        })?;
        let operation = format!("tool {}", name);
        with_timeout(&operation, self.settings.tool_timeout, tool.execute(args, &self.ctx))
            .await
            .map_err(|e| ToolError::new(ToolErrorKind::Execution, e.to_string()))
    }
}

/// A failure outcome. Tool calls that already ran are reported in the
/// partial response.
fn fail(state: &LoopState, failed: Stage, err: MemexError) -> QueryOutcome {
    let message = state.failure(failed, &err);
    warn!(query = %state.query, error = %err, "query failed");
    QueryOutcome::Failed {
        message,
        stage: state.stage,
        partial: state.partial(),
    }
}

/// Confidence of an answer grounded on `results`: the mean score, raised by
/// 0.1 (capped at 1) when at least three results average above 0.7.
pub fn answer_confidence(results: &[SearchResult]) -> f64 {
    if results.is_empty() {
        return 0.0;
    }
    let mean = results.iter().map(|r| r.score).sum::<f64>() / results.len() as f64;
    if results.len() >= 3 && mean > 0.7 {
        (mean + 0.1).min(1.0)
    } else {
        mean
    }
}

/// Build the tagged context from ranked results within `budget` chars.
///
/// Blocks are separated by a blank line and chunk text is copied
/// unchanged. Returns the context and the results it includes; if not even
/// the first header fits, both are empty.
pub fn compose_context(results: &[SearchResult], budget: usize) -> (String, Vec<&SearchResult>) {
    const SEPARATOR: &str = "\n\n";

    let mut context = String::new();
    let mut used_chars = 0;
    let mut used = Vec::new();

    for (i, result) in results.iter().enumerate() {
        let header = format!(
            "[Source {}: {} {}]\n",
            i + 1,
            result.source.map(|s| s.as_str()).unwrap_or("unknown"),
            result.document_id
        );
        let header_chars = header.chars().count();
        let separator_chars = if used.is_empty() { 0 } else { SEPARATOR.len() };
        let block_chars = separator_chars + header_chars + result.text.chars().count();

        if used_chars + block_chars <= budget {
            if !used.is_empty() {
                context.push_str(SEPARATOR);
            }
            context.push_str(&header);
            context.push_str(&result.text);
            used_chars += block_chars;
            used.push(result);
            continue;
        }

        if used.is_empty() && header_chars < budget {
            let truncated: String = result.text.chars().take(budget - header_chars).collect();
            context.push_str(&header);
            context.push_str(&truncated);
            used.push(result);
        }
        break;
    }

    (context, used)
}

fn attribution(result: &SearchResult) -> Attribution {
    Attribution {
        chunk_id: result.chunk_id.clone(),
        document_id: result.document_id.clone(),
        source: result.source,
        url: result
            .metadata
            .get("url")
            .and_then(|v| v.as_str())
            .map(str::to_string),
        excerpt: result.text.chars().take(EXCERPT_CHARS).collect(),
        score: result.score,
    }
}

fn summarize_tool_calls(results: &[ToolResult]) -> String {
    if results.is_empty() {
        return "No tool calls completed.".to_string();
    }
    let lines: Vec<String> = results
        .iter()
        .map(|r| match &r.outcome {
            Ok(_) => format!("- {} ({}): ok", r.tool_name, r.call_id),
            Err(e) => format!("- {} ({}): {}", r.tool_name, r.call_id, e),
        })
        .collect();
    format!("Completed tool calls:\n{}", lines.join("\n"))
}

fn plural(n: usize, noun: &str) -> String {
    if n == 1 {
        format!("1 {}", noun)
    } else {
        format!("{} {}s", n, noun)
    }
}
