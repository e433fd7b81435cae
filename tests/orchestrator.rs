//! Query orchestration with a scripted model.
//!
//! The model's replies are queued up front so each test can drive the tool
//! loop deterministically: confirmation gating, declines, argument
//! validation, the iteration bound, and failure reporting.

use async_trait::async_trait;
use memex::embedding::HashService;
use memex::index::{IndexManager, SyncOptions};
use memex::llm::{ChatRequest, LlmProvider, LlmReply};
use memex::rag::{Confirmation, QueryOutcome, RagOrchestrator, RagSettings, Stage};
use memex::retry::RetryPolicy;
use memex::search::SemanticSearchEngine;
use memex::tools::{Tool, ToolContext, ToolRegistry};
use memex_core::chunk::Chunker;
use memex_core::models::{Document, Role, SourceKind, ToolCall, ToolErrorKind};
use memex_core::store::memory::InMemoryStore;
use memex_core::{MemexError, Result};
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ─── Mocks ──────────────────────────────────────────────────────────

/// Replays queued replies and records every request it receives.
#[derive(Default)]
struct ScriptedLlm {
    replies: Mutex<VecDeque<Result<LlmReply>>>,
    requests: Mutex<Vec<ChatRequest>>,
}

impl ScriptedLlm {
    fn new(replies: Vec<Result<LlmReply>>) -> Arc<Self> {
        Arc::new(Self {
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn requests(&self) -> Vec<ChatRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmProvider for ScriptedLlm {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &ChatRequest) -> Result<LlmReply> {
        self.requests.lock().unwrap().push(request.clone());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(text("Done.")))
    }
}

/// A side-effecting tool that counts how often it actually ran.
#[derive(Default)]
struct CreateEventTool {
    executions: Arc<AtomicUsize>,
    /// Fail every execution with a retryable error.
    flaky: bool,
}

#[async_trait]
impl Tool for CreateEventTool {
    fn name(&self) -> &str {
        "create_event"
    }

    fn description(&self) -> &str {
        "Create a calendar event"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": { "type": "string" },
                "day": { "type": "string", "default": "today" }
            },
            "required": ["title"]
        })
    }

    fn is_mutating(&self) -> bool {
        true
    }

    async fn execute(&self, args: Value, _ctx: &ToolContext) -> Result<Value> {
        self.executions.fetch_add(1, Ordering::SeqCst);
        if self.flaky {
            return Err(MemexError::transient("calendar", "service unavailable"));
        }
        Ok(json!({ "created": args["title"], "day": args["day"] }))
    }
}

// ─── Helpers ────────────────────────────────────────────────────────

fn text(content: &str) -> LlmReply {
    LlmReply {
        content: content.to_string(),
        tool_calls: Vec::new(),
    }
}

fn call(id: &str, tool: &str, arguments: Value) -> LlmReply {
    LlmReply {
        content: String::new(),
        tool_calls: vec![ToolCall {
            id: id.to_string(),
            tool_name: tool.to_string(),
            arguments,
        }],
    }
}

struct Harness {
    orchestrator: RagOrchestrator,
    llm: Arc<ScriptedLlm>,
    executions: Arc<AtomicUsize>,
}

async fn harness(replies: Vec<Result<LlmReply>>) -> Harness {
    harness_with(replies, |_| {}).await
}

async fn harness_with(
    replies: Vec<Result<LlmReply>>,
    tweak: impl FnOnce(&mut RagSettings),
) -> Harness {
    build_harness(replies, tweak, false).await
}

async fn build_harness(
    replies: Vec<Result<LlmReply>>,
    tweak: impl FnOnce(&mut RagSettings),
    flaky: bool,
) -> Harness {
    let store = Arc::new(InMemoryStore::new());
    let embedder = Arc::new(HashService::new("hash-v1", 64).unwrap());
    IndexManager::new(
        Chunker::new(500, 50, 8000).unwrap(),
        embedder.clone(),
        store.clone(),
        store.clone(),
    )
    .sync(
        vec![
            Document::new("calendar:1", SourceKind::Calendar, "1", "Dentist appointment on Friday at noon."),
            Document::new("gmail:7", SourceKind::Gmail, "7", "The quarterly budget review moved to Monday."),
            Document::new("local_file:todo.md", SourceKind::LocalFile, "todo.md", "Renew passport before June."),
        ],
        &SyncOptions::default(),
    )
    .await
    .unwrap();

    let search = Arc::new(SemanticSearchEngine::new(embedder, store));

    let executions = Arc::new(AtomicUsize::new(0));
    let mut tools = ToolRegistry::with_builtins();
    tools
        .register(Box::new(CreateEventTool {
            executions: executions.clone(),
            flaky,
        }))
        .unwrap();

    let mut settings = RagSettings {
        max_results: 5,
        similarity_threshold: 0.0,
        max_tool_iterations: 2,
        retry: RetryPolicy::no_retry(),
        ..RagSettings::default()
    };
    tweak(&mut settings);

    let llm = ScriptedLlm::new(replies);
    let orchestrator = RagOrchestrator::new(search, llm.clone(), Arc::new(tools), settings);
    Harness {
        orchestrator,
        llm,
        executions,
    }
}

fn tool_names(request: &ChatRequest) -> Vec<String> {
    request.tools.iter().map(|t| t.name.clone()).collect()
}

fn approve(call_id: &str) -> Confirmation {
    Confirmation {
        call_id: call_id.into(),
        approved: true,
    }
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    }
}

// ─── Tests ──────────────────────────────────────────────────────────

#[tokio::test]
async fn test_answer_includes_context_and_attributions() {
    let h = harness(vec![Ok(text("Friday at noon [Source 1]."))]).await;

    let outcome = h.orchestrator.answer("when is my dentist appointment?", &[]).await;
    let QueryOutcome::Answered(response) = outcome else {
        panic!("expected an answer");
    };
    assert!(response.complete);
    assert_eq!(response.answer, "Friday at noon [Source 1].");
    assert_eq!(response.attributions.len(), 3);
    assert!(response.tool_calls.is_empty());

    let requests = h.llm.requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].context.starts_with("[Source 1: "));
    assert_eq!(
        requests[0].last_user_message(),
        Some("when is my dentist appointment?")
    );
}

#[tokio::test]
async fn test_informational_query_is_not_offered_mutating_tools() {
    let h = harness(vec![Ok(text("Friday."))]).await;
    h.orchestrator.answer("when is my dentist appointment?", &[]).await;
    let offered = tool_names(&h.llm.requests()[0]);
    assert!(offered.contains(&"search_documents".to_string()));
    assert!(!offered.contains(&"create_event".to_string()));

    let h = harness(vec![Ok(text("Sure."))]).await;
    h.orchestrator.answer("schedule a dentist appointment", &[]).await;
    assert!(tool_names(&h.llm.requests()[0]).contains(&"create_event".to_string()));
}

#[tokio::test]
async fn test_mutating_call_from_informational_query_is_refused() {
    let h = harness(vec![
        Ok(call("c1", "create_event", json!({ "title": "Dentist" }))),
        Ok(text("I can't do that here.")),
    ])
    .await;

    let outcome = h.orchestrator.answer("when is my dentist appointment?", &[]).await;
    let QueryOutcome::Answered(response) = outcome else {
        panic!("expected an answer");
    };
    assert_eq!(h.executions.load(Ordering::SeqCst), 0);
    let err = response.tool_calls[0].outcome.as_ref().unwrap_err();
    assert_eq!(err.kind, ToolErrorKind::UnknownTool);
}

#[tokio::test]
async fn test_mutating_call_waits_for_confirmation() {
    let h = harness(vec![
        Ok(call("c1", "create_event", json!({ "title": "Dentist" }))),
        Ok(text("Created the event.")),
    ])
    .await;

    let outcome = h.orchestrator.answer("schedule a dentist appointment", &[]).await;
    let QueryOutcome::PendingConfirmation(state) = outcome else {
        panic!("expected a pending confirmation");
    };
    assert_eq!(h.executions.load(Ordering::SeqCst), 0);
    let pending = state.pending().unwrap().clone();
    assert_eq!(pending.call_id, "c1");
    assert_eq!(pending.tool_name, "create_event");
    assert_eq!(pending.arguments["day"], "today", "defaults are applied");

    // A confirmation for another call changes nothing.
    let outcome = h
        .orchestrator
        .resume(
            state,
            Confirmation {
                call_id: "other".into(),
                approved: true,
            },
        )
        .await;
    let QueryOutcome::PendingConfirmation(state) = outcome else {
        panic!("expected the call to stay pending");
    };
    assert_eq!(h.executions.load(Ordering::SeqCst), 0);

    let outcome = h
        .orchestrator
        .resume(
            state,
            Confirmation {
                call_id: "c1".into(),
                approved: true,
            },
        )
        .await;
    let QueryOutcome::Answered(response) = outcome else {
        panic!("expected an answer");
    };
    assert_eq!(h.executions.load(Ordering::SeqCst), 1);
    assert_eq!(response.answer, "Created the event.");
    assert_eq!(response.tool_calls.len(), 1);
    assert_eq!(
        response.tool_calls[0].outcome.as_ref().unwrap()["created"],
        "Dentist"
    );
}

#[tokio::test]
async fn test_declined_call_is_reported_to_the_model() {
    let h = harness(vec![
        Ok(call("c1", "create_event", json!({ "title": "Dentist" }))),
        Ok(text("Okay, I won't create it.")),
    ])
    .await;

    let QueryOutcome::PendingConfirmation(state) =
        h.orchestrator.answer("schedule a dentist appointment", &[]).await
    else {
        panic!("expected a pending confirmation");
    };
    let outcome = h
        .orchestrator
        .resume(
            state,
            Confirmation {
                call_id: "c1".into(),
                approved: false,
            },
        )
        .await;
    let QueryOutcome::Answered(response) = outcome else {
        panic!("expected an answer");
    };
    assert_eq!(h.executions.load(Ordering::SeqCst), 0);
    let err = response.tool_calls[0].outcome.as_ref().unwrap_err();
    assert_eq!(err.kind, ToolErrorKind::Declined);

    let requests = h.llm.requests();
    let last = requests[1].messages.last().unwrap();
    assert_eq!(last.role, Role::Tool);
    assert!(last.content.contains("declined by user"));
}

#[tokio::test]
async fn test_invalid_arguments_are_fed_back_as_tool_errors() {
    let h = harness(vec![
        Ok(call("c1", "create_event", json!({ "day": "friday" }))),
        Ok(text("What should the event be called?")),
    ])
    .await;

    let outcome = h.orchestrator.answer("schedule a dentist appointment", &[]).await;
    let QueryOutcome::Answered(response) = outcome else {
        panic!("expected an answer");
    };
    assert_eq!(h.executions.load(Ordering::SeqCst), 0);
    let err = response.tool_calls[0].outcome.as_ref().unwrap_err();
    assert_eq!(err.kind, ToolErrorKind::Validation);
    assert!(err.message.contains("title"));

    let requests = h.llm.requests();
    let last = requests[1].messages.last().unwrap();
    assert_eq!(last.role, Role::Tool);
    assert_eq!(last.tool_call_id.as_deref(), Some("c1"));
}

#[tokio::test]
async fn test_read_only_tool_runs_without_confirmation() {
    let h = harness(vec![
        Ok(call("s1", "search_documents", json!({ "query": "budget review" }))),
        Ok(text("It moved to Monday.")),
    ])
    .await;

    let outcome = h.orchestrator.answer("when is the budget review?", &[]).await;
    let QueryOutcome::Answered(response) = outcome else {
        panic!("expected an answer");
    };
    assert_eq!(response.tool_calls.len(), 1);
    assert!(response.tool_calls[0].is_ok());

    let requests = h.llm.requests();
    assert_eq!(requests.len(), 2);
    let assistant = &requests[1].messages[requests[1].messages.len() - 2];
    assert_eq!(assistant.role, Role::Assistant);
    assert_eq!(assistant.tool_calls[0].id, "s1");
}

#[tokio::test]
async fn test_tool_loop_is_bounded() {
    let search = |id: &str| Ok(call(id, "search_documents", json!({ "query": "passport" })));
    let h = harness(vec![search("s1"), search("s2"), search("s3")]).await;

    let outcome = h.orchestrator.answer("when does my passport expire?", &[]).await;
    let QueryOutcome::Failed {
        message, partial, ..
    } = outcome
    else {
        panic!("expected a failure");
    };
    assert_eq!(
        message,
        "retrieved 3 sources and ran 2 tool calls, tool loop failed: exceeded 2 tool iterations"
    );
    let partial = partial.unwrap();
    assert!(!partial.complete);
    assert_eq!(partial.tool_calls.len(), 2);
    assert!(partial.answer.starts_with("Completed tool calls:"));
    assert_eq!(h.llm.requests().len(), 3);
}

#[tokio::test]
async fn test_generation_failure_names_progress() {
    let h = harness(vec![Err(MemexError::provider("scripted", "model overloaded"))]).await;

    let outcome = h.orchestrator.answer("when is my dentist appointment?", &[]).await;
    let QueryOutcome::Failed {
        message,
        stage,
        partial,
    } = outcome
    else {
        panic!("expected a failure");
    };
    assert!(
        message.starts_with("retrieved 3 sources, generation failed:"),
        "{}",
        message
    );
    assert!(message.contains("model overloaded"));
    assert_eq!(stage, Stage::Compose);
    assert!(partial.is_none());
}

#[tokio::test]
async fn test_history_is_windowed() {
    use memex_core::models::ConversationTurn;

    let h = harness_with(vec![Ok(text("Noon."))], |s| s.history_window = 2).await;
    let history = vec![
        ConversationTurn::user("first"),
        ConversationTurn::assistant("one", Vec::new()),
        ConversationTurn::user("second"),
        ConversationTurn::assistant("two", Vec::new()),
    ];
    h.orchestrator.answer("what time?", &history).await;

    let messages = &h.llm.requests()[0].messages;
    let contents: Vec<&str> = messages.iter().map(|t| t.content.as_str()).collect();
    assert_eq!(contents, vec!["second", "two", "what time?"]);
}

#[tokio::test]
async fn test_empty_retrieval_sends_no_context_marker() {
    let h = harness_with(vec![Ok(text("I couldn't find that."))], |s| {
        s.similarity_threshold = 1.0
    })
    .await;

    let outcome = h.orchestrator.answer("what is my frequent flyer number?", &[]).await;
    let QueryOutcome::Answered(response) = outcome else {
        panic!("expected an answer");
    };
    assert!(response.attributions.is_empty());
    assert_eq!(response.confidence, 0.0);

    let requests = h.llm.requests();
    assert!(requests[0].context.contains("No supporting context"), "{}", requests[0].context);
}

#[tokio::test]
async fn test_transient_generation_error_is_retried() {
    let h = harness_with(
        vec![
            Err(MemexError::transient("scripted", "rate limited")),
            Ok(text("Friday at noon.")),
        ],
        |s| s.retry = fast_retry(3),
    )
    .await;

    let outcome = h.orchestrator.answer("when is my dentist appointment?", &[]).await;
    let QueryOutcome::Answered(response) = outcome else {
        panic!("expected an answer");
    };
    assert_eq!(response.answer, "Friday at noon.");
    assert!(response.confidence > 0.0);
    assert_eq!(h.llm.requests().len(), 2);
}

#[tokio::test]
async fn test_mutating_tool_is_not_retried() {
    let h = build_harness(
        vec![
            Ok(call("c1", "create_event", json!({ "title": "Dentist" }))),
            Ok(text("The calendar is unavailable.")),
        ],
        |s| s.retry = fast_retry(3),
        true,
    )
    .await;

    let QueryOutcome::PendingConfirmation(state) =
        h.orchestrator.answer("schedule a dentist appointment", &[]).await
    else {
        panic!("expected a pending confirmation");
    };
    let QueryOutcome::Answered(response) = h.orchestrator.resume(state, approve("c1")).await else {
        panic!("expected an answer");
    };
    assert_eq!(h.executions.load(Ordering::SeqCst), 1);
    let err = response.tool_calls[0].outcome.as_ref().unwrap_err();
    assert_eq!(err.kind, ToolErrorKind::Execution);
    assert!(err.message.contains("service unavailable"));
}

#[tokio::test]
async fn test_mixed_calls_are_handled_in_order() {
    let reply = LlmReply {
        content: String::new(),
        tool_calls: vec![
            ToolCall {
                id: "c1".into(),
                tool_name: "create_event".into(),
                arguments: json!({ "title": "Dentist" }),
            },
            ToolCall {
                id: "s1".into(),
                tool_name: "search_documents".into(),
                arguments: json!({ "query": "passport" }),
            },
            ToolCall {
                id: "c2".into(),
                tool_name: "create_event".into(),
                arguments: json!({ "title": "Passport office" }),
            },
        ],
    };
    let h = harness(vec![Ok(reply), Ok(text("Both events are booked."))]).await;

    let QueryOutcome::PendingConfirmation(state) =
        h.orchestrator.answer("schedule the dentist and the passport office", &[]).await
    else {
        panic!("expected a pending confirmation");
    };
    assert_eq!(state.pending().unwrap().call_id, "c1");

    let QueryOutcome::PendingConfirmation(state) = h.orchestrator.resume(state, approve("c1")).await
    else {
        panic!("expected the second call to wait");
    };
    assert_eq!(state.pending().unwrap().call_id, "c2");
    let done: Vec<&str> = state.tool_results().iter().map(|r| r.call_id.as_str()).collect();
    assert_eq!(done, vec!["c1", "s1"], "the read-only call ran before the second confirmation");

    let QueryOutcome::Answered(response) = h.orchestrator.resume(state, approve("c2")).await else {
        panic!("expected an answer");
    };
    let ids: Vec<&str> = response.tool_calls.iter().map(|r| r.call_id.as_str()).collect();
    assert_eq!(ids, vec!["c1", "s1", "c2"]);
    assert_eq!(h.executions.load(Ordering::SeqCst), 2);
    assert_eq!(h.llm.requests().len(), 2);
}

#[tokio::test]
async fn test_reissued_call_id_is_not_executed_again() {
    let h = harness(vec![
        Ok(call("c1", "create_event", json!({ "title": "Dentist" }))),
        Ok(call("c1", "create_event", json!({ "title": "Dentist" }))),
        Ok(text("Created once.")),
    ])
    .await;

    let QueryOutcome::PendingConfirmation(state) =
        h.orchestrator.answer("schedule a dentist appointment", &[]).await
    else {
        panic!("expected a pending confirmation");
    };
    let QueryOutcome::Answered(response) = h.orchestrator.resume(state, approve("c1")).await else {
        panic!("a resolved call id must not be suspended again");
    };
    assert_eq!(h.executions.load(Ordering::SeqCst), 1);
    assert_eq!(response.tool_calls.len(), 1);

    let requests = h.llm.requests();
    let last = requests[2].messages.last().unwrap();
    assert_eq!(last.role, Role::Tool);
    assert!(last.content.contains("already has a result"), "{}", last.content);
}

#[tokio::test]
async fn test_failure_after_confirmed_call_reports_partial() {
    let h = harness(vec![
        Ok(call("c1", "create_event", json!({ "title": "Dentist" }))),
        Err(MemexError::provider("scripted", "model overloaded")),
    ])
    .await;

    let QueryOutcome::PendingConfirmation(state) =
        h.orchestrator.answer("schedule a dentist appointment", &[]).await
    else {
        panic!("expected a pending confirmation");
    };
    let outcome = h.orchestrator.resume(state, approve("c1")).await;
    let QueryOutcome::Failed {
        message, partial, ..
    } = outcome
    else {
        panic!("expected a failure");
    };
    assert!(
        message.starts_with("retrieved 3 sources and ran 1 tool call, generation failed:"),
        "{}",
        message
    );
    assert_eq!(h.executions.load(Ordering::SeqCst), 1);

    let partial = partial.expect("the executed call is reported");
    assert!(!partial.complete);
    assert_eq!(partial.tool_calls.len(), 1);
    assert_eq!(partial.tool_calls[0].call_id, "c1");
    assert!(partial.tool_calls[0].is_ok());
    assert!(partial.answer.contains("create_event (c1): ok"));
}
