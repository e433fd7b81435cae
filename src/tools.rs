//! Named, schema-described actions the model can request.
//!
//! A [`Tool`] declares a JSON parameter schema and whether it mutates
//! anything outside the index. The [`ToolRegistry`] validates arguments
//! against that schema before dispatch, so tools receive well-formed
//! objects with defaults filled in.
//!
//! Mutating tools are never executed by the registry's callers without an
//! explicit user confirmation; see [`crate::rag`].
//!
//! # Built-in Tools
//!
//! | Name | Mutating | Description |
//! |------|----------|-------------|
//! | `search_documents` | no | Semantic search over indexed chunks |
//! | `find_similar_documents` | no | Chunks similar to a given chunk |
//! | `search_by_source` | no | Newest or best-matching chunks of one source |
//! | `parse_meeting_from_text` | no | Dates, times, participants from text |
//! | `create_calendar_event` | yes | Write an `.ics` event file |

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};

use memex_core::models::{SourceKind, ToolError, ToolErrorKind};
use memex_core::search::SearchOptions;
use memex_core::store::Filters;
use memex_core::{MemexError, Result};

use crate::calendar::{CreateCalendarEventTool, ParseMeetingTool};
use crate::config::Config;
use crate::schema;
use crate::search::SemanticSearchEngine;

const MAX_TOOL_RESULTS: i64 = 50;

/// A tool as advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
    pub mutating: bool,
}

#[async_trait]
pub trait Tool: Send + Sync {
    /// Lowercase identifier with underscores, e.g. `create_event`.
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema of the arguments object.
    fn parameters_schema(&self) -> Value;

    /// Whether the tool has side effects outside the index (sending mail,
    /// creating events). Mutating calls require user confirmation and are
    /// never retried.
    fn is_mutating(&self) -> bool {
        false
    }

    /// Run the tool with validated arguments.
    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value>;
}

/// What tools can reach while executing.
#[derive(Clone)]
pub struct ToolContext {
    search: Arc<SemanticSearchEngine>,
}

impl ToolContext {
    pub fn new(search: Arc<SemanticSearchEngine>) -> Self {
        Self { search }
    }

    pub fn search(&self) -> &SemanticSearchEngine {
        &self.search
    }
}

pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// A registry with the read-only built-ins.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.tools.push(Box::new(SearchDocumentsTool));
        registry.tools.push(Box::new(FindSimilarDocumentsTool));
        registry.tools.push(Box::new(SearchBySourceTool));
        registry.tools.push(Box::new(ParseMeetingTool));
        registry
    }

    /// The read-only built-ins plus the tools enabled in `[tools]`.
    pub fn from_config(config: &Config) -> Self {
        let mut registry = Self::with_builtins();
        if config.tools.calendar {
            registry
                .tools
                .push(Box::new(CreateCalendarEventTool::new(config.events_dir())));
        }
        registry
    }

    /// Add a tool. Names must be unique.
    pub fn register(&mut self, tool: Box<dyn Tool>) -> Result<()> {
        if self.find(tool.name()).is_some() {
            return Err(MemexError::validation(format!(
                "tool '{}' is already registered",
                tool.name()
            )));
        }
        self.tools.push(tool);
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    /// Specs of all registered tools, in registration order.
    pub fn list_tools(&self) -> Vec<ToolSpec> {
        self.tools.iter().map(|t| spec_of(t.as_ref())).collect()
    }

    /// Look up `name` and validate `args` against its schema.
    pub fn prepare(&self, name: &str, args: &Value) -> std::result::Result<(&dyn Tool, Value), ToolError> {
        let tool = self.find(name).ok_or_else(|| {
            ToolError::new(ToolErrorKind::UnknownTool, format!("unknown tool: {}", name))
        })?;
        let args = schema::validate(&tool.parameters_schema(), args)
            .map_err(|e| ToolError::new(ToolErrorKind::Validation, e.to_string()))?;
        Ok((tool, args))
    }

    /// Validate and run a tool once.
    pub async fn execute(
        &self,
        name: &str,
        args: &Value,
        ctx: &ToolContext,
    ) -> std::result::Result<Value, ToolError> {
        let (tool, args) = self.prepare(name, args)?;
        tool.execute(args, ctx)
            .await
            .map_err(|e| ToolError::new(ToolErrorKind::Execution, e.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn spec_of(tool: &dyn Tool) -> ToolSpec {
    ToolSpec {
        name: tool.name().to_string(),
        description: tool.description().to_string(),
        parameters: tool.parameters_schema(),
        mutating: tool.is_mutating(),
    }
}

fn source_filter(source: &str) -> Result<Filters> {
    let kind: SourceKind = source.parse()?;
    let mut filters = Filters::new();
    filters.insert("source".into(), kind.as_str().into());
    Ok(filters)
}

fn max_results_arg(args: &Value, fallback: usize) -> usize {
    args.get("max_results")
        .and_then(Value::as_i64)
        .map(|n| n.clamp(1, MAX_TOOL_RESULTS) as usize)
        .unwrap_or(fallback)
}

// ============ Built-in tools ============

pub struct SearchDocumentsTool;

#[async_trait]
impl Tool for SearchDocumentsTool {
    fn name(&self) -> &str {
        "search_documents"
    }

    fn description(&self) -> &str {
        "Search the user's indexed files, email, calendar, and documents"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "What to look for" },
                "max_results": { "type": "integer", "description": "Maximum number of results" },
                "source": {
                    "type": "string",
                    "enum": ["local_file", "gmail", "calendar", "drive"],
                    "description": "Only search one source"
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value> {
        let query = args["query"].as_str().unwrap_or_default();
        if query.trim().is_empty() {
            return Err(MemexError::validation("query must not be empty"));
        }

        let defaults = ctx.search().default_options();
        let filters = match args.get("source").and_then(Value::as_str) {
            Some(source) => source_filter(source)?,
            None => Filters::new(),
        };
        let opts = SearchOptions {
            max_results: max_results_arg(&args, defaults.max_results),
            filters,
            ..defaults
        };

        let results = ctx.search().search(query, &opts).await?;
        Ok(json!({ "results": results }))
    }
}

/// Browse one source. Without a query the newest chunks are returned.
pub struct SearchBySourceTool;

#[async_trait]
impl Tool for SearchBySourceTool {
    fn name(&self) -> &str {
        "search_by_source"
    }

    fn description(&self) -> &str {
        "List or search content from one source (local files, email, calendar, or drive)"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "source": {
                    "type": "string",
                    "enum": ["local_file", "gmail", "calendar", "drive"]
                },
                "query": {
                    "type": "string",
                    "description": "Optional search text; empty lists the newest items",
                    "default": ""
                },
                "max_results": { "type": "integer", "default": 10 }
            },
            "required": ["source"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value> {
        let source = args["source"].as_str().unwrap_or_default();
        let query = args["query"].as_str().unwrap_or_default();
        let filters = source_filter(source)?;
        let defaults = ctx.search().default_options();
        let max_results = max_results_arg(&args, defaults.max_results);

        let results = if query.trim().is_empty() {
            ctx.search().search_by_filters(&filters, max_results).await?
        } else {
            let opts = SearchOptions {
                max_results,
                filters,
                ..defaults
            };
            ctx.search().search(query, &opts).await?
        };
        Ok(json!({ "source": source, "query": query, "results": results }))
    }
}

pub struct FindSimilarDocumentsTool;

#[async_trait]
impl Tool for FindSimilarDocumentsTool {
    fn name(&self) -> &str {
        "find_similar_documents"
    }

    fn description(&self) -> &str {
        "Find chunks similar to a previously returned chunk"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "chunk_id": { "type": "string", "description": "Chunk id from a search result" },
                "max_results": { "type": "integer", "description": "Maximum number of results" }
            },
            "required": ["chunk_id"]
        })
    }

    async fn execute(&self, args: Value, ctx: &ToolContext) -> Result<Value> {
        let chunk_id = args["chunk_id"].as_str().unwrap_or_default();
        let defaults = ctx.search().default_options();
        let results = ctx
            .search()
            .find_similar_documents(
                chunk_id,
                max_results_arg(&args, defaults.max_results),
                defaults.similarity_threshold,
            )
            .await?;
        Ok(json!({ "results": results }))
    }
}
