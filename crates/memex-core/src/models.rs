//! Core data models that flow through the indexing and query pipeline.
//!
//! ```text
//! Loader ──▶ Document ──▶ Chunk ──▶ (vector + IndexEntry)
//!                                        │
//! query ──▶ SearchResult ◀───────────────┘
//!               │
//!               ▼
//!     ConversationTurn / ToolCall / ToolResult
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::MemexError;

/// Scalar metadata value attached to documents and chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl MetaValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            MetaValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Convert a JSON scalar into a metadata value. Arrays, objects, and
    /// null have no scalar representation.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(MetaValue::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(MetaValue::Int)
                .or_else(|| n.as_f64().map(MetaValue::Float)),
            serde_json::Value::String(s) => Some(MetaValue::Text(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::Bool(b) => write!(f, "{}", b),
            MetaValue::Int(i) => write!(f, "{}", i),
            MetaValue::Float(x) => write!(f, "{}", x),
            MetaValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        MetaValue::Text(s.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        MetaValue::Text(s)
    }
}

impl From<i64> for MetaValue {
    fn from(i: i64) -> Self {
        MetaValue::Int(i)
    }
}

impl From<f64> for MetaValue {
    fn from(x: f64) -> Self {
        MetaValue::Float(x)
    }
}

impl From<bool> for MetaValue {
    fn from(b: bool) -> Self {
        MetaValue::Bool(b)
    }
}

/// String-keyed scalar metadata. `BTreeMap` keeps serialization stable.
pub type Metadata = BTreeMap<String, MetaValue>;

/// Where a document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    LocalFile,
    Gmail,
    Calendar,
    Drive,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::LocalFile => "local_file",
            SourceKind::Gmail => "gmail",
            SourceKind::Calendar => "calendar",
            SourceKind::Drive => "drive",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = MemexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local_file" => Ok(SourceKind::LocalFile),
            "gmail" => Ok(SourceKind::Gmail),
            "calendar" => Ok(SourceKind::Calendar),
            "drive" => Ok(SourceKind::Drive),
            other => Err(MemexError::validation(format!(
                "unknown source '{}': expected local_file, gmail, calendar, or drive",
                other
            ))),
        }
    }
}

/// SHA-256 hex digest of a text. Used for document and chunk content hashes.
pub fn content_digest(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// A loaded document, immutable once produced.
///
/// A changed source file is represented as a new `Document` with the same
/// `id` and a different `content_hash`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    pub source: SourceKind,
    pub source_id: String,
    pub url: Option<String>,
    pub content_hash: String,
    pub metadata: Metadata,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// Build a document, deriving `content_hash` from `content`.
    pub fn new(
        id: impl Into<String>,
        source: SourceKind,
        source_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let content = content.into();
        let content_hash = content_digest(&content);
        Self {
            id: id.into(),
            content,
            source,
            source_id: source_id.into(),
            url: None,
            content_hash,
            metadata: Metadata::new(),
            updated_at: Utc::now(),
        }
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn with_updated_at(mut self, updated_at: DateTime<Utc>) -> Self {
        self.updated_at = updated_at;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// A bounded fragment of a document's content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    /// Derived from document id, chunk index, and chunk text.
    pub id: String,
    pub document_id: String,
    pub chunk_index: usize,
    pub text: String,
    /// Character offset of the first char of `text` in the document content.
    pub start_offset: usize,
    /// Character offset one past the last char of `text`.
    pub end_offset: usize,
    /// SHA-256 of `text`.
    pub hash: String,
    pub metadata: Metadata,
}

/// Per-chunk ledger record. Exists iff the chunk's vector is stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub chunk_id: String,
    pub document_id: String,
    /// Content hash of the parent document at indexing time.
    pub content_hash: String,
    pub embedding_model_name: String,
    pub embedding_dimension: usize,
    pub indexed_at: DateTime<Utc>,
}

/// Per-document ledger record.
///
/// Kept alongside the chunk entries so that documents with no chunks
/// (empty content) are still recognised as indexed and unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub document_id: String,
    pub source: SourceKind,
    pub content_hash: String,
    pub chunk_count: usize,
    pub embedding_model_name: String,
    pub indexed_at: DateTime<Utc>,
}

/// One ranked hit from semantic search.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub chunk_id: String,
    pub document_id: String,
    pub text: String,
    /// Similarity in `[0.0, 1.0]`, higher is more relevant.
    pub score: f64,
    pub source: Option<SourceKind>,
    /// Parent document's `updated_at` as a Unix timestamp (0 if unknown).
    pub updated_at: i64,
    pub metadata: Metadata,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the generative model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    /// Arguments did not match the declared parameter schema.
    Validation,
    UnknownTool,
    /// The tool ran and failed.
    Execution,
    /// The user did not confirm a mutating call.
    Declined,
}

/// Structured tool failure, reported back to the model as a tool turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ToolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// Outcome of one tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    pub tool_name: String,
    pub outcome: std::result::Result<serde_json::Value, ToolError>,
}

impl ToolResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Render the outcome as the content of a tool turn.
    pub fn to_content(&self) -> String {
        match &self.outcome {
            Ok(value) => serde_json::json!({ "result": value }).to_string(),
            Err(err) => serde_json::json!({ "error": err }).to_string(),
        }
    }
}

/// One message in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Set on tool turns: the call this turn answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ConversationTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
            tool_calls,
            tool_call_id: None,
        }
    }

    pub fn tool(result: &ToolResult) -> Self {
        Self {
            role: Role::Tool,
            content: result.to_content(),
            tool_calls: Vec::new(),
            tool_call_id: Some(result.call_id.clone()),
        }
    }
}

/// A document that could not be indexed during a sync.
#[derive(Debug, Clone, Serialize)]
pub struct FailedDocument {
    pub document_id: String,
    pub error: String,
}

/// Summary of one `sync` run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IndexReport {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
    /// Unchanged documents whose stored vectors were missing and re-indexed.
    pub repaired: usize,
    pub failed: Vec<FailedDocument>,
}
