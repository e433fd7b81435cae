//! # Memex
//!
//! Indexes personal content (local files, email, calendar, cloud documents)
//! into vectors and answers natural-language questions from it, optionally
//! invoking confirmed actions through tools.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌───────────┐
//! │ Loaders  │──▶│ IndexManager │──▶│  SQLite   │
//! │ FS/...   │   │ chunk+embed  │   │ vec+ledger│
//! └──────────┘   └──────────────┘   └─────┬─────┘
//!                                         │
//!                  ┌──────────────────────┤
//!                  ▼                      ▼
//!          ┌───────────────┐      ┌───────────────┐
//!          │ SemanticSearch│◀─────│RagOrchestrator│──▶ LLM + tools
//!          └───────────────┘      └───────────────┘
//! ```
//!
//! Backend-agnostic types and algorithms (chunking, ranking, store traits)
//! live in the `memex-core` crate.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`loader`] | Document loaders |
//! | [`embedding`] | Embedding providers |
//! | [`index`] | Incremental indexing |
//! | [`search`] | Semantic search |
//! | [`llm`] | Chat providers |
//! | [`tools`] | Tool trait, registry, built-in tools |
//! | [`calendar`] | Meeting parsing and `.ics` event tools |
//! | [`rag`] | Query orchestration |
//! | [`sqlite_store`] | SQLite vector store and ledger |
//! | [`retry`] | Backoff and timeouts |

pub mod calendar;
pub mod commands;
pub mod config;
pub mod db;
pub mod embedding;
pub mod index;
pub mod llm;
pub mod loader;
pub mod migrate;
pub mod rag;
pub mod retry;
pub mod schema;
pub mod search;
pub mod sqlite_store;
pub mod stats;
pub mod tools;
