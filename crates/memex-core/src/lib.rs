//! # Memex Core
//!
//! Backend-agnostic logic for Memex: data models, the error taxonomy,
//! chunking, store abstractions, the ranking algorithm, and the
//! embedding trait.
//!
//! This crate contains no tokio, sqlx, HTTP clients, or filesystem I/O.
//! Concrete providers and stores live in the `memex` application crate.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod models;
pub mod search;
pub mod store;

pub use error::{MemexError, Result};
