//! Command implementations behind the `memex` binary.
//!
//! [`App`] wires the configured backends together: the SQLite store (which
//! is both the vector store and the index ledger), the embedding service,
//! the LLM provider, and the tool registry.

use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};

use memex_core::embedding::EmbeddingService;
use memex_core::models::{SearchResult, SourceKind};
use memex_core::store::Filters;

use crate::config::{Config, FilesystemLoaderConfig};
use crate::db;
use crate::embedding::create_service;
use crate::index::{IndexManager, SyncOptions};
use crate::llm::create_provider;
use crate::loader::{FilesystemLoader, Loader};
use crate::rag::{Confirmation, QueryOutcome, RagOrchestrator, RagResponse, RagSettings};
use crate::search::{SearchOptions, SemanticSearchEngine};
use crate::sqlite_store::SqliteStore;
use crate::tools::ToolRegistry;

pub struct App {
    pub config: Config,
    pub store: Arc<SqliteStore>,
    pub embedder: Arc<dyn EmbeddingService>,
}

impl App {
    /// Connect to the database and create the embedding service.
    pub async fn open(config: Config) -> Result<Self> {
        let pool = db::connect(&config).await?;
        let embedder = create_service(&config.embedding)?;
        Ok(Self {
            config,
            store: Arc::new(SqliteStore::new(pool)),
            embedder,
        })
    }

    pub fn index_manager(&self) -> Result<IndexManager> {
        Ok(IndexManager::from_config(
            &self.config,
            self.embedder.clone(),
            self.store.clone(),
            self.store.clone(),
        )?)
    }

    pub fn search_engine(&self) -> SemanticSearchEngine {
        SemanticSearchEngine::from_config(&self.config, self.embedder.clone(), self.store.clone())
    }

    pub fn orchestrator(&self) -> Result<RagOrchestrator> {
        let llm = create_provider(&self.config.llm)?;
        Ok(RagOrchestrator::new(
            Arc::new(self.search_engine()),
            llm,
            Arc::new(ToolRegistry::from_config(&self.config)),
            RagSettings::from_config(&self.config),
        ))
    }

    pub async fn close(self) {
        self.store.pool().close().await;
    }
}

/// `memex index [path] [--prune]`
pub async fn run_index(config: Config, path: Option<PathBuf>, prune: bool) -> Result<()> {
    let loader_config = match (path, config.loaders.filesystem.clone()) {
        (Some(root), Some(section)) => FilesystemLoaderConfig { root, ..section },
        (Some(root), None) => FilesystemLoaderConfig::new(root),
        (None, Some(section)) => section,
        (None, None) => bail!("No path given and no [loaders.filesystem] root configured."),
    };
    let root = loader_config.root.clone();
    let loader = FilesystemLoader::new(loader_config);
    let documents = loader.load()?;

    let app = App::open(config).await?;
    let manager = app.index_manager()?;
    let opts = SyncOptions {
        prune,
        prune_source: Some(loader.source()),
    };
    let report = manager.sync(documents, &opts).await?;
    app.close().await;

    println!("index {}", root.display());
    println!("  added:     {}", report.added);
    println!("  updated:   {}", report.updated);
    println!("  unchanged: {}", report.unchanged);
    println!("  repaired:  {}", report.repaired);
    println!("  removed:   {}", report.removed);
    println!("  failed:    {}", report.failed.len());
    for failed in &report.failed {
        eprintln!("Warning: {} was not indexed: {}", failed.document_id, failed.error);
    }
    println!("ok");
    Ok(())
}

/// `memex search <query>`
pub async fn run_search(
    config: Config,
    query: &str,
    source: Option<String>,
    limit: Option<usize>,
    threshold: Option<f64>,
) -> Result<()> {
    let app = App::open(config).await?;
    let engine = app.search_engine();

    let mut opts = engine.default_options();
    if let Some(limit) = limit {
        opts.max_results = limit;
    }
    if let Some(threshold) = threshold {
        opts.similarity_threshold = threshold;
    }
    if let Some(source) = source {
        let kind: SourceKind = source.parse()?;
        let mut filters = Filters::new();
        filters.insert("source".into(), kind.as_str().into());
        opts = SearchOptions { filters, ..opts };
    }

    let results = engine.search(query, &opts).await?;
    app.close().await;
    print_results(&results);
    Ok(())
}

/// `memex similar <chunk_id>`
pub async fn run_similar(config: Config, chunk_id: &str, limit: Option<usize>) -> Result<()> {
    let app = App::open(config).await?;
    let engine = app.search_engine();
    let defaults = engine.default_options();
    let results = engine
        .find_similar_documents(
            chunk_id,
            limit.unwrap_or(defaults.max_results),
            defaults.similarity_threshold,
        )
        .await?;
    app.close().await;
    print_results(&results);
    Ok(())
}

/// `memex ask <query>`. Each mutating tool call is confirmed interactively.
pub async fn run_ask(config: Config, query: &str, json: bool) -> Result<()> {
    let app = App::open(config).await?;
    let orchestrator = app.orchestrator()?;

    let mut outcome = orchestrator.answer(query, &[]).await;
    let result = loop {
        match outcome {
            QueryOutcome::Answered(response) => break Ok(response),
            QueryOutcome::PendingConfirmation(state) => {
                let pending = state
                    .pending()
                    .cloned()
                    .context("query suspended without a pending tool call")?;
                let approved = confirm(&format!(
                    "Run {} with {}?",
                    pending.tool_name, pending.arguments
                ))?;
                let confirmation = Confirmation {
                    call_id: pending.call_id,
                    approved,
                };
                outcome = orchestrator.resume(state, confirmation).await;
            }
            QueryOutcome::Failed {
                message, partial, ..
            } => break Err((message, partial)),
        }
    };
    app.close().await;

    match result {
        Ok(response) => print_response(&response, json),
        Err((message, partial)) => {
            if let Some(partial) = partial {
                print_response(&partial, json)?;
            }
            bail!(message)
        }
    }
}

/// Ask on stderr so `--json` output on stdout stays parseable.
fn confirm(prompt: &str) -> Result<bool> {
    confirm_with(&mut std::io::stdin().lock(), &mut std::io::stderr(), prompt)
}

fn confirm_with(input: &mut impl BufRead, output: &mut impl Write, prompt: &str) -> Result<bool> {
    write!(output, "{} [y/N] ", prompt)?;
    output.flush()?;
    let mut line = String::new();
    input.read_line(&mut line)?;
    Ok(matches!(line.trim().to_lowercase().as_str(), "y" | "yes"))
}

fn print_response(response: &RagResponse, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(response)?);
        return Ok(());
    }

    println!("{}", response.answer);
    if !response.tool_calls.is_empty() {
        println!();
        println!("Tool calls:");
        for call in &response.tool_calls {
            match &call.outcome {
                Ok(_) => println!("  {} ({}): ok", call.tool_name, call.call_id),
                Err(e) => println!("  {} ({}): {}", call.tool_name, call.call_id, e),
            }
        }
    }
    if !response.attributions.is_empty() {
        println!();
        println!("Sources (confidence {:.2}):", response.confidence);
        for (i, a) in response.attributions.iter().enumerate() {
            let source = a.source.map(|s| s.as_str()).unwrap_or("unknown");
            println!("  [{}] {:.2} {} {}", i + 1, a.score, source, a.document_id);
            if let Some(url) = &a.url {
                println!("      url: {}", url);
            }
            println!("      excerpt: \"{}\"", a.excerpt.replace('\n', " ").trim());
        }
    }
    Ok(())
}

fn print_results(results: &[SearchResult]) {
    if results.is_empty() {
        println!("No results.");
        return;
    }

    for (i, result) in results.iter().enumerate() {
        let source = result.source.map(|s| s.as_str()).unwrap_or("unknown");
        let date = chrono::DateTime::from_timestamp(result.updated_at, 0)
            .map(|dt| dt.format("%Y-%m-%d").to_string())
            .unwrap_or_default();
        let excerpt: String = result.text.chars().take(200).collect();

        println!("{}. [{:.2}] {} / {}", i + 1, result.score, source, result.document_id);
        println!("    updated: {}", date);
        if let Some(url) = result.metadata.get("url").and_then(|v| v.as_str()) {
            println!("    url: {}", url);
        }
        println!("    excerpt: \"{}\"", excerpt.replace('\n', " ").trim());
        println!("    chunk: {}", result.chunk_id);
        println!();
    }
}
