//! Boundary-aware overlapping text chunker.
//!
//! Splits document content into [`Chunk`]s of at most `chunk_size`
//! characters, with `chunk_overlap` characters shared between
//! consecutive chunks. Each chunk is an exact substring of the document
//! content, so the original text can always be reconstructed from the
//! chunk spans.
//!
//! # Algorithm
//!
//! 1. Empty or whitespace-only content yields no chunks.
//! 2. Content of at most `chunk_size` characters yields one chunk.
//! 3. Otherwise take a window of `chunk_size` characters from the current
//!    start. Unless the window reaches the end of the text, look back from
//!    the window end for a split point, preferring in order: paragraph
//!    break (`\n\n`), line break, sentence end (`. `, `! `, `? `), space.
//!    Without one, split hard at the window end.
//! 4. The next window starts `chunk_overlap` characters before the split.
//! 5. Any chunk whose estimated token count exceeds `max_tokens_per_chunk`
//!    is re-split into consecutive pieces without overlap.
//!
//! The look-back distance is capped at 200 characters and additionally
//! bounded so that window starts never fall behind an even spacing of
//! `ceil(len / (chunk_size - chunk_overlap))` windows over the text. Split
//! points can therefore shorten chunks but never add one.
//!
//! Offsets are counted in characters, not bytes.
//!
//! # Example
//!
//! ```rust
//! use memex_core::chunk::Chunker;
//! use memex_core::models::{Document, SourceKind};
//!
//! let chunker = Chunker::new(1000, 200, 8000).unwrap();
//! let doc = Document::new("local_file:a.md", SourceKind::LocalFile, "a.md", "Hello world.");
//! let chunks = chunker.chunk(&doc);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!(chunks[0].text, "Hello world.");
//! ```

use uuid::Uuid;

use crate::error::{MemexError, Result};
use crate::models::{content_digest, Chunk, Document, MetaValue};

/// Approximate characters-per-token ratio.
pub const CHARS_PER_TOKEN: usize = 4;

/// Maximum distance, in characters, searched back from a window end.
const MAX_LOOKBACK: usize = 200;

/// Split points in order of preference.
const SEPARATORS: &[&[&str]] = &[&["\n\n"], &["\n"], &[". ", "! ", "? "], &[" "]];

/// Estimated token count of a text (4 characters per token, rounded up).
pub fn estimate_tokens(text: &str) -> usize {
    text.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Deterministic chunker configured with window and token limits.
#[derive(Debug, Clone)]
pub struct Chunker {
    chunk_size: usize,
    chunk_overlap: usize,
    max_tokens_per_chunk: usize,
}

impl Chunker {
    /// Create a chunker. Fails with `Validation` unless
    /// `chunk_overlap < chunk_size` and `max_tokens_per_chunk > 0`.
    pub fn new(chunk_size: usize, chunk_overlap: usize, max_tokens_per_chunk: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(MemexError::validation("chunk_size must be > 0"));
        }
        if chunk_overlap >= chunk_size {
            return Err(MemexError::validation(format!(
                "chunk_overlap ({}) must be smaller than chunk_size ({})",
                chunk_overlap, chunk_size
            )));
        }
        if max_tokens_per_chunk == 0 {
            return Err(MemexError::validation("max_tokens_per_chunk must be > 0"));
        }
        Ok(Self {
            chunk_size,
            chunk_overlap,
            max_tokens_per_chunk,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }

    /// Split a document into chunks with contiguous indices starting at 0.
    pub fn chunk(&self, doc: &Document) -> Vec<Chunk> {
        let content = doc.content.as_str();
        if content.trim().is_empty() {
            return Vec::new();
        }

        let chars: Vec<char> = content.chars().collect();
        let byte_offsets: Vec<usize> = content
            .char_indices()
            .map(|(b, _)| b)
            .chain(std::iter::once(content.len()))
            .collect();

        let spans = self.enforce_token_limit(self.window_spans(&chars));
        let chunk_count = spans.len();

        spans
            .into_iter()
            .enumerate()
            .map(|(index, (start, end))| {
                let text = &content[byte_offsets[start]..byte_offsets[end]];
                make_chunk(doc, index, chunk_count, text, start, end)
            })
            .collect()
    }

    /// Compute overlapping `(start, end)` character spans.
    fn window_spans(&self, chars: &[char]) -> Vec<(usize, usize)> {
        let len = chars.len();
        if len <= self.chunk_size {
            return vec![(0, len)];
        }

        let stride = self.chunk_size - self.chunk_overlap;
        let windows = len.div_ceil(stride);
        // Minimum start of window `i` so that `windows` windows always suffice.
        let floor = |i: usize| -> usize {
            (i * (len - self.chunk_size)).div_ceil(windows - 1)
        };

        let mut spans = Vec::new();
        let mut start = 0;
        let mut index = 0;
        loop {
            let window_end = start + self.chunk_size;
            if window_end >= len {
                spans.push((start, len));
                break;
            }

            let lowest = window_end
                .saturating_sub(MAX_LOOKBACK)
                .max(floor(index + 1) + self.chunk_overlap)
                .max(start + 1);
            let split = find_split_point(chars, start, lowest, window_end).unwrap_or(window_end);
            spans.push((start, split));

            let next = split.saturating_sub(self.chunk_overlap);
            start = if next > start { next } else { split };
            index += 1;
        }
        spans
    }

    /// Re-split spans longer than the token limit into non-overlapping pieces.
    fn enforce_token_limit(&self, spans: Vec<(usize, usize)>) -> Vec<(usize, usize)> {
        let max_chars = self.max_tokens_per_chunk * CHARS_PER_TOKEN;
        let mut out = Vec::with_capacity(spans.len());
        for (start, end) in spans {
            if end - start <= max_chars {
                out.push((start, end));
                continue;
            }
            let mut piece_start = start;
            while piece_start < end {
                let piece_end = (piece_start + max_chars).min(end);
                out.push((piece_start, piece_end));
                piece_start = piece_end;
            }
        }
        out
    }
}

/// Find the best split point `p` with `lowest <= p <= window_end`.
///
/// A split point is the position just after a separator.
fn find_split_point(chars: &[char], start: usize, lowest: usize, window_end: usize) -> Option<usize> {
    if lowest > window_end {
        return None;
    }
    for group in SEPARATORS {
        for p in (lowest..=window_end).rev() {
            let hit = group.iter().any(|sep| {
                let sep_len = sep.chars().count();
                p >= start + sep_len && sep.chars().eq(chars[p - sep_len..p].iter().copied())
            });
            if hit {
                return Some(p);
            }
        }
    }
    None
}

fn make_chunk(
    doc: &Document,
    index: usize,
    chunk_count: usize,
    text: &str,
    start: usize,
    end: usize,
) -> Chunk {
    let hash = content_digest(text);
    let name = format!("{}:{}:{}", doc.id, index, hash);
    let id = Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string();

    let mut metadata = doc.metadata.clone();
    metadata.insert("chunk_index".into(), MetaValue::Int(index as i64));
    metadata.insert("chunk_count".into(), MetaValue::Int(chunk_count as i64));
    metadata.insert("document_id".into(), doc.id.clone().into());
    metadata.insert("source".into(), doc.source.as_str().into());
    metadata.insert("source_id".into(), doc.source_id.clone().into());
    metadata.insert("updated_at".into(), MetaValue::Int(doc.updated_at.timestamp()));
    if let Some(url) = &doc.url {
        metadata.insert("url".into(), url.clone().into());
    }

    Chunk {
        id,
        document_id: doc.id.clone(),
        chunk_index: index,
        text: text.to_string(),
        start_offset: start,
        end_offset: end,
        hash,
        metadata,
    }
}
