//! Chunking engine: segments extracted page text into token-bounded,
//! overlapping chunks.
//!
//! Three strategies are available via [`ChunkingStrategy`](crate::config::ChunkingStrategy):
//!
//! - **Semantic** — accumulates sentences up to the token budget, carrying a
//!   sentence tail forward as overlap, and attaches section headers.
//! - **Fixed** — slides a character window with whitespace snapping.
//! - **Hybrid** (default) — per page, semantic when sentence or paragraph
//!   boundaries are detected, fixed otherwise.
//!
//! Chunking is deterministic: the same text and config always produce the
//! same boundaries, token counts, and hashes.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

use crate::config::{ChunkingConfig, ChunkingStrategy};
use crate::types::{ChunkingStats, PageText, TextChunk, text_hash};

/// How far backward the fixed-window strategy searches for a whitespace
/// boundary before giving up and cutting mid-word.
const WHITESPACE_SNAP_DISTANCE: usize = 50;

/// Markdown-style heading: `# Title` through `###### Title`.
static MARKDOWN_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#{1,6}\s+\S").unwrap());

/// Numbered heading: `1. Title`, `2.3 Title`, `4) Title`.
static NUMBERED_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d+(\.\d+)*[.)]?\s+\S").unwrap());

/// ALL-CAPS heading ending in a colon: `DEFINITIONS:`.
static CAPS_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z][A-Z0-9 \t'&/-]{2,}:\s*$").unwrap());

/// The output of one chunking run: ordered chunks plus aggregate stats.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkingOutput {
    /// Chunks in document order, re-indexed contiguously from 0 after
    /// deduplication.
    pub chunks: Vec<TextChunk>,
    /// Aggregate statistics for the run.
    pub stats: ChunkingStats,
}

/// Splits extracted page text into token-bounded chunks with controlled
/// overlap, preserving page and section metadata and dropping duplicate
/// chunk text within the document.
#[derive(Debug, Clone)]
pub struct ChunkingEngine {
    config: ChunkingConfig,
}

/// A section header found in page text, keyed by its character offset.
struct HeaderMark {
    offset: usize,
    text: String,
}

/// A sentence with its start offset in the page text.
struct Sentence<'a> {
    offset: usize,
    text: &'a str,
}

impl ChunkingEngine {
    /// Create an engine with the given configuration.
    pub fn new(config: ChunkingConfig) -> Self {
        Self { config }
    }

    /// Return a reference to the engine configuration.
    pub fn config(&self) -> &ChunkingConfig {
        &self.config
    }

    /// Estimate the token count of a text: `ceil(len / chars_per_token)`.
    ///
    /// This is an approximation, not an exact tokenizer call.
    pub fn estimate_tokens(&self, text: &str) -> u32 {
        (text.len().div_ceil(self.config.chars_per_token)) as u32
    }

    /// Chunk a document's pages into an ordered, deduplicated chunk list.
    ///
    /// Pages are segmented independently so page numbers stay exact; chunk
    /// indices and deduplication run across the whole document.
    pub fn chunk_pages(&self, pages: &[PageText]) -> ChunkingOutput {
        let mut raw: Vec<TextChunk> = Vec::new();

        for page in pages {
            let text = page.text.trim();
            if text.is_empty() {
                continue;
            }
            let mut page_chunks = match self.config.strategy {
                ChunkingStrategy::Semantic => self.chunk_semantic(text),
                ChunkingStrategy::Fixed => self.chunk_fixed(text),
                ChunkingStrategy::Hybrid => {
                    if has_sentence_boundaries(text) || text.contains("\n\n") {
                        self.chunk_semantic(text)
                    } else {
                        self.chunk_fixed(text)
                    }
                }
            };
            self.merge_short_tail(&mut page_chunks);
            for chunk in &mut page_chunks {
                chunk.page_number = Some(page.page_number);
            }
            raw.extend(page_chunks);
        }

        // Drop chunks whose text hash was already seen in this document,
        // then re-index contiguously from 0.
        let mut seen: HashSet<String> = HashSet::new();
        let mut duplicates_removed = 0usize;
        let mut chunks: Vec<TextChunk> = Vec::with_capacity(raw.len());
        for mut chunk in raw {
            if !seen.insert(chunk.text_hash.clone()) {
                duplicates_removed += 1;
                continue;
            }
            chunk.chunk_index = chunks.len() as u32;
            chunks.push(chunk);
        }

        let total_tokens: u64 = chunks.iter().map(|c| c.token_count as u64).sum();
        let stats = ChunkingStats {
            total_chunks: chunks.len(),
            total_tokens,
            average_tokens: if chunks.is_empty() {
                0.0
            } else {
                total_tokens as f64 / chunks.len() as f64
            },
            duplicates_removed,
        };

        debug!(
            chunks = stats.total_chunks,
            tokens = stats.total_tokens,
            duplicates = stats.duplicates_removed,
            strategy = ?self.config.strategy,
            "chunked document"
        );

        ChunkingOutput { chunks, stats }
    }

    /// Sentence-accumulating chunking with overlap tails and section headers.
    ///
    /// Falls back to [`chunk_fixed`](Self::chunk_fixed) when the text has no
    /// sentence boundaries.
    fn chunk_semantic(&self, text: &str) -> Vec<TextChunk> {
        let sentences = split_sentences(text);
        if sentences.len() <= 1 {
            return self.chunk_fixed(text);
        }

        let headers = find_headers(text);
        let mut chunks: Vec<TextChunk> = Vec::new();
        // Current chunk: accumulated sentences and the offset of the first.
        let mut current: Vec<&Sentence<'_>> = Vec::new();
        let mut current_tokens: u32 = 0;

        for sentence in &sentences {
            let sentence_tokens = self.estimate_tokens(sentence.text);
            if !current.is_empty()
                && (current_tokens + sentence_tokens) as usize > self.config.max_chunk_size
            {
                chunks.push(self.close_sentence_chunk(&current, &headers));

                // Retain a sentence tail as overlap, trimmed to the
                // configured token budget.
                let mut tail: Vec<&Sentence<'_>> = Vec::new();
                let mut tail_tokens: u32 = 0;
                if self.config.overlap_tokens > 0 {
                    for prior in current.iter().rev() {
                        let t = self.estimate_tokens(prior.text);
                        if (tail_tokens + t) as usize > self.config.overlap_tokens {
                            break;
                        }
                        tail_tokens += t;
                        tail.push(prior);
                    }
                    tail.reverse();
                }
                current = tail;
                current_tokens = tail_tokens;
            }
            current.push(sentence);
            current_tokens += sentence_tokens;
        }

        if !current.is_empty() {
            chunks.push(self.close_sentence_chunk(&current, &headers));
        }
        chunks
    }

    /// Assemble one chunk from accumulated sentences, attaching the most
    /// recent section header at or before the chunk's start offset.
    fn close_sentence_chunk(
        &self,
        sentences: &[&Sentence<'_>],
        headers: &[HeaderMark],
    ) -> TextChunk {
        let start_offset = sentences.first().map_or(0, |s| s.offset);
        let text = sentences.iter().map(|s| s.text).collect::<Vec<_>>().join(" ");
        let section_header = headers
            .iter()
            .rev()
            .find(|h| h.offset <= start_offset)
            .map(|h| h.text.clone());

        TextChunk {
            token_count: self.estimate_tokens(&text),
            text_hash: text_hash(&text),
            text,
            chunk_index: 0,
            page_number: None,
            section_header,
            is_overlap: false,
        }
    }

    /// Sliding character-window chunking with whitespace snapping.
    ///
    /// Every chunk after the first carries overlap from its predecessor and
    /// is marked `is_overlap`.
    fn chunk_fixed(&self, text: &str) -> Vec<TextChunk> {
        let window = self.config.target_chunk_size * self.config.chars_per_token;
        let overlap = self.config.overlap_tokens * self.config.chars_per_token;
        let step = window.saturating_sub(overlap).max(1);

        let mut chunks = Vec::new();
        let mut start = 0usize;

        while start < text.len() {
            let mut end = (start + window).min(text.len());
            if end < text.len() {
                end = snap_to_whitespace(text, end, start);
            }
            end = floor_char_boundary(text, end);
            if end <= start {
                break;
            }

            let chunk_text = text[start..end].trim();
            if !chunk_text.is_empty() {
                chunks.push(TextChunk {
                    token_count: self.estimate_tokens(chunk_text),
                    text_hash: text_hash(chunk_text),
                    text: chunk_text.to_string(),
                    chunk_index: 0,
                    page_number: None,
                    section_header: None,
                    is_overlap: !chunks.is_empty(),
                });
            }

            if end == text.len() {
                break;
            }
            start = floor_char_boundary(text, start + step);
        }

        chunks
    }

    /// Merge a trailing partial chunk below `min_chunk_size` into its
    /// predecessor, unless the merge would exceed `max_chunk_size`.
    fn merge_short_tail(&self, chunks: &mut Vec<TextChunk>) {
        if chunks.len() < 2 {
            return;
        }
        let last = chunks.last().map(|c| c.token_count as usize).unwrap_or(0);
        if last >= self.config.min_chunk_size {
            return;
        }
        let prior = chunks[chunks.len() - 2].token_count as usize;
        if prior + last > self.config.max_chunk_size {
            return;
        }

        let Some(tail) = chunks.pop() else { return };
        if let Some(merged) = chunks.last_mut() {
            merged.text.push(' ');
            merged.text.push_str(&tail.text);
            merged.token_count = self.estimate_tokens(&merged.text);
            merged.text_hash = text_hash(&merged.text);
        }
    }
}

/// True when the text contains sentence-ending punctuation followed by
/// whitespace.
fn has_sentence_boundaries(text: &str) -> bool {
    let bytes = text.as_bytes();
    bytes.windows(2).any(|w| matches!(w[0], b'.' | b'!' | b'?') && w[1].is_ascii_whitespace())
}

/// Split text into sentences at sentence-ending punctuation followed by
/// whitespace, recording each sentence's start offset.
fn split_sentences(text: &str) -> Vec<Sentence<'_>> {
    let bytes = text.as_bytes();
    let mut sentences = Vec::new();
    let mut start = 0usize;

    let mut i = 0usize;
    while i + 1 < bytes.len() {
        if matches!(bytes[i], b'.' | b'!' | b'?') && bytes[i + 1].is_ascii_whitespace() {
            let end = i + 1;
            let raw = &text[start..end];
            let trimmed = raw.trim();
            if !trimmed.is_empty() {
                let offset = start + (raw.len() - raw.trim_start().len());
                sentences.push(Sentence { offset, text: trimmed });
            }
            start = end;
        }
        i += 1;
    }

    let raw = &text[start..];
    let trimmed = raw.trim();
    if !trimmed.is_empty() {
        let offset = start + (raw.len() - raw.trim_start().len());
        sentences.push(Sentence { offset, text: trimmed });
    }

    sentences
}

/// Find heading-like lines (markdown, numbered, or ALL-CAPS-colon) and
/// record them by character offset.
fn find_headers(text: &str) -> Vec<HeaderMark> {
    let mut headers = Vec::new();
    let mut offset = 0usize;
    for line in text.split_inclusive('\n') {
        let trimmed = line.trim();
        if !trimmed.is_empty()
            && (MARKDOWN_HEADER.is_match(trimmed)
                || NUMBERED_HEADER.is_match(trimmed)
                || CAPS_HEADER.is_match(trimmed))
        {
            let header_text = trimmed.trim_start_matches('#').trim().trim_end_matches(':');
            headers.push(HeaderMark { offset, text: header_text.to_string() });
        }
        offset += line.len();
    }
    headers
}

/// Snap a window end backward to the nearest whitespace within
/// [`WHITESPACE_SNAP_DISTANCE`] characters. Returns the original end when no
/// whitespace is close enough.
fn snap_to_whitespace(text: &str, end: usize, start: usize) -> usize {
    let floor = end.saturating_sub(WHITESPACE_SNAP_DISTANCE).max(start + 1);
    let bytes = text.as_bytes();
    let mut i = end;
    while i > floor {
        if bytes[i - 1].is_ascii_whitespace() {
            return i;
        }
        i -= 1;
    }
    end
}

/// Largest char boundary at or below `idx`.
fn floor_char_boundary(text: &str, mut idx: usize) -> usize {
    if idx >= text.len() {
        return text.len();
    }
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}
