//! Chunking engine: strategy behavior, overlap, headers, merging, and
//! document-level deduplication.

use ragkit::chunking::ChunkingEngine;
use ragkit::config::{ChunkingConfig, ChunkingStrategy};
use ragkit::types::{DocumentType, PageText};

/// `count` distinct five-character words: `w000 w001 ...`.
fn varied_text(count: usize) -> String {
    let mut text = String::with_capacity(count * 5);
    for i in 0..count {
        text.push_str(&format!("w{:03} ", i % 1000));
    }
    text
}

fn page(number: u32, text: impl Into<String>) -> PageText {
    PageText { page_number: number, text: text.into() }
}

#[test]
fn fixed_windows_step_by_target_minus_overlap() {
    // 3200 chars, window 1600 chars (400 tokens), overlap 240 chars
    // (60 tokens): starts at 0, 1360, 2720.
    let config = ChunkingConfig::builder()
        .strategy(ChunkingStrategy::Fixed)
        .target_chunk_size(400)
        .max_chunk_size(500)
        .min_chunk_size(50)
        .overlap_tokens(60)
        .chars_per_token(4)
        .build()
        .unwrap();
    let engine = ChunkingEngine::new(config);

    let text = varied_text(640);
    assert_eq!(text.len(), 3200);
    let output = engine.chunk_pages(&[page(1, text)]);

    assert_eq!(output.chunks.len(), 3);
    assert!(!output.chunks[0].is_overlap);
    assert!(output.chunks[1].is_overlap);
    assert!(output.chunks[2].is_overlap);
    for (index, chunk) in output.chunks.iter().enumerate() {
        assert_eq!(chunk.chunk_index, index as u32);
        assert_eq!(chunk.page_number, Some(1));
        assert!(chunk.token_count <= 400);
    }
    // The second window starts one step (1360 chars) in: word 272.
    assert!(output.chunks[1].text.starts_with("w272"));
    assert_eq!(output.stats.total_chunks, 3);
    assert_eq!(output.stats.duplicates_removed, 0);
}

#[test]
fn fixed_merges_a_short_tail_into_its_predecessor() {
    let config = ChunkingConfig::builder()
        .strategy(ChunkingStrategy::Fixed)
        .target_chunk_size(400)
        .max_chunk_size(500)
        .min_chunk_size(50)
        .overlap_tokens(20)
        .chars_per_token(4)
        .build()
        .unwrap();
    let engine = ChunkingEngine::new(config);

    // 1700 chars with a 1520-char step: the second window [1520, 1700)
    // is 45 tokens, under the 50-token minimum, so it folds into the
    // first chunk.
    let output = engine.chunk_pages(&[page(1, varied_text(340))]);
    assert_eq!(output.chunks.len(), 1);
    assert!(output.chunks[0].text.ends_with("w339"));
    assert!(output.chunks[0].token_count <= 500);
    assert!(!output.chunks[0].is_overlap);
}

#[test]
fn semantic_respects_max_size_and_sentence_boundaries() {
    let engine = ChunkingEngine::new(ChunkingConfig::for_document_type(DocumentType::Legal));

    let mut text = String::new();
    for i in 0..200 {
        text.push_str(&format!("Clause {i} obligates the receiving party to confidentiality. "));
    }
    let output = engine.chunk_pages(&[page(1, text)]);

    assert!(output.chunks.len() > 1);
    for chunk in &output.chunks {
        assert!(chunk.token_count as usize <= 600);
        assert!(chunk.text.ends_with('.'));
        assert!(!chunk.is_overlap);
    }
    // Overlap carries sentence tails: consecutive chunks share text.
    let first_tail = output.chunks[0].text.split(". ").last().unwrap_or("");
    assert!(output.chunks[1].text.contains(first_tail.trim_end_matches('.')));
}

#[test]
fn semantic_attaches_the_latest_header_before_each_chunk() {
    let config = ChunkingConfig::builder()
        .strategy(ChunkingStrategy::Semantic)
        .target_chunk_size(16)
        .max_chunk_size(20)
        .min_chunk_size(1)
        .overlap_tokens(0)
        .chars_per_token(4)
        .build()
        .unwrap();
    let engine = ChunkingEngine::new(config);

    let text = "# Intro\nAlpha alpha alpha. Beta beta beta. Gamma gamma gamma.\n\
                # Terms\nDelta delta delta. Epsilon epsilon epsilon.";
    let output = engine.chunk_pages(&[page(1, text)]);

    assert_eq!(output.chunks.len(), 2);
    assert_eq!(output.chunks[0].section_header.as_deref(), Some("Intro"));
    assert_eq!(output.chunks[1].section_header.as_deref(), Some("Terms"));
}

#[test]
fn hybrid_dispatches_per_page() {
    let engine = ChunkingEngine::new(ChunkingConfig::default());

    // Prose page: sentence boundaries, semantic path, no overlap flags.
    let prose: String =
        (0..80).map(|i| format!("Sentence number {i} describes the policy. ")).collect();
    // Raw page: no punctuation, fixed path, overlap flags after the first.
    let raw = varied_text(900);

    let output = engine.chunk_pages(&[page(1, prose), page(2, raw)]);
    let page_one: Vec<_> =
        output.chunks.iter().filter(|c| c.page_number == Some(1)).collect();
    let page_two: Vec<_> =
        output.chunks.iter().filter(|c| c.page_number == Some(2)).collect();

    assert!(!page_one.is_empty() && !page_two.is_empty());
    assert!(page_one.iter().all(|c| !c.is_overlap));
    assert!(page_two.len() > 1);
    assert!(page_two[1..].iter().all(|c| c.is_overlap));
}

#[test]
fn duplicate_chunks_are_dropped_and_reindexed() {
    let engine = ChunkingEngine::new(ChunkingConfig::default());
    let repeated = "This paragraph appears on every page of the document. \
                    It is boilerplate that should only be stored once.";

    let output = engine.chunk_pages(&[
        page(1, repeated),
        page(2, repeated),
        page(3, "A unique closing page with its own sentence. It differs."),
    ]);

    assert_eq!(output.stats.duplicates_removed, 1);
    assert_eq!(output.chunks.len(), 2);
    for (index, chunk) in output.chunks.iter().enumerate() {
        assert_eq!(chunk.chunk_index, index as u32);
    }
    // The surviving copy keeps the first page's number.
    assert_eq!(output.chunks[0].page_number, Some(1));
}

#[test]
fn empty_and_whitespace_pages_produce_nothing() {
    let engine = ChunkingEngine::new(ChunkingConfig::default());
    let output = engine.chunk_pages(&[page(1, ""), page(2, "   \n\t  ")]);
    assert!(output.chunks.is_empty());
    assert_eq!(output.stats.total_chunks, 0);
    assert_eq!(output.stats.average_tokens, 0.0);
}

#[test]
fn chunking_is_deterministic() {
    let engine = ChunkingEngine::new(ChunkingConfig::default());
    let pages = vec![
        page(1, "First page has sentences. Quite a few of them. Enough to chunk."),
        page(2, varied_text(500)),
    ];
    let first = engine.chunk_pages(&pages);
    let second = engine.chunk_pages(&pages);
    assert_eq!(first, second);
}

#[test]
fn document_type_presets_differ() {
    let id_config = ChunkingConfig::for_document_type(DocumentType::IdDocument);
    assert_eq!(id_config.strategy, ChunkingStrategy::Fixed);
    assert!(!id_config.preserve_sentences);
    assert!(id_config.target_chunk_size < ChunkingConfig::default().target_chunk_size);

    let legal = ChunkingConfig::for_document_type(DocumentType::Legal);
    assert_eq!(legal.strategy, ChunkingStrategy::Semantic);
    assert!(legal.overlap_tokens > ChunkingConfig::default().overlap_tokens);
}

#[test]
fn builder_rejects_inconsistent_sizes() {
    assert!(
        ChunkingConfig::builder().target_chunk_size(600).max_chunk_size(500).build().is_err()
    );
    assert!(
        ChunkingConfig::builder().overlap_tokens(400).target_chunk_size(400).build().is_err()
    );
    assert!(ChunkingConfig::builder().chars_per_token(0).build().is_err());
}
