//! Suggestion extraction: strategies, deduplication, ranking, and
//! per-field caching.

mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use ragkit::inmemory::InMemoryVectorStore;
use ragkit::suggest::{SuggestionExtractor, SuggestionRequest};
use ragkit::types::{ExtractionMethod, FieldType, NewChunk, text_hash};
use ragkit::vectorstore::VectorStore;

use common::{DeterministicProvider, ORG_A, SOURCE_A, fast_config, generator_with, text_vector};

fn chunk_with(org: &str, source: &str, text: &str, embedding: Vec<f32>) -> NewChunk {
    NewChunk {
        source_id: source.to_string(),
        organization_id: org.to_string(),
        text: text.to_string(),
        token_count: (text.len() as u32).div_ceil(4),
        chunk_index: 0,
        embedding,
        text_hash: text_hash(text),
        page_number: Some(1),
        section_header: None,
        metadata: HashMap::new(),
    }
}

/// A vector close to `text_vector(query)` with the given cosine.
fn near_query(query: &str, cosine: f32) -> Vec<f32> {
    let mut v = text_vector(query);
    let axis = v.iter().position(|&x| x > 0.0).unwrap();
    v[axis] = cosine;
    let perp = (axis + 1) % v.len();
    v[perp] = (1.0 - cosine * cosine).sqrt();
    v
}

fn extractor(store: Arc<InMemoryVectorStore>) -> SuggestionExtractor {
    let generator =
        Arc::new(generator_with(vec![Arc::new(DeterministicProvider::default())], fast_config()));
    SuggestionExtractor::new(generator, store)
}

#[tokio::test]
async fn email_pattern_extraction() {
    let store = Arc::new(InMemoryVectorStore::new());
    store.register_source(ORG_A, SOURCE_A, "Employee Records").await.unwrap();
    store
        .insert(&chunk_with(
            ORG_A,
            SOURCE_A,
            "Contact us at john.doe@example.com for support.",
            text_vector("email address"),
        ))
        .await
        .unwrap();

    let extractor = extractor(Arc::clone(&store));
    let suggestions =
        extractor.suggest(ORG_A, &SuggestionRequest::new("email")).await.unwrap();

    assert_eq!(suggestions.len(), 1);
    assert_eq!(suggestions[0].value, "john.doe@example.com");
    assert_eq!(suggestions[0].extraction_method, ExtractionMethod::Regex);
    assert_eq!(suggestions[0].source_title, "Employee Records");
    assert!((suggestions[0].confidence - 0.9).abs() < 1e-3);
}

#[tokio::test]
async fn duplicate_values_keep_the_highest_confidence() {
    let store = Arc::new(InMemoryVectorStore::new());
    // The same name extracted twice: once semantically from a perfect
    // match, once contextually from a weaker one.
    store
        .insert(&chunk_with(
            ORG_A,
            SOURCE_A,
            "Full name: John Doe",
            text_vector("full name"),
        ))
        .await
        .unwrap();
    store
        .insert(&chunk_with(
            ORG_A,
            SOURCE_A,
            "Mr. John Doe attended the meeting.",
            near_query("full name", 0.8),
        ))
        .await
        .unwrap();

    let extractor = extractor(store);
    let request = SuggestionRequest::new("fullName").with_field_type(FieldType::Name);
    let suggestions = extractor.suggest(ORG_A, &request).await.unwrap();

    let johns: Vec<_> =
        suggestions.iter().filter(|s| s.value.eq_ignore_ascii_case("john doe")).collect();
    assert_eq!(johns.len(), 1);
    // Semantic at similarity 1.0 (0.85) beats context at 0.8 (0.6).
    assert!((johns[0].confidence - 0.85).abs() < 1e-3);
    assert_eq!(johns[0].extraction_method, ExtractionMethod::Semantic);
}

#[tokio::test]
async fn suggestions_are_capped_and_sorted_descending() {
    let store = Arc::new(InMemoryVectorStore::new());
    store
        .insert(&chunk_with(
            ORG_A,
            SOURCE_A,
            "a@x.com b@x.com c@x.com d@x.com e@x.com f@x.com g@x.com",
            text_vector("email address"),
        ))
        .await
        .unwrap();

    let extractor = extractor(store);
    let suggestions =
        extractor.suggest(ORG_A, &SuggestionRequest::new("email")).await.unwrap();

    assert_eq!(suggestions.len(), 5);
    for pair in suggestions.windows(2) {
        assert!(pair[0].confidence >= pair[1].confidence);
    }
}

#[tokio::test]
async fn date_fields_match_all_three_formats() {
    let store = Arc::new(InMemoryVectorStore::new());
    store
        .insert(&chunk_with(
            ORG_A,
            SOURCE_A,
            "Issued 01/15/2024, renewed 2024-06-01, expires March 3, 2025.",
            text_vector("date of birth"),
        ))
        .await
        .unwrap();

    let extractor = extractor(store);
    let suggestions = extractor
        .suggest(ORG_A, &SuggestionRequest::new("dateOfBirth"))
        .await
        .unwrap();

    let values: Vec<&str> = suggestions.iter().map(|s| s.value.as_str()).collect();
    assert!(values.contains(&"01/15/2024"));
    assert!(values.contains(&"2024-06-01"));
    assert!(values.contains(&"March 3, 2025"));
}

#[tokio::test]
async fn acronym_fields_match_labeled_values() {
    let store = Arc::new(InMemoryVectorStore::new());
    store.register_source(ORG_A, SOURCE_A, "Loan Terms").await.unwrap();
    // No synonym entry and no type patterns for this field; the labeled
    // phrasing only matches if the acronym survives humanization whole.
    store
        .insert(&chunk_with(ORG_A, SOURCE_A, "APR: 5.9 percent fixed", text_vector("apr")))
        .await
        .unwrap();

    let extractor = extractor(store);
    let suggestions = extractor.suggest(ORG_A, &SuggestionRequest::new("APR")).await.unwrap();

    assert_eq!(suggestions.len(), 1);
    assert_eq!(suggestions[0].value, "5.9 percent fixed");
    assert_eq!(suggestions[0].extraction_method, ExtractionMethod::Semantic);
}

#[tokio::test]
async fn results_are_cached_per_field() {
    let store = Arc::new(InMemoryVectorStore::new());
    store
        .insert(&chunk_with(
            ORG_A,
            SOURCE_A,
            "Reach me at someone@example.org today.",
            text_vector("email address"),
        ))
        .await
        .unwrap();

    let provider = Arc::new(DeterministicProvider::default());
    let generator = Arc::new(generator_with(vec![provider.clone()], fast_config()));
    let cache = Arc::new(ragkit::cache::InMemoryCache::new());
    let extractor =
        SuggestionExtractor::new(generator, store).with_cache(cache);

    let request = SuggestionRequest::new("email");
    let first = extractor.suggest(ORG_A, &request).await.unwrap();
    let calls_after_first = provider.calls.load(Ordering::SeqCst);
    assert!(calls_after_first > 0);

    let second = extractor.suggest(ORG_A, &request).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(provider.calls.load(Ordering::SeqCst), calls_after_first);

    // Invalidation forces recomputation.
    extractor.invalidate_organization(ORG_A).await.unwrap();
    extractor.suggest(ORG_A, &request).await.unwrap();
    assert!(provider.calls.load(Ordering::SeqCst) > calls_after_first);
}

#[tokio::test]
async fn batch_preserves_request_order() {
    let store = Arc::new(InMemoryVectorStore::new());
    store
        .insert(&chunk_with(
            ORG_A,
            SOURCE_A,
            "Email: support@example.com Phone: 555-123-4567",
            text_vector("email address"),
        ))
        .await
        .unwrap();
    store
        .insert(&chunk_with(
            ORG_A,
            SOURCE_A,
            "Call 555-123-4567 to reach the phone number on file.",
            text_vector("phone number"),
        ))
        .await
        .unwrap();

    let extractor = extractor(store);
    let requests =
        vec![SuggestionRequest::new("email"), SuggestionRequest::new("phoneNumber")];
    let results = extractor.suggest_batch(ORG_A, &requests).await.unwrap();

    assert_eq!(results.len(), 2);
    assert!(results[0].iter().any(|s| s.value == "support@example.com"));
    assert!(results[1].iter().any(|s| s.value.contains("555-123-4567")));
}

#[tokio::test]
async fn filled_values_steer_the_contextual_query() {
    let store = Arc::new(InMemoryVectorStore::new());
    // Only reachable through the context-augmented query.
    store
        .insert(&chunk_with(
            ORG_A,
            SOURCE_A,
            "Last name: Doe",
            text_vector("firstName John last name"),
        ))
        .await
        .unwrap();

    let extractor = extractor(store);
    let mut filled = HashMap::new();
    filled.insert("firstName".to_string(), "John".to_string());

    let suggestions = extractor
        .suggest_with_values(ORG_A, &SuggestionRequest::new("lastName"), &filled)
        .await
        .unwrap();
    assert!(suggestions.iter().any(|s| s.value == "Doe"));
}

#[tokio::test]
async fn invalid_organization_is_rejected() {
    let extractor = extractor(Arc::new(InMemoryVectorStore::new()));
    let err =
        extractor.suggest("nope", &SuggestionRequest::new("email")).await.unwrap_err();
    assert_eq!(err.code(), "validation");
}
