//! In-memory vector store: search ordering, tenant isolation, and hybrid
//! scoring.

mod common;

use std::collections::HashMap;

use proptest::prelude::*;
use ragkit::config::SearchOptions;
use ragkit::inmemory::InMemoryVectorStore;
use ragkit::types::{EMBEDDING_DIM, NewChunk, text_hash};
use ragkit::vectorstore::VectorStore;

use common::{ORG_A, ORG_B, SOURCE_A, SOURCE_B, chunk_on_axis, unit_vector};

fn lenient(top_k: usize) -> SearchOptions {
    SearchOptions { top_k, min_score: -1.0, ..SearchOptions::default() }
}

/// A normalized embedding with weight on axis 0 of exactly `cosine`, so
/// its similarity against the axis-0 unit query is `cosine`.
fn vector_with_cosine(cosine: f32, perp_axis: usize) -> Vec<f32> {
    let mut v = vec![0.0; EMBEDDING_DIM];
    v[0] = cosine;
    v[perp_axis] = (1.0 - cosine * cosine).sqrt();
    v
}

fn chunk_with_embedding(org: &str, source: &str, text: &str, embedding: Vec<f32>) -> NewChunk {
    NewChunk {
        source_id: source.to_string(),
        organization_id: org.to_string(),
        text: text.to_string(),
        token_count: (text.len() as u32).div_ceil(4),
        chunk_index: 0,
        embedding,
        text_hash: text_hash(text),
        page_number: None,
        section_header: None,
        metadata: HashMap::new(),
    }
}

#[tokio::test]
async fn identical_vectors_score_near_one() {
    let store = InMemoryVectorStore::new();
    store.insert(&chunk_on_axis(ORG_A, SOURCE_A, "exact match", 0, 7)).await.unwrap();

    let results = store.search(ORG_A, &unit_vector(7), &lenient(5)).await.unwrap();
    assert_eq!(results.len(), 1);
    assert!((results[0].similarity - 1.0).abs() < 1e-5);
}

#[tokio::test]
async fn search_never_crosses_organizations() {
    let store = InMemoryVectorStore::new();
    // Same source id in both tenants; isolation must hold anyway.
    store.insert(&chunk_on_axis(ORG_A, SOURCE_A, "tenant a data", 0, 1)).await.unwrap();
    store.insert(&chunk_on_axis(ORG_B, SOURCE_A, "tenant b data", 0, 1)).await.unwrap();

    let results = store.search(ORG_A, &unit_vector(1), &lenient(10)).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].text, "tenant a data");

    assert_eq!(store.count_by_organization(ORG_A).await.unwrap(), 1);
    assert_eq!(store.count_by_organization(ORG_B).await.unwrap(), 1);

    // Deleting tenant A's source must not touch tenant B's rows.
    assert_eq!(store.delete_by_source(ORG_A, SOURCE_A).await.unwrap(), 1);
    assert_eq!(store.count_by_organization(ORG_B).await.unwrap(), 1);
}

#[tokio::test]
async fn soft_deleted_sources_are_hidden_from_search() {
    let store = InMemoryVectorStore::new();
    store.register_source(ORG_A, SOURCE_A, "Handbook").await.unwrap();
    store.insert(&chunk_on_axis(ORG_A, SOURCE_A, "vacation policy", 0, 3)).await.unwrap();

    assert!(store.soft_delete_source(ORG_A, SOURCE_A).await.unwrap());
    let results = store.search(ORG_A, &unit_vector(3), &lenient(5)).await.unwrap();
    assert!(results.is_empty());

    // The chunks themselves remain counted.
    assert_eq!(store.count_by_source(ORG_A, SOURCE_A).await.unwrap(), 1);
}

#[tokio::test]
async fn source_filter_restricts_results() {
    let store = InMemoryVectorStore::new();
    store.insert(&chunk_on_axis(ORG_A, SOURCE_A, "from source a", 0, 4)).await.unwrap();
    store.insert(&chunk_on_axis(ORG_A, SOURCE_B, "from source b", 0, 4)).await.unwrap();

    let options = SearchOptions {
        source_ids: Some(vec![SOURCE_B.to_string()]),
        min_score: -1.0,
        ..SearchOptions::default()
    };
    let results = store.search(ORG_A, &unit_vector(4), &options).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].source_id, SOURCE_B);
}

#[tokio::test]
async fn min_score_filters_after_top_k() {
    let store = InMemoryVectorStore::new();
    store
        .insert(&chunk_with_embedding(ORG_A, SOURCE_A, "close", vector_with_cosine(0.9, 1)))
        .await
        .unwrap();
    store
        .insert(&chunk_with_embedding(ORG_A, SOURCE_A, "far", vector_with_cosine(0.2, 2)))
        .await
        .unwrap();

    let options = SearchOptions { top_k: 10, min_score: 0.5, ..SearchOptions::default() };
    let results = store.search(ORG_A, &unit_vector(0), &options).await.unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].text, "close");
}

#[tokio::test]
async fn hybrid_weight_changes_the_winner() {
    let store = InMemoryVectorStore::new();
    // Ten distinct query tokens; "alpha" matches 2 of 10 (keyword 0.2)
    // with vector 0.9, "bravo" matches 9 of 10 (keyword 0.9) with
    // vector 0.5.
    let query = "t0 t1 t2 t3 t4 t5 t6 t7 t8 t9";
    store
        .insert(&chunk_with_embedding(ORG_A, SOURCE_A, "alpha t0 t1", vector_with_cosine(0.9, 1)))
        .await
        .unwrap();
    store
        .insert(&chunk_with_embedding(
            ORG_A,
            SOURCE_A,
            "bravo t0 t1 t2 t3 t4 t5 t6 t7 t8",
            vector_with_cosine(0.5, 2),
        ))
        .await
        .unwrap();

    let vector_heavy = SearchOptions {
        top_k: 5,
        min_score: -1.0,
        vector_weight: 0.7,
        ..SearchOptions::default()
    };
    let results = store
        .hybrid_search(ORG_A, query, &unit_vector(0), &vector_heavy)
        .await
        .unwrap();
    assert_eq!(results.len(), 2);
    assert!(results[0].result.text.starts_with("alpha"));
    assert!((results[0].final_score - 0.69).abs() < 1e-3);
    assert!((results[1].final_score - 0.62).abs() < 1e-3);

    let keyword_heavy = SearchOptions { vector_weight: 0.3, ..vector_heavy };
    let results = store
        .hybrid_search(ORG_A, query, &unit_vector(0), &keyword_heavy)
        .await
        .unwrap();
    assert!(results[0].result.text.starts_with("bravo"));
    assert!((results[0].final_score - 0.78).abs() < 1e-3);
    assert!((results[1].final_score - 0.41).abs() < 1e-3);
}

#[tokio::test]
async fn hybrid_keeps_vector_only_matches() {
    let store = InMemoryVectorStore::new();
    store
        .insert(&chunk_with_embedding(ORG_A, SOURCE_A, "no overlap here", vector_with_cosine(0.95, 1)))
        .await
        .unwrap();

    let options = SearchOptions { min_score: 0.5, ..SearchOptions::default() };
    let results = store
        .hybrid_search(ORG_A, "unrelated terms", &unit_vector(0), &options)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].keyword_score, 0.0);
    assert!((results[0].final_score - 0.95 * 0.7).abs() < 1e-3);
}

#[tokio::test]
async fn hybrid_surfaces_keyword_dominant_matches() {
    let store = InMemoryVectorStore::new();
    // Nearly orthogonal to the query vector; only the keyword side scores.
    store
        .insert(&chunk_with_embedding(
            ORG_A,
            SOURCE_A,
            "refund window lasts thirty days",
            vector_with_cosine(0.05, 1),
        ))
        .await
        .unwrap();

    let options = SearchOptions {
        min_score: 0.5,
        vector_weight: 0.3,
        ..SearchOptions::default()
    };
    let results = store
        .hybrid_search(ORG_A, "refund window lasts thirty days", &unit_vector(0), &options)
        .await
        .unwrap();
    assert_eq!(results.len(), 1);
    assert!((results[0].keyword_score - 1.0).abs() < 1e-5);
    assert!((results[0].final_score - (0.3 * 0.05 + 0.7 * 1.0)).abs() < 1e-3);
}

#[tokio::test]
async fn batch_insert_rejects_mixed_organizations() {
    let store = InMemoryVectorStore::new();
    let batch = vec![
        chunk_on_axis(ORG_A, SOURCE_A, "first", 0, 1),
        chunk_on_axis(ORG_B, SOURCE_A, "second", 1, 2),
    ];
    assert!(store.insert_batch(&batch).await.is_err());
    assert_eq!(store.count_by_organization(ORG_A).await.unwrap(), 0);
    assert_eq!(store.count_by_organization(ORG_B).await.unwrap(), 0);
}

#[tokio::test]
async fn duplicate_detection_is_scoped_to_source_and_tenant() {
    let store = InMemoryVectorStore::new();
    let chunk = chunk_on_axis(ORG_A, SOURCE_A, "same words", 0, 1);
    store.insert(&chunk).await.unwrap();

    assert!(store.has_duplicate(ORG_A, SOURCE_A, &chunk.text_hash).await.unwrap());
    assert!(!store.has_duplicate(ORG_A, SOURCE_B, &chunk.text_hash).await.unwrap());
    assert!(!store.has_duplicate(ORG_B, SOURCE_A, &chunk.text_hash).await.unwrap());
}

#[tokio::test]
async fn invalid_organization_id_is_rejected_before_io() {
    let store = InMemoryVectorStore::new();
    let err = store.search("not-a-uuid", &unit_vector(0), &lenient(5)).await.unwrap_err();
    assert_eq!(err.code(), "validation");
}

/// A sparse normalized embedding: weight spread over a few axes.
fn arb_embedding() -> impl Strategy<Value = Vec<f32>> {
    proptest::collection::vec((0usize..EMBEDDING_DIM, 0.1f32..1.0f32), 1..4).prop_map(|parts| {
        let mut v = vec![0.0f32; EMBEDDING_DIM];
        for (axis, weight) in parts {
            v[axis] += weight;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        for value in &mut v {
            *value /= norm;
        }
        v
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// Results come back ordered by descending similarity and bounded by
    /// `top_k`, for any stored set and query.
    #[test]
    fn search_orders_descending_and_bounds_top_k(
        embeddings in proptest::collection::vec(arb_embedding(), 1..12),
        query in arb_embedding(),
        top_k in 1usize..16,
    ) {
        let rt = tokio::runtime::Runtime::new().unwrap();
        let results = rt.block_on(async {
            let store = InMemoryVectorStore::new();
            for (index, embedding) in embeddings.iter().enumerate() {
                let mut chunk = chunk_on_axis(ORG_A, SOURCE_A, &format!("chunk {index}"), index as u32, 0);
                chunk.embedding = embedding.clone();
                store.insert(&chunk).await.unwrap();
            }
            store.search(ORG_A, &query, &lenient(top_k)).await.unwrap()
        });

        prop_assert!(results.len() <= top_k);
        prop_assert!(results.len() <= embeddings.len());
        for pair in results.windows(2) {
            prop_assert!(pair[0].similarity >= pair[1].similarity);
        }
    }
}
