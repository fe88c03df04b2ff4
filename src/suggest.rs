//! Suggestion extractor: turns search results into ranked field-value
//! candidates.
//!
//! For a target field name, the extractor generates a small set of search
//! queries (synonyms, a humanized form, context and type augmentation),
//! retrieves matching chunks through the embedding generator and vector
//! store, and applies three extraction strategies per result:
//!
//! - *pattern* — field-type-specific regular expressions, confidence
//!   `similarity * 0.9`
//! - *semantic* — `"<field>: value"` / `"value is <field>"` phrasings,
//!   confidence `similarity * 0.85`
//! - *context* — field-specific heuristics (titles before names, state
//!   codes before zips), confidence `similarity * 0.75`
//!
//! Candidates are deduplicated case-insensitively (highest confidence
//! wins), floored at 0.3 confidence, and ranked descending.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::LazyLock;
use std::time::Duration;

use futures::StreamExt;
use regex::Regex;
use tracing::{debug, warn};

use crate::cache::KeyValueCache;
use crate::config::SearchOptions;
use crate::error::{Result, RetrievalError};
use crate::generator::EmbeddingGenerator;
use crate::types::{
    ExtractionMethod, FieldSuggestion, FieldType, SearchResult, validate_uuid,
};
use crate::vectorstore::VectorStore;

/// Queries generated per field, to bound embedding API usage.
const MAX_QUERIES: usize = 3;

/// Suggestions returned per field by default.
const DEFAULT_MAX_SUGGESTIONS: usize = 5;

/// Suggestions below this confidence are dropped.
const MIN_CONFIDENCE: f32 = 0.3;

/// Confidence multipliers per strategy.
const PATTERN_WEIGHT: f32 = 0.9;
const SEMANTIC_WEIGHT: f32 = 0.85;
const CONTEXT_WEIGHT: f32 = 0.75;

static EMAIL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap());
static PHONE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\(?\d{3}\)?[-.\s]?\d{3}[-.\s]?\d{4}").unwrap());
static DATE_SLASH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{1,2}/\d{1,2}/\d{2,4}\b").unwrap());
static DATE_ISO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{4}-\d{2}-\d{2}\b").unwrap());
static DATE_WRITTEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\b(?:January|February|March|April|May|June|July|August|September|October|November|December)\s+\d{1,2},?\s+\d{4}\b",
    )
    .unwrap()
});
static SSN_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap());
static ZIP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{5}(?:-\d{4})?\b").unwrap());
static CURRENCY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$[\d,]+(?:\.\d{2})?").unwrap());
static PERCENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+(?:\.\d+)?%").unwrap());
static NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d+(?:\.\d+)?\b").unwrap());

/// Titled person name: `Dr. Jane Doe`.
static TITLED_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b(?:Mr|Mrs|Ms|Dr|Prof)\.?\s+([A-Z][a-z]+(?:\s+[A-Z][a-z]+)+)").unwrap()
});
/// City, two-letter state code, five-digit zip.
static STATE_ZIP_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([A-Z][A-Za-z .]+,\s*[A-Z]{2}\s+\d{5}(?:-\d{4})?)\b").unwrap()
});

/// Synonym table keyed by the compacted field name (lowercase, separators
/// removed).
static SYNONYMS: LazyLock<HashMap<&'static str, &'static [&'static str]>> = LazyLock::new(|| {
    let mut map: HashMap<&'static str, &'static [&'static str]> = HashMap::new();
    map.insert("firstname", &["first name", "given name", "forename"]);
    map.insert("lastname", &["last name", "family name", "surname"]);
    map.insert("fullname", &["full name", "complete name"]);
    map.insert("email", &["email address", "e-mail"]);
    map.insert("emailaddress", &["email address", "e-mail"]);
    map.insert("phone", &["phone number", "telephone", "mobile number"]);
    map.insert("phonenumber", &["phone number", "telephone", "mobile number"]);
    map.insert("dateofbirth", &["date of birth", "birth date", "dob"]);
    map.insert("dob", &["date of birth", "birth date"]);
    map.insert("address", &["street address", "mailing address"]);
    map.insert("zipcode", &["zip code", "postal code"]);
    map.insert("ssn", &["social security number"]);
    map.insert("salary", &["salary", "annual income"]);
    map.insert("company", &["company name", "employer"]);
    map
});

/// A field to suggest values for.
#[derive(Debug, Clone, PartialEq)]
pub struct SuggestionRequest {
    /// The target field name, e.g. `firstName`.
    pub field_name: String,
    /// Value type, when the form declares one. Inferred from the field
    /// name otherwise.
    pub field_type: Option<FieldType>,
    /// Free-text context to fold into query generation.
    pub context: Option<String>,
}

impl SuggestionRequest {
    /// A request with just a field name.
    pub fn new(field_name: impl Into<String>) -> Self {
        Self { field_name: field_name.into(), field_type: None, context: None }
    }

    /// Set the declared field type.
    pub fn with_field_type(mut self, field_type: FieldType) -> Self {
        self.field_type = Some(field_type);
        self
    }

    /// Set the query context.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

/// Produces ranked field-value candidates from the organization's
/// knowledge base.
pub struct SuggestionExtractor {
    generator: Arc<EmbeddingGenerator>,
    store: Arc<dyn VectorStore>,
    cache: Option<Arc<dyn KeyValueCache>>,
    max_suggestions: usize,
    cache_ttl: Duration,
}

impl SuggestionExtractor {
    /// Create an extractor over the given generator and store.
    pub fn new(generator: Arc<EmbeddingGenerator>, store: Arc<dyn VectorStore>) -> Self {
        Self {
            generator,
            store,
            cache: None,
            max_suggestions: DEFAULT_MAX_SUGGESTIONS,
            cache_ttl: Duration::from_secs(300),
        }
    }

    /// Cache per-field suggestion results in the given backend.
    pub fn with_cache(mut self, cache: Arc<dyn KeyValueCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Override how many suggestions are returned per field.
    pub fn with_max_suggestions(mut self, max: usize) -> Self {
        self.max_suggestions = max.max(1);
        self
    }

    /// Suggest values for one field.
    pub async fn suggest(
        &self,
        organization_id: &str,
        request: &SuggestionRequest,
    ) -> Result<Vec<FieldSuggestion>> {
        validate_uuid(organization_id, "organization_id")?;

        let cache_key = self.cache_key(organization_id, request);
        if let Some(cached) = self.cache_lookup(&cache_key).await {
            return Ok(cached);
        }

        let field_type = request
            .field_type
            .or_else(|| infer_field_type(&request.field_name));
        let humanized = humanize_field_name(&request.field_name);
        let queries = generate_queries(&request.field_name, &humanized, field_type, request.context.as_deref());
        debug!(field = %request.field_name, query_count = queries.len(), "generated suggestion queries");

        let options = SearchOptions { top_k: 10, min_score: 0.5, ..SearchOptions::default() };
        let mut candidates: Vec<FieldSuggestion> = Vec::new();
        for query in &queries {
            let embedding = match self.generator.generate(organization_id, query).await {
                Ok(generated) => generated.embedding,
                Err(e @ RetrievalError::QuotaExceeded { .. }) => return Err(e),
                Err(e) => {
                    warn!(query, error = %e, "suggestion query embedding failed; skipping");
                    continue;
                }
            };
            let results = self.store.search(organization_id, &embedding, &options).await?;
            for result in &results {
                extract_candidates(result, &humanized, field_type, &mut candidates);
            }
        }

        let ranked = rank_suggestions(candidates, self.max_suggestions);
        self.cache_store(&cache_key, &ranked).await;
        Ok(ranked)
    }

    /// Resolve suggestions for many fields concurrently. Each field is
    /// processed (and cached) independently; one field's failure fails the
    /// whole call so partial results never masquerade as complete ones.
    pub async fn suggest_batch(
        &self,
        organization_id: &str,
        requests: &[SuggestionRequest],
    ) -> Result<Vec<Vec<FieldSuggestion>>> {
        validate_uuid(organization_id, "organization_id")?;
        let mut outcomes: Vec<(usize, Result<Vec<FieldSuggestion>>)> =
            futures::stream::iter(requests.iter().enumerate().map(|(index, request)| async move {
                (index, self.suggest(organization_id, request).await)
            }))
            .buffer_unordered(4)
            .collect()
            .await;
        outcomes.sort_by_key(|(index, _)| *index);

        let mut results = Vec::with_capacity(outcomes.len());
        for (_, outcome) in outcomes {
            results.push(outcome?);
        }
        Ok(results)
    }

    /// Contextual variant: folds already-filled field values into the
    /// query context before running the same pipeline.
    pub async fn suggest_with_values(
        &self,
        organization_id: &str,
        request: &SuggestionRequest,
        filled: &HashMap<String, String>,
    ) -> Result<Vec<FieldSuggestion>> {
        if filled.is_empty() {
            return self.suggest(organization_id, request).await;
        }
        let mut pairs: Vec<String> =
            filled.iter().map(|(name, value)| format!("{name} {value}")).collect();
        pairs.sort();
        let folded = match &request.context {
            Some(context) => format!("{context} {}", pairs.join(" ")),
            None => pairs.join(" "),
        };
        let contextual = SuggestionRequest {
            field_name: request.field_name.clone(),
            field_type: request.field_type,
            context: Some(folded),
        };
        self.suggest(organization_id, &contextual).await
    }

    /// Drop cached suggestions for an organization. Called on document
    /// mutations, like the search cache.
    pub async fn invalidate_organization(&self, organization_id: &str) -> Result<u64> {
        match &self.cache {
            Some(cache) => cache.remove_prefix(&format!("suggest:{organization_id}:")).await,
            None => Ok(0),
        }
    }

    fn cache_key(&self, organization_id: &str, request: &SuggestionRequest) -> String {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(request.field_name.as_bytes());
        hasher.update(b"|");
        if let Some(ft) = request.field_type {
            hasher.update(format!("{ft:?}").as_bytes());
        }
        hasher.update(b"|");
        if let Some(context) = &request.context {
            hasher.update(context.as_bytes());
        }
        let digest = hasher.finalize();
        format!("suggest:{organization_id}:{digest:x}")
    }

    async fn cache_lookup(&self, key: &str) -> Option<Vec<FieldSuggestion>> {
        let cache = self.cache.as_ref()?;
        match cache.get(key).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "suggestion cache read failed; treating as miss");
                None
            }
        }
    }

    async fn cache_store(&self, key: &str, suggestions: &[FieldSuggestion]) {
        let Some(cache) = self.cache.as_ref() else { return };
        if let Ok(raw) = serde_json::to_string(suggestions)
            && let Err(e) = cache.set(key, &raw, self.cache_ttl).await
        {
            warn!(error = %e, "suggestion cache write failed");
        }
    }
}

/// Humanize a field name: spaces at word boundaries, separators to spaces,
/// lowercased. `firstName` and `first_name` both become `first name`;
/// uppercase runs stay together, so `employeeSSN` becomes `employee ssn`.
pub fn humanize_field_name(field_name: &str) -> String {
    let chars: Vec<char> = field_name.chars().collect();
    let mut out = String::with_capacity(field_name.len() + 4);
    for (i, &c) in chars.iter().enumerate() {
        if matches!(c, '_' | '-' | '.') {
            out.push(' ');
        } else if c.is_uppercase() {
            let after_lower = i > 0 && chars[i - 1].is_lowercase();
            let run_ends = i > 0
                && chars[i - 1].is_uppercase()
                && chars.get(i + 1).is_some_and(|next| next.is_lowercase());
            if (after_lower || run_ends) && !out.is_empty() && !out.ends_with(' ') {
                out.push(' ');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(c);
        }
    }
    out.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn compact(field_name: &str) -> String {
    field_name.chars().filter(|c| c.is_alphanumeric()).collect::<String>().to_lowercase()
}

/// Guess a field type from the field name when the form does not declare
/// one.
pub fn infer_field_type(field_name: &str) -> Option<FieldType> {
    let compacted = compact(field_name);
    if compacted.contains("email") {
        Some(FieldType::Email)
    } else if compacted.contains("phone") || compacted.contains("mobile") || compacted.contains("fax") {
        Some(FieldType::Phone)
    } else if compacted.contains("date") || compacted == "dob" {
        Some(FieldType::Date)
    } else if compacted.contains("salary")
        || compacted.contains("amount")
        || compacted.contains("price")
        || compacted.contains("income")
    {
        Some(FieldType::Currency)
    } else if compacted.contains("address") {
        Some(FieldType::Address)
    } else if compacted.contains("name") {
        Some(FieldType::Name)
    } else if compacted.contains("zip") || compacted.contains("postal") {
        Some(FieldType::Address)
    } else if compacted.contains("number") || compacted.contains("count") {
        Some(FieldType::Number)
    } else {
        None
    }
}

/// Build at most [`MAX_QUERIES`] search queries for a field: a
/// context-augmented query first when context exists, then synonyms and
/// the humanized name, then a type-specific query.
fn generate_queries(
    field_name: &str,
    humanized: &str,
    field_type: Option<FieldType>,
    context: Option<&str>,
) -> Vec<String> {
    let mut queries: Vec<String> = Vec::new();
    let mut push = |q: String| {
        if !q.trim().is_empty() && !queries.iter().any(|existing| existing == &q) {
            queries.push(q);
        }
    };

    if let Some(context) = context {
        push(format!("{context} {humanized}"));
    }
    if let Some(synonyms) = SYNONYMS.get(compact(field_name).as_str()) {
        for synonym in *synonyms {
            push((*synonym).to_string());
        }
    }
    push(humanized.to_string());
    if let Some(ft) = field_type {
        let typed = match ft {
            FieldType::Date => format!("date {humanized}"),
            FieldType::Email => "email address".to_string(),
            FieldType::Phone => "phone number".to_string(),
            FieldType::Currency => format!("amount {humanized}"),
            FieldType::Address => format!("address {humanized}"),
            FieldType::Name => format!("name {humanized}"),
            FieldType::Number => format!("number {humanized}"),
            FieldType::Text => humanized.to_string(),
        };
        push(typed);
    }

    queries.truncate(MAX_QUERIES);
    queries
}

/// Patterns applied by the pattern strategy for a field.
fn patterns_for(field_type: Option<FieldType>, compacted_name: &str) -> Vec<&'static Regex> {
    let mut patterns: Vec<&'static Regex> = Vec::new();
    match field_type {
        Some(FieldType::Email) => patterns.push(&EMAIL_RE),
        Some(FieldType::Phone) => patterns.push(&PHONE_RE),
        Some(FieldType::Date) => {
            patterns.extend([&*DATE_SLASH_RE, &*DATE_ISO_RE, &*DATE_WRITTEN_RE])
        }
        Some(FieldType::Currency) => patterns.extend([&*CURRENCY_RE, &*PERCENT_RE]),
        Some(FieldType::Number) => patterns.extend([&*PERCENT_RE, &*NUMBER_RE]),
        Some(FieldType::Address) => patterns.push(&ZIP_RE),
        _ => {}
    }
    if compacted_name.contains("ssn") || compacted_name.contains("socialsecurity") {
        patterns.push(&SSN_RE);
    }
    if compacted_name.contains("zip") || compacted_name.contains("postal") {
        patterns.push(&ZIP_RE);
    }
    patterns
}

/// Run the three extraction strategies against one search result.
fn extract_candidates(
    result: &SearchResult,
    humanized: &str,
    field_type: Option<FieldType>,
    out: &mut Vec<FieldSuggestion>,
) {
    let compacted = compact(humanized);

    // Pattern strategy.
    for pattern in patterns_for(field_type, &compacted) {
        for found in pattern.find_iter(&result.text) {
            out.push(FieldSuggestion {
                value: found.as_str().trim().to_string(),
                confidence: result.similarity * PATTERN_WEIGHT,
                source_chunk_id: result.chunk_id.clone(),
                source_title: result.source_title.clone(),
                extraction_method: ExtractionMethod::Regex,
                matched_text: None,
            });
        }
    }

    // Semantic strategy: "<field>: value" and "value is/are/was/were <field>".
    let escaped = regex::escape(humanized);
    if let Ok(labeled) = Regex::new(&format!(r"(?i)\b{escaped}\s*[:\-]\s*([^\n]+)")) {
        for captures in labeled.captures_iter(&result.text) {
            push_semantic(result, &captures, out);
        }
    }
    if let Ok(stated) = Regex::new(&format!(
        r"(?i)([^\n.]+?)\s+(?:is|are|was|were)\s+(?:the\s+)?{escaped}\b"
    )) {
        for captures in stated.captures_iter(&result.text) {
            push_semantic(result, &captures, out);
        }
    }

    // Context strategy: field-specific heuristics.
    match field_type {
        Some(FieldType::Name) => {
            for captures in TITLED_NAME_RE.captures_iter(&result.text) {
                if let Some(name) = captures.get(1) {
                    out.push(FieldSuggestion {
                        value: name.as_str().trim().to_string(),
                        confidence: result.similarity * CONTEXT_WEIGHT,
                        source_chunk_id: result.chunk_id.clone(),
                        source_title: result.source_title.clone(),
                        extraction_method: ExtractionMethod::Context,
                        matched_text: captures.get(0).map(|m| m.as_str().to_string()),
                    });
                }
            }
        }
        Some(FieldType::Address) => {
            for captures in STATE_ZIP_RE.captures_iter(&result.text) {
                if let Some(address) = captures.get(1) {
                    out.push(FieldSuggestion {
                        value: address.as_str().trim().to_string(),
                        confidence: result.similarity * CONTEXT_WEIGHT,
                        source_chunk_id: result.chunk_id.clone(),
                        source_title: result.source_title.clone(),
                        extraction_method: ExtractionMethod::Context,
                        matched_text: None,
                    });
                }
            }
        }
        _ => {}
    }
}

fn push_semantic(result: &SearchResult, captures: &regex::Captures<'_>, out: &mut Vec<FieldSuggestion>) {
    let Some(m) = captures.get(1) else { return };
    let value = m.as_str().trim();
    // Too-short or too-long captures are noise, not values.
    if value.len() < 2 || value.len() > 200 {
        return;
    }
    out.push(FieldSuggestion {
        value: value.to_string(),
        confidence: result.similarity * SEMANTIC_WEIGHT,
        source_chunk_id: result.chunk_id.clone(),
        source_title: result.source_title.clone(),
        extraction_method: ExtractionMethod::Semantic,
        matched_text: captures.get(0).map(|m| m.as_str().trim().to_string()),
    });
}

/// Deduplicate by case-insensitive trimmed value (keeping the
/// highest-confidence instance), drop anything under the confidence floor,
/// sort descending, and cap at `max`.
fn rank_suggestions(candidates: Vec<FieldSuggestion>, max: usize) -> Vec<FieldSuggestion> {
    let mut best: HashMap<String, FieldSuggestion> = HashMap::new();
    for candidate in candidates {
        if candidate.confidence < MIN_CONFIDENCE {
            continue;
        }
        let key = candidate.value.trim().to_lowercase();
        match best.get(&key) {
            Some(existing) if existing.confidence >= candidate.confidence => {}
            _ => {
                best.insert(key, candidate);
            }
        }
    }
    let mut ranked: Vec<FieldSuggestion> = best.into_values().collect();
    ranked.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.value.cmp(&b.value))
    });
    ranked.truncate(max);
    ranked
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn humanize_splits_camel_case_and_separators() {
        assert_eq!(humanize_field_name("firstName"), "first name");
        assert_eq!(humanize_field_name("first_name"), "first name");
        assert_eq!(humanize_field_name("date-of-birth"), "date of birth");
    }

    #[test]
    fn humanize_keeps_acronyms_whole() {
        assert_eq!(humanize_field_name("SSN"), "ssn");
        assert_eq!(humanize_field_name("employeeSSN"), "employee ssn");
        assert_eq!(humanize_field_name("SSNNumber"), "ssn number");
    }

    #[test]
    fn queries_are_capped_and_deduped() {
        let humanized = humanize_field_name("firstName");
        let queries = generate_queries("firstName", &humanized, Some(FieldType::Name), None);
        assert!(queries.len() <= MAX_QUERIES);
        assert_eq!(queries[0], "first name");
        let unique: std::collections::HashSet<&String> = queries.iter().collect();
        assert_eq!(unique.len(), queries.len());
    }

    #[test]
    fn context_query_comes_first() {
        let humanized = humanize_field_name("email");
        let queries = generate_queries("email", &humanized, None, Some("employment application"));
        assert_eq!(queries[0], "employment application email");
    }

    #[test]
    fn field_type_inference_matches_names() {
        assert_eq!(infer_field_type("workEmail"), Some(FieldType::Email));
        assert_eq!(infer_field_type("dateOfBirth"), Some(FieldType::Date));
        assert_eq!(infer_field_type("annualSalary"), Some(FieldType::Currency));
        assert_eq!(infer_field_type("mysteryField"), None);
    }
}
