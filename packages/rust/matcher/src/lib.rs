//! TF-IDF text similarity for labelling generated content.
//!
//! A query is scored against candidate texts in a TF-IDF space built from
//! the candidates plus the query itself. Only matches strictly above the
//! acceptance threshold are returned. Everything here is synchronous and
//! deterministic: equal scores resolve to the earliest candidate.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::LazyLock;

use postforge_shared::Candidate;
use regex::Regex;

/// Minimum cosine similarity a match must exceed.
pub const DEFAULT_THRESHOLD: f64 = 0.1;

/// Anything that can pick labels for a piece of text.
///
/// The pipeline only depends on this trait, so tests can swap in a
/// counting implementation.
pub trait LabelMatcher: Send + Sync {
    /// Up to `k` candidate ids above the threshold, best first.
    fn top_matches(&self, query: &str, candidates: &[Candidate], k: usize) -> Vec<String>;

    /// The single best candidate id, if any scores above the threshold.
    fn best_match(&self, query: &str, candidates: &[Candidate]) -> Option<String> {
        self.top_matches(query, candidates, 1).into_iter().next()
    }
}

/// The default [`LabelMatcher`]: TF-IDF vectors with cosine similarity.
#[derive(Debug, Clone, Copy)]
pub struct TfIdfMatcher {
    threshold: f64,
}

impl TfIdfMatcher {
    pub fn new() -> Self {
        Self {
            threshold: DEFAULT_THRESHOLD,
        }
    }

    pub fn with_threshold(threshold: f64) -> Self {
        Self { threshold }
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }
}

impl Default for TfIdfMatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl LabelMatcher for TfIdfMatcher {
    fn top_matches(&self, query: &str, candidates: &[Candidate], k: usize) -> Vec<String> {
        if candidates.is_empty() || k == 0 {
            return Vec::new();
        }
        let texts: Vec<String> = candidates.iter().map(candidate_text).collect();
        let ranked = rank(query, &texts, self.threshold, k);
        tracing::trace!(candidates = candidates.len(), matched = ranked.len(), "label match");
        ranked
            .into_iter()
            .map(|(idx, _)| candidates[idx].id.clone())
            .collect()
    }
}

/// The text a candidate is indexed by: its name followed by its description.
pub fn candidate_text(candidate: &Candidate) -> String {
    if candidate.description.is_empty() {
        candidate.name.clone()
    } else {
        format!("{} {}", candidate.name, candidate.description)
    }
}

/// Indices and scores of the `k` best documents scoring above `threshold`.
pub fn rank<S: AsRef<str>>(
    query: &str,
    documents: &[S],
    threshold: f64,
    k: usize,
) -> Vec<(usize, f64)> {
    let mut scored: Vec<(usize, f64)> = similarity_scores(query, documents)
        .into_iter()
        .enumerate()
        .filter(|(_, score)| *score > threshold)
        .collect();
    // stable sort keeps ties in input order
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal));
    scored.truncate(k);
    scored
}

/// Cosine similarity of `query` against each document, in input order.
pub fn similarity_scores<S: AsRef<str>>(query: &str, documents: &[S]) -> Vec<f64> {
    let query_tokens = tokenize(query);
    let doc_tokens: Vec<Vec<String>> = documents.iter().map(|d| tokenize(d.as_ref())).collect();

    let total = doc_tokens.len() + 1;
    let mut doc_freq: HashMap<&str, usize> = HashMap::new();
    for tokens in std::iter::once(&query_tokens).chain(doc_tokens.iter()) {
        let mut seen: Vec<&str> = tokens.iter().map(String::as_str).collect();
        seen.sort_unstable();
        seen.dedup();
        for term in seen {
            *doc_freq.entry(term).or_default() += 1;
        }
    }

    let idf = |term: &str| -> f64 {
        let df = doc_freq.get(term).copied().unwrap_or(0) as f64;
        ((1.0 + total as f64) / (1.0 + df)).ln() + 1.0
    };

    let query_vec = weigh(&query_tokens, &idf);
    doc_tokens
        .iter()
        .map(|tokens| dot(&query_vec, &weigh(tokens, &idf)))
        .collect()
}

/// L2-normalised tf-idf vector for one token list.
fn weigh<'a>(tokens: &'a [String], idf: &impl Fn(&str) -> f64) -> HashMap<&'a str, f64> {
    let mut tf: HashMap<&str, f64> = HashMap::new();
    for t in tokens {
        *tf.entry(t.as_str()).or_default() += 1.0;
    }
    for (term, weight) in tf.iter_mut() {
        *weight *= idf(term);
    }
    let norm = tf.values().map(|w| w * w).sum::<f64>().sqrt();
    if norm > 0.0 {
        for weight in tf.values_mut() {
            *weight /= norm;
        }
    }
    tf
}

fn dot(a: &HashMap<&str, f64>, b: &HashMap<&str, f64>) -> f64 {
    let (small, large) = if a.len() <= b.len() { (a, b) } else { (b, a) };
    small
        .iter()
        .filter_map(|(term, w)| large.get(term).map(|v| w * v))
        .sum()
}

/// Lowercased word tokens of two or more characters, stop words removed.
pub fn tokenize(text: &str) -> Vec<String> {
    static TOKEN_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"\b\w\w+\b").expect("valid regex"));

    let lower = text.to_lowercase();
    TOKEN_RE
        .find_iter(&lower)
        .map(|m| m.as_str())
        .filter(|t| !is_stop_word(t))
        .map(str::to_string)
        .collect()
}

fn is_stop_word(token: &str) -> bool {
    STOP_WORDS.binary_search(&token).is_ok()
}

// Sorted for binary search.
const STOP_WORDS: &[&str] = &[
    "about", "above", "after", "again", "against", "all", "also", "am", "an", "and", "any", "are",
    "as", "at", "be", "because", "been", "before", "being", "below", "between", "both", "but",
    "by", "can", "could", "did", "do", "does", "doing", "down", "during", "each", "etc", "few",
    "for", "from", "further", "had", "has", "have", "having", "he", "her", "here", "hers",
    "herself", "him", "himself", "his", "how", "however", "if", "in", "into", "is", "it", "its",
    "itself", "just", "me", "more", "most", "my", "myself", "no", "nor", "not", "now", "of",
    "off", "on", "once", "only", "or", "other", "our", "ours", "ourselves", "out", "over", "own",
    "same", "she", "should", "so", "some", "such", "than", "that", "the", "their", "theirs",
    "them", "themselves", "then", "there", "these", "they", "this", "those", "through", "to",
    "too", "under", "until", "up", "very", "was", "we", "were", "what", "when", "where", "which",
    "while", "who", "whom", "why", "will", "with", "would", "you", "your", "yours", "yourself",
    "yourselves",
];
