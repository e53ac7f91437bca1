//! Execution similarity scoring.
//!
//! Lightweight and deterministic: term-frequency cosine over error text,
//! Jaccard over normalized paths, boolean status/verdict matching, combined by
//! fixed weights. No model, no corpus state.

use std::collections::{HashMap, HashSet};

use serde::Serialize;

const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "is", "are", "was", "were", "in", "on", "at", "to", "for", "of", "with",
    "by", "from", "as", "and", "or", "not", "no",
];

#[derive(Clone, Debug, Serialize)]
pub struct SimilarityScore {
    pub execution_id: String,
    pub total_score: f64,
    pub error_similarity: f64,
    pub path_similarity: f64,
    pub status_match: bool,
    pub verdict_match: bool,
}

/// TF vectorizer for error messages.
#[derive(Default)]
pub struct TextVectorizer;

impl TextVectorizer {
    pub fn new() -> Self {
        Self
    }

    /// Lowercase, strip non-alphanumerics, drop single-char tokens and stop words.
    pub fn tokenize(&self, text: &str) -> Vec<String> {
        let cleaned: String = text
            .to_lowercase()
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
            .collect();
        cleaned
            .split_whitespace()
            .filter(|t| t.len() > 1 && !STOP_WORDS.contains(t))
            .map(str::to_string)
            .collect()
    }

    pub fn vectorize(&self, text: &str) -> HashMap<String, f64> {
        let tokens = self.tokenize(text);
        if tokens.is_empty() {
            return HashMap::new();
        }
        let total = tokens.len() as f64;
        let mut counts: HashMap<String, f64> = HashMap::new();
        for token in tokens {
            *counts.entry(token).or_insert(0.0) += 1.0;
        }
        counts.values_mut().for_each(|v| *v /= total);
        counts
    }

    pub fn cosine_similarity(&self, a: &HashMap<String, f64>, b: &HashMap<String, f64>) -> f64 {
        if a.is_empty() || b.is_empty() {
            return 0.0;
        }
        let dot: f64 = a
            .iter()
            .filter_map(|(term, weight)| b.get(term).map(|other| weight * other))
            .sum();
        let mag_a: f64 = a.values().map(|v| v * v).sum::<f64>().sqrt();
        let mag_b: f64 = b.values().map(|v| v * v).sum::<f64>().sqrt();
        if mag_a == 0.0 || mag_b == 0.0 {
            0.0
        } else {
            dot / (mag_a * mag_b)
        }
    }
}

/// Jaccard index over normalized paths.
pub struct PathSimilarity;

impl PathSimilarity {
    /// Backslashes to slashes, case-folded, trimmed of outer slashes.
    pub fn normalize_path(path: &str) -> String {
        path.replace('\\', "/").to_lowercase().trim_matches('/').to_string()
    }

    pub fn jaccard_similarity(paths1: &[String], paths2: &[String]) -> f64 {
        if paths1.is_empty() && paths2.is_empty() {
            return 1.0;
        }
        if paths1.is_empty() || paths2.is_empty() {
            return 0.0;
        }
        let set1: HashSet<String> = paths1.iter().map(|p| Self::normalize_path(p)).collect();
        let set2: HashSet<String> = paths2.iter().map(|p| Self::normalize_path(p)).collect();
        let intersection = set1.intersection(&set2).count();
        let union = set1.union(&set2).count();
        if union == 0 {
            0.0
        } else {
            intersection as f64 / union as f64
        }
    }

    pub fn path_overlap_count(paths1: &[String], paths2: &[String]) -> usize {
        let set1: HashSet<String> = paths1.iter().map(|p| Self::normalize_path(p)).collect();
        let set2: HashSet<String> = paths2.iter().map(|p| Self::normalize_path(p)).collect();
        set1.intersection(&set2).count()
    }
}

pub struct SimilarityEngine {
    error_weight: f64,
    path_weight: f64,
    meta_weight: f64,
    pub vectorizer: TextVectorizer,
}

impl Default for SimilarityEngine {
    fn default() -> Self {
        Self::new(0.5, 0.3, 0.2)
    }
}

impl SimilarityEngine {
    pub fn new(error_weight: f64, path_weight: f64, meta_weight: f64) -> Self {
        Self {
            error_weight,
            path_weight,
            meta_weight,
            vectorizer: TextVectorizer::new(),
        }
    }

    /// Weighted score in [0, 1]. Two clean executions count as similar on the
    /// error axis; one error vs none counts as dissimilar.
    #[allow(clippy::too_many_arguments)]
    pub fn compute_similarity_score(
        &self,
        target_error: Option<&str>,
        target_paths: &[String],
        target_status: &str,
        target_verdict: &str,
        candidate_execution_id: &str,
        candidate_error: Option<&str>,
        candidate_paths: &[String],
        candidate_status: &str,
        candidate_verdict: &str,
    ) -> SimilarityScore {
        let error_similarity = match (target_error, candidate_error) {
            (Some(a), Some(b)) => {
                let va = self.vectorizer.vectorize(a);
                let vb = self.vectorizer.vectorize(b);
                self.vectorizer.cosine_similarity(&va, &vb)
            }
            (None, None) => 1.0,
            _ => 0.0,
        };

        let path_similarity = PathSimilarity::jaccard_similarity(target_paths, candidate_paths);

        let status_match = target_status == candidate_status;
        let verdict_match = target_verdict == candidate_verdict;
        let meta_score =
            if status_match { 0.5 } else { 0.0 } + if verdict_match { 0.5 } else { 0.0 };

        SimilarityScore {
            execution_id: candidate_execution_id.to_string(),
            total_score: self.error_weight * error_similarity
                + self.path_weight * path_similarity
                + self.meta_weight * meta_score,
            error_similarity,
            path_similarity,
            status_match,
            verdict_match,
        }
    }
}
