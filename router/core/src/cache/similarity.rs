//! Token-overlap similarity

use std::collections::HashSet;

/// Jaccard similarity of two word sets
///
/// Two empty sets are considered unrelated rather than identical.
#[must_use]
pub fn jaccard(a: &HashSet<&str>, b: &HashSet<&str>) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.len() + b.len() - intersection;
    intersection as f64 / union as f64
}

/// Word set of already-normalized text
#[must_use]
pub fn word_set(text: &str) -> HashSet<&str> {
    text.split_whitespace().collect()
}

/// Pick the best candidate whose similarity reaches `threshold`
///
/// Candidates are `(id, normalized text)` pairs. Ties keep the earliest
/// candidate, so callers should pass the most recent entries first.
pub fn best_match<'a, I>(query: &str, candidates: I, threshold: f64) -> Option<(&'a str, f64)>
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let query_words = word_set(query);
    let mut best: Option<(&'a str, f64)> = None;

    for (id, text) in candidates {
        let score = jaccard(&query_words, &word_set(text));
        if score < threshold {
            continue;
        }
        if best.map_or(true, |(_, s)| score > s) {
            best = Some((id, score));
        }
    }
    best
}
