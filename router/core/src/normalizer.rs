//! Query Pattern Normalization
//!
//! Turns raw query text into a generalized template so that queries which
//! only differ in their variable parts share cache entries and usage stats.
//!
//! ```text
//! "Disk usage on Server 3  at 10:30"
//!         |  lower-case, collapse whitespace
//!         v
//! "disk usage on server 3 at 10:30"
//!         |  single left-to-right placeholder pass
//!         v
//! "disk usage on {entity:server} at {time}"   captures: ["3", "10:30"]
//! ```
//!
//! Placeholders, in match priority order: `{str}` (double-quoted text),
//! `{date}` (ISO `YYYY-MM-DD`), `{time}` (`HH:MM[:SS]`), `{entity:<kind>}`
//! (`server|host|node|vm|instance <token>` where the token holds a digit)
//! and `{num}`.

use once_cell::sync::Lazy;
use regex::{Captures, Regex, RegexBuilder};

/// Pattern id reserved for blank input. Never cached.
pub const EMPTY_PATTERN_ID: &str = "empty";

static PLACEHOLDER_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r#""(?P<str>[^"]*)""#,
        r"|(?P<date>\b\d{4}-\d{2}-\d{2}\b)",
        r"|(?P<time>\b\d{1,2}:\d{2}(?::\d{2})?\b)",
        r"|\b(?P<kind>server|host|node|vm|instance)\s+(?P<entity>[a-z._-]*\d[a-z0-9._-]*)",
        r"|(?P<num>\d+(?:\.\d+)?)",
    ))
    .expect("placeholder pattern is valid")
});

// ============================================================================
// Normalized Query
// ============================================================================

/// A literal value replaced by a placeholder
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Capture {
    /// Placeholder text that replaced the value (e.g. `{num}`)
    pub placeholder: String,
    /// The literal value taken from the query
    pub value: String,
}

/// Result of normalizing one query
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NormalizedQuery {
    /// Lower-cased, whitespace-collapsed text
    pub text: String,
    /// Text with variable parts replaced by placeholders
    pub template: String,
    /// Stable hash of the template
    pub id: String,
    /// Replaced values, in order of appearance
    pub captures: Vec<Capture>,
}

impl NormalizedQuery {
    /// The reserved pattern for blank input
    #[must_use]
    pub fn empty() -> Self {
        Self {
            text: String::new(),
            template: String::new(),
            id: EMPTY_PATTERN_ID.to_string(),
            captures: Vec::new(),
        }
    }

    /// Whether this is the reserved empty pattern
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.id == EMPTY_PATTERN_ID
    }

    /// Word set of the normalized text, used for similarity scoring
    #[must_use]
    pub fn words(&self) -> std::collections::HashSet<&str> {
        self.text.split(' ').filter(|w| !w.is_empty()).collect()
    }

    /// Rewrite an answer produced for `cached` so it fits this query
    ///
    /// Every captured value that differs between the two queries must appear
    /// in the answer as a standalone token; otherwise adaptation is not
    /// possible and `None` is returned.
    #[must_use]
    pub fn adapt_answer(&self, cached: &NormalizedQuery, answer: &str) -> Option<String> {
        if self.template != cached.template || self.captures.len() != cached.captures.len() {
            return None;
        }

        let mut edits: Vec<(usize, usize, &str)> = Vec::new();
        for (old, new) in cached.captures.iter().zip(&self.captures) {
            if old.value == new.value {
                continue;
            }
            let spans = token_spans(answer, &old.value);
            if spans.is_empty() {
                return None;
            }
            for (start, end) in spans {
                edits.push((start, end, new.value.as_str()));
            }
        }

        edits.sort_by_key(|(start, _, _)| *start);
        let mut out = String::with_capacity(answer.len());
        let mut cursor = 0;
        for (start, end, replacement) in edits {
            if start < cursor {
                continue;
            }
            out.push_str(&answer[cursor..start]);
            out.push_str(replacement);
            cursor = end;
        }
        out.push_str(&answer[cursor..]);
        Some(out)
    }
}

// ============================================================================
// Normalization
// ============================================================================

/// Normalize a raw query into its generalized pattern
#[must_use]
pub fn normalize(query: &str) -> NormalizedQuery {
    let text = query
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if text.is_empty() {
        return NormalizedQuery::empty();
    }

    let mut captures = Vec::new();
    let template = PLACEHOLDER_RE
        .replace_all(&text, |caps: &Captures<'_>| {
            let (placeholder, value) = placeholder_for(caps);
            captures.push(Capture {
                placeholder: placeholder.clone(),
                value,
            });
            placeholder
        })
        .into_owned();

    NormalizedQuery {
        id: stable_hash(&[template.as_str()]),
        text,
        template,
        captures,
    }
}

fn placeholder_for(caps: &Captures<'_>) -> (String, String) {
    if let Some(m) = caps.name("str") {
        return ("{str}".to_string(), m.as_str().to_string());
    }
    if let Some(m) = caps.name("date") {
        return ("{date}".to_string(), m.as_str().to_string());
    }
    if let Some(m) = caps.name("time") {
        return ("{time}".to_string(), m.as_str().to_string());
    }
    if let (Some(kind), Some(entity)) = (caps.name("kind"), caps.name("entity")) {
        return (
            format!("{{entity:{}}}", kind.as_str()),
            entity.as_str().to_string(),
        );
    }
    let value = caps.get(0).map_or("", |m| m.as_str()).to_string();
    ("{num}".to_string(), value)
}

/// Stable 64-bit FNV-1a hash of the given parts, hex encoded
///
/// Parts are separated by a unit separator so `["ab", "c"]` and `["a", "bc"]`
/// hash differently.
#[must_use]
pub fn stable_hash(parts: &[&str]) -> String {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0100_0000_01b3;

    let mut hash = OFFSET;
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            hash ^= 0x1f;
            hash = hash.wrapping_mul(PRIME);
        }
        for byte in part.bytes() {
            hash ^= u64::from(byte);
            hash = hash.wrapping_mul(PRIME);
        }
    }
    hex::encode(hash.to_be_bytes())
}

/// Byte spans of `haystack` matching `token` case-insensitively without
/// alphanumeric neighbours
///
/// Spans index `haystack` itself, so they stay on char boundaries even when
/// case mapping changes byte lengths.
fn token_spans(haystack: &str, token: &str) -> Vec<(usize, usize)> {
    if token.is_empty() {
        return Vec::new();
    }
    let Ok(matcher) = RegexBuilder::new(&regex::escape(token))
        .case_insensitive(true)
        .build()
    else {
        return Vec::new();
    };

    matcher
        .find_iter(haystack)
        .filter(|m| {
            let before = haystack[..m.start()].chars().next_back();
            let after = haystack[m.end()..].chars().next();
            !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
        })
        .map(|m| (m.start(), m.end()))
        .collect()
}
