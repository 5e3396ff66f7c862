//! Query canonicalization for cache identity.
//!
//! Two raw queries that differ only in accents, case, punctuation, or
//! whitespace must map to the same cache key. The transformation is total and
//! idempotent: applying it twice yields the same string as applying it once.

use unicode_normalization::char::is_combining_mark;
use unicode_normalization::UnicodeNormalization;

/// Canonical form version, recorded in cache envelopes so stale entries can be
/// detected if the normalization rules ever change.
pub const NORM_VERSION: &str = "v1";

/// Return the canonical form of a query string for cache matching.
///
/// Steps, in fixed order: NFKC normalize, lowercase, NFD decompose and drop
/// combining marks, strip every character outside `[a-z0-9]` and whitespace,
/// then collapse whitespace runs to single spaces and trim. Stripping before
/// collapsing matters: a symbol sitting between two spaces must not leave a
/// double space behind. Empty input yields an empty string; the function
/// never fails.
pub fn canonicalize(text: &str) -> String {
    let folded: String = text.nfkc().collect::<String>().to_lowercase();
    let stripped: String = folded.nfd().filter(|c| !is_combining_mark(*c)).collect();
    let cleaned: String = stripped
        .chars()
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c.is_whitespace())
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}
