//! Vendor name normalisation and fuzzy similarity.
//!
//! Recipient names arrive as free text, so one real vendor shows up as
//! "ACME CORP.", "Acme Corp" and "acme  corp,". Both sides of every
//! comparison go through [`normalize_vendor_name`] first, then
//! [`similarity_ratio`] scores the pair on a 0–100 scale.
//!
//! # Normalisation rules
//!
//! - Unicode-aware uppercase
//! - Punctuation and symbols are dropped (`"Land O'Lakes"` → `"LAND OLAKES"`)
//! - Runs of whitespace collapse to one space; leading/trailing space is trimmed

/// Normalise a recipient name for comparison.
///
/// Input: `"  Acme, Corp.  "`
/// Output: `"ACME CORP"`
pub fn normalize_vendor_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut pending_space = false;

    for ch in name.chars() {
        if ch.is_whitespace() {
            pending_space = !out.is_empty();
        } else if ch.is_alphanumeric() {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            out.extend(ch.to_uppercase());
        }
        // Anything else is punctuation or a symbol: dropped without
        // breaking the surrounding word.
    }

    out
}

/// Indel similarity of two strings on a 0–100 scale.
///
/// `100 × 2·LCS(a, b) / (|a| + |b|)`, where LCS is the longest common
/// subsequence over characters. Two empty strings score 100.
pub fn similarity_ratio(a: &str, b: &str) -> f64 {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let total = a.len() + b.len();
    if total == 0 {
        return 100.0;
    }
    let lcs = lcs_len(&a, &b);
    100.0 * (2 * lcs) as f64 / total as f64
}

/// Longest common subsequence length, two-row DP.
fn lcs_len(a: &[char], b: &[char]) -> usize {
    if a.is_empty() || b.is_empty() {
        return 0;
    }
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];

    for &ca in a {
        for (j, &cb) in b.iter().enumerate() {
            curr[j + 1] = if ca == cb {
                prev[j] + 1
            } else {
                prev[j + 1].max(curr[j])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }

    prev[b.len()]
}
