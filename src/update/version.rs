//! Permissive version comparison for release tags.
//!
//! Release feeds hand us tags like `v2.0`, `1.10.3` or `2.0.0-beta`. Strict
//! semver parsing rejects half of those, so versions here are read as a list of
//! numeric segments instead: anything unreadable becomes 0.

use std::cmp::Ordering;

/// Parse a version string into its numeric segments.
///
/// A leading non-numeric prefix (`v`, `release-`) is dropped. Each `.`-separated
/// segment contributes its leading digit run; segments without one count as 0.
pub fn parse_segments(version: &str) -> Vec<u64> {
    let trimmed = version.trim();
    let start = trimmed
        .find(|c: char| c.is_ascii_digit())
        .unwrap_or(trimmed.len());
    let body = &trimmed[start..];
    if body.is_empty() {
        return Vec::new();
    }

    body.split('.')
        .map(|segment| {
            let digits: String = segment.chars().take_while(|c| c.is_ascii_digit()).collect();
            // Saturate instead of failing on absurdly long segments
            digits.parse::<u64>().unwrap_or(if digits.is_empty() { 0 } else { u64::MAX })
        })
        .collect()
}

/// Order two version strings segment by segment, zero padding the shorter one.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let left = parse_segments(a);
    let right = parse_segments(b);
    let len = left.len().max(right.len());

    for i in 0..len {
        let l = left.get(i).copied().unwrap_or(0);
        let r = right.get(i).copied().unwrap_or(0);
        match l.cmp(&r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

/// Whether `candidate` is strictly newer than `current`.
pub fn is_newer(current: &str, candidate: &str) -> bool {
    compare_versions(candidate, current) == Ordering::Greater
}
