//! Ignore-list pattern matching shared by both capture paths.
//!
//! Supports exact domain matches and wildcard patterns (*.local).
//! Patterns are pre-compiled at construction time so the per-query
//! check does no allocation beyond normalizing the input.

use std::collections::HashSet;

/// A compiled ignore list.
///
/// Unlike a subdomain-only wildcard, `*.local` here also matches the bare
/// suffix `local` itself: these patterns exist to suppress mDNS and similar
/// infrastructure noise, where the apex name is just as uninteresting.
#[derive(Debug, Clone, Default)]
pub struct IgnoreList {
    /// Exact domain matches (stored lowercase, without trailing dot).
    exact: HashSet<String>,
    /// Wildcard suffixes including the leading dot (e.g., ".local").
    wildcard_suffixes: Vec<String>,
}

impl IgnoreList {
    /// Create a new ignore list from a list of patterns.
    ///
    /// Patterns can be:
    /// - Exact matches: "localhost"
    /// - Wildcard matches: "*.local" (matches any subdomain and the suffix itself)
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut exact = HashSet::new();
        let mut wildcard_suffixes = Vec::new();

        for pattern in patterns {
            let pattern = pattern.as_ref().to_lowercase();
            let pattern = pattern.trim_end_matches('.');

            if let Some(suffix) = pattern.strip_prefix('*') {
                wildcard_suffixes.push(suffix.to_string());
            } else {
                exact.insert(pattern.to_string());
            }
        }

        Self {
            exact,
            wildcard_suffixes,
        }
    }

    /// Check if a domain should be ignored.
    #[inline]
    pub fn is_ignored(&self, domain: &str) -> bool {
        let domain = domain.to_lowercase();
        let domain = domain.trim_end_matches('.');

        if self.exact.contains(domain) {
            return true;
        }

        for suffix in &self.wildcard_suffixes {
            // ".local" matches both "printer.local" and bare "local".
            if domain.ends_with(suffix.as_str()) || domain == &suffix[1..] {
                return true;
            }
        }

        false
    }

    /// Check if the list has any patterns.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.exact.is_empty() && self.wildcard_suffixes.is_empty()
    }

    /// Returns the total number of patterns.
    #[inline]
    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcard_suffixes.len()
    }
}
