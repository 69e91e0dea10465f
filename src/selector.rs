//! Selector matching boundary.
//!
//! Selectors are opaque to this crate. Where a caller wants to relate a
//! selector to a topic path it supplies a [`SelectorMatcher`]; any
//! `Fn(&str, &str) -> bool` closure qualifies.

/// Decides whether `selector` selects `topic_path`.
pub trait SelectorMatcher: Send + Sync {
    fn matches(&self, selector: &str, topic_path: &str) -> bool;
}

impl<F> SelectorMatcher for F
where
    F: Fn(&str, &str) -> bool + Send + Sync,
{
    fn matches(&self, selector: &str, topic_path: &str) -> bool {
        self(selector, topic_path)
    }
}

/// Matches a selector of the form `>path` against exactly `path`.
///
/// Enough for tests and for callers that only select single topics.
#[derive(Debug, Clone, Copy, Default)]
pub struct PathSelectorMatcher;

impl SelectorMatcher for PathSelectorMatcher {
    fn matches(&self, selector: &str, topic_path: &str) -> bool {
        selector
            .strip_prefix('>')
            .map(|path| path.trim_matches('/') == topic_path.trim_matches('/'))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_selector() {
        let matcher = PathSelectorMatcher;
        assert!(matcher.matches(">a/b", "a/b"));
        assert!(matcher.matches(">/a/b/", "a/b"));
        assert!(!matcher.matches(">a/b", "a/b/c"));
        assert!(!matcher.matches("?a//", "a/b"));
    }

    #[test]
    fn test_closure_matcher() {
        let prefix =
            |selector: &str, path: &str| path.starts_with(selector.trim_start_matches('?'));
        assert!(prefix.matches("?a", "a/b/c/d"));
        assert!(!prefix.matches("?b", "a/b"));
    }
}
