//! Query parameter building for read requests.
//!
//! The server accepts a common set of query parameters on collection
//! endpoints. [`Params`] collects them with typed setters and defaults
//! the response format to JSON, which is what the page parser expects.

use std::collections::BTreeMap;

/// Builder for request query parameters.
///
/// Setters consume and return the builder so call sites read as one
/// chain. Unset parameters are simply omitted from the query, except
/// `format`, which defaults to `json`.
#[derive(Debug, Clone, Default)]
pub struct Params {
    pairs: BTreeMap<String, String>,
}

impl Params {
    /// Creates an empty parameter set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Page size for collection responses.
    #[must_use]
    pub fn limit(self, limit: u32) -> Self {
        self.set("limit", limit.to_string())
    }

    /// Offset into the matched set.
    #[must_use]
    pub fn start(self, start: u32) -> Self {
        self.set("start", start.to_string())
    }

    /// Response format. Defaults to `json` when unset.
    #[must_use]
    pub fn format(self, format: impl Into<String>) -> Self {
        self.set("format", format)
    }

    /// Restricts results to one item type.
    #[must_use]
    pub fn item_type(self, item_type: impl Into<String>) -> Self {
        self.set("itemType", item_type)
    }

    /// Restricts results to items carrying a tag.
    #[must_use]
    pub fn tag(self, tag: impl Into<String>) -> Self {
        self.set("tag", tag)
    }

    /// Quick-search phrase.
    #[must_use]
    pub fn quick_search(self, phrase: impl Into<String>) -> Self {
        self.set("q", phrase)
    }

    /// Quick-search mode, e.g. `titleCreatorYear` or `everything`.
    #[must_use]
    pub fn quick_search_mode(self, mode: impl Into<String>) -> Self {
        self.set("qmode", mode)
    }

    /// Sort field.
    #[must_use]
    pub fn sort(self, field: impl Into<String>) -> Self {
        self.set("sort", field)
    }

    /// Sort direction, `asc` or `desc`.
    #[must_use]
    pub fn direction(self, direction: impl Into<String>) -> Self {
        self.set("direction", direction)
    }

    /// Only objects modified after the given library version.
    #[must_use]
    pub fn since(self, version: u64) -> Self {
        self.set("since", version.to_string())
    }

    /// Restricts results to an explicit set of item keys.
    #[must_use]
    pub fn item_keys(self, keys: &[&str]) -> Self {
        self.set("itemKey", keys.join(","))
    }

    /// Sets an arbitrary parameter.
    #[must_use]
    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.pairs.insert(key.into(), value.into());
        self
    }

    /// Renders the parameters as query pairs, defaulting `format=json`.
    pub(crate) fn to_query(&self) -> Vec<(String, String)> {
        let mut pairs = self.pairs.clone();
        pairs
            .entry("format".to_string())
            .or_insert_with(|| "json".to_string());
        pairs.into_iter().collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_format_defaults_to_json() {
        let query = Params::new().to_query();
        assert_eq!(query, vec![("format".to_string(), "json".to_string())]);
    }

    #[test]
    fn test_explicit_format_wins() {
        let query = Params::new().format("bibtex").to_query();
        assert_eq!(query, vec![("format".to_string(), "bibtex".to_string())]);
    }

    #[test]
    fn test_setters_accumulate() {
        let query = Params::new().limit(25).start(50).tag("biology").to_query();
        assert!(query.contains(&("limit".to_string(), "25".to_string())));
        assert!(query.contains(&("start".to_string(), "50".to_string())));
        assert!(query.contains(&("tag".to_string(), "biology".to_string())));
        assert!(query.contains(&("format".to_string(), "json".to_string())));
    }

    #[test]
    fn test_item_keys_join_with_commas() {
        let query = Params::new().item_keys(&["AAA111", "BBB222"]).to_query();
        assert!(query.contains(&("itemKey".to_string(), "AAA111,BBB222".to_string())));
    }

    #[test]
    fn test_repeated_set_overwrites() {
        let query = Params::new().limit(10).limit(99).to_query();
        assert!(query.contains(&("limit".to_string(), "99".to_string())));
        assert_eq!(query.iter().filter(|(k, _)| k == "limit").count(), 1);
    }
}
