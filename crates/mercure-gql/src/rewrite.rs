//! Stream URL rewriting
//!
//! The API advertises hub URLs as it reaches the hub (an internal base such as
//! `http://caddy/.well-known/mercure`). Clients need the externally reachable
//! base instead.

use serde::{Deserialize, Serialize};

/// Literal prefix substitution, `from` → `to`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlRewrite {
    pub from: String,
    pub to: String,
}

impl UrlRewrite {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
        }
    }

    /// Replace the `from` prefix of `url`; other URLs pass through unchanged
    pub fn apply(&self, url: &str) -> String {
        match url.strip_prefix(&self.from) {
            Some(rest) if !self.from.is_empty() => format!("{}{}", self.to, rest),
            _ => url.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("http://internal/hub?topic=x", "http://public/hub?topic=x")]
    #[case("http://internal:8080/hub", "http://internal:8080/hub")]
    #[case("https://other/http://internal/", "https://other/http://internal/")]
    fn test_apply(#[case] input: &str, #[case] expected: &str) {
        let rewrite = UrlRewrite::new("http://internal/", "http://public/");
        assert_eq!(rewrite.apply(input), expected);
    }

    #[test]
    fn test_empty_prefix_is_identity() {
        let rewrite = UrlRewrite::new("", "http://public");
        assert_eq!(rewrite.apply("http://internal/hub"), "http://internal/hub");
    }
}
