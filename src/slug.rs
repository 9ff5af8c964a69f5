//! Site name normalization
//!
//! A slug is the DNS-label and file-system safe form of a site name. It names
//! the workspace directory, the container (`website-<slug>`) and the proxy
//! map entry, so every external command only ever sees `[a-z0-9-]`.

use crate::error::OrchestratorError;
use std::fmt;

/// Prefix for container and image names
pub const CONTAINER_PREFIX: &str = "website-";

/// Longest slug accepted (one DNS label)
pub const MAX_SLUG_LEN: usize = 63;

/// Normalize a free-form name.
///
/// Lowercases, turns whitespace, hyphen and underscore runs into a single
/// hyphen, drops everything that is not an ASCII letter or digit, and trims
/// hyphens from both ends. The result may be empty.
pub fn normalize(input: &str) -> String {
    let mut slug = String::with_capacity(input.len());
    let mut pending_hyphen = false;

    for ch in input.chars().flat_map(char::to_lowercase) {
        if ch.is_whitespace() || ch == '-' || ch == '_' {
            pending_hyphen = true;
        } else if ch.is_ascii_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.push(ch);
        }
    }

    if slug.len() > MAX_SLUG_LEN {
        slug.truncate(MAX_SLUG_LEN);
        while slug.ends_with('-') {
            slug.pop();
        }
    }

    slug
}

/// A validated, non-empty slug
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Slug(String);

impl Slug {
    /// Derive the slug for a site name, rejecting names with no usable characters
    pub fn parse(name: &str) -> Result<Self, OrchestratorError> {
        let slug = normalize(name);
        if slug.is_empty() {
            return Err(OrchestratorError::validation(format!(
                "site name '{}' has no letters or digits",
                name
            )));
        }
        Ok(Self(slug))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Container and image name for this site
    pub fn container_name(&self) -> String {
        format!("{}{}", CONTAINER_PREFIX, self.0)
    }
}

impl fmt::Display for Slug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_basic() {
        assert_eq!(normalize("My Cool Site!"), "my-cool-site");
        assert_eq!(normalize("Demo Site"), "demo-site");
        assert_eq!(normalize("already-a-slug"), "already-a-slug");
    }

    #[test]
    fn test_normalize_collapses_and_trims() {
        assert_eq!(normalize("  --Hello   World--  "), "hello-world");
        assert_eq!(normalize("a ! b"), "a-b");
        assert_eq!(normalize("a!b"), "ab");
        assert_eq!(normalize("snake_case_name"), "snake-case-name");
        assert_eq!(normalize("tabs\tand\nnewlines"), "tabs-and-newlines");
    }

    #[test]
    fn test_normalize_strips_non_ascii() {
        assert_eq!(normalize("Café Olé"), "caf-ol");
        assert_eq!(normalize("日本"), "");
    }

    #[test]
    fn test_normalize_is_idempotent() {
        let inputs = [
            "My Cool Site!",
            "  --x--  ",
            "__a__b__",
            "Ünïcödé Nämé",
            "1 2 3",
            "$(rm -rf /); echo pwned",
            "",
            "-",
        ];
        for input in inputs {
            let once = normalize(input);
            assert_eq!(normalize(&once), once, "not idempotent for {:?}", input);
            assert!(once
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
            assert!(!once.starts_with('-') && !once.ends_with('-'));
            assert!(!once.contains("--"));
        }
    }

    #[test]
    fn test_normalize_limits_length() {
        let long = "a ".repeat(100);
        let slug = normalize(&long);
        assert!(slug.len() <= MAX_SLUG_LEN);
        assert!(!slug.ends_with('-'));
        assert_eq!(normalize(&slug), slug);
    }

    #[test]
    fn test_slug_rejects_empty() {
        assert!(Slug::parse("!!!").is_err());
        assert!(Slug::parse("   ").is_err());
        let slug = Slug::parse("Demo Site").unwrap();
        assert_eq!(slug.as_str(), "demo-site");
        assert_eq!(slug.container_name(), "website-demo-site");
    }
}
