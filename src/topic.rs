//! Topic pattern matching
//!
//! Topics are colon-separated identifiers (`sessions:abc`, `panes:abc:0`).
//! A subscription pattern is one of:
//!
//! - `*` matches every non-empty topic
//! - `prefix:*` matches every topic starting with `prefix:`
//! - anything else matches only the identical topic
//!
//! Matching is pure and allocation-free.

use serde::{Deserialize, Serialize};

use crate::error::HubError;

/// Test a single pattern against a topic
pub fn matches(pattern: &str, topic: &str) -> bool {
    if pattern.is_empty() || topic.is_empty() {
        return pattern.is_empty() && topic.is_empty();
    }
    if pattern == "*" {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        if prefix.ends_with(':') {
            return topic.starts_with(prefix);
        }
    }
    pattern == topic
}

/// Reject patterns a client should never be allowed to register
pub fn validate_pattern(pattern: &str) -> Result<(), HubError> {
    let invalid = |reason: &str| HubError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: reason.to_string(),
    };

    if pattern.is_empty() {
        return Err(invalid("pattern must not be empty"));
    }
    if pattern.chars().any(char::is_whitespace) {
        return Err(invalid("pattern must not contain whitespace"));
    }
    if pattern != "*" {
        let stars = pattern.matches('*').count();
        if stars > 1 || (stars == 1 && !pattern.ends_with(":*")) {
            return Err(invalid("wildcard is only allowed as '*' or a trailing ':*'"));
        }
    }
    Ok(())
}

/// A set of patterns; a topic matches if any pattern does
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TopicFilter {
    patterns: Vec<String>,
}

impl TopicFilter {
    pub fn new<I, S>(patterns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut patterns: Vec<String> = patterns.into_iter().map(Into::into).collect();
        patterns.sort();
        patterns.dedup();
        Self { patterns }
    }

    /// Filter matching every topic
    pub fn all() -> Self {
        Self::single("*")
    }

    pub fn single(pattern: impl Into<String>) -> Self {
        Self {
            patterns: vec![pattern.into()],
        }
    }

    pub fn matches(&self, topic: &str) -> bool {
        self.patterns.iter().any(|p| matches(p, topic))
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }
}
