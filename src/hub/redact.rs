//! Secret scrubbing applied to payloads before fan-out
//!
//! The hub holds the active [`Redactor`] behind a lock and swaps it when the
//! configuration changes, so redaction can be toggled at runtime without
//! restarting streams.

use std::borrow::Cow;

use regex::{NoExpand, Regex};
use serde::{Deserialize, Serialize};

/// Secret shapes scrubbed by default
const BUILTIN_PATTERNS: &[&str] = &[
    // OpenAI / Anthropic style keys
    r"sk-[A-Za-z0-9_-]{20,}",
    // GitHub tokens
    r"gh[pousr]_[A-Za-z0-9]{36,}",
    // AWS access key ids
    r"AKIA[0-9A-Z]{16}",
    // Slack tokens
    r"xox[abprs]-[A-Za-z0-9-]{10,}",
    // Bearer credentials
    r"(?i)bearer\s+[A-Za-z0-9._~+/=-]{16,}",
    // key=value assignments; stops before quotes and escapes so JSON stays intact
    r#"(?i)(?:api[_-]?key|secret|token|password)\s*[=:]\s*[^\s"',\\]+"#,
];

/// Redaction settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionConfig {
    /// Apply the scrubber before fan-out
    pub enabled: bool,
    /// Include the built-in secret patterns
    pub builtin_patterns: bool,
    /// Extra regexes to scrub
    pub patterns: Vec<String>,
    /// Text substituted for every match
    pub replacement: String,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            builtin_patterns: true,
            patterns: Vec::new(),
            replacement: "[REDACTED]".to_string(),
        }
    }
}

/// Compiled scrubber
#[derive(Debug, Clone)]
pub struct Redactor {
    patterns: Vec<Regex>,
    replacement: String,
}

impl Redactor {
    /// Compile the configured patterns. `enabled` is not consulted here.
    pub fn from_config(config: &RedactionConfig) -> Result<Self, regex::Error> {
        let builtin: &[&str] = if config.builtin_patterns {
            BUILTIN_PATTERNS
        } else {
            &[]
        };
        let patterns = builtin
            .iter()
            .copied()
            .chain(config.patterns.iter().map(String::as_str))
            .map(Regex::new)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            patterns,
            replacement: config.replacement.clone(),
        })
    }

    /// Replace every match; borrows when nothing matched
    pub fn scrub<'a>(&self, text: &'a str) -> Cow<'a, str> {
        let mut out = Cow::Borrowed(text);
        for re in &self.patterns {
            let replaced = match re.replace_all(&out, NoExpand(&self.replacement)) {
                Cow::Owned(s) => Some(s),
                Cow::Borrowed(_) => None,
            };
            if let Some(s) = replaced {
                out = Cow::Owned(s);
            }
        }
        out
    }

    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }
}
