use regex::Regex;
use serde::{Deserialize, Serialize};
use warden_core::{WardenError, WardenResult};

/// A rule hit reported by [`ContentFilter::scan`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum ContentFinding {
    /// Output matched a forbidden pattern.
    Forbidden {
        /// Pattern that matched.
        pattern: String,
    },
    /// Output contained control characters other than newline, tab and CR.
    ControlCharacters,
    /// Output exceeded the size limit.
    TooLarge {
        /// Output size.
        bytes: usize,
        /// Configured maximum.
        limit: usize,
    },
}

impl std::fmt::Display for ContentFinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContentFinding::Forbidden { pattern } => write!(f, "forbidden content /{pattern}/"),
            ContentFinding::ControlCharacters => write!(f, "control characters in output"),
            ContentFinding::TooLarge { bytes, limit } => {
                write!(f, "output is {bytes} bytes (limit {limit})")
            }
        }
    }
}

/// Deterministic output filter: forbidden patterns, control characters, size.
pub struct ContentFilter {
    patterns: Vec<(String, Regex)>,
    max_bytes: usize,
}

impl Default for ContentFilter {
    fn default() -> Self {
        Self {
            patterns: Vec::new(),
            max_bytes: 100_000,
        }
    }
}

impl ContentFilter {
    /// Compile the given patterns (case-insensitive). Invalid regexes are a config error.
    pub fn new(patterns: &[String], max_bytes: usize) -> WardenResult<Self> {
        let compiled = patterns
            .iter()
            .map(|p| {
                Regex::new(&format!("(?i){p}"))
                    .map(|re| (p.clone(), re))
                    .map_err(|e| WardenError::Config(format!("Invalid forbidden pattern '{p}': {e}")))
            })
            .collect::<WardenResult<Vec<_>>>()?;
        Ok(Self {
            patterns: compiled,
            max_bytes,
        })
    }

    /// Every rule the text violates. Empty means clean.
    pub fn scan(&self, text: &str) -> Vec<ContentFinding> {
        let mut findings = Vec::new();

        if text.len() > self.max_bytes {
            findings.push(ContentFinding::TooLarge {
                bytes: text.len(),
                limit: self.max_bytes,
            });
        }

        if text
            .chars()
            .any(|c| c.is_control() && c != '\n' && c != '\t' && c != '\r')
        {
            findings.push(ContentFinding::ControlCharacters);
        }

        for (source, re) in &self.patterns {
            if re.is_match(text) {
                findings.push(ContentFinding::Forbidden {
                    pattern: source.clone(),
                });
            }
        }

        findings
    }

    /// Number of compiled patterns.
    pub fn pattern_count(&self) -> usize {
        self.patterns.len()
    }
}

/// Strip control characters and truncate to `max_chars`, for log lines and
/// reviewer prompts.
pub fn preview(value: &str, max_chars: usize) -> String {
    let mut out: String = value
        .chars()
        .filter(|c| !c.is_control() || *c == ' ')
        .take(max_chars)
        .collect();
    if value.chars().count() > max_chars {
        out.push_str("...");
    }
    out
}
