use crate::types::{ExecutionResult, Subtask};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, VecDeque};
use warden_core::WardenResult;
use warden_security::{ContentFilter, ContentFinding};

/// Validation settings, loaded from the `[validation]` config section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Minimum score for a result to pass.
    pub pass_threshold: f64,
    /// Extra attempts on the same agent after a score miss.
    pub validation_retries: u32,
    /// Case-insensitive regexes that must not appear in any output.
    pub forbidden_patterns: Vec<String>,
    /// Outputs larger than this are rejected.
    pub max_output_bytes: usize,
    /// Top-level fields each capability's output object must carry.
    pub required_fields: HashMap<String, Vec<String>>,
    /// Accepted outputs remembered per capability for shape comparison.
    pub history_depth: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            pass_threshold: 0.5,
            validation_retries: 1,
            forbidden_patterns: Vec::new(),
            max_output_bytes: 100_000,
            required_fields: HashMap::new(),
            history_depth: 16,
        }
    }
}

/// A deterministic rule the output broke.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "violation", rename_all = "snake_case")]
pub enum RuleViolation {
    /// Null, empty string, empty array or empty object.
    EmptyOutput,
    /// Required fields are configured but the output is not an object.
    NotAnObject,
    /// Required top-level fields are absent.
    MissingFields {
        /// Names of the absent fields.
        fields: Vec<String>,
    },
    /// The content filter matched.
    Content {
        /// What the filter found.
        finding: ContentFinding,
    },
}

impl std::fmt::Display for RuleViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuleViolation::EmptyOutput => write!(f, "empty output"),
            RuleViolation::NotAnObject => write!(f, "output is not an object"),
            RuleViolation::MissingFields { fields } => {
                write!(f, "missing fields: {}", fields.join(", "))
            }
            RuleViolation::Content { finding } => write!(f, "{finding}"),
        }
    }
}

/// Outcome of validating one result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Fuzzy score in `[0, 1]`.
    pub score: f64,
    /// Score reached the threshold and no rule was broken.
    pub passed: bool,
    /// Deterministic rule hits. Any hit is a compliance violation.
    pub violations: Vec<RuleViolation>,
}

impl ValidationReport {
    /// Whether any hard rule was broken.
    pub fn is_compliance_violation(&self) -> bool {
        !self.violations.is_empty()
    }

    /// One-line summary of the rule hits.
    pub fn violation_summary(&self) -> String {
        self.violations
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Checks agent results against hard rules and scores them for consistency.
///
/// Hard rules cover emptiness, required fields and the content filter.
/// The fuzzy score compares the output's structural shape with outputs
/// previously accepted for the same capability; with no history and no
/// required fields the score is 1.0.
pub struct SupervisorValidator {
    config: ValidationConfig,
    filter: ContentFilter,
    history: Mutex<HashMap<String, VecDeque<BTreeSet<String>>>>,
}

impl SupervisorValidator {
    /// Compile the configured content filter. Fails on an invalid pattern.
    pub fn new(config: ValidationConfig) -> WardenResult<Self> {
        let filter = ContentFilter::new(&config.forbidden_patterns, config.max_output_bytes)?;
        Ok(Self {
            config,
            filter,
            history: Mutex::new(HashMap::new()),
        })
    }

    /// Rules and thresholds in use.
    pub fn config(&self) -> &ValidationConfig {
        &self.config
    }

    /// Check hard rules and score the output's shape. Does not record history.
    pub fn validate(&self, subtask: &Subtask, result: &ExecutionResult) -> ValidationReport {
        let mut violations = Vec::new();
        let output = &result.output;

        let empty = match output {
            serde_json::Value::Null => true,
            serde_json::Value::String(s) => s.trim().is_empty(),
            _ => false,
        };
        if empty {
            violations.push(RuleViolation::EmptyOutput);
        }

        let mut components = Vec::new();

        if let Some(required) = self.config.required_fields.get(&subtask.capability) {
            if !required.is_empty() {
                match output.as_object() {
                    Some(map) => {
                        let missing: Vec<String> = required
                            .iter()
                            .filter(|f| !map.contains_key(f.as_str()))
                            .cloned()
                            .collect();
                        components
                            .push((required.len() - missing.len()) as f64 / required.len() as f64);
                        if !missing.is_empty() {
                            violations.push(RuleViolation::MissingFields { fields: missing });
                        }
                    }
                    None => {
                        components.push(0.0);
                        violations.push(RuleViolation::NotAnObject);
                    }
                }
            }
        }

        violations.extend(
            self.filter
                .scan(&result.output_text())
                .into_iter()
                .map(|finding| RuleViolation::Content { finding }),
        );

        let shape = shape_of(output);
        if let Some(past) = self.history.lock().get(&subtask.capability) {
            if let Some(best) = past.iter().map(|p| jaccard(&shape, p)).reduce(f64::max) {
                components.push(best);
            }
        }

        let score = if empty {
            0.0
        } else if components.is_empty() {
            1.0
        } else {
            components.iter().sum::<f64>() / components.len() as f64
        };
        let score = score.clamp(0.0, 1.0);

        ValidationReport {
            score,
            passed: violations.is_empty() && score >= self.config.pass_threshold,
            violations,
        }
    }

    /// Remember an accepted output as a reference shape for its capability.
    pub fn remember_accepted(&self, capability: &str, output: &serde_json::Value) {
        if self.config.history_depth == 0 {
            return;
        }
        let mut history = self.history.lock();
        let past = history.entry(capability.to_string()).or_default();
        past.push_back(shape_of(output));
        while past.len() > self.config.history_depth {
            past.pop_front();
        }
    }
}

/// Structural signature: typed paths down to depth three.
fn shape_of(value: &serde_json::Value) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    collect_shape(value, "$", 0, &mut out);
    out
}

fn collect_shape(value: &serde_json::Value, path: &str, depth: usize, out: &mut BTreeSet<String>) {
    out.insert(format!("{path}:{}", type_name(value)));
    if depth >= 3 {
        return;
    }
    match value {
        serde_json::Value::Object(map) => {
            for (key, child) in map {
                collect_shape(child, &format!("{path}.{key}"), depth + 1, out);
            }
        }
        serde_json::Value::Array(items) => {
            if let Some(first) = items.first() {
                collect_shape(first, &format!("{path}[]"), depth + 1, out);
            }
        }
        _ => {}
    }
}

fn type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

fn jaccard(a: &BTreeSet<String>, b: &BTreeSet<String>) -> f64 {
    let union = a.union(b).count();
    if union == 0 {
        return 1.0;
    }
    a.intersection(b).count() as f64 / union as f64
}
