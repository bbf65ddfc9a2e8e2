//! Lint rule registry with content-addressed findings.

use md5::Digest;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Schema marker written into every exported registry.
pub const LINT_FORMAT_VERSION: &str = "spry-lint-1";

/// Finding severity; `warn` findings never change the exit code.
#[derive(
    Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Off,
    Hint,
    #[default]
    Info,
    Warn,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Off => "off",
            Severity::Hint => "hint",
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
        };
        f.write_str(s)
    }
}

/// A half-open byte range inside the finding's subject content.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextRange {
    pub start: usize,
    pub end: usize,
}

/// Declares one rule: its code vocabulary, default severity, and the
/// expected shape of finding `data`, when the rule constrains it.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleSpec {
    pub codes: Vec<String>,
    pub default_severity: Severity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_shape: Option<serde_json::Value>,
}

/// One finding. Two findings with identical canonical fields share an id;
/// merging collapses them.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LintFinding {
    pub id: String,
    pub rule: String,
    pub code: String,
    /// Content-relative subject, typically a project-relative path.
    pub content: String,
    pub severity: Severity,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<TextRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<String>>,
}

impl fmt::Display for LintFinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}/{}] {}: {}", self.severity, self.rule, self.code, self.content, self.message)
    }
}

/// A finding before its id is assigned.
#[derive(Clone, Debug, Default)]
pub struct FindingInput {
    pub rule: String,
    pub code: String,
    pub content: String,
    pub severity: Option<Severity>,
    pub message: String,
    pub range: Option<TextRange>,
    pub data: Option<serde_json::Value>,
    pub tags: Option<Vec<String>>,
}

/// Query DSL over findings.
#[derive(Clone, Debug, PartialEq)]
pub enum Query {
    And(Vec<Query>),
    Or(Vec<Query>),
    Not(Box<Query>),
    Rule(String),
    Severity(Severity),
    Contains { field: String, value: String },
}

impl Query {
    pub fn rule(id: impl Into<String>) -> Self {
        Self::Rule(id.into())
    }

    pub fn severity(level: Severity) -> Self {
        Self::Severity(level)
    }

    pub fn contains(field: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Contains { field: field.into(), value: value.into() }
    }

    pub fn matches(&self, finding: &LintFinding) -> bool {
        match self {
            Self::And(qs) => qs.iter().all(|q| q.matches(finding)),
            Self::Or(qs) => qs.iter().any(|q| q.matches(finding)),
            Self::Not(q) => !q.matches(finding),
            Self::Rule(id) => finding.rule == *id,
            Self::Severity(level) => finding.severity == *level,
            Self::Contains { field, value } => {
                let haystack = match field.as_str() {
                    "id" => &finding.id,
                    "rule" => &finding.rule,
                    "code" => &finding.code,
                    "content" => &finding.content,
                    "message" => &finding.message,
                    _ => return false,
                };
                haystack.contains(value.as_str())
            }
        }
    }
}

/// Run-scoped, append-only registry of typed rules and their findings.
#[derive(Clone, Debug, Default)]
pub struct LintRegistry {
    rules: BTreeMap<String, RuleSpec>,
    findings: Vec<LintFinding>,
    ids: HashSet<String>,
}

/// Rule id for foundry execution faults.
pub const RULE_INVALID_FOUNDRY: &str = "invalid-foundry";
/// Rule id for annotation parse/validation faults.
pub const RULE_INVALID_ANNOTATION: &str = "invalid-annotation";
/// Rule id for directive engine faults.
pub const RULE_DIRECTIVE: &str = "directive";
/// Rule id for conflicting claims on one output.
pub const RULE_CONFLICT: &str = "conflict";

impl LintRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry pre-seeded with the orchestration rule vocabulary.
    pub fn with_standard_rules() -> Self {
        let mut registry = Self::new();
        registry.declare_rule(
            RULE_INVALID_FOUNDRY,
            RuleSpec {
                codes: vec!["execution-failed".into(), "unable-to-materialize".into()],
                default_severity: Severity::Error,
                ..Default::default()
            },
        );
        registry.declare_rule(
            RULE_INVALID_ANNOTATION,
            RuleSpec {
                codes: vec!["schema".into(), "parse".into()],
                default_severity: Severity::Warn,
                data_shape: Some(serde_json::json!({"line": "number", "col": "number"})),
            },
        );
        registry.declare_rule(
            RULE_DIRECTIVE,
            RuleSpec {
                codes: vec!["cycle".into(), "unterminated".into(), "parse".into()],
                default_severity: Severity::Warn,
                ..Default::default()
            },
        );
        registry.declare_rule(
            RULE_CONFLICT,
            RuleSpec {
                codes: vec!["duplicate-web-path".into(), "duplicate-foundry-target".into()],
                default_severity: Severity::Error,
                ..Default::default()
            },
        );
        registry
    }

    pub fn declare_rule(&mut self, id: impl Into<String>, spec: RuleSpec) {
        self.rules.insert(id.into(), spec);
    }

    pub fn rules(&self) -> &BTreeMap<String, RuleSpec> {
        &self.rules
    }

    /// Records a finding, deriving its content-addressed id. A finding whose
    /// id is already present is dropped; insertion order is preserved.
    pub fn report(&mut self, input: FindingInput) -> String {
        let severity = input.severity.unwrap_or_else(|| {
            self.rules.get(&input.rule).map(|r| r.default_severity).unwrap_or_default()
        });
        let id = finding_id(
            &input.rule,
            &input.code,
            &input.content,
            input.range.as_ref(),
            &input.message,
            input.data.as_ref(),
        );
        if self.ids.insert(id.clone()) {
            self.findings.push(LintFinding {
                id: id.clone(),
                rule: input.rule,
                code: input.code,
                content: input.content,
                severity,
                message: input.message,
                range: input.range,
                data: input.data,
                tags: input.tags,
            });
        }
        id
    }

    /// Merges `other` into `self`; identical ids collapse, so the merge is
    /// commutative up to ordering and idempotent.
    pub fn merge(&mut self, other: &LintRegistry) {
        for (id, spec) in &other.rules {
            self.rules.entry(id.clone()).or_insert_with(|| spec.clone());
        }
        for finding in &other.findings {
            if self.ids.insert(finding.id.clone()) {
                self.findings.push(finding.clone());
            }
        }
    }

    pub fn findings(&self) -> &[LintFinding] {
        &self.findings
    }

    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }

    pub fn len(&self) -> usize {
        self.findings.len()
    }

    pub fn query(&self, query: &Query) -> Vec<&LintFinding> {
        self.findings.iter().filter(|f| query.matches(f)).collect()
    }

    /// The first `n` findings in insertion order, optionally filtered.
    pub fn first(&self, n: usize, pred: Option<&Query>) -> Vec<&LintFinding> {
        self.findings
            .iter()
            .filter(|f| pred.map(|q| q.matches(f)).unwrap_or(true))
            .take(n)
            .collect()
    }

    pub fn has_errors(&self) -> bool {
        self.findings.iter().any(|f| f.severity == Severity::Error)
    }

    /// Process exit code mandated by the findings: `2` when any `error`
    /// finding is present, `0` otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.has_errors() {
            2
        } else {
            0
        }
    }

    /// Stable JSON export carrying the schema marker.
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "_format": LINT_FORMAT_VERSION,
            "rules": self.rules,
            "findings": self.findings,
        })
    }
}

/// Derives the content-addressed finding id: an md5 over the canonical
/// fields, with object keys sorted so `data` ordering cannot perturb it.
pub fn finding_id(
    rule: &str,
    code: &str,
    content: &str,
    range: Option<&TextRange>,
    message: &str,
    data: Option<&serde_json::Value>,
) -> String {
    let mut hasher = md5::Md5::new();
    for part in [rule, code, content, message] {
        hasher.update(part.as_bytes());
        hasher.update([0x1f]);
    }
    if let Some(range) = range {
        hasher.update(format!("{}..{}", range.start, range.end).as_bytes());
    }
    hasher.update([0x1f]);
    if let Some(data) = data {
        hasher.update(canonical_json(data).as_bytes());
    }
    hex::encode(hasher.finalize())
}

/// Serializes with recursively sorted object keys.
fn canonical_json(value: &serde_json::Value) -> String {
    fn canonicalize(value: &serde_json::Value) -> serde_json::Value {
        match value {
            serde_json::Value::Object(map) => {
                let sorted: BTreeMap<&String, serde_json::Value> =
                    map.iter().map(|(k, v)| (k, canonicalize(v))).collect();
                serde_json::to_value(sorted).unwrap_or(serde_json::Value::Null)
            }
            serde_json::Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(canonicalize).collect())
            }
            other => other.clone(),
        }
    }
    canonicalize(value).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sample() -> FindingInput {
        FindingInput {
            rule: RULE_INVALID_FOUNDRY.into(),
            code: "execution-failed".into(),
            content: "src/report.sql.py".into(),
            message: "exit status 3".into(),
            data: Some(serde_json::json!({"b": 1, "a": 2})),
            ..Default::default()
        }
    }

    #[test]
    fn identical_findings_share_an_id() {
        let mut a = LintRegistry::with_standard_rules();
        let mut b = LintRegistry::with_standard_rules();
        let id_a = a.report(sample());
        let id_b = b.report(sample());
        assert_eq!(id_a, id_b);
    }

    #[test]
    fn merge_is_idempotent_and_commutative() {
        let mut a = LintRegistry::with_standard_rules();
        a.report(sample());
        let mut b = LintRegistry::with_standard_rules();
        b.report(sample());

        let mut merged_ab = a.clone();
        merged_ab.merge(&b);
        assert_eq!(merged_ab.len(), 1);

        let mut merged_ba = b.clone();
        merged_ba.merge(&a);
        assert_eq!(merged_ba.len(), 1);

        merged_ab.merge(&b);
        assert_eq!(merged_ab.len(), 1);
    }

    #[test]
    fn data_key_order_does_not_perturb_ids() {
        let mut flipped = sample();
        flipped.data = Some(serde_json::json!({"a": 2, "b": 1}));
        let mut registry = LintRegistry::new();
        let id_1 = registry.report(sample());
        let id_2 = registry.report(flipped);
        assert_eq!(id_1, id_2);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn severity_defaults_come_from_the_rule() {
        let mut registry = LintRegistry::with_standard_rules();
        registry.report(sample());
        assert_eq!(registry.findings()[0].severity, Severity::Error);
        assert!(registry.has_errors());
        assert_eq!(registry.exit_code(), 2);
    }

    #[test]
    fn query_dsl() {
        let mut registry = LintRegistry::with_standard_rules();
        registry.report(sample());
        registry.report(FindingInput {
            rule: RULE_DIRECTIVE.into(),
            code: "cycle".into(),
            content: "src/a.sql".into(),
            message: "include cycle".into(),
            ..Default::default()
        });

        let q = Query::And(vec![
            Query::rule(RULE_DIRECTIVE),
            Query::Not(Box::new(Query::severity(Severity::Error))),
        ]);
        assert_eq!(registry.query(&q).len(), 1);
        assert_eq!(registry.query(&Query::contains("message", "cycle")).len(), 1);
        assert_eq!(registry.first(1, None).len(), 1);
        assert_eq!(registry.first(1, None)[0].rule, RULE_INVALID_FOUNDRY);
    }

    #[test]
    fn export_carries_schema_marker() {
        let registry = LintRegistry::with_standard_rules();
        assert_eq!(registry.to_json()["_format"], LINT_FORMAT_VERSION);
    }
}
