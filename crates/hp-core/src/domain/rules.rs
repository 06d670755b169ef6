//! Rule evaluator shared by protocol matching and series selection.
//!
//! A [`Rule`] names an attribute, a [`Constraint`] on its value, whether the
//! rule is required, and an optional weight.  Evaluation is total: there is no
//! error path.  A subject that lacks the attribute fails every constraint
//! except [`Constraint::NotExists`].
//!
//! # Scoring
//!
//! ```text
//! required rule fails   → candidate is ineligible (score = None)
//! any rule passes       → score += weight (default 1)
//! optional rule fails   → contributes nothing
//! ```

use serde::{Deserialize, Serialize};

use super::display_set::{AttributeSource, AttributeValue};

/// Weight used when a rule does not declare one.
pub const DEFAULT_RULE_WEIGHT: u32 = 1;

/// Closed set of predicates a rule can apply to an attribute value.
///
/// In TOML a constraint is written as a single-key table, for example
/// `constraint = { greater_than = 4 }` or `constraint = "exists"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Constraint {
    Equals(AttributeValue),
    NotEquals(AttributeValue),
    GreaterThan(f64),
    LessThan(f64),
    /// Inclusive on both ends.
    Range { min: f64, max: f64 },
    /// Substring for text, membership for lists.  A list operand matches when
    /// any of its elements is contained.
    Contains(AttributeValue),
    NotContains(AttributeValue),
    StartsWith(String),
    EndsWith(String),
    Exists,
    NotExists,
}

impl Constraint {
    /// Applies the constraint to an attribute value (`None` = absent).
    pub fn test(&self, value: Option<&AttributeValue>) -> bool {
        let Some(value) = value else {
            return matches!(self, Constraint::NotExists);
        };

        match self {
            Constraint::Exists => true,
            Constraint::NotExists => false,
            Constraint::Equals(expected) => value.loose_eq(expected),
            Constraint::NotEquals(expected) => !value.loose_eq(expected),
            Constraint::GreaterThan(limit) => value.as_f64().is_some_and(|v| v > *limit),
            Constraint::LessThan(limit) => value.as_f64().is_some_and(|v| v < *limit),
            Constraint::Range { min, max } => {
                value.as_f64().is_some_and(|v| v >= *min && v <= *max)
            }
            Constraint::Contains(needle) => contains(value, needle),
            Constraint::NotContains(needle) => !contains(value, needle),
            Constraint::StartsWith(prefix) => value.as_str().is_some_and(|s| s.starts_with(prefix.as_str())),
            Constraint::EndsWith(suffix) => value.as_str().is_some_and(|s| s.ends_with(suffix.as_str())),
        }
    }
}

fn contains(haystack: &AttributeValue, needle: &AttributeValue) -> bool {
    if let AttributeValue::List(options) = needle {
        return options.iter().any(|n| contains(haystack, n));
    }
    match haystack {
        AttributeValue::Text(text) => needle.as_str().is_some_and(|n| text.contains(n)),
        AttributeValue::List(items) => items.iter().any(|item| item.loose_eq(needle)),
        _ => false,
    }
}

/// One declarative matching rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub attribute: String,
    pub constraint: Constraint,
    #[serde(default)]
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<u32>,
}

impl Rule {
    /// Creates an optional rule with the default weight.
    pub fn new(attribute: impl Into<String>, constraint: Constraint) -> Self {
        Self {
            attribute: attribute.into(),
            constraint,
            required: false,
            weight: None,
        }
    }

    /// Marks the rule as required.
    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn weighted(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn effective_weight(&self) -> u32 {
        self.weight.unwrap_or(DEFAULT_RULE_WEIGHT)
    }
}

/// Result of evaluating one rule against one subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleOutcome {
    pub passed: bool,
    /// Weight contributed to the score; zero when the rule failed.
    pub weight: u32,
}

/// Evaluates a single rule.
pub fn evaluate(rule: &Rule, subject: &dyn AttributeSource) -> RuleOutcome {
    let value = subject.attribute(&rule.attribute);
    let passed = rule.constraint.test(value.as_ref());
    RuleOutcome {
        passed,
        weight: if passed { rule.effective_weight() } else { 0 },
    }
}

/// Evaluates every rule and returns the cumulative score, or `None` if any
/// required rule failed.
///
/// An empty rule list is eligible with score 0.
pub fn score(rules: &[Rule], subject: &dyn AttributeSource) -> Option<u32> {
    let mut total = 0u32;
    for rule in rules {
        let outcome = evaluate(rule, subject);
        if !outcome.passed && rule.required {
            return None;
        }
        total = total.saturating_add(outcome.weight);
    }
    Some(total)
}
