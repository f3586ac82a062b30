use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Deepest combinator nesting a stored condition may use.
pub const MAX_CONDITION_DEPTH: usize = 4;

// ─── Operators ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StringOperator {
    Equals,
    Like,
    Regex,
    StartsWith,
    EndsWith,
    Contains,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MetadataOperator {
    Equals,
    Like,
    Regex,
    StartsWith,
    EndsWith,
    /// Matches when the key is absent.
    Null,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DateOperator {
    Before,
    After,
    BeforeOrOn,
    AfterOrOn,
}

// ─── Condition Tree ─────────────────────────────────────────────────────────

/// A boolean-combinator tree over primitive attribute conditions.
///
/// Used for environment/deployment membership, variable-value scoping,
/// policy targets and version selectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Condition {
    And {
        #[serde(default)]
        not: bool,
        #[serde(default)]
        conditions: Vec<Condition>,
    },
    Or {
        #[serde(default)]
        not: bool,
        #[serde(default)]
        conditions: Vec<Condition>,
    },
    Kind {
        value: String,
    },
    Version {
        value: String,
    },
    Provider {
        value: String,
    },
    Id {
        value: String,
    },
    Name {
        operator: StringOperator,
        value: String,
    },
    Identifier {
        operator: StringOperator,
        value: String,
    },
    Tag {
        operator: StringOperator,
        value: String,
    },
    Metadata {
        key: String,
        operator: MetadataOperator,
        #[serde(default)]
        value: String,
    },
    CreatedAt {
        operator: DateOperator,
        value: DateTime<Utc>,
    },
    LastSync {
        operator: DateOperator,
        value: DateTime<Utc>,
    },
}

/// Attribute accessors a condition reads. Anything a subject does not carry
/// returns `None`, which every primitive treats as a non-match.
pub trait ConditionSubject {
    fn subject_id(&self) -> Option<&str> {
        None
    }
    fn kind(&self) -> Option<&str> {
        None
    }
    fn version(&self) -> Option<&str> {
        None
    }
    fn provider_id(&self) -> Option<&str> {
        None
    }
    fn name(&self) -> Option<&str> {
        None
    }
    fn identifier(&self) -> Option<&str> {
        None
    }
    fn tag(&self) -> Option<&str> {
        None
    }
    fn metadata_value(&self, _key: &str) -> Option<&str> {
        None
    }
    fn created_at(&self) -> Option<DateTime<Utc>> {
        None
    }
    fn last_sync(&self) -> Option<DateTime<Utc>> {
        None
    }
}

impl Condition {
    /// An empty AND, which matches every subject.
    pub fn everything() -> Self {
        Condition::And {
            not: false,
            conditions: vec![],
        }
    }

    pub fn metadata_equals(key: &str, value: &str) -> Self {
        Condition::Metadata {
            key: key.to_string(),
            operator: MetadataOperator::Equals,
            value: value.to_string(),
        }
    }

    pub fn kind(value: &str) -> Self {
        Condition::Kind {
            value: value.to_string(),
        }
    }

    /// Combinator nesting depth; a primitive has depth 0.
    pub fn depth(&self) -> usize {
        match self {
            Condition::And { conditions, .. } | Condition::Or { conditions, .. } => {
                1 + conditions.iter().map(Condition::depth).max().unwrap_or(0)
            }
            _ => 0,
        }
    }

    /// Reject trees that are too deep or carry uncompilable patterns.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.depth() > MAX_CONDITION_DEPTH {
            return Err(EngineError::InvalidSelector(format!(
                "condition nesting depth {} exceeds {}",
                self.depth(),
                MAX_CONDITION_DEPTH
            )));
        }
        self.validate_patterns()
    }

    fn validate_patterns(&self) -> Result<(), EngineError> {
        match self {
            Condition::And { conditions, .. } | Condition::Or { conditions, .. } => {
                conditions.iter().try_for_each(Condition::validate_patterns)
            }
            Condition::Name {
                operator: StringOperator::Regex,
                value,
            }
            | Condition::Identifier {
                operator: StringOperator::Regex,
                value,
            }
            | Condition::Tag {
                operator: StringOperator::Regex,
                value,
            }
            | Condition::Metadata {
                operator: MetadataOperator::Regex,
                value,
                ..
            } => Regex::new(value)
                .map(|_| ())
                .map_err(|e| EngineError::InvalidSelector(format!("bad regex '{value}': {e}"))),
            _ => Ok(()),
        }
    }

    /// Evaluate against a subject. Never fails: missing attributes, bad
    /// patterns and over-deep trees all evaluate to `false`.
    pub fn matches<T: ConditionSubject + ?Sized>(&self, subject: &T) -> bool {
        self.matches_at(subject, 0)
    }

    fn matches_at<T: ConditionSubject + ?Sized>(&self, subject: &T, depth: usize) -> bool {
        match self {
            Condition::And { not, conditions } => {
                if depth >= MAX_CONDITION_DEPTH {
                    return false;
                }
                let all = conditions.iter().all(|c| c.matches_at(subject, depth + 1));
                all != *not
            }
            Condition::Or { not, conditions } => {
                if depth >= MAX_CONDITION_DEPTH {
                    return false;
                }
                // An empty OR behaves like an empty AND: no constraint.
                let any = conditions.is_empty()
                    || conditions.iter().any(|c| c.matches_at(subject, depth + 1));
                any != *not
            }
            Condition::Kind { value } => subject.kind() == Some(value.as_str()),
            Condition::Version { value } => subject.version() == Some(value.as_str()),
            Condition::Provider { value } => subject.provider_id() == Some(value.as_str()),
            Condition::Id { value } => subject.subject_id() == Some(value.as_str()),
            Condition::Name { operator, value } => {
                subject.name().is_some_and(|v| match_string(*operator, v, value))
            }
            Condition::Identifier { operator, value } => subject
                .identifier()
                .is_some_and(|v| match_string(*operator, v, value)),
            Condition::Tag { operator, value } => {
                subject.tag().is_some_and(|v| match_string(*operator, v, value))
            }
            Condition::Metadata {
                key,
                operator,
                value,
            } => {
                let actual = subject.metadata_value(key);
                match operator {
                    MetadataOperator::Null => actual.is_none(),
                    MetadataOperator::Equals => actual == Some(value.as_str()),
                    MetadataOperator::Like => {
                        actual.is_some_and(|v| match_string(StringOperator::Like, v, value))
                    }
                    MetadataOperator::Regex => {
                        actual.is_some_and(|v| match_string(StringOperator::Regex, v, value))
                    }
                    MetadataOperator::StartsWith => actual.is_some_and(|v| v.starts_with(value)),
                    MetadataOperator::EndsWith => actual.is_some_and(|v| v.ends_with(value)),
                }
            }
            Condition::CreatedAt { operator, value } => subject
                .created_at()
                .is_some_and(|v| match_date(*operator, v, *value)),
            Condition::LastSync { operator, value } => subject
                .last_sync()
                .is_some_and(|v| match_date(*operator, v, *value)),
        }
    }
}

fn match_string(operator: StringOperator, actual: &str, expected: &str) -> bool {
    match operator {
        StringOperator::Equals => actual == expected,
        StringOperator::StartsWith => actual.starts_with(expected),
        StringOperator::EndsWith => actual.ends_with(expected),
        StringOperator::Contains => actual.contains(expected),
        StringOperator::Regex => Regex::new(expected)
            .map(|re| re.is_match(actual))
            .unwrap_or(false),
        StringOperator::Like => Regex::new(&like_to_regex(expected))
            .map(|re| re.is_match(actual))
            .unwrap_or(false),
    }
}

fn match_date(operator: DateOperator, actual: DateTime<Utc>, expected: DateTime<Utc>) -> bool {
    match operator {
        DateOperator::Before => actual < expected,
        DateOperator::After => actual > expected,
        DateOperator::BeforeOrOn => actual <= expected,
        DateOperator::AfterOrOn => actual >= expected,
    }
}

/// Translate an SQL LIKE pattern into an anchored regex.
fn like_to_regex(pattern: &str) -> String {
    let mut out = String::from("^");
    for ch in pattern.chars() {
        match ch {
            '%' => out.push_str(".*"),
            '_' => out.push('.'),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn like_translation_escapes_literals() {
        assert_eq!(like_to_regex("a.b%"), "^a\\.b.*$");
        assert_eq!(like_to_regex("v_"), "^v.$");
    }

    #[test]
    fn like_is_anchored() {
        assert!(match_string(StringOperator::Like, "api-prod", "api-%"));
        assert!(!match_string(StringOperator::Like, "my-api-prod", "api-%"));
    }

    #[test]
    fn invalid_regex_is_a_non_match() {
        assert!(!match_string(StringOperator::Regex, "anything", "(unclosed"));
    }

    #[test]
    fn depth_counts_combinators_only() {
        let nested = Condition::And {
            not: false,
            conditions: vec![Condition::Or {
                not: false,
                conditions: vec![Condition::kind("pod")],
            }],
        };
        assert_eq!(nested.depth(), 2);
        assert_eq!(Condition::kind("pod").depth(), 0);
    }
}
