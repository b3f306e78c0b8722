use std::cmp::Ordering;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    datafile::deserialize_present,
    datafile_reader::DatafileReader,
    source::{SourceDescriptor, SourceFields, SourceResolver},
    value::{values_equal, Inputs, Value},
    versions::compare_versions,
    Error, Result,
};

/// Condition tree.
///
/// Combinators are evaluated with short-circuiting. A bare list is an implicit `and`; `not` means
/// "none of".
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Condition {
    /// `"*"` matches everything. Any other string is parsed as a JSON condition at evaluation time.
    Raw(String),
    Multiple(Vec<Condition>),
    And { and: Vec<Condition> },
    Or { or: Vec<Condition> },
    Not { not: Vec<Condition> },
    Plain(PlainCondition),
    /// Anything else. Never matches.
    Invalid(Value),
}

impl From<PlainCondition> for Condition {
    fn from(value: PlainCondition) -> Self {
        Condition::Plain(value)
    }
}

/// Leaf condition: compares a source value with `value` using `operator`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(try_from = "RawPlainCondition", into = "RawPlainCondition")]
pub struct PlainCondition {
    pub source: SourceDescriptor,
    pub operator: ConditionOperator,
    pub value: Option<Value>,
    pub regex_flags: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawPlainCondition {
    #[serde(flatten)]
    source: SourceFields,
    operator: ConditionOperator,
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    regex_flags: Option<String>,
}

impl TryFrom<RawPlainCondition> for PlainCondition {
    type Error = &'static str;

    fn try_from(raw: RawPlainCondition) -> std::result::Result<Self, Self::Error> {
        Ok(PlainCondition {
            source: raw
                .source
                .into_descriptor()
                .ok_or("condition requires a source")?,
            operator: raw.operator,
            value: raw.value,
            regex_flags: raw.regex_flags,
        })
    }
}

impl From<PlainCondition> for RawPlainCondition {
    fn from(condition: PlainCondition) -> Self {
        RawPlainCondition {
            source: SourceFields::from_descriptor(Some(condition.source)),
            operator: condition.operator,
            value: condition.value,
            regex_flags: condition.regex_flags,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConditionOperator {
    Equals,
    NotEquals,

    Exists,
    NotExists,

    Before,
    After,

    In,
    NotIn,

    Contains,
    NotContains,
    StartsWith,
    EndsWith,
    Matches,
    NotMatches,

    SemverEquals,
    SemverNotEquals,
    SemverGreaterThan,
    SemverGreaterThanOrEquals,
    SemverLessThan,
    SemverLessThanOrEquals,

    GreaterThan,
    GreaterThanOrEquals,
    LessThan,
    LessThanOrEquals,

    Includes,
    NotIncludes,

    #[serde(other)]
    Unknown,
}

impl ConditionOperator {
    fn requires_value(&self) -> bool {
        !matches!(self, Self::Exists | Self::NotExists)
    }
}

/// Evaluates condition trees.
#[derive(Clone, Copy)]
pub struct ConditionsChecker<'a> {
    reader: &'a DatafileReader,
    resolver: SourceResolver<'a>,
}

impl<'a> ConditionsChecker<'a> {
    pub fn new(reader: &'a DatafileReader, resolver: SourceResolver<'a>) -> ConditionsChecker<'a> {
        ConditionsChecker { reader, resolver }
    }

    /// Returns `true` if the conditions match `inputs`. Malformed conditions never match.
    pub fn all_are_matched(&self, conditions: &Condition, inputs: &Inputs) -> bool {
        match conditions {
            Condition::Raw(s) if s == "*" => true,
            Condition::Raw(s) => match serde_json::from_str::<Condition>(s) {
                // A string that parses to another string is not a condition.
                Ok(Condition::Raw(inner)) => inner == "*",
                Ok(parsed) => self.all_are_matched(&parsed, inputs),
                Err(err) => {
                    log::error!(target: "eventvisor",
                                conditions = s.as_str();
                                "error parsing conditions: {err}");
                    false
                }
            },
            Condition::Multiple(all) | Condition::And { and: all } => {
                all.iter().all(|c| self.all_are_matched(c, inputs))
            }
            Condition::Or { or } => or.iter().any(|c| self.all_are_matched(c, inputs)),
            Condition::Not { not } => !not.iter().any(|c| self.all_are_matched(c, inputs)),
            Condition::Plain(condition) => match self.is_matched(condition, inputs) {
                Ok(matched) => matched,
                Err(err) => {
                    log::warn!(target: "eventvisor",
                               condition:serde;
                               "error evaluating condition: {err}");
                    false
                }
            },
            Condition::Invalid(condition) => {
                log::warn!(target: "eventvisor",
                           condition:serde;
                           "unrecognized condition, not matched");
                false
            }
        }
    }

    /// Evaluate a single leaf condition.
    ///
    /// Returns an error for misconfigured conditions (missing value, invalid regex or version).
    /// Operator and operand combinations that do not apply are simply not matched.
    pub fn is_matched(&self, condition: &PlainCondition, inputs: &Inputs) -> Result<bool> {
        let operator = condition.operator;
        let source_value = self.resolver.resolve(&condition.source, inputs);

        if !operator.requires_value() {
            let exists = source_value.is_some();
            return Ok(if operator == ConditionOperator::Exists {
                exists
            } else {
                !exists
            });
        }

        let Some(value) = condition.value.as_ref() else {
            return Err(Error::MissingConditionValue(operator));
        };

        self.try_eval(condition, source_value.as_ref(), value)
            .map(|matched| matched.unwrap_or(false))
    }

    /// Returns `Ok(None)` when the operator cannot be applied to the operands.
    fn try_eval(
        &self,
        condition: &PlainCondition,
        source_value: Option<&Value>,
        value: &Value,
    ) -> Result<Option<bool>> {
        use ConditionOperator as Op;

        let operator = condition.operator;
        Ok(match operator {
            Op::Equals | Op::NotEquals => {
                let equal = source_value.is_some_and(|source| values_equal(source, value));
                Some(equal == (operator == Op::Equals))
            }

            Op::Exists | Op::NotExists | Op::Unknown => None,

            Op::Before | Op::After => {
                let (Some(source), Some(target)) = (source_value.and_then(to_date), to_date(value))
                else {
                    return Ok(None);
                };
                Some(if operator == Op::Before {
                    source < target
                } else {
                    source > target
                })
            }

            Op::In | Op::NotIn => {
                let Value::Array(values) = value else {
                    return Ok(None);
                };
                let source = match source_value {
                    Some(source @ (Value::String(_) | Value::Number(_) | Value::Null)) => source,
                    _ => return Ok(None),
                };
                let is_in = values.iter().any(|v| values_equal(v, source));
                Some(is_in == (operator == Op::In))
            }

            Op::Contains
            | Op::NotContains
            | Op::StartsWith
            | Op::EndsWith
            | Op::Matches
            | Op::NotMatches
            | Op::SemverEquals
            | Op::SemverNotEquals
            | Op::SemverGreaterThan
            | Op::SemverGreaterThanOrEquals
            | Op::SemverLessThan
            | Op::SemverLessThanOrEquals => {
                let (Some(Value::String(source)), Value::String(value)) = (source_value, value)
                else {
                    return Ok(None);
                };
                Some(match operator {
                    Op::Contains => source.contains(value.as_str()),
                    Op::NotContains => !source.contains(value.as_str()),
                    Op::StartsWith => source.starts_with(value.as_str()),
                    Op::EndsWith => source.ends_with(value.as_str()),
                    Op::Matches | Op::NotMatches => {
                        let flags = condition.regex_flags.as_deref().unwrap_or("");
                        let regex = self.reader.get_regex(value, flags)?;
                        regex.is_match(source) == (operator == Op::Matches)
                    }
                    _ => {
                        let ordering = compare_versions(source, value)?;
                        match operator {
                            Op::SemverEquals => ordering == Ordering::Equal,
                            Op::SemverNotEquals => ordering != Ordering::Equal,
                            Op::SemverGreaterThan => ordering == Ordering::Greater,
                            Op::SemverGreaterThanOrEquals => ordering != Ordering::Less,
                            Op::SemverLessThan => ordering == Ordering::Less,
                            Op::SemverLessThanOrEquals => ordering != Ordering::Greater,
                            _ => return Ok(None),
                        }
                    }
                })
            }

            Op::GreaterThan | Op::GreaterThanOrEquals | Op::LessThan | Op::LessThanOrEquals => {
                let (Some(Value::Number(source)), Value::Number(value)) = (source_value, value)
                else {
                    return Ok(None);
                };
                let (Some(source), Some(value)) = (source.as_f64(), value.as_f64()) else {
                    return Ok(None);
                };
                Some(match operator {
                    Op::GreaterThan => source > value,
                    Op::GreaterThanOrEquals => source >= value,
                    Op::LessThan => source < value,
                    Op::LessThanOrEquals => source <= value,
                    _ => return Ok(None),
                })
            }

            Op::Includes | Op::NotIncludes => {
                let Some(Value::Array(items)) = source_value else {
                    return Ok(None);
                };
                if matches!(value, Value::Array(_) | Value::Object(_)) {
                    return Ok(None);
                }
                let includes = items.iter().any(|item| values_equal(item, value));
                Some(includes == (operator == Op::Includes))
            }
        })
    }
}

/// Interpret a value as a point in time: RFC 3339, `YYYY-MM-DD`, a naive date-time (UTC) or
/// milliseconds since the Unix epoch.
fn to_date(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::Number(n) => DateTime::from_timestamp_millis(n.as_f64()? as i64),
        Value::String(s) => {
            let s = s.trim();
            if let Ok(date) = DateTime::parse_from_rfc3339(s) {
                return Some(date.with_timezone(&Utc));
            }
            if let Ok(date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
                return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
            }
            ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
                .iter()
                .find_map(|format| NaiveDateTime::parse_from_str(s, format).ok())
                .map(|date| date.and_utc())
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::{
        attributes::AttributesManager,
        datafile::Datafile,
        datafile_reader::DatafileReader,
        effects::EffectsManager,
        emitter::Emitter,
        evaluator::Evaluator,
        modules::ModulesManager,
        value::Inputs,
    };

    use super::{Condition, ConditionOperator, PlainCondition};

    struct Fixture {
        reader: DatafileReader,
        modules: ModulesManager,
        attributes: AttributesManager,
        effects: EffectsManager,
    }

    impl Fixture {
        fn new() -> Fixture {
            Fixture {
                reader: DatafileReader::new(Datafile::empty()),
                modules: ModulesManager::new(),
                attributes: AttributesManager::new(Emitter::new()),
                effects: EffectsManager::new(),
            }
        }

        fn matches(&self, conditions: serde_json::Value, payload: serde_json::Value) -> bool {
            let conditions: Condition = serde_json::from_value(conditions).unwrap();
            let mut inputs = Inputs::new();
            inputs.insert("payload".to_owned(), payload);
            Evaluator::new(&self.reader, &self.modules, &self.attributes, &self.effects)
                .conditions_checker()
                .all_are_matched(&conditions, &inputs)
        }
    }

    #[test]
    fn wildcard_and_malformed_strings() {
        let f = Fixture::new();
        assert!(f.matches(json!("*"), json!({})));
        assert!(!f.matches(json!("{not json"), json!({})));
        assert!(f.matches(
            json!(r#"{"source": "payload.a", "operator": "equals", "value": 1}"#),
            json!({"a": 1})
        ));
    }

    #[test]
    fn combinators() {
        let f = Fixture::new();
        let yes = json!({"source": "payload.a", "operator": "equals", "value": 1});
        let no = json!({"source": "payload.a", "operator": "equals", "value": 2});
        let payload = json!({"a": 1});

        assert!(!f.matches(json!({"or": []}), payload.clone()));
        assert!(f.matches(json!({"and": []}), payload.clone()));
        assert!(f.matches(json!([]), payload.clone()));

        assert!(f.matches(json!([yes, yes]), payload.clone()));
        assert!(!f.matches(json!([yes, no]), payload.clone()));
        assert!(f.matches(json!({"or": [no, yes]}), payload.clone()));
        assert!(!f.matches(json!({"and": [yes, no]}), payload.clone()));

        assert!(f.matches(json!({"not": [no]}), payload.clone()));
        assert!(!f.matches(json!({"not": [yes]}), payload.clone()));
        assert!(!f.matches(json!({"not": [no, yes]}), payload.clone()));

        assert!(f.matches(
            json!({"and": [yes, {"or": [no, {"not": [no]}]}]}),
            payload
        ));
    }

    #[test]
    fn equality_and_existence() {
        let f = Fixture::new();
        let payload = json!({"n": 1, "s": "x", "nil": null, "obj": {"a": [1]}});

        assert!(f.matches(json!({"source": "payload.n", "operator": "equals", "value": 1.0}), payload.clone()));
        assert!(f.matches(json!({"source": "payload.s", "operator": "notEquals", "value": "y"}), payload.clone()));
        assert!(f.matches(json!({"source": "payload.obj", "operator": "equals", "value": {"a": [1]}}), payload.clone()));
        assert!(f.matches(json!({"source": "payload.nil", "operator": "equals", "value": null}), payload.clone()));

        assert!(f.matches(json!({"source": "payload.s", "operator": "exists"}), payload.clone()));
        assert!(f.matches(json!({"source": "payload.nil", "operator": "exists"}), payload.clone()));
        assert!(f.matches(json!({"source": "payload.missing", "operator": "notExists"}), payload.clone()));
        assert!(!f.matches(json!({"source": "payload.missing", "operator": "exists"}), payload));
    }

    #[test]
    fn missing_value_is_not_matched() {
        let f = Fixture::new();
        assert!(!f.matches(json!({"source": "payload.s", "operator": "equals"}), json!({"s": "x"})));
        assert!(!f.matches(json!({"source": "payload.s", "operator": "notEquals"}), json!({"s": "x"})));
    }

    #[test]
    fn membership() {
        let f = Fixture::new();
        let payload = json!({"country": "nl", "age": 25, "nil": null, "flag": true});

        assert!(f.matches(json!({"source": "payload.country", "operator": "in", "value": ["de", "nl"]}), payload.clone()));
        assert!(f.matches(json!({"source": "payload.age", "operator": "in", "value": [25]}), payload.clone()));
        assert!(f.matches(json!({"source": "payload.nil", "operator": "in", "value": [null]}), payload.clone()));
        assert!(f.matches(json!({"source": "payload.country", "operator": "notIn", "value": ["de"]}), payload.clone()));
        // booleans are not scalar sources for membership
        assert!(!f.matches(json!({"source": "payload.flag", "operator": "notIn", "value": [false]}), payload.clone()));
        assert!(!f.matches(json!({"source": "payload.country", "operator": "in", "value": "nl"}), payload));
    }

    #[test]
    fn strings_and_regexes() {
        let f = Fixture::new();
        let payload = json!({"url": "https://example.com/Checkout"});

        assert!(f.matches(json!({"source": "payload.url", "operator": "contains", "value": "example"}), payload.clone()));
        assert!(f.matches(json!({"source": "payload.url", "operator": "notContains", "value": "cart"}), payload.clone()));
        assert!(f.matches(json!({"source": "payload.url", "operator": "startsWith", "value": "https://"}), payload.clone()));
        assert!(f.matches(json!({"source": "payload.url", "operator": "endsWith", "value": "Checkout"}), payload.clone()));
        assert!(!f.matches(json!({"source": "payload.url", "operator": "matches", "value": "checkout$"}), payload.clone()));
        assert!(f.matches(json!({"source": "payload.url", "operator": "matches", "value": "checkout$", "regexFlags": "i"}), payload.clone()));
        assert!(f.matches(json!({"source": "payload.url", "operator": "notMatches", "value": "^ftp"}), payload.clone()));
        // invalid regex fails closed, for both polarities
        assert!(!f.matches(json!({"source": "payload.url", "operator": "matches", "value": "("}), payload.clone()));
        assert!(!f.matches(json!({"source": "payload.url", "operator": "notMatches", "value": "("}), payload.clone()));
        // wrong operand types
        assert!(!f.matches(json!({"source": "payload.url", "operator": "contains", "value": 1}), payload));
    }

    #[test]
    fn semver() {
        let f = Fixture::new();
        let payload = json!({"version": "1.2.3"});

        assert!(f.matches(json!({"source": "payload.version", "operator": "semverEquals", "value": "v1.2.3"}), payload.clone()));
        assert!(f.matches(json!({"source": "payload.version", "operator": "semverGreaterThan", "value": "1.2.3-beta.1"}), payload.clone()));
        assert!(f.matches(json!({"source": "payload.version", "operator": "semverGreaterThanOrEquals", "value": "1.2"}), payload.clone()));
        assert!(f.matches(json!({"source": "payload.version", "operator": "semverLessThan", "value": "1.10.0"}), payload.clone()));
        assert!(f.matches(json!({"source": "payload.version", "operator": "semverLessThanOrEquals", "value": "1.2.x"}), payload.clone()));
        assert!(!f.matches(json!({"source": "payload.version", "operator": "semverNotEquals", "value": "not a version"}), payload));
    }

    #[test]
    fn numbers() {
        let f = Fixture::new();
        let payload = json!({"age": 25, "s": "25"});

        assert!(f.matches(json!({"source": "payload.age", "operator": "greaterThan", "value": 18}), payload.clone()));
        assert!(f.matches(json!({"source": "payload.age", "operator": "greaterThanOrEquals", "value": 25}), payload.clone()));
        assert!(f.matches(json!({"source": "payload.age", "operator": "lessThan", "value": 25.5}), payload.clone()));
        assert!(f.matches(json!({"source": "payload.age", "operator": "lessThanOrEquals", "value": 25}), payload.clone()));
        assert!(!f.matches(json!({"source": "payload.s", "operator": "greaterThan", "value": 1}), payload));
    }

    #[test]
    fn dates() {
        let f = Fixture::new();
        let payload = json!({"at": "2024-03-01T10:00:00Z", "ms": 1_700_000_000_000u64});

        assert!(f.matches(json!({"source": "payload.at", "operator": "before", "value": "2024-03-02"}), payload.clone()));
        assert!(f.matches(json!({"source": "payload.at", "operator": "after", "value": "2024-03-01T09:59:59+00:00"}), payload.clone()));
        assert!(f.matches(json!({"source": "payload.ms", "operator": "before", "value": "2024-01-01"}), payload.clone()));
        assert!(!f.matches(json!({"source": "payload.at", "operator": "before", "value": "yesterday"}), payload));
    }

    #[test]
    fn array_sources() {
        let f = Fixture::new();
        let payload = json!({"tags": ["a", "b", 3]});

        assert!(f.matches(json!({"source": "payload.tags", "operator": "includes", "value": "a"}), payload.clone()));
        assert!(f.matches(json!({"source": "payload.tags", "operator": "includes", "value": 3}), payload.clone()));
        assert!(f.matches(json!({"source": "payload.tags", "operator": "notIncludes", "value": "c"}), payload.clone()));
        assert!(!f.matches(json!({"source": "payload.tags", "operator": "includes", "value": ["a"]}), payload));
    }

    #[test]
    fn leaf_requires_a_source() {
        assert!(serde_json::from_value::<PlainCondition>(json!({"operator": "exists"})).is_err());

        let condition: PlainCondition =
            serde_json::from_value(json!({"attribute": "userId", "operator": "exists"})).unwrap();
        assert_eq!(condition.operator, ConditionOperator::Exists);
        assert_eq!(condition.value, None);
    }

    #[test]
    fn unknown_operators_only_fail_their_leaf() {
        let f = Fixture::new();
        let unknown = json!({"source": "payload.x", "operator": "futureOperator", "value": 1});
        let payload = json!({"x": 1});

        let condition: PlainCondition = serde_json::from_value(unknown.clone()).unwrap();
        assert_eq!(condition.operator, ConditionOperator::Unknown);

        assert!(!f.matches(unknown.clone(), payload.clone()));
        assert!(f.matches(json!({"not": [unknown]}), payload.clone()));
        assert!(!f.matches(json!({"source": "payload.x", "operator": "futureOperator"}), payload));
    }

    #[test]
    fn unrecognized_shapes_are_not_matched() {
        let f = Fixture::new();
        let yes = json!({"source": "payload.a", "operator": "equals", "value": 1});
        let payload = json!({"a": 1});

        let condition: Condition = serde_json::from_value(json!({"xor": [yes]})).unwrap();
        assert!(matches!(condition, Condition::Invalid(_)));

        assert!(!f.matches(json!({"xor": [yes]}), payload.clone()));
        assert!(!f.matches(json!(42), payload.clone()));
        assert!(!f.matches(json!([yes, {"operator": "exists"}]), payload.clone()));
        assert!(f.matches(json!({"or": [{"xor": []}, yes]}), payload.clone()));
        assert!(f.matches(json!({"not": [{"xor": []}]}), payload));
    }
}
