//! Declarative search filters and their compilation into Qdrant's filter JSON.
//!
//! Wire format of a clause:
//!
//! ```text
//! {"key": "type", "type": "must" | "must_not" | "should",
//!  "range": {"gte": 1, "lt": 5}
//!  | "match": {"value": ..} | {"text": ..} | {"any": [..]}
//!  | "in": {"any": [..]}}
//! ```

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClauseType {
    #[default]
    Must,
    MustNot,
    Should,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RangeSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gte: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lt: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lte: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub any: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnySpec {
    pub any: Vec<serde_json::Value>,
}

/// One declarative filter clause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterClause {
    pub key: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub clause_type: Option<ClauseType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<RangeSpec>,
    #[serde(rename = "match", default, skip_serializing_if = "Option::is_none")]
    pub match_spec: Option<MatchSpec>,
    #[serde(rename = "in", default, skip_serializing_if = "Option::is_none")]
    pub in_spec: Option<AnySpec>,
}

impl FilterClause {
    fn bare(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            clause_type: None,
            range: None,
            match_spec: None,
            in_spec: None,
        }
    }

    /// `key` must equal one of `values`.
    pub fn one_of<V: Into<serde_json::Value>>(
        key: impl Into<String>,
        values: impl IntoIterator<Item = V>,
    ) -> Self {
        Self {
            in_spec: Some(AnySpec {
                any: values.into_iter().map(Into::into).collect(),
            }),
            ..Self::bare(key)
        }
    }

    pub fn equals(key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            match_spec: Some(MatchSpec {
                value: Some(value.into()),
                ..MatchSpec::default()
            }),
            ..Self::bare(key)
        }
    }

    pub fn within(key: impl Into<String>, range: RangeSpec) -> Self {
        Self {
            range: Some(range),
            ..Self::bare(key)
        }
    }

    pub fn with_type(mut self, clause_type: ClauseType) -> Self {
        self.clause_type = Some(clause_type);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MatchCondition {
    Value { value: serde_json::Value },
    Text { text: String },
    Any { any: Vec<serde_json::Value> },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Range(RangeSpec),
    Match(MatchCondition),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldCondition {
    pub key: String,
    #[serde(flatten)]
    pub condition: Condition,
}

/// Qdrant filter with its three condition groups.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QdrantFilter {
    pub must: Vec<FieldCondition>,
    pub must_not: Vec<FieldCondition>,
    pub should: Vec<FieldCondition>,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum FilterError {
    #[error("filter clause on '{key}' has no supported operator (range, match, in)")]
    UnsupportedOperator { key: String },
    #[error("match clause on '{key}' needs one of value, text or any")]
    EmptyMatch { key: String },
}

fn field_condition(clause: &FilterClause) -> Result<FieldCondition, FilterError> {
    let condition = if let Some(range) = &clause.range {
        Condition::Range(range.clone())
    } else if let Some(spec) = &clause.match_spec {
        if let Some(text) = &spec.text {
            Condition::Match(MatchCondition::Text { text: text.clone() })
        } else if let Some(any) = &spec.any {
            Condition::Match(MatchCondition::Any { any: any.clone() })
        } else if let Some(value) = &spec.value {
            Condition::Match(MatchCondition::Value {
                value: value.clone(),
            })
        } else {
            return Err(FilterError::EmptyMatch {
                key: clause.key.clone(),
            });
        }
    } else if let Some(in_spec) = &clause.in_spec {
        Condition::Match(MatchCondition::Any {
            any: in_spec.any.clone(),
        })
    } else {
        return Err(FilterError::UnsupportedOperator {
            key: clause.key.clone(),
        });
    };

    Ok(FieldCondition {
        key: clause.key.clone(),
        condition,
    })
}

/// Compiles clauses into a Qdrant filter; `None` when there are no clauses.
pub fn compile_filter(clauses: &[FilterClause]) -> Result<Option<QdrantFilter>, FilterError> {
    if clauses.is_empty() {
        return Ok(None);
    }

    let mut filter = QdrantFilter::default();
    for clause in clauses {
        let condition = field_condition(clause)?;
        match clause.clause_type.unwrap_or_default() {
            ClauseType::Must => filter.must.push(condition),
            ClauseType::MustNot => filter.must_not.push(condition),
            ClauseType::Should => filter.should.push(condition),
        }
    }
    Ok(Some(filter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn clauses(value: serde_json::Value) -> Vec<FilterClause> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_empty_clauses_compile_to_none() {
        assert_eq!(compile_filter(&[]).unwrap(), None);
    }

    #[test]
    fn test_every_operator_kind_lands_in_its_group() {
        let spec = clauses(json!([
            {"key": "year", "range": {"gte": 2000, "lt": 2020}},
            {"key": "lang", "type": "must_not", "match": {"value": "de"}},
            {"key": "content", "type": "should", "match": {"text": "alice"}},
            {"key": "tag", "type": "must", "match": {"any": ["a", "b"]}},
            {"key": "type", "type": "should", "in": {"any": ["Person", "Alias"]}}
        ]));

        let filter = compile_filter(&spec).unwrap().unwrap();
        let rendered = serde_json::to_value(&filter).unwrap();
        assert_eq!(
            rendered,
            json!({
                "must": [
                    {"key": "year", "range": {"gte": 2000.0, "lt": 2020.0}},
                    {"key": "tag", "match": {"any": ["a", "b"]}}
                ],
                "must_not": [
                    {"key": "lang", "match": {"value": "de"}}
                ],
                "should": [
                    {"key": "content", "match": {"text": "alice"}},
                    {"key": "type", "match": {"any": ["Person", "Alias"]}}
                ]
            })
        );
    }

    #[test]
    fn test_in_is_sugar_for_match_any() {
        let via_in = compile_filter(&[FilterClause::one_of("type", ["Person"])]).unwrap();
        let via_match = compile_filter(&clauses(json!([
            {"key": "type", "match": {"any": ["Person"]}}
        ])))
        .unwrap();
        assert_eq!(via_in, via_match);
    }

    #[test]
    fn test_range_takes_precedence_over_match() {
        let spec = clauses(json!([
            {"key": "score", "range": {"gt": 1}, "match": {"value": 3}}
        ]));
        let filter = compile_filter(&spec).unwrap().unwrap();
        assert!(matches!(filter.must[0].condition, Condition::Range(_)));
    }

    #[test]
    fn test_text_takes_precedence_over_any_and_value() {
        let spec = clauses(json!([
            {"key": "content", "match": {"value": "x", "any": ["y"], "text": "z"}}
        ]));
        let filter = compile_filter(&spec).unwrap().unwrap();
        assert_eq!(
            filter.must[0].condition,
            Condition::Match(MatchCondition::Text {
                text: "z".to_string()
            })
        );
    }

    #[test]
    fn test_clause_without_operator_is_rejected() {
        let spec = clauses(json!([{"key": "type"}]));
        assert_eq!(
            compile_filter(&spec).unwrap_err(),
            FilterError::UnsupportedOperator {
                key: "type".to_string()
            }
        );
    }

    #[test]
    fn test_empty_match_is_rejected() {
        let spec = clauses(json!([{"key": "type", "match": {}}]));
        assert!(matches!(
            compile_filter(&spec),
            Err(FilterError::EmptyMatch { .. })
        ));
    }

    #[test]
    fn test_unknown_clause_type_fails_to_parse() {
        let parsed: Result<Vec<FilterClause>, _> =
            serde_json::from_value(json!([{"key": "a", "type": "maybe", "in": {"any": [1]}}]));
        assert!(parsed.is_err());
    }

    #[test]
    fn test_builders_round_trip_through_wire_format() {
        let clause = FilterClause::equals("lang", "en").with_type(ClauseType::MustNot);
        let value = serde_json::to_value(&clause).unwrap();
        assert_eq!(
            value,
            json!({"key": "lang", "type": "must_not", "match": {"value": "en"}})
        );
        let back: FilterClause = serde_json::from_value(value).unwrap();
        assert_eq!(back, clause);
    }
}
