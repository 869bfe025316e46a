//! Filter predicates over metadata records
//!
//! Predicates are plain values: leaves test one attribute, and `And` / `Or`
//! / `Not` compose them. Evaluation is short-circuit and allocation-free,
//! O(predicate depth) per record.

use serde::{Deserialize, Serialize};

use crate::metadata::{validate_date, Bias, DocType, MetadataRecord};

/// Comparison operator for numeric attribute predicates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NumericOp {
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = "<=")]
    Le,
    #[serde(rename = "=")]
    Eq,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = ">")]
    Gt,
}

impl NumericOp {
    #[inline]
    fn holds(self, lhs: f64, rhs: f64) -> bool {
        match self {
            NumericOp::Lt => lhs < rhs,
            NumericOp::Le => lhs <= rhs,
            NumericOp::Eq => lhs == rhs,
            NumericOp::Ge => lhs >= rhs,
            NumericOp::Gt => lhs > rhs,
        }
    }
}

/// A filter over metadata records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Filter {
    /// `doc_type == value`.
    DocType { value: DocType },

    /// `date ∈ [from, to]`, both ends inclusive. Records without a date
    /// never match.
    DateRange { from: String, to: String },

    /// `asset_tag == value`. Records without a tag never match.
    AssetTag { value: String },

    /// `bias ∈ values`. Records without a bias never match.
    BiasIn { values: Vec<Bias> },

    /// `attributes[name] op value`. Records lacking the attribute, or
    /// holding a non-numeric value under that name, never match.
    Numeric {
        name: String,
        op: NumericOp,
        value: f64,
    },

    And(Vec<Filter>),
    Or(Vec<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn doc_type(value: DocType) -> Self {
        Filter::DocType { value }
    }

    pub fn date_range(from: impl Into<String>, to: impl Into<String>) -> Self {
        Filter::DateRange {
            from: from.into(),
            to: to.into(),
        }
    }

    pub fn asset_tag(value: impl Into<String>) -> Self {
        Filter::AssetTag {
            value: value.into(),
        }
    }

    pub fn bias_in(values: impl Into<Vec<Bias>>) -> Self {
        Filter::BiasIn {
            values: values.into(),
        }
    }

    pub fn numeric(name: impl Into<String>, op: NumericOp, value: f64) -> Self {
        Filter::Numeric {
            name: name.into(),
            op,
            value,
        }
    }

    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::And(filters)
    }

    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Or(filters)
    }

    pub fn negate(filter: Filter) -> Self {
        Filter::Not(Box::new(filter))
    }

    /// Evaluate against a record. Short-circuits on `And` / `Or`.
    pub fn matches(&self, record: &MetadataRecord) -> bool {
        match self {
            Filter::DocType { value } => record.doc_type == *value,

            Filter::DateRange { from, to } => match &record.date {
                Some(date) => date.as_str() >= from.as_str() && date.as_str() <= to.as_str(),
                None => false,
            },

            Filter::AssetTag { value } => record.asset_tag.as_deref() == Some(value.as_str()),

            Filter::BiasIn { values } => match record.bias {
                Some(bias) => values.contains(&bias),
                None => false,
            },

            Filter::Numeric { name, op, value } => match record.numeric(name) {
                Some(actual) => op.holds(actual, *value),
                None => false,
            },

            Filter::And(filters) => filters.iter().all(|f| f.matches(record)),
            Filter::Or(filters) => filters.iter().any(|f| f.matches(record)),
            Filter::Not(filter) => !filter.matches(record),
        }
    }

    /// Structural validation: date strings well-formed, ranges ordered,
    /// combinators and bias sets non-empty, numeric comparisons finite.
    pub fn validate(&self) -> Result<(), String> {
        match self {
            Filter::DocType { .. } | Filter::AssetTag { .. } => Ok(()),

            Filter::DateRange { from, to } => {
                validate_date(from).map_err(|e| e.to_string())?;
                validate_date(to).map_err(|e| e.to_string())?;
                if from > to {
                    return Err(format!("empty date range: {from} > {to}"));
                }
                Ok(())
            }

            Filter::BiasIn { values } => {
                if values.is_empty() {
                    return Err("bias set is empty".to_string());
                }
                Ok(())
            }

            Filter::Numeric { name, value, .. } => {
                if name.is_empty() {
                    return Err("numeric attribute name is empty".to_string());
                }
                if !value.is_finite() {
                    return Err(format!("non-finite comparison value for {name:?}"));
                }
                Ok(())
            }

            Filter::And(filters) | Filter::Or(filters) => {
                if filters.is_empty() {
                    return Err("empty combinator".to_string());
                }
                filters.iter().try_for_each(Filter::validate)
            }

            Filter::Not(filter) => filter.validate(),
        }
    }
}
