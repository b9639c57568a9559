//! Parameter dimensions and the dynamic value type carried in combo maps.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A parameter name -> concrete value map, shared by `ComboResult`,
/// `RoundSummary::best_params`, and recommendations. `BTreeMap` keeps
/// serialized output and "contains all parameter names" checks deterministic.
pub type ParamMap = BTreeMap<String, ParamValue>;

/// The declared type of one search dimension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ParamType {
    Float,
    Int32,
    Int64,
    Bool,
    String,
}

impl ParamType {
    /// Only numeric dimensions may be grid-searched automatically.
    pub fn is_numeric(self) -> bool {
        matches!(self, ParamType::Float | ParamType::Int32 | ParamType::Int64)
    }
}

/// One dimension of the search space.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepParam {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParamType,
    pub start: f64,
    pub end: f64,
    #[serde(default)]
    pub step: Option<f64>,
    #[serde(default)]
    pub values: Option<Vec<ParamValue>>,
}

/// The dynamic value carried in a `ComboResult`'s parameter map.
///
/// Coercion rules: float <-> int preserve finite numeric value; bool <-> float
/// uses a `1.0`/`0.0` mapping; string -> numeric parses (trimmed); string ->
/// bool accepts `"true"`/`"false"` (case-insensitive, trimmed).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Float(f64),
    Int32(i32),
    Int64(i64),
    Bool(bool),
    Str(String),
}

impl ParamValue {
    /// Coerce to a finite numeric value, per the rules in the module docs.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ParamValue::Float(v) => Some(*v),
            ParamValue::Int32(v) => Some(*v as f64),
            ParamValue::Int64(v) => Some(*v as f64),
            ParamValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            ParamValue::Str(s) => s.trim().parse::<f64>().ok(),
        }
    }

    /// Coerce to a bool, per the rules in the module docs.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ParamValue::Bool(b) => Some(*b),
            ParamValue::Float(v) => Some(*v != 0.0),
            ParamValue::Int32(v) => Some(*v != 0),
            ParamValue::Int64(v) => Some(*v != 0),
            ParamValue::Str(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            ParamValue::Float(_) | ParamValue::Int32(_) | ParamValue::Int64(_)
        )
    }
}

impl From<f64> for ParamValue {
    fn from(v: f64) -> Self {
        ParamValue::Float(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn float_int_roundtrip_preserves_value() {
        assert_eq!(ParamValue::Int32(7).as_f64(), Some(7.0));
        assert_eq!(ParamValue::Int64(-3).as_f64(), Some(-3.0));
    }

    #[test]
    fn bool_float_mapping() {
        assert_eq!(ParamValue::Bool(true).as_f64(), Some(1.0));
        assert_eq!(ParamValue::Bool(false).as_f64(), Some(0.0));
        assert_eq!(ParamValue::Float(0.0).as_bool(), Some(false));
        assert_eq!(ParamValue::Float(2.5).as_bool(), Some(true));
    }

    #[test]
    fn string_numeric_parse_is_trimmed() {
        assert_eq!(ParamValue::Str("  3.5 ".into()).as_f64(), Some(3.5));
        assert_eq!(ParamValue::Str("nope".into()).as_f64(), None);
    }

    #[test]
    fn string_bool_parse() {
        assert_eq!(ParamValue::Str(" TRUE ".into()).as_bool(), Some(true));
        assert_eq!(ParamValue::Str("false".into()).as_bool(), Some(false));
        assert_eq!(ParamValue::Str("maybe".into()).as_bool(), None);
    }
}
