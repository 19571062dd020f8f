//! Facts: named values recomputed every tick, never persisted.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Flat fact mapping handed to rule evaluation.
pub type FactMap = HashMap<String, FactValue>;

/// A fact's value. Rules compare numerically where possible; text facts
/// only support equality.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FactValue {
    Num(f64),
    Text(String),
    Flag(bool),
}

impl FactValue {
    /// Numeric view: flags coerce to 0/1, text to None.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FactValue::Num(v) => Some(*v),
            FactValue::Flag(b) => Some(if *b { 1.0 } else { 0.0 }),
            FactValue::Text(_) => None,
        }
    }
}

impl From<f64> for FactValue {
    fn from(v: f64) -> Self {
        FactValue::Num(v)
    }
}

impl From<bool> for FactValue {
    fn from(v: bool) -> Self {
        FactValue::Flag(v)
    }
}

impl From<&str> for FactValue {
    fn from(v: &str) -> Self {
        FactValue::Text(v.to_string())
    }
}

/// Scope a fact belongs to. Informational; the merged map is flat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FactScope {
    Instrument,
    Portfolio,
    Session,
    StrategyParam,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_coercion() {
        assert_eq!(FactValue::Num(2.5).as_f64(), Some(2.5));
        assert_eq!(FactValue::Flag(true).as_f64(), Some(1.0));
        assert_eq!(FactValue::Text("x".into()).as_f64(), None);
    }

    #[test]
    fn test_untagged_serde() {
        let v: FactValue = serde_json::from_str("42.0").unwrap();
        assert_eq!(v, FactValue::Num(42.0));
        let v: FactValue = serde_json::from_str("\"breakout\"").unwrap();
        assert_eq!(v, FactValue::Text("breakout".into()));
    }
}
