//! Runtime data values.
//!
//! The engine treats values as opaque: it stores them, ships them to workers and
//! hands them to consumers. Only function bodies interpret them.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A value produced by a calculation function or sourced from market data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DataValue {
    /// Floating point scalar (prices, Greeks, rates).
    Double(f64),

    /// Exact decimal scalar (notionals, quantities).
    Decimal(Decimal),

    /// Integer scalar.
    Integer(i64),

    /// Boolean flag.
    Boolean(bool),

    /// Free text.
    Text(String),

    /// Vector of doubles (e.g. a bucketed sensitivity).
    Vector(Vec<f64>),

    /// Curve as (tenor in years, value) points.
    Curve(Vec<(f64, f64)>),

    /// Arbitrary structured payload.
    Json(serde_json::Value),
}

impl DataValue {
    /// Returns the value as a double, if it is numeric.
    pub fn as_f64(&self) -> Option<f64> {
        use rust_decimal::prelude::ToPrimitive;

        match self {
            DataValue::Double(v) => Some(*v),
            DataValue::Decimal(d) => d.to_f64(),
            DataValue::Integer(i) => Some(*i as f64),
            _ => None,
        }
    }

    /// Returns the value as a decimal, if it is numeric.
    pub fn as_decimal(&self) -> Option<Decimal> {
        match self {
            DataValue::Decimal(d) => Some(*d),
            DataValue::Integer(i) => Some(Decimal::from(*i)),
            DataValue::Double(v) => Decimal::from_f64_retain(*v),
            _ => None,
        }
    }

    /// Returns the curve points, if this is a curve.
    pub fn as_curve(&self) -> Option<&[(f64, f64)]> {
        match self {
            DataValue::Curve(points) => Some(points),
            _ => None,
        }
    }

    /// Returns the text, if this is a text value.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            DataValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Short name of the value kind, used in logs and diagnostics.
    pub fn kind(&self) -> &'static str {
        match self {
            DataValue::Double(_) => "double",
            DataValue::Decimal(_) => "decimal",
            DataValue::Integer(_) => "integer",
            DataValue::Boolean(_) => "boolean",
            DataValue::Text(_) => "text",
            DataValue::Vector(_) => "vector",
            DataValue::Curve(_) => "curve",
            DataValue::Json(_) => "json",
        }
    }
}

impl fmt::Display for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataValue::Double(v) => write!(f, "{}", v),
            DataValue::Decimal(d) => write!(f, "{}", d),
            DataValue::Integer(i) => write!(f, "{}", i),
            DataValue::Boolean(b) => write!(f, "{}", b),
            DataValue::Text(s) => write!(f, "{}", s),
            DataValue::Vector(v) => write!(f, "vector[{}]", v.len()),
            DataValue::Curve(points) => write!(f, "curve[{}]", points.len()),
            DataValue::Json(v) => write!(f, "{}", v),
        }
    }
}

impl From<f64> for DataValue {
    fn from(v: f64) -> Self {
        DataValue::Double(v)
    }
}

impl From<Decimal> for DataValue {
    fn from(d: Decimal) -> Self {
        DataValue::Decimal(d)
    }
}

impl From<i64> for DataValue {
    fn from(i: i64) -> Self {
        DataValue::Integer(i)
    }
}

impl From<bool> for DataValue {
    fn from(b: bool) -> Self {
        DataValue::Boolean(b)
    }
}

impl From<&str> for DataValue {
    fn from(s: &str) -> Self {
        DataValue::Text(s.to_string())
    }
}

impl From<String> for DataValue {
    fn from(s: String) -> Self {
        DataValue::Text(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_numeric_conversions() {
        assert_eq!(DataValue::Double(1.5).as_f64(), Some(1.5));
        assert_eq!(DataValue::Integer(3).as_f64(), Some(3.0));
        assert_eq!(DataValue::Decimal(dec!(2.25)).as_f64(), Some(2.25));
        assert_eq!(DataValue::Integer(7).as_decimal(), Some(dec!(7)));
        assert_eq!(DataValue::Text("x".into()).as_f64(), None);
    }

    #[test]
    fn test_kind_and_display() {
        let curve = DataValue::Curve(vec![(1.0, 0.03), (2.0, 0.035)]);
        assert_eq!(curve.kind(), "curve");
        assert_eq!(curve.to_string(), "curve[2]");
        assert_eq!(curve.as_curve().map(|c| c.len()), Some(2));
        assert_eq!(DataValue::from("USD").as_text(), Some("USD"));
    }

    #[test]
    fn test_json_roundtrip() {
        let value = DataValue::Decimal(dec!(100.125));
        let json = serde_json::to_string(&value).unwrap();
        let back: DataValue = serde_json::from_str(&json).unwrap();
        assert_eq!(back, value);
    }
}
