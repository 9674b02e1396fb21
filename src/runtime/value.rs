//! Runtime value representation (spec.md §3): primitives stored unboxed in
//! typed locals when possible; everything else is a heap reference.
//!
//! Grounded on the teacher's `types::decimal::Decimal` for the
//! arbitrary-precision decimal representation (`coefficient * 10^exponent`
//! via `num-bigint`) and on its hybrid `Value` enum (immediate values
//! inline, heap values behind an id) for the overall shape — adapted here
//! to a smaller, closed set of Jactl's own primitive kinds.

use std::fmt;

use num_bigint::BigInt;
use num_traits::Zero;

use crate::runtime::heap::HeapId;

/// Exact arbitrary-precision rational-of-ten: `coefficient * 10^exponent`
/// (spec.md §4.1's `DECIMAL_CONST`, §9's decimal representation note).
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Decimal {
    pub coefficient: BigInt,
    pub exponent: i32,
}

impl Decimal {
    #[must_use]
    pub fn zero() -> Self {
        Self { coefficient: BigInt::zero(), exponent: 0 }
    }

    /// Parses literal text like `"1.250"` or `"0.1"` into exact
    /// coefficient/exponent form, without going through a lossy `f64`.
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        let (int_part, frac_part) = match text.split_once('.') {
            Some((i, f)) => (i, f),
            None => (text, ""),
        };
        let digits = format!("{int_part}{frac_part}");
        let coefficient: BigInt = digits.parse().ok()?;
        let exponent = -(frac_part.len() as i32);
        Some(Self { coefficient, exponent })
    }

    fn rescale_pair(a: &Decimal, b: &Decimal) -> (BigInt, BigInt, i32) {
        let exponent = a.exponent.min(b.exponent);
        let ac = &a.coefficient * BigInt::from(10).pow((a.exponent - exponent) as u32);
        let bc = &b.coefficient * BigInt::from(10).pow((b.exponent - exponent) as u32);
        (ac, bc, exponent)
    }

    #[must_use]
    pub fn add(&self, other: &Decimal) -> Decimal {
        let (ac, bc, exponent) = Self::rescale_pair(self, other);
        Decimal { coefficient: ac + bc, exponent }
    }

    #[must_use]
    pub fn sub(&self, other: &Decimal) -> Decimal {
        let (ac, bc, exponent) = Self::rescale_pair(self, other);
        Decimal { coefficient: ac - bc, exponent }
    }

    #[must_use]
    pub fn mul(&self, other: &Decimal) -> Decimal {
        Decimal { coefficient: &self.coefficient * &other.coefficient, exponent: self.exponent + other.exponent }
    }

    #[must_use]
    pub fn neg(&self) -> Decimal {
        Decimal { coefficient: -&self.coefficient, exponent: self.exponent }
    }

    #[must_use]
    pub fn cmp(&self, other: &Decimal) -> std::cmp::Ordering {
        let (ac, bc, _) = Self::rescale_pair(self, other);
        ac.cmp(&bc)
    }

    #[must_use]
    pub fn to_f64(&self) -> f64 {
        let coeff: f64 = self.coefficient.to_string().parse().unwrap_or(0.0);
        coeff * 10f64.powi(self.exponent)
    }
}

impl fmt::Display for Decimal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exponent >= 0 {
            return write!(f, "{}{}", self.coefficient, "0".repeat(self.exponent as usize));
        }
        let digits = self.coefficient.to_string();
        let (sign, digits) = if let Some(stripped) = digits.strip_prefix('-') { ("-", stripped) } else { ("", digits.as_str()) };
        let point = (-self.exponent) as usize;
        if digits.len() <= point {
            write!(f, "{sign}0.{:0>width$}", digits, width = point)
        } else {
            let split = digits.len() - point;
            write!(f, "{sign}{}.{}", &digits[..split], &digits[split..])
        }
    }
}

/// A runtime value. Primitive kinds are stored inline; `Str` is immutable
/// so it's also stored inline (cloning is cheap relative to the
/// indirection an arena slot would add); everything mutable or
/// potentially cyclic (lists, maps, instances, arrays, function-values,
/// capture cells) lives behind a [`HeapId`] (spec.md §9).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Byte(u8),
    Int(i32),
    Long(i64),
    Double(f64),
    Decimal(Decimal),
    Str(String),
    Ref(HeapId),
}

impl Value {
    #[must_use]
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Byte(b) => *b != 0,
            Value::Int(i) => *i != 0,
            Value::Long(l) => *l != 0,
            Value::Double(d) => *d != 0.0,
            Value::Decimal(d) => !d.coefficient.is_zero(),
            Value::Str(s) => !s.is_empty(),
            Value::Ref(_) => true,
        }
    }

    #[must_use]
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Byte(_) => "byte",
            Value::Int(_) => "int",
            Value::Long(_) => "long",
            Value::Double(_) => "double",
            Value::Decimal(_) => "Decimal",
            Value::Str(_) => "String",
            Value::Ref(_) => "Object",
        }
    }

    #[must_use]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Byte(b) => Some(f64::from(*b)),
            Value::Int(i) => Some(f64::from(*i)),
            Value::Long(l) => Some(*l as f64),
            Value::Double(d) => Some(*d),
            Value::Decimal(d) => Some(d.to_f64()),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Byte(b) => Some(i64::from(*b)),
            Value::Int(i) => Some(i64::from(*i)),
            Value::Long(l) => Some(*l),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decimal_parses_and_displays_exactly() {
        let d = Decimal::parse("1.250").unwrap();
        assert_eq!(d.to_string(), "1.250");
    }

    #[test]
    fn decimal_addition_rescales() {
        let a = Decimal::parse("1.5").unwrap();
        let b = Decimal::parse("0.25").unwrap();
        assert_eq!(a.add(&b).to_string(), "1.75");
    }

    #[test]
    fn truthiness_of_zero_values() {
        assert!(!Value::Int(0).truthy());
        assert!(!Value::Str(String::new()).truthy());
        assert!(Value::Int(1).truthy());
    }
}
