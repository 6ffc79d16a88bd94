use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// The dynamic value stored at container fields and produced by evaluating
/// a reference.
///
/// Arithmetic on mismatched numeric kinds promotes integers to floats.
/// Domain errors (division by zero, a negative base to a fractional power,
/// and so on) never raise: they produce [`Value::Float(f64::NAN)`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    /// `(real, imaginary)`.
    Complex(f64, f64),
    Str(String),
    List(Vec<Value>),
    Map(IndexMap<String, Value>),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) => Some(*f),
            Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    pub fn is_nan(&self) -> bool {
        matches!(self, Value::Float(f) if f.is_nan())
    }

    fn nan() -> Value {
        Value::Float(f64::NAN)
    }

    fn numeric_op(
        &self,
        rhs: &Value,
        int_op: impl Fn(i64, i64) -> Option<i64>,
        float_op: impl Fn(f64, f64) -> f64,
    ) -> Value {
        match (self, rhs) {
            (Value::Int(a), Value::Int(b)) => match int_op(*a, *b) {
                Some(v) => Value::Int(v),
                None => Value::nan(),
            },
            _ => match (self.as_f64(), rhs.as_f64()) {
                (Some(a), Some(b)) => Value::Float(float_op(a, b)),
                _ => Value::nan(),
            },
        }
    }

    pub fn add(&self, rhs: &Value) -> Value {
        if let (Value::Str(a), Value::Str(b)) = (self, rhs) {
            return Value::Str(format!("{a}{b}"));
        }
        self.numeric_op(rhs, |a, b| a.checked_add(b), |a, b| a + b)
    }

    pub fn sub(&self, rhs: &Value) -> Value {
        self.numeric_op(rhs, |a, b| a.checked_sub(b), |a, b| a - b)
    }

    pub fn mul(&self, rhs: &Value) -> Value {
        self.numeric_op(rhs, |a, b| a.checked_mul(b), |a, b| a * b)
    }

    pub fn div(&self, rhs: &Value) -> Value {
        match (self, rhs) {
            (Value::Int(_) | Value::Float(_) | Value::Bool(_), _) => match rhs.as_f64() {
                Some(b) if b != 0.0 => Value::Float(self.as_f64().unwrap_or(f64::NAN) / b),
                _ => Value::nan(),
            },
            _ => Value::nan(),
        }
    }

    pub fn floordiv(&self, rhs: &Value) -> Value {
        self.numeric_op(
            rhs,
            |a, b| if b == 0 { None } else { Some(a.div_euclid(b)) },
            |a, b| if b == 0.0 { f64::NAN } else { (a / b).floor() },
        )
    }

    pub fn rem(&self, rhs: &Value) -> Value {
        self.numeric_op(
            rhs,
            |a, b| if b == 0 { None } else { Some(a % b) },
            |a, b| if b == 0.0 { f64::NAN } else { a % b },
        )
    }

    pub fn pow(&self, rhs: &Value) -> Value {
        match (self.as_f64(), rhs.as_f64()) {
            (Some(a), Some(b)) => {
                if a < 0.0 && b.fract() != 0.0 {
                    Value::nan()
                } else {
                    Value::Float(a.powf(b))
                }
            }
            _ => Value::nan(),
        }
    }

    fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            Value::Bool(b) => Some(if *b { 1 } else { 0 }),
            _ => None,
        }
    }

    pub fn bitand(&self, rhs: &Value) -> Value {
        match (self.as_i64(), rhs.as_i64()) {
            (Some(a), Some(b)) => Value::Int(a & b),
            _ => Value::nan(),
        }
    }

    pub fn bitor(&self, rhs: &Value) -> Value {
        match (self.as_i64(), rhs.as_i64()) {
            (Some(a), Some(b)) => Value::Int(a | b),
            _ => Value::nan(),
        }
    }

    pub fn bitxor(&self, rhs: &Value) -> Value {
        match (self.as_i64(), rhs.as_i64()) {
            (Some(a), Some(b)) => Value::Int(a ^ b),
            _ => Value::nan(),
        }
    }

    pub fn shl(&self, rhs: &Value) -> Value {
        match (self.as_i64(), rhs.as_i64()) {
            (Some(a), Some(b)) if (0..64).contains(&b) => Value::Int(a << b),
            _ => Value::nan(),
        }
    }

    pub fn shr(&self, rhs: &Value) -> Value {
        match (self.as_i64(), rhs.as_i64()) {
            (Some(a), Some(b)) if (0..64).contains(&b) => Value::Int(a >> b),
            _ => Value::nan(),
        }
    }

    pub fn neg(&self) -> Value {
        match self {
            Value::Int(i) => Value::Int(-i),
            Value::Float(f) => Value::Float(-f),
            Value::Complex(re, im) => Value::Complex(-re, -im),
            _ => Value::nan(),
        }
    }

    pub fn pos(&self) -> Value {
        self.clone()
    }

    pub fn invert(&self) -> Value {
        match self.as_i64() {
            Some(i) => Value::Int(!i),
            None => Value::nan(),
        }
    }

    pub fn not(&self) -> Value {
        Value::Bool(!self.truthy())
    }

    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Int(i) => *i != 0,
            Value::Float(f) => *f != 0.0,
            Value::Complex(re, im) => *re != 0.0 || *im != 0.0,
            Value::Str(s) => !s.is_empty(),
            Value::List(l) => !l.is_empty(),
            Value::Map(m) => !m.is_empty(),
        }
    }

    pub fn abs(&self) -> Value {
        match self {
            Value::Int(i) => Value::Int(i.abs()),
            Value::Float(f) => Value::Float(f.abs()),
            Value::Complex(re, im) => Value::Float((re * re + im * im).sqrt()),
            _ => Value::nan(),
        }
    }

    pub fn round(&self) -> Value {
        match self {
            Value::Float(f) => Value::Int(f.round() as i64),
            Value::Int(_) => self.clone(),
            _ => Value::nan(),
        }
    }

    pub fn trunc(&self) -> Value {
        match self.as_f64() {
            Some(f) => Value::Int(f.trunc() as i64),
            None => Value::nan(),
        }
    }

    pub fn floor(&self) -> Value {
        match self.as_f64() {
            Some(f) => Value::Int(f.floor() as i64),
            None => Value::nan(),
        }
    }

    pub fn ceil(&self) -> Value {
        match self.as_f64() {
            Some(f) => Value::Int(f.ceil() as i64),
            None => Value::nan(),
        }
    }

    pub fn to_int(&self) -> Value {
        match self {
            Value::Int(_) => self.clone(),
            Value::Float(f) => Value::Int(*f as i64),
            Value::Bool(b) => Value::Int(if *b { 1 } else { 0 }),
            Value::Str(s) => s.parse::<i64>().map(Value::Int).unwrap_or_else(|_| Value::nan()),
            _ => Value::nan(),
        }
    }

    pub fn to_float(&self) -> Value {
        match self.as_f64() {
            Some(f) => Value::Float(f),
            None => Value::nan(),
        }
    }

    pub fn to_complex(&self) -> Value {
        match self {
            Value::Complex(..) => self.clone(),
            _ => match self.as_f64() {
                Some(f) => Value::Complex(f, 0.0),
                None => Value::nan(),
            },
        }
    }

    /// Ordinary (non-symbolic) value comparison. The reference algebra's
    /// `.eq()`/`.ne()` methods build an expression node around this; they do
    /// not call it directly on live values.
    pub fn value_eq(&self, rhs: &Value) -> bool {
        match (self, rhs) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.value_eq(y))
            }
            (Value::Map(a), Value::Map(b)) => {
                a.len() == b.len()
                    && a.iter()
                        .all(|(k, v)| b.get(k).is_some_and(|w| v.value_eq(w)))
            }
            _ => match (self.as_f64(), rhs.as_f64()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    pub fn partial_cmp(&self, rhs: &Value) -> Option<std::cmp::Ordering> {
        match (self, rhs) {
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            _ => match (self.as_f64(), rhs.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(n) => write!(f, "{n}"),
            Value::Complex(re, im) => write!(f, "({re}+{im}j)"),
            Value::Str(s) => write!(f, "{s:?}"),
            Value::List(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Map(m) => {
                write!(f, "{{")?;
                for (i, (k, v)) in m.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{k:?}: {v}")?;
                }
                write!(f, "}}")
            }
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn division_by_zero_is_nan() {
        let v = Value::Int(4).div(&Value::Int(0));
        assert!(v.is_nan());
    }

    #[test]
    fn int_division_promotes_to_float() {
        let v = Value::Int(7).div(&Value::Int(2));
        match v {
            Value::Float(f) => assert!((f - 3.5).abs() < 1e-9),
            other => panic!("expected float, got {other:?}"),
        }
    }

    #[test]
    fn negative_fractional_power_is_nan() {
        let v = Value::Float(-1.0).pow(&Value::Float(0.5));
        assert!(v.is_nan());
    }

    #[test]
    fn string_concat() {
        let v = Value::from("foo").add(&Value::from("bar"));
        match v {
            Value::Str(s) => assert_eq!(s, "foobar"),
            other => panic!("expected str, got {other:?}"),
        }
    }
}
