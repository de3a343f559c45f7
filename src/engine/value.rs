use std::cmp::Ordering;
use std::fmt;

use crate::errors::RuntimeError;
use crate::lexer::format_number;
use crate::parser::ast::{BinaryOp, ExprKind};

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(f64),
    Str(String),
    Bool(bool),
    Null,
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Number(_) => "number",
            Value::Str(_) => "string",
            Value::Bool(_) => "bool",
            Value::Null => "null",
        }
    }

    /// `false`, `0`, `""` and `null` are falsy; everything else is truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::Str(s) => !s.is_empty(),
            Value::Bool(b) => *b,
            Value::Null => false,
        }
    }

    /// Literal expressions only; anything else yields `None`.
    pub fn from_literal(kind: &ExprKind) -> Option<Value> {
        match kind {
            ExprKind::Number(n) => Some(Value::Number(*n)),
            ExprKind::Str(s) => Some(Value::Str(s.clone())),
            ExprKind::Bool(b) => Some(Value::Bool(*b)),
            ExprKind::Null => Some(Value::Null),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => f.write_str(&format_number(*n)),
            Value::Str(s) => f.write_str(s),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Null => f.write_str("null"),
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

fn mismatch(op: BinaryOp, left: &Value, right: &Value) -> RuntimeError {
    RuntimeError::TypeMismatch {
        op: op.symbol().to_string(),
        left: left.type_name(),
        right: right.type_name(),
    }
}

fn compare(op: BinaryOp, left: &Value, right: &Value) -> Result<Ordering, RuntimeError> {
    let ordering = match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
        (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
        _ => return Err(mismatch(op, left, right)),
    };
    // NaN compares false against everything
    Ok(ordering.unwrap_or(Ordering::Equal))
}

/// Combine two already-evaluated operands.
///
/// Equality is strict: values of different kinds are never equal and
/// nothing is coerced. `+` concatenates when either side is a string.
pub fn apply_binary(op: BinaryOp, left: &Value, right: &Value) -> Result<Value, RuntimeError> {
    let value = match op {
        BinaryOp::Eq => Value::Bool(left == right),
        BinaryOp::NotEq => Value::Bool(left != right),
        BinaryOp::And => Value::Bool(left.is_truthy() && right.is_truthy()),
        BinaryOp::Or => Value::Bool(left.is_truthy() || right.is_truthy()),
        BinaryOp::Add => match (left, right) {
            (Value::Number(a), Value::Number(b)) => Value::Number(a + b),
            (Value::Str(_), _) | (_, Value::Str(_)) => Value::Str(format!("{}{}", left, right)),
            _ => return Err(mismatch(op, left, right)),
        },
        BinaryOp::Sub | BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => {
            let (a, b) = match (left, right) {
                (Value::Number(a), Value::Number(b)) => (*a, *b),
                _ => return Err(mismatch(op, left, right)),
            };
            match op {
                BinaryOp::Sub => Value::Number(a - b),
                BinaryOp::Mul => Value::Number(a * b),
                _ if b == 0.0 => return Err(RuntimeError::DivisionByZero),
                BinaryOp::Div => Value::Number(a / b),
                _ => Value::Number(a % b),
            }
        }
        BinaryOp::Less | BinaryOp::LessEq | BinaryOp::Greater | BinaryOp::GreaterEq => {
            if matches!((left, right), (Value::Number(a), Value::Number(b)) if a.is_nan() || b.is_nan()) {
                return Ok(Value::Bool(false));
            }
            let ordering = compare(op, left, right)?;
            Value::Bool(match op {
                BinaryOp::Less => ordering == Ordering::Less,
                BinaryOp::LessEq => ordering != Ordering::Greater,
                BinaryOp::Greater => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            })
        }
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn num(n: f64) -> Value {
        Value::Number(n)
    }

    fn s(text: &str) -> Value {
        Value::Str(text.to_string())
    }

    #[test]
    fn test_arithmetic() {
        assert_eq!(apply_binary(BinaryOp::Add, &num(2.0), &num(3.0)), Ok(num(5.0)));
        assert_eq!(apply_binary(BinaryOp::Mod, &num(7.0), &num(3.0)), Ok(num(1.0)));
        assert_eq!(apply_binary(BinaryOp::Div, &num(7.0), &num(2.0)), Ok(num(3.5)));
    }

    #[test]
    fn test_division_by_zero() {
        assert_eq!(apply_binary(BinaryOp::Div, &num(1.0), &num(0.0)), Err(RuntimeError::DivisionByZero));
        assert_eq!(apply_binary(BinaryOp::Mod, &num(1.0), &num(0.0)), Err(RuntimeError::DivisionByZero));
    }

    #[test]
    fn test_strict_equality() {
        assert_eq!(apply_binary(BinaryOp::Eq, &num(1.0), &s("1")), Ok(Value::Bool(false)));
        assert_eq!(apply_binary(BinaryOp::Eq, &Value::Bool(false), &num(0.0)), Ok(Value::Bool(false)));
        assert_eq!(apply_binary(BinaryOp::NotEq, &Value::Null, &Value::Null), Ok(Value::Bool(false)));
        assert_eq!(apply_binary(BinaryOp::Eq, &s("a"), &s("a")), Ok(Value::Bool(true)));
    }

    #[test]
    fn test_concatenation() {
        assert_eq!(apply_binary(BinaryOp::Add, &s("lap "), &num(2.0)), Ok(s("lap 2")));
        assert_eq!(apply_binary(BinaryOp::Add, &Value::Bool(true), &s("!")), Ok(s("true!")));
    }

    #[test]
    fn test_type_mismatch() {
        let err = apply_binary(BinaryOp::Sub, &s("a"), &num(1.0)).unwrap_err();
        assert_eq!(err.to_string(), "cannot apply '-' to string and number");
        assert!(apply_binary(BinaryOp::Less, &Value::Bool(true), &num(1.0)).is_err());
    }

    #[test]
    fn test_relational() {
        assert_eq!(apply_binary(BinaryOp::LessEq, &num(2.0), &num(2.0)), Ok(Value::Bool(true)));
        assert_eq!(apply_binary(BinaryOp::Greater, &s("b"), &s("a")), Ok(Value::Bool(true)));
    }

    #[test]
    fn test_logical_uses_truthiness() {
        assert_eq!(apply_binary(BinaryOp::And, &num(1.0), &s("")), Ok(Value::Bool(false)));
        assert_eq!(apply_binary(BinaryOp::Or, &Value::Null, &num(3.0)), Ok(Value::Bool(true)));
    }
}
