use crate::runtime_error::ExecError;
use std::fmt;
use std::rc::Rc;

/// Operand of the stack machine. String and opaque payloads are shared so
/// values can be copied freely across the operand stack.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Undefined,
    Int(i64),
    UInt(u64),
    Float(f64),
    String(Rc<str>),
    Opaque(Rc<[u8]>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "subtract",
            BinaryOp::Mul => "multiply",
            BinaryOp::Div => "divide",
        })
    }
}

impl Value {
    pub fn string(text: &str) -> Self {
        Value::String(Rc::from(text))
    }

    pub fn opaque(bytes: Vec<u8>) -> Self {
        Value::Opaque(Rc::from(bytes))
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Int(_) => "int",
            Value::UInt(_) => "uint",
            Value::Float(_) => "float",
            Value::String(_) => "string",
            Value::Opaque(_) => "opaque",
        }
    }

    fn is_numeric(&self) -> bool {
        matches!(self, Value::Int(_) | Value::UInt(_) | Value::Float(_))
    }

    fn is_zero(&self) -> bool {
        match self {
            Value::Int(v) => *v == 0,
            Value::UInt(v) => *v == 0,
            Value::Float(v) => *v == 0.0,
            _ => false,
        }
    }

    fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::UInt(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    /// Integer payload as a raw 64-bit pattern; what the host output
    /// functions put on the wire.
    pub fn as_bits(&self) -> Option<u64> {
        match self {
            Value::Int(v) => Some(*v as u64),
            Value::UInt(v) => Some(*v),
            _ => None,
        }
    }

    /// Applies an arithmetic opcode. Coercion: INT×INT, INT×UINT and
    /// UINT×INT give INT; UINT×UINT gives UINT; anything with a FLOAT gives
    /// FLOAT. Integer arithmetic wraps.
    pub fn binary(op: BinaryOp, lhs: &Value, rhs: &Value) -> Result<Value, ExecError> {
        if op == BinaryOp::Div && lhs.is_numeric() && rhs.is_zero() {
            return Err(ExecError::runtime("division by zero"));
        }

        let result = match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => Value::Int(signed(op, *a, *b)),
            (Value::Int(a), Value::UInt(b)) => Value::Int(signed(op, *a, *b as i64)),
            (Value::UInt(a), Value::Int(b)) => Value::Int(signed(op, *a as i64, *b)),
            (Value::UInt(a), Value::UInt(b)) => Value::UInt(unsigned(op, *a, *b)),
            (Value::Float(_), _) | (_, Value::Float(_)) if lhs.is_numeric() && rhs.is_numeric() => {
                let (a, b) = (lhs.as_f64().unwrap_or(0.0), rhs.as_f64().unwrap_or(0.0));
                Value::Float(match op {
                    BinaryOp::Add => a + b,
                    BinaryOp::Sub => a - b,
                    BinaryOp::Mul => a * b,
                    BinaryOp::Div => a / b,
                })
            }
            (Value::String(s), rhs) if op == BinaryOp::Add => {
                let suffix = match rhs {
                    Value::Int(_) | Value::UInt(_) | Value::Float(_) | Value::String(_) => {
                        rhs.to_string()
                    }
                    _ => return Err(mismatch(op, lhs, rhs)),
                };
                let mut joined = String::with_capacity(s.len() + suffix.len());
                joined.push_str(s);
                joined.push_str(&suffix);
                Value::String(Rc::from(joined))
            }
            (Value::Opaque(a), Value::Opaque(b)) if op == BinaryOp::Add => {
                let mut joined = Vec::with_capacity(a.len() + b.len());
                joined.extend_from_slice(a);
                joined.extend_from_slice(b);
                Value::opaque(joined)
            }
            _ => return Err(mismatch(op, lhs, rhs)),
        };
        Ok(result)
    }

    /// Element count of a string or opaque value.
    pub fn size_of(&self) -> Result<Value, ExecError> {
        match self {
            Value::String(s) => Ok(Value::UInt(s.len() as u64)),
            Value::Opaque(bytes) => Ok(Value::UInt(bytes.len() as u64)),
            other => Err(ExecError::type_error(format!(
                "sizeof is not defined for {}",
                other.type_name()
            ))),
        }
    }
}

fn signed(op: BinaryOp, a: i64, b: i64) -> i64 {
    match op {
        BinaryOp::Add => a.wrapping_add(b),
        BinaryOp::Sub => a.wrapping_sub(b),
        BinaryOp::Mul => a.wrapping_mul(b),
        BinaryOp::Div => a.wrapping_div(b),
    }
}

fn unsigned(op: BinaryOp, a: u64, b: u64) -> u64 {
    match op {
        BinaryOp::Add => a.wrapping_add(b),
        BinaryOp::Sub => a.wrapping_sub(b),
        BinaryOp::Mul => a.wrapping_mul(b),
        BinaryOp::Div => a / b,
    }
}

fn mismatch(op: BinaryOp, lhs: &Value, rhs: &Value) -> ExecError {
    ExecError::type_error(format!(
        "cannot {op} {} and {}",
        lhs.type_name(),
        rhs.type_name()
    ))
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Undefined => f.write_str("undefined"),
            Value::Int(v) => write!(f, "{v}"),
            Value::UInt(v) => write!(f, "{v}"),
            Value::Float(v) => write!(f, "{v}"),
            Value::String(s) => f.write_str(s),
            Value::Opaque(bytes) => {
                for b in bytes.iter() {
                    write!(f, "{b:02x}")?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn add(lhs: Value, rhs: Value) -> Result<Value, ExecError> {
        Value::binary(BinaryOp::Add, &lhs, &rhs)
    }

    #[test]
    fn integer_promotion_table() {
        assert_eq!(add(Value::Int(1), Value::Int(2)).unwrap(), Value::Int(3));
        assert_eq!(add(Value::Int(-1), Value::UInt(2)).unwrap(), Value::Int(1));
        assert_eq!(add(Value::UInt(5), Value::Int(-7)).unwrap(), Value::Int(-2));
        assert_eq!(add(Value::UInt(5), Value::UInt(7)).unwrap(), Value::UInt(12));
        assert_eq!(
            add(Value::UInt(1), Value::Float(0.5)).unwrap(),
            Value::Float(1.5)
        );
        assert_eq!(
            Value::binary(BinaryOp::Mul, &Value::Float(2.0), &Value::Int(3)).unwrap(),
            Value::Float(6.0)
        );
    }

    #[test]
    fn same_table_applies_to_every_operator() {
        let cases = [
            (BinaryOp::Sub, Value::Int(10), Value::UInt(4), Value::Int(6)),
            (BinaryOp::Mul, Value::UInt(6), Value::Int(7), Value::Int(42)),
            (BinaryOp::Div, Value::UInt(9), Value::UInt(2), Value::UInt(4)),
            (BinaryOp::Div, Value::Int(-9), Value::Int(2), Value::Int(-4)),
        ];
        for (op, lhs, rhs, expected) in cases {
            assert_eq!(
                Value::binary(op, &lhs, &rhs).unwrap(),
                expected,
                "{op} {lhs:?} {rhs:?}"
            );
        }
    }

    #[test]
    fn division_by_zero_fails_for_every_numeric_type() {
        for zero in [Value::Int(0), Value::UInt(0), Value::Float(0.0)] {
            for lhs in [Value::Int(1), Value::UInt(1), Value::Float(1.0)] {
                match Value::binary(BinaryOp::Div, &lhs, &zero) {
                    Err(ExecError::Runtime(_)) => {}
                    other => panic!("Expected runtime error for {lhs:?}/{zero:?}, got {other:?}"),
                }
            }
        }
    }

    #[test]
    fn string_concatenation_stringifies_rhs() {
        assert_eq!(
            add(Value::string("Hello "), Value::Int(10)).unwrap(),
            Value::string("Hello 10")
        );
        assert_eq!(
            add(Value::string("a"), Value::string("b")).unwrap(),
            Value::string("ab")
        );
        assert_eq!(
            add(Value::string("x"), Value::Float(1.5)).unwrap(),
            Value::string("x1.5")
        );
        assert!(matches!(
            Value::binary(BinaryOp::Sub, &Value::string("a"), &Value::Int(1)),
            Err(ExecError::Type(_))
        ));
        assert!(matches!(
            add(Value::string("a"), Value::opaque(vec![1])),
            Err(ExecError::Type(_))
        ));
        assert!(matches!(
            add(Value::Int(1), Value::string("a")),
            Err(ExecError::Type(_))
        ));
    }

    #[test]
    fn opaque_only_concatenates_with_opaque() {
        assert_eq!(
            add(Value::opaque(vec![1, 2]), Value::opaque(vec![3])).unwrap(),
            Value::opaque(vec![1, 2, 3])
        );
        assert!(add(Value::opaque(vec![1]), Value::Int(1)).is_err());
        assert!(
            Value::binary(BinaryOp::Mul, &Value::opaque(vec![1]), &Value::opaque(vec![2]))
                .is_err()
        );
        assert!(add(Value::Undefined, Value::Int(1)).is_err());
    }

    #[test]
    fn size_of_strings_and_opaque_only() {
        assert_eq!(Value::string("abc").size_of().unwrap(), Value::UInt(3));
        assert_eq!(Value::opaque(vec![0; 5]).size_of().unwrap(), Value::UInt(5));
        assert!(matches!(Value::Int(1).size_of(), Err(ExecError::Type(_))));
    }
}
