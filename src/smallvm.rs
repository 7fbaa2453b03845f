//! Static evaluation of JVM arithmetic and comparisons on literal operands.
//! Results follow the runtime exactly: two's-complement wrapping for
//! integers, masked shift distances, IEEE 754 for floating point.

use num_traits::{PrimInt, WrappingAdd, WrappingMul, WrappingNeg, WrappingSub};

use crate::error::ExecutionError;
use crate::insn::{Cond, ConstValue, MathOp, NumKind};

/// A numeric stack value.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Value {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
}

impl Value {
    pub fn from_const(value: &ConstValue) -> Option<Value> {
        match value {
            ConstValue::Int(v) => Some(Value::Int(*v)),
            ConstValue::Long(v) => Some(Value::Long(*v)),
            ConstValue::Float(v) => Some(Value::Float(*v)),
            ConstValue::Double(v) => Some(Value::Double(*v)),
            _ => None,
        }
    }

    pub fn into_const(self) -> ConstValue {
        match self {
            Value::Int(v) => ConstValue::Int(v),
            Value::Long(v) => ConstValue::Long(v),
            Value::Float(v) => ConstValue::Float(v),
            Value::Double(v) => ConstValue::Double(v),
        }
    }

    pub fn kind(&self) -> NumKind {
        match self {
            Value::Int(_) => NumKind::Int,
            Value::Long(_) => NumKind::Long,
            Value::Float(_) => NumKind::Float,
            Value::Double(_) => NumKind::Double,
        }
    }
}

fn integer_binary<T>(op: MathOp, left: T, right: T) -> Result<T, ExecutionError>
where
    T: PrimInt + WrappingAdd + WrappingSub + WrappingMul + WrappingNeg,
{
    let minus_one = T::zero().wrapping_sub(&T::one());
    Ok(match op {
        MathOp::Add => left.wrapping_add(&right),
        MathOp::Sub => left.wrapping_sub(&right),
        MathOp::Mul => left.wrapping_mul(&right),
        MathOp::Div | MathOp::Rem if right.is_zero() => return Err(ExecutionError::DivisionByZero),
        // MIN / -1 overflows in Rust but wraps back to MIN on the JVM
        MathOp::Div if right == minus_one => left.wrapping_neg(),
        MathOp::Rem if right == minus_one => T::zero(),
        MathOp::Div => left / right,
        MathOp::Rem => left % right,
        MathOp::And => left & right,
        MathOp::Or => left | right,
        MathOp::Xor => left ^ right,
        other => return Err(ExecutionError::Unsupported(format!("{:?}", other))),
    })
}

/// Shifts use only the low 5 (int) or 6 (long) bits of the distance.
fn integer_shift<T: PrimInt>(op: MathOp, value: T, distance: i32) -> Result<T, ExecutionError> {
    let width = T::zero().count_zeros();
    let n = (distance as u32) & (width - 1);
    Ok(match op {
        MathOp::Shl => value.unsigned_shl(n),
        MathOp::Shr => value.signed_shr(n),
        MathOp::Ushr => value.unsigned_shr(n),
        other => return Err(ExecutionError::Unsupported(format!("{:?}", other))),
    })
}

/// Evaluates `left op right` where `left` was pushed first.
pub fn execute_binary(op: MathOp, left: Value, right: Value) -> Result<Value, ExecutionError> {
    macro_rules! apply_operator {
        ($variant:ident, $l:expr, $r:expr) => {
            match op {
                MathOp::Add => Value::$variant($l + $r),
                MathOp::Sub => Value::$variant($l - $r),
                MathOp::Mul => Value::$variant($l * $r),
                MathOp::Div => Value::$variant($l / $r),
                // Rust's float remainder truncates like Java's drem
                MathOp::Rem => Value::$variant($l % $r),
                other => {
                    return Err(ExecutionError::TypeMismatch(format!(
                        "{:?} on {}",
                        other,
                        stringify!($variant)
                    )))
                }
            }
        };
    }

    if op.is_shift() {
        return match (left, right) {
            (Value::Int(v), Value::Int(n)) => integer_shift(op, v, n).map(Value::Int),
            (Value::Long(v), Value::Int(n)) => integer_shift(op, v, n).map(Value::Long),
            (l, r) => Err(ExecutionError::TypeMismatch(format!("{:?} {:?} {:?}", l, op, r))),
        };
    }

    Ok(match (left, right) {
        (Value::Int(l), Value::Int(r)) => Value::Int(integer_binary(op, l, r)?),
        (Value::Long(l), Value::Long(r)) => Value::Long(integer_binary(op, l, r)?),
        (Value::Float(l), Value::Float(r)) => apply_operator!(Float, l, r),
        (Value::Double(l), Value::Double(r)) => apply_operator!(Double, l, r),
        (l, r) => return Err(ExecutionError::TypeMismatch(format!("{:?} {:?} {:?}", l, op, r))),
    })
}

pub fn execute_unary(op: MathOp, value: Value) -> Result<Value, ExecutionError> {
    if op != MathOp::Neg {
        return Err(ExecutionError::Unsupported(format!("{:?}", op)));
    }

    Ok(match value {
        Value::Int(v) => Value::Int(v.wrapping_neg()),
        Value::Long(v) => Value::Long(v.wrapping_neg()),
        Value::Float(v) => Value::Float(-v),
        Value::Double(v) => Value::Double(-v),
    })
}

/// Decides a conditional jump whose operands are all literals. `None` means
/// the outcome can't be known statically.
pub fn evaluate_condition(cond: Cond, operands: &[&ConstValue]) -> Option<bool> {
    use ConstValue::*;

    let int_cmp = |l: i32, r: i32| -> Option<bool> {
        Some(match cond {
            Cond::IfEq | Cond::IcmpEq => l == r,
            Cond::IfNe | Cond::IcmpNe => l != r,
            Cond::IfLt | Cond::IcmpLt => l < r,
            Cond::IfGe | Cond::IcmpGe => l >= r,
            Cond::IfGt | Cond::IcmpGt => l > r,
            Cond::IfLe | Cond::IcmpLe => l <= r,
            _ => return None,
        })
    };

    match (cond, operands) {
        (Cond::IfEq | Cond::IfNe | Cond::IfLt | Cond::IfGe | Cond::IfGt | Cond::IfLe, [Int(v)]) => {
            int_cmp(*v, 0)
        }
        (
            Cond::IcmpEq | Cond::IcmpNe | Cond::IcmpLt | Cond::IcmpGe | Cond::IcmpGt | Cond::IcmpLe,
            [Int(l), Int(r)],
        ) => int_cmp(*l, *r),
        (Cond::IfNull, [Null]) => Some(true),
        (Cond::IfNonNull, [Null]) => Some(false),
        (Cond::IfNull, [Str(_) | Type(_)]) => Some(false),
        (Cond::IfNonNull, [Str(_) | Type(_)]) => Some(true),
        (Cond::AcmpEq, [Null, Null]) => Some(true),
        (Cond::AcmpNe, [Null, Null]) => Some(false),
        (Cond::AcmpEq, [Null, Str(_) | Type(_)]) | (Cond::AcmpEq, [Str(_) | Type(_), Null]) => Some(false),
        (Cond::AcmpNe, [Null, Str(_) | Type(_)]) | (Cond::AcmpNe, [Str(_) | Type(_), Null]) => Some(true),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    #[test]
    fn binary_xor() {
        assert_eq!(
            execute_binary(MathOp::Xor, Value::Int(10), Value::Int(3)),
            Ok(Value::Int(9))
        );
    }

    #[test]
    fn operand_order_is_push_order() {
        // push 3; push 5; isub
        assert_eq!(
            execute_binary(MathOp::Sub, Value::Int(3), Value::Int(5)),
            Ok(Value::Int(-2))
        );
    }

    #[test]
    fn integer_arithmetic_wraps() {
        assert_eq!(
            execute_binary(MathOp::Add, Value::Int(i32::MAX), Value::Int(1)),
            Ok(Value::Int(i32::MIN))
        );
        assert_eq!(
            execute_binary(MathOp::Mul, Value::Long(i64::MAX), Value::Long(2)),
            Ok(Value::Long(-2))
        );
        assert_eq!(
            execute_binary(MathOp::Div, Value::Int(i32::MIN), Value::Int(-1)),
            Ok(Value::Int(i32::MIN))
        );
        assert_eq!(
            execute_binary(MathOp::Rem, Value::Int(i32::MIN), Value::Int(-1)),
            Ok(Value::Int(0))
        );
        assert_eq!(execute_unary(MathOp::Neg, Value::Int(i32::MIN)), Ok(Value::Int(i32::MIN)));
    }

    #[test]
    fn division_truncates_toward_zero() {
        assert_eq!(execute_binary(MathOp::Div, Value::Int(-7), Value::Int(2)), Ok(Value::Int(-3)));
        assert_eq!(execute_binary(MathOp::Rem, Value::Int(-7), Value::Int(2)), Ok(Value::Int(-1)));
    }

    #[test]
    fn division_by_zero_is_not_folded() {
        assert_eq!(
            execute_binary(MathOp::Div, Value::Int(1), Value::Int(0)),
            Err(ExecutionError::DivisionByZero)
        );
        assert_eq!(
            execute_binary(MathOp::Rem, Value::Long(1), Value::Long(0)),
            Err(ExecutionError::DivisionByZero)
        );
        // floating point division by zero is well defined
        assert_eq!(
            execute_binary(MathOp::Div, Value::Double(1.0), Value::Double(0.0)),
            Ok(Value::Double(f64::INFINITY))
        );
    }

    #[test]
    fn shift_distances_are_masked() {
        assert_eq!(execute_binary(MathOp::Shl, Value::Int(1), Value::Int(33)), Ok(Value::Int(2)));
        assert_eq!(
            execute_binary(MathOp::Shl, Value::Long(1), Value::Int(65)),
            Ok(Value::Long(2))
        );
        assert_eq!(execute_binary(MathOp::Shr, Value::Int(-8), Value::Int(1)), Ok(Value::Int(-4)));
        assert_eq!(
            execute_binary(MathOp::Ushr, Value::Int(-1), Value::Int(28)),
            Ok(Value::Int(15))
        );
        assert_eq!(
            execute_binary(MathOp::Ushr, Value::Long(-1), Value::Int(60)),
            Ok(Value::Long(15))
        );
    }

    #[test]
    fn float_remainder_matches_fmod() {
        assert_eq!(
            execute_binary(MathOp::Rem, Value::Float(-5.5), Value::Float(2.0)),
            Ok(Value::Float(-1.5))
        );
    }

    #[test]
    fn mismatched_kinds_are_rejected() {
        assert!(execute_binary(MathOp::Add, Value::Int(1), Value::Long(1)).is_err());
        assert!(execute_binary(MathOp::Xor, Value::Float(1.0), Value::Float(1.0)).is_err());
    }

    #[test]
    fn conditions_over_all_comparisons() {
        let cases = [
            (Cond::IcmpEq, 9, 9, true),
            (Cond::IcmpNe, 9, 9, false),
            (Cond::IcmpLt, 1, 2, true),
            (Cond::IcmpGe, 1, 2, false),
            (Cond::IcmpGt, 3, 2, true),
            (Cond::IcmpLe, 3, 2, false),
        ];
        for (cond, l, r, expected) in cases.iter() {
            let (l, r) = (ConstValue::Int(*l), ConstValue::Int(*r));
            assert_eq!(evaluate_condition(*cond, &[&l, &r]), Some(*expected));
        }

        let zero = ConstValue::Int(0);
        assert_eq!(evaluate_condition(Cond::IfEq, &[&zero]), Some(true));
        assert_eq!(evaluate_condition(Cond::IfNull, &[&ConstValue::Null]), Some(true));
        let s = ConstValue::Str("x".into());
        assert_eq!(evaluate_condition(Cond::IfNonNull, &[&s]), Some(true));
        assert_eq!(evaluate_condition(Cond::AcmpEq, &[&s, &s]), None);
    }
}
