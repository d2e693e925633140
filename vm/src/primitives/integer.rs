use std::cmp::Ordering;

use num_bigint::BigInt;
use num_traits::{Signed, ToPrimitive, Zero};
use object::{ObjectMemory, Value};

use crate::VM;
use crate::error::PrimitiveError;
use crate::frame::InterpreterState;
use crate::primitives::PrimitiveDesc;

/// Shifts beyond this many bits fail instead of allocating huge integers.
const MAX_SHIFT: i64 = 1 << 16;

/// Binary integer operations, in Squeak primitive order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntOp {
    Add,
    Sub,
    Lt,
    Gt,
    Le,
    Ge,
    Eq,
    Ne,
    Mul,
    /// `/`: only exact quotients.
    Div,
    /// `\\`: floored modulo.
    Mod,
    /// `//`: floored division.
    FloorDiv,
    /// `quo:`: truncated division.
    Quo,
    BitAnd,
    BitOr,
    BitXor,
    BitShift,
}

const ORDER: [IntOp; 17] = [
    IntOp::Add,
    IntOp::Sub,
    IntOp::Lt,
    IntOp::Gt,
    IntOp::Le,
    IntOp::Ge,
    IntOp::Eq,
    IntOp::Ne,
    IntOp::Mul,
    IntOp::Div,
    IntOp::Mod,
    IntOp::FloorDiv,
    IntOp::Quo,
    IntOp::BitAnd,
    IntOp::BitOr,
    IntOp::BitXor,
    IntOp::BitShift,
];

impl IntOp {
    /// Operation of primitives 1-17 (SmallInteger) and 21-37 (any
    /// integer).
    pub fn from_primitive(index: u16) -> Option<Self> {
        match index {
            1..=17 => Some(ORDER[index as usize - 1]),
            21..=37 => Some(ORDER[index as usize - 21]),
            _ => None,
        }
    }

    /// Operation behind a special-selector send.
    pub fn from_special_selector(index: u8) -> Option<Self> {
        Some(match index {
            0 => IntOp::Add,
            1 => IntOp::Sub,
            2 => IntOp::Lt,
            3 => IntOp::Gt,
            4 => IntOp::Le,
            5 => IntOp::Ge,
            6 => IntOp::Eq,
            7 => IntOp::Ne,
            8 => IntOp::Mul,
            9 => IntOp::Div,
            10 => IntOp::Mod,
            12 => IntOp::BitShift,
            13 => IntOp::FloorDiv,
            14 => IntOp::BitAnd,
            15 => IntOp::BitOr,
            _ => return None,
        })
    }

    fn compare(self, ordering: Ordering) -> bool {
        match self {
            IntOp::Lt => ordering.is_lt(),
            IntOp::Gt => ordering.is_gt(),
            IntOp::Le => ordering.is_le(),
            IntOp::Ge => ordering.is_ge(),
            IntOp::Eq => ordering.is_eq(),
            _ => ordering.is_ne(),
        }
    }

    fn is_comparison(self) -> bool {
        matches!(
            self,
            IntOp::Lt | IntOp::Gt | IntOp::Le | IntOp::Ge | IntOp::Eq | IntOp::Ne
        )
    }

    /// Result for two SmallIntegers, or `None` when it does not fit one
    /// (or the operation fails).
    pub fn small(self, memory: &ObjectMemory, a: i64, b: i64) -> Option<Value> {
        if self.is_comparison() {
            return Some(memory.boolean(self.compare(a.cmp(&b))));
        }
        let result = match self {
            IntOp::Add => a.checked_add(b),
            IntOp::Sub => a.checked_sub(b),
            IntOp::Mul => a.checked_mul(b),
            IntOp::Div => match a.checked_rem(b) {
                Some(0) => a.checked_div(b),
                _ => None,
            },
            IntOp::Mod => a.checked_rem(b).map(|r| if r != 0 && (r < 0) != (b < 0) { r + b } else { r }),
            IntOp::FloorDiv => a.checked_div(b).map(|q| {
                if a % b != 0 && (a < 0) != (b < 0) { q - 1 } else { q }
            }),
            IntOp::Quo => a.checked_div(b),
            IntOp::BitAnd => Some(a & b),
            IntOp::BitOr => Some(a | b),
            IntOp::BitXor => Some(a ^ b),
            IntOp::BitShift => match b {
                0..=63 => {
                    let wide = (a as i128) << b;
                    i64::try_from(wide).ok()
                }
                -63..=-1 => Some(a >> -b),
                _ if b < 0 => Some(if a < 0 { -1 } else { 0 }),
                _ => None,
            },
            _ => None,
        };
        result.and_then(Value::small_int)
    }

    /// Exact result for arbitrary integers. `None` means the primitive
    /// fails: division by zero, inexact `/`, oversized shifts.
    pub fn big(self, memory: &mut ObjectMemory, a: &BigInt, b: &BigInt) -> Option<Value> {
        if self.is_comparison() {
            return Some(memory.boolean(self.compare(a.cmp(b))));
        }
        let result = match self {
            IntOp::Add => a + b,
            IntOp::Sub => a - b,
            IntOp::Mul => a * b,
            IntOp::Div => {
                if b.is_zero() || !(a % b).is_zero() {
                    return None;
                }
                a / b
            }
            IntOp::Mod => {
                if b.is_zero() {
                    return None;
                }
                let r = a % b;
                if !r.is_zero() && r.sign() != b.sign() { r + b } else { r }
            }
            IntOp::FloorDiv => {
                if b.is_zero() {
                    return None;
                }
                let q = a / b;
                if !(a % b).is_zero() && a.is_negative() != b.is_negative() {
                    q - BigInt::from(1)
                } else {
                    q
                }
            }
            IntOp::Quo => {
                if b.is_zero() {
                    return None;
                }
                a / b
            }
            IntOp::BitAnd => a & b,
            IntOp::BitOr => a | b,
            IntOp::BitXor => a ^ b,
            IntOp::BitShift => {
                let shift = b.to_i64().filter(|s| s.abs() <= MAX_SHIFT)?;
                if shift >= 0 { a << shift as usize } else { a >> (-shift) as usize }
            }
            _ => return None,
        };
        Some(memory.integer_object(&result))
    }
}

fn operands(
    vm: &mut VM,
    receiver: Value,
    args: &[Value],
) -> Result<(BigInt, BigInt), PrimitiveError> {
    let arg = *args.first().ok_or(PrimitiveError::Failed)?;
    let a = vm.memory.integer_value(receiver).ok_or(PrimitiveError::Failed)?;
    let b = vm.memory.integer_value(arg).ok_or(PrimitiveError::Failed)?;
    Ok((a, b))
}

fn run(vm: &mut VM, op: IntOp, receiver: Value, args: &[Value]) -> Result<Option<Value>, PrimitiveError> {
    if let (Value::Int(a), Some(Value::Int(b))) = (receiver, args.first().copied()) {
        if let Some(result) = op.small(&vm.memory, a, b) {
            return Ok(Some(result));
        }
    }
    let (a, b) = operands(vm, receiver, args)?;
    op.big(&mut vm.memory, &a, &b).map(Some).ok_or(PrimitiveError::Failed)
}

/// Primitives 1-17 require a SmallInteger receiver, though the result may
/// still be promoted. 21-37 take any integers and demote results that fit.
fn integer_op(vm: &mut VM, index: u16, receiver: Value, args: &[Value]) -> Result<Option<Value>, PrimitiveError> {
    let op = IntOp::from_primitive(index).ok_or(PrimitiveError::Failed)?;
    if index <= 17 && !receiver.is_int() {
        return Err(PrimitiveError::Failed);
    }
    run(vm, op, receiver, args)
}

macro_rules! integer_primitives {
    ($($index:literal => $name:ident),* $(,)?) => {
        $(
            fn $name(
                vm: &mut VM,
                _state: &mut InterpreterState,
                receiver: Value,
                args: &[Value],
            ) -> Result<Option<Value>, PrimitiveError> {
                integer_op(vm, $index, receiver, args)
            }
        )*

        pub(super) fn descriptors() -> Vec<PrimitiveDesc> {
            vec![$(PrimitiveDesc::new($index, stringify!($name), 1, $name)),*]
        }
    };
}

integer_primitives! {
    1 => small_add,
    2 => small_sub,
    3 => small_lt,
    4 => small_gt,
    5 => small_le,
    6 => small_ge,
    7 => small_eq,
    8 => small_ne,
    9 => small_mul,
    10 => small_div,
    11 => small_mod,
    12 => small_floor_div,
    13 => small_quo,
    14 => small_bit_and,
    15 => small_bit_or,
    16 => small_bit_xor,
    17 => small_bit_shift,
    21 => large_add,
    22 => large_sub,
    23 => large_lt,
    24 => large_gt,
    25 => large_le,
    26 => large_ge,
    27 => large_eq,
    28 => large_ne,
    29 => large_mul,
    30 => large_div,
    31 => large_mod,
    32 => large_floor_div,
    33 => large_quo,
    34 => large_bit_and,
    35 => large_bit_or,
    36 => large_bit_xor,
    37 => large_bit_shift,
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::SMALL_INT_MAX;

    fn int(memory: &mut ObjectMemory, value: Value) -> BigInt {
        memory.integer_value(value).unwrap()
    }

    // ── SmallInteger ───────────────────────────────────────────────

    #[test]
    fn floored_division_and_modulo() {
        let memory = ObjectMemory::new();
        assert_eq!(IntOp::FloorDiv.small(&memory, -7, 2), Some(Value::Int(-4)));
        assert_eq!(IntOp::Mod.small(&memory, -7, 2), Some(Value::Int(1)));
        assert_eq!(IntOp::Quo.small(&memory, -7, 2), Some(Value::Int(-3)));
        assert_eq!(IntOp::Mod.small(&memory, 7, -2), Some(Value::Int(-1)));
        assert_eq!(IntOp::Div.small(&memory, 7, 2), None);
        assert_eq!(IntOp::Div.small(&memory, 8, 2), Some(Value::Int(4)));
        assert_eq!(IntOp::FloorDiv.small(&memory, 1, 0), None);
    }

    #[test]
    fn comparisons_answer_booleans() {
        let memory = ObjectMemory::new();
        assert_eq!(IntOp::Lt.small(&memory, 1, 2), Some(memory.boolean(true)));
        assert_eq!(IntOp::Ne.small(&memory, 2, 2), Some(memory.boolean(false)));
    }

    #[test]
    fn overflow_leaves_the_fast_path() {
        let memory = ObjectMemory::new();
        assert_eq!(IntOp::Add.small(&memory, SMALL_INT_MAX, 1), None);
        assert_eq!(IntOp::BitShift.small(&memory, 1, 62), None);
        assert_eq!(IntOp::BitShift.small(&memory, -8, -2), Some(Value::Int(-2)));
    }

    // ── promotion ──────────────────────────────────────────────────

    #[test]
    fn sums_promote_and_demote() {
        let mut memory = ObjectMemory::new();
        let max = BigInt::from(SMALL_INT_MAX);
        let one = BigInt::from(1);
        let big = IntOp::Add.big(&mut memory, &max, &one).unwrap();
        assert!(big.is_ref());
        assert_eq!(memory.class_of(big).unwrap(), memory.special.large_positive_integer);
        assert_eq!(int(&mut memory, big), &max + &one);

        let back = IntOp::Sub.big(&mut memory, &(&max + &one), &one).unwrap();
        assert_eq!(back, Value::Int(SMALL_INT_MAX));
    }

    #[test]
    fn negative_results_use_the_negative_class() {
        let mut memory = ObjectMemory::new();
        let a = BigInt::from(-SMALL_INT_MAX) * 4;
        let v = IntOp::Mul.big(&mut memory, &a, &BigInt::from(3)).unwrap();
        assert_eq!(memory.class_of(v).unwrap(), memory.special.large_negative_integer);
        assert!(int(&mut memory, v).is_negative());
    }

    #[test]
    fn big_shifts_are_bounded() {
        let mut memory = ObjectMemory::new();
        let one = BigInt::from(1);
        let v = IntOp::BitShift.big(&mut memory, &one, &BigInt::from(100)).unwrap();
        assert_eq!(int(&mut memory, v), BigInt::from(1) << 100usize);
        assert_eq!(IntOp::BitShift.big(&mut memory, &one, &BigInt::from(1 << 20)), None);
    }

    #[test]
    fn primitive_numbers_map_to_operations() {
        assert_eq!(IntOp::from_primitive(1), Some(IntOp::Add));
        assert_eq!(IntOp::from_primitive(17), Some(IntOp::BitShift));
        assert_eq!(IntOp::from_primitive(29), Some(IntOp::Mul));
        assert_eq!(IntOp::from_primitive(18), None);
        assert_eq!(IntOp::from_special_selector(13), Some(IntOp::FloorDiv));
        assert_eq!(IntOp::from_special_selector(11), None);
    }
}
