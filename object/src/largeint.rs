use num_bigint::{BigInt, BigUint, Sign};
use num_traits::ToPrimitive;

use crate::Value;

/// Body of a `LargePositiveInteger` / `LargeNegativeInteger`.
///
/// The bytes are the little-endian magnitude; the sign is carried by the
/// object's class. The arbitrary-precision magnitude is derived from the
/// bytes on demand and cached until the bytes are touched again.
#[derive(Debug, Clone)]
pub struct LargeInteger {
    bytes: Vec<u8>,
    dirty: bool,
    magnitude: Option<BigUint>,
}

impl LargeInteger {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes,
            dirty: true,
            magnitude: None,
        }
    }

    pub fn from_magnitude(magnitude: &BigUint) -> Self {
        Self {
            bytes: magnitude.to_bytes_le(),
            dirty: false,
            magnitude: Some(magnitude.clone()),
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether the cached magnitude is stale.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Overwrite one byte. Returns `false` if `index` is out of range.
    pub fn set_byte(&mut self, index: usize, byte: u8) -> bool {
        match self.bytes.get_mut(index) {
            Some(slot) => {
                *slot = byte;
                self.dirty = true;
                true
            }
            None => false,
        }
    }

    /// Direct access to the byte buffer; marks the cached magnitude stale.
    pub fn bytes_mut(&mut self) -> &mut Vec<u8> {
        self.dirty = true;
        &mut self.bytes
    }

    /// The magnitude, rederived from the bytes if they changed since the
    /// last call.
    pub fn magnitude(&mut self) -> &BigUint {
        if self.dirty || self.magnitude.is_none() {
            self.magnitude = Some(BigUint::from_bytes_le(&self.bytes));
            self.dirty = false;
        }
        self.magnitude.get_or_insert_with(BigUint::default)
    }

    /// Signed value given the sign carried by the class.
    pub fn value(&mut self, negative: bool) -> BigInt {
        let sign = if negative { Sign::Minus } else { Sign::Plus };
        BigInt::from_biguint(sign, self.magnitude().clone())
    }
}

/// The SmallInteger for `n`, if it fits.
pub fn demote(n: &BigInt) -> Option<Value> {
    n.to_i64().and_then(Value::small_int)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn magnitude_is_little_endian() {
        let mut li = LargeInteger::from_bytes(vec![0x00, 0x01]);
        assert_eq!(li.magnitude(), &BigUint::from(256u32));
        assert_eq!(li.value(true), BigInt::from(-256));
    }

    #[test]
    fn mutation_marks_dirty_until_next_read() {
        let mut li = LargeInteger::from_magnitude(&BigUint::from(5u32));
        assert!(!li.is_dirty());

        assert!(li.set_byte(0, 7));
        li.bytes_mut().push(1);
        assert!(li.is_dirty());

        assert_eq!(li.magnitude(), &BigUint::from(263u32));
        assert!(!li.is_dirty());
        assert!(!li.set_byte(9, 0));
    }

    #[test]
    fn demotion_respects_small_int_range() {
        assert_eq!(demote(&BigInt::from(42)), Some(Value::Int(42)));
        assert_eq!(demote(&BigInt::from(crate::SMALL_INT_MAX)), Some(Value::Int(crate::SMALL_INT_MAX)));
        assert_eq!(demote(&(BigInt::from(crate::SMALL_INT_MAX) + 1)), None);
        assert_eq!(demote(&BigInt::from(i64::MIN)), None);
    }
}
