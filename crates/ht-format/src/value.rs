//! Counter cell values: a 9-byte `(opcode, count)` record. Counter semantics are opt-in —
//! nothing about a cell's key marks it as a counter, so callers must use [`CounterValue`]
//! explicitly rather than have it auto-detected from a plain value's shape.

use crate::error::BlockError;


/// The opcode carried by a counter value: whether the stored count is a delta to merge with
/// whatever is already cached, or a hard reset that replaces it outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CounterOp {
    Increment,
    Reset,
}

impl CounterOp {
    const INCREMENT_BYTE: u8 = 8;
    const RESET_BYTE:     u8 = 9;

    #[must_use]
    pub const fn to_byte(self) -> u8 {
        match self {
            Self::Increment => Self::INCREMENT_BYTE,
            Self::Reset     => Self::RESET_BYTE,
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self, BlockError> {
        match byte {
            Self::INCREMENT_BYTE => Ok(Self::Increment),
            Self::RESET_BYTE     => Ok(Self::Reset),
            other                => Err(BlockError::UnsupportedType(other)),
        }
    }
}

/// A decoded counter value: a one-byte opcode followed by a big-endian 64-bit count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CounterValue {
    pub op:    CounterOp,
    pub count: i64,
}

/// Byte length of an encoded [`CounterValue`]: one opcode byte plus an 8-byte count.
pub const ENCODED_LEN: usize = 9;

impl CounterValue {
    #[must_use]
    pub const fn increment(count: i64) -> Self {
        Self { op: CounterOp::Increment, count }
    }

    #[must_use]
    pub const fn reset(count: i64) -> Self {
        Self { op: CounterOp::Reset, count }
    }

    #[must_use]
    pub fn encode(self) -> [u8; ENCODED_LEN] {
        let mut out = [0_u8; ENCODED_LEN];
        out[0] = self.op.to_byte();
        out[1..].copy_from_slice(&self.count.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, BlockError> {
        let [opcode, rest @ ..] = bytes else {
            return Err(BlockError::BadHeader);
        };
        let count_bytes: [u8; 8] = rest.try_into().map_err(|_err| BlockError::BadHeader)?;
        Ok(Self { op: CounterOp::from_byte(*opcode)?, count: i64::from_be_bytes(count_bytes) })
    }

    /// Merges an incoming increment with whatever count is already cached for the same
    /// `(row, column_family, column_qualifier)`, per the cell cache's `add_counter` rule: a
    /// `Reset` always replaces outright, an `Increment` sums with the existing stored count.
    #[must_use]
    pub fn merge(self, existing: Self) -> Self {
        match self.op {
            CounterOp::Reset => self,
            CounterOp::Increment => Self {
                op:    CounterOp::Increment,
                count: existing.count.wrapping_add(self.count),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{CounterOp, CounterValue};

    #[test]
    fn round_trips_increment() {
        let value = CounterValue::increment(42);
        let encoded = value.encode();
        assert_eq!(CounterValue::decode(&encoded).unwrap(), value);
    }

    #[test]
    fn round_trips_reset() {
        let value = CounterValue::reset(-7);
        let encoded = value.encode();
        assert_eq!(CounterValue::decode(&encoded).unwrap(), value);
    }

    #[test]
    fn increment_merges_additively() {
        let existing = CounterValue::increment(10);
        let incoming = CounterValue::increment(5);
        let merged = incoming.merge(existing);
        assert_eq!(merged.op, CounterOp::Increment);
        assert_eq!(merged.count, 15);
    }

    #[test]
    fn reset_overrides_existing() {
        let existing = CounterValue::increment(10);
        let incoming = CounterValue::reset(3);
        let merged = incoming.merge(existing);
        assert_eq!(merged.op, CounterOp::Reset);
        assert_eq!(merged.count, 3);
    }

    #[test]
    fn rejects_unknown_opcode() {
        let mut bytes = CounterValue::increment(1).encode();
        bytes[0] = 0;
        assert!(CounterValue::decode(&bytes).is_err());
    }
}
