//! Fixed width storage units shared by local variable arrays and operand
//! stacks.
use crate::heap::Ref;

/// One 32-bit storage unit. Category one values (int, float, reference)
/// fill one slot; category two values (long, double) fill two consecutive
/// slots, high word first, and are always read and written as a pair.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Hash)]
pub struct Slot(u32);

impl Slot {
    pub const ZERO: Slot = Slot(0);

    pub const fn from_raw(bits: u32) -> Self {
        Slot(bits)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn from_int(value: i32) -> Self {
        Slot(value as u32)
    }

    pub const fn as_int(self) -> i32 {
        self.0 as i32
    }

    pub fn from_float(value: f32) -> Self {
        Slot(value.to_bits())
    }

    pub fn as_float(self) -> f32 {
        f32::from_bits(self.0)
    }

    pub const fn from_ref(value: Ref) -> Self {
        Slot(value.handle())
    }

    pub const fn as_ref(self) -> Ref {
        Ref::from_handle(self.0)
    }

    /// Splits a long into its (high, low) slot pair.
    pub const fn pair_from_long(value: i64) -> [Slot; 2] {
        [Slot((value >> 32) as u32), Slot(value as u32)]
    }

    pub const fn long_from_pair(high: Slot, low: Slot) -> i64 {
        ((high.0 as u64) << 32 | low.0 as u64) as i64
    }

    pub fn pair_from_double(value: f64) -> [Slot; 2] {
        Self::pair_from_long(value.to_bits() as i64)
    }

    pub fn double_from_pair(high: Slot, low: Slot) -> f64 {
        f64::from_bits(Self::long_from_pair(high, low) as u64)
    }
}

impl From<i32> for Slot {
    fn from(value: i32) -> Self {
        Slot::from_int(value)
    }
}

impl From<f32> for Slot {
    fn from(value: f32) -> Self {
        Slot::from_float(value)
    }
}

impl From<Ref> for Slot {
    fn from(value: Ref) -> Self {
        Slot::from_ref(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn long_pair_preserves_every_bit() {
        for value in [0i64, -1, i64::MIN, i64::MAX, 0x1122_3344_5566_7788] {
            let [hi, lo] = Slot::pair_from_long(value);
            assert_eq!(Slot::long_from_pair(hi, lo), value);
        }
    }

    #[test]
    fn double_pair_preserves_nan_payload() {
        let nan = f64::from_bits(0x7ff8_0000_0000_1234);
        let [hi, lo] = Slot::pair_from_double(nan);
        assert_eq!(Slot::double_from_pair(hi, lo).to_bits(), nan.to_bits());
    }

    #[test]
    fn category_one_conversions() {
        assert_eq!(Slot::from_int(-7).as_int(), -7);
        assert_eq!(Slot::from_float(1.5).as_float(), 1.5);
        assert!(Slot::ZERO.as_ref().is_null());
    }
}
