//! Barrel shifter.
//!
//! Every function returns `(result, carry_out)`. Shifts encoded as an immediate treat an amount of
//! zero specially (`LSR #0`/`ASR #0` mean "by 32", `ROR #0` means RRX); shifts by a register use
//! the bottom byte of the register and an amount of zero leaves both value and carry untouched.

use crate::bits::bit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShiftKind {
    Lsl,
    Lsr,
    Asr,
    Ror,
}

impl ShiftKind {
    /// Decodes the two-bit shift type field.
    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        match bits & 3 {
            0 => Self::Lsl,
            1 => Self::Lsr,
            2 => Self::Asr,
            _ => Self::Ror,
        }
    }
}

#[inline]
pub const fn lsl(value: u32, amount: u32, carry: bool) -> (u32, bool) {
    match amount {
        0 => (value, carry),
        1..=31 => (value << amount, bit(value, 32 - amount)),
        32 => (0, bit(value, 0)),
        _ => (0, false),
    }
}

#[inline]
pub const fn lsr(value: u32, amount: u32, carry: bool, immediate: bool) -> (u32, bool) {
    let amount = if immediate && amount == 0 { 32 } else { amount };
    match amount {
        0 => (value, carry),
        1..=31 => (value >> amount, bit(value, amount - 1)),
        32 => (0, bit(value, 31)),
        _ => (0, false),
    }
}

#[inline]
pub const fn asr(value: u32, amount: u32, carry: bool, immediate: bool) -> (u32, bool) {
    let amount = if immediate && amount == 0 { 32 } else { amount };
    match amount {
        0 => (value, carry),
        1..=31 => (((value as i32) >> amount) as u32, bit(value, amount - 1)),
        _ => (((value as i32) >> 31) as u32, bit(value, 31)),
    }
}

#[inline]
pub const fn ror(value: u32, amount: u32, carry: bool, immediate: bool) -> (u32, bool) {
    if amount == 0 {
        return if immediate {
            rrx(value, carry)
        } else {
            (value, carry)
        };
    }
    let amount = amount & 31;
    if amount == 0 {
        (value, bit(value, 31))
    } else {
        (value.rotate_right(amount), bit(value, amount - 1))
    }
}

/// Rotate right by one through the carry flag.
#[inline]
pub const fn rrx(value: u32, carry: bool) -> (u32, bool) {
    (((carry as u32) << 31) | (value >> 1), bit(value, 0))
}

/// Shift with immediate-encoding semantics (`amount` is the 5-bit field).
#[inline]
pub const fn shift_immediate(kind: ShiftKind, value: u32, amount: u32, carry: bool) -> (u32, bool) {
    match kind {
        ShiftKind::Lsl => lsl(value, amount, carry),
        ShiftKind::Lsr => lsr(value, amount, carry, true),
        ShiftKind::Asr => asr(value, amount, carry, true),
        ShiftKind::Ror => ror(value, amount, carry, true),
    }
}

/// Shift by a register amount; only the bottom byte of `amount` is used.
#[inline]
pub const fn shift_register(kind: ShiftKind, value: u32, amount: u32, carry: bool) -> (u32, bool) {
    let amount = amount & 0xFF;
    match kind {
        ShiftKind::Lsl => lsl(value, amount, carry),
        ShiftKind::Lsr => lsr(value, amount, carry, false),
        ShiftKind::Asr => asr(value, amount, carry, false),
        ShiftKind::Ror => ror(value, amount, carry, false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsl_edges() {
        assert_eq!(lsl(0x8000_0001, 0, true), (0x8000_0001, true));
        assert_eq!(lsl(0x8000_0001, 1, false), (0x0000_0002, true));
        assert_eq!(lsl(0x0000_0001, 32, false), (0, true));
        assert_eq!(lsl(0xFFFF_FFFF, 33, true), (0, false));
    }

    #[test]
    fn immediate_zero_amounts_are_special() {
        assert_eq!(lsr(0x8000_0000, 0, false, true), (0, true));
        assert_eq!(lsr(0x8000_0000, 0, false, false), (0x8000_0000, false));
        assert_eq!(asr(0x8000_0000, 0, false, true), (0xFFFF_FFFF, true));
        assert_eq!(asr(0x4000_0000, 0, true, false), (0x4000_0000, true));
        assert_eq!(ror(0x0000_0003, 0, true, true), (0x8000_0001, true));
        assert_eq!(ror(0x0000_0003, 0, true, false), (0x0000_0003, true));
    }

    #[test]
    fn register_shifts_beyond_width() {
        assert_eq!(shift_register(ShiftKind::Lsr, 0x8000_0000, 32, false), (0, true));
        assert_eq!(shift_register(ShiftKind::Lsr, 0x8000_0000, 33, true), (0, false));
        assert_eq!(shift_register(ShiftKind::Asr, 0x8000_0000, 200, false), (0xFFFF_FFFF, true));
        assert_eq!(shift_register(ShiftKind::Ror, 0x8000_0001, 32, false), (0x8000_0001, true));
        assert_eq!(shift_register(ShiftKind::Ror, 0x0000_0001, 33, false), (0x8000_0000, true));
        // Only the bottom byte of the amount register counts.
        assert_eq!(shift_register(ShiftKind::Lsl, 1, 0x100, true), (1, true));
    }
}
