//! Bit-field and flag arithmetic primitives.

/// Sign-extends the low `bits` bits of `value` to 32 bits.
#[inline]
pub const fn sign_extend(value: u32, bits: u32) -> u32 {
    let shift = 32 - bits;
    (((value << shift) as i32) >> shift) as u32
}

#[inline]
pub const fn bit(value: u32, n: u32) -> bool {
    (value >> n) & 1 != 0
}

/// Extracts `len` bits of `value` starting at bit `lo`.
#[inline]
pub const fn field(value: u32, lo: u32, len: u32) -> u32 {
    ((value as u64 >> lo) & ((1u64 << len) - 1)) as u32
}

#[inline]
pub const fn rotate_right(value: u32, amount: u32) -> u32 {
    value.rotate_right(amount & 31)
}

/// Signed overflow of `lhs + rhs == result`.
#[inline]
pub const fn add_overflow(lhs: u32, rhs: u32, result: u32) -> bool {
    ((lhs ^ result) & (rhs ^ result)) >> 31 != 0
}

/// Signed overflow of `lhs - rhs == result`.
#[inline]
pub const fn sub_overflow(lhs: u32, rhs: u32, result: u32) -> bool {
    ((lhs ^ rhs) & (lhs ^ result)) >> 31 != 0
}

/// `lhs + rhs + carry`, returning `(result, carry_out, overflow)`.
#[inline]
pub const fn add_with_carry(lhs: u32, rhs: u32, carry: bool) -> (u32, bool, bool) {
    let wide = lhs as u64 + rhs as u64 + carry as u64;
    let result = wide as u32;
    (result, wide > u32::MAX as u64, add_overflow(lhs, rhs, result))
}

/// `lhs - rhs - !carry` with ARM borrow semantics: carry out is set when no borrow occurs.
#[inline]
pub const fn sub_with_carry(lhs: u32, rhs: u32, carry: bool) -> (u32, bool, bool) {
    let (result, carry_out, _) = add_with_carry(lhs, !rhs, carry);
    (result, carry_out, sub_overflow(lhs, rhs, result))
}

/// Signed saturating addition; the flag reports whether the result saturated.
#[inline]
pub const fn saturating_add(lhs: u32, rhs: u32) -> (u32, bool) {
    match (lhs as i32).checked_add(rhs as i32) {
        Some(v) => (v as u32, false),
        None if (lhs as i32) < 0 => (i32::MIN as u32, true),
        None => (i32::MAX as u32, true),
    }
}

/// Signed saturating subtraction; the flag reports whether the result saturated.
#[inline]
pub const fn saturating_sub(lhs: u32, rhs: u32) -> (u32, bool) {
    match (lhs as i32).checked_sub(rhs as i32) {
        Some(v) => (v as u32, false),
        None if (lhs as i32) < 0 => (i32::MIN as u32, true),
        None => (i32::MAX as u32, true),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_extend_branch_offsets() {
        assert_eq!(sign_extend(0x00FF_FFFF, 24), 0xFFFF_FFFF);
        assert_eq!(sign_extend(0x007F_FFFF, 24), 0x007F_FFFF);
        assert_eq!(sign_extend(0x80, 8), 0xFFFF_FF80);
        assert_eq!(sign_extend(0x7FF, 11), 0xFFFF_FFFF);
    }

    #[test]
    fn field_extracts_full_width() {
        assert_eq!(field(0xDEAD_BEEF, 0, 32), 0xDEAD_BEEF);
        assert_eq!(field(0xDEAD_BEEF, 28, 4), 0xD);
        assert_eq!(field(0xDEAD_BEEF, 4, 8), 0xEE);
    }

    #[test]
    fn sub_with_carry_matches_subtraction() {
        assert_eq!(sub_with_carry(5, 3, true), (2, true, false));
        assert_eq!(sub_with_carry(3, 5, true), (0xFFFF_FFFE, false, false));
        assert_eq!(sub_with_carry(0x8000_0000, 1, true), (0x7FFF_FFFF, true, true));
        // Borrow-in subtracts one more.
        assert_eq!(sub_with_carry(5, 3, false), (1, true, false));
    }

    #[test]
    fn saturation_clamps_both_directions() {
        assert_eq!(saturating_add(0x7FFF_FFFF, 1), (0x7FFF_FFFF, true));
        assert_eq!(saturating_add(0x8000_0000, 0xFFFF_FFFF), (0x8000_0000, true));
        assert_eq!(saturating_sub(0x8000_0000, 1), (0x8000_0000, true));
        assert_eq!(saturating_sub(10, 3), (7, false));
    }
}
