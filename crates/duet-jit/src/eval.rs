//! Reference semantics of the IR data ops. The IR interpreter calls these directly and the
//! native backend reaches them through helper trampolines for the ops it does not inline.

use duet_cpu_core::CpuState;
use duet_types::bits::{add_with_carry, saturating_add, saturating_sub, sub_with_carry};
use duet_types::shifter::{rrx, shift_register, ShiftKind};
use duet_types::Psr;

use crate::ir::{BinaryOp, FlagMask, SaturatingOp};

/// Writes the flags selected by `mask`: N and Z from `result`, C and V as given.
pub(crate) fn update_flags(
    state: &mut CpuState,
    mask: FlagMask,
    result: u32,
    carry: bool,
    overflow: bool,
) {
    if mask.is_empty() {
        return;
    }
    let mut value = 0;
    if result >> 31 != 0 {
        value |= FlagMask::N.bits();
    }
    if result == 0 {
        value |= FlagMask::Z.bits();
    }
    if carry {
        value |= FlagMask::C.bits();
    }
    if overflow {
        value |= FlagMask::V.bits();
    }
    state.set_cpsr_masked(value, mask.bits());
}

#[inline]
fn flags_of(state: &CpuState) -> (bool, bool) {
    let cpsr = state.cpsr();
    (cpsr.contains(Psr::C), cpsr.contains(Psr::V))
}

pub(crate) fn unary(state: &mut CpuState, invert: bool, src: u32, flags: FlagMask) -> u32 {
    let result = if invert { !src } else { src };
    let (c, v) = flags_of(state);
    update_flags(state, flags, result, c, v);
    result
}

pub(crate) fn binary(
    state: &mut CpuState,
    op: BinaryOp,
    lhs: u32,
    rhs: u32,
    flags: FlagMask,
) -> u32 {
    let (c, v) = flags_of(state);
    let (result, carry, overflow) = match op {
        BinaryOp::Add => add_with_carry(lhs, rhs, false),
        BinaryOp::AddCarry => add_with_carry(lhs, rhs, c),
        BinaryOp::Sub => sub_with_carry(lhs, rhs, true),
        BinaryOp::SubCarry => sub_with_carry(lhs, rhs, c),
        BinaryOp::And => (lhs & rhs, c, v),
        BinaryOp::Or => (lhs | rhs, c, v),
        BinaryOp::Xor => (lhs ^ rhs, c, v),
        BinaryOp::BitClear => (lhs & !rhs, c, v),
    };
    update_flags(state, flags, result, carry, overflow);
    result
}

pub(crate) fn shift(
    state: &mut CpuState,
    kind: ShiftKind,
    value: u32,
    amount: u32,
    flags: FlagMask,
) -> u32 {
    let (c, v) = flags_of(state);
    let (result, carry) = shift_register(kind, value, amount & 0xFF, c);
    update_flags(state, flags, result, carry, v);
    result
}

pub(crate) fn rotate_right_extend(state: &mut CpuState, src: u32, flags: FlagMask) -> u32 {
    let (c, v) = flags_of(state);
    let (result, carry) = rrx(src, c);
    update_flags(state, flags, result, carry, v);
    result
}

pub(crate) fn multiply(state: &mut CpuState, lhs: u32, rhs: u32, flags: FlagMask) -> u32 {
    let result = lhs.wrapping_mul(rhs);
    let (c, v) = flags_of(state);
    update_flags(state, flags, result, c, v);
    result
}

/// Returns `(lo, hi)`. N and Z describe the whole 64-bit result.
pub(crate) fn multiply_long(
    state: &mut CpuState,
    lhs: u32,
    rhs: u32,
    signed: bool,
    accumulate: Option<(u32, u32)>,
    flags: FlagMask,
) -> (u32, u32) {
    let mut result = if signed {
        (lhs as i32 as i64).wrapping_mul(rhs as i32 as i64) as u64
    } else {
        lhs as u64 * rhs as u64
    };
    if let Some((lo, hi)) = accumulate {
        result = result.wrapping_add((hi as u64) << 32 | lo as u64);
    }
    if !flags.is_empty() {
        let mut value = 0;
        if result >> 63 != 0 {
            value |= FlagMask::N.bits();
        }
        if result == 0 {
            value |= FlagMask::Z.bits();
        }
        state.set_cpsr_masked(value, (flags & FlagMask::NZ).bits());
    }
    (result as u32, (result >> 32) as u32)
}

pub(crate) fn saturating(state: &mut CpuState, op: SaturatingOp, lhs: u32, rhs: u32) -> u32 {
    let (result, saturated) = match op {
        SaturatingOp::Add => saturating_add(lhs, rhs),
        SaturatingOp::Sub => saturating_sub(lhs, rhs),
    };
    if saturated {
        state.set_flag(Psr::Q, true);
    }
    result
}

pub(crate) fn add_sticky(state: &mut CpuState, lhs: u32, rhs: u32) -> u32 {
    let (result, _, overflow) = add_with_carry(lhs, rhs, false);
    if overflow {
        state.set_flag(Psr::Q, true);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn logical_ops_keep_carry_and_overflow() {
        let mut state = CpuState::new();
        state.set_cpsr_masked(0x3000_0000, 0xF000_0000);
        let result = binary(&mut state, BinaryOp::And, 0x8000_0000, 0xFFFF_FFFF, FlagMask::NZ);
        assert_eq!(result, 0x8000_0000);
        assert_eq!(state.cpsr().nzcv(), 0b1011);
    }

    #[test]
    fn subtract_with_carry_borrows_when_carry_clear() {
        let mut state = CpuState::new();
        let result = binary(&mut state, BinaryOp::SubCarry, 5, 3, FlagMask::NZCV);
        assert_eq!(result, 1);
        assert_eq!(state.cpsr().nzcv(), 0b0010);
    }

    #[test]
    fn register_shift_by_zero_keeps_carry() {
        let mut state = CpuState::new();
        state.set_flag(Psr::C, true);
        let result = shift(&mut state, ShiftKind::Lsr, 0x10, 0x100, FlagMask::C);
        assert_eq!(result, 0x10);
        assert!(state.cpsr().carry());
    }

    #[test]
    fn long_multiply_flags_cover_64_bits() {
        let mut state = CpuState::new();
        let (lo, hi) = multiply_long(&mut state, 0x1_0000, 0x1_0000, false, None, FlagMask::NZ);
        assert_eq!((lo, hi), (0, 1));
        assert!(!state.cpsr().contains(Psr::Z));
        let (lo, hi) = multiply_long(&mut state, 1, 1, true, Some((u32::MAX, u32::MAX)), FlagMask::NZ);
        assert_eq!((lo, hi), (0, 0));
        assert!(state.cpsr().contains(Psr::Z));
    }

    #[test]
    fn sticky_overflow_sets_q() {
        let mut state = CpuState::new();
        assert_eq!(add_sticky(&mut state, 0x7FFF_FFFF, 1), 0x8000_0000);
        assert!(state.cpsr().contains(Psr::Q));
        let mut state = CpuState::new();
        assert_eq!(saturating(&mut state, SaturatingOp::Sub, 0x8000_0000, 1), 0x8000_0000);
        assert!(state.cpsr().contains(Psr::Q));
    }
}
