#![cfg(not(target_arch = "wasm32"))]

use duet_types::bits::{add_overflow, add_with_carry, sub_overflow, sub_with_carry};
use duet_types::shifter::{lsl, lsr, ror, shift_immediate, shift_register, ShiftKind};
use duet_types::{Cond, CONDITION_TABLE};
use proptest::prelude::*;

fn formula(cond: Cond, nzcv: u32) -> bool {
    let n = nzcv & 8 != 0;
    let z = nzcv & 4 != 0;
    let c = nzcv & 2 != 0;
    let v = nzcv & 1 != 0;
    match cond {
        Cond::Eq => z,
        Cond::Ne => !z,
        Cond::Cs => c,
        Cond::Cc => !c,
        Cond::Mi => n,
        Cond::Pl => !n,
        Cond::Vs => v,
        Cond::Vc => !v,
        Cond::Hi => c && !z,
        Cond::Ls => !c || z,
        Cond::Ge => n == v,
        Cond::Lt => n != v,
        Cond::Gt => !z && n == v,
        Cond::Le => z || n != v,
        Cond::Al => true,
        Cond::Nv => false,
    }
}

#[test]
fn condition_table_matches_formulas() {
    for cond in Cond::ALL {
        for nzcv in 0..16 {
            assert_eq!(
                CONDITION_TABLE.passes(cond, nzcv),
                formula(cond, nzcv),
                "{cond:?} nzcv={nzcv:04b}"
            );
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig { cases: 512, .. ProptestConfig::default() })]

    #[test]
    fn add_overflow_matches_wide_sum(a in any::<u32>(), b in any::<u32>()) {
        let exact = a as i32 as i64 + b as i32 as i64;
        let expected = exact < i32::MIN as i64 || exact > i32::MAX as i64;
        prop_assert_eq!(add_overflow(a, b, a.wrapping_add(b)), expected);
    }

    #[test]
    fn sub_overflow_matches_wide_difference(a in any::<u32>(), b in any::<u32>()) {
        let exact = a as i32 as i64 - b as i32 as i64;
        let expected = exact < i32::MIN as i64 || exact > i32::MAX as i64;
        prop_assert_eq!(sub_overflow(a, b, a.wrapping_sub(b)), expected);
    }

    #[test]
    fn carry_chain_matches_wide_arithmetic(a in any::<u32>(), b in any::<u32>(), c in any::<bool>()) {
        let (sum, carry, _) = add_with_carry(a, b, c);
        let wide = a as u64 + b as u64 + c as u64;
        prop_assert_eq!(sum, wide as u32);
        prop_assert_eq!(carry, wide >> 32 != 0);

        let (diff, no_borrow, _) = sub_with_carry(a, b, c);
        let wide = a as i64 - b as i64 - (!c) as i64;
        prop_assert_eq!(diff, wide as u32);
        prop_assert_eq!(no_borrow, wide >= 0);
    }

    #[test]
    fn lsl_by_zero_and_thirty_two(x in any::<u32>(), c in any::<bool>()) {
        prop_assert_eq!(lsl(x, 0, c), (x, c));
        prop_assert_eq!(lsl(x, 32, c), (0, x & 1 != 0));
    }

    #[test]
    fn immediate_zero_encodings(x in any::<u32>(), c in any::<bool>()) {
        prop_assert_eq!(lsr(x, 0, c, true), (0, x >> 31 != 0));
        prop_assert_eq!(ror(x, 0, c, true), (((c as u32) << 31) | (x >> 1), x & 1 != 0));
        prop_assert_eq!(shift_immediate(ShiftKind::Ror, x, 0, c), ror(x, 0, c, true));
    }

    #[test]
    fn register_shift_by_zero_is_identity(x in any::<u32>(), c in any::<bool>(), kind in 0u32..4) {
        let kind = ShiftKind::from_bits(kind);
        prop_assert_eq!(shift_register(kind, x, 0, c), (x, c));
        prop_assert_eq!(shift_register(kind, x, 0x100, c), (x, c));
    }

    #[test]
    fn in_range_shifts_match_native_operators(x in any::<u32>(), n in 1u32..32, c in any::<bool>()) {
        prop_assert_eq!(shift_register(ShiftKind::Lsl, x, n, c).0, x << n);
        prop_assert_eq!(shift_register(ShiftKind::Lsr, x, n, c).0, x >> n);
        prop_assert_eq!(shift_register(ShiftKind::Asr, x, n, c).0, ((x as i32) >> n) as u32);
        prop_assert_eq!(shift_register(ShiftKind::Ror, x, n, c).0, x.rotate_right(n));
    }
}
