//! The one entry point generated code calls back into.
//!
//! Ops the block compiler does not inline are renamed into a fixed frame of variables (operands
//! first, results after them) and executed by the IR interpreter's handlers, so both backends
//! share a single definition of every op.

use duet_cpu_core::{Bus, Core};

use crate::ir::{IrOp, IrVariable};
use crate::ir_interp;

/// Variables `0..OPERANDS` are the op's inputs.
pub(super) const OPERANDS: u32 = 4;
/// Variables `OPERANDS..OPERANDS + RESULTS` are its outputs.
pub(super) const RESULTS: u32 = 2;

#[inline]
pub(super) fn operand(slot: u32) -> IrVariable {
    debug_assert!(slot < OPERANDS);
    IrVariable(slot)
}

#[inline]
pub(super) fn result(slot: u32) -> IrVariable {
    debug_assert!(slot < RESULTS);
    IrVariable(OPERANDS + slot)
}

/// Runs a renamed op. The first result comes back in the low word, the second in the high
/// word.
///
/// # Safety
///
/// `core` must be the core the block was entered with and `op` must point at an op owned by
/// the running block. Neither may be aliased by a live reference.
pub(super) unsafe extern "C" fn run_op<M: Bus>(
    core: *mut Core<M>,
    op: *const IrOp,
    a: u32,
    b: u32,
    c: u32,
    d: u32,
) -> u64 {
    let mut frame = [a, b, c, d, 0, 0];
    let (core, op) = unsafe { (&mut *core, &*op) };
    ir_interp::execute(core, op, &mut frame);
    frame[OPERANDS as usize] as u64 | (frame[OPERANDS as usize + 1] as u64) << 32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{FlagMask, IrValue};
    use duet_cpu_core::FlatMemory;
    use duet_types::{Arch, Psr};

    #[test]
    fn results_are_packed_low_then_high() {
        let mut core = Core::new(Arch::V5, FlatMemory::new(0x1000));
        let op = IrOp::MultiplyLong {
            dst_lo: result(0),
            dst_hi: result(1),
            lhs: operand(0).into(),
            rhs: IrValue::Constant(0x10),
            signed: false,
            accumulate: None,
            flags: FlagMask::NZ,
        };
        let packed = unsafe { run_op(&mut core, &op, 0x8000_0001, 0, 0, 0) };
        assert_eq!(packed, 0x8_0000_0010);
        assert!(!core.state.cpsr().contains(Psr::Z));
    }
}
