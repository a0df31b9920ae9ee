//! Register assignment for block variables.
//!
//! Variables live from their definition to their last use and never cross a block boundary, so
//! a single forward pass over the ops with precomputed last uses is enough. Only callee-saved
//! registers are handed out: helper calls then never clobber a live variable.

use rustc_hash::FxHashMap;

use super::a64::Reg;
use crate::ir::{IrOp, IrVariable};

/// `x21..=x28`.
pub const POOL: [Reg; 8] = [
    Reg(21),
    Reg(22),
    Reg(23),
    Reg(24),
    Reg(25),
    Reg(26),
    Reg(27),
    Reg(28),
];

/// More variables are live at once than [`POOL`] holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OutOfRegisters {
    pub op_index: usize,
}

#[derive(Debug, Default)]
pub struct Allocation {
    /// Absent for variables that are defined but never read.
    registers: FxHashMap<IrVariable, Reg>,
    /// Largest number of registers live at once.
    pub peak: usize,
}

impl Allocation {
    #[inline]
    pub fn get(&self, var: IrVariable) -> Option<Reg> {
        self.registers.get(&var).copied()
    }
}

pub fn allocate(ops: &[IrOp]) -> Result<Allocation, OutOfRegisters> {
    let mut last_use = FxHashMap::default();
    for (index, op) in ops.iter().enumerate() {
        op.for_each_use(|var| {
            last_use.insert(var, index);
        });
    }

    let mut free: Vec<Reg> = POOL.iter().rev().copied().collect();
    let mut allocation = Allocation::default();
    for (index, op) in ops.iter().enumerate() {
        // Operands dying here give their register to this op's result.
        op.for_each_use(|var| {
            if last_use.get(&var) == Some(&index) {
                if let Some(reg) = allocation.registers.get(&var) {
                    if !free.contains(reg) {
                        free.push(*reg);
                    }
                }
            }
        });

        let mut exhausted = false;
        op.for_each_def(|var| {
            if !last_use.contains_key(&var) {
                return;
            }
            match free.pop() {
                Some(reg) => {
                    allocation.registers.insert(var, reg);
                }
                None => exhausted = true,
            }
        });
        if exhausted {
            return Err(OutOfRegisters { op_index: index });
        }
        allocation.peak = allocation.peak.max(POOL.len() - free.len());
    }
    Ok(allocation)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ir::{BinaryOp, FlagMask, GuestReg, IrValue};
    use duet_types::Mode;

    fn load(dst: u32, index: u8) -> IrOp {
        IrOp::LoadGpr {
            dst: IrVariable(dst),
            reg: GuestReg {
                index,
                mode: Mode::User,
            },
        }
    }

    fn add(dst: u32, lhs: u32, rhs: u32) -> IrOp {
        IrOp::Binary {
            op: BinaryOp::Add,
            dst: IrVariable(dst),
            lhs: IrVariable(lhs).into(),
            rhs: IrVariable(rhs).into(),
            flags: FlagMask::empty(),
        }
    }

    fn store(src: u32) -> IrOp {
        IrOp::StoreGpr {
            reg: GuestReg {
                index: 0,
                mode: Mode::User,
            },
            src: IrValue::Variable(IrVariable(src)),
        }
    }

    #[test]
    fn dying_operands_are_reused() {
        let ops = [load(0, 1), load(1, 2), add(2, 0, 1), store(2)];
        let allocation = allocate(&ops).unwrap();
        assert_eq!(allocation.peak, 2);
        let result = allocation.get(IrVariable(2)).unwrap();
        assert!(result == allocation.get(IrVariable(0)).unwrap() || result == allocation.get(IrVariable(1)).unwrap());
    }

    #[test]
    fn unused_definitions_get_no_register() {
        let ops = [load(0, 1), load(1, 2), store(1)];
        let allocation = allocate(&ops).unwrap();
        assert_eq!(allocation.get(IrVariable(0)), None);
        assert!(allocation.get(IrVariable(1)).is_some());
    }

    #[test]
    fn too_many_live_values_are_rejected() {
        let mut ops: Vec<IrOp> = (0..9).map(|i| load(i, i as u8)).collect();
        ops.extend((0..9).map(store));
        assert_eq!(allocate(&ops).unwrap_err(), OutOfRegisters { op_index: 8 });
    }

    #[test]
    fn live_ranges_do_not_share_registers() {
        let ops = [load(0, 1), load(1, 2), add(2, 0, 0), store(1), store(2)];
        let allocation = allocate(&ops).unwrap();
        assert_ne!(allocation.get(IrVariable(1)), allocation.get(IrVariable(2)));
    }
}
