//! Block-local intermediate representation.
//!
//! Every [`IrVariable`] is assigned exactly once and only lives for the duration of one block.
//! Guest state (registers, status registers, memory) is only reached through explicit ops, so a
//! backend can keep variables in host registers and still observe every architectural effect.

use bitflags::bitflags;
use duet_cpu_core::{Cp15Register, LoadKind, StoreWidth};
use duet_types::shifter::ShiftKind;
use duet_types::{ExceptionKind, Mode};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IrVariable(pub u32);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IrValue {
    Variable(IrVariable),
    Constant(u32),
}

impl From<IrVariable> for IrValue {
    fn from(var: IrVariable) -> Self {
        IrValue::Variable(var)
    }
}

impl IrValue {
    #[inline]
    pub fn variable(self) -> Option<IrVariable> {
        match self {
            IrValue::Variable(var) => Some(var),
            IrValue::Constant(_) => None,
        }
    }
}

bitflags! {
    /// CPSR flags an op updates. Bit positions match the CPSR.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
    pub struct FlagMask: u32 {
        const N = 1 << 31;
        const Z = 1 << 30;
        const C = 1 << 29;
        const V = 1 << 28;

        const NZ = Self::N.bits() | Self::Z.bits();
        const NZC = Self::NZ.bits() | Self::C.bits();
        const NZCV = Self::NZC.bits() | Self::V.bits();
    }
}

/// A general-purpose register (r0-r14) in a specific bank.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GuestReg {
    pub index: u8,
    pub mode: Mode,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    /// `lhs + rhs + C`.
    AddCarry,
    Sub,
    /// `lhs - rhs - !C`.
    SubCarry,
    And,
    Or,
    Xor,
    /// `lhs & !rhs`.
    BitClear,
}

impl BinaryOp {
    /// Whether V is meaningful (and C comes from the adder rather than the shifter).
    #[inline]
    pub fn is_arithmetic(self) -> bool {
        matches!(
            self,
            BinaryOp::Add | BinaryOp::AddCarry | BinaryOp::Sub | BinaryOp::SubCarry
        )
    }

    #[inline]
    pub fn reads_carry(self) -> bool {
        matches!(self, BinaryOp::AddCarry | BinaryOp::SubCarry)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SaturatingOp {
    Add,
    Sub,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrOp {
    LoadGpr {
        dst: IrVariable,
        reg: GuestReg,
    },
    StoreGpr {
        reg: GuestReg,
        src: IrValue,
    },
    LoadCpsr {
        dst: IrVariable,
    },
    /// Masked CPSR write; may switch modes.
    StoreCpsr {
        src: IrValue,
        mask: u32,
    },
    /// SPSR of the current mode. Only emitted when the mode has one.
    LoadSpsr {
        dst: IrVariable,
    },
    StoreSpsr {
        src: IrValue,
        mask: u32,
    },
    Copy {
        dst: IrVariable,
        src: IrValue,
        flags: FlagMask,
    },
    Not {
        dst: IrVariable,
        src: IrValue,
        flags: FlagMask,
    },
    Binary {
        op: BinaryOp,
        dst: IrVariable,
        lhs: IrValue,
        rhs: IrValue,
        flags: FlagMask,
    },
    /// Shift with register-shift semantics: only the bottom byte of `amount` counts and zero
    /// leaves value and carry unchanged. `C` in `flags` is the shifter carry-out.
    Shift {
        kind: ShiftKind,
        dst: IrVariable,
        value: IrValue,
        amount: IrValue,
        flags: FlagMask,
    },
    RotateRightExtend {
        dst: IrVariable,
        src: IrValue,
        flags: FlagMask,
    },
    Multiply {
        dst: IrVariable,
        lhs: IrValue,
        rhs: IrValue,
        flags: FlagMask,
    },
    /// 32x32 -> 64 multiply, optionally accumulating into `(lo, hi)`.
    MultiplyLong {
        dst_lo: IrVariable,
        dst_hi: IrVariable,
        lhs: IrValue,
        rhs: IrValue,
        signed: bool,
        accumulate: Option<(IrValue, IrValue)>,
        flags: FlagMask,
    },
    CountLeadingZeros {
        dst: IrVariable,
        src: IrValue,
    },
    /// Signed saturating arithmetic; sets Q when the result saturates.
    Saturating {
        op: SaturatingOp,
        dst: IrVariable,
        lhs: IrValue,
        rhs: IrValue,
    },
    /// Wrapping add that sets Q on signed overflow.
    AddSticky {
        dst: IrVariable,
        lhs: IrValue,
        rhs: IrValue,
    },
    MemoryRead {
        dst: IrVariable,
        addr: IrValue,
        kind: LoadKind,
    },
    MemoryWrite {
        addr: IrValue,
        value: IrValue,
        width: StoreWidth,
    },
    /// Branch within the block's instruction set.
    Branch {
        target: IrValue,
    },
    /// Branch selecting the instruction set from bit 0.
    BranchExchange {
        target: IrValue,
    },
    /// CPSR = SPSR, then branch in the restored instruction set.
    ReturnFromException {
        target: IrValue,
    },
    /// Exception entry for the instruction whose PC reads as `pc`.
    Exception {
        kind: ExceptionKind,
        pc: u32,
    },
    CoprocessorRead {
        dst: IrVariable,
        reg: Cp15Register,
    },
    CoprocessorWrite {
        reg: Cp15Register,
        src: IrValue,
    },
}

impl IrOp {
    /// Calls `f` with every variable the op reads.
    pub fn for_each_use(&self, mut f: impl FnMut(IrVariable)) {
        let mut visit = |value: &IrValue| {
            if let IrValue::Variable(var) = value {
                f(*var);
            }
        };
        match self {
            IrOp::LoadGpr { .. }
            | IrOp::LoadCpsr { .. }
            | IrOp::LoadSpsr { .. }
            | IrOp::Exception { .. }
            | IrOp::CoprocessorRead { .. } => {}
            IrOp::StoreGpr { src, .. }
            | IrOp::StoreCpsr { src, .. }
            | IrOp::StoreSpsr { src, .. }
            | IrOp::Copy { src, .. }
            | IrOp::Not { src, .. }
            | IrOp::RotateRightExtend { src, .. }
            | IrOp::CountLeadingZeros { src, .. }
            | IrOp::CoprocessorWrite { src, .. } => visit(src),
            IrOp::Binary { lhs, rhs, .. }
            | IrOp::Multiply { lhs, rhs, .. }
            | IrOp::Saturating { lhs, rhs, .. }
            | IrOp::AddSticky { lhs, rhs, .. } => {
                visit(lhs);
                visit(rhs);
            }
            IrOp::Shift { value, amount, .. } => {
                visit(value);
                visit(amount);
            }
            IrOp::MultiplyLong {
                lhs,
                rhs,
                accumulate,
                ..
            } => {
                visit(lhs);
                visit(rhs);
                if let Some((lo, hi)) = accumulate {
                    visit(lo);
                    visit(hi);
                }
            }
            IrOp::MemoryRead { addr, .. } => visit(addr),
            IrOp::MemoryWrite { addr, value, .. } => {
                visit(addr);
                visit(value);
            }
            IrOp::Branch { target }
            | IrOp::BranchExchange { target }
            | IrOp::ReturnFromException { target } => visit(target),
        }
    }

    /// Calls `f` with every variable the op defines.
    pub fn for_each_def(&self, mut f: impl FnMut(IrVariable)) {
        match *self {
            IrOp::LoadGpr { dst, .. }
            | IrOp::LoadCpsr { dst }
            | IrOp::LoadSpsr { dst }
            | IrOp::Copy { dst, .. }
            | IrOp::Not { dst, .. }
            | IrOp::Binary { dst, .. }
            | IrOp::Shift { dst, .. }
            | IrOp::RotateRightExtend { dst, .. }
            | IrOp::Multiply { dst, .. }
            | IrOp::CountLeadingZeros { dst, .. }
            | IrOp::Saturating { dst, .. }
            | IrOp::AddSticky { dst, .. }
            | IrOp::MemoryRead { dst, .. }
            | IrOp::CoprocessorRead { dst, .. } => f(dst),
            IrOp::MultiplyLong { dst_lo, dst_hi, .. } => {
                f(dst_lo);
                f(dst_hi);
            }
            IrOp::StoreGpr { .. }
            | IrOp::StoreCpsr { .. }
            | IrOp::StoreSpsr { .. }
            | IrOp::MemoryWrite { .. }
            | IrOp::Branch { .. }
            | IrOp::BranchExchange { .. }
            | IrOp::ReturnFromException { .. }
            | IrOp::Exception { .. }
            | IrOp::CoprocessorWrite { .. } => {}
        }
    }

    /// Copy of the op with every variable it reads passed through `uses` and every variable it
    /// defines passed through `defs`.
    pub fn rename(
        &self,
        mut uses: impl FnMut(IrVariable) -> IrVariable,
        mut defs: impl FnMut(IrVariable) -> IrVariable,
    ) -> IrOp {
        let mut value = |value: IrValue| match value {
            IrValue::Variable(var) => IrValue::Variable(uses(var)),
            constant => constant,
        };
        let mut op = *self;
        match &mut op {
            IrOp::LoadCpsr { .. }
            | IrOp::LoadGpr { .. }
            | IrOp::LoadSpsr { .. }
            | IrOp::Exception { .. }
            | IrOp::CoprocessorRead { .. } => {}
            IrOp::StoreGpr { src, .. }
            | IrOp::StoreCpsr { src, .. }
            | IrOp::StoreSpsr { src, .. }
            | IrOp::Copy { src, .. }
            | IrOp::Not { src, .. }
            | IrOp::RotateRightExtend { src, .. }
            | IrOp::CountLeadingZeros { src, .. }
            | IrOp::CoprocessorWrite { src, .. } => *src = value(*src),
            IrOp::Binary { lhs, rhs, .. }
            | IrOp::Multiply { lhs, rhs, .. }
            | IrOp::Saturating { lhs, rhs, .. }
            | IrOp::AddSticky { lhs, rhs, .. } => {
                *lhs = value(*lhs);
                *rhs = value(*rhs);
            }
            IrOp::Shift { value: v, amount, .. } => {
                *v = value(*v);
                *amount = value(*amount);
            }
            IrOp::MultiplyLong {
                lhs,
                rhs,
                accumulate,
                ..
            } => {
                *lhs = value(*lhs);
                *rhs = value(*rhs);
                if let Some((lo, hi)) = accumulate {
                    *lo = value(*lo);
                    *hi = value(*hi);
                }
            }
            IrOp::MemoryRead { addr, .. } => *addr = value(*addr),
            IrOp::MemoryWrite { addr, value: v, .. } => {
                *addr = value(*addr);
                *v = value(*v);
            }
            IrOp::Branch { target }
            | IrOp::BranchExchange { target }
            | IrOp::ReturnFromException { target } => *target = value(*target),
        }
        match &mut op {
            IrOp::LoadGpr { dst, .. }
            | IrOp::LoadCpsr { dst }
            | IrOp::LoadSpsr { dst }
            | IrOp::Copy { dst, .. }
            | IrOp::Not { dst, .. }
            | IrOp::Binary { dst, .. }
            | IrOp::Shift { dst, .. }
            | IrOp::RotateRightExtend { dst, .. }
            | IrOp::Multiply { dst, .. }
            | IrOp::CountLeadingZeros { dst, .. }
            | IrOp::Saturating { dst, .. }
            | IrOp::AddSticky { dst, .. }
            | IrOp::MemoryRead { dst, .. }
            | IrOp::CoprocessorRead { dst, .. } => *dst = defs(*dst),
            IrOp::MultiplyLong { dst_lo, dst_hi, .. } => {
                *dst_lo = defs(*dst_lo);
                *dst_hi = defs(*dst_hi);
            }
            _ => {}
        }
        op
    }

    /// Whether the op transfers control out of the block.
    pub fn is_branch(&self) -> bool {
        matches!(
            self,
            IrOp::Branch { .. }
                | IrOp::BranchExchange { .. }
                | IrOp::ReturnFromException { .. }
                | IrOp::Exception { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uses_and_defs() {
        let op = IrOp::MultiplyLong {
            dst_lo: IrVariable(4),
            dst_hi: IrVariable(5),
            lhs: IrValue::Variable(IrVariable(0)),
            rhs: IrValue::Constant(3),
            signed: true,
            accumulate: Some((IrVariable(1).into(), IrVariable(2).into())),
            flags: FlagMask::empty(),
        };
        let mut uses = Vec::new();
        op.for_each_use(|v| uses.push(v.0));
        assert_eq!(uses, [0, 1, 2]);
        let mut defs = Vec::new();
        op.for_each_def(|v| defs.push(v.0));
        assert_eq!(defs, [4, 5]);
    }

    #[test]
    fn rename_keeps_constants() {
        let op = IrOp::Binary {
            op: BinaryOp::Add,
            dst: IrVariable(7),
            lhs: IrVariable(3).into(),
            rhs: IrValue::Constant(9),
            flags: FlagMask::NZCV,
        };
        let renamed = op.rename(|v| IrVariable(v.0 + 100), |_| IrVariable(0));
        assert_eq!(
            renamed,
            IrOp::Binary {
                op: BinaryOp::Add,
                dst: IrVariable(0),
                lhs: IrVariable(103).into(),
                rhs: IrValue::Constant(9),
                flags: FlagMask::NZCV,
            }
        );
    }
}
