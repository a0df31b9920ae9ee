//! Translated basic blocks.

use core::fmt;

use duet_cpu_core::{Bus, Core, PC};
use duet_types::{Cond, Mode};

use crate::ir::IrOp;

/// Where a block starts. The condition is a function of the code at `address`, so it is not part
/// of the key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Location {
    pub address: u32,
    pub mode: Mode,
    pub thumb: bool,
}

impl Location {
    /// Location of the next instruction `core` will execute.
    pub fn current<M: Bus>(core: &Core<M>) -> Self {
        Self {
            address: core.next_address(),
            mode: core.state.mode(),
            thumb: core.state.thumb(),
        }
    }

    #[inline]
    pub fn width(&self) -> u32 {
        if self.thumb {
            2
        } else {
            4
        }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set = if self.thumb { "thumb" } else { "arm" };
        write!(f, "{:#010x}:{set}:{:?}", self.address, self.mode)
    }
}

/// Why translation stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BlockEnd {
    /// Control flow, exception entry, CPSR write or a CP15 write with side effects.
    Break,
    /// A conditional block updated the flags its condition depends on.
    FlagsChanged,
    /// The next instruction has a different condition.
    ConditionChanged,
    InstructionLimit,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BasicBlock {
    pub location: Location,
    /// Shared by every instruction in the block. `Al` for unconditional code.
    pub cond: Cond,
    pub ops: Vec<IrOp>,
    pub instruction_count: u32,
    /// Number of IR variables defined by `ops`.
    pub variable_count: u32,
    pub end: BlockEnd,
}

impl BasicBlock {
    /// One cycle per instruction, whether or not the condition passed.
    #[inline]
    pub fn cycles(&self) -> u32 {
        self.instruction_count
    }
}

/// Advances PC past `instructions` instructions that did not branch and refills the pipeline
/// behind it.
pub(crate) fn fall_through<M: Bus>(core: &mut Core<M>, instructions: u32) {
    let width = core.state.width();
    core.state.gpr[PC] = core.state.gpr[PC].wrapping_add(instructions * width);
    core.refill_pipeline();
}
