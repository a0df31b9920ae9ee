//! Back end A: replays a block's IR through a flat table of handlers.
//!
//! Compilation resolves each op to the function that executes it once, so running a block is a
//! straight walk over `(handler, op)` pairs with no decoding.

use rustc_hash::FxHashMap;

use duet_cpu_core::{Bus, Core, PC};
use duet_types::{Cond, CONDITION_TABLE};

use crate::block::{fall_through, BasicBlock, Location};
use crate::eval;
use crate::ir::{IrOp, IrValue, IrVariable};

type Handler<M> = fn(&mut Frame<'_, M>, &IrOp);

/// Everything a handler may touch while a block runs.
struct Frame<'a, M> {
    core: &'a mut Core<M>,
    variables: &'a mut [u32],
    branched: bool,
}

impl<M> Frame<'_, M> {
    #[inline]
    fn value(&self, value: IrValue) -> u32 {
        match value {
            IrValue::Constant(c) => c,
            IrValue::Variable(var) => self.variables[var.0 as usize],
        }
    }

    #[inline]
    fn define(&mut self, var: IrVariable, value: u32) {
        self.variables[var.0 as usize] = value;
    }
}

struct CompiledBlock<M> {
    cond: Cond,
    instructions: u32,
    variables: usize,
    ops: Vec<(Handler<M>, IrOp)>,
}

pub struct IrInterpreter<M> {
    blocks: FxHashMap<Location, CompiledBlock<M>>,
    /// Scratch storage for block variables, grown on demand.
    variables: Vec<u32>,
}

impl<M: Bus> Default for IrInterpreter<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: Bus> IrInterpreter<M> {
    pub fn new() -> Self {
        Self {
            blocks: FxHashMap::default(),
            variables: Vec::new(),
        }
    }

    pub fn contains(&self, location: &Location) -> bool {
        self.blocks.contains_key(location)
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn clear(&mut self) {
        self.blocks.clear();
    }

    pub fn compile(&mut self, block: &BasicBlock) {
        let ops = block
            .ops
            .iter()
            .map(|op| (handler_for::<M>(op), *op))
            .collect();
        self.blocks.insert(
            block.location,
            CompiledBlock {
                cond: block.cond,
                instructions: block.instruction_count,
                variables: block.variable_count as usize,
                ops,
            },
        );
    }

    /// Runs the block compiled for `location` and returns the cycles it consumed.
    ///
    /// # Panics
    ///
    /// If no block was compiled for `location`.
    pub fn run(&mut self, core: &mut Core<M>, location: &Location) -> u32 {
        let Some(block) = self.blocks.get(location) else {
            panic!("no compiled block at {location}");
        };

        let nzcv = core.state.cpsr().nzcv();
        if block.cond != Cond::Al && !CONDITION_TABLE.passes(block.cond, nzcv) {
            fall_through(core, block.instructions);
            return block.instructions;
        }

        if self.variables.len() < block.variables {
            self.variables.resize(block.variables, 0);
        }
        let mut frame = Frame {
            core,
            variables: &mut self.variables,
            branched: false,
        };
        for (handler, op) in &block.ops {
            handler(&mut frame, op);
        }
        if !frame.branched {
            fall_through(frame.core, block.instructions);
        }
        block.instructions
    }
}

impl<M> core::fmt::Debug for IrInterpreter<M> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("IrInterpreter")
            .field("blocks", &self.blocks.len())
            .finish()
    }
}

/// Executes a single op against `variables`. Returns whether it left the block.
pub(crate) fn execute<M: Bus>(core: &mut Core<M>, op: &IrOp, variables: &mut [u32]) -> bool {
    let mut frame = Frame {
        core,
        variables,
        branched: false,
    };
    handler_for::<M>(op)(&mut frame, op);
    frame.branched
}

fn handler_for<M: Bus>(op: &IrOp) -> Handler<M> {
    match op {
        IrOp::LoadGpr { .. } => load_gpr,
        IrOp::StoreGpr { .. } => store_gpr,
        IrOp::LoadCpsr { .. } => load_cpsr,
        IrOp::StoreCpsr { .. } => store_cpsr,
        IrOp::LoadSpsr { .. } => load_spsr,
        IrOp::StoreSpsr { .. } => store_spsr,
        IrOp::Copy { .. } | IrOp::Not { .. } => unary,
        IrOp::Binary { .. } => binary,
        IrOp::Shift { .. } => shift,
        IrOp::RotateRightExtend { .. } => rotate_right_extend,
        IrOp::Multiply { .. } => multiply,
        IrOp::MultiplyLong { .. } => multiply_long,
        IrOp::CountLeadingZeros { .. } => count_leading_zeros,
        IrOp::Saturating { .. } => saturating,
        IrOp::AddSticky { .. } => add_sticky,
        IrOp::MemoryRead { .. } => memory_read,
        IrOp::MemoryWrite { .. } => memory_write,
        IrOp::Branch { .. }
        | IrOp::BranchExchange { .. }
        | IrOp::ReturnFromException { .. } => branch,
        IrOp::Exception { .. } => exception,
        IrOp::CoprocessorRead { .. } => coprocessor_read,
        IrOp::CoprocessorWrite { .. } => coprocessor_write,
    }
}

// ---- Handlers ----
//
// Each handler is only ever paired with the op kind `handler_for` selected it for.

fn mismatch(op: &IrOp) -> ! {
    unreachable!("handler paired with {op:?}")
}

fn load_gpr<M: Bus>(frame: &mut Frame<'_, M>, op: &IrOp) {
    let IrOp::LoadGpr { dst, reg } = *op else { mismatch(op) };
    let value = frame.core.state.gpr_in(reg.index as usize, reg.mode);
    frame.define(dst, value);
}

fn store_gpr<M: Bus>(frame: &mut Frame<'_, M>, op: &IrOp) {
    let IrOp::StoreGpr { reg, src } = *op else { mismatch(op) };
    let value = frame.value(src);
    frame.core.state.set_gpr_in(reg.index as usize, reg.mode, value);
}

fn load_cpsr<M: Bus>(frame: &mut Frame<'_, M>, op: &IrOp) {
    let IrOp::LoadCpsr { dst } = *op else { mismatch(op) };
    let value = frame.core.state.cpsr().bits();
    frame.define(dst, value);
}

fn store_cpsr<M: Bus>(frame: &mut Frame<'_, M>, op: &IrOp) {
    let IrOp::StoreCpsr { src, mask } = *op else { mismatch(op) };
    let value = frame.value(src);
    frame.core.write_psr(false, value, mask);
}

fn load_spsr<M: Bus>(frame: &mut Frame<'_, M>, op: &IrOp) {
    let IrOp::LoadSpsr { dst } = *op else { mismatch(op) };
    let value = frame.core.read_psr(true).unwrap_or(0);
    frame.define(dst, value);
}

fn store_spsr<M: Bus>(frame: &mut Frame<'_, M>, op: &IrOp) {
    let IrOp::StoreSpsr { src, mask } = *op else { mismatch(op) };
    let value = frame.value(src);
    frame.core.write_psr(true, value, mask);
}

fn unary<M: Bus>(frame: &mut Frame<'_, M>, op: &IrOp) {
    let (dst, src, flags, invert) = match *op {
        IrOp::Copy { dst, src, flags } => (dst, src, flags, false),
        IrOp::Not { dst, src, flags } => (dst, src, flags, true),
        _ => mismatch(op),
    };
    let value = frame.value(src);
    let result = eval::unary(&mut frame.core.state, invert, value, flags);
    frame.define(dst, result);
}

fn binary<M: Bus>(frame: &mut Frame<'_, M>, op: &IrOp) {
    let IrOp::Binary {
        op: kind,
        dst,
        lhs,
        rhs,
        flags,
    } = *op
    else {
        mismatch(op)
    };
    let (lhs, rhs) = (frame.value(lhs), frame.value(rhs));
    let result = eval::binary(&mut frame.core.state, kind, lhs, rhs, flags);
    frame.define(dst, result);
}

fn shift<M: Bus>(frame: &mut Frame<'_, M>, op: &IrOp) {
    let IrOp::Shift {
        kind,
        dst,
        value,
        amount,
        flags,
    } = *op
    else {
        mismatch(op)
    };
    let (value, amount) = (frame.value(value), frame.value(amount));
    let result = eval::shift(&mut frame.core.state, kind, value, amount, flags);
    frame.define(dst, result);
}

fn rotate_right_extend<M: Bus>(frame: &mut Frame<'_, M>, op: &IrOp) {
    let IrOp::RotateRightExtend { dst, src, flags } = *op else { mismatch(op) };
    let value = frame.value(src);
    let result = eval::rotate_right_extend(&mut frame.core.state, value, flags);
    frame.define(dst, result);
}

fn multiply<M: Bus>(frame: &mut Frame<'_, M>, op: &IrOp) {
    let IrOp::Multiply {
        dst,
        lhs,
        rhs,
        flags,
    } = *op
    else {
        mismatch(op)
    };
    let (lhs, rhs) = (frame.value(lhs), frame.value(rhs));
    let result = eval::multiply(&mut frame.core.state, lhs, rhs, flags);
    frame.define(dst, result);
}

fn multiply_long<M: Bus>(frame: &mut Frame<'_, M>, op: &IrOp) {
    let IrOp::MultiplyLong {
        dst_lo,
        dst_hi,
        lhs,
        rhs,
        signed,
        accumulate,
        flags,
    } = *op
    else {
        mismatch(op)
    };
    let (lhs, rhs) = (frame.value(lhs), frame.value(rhs));
    let accumulate = accumulate.map(|(lo, hi)| (frame.value(lo), frame.value(hi)));
    let (lo, hi) =
        eval::multiply_long(&mut frame.core.state, lhs, rhs, signed, accumulate, flags);
    frame.define(dst_lo, lo);
    frame.define(dst_hi, hi);
}

fn count_leading_zeros<M: Bus>(frame: &mut Frame<'_, M>, op: &IrOp) {
    let IrOp::CountLeadingZeros { dst, src } = *op else { mismatch(op) };
    let value = frame.value(src).leading_zeros();
    frame.define(dst, value);
}

fn saturating<M: Bus>(frame: &mut Frame<'_, M>, op: &IrOp) {
    let IrOp::Saturating {
        op: kind,
        dst,
        lhs,
        rhs,
    } = *op
    else {
        mismatch(op)
    };
    let (lhs, rhs) = (frame.value(lhs), frame.value(rhs));
    let result = eval::saturating(&mut frame.core.state, kind, lhs, rhs);
    frame.define(dst, result);
}

fn add_sticky<M: Bus>(frame: &mut Frame<'_, M>, op: &IrOp) {
    let IrOp::AddSticky { dst, lhs, rhs } = *op else { mismatch(op) };
    let (lhs, rhs) = (frame.value(lhs), frame.value(rhs));
    let result = eval::add_sticky(&mut frame.core.state, lhs, rhs);
    frame.define(dst, result);
}

fn memory_read<M: Bus>(frame: &mut Frame<'_, M>, op: &IrOp) {
    let IrOp::MemoryRead { dst, addr, kind } = *op else { mismatch(op) };
    let addr = frame.value(addr);
    let value = frame.core.load(kind, addr);
    frame.define(dst, value);
}

fn memory_write<M: Bus>(frame: &mut Frame<'_, M>, op: &IrOp) {
    let IrOp::MemoryWrite { addr, value, width } = *op else { mismatch(op) };
    let (addr, value) = (frame.value(addr), frame.value(value));
    frame.core.store(width, addr, value);
}

fn branch<M: Bus>(frame: &mut Frame<'_, M>, op: &IrOp) {
    match *op {
        IrOp::Branch { target } => {
            let target = frame.value(target);
            frame.core.branch(target);
        }
        IrOp::BranchExchange { target } => {
            let target = frame.value(target);
            frame.core.branch_exchange(target);
        }
        IrOp::ReturnFromException { target } => {
            let target = frame.value(target);
            frame.core.return_from_exception(target);
        }
        _ => mismatch(op),
    }
    frame.branched = true;
}

fn exception<M: Bus>(frame: &mut Frame<'_, M>, op: &IrOp) {
    let IrOp::Exception { kind, pc } = *op else { mismatch(op) };
    frame.core.state.gpr[PC] = pc;
    frame.core.raise(kind);
    frame.branched = true;
}

fn coprocessor_read<M: Bus>(frame: &mut Frame<'_, M>, op: &IrOp) {
    let IrOp::CoprocessorRead { dst, reg } = *op else { mismatch(op) };
    let value = frame.core.coprocessor_read(reg);
    frame.define(dst, value);
}

fn coprocessor_write<M: Bus>(frame: &mut Frame<'_, M>, op: &IrOp) {
    let IrOp::CoprocessorWrite { reg, src } = *op else { mismatch(op) };
    let value = frame.value(src);
    frame.core.coprocessor_write(reg, value);
}
