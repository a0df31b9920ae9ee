//! Lowers a [`BasicBlock`] to an AArch64 function.
//!
//! Generated blocks have the signature
//! `extern "C" fn(core: *mut Core<M>, state: *mut CpuState) -> u32`
//! and return [`EXECUTED`] or [`SKIPPED`] (condition failed). Whether a block branched is a
//! property of its ops, so the caller knows it without asking the code.
//!
//! Register use:
//! - `x19` holds `core`, `x20` holds `state`;
//! - `x21..=x28` hold block variables (see [`regalloc`](super::regalloc));
//! - `w9..=w11` are scratch and `w12` receives results nobody reads;
//! - `x0..=x5` and `x16` carry helper calls.
//!
//! Register moves, flag-setting ALU ops, multiplies and constant shifts are inlined. Everything
//! else goes through [`helpers::run_op`].

use duet_cpu_core::{Bus, Core, CpuState};
use duet_types::shifter::ShiftKind;
use duet_types::{Cond, Mode};

use super::a64::{encode_bitmask, A64Cond, Assembler, Label, Reg};
use super::helpers::{self, OPERANDS};
use super::regalloc::{self, Allocation};
use super::CompileError;
use crate::block::BasicBlock;
use crate::ir::{BinaryOp, FlagMask, GuestReg, IrOp, IrValue, IrVariable};

pub const EXECUTED: u32 = 0;
pub const SKIPPED: u32 = 1;

pub type BlockFn<M> = unsafe extern "C" fn(*mut Core<M>, *mut CpuState) -> u32;

const CORE: Reg = Reg::X19;
const STATE: Reg = Reg::X20;
const W9: Reg = Reg(9);
const W10: Reg = Reg(10);
const W11: Reg = Reg(11);
const DISCARD: Reg = Reg(12);
/// `x29, x30` plus five callee-saved pairs.
const FRAME_BYTES: i32 = 96;
const SAVED_PAIRS: [(Reg, Reg); 5] = [
    (Reg(19), Reg(20)),
    (Reg(21), Reg(22)),
    (Reg(23), Reg(24)),
    (Reg(25), Reg(26)),
    (Reg(27), Reg(28)),
];

/// Machine code for one block plus the renamed ops its helper calls point into.
#[derive(Debug)]
pub struct CompiledCode {
    pub code: Vec<u8>,
    /// Must stay alive (and unmoved on the heap) for as long as `code` may run.
    pub helper_ops: Box<[IrOp]>,
    /// How many ops were inlined rather than routed through the helper.
    pub inlined: usize,
    /// Most variable registers live at once.
    pub registers: usize,
}

/// How one op is lowered.
enum Lowering {
    Inline,
    /// Index into the helper op table plus the variables to pass, by operand slot.
    Helper {
        index: usize,
        operands: Vec<IrVariable>,
        results: Vec<IrVariable>,
    },
}

pub fn compile<M: Bus>(block: &BasicBlock) -> Result<CompiledCode, CompileError> {
    let allocation = regalloc::allocate(&block.ops).map_err(|error| {
        tracing::debug!(location = %block.location, op = error.op_index, "out of registers");
        CompileError::RegisterPressure {
            location: block.location,
            available: regalloc::POOL.len(),
        }
    })?;

    // Helper ops are collected first so their addresses are final before code refers to them.
    let mut helper_ops = Vec::new();
    let mut lowerings = Vec::with_capacity(block.ops.len());
    let mut mode_stable = true;
    for op in &block.ops {
        if can_inline(op, block.location.mode, mode_stable) {
            lowerings.push(Lowering::Inline);
        } else {
            let mut operands = Vec::new();
            let mut results = Vec::new();
            let renamed = op.rename(
                |var| {
                    operands.push(var);
                    helpers::operand(operands.len() as u32 - 1)
                },
                |var| {
                    results.push(var);
                    helpers::result(results.len() as u32 - 1)
                },
            );
            debug_assert!(operands.len() <= OPERANDS as usize);
            lowerings.push(Lowering::Helper {
                index: helper_ops.len(),
                operands,
                results,
            });
            helper_ops.push(renamed);
        }
        if changes_mode(op) {
            mode_stable = false;
        }
    }
    let helper_ops = helper_ops.into_boxed_slice();

    let mut compiler = BlockCompiler {
        asm: Assembler::new(),
        allocation: &allocation,
    };
    let inlined = lowerings
        .iter()
        .filter(|lowering| matches!(lowering, Lowering::Inline))
        .count();
    compiler.prologue();
    let skip = compiler.asm.new_label();
    let exit = compiler.asm.new_label();
    compiler.condition_check(block.cond, skip);
    for (op, lowering) in block.ops.iter().zip(&lowerings) {
        match lowering {
            Lowering::Inline => compiler.inline(op),
            Lowering::Helper {
                index,
                operands,
                results,
            } => compiler.helper_call::<M>(&helper_ops[*index], operands, results),
        }
    }
    compiler.asm.movz(Reg::X0, EXECUTED as u16, 0);
    compiler.asm.b(exit);
    compiler.asm.bind(skip);
    compiler.asm.movz(Reg::X0, SKIPPED as u16, 0);
    compiler.asm.bind(exit);
    compiler.epilogue();

    Ok(CompiledCode {
        code: compiler.asm.finish()?,
        helper_ops,
        inlined,
        registers: allocation.peak,
    })
}

/// Ops that may leave a different register bank active.
fn changes_mode(op: &IrOp) -> bool {
    matches!(
        op,
        IrOp::StoreCpsr { .. } | IrOp::ReturnFromException { .. } | IrOp::Exception { .. }
    )
}

/// Whether `reg` is the copy `gpr[reg]` holds while the block's own mode is active.
fn direct_gpr(reg: GuestReg, mode: Mode, mode_stable: bool) -> bool {
    mode_stable && (!(8..15).contains(&reg.index) || reg.mode == mode)
}

fn can_inline(op: &IrOp, mode: Mode, mode_stable: bool) -> bool {
    match *op {
        IrOp::LoadGpr { reg, .. } | IrOp::StoreGpr { reg, .. } => {
            direct_gpr(reg, mode, mode_stable)
        }
        IrOp::LoadCpsr { .. }
        | IrOp::Copy { .. }
        | IrOp::Not { .. }
        | IrOp::Binary { .. }
        | IrOp::Multiply { .. }
        | IrOp::CountLeadingZeros { .. } => true,
        IrOp::Shift {
            amount: IrValue::Constant(_),
            flags,
            ..
        } => flags.is_empty(),
        _ => false,
    }
}

struct BlockCompiler<'a> {
    asm: Assembler,
    allocation: &'a Allocation,
}

impl BlockCompiler<'_> {
    fn prologue(&mut self) {
        self.asm.stp_pre(Reg::FP, Reg::LR, Reg::SP, -FRAME_BYTES);
        self.asm.add_imm_x(Reg::FP, Reg::SP, 0);
        for (i, (a, b)) in SAVED_PAIRS.into_iter().enumerate() {
            self.asm.stp(a, b, Reg::SP, 16 * (i as i32 + 1));
        }
        self.asm.mov_x(CORE, Reg::X0);
        self.asm.mov_x(STATE, Reg::X1);
    }

    fn epilogue(&mut self) {
        for (i, (a, b)) in SAVED_PAIRS.into_iter().enumerate() {
            self.asm.ldp(a, b, Reg::SP, 16 * (i as i32 + 1));
        }
        self.asm.ldp_post(Reg::FP, Reg::LR, Reg::SP, FRAME_BYTES);
        self.asm.ret();
    }

    /// Copies the guest flags into NZCV. Clobbers `w9`.
    fn load_guest_flags(&mut self) {
        self.asm.ldr_w(W9, STATE, CpuState::CPSR_OFFSET as u32);
        self.asm.and_imm(W9, W9, FlagMask::NZCV.bits());
        self.asm.msr_nzcv(W9);
    }

    /// Copies the host flags selected by `mask` into the guest CPSR. Clobbers `w9..=w11`.
    fn store_guest_flags(&mut self, mask: FlagMask) {
        if mask.is_empty() {
            return;
        }
        let mask = mask.bits();
        self.asm.mrs_nzcv(W9);
        self.asm.ldr_w(W10, STATE, CpuState::CPSR_OFFSET as u32);
        if encode_bitmask(mask).is_some() && encode_bitmask(!mask).is_some() {
            self.asm.and_imm(W10, W10, !mask);
            self.asm.and_imm(W9, W9, mask);
        } else {
            self.asm.mov_imm32(W11, mask);
            self.asm.bic(W10, W10, W11);
            self.asm.and(W9, W9, W11);
        }
        self.asm.orr(W10, W10, W9);
        self.asm.str_w(W10, STATE, CpuState::CPSR_OFFSET as u32);
    }

    fn condition_check(&mut self, cond: Cond, skip: Label) {
        match cond {
            Cond::Al => {}
            Cond::Nv => self.asm.b(skip),
            cond => {
                self.load_guest_flags();
                match A64Cond::from_bits(cond as u32).and_then(A64Cond::invert) {
                    Some(inverse) => self.asm.b_cond(inverse, skip),
                    None => self.asm.b(skip),
                }
            }
        }
    }

    /// Register a variable lives in. Results nobody reads go to `w12`.
    #[inline]
    fn reg(&self, var: IrVariable) -> Reg {
        self.allocation.get(var).unwrap_or(DISCARD)
    }

    fn operand(&mut self, value: IrValue, scratch: Reg) -> Reg {
        match value {
            IrValue::Variable(var) => self.reg(var),
            IrValue::Constant(c) => {
                self.asm.mov_imm32(scratch, c);
                scratch
            }
        }
    }

    fn gpr_offset(reg: GuestReg) -> u32 {
        (CpuState::GPR_OFFSET + 4 * reg.index as usize) as u32
    }

    /// N and Z from `result`, C and V left as they were.
    fn logical_flags(&mut self, result: Reg, flags: FlagMask) {
        let mask = flags & FlagMask::NZ;
        if !mask.is_empty() {
            self.asm.tst(result, result);
            self.store_guest_flags(mask);
        }
    }

    fn inline(&mut self, op: &IrOp) {
        match *op {
            IrOp::LoadGpr { dst, reg } => {
                if self.allocation.get(dst).is_some() {
                    let dst = self.reg(dst);
                    self.asm.ldr_w(dst, STATE, Self::gpr_offset(reg));
                }
            }
            IrOp::StoreGpr { reg, src } => {
                let src = self.operand(src, W10);
                self.asm.str_w(src, STATE, Self::gpr_offset(reg));
            }
            IrOp::LoadCpsr { dst } => {
                let dst = self.reg(dst);
                self.asm.ldr_w(dst, STATE, CpuState::CPSR_OFFSET as u32);
            }
            IrOp::Copy { dst, src, flags } => {
                let src = self.operand(src, W10);
                let dst = self.reg(dst);
                self.asm.mov(dst, src);
                self.logical_flags(dst, flags);
            }
            IrOp::Not { dst, src, flags } => {
                let src = self.operand(src, W10);
                let dst = self.reg(dst);
                self.asm.mvn(dst, src);
                self.logical_flags(dst, flags);
            }
            IrOp::Binary {
                op,
                dst,
                lhs,
                rhs,
                flags,
            } => self.binary(op, dst, lhs, rhs, flags),
            IrOp::Multiply {
                dst,
                lhs,
                rhs,
                flags,
            } => {
                let lhs = self.operand(lhs, W10);
                let rhs = self.operand(rhs, W11);
                let dst = self.reg(dst);
                self.asm.mul(dst, lhs, rhs);
                self.logical_flags(dst, flags);
            }
            IrOp::CountLeadingZeros { dst, src } => {
                let src = self.operand(src, W10);
                let dst = self.reg(dst);
                self.asm.clz(dst, src);
            }
            IrOp::Shift {
                kind,
                dst,
                value,
                amount: IrValue::Constant(amount),
                ..
            } => {
                let value = self.operand(value, W10);
                let dst = self.reg(dst);
                self.constant_shift(kind, dst, value, amount & 0xFF);
            }
            _ => unreachable!("{op:?} is not inlined"),
        }
    }

    fn binary(&mut self, op: BinaryOp, dst: IrVariable, lhs: IrValue, rhs: IrValue, flags: FlagMask) {
        let lhs = self.operand(lhs, W10);
        let rhs = self.operand(rhs, W11);
        let dst = self.reg(dst);
        if !op.is_arithmetic() {
            match op {
                BinaryOp::And => self.asm.and(dst, lhs, rhs),
                BinaryOp::Or => self.asm.orr(dst, lhs, rhs),
                BinaryOp::Xor => self.asm.eor(dst, lhs, rhs),
                _ => self.asm.bic(dst, lhs, rhs),
            }
            self.logical_flags(dst, flags);
            return;
        }

        if op.reads_carry() {
            self.load_guest_flags();
        }
        let set_flags = !flags.is_empty();
        match (op, set_flags) {
            (BinaryOp::Add, false) => self.asm.add(dst, lhs, rhs),
            (BinaryOp::Add, true) => self.asm.adds(dst, lhs, rhs),
            (BinaryOp::Sub, false) => self.asm.sub(dst, lhs, rhs),
            (BinaryOp::Sub, true) => self.asm.subs(dst, lhs, rhs),
            (BinaryOp::AddCarry, false) => self.asm.adc(dst, lhs, rhs),
            (BinaryOp::AddCarry, true) => self.asm.adcs(dst, lhs, rhs),
            (BinaryOp::SubCarry, false) => self.asm.sbc(dst, lhs, rhs),
            (_, _) => self.asm.sbcs(dst, lhs, rhs),
        }
        self.store_guest_flags(flags);
    }

    /// Register-shift semantics for a constant amount already reduced to its bottom byte.
    fn constant_shift(&mut self, kind: ShiftKind, dst: Reg, value: Reg, amount: u32) {
        match (kind, amount) {
            (_, 0) => self.asm.mov(dst, value),
            (ShiftKind::Lsl | ShiftKind::Lsr, 32..) => self.asm.mov(dst, Reg::ZR),
            (ShiftKind::Lsl, _) => self.asm.lsl_imm(dst, value, amount),
            (ShiftKind::Lsr, _) => self.asm.lsr_imm(dst, value, amount),
            (ShiftKind::Asr, _) => self.asm.asr_imm(dst, value, amount.min(31)),
            (ShiftKind::Ror, _) => match amount & 31 {
                0 => self.asm.mov(dst, value),
                by => self.asm.ror_imm(dst, value, by),
            },
        }
    }

    fn helper_call<M: Bus>(&mut self, op: &IrOp, operands: &[IrVariable], results: &[IrVariable]) {
        for (slot, var) in operands.iter().enumerate() {
            let src = self.reg(*var);
            self.asm.mov(Reg(2 + slot as u8), src);
        }
        self.asm.mov_x(Reg::X0, CORE);
        self.asm.mov_imm64(Reg::X1, op as *const IrOp as u64);
        let helper: unsafe extern "C" fn(*mut Core<M>, *const IrOp, u32, u32, u32, u32) -> u64 =
            helpers::run_op::<M>;
        self.asm.mov_imm64(Reg::X16, helper as usize as u64);
        self.asm.blr(Reg::X16);

        if let Some(&lo) = results.first() {
            if let Some(dst) = self.allocation.get(lo) {
                self.asm.mov(dst, Reg::X0);
            }
        }
        if let Some(&hi) = results.get(1) {
            if let Some(dst) = self.allocation.get(hi) {
                self.asm.lsr_imm_x(dst, Reg::X0, 32);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockEnd, Location};
    use duet_cpu_core::FlatMemory;

    fn block(cond: Cond, ops: Vec<IrOp>) -> BasicBlock {
        let variable_count = ops
            .iter()
            .map(|op| {
                let mut max = 0;
                op.for_each_def(|var| max = max.max(var.0 + 1));
                max
            })
            .max()
            .unwrap_or(0);
        BasicBlock {
            location: Location {
                address: 0x100,
                mode: Mode::System,
                thumb: false,
            },
            cond,
            ops,
            instruction_count: 1,
            variable_count,
            end: BlockEnd::InstructionLimit,
        }
    }

    fn gpr(index: u8) -> GuestReg {
        GuestReg {
            index,
            mode: Mode::System,
        }
    }

    fn words(code: &[u8]) -> Vec<u32> {
        code.chunks(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()
    }

    #[test]
    fn register_moves_are_inlined() {
        let ops = vec![
            IrOp::LoadGpr {
                dst: IrVariable(0),
                reg: gpr(1),
            },
            IrOp::Binary {
                op: BinaryOp::Add,
                dst: IrVariable(1),
                lhs: IrVariable(0).into(),
                rhs: IrValue::Constant(4),
                flags: FlagMask::NZCV,
            },
            IrOp::StoreGpr {
                reg: gpr(0),
                src: IrVariable(1).into(),
            },
        ];
        let compiled = compile::<FlatMemory>(&block(Cond::Al, ops)).unwrap();
        assert_eq!(compiled.inlined, 3);
        assert!(compiled.helper_ops.is_empty());
        let words = words(&compiled.code);
        // Prologue and epilogue bracket the body; adds feeds the flag merge.
        assert_eq!(words[0], 0xA9BA_7BFD);
        assert_eq!(*words.last().unwrap(), 0xD65F_03C0);
        assert!(words.iter().any(|&w| w & 0xFF20_0000 == 0x2B00_0000));
        assert!(words.contains(&0xD53B_4209));
    }

    #[test]
    fn other_ops_call_the_helper_with_renamed_variables() {
        let ops = vec![
            IrOp::LoadGpr {
                dst: IrVariable(0),
                reg: gpr(2),
            },
            IrOp::MemoryRead {
                dst: IrVariable(1),
                addr: IrVariable(0).into(),
                kind: duet_cpu_core::LoadKind::Word,
            },
            IrOp::StoreGpr {
                reg: gpr(3),
                src: IrVariable(1).into(),
            },
        ];
        let compiled = compile::<FlatMemory>(&block(Cond::Al, ops)).unwrap();
        assert_eq!(compiled.inlined, 2);
        assert_eq!(
            &*compiled.helper_ops,
            [IrOp::MemoryRead {
                dst: helpers::result(0),
                addr: helpers::operand(0).into(),
                kind: duet_cpu_core::LoadKind::Word,
            }]
        );
        assert!(words(&compiled.code).contains(&0xD63F_0200));
    }

    #[test]
    fn banked_registers_after_a_mode_change_use_the_helper() {
        let ops = vec![
            IrOp::StoreCpsr {
                src: IrValue::Constant(0x12),
                mask: 0xFF,
            },
            IrOp::StoreGpr {
                reg: gpr(13),
                src: IrValue::Constant(0),
            },
            IrOp::StoreGpr {
                reg: gpr(0),
                src: IrValue::Constant(0),
            },
        ];
        let compiled = compile::<FlatMemory>(&block(Cond::Al, ops)).unwrap();
        assert_eq!(compiled.inlined, 0);
        assert_eq!(compiled.helper_ops.len(), 3);
    }

    #[test]
    fn conditional_blocks_branch_to_the_skip_path() {
        let compiled = compile::<FlatMemory>(&block(Cond::Eq, Vec::new())).unwrap();
        let words = words(&compiled.code);
        // b.ne over the (empty) body.
        assert!(words.iter().any(|&w| w & 0xFF00_001F == 0x5400_0001));
        assert!(words.contains(&(0x5280_0000 | SKIPPED << 5)));
    }

    #[test]
    fn register_pressure_is_reported() {
        let mut ops: Vec<IrOp> = (0..9)
            .map(|i| IrOp::LoadGpr {
                dst: IrVariable(i),
                reg: gpr(i as u8),
            })
            .collect();
        ops.extend((0..9).map(|i| IrOp::StoreGpr {
            reg: gpr(0),
            src: IrVariable(i).into(),
        }));
        let err = compile::<FlatMemory>(&block(Cond::Al, ops)).unwrap_err();
        assert!(matches!(err, CompileError::RegisterPressure { available: 8, .. }));
    }
}
