//! Front end: guest instructions to [`BasicBlock`]s.
//!
//! The translator implements the same handler traits as the interpreter, so it shares its
//! decoder tables. Where the interpreter mutates state, the emitter appends IR. PC reads become
//! constants because the address of every instruction is known at translation time, and the
//! register bank is fixed because the block's mode is part of its [`Location`].

mod arm;
mod thumb;

use duet_cpu_core::{BlockTransfer, Bus, Core, LoadKind, StoreWidth, PC};
use duet_decoder::Decoder;
use duet_types::shifter::{shift_register, ShiftKind};
use duet_types::{Arch, Cond, ExceptionKind, Mode};

use crate::block::{BasicBlock, BlockEnd, Location};
use crate::ir::{BinaryOp, FlagMask, GuestReg, IrOp, IrValue, IrVariable};

#[derive(Debug)]
pub struct Translator {
    decoder: Decoder<Emitter>,
    max_instructions: usize,
}

impl Translator {
    pub fn new(max_instructions: usize) -> Self {
        Self {
            decoder: Decoder::new(),
            max_instructions: max_instructions.max(1),
        }
    }

    pub fn max_instructions(&self) -> usize {
        self.max_instructions
    }

    /// Translates the run of instructions starting at `location`, fetching through the code bus.
    pub fn translate<M: Bus>(&self, core: &mut Core<M>, location: Location) -> BasicBlock {
        let arch = core.arch();
        let width = location.width();
        let mut emitter = Emitter::new(arch, location);
        let mut cond = Cond::Al;
        let mut count = 0u32;
        let mut address = location.address;

        let end = loop {
            if count as usize == self.max_instructions {
                break BlockEnd::InstructionLimit;
            }

            let instr = if location.thumb {
                core.fetch_thumb(address) as u32
            } else {
                core.fetch_arm(address)
            };
            let instr_cond = if location.thumb {
                thumb_condition(instr as u16)
            } else {
                arm_condition(arch, instr)
            };
            if count == 0 {
                cond = instr_cond;
            } else if instr_cond != cond {
                break BlockEnd::ConditionChanged;
            }

            emitter.begin(address.wrapping_add(2 * width));
            if location.thumb {
                let handler = self.decoder.decode_thumb(instr as u16);
                handler(&mut emitter, instr as u16);
            } else {
                let handler = self.decoder.decode_arm(instr);
                handler(&mut emitter, instr);
            }
            count += 1;

            if emitter.ended {
                break BlockEnd::Break;
            }
            if emitter.flags_written && cond != Cond::Al {
                break BlockEnd::FlagsChanged;
            }
            address = address.wrapping_add(width);
        };

        tracing::debug!(
            %location,
            ?cond,
            ops = emitter.ops.len(),
            instructions = count,
            ?end,
            "translated block"
        );

        BasicBlock {
            location,
            cond,
            ops: emitter.ops,
            instruction_count: count,
            variable_count: emitter.next_variable,
            end,
        }
    }
}

/// Condition an ARM instruction executes under. `NV` encodings the architecture runs
/// unconditionally report `Al`.
fn arm_condition(arch: Arch, instr: u32) -> Cond {
    match Cond::from_bits(instr >> 28) {
        Cond::Nv if arch.executes_nv(instr) => Cond::Al,
        cond => cond,
    }
}

/// Thumb code is unconditional except for `B<cond>`, which lends its condition to the block.
fn thumb_condition(instr: u16) -> Cond {
    let cond = (instr as u32 >> 8) & 0xF;
    if instr >> 12 == 0xD && cond < 0xE {
        Cond::from_bits(cond)
    } else {
        Cond::Al
    }
}

/// Per-block emission state driven by the decoder's handlers.
pub(crate) struct Emitter {
    arch: Arch,
    mode: Mode,
    thumb: bool,
    /// What PC reads as for the instruction being translated.
    pc: u32,
    ops: Vec<IrOp>,
    next_variable: u32,
    ended: bool,
    /// The current instruction wrote N, Z, C or V.
    flags_written: bool,
}

impl Emitter {
    fn new(arch: Arch, location: Location) -> Self {
        Self {
            arch,
            mode: location.mode,
            thumb: location.thumb,
            pc: 0,
            ops: Vec::new(),
            next_variable: 0,
            ended: false,
            flags_written: false,
        }
    }

    fn begin(&mut self, pc: u32) {
        self.pc = pc;
        self.flags_written = false;
    }

    #[inline]
    fn width(&self) -> u32 {
        if self.thumb {
            2
        } else {
            4
        }
    }

    fn variable(&mut self) -> IrVariable {
        let var = IrVariable(self.next_variable);
        self.next_variable += 1;
        var
    }

    fn emit(&mut self, op: IrOp) {
        self.ops.push(op);
    }

    fn touch_flags(&mut self, flags: FlagMask) {
        if !flags.is_empty() {
            self.flags_written = true;
        }
    }

    fn guest(&self, index: usize, mode: Mode) -> GuestReg {
        GuestReg {
            index: index as u8,
            mode,
        }
    }

    /// Register read in the block's bank. PC is a constant.
    fn reg(&mut self, index: usize) -> IrValue {
        self.reg_in(index, self.mode)
    }

    fn reg_in(&mut self, index: usize, mode: Mode) -> IrValue {
        if index == PC {
            return IrValue::Constant(self.pc);
        }
        let dst = self.variable();
        let reg = self.guest(index, mode);
        self.emit(IrOp::LoadGpr { dst, reg });
        dst.into()
    }

    /// PC as read by register-specified shifts and stores: one instruction further ahead.
    fn reg_ahead(&mut self, index: usize) -> IrValue {
        if index == PC {
            IrValue::Constant(self.pc.wrapping_add(self.width()))
        } else {
            self.reg(index)
        }
    }

    /// Register write; writing PC is a branch in the current instruction set.
    fn set_reg(&mut self, index: usize, value: IrValue) {
        if index == PC {
            self.branch(value);
        } else {
            self.set_reg_in(index, self.mode, value);
        }
    }

    fn set_reg_in(&mut self, index: usize, mode: Mode, value: IrValue) {
        let reg = self.guest(index, mode);
        self.emit(IrOp::StoreGpr { reg, src: value });
    }

    /// Result of a word load; PC loads interwork on ARMv5.
    fn set_reg_loaded(&mut self, index: usize, value: IrValue) {
        if index != PC {
            return self.set_reg(index, value);
        }
        match self.arch {
            Arch::V4 => self.branch(value),
            Arch::V5 => self.branch_exchange(value),
        }
    }

    fn branch(&mut self, target: IrValue) {
        self.emit(IrOp::Branch { target });
        self.ended = true;
    }

    fn branch_exchange(&mut self, target: IrValue) {
        self.emit(IrOp::BranchExchange { target });
        self.ended = true;
    }

    fn return_from_exception(&mut self, target: IrValue) {
        self.emit(IrOp::ReturnFromException { target });
        self.ended = true;
    }

    fn raise(&mut self, kind: ExceptionKind) {
        let pc = self.pc;
        self.emit(IrOp::Exception { kind, pc });
        self.ended = true;
    }

    fn require_v5(&mut self) -> bool {
        if self.arch == Arch::V5 {
            true
        } else {
            self.raise(ExceptionKind::Undefined);
            false
        }
    }

    fn copy(&mut self, src: IrValue, flags: FlagMask) -> IrValue {
        if flags.is_empty() {
            return src;
        }
        let dst = self.variable();
        self.emit(IrOp::Copy { dst, src, flags });
        self.touch_flags(flags);
        dst.into()
    }

    fn not(&mut self, src: IrValue, flags: FlagMask) -> IrValue {
        if let (IrValue::Constant(value), true) = (src, flags.is_empty()) {
            return IrValue::Constant(!value);
        }
        let dst = self.variable();
        self.emit(IrOp::Not { dst, src, flags });
        self.touch_flags(flags);
        dst.into()
    }

    fn binary(&mut self, op: BinaryOp, lhs: IrValue, rhs: IrValue, flags: FlagMask) -> IrValue {
        if let (IrValue::Constant(a), IrValue::Constant(b), true) = (lhs, rhs, flags.is_empty()) {
            let folded = match op {
                BinaryOp::Add => Some(a.wrapping_add(b)),
                BinaryOp::Sub => Some(a.wrapping_sub(b)),
                BinaryOp::And => Some(a & b),
                BinaryOp::Or => Some(a | b),
                BinaryOp::Xor => Some(a ^ b),
                BinaryOp::BitClear => Some(a & !b),
                BinaryOp::AddCarry | BinaryOp::SubCarry => None,
            };
            if let Some(value) = folded {
                return IrValue::Constant(value);
            }
        }
        let dst = self.variable();
        self.emit(IrOp::Binary {
            op,
            dst,
            lhs,
            rhs,
            flags,
        });
        self.touch_flags(flags);
        dst.into()
    }

    fn add(&mut self, lhs: IrValue, rhs: IrValue) -> IrValue {
        self.binary(BinaryOp::Add, lhs, rhs, FlagMask::empty())
    }

    fn add_imm(&mut self, lhs: IrValue, rhs: u32) -> IrValue {
        if rhs == 0 {
            return lhs;
        }
        self.add(lhs, IrValue::Constant(rhs))
    }

    fn shift(
        &mut self,
        kind: ShiftKind,
        value: IrValue,
        amount: IrValue,
        flags: FlagMask,
    ) -> IrValue {
        if let (IrValue::Constant(v), IrValue::Constant(n), true) = (value, amount, flags.is_empty())
        {
            // Without a flag update the carry-in cannot reach the result.
            return IrValue::Constant(shift_register(kind, v, n & 0xFF, false).0);
        }
        let dst = self.variable();
        self.emit(IrOp::Shift {
            kind,
            dst,
            value,
            amount,
            flags,
        });
        self.touch_flags(flags);
        dst.into()
    }

    /// Shift by an instruction-encoded amount, mapping the zero encodings onto register-shift
    /// semantics: `LSL #0` is a plain move, `LSR #0`/`ASR #0` shift by 32 and `ROR #0` is RRX.
    fn shift_immediate(
        &mut self,
        kind: ShiftKind,
        value: IrValue,
        amount: u32,
        flags: FlagMask,
    ) -> IrValue {
        match (kind, amount) {
            (ShiftKind::Lsl, 0) => self.copy(value, flags - FlagMask::C),
            (ShiftKind::Ror, 0) => self.rotate_right_extend(value, flags),
            (ShiftKind::Lsr | ShiftKind::Asr, 0) => {
                self.shift(kind, value, IrValue::Constant(32), flags)
            }
            _ => self.shift(kind, value, IrValue::Constant(amount), flags),
        }
    }

    fn rotate_right_extend(&mut self, src: IrValue, flags: FlagMask) -> IrValue {
        let dst = self.variable();
        self.emit(IrOp::RotateRightExtend { dst, src, flags });
        self.touch_flags(flags);
        dst.into()
    }

    fn load(&mut self, kind: LoadKind, addr: IrValue) -> IrValue {
        let dst = self.variable();
        self.emit(IrOp::MemoryRead { dst, addr, kind });
        dst.into()
    }

    fn store(&mut self, width: StoreWidth, addr: IrValue, value: IrValue) {
        self.emit(IrOp::MemoryWrite { addr, value, width });
    }

    fn illegal(&self, class: &str, instr: u32) {
        tracing::warn!(
            class,
            instr = format_args!("{instr:#010x}"),
            addr = format_args!("{:#010x}", self.pc.wrapping_sub(2 * self.width())),
            "illegal instruction translated as a no-op"
        );
    }

    /// Expands an LDM/STM plan into individual transfers.
    fn block_transfer(&mut self, plan: BlockTransfer) {
        let base = self.reg(plan.base);
        let final_base = plan.writeback.map(|offset| self.add_imm(base, offset));
        let bank = if plan.user_bank { Mode::User } else { self.mode };
        let first = plan.start;
        let registers = (0..16).filter(|reg| plan.registers & (1 << reg) != 0);

        if plan.load {
            let mut target = None;
            for (i, reg) in registers.enumerate() {
                let addr = self.add_imm(base, first.wrapping_add(4 * i as u32));
                let value = self.load(LoadKind::WordAligned, addr);
                if reg == PC {
                    target = Some(value);
                } else {
                    self.set_reg_in(reg, bank, value);
                }
            }
            if let Some(value) = final_base {
                self.set_reg_in(plan.base, self.mode, value);
            }
            if let Some(target) = target {
                if plan.restore_cpsr {
                    self.return_from_exception(target);
                } else {
                    self.set_reg_loaded(PC, target);
                }
            }
        } else {
            for (i, reg) in registers.enumerate() {
                let addr = self.add_imm(base, first.wrapping_add(4 * i as u32));
                let value = if reg == plan.base && plan.store_new_base {
                    final_base.unwrap_or(base)
                } else if reg == PC {
                    IrValue::Constant(self.pc.wrapping_add(self.width()))
                } else {
                    self.reg_in(reg, bank)
                };
                self.store(StoreWidth::Word, addr, value);
            }
            if let Some(value) = final_base {
                self.set_reg_in(plan.base, self.mode, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nv_is_unconditional_only_for_v5_blx() {
        // blx #0
        assert_eq!(arm_condition(Arch::V5, 0xFA00_0000), Cond::Al);
        assert_eq!(arm_condition(Arch::V4, 0xFA00_0000), Cond::Nv);
        assert_eq!(arm_condition(Arch::V5, 0xF000_0000), Cond::Nv);
        assert_eq!(arm_condition(Arch::V5, 0x1000_0000), Cond::Ne);
    }

    #[test]
    fn only_conditional_branches_carry_a_thumb_condition() {
        assert_eq!(thumb_condition(0xD0FE), Cond::Eq);
        assert_eq!(thumb_condition(0xDCFE), Cond::Gt);
        assert_eq!(thumb_condition(0xDEFE), Cond::Al);
        assert_eq!(thumb_condition(0xDF00), Cond::Al);
        assert_eq!(thumb_condition(0x2001), Cond::Al);
    }
}
