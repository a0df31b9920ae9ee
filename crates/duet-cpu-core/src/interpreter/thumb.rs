use duet_decoder::ThumbHandlers;
use duet_types::bits::{add_with_carry, field, sign_extend, sub_with_carry};
use duet_types::shifter::{shift_immediate, shift_register, ShiftKind};
use duet_types::{Arch, Cond, ExceptionKind, Psr};

use super::Interpreter;
use crate::bus::Bus;
use crate::exec::{BlockTransfer, LoadKind, StoreWidth};
use crate::state::{LR, PC, SP};

#[inline]
fn low(instr: u16, lo: u32) -> usize {
    field(instr as u32, lo, 3) as usize
}

impl<M: Bus> Interpreter<M> {
    fn thumb_load(&mut self, kind: LoadKind, rd: usize, addr: u32) {
        let value = self.core.load(kind, addr);
        self.core.state.gpr[rd] = value;
    }

    fn thumb_store(&mut self, width: StoreWidth, rd: usize, addr: u32) {
        let value = self.reg(rd);
        self.core.store(width, addr, value);
    }
}

impl<M: Bus> ThumbHandlers for Interpreter<M> {
    fn thumb_shift_immediate(&mut self, instr: u16) {
        let kind = ShiftKind::from_bits(field(instr as u32, 11, 2));
        let amount = field(instr as u32, 6, 5);
        let carry = self.core.state.cpsr().carry();
        let (result, carry) = shift_immediate(kind, self.reg(low(instr, 3)), amount, carry);
        self.core.state.gpr[low(instr, 0)] = result;
        self.set_nzc(result, carry);
    }

    fn thumb_add_subtract(&mut self, instr: u16) {
        let lhs = self.reg(low(instr, 3));
        let operand = field(instr as u32, 6, 3);
        let rhs = if instr & (1 << 10) != 0 {
            operand
        } else {
            self.reg(operand as usize)
        };
        let (result, carry, overflow) = if instr & (1 << 9) != 0 {
            sub_with_carry(lhs, rhs, true)
        } else {
            add_with_carry(lhs, rhs, false)
        };
        self.core.state.gpr[low(instr, 0)] = result;
        self.set_nzcv(result, carry, overflow);
    }

    fn thumb_alu_immediate(&mut self, instr: u16) {
        let rd = low(instr, 8);
        let imm = (instr & 0xFF) as u32;
        let lhs = self.reg(rd);
        match field(instr as u32, 11, 2) {
            0 => {
                self.core.state.gpr[rd] = imm;
                self.set_nz(imm);
            }
            1 => {
                let (result, c, v) = sub_with_carry(lhs, imm, true);
                self.set_nzcv(result, c, v);
            }
            2 => {
                let (result, c, v) = add_with_carry(lhs, imm, false);
                self.core.state.gpr[rd] = result;
                self.set_nzcv(result, c, v);
            }
            _ => {
                let (result, c, v) = sub_with_carry(lhs, imm, true);
                self.core.state.gpr[rd] = result;
                self.set_nzcv(result, c, v);
            }
        }
    }

    fn thumb_alu_register(&mut self, instr: u16) {
        let rd = low(instr, 0);
        let lhs = self.reg(rd);
        let rhs = self.reg(low(instr, 3));
        let carry = self.core.state.cpsr().carry();

        enum Outcome {
            Logical(u32),
            Shifted(u32, bool),
            Arithmetic(u32, bool, bool),
        }
        let shift = |kind| {
            let (value, c) = shift_register(kind, lhs, rhs & 0xFF, carry);
            Outcome::Shifted(value, c)
        };

        let op = field(instr as u32, 6, 4);
        let outcome = match op {
            0x0 | 0x8 => Outcome::Logical(lhs & rhs),
            0x1 => Outcome::Logical(lhs ^ rhs),
            0x2 => shift(ShiftKind::Lsl),
            0x3 => shift(ShiftKind::Lsr),
            0x4 => shift(ShiftKind::Asr),
            0x5 => {
                let (r, c, v) = add_with_carry(lhs, rhs, carry);
                Outcome::Arithmetic(r, c, v)
            }
            0x6 => {
                let (r, c, v) = sub_with_carry(lhs, rhs, carry);
                Outcome::Arithmetic(r, c, v)
            }
            0x7 => shift(ShiftKind::Ror),
            0x9 => {
                let (r, c, v) = sub_with_carry(0, rhs, true);
                Outcome::Arithmetic(r, c, v)
            }
            0xA => {
                let (r, c, v) = sub_with_carry(lhs, rhs, true);
                Outcome::Arithmetic(r, c, v)
            }
            0xB => {
                let (r, c, v) = add_with_carry(lhs, rhs, false);
                Outcome::Arithmetic(r, c, v)
            }
            0xC => Outcome::Logical(lhs | rhs),
            0xD => Outcome::Logical(lhs.wrapping_mul(rhs)),
            0xE => Outcome::Logical(lhs & !rhs),
            _ => Outcome::Logical(!rhs),
        };

        let writes = !matches!(op, 0x8 | 0xA | 0xB);
        let result = match outcome {
            Outcome::Logical(r) => {
                self.set_nz(r);
                r
            }
            Outcome::Shifted(r, c) => {
                self.set_nzc(r, c);
                r
            }
            Outcome::Arithmetic(r, c, v) => {
                self.set_nzcv(r, c, v);
                r
            }
        };
        if writes {
            self.core.state.gpr[rd] = result;
        }
    }

    fn thumb_high_register(&mut self, instr: u16) {
        let rs = field(instr as u32, 3, 4) as usize;
        let rd = (low(instr, 0)) | (field(instr as u32, 7, 1) as usize) << 3;
        let value = self.reg(rs);
        match field(instr as u32, 8, 2) {
            0 => {
                let result = self.reg(rd).wrapping_add(value);
                self.set_reg(rd, result);
            }
            1 => {
                let (result, c, v) = sub_with_carry(self.reg(rd), value, true);
                self.set_nzcv(result, c, v);
            }
            2 => self.set_reg(rd, value),
            _ => {
                if self.core.arch() == Arch::V5 && instr & (1 << 7) != 0 {
                    self.core.state.gpr[LR] = self.reg(PC).wrapping_sub(2) | 1;
                }
                self.branch_exchange(value);
            }
        }
    }

    fn thumb_load_pc_relative(&mut self, instr: u16) {
        let addr = (self.reg(PC) & !2).wrapping_add((instr as u32 & 0xFF) << 2);
        self.thumb_load(LoadKind::Word, low(instr, 8), addr);
    }

    fn thumb_transfer_register_offset(&mut self, instr: u16) {
        let addr = self.reg(low(instr, 3)).wrapping_add(self.reg(low(instr, 6)));
        let rd = low(instr, 0);
        match field(instr as u32, 10, 2) {
            0 => self.thumb_store(StoreWidth::Word, rd, addr),
            1 => self.thumb_store(StoreWidth::Byte, rd, addr),
            2 => self.thumb_load(LoadKind::Word, rd, addr),
            _ => self.thumb_load(LoadKind::Byte, rd, addr),
        }
    }

    fn thumb_transfer_signed(&mut self, instr: u16) {
        let addr = self.reg(low(instr, 3)).wrapping_add(self.reg(low(instr, 6)));
        let rd = low(instr, 0);
        match field(instr as u32, 10, 2) {
            0 => self.thumb_store(StoreWidth::Half, rd, addr),
            1 => self.thumb_load(LoadKind::SignedByte, rd, addr),
            2 => self.thumb_load(LoadKind::Half, rd, addr),
            _ => self.thumb_load(LoadKind::SignedHalf, rd, addr),
        }
    }

    fn thumb_transfer_immediate(&mut self, instr: u16) {
        let byte = instr & (1 << 12) != 0;
        let offset = field(instr as u32, 6, 5) << if byte { 0 } else { 2 };
        let addr = self.reg(low(instr, 3)).wrapping_add(offset);
        let rd = low(instr, 0);
        match (instr & (1 << 11) != 0, byte) {
            (false, false) => self.thumb_store(StoreWidth::Word, rd, addr),
            (false, true) => self.thumb_store(StoreWidth::Byte, rd, addr),
            (true, false) => self.thumb_load(LoadKind::Word, rd, addr),
            (true, true) => self.thumb_load(LoadKind::Byte, rd, addr),
        }
    }

    fn thumb_transfer_halfword(&mut self, instr: u16) {
        let addr = self
            .reg(low(instr, 3))
            .wrapping_add(field(instr as u32, 6, 5) << 1);
        let rd = low(instr, 0);
        if instr & (1 << 11) != 0 {
            self.thumb_load(LoadKind::Half, rd, addr);
        } else {
            self.thumb_store(StoreWidth::Half, rd, addr);
        }
    }

    fn thumb_transfer_stack(&mut self, instr: u16) {
        let addr = self.reg(SP).wrapping_add((instr as u32 & 0xFF) << 2);
        let rd = low(instr, 8);
        if instr & (1 << 11) != 0 {
            self.thumb_load(LoadKind::Word, rd, addr);
        } else {
            self.thumb_store(StoreWidth::Word, rd, addr);
        }
    }

    fn thumb_add_address(&mut self, instr: u16) {
        let base = if instr & (1 << 11) != 0 {
            self.reg(SP)
        } else {
            self.reg(PC) & !2
        };
        self.core.state.gpr[low(instr, 8)] = base.wrapping_add((instr as u32 & 0xFF) << 2);
    }

    fn thumb_adjust_stack(&mut self, instr: u16) {
        let offset = (instr as u32 & 0x7F) << 2;
        let sp = self.reg(SP);
        self.core.state.gpr[SP] = if instr & (1 << 7) != 0 {
            sp.wrapping_sub(offset)
        } else {
            sp.wrapping_add(offset)
        };
    }

    fn thumb_push_pop(&mut self, instr: u16) {
        let plan = BlockTransfer::thumb_push_pop(instr, self.core.arch());
        self.block_transfer(plan);
    }

    fn thumb_block_transfer(&mut self, instr: u16) {
        let plan = BlockTransfer::thumb_multiple(instr, self.core.arch());
        self.block_transfer(plan);
    }

    fn thumb_conditional_branch(&mut self, instr: u16) {
        let cond = Cond::from_bits(field(instr as u32, 8, 4));
        if cond == Cond::Al {
            return self.raise(ExceptionKind::Undefined);
        }
        if self.core.condition_passes(cond, instr as u32) {
            let offset = sign_extend(instr as u32 & 0xFF, 8) << 1;
            self.branch(self.reg(PC).wrapping_add(offset));
        }
    }

    fn thumb_software_interrupt(&mut self, _instr: u16) {
        self.raise(ExceptionKind::SoftwareInterrupt);
    }

    fn thumb_branch(&mut self, instr: u16) {
        let offset = sign_extend(instr as u32 & 0x7FF, 11) << 1;
        self.branch(self.reg(PC).wrapping_add(offset));
    }

    fn thumb_branch_link_prefix(&mut self, instr: u16) {
        let offset = sign_extend(instr as u32 & 0x7FF, 11) << 12;
        self.core.state.gpr[LR] = self.reg(PC).wrapping_add(offset);
    }

    fn thumb_branch_link_suffix(&mut self, instr: u16) {
        let target = self.reg(LR).wrapping_add((instr as u32 & 0x7FF) << 1);
        self.core.state.gpr[LR] = self.reg(PC).wrapping_sub(2) | 1;
        self.branch(target);
    }

    fn thumb_branch_link_exchange_suffix(&mut self, instr: u16) {
        if self.core.arch() == Arch::V4 {
            return self.raise(ExceptionKind::Undefined);
        }
        let target = self.reg(LR).wrapping_add((instr as u32 & 0x7FF) << 1) & !3;
        self.core.state.gpr[LR] = self.reg(PC).wrapping_sub(2) | 1;
        self.core.state.set_flag(Psr::T, false);
        self.branch(target);
    }

    fn thumb_breakpoint(&mut self, _instr: u16) {
        match self.core.arch() {
            Arch::V4 => self.raise(ExceptionKind::Undefined),
            Arch::V5 => self.raise(ExceptionKind::PrefetchAbort),
        }
    }

    fn thumb_illegal(&mut self, instr: u16) {
        let class = self.decoder.thumb_class_name(instr);
        self.illegal(class, instr as u32);
    }
}
