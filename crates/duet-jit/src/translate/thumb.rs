use duet_cpu_core::{BlockTransfer, LoadKind, StoreWidth};
use duet_cpu_core::{LR, SP};
use duet_decoder::ThumbHandlers;
use duet_types::bits::{field, sign_extend};
use duet_types::shifter::ShiftKind;
use duet_types::{Arch, Cond, ExceptionKind};

use super::Emitter;
use crate::ir::{BinaryOp, FlagMask, IrOp, IrValue};

#[inline]
fn low(instr: u16, lo: u32) -> usize {
    field(instr as u32, lo, 3) as usize
}

impl Emitter {
    fn thumb_load(&mut self, kind: LoadKind, rd: usize, addr: IrValue) {
        let value = self.load(kind, addr);
        self.set_reg(rd, value);
    }

    fn thumb_store(&mut self, width: StoreWidth, rd: usize, addr: IrValue) {
        let value = self.reg(rd);
        self.store(width, addr, value);
    }

    /// `[rb, ro]` addressing.
    fn register_offset(&mut self, instr: u16) -> IrValue {
        let base = self.reg(low(instr, 3));
        let offset = self.reg(low(instr, 6));
        self.add(base, offset)
    }
}

impl ThumbHandlers for Emitter {
    fn thumb_shift_immediate(&mut self, instr: u16) {
        let kind = ShiftKind::from_bits(field(instr as u32, 11, 2));
        let amount = field(instr as u32, 6, 5);
        let value = self.reg(low(instr, 3));
        let result = self.shift_immediate(kind, value, amount, FlagMask::NZC);
        self.set_reg(low(instr, 0), result);
    }

    fn thumb_add_subtract(&mut self, instr: u16) {
        let lhs = self.reg(low(instr, 3));
        let operand = field(instr as u32, 6, 3);
        let rhs = if instr & (1 << 10) != 0 {
            IrValue::Constant(operand)
        } else {
            self.reg(operand as usize)
        };
        let op = if instr & (1 << 9) != 0 {
            BinaryOp::Sub
        } else {
            BinaryOp::Add
        };
        let result = self.binary(op, lhs, rhs, FlagMask::NZCV);
        self.set_reg(low(instr, 0), result);
    }

    fn thumb_alu_immediate(&mut self, instr: u16) {
        let rd = low(instr, 8);
        let imm = IrValue::Constant(instr as u32 & 0xFF);
        match field(instr as u32, 11, 2) {
            0 => {
                let result = self.copy(imm, FlagMask::NZ);
                self.set_reg(rd, result);
            }
            1 => {
                let lhs = self.reg(rd);
                self.binary(BinaryOp::Sub, lhs, imm, FlagMask::NZCV);
            }
            op => {
                let lhs = self.reg(rd);
                let op = if op == 2 { BinaryOp::Add } else { BinaryOp::Sub };
                let result = self.binary(op, lhs, imm, FlagMask::NZCV);
                self.set_reg(rd, result);
            }
        }
    }

    fn thumb_alu_register(&mut self, instr: u16) {
        let rd = low(instr, 0);
        let rhs = self.reg(low(instr, 3));
        let op = field(instr as u32, 6, 4);
        let lhs = match op {
            0x9 | 0xF => IrValue::Constant(0),
            _ => self.reg(rd),
        };

        let result = match op {
            0x0 | 0x8 => self.binary(BinaryOp::And, lhs, rhs, FlagMask::NZ),
            0x1 => self.binary(BinaryOp::Xor, lhs, rhs, FlagMask::NZ),
            0x2 => self.shift(ShiftKind::Lsl, lhs, rhs, FlagMask::NZC),
            0x3 => self.shift(ShiftKind::Lsr, lhs, rhs, FlagMask::NZC),
            0x4 => self.shift(ShiftKind::Asr, lhs, rhs, FlagMask::NZC),
            0x5 => self.binary(BinaryOp::AddCarry, lhs, rhs, FlagMask::NZCV),
            0x6 => self.binary(BinaryOp::SubCarry, lhs, rhs, FlagMask::NZCV),
            0x7 => self.shift(ShiftKind::Ror, lhs, rhs, FlagMask::NZC),
            // NEG
            0x9 => self.binary(BinaryOp::Sub, lhs, rhs, FlagMask::NZCV),
            0xA => self.binary(BinaryOp::Sub, lhs, rhs, FlagMask::NZCV),
            0xB => self.binary(BinaryOp::Add, lhs, rhs, FlagMask::NZCV),
            0xC => self.binary(BinaryOp::Or, lhs, rhs, FlagMask::NZ),
            0xD => {
                let dst = self.variable();
                self.emit(IrOp::Multiply {
                    dst,
                    lhs,
                    rhs,
                    flags: FlagMask::NZ,
                });
                self.touch_flags(FlagMask::NZ);
                dst.into()
            }
            0xE => self.binary(BinaryOp::BitClear, lhs, rhs, FlagMask::NZ),
            _ => self.not(rhs, FlagMask::NZ),
        };

        if !matches!(op, 0x8 | 0xA | 0xB) {
            self.set_reg(rd, result);
        }
    }

    fn thumb_high_register(&mut self, instr: u16) {
        let rs = field(instr as u32, 3, 4) as usize;
        let rd = low(instr, 0) | (field(instr as u32, 7, 1) as usize) << 3;
        let value = self.reg(rs);
        match field(instr as u32, 8, 2) {
            0 => {
                let lhs = self.reg(rd);
                let result = self.add(lhs, value);
                self.set_reg(rd, result);
            }
            1 => {
                let lhs = self.reg(rd);
                self.binary(BinaryOp::Sub, lhs, value, FlagMask::NZCV);
            }
            2 => self.set_reg(rd, value),
            _ => {
                if self.arch == Arch::V5 && instr & (1 << 7) != 0 {
                    let link = IrValue::Constant(self.pc.wrapping_sub(2) | 1);
                    self.set_reg(LR, link);
                }
                self.branch_exchange(value);
            }
        }
    }

    fn thumb_load_pc_relative(&mut self, instr: u16) {
        let addr = (self.pc & !2).wrapping_add((instr as u32 & 0xFF) << 2);
        self.thumb_load(LoadKind::Word, low(instr, 8), IrValue::Constant(addr));
    }

    fn thumb_transfer_register_offset(&mut self, instr: u16) {
        let addr = self.register_offset(instr);
        let rd = low(instr, 0);
        match field(instr as u32, 10, 2) {
            0 => self.thumb_store(StoreWidth::Word, rd, addr),
            1 => self.thumb_store(StoreWidth::Byte, rd, addr),
            2 => self.thumb_load(LoadKind::Word, rd, addr),
            _ => self.thumb_load(LoadKind::Byte, rd, addr),
        }
    }

    fn thumb_transfer_signed(&mut self, instr: u16) {
        let addr = self.register_offset(instr);
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
        let base = self.reg(low(instr, 3));
        let addr = self.add_imm(base, offset);
        let rd = low(instr, 0);
        match (instr & (1 << 11) != 0, byte) {
            (false, false) => self.thumb_store(StoreWidth::Word, rd, addr),
            (false, true) => self.thumb_store(StoreWidth::Byte, rd, addr),
            (true, false) => self.thumb_load(LoadKind::Word, rd, addr),
            (true, true) => self.thumb_load(LoadKind::Byte, rd, addr),
        }
    }

    fn thumb_transfer_halfword(&mut self, instr: u16) {
        let base = self.reg(low(instr, 3));
        let addr = self.add_imm(base, field(instr as u32, 6, 5) << 1);
        let rd = low(instr, 0);
        if instr & (1 << 11) != 0 {
            self.thumb_load(LoadKind::Half, rd, addr);
        } else {
            self.thumb_store(StoreWidth::Half, rd, addr);
        }
    }

    fn thumb_transfer_stack(&mut self, instr: u16) {
        let sp = self.reg(SP);
        let addr = self.add_imm(sp, (instr as u32 & 0xFF) << 2);
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
            IrValue::Constant(self.pc & !2)
        };
        let result = self.add_imm(base, (instr as u32 & 0xFF) << 2);
        self.set_reg(low(instr, 8), result);
    }

    fn thumb_adjust_stack(&mut self, instr: u16) {
        let offset = IrValue::Constant((instr as u32 & 0x7F) << 2);
        let sp = self.reg(SP);
        let op = if instr & (1 << 7) != 0 {
            BinaryOp::Sub
        } else {
            BinaryOp::Add
        };
        let result = self.binary(op, sp, offset, FlagMask::empty());
        self.set_reg(SP, result);
    }

    fn thumb_push_pop(&mut self, instr: u16) {
        let plan = BlockTransfer::thumb_push_pop(instr, self.arch);
        self.block_transfer(plan);
    }

    fn thumb_block_transfer(&mut self, instr: u16) {
        let plan = BlockTransfer::thumb_multiple(instr, self.arch);
        self.block_transfer(plan);
    }

    /// The condition itself is checked once for the whole block.
    fn thumb_conditional_branch(&mut self, instr: u16) {
        if Cond::from_bits(field(instr as u32, 8, 4)) == Cond::Al {
            return self.raise(ExceptionKind::Undefined);
        }
        let offset = sign_extend(instr as u32 & 0xFF, 8) << 1;
        self.branch(IrValue::Constant(self.pc.wrapping_add(offset)));
    }

    fn thumb_software_interrupt(&mut self, _instr: u16) {
        self.raise(ExceptionKind::SoftwareInterrupt);
    }

    fn thumb_branch(&mut self, instr: u16) {
        let offset = sign_extend(instr as u32 & 0x7FF, 11) << 1;
        self.branch(IrValue::Constant(self.pc.wrapping_add(offset)));
    }

    fn thumb_branch_link_prefix(&mut self, instr: u16) {
        let offset = sign_extend(instr as u32 & 0x7FF, 11) << 12;
        let value = IrValue::Constant(self.pc.wrapping_add(offset));
        self.set_reg(LR, value);
    }

    fn thumb_branch_link_suffix(&mut self, instr: u16) {
        let lr = self.reg(LR);
        let target = self.add_imm(lr, (instr as u32 & 0x7FF) << 1);
        let link = IrValue::Constant(self.pc.wrapping_sub(2) | 1);
        self.set_reg(LR, link);
        self.branch(target);
    }

    fn thumb_branch_link_exchange_suffix(&mut self, instr: u16) {
        if self.arch == Arch::V4 {
            return self.raise(ExceptionKind::Undefined);
        }
        let lr = self.reg(LR);
        let target = self.add_imm(lr, (instr as u32 & 0x7FF) << 1);
        // Bit 0 clear: the exchange lands in ARM state.
        let target = self.binary(BinaryOp::And, target, IrValue::Constant(!3), FlagMask::empty());
        let link = IrValue::Constant(self.pc.wrapping_sub(2) | 1);
        self.set_reg(LR, link);
        self.branch_exchange(target);
    }

    fn thumb_breakpoint(&mut self, _instr: u16) {
        match self.arch {
            Arch::V4 => self.raise(ExceptionKind::Undefined),
            Arch::V5 => self.raise(ExceptionKind::PrefetchAbort),
        }
    }

    fn thumb_illegal(&mut self, instr: u16) {
        self.illegal("illegal", instr as u32);
    }
}
