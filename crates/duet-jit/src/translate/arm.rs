use duet_cpu_core::{psr_field_mask, BlockTransfer, Cp15, Cp15Register, LoadKind, StoreWidth};
use duet_cpu_core::{LR, PC};
use duet_decoder::ArmHandlers;
use duet_types::bits::{bit, field, sign_extend};
use duet_types::shifter::ShiftKind;
use duet_types::{Arch, ExceptionKind};

use super::Emitter;
use crate::ir::{BinaryOp, FlagMask, IrOp, IrValue, SaturatingOp};

impl Emitter {
    /// Operand 2 of a register-form data processing instruction. `flags` is either empty or `C`
    /// when the shifter carry-out becomes the new carry flag.
    fn shifted_register(&mut self, instr: u32, flags: FlagMask) -> IrValue {
        let kind = ShiftKind::from_bits(instr >> 5);
        let rm = field(instr, 0, 4) as usize;
        if bit(instr, 4) {
            let value = self.reg_ahead(rm);
            let amount = self.reg(field(instr, 8, 4) as usize);
            self.shift(kind, value, amount, flags)
        } else {
            let value = self.reg(rm);
            self.shift_immediate(kind, value, field(instr, 7, 5), flags)
        }
    }

    /// Signed 16-bit half of `value`, sign-extended.
    fn half(&mut self, value: IrValue, high: bool) -> IrValue {
        let none = FlagMask::empty();
        if high {
            self.shift(ShiftKind::Asr, value, IrValue::Constant(16), none)
        } else {
            let shifted = self.shift(ShiftKind::Lsl, value, IrValue::Constant(16), none);
            self.shift(ShiftKind::Asr, shifted, IrValue::Constant(16), none)
        }
    }

    fn add_sticky(&mut self, lhs: IrValue, rhs: IrValue) -> IrValue {
        let dst = self.variable();
        self.emit(IrOp::AddSticky { dst, lhs, rhs });
        dst.into()
    }

    fn saturating(&mut self, op: SaturatingOp, lhs: IrValue, rhs: IrValue) -> IrValue {
        let dst = self.variable();
        self.emit(IrOp::Saturating { op, dst, lhs, rhs });
        dst.into()
    }

    fn multiply(&mut self, lhs: IrValue, rhs: IrValue, flags: FlagMask) -> IrValue {
        let dst = self.variable();
        self.emit(IrOp::Multiply {
            dst,
            lhs,
            rhs,
            flags,
        });
        self.touch_flags(flags);
        dst.into()
    }

    fn multiply_long(
        &mut self,
        lhs: IrValue,
        rhs: IrValue,
        signed: bool,
        accumulate: Option<(IrValue, IrValue)>,
        flags: FlagMask,
    ) -> (IrValue, IrValue) {
        let dst_lo = self.variable();
        let dst_hi = self.variable();
        self.emit(IrOp::MultiplyLong {
            dst_lo,
            dst_hi,
            lhs,
            rhs,
            signed,
            accumulate,
            flags,
        });
        self.touch_flags(flags);
        (dst_lo.into(), dst_hi.into())
    }

    /// Base, access address and written-back base of a single or halfword transfer.
    fn transfer_address(&mut self, instr: u32, offset: IrValue) -> (usize, IrValue, Option<IrValue>) {
        let pre = bit(instr, 24);
        let up = bit(instr, 23);
        let writeback = bit(instr, 21);
        let rn = field(instr, 16, 4) as usize;
        let base = self.reg(rn);
        let op = if up { BinaryOp::Add } else { BinaryOp::Sub };
        let offset_addr = self.binary(op, base, offset, FlagMask::empty());
        let addr = if pre { offset_addr } else { base };
        let wb = ((!pre || writeback) && rn != PC).then_some(offset_addr);
        (rn, addr, wb)
    }

    fn write_back(&mut self, rn: usize, value: Option<IrValue>) {
        if let Some(value) = value {
            let mode = self.mode;
            self.set_reg_in(rn, mode, value);
        }
    }

    fn psr_write(&mut self, instr: u32, value: IrValue) {
        let mask = psr_field_mask(instr);
        if !bit(instr, 22) {
            self.emit(IrOp::StoreCpsr { src: value, mask });
            self.touch_flags(FlagMask::NZCV);
            self.ended = true;
        } else if self.mode.spsr_bank().is_some() {
            self.emit(IrOp::StoreSpsr { src: value, mask });
        } else {
            tracing::warn!(mode = ?self.mode, "MSR to missing SPSR translated as a no-op");
        }
    }
}

impl ArmHandlers for Emitter {
    fn arm_data_processing(&mut self, instr: u32) {
        let opcode = field(instr, 21, 4);
        let set_flags = bit(instr, 20);
        if (8..=11).contains(&opcode) && !set_flags {
            return self.illegal("data_processing", instr);
        }

        let rn = field(instr, 16, 4) as usize;
        let rd = field(instr, 12, 4) as usize;
        let writes_result = !(8..=11).contains(&opcode);
        let returns = writes_result && rd == PC;
        let logical = matches!(opcode, 0x0 | 0x1 | 0x8 | 0x9 | 0xC..=0xF);
        let flags = match (set_flags && !returns, logical) {
            (false, _) => FlagMask::empty(),
            (true, true) => FlagMask::NZ,
            (true, false) => FlagMask::NZCV,
        };
        let shifter_flags = if logical && !flags.is_empty() {
            FlagMask::C
        } else {
            FlagMask::empty()
        };

        let register_shift = !bit(instr, 25) && bit(instr, 4);
        let lhs = match opcode {
            0xD | 0xF => IrValue::Constant(0),
            _ if register_shift => self.reg_ahead(rn),
            _ => self.reg(rn),
        };
        let op2 = if bit(instr, 25) {
            let rotate = field(instr, 8, 4) * 2;
            let imm = instr & 0xFF;
            if rotate != 0 && !shifter_flags.is_empty() {
                let amount = IrValue::Constant(rotate);
                self.shift(ShiftKind::Ror, IrValue::Constant(imm), amount, shifter_flags)
            } else {
                IrValue::Constant(imm.rotate_right(rotate))
            }
        } else {
            self.shifted_register(instr, shifter_flags)
        };

        let result = match opcode {
            0x0 | 0x8 => self.binary(BinaryOp::And, lhs, op2, flags),
            0x1 | 0x9 => self.binary(BinaryOp::Xor, lhs, op2, flags),
            0x2 | 0xA => self.binary(BinaryOp::Sub, lhs, op2, flags),
            0x3 => self.binary(BinaryOp::Sub, op2, lhs, flags),
            0x4 | 0xB => self.binary(BinaryOp::Add, lhs, op2, flags),
            0x5 => self.binary(BinaryOp::AddCarry, lhs, op2, flags),
            0x6 => self.binary(BinaryOp::SubCarry, lhs, op2, flags),
            0x7 => self.binary(BinaryOp::SubCarry, op2, lhs, flags),
            0xC => self.binary(BinaryOp::Or, lhs, op2, flags),
            0xD => self.copy(op2, flags),
            0xE => self.binary(BinaryOp::BitClear, lhs, op2, flags),
            _ => self.not(op2, flags),
        };

        if returns {
            if set_flags {
                self.return_from_exception(result);
            } else {
                self.branch(result);
            }
        } else if writes_result {
            self.set_reg(rd, result);
        }
    }

    fn arm_psr_read(&mut self, instr: u32) {
        let dst = self.variable();
        if !bit(instr, 22) {
            self.emit(IrOp::LoadCpsr { dst });
        } else if self.mode.spsr_bank().is_some() {
            self.emit(IrOp::LoadSpsr { dst });
        } else {
            tracing::warn!(mode = ?self.mode, "MRS from missing SPSR translated as a no-op");
            return;
        }
        self.set_reg(field(instr, 12, 4) as usize, dst.into());
    }

    fn arm_psr_write_register(&mut self, instr: u32) {
        let value = self.reg(field(instr, 0, 4) as usize);
        self.psr_write(instr, value);
    }

    fn arm_psr_write_immediate(&mut self, instr: u32) {
        let value = (instr & 0xFF).rotate_right(field(instr, 8, 4) * 2);
        self.psr_write(instr, IrValue::Constant(value));
    }

    fn arm_multiply(&mut self, instr: u32) {
        let flags = if bit(instr, 20) {
            FlagMask::NZ
        } else {
            FlagMask::empty()
        };
        let rm = self.reg(field(instr, 0, 4) as usize);
        let rs = self.reg(field(instr, 8, 4) as usize);
        let result = if bit(instr, 21) {
            let product = self.multiply(rm, rs, FlagMask::empty());
            let acc = self.reg(field(instr, 12, 4) as usize);
            self.binary(BinaryOp::Add, product, acc, flags)
        } else {
            self.multiply(rm, rs, flags)
        };
        self.set_reg(field(instr, 16, 4) as usize, result);
    }

    fn arm_multiply_long(&mut self, instr: u32) {
        let rd_hi = field(instr, 16, 4) as usize;
        let rd_lo = field(instr, 12, 4) as usize;
        let rm = self.reg(field(instr, 0, 4) as usize);
        let rs = self.reg(field(instr, 8, 4) as usize);
        let accumulate = bit(instr, 21).then(|| (self.reg(rd_lo), self.reg(rd_hi)));
        let flags = if bit(instr, 20) {
            FlagMask::NZ
        } else {
            FlagMask::empty()
        };
        let (lo, hi) = self.multiply_long(rm, rs, bit(instr, 22), accumulate, flags);
        self.set_reg(rd_lo, lo);
        self.set_reg(rd_hi, hi);
    }

    fn arm_signed_halfword_multiply(&mut self, instr: u32) {
        if !self.require_v5() {
            return;
        }
        let rd = field(instr, 16, 4) as usize;
        let rn = field(instr, 12, 4) as usize;
        let rm = self.reg(field(instr, 0, 4) as usize);
        let rs = self.reg(field(instr, 8, 4) as usize);
        let none = FlagMask::empty();

        match field(instr, 21, 2) {
            // SMLAxy
            0 => {
                let x = self.half(rm, bit(instr, 5));
                let y = self.half(rs, bit(instr, 6));
                let product = self.multiply(x, y, none);
                let acc = self.reg(rn);
                let result = self.add_sticky(product, acc);
                self.set_reg(rd, result);
            }
            // SMLAWy / SMULWy: bits 47:16 of the 48-bit product.
            1 => {
                let y = self.half(rs, bit(instr, 6));
                let (lo, hi) = self.multiply_long(rm, y, true, None, none);
                let high = self.shift(ShiftKind::Lsl, hi, IrValue::Constant(16), none);
                let low = self.shift(ShiftKind::Lsr, lo, IrValue::Constant(16), none);
                let product = self.binary(BinaryOp::Or, high, low, none);
                let result = if bit(instr, 5) {
                    product
                } else {
                    let acc = self.reg(rn);
                    self.add_sticky(product, acc)
                };
                self.set_reg(rd, result);
            }
            // SMLALxy
            2 => {
                let x = self.half(rm, bit(instr, 5));
                let y = self.half(rs, bit(instr, 6));
                let acc = (self.reg(rn), self.reg(rd));
                let (lo, hi) = self.multiply_long(x, y, true, Some(acc), none);
                self.set_reg(rn, lo);
                self.set_reg(rd, hi);
            }
            // SMULxy
            _ => {
                let x = self.half(rm, bit(instr, 5));
                let y = self.half(rs, bit(instr, 6));
                let result = self.multiply(x, y, none);
                self.set_reg(rd, result);
            }
        }
    }

    fn arm_saturating_arithmetic(&mut self, instr: u32) {
        if !self.require_v5() {
            return;
        }
        let rm = self.reg(field(instr, 0, 4) as usize);
        let mut rn = self.reg(field(instr, 16, 4) as usize);
        let op = field(instr, 21, 2);
        if op & 2 != 0 {
            rn = self.saturating(SaturatingOp::Add, rn, rn);
        }
        let kind = if op & 1 != 0 {
            SaturatingOp::Sub
        } else {
            SaturatingOp::Add
        };
        let result = self.saturating(kind, rm, rn);
        self.set_reg(field(instr, 12, 4) as usize, result);
    }

    fn arm_count_leading_zeros(&mut self, instr: u32) {
        if !self.require_v5() {
            return;
        }
        let result = match self.reg(field(instr, 0, 4) as usize) {
            IrValue::Constant(value) => IrValue::Constant(value.leading_zeros()),
            src => {
                let dst = self.variable();
                self.emit(IrOp::CountLeadingZeros { dst, src });
                dst.into()
            }
        };
        self.set_reg(field(instr, 12, 4) as usize, result);
    }

    fn arm_swap(&mut self, instr: u32) {
        let addr = self.reg(field(instr, 16, 4) as usize);
        let source = self.reg(field(instr, 0, 4) as usize);
        let (load, store) = if bit(instr, 22) {
            (LoadKind::Byte, StoreWidth::Byte)
        } else {
            (LoadKind::Word, StoreWidth::Word)
        };
        let value = self.load(load, addr);
        self.store(store, addr, source);
        self.set_reg(field(instr, 12, 4) as usize, value);
    }

    fn arm_halfword_transfer(&mut self, instr: u32) {
        let load = bit(instr, 20);
        let sh = field(instr, 5, 2);
        let rd = field(instr, 12, 4) as usize;
        if sh == 0 {
            return self.illegal("halfword_transfer", instr);
        }
        let doubleword = !load && sh != 1;
        if doubleword {
            if !self.require_v5() {
                return;
            }
            if rd & 1 != 0 {
                return self.raise(ExceptionKind::Undefined);
            }
        }

        let offset = if bit(instr, 22) {
            IrValue::Constant((field(instr, 8, 4) << 4) | field(instr, 0, 4))
        } else {
            self.reg(field(instr, 0, 4) as usize)
        };
        let (rn, addr, writeback) = self.transfer_address(instr, offset);

        if load {
            let kind = match sh {
                1 => LoadKind::Half,
                2 => LoadKind::SignedByte,
                _ => LoadKind::SignedHalf,
            };
            let value = self.load(kind, addr);
            self.write_back(rn, writeback);
            self.set_reg(rd, value);
        } else if sh == 1 {
            let value = self.reg_ahead(rd);
            self.store(StoreWidth::Half, addr, value);
            self.write_back(rn, writeback);
        } else if sh == 2 {
            // LDRD
            let lo = self.load(LoadKind::WordAligned, addr);
            let high_addr = self.add_imm(addr, 4);
            let hi = self.load(LoadKind::WordAligned, high_addr);
            self.write_back(rn, writeback);
            self.set_reg(rd, lo);
            self.set_reg(rd + 1, hi);
        } else {
            // STRD
            let lo = self.reg_ahead(rd);
            let hi = self.reg_ahead(rd + 1);
            self.store(StoreWidth::Word, addr, lo);
            let high_addr = self.add_imm(addr, 4);
            self.store(StoreWidth::Word, high_addr, hi);
            self.write_back(rn, writeback);
        }
    }

    fn arm_single_transfer(&mut self, instr: u32) {
        let rd = field(instr, 12, 4) as usize;
        let offset = if bit(instr, 25) {
            let kind = ShiftKind::from_bits(instr >> 5);
            let rm = self.reg(field(instr, 0, 4) as usize);
            self.shift_immediate(kind, rm, field(instr, 7, 5), FlagMask::empty())
        } else {
            IrValue::Constant(instr & 0xFFF)
        };
        let (rn, addr, writeback) = self.transfer_address(instr, offset);
        let byte = bit(instr, 22);

        if bit(instr, 20) {
            let kind = if byte { LoadKind::Byte } else { LoadKind::Word };
            let value = self.load(kind, addr);
            self.write_back(rn, writeback);
            if byte {
                self.set_reg(rd, value);
            } else {
                self.set_reg_loaded(rd, value);
            }
        } else {
            let value = self.reg_ahead(rd);
            let width = if byte {
                StoreWidth::Byte
            } else {
                StoreWidth::Word
            };
            self.store(width, addr, value);
            self.write_back(rn, writeback);
        }
    }

    fn arm_block_transfer(&mut self, instr: u32) {
        let plan = BlockTransfer::decode(instr, self.arch);
        self.block_transfer(plan);
    }

    fn arm_branch(&mut self, instr: u32) {
        let pc = self.pc;
        let offset = sign_extend(instr & 0x00FF_FFFF, 24) << 2;
        let link = IrValue::Constant(pc.wrapping_sub(4));
        if instr >> 28 == 0xF {
            // BLX <imm>: the H bit selects the halfword.
            let target = pc.wrapping_add(offset) | (field(instr, 24, 1) << 1) | 1;
            self.set_reg(LR, link);
            return self.branch_exchange(IrValue::Constant(target));
        }
        if bit(instr, 24) {
            self.set_reg(LR, link);
        }
        self.branch(IrValue::Constant(pc.wrapping_add(offset)));
    }

    fn arm_branch_exchange(&mut self, instr: u32) {
        let target = self.reg(field(instr, 0, 4) as usize);
        self.branch_exchange(target);
    }

    fn arm_branch_link_exchange_register(&mut self, instr: u32) {
        if !self.require_v5() {
            return;
        }
        let target = self.reg(field(instr, 0, 4) as usize);
        let link = IrValue::Constant(self.pc.wrapping_sub(4));
        self.set_reg(LR, link);
        self.branch_exchange(target);
    }

    fn arm_breakpoint(&mut self, _instr: u32) {
        if self.require_v5() {
            self.raise(ExceptionKind::PrefetchAbort);
        }
    }

    fn arm_coprocessor_register(&mut self, instr: u32) {
        if self.arch == Arch::V4 || field(instr, 8, 4) != 15 {
            return self.raise(ExceptionKind::Undefined);
        }
        let reg = Cp15Register::from_instr(instr);
        let rd = field(instr, 12, 4) as usize;
        if bit(instr, 20) {
            let dst = self.variable();
            self.emit(IrOp::CoprocessorRead { dst, reg });
            if rd == PC {
                self.emit(IrOp::StoreCpsr {
                    src: dst.into(),
                    mask: FlagMask::NZCV.bits(),
                });
                self.touch_flags(FlagMask::NZCV);
                self.ended = true;
            } else {
                self.set_reg(rd, dst.into());
            }
        } else {
            let src = self.reg_ahead(rd);
            self.emit(IrOp::CoprocessorWrite { reg, src });
            if Cp15::has_side_effects(reg) {
                self.ended = true;
            }
        }
    }

    fn arm_coprocessor_other(&mut self, _instr: u32) {
        self.raise(ExceptionKind::Undefined);
    }

    fn arm_software_interrupt(&mut self, _instr: u32) {
        self.raise(ExceptionKind::SoftwareInterrupt);
    }

    fn arm_undefined(&mut self, _instr: u32) {
        self.raise(ExceptionKind::Undefined);
    }

    fn arm_illegal(&mut self, instr: u32) {
        self.illegal("illegal", instr);
    }
}
