use duet_decoder::ArmHandlers;
use duet_types::bits::{
    add_with_carry, bit, field, saturating_add, saturating_sub, sign_extend, sub_with_carry,
};
use duet_types::shifter::{shift_immediate, shift_register, ShiftKind};
use duet_types::{Arch, ExceptionKind, Psr};

use super::Interpreter;
use crate::bus::Bus;
use crate::cp15::Cp15Register;
use crate::exec::{psr_field_mask, BlockTransfer, LoadKind, StoreWidth};
use crate::state::{LR, PC};

impl<M: Bus> Interpreter<M> {
    /// Operand 2 of a register-form data processing instruction as `(value, carry)`. With a
    /// register-specified shift, PC reads one instruction further ahead.
    fn shifted_register(&self, instr: u32) -> (u32, bool) {
        let carry = self.core.state.cpsr().carry();
        let kind = ShiftKind::from_bits(instr >> 5);
        let rm = field(instr, 0, 4) as usize;
        if bit(instr, 4) {
            let value = self.reg(rm).wrapping_add(if rm == PC { 4 } else { 0 });
            let amount = self.reg(field(instr, 8, 4) as usize) & 0xFF;
            shift_register(kind, value, amount, carry)
        } else {
            shift_immediate(kind, self.reg(rm), field(instr, 7, 5), carry)
        }
    }

    fn require_v5(&mut self) -> bool {
        if self.core.arch() == Arch::V5 {
            true
        } else {
            self.raise(ExceptionKind::Undefined);
            false
        }
    }

    /// Base, offset address and writeback flag shared by the single and halfword transfers.
    fn transfer_address(&self, instr: u32, offset: u32) -> (usize, u32, Option<u32>) {
        let pre = bit(instr, 24);
        let up = bit(instr, 23);
        let writeback = bit(instr, 21);
        let rn = field(instr, 16, 4) as usize;
        let base = self.reg(rn);
        let offset_addr = if up {
            base.wrapping_add(offset)
        } else {
            base.wrapping_sub(offset)
        };
        let addr = if pre { offset_addr } else { base };
        let wb = ((!pre || writeback) && rn != PC).then_some(offset_addr);
        (rn, addr, wb)
    }

    /// Value of `rd` as stored by STR-family instructions (PC reads 12 ahead).
    fn store_value(&self, rd: usize) -> u32 {
        self.reg(rd).wrapping_add(if rd == PC { 4 } else { 0 })
    }
}

impl<M: Bus> ArmHandlers for Interpreter<M> {
    fn arm_data_processing(&mut self, instr: u32) {
        let opcode = field(instr, 21, 4);
        let set_flags = bit(instr, 20);
        if (8..=11).contains(&opcode) && !set_flags {
            return self.illegal("data_processing", instr);
        }

        let rn = field(instr, 16, 4) as usize;
        let rd = field(instr, 12, 4) as usize;
        let carry = self.core.state.cpsr().carry();

        let (op2, shifter_carry) = if bit(instr, 25) {
            let rotate = field(instr, 8, 4) * 2;
            let value = (instr & 0xFF).rotate_right(rotate);
            (value, if rotate == 0 { carry } else { value >> 31 != 0 })
        } else {
            self.shifted_register(instr)
        };
        let register_shift = !bit(instr, 25) && bit(instr, 4);
        let lhs = self
            .reg(rn)
            .wrapping_add(if rn == PC && register_shift { 4 } else { 0 });

        let (result, carry_out, overflow) = match opcode {
            0x0 | 0x8 => (lhs & op2, shifter_carry, None),
            0x1 | 0x9 => (lhs ^ op2, shifter_carry, None),
            0x2 | 0xA => with_overflow(sub_with_carry(lhs, op2, true)),
            0x3 => with_overflow(sub_with_carry(op2, lhs, true)),
            0x4 | 0xB => with_overflow(add_with_carry(lhs, op2, false)),
            0x5 => with_overflow(add_with_carry(lhs, op2, carry)),
            0x6 => with_overflow(sub_with_carry(lhs, op2, carry)),
            0x7 => with_overflow(sub_with_carry(op2, lhs, carry)),
            0xC => (lhs | op2, shifter_carry, None),
            0xD => (op2, shifter_carry, None),
            0xE => (lhs & !op2, shifter_carry, None),
            _ => (!op2, shifter_carry, None),
        };

        let writes_result = !(8..=11).contains(&opcode);
        if writes_result && rd == PC {
            if set_flags {
                self.core.return_from_exception(result);
                self.branched = true;
            } else {
                self.branch(result);
            }
            return;
        }

        if writes_result {
            self.core.state.gpr[rd] = result;
        }
        if set_flags {
            match overflow {
                Some(v) => self.set_nzcv(result, carry_out, v),
                None => self.set_nzc(result, carry_out),
            }
        }
    }

    fn arm_psr_read(&mut self, instr: u32) {
        if let Some(value) = self.core.read_psr(bit(instr, 22)) {
            self.set_reg(field(instr, 12, 4) as usize, value);
        }
    }

    fn arm_psr_write_register(&mut self, instr: u32) {
        let value = self.reg(field(instr, 0, 4) as usize);
        self.core
            .write_psr(bit(instr, 22), value, psr_field_mask(instr));
    }

    fn arm_psr_write_immediate(&mut self, instr: u32) {
        let value = (instr & 0xFF).rotate_right(field(instr, 8, 4) * 2);
        self.core
            .write_psr(bit(instr, 22), value, psr_field_mask(instr));
    }

    fn arm_multiply(&mut self, instr: u32) {
        let rd = field(instr, 16, 4) as usize;
        let mut result = self
            .reg(field(instr, 0, 4) as usize)
            .wrapping_mul(self.reg(field(instr, 8, 4) as usize));
        if bit(instr, 21) {
            result = result.wrapping_add(self.reg(field(instr, 12, 4) as usize));
        }
        self.set_reg(rd, result);
        if bit(instr, 20) {
            self.set_nz(result);
        }
    }

    fn arm_multiply_long(&mut self, instr: u32) {
        let rd_hi = field(instr, 16, 4) as usize;
        let rd_lo = field(instr, 12, 4) as usize;
        let rm = self.reg(field(instr, 0, 4) as usize);
        let rs = self.reg(field(instr, 8, 4) as usize);
        let mut result = if bit(instr, 22) {
            (rm as i32 as i64).wrapping_mul(rs as i32 as i64) as u64
        } else {
            rm as u64 * rs as u64
        };
        if bit(instr, 21) {
            let acc = (self.reg(rd_hi) as u64) << 32 | self.reg(rd_lo) as u64;
            result = result.wrapping_add(acc);
        }
        self.set_reg(rd_lo, result as u32);
        self.set_reg(rd_hi, (result >> 32) as u32);
        if bit(instr, 20) {
            let state = &mut self.core.state;
            state.set_flag(Psr::N, result >> 63 != 0);
            state.set_flag(Psr::Z, result == 0);
        }
    }

    fn arm_signed_halfword_multiply(&mut self, instr: u32) {
        if !self.require_v5() {
            return;
        }
        let rd = field(instr, 16, 4) as usize;
        let rn = field(instr, 12, 4) as usize;
        let rm = self.reg(field(instr, 0, 4) as usize);
        let rs = self.reg(field(instr, 8, 4) as usize);
        let half = |value: u32, high: bool| -> i32 {
            if high {
                (value as i32) >> 16
            } else {
                value as i16 as i32
            }
        };
        let x = half(rm, bit(instr, 5));
        let y = half(rs, bit(instr, 6));

        match field(instr, 21, 2) {
            // SMLAxy
            0 => {
                let product = x.wrapping_mul(y) as u32;
                let (result, _, overflow) = add_with_carry(product, self.reg(rn), false);
                self.set_reg(rd, result);
                if overflow {
                    self.core.state.set_flag(Psr::Q, true);
                }
            }
            // SMLAWy / SMULWy
            1 => {
                let product = ((rm as i32 as i64 * y as i64) >> 16) as u32;
                if bit(instr, 5) {
                    self.set_reg(rd, product);
                } else {
                    let (result, _, overflow) = add_with_carry(product, self.reg(rn), false);
                    self.set_reg(rd, result);
                    if overflow {
                        self.core.state.set_flag(Psr::Q, true);
                    }
                }
            }
            // SMLALxy
            2 => {
                let rd_lo = rn;
                let rd_hi = rd;
                let acc = (self.reg(rd_hi) as u64) << 32 | self.reg(rd_lo) as u64;
                let result = acc.wrapping_add(x.wrapping_mul(y) as i64 as u64);
                self.set_reg(rd_lo, result as u32);
                self.set_reg(rd_hi, (result >> 32) as u32);
            }
            // SMULxy
            _ => self.set_reg(rd, x.wrapping_mul(y) as u32),
        }
    }

    fn arm_saturating_arithmetic(&mut self, instr: u32) {
        if !self.require_v5() {
            return;
        }
        let rm = self.reg(field(instr, 0, 4) as usize);
        let rn = self.reg(field(instr, 16, 4) as usize);
        let op = field(instr, 21, 2);
        let (rn, doubled) = if op & 2 != 0 {
            saturating_add(rn, rn)
        } else {
            (rn, false)
        };
        let (result, saturated) = if op & 1 != 0 {
            saturating_sub(rm, rn)
        } else {
            saturating_add(rm, rn)
        };
        self.set_reg(field(instr, 12, 4) as usize, result);
        if doubled || saturated {
            self.core.state.set_flag(Psr::Q, true);
        }
    }

    fn arm_count_leading_zeros(&mut self, instr: u32) {
        if !self.require_v5() {
            return;
        }
        let value = self.reg(field(instr, 0, 4) as usize).leading_zeros();
        self.set_reg(field(instr, 12, 4) as usize, value);
    }

    fn arm_swap(&mut self, instr: u32) {
        let addr = self.reg(field(instr, 16, 4) as usize);
        let source = self.reg(field(instr, 0, 4) as usize);
        let (load, store) = if bit(instr, 22) {
            (LoadKind::Byte, StoreWidth::Byte)
        } else {
            (LoadKind::Word, StoreWidth::Word)
        };
        let value = self.core.load(load, addr);
        self.core.store(store, addr, source);
        self.set_reg(field(instr, 12, 4) as usize, value);
    }

    fn arm_halfword_transfer(&mut self, instr: u32) {
        let rd = field(instr, 12, 4) as usize;
        let offset = if bit(instr, 22) {
            (field(instr, 8, 4) << 4) | field(instr, 0, 4)
        } else {
            self.reg(field(instr, 0, 4) as usize)
        };
        let (rn, addr, writeback) = self.transfer_address(instr, offset);

        match (bit(instr, 20), field(instr, 5, 2)) {
            (_, 0) => self.illegal("halfword_transfer", instr),
            (true, sh) => {
                let kind = match sh {
                    1 => LoadKind::Half,
                    2 => LoadKind::SignedByte,
                    _ => LoadKind::SignedHalf,
                };
                let value = self.core.load(kind, addr);
                if let Some(wb) = writeback {
                    self.core.state.gpr[rn] = wb;
                }
                self.set_reg(rd, value);
            }
            (false, 1) => {
                let value = self.store_value(rd);
                self.core.store(StoreWidth::Half, addr, value);
                if let Some(wb) = writeback {
                    self.core.state.gpr[rn] = wb;
                }
            }
            (false, sh) => {
                if !self.require_v5() {
                    return;
                }
                if rd & 1 != 0 {
                    return self.raise(ExceptionKind::Undefined);
                }
                if sh == 2 {
                    // LDRD
                    let lo = self.core.load(LoadKind::WordAligned, addr);
                    let hi = self.core.load(LoadKind::WordAligned, addr.wrapping_add(4));
                    if let Some(wb) = writeback {
                        self.core.state.gpr[rn] = wb;
                    }
                    self.set_reg(rd, lo);
                    self.set_reg(rd + 1, hi);
                } else {
                    // STRD
                    let lo = self.store_value(rd);
                    let hi = self.store_value(rd + 1);
                    self.core.store(StoreWidth::Word, addr, lo);
                    self.core.store(StoreWidth::Word, addr.wrapping_add(4), hi);
                    if let Some(wb) = writeback {
                        self.core.state.gpr[rn] = wb;
                    }
                }
            }
        }
    }

    fn arm_single_transfer(&mut self, instr: u32) {
        let rd = field(instr, 12, 4) as usize;
        let offset = if bit(instr, 25) {
            let carry = self.core.state.cpsr().carry();
            let kind = ShiftKind::from_bits(instr >> 5);
            let rm = self.reg(field(instr, 0, 4) as usize);
            shift_immediate(kind, rm, field(instr, 7, 5), carry).0
        } else {
            instr & 0xFFF
        };
        let (rn, addr, writeback) = self.transfer_address(instr, offset);
        let byte = bit(instr, 22);

        if bit(instr, 20) {
            let kind = if byte { LoadKind::Byte } else { LoadKind::Word };
            let value = self.core.load(kind, addr);
            if let Some(wb) = writeback {
                self.core.state.gpr[rn] = wb;
            }
            if byte {
                self.set_reg(rd, value);
            } else {
                self.set_reg_loaded(rd, value);
            }
        } else {
            let value = self.store_value(rd);
            let width = if byte {
                StoreWidth::Byte
            } else {
                StoreWidth::Word
            };
            self.core.store(width, addr, value);
            if let Some(wb) = writeback {
                self.core.state.gpr[rn] = wb;
            }
        }
    }

    fn arm_block_transfer(&mut self, instr: u32) {
        let plan = BlockTransfer::decode(instr, self.core.arch());
        self.block_transfer(plan);
    }

    fn arm_branch(&mut self, instr: u32) {
        let pc = self.reg(PC);
        let offset = sign_extend(instr & 0x00FF_FFFF, 24) << 2;
        if instr >> 28 == 0xF {
            // BLX <imm>: the H bit selects the halfword.
            let target = pc.wrapping_add(offset) | (field(instr, 24, 1) << 1) | 1;
            self.core.state.gpr[LR] = pc.wrapping_sub(4);
            self.branch_exchange(target);
            return;
        }
        if bit(instr, 24) {
            self.core.state.gpr[LR] = pc.wrapping_sub(4);
        }
        self.branch(pc.wrapping_add(offset));
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
        self.core.state.gpr[LR] = self.reg(PC).wrapping_sub(4);
        self.branch_exchange(target);
    }

    fn arm_breakpoint(&mut self, _instr: u32) {
        if self.require_v5() {
            self.raise(ExceptionKind::PrefetchAbort);
        }
    }

    fn arm_coprocessor_register(&mut self, instr: u32) {
        if self.core.arch() == Arch::V4 || field(instr, 8, 4) != 15 {
            return self.raise(ExceptionKind::Undefined);
        }
        let reg = Cp15Register::from_instr(instr);
        let rd = field(instr, 12, 4) as usize;
        if bit(instr, 20) {
            let value = self.core.coprocessor_read(reg);
            if rd == PC {
                self.core.state.set_nzcv(value >> 28);
            } else {
                self.core.state.gpr[rd] = value;
            }
        } else {
            let value = self.store_value(rd);
            self.core.coprocessor_write(reg, value);
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
        let class = self.decoder.arm_class_name(instr);
        self.illegal(class, instr);
    }
}

#[inline]
fn with_overflow((result, carry, overflow): (u32, bool, bool)) -> (u32, bool, Option<bool>) {
    (result, carry, Some(overflow))
}
