//! Execution helpers shared by every backend.
//!
//! [`Core`] bundles the register state with the bus and CP15 and implements the pieces of
//! architectural behaviour that the interpreter and the JIT must agree on exactly: pipeline
//! refills, exception entry, status register writes, memory access kinds and the block transfer
//! edge cases.

use duet_types::{Arch, Cond, ExceptionKind, Mode, Psr, CONDITION_TABLE};

use crate::bus::{Bus, BusKind};
use crate::cp15::{Cp15, Cp15Effect, Cp15Register};
use crate::state::{CpuState, PC};

/// How a load reads memory and widens the result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LoadKind {
    Byte,
    SignedByte,
    Half,
    SignedHalf,
    /// `LDR`/`SWP`: unaligned addresses rotate the aligned word.
    Word,
    /// `LDM`/`LDRD`/`POP`: the address is force-aligned and never rotated.
    WordAligned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreWidth {
    Byte,
    Half,
    Word,
}

/// Field mask of an `MSR` (instruction bits 19:16) expanded to PSR bits.
#[inline]
pub const fn psr_field_mask(instr: u32) -> u32 {
    let mut mask = 0;
    if instr & (1 << 16) != 0 {
        mask |= 0x0000_00FF;
    }
    if instr & (1 << 17) != 0 {
        mask |= 0x0000_FF00;
    }
    if instr & (1 << 18) != 0 {
        mask |= 0x00FF_0000;
    }
    if instr & (1 << 19) != 0 {
        mask |= 0xFF00_0000;
    }
    mask
}

/// Resolved plan for an LDM/STM (or Thumb PUSH/POP/LDMIA/STMIA).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTransfer {
    pub load: bool,
    pub base: usize,
    /// Registers actually transferred, ascending.
    pub registers: u16,
    /// Offset of the first transfer from the base value.
    pub start: u32,
    /// Offset of the written-back base from the original base, if writeback happens.
    pub writeback: Option<u32>,
    /// STM only: when the base is stored, store the written-back value instead of the original.
    pub store_new_base: bool,
    /// Transfer the User bank instead of the current one (`^` without PC in an LDM).
    pub user_bank: bool,
    /// LDM `^` with PC in the list: restore CPSR from SPSR when branching.
    pub restore_cpsr: bool,
}

impl BlockTransfer {
    /// Plans an ARM-encoded block transfer. Thumb forms are re-encoded by their callers.
    pub fn decode(instr: u32, arch: Arch) -> Self {
        let pre = instr & (1 << 24) != 0;
        let up = instr & (1 << 23) != 0;
        let s_bit = instr & (1 << 22) != 0;
        let writeback = instr & (1 << 21) != 0;
        let load = instr & (1 << 20) != 0;
        let base = ((instr >> 16) & 0xF) as usize;
        let mut registers = (instr & 0xFFFF) as u16;

        let empty = registers == 0;
        if empty && arch == Arch::V4 {
            registers = 1 << PC;
        }
        let bytes = if empty {
            0x40
        } else {
            4 * registers.count_ones()
        };

        let (start, end) = match (up, pre) {
            (true, false) => (0u32, bytes),
            (true, true) => (4, bytes),
            (false, false) => ((4u32).wrapping_sub(bytes), 0u32.wrapping_sub(bytes)),
            (false, true) => (0u32.wrapping_sub(bytes), 0u32.wrapping_sub(bytes)),
        };

        let base_bit = 1u16 << base;
        let base_in_list = registers & base_bit != 0;
        let mut wb = writeback && base != PC;
        let mut store_new_base = false;
        if wb && base_in_list {
            if load {
                wb = match arch {
                    Arch::V4 => false,
                    // Writeback if the base is the only register or not the last one.
                    Arch::V5 => registers == base_bit || registers >> (base + 1) != 0,
                };
            } else if arch == Arch::V4 {
                // The old base is stored only when it is the first register transferred.
                store_new_base = registers & (base_bit - 1) != 0;
            }
        }

        let pc_in_list = registers & (1 << PC) != 0;
        Self {
            load,
            base,
            registers,
            start,
            writeback: wb.then_some(end),
            store_new_base,
            user_bank: s_bit && !(load && pc_in_list),
            restore_cpsr: s_bit && load && pc_in_list,
        }
    }

    /// Re-encodes Thumb `LDMIA/STMIA rb!, {rlist}`.
    pub fn thumb_multiple(instr: u16, arch: Arch) -> Self {
        let load = instr & (1 << 11) != 0;
        let base = ((instr >> 8) & 7) as u32;
        let arm = 0x08A0_0000 | (load as u32) << 20 | base << 16 | (instr as u32 & 0xFF);
        Self::decode(arm, arch)
    }

    /// Re-encodes Thumb `PUSH {rlist, lr}` / `POP {rlist, pc}`.
    pub fn thumb_push_pop(instr: u16, arch: Arch) -> Self {
        let pop = instr & (1 << 11) != 0;
        let extra = if instr & (1 << 8) != 0 {
            if pop {
                1 << PC
            } else {
                1 << 14
            }
        } else {
            0
        };
        let list = (instr as u32 & 0xFF) | extra;
        let arm = if pop {
            // LDMIA sp!
            0x08BD_0000 | list
        } else {
            // STMDB sp!
            0x092D_0000 | list
        };
        Self::decode(arm, arch)
    }

    #[inline]
    pub fn transfers_pc(&self) -> bool {
        self.registers & (1 << PC) != 0
    }
}

/// Register state plus everything an instruction can touch.
#[derive(Debug)]
pub struct Core<M> {
    pub state: CpuState,
    pub bus: M,
    pub cp15: Cp15,
    arch: Arch,
}

impl<M: Bus> Core<M> {
    pub fn new(arch: Arch, bus: M) -> Self {
        let mut core = Self {
            state: CpuState::new(),
            bus,
            cp15: Cp15::new(),
            arch,
        };
        core.reset();
        core
    }

    #[inline]
    pub fn arch(&self) -> Arch {
        self.arch
    }

    /// Back to the reset vector in Supervisor mode.
    pub fn reset(&mut self) {
        self.state = CpuState::new();
        self.cp15 = Cp15::new();
        self.bus.update_tcm(&self.cp15.tcm_layout());
        self.state.gpr[PC] = self.exception_base();
        self.flush_arm();
    }

    pub fn exception_base(&self) -> u32 {
        match self.arch {
            Arch::V4 => 0,
            Arch::V5 => self.cp15.exception_base(),
        }
    }

    #[inline]
    pub fn fetch_arm(&mut self, addr: u32) -> u32 {
        self.bus.read_u32(BusKind::Code, addr & !3)
    }

    #[inline]
    pub fn fetch_thumb(&mut self, addr: u32) -> u16 {
        self.bus.read_u16(BusKind::Code, addr & !1)
    }

    /// Aligns PC, refills both pipeline slots from it and leaves PC two instructions ahead.
    pub fn flush_arm(&mut self) {
        let pc = self.state.gpr[PC] & !3;
        self.state.pipeline = [self.fetch_arm(pc), self.fetch_arm(pc.wrapping_add(4))];
        self.state.gpr[PC] = pc.wrapping_add(8);
    }

    pub fn flush_thumb(&mut self) {
        let pc = self.state.gpr[PC] & !1;
        self.state.pipeline = [
            self.fetch_thumb(pc) as u32,
            self.fetch_thumb(pc.wrapping_add(2)) as u32,
        ];
        self.state.gpr[PC] = pc.wrapping_add(4);
    }

    /// Flushes for the instruction set selected by the current T bit.
    #[inline]
    pub fn flush_pipeline(&mut self) {
        if self.state.thumb() {
            self.flush_thumb()
        } else {
            self.flush_arm()
        }
    }

    /// Refetches the two slots behind the current PC without moving it, leaving the pipeline as
    /// if the preceding instructions had been stepped one by one.
    pub fn refill_pipeline(&mut self) {
        let pc = self.state.gpr[PC];
        self.state.pipeline = if self.state.thumb() {
            [
                self.fetch_thumb(pc.wrapping_sub(4)) as u32,
                self.fetch_thumb(pc.wrapping_sub(2)) as u32,
            ]
        } else {
            [
                self.fetch_arm(pc.wrapping_sub(8)),
                self.fetch_arm(pc.wrapping_sub(4)),
            ]
        };
    }

    /// Address of the next instruction to execute.
    #[inline]
    pub fn next_address(&self) -> u32 {
        self.state.gpr[PC].wrapping_sub(2 * self.state.width())
    }

    #[inline]
    pub fn condition_passes(&self, cond: Cond, instr: u32) -> bool {
        match cond {
            Cond::Al => true,
            Cond::Nv => self.arch.executes_nv(instr),
            _ => CONDITION_TABLE.passes(cond, self.state.cpsr().nzcv()),
        }
    }

    pub fn branch(&mut self, target: u32) {
        self.state.gpr[PC] = target;
        self.flush_pipeline();
    }

    pub fn branch_exchange(&mut self, target: u32) {
        self.state.set_flag(Psr::T, target & 1 != 0);
        self.branch(target);
    }

    /// A load into PC: ARMv5 interworks on bit 0, ARMv4 does not.
    pub fn load_pc(&mut self, target: u32) {
        match self.arch {
            Arch::V4 => self.branch(target),
            Arch::V5 => self.branch_exchange(target),
        }
    }

    /// `MOVS pc, ...` / `LDM {..., pc}^`: CPSR = SPSR, then branch in the restored state.
    pub fn return_from_exception(&mut self, target: u32) {
        match self.state.current_spsr() {
            Ok(spsr) => self.state.set_cpsr(spsr),
            Err(error) => tracing::warn!(%error, "exception return without SPSR"),
        }
        self.branch(target);
    }

    /// Exception entry. PC must hold the executing instruction's address plus two instructions
    /// (for interrupts: of the next instruction to execute).
    pub fn raise(&mut self, kind: ExceptionKind) {
        let old = self.state.cpsr();
        let pc = self.state.gpr[PC];
        let lr = match (kind.is_interrupt(), old.thumb()) {
            (true, true) => pc,
            (true, false) => pc.wrapping_sub(4),
            (false, true) => pc.wrapping_sub(2),
            (false, false) => pc.wrapping_sub(4),
        };

        let mut cpsr = old.with_mode(kind.mode());
        cpsr.insert(Psr::I);
        cpsr.remove(Psr::T);
        if kind.masks_fiq() {
            cpsr.insert(Psr::F);
        }
        self.state.set_cpsr(cpsr);
        let saved = self.state.set_spsr(kind.mode(), old);
        debug_assert!(saved.is_ok(), "exception modes always have an SPSR");
        self.state.gpr[14] = lr;
        self.state.gpr[PC] = self.exception_base().wrapping_add(kind.vector_offset());
        self.flush_arm();
    }

    #[inline]
    pub fn irq_pending(&self) -> bool {
        self.state.irq_line && !self.state.cpsr().contains(Psr::I)
    }

    /// `MRS`. Returns `None` (and logs) for the SPSR of a mode without one.
    pub fn read_psr(&self, spsr: bool) -> Option<u32> {
        if !spsr {
            return Some(self.state.cpsr().bits());
        }
        match self.state.current_spsr() {
            Ok(value) => Some(value.bits()),
            Err(error) => {
                tracing::warn!(%error, "MRS from missing SPSR ignored");
                None
            }
        }
    }

    /// `MSR` with an already expanded field mask. T is never written this way and User mode may
    /// only change the flags.
    pub fn write_psr(&mut self, spsr: bool, value: u32, mask: u32) {
        let mut mask = mask;
        if self.arch == Arch::V4 {
            mask &= !Psr::Q.bits();
        }
        if spsr {
            match self.state.current_spsr() {
                Ok(current) => {
                    let merged = (current.bits() & !mask) | (value & mask);
                    let mode = self.state.mode();
                    let written = self.state.set_spsr(mode, Psr::from_bits_retain(merged));
                    debug_assert!(written.is_ok(), "{mode:?} had an SPSR a moment ago");
                }
                Err(error) => tracing::warn!(%error, "MSR to missing SPSR ignored"),
            }
            return;
        }

        mask &= !Psr::T.bits();
        if self.state.mode() == Mode::User {
            mask &= 0xFF00_0000;
        }
        self.state.set_cpsr_masked(value, mask);
    }

    pub fn load(&mut self, kind: LoadKind, addr: u32) -> u32 {
        match kind {
            LoadKind::Byte => self.bus.read_u8(BusKind::Data, addr) as u32,
            LoadKind::SignedByte => self.bus.read_u8(BusKind::Data, addr) as i8 as u32,
            LoadKind::Half => {
                let value = self.bus.read_u16(BusKind::Data, addr & !1) as u32;
                match self.arch {
                    Arch::V4 => value.rotate_right((addr & 1) * 8),
                    Arch::V5 => value,
                }
            }
            LoadKind::SignedHalf => {
                if self.arch == Arch::V4 && addr & 1 != 0 {
                    self.bus.read_u8(BusKind::Data, addr) as i8 as u32
                } else {
                    self.bus.read_u16(BusKind::Data, addr & !1) as i16 as u32
                }
            }
            LoadKind::Word => self
                .bus
                .read_u32(BusKind::Data, addr & !3)
                .rotate_right((addr & 3) * 8),
            LoadKind::WordAligned => self.bus.read_u32(BusKind::Data, addr & !3),
        }
    }

    pub fn store(&mut self, width: StoreWidth, addr: u32, value: u32) {
        match width {
            StoreWidth::Byte => self.bus.write_u8(BusKind::Data, addr, value as u8),
            StoreWidth::Half => self.bus.write_u16(BusKind::Data, addr & !1, value as u16),
            StoreWidth::Word => self.bus.write_u32(BusKind::Data, addr & !3, value),
        }
    }

    pub fn coprocessor_read(&mut self, reg: Cp15Register) -> u32 {
        self.cp15.read(reg)
    }

    pub fn coprocessor_write(&mut self, reg: Cp15Register, value: u32) {
        match self.cp15.write(reg, value) {
            Cp15Effect::None => {}
            Cp15Effect::Halt => self.state.halted = true,
            Cp15Effect::Tcm(layout) => self.bus.update_tcm(&layout),
        }
    }
}
