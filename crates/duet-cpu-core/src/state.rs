//! Architectural register state: active registers, banked copies, status registers and the
//! two-entry fetch pipeline.

use core::mem::offset_of;

use duet_types::{Mode, Psr, RegisterBank, SpsrBank};
use thiserror::Error;

pub const PC: usize = 15;
pub const LR: usize = 14;
pub const SP: usize = 13;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum StateError {
    #[error("{mode:?} mode has no saved program status register")]
    NoSpsr { mode: Mode },
}

/// Register file of one core.
///
/// `gpr` always holds the registers visible in the current mode. Copies belonging to other modes
/// live in `banked`, indexed by [`RegisterBank`] and register `8..=14`; r8-r12 of every non-FIQ
/// mode are stored in the `User` row.
#[derive(Debug, Clone, PartialEq, Eq)]
#[repr(C)]
pub struct CpuState {
    pub gpr: [u32; 16],
    cpsr: Psr,
    banked: [[u32; 7]; RegisterBank::COUNT],
    spsr: [Psr; SpsrBank::COUNT],
    pub pipeline: [u32; 2],
    pub irq_line: bool,
    pub halted: bool,
}

impl Default for CpuState {
    fn default() -> Self {
        Self::new()
    }
}

/// Which storage row holds register `reg` (8..=14) for `mode`.
#[inline]
fn storage(mode: Mode, reg: usize) -> RegisterBank {
    let bank = mode.bank();
    if reg >= bank.first_banked() {
        bank
    } else {
        RegisterBank::User
    }
}

impl CpuState {
    /// Byte offsets used by generated code.
    pub const GPR_OFFSET: usize = offset_of!(CpuState, gpr);
    pub const CPSR_OFFSET: usize = offset_of!(CpuState, cpsr);

    /// Reset state: Supervisor mode, ARM, IRQ and FIQ masked, everything else zero.
    pub fn new() -> Self {
        Self {
            gpr: [0; 16],
            cpsr: Psr::I | Psr::F | Psr::from_bits_retain(Mode::Supervisor as u32),
            banked: [[0; 7]; RegisterBank::COUNT],
            spsr: [Psr::empty(); SpsrBank::COUNT],
            pipeline: [0; 2],
            irq_line: false,
            halted: false,
        }
    }

    #[inline]
    pub fn cpsr(&self) -> Psr {
        self.cpsr
    }

    #[inline]
    pub fn mode(&self) -> Mode {
        self.cpsr.mode()
    }

    #[inline]
    pub fn thumb(&self) -> bool {
        self.cpsr.thumb()
    }

    /// Instruction width in bytes for the current instruction set.
    #[inline]
    pub fn width(&self) -> u32 {
        if self.thumb() {
            2
        } else {
            4
        }
    }

    /// Installs a new CPSR, swapping register banks when the mode changes. An invalid mode field
    /// keeps the current mode.
    pub fn set_cpsr(&mut self, value: Psr) {
        let old = self.mode();
        let mode = Mode::from_bits(value.bits()).unwrap_or(old);
        if mode != old {
            self.switch_bank(old, mode);
        }
        self.cpsr = value.with_mode(mode);
    }

    /// Updates only the bits selected by `mask`.
    pub fn set_cpsr_masked(&mut self, value: u32, mask: u32) {
        let merged = (self.cpsr.bits() & !mask) | (value & mask);
        self.set_cpsr(Psr::from_bits_retain(merged));
    }

    /// Replaces N, Z, C and V without touching anything else.
    #[inline]
    pub fn set_nzcv(&mut self, nzcv: u32) {
        let bits = (self.cpsr.bits() & !Psr::NZCV.bits()) | (nzcv << 28);
        self.cpsr = Psr::from_bits_retain(bits);
    }

    #[inline]
    pub fn set_flag(&mut self, flag: Psr, value: bool) {
        self.cpsr.set(flag, value);
    }

    fn switch_bank(&mut self, from: Mode, to: Mode) {
        for reg in 8..15 {
            self.banked[storage(from, reg).index()][reg - 8] = self.gpr[reg];
        }
        for reg in 8..15 {
            self.gpr[reg] = self.banked[storage(to, reg).index()][reg - 8];
        }
    }

    /// Reads `reg` as seen from `mode`, whether or not `mode` is active.
    pub fn gpr_in(&self, reg: usize, mode: Mode) -> u32 {
        if !(8..15).contains(&reg) {
            return self.gpr[reg];
        }
        let row = storage(mode, reg);
        if row == storage(self.mode(), reg) {
            self.gpr[reg]
        } else {
            self.banked[row.index()][reg - 8]
        }
    }

    pub fn set_gpr_in(&mut self, reg: usize, mode: Mode, value: u32) {
        if !(8..15).contains(&reg) {
            self.gpr[reg] = value;
            return;
        }
        let row = storage(mode, reg);
        if row == storage(self.mode(), reg) {
            self.gpr[reg] = value;
        } else {
            self.banked[row.index()][reg - 8] = value;
        }
    }

    pub fn spsr(&self, mode: Mode) -> Result<Psr, StateError> {
        match mode.spsr_bank() {
            Some(bank) => Ok(self.spsr[bank.index()]),
            None => Err(StateError::NoSpsr { mode }),
        }
    }

    pub fn set_spsr(&mut self, mode: Mode, value: Psr) -> Result<(), StateError> {
        match mode.spsr_bank() {
            Some(bank) => {
                self.spsr[bank.index()] = value;
                Ok(())
            }
            None => Err(StateError::NoSpsr { mode }),
        }
    }

    /// SPSR of the current mode.
    #[inline]
    pub fn current_spsr(&self) -> Result<Psr, StateError> {
        self.spsr(self.mode())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn enter(state: &mut CpuState, mode: Mode) {
        let cpsr = state.cpsr().with_mode(mode);
        state.set_cpsr(cpsr);
    }

    #[test]
    fn fiq_banks_r8_to_r14() {
        let mut state = CpuState::new();
        enter(&mut state, Mode::System);
        for reg in 0..15 {
            state.gpr[reg] = reg as u32;
        }

        enter(&mut state, Mode::Fiq);
        for reg in 8..15 {
            assert_eq!(state.gpr[reg], 0, "r{reg} should be the FIQ copy");
            state.gpr[reg] = 0x100 + reg as u32;
        }
        assert_eq!(state.gpr[7], 7);

        enter(&mut state, Mode::User);
        for reg in 0..15 {
            assert_eq!(state.gpr[reg], reg as u32);
        }
        assert_eq!(state.gpr_in(10, Mode::Fiq), 0x10A);
        assert_eq!(state.gpr_in(13, Mode::Fiq), 0x10D);
    }

    #[test]
    fn irq_banks_only_sp_and_lr() {
        let mut state = CpuState::new();
        enter(&mut state, Mode::User);
        state.gpr[12] = 12;
        state.gpr[13] = 13;

        enter(&mut state, Mode::Irq);
        assert_eq!(state.gpr[12], 12);
        assert_eq!(state.gpr[13], 0);
        state.gpr[12] = 0xC;
        state.gpr[13] = 0xD;

        enter(&mut state, Mode::Supervisor);
        assert_eq!(state.gpr[12], 0xC);
        assert_eq!(state.gpr_in(13, Mode::Irq), 0xD);
        assert_eq!(state.gpr_in(13, Mode::User), 13);
        assert_eq!(state.gpr_in(12, Mode::Fiq), 0);
    }

    #[test]
    fn set_gpr_in_reaches_inactive_banks() {
        let mut state = CpuState::new();
        state.set_gpr_in(14, Mode::Irq, 0x1234);
        state.set_gpr_in(14, Mode::Supervisor, 0x5678);
        assert_eq!(state.gpr[14], 0x5678);
        enter(&mut state, Mode::Irq);
        assert_eq!(state.gpr[14], 0x1234);
    }

    #[test]
    fn spsr_absent_in_user_and_system() {
        let mut state = CpuState::new();
        assert_eq!(
            state.spsr(Mode::User),
            Err(StateError::NoSpsr { mode: Mode::User })
        );
        assert!(state.set_spsr(Mode::System, Psr::empty()).is_err());
        state.set_spsr(Mode::Abort, Psr::N).unwrap();
        assert_eq!(state.spsr(Mode::Abort), Ok(Psr::N));
        assert_eq!(state.current_spsr(), Ok(Psr::empty()));
    }

    #[test]
    fn invalid_mode_bits_keep_current_mode() {
        let mut state = CpuState::new();
        state.set_cpsr(Psr::from_bits_retain(0x8000_0000 | 0x05));
        assert_eq!(state.mode(), Mode::Supervisor);
        assert!(state.cpsr().contains(Psr::N));
    }
}
