//! System control coprocessor (CP15) of the ARMv5 core.

use crate::tcm::{TcmConfig, TcmLayout};

const CONTROL_RESET: u32 = 0x0000_2078;
/// Bits software may change in the control register.
const CONTROL_WRITABLE: u32 = 0x000F_F085;

const CONTROL_HIGH_VECTORS: u32 = 1 << 13;
const CONTROL_DTCM_ENABLE: u32 = 1 << 16;
const CONTROL_DTCM_LOAD_MODE: u32 = 1 << 17;
const CONTROL_ITCM_ENABLE: u32 = 1 << 18;
const CONTROL_ITCM_LOAD_MODE: u32 = 1 << 19;

const MAIN_ID: u32 = 0x4105_9461;
const CACHE_TYPE: u32 = 0x0F0D_2112;
const TCM_SIZE: u32 = 0x0014_0180;

/// `(CRn, CRm, opcode_2)` selecting a CP15 register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cp15Register {
    pub crn: u8,
    pub crm: u8,
    pub opcode2: u8,
}

impl Cp15Register {
    pub const fn new(crn: u8, crm: u8, opcode2: u8) -> Self {
        Self { crn, crm, opcode2 }
    }

    /// Extracts the selector from an MRC/MCR instruction.
    pub const fn from_instr(instr: u32) -> Self {
        Self {
            crn: ((instr >> 16) & 0xF) as u8,
            crm: (instr & 0xF) as u8,
            opcode2: ((instr >> 5) & 7) as u8,
        }
    }

    const CONTROL: Self = Self::new(1, 0, 0);
    const DTCM_REGION: Self = Self::new(9, 1, 0);
    const ITCM_REGION: Self = Self::new(9, 1, 1);

    #[inline]
    fn is_wait_for_interrupt(self) -> bool {
        self == Self::new(7, 0, 4) || self == Self::new(7, 8, 2)
    }
}

/// What a CP15 write requires of the CPU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cp15Effect {
    None,
    Halt,
    Tcm(TcmLayout),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cp15 {
    control: u32,
    dtcm_region: u32,
    itcm_region: u32,
}

impl Default for Cp15 {
    fn default() -> Self {
        Self::new()
    }
}

impl Cp15 {
    pub fn new() -> Self {
        Self {
            control: CONTROL_RESET,
            dtcm_region: 0,
            itcm_region: 0,
        }
    }

    #[inline]
    pub fn control(&self) -> u32 {
        self.control
    }

    pub fn exception_base(&self) -> u32 {
        if self.control & CONTROL_HIGH_VECTORS != 0 {
            0xFFFF_0000
        } else {
            0
        }
    }

    /// Whether writing `reg` can change memory mapping or halt state.
    pub fn has_side_effects(reg: Cp15Register) -> bool {
        reg == Cp15Register::CONTROL
            || reg == Cp15Register::DTCM_REGION
            || reg == Cp15Register::ITCM_REGION
            || reg.is_wait_for_interrupt()
    }

    pub fn read(&self, reg: Cp15Register) -> u32 {
        match (reg.crn, reg.crm, reg.opcode2) {
            (0, 0, 1) => CACHE_TYPE,
            (0, 0, 2) => TCM_SIZE,
            (0, 0, _) => MAIN_ID,
            (1, 0, 0) => self.control,
            (9, 1, 0) => self.dtcm_region,
            (9, 1, 1) => self.itcm_region,
            // Protection unit and cache configuration read back as zero.
            (2 | 3 | 5 | 6, _, _) => 0,
            _ => {
                tracing::warn!(?reg, "read from unknown CP15 register");
                0
            }
        }
    }

    pub fn write(&mut self, reg: Cp15Register, value: u32) -> Cp15Effect {
        if reg.is_wait_for_interrupt() {
            return Cp15Effect::Halt;
        }
        match (reg.crn, reg.crm, reg.opcode2) {
            (1, 0, 0) => {
                self.control = (self.control & !CONTROL_WRITABLE) | (value & CONTROL_WRITABLE);
                Cp15Effect::Tcm(self.tcm_layout())
            }
            (9, 1, 0) => {
                self.dtcm_region = value;
                Cp15Effect::Tcm(self.tcm_layout())
            }
            (9, 1, 1) => {
                self.itcm_region = value;
                Cp15Effect::Tcm(self.tcm_layout())
            }
            // Cache maintenance, write buffer drain, protection regions.
            (2 | 3 | 5 | 6 | 7, _, _) => Cp15Effect::None,
            _ => {
                tracing::warn!(?reg, value, "write to unknown CP15 register");
                Cp15Effect::None
            }
        }
    }

    pub fn tcm_layout(&self) -> TcmLayout {
        let control = self.control;
        TcmLayout {
            itcm: TcmConfig {
                base: 0,
                size: region_size(self.itcm_region),
                read_enabled: control & CONTROL_ITCM_ENABLE != 0
                    && control & CONTROL_ITCM_LOAD_MODE == 0,
                write_enabled: control & CONTROL_ITCM_ENABLE != 0,
            },
            dtcm: TcmConfig {
                base: self.dtcm_region & 0xFFFF_F000,
                size: region_size(self.dtcm_region),
                read_enabled: control & CONTROL_DTCM_ENABLE != 0
                    && control & CONTROL_DTCM_LOAD_MODE == 0,
                write_enabled: control & CONTROL_DTCM_ENABLE != 0,
            },
        }
    }
}

/// `512 << size` from bits 5:1 of a region register, saturating at the largest `u32` window.
fn region_size(region: u32) -> u32 {
    let shift = (region >> 1) & 0x1F;
    if shift > MAX_REGION_SHIFT {
        tracing::warn!(region, shift, "TCM region size clamped to 2 GiB");
        return 512 << MAX_REGION_SHIFT;
    }
    512 << shift
}

const MAX_REGION_SHIFT: u32 = 22;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn high_vectors_move_exception_base() {
        let mut cp15 = Cp15::new();
        assert_eq!(cp15.exception_base(), 0);
        cp15.write(Cp15Register::CONTROL, CONTROL_RESET | CONTROL_HIGH_VECTORS);
        assert_eq!(cp15.exception_base(), 0xFFFF_0000);
    }

    #[test]
    fn tcm_region_registers_produce_layout() {
        let mut cp15 = Cp15::new();
        cp15.write(Cp15Register::DTCM_REGION, 0x0080_000A);
        let effect = cp15.write(
            Cp15Register::CONTROL,
            CONTROL_RESET | CONTROL_DTCM_ENABLE | CONTROL_ITCM_ENABLE,
        );
        let Cp15Effect::Tcm(layout) = effect else {
            panic!("control write should report a TCM change, got {effect:?}");
        };
        assert_eq!(layout.dtcm.base, 0x0080_0000);
        assert_eq!(layout.dtcm.size, 16 * 1024);
        assert!(layout.dtcm.read_enabled && layout.dtcm.write_enabled);
        assert!(layout.itcm.write_enabled);
    }

    #[test]
    fn oversized_tcm_regions_saturate() {
        let mut cp15 = Cp15::new();
        // Size fields 22 and 23 and the all-ones field.
        for (field, size) in [(22, 1 << 31), (23, 1 << 31), (31, 1 << 31), (5, 16 * 1024)] {
            cp15.write(Cp15Register::DTCM_REGION, 0x0080_0000 | field << 1);
            assert_eq!(cp15.tcm_layout().dtcm.size, size, "size field {field}");
        }
    }

    #[test]
    fn wait_for_interrupt_halts() {
        let mut cp15 = Cp15::new();
        assert_eq!(cp15.write(Cp15Register::new(7, 0, 4), 0), Cp15Effect::Halt);
        assert_eq!(cp15.write(Cp15Register::new(7, 8, 2), 0), Cp15Effect::Halt);
        assert_eq!(cp15.write(Cp15Register::new(7, 5, 0), 0), Cp15Effect::None);
        assert!(Cp15::has_side_effects(Cp15Register::new(7, 0, 4)));
        assert!(!Cp15::has_side_effects(Cp15Register::new(7, 5, 0)));
    }
}
