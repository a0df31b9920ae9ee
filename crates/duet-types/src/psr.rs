use bitflags::bitflags;

/// Architecture generation of an emulated core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Arch {
    /// ARM7TDMI-class core.
    V4,
    /// ARM946E-S-class core (adds BLX, CLZ, DSP extensions, CP15).
    V5,
}

impl Arch {
    #[inline]
    pub const fn is_v5(self) -> bool {
        matches!(self, Arch::V5)
    }

    /// Whether an ARM instruction with condition `NV` executes at all.
    ///
    /// ARMv5 reuses the `NV` space for `BLX <imm>` (bits 27:25 = `101`); everything else in it
    /// never executes on either generation.
    #[inline]
    pub const fn executes_nv(self, instr: u32) -> bool {
        self.is_v5() && (instr >> 25) & 0b111 == 0b101
    }
}

bitflags! {
    /// Program status register (CPSR/SPSR) layout.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[repr(transparent)]
    pub struct Psr: u32 {
        const N = 1 << 31;
        const Z = 1 << 30;
        const C = 1 << 29;
        const V = 1 << 28;
        const Q = 1 << 27;
        const I = 1 << 7;
        const F = 1 << 6;
        const T = 1 << 5;
        const MODE = 0x1F;

        const NZCV = Self::N.bits() | Self::Z.bits() | Self::C.bits() | Self::V.bits();
        const FLAGS = Self::NZCV.bits() | Self::Q.bits();

        const _ = !0;
    }
}

impl Psr {
    /// Mode encoded in the low five bits. Invalid encodings read as `User`; the CPU state never
    /// installs one into the CPSR.
    #[inline]
    pub fn mode(self) -> Mode {
        Mode::from_bits(self.bits()).unwrap_or(Mode::User)
    }

    #[inline]
    pub fn with_mode(self, mode: Mode) -> Self {
        Self::from_bits_retain((self.bits() & !Self::MODE.bits()) | mode as u32)
    }

    #[inline]
    pub fn thumb(self) -> bool {
        self.contains(Self::T)
    }

    /// N, Z, C and V as a nibble (N in bit 3).
    #[inline]
    pub fn nzcv(self) -> u32 {
        self.bits() >> 28
    }

    #[inline]
    pub fn carry(self) -> bool {
        self.contains(Self::C)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Mode {
    User = 0x10,
    Fiq = 0x11,
    Irq = 0x12,
    Supervisor = 0x13,
    Abort = 0x17,
    Undefined = 0x1B,
    System = 0x1F,
}

impl Mode {
    pub const ALL: [Mode; 7] = [
        Mode::User,
        Mode::Fiq,
        Mode::Irq,
        Mode::Supervisor,
        Mode::Abort,
        Mode::Undefined,
        Mode::System,
    ];

    /// Decodes the low five bits of a PSR value.
    pub const fn from_bits(bits: u32) -> Option<Self> {
        Some(match bits & 0x1F {
            0x10 => Mode::User,
            0x11 => Mode::Fiq,
            0x12 => Mode::Irq,
            0x13 => Mode::Supervisor,
            0x17 => Mode::Abort,
            0x1B => Mode::Undefined,
            0x1F => Mode::System,
            _ => return None,
        })
    }

    /// Storage bank for r8-r14. User and System share one.
    #[inline]
    pub const fn bank(self) -> RegisterBank {
        match self {
            Mode::User | Mode::System => RegisterBank::User,
            Mode::Fiq => RegisterBank::Fiq,
            Mode::Irq => RegisterBank::Irq,
            Mode::Supervisor => RegisterBank::Supervisor,
            Mode::Abort => RegisterBank::Abort,
            Mode::Undefined => RegisterBank::Undefined,
        }
    }

    /// Saved status register of this mode; `None` for User and System.
    #[inline]
    pub const fn spsr_bank(self) -> Option<SpsrBank> {
        match self {
            Mode::User | Mode::System => None,
            Mode::Fiq => Some(SpsrBank::Fiq),
            Mode::Irq => Some(SpsrBank::Irq),
            Mode::Supervisor => Some(SpsrBank::Supervisor),
            Mode::Abort => Some(SpsrBank::Abort),
            Mode::Undefined => Some(SpsrBank::Undefined),
        }
    }

    #[inline]
    pub const fn is_privileged(self) -> bool {
        !matches!(self, Mode::User)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterBank {
    User,
    Fiq,
    Irq,
    Supervisor,
    Abort,
    Undefined,
}

impl RegisterBank {
    pub const COUNT: usize = 6;

    /// Lowest register index stored in this bank (FIQ banks r8-r14, the rest only r13-r14).
    #[inline]
    pub const fn first_banked(self) -> usize {
        match self {
            RegisterBank::Fiq => 8,
            _ => 13,
        }
    }

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpsrBank {
    Fiq,
    Irq,
    Supervisor,
    Abort,
    Undefined,
}

impl SpsrBank {
    pub const COUNT: usize = 5;

    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionKind {
    Reset,
    Undefined,
    SoftwareInterrupt,
    PrefetchAbort,
    DataAbort,
    Irq,
    Fiq,
}

impl ExceptionKind {
    #[inline]
    pub const fn vector_offset(self) -> u32 {
        match self {
            ExceptionKind::Reset => 0x00,
            ExceptionKind::Undefined => 0x04,
            ExceptionKind::SoftwareInterrupt => 0x08,
            ExceptionKind::PrefetchAbort => 0x0C,
            ExceptionKind::DataAbort => 0x10,
            ExceptionKind::Irq => 0x18,
            ExceptionKind::Fiq => 0x1C,
        }
    }

    #[inline]
    pub const fn mode(self) -> Mode {
        match self {
            ExceptionKind::Reset | ExceptionKind::SoftwareInterrupt => Mode::Supervisor,
            ExceptionKind::Undefined => Mode::Undefined,
            ExceptionKind::PrefetchAbort | ExceptionKind::DataAbort => Mode::Abort,
            ExceptionKind::Irq => Mode::Irq,
            ExceptionKind::Fiq => Mode::Fiq,
        }
    }

    /// Reset and FIQ entry also mask FIQs.
    #[inline]
    pub const fn masks_fiq(self) -> bool {
        matches!(self, ExceptionKind::Reset | ExceptionKind::Fiq)
    }

    /// Whether the return address is taken relative to the next instruction to execute
    /// (interrupts) rather than the one that raised the exception.
    #[inline]
    pub const fn is_interrupt(self) -> bool {
        matches!(self, ExceptionKind::Irq | ExceptionKind::Fiq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips_through_psr() {
        for mode in Mode::ALL {
            let psr = Psr::from_bits_retain(0xF000_00C0).with_mode(mode);
            assert_eq!(psr.mode(), mode);
            assert_eq!(psr.nzcv(), 0xF);
        }
        assert_eq!(Mode::from_bits(0x00), None);
        assert_eq!(Mode::from_bits(0x14), None);
    }

    #[test]
    fn user_and_system_share_a_bank_and_have_no_spsr() {
        assert_eq!(Mode::User.bank(), Mode::System.bank());
        assert_eq!(Mode::User.spsr_bank(), None);
        assert_eq!(Mode::System.spsr_bank(), None);
        assert_eq!(Mode::Fiq.bank().first_banked(), 8);
        assert_eq!(Mode::Irq.bank().first_banked(), 13);
    }

    #[test]
    fn nv_space_only_executes_blx_on_v5() {
        let blx = 0xFA00_0000;
        assert!(Arch::V5.executes_nv(blx));
        assert!(!Arch::V4.executes_nv(blx));
        assert!(!Arch::V5.executes_nv(0xF000_0000));
    }
}
