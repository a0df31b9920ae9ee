//! A small AArch64 assembler: just the instruction forms the block compiler emits.
//!
//! Data-processing instructions operate on the 32-bit `W` view unless the name says otherwise.
//! Forward branches go through [`Label`]s, which are patched once the label is bound.

use thiserror::Error;

/// General-purpose register number. `31` is `wzr`/`xzr` in data-processing forms and `sp` in
/// address forms.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Reg(pub u8);

impl Reg {
    pub const X0: Reg = Reg(0);
    pub const X1: Reg = Reg(1);
    pub const X16: Reg = Reg(16);
    pub const X19: Reg = Reg(19);
    pub const X20: Reg = Reg(20);
    pub const FP: Reg = Reg(29);
    pub const LR: Reg = Reg(30);
    pub const ZR: Reg = Reg(31);
    pub const SP: Reg = Reg(31);

    #[inline]
    fn bits(self) -> u32 {
        self.0 as u32 & 31
    }
}

/// Condition field of `b.cond`. Encodings match the guest condition field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum A64Cond {
    Eq = 0,
    Ne = 1,
    Hs = 2,
    Lo = 3,
    Mi = 4,
    Pl = 5,
    Vs = 6,
    Vc = 7,
    Hi = 8,
    Ls = 9,
    Ge = 10,
    Lt = 11,
    Gt = 12,
    Le = 13,
    Al = 14,
}

impl A64Cond {
    const ALL: [A64Cond; 15] = [
        A64Cond::Eq,
        A64Cond::Ne,
        A64Cond::Hs,
        A64Cond::Lo,
        A64Cond::Mi,
        A64Cond::Pl,
        A64Cond::Vs,
        A64Cond::Vc,
        A64Cond::Hi,
        A64Cond::Ls,
        A64Cond::Ge,
        A64Cond::Lt,
        A64Cond::Gt,
        A64Cond::Le,
        A64Cond::Al,
    ];

    /// `None` for 15, which has no `b.cond` meaning worth emitting.
    pub fn from_bits(bits: u32) -> Option<Self> {
        Self::ALL.get(bits as usize).copied()
    }

    /// The opposite condition. `Al` has none.
    pub fn invert(self) -> Option<Self> {
        match self {
            A64Cond::Al => None,
            cond => Self::from_bits(cond as u32 ^ 1),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AsmError {
    #[error("label {0} used but never bound")]
    UnboundLabel(usize),
    #[error("branch at word {site} cannot reach word {target}")]
    OutOfRange { site: usize, target: usize },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug, Default)]
struct LabelState {
    bound: Option<usize>,
    /// Word indices of instructions that refer to the label.
    sites: Vec<usize>,
}

// ---- Immediate encoders ----

/// `N:immr:imms` for a 32-bit logical immediate, packed as `N << 12 | immr << 6 | imms`.
///
/// All-zeros and all-ones have no encoding.
pub fn encode_bitmask(value: u32) -> Option<u32> {
    if value == 0 || value == u32::MAX {
        return None;
    }

    // Smallest repeating element.
    let mut size = 32u32;
    while size > 2 {
        let half = size / 2;
        let mask = (1u32 << half) - 1;
        if (value >> half) & mask != value & mask {
            break;
        }
        size = half;
    }

    let mask = if size == 32 { u32::MAX } else { (1u32 << size) - 1 };
    let element = value & mask;
    let ones = element.count_ones();
    let run = (1u32 << ones) - 1;
    let rotate = |x: u32, by: u32| -> u32 {
        if by == 0 {
            x
        } else {
            ((x >> by) | (x << (size - by))) & mask
        }
    };
    let r = (0..size).find(|&r| rotate(element, r) == run)?;
    let immr = (size - r) % size;
    let imms = (!(size * 2 - 1) & 0x3F) | (ones - 1);
    Some((immr << 6) | imms)
}

/// `imm12` plus the `LSL #12` bit for an ADD/SUB immediate.
pub fn encode_add_imm(value: u32) -> Option<(u32, bool)> {
    if value < 1 << 12 {
        Some((value, false))
    } else if value & 0xFFF == 0 && value < 1 << 24 {
        Some((value >> 12, true))
    } else {
        None
    }
}

/// Instruction buffer with label support.
#[derive(Debug, Default)]
pub struct Assembler {
    code: Vec<u32>,
    labels: Vec<LabelState>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn emit(&mut self, insn: u32) {
        self.code.push(insn);
    }

    // ---- Labels ----

    pub fn new_label(&mut self) -> Label {
        self.labels.push(LabelState::default());
        Label(self.labels.len() - 1)
    }

    pub fn bind(&mut self, label: Label) {
        self.labels[label.0].bound = Some(self.code.len());
    }

    fn refer(&mut self, label: Label, insn: u32) {
        let site = self.code.len();
        self.labels[label.0].sites.push(site);
        self.emit(insn);
    }

    /// Patches every label reference and returns the little-endian machine code.
    pub fn finish(mut self) -> Result<Vec<u8>, AsmError> {
        for (index, label) in self.labels.iter().enumerate() {
            if label.sites.is_empty() {
                continue;
            }
            let target = label.bound.ok_or(AsmError::UnboundLabel(index))?;
            for &site in &label.sites {
                self.code[site] = patch(self.code[site], site, target)?;
            }
        }
        Ok(self.code.iter().flat_map(|insn| insn.to_le_bytes()).collect())
    }

    // ---- Moves ----

    pub fn movz(&mut self, rd: Reg, imm16: u16, shift: u32) {
        self.emit(0x5280_0000 | (shift / 16) << 21 | (imm16 as u32) << 5 | rd.bits());
    }

    pub fn movk(&mut self, rd: Reg, imm16: u16, shift: u32) {
        self.emit(0x7280_0000 | (shift / 16) << 21 | (imm16 as u32) << 5 | rd.bits());
    }

    fn movz_x(&mut self, rd: Reg, imm16: u16, shift: u32) {
        self.emit(0xD280_0000 | (shift / 16) << 21 | (imm16 as u32) << 5 | rd.bits());
    }

    fn movk_x(&mut self, rd: Reg, imm16: u16, shift: u32) {
        self.emit(0xF280_0000 | (shift / 16) << 21 | (imm16 as u32) << 5 | rd.bits());
    }

    /// Loads a 32-bit constant in at most two instructions.
    pub fn mov_imm32(&mut self, rd: Reg, value: u32) {
        let (lo, hi) = (value as u16, (value >> 16) as u16);
        if hi == 0 {
            self.movz(rd, lo, 0);
        } else if lo == 0 {
            self.movz(rd, hi, 16);
        } else if !value >> 16 == 0 {
            // movn: the high half is all ones.
            self.emit(0x1280_0000 | (!lo as u32) << 5 | rd.bits());
        } else if let Some(imm) = encode_bitmask(value) {
            self.emit(0x3200_0000 | imm << 10 | Reg::ZR.bits() << 5 | rd.bits());
        } else {
            self.movz(rd, lo, 0);
            self.movk(rd, hi, 16);
        }
    }

    pub fn mov_imm64(&mut self, rd: Reg, value: u64) {
        let parts = [0, 16, 32, 48].map(|shift| (shift, (value >> shift) as u16));
        let mut first = true;
        for (shift, part) in parts {
            if part == 0 {
                continue;
            }
            if first {
                self.movz_x(rd, part, shift);
                first = false;
            } else {
                self.movk_x(rd, part, shift);
            }
        }
        if first {
            self.movz_x(rd, 0, 0);
        }
    }

    pub fn mov(&mut self, rd: Reg, rm: Reg) {
        self.orr(rd, Reg::ZR, rm);
    }

    pub fn mov_x(&mut self, rd: Reg, rm: Reg) {
        self.emit(0xAA00_03E0 | rm.bits() << 16 | rd.bits());
    }

    // ---- Arithmetic ----

    fn rrr(&mut self, opcode: u32, rd: Reg, rn: Reg, rm: Reg) {
        self.emit(opcode | rm.bits() << 16 | rn.bits() << 5 | rd.bits());
    }

    pub fn add(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.rrr(0x0B00_0000, rd, rn, rm);
    }

    pub fn adds(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.rrr(0x2B00_0000, rd, rn, rm);
    }

    pub fn sub(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.rrr(0x4B00_0000, rd, rn, rm);
    }

    pub fn subs(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.rrr(0x6B00_0000, rd, rn, rm);
    }

    pub fn adc(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.rrr(0x1A00_0000, rd, rn, rm);
    }

    pub fn adcs(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.rrr(0x3A00_0000, rd, rn, rm);
    }

    pub fn sbc(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.rrr(0x5A00_0000, rd, rn, rm);
    }

    pub fn sbcs(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.rrr(0x7A00_0000, rd, rn, rm);
    }

    /// `add xd|sp, xn|sp, #imm`. Returns `false` if `imm` has no encoding.
    pub fn add_imm_x(&mut self, rd: Reg, rn: Reg, imm: u32) -> bool {
        let Some((imm12, shifted)) = encode_add_imm(imm) else {
            return false;
        };
        self.emit(0x9100_0000 | (shifted as u32) << 22 | imm12 << 10 | rn.bits() << 5 | rd.bits());
        true
    }

    // ---- Logical ----

    pub fn and(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.rrr(0x0A00_0000, rd, rn, rm);
    }

    pub fn orr(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.rrr(0x2A00_0000, rd, rn, rm);
    }

    pub fn eor(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.rrr(0x4A00_0000, rd, rn, rm);
    }

    pub fn bic(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.rrr(0x0A20_0000, rd, rn, rm);
    }

    fn orn(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.rrr(0x2A20_0000, rd, rn, rm);
    }

    pub fn mvn(&mut self, rd: Reg, rm: Reg) {
        self.orn(rd, Reg::ZR, rm);
    }

    /// `ands wzr, wn, wm`: N and Z from `rn & rm`, C and V cleared.
    pub fn tst(&mut self, rn: Reg, rm: Reg) {
        self.rrr(0x6A00_0000, Reg::ZR, rn, rm);
    }

    /// `and wd, wn, #imm`. Returns `false` if `imm` has no logical-immediate encoding.
    pub fn and_imm(&mut self, rd: Reg, rn: Reg, imm: u32) -> bool {
        let Some(bits) = encode_bitmask(imm) else {
            return false;
        };
        self.emit(0x1200_0000 | bits << 10 | rn.bits() << 5 | rd.bits());
        true
    }

    // ---- Shifts and bit operations ----

    fn bitfield(&mut self, opcode: u32, rd: Reg, rn: Reg, immr: u32, imms: u32) {
        self.emit(opcode | (immr & 0x3F) << 16 | (imms & 0x3F) << 10 | rn.bits() << 5 | rd.bits());
    }

    /// `amount` must be in `1..32`.
    pub fn lsl_imm(&mut self, rd: Reg, rn: Reg, amount: u32) {
        self.bitfield(0x5300_0000, rd, rn, (32 - amount) % 32, 31 - amount);
    }

    pub fn lsr_imm(&mut self, rd: Reg, rn: Reg, amount: u32) {
        self.bitfield(0x5300_0000, rd, rn, amount, 31);
    }

    pub fn asr_imm(&mut self, rd: Reg, rn: Reg, amount: u32) {
        self.bitfield(0x1300_0000, rd, rn, amount, 31);
    }

    /// `extr wd, wn, wn, #amount`.
    pub fn ror_imm(&mut self, rd: Reg, rn: Reg, amount: u32) {
        self.emit(0x1380_0000 | rn.bits() << 16 | (amount & 31) << 10 | rn.bits() << 5 | rd.bits());
    }

    /// `lsr xd, xn, #amount` on the 64-bit view.
    pub fn lsr_imm_x(&mut self, rd: Reg, rn: Reg, amount: u32) {
        self.bitfield(0xD340_0000, rd, rn, amount, 63);
    }

    pub fn mul(&mut self, rd: Reg, rn: Reg, rm: Reg) {
        self.emit(0x1B00_7C00 | rm.bits() << 16 | rn.bits() << 5 | rd.bits());
    }

    pub fn clz(&mut self, rd: Reg, rn: Reg) {
        self.emit(0x5AC0_1000 | rn.bits() << 5 | rd.bits());
    }

    // ---- Memory ----

    /// `ldr wt, [xn, #offset]`; `offset` must be a multiple of 4 below 16 KiB.
    pub fn ldr_w(&mut self, rt: Reg, rn: Reg, offset: u32) {
        debug_assert!(offset % 4 == 0 && offset < 4096 * 4);
        self.emit(0xB940_0000 | (offset / 4) << 10 | rn.bits() << 5 | rt.bits());
    }

    pub fn str_w(&mut self, rt: Reg, rn: Reg, offset: u32) {
        debug_assert!(offset % 4 == 0 && offset < 4096 * 4);
        self.emit(0xB900_0000 | (offset / 4) << 10 | rn.bits() << 5 | rt.bits());
    }

    fn pair(&mut self, opcode: u32, rt: Reg, rt2: Reg, rn: Reg, offset: i32) {
        debug_assert!(offset % 8 == 0 && (-512..512).contains(&offset));
        let imm7 = ((offset / 8) as u32) & 0x7F;
        self.emit(opcode | imm7 << 15 | rt2.bits() << 10 | rn.bits() << 5 | rt.bits());
    }

    /// `stp xt, xt2, [xn, #offset]!`
    pub fn stp_pre(&mut self, rt: Reg, rt2: Reg, rn: Reg, offset: i32) {
        self.pair(0xA980_0000, rt, rt2, rn, offset);
    }

    /// `stp xt, xt2, [xn, #offset]`
    pub fn stp(&mut self, rt: Reg, rt2: Reg, rn: Reg, offset: i32) {
        self.pair(0xA900_0000, rt, rt2, rn, offset);
    }

    /// `ldp xt, xt2, [xn, #offset]`
    pub fn ldp(&mut self, rt: Reg, rt2: Reg, rn: Reg, offset: i32) {
        self.pair(0xA940_0000, rt, rt2, rn, offset);
    }

    /// `ldp xt, xt2, [xn], #offset`
    pub fn ldp_post(&mut self, rt: Reg, rt2: Reg, rn: Reg, offset: i32) {
        self.pair(0xA8C0_0000, rt, rt2, rn, offset);
    }

    // ---- System ----

    pub fn mrs_nzcv(&mut self, rt: Reg) {
        self.emit(0xD53B_4200 | rt.bits());
    }

    pub fn msr_nzcv(&mut self, rt: Reg) {
        self.emit(0xD51B_4200 | rt.bits());
    }

    // ---- Control flow ----

    pub fn b(&mut self, label: Label) {
        self.refer(label, 0x1400_0000);
    }

    pub fn b_cond(&mut self, cond: A64Cond, label: Label) {
        self.refer(label, 0x5400_0000 | cond as u32);
    }

    pub fn blr(&mut self, rn: Reg) {
        self.emit(0xD63F_0000 | rn.bits() << 5);
    }

    pub fn ret(&mut self) {
        self.emit(0xD65F_03C0);
    }
}

/// Fills the displacement of the reference at word `site` so it reaches word `target`.
fn patch(insn: u32, site: usize, target: usize) -> Result<u32, AsmError> {
    let words = target as i64 - site as i64;
    let out_of_range = AsmError::OutOfRange { site, target };
    let fits = |bits: u32| (-(1i64 << (bits - 1))..(1i64 << (bits - 1))).contains(&words);

    if insn & 0x7C00_0000 == 0x1400_0000 {
        // b / bl
        if !fits(26) {
            return Err(out_of_range);
        }
        Ok(insn & 0xFC00_0000 | (words as u32 & 0x03FF_FFFF))
    } else {
        // b.cond
        debug_assert_eq!(insn & 0xFF00_0010, 0x5400_0000);
        if !fits(19) {
            return Err(out_of_range);
        }
        Ok(insn & !(0x7FFFF << 5) | (words as u32 & 0x7FFFF) << 5)
    }
}
