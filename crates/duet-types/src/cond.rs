/// The 4-bit condition field of ARM instructions (and Thumb conditional branches).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Cond {
    Eq = 0,
    Ne = 1,
    Cs = 2,
    Cc = 3,
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
    Nv = 15,
}

impl Cond {
    pub const ALL: [Cond; 16] = [
        Cond::Eq,
        Cond::Ne,
        Cond::Cs,
        Cond::Cc,
        Cond::Mi,
        Cond::Pl,
        Cond::Vs,
        Cond::Vc,
        Cond::Hi,
        Cond::Ls,
        Cond::Ge,
        Cond::Lt,
        Cond::Gt,
        Cond::Le,
        Cond::Al,
        Cond::Nv,
    ];

    #[inline]
    pub const fn from_bits(bits: u32) -> Self {
        Self::ALL[(bits & 0xF) as usize]
    }

    #[inline]
    pub const fn bits(self) -> u32 {
        self as u32
    }

    /// Evaluates the condition directly from the NZCV nibble (N in bit 3).
    ///
    /// `Nv` never passes here; whether an `Nv`-encoded instruction executes is an architecture
    /// question answered by [`crate::Arch::executes_nv`].
    pub const fn holds(self, nzcv: u32) -> bool {
        let n = nzcv & 8 != 0;
        let z = nzcv & 4 != 0;
        let c = nzcv & 2 != 0;
        let v = nzcv & 1 != 0;
        match self {
            Cond::Eq => z,
            Cond::Ne => !z,
            Cond::Cs => c,
            Cond::Cc => !c,
            Cond::Mi => n,
            Cond::Pl => !n,
            Cond::Vs => v,
            Cond::Vc => !v,
            Cond::Hi => c && !z,
            Cond::Ls => !c || z,
            Cond::Ge => n == v,
            Cond::Lt => n != v,
            Cond::Gt => !z && n == v,
            Cond::Le => z || n != v,
            Cond::Al => true,
            Cond::Nv => false,
        }
    }
}

/// Precomputed condition × NZCV lookup covering `Eq..=Al`.
#[derive(Debug, Clone)]
pub struct ConditionTable {
    table: [[bool; 16]; 15],
}

pub static CONDITION_TABLE: ConditionTable = ConditionTable::new();

impl ConditionTable {
    pub const fn new() -> Self {
        let mut table = [[false; 16]; 15];
        let mut cond = 0;
        while cond < 15 {
            let mut nzcv = 0;
            while nzcv < 16 {
                table[cond][nzcv] = Cond::from_bits(cond as u32).holds(nzcv as u32);
                nzcv += 1;
            }
            cond += 1;
        }
        Self { table }
    }

    /// Looks up `cond` against the NZCV nibble. `Nv` always reports `false`.
    #[inline]
    pub fn passes(&self, cond: Cond, nzcv: u32) -> bool {
        match cond {
            Cond::Nv => false,
            _ => self.table[cond as usize][(nzcv & 0xF) as usize],
        }
    }
}

impl Default for ConditionTable {
    fn default() -> Self {
        Self::new()
    }
}
