//! The typed memory surface a core executes against.

use std::ops::Range;

use crate::tcm::TcmLayout;

/// Who is performing an access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusKind {
    /// Instruction fetch.
    Code,
    /// Load/store issued by an instruction.
    Data,
    /// Peripheral-initiated access (DMA and friends); never routed through TCM.
    System,
}

/// Little-endian memory as seen by one core. Halfword and word accesses are passed already
/// aligned to their size.
pub trait Bus {
    fn read_u8(&mut self, kind: BusKind, addr: u32) -> u8;
    fn read_u16(&mut self, kind: BusKind, addr: u32) -> u16;
    fn read_u32(&mut self, kind: BusKind, addr: u32) -> u32;

    fn write_u8(&mut self, kind: BusKind, addr: u32, value: u8);
    fn write_u16(&mut self, kind: BusKind, addr: u32, value: u16);
    fn write_u32(&mut self, kind: BusKind, addr: u32, value: u32);

    /// Called when CP15 reconfigures the tightly-coupled memories.
    fn update_tcm(&mut self, _layout: &TcmLayout) {}

    #[inline]
    fn read<T: Width>(&mut self, kind: BusKind, addr: u32) -> T
    where
        Self: Sized,
    {
        T::read(self, kind, addr)
    }

    #[inline]
    fn write<T: Width>(&mut self, kind: BusKind, addr: u32, value: T)
    where
        Self: Sized,
    {
        T::write(self, kind, addr, value)
    }
}

/// An access width: `u8`, `u16` or `u32`.
pub trait Width: Copy + Into<u32> {
    const BYTES: u32;

    fn read<B: Bus + ?Sized>(bus: &mut B, kind: BusKind, addr: u32) -> Self;
    fn write<B: Bus + ?Sized>(bus: &mut B, kind: BusKind, addr: u32, value: Self);
    fn truncate(value: u32) -> Self;
}

macro_rules! impl_width {
    ($ty:ty, $bytes:literal, $read:ident, $write:ident) => {
        impl Width for $ty {
            const BYTES: u32 = $bytes;

            #[inline]
            fn read<B: Bus + ?Sized>(bus: &mut B, kind: BusKind, addr: u32) -> Self {
                bus.$read(kind, addr)
            }

            #[inline]
            fn write<B: Bus + ?Sized>(bus: &mut B, kind: BusKind, addr: u32, value: Self) {
                bus.$write(kind, addr, value)
            }

            #[inline]
            fn truncate(value: u32) -> Self {
                value as $ty
            }
        }
    };
}

impl_width!(u8, 1, read_u8, write_u8);
impl_width!(u16, 2, read_u16, write_u16);
impl_width!(u32, 4, read_u32, write_u32);

impl<B: Bus + ?Sized> Bus for &mut B {
    fn read_u8(&mut self, kind: BusKind, addr: u32) -> u8 {
        (**self).read_u8(kind, addr)
    }
    fn read_u16(&mut self, kind: BusKind, addr: u32) -> u16 {
        (**self).read_u16(kind, addr)
    }
    fn read_u32(&mut self, kind: BusKind, addr: u32) -> u32 {
        (**self).read_u32(kind, addr)
    }
    fn write_u8(&mut self, kind: BusKind, addr: u32, value: u8) {
        (**self).write_u8(kind, addr, value)
    }
    fn write_u16(&mut self, kind: BusKind, addr: u32, value: u16) {
        (**self).write_u16(kind, addr, value)
    }
    fn write_u32(&mut self, kind: BusKind, addr: u32, value: u32) {
        (**self).write_u32(kind, addr, value)
    }
    fn update_tcm(&mut self, layout: &TcmLayout) {
        (**self).update_tcm(layout)
    }
}

/// Power-of-two RAM mirrored across the whole address space.
///
/// An optional read-only window ignores writes, which keeps code fixed while randomized programs
/// scribble over the rest of memory.
#[derive(Debug, Clone)]
pub struct FlatMemory {
    bytes: Vec<u8>,
    mask: u32,
    read_only: Option<Range<u32>>,
}

impl FlatMemory {
    /// `size` is rounded up to a power of two.
    pub fn new(size: usize) -> Self {
        let size = size.max(4).next_power_of_two();
        Self {
            bytes: vec![0; size],
            mask: (size - 1) as u32,
            read_only: None,
        }
    }

    pub fn with_read_only(mut self, window: Range<u32>) -> Self {
        self.read_only = Some(window);
        self
    }

    /// Copies `data` in at `addr`, ignoring the read-only window.
    pub fn load(&mut self, addr: u32, data: &[u8]) {
        for (i, byte) in data.iter().enumerate() {
            let index = (addr.wrapping_add(i as u32) & self.mask) as usize;
            self.bytes[index] = *byte;
        }
    }

    pub fn load_words(&mut self, addr: u32, words: &[u32]) {
        for (i, word) in words.iter().enumerate() {
            self.load(addr.wrapping_add(4 * i as u32), &word.to_le_bytes());
        }
    }

    pub fn load_halfwords(&mut self, addr: u32, halves: &[u16]) {
        for (i, half) in halves.iter().enumerate() {
            self.load(addr.wrapping_add(2 * i as u32), &half.to_le_bytes());
        }
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    fn index(&self, addr: u32) -> usize {
        (addr & self.mask) as usize
    }

    #[inline]
    fn writable(&self, addr: u32) -> bool {
        self.read_only
            .as_ref()
            .map_or(true, |window| !window.contains(&(addr & self.mask)))
    }
}

impl Bus for FlatMemory {
    fn read_u8(&mut self, _kind: BusKind, addr: u32) -> u8 {
        self.bytes[self.index(addr)]
    }

    fn read_u16(&mut self, _kind: BusKind, addr: u32) -> u16 {
        let i = self.index(addr & !1);
        u16::from_le_bytes([self.bytes[i], self.bytes[i + 1]])
    }

    fn read_u32(&mut self, _kind: BusKind, addr: u32) -> u32 {
        let i = self.index(addr & !3);
        u32::from_le_bytes([
            self.bytes[i],
            self.bytes[i + 1],
            self.bytes[i + 2],
            self.bytes[i + 3],
        ])
    }

    fn write_u8(&mut self, _kind: BusKind, addr: u32, value: u8) {
        if self.writable(addr) {
            let i = self.index(addr);
            self.bytes[i] = value;
        }
    }

    fn write_u16(&mut self, _kind: BusKind, addr: u32, value: u16) {
        let addr = addr & !1;
        if self.writable(addr) {
            let i = self.index(addr);
            self.bytes[i..i + 2].copy_from_slice(&value.to_le_bytes());
        }
    }

    fn write_u32(&mut self, _kind: BusKind, addr: u32, value: u32) {
        let addr = addr & !3;
        if self.writable(addr) {
            let i = self.index(addr);
            self.bytes[i..i + 4].copy_from_slice(&value.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mirrors_and_is_little_endian() {
        let mut mem = FlatMemory::new(0x1000);
        mem.write_u32(BusKind::Data, 0x1004, 0x1122_3344);
        assert_eq!(mem.read_u32(BusKind::Data, 0x0004), 0x1122_3344);
        assert_eq!(mem.read_u8(BusKind::Data, 0x0004), 0x44);
        assert_eq!(mem.read::<u16>(BusKind::Code, 0x0006), 0x1122);
    }

    #[test]
    fn read_only_window_drops_writes() {
        let mut mem = FlatMemory::new(0x1000).with_read_only(0..0x100);
        mem.load_words(0, &[0xDEAD_BEEF]);
        mem.write::<u32>(BusKind::Data, 0, 0);
        mem.write::<u8>(BusKind::Data, 0x100, 0xAA);
        assert_eq!(mem.read_u32(BusKind::Data, 0), 0xDEAD_BEEF);
        assert_eq!(mem.read_u8(BusKind::Data, 0x100), 0xAA);
    }
}
