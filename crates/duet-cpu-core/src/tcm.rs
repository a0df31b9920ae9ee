//! Tightly-coupled memory routing.
//!
//! The ARMv5 core has two small on-die RAMs in front of the system bus: ITCM (serves instruction
//! fetches and data accesses) and DTCM (data only). Each has a programmable window and separate
//! read/write enables, all driven by CP15.

use crate::bus::{Bus, BusKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcmConfig {
    pub base: u32,
    /// Window size in bytes. Zero disables the window.
    pub size: u32,
    pub read_enabled: bool,
    pub write_enabled: bool,
}

impl TcmConfig {
    #[inline]
    pub fn contains(&self, addr: u32) -> bool {
        addr.wrapping_sub(self.base) < self.size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TcmLayout {
    pub itcm: TcmConfig,
    pub dtcm: TcmConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Itcm,
    Dtcm,
}

/// Wraps a bus with ITCM and DTCM storage. Inside a window, accesses mirror every
/// `physical size` bytes.
#[derive(Debug, Clone)]
pub struct TcmBus<B> {
    inner: B,
    layout: TcmLayout,
    itcm: Vec<u8>,
    dtcm: Vec<u8>,
}

impl<B: Bus> TcmBus<B> {
    /// Physical sizes must be powers of two.
    pub fn new(inner: B, itcm_bytes: usize, dtcm_bytes: usize) -> Self {
        debug_assert!(itcm_bytes.is_power_of_two() && dtcm_bytes.is_power_of_two());
        Self {
            inner,
            layout: TcmLayout::default(),
            itcm: vec![0; itcm_bytes],
            dtcm: vec![0; dtcm_bytes],
        }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    pub fn inner_mut(&mut self) -> &mut B {
        &mut self.inner
    }

    pub fn layout(&self) -> &TcmLayout {
        &self.layout
    }

    fn route(&self, kind: BusKind, addr: u32, write: bool) -> Option<Region> {
        let enabled = |config: &TcmConfig| {
            config.contains(addr)
                && if write {
                    config.write_enabled
                } else {
                    config.read_enabled
                }
        };
        match kind {
            BusKind::System => None,
            BusKind::Code => enabled(&self.layout.itcm).then_some(Region::Itcm),
            BusKind::Data => {
                if enabled(&self.layout.itcm) {
                    Some(Region::Itcm)
                } else if enabled(&self.layout.dtcm) {
                    Some(Region::Dtcm)
                } else {
                    None
                }
            }
        }
    }

    fn storage(&mut self, region: Region, addr: u32) -> (&mut [u8], usize) {
        let (base, bytes) = match region {
            Region::Itcm => (self.layout.itcm.base, &mut self.itcm),
            Region::Dtcm => (self.layout.dtcm.base, &mut self.dtcm),
        };
        let offset = (addr.wrapping_sub(base) as usize) & (bytes.len() - 1);
        (bytes.as_mut_slice(), offset)
    }

    fn read_bytes<const N: usize>(&mut self, region: Region, addr: u32) -> [u8; N] {
        let (bytes, offset) = self.storage(region, addr);
        let mut out = [0; N];
        out.copy_from_slice(&bytes[offset..offset + N]);
        out
    }

    fn write_bytes(&mut self, region: Region, addr: u32, data: &[u8]) {
        let (bytes, offset) = self.storage(region, addr);
        bytes[offset..offset + data.len()].copy_from_slice(data);
    }
}

impl<B: Bus> Bus for TcmBus<B> {
    fn read_u8(&mut self, kind: BusKind, addr: u32) -> u8 {
        match self.route(kind, addr, false) {
            Some(region) => self.read_bytes::<1>(region, addr)[0],
            None => self.inner.read_u8(kind, addr),
        }
    }

    fn read_u16(&mut self, kind: BusKind, addr: u32) -> u16 {
        match self.route(kind, addr, false) {
            Some(region) => u16::from_le_bytes(self.read_bytes(region, addr)),
            None => self.inner.read_u16(kind, addr),
        }
    }

    fn read_u32(&mut self, kind: BusKind, addr: u32) -> u32 {
        match self.route(kind, addr, false) {
            Some(region) => u32::from_le_bytes(self.read_bytes(region, addr)),
            None => self.inner.read_u32(kind, addr),
        }
    }

    fn write_u8(&mut self, kind: BusKind, addr: u32, value: u8) {
        match self.route(kind, addr, true) {
            Some(region) => self.write_bytes(region, addr, &[value]),
            None => self.inner.write_u8(kind, addr, value),
        }
    }

    fn write_u16(&mut self, kind: BusKind, addr: u32, value: u16) {
        match self.route(kind, addr, true) {
            Some(region) => self.write_bytes(region, addr, &value.to_le_bytes()),
            None => self.inner.write_u16(kind, addr, value),
        }
    }

    fn write_u32(&mut self, kind: BusKind, addr: u32, value: u32) {
        match self.route(kind, addr, true) {
            Some(region) => self.write_bytes(region, addr, &value.to_le_bytes()),
            None => self.inner.write_u32(kind, addr, value),
        }
    }

    fn update_tcm(&mut self, layout: &TcmLayout) {
        self.layout = *layout;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::FlatMemory;

    fn bus() -> TcmBus<FlatMemory> {
        let mut bus = TcmBus::new(FlatMemory::new(0x1_0000), 0x100, 0x100);
        bus.update_tcm(&TcmLayout {
            itcm: TcmConfig {
                base: 0,
                size: 0x1000,
                read_enabled: true,
                write_enabled: true,
            },
            dtcm: TcmConfig {
                base: 0x8000,
                size: 0x100,
                read_enabled: true,
                write_enabled: true,
            },
        });
        bus
    }

    #[test]
    fn itcm_serves_code_and_data_and_mirrors() {
        let mut bus = bus();
        bus.write_u32(BusKind::Data, 0x10, 0xAABB_CCDD);
        assert_eq!(bus.read_u32(BusKind::Code, 0x110), 0xAABB_CCDD);
        assert_eq!(bus.inner_mut().read_u32(BusKind::Data, 0x10), 0);
    }

    #[test]
    fn dtcm_is_data_only_and_system_bypasses() {
        let mut bus = bus();
        bus.write_u16(BusKind::Data, 0x8002, 0x1234);
        assert_eq!(bus.read_u16(BusKind::Data, 0x8002), 0x1234);
        assert_eq!(bus.read_u16(BusKind::Code, 0x8002), 0);
        assert_eq!(bus.read_u16(BusKind::System, 0x8002), 0);
    }

    #[test]
    fn disabled_reads_fall_through() {
        let mut bus = bus();
        let mut layout = *bus.layout();
        layout.itcm.read_enabled = false;
        bus.write_u8(BusKind::Data, 0x20, 0x55);
        bus.update_tcm(&layout);
        assert_eq!(bus.read_u8(BusKind::Data, 0x20), 0);
    }
}
