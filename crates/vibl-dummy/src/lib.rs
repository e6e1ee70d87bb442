//! vibl-dummy - Simulated bootloader for testing
//!
//! This crate runs the real [`FlashServer`](vibl_core::server::FlashServer)
//! state machine against flash kept in memory and exposes it through the host
//! transport traits, so the whole update sequence can be exercised without
//! hardware.

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "alloc")]
use alloc::vec;
#[cfg(feature = "alloc")]
use alloc::vec::Vec;

use vibl_core::error::{Error, Result};
use vibl_core::protocol::{Revision, Uid, PROTOCOL_VERSION};
use vibl_core::server::{FlashMemory, FlashRegion, ServerConfig};

/// Configuration for a simulated bootloader
#[derive(Debug, Clone, Copy)]
pub struct DummyConfig {
    /// Protocol revision served
    pub revision: Revision,
    /// Application flash region
    pub region: FlashRegion,
    /// UID answered to GET_UID
    pub uid: Uid,
    /// Version answered to IDENT
    pub version: u8,
    /// Whether the insecure marker is latched
    pub insecure: bool,
}

impl Default for DummyConfig {
    fn default() -> Self {
        Self {
            revision: Revision::VIAL,
            region: FlashRegion::STM32F103X8,
            uid: Uid::WILDCARD,
            version: PROTOCOL_VERSION,
            insecure: false,
        }
    }
}

impl DummyConfig {
    /// Server configuration for a device built from this config
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            uid: self.uid,
            version: self.version,
            insecure: self.insecure,
            ..ServerConfig::new(self.revision, self.region)
        }
    }
}

/// Internal flash emulated in memory
///
/// Behaves like NOR flash: erase sets bytes to 0xFF, programming can only
/// clear bits, and both need the flash to be unlocked.
#[cfg(feature = "alloc")]
#[derive(Debug, Clone)]
pub struct RamFlash {
    region: FlashRegion,
    data: Vec<u8>,
    locked: bool,
    erases: usize,
}

#[cfg(feature = "alloc")]
impl RamFlash {
    /// Create an erased, locked flash covering `region`
    pub fn new(region: FlashRegion) -> Self {
        Self {
            region,
            data: vec![0xFF; region.size as usize],
            locked: true,
            erases: 0,
        }
    }

    /// Flash contents, starting at the region base
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Whether the flash is locked
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Number of erase operations performed
    pub fn erases(&self) -> usize {
        self.erases
    }

    fn range(&self, addr: u32, len: usize) -> Result<core::ops::Range<usize>> {
        let start = addr
            .checked_sub(self.region.base)
            .ok_or(Error::AddressOutOfBounds)? as usize;
        let end = start + len;
        if end > self.data.len() {
            return Err(Error::AddressOutOfBounds);
        }
        Ok(start..end)
    }
}

#[cfg(feature = "alloc")]
impl FlashMemory for RamFlash {
    fn unlock(&mut self) {
        self.locked = false;
    }

    fn lock(&mut self) {
        self.locked = true;
    }

    fn erase_block(&mut self, addr: u32) -> Result<()> {
        if self.locked {
            return Err(Error::FlashLocked);
        }
        if addr % self.region.erase_block != 0 {
            return Err(Error::InvalidAlignment);
        }
        let range = self.range(addr, self.region.erase_block as usize)?;
        self.data[range].fill(0xFF);
        self.erases += 1;
        Ok(())
    }

    fn program(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        if self.locked {
            return Err(Error::FlashLocked);
        }
        let range = self.range(addr, data.len())?;
        for (dst, &src) in self.data[range].iter_mut().zip(data) {
            *dst &= src;
        }
        Ok(())
    }
}

#[cfg(feature = "std")]
mod bus;

#[cfg(feature = "std")]
pub use bus::{DummyBus, DummyDevice, DummyHandle, Event};

#[cfg(test)]
mod tests {
    use super::*;

    const REGION: FlashRegion = FlashRegion {
        base: 0x0800_4000,
        size: 4096,
        erase_block: 1024,
    };

    #[test]
    fn test_starts_erased_and_locked() {
        let flash = RamFlash::new(REGION);
        assert!(flash.is_locked());
        assert!(flash.data().iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_locked_flash_refuses_writes() {
        let mut flash = RamFlash::new(REGION);
        assert_eq!(flash.erase_block(REGION.base), Err(Error::FlashLocked));
        assert_eq!(flash.program(REGION.base, &[0]), Err(Error::FlashLocked));
    }

    #[test]
    fn test_program_only_clears_bits() {
        let mut flash = RamFlash::new(REGION);
        flash.unlock();
        flash.program(REGION.base + 4, &[0x0F]).unwrap();
        flash.program(REGION.base + 4, &[0xF3]).unwrap();
        assert_eq!(flash.data()[4], 0x03);

        flash.erase_block(REGION.base).unwrap();
        assert_eq!(flash.data()[4], 0xFF);
        assert_eq!(flash.erases(), 1);
    }

    #[test]
    fn test_bounds_and_alignment() {
        let mut flash = RamFlash::new(REGION);
        flash.unlock();
        assert_eq!(flash.program(REGION.base - 1, &[0]), Err(Error::AddressOutOfBounds));
        assert_eq!(
            flash.program(REGION.base + 4095, &[0, 0]),
            Err(Error::AddressOutOfBounds)
        );
        assert_eq!(flash.erase_block(REGION.base + 10), Err(Error::InvalidAlignment));
        assert_eq!(
            flash.erase_block(REGION.base + 4096),
            Err(Error::AddressOutOfBounds)
        );
    }
}
