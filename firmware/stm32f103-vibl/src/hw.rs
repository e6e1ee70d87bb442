//! Board glue between the STM32F103 peripherals and vibl-core
//!
//! The boot decision runs on the reset clock before the HAL takes over, so
//! the backup register and trigger pins are driven through the PAC directly.

use core::convert::Infallible;

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{ErrorType, InputPin, OutputPin};
use stm32f1xx_hal::flash::{self, FlashWriter};
use stm32f1xx_hal::pac::{BKP, GPIOB, PWR, RCC};
use vibl_core::error::{Error, Result};
use vibl_core::flag::BackupRegister;
use vibl_core::server::FlashMemory;

/// Core clock out of reset (HSI)
const RESET_CLOCK_MHZ: u32 = 8;

/// Enable the clocks the boot decision needs: PWR and BKP for the flag,
/// GPIOB for the trigger
pub fn early_init() {
    // SAFETY: single threaded, runs before anything else touches RCC
    unsafe {
        (*RCC::ptr())
            .apb1enr
            .modify(|_, w| w.pwren().set_bit().bkpen().set_bit());
        (*RCC::ptr()).apb2enr.modify(|_, w| w.iopben().set_bit());
    }
}

/// Undo [`early_init`] and the trigger pin setup before starting the application
pub fn early_deinit() {
    // SAFETY: the bootloader is done with these peripherals
    unsafe {
        (*GPIOB::ptr()).crh.reset();
        (*RCC::ptr()).apb1enr.reset();
        (*RCC::ptr()).apb2enr.reset();
    }
}

/// `BKP_DR10`, write protected through `PWR_CR.DBP`
pub struct Dr10;

impl BackupRegister for Dr10 {
    fn read(&self) -> u16 {
        // SAFETY: read-only access to a backup data register
        unsafe { (*BKP::ptr()).dr[9].read().d().bits() }
    }

    fn write(&mut self, value: u16) {
        // SAFETY: only this type writes DR10
        unsafe { (*BKP::ptr()).dr[9].write(|w| w.d().bits(value)) }
    }

    fn set_write_protection(&mut self, protected: bool) {
        // SAFETY: DBP only gates backup domain writes
        unsafe { (*PWR::ptr()).cr.modify(|_, w| w.dbp().bit(!protected)) }
    }
}

/// PB12, driven while sampling the trigger
pub struct TriggerRow;

impl TriggerRow {
    /// Configure PB12 as 2 MHz push-pull output, initially low
    pub fn new() -> Self {
        // SAFETY: PB12 is reserved for the trigger until `early_deinit`
        unsafe {
            (*GPIOB::ptr()).bsrr.write(|w| w.br12().set_bit());
            (*GPIOB::ptr())
                .crh
                .modify(|_, w| w.mode12().output2().cnf12().push_pull());
        }
        Self
    }
}

impl ErrorType for TriggerRow {
    type Error = Infallible;
}

impl OutputPin for TriggerRow {
    fn set_low(&mut self) -> core::result::Result<(), Infallible> {
        // SAFETY: atomic BSRR write to our own pin
        unsafe { (*GPIOB::ptr()).bsrr.write(|w| w.br12().set_bit()) };
        Ok(())
    }

    fn set_high(&mut self) -> core::result::Result<(), Infallible> {
        // SAFETY: atomic BSRR write to our own pin
        unsafe { (*GPIOB::ptr()).bsrr.write(|w| w.bs12().set_bit()) };
        Ok(())
    }
}

/// PB13, pulled down, reads high while the trigger key is pressed
pub struct TriggerColumn;

impl TriggerColumn {
    /// Configure PB13 as input with pull-down
    pub fn new() -> Self {
        // SAFETY: PB13 is reserved for the trigger until `early_deinit`
        unsafe {
            // ODR = 0 selects the pull-down
            (*GPIOB::ptr()).bsrr.write(|w| w.br13().set_bit());
            // CNF = 0b10: input with pull-up/pull-down
            (*GPIOB::ptr())
                .crh
                .modify(|_, w| w.mode13().input().cnf13().bits(0b10));
        }
        Self
    }
}

impl ErrorType for TriggerColumn {
    type Error = Infallible;
}

impl InputPin for TriggerColumn {
    fn is_high(&mut self) -> core::result::Result<bool, Infallible> {
        // SAFETY: read-only access
        Ok(unsafe { (*GPIOB::ptr()).idr.read().idr13().bit_is_set() })
    }

    fn is_low(&mut self) -> core::result::Result<bool, Infallible> {
        self.is_high().map(|high| !high)
    }
}

/// Busy-wait delay calibrated for the reset clock
pub struct CycleDelay;

impl DelayNs for CycleDelay {
    fn delay_ns(&mut self, ns: u32) {
        let cycles = (ns as u64 * RESET_CLOCK_MHZ as u64).div_ceil(1000);
        cortex_m::asm::delay(cycles.min(u32::MAX as u64) as u32);
    }
}

/// Internal flash through the HAL writer
///
/// Addresses are absolute; the writer takes offsets from the start of flash.
pub struct HalFlash<'a> {
    writer: FlashWriter<'a>,
    unlocked: bool,
}

impl<'a> HalFlash<'a> {
    /// Wrap a flash writer
    pub fn new(mut writer: FlashWriter<'a>) -> Self {
        // Erase verification is unreliable on this HAL version
        writer.change_verification(false);
        Self {
            writer,
            unlocked: false,
        }
    }

    fn offset(addr: u32) -> Result<u32> {
        addr.checked_sub(flash::FLASH_START)
            .ok_or(Error::AddressOutOfBounds)
    }
}

impl FlashMemory for HalFlash<'_> {
    fn unlock(&mut self) {
        self.unlocked = true;
    }

    fn lock(&mut self) {
        self.unlocked = false;
    }

    fn erase_block(&mut self, addr: u32) -> Result<()> {
        if !self.unlocked {
            return Err(Error::FlashLocked);
        }
        self.writer
            .page_erase(Self::offset(addr)?)
            .map_err(|e| match e {
                flash::Error::AddressLargerThanFlash => Error::AddressOutOfBounds,
                flash::Error::AddressMisaligned => Error::InvalidAlignment,
                _ => Error::EraseFailed { addr },
            })
    }

    fn program(&mut self, addr: u32, data: &[u8]) -> Result<()> {
        if !self.unlocked {
            return Err(Error::FlashLocked);
        }
        self.writer
            .write(Self::offset(addr)?, data)
            .map_err(|e| match e {
                flash::Error::AddressLargerThanFlash => Error::AddressOutOfBounds,
                flash::Error::AddressMisaligned | flash::Error::LengthNotMultiple2 => {
                    Error::InvalidAlignment
                }
                _ => Error::ProgramFailed { addr },
            })
    }
}
