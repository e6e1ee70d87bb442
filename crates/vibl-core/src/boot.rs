//! Boot decision
//!
//! Runs once per reset, before anything but the clocks is set up, and decides
//! whether to start the installed application or stay in update mode.
//!
//! Update mode wins if any of these holds:
//! - the application asked for it through the [`PersistentFlag`]
//! - the application image does not look bootable
//! - the physical trigger (a key-matrix contact) is closed
//!
//! An interrupted update leaves a half-written image behind whose first word
//! is usually erased flash, so the next reset lands back in update mode
//! without any bookkeeping.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};

use crate::flag::{FlagStore, PersistentFlag};

/// Start of the application image on STM32F103 (after a 16 KiB bootloader)
pub const DEFAULT_APP_BASE: u32 = 0x0800_4000;

/// Time between driving the trigger row and sampling the column
pub const SETTLE_DELAY_US: u32 = 50;

/// Outcome of the boot decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootDecision {
    /// Jump to the installed application
    RunApplication,
    /// Stay in the bootloader and serve the flash protocol
    EnterUpdateMode,
}

/// Everything the decision was based on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootOutcome {
    /// The decision itself
    pub decision: BootDecision,
    /// Flag value read (and cleared) this reset
    pub flag: PersistentFlag,
    /// Whether the application image looked bootable
    pub image_valid: bool,
    /// Whether the physical trigger was closed
    pub trigger_fired: bool,
}

impl BootOutcome {
    /// Whether the insecure marker is latched
    pub fn insecure(&self) -> bool {
        self.flag == PersistentFlag::Insecure
    }
}

/// RAM address window an initial stack pointer must fall into
///
/// A stack pointer is accepted when `sp & mask == base`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RamWindow {
    /// Bits that must match
    pub mask: u32,
    /// Expected value of the masked bits
    pub base: u32,
}

impl RamWindow {
    /// SRAM of the STM32F1 family (up to 128 KiB at 0x2000_0000)
    pub const STM32F1: RamWindow = RamWindow {
        mask: 0x2FFE_0000,
        base: 0x2000_0000,
    };

    /// Check a candidate stack pointer
    pub fn contains(&self, sp: u32) -> bool {
        sp & self.mask == self.base
    }
}

impl Default for RamWindow {
    fn default() -> Self {
        Self::STM32F1
    }
}

/// Static configuration of the boot decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootConfig {
    /// Where a valid initial stack pointer must point
    pub ram: RamWindow,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            ram: RamWindow::default(),
        }
    }
}

/// The installed application's vector table
pub trait ApplicationImage {
    /// First word of the image: the initial stack pointer
    fn initial_stack_pointer(&self) -> u32;

    /// Second word of the image: the reset handler address
    fn reset_vector(&self) -> u32;
}

/// Application image read straight from memory
#[derive(Debug, Clone, Copy)]
pub struct MappedImage {
    base: *const u32,
}

impl MappedImage {
    /// Create a view of the vector table at `base`
    ///
    /// # Safety
    ///
    /// `base` must be word aligned and point to at least two readable words
    /// for as long as the value is used.
    pub const unsafe fn new(base: *const u32) -> Self {
        Self { base }
    }

    /// Base address of the image
    pub fn base(&self) -> *const u32 {
        self.base
    }
}

impl ApplicationImage for MappedImage {
    fn initial_stack_pointer(&self) -> u32 {
        // SAFETY: guaranteed readable by the contract of `new`
        unsafe { core::ptr::read_volatile(self.base) }
    }

    fn reset_vector(&self) -> u32 {
        // SAFETY: guaranteed readable by the contract of `new`
        unsafe { core::ptr::read_volatile(self.base.add(1)) }
    }
}

/// Physical "stay in bootloader" input
pub trait UpdateTrigger {
    /// Sample the trigger; `true` forces update mode
    fn fired(&mut self) -> bool;
}

/// Build without a physical trigger
#[derive(Debug, Clone, Copy, Default)]
pub struct NoTrigger;

impl UpdateTrigger for NoTrigger {
    fn fired(&mut self) -> bool {
        false
    }
}

/// Key-matrix contact used as trigger
///
/// The row is driven high, and after a short settle time the column is
/// sampled. The column has a pull-down, so it only reads high while the key
/// connects the two.
pub struct MatrixTrigger<O, I, D> {
    row: O,
    column: I,
    delay: D,
}

impl<O, I, D> MatrixTrigger<O, I, D>
where
    O: OutputPin,
    I: InputPin,
    D: DelayNs,
{
    /// Create a trigger from a row output, a pulled-down column input and a delay
    pub fn new(row: O, column: I, delay: D) -> Self {
        Self { row, column, delay }
    }

    /// Release the pins and delay
    pub fn release(self) -> (O, I, D) {
        (self.row, self.column, self.delay)
    }
}

impl<O, I, D> UpdateTrigger for MatrixTrigger<O, I, D>
where
    O: OutputPin,
    I: InputPin,
    D: DelayNs,
{
    fn fired(&mut self) -> bool {
        if self.row.set_high().is_err() {
            log::warn!("boot: failed to drive trigger row");
            return false;
        }
        self.delay.delay_us(SETTLE_DELAY_US);

        let closed = match self.column.is_high() {
            Ok(level) => level,
            Err(_) => {
                log::warn!("boot: failed to sample trigger column");
                false
            }
        };

        if self.row.set_low().is_err() {
            log::warn!("boot: failed to release trigger row");
        }
        closed
    }
}

/// Computes the [`BootDecision`] once per reset
#[derive(Debug, Clone, Copy, Default)]
pub struct BootDecisionEngine {
    config: BootConfig,
}

impl BootDecisionEngine {
    /// Create an engine with the given configuration
    pub fn new(config: BootConfig) -> Self {
        Self { config }
    }

    /// Check whether an initial stack pointer points into RAM
    pub fn stack_pointer_is_valid(&self, sp: u32) -> bool {
        self.config.ram.contains(sp)
    }

    /// Decide how to boot
    ///
    /// The flag is consumed first, so a pending update request is cleared even
    /// when update mode would have been entered anyway.
    pub fn decide<S, A, T>(&self, store: &mut S, image: &A, trigger: Option<&mut T>) -> BootOutcome
    where
        S: FlagStore,
        A: ApplicationImage,
        T: UpdateTrigger,
    {
        let flag = store.get();
        let image_valid = self.stack_pointer_is_valid(image.initial_stack_pointer());
        let trigger_fired = trigger.map(|t| t.fired()).unwrap_or(false);

        let decision = if flag == PersistentFlag::EnterUpdateMode || !image_valid || trigger_fired {
            BootDecision::EnterUpdateMode
        } else {
            BootDecision::RunApplication
        };

        log::debug!(
            "boot: flag={:?} image_valid={} trigger={} -> {:?}",
            flag,
            image_valid,
            trigger_fired,
            decision
        );

        BootOutcome {
            decision,
            flag,
            image_valid,
            trigger_fired,
        }
    }
}
