//! Error types for vibl-core
//!
//! This module provides a no_std compatible error type used by the device-side
//! code (flash server, flash backends).

use core::fmt;

/// Core error type - no_std compatible, Copy for efficiency
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    // Flash errors
    /// Erase of the block starting at `addr` failed
    EraseFailed {
        /// Block start address
        addr: u32,
    },
    /// Programming the page at `addr` failed
    ProgramFailed {
        /// Page start address
        addr: u32,
    },
    /// Flash is still locked for writing
    FlashLocked,

    // Address/size errors
    /// Operation would touch memory outside the application region
    AddressOutOfBounds,
    /// Operation requires aligned address or size
    InvalidAlignment,

    // Protocol errors
    /// Report length does not match the protocol revision
    InvalidReportLength {
        /// Expected report length
        expected: usize,
        /// Received report length
        actual: usize,
    },
    /// Command is not part of the active protocol revision
    UnsupportedCommand(u8),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EraseFailed { addr } => {
                write!(f, "erase failed for block at 0x{:08X}", addr)
            }
            Self::ProgramFailed { addr } => {
                write!(f, "program failed for page at 0x{:08X}", addr)
            }
            Self::FlashLocked => write!(f, "flash is locked"),
            Self::AddressOutOfBounds => write!(f, "address out of bounds"),
            Self::InvalidAlignment => write!(f, "invalid alignment"),
            Self::InvalidReportLength { expected, actual } => write!(
                f,
                "invalid report length: expected {} bytes, got {}",
                expected, actual
            ),
            Self::UnsupportedCommand(op) => write!(f, "unsupported command 0x{:02X}", op),
        }
    }
}

#[cfg(feature = "std")]
impl std::error::Error for Error {}

/// Result type alias using the core Error type
pub type Result<T> = core::result::Result<T, Error>;
