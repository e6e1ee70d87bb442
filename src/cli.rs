//! CLI argument parsing

use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use vibl_core::protocol::Revision;

/// Bootloader protocol revision
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Vial bootloader: version and UID checks, 64-byte pages
    Vial,
    /// Original STM32 HID bootloader: no checks, 1 KiB pages
    Legacy,
}

impl Protocol {
    /// Wire parameters of this revision
    pub fn revision(self) -> Revision {
        match self {
            Protocol::Vial => Revision::VIAL,
            Protocol::Legacy => Revision::LEGACY,
        }
    }
}

/// How to reach the device
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    /// USB HID through nusb
    Nusb,
    /// Simulated bootloader kept in memory
    Dummy,
}

impl Backend {
    /// Name as given on the command line
    pub fn name(self) -> &'static str {
        match self {
            Backend::Nusb => "nusb",
            Backend::Dummy => "dummy",
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "vibl-flash")]
#[command(author, version, about = "Flash firmware over the vibl USB-HID bootloader", long_about = None)]
pub struct Cli {
    /// Verbosity level (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Bootloader protocol revision
    #[arg(long, value_enum, default_value_t = Protocol::Vial)]
    pub protocol: Protocol,

    /// Device backend
    #[arg(long, value_enum, default_value_t = Backend::Nusb)]
    pub backend: Backend,

    /// Stop looking for the bootloader after this many seconds (0 = scan once)
    ///
    /// Without this option the tool waits until a matching device shows up.
    #[arg(long, value_name = "SECONDS")]
    pub wait: Option<u64>,

    /// Firmware package (VIALFW00/VIALFW01) or raw binary
    pub firmware: PathBuf,
}
