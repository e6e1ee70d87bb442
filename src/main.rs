//! vibl-flash - Firmware flasher for the vibl USB-HID bootloader
//!
//! Looks for a keyboard sitting in bootloader mode, checks that it is the
//! board the firmware package was built for, writes the image page by page
//! and reboots into the new firmware.
//!
//! # Packages
//!
//! A firmware package is the application image prefixed with a header naming
//! the target board UID and the SHA-256 of the image. `vibl-pack` creates
//! them. A plain binary is still accepted but skips both checks.

mod cli;
mod commands;

use clap::Parser;
use cli::Cli;
use std::process::ExitCode;
use vibl_core::client::FlashError;

fn main() -> ExitCode {
    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    // Set log level based on verbosity
    match cli.verbose {
        0 => {} // default (info)
        1 => log::set_max_level(log::LevelFilter::Debug),
        _ => log::set_max_level(log::LevelFilter::Trace),
    }

    exit_code(commands::flash::run(&cli))
}

fn exit_code(result: Result<(), FlashError>) -> ExitCode {
    match result {
        Ok(()) => {
            println!("Ok!");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code(Ok(())), ExitCode::SUCCESS);
        assert_eq!(exit_code(Err(FlashError::DeviceNotFound)), ExitCode::FAILURE);
        assert_eq!(exit_code(Err(FlashError::Cancelled)), ExitCode::FAILURE);
    }
}
