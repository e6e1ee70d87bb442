//! vibl-core - Core library for the vibl USB-HID bootloader
//!
//! This crate holds everything that is shared between the bootloader firmware
//! and the host flashing tool. The device half is `no_std` and allocation
//! free; the host half is only compiled with the `std` feature.
//!
//! # Device side
//!
//! - [`flag`] - cross-reset flag kept in a backup register
//! - [`boot`] - the per-reset boot decision
//! - [`server`] - the HID command state machine that writes flash
//!
//! # Shared
//!
//! - [`protocol`] - protocol revisions, wire frames and identifiers
//! - [`package`] - the versioned firmware container and its hash check
//!
//! # Host side (`std`)
//!
//! - [`transport`] - HID transport and enumeration traits
//! - [`client`] - handshake, paged transfer with retry, reboot
//! - [`discovery`] - picking the right board when several are plugged in
//!
//! # Features
//!
//! - `std` - Enable the host-side modules (includes `alloc`)
//! - `alloc` - Enable building firmware containers in memory
//!
//! # Example
//!
//! ```ignore
//! use vibl_core::boot::{BootDecision, BootDecisionEngine, BootConfig, NoTrigger};
//!
//! let engine = BootDecisionEngine::new(BootConfig::default());
//! let outcome = engine.decide(&mut store, &image, None::<&mut NoTrigger>);
//! if outcome.decision == BootDecision::RunApplication {
//!     // jump to the application
//! }
//! ```

#![no_std]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

#[cfg(feature = "alloc")]
extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod boot;
pub mod error;
pub mod flag;
pub mod package;
pub mod protocol;
pub mod server;

#[cfg(feature = "std")]
pub mod client;
#[cfg(feature = "std")]
pub mod discovery;
#[cfg(feature = "std")]
pub mod transport;

pub use error::{Error, Result};
