//! vibl-nusb - USB HID backend for the vibl flashing tool
//!
//! This crate talks to vibl bootloaders through [nusb], a pure-Rust USB
//! library, so no hidapi or libusb installation is needed. It implements the
//! [`HidEnumerator`](vibl_core::transport::HidEnumerator) and
//! [`HidTransport`](vibl_core::transport::HidTransport) traits from
//! `vibl-core`.
//!
//! # Device matching
//!
//! Devices are listed by USB VID:PID (`1209:2301` for the Vial protocol,
//! `1209:BABE` for the legacy one). Telling bootloaders apart from
//! application firmware that shares the IDs is left to the discovery code,
//! which checks the marker in the serial number.
//!
//! On Linux the HID interface is usually bound to the kernel `usbhid`
//! driver; it is detached when the device is opened.
//!
//! # Example
//!
//! ```no_run
//! use vibl_core::discovery::{discover, DiscoveryOptions};
//! use vibl_core::protocol::{Revision, Uid};
//! use vibl_nusb::NusbEnumerator;
//!
//! let revision = Revision::VIAL;
//! let usb = NusbEnumerator::new(&revision);
//! let session = discover(&usb, &Uid::WILDCARD, &DiscoveryOptions::new(revision))?;
//! println!("device UID: {:?}", session.uid());
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

#![cfg_attr(not(feature = "std"), no_std)]

#[cfg(feature = "std")]
mod device;
#[cfg(feature = "std")]
mod error;

#[cfg(feature = "std")]
pub use device::{HidDevice, NusbEnumerator};
#[cfg(feature = "std")]
pub use error::{NusbError, Result};
