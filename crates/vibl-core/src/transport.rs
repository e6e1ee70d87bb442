//! Host-side HID transport abstraction
//!
//! The flashing client only needs to push output reports and pull input
//! reports. Backends (`vibl-nusb` for real hardware, `vibl-dummy` for the
//! simulator) implement these traits.

use std::string::String;
use std::time::Duration;
use std::vec::Vec;

use crate::protocol::DEVICE_MARKER;

/// Errors raised by a transport backend
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Enumeration failed
    #[error("USB enumeration failed: {0}")]
    Enumerate(String),

    /// The device could not be opened
    #[error("failed to open device: {0}")]
    Open(String),

    /// A transfer failed
    #[error("USB transfer failed: {0}")]
    Io(String),

    /// No input report arrived in time
    #[error("timeout waiting for device reply")]
    Timeout,

    /// The device is gone
    #[error("device disconnected")]
    Disconnected,
}

/// A device seen during enumeration
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceInfo {
    /// Backend-specific path, used for log messages and to reopen
    pub path: String,
    /// USB vendor ID
    pub vendor_id: u16,
    /// USB product ID
    pub product_id: u16,
    /// Serial number string, carries the bootloader marker
    pub serial: Option<String>,
    /// Product string
    pub product: Option<String>,
}

impl DeviceInfo {
    /// Whether the identity string carries the bootloader marker
    pub fn has_marker(&self) -> bool {
        self.serial
            .as_deref()
            .is_some_and(|s| s.contains(DEVICE_MARKER))
    }
}

/// An open HID device
///
/// Frames written with [`write_report`](Self::write_report) start with the
/// report-ID byte. Reports returned by [`read_report`](Self::read_report) do
/// not.
pub trait HidTransport {
    /// Send one output report, returning the number of bytes accepted
    fn write_report(&mut self, frame: &[u8]) -> Result<usize, TransportError>;

    /// Receive one input report into `buf`, returning its length
    fn read_report(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError>;
}

impl<T: HidTransport + ?Sized> HidTransport for &mut T {
    fn write_report(&mut self, frame: &[u8]) -> Result<usize, TransportError> {
        (**self).write_report(frame)
    }

    fn read_report(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        (**self).read_report(buf, timeout)
    }
}

impl<T: HidTransport + ?Sized> HidTransport for std::boxed::Box<T> {
    fn write_report(&mut self, frame: &[u8]) -> Result<usize, TransportError> {
        (**self).write_report(frame)
    }

    fn read_report(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize, TransportError> {
        (**self).read_report(buf, timeout)
    }
}

/// Finds and opens HID devices
pub trait HidEnumerator {
    /// Handle type produced by [`open`](Self::open)
    type Device: HidTransport;

    /// List candidate devices
    fn enumerate(&self) -> Result<Vec<DeviceInfo>, TransportError>;

    /// Open one of the listed devices
    fn open(&self, info: &DeviceInfo) -> Result<Self::Device, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::string::ToString;

    #[test]
    fn test_marker_match() {
        let mut info = DeviceInfo {
            serial: Some("vibl:d4f8159c:0042".to_string()),
            ..Default::default()
        };
        assert!(info.has_marker());

        info.serial = Some("vibl:00000000".to_string());
        assert!(!info.has_marker());

        info.serial = None;
        assert!(!info.has_marker());
    }
}
