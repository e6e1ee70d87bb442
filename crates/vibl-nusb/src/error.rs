//! Error types for the nusb backend

use std::fmt;

use vibl_core::transport::TransportError;

/// Result type for nusb backend operations
pub type Result<T> = std::result::Result<T, NusbError>;

/// Errors that can occur when talking to a bootloader over nusb
#[derive(Debug)]
pub enum NusbError {
    /// Listing USB devices failed
    EnumerationFailed(String),
    /// Device vanished between enumeration and open
    DeviceNotFound(String),
    /// Failed to open device
    OpenFailed(String),
    /// No HID interface with an interrupt IN endpoint
    NoHidInterface,
    /// Failed to claim interface
    ClaimFailed(String),
    /// USB transfer failed
    TransferFailed(String),
    /// No data within the timeout
    Timeout,
    /// Device is gone
    Disconnected,
}

impl fmt::Display for NusbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NusbError::EnumerationFailed(msg) => write!(f, "Failed to list USB devices: {}", msg),
            NusbError::DeviceNotFound(path) => write!(f, "Device {} not found", path),
            NusbError::OpenFailed(msg) => write!(f, "Failed to open device: {}", msg),
            NusbError::NoHidInterface => {
                write!(f, "Device has no HID interface with an interrupt IN endpoint")
            }
            NusbError::ClaimFailed(msg) => write!(f, "Failed to claim interface: {}", msg),
            NusbError::TransferFailed(msg) => write!(f, "USB transfer failed: {}", msg),
            NusbError::Timeout => write!(f, "Timeout during USB transfer"),
            NusbError::Disconnected => write!(f, "Device disconnected"),
        }
    }
}

impl std::error::Error for NusbError {}

impl From<nusb::transfer::TransferError> for NusbError {
    fn from(e: nusb::transfer::TransferError) -> Self {
        use nusb::transfer::TransferError;
        match e {
            TransferError::Cancelled => NusbError::Timeout,
            TransferError::Disconnected => NusbError::Disconnected,
            other => NusbError::TransferFailed(other.to_string()),
        }
    }
}

impl From<NusbError> for TransportError {
    fn from(e: NusbError) -> Self {
        match e {
            NusbError::EnumerationFailed(msg) => TransportError::Enumerate(msg),
            NusbError::Timeout => TransportError::Timeout,
            NusbError::Disconnected => TransportError::Disconnected,
            NusbError::TransferFailed(msg) => TransportError::Io(msg),
            other => TransportError::Open(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_mapping() {
        assert_eq!(TransportError::from(NusbError::Timeout), TransportError::Timeout);
        assert_eq!(
            TransportError::from(NusbError::Disconnected),
            TransportError::Disconnected
        );
        assert_eq!(
            TransportError::from(NusbError::TransferFailed("stall".to_string())),
            TransportError::Io("stall".to_string())
        );
        assert!(matches!(
            TransportError::from(NusbError::NoHidInterface),
            TransportError::Open(_)
        ));
    }

    #[test]
    fn test_cancelled_transfer_is_a_timeout() {
        use nusb::transfer::TransferError;
        assert!(matches!(
            NusbError::from(TransferError::Cancelled),
            NusbError::Timeout
        ));
        assert!(matches!(
            NusbError::from(TransferError::Disconnected),
            NusbError::Disconnected
        ));
    }
}
