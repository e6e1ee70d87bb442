//! USB HID plumbing: report descriptor, serial string, report reassembly

use vibl_core::protocol::{Revision, Uid, DEVICE_MARKER, MAX_REPORT_SIZE, UID_LEN};

/// Interrupt endpoint packet size
pub const PACKET_SIZE: usize = 64;

/// Vendor-defined HID report descriptor with one input and one output report
/// of `N` bytes and no report ID
pub const fn report_descriptor<const N: u8>() -> [u8; 27] {
    [
        0x06, 0x00, 0xFF, // Usage Page (Vendor Defined 0xFF00)
        0x09, 0x01, // Usage (0x01)
        0xA1, 0x01, // Collection (Application)
        0x15, 0x00, //   Logical Minimum (0)
        0x26, 0xFF, 0x00, //   Logical Maximum (255)
        0x75, 0x08, //   Report Size (8)
        0x95, N, //   Report Count (N)
        0x09, 0x01, //   Usage (0x01)
        0x81, 0x02, //   Input (Data, Var, Abs)
        0x95, N, //   Report Count (N)
        0x09, 0x01, //   Usage (0x01)
        0x91, 0x02, //   Output (Data, Var, Abs)
        0xC0, // End Collection
    ]
}

/// Length of the serial number string
pub const SERIAL_LEN: usize = DEVICE_MARKER.len() + 1 + 2 * UID_LEN;

/// Serial number: the discovery marker followed by the board UID in hex
pub fn serial_number(uid: &Uid, buf: &mut [u8; SERIAL_LEN]) -> &str {
    const HEX: &[u8; 16] = b"0123456789abcdef";

    let (marker, rest) = buf.split_at_mut(DEVICE_MARKER.len());
    marker.copy_from_slice(DEVICE_MARKER.as_bytes());
    rest[0] = b':';
    for (chunk, byte) in rest[1..].chunks_exact_mut(2).zip(uid.as_bytes()) {
        chunk[0] = HEX[(byte >> 4) as usize];
        chunk[1] = HEX[(byte & 0xF) as usize];
    }

    // Only ASCII was written
    core::str::from_utf8(buf).unwrap_or(DEVICE_MARKER)
}

/// Joins endpoint packets into output reports
///
/// Reports larger than the endpoint (the legacy 128-byte report) arrive as
/// several packets.
pub struct ReportAssembler {
    buf: [u8; MAX_REPORT_SIZE],
    fill: usize,
    size: usize,
}

impl ReportAssembler {
    /// Assembler for the reports of `revision`
    pub fn new(revision: &Revision) -> Self {
        Self {
            buf: [0; MAX_REPORT_SIZE],
            fill: 0,
            size: revision.report_size,
        }
    }

    /// Add a packet; returns the report once it is complete
    pub fn push(&mut self, packet: &[u8]) -> Option<&[u8]> {
        let take = packet.len().min(self.size - self.fill);
        self.buf[self.fill..self.fill + take].copy_from_slice(&packet[..take]);
        self.fill += take;

        if self.fill < self.size {
            return None;
        }
        self.fill = 0;
        Some(&self.buf[..self.size])
    }
}
