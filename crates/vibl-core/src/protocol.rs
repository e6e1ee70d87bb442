//! Flash protocol constants and types
//!
//! Every message is one HID report. On the host side the report is prefixed
//! with a report-ID byte (always 0), so a 64-byte report is a 65-byte write.
//!
//! Command reports start with a family tag followed by an opcode byte and
//! the opcode's payload, padded with zeros to the report size. While the
//! device is receiving pages, reports carry raw page data and no tag.
//!
//! Opcode numbers, report size and page size belong to a protocol
//! [`Revision`]. One revision is chosen per build (device) or per run (host)
//! and used end to end.

use bitflags::bitflags;
use core::fmt;

/// Largest report payload of any revision
pub const MAX_REPORT_SIZE: usize = 128;

/// Largest page of any revision
pub const MAX_PAGE_SIZE: usize = 1024;

/// Report ID byte prepended to every host-side write
pub const REPORT_ID: u8 = 0;

/// Protocol versions this implementation understands
pub const SUPPORTED_VERSIONS: core::ops::RangeInclusive<u8> = 0..=1;

/// Version reported by the bootloader in IDENT replies
pub const PROTOCOL_VERSION: u8 = 1;

/// First version whose bootloader answers FLASH and reports transfer status
pub const STATUS_VERSION: u8 = 1;

/// Marker in the USB serial number of vibl devices
pub const DEVICE_MARKER: &str = "vibl:d4f8159c";

/// pid.codes VID shared by both revisions
pub const USB_VID: u16 = 0x1209;
/// PID of the Vial revision bootloader
pub const USB_PID_VIAL: u16 = 0x2301;
/// PID of the legacy STM32 HID bootloader
pub const USB_PID_LEGACY: u16 = 0xBABE;

/// Length of a device UID
pub const UID_LEN: usize = 8;

/// Opaque 8-byte board identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Uid(pub [u8; UID_LEN]);

impl Uid {
    /// UID matching any device
    pub const WILDCARD: Uid = Uid([0xFF; UID_LEN]);

    /// Whether this is the "any device" sentinel
    pub fn is_wildcard(&self) -> bool {
        *self == Self::WILDCARD
    }

    /// Whether a device reporting `device` satisfies this target
    pub fn accepts(&self, device: &Uid) -> bool {
        self.is_wildcard() || self == device
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; UID_LEN] {
        &self.0
    }

    /// Parse 16 hex digits (`"any"` for the wildcard)
    pub fn parse_hex(s: &str) -> Option<Self> {
        if s.eq_ignore_ascii_case("any") {
            return Some(Self::WILDCARD);
        }
        let s = s.strip_prefix("0x").unwrap_or(s);
        if s.len() != UID_LEN * 2 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return None;
        }
        let mut out = [0u8; UID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            let pair = s.get(i * 2..i * 2 + 2)?;
            *byte = u8::from_str_radix(pair, 16).ok()?;
        }
        Some(Self(out))
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

bitflags! {
    /// Capability bits in the IDENT reply
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Features: u8 {
        /// GET_UID is answered
        const UID      = 1 << 0;
        /// The insecure marker is latched in the backup register
        const INSECURE = 1 << 1;
    }
}

/// Decoded IDENT reply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ident {
    /// Protocol version byte
    pub version: u8,
    /// Capability bits (always empty for version 0)
    pub features: Features,
}

impl Ident {
    /// Decode from a reply report
    ///
    /// Version 0 devices do not fill in the feature byte.
    pub fn from_reply(reply: &[u8]) -> Option<Self> {
        let version = *reply.first()?;
        let features = if version >= 1 {
            Features::from_bits_truncate(reply.get(1).copied().unwrap_or(0))
        } else {
            Features::empty()
        };
        Some(Self { version, features })
    }

    /// Encode into the start of a reply report
    pub fn encode(&self, reply: &mut [u8]) {
        reply[0] = self.version;
        reply[1] = self.features.bits();
    }

    /// Whether the device sends [`TransferStatus`] replies
    pub fn reports_status(&self) -> bool {
        self.version >= STATUS_VERSION
    }
}

/// Status byte a version 1 bootloader sends during a transfer
///
/// `Accepted` or `Refused` answers FLASH. `Complete` or `Failed` follows the
/// last page of an accepted transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TransferStatus {
    /// Pages may follow
    Accepted = 0x00,
    /// The image does not fit, no pages must follow
    Refused = 0x01,
    /// Every page was written
    Complete = 0x02,
    /// A page failed to write and the rest of the transfer was dropped
    Failed = 0x03,
}

impl TransferStatus {
    /// Decode from a reply report
    pub fn from_reply(reply: &[u8]) -> Option<Self> {
        match reply.first()? {
            0x00 => Some(Self::Accepted),
            0x01 => Some(Self::Refused),
            0x02 => Some(Self::Complete),
            0x03 => Some(Self::Failed),
            _ => None,
        }
    }

    /// Encode into the start of a reply report
    pub fn encode(self, reply: &mut [u8]) {
        reply[0] = self as u8;
    }
}

/// Command opcode, independent of its numbering in a revision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Query protocol version and features
    Ident,
    /// Query the board UID
    GetUid,
    /// Start a transfer of `pages` pages
    Flash,
    /// Reset the device
    Reboot,
}

/// One protocol revision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Revision {
    /// Short name used on the command line
    pub name: &'static str,
    /// Family tag at the start of every command report
    pub tag: &'static [u8],
    /// IDENT opcode, if the revision has one
    pub ident: Option<u8>,
    /// GET_UID opcode, if the revision has one
    pub get_uid: Option<u8>,
    /// FLASH opcode
    pub flash: u8,
    /// REBOOT opcode
    pub reboot: u8,
    /// Report payload size (without the report-ID byte)
    pub report_size: usize,
    /// Bytes written to flash per page
    pub page_size: usize,
    /// USB product ID the bootloader enumerates with
    pub usb_pid: u16,
}

impl Revision {
    /// Vial bootloader: 64-byte reports, one report per page
    pub const VIAL: Revision = Revision {
        name: "vial",
        tag: b"VC",
        ident: Some(0x00),
        get_uid: Some(0x01),
        flash: 0x02,
        reboot: 0x03,
        report_size: 64,
        page_size: 64,
        usb_pid: USB_PID_VIAL,
    };

    /// Original STM32 HID bootloader: 128-byte reports, 1 KiB pages
    pub const LEGACY: Revision = Revision {
        name: "legacy",
        tag: b"BTLDCMD",
        ident: None,
        get_uid: None,
        flash: 0x01,
        reboot: 0x02,
        report_size: 128,
        page_size: 1024,
        usb_pid: USB_PID_LEGACY,
    };

    /// All known revisions
    pub const ALL: &'static [Revision] = &[Revision::VIAL, Revision::LEGACY];

    /// Look up a revision by name
    pub fn by_name(name: &str) -> Option<Revision> {
        Self::ALL.iter().copied().find(|r| r.name.eq_ignore_ascii_case(name))
    }

    /// Size of a host-side write: report-ID byte plus report
    pub const fn frame_size(&self) -> usize {
        self.report_size + 1
    }

    /// Number of reports making up one page
    pub const fn reports_per_page(&self) -> usize {
        self.page_size / self.report_size
    }

    /// Opcode of a command, if this revision has it
    pub fn opcode(&self, command: Command) -> Option<u8> {
        match command {
            Command::Ident => self.ident,
            Command::GetUid => self.get_uid,
            Command::Flash => Some(self.flash),
            Command::Reboot => Some(self.reboot),
        }
    }

    /// Map an opcode back to a command
    pub fn command(&self, opcode: u8) -> Option<Command> {
        [Command::Ident, Command::GetUid, Command::Flash, Command::Reboot]
            .into_iter()
            .find(|&c| self.opcode(c) == Some(opcode))
    }

    /// Split a received command report into opcode and payload
    ///
    /// Returns `None` when the report does not start with the family tag.
    pub fn parse_command<'a>(&self, report: &'a [u8]) -> Option<(u8, &'a [u8])> {
        let rest = report.strip_prefix(self.tag)?;
        let (&opcode, payload) = rest.split_first()?;
        Some((opcode, payload))
    }

    /// Encode a host-side command frame into `frame`
    ///
    /// `frame` must be `frame_size()` bytes long. Returns `None` if the
    /// revision has no such command.
    pub fn encode_command(&self, command: Command, payload: &[u8], frame: &mut [u8]) -> Option<()> {
        let opcode = self.opcode(command)?;
        frame.fill(0);
        frame[0] = REPORT_ID;
        let tag_end = 1 + self.tag.len();
        frame[1..tag_end].copy_from_slice(self.tag);
        frame[tag_end] = opcode;
        frame[tag_end + 1..tag_end + 1 + payload.len()].copy_from_slice(payload);
        Some(())
    }

    /// Encode a host-side data frame carrying one report worth of page data
    pub fn encode_data(&self, data: &[u8], frame: &mut [u8]) {
        frame.fill(0);
        frame[0] = REPORT_ID;
        frame[1..1 + data.len()].copy_from_slice(data);
    }
}

impl Default for Revision {
    fn default() -> Self {
        Self::VIAL
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}-byte reports, {}-byte pages)",
            self.name, self.report_size, self.page_size
        )
    }
}

/// Number of pages needed for `size` bytes
pub fn page_count(size: usize, page_size: usize) -> usize {
    size.div_ceil(page_size)
}
