//! Firmware container
//!
//! A versioned package is a 64-byte header followed by the raw application
//! image:
//!
//! | Offset | Size | Field                                   |
//! |--------|------|-----------------------------------------|
//! | 0      | 8    | magic, `VIALFW00` or `VIALFW01`         |
//! | 8      | 8    | target UID (all `0xFF` = any device)    |
//! | 16     | 32   | SHA-256 of the payload                  |
//! | 48     | 16   | reserved, zero                          |
//! | 64     | ...  | payload                                 |
//!
//! Anything that does not start with a known magic is taken as a bare
//! binary: no UID pinning and no hash to check.

#[cfg(feature = "alloc")]
use alloc::vec::Vec;

use sha2::{Digest, Sha256};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::protocol::{page_count, Uid, UID_LEN};

/// Magic of the first package version
pub const MAGIC_V0: [u8; 8] = *b"VIALFW00";
/// Magic of the current package version
pub const MAGIC_V1: [u8; 8] = *b"VIALFW01";

/// Size of the package header
pub const HEADER_LEN: usize = 64;

/// Length of the payload hash
pub const HASH_LEN: usize = 32;

/// SHA-256 of `bytes`
pub fn digest(bytes: &[u8]) -> [u8; HASH_LEN] {
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&Sha256::digest(bytes));
    out
}

/// On-disk header layout
#[derive(FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct PackageHeader {
    magic: [u8; 8],
    uid: [u8; UID_LEN],
    hash: [u8; HASH_LEN],
    reserved: [u8; 16],
}

const _: () = assert!(core::mem::size_of::<PackageHeader>() == HEADER_LEN);

/// Errors found while loading a package
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
pub enum PackageError {
    /// Nothing to flash
    #[cfg_attr(feature = "std", error("firmware file is empty"))]
    Empty,

    /// Known magic but not even a full header
    #[cfg_attr(
        feature = "std",
        error("firmware package truncated: {len} bytes, header alone is 64")
    )]
    Truncated {
        /// File length
        len: usize,
    },

    /// Payload does not match the embedded hash
    #[cfg_attr(
        feature = "std",
        error("firmware hash mismatch, the package is corrupt")
    )]
    Integrity,
}

/// Kind of container
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageFormat {
    /// Header with UID and hash
    Versioned {
        /// Magic found in the header
        magic: [u8; 8],
    },
    /// Bare binary
    Legacy,
}

/// A parsed firmware package borrowing its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwarePackage<'a> {
    format: PackageFormat,
    target: Uid,
    hash: Option<[u8; HASH_LEN]>,
    payload: &'a [u8],
}

impl<'a> FirmwarePackage<'a> {
    /// Split a file into header fields and payload
    ///
    /// This only checks structure; call [`verify`](Self::verify) (or use
    /// [`load`](Self::load)) before talking to a device.
    pub fn parse(bytes: &'a [u8]) -> Result<Self, PackageError> {
        let is_versioned = bytes
            .get(..8)
            .map(|m| m == MAGIC_V0 || m == MAGIC_V1)
            .unwrap_or(false);

        let package = if is_versioned {
            let (header, payload) = PackageHeader::ref_from_prefix(bytes)
                .map_err(|_| PackageError::Truncated { len: bytes.len() })?;
            FirmwarePackage {
                format: PackageFormat::Versioned {
                    magic: header.magic,
                },
                target: Uid(header.uid),
                hash: Some(header.hash),
                payload,
            }
        } else {
            FirmwarePackage {
                format: PackageFormat::Legacy,
                target: Uid::WILDCARD,
                hash: None,
                payload: bytes,
            }
        };

        if package.payload.is_empty() {
            return Err(PackageError::Empty);
        }
        Ok(package)
    }

    /// Check the payload against the embedded hash
    ///
    /// Always succeeds for legacy binaries.
    pub fn verify(&self) -> Result<(), PackageError> {
        match self.hash {
            Some(expected) if digest(self.payload) != expected => Err(PackageError::Integrity),
            _ => Ok(()),
        }
    }

    /// Parse and verify
    pub fn load(bytes: &'a [u8]) -> Result<Self, PackageError> {
        let package = Self::parse(bytes)?;
        package.verify()?;
        Ok(package)
    }

    /// Container kind
    pub fn format(&self) -> PackageFormat {
        self.format
    }

    /// Whether this is a bare binary
    pub fn is_legacy(&self) -> bool {
        self.format == PackageFormat::Legacy
    }

    /// Target UID (wildcard for legacy binaries)
    pub fn target(&self) -> Uid {
        self.target
    }

    /// Whether the package only fits one specific board
    pub fn pins_target(&self) -> bool {
        !self.target.is_wildcard()
    }

    /// Embedded payload hash
    pub fn hash(&self) -> Option<&[u8; HASH_LEN]> {
        self.hash.as_ref()
    }

    /// Application image
    pub fn payload(&self) -> &'a [u8] {
        self.payload
    }

    /// Pages needed to transfer the payload
    pub fn page_count(&self, page_size: usize) -> usize {
        page_count(self.payload.len(), page_size)
    }
}

/// Wrap a raw image into a `VIALFW01` package
#[cfg(feature = "alloc")]
pub fn build(target: Uid, payload: &[u8]) -> Vec<u8> {
    let header = PackageHeader {
        magic: MAGIC_V1,
        uid: target.0,
        hash: digest(payload),
        reserved: [0; 16],
    };

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(payload);
    out
}

#[cfg(all(test, feature = "alloc"))]
mod tests {
    use super::*;
    use alloc::vec;

    fn sample_payload() -> Vec<u8> {
        (0..1000u32).map(|i| (i * 7 + 3) as u8).collect()
    }

    #[test]
    fn test_versioned_round_trip() {
        let payload = sample_payload();
        let uid = Uid([1, 2, 3, 4, 5, 6, 7, 8]);
        let file = build(uid, &payload);
        assert_eq!(file.len(), HEADER_LEN + payload.len());
        assert_eq!(&file[..8], b"VIALFW01");

        let pkg = FirmwarePackage::load(&file).unwrap();
        assert_eq!(pkg.format(), PackageFormat::Versioned { magic: MAGIC_V1 });
        assert_eq!(pkg.target(), uid);
        assert!(pkg.pins_target());
        assert_eq!(pkg.payload(), &payload[..]);
        assert_eq!(pkg.hash(), Some(&digest(&payload)));
    }

    #[test]
    fn test_every_single_bit_flip_is_detected() {
        let payload = sample_payload();
        let file = build(Uid::WILDCARD, &payload);

        for byte in (HEADER_LEN..file.len()).step_by(37) {
            for bit in 0..8 {
                let mut corrupt = file.clone();
                corrupt[byte] ^= 1 << bit;
                let pkg = FirmwarePackage::parse(&corrupt).unwrap();
                assert_eq!(pkg.verify(), Err(PackageError::Integrity));
            }
        }
    }

    #[test]
    fn test_corrupt_hash_field_is_detected() {
        let mut file = build(Uid::WILDCARD, &sample_payload());
        file[20] ^= 0x80;
        assert_eq!(FirmwarePackage::load(&file), Err(PackageError::Integrity));
    }

    #[test]
    fn test_v0_magic_is_recognized() {
        let payload = vec![0xAB; 100];
        let mut file = build(Uid::WILDCARD, &payload);
        file[..8].copy_from_slice(&MAGIC_V0);
        let pkg = FirmwarePackage::load(&file).unwrap();
        assert!(!pkg.is_legacy());
        assert!(!pkg.pins_target());
    }

    #[test]
    fn test_unknown_magic_is_legacy() {
        let raw = vec![0x00, 0x50, 0x00, 0x20, 0x01, 0x11, 0x00, 0x08, 0xAA];
        let pkg = FirmwarePackage::load(&raw).unwrap();
        assert!(pkg.is_legacy());
        assert_eq!(pkg.target(), Uid::WILDCARD);
        assert!(pkg.hash().is_none());
        assert_eq!(pkg.payload(), &raw[..]);
    }

    #[test]
    fn test_truncated_and_empty() {
        let mut short = MAGIC_V1.to_vec();
        short.extend_from_slice(&[0; 10]);
        assert_eq!(
            FirmwarePackage::parse(&short),
            Err(PackageError::Truncated { len: 18 })
        );

        let header_only = build(Uid::WILDCARD, &[]);
        assert_eq!(FirmwarePackage::parse(&header_only), Err(PackageError::Empty));
        assert_eq!(FirmwarePackage::parse(&[]), Err(PackageError::Empty));
    }

    #[test]
    fn test_page_count() {
        let file = build(Uid::WILDCARD, &[1; 129]);
        let pkg = FirmwarePackage::load(&file).unwrap();
        assert_eq!(pkg.page_count(64), 3);
        assert_eq!(pkg.page_count(1024), 1);
    }
}
