//! Host-side flashing client
//!
//! A [`FlashSession`] drives one open device through the update sequence:
//!
//! 1. `IDENT` - check the protocol version (skipped by revisions without it)
//! 2. `GET_UID` - compare against the package target
//! 3. `FLASH(pages)` followed by the page data, one report at a time.
//!    Version 1 devices answer FLASH with a [`TransferStatus`] and send
//!    another one after the last page.
//! 4. `REBOOT`
//!
//! Every outbound frame goes through [`write_frame`], which applies the
//! [`RetryPolicy`].

use std::time::Duration;
use std::vec;
use std::vec::Vec;

use crate::package::{FirmwarePackage, PackageError};
use crate::protocol::{
    Command, Features, Ident, Revision, TransferStatus, Uid, SUPPORTED_VERSIONS, UID_LEN,
};
use crate::transport::{HidTransport, TransportError};

/// How long to wait for a reply report
pub const REPLY_TIMEOUT: Duration = Duration::from_millis(1000);

/// Errors that abort a flashing session
#[derive(Debug, thiserror::Error)]
pub enum FlashError {
    /// Transport failure outside the retry loop (reads, open)
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// Device speaks a protocol version this tool does not know
    #[error(
        "device reports protocol version {0}, this tool supports {min} to {max}",
        min = SUPPORTED_VERSIONS.start(),
        max = SUPPORTED_VERSIONS.end()
    )]
    ProtocolVersion(u8),

    /// Device is not the board the package was built for
    #[error("device UID {device} does not match package target {target}")]
    UidMismatch {
        /// UID pinned in the package
        target: Uid,
        /// UID reported by the device
        device: Uid,
    },

    /// Package pins a UID but the device cannot report one
    #[error("package is built for UID {target} but the device cannot report its UID")]
    UidUnavailable {
        /// UID pinned in the package
        target: Uid,
    },

    /// The device answered with something unparseable
    #[error("malformed {0} reply from device")]
    InvalidReply(&'static str),

    /// Firmware package is unusable
    #[error(transparent)]
    Package(#[from] PackageError),

    /// Firmware file could not be read
    #[error("cannot read {path}: {source}")]
    File {
        /// Path given on the command line
        path: std::path::PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The transport accepted only part of a frame
    #[error("partial write: {written} of {expected} bytes accepted")]
    PartialWrite {
        /// Bytes accepted
        written: usize,
        /// Frame length
        expected: usize,
    },

    /// Every retry of a frame failed
    #[error("write failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Attempts made
        attempts: u32,
        /// Error from the final attempt
        last: TransportError,
    },

    /// Payload needs more pages than `FLASH` can announce
    #[error("payload of {size} bytes needs {pages} pages, at most 65535 are addressable")]
    PayloadTooLarge {
        /// Payload length
        size: usize,
        /// Pages required
        pages: usize,
    },

    /// The device refused the transfer
    #[error("device refused a transfer of {pages} pages, the image does not fit")]
    TransferRefused {
        /// Pages announced
        pages: usize,
    },

    /// The device reported a failed page write
    #[error("device failed to write the image")]
    TransferFailed,

    /// No bootloader device was found
    #[error("no bootloader device found")]
    DeviceNotFound,

    /// Device search was cancelled
    #[error("device search cancelled")]
    Cancelled,
}

/// Result type for host operations
pub type Result<T> = std::result::Result<T, FlashError>;

/// Retry behaviour for outbound frames
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per frame, including the first
    pub attempts: u32,
    /// Sleep after each failed attempt
    pub backoff: Duration,
}

impl RetryPolicy {
    /// Default attempt count
    pub const DEFAULT_ATTEMPTS: u32 = 20;
    /// Default sleep between attempts
    pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(100);

    /// Create a policy
    pub const fn new(attempts: u32, backoff: Duration) -> Self {
        Self { attempts, backoff }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(Self::DEFAULT_ATTEMPTS, Self::DEFAULT_BACKOFF)
    }
}

/// Write one frame, retrying transport errors
///
/// A short write is not retried: the device may already have consumed part of
/// the report, so resending it would desynchronise the page stream.
pub fn write_frame<T: HidTransport + ?Sized>(
    transport: &mut T,
    frame: &[u8],
    policy: &RetryPolicy,
) -> Result<()> {
    let attempts = policy.attempts.max(1);
    let mut last = TransportError::Timeout;

    for attempt in 1..=attempts {
        match transport.write_report(frame) {
            Ok(n) if n >= frame.len() => return Ok(()),
            Ok(n) => {
                return Err(FlashError::PartialWrite {
                    written: n,
                    expected: frame.len(),
                })
            }
            Err(e) => {
                log::debug!("Write attempt {}/{} failed: {}", attempt, attempts, e);
                last = e;
                if attempt < attempts {
                    std::thread::sleep(policy.backoff);
                }
            }
        }
    }

    Err(FlashError::RetriesExhausted { attempts, last })
}

/// Receives transfer progress
pub trait FlashProgress {
    /// Transfer is about to start
    fn start(&mut self, _total_bytes: usize) {}

    /// `done` of `total` bytes have been sent
    fn update(&mut self, done: usize, total: usize);

    /// Transfer completed
    fn finish(&mut self) {}
}

/// Progress sink that discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl FlashProgress for NoProgress {
    fn update(&mut self, _done: usize, _total: usize) {}
}

/// Whole-number percentage of `done` over `total`
pub fn percent(done: usize, total: usize) -> u8 {
    if total == 0 {
        return 100;
    }
    (done.min(total) * 100 / total) as u8
}

/// One open device going through the update sequence
pub struct FlashSession<T: HidTransport> {
    device: T,
    revision: Revision,
    policy: RetryPolicy,
    timeout: Duration,
    frame: Vec<u8>,
    handshaken: bool,
    ident: Option<Ident>,
    uid: Option<Uid>,
    pages_written: usize,
    pages_total: usize,
}

impl<T: HidTransport> FlashSession<T> {
    /// Wrap an open device
    pub fn new(device: T, revision: Revision) -> Self {
        Self {
            device,
            revision,
            policy: RetryPolicy::default(),
            timeout: REPLY_TIMEOUT,
            frame: vec![0; revision.frame_size()],
            handshaken: false,
            ident: None,
            uid: None,
            pages_written: 0,
            pages_total: 0,
        }
    }

    /// Replace the write retry policy
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the reply timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Protocol revision in use
    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// IDENT reply, once the handshake has run
    pub fn ident(&self) -> Option<Ident> {
        self.ident
    }

    /// Device UID, once the handshake has run
    pub fn uid(&self) -> Option<Uid> {
        self.uid
    }

    /// Pages sent by the last [`flash`](Self::flash)
    pub fn pages_written(&self) -> usize {
        self.pages_written
    }

    /// Pages announced by the last [`flash`](Self::flash)
    pub fn pages_total(&self) -> usize {
        self.pages_total
    }

    /// Borrow the underlying device
    pub fn device(&self) -> &T {
        &self.device
    }

    /// Give the device back
    pub fn into_inner(self) -> T {
        self.device
    }

    /// Query version and UID
    ///
    /// With `quiet` set, results are logged at debug level only; discovery
    /// uses this while probing candidates.
    pub fn handshake(&mut self, quiet: bool) -> Result<()> {
        let level = if quiet {
            log::Level::Debug
        } else {
            log::Level::Info
        };

        if self.revision.opcode(Command::Ident).is_some() {
            let mut reply = vec![0u8; self.revision.report_size];
            let n = self.request(Command::Ident, &mut reply)?;
            let ident = Ident::from_reply(&reply[..n]).ok_or(FlashError::InvalidReply("IDENT"))?;

            if !SUPPORTED_VERSIONS.contains(&ident.version) {
                return Err(FlashError::ProtocolVersion(ident.version));
            }
            log::log!(level, "Bootloader protocol version {}", ident.version);
            if ident.features.contains(Features::INSECURE) {
                log::warn!("Device has the insecure marker set");
            }
            self.ident = Some(ident);
        }

        if self.revision.opcode(Command::GetUid).is_some() {
            let mut reply = vec![0u8; self.revision.report_size];
            let n = self.request(Command::GetUid, &mut reply)?;
            if n < UID_LEN {
                return Err(FlashError::InvalidReply("GET_UID"));
            }
            let mut uid = [0u8; UID_LEN];
            uid.copy_from_slice(&reply[..UID_LEN]);
            let uid = Uid(uid);
            log::log!(level, "Device UID {}", uid);
            self.uid = Some(uid);
        }

        self.handshaken = true;
        Ok(())
    }

    /// Make sure the device is the one `target` names
    pub fn check_target(&self, target: &Uid) -> Result<()> {
        if target.is_wildcard() {
            return Ok(());
        }
        match self.uid {
            Some(device) if target.accepts(&device) => Ok(()),
            Some(device) => Err(FlashError::UidMismatch {
                target: *target,
                device,
            }),
            None => Err(FlashError::UidUnavailable { target: *target }),
        }
    }

    /// Announce and send the payload
    pub fn flash<P: FlashProgress + ?Sized>(
        &mut self,
        package: &FirmwarePackage<'_>,
        progress: &mut P,
    ) -> Result<()> {
        let page_size = self.revision.page_size;
        let payload = package.payload();
        let pages = package.page_count(page_size);
        let count = u16::try_from(pages).map_err(|_| FlashError::PayloadTooLarge {
            size: payload.len(),
            pages,
        })?;

        self.pages_total = pages;
        self.pages_written = 0;

        log::info!(
            "Flashing {} bytes as {} pages of {} bytes",
            payload.len(),
            pages,
            page_size
        );
        self.send(Command::Flash, &count.to_le_bytes())?;
        if self.reports_status() {
            match self.read_status("FLASH")? {
                TransferStatus::Accepted => {}
                TransferStatus::Refused => return Err(FlashError::TransferRefused { pages }),
                _ => return Err(FlashError::InvalidReply("FLASH")),
            }
        }

        let total = pages * page_size;
        progress.start(total);

        let mut page = vec![0u8; page_size];
        for (index, chunk) in payload.chunks(page_size).enumerate() {
            page.fill(0);
            page[..chunk.len()].copy_from_slice(chunk);

            for report in page.chunks(self.revision.report_size) {
                self.revision.encode_data(report, &mut self.frame);
                write_frame(&mut self.device, &self.frame, &self.policy)?;
            }

            self.pages_written = index + 1;
            log::trace!("Page {}/{} sent", self.pages_written, pages);
            progress.update(self.pages_written * page_size, total);
        }

        if self.reports_status() && pages > 0 {
            match self.read_status("transfer status")? {
                TransferStatus::Complete => {}
                TransferStatus::Failed => return Err(FlashError::TransferFailed),
                _ => return Err(FlashError::InvalidReply("transfer status")),
            }
        }

        progress.finish();
        Ok(())
    }

    /// Ask the device to reset into the new image
    ///
    /// The image is already written at this point, so a failure is only
    /// logged.
    pub fn reboot(&mut self) {
        match self.send(Command::Reboot, &[]) {
            Ok(()) => log::debug!("Reboot requested"),
            Err(e) => log::warn!("Failed to send reboot command: {}", e),
        }
    }

    /// Full update: handshake if needed, target check, transfer, reboot
    pub fn update<P: FlashProgress + ?Sized>(
        &mut self,
        package: &FirmwarePackage<'_>,
        progress: &mut P,
    ) -> Result<()> {
        if !self.handshaken {
            self.handshake(false)?;
        }
        self.check_target(&package.target())?;
        self.flash(package, progress)?;
        self.reboot();
        Ok(())
    }

    fn send(&mut self, command: Command, payload: &[u8]) -> Result<()> {
        if self
            .revision
            .encode_command(command, payload, &mut self.frame)
            .is_none()
        {
            return Err(FlashError::InvalidReply("unsupported command"));
        }
        write_frame(&mut self.device, &self.frame, &self.policy)
    }

    fn request(&mut self, command: Command, reply: &mut [u8]) -> Result<usize> {
        self.send(command, &[])?;
        Ok(self.device.read_report(reply, self.timeout)?)
    }

    fn reports_status(&self) -> bool {
        self.ident.is_some_and(|ident| ident.reports_status())
    }

    fn read_status(&mut self, what: &'static str) -> Result<TransferStatus> {
        let mut reply = vec![0u8; self.revision.report_size];
        let n = self.device.read_report(&mut reply, self.timeout)?;
        TransferStatus::from_reply(&reply[..n]).ok_or(FlashError::InvalidReply(what))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::package::{self, FirmwarePackage};
    use crate::protocol::Revision;
    use std::collections::VecDeque;
    use std::string::ToString;
    use std::vec;

    const FAST: RetryPolicy = RetryPolicy::new(20, Duration::ZERO);

    /// Transport answering from a script
    #[derive(Default)]
    struct Scripted {
        write_results: VecDeque<std::result::Result<usize, TransportError>>,
        fail_all_writes: bool,
        replies: VecDeque<Vec<u8>>,
        write_calls: usize,
        frames: Vec<Vec<u8>>,
    }

    impl Scripted {
        fn failing(n: usize) -> Self {
            let mut t = Self::default();
            for _ in 0..n {
                t.write_results
                    .push_back(Err(TransportError::Io("busy".to_string())));
            }
            t
        }

        fn replying(replies: &[&[u8]]) -> Self {
            Self {
                replies: replies.iter().map(|r| r.to_vec()).collect(),
                ..Default::default()
            }
        }
    }

    impl HidTransport for Scripted {
        fn write_report(&mut self, frame: &[u8]) -> std::result::Result<usize, TransportError> {
            self.write_calls += 1;
            if self.fail_all_writes {
                return Err(TransportError::Disconnected);
            }
            let result = self.write_results.pop_front().unwrap_or(Ok(frame.len()));
            if result.is_ok() {
                self.frames.push(frame.to_vec());
            }
            result
        }

        fn read_report(
            &mut self,
            buf: &mut [u8],
            _timeout: Duration,
        ) -> std::result::Result<usize, TransportError> {
            let reply = self.replies.pop_front().ok_or(TransportError::Timeout)?;
            buf[..reply.len()].copy_from_slice(&reply);
            Ok(reply.len())
        }
    }

    #[test]
    fn test_retry_succeeds_below_limit() {
        let mut t = Scripted::failing(19);
        assert!(write_frame(&mut t, &[0; 65], &FAST).is_ok());
        assert_eq!(t.write_calls, 20);
    }

    #[test]
    fn test_retry_exhausted_at_limit() {
        let mut t = Scripted::failing(20);
        let err = write_frame(&mut t, &[0; 65], &FAST).unwrap_err();
        assert!(matches!(err, FlashError::RetriesExhausted { attempts: 20, .. }));
        assert_eq!(t.write_calls, 20);
    }

    #[test]
    fn test_partial_write_is_not_retried() {
        let mut t = Scripted::default();
        t.write_results.push_back(Ok(10));
        let err = write_frame(&mut t, &[0; 65], &FAST).unwrap_err();
        assert!(matches!(
            err,
            FlashError::PartialWrite {
                written: 10,
                expected: 65
            }
        ));
        assert_eq!(t.write_calls, 1);
    }

    #[test]
    fn test_handshake_reads_version_and_uid() {
        let t = Scripted::replying(&[&[1, 0x01], &[1, 2, 3, 4, 5, 6, 7, 8]]);
        let mut session = FlashSession::new(t, Revision::VIAL).with_policy(FAST);
        session.handshake(false).unwrap();

        assert_eq!(session.ident().unwrap().version, 1);
        assert!(session.ident().unwrap().features.contains(Features::UID));
        assert_eq!(session.uid(), Some(Uid([1, 2, 3, 4, 5, 6, 7, 8])));

        let frames = &session.device().frames;
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..4], &[0, b'V', b'C', 0x00]);
        assert_eq!(&frames[1][..4], &[0, b'V', b'C', 0x01]);
        assert_eq!(frames[0].len(), 65);
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let t = Scripted::replying(&[&[2, 0]]);
        let mut session = FlashSession::new(t, Revision::VIAL).with_policy(FAST);
        let err = session.handshake(false).unwrap_err();
        assert!(matches!(err, FlashError::ProtocolVersion(2)));
    }

    #[test]
    fn test_missing_reply_times_out() {
        let t = Scripted::default();
        let mut session = FlashSession::new(t, Revision::VIAL).with_policy(FAST);
        let err = session.handshake(false).unwrap_err();
        assert!(matches!(err, FlashError::Transport(TransportError::Timeout)));
    }

    #[test]
    fn test_uid_mismatch_aborts_before_flash() {
        let t = Scripted::replying(&[&[1, 0x01], &[1, 2, 3, 4, 5, 6, 7, 8]]);
        let mut session = FlashSession::new(t, Revision::VIAL).with_policy(FAST);

        let file = package::build(Uid([9; 8]), &[0xAA; 100]);
        let pkg = FirmwarePackage::load(&file).unwrap();
        let err = session.update(&pkg, &mut NoProgress).unwrap_err();

        assert!(matches!(err, FlashError::UidMismatch { .. }));
        assert_eq!(session.device().frames.len(), 2);
        assert_eq!(session.pages_written(), 0);
    }

    #[test]
    fn test_legacy_cannot_check_pinned_uid() {
        let mut session = FlashSession::new(Scripted::default(), Revision::LEGACY);
        session.handshake(false).unwrap();
        assert!(session.check_target(&Uid::WILDCARD).is_ok());
        assert!(matches!(
            session.check_target(&Uid([1; 8])),
            Err(FlashError::UidUnavailable { .. })
        ));
        assert_eq!(session.device().write_calls, 0);
    }

    struct Recorder(Vec<(usize, usize)>);

    impl FlashProgress for Recorder {
        fn update(&mut self, done: usize, total: usize) {
            self.0.push((done, total));
        }
    }

    #[test]
    fn test_flash_sends_padded_pages() {
        let payload: Vec<u8> = (1..=100u8).collect();
        let pkg = FirmwarePackage::parse(&payload).unwrap();

        let mut session = FlashSession::new(Scripted::default(), Revision::VIAL).with_policy(FAST);
        let mut progress = Recorder(Vec::new());
        session.flash(&pkg, &mut progress).unwrap();

        assert_eq!(session.pages_total(), 2);
        assert_eq!(session.pages_written(), 2);
        assert_eq!(progress.0, vec![(64, 128), (128, 128)]);

        let frames = &session.device().frames;
        assert_eq!(frames.len(), 3);
        assert_eq!(&frames[0][..6], &[0, b'V', b'C', 0x02, 2, 0]);
        assert_eq!(frames[1][0], 0);
        assert_eq!(&frames[1][1..], &payload[..64]);
        assert_eq!(&frames[2][1..37], &payload[64..]);
        assert!(frames[2][37..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_legacy_flash_uses_1k_pages() {
        let payload = vec![0x5A; 1500];
        let pkg = FirmwarePackage::parse(&payload).unwrap();

        let mut session =
            FlashSession::new(Scripted::default(), Revision::LEGACY).with_policy(FAST);
        session.flash(&pkg, &mut NoProgress).unwrap();

        let frames = &session.device().frames;
        assert_eq!(frames.len(), 1 + 2 * 8);
        assert_eq!(&frames[0][..11], b"\0BTLDCMD\x01\x02\x00");
        assert!(frames.iter().all(|f| f.len() == 129));
    }

    fn handshaken(replies: &[&[u8]]) -> FlashSession<Scripted> {
        let ident: &[u8] = &[1, 0x01];
        let uid: &[u8] = &[0xFF; 8];
        let mut all = vec![ident, uid];
        all.extend_from_slice(replies);
        let mut session = FlashSession::new(Scripted::replying(&all), Revision::VIAL)
            .with_policy(FAST)
            .with_timeout(Duration::ZERO);
        session.handshake(true).unwrap();
        session
    }

    #[test]
    fn test_refused_flash_sends_no_pages() {
        let mut session = handshaken(&[&[0x01]]);
        let pkg = FirmwarePackage::parse(&[0xAA; 2048]).unwrap();
        let err = session.update(&pkg, &mut NoProgress).unwrap_err();

        assert!(matches!(err, FlashError::TransferRefused { pages: 32 }));
        assert_eq!(session.pages_written(), 0);
        let t = session.into_inner();
        // IDENT, GET_UID, FLASH; no pages and no REBOOT
        assert_eq!(t.frames.len(), 3);
        assert_eq!(&t.frames[2][..4], &[0, b'V', b'C', 0x02]);
    }

    #[test]
    fn test_failed_transfer_is_an_error() {
        let mut session = handshaken(&[&[0x00], &[0x03]]);
        let pkg = FirmwarePackage::parse(&[0xAA; 100]).unwrap();
        let err = session.update(&pkg, &mut NoProgress).unwrap_err();

        assert!(matches!(err, FlashError::TransferFailed));
        assert_eq!(session.pages_written(), 2);
        assert!(session
            .device()
            .frames
            .iter()
            .all(|f| f[..4] != [0, b'V', b'C', 0x03]));
    }

    #[test]
    fn test_missing_completion_status_times_out() {
        let mut session = handshaken(&[&[0x00]]);
        let pkg = FirmwarePackage::parse(&[0xAA; 64]).unwrap();
        let err = session.flash(&pkg, &mut NoProgress).unwrap_err();
        assert!(matches!(err, FlashError::Transport(TransportError::Timeout)));
    }

    #[test]
    fn test_completed_transfer_reboots() {
        let mut session = handshaken(&[&[0x00], &[0x02]]);
        let pkg = FirmwarePackage::parse(&[0xAA; 100]).unwrap();
        session.update(&pkg, &mut NoProgress).unwrap();

        let frames = session.into_inner().frames;
        // IDENT, GET_UID, FLASH, 2 pages, REBOOT
        assert_eq!(frames.len(), 6);
        assert_eq!(&frames[5][..4], &[0, b'V', b'C', 0x03]);
    }

    #[test]
    fn test_payload_too_large() {
        let payload = vec![0u8; 65536 * 64];
        let pkg = FirmwarePackage::parse(&payload).unwrap();
        let mut session = FlashSession::new(Scripted::default(), Revision::VIAL);
        let err = session.flash(&pkg, &mut NoProgress).unwrap_err();
        assert!(matches!(err, FlashError::PayloadTooLarge { pages: 65536, .. }));
        assert_eq!(session.device().write_calls, 0);
    }

    #[test]
    fn test_reboot_failure_is_tolerated() {
        let mut t = Scripted::default();
        t.fail_all_writes = true;
        let mut session = FlashSession::new(t, Revision::VIAL).with_policy(FAST);
        session.reboot();
        assert_eq!(session.device().write_calls, 20);
    }

    #[test]
    fn test_percent() {
        assert_eq!(percent(0, 200), 0);
        assert_eq!(percent(100, 200), 50);
        assert_eq!(percent(200, 200), 100);
        assert_eq!(percent(0, 0), 100);
    }
}
