//! Finding the bootloader to talk to
//!
//! Several boards can sit in update mode at once. [`discover`] opens every
//! candidate, handshakes with them one after another and keeps the first whose
//! UID the target accepts. The remaining handles are dropped right away, so
//! devices after the match never see a single report.
//!
//! A device speaking an unsupported protocol version ends the search with
//! [`FlashError::ProtocolVersion`] once the scan it was found in is over,
//! unless another device in that scan matched. Other handshake failures only
//! skip the device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use std::vec::Vec;

use crate::client::{FlashError, FlashSession, Result, RetryPolicy};
use crate::protocol::{Command, Revision, Uid};
use crate::transport::{DeviceInfo, HidEnumerator};

/// Pause between scans when nothing matched
pub const RESCAN_DELAY: Duration = Duration::from_secs(1);

/// Knobs for the device search
#[derive(Debug, Clone, Copy)]
pub struct DiscoveryOptions<'a> {
    /// Protocol revision to speak
    pub revision: Revision,
    /// Write retry policy handed to the session
    pub policy: RetryPolicy,
    /// Pause between scans
    pub rescan_delay: Duration,
    /// Give up with `DeviceNotFound` after this many scans (None = forever)
    pub max_scans: Option<usize>,
    /// Checked before every scan; set to stop with `Cancelled`
    pub cancel: Option<&'a AtomicBool>,
}

impl DiscoveryOptions<'_> {
    /// Search forever with default timing
    pub fn new(revision: Revision) -> Self {
        Self {
            revision,
            policy: RetryPolicy::default(),
            rescan_delay: RESCAN_DELAY,
            max_scans: None,
            cancel: None,
        }
    }
}

impl<'a> DiscoveryOptions<'a> {
    /// Attach a cancellation flag
    pub fn with_cancel(mut self, cancel: &'a AtomicBool) -> Self {
        self.cancel = Some(cancel);
        self
    }

    fn cancelled(&self) -> bool {
        self.cancel.is_some_and(|c| c.load(Ordering::Relaxed))
    }

    fn exhausted(&self, scans: usize) -> bool {
        self.max_scans.is_some_and(|max| scans >= max)
    }

    /// Revisions with IDENT carry the marker; older ones are matched by
    /// VID:PID in the backend alone.
    fn is_candidate(&self, info: &DeviceInfo) -> bool {
        self.revision.opcode(Command::Ident).is_none() || info.has_marker()
    }
}

fn candidates<E: HidEnumerator>(enumerator: &E, options: &DiscoveryOptions<'_>) -> Vec<DeviceInfo> {
    match enumerator.enumerate() {
        Ok(list) => list
            .into_iter()
            .filter(|info| options.is_candidate(info))
            .collect(),
        Err(e) => {
            log::warn!("Device enumeration failed: {}", e);
            Vec::new()
        }
    }
}

fn open_all<E: HidEnumerator>(enumerator: &E, infos: Vec<DeviceInfo>) -> Vec<(DeviceInfo, E::Device)> {
    infos
        .into_iter()
        .filter_map(|info| match enumerator.open(&info) {
            Ok(device) => Some((info, device)),
            Err(e) => {
                log::debug!("Skipping {}: {}", info.path, e);
                None
            }
        })
        .collect()
}

/// Wait for the bootloader whose UID `target` accepts
///
/// Returns a session on which the handshake has already run.
pub fn discover<E: HidEnumerator>(
    enumerator: &E,
    target: &Uid,
    options: &DiscoveryOptions<'_>,
) -> Result<FlashSession<E::Device>> {
    if !target.is_wildcard() && options.revision.opcode(Command::GetUid).is_none() {
        return Err(FlashError::UidUnavailable { target: *target });
    }

    let mut scans = 0;
    loop {
        if options.cancelled() {
            return Err(FlashError::Cancelled);
        }
        scans += 1;

        let opened = open_all(enumerator, candidates(enumerator, options));
        log::debug!("Scan {}: {} candidate(s) opened", scans, opened.len());
        let mut unsupported = None;

        // Returning drops the iterator, which closes the unprobed handles.
        for (info, device) in opened {
            let mut session = FlashSession::new(device, options.revision).with_policy(options.policy);

            match session.handshake(true) {
                Ok(()) => {
                    let accepted = match session.uid() {
                        Some(uid) => target.accepts(&uid),
                        None => target.is_wildcard(),
                    };
                    if accepted {
                        log::info!("Using bootloader at {}", info.path);
                        return Ok(session);
                    }
                    if let Some(uid) = session.uid() {
                        log::debug!("{} has UID {}, looking for {}", info.path, uid, target);
                    }
                }
                Err(e @ FlashError::ProtocolVersion(_)) => {
                    log::error!("{}: {}", info.path, e);
                    if unsupported.is_none() {
                        unsupported = Some(e);
                    }
                }
                Err(e) => log::debug!("{}: handshake failed: {}", info.path, e),
            }
        }

        // An unknown protocol version will not go away by rescanning
        if let Some(e) = unsupported {
            return Err(e);
        }

        if options.exhausted(scans) {
            return Err(FlashError::DeviceNotFound);
        }
        if scans == 1 {
            log::info!("Waiting for a bootloader device...");
        }
        std::thread::sleep(options.rescan_delay);
    }
}

/// Open the first bootloader found, without a UID search
///
/// The handshake runs (and logs) as usual once the device is open.
pub fn open_single<E: HidEnumerator>(
    enumerator: &E,
    options: &DiscoveryOptions<'_>,
) -> Result<FlashSession<E::Device>> {
    let mut scans = 0;
    loop {
        if options.cancelled() {
            return Err(FlashError::Cancelled);
        }
        scans += 1;

        if let Some(info) = candidates(enumerator, options).into_iter().next() {
            let device = enumerator.open(&info)?;
            log::info!("Using bootloader at {}", info.path);
            let mut session = FlashSession::new(device, options.revision).with_policy(options.policy);
            session.handshake(false)?;
            return Ok(session);
        }

        if options.exhausted(scans) {
            return Err(FlashError::DeviceNotFound);
        }
        if scans == 1 {
            log::info!("Waiting for a bootloader device...");
        }
        std::thread::sleep(options.rescan_delay);
    }
}
