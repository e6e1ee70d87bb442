//! Bootloader side of the flash protocol
//!
//! [`FlashServer`] consumes one HID output report at a time and tells the
//! firmware loop what to do next through an [`Action`]. It never blocks on
//! USB; flash erase and program calls block for their duration.
//!
//! ```text
//!            FLASH(n), n > 0
//!   Idle ─────────────────────────▶ AwaitingPages
//!    ▲ ▲                                 │
//!    │ └──────── n pages written ────────┤
//!    │                                   │ write error
//!    │                                   ▼
//!    └──── n pages received ─────────  Draining
//! ```
//!
//! Once a transfer is announced the server consumes exactly `n` pages, so
//! page data is never read as a command. A page that fails to write moves
//! the server to `Draining`, which drops the rest of the stream. An image
//! that does not fit is refused; version 1 devices say so in the FLASH reply
//! and stay `Idle`, older ones drain the `n` pages the host will send anyway.
//!
//! Version 1 devices also report [`TransferStatus::Complete`] or
//! [`TransferStatus::Failed`] after the last page.
//!
//! The server does not check what it writes. The host verifies the firmware
//! hash before the transfer; an interrupted transfer is caught by the boot
//! decision on the next reset.

use crate::error::{Error, Result};
use crate::protocol::{
    Command, Features, Ident, Revision, TransferStatus, Uid, MAX_PAGE_SIZE, MAX_REPORT_SIZE,
    STATUS_VERSION,
};

/// Internal flash as seen by the server
pub trait FlashMemory {
    /// Allow erase and program operations
    fn unlock(&mut self);

    /// Forbid erase and program operations
    fn lock(&mut self);

    /// Erase the erase block starting at `addr`
    fn erase_block(&mut self, addr: u32) -> Result<()>;

    /// Program `data` at `addr` (which has been erased)
    fn program(&mut self, addr: u32, data: &[u8]) -> Result<()>;
}

/// Flash area the application lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashRegion {
    /// First address after the bootloader
    pub base: u32,
    /// Size of the application area in bytes
    pub size: u32,
    /// Erase granularity in bytes
    pub erase_block: u32,
}

impl FlashRegion {
    /// STM32F103x8: 64 KiB flash, 1 KiB pages, 16 KiB reserved for the bootloader
    pub const STM32F103X8: FlashRegion = FlashRegion {
        base: crate::boot::DEFAULT_APP_BASE,
        size: 48 * 1024,
        erase_block: 1024,
    };

    /// Whether `pages` pages of `page_size` bytes fit into the region
    pub fn fits(&self, pages: u16, page_size: usize) -> bool {
        (pages as u64) * (page_size as u64) <= self.size as u64
    }
}

/// Static configuration of the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerConfig {
    /// Protocol revision served
    pub revision: Revision,
    /// Where pages are written
    pub region: FlashRegion,
    /// UID reported by GET_UID
    pub uid: Uid,
    /// Version byte reported by IDENT
    pub version: u8,
    /// Whether the insecure marker was latched at boot
    pub insecure: bool,
}

impl ServerConfig {
    /// Default configuration for a revision and flash region
    pub fn new(revision: Revision, region: FlashRegion) -> Self {
        Self {
            revision,
            region,
            uid: Uid::WILDCARD,
            version: crate::protocol::PROTOCOL_VERSION,
            insecure: false,
        }
    }

    /// Whether FLASH and the end of a transfer are answered with a status
    pub fn reports_status(&self) -> bool {
        self.revision.ident.is_some() && self.version >= STATUS_VERSION
    }
}

/// Transfer state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Waiting for a command
    Idle,
    /// Receiving page data
    AwaitingPages {
        /// Pages announced by FLASH
        total: u16,
        /// Pages written so far
        written: u16,
    },
    /// Dropping the rest of a refused or failed transfer
    Draining {
        /// Pages announced by FLASH
        total: u16,
        /// Pages received so far
        received: u16,
    },
}

/// What the firmware loop should do after a report
#[derive(Debug, PartialEq, Eq)]
pub enum Action<'a> {
    /// Nothing to send
    None,
    /// Send this input report to the host
    Reply(&'a [u8]),
    /// Reset the system
    Reset,
}

/// Flash protocol state machine
pub struct FlashServer<F: FlashMemory> {
    flash: F,
    config: ServerConfig,
    state: State,
    page: [u8; MAX_PAGE_SIZE],
    fill: usize,
    reply: [u8; MAX_REPORT_SIZE],
}

impl<F: FlashMemory> FlashServer<F> {
    /// Create a server in the `Idle` state
    pub fn new(flash: F, config: ServerConfig) -> Self {
        debug_assert!(config.revision.report_size <= MAX_REPORT_SIZE);
        debug_assert!(config.revision.page_size <= MAX_PAGE_SIZE);
        debug_assert!(config.revision.page_size % config.revision.report_size == 0);

        Self {
            flash,
            config,
            state: State::Idle,
            page: [0; MAX_PAGE_SIZE],
            fill: 0,
            reply: [0; MAX_REPORT_SIZE],
        }
    }

    /// Current state
    pub fn state(&self) -> State {
        self.state
    }

    /// Server configuration
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Borrow the flash backend
    pub fn flash(&self) -> &F {
        &self.flash
    }

    /// Give the flash backend back
    pub fn into_flash(self) -> F {
        self.flash
    }

    /// Process one output report (without report-ID byte)
    pub fn handle_report(&mut self, report: &[u8]) -> Result<Action<'_>> {
        let expected = self.config.revision.report_size;
        if report.len() != expected {
            return Err(Error::InvalidReportLength {
                expected,
                actual: report.len(),
            });
        }

        match self.state {
            State::Idle => self.handle_command(report),
            State::AwaitingPages { total, written } => Ok(self.handle_data(report, total, written)),
            State::Draining { total, received } => Ok(self.drain(report.len(), total, received)),
        }
    }

    fn handle_command(&mut self, report: &[u8]) -> Result<Action<'_>> {
        let revision = self.config.revision;
        let Some((opcode, payload)) = revision.parse_command(report) else {
            log::debug!("server: ignoring untagged report while idle");
            return Ok(Action::None);
        };

        match revision.command(opcode) {
            Some(Command::Ident) => {
                let mut features = Features::empty();
                if revision.get_uid.is_some() {
                    features |= Features::UID;
                }
                if self.config.insecure {
                    features |= Features::INSECURE;
                }
                let ident = Ident {
                    version: self.config.version,
                    features,
                };
                Ok(Action::Reply(self.build_reply(|r| ident.encode(r))))
            }
            Some(Command::GetUid) => {
                let uid = self.config.uid;
                Ok(Action::Reply(
                    self.build_reply(|r| r[..uid.0.len()].copy_from_slice(&uid.0)),
                ))
            }
            Some(Command::Flash) => {
                let pages = u16::from_le_bytes([payload[0], payload[1]]);
                let status = self.start_transfer(pages);
                Ok(self.status_reply(status))
            }
            Some(Command::Reboot) => {
                log::info!("server: reboot requested");
                Ok(Action::Reset)
            }
            None => Err(Error::UnsupportedCommand(opcode)),
        }
    }

    fn build_reply(&mut self, fill: impl FnOnce(&mut [u8])) -> &[u8] {
        let len = self.config.revision.report_size;
        let reply = &mut self.reply[..len];
        reply.fill(0);
        fill(reply);
        reply
    }

    fn status_reply(&mut self, status: TransferStatus) -> Action<'_> {
        if self.config.reports_status() {
            Action::Reply(self.build_reply(|r| status.encode(r)))
        } else {
            Action::None
        }
    }

    fn start_transfer(&mut self, pages: u16) -> TransferStatus {
        let page_size = self.config.revision.page_size;
        self.fill = 0;

        if !self.config.region.fits(pages, page_size) {
            log::warn!(
                "server: refusing transfer of {} pages, region holds {} bytes",
                pages,
                self.config.region.size
            );
            // Without a status reply the host sends the pages regardless
            if !self.config.reports_status() {
                self.state = State::Draining {
                    total: pages,
                    received: 0,
                };
            }
            return TransferStatus::Refused;
        }

        if pages > 0 {
            log::info!("server: receiving {} pages", pages);
            self.flash.unlock();
            self.state = State::AwaitingPages {
                total: pages,
                written: 0,
            };
        }
        TransferStatus::Accepted
    }

    /// Buffer one report; true once a whole page is buffered
    fn take_report(&mut self, len: usize) -> bool {
        self.fill += len;
        if self.fill < self.config.revision.page_size {
            return false;
        }
        self.fill = 0;
        true
    }

    fn handle_data(&mut self, report: &[u8], total: u16, written: u16) -> Action<'_> {
        self.page[self.fill..self.fill + report.len()].copy_from_slice(report);
        if !self.take_report(report.len()) {
            return Action::None;
        }

        if let Err(e) = self.write_page(written) {
            log::error!("server: {}, dropping the rest of the transfer", e);
            self.flash.lock();
            return self.end_of_page(total, written);
        }

        let written = written + 1;
        if written == total {
            log::info!("server: transfer complete");
            self.flash.lock();
            self.state = State::Idle;
            return self.status_reply(TransferStatus::Complete);
        }
        self.state = State::AwaitingPages { total, written };
        Action::None
    }

    fn drain(&mut self, len: usize, total: u16, received: u16) -> Action<'_> {
        if !self.take_report(len) {
            return Action::None;
        }
        self.end_of_page(total, received)
    }

    /// Count one dropped page
    fn end_of_page(&mut self, total: u16, received: u16) -> Action<'_> {
        let received = received + 1;
        if received < total {
            self.state = State::Draining { total, received };
            return Action::None;
        }

        log::warn!("server: dropped transfer ended");
        self.state = State::Idle;
        self.status_reply(TransferStatus::Failed)
    }

    fn write_page(&mut self, index: u16) -> Result<()> {
        let page_size = self.config.revision.page_size as u32;
        let region = self.config.region;
        let addr = region.base + index as u32 * page_size;
        let end = addr + page_size;

        // Erase every block that starts inside this page
        let mut block = addr.next_multiple_of(region.erase_block);
        while block < end {
            self.flash.erase_block(block)?;
            block += region.erase_block;
        }

        self.flash.program(addr, &self.page[..page_size as usize])
    }


}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: u32 = 0x0800_4000;
    const SIZE: usize = 4096;

    struct TestFlash {
        data: [u8; SIZE],
        unlocked: bool,
        erases: usize,
        fail_program_at: Option<u32>,
    }

    impl TestFlash {
        fn new() -> Self {
            Self {
                data: [0x00; SIZE],
                unlocked: false,
                erases: 0,
                fail_program_at: None,
            }
        }

        fn offset(addr: u32) -> usize {
            (addr - BASE) as usize
        }
    }

    impl FlashMemory for TestFlash {
        fn unlock(&mut self) {
            self.unlocked = true;
        }

        fn lock(&mut self) {
            self.unlocked = false;
        }

        fn erase_block(&mut self, addr: u32) -> Result<()> {
            if !self.unlocked {
                return Err(Error::FlashLocked);
            }
            let off = Self::offset(addr);
            self.data[off..off + 1024].fill(0xFF);
            self.erases += 1;
            Ok(())
        }

        fn program(&mut self, addr: u32, data: &[u8]) -> Result<()> {
            if !self.unlocked {
                return Err(Error::FlashLocked);
            }
            if self.fail_program_at == Some(addr) {
                return Err(Error::ProgramFailed { addr });
            }
            let off = Self::offset(addr);
            for (dst, src) in self.data[off..off + data.len()].iter_mut().zip(data) {
                assert_eq!(*dst, 0xFF, "programming unerased flash at 0x{:08X}", addr);
                *dst = *src;
            }
            Ok(())
        }
    }

    fn region() -> FlashRegion {
        FlashRegion {
            base: BASE,
            size: SIZE as u32,
            erase_block: 1024,
        }
    }

    fn server() -> FlashServer<TestFlash> {
        FlashServer::new(TestFlash::new(), ServerConfig::new(Revision::VIAL, region()))
    }

    fn command(op: u8, payload: &[u8]) -> [u8; 64] {
        let mut r = [0u8; 64];
        r[..2].copy_from_slice(b"VC");
        r[2] = op;
        r[3..3 + payload.len()].copy_from_slice(payload);
        r
    }

    #[test]
    fn test_ident_reply() {
        let mut s = server();
        match s.handle_report(&command(0x00, &[])).unwrap() {
            Action::Reply(r) => {
                assert_eq!(r.len(), 64);
                assert_eq!(r[0], crate::protocol::PROTOCOL_VERSION);
                assert_eq!(r[1], Features::UID.bits());
            }
            other => panic!("unexpected action {:?}", other),
        }
        assert_eq!(s.state(), State::Idle);
    }

    #[test]
    fn test_insecure_feature_bit() {
        let mut config = ServerConfig::new(Revision::VIAL, region());
        config.insecure = true;
        let mut s = FlashServer::new(TestFlash::new(), config);
        let Action::Reply(r) = s.handle_report(&command(0x00, &[])).unwrap() else {
            panic!("expected reply");
        };
        assert_eq!(r[1], (Features::UID | Features::INSECURE).bits());
    }

    #[test]
    fn test_get_uid_reply() {
        let mut config = ServerConfig::new(Revision::VIAL, region());
        config.uid = Uid([1, 2, 3, 4, 5, 6, 7, 8]);
        let mut s = FlashServer::new(TestFlash::new(), config);
        let Action::Reply(r) = s.handle_report(&command(0x01, &[])).unwrap() else {
            panic!("expected reply");
        };
        assert_eq!(&r[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_flash_pages_sequentially() {
        let mut s = server();
        let Action::Reply(r) = s.handle_report(&command(0x02, &20u16.to_le_bytes())).unwrap() else {
            panic!("expected FLASH status");
        };
        assert_eq!(TransferStatus::from_reply(r), Some(TransferStatus::Accepted));
        assert_eq!(s.state(), State::AwaitingPages { total: 20, written: 0 });

        for i in 0..19u8 {
            let page = [i; 64];
            assert_eq!(s.handle_report(&page).unwrap(), Action::None);
        }
        let Action::Reply(r) = s.handle_report(&[19; 64]).unwrap() else {
            panic!("expected completion status");
        };
        assert_eq!(TransferStatus::from_reply(r), Some(TransferStatus::Complete));
        assert_eq!(s.state(), State::Idle);

        let flash = s.into_flash();
        assert!(!flash.unlocked);
        assert_eq!(flash.erases, 2);
        for i in 0..20usize {
            assert!(flash.data[i * 64..(i + 1) * 64].iter().all(|&b| b == i as u8));
        }
    }

    #[test]
    fn test_version_zero_sends_no_status() {
        let mut config = ServerConfig::new(Revision::VIAL, region());
        config.version = 0;
        let mut s = FlashServer::new(TestFlash::new(), config);
        assert_eq!(
            s.handle_report(&command(0x02, &1u16.to_le_bytes())).unwrap(),
            Action::None
        );
        assert_eq!(s.handle_report(&[7; 64]).unwrap(), Action::None);
        assert_eq!(s.state(), State::Idle);
    }

    #[test]
    fn test_tag_bytes_in_page_data_are_data() {
        let mut s = server();
        s.handle_report(&command(0x02, &1u16.to_le_bytes())).unwrap();
        // A page that happens to look like REBOOT
        assert!(matches!(
            s.handle_report(&command(0x03, &[])).unwrap(),
            Action::Reply(_)
        ));
        assert_eq!(s.state(), State::Idle);
        assert_eq!(&s.flash().data[..3], b"VC\x03");
    }

    #[test]
    fn test_oversized_transfer_refused() {
        let mut s = server();
        let too_many = (SIZE / 64 + 1) as u16;
        let Action::Reply(r) = s.handle_report(&command(0x02, &too_many.to_le_bytes())).unwrap() else {
            panic!("expected FLASH status");
        };
        assert_eq!(TransferStatus::from_reply(r), Some(TransferStatus::Refused));
        assert_eq!(s.state(), State::Idle);
        assert!(!s.flash().unlocked);

        let exact = (SIZE / 64) as u16;
        s.handle_report(&command(0x02, &exact.to_le_bytes())).unwrap();
        assert!(matches!(s.state(), State::AwaitingPages { .. }));
    }

    #[test]
    fn test_refused_transfer_drains_without_status() {
        let mut config = ServerConfig::new(Revision::VIAL, region());
        config.version = 0;
        let mut s = FlashServer::new(TestFlash::new(), config);

        let too_many = (SIZE / 64 + 2) as u16;
        assert_eq!(
            s.handle_report(&command(0x02, &too_many.to_le_bytes())).unwrap(),
            Action::None
        );
        assert_eq!(s.state(), State::Draining { total: too_many, received: 0 });

        // Payload pages that look like FLASH and REBOOT are dropped
        assert_eq!(s.handle_report(&command(0x02, &[1, 0])).unwrap(), Action::None);
        assert_eq!(s.handle_report(&command(0x03, &[])).unwrap(), Action::None);
        for _ in 2..too_many {
            assert_eq!(s.handle_report(&[0x42; 64]).unwrap(), Action::None);
        }
        assert_eq!(s.state(), State::Idle);

        let flash = s.flash();
        assert_eq!(flash.erases, 0);
        assert!(flash.data.iter().all(|&b| b == 0));

        assert_eq!(s.handle_report(&command(0x03, &[])).unwrap(), Action::Reset);
    }

    #[test]
    fn test_zero_pages_stays_idle() {
        let mut s = server();
        s.handle_report(&command(0x02, &[0, 0])).unwrap();
        assert_eq!(s.state(), State::Idle);
    }

    #[test]
    fn test_reboot() {
        let mut s = server();
        assert_eq!(s.handle_report(&command(0x03, &[])).unwrap(), Action::Reset);
    }

    #[test]
    fn test_unknown_and_untagged() {
        let mut s = server();
        assert_eq!(
            s.handle_report(&command(0x7F, &[])),
            Err(Error::UnsupportedCommand(0x7F))
        );
        assert_eq!(s.handle_report(&[0x11; 64]).unwrap(), Action::None);
        assert!(matches!(
            s.handle_report(&[0u8; 10]),
            Err(Error::InvalidReportLength { expected: 64, actual: 10 })
        ));
    }

    #[test]
    fn test_program_failure_drains_rest_of_transfer() {
        let mut flash = TestFlash::new();
        flash.fail_program_at = Some(BASE + 64);
        let mut s = FlashServer::new(flash, ServerConfig::new(Revision::VIAL, region()));
        s.handle_report(&command(0x02, &4u16.to_le_bytes())).unwrap();
        assert_eq!(s.handle_report(&[1; 64]).unwrap(), Action::None);
        assert_eq!(s.handle_report(&[2; 64]).unwrap(), Action::None);
        assert_eq!(s.state(), State::Draining { total: 4, received: 2 });
        assert!(!s.flash().unlocked);

        // The rest of the payload, whatever it looks like, is dropped
        assert_eq!(s.handle_report(&command(0x03, &[])).unwrap(), Action::None);
        let Action::Reply(r) = s.handle_report(&command(0x02, &[1, 0])).unwrap() else {
            panic!("expected failure status");
        };
        assert_eq!(TransferStatus::from_reply(r), Some(TransferStatus::Failed));
        assert_eq!(s.state(), State::Idle);
        assert!(s.flash().data[128..256].iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn test_failure_on_last_page_reports_failed() {
        let mut flash = TestFlash::new();
        flash.fail_program_at = Some(BASE);
        let mut s = FlashServer::new(flash, ServerConfig::new(Revision::VIAL, region()));
        s.handle_report(&command(0x02, &1u16.to_le_bytes())).unwrap();
        let Action::Reply(r) = s.handle_report(&[1; 64]).unwrap() else {
            panic!("expected failure status");
        };
        assert_eq!(TransferStatus::from_reply(r), Some(TransferStatus::Failed));
        assert_eq!(s.state(), State::Idle);
    }

    #[test]
    fn test_stm32f103_region_ends_at_flash_end() {
        let region = FlashRegion::STM32F103X8;
        assert_eq!(region.base, crate::boot::DEFAULT_APP_BASE);
        assert_eq!(region.base + region.size, 0x0801_0000);
        assert_eq!(region.base % region.erase_block, 0);
    }

    #[test]
    fn test_legacy_pages_span_reports() {
        let config = ServerConfig::new(Revision::LEGACY, region());
        let mut s = FlashServer::new(TestFlash::new(), config);

        let mut cmd = [0u8; 128];
        cmd[..7].copy_from_slice(b"BTLDCMD");
        cmd[7] = 0x01;
        cmd[8..10].copy_from_slice(&2u16.to_le_bytes());
        s.handle_report(&cmd).unwrap();

        for i in 0..16u8 {
            s.handle_report(&[i; 128]).unwrap();
            if i == 7 {
                assert_eq!(s.state(), State::AwaitingPages { total: 2, written: 1 });
            }
        }
        assert_eq!(s.state(), State::Idle);
        let flash = s.into_flash();
        assert_eq!(flash.data[0], 0);
        assert_eq!(flash.data[1023], 7);
        assert_eq!(flash.data[1024], 8);
        assert_eq!(flash.data[2047], 15);
    }
}
