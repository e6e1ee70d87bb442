//! Simulated USB bus with bootloader devices attached

use std::cell::RefCell;
use std::collections::VecDeque;
use std::format;
use std::rc::Rc;
use std::string::{String, ToString};
use std::time::Duration;
use std::vec::Vec;

use vibl_core::protocol::{DEVICE_MARKER, USB_VID};
use vibl_core::server::{Action, FlashServer, State};
use vibl_core::transport::{DeviceInfo, HidEnumerator, HidTransport, TransportError};

use crate::{DummyConfig, RamFlash};

/// Something that happened to a simulated device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A handle was opened
    Opened,
    /// An output report was received
    Write,
    /// A handle was closed
    Closed,
    /// The device was told to reset
    Reset,
}

struct DeviceState {
    server: FlashServer<RamFlash>,
    pending: VecDeque<Vec<u8>>,
    events: Vec<Event>,
    fail_writes: usize,
    resets: usize,
}

/// A simulated bootloader that can be plugged into a [`DummyBus`]
///
/// Clones share the same device, so a test can keep one to inspect the flash
/// after the tool is done with it.
#[derive(Clone)]
pub struct DummyDevice {
    info: DeviceInfo,
    config: DummyConfig,
    state: Rc<RefCell<DeviceState>>,
}

impl DummyDevice {
    /// Create a device at `path`
    pub fn new(path: &str, config: DummyConfig) -> Self {
        let info = DeviceInfo {
            path: path.to_string(),
            vendor_id: USB_VID,
            product_id: config.revision.usb_pid,
            serial: Some(format!("{}:{}", DEVICE_MARKER, config.uid)),
            product: Some("vibl dummy bootloader".to_string()),
        };
        let state = DeviceState {
            server: FlashServer::new(RamFlash::new(config.region), config.server_config()),
            pending: VecDeque::new(),
            events: Vec::new(),
            fail_writes: 0,
            resets: 0,
        };
        Self {
            info,
            config,
            state: Rc::new(RefCell::new(state)),
        }
    }

    /// Replace the identity string (e.g. to drop the marker)
    pub fn with_serial(mut self, serial: Option<&str>) -> Self {
        self.info.serial = serial.map(|s| s.to_string());
        self
    }

    /// Enumeration record
    pub fn info(&self) -> &DeviceInfo {
        &self.info
    }

    /// Configuration the device was built from
    pub fn config(&self) -> &DummyConfig {
        &self.config
    }

    /// Copy of the application flash
    pub fn flash_contents(&self) -> Vec<u8> {
        self.state.borrow().server.flash().data().to_vec()
    }

    /// Current server state
    pub fn server_state(&self) -> State {
        self.state.borrow().server.state()
    }

    /// Everything that happened so far
    pub fn events(&self) -> Vec<Event> {
        self.state.borrow().events.clone()
    }

    /// Number of output reports received
    pub fn reports_received(&self) -> usize {
        self.state
            .borrow()
            .events
            .iter()
            .filter(|&&e| e == Event::Write)
            .count()
    }

    /// Number of REBOOT commands handled
    pub fn resets(&self) -> usize {
        self.state.borrow().resets
    }

    /// Make the next `n` writes fail with a transport error
    pub fn fail_next_writes(&self, n: usize) {
        self.state.borrow_mut().fail_writes = n;
    }

    fn open(&self) -> DummyHandle {
        self.state.borrow_mut().events.push(Event::Opened);
        DummyHandle {
            path: self.info.path.clone(),
            state: self.state.clone(),
        }
    }
}

/// An open handle to a [`DummyDevice`]
pub struct DummyHandle {
    path: String,
    state: Rc<RefCell<DeviceState>>,
}

impl DummyHandle {
    /// Path of the device this handle belongs to
    pub fn path(&self) -> &str {
        &self.path
    }
}

impl HidTransport for DummyHandle {
    fn write_report(&mut self, frame: &[u8]) -> Result<usize, TransportError> {
        let mut guard = self.state.borrow_mut();
        let state = &mut *guard;

        if state.fail_writes > 0 {
            state.fail_writes -= 1;
            return Err(TransportError::Io("simulated write failure".to_string()));
        }
        state.events.push(Event::Write);

        let Some(report) = frame.get(1..) else {
            return Ok(frame.len());
        };

        match state.server.handle_report(report) {
            Ok(Action::None) => {}
            Ok(Action::Reply(reply)) => state.pending.push_back(reply.to_vec()),
            Ok(Action::Reset) => {
                state.resets += 1;
                state.events.push(Event::Reset);
            }
            Err(e) => log::debug!("{}: report rejected: {}", self.path, e),
        }

        Ok(frame.len())
    }

    fn read_report(&mut self, buf: &mut [u8], _timeout: Duration) -> Result<usize, TransportError> {
        let reply = self
            .state
            .borrow_mut()
            .pending
            .pop_front()
            .ok_or(TransportError::Timeout)?;
        let len = reply.len().min(buf.len());
        buf[..len].copy_from_slice(&reply[..len]);
        Ok(len)
    }
}

impl Drop for DummyHandle {
    fn drop(&mut self) {
        self.state.borrow_mut().events.push(Event::Closed);
    }
}

/// A set of simulated devices
#[derive(Clone, Default)]
pub struct DummyBus {
    devices: Vec<DummyDevice>,
}

impl DummyBus {
    /// Empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Plug in a device
    pub fn attach(&mut self, device: DummyDevice) {
        self.devices.push(device);
    }

    /// Builder form of [`attach`](Self::attach)
    pub fn with_device(mut self, device: DummyDevice) -> Self {
        self.attach(device);
        self
    }

    /// Attached devices
    pub fn devices(&self) -> &[DummyDevice] {
        &self.devices
    }
}

impl HidEnumerator for DummyBus {
    type Device = DummyHandle;

    fn enumerate(&self) -> Result<Vec<DeviceInfo>, TransportError> {
        Ok(self.devices.iter().map(|d| d.info.clone()).collect())
    }

    fn open(&self, info: &DeviceInfo) -> Result<DummyHandle, TransportError> {
        self.devices
            .iter()
            .find(|d| d.info.path == info.path)
            .map(DummyDevice::open)
            .ok_or_else(|| TransportError::Open(format!("{}: no such device", info.path)))
    }
}
