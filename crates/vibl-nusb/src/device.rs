//! HID bootloader access over nusb
//!
//! The bootloader exposes a single HID interface with an interrupt IN
//! endpoint for replies. Output reports go to the interrupt OUT endpoint when
//! there is one, otherwise through a `SET_REPORT` control request, the same
//! way the kernel's hidraw driver does it.

use std::time::Duration;

use nusb::descriptors::TransferType;
use nusb::transfer::{
    Buffer, ControlOut, ControlType, Direction, In, Interrupt, Out, Recipient,
};
use nusb::{Endpoint, Interface, MaybeFuture};
use vibl_core::protocol::{Revision, USB_VID};
use vibl_core::transport::{DeviceInfo, HidEnumerator, HidTransport, TransportError};

use crate::error::{NusbError, Result};

/// USB interface class for HID
const HID_CLASS: u8 = 0x03;
/// HID class request SET_REPORT
const HID_SET_REPORT: u8 = 0x09;
/// Report type "output" in the high byte of wValue
const HID_REPORT_TYPE_OUTPUT: u16 = 0x02;
/// Timeout for output reports; the retry policy handles the rest
const WRITE_TIMEOUT: Duration = Duration::from_secs(1);

/// Lists bootloaders by USB VID:PID
#[derive(Debug, Clone, Copy)]
pub struct NusbEnumerator {
    vendor_id: u16,
    product_id: u16,
}

impl NusbEnumerator {
    /// Match the VID:PID a revision enumerates with
    pub fn new(revision: &Revision) -> Self {
        Self {
            vendor_id: USB_VID,
            product_id: revision.usb_pid,
        }
    }

    fn matches(&self, info: &nusb::DeviceInfo) -> bool {
        info.vendor_id() == self.vendor_id && info.product_id() == self.product_id
    }

    fn list(&self) -> Result<Vec<nusb::DeviceInfo>> {
        Ok(nusb::list_devices()
            .wait()
            .map_err(|e| NusbError::EnumerationFailed(e.to_string()))?
            .filter(|d| self.matches(d))
            .collect())
    }
}

fn path_of(info: &nusb::DeviceInfo) -> String {
    format!("{}:{:03}", info.bus_id(), info.device_address())
}

fn to_device_info(info: &nusb::DeviceInfo) -> DeviceInfo {
    DeviceInfo {
        path: path_of(info),
        vendor_id: info.vendor_id(),
        product_id: info.product_id(),
        serial: info.serial_number().map(|s| s.to_string()),
        product: info.product_string().map(|s| s.to_string()),
    }
}

impl HidEnumerator for NusbEnumerator {
    type Device = HidDevice;

    fn enumerate(&self) -> std::result::Result<Vec<DeviceInfo>, TransportError> {
        let devices: Vec<DeviceInfo> = self.list()?.iter().map(to_device_info).collect();
        log::debug!(
            "Found {} device(s) with ID {:04X}:{:04X}",
            devices.len(),
            self.vendor_id,
            self.product_id
        );
        Ok(devices)
    }

    fn open(&self, info: &DeviceInfo) -> std::result::Result<HidDevice, TransportError> {
        let usb_info = self
            .list()?
            .into_iter()
            .find(|d| path_of(d) == info.path)
            .ok_or_else(|| NusbError::DeviceNotFound(info.path.clone()))?;
        Ok(HidDevice::open(&usb_info)?)
    }
}

/// Endpoint layout of the HID interface
struct HidLayout {
    interface_num: u8,
    in_ep: u8,
    out_ep: Option<u8>,
}

fn find_hid_interface(device: &nusb::Device) -> Result<HidLayout> {
    let config = device
        .active_configuration()
        .map_err(|e| NusbError::OpenFailed(format!("Failed to get config: {}", e)))?;

    for iface in config.interface_alt_settings() {
        if iface.class() != HID_CLASS {
            continue;
        }

        let mut in_ep = None;
        let mut out_ep = None;
        for ep in iface.endpoints() {
            if ep.transfer_type() != TransferType::Interrupt {
                continue;
            }
            match ep.direction() {
                Direction::In => in_ep = in_ep.or(Some(ep.address())),
                Direction::Out => out_ep = out_ep.or(Some(ep.address())),
            }
        }

        if let Some(in_ep) = in_ep {
            return Ok(HidLayout {
                interface_num: iface.interface_number(),
                in_ep,
                out_ep,
            });
        }
    }

    Err(NusbError::NoHidInterface)
}

/// An open bootloader HID interface
pub struct HidDevice {
    interface: Interface,
    interface_num: u8,
    in_ep: Endpoint<Interrupt, In>,
    out_ep: Option<Endpoint<Interrupt, Out>>,
}

impl HidDevice {
    /// Open a device and claim its HID interface
    ///
    /// Any kernel HID driver bound to the interface is detached first.
    pub fn open(info: &nusb::DeviceInfo) -> Result<Self> {
        log::debug!(
            "Opening {:04X}:{:04X} at {}",
            info.vendor_id(),
            info.product_id(),
            path_of(info)
        );

        let device = info
            .open()
            .wait()
            .map_err(|e| NusbError::OpenFailed(e.to_string()))?;

        let layout = find_hid_interface(&device)?;
        log::debug!(
            "Using interface {} (IN 0x{:02X}, OUT {})",
            layout.interface_num,
            layout.in_ep,
            layout
                .out_ep
                .map_or("via control pipe".to_string(), |ep| format!("0x{:02X}", ep))
        );

        let interface = device
            .detach_and_claim_interface(layout.interface_num)
            .wait()
            .map_err(|e| NusbError::ClaimFailed(e.to_string()))?;

        let in_ep = interface
            .endpoint::<Interrupt, In>(layout.in_ep)
            .map_err(|e| NusbError::ClaimFailed(e.to_string()))?;
        let out_ep = layout
            .out_ep
            .map(|addr| interface.endpoint::<Interrupt, Out>(addr))
            .transpose()
            .map_err(|e| NusbError::ClaimFailed(e.to_string()))?;

        Ok(Self {
            interface,
            interface_num: layout.interface_num,
            in_ep,
            out_ep,
        })
    }

    /// Send a report (without the report-ID byte) and return bytes accepted
    fn send(&mut self, report_id: u8, report: &[u8]) -> Result<usize> {
        match &mut self.out_ep {
            Some(out_ep) => {
                let mut buf = Buffer::new(report.len());
                buf.extend_from_slice(report);
                let completion = out_ep.transfer_blocking(buf, WRITE_TIMEOUT);
                completion.status?;
                Ok(completion.actual_len)
            }
            None => {
                self.interface
                    .control_out(
                        ControlOut {
                            control_type: ControlType::Class,
                            recipient: Recipient::Interface,
                            request: HID_SET_REPORT,
                            value: (HID_REPORT_TYPE_OUTPUT << 8) | report_id as u16,
                            index: self.interface_num as u16,
                            data: report,
                        },
                        WRITE_TIMEOUT,
                    )
                    .wait()?;
                Ok(report.len())
            }
        }
    }
}

impl HidTransport for HidDevice {
    fn write_report(&mut self, frame: &[u8]) -> std::result::Result<usize, TransportError> {
        let Some((&report_id, report)) = frame.split_first() else {
            return Ok(0);
        };
        let written = self.send(report_id, report)?;
        log::trace!("USB write {} bytes", written);
        // The report-ID byte counts as written, as with hidapi.
        Ok(written + 1)
    }

    fn read_report(
        &mut self,
        buf: &mut [u8],
        timeout: Duration,
    ) -> std::result::Result<usize, TransportError> {
        let max_packet_size = self.in_ep.max_packet_size();
        // Request length must be multiple of max packet size
        let request_len = buf.len().div_ceil(max_packet_size) * max_packet_size;
        let mut in_buf = Buffer::new(request_len);
        in_buf.set_requested_len(request_len);

        let completion = self.in_ep.transfer_blocking(in_buf, timeout);
        let data = completion.into_result().map_err(NusbError::from)?;

        let received = std::cmp::min(data.len(), buf.len());
        buf[..received].copy_from_slice(&data[..received]);

        log::trace!("USB read {} bytes", received);
        Ok(received)
    }
}
