//! vibl bootloader for STM32F103 keyboards
//!
//! Lives in the first 16 KiB of flash. After every reset it decides, on the
//! reset clock and with nothing but PWR/BKP/GPIOB enabled, whether to start
//! the application at 0x0800_4000. Update mode is entered when:
//!
//! - the application stored the "enter bootloader" flag in `BKP_DR10`
//! - the application's initial stack pointer does not point into SRAM
//! - the key between PB12 (row) and PB13 (column) is held down
//!
//! In update mode the board enumerates as a vendor-defined HID device
//! (`1209:2301`, or `1209:BABE` with the `legacy` feature) whose serial number
//! carries the discovery marker and the board UID, and serves the flash
//! protocol until the host asks for a reboot.

#![no_std]
#![no_main]

mod hw;
mod usb;

use cortex_m::peripheral::SCB;
use cortex_m_rt::entry;
use defmt_rtt as _;
use panic_probe as _;
use stm32f1xx_hal::flash::{FlashSize, SectorSize};
use stm32f1xx_hal::pac;
use stm32f1xx_hal::prelude::*;
use stm32f1xx_hal::usb::{Peripheral, UsbBus};
use usb_device::prelude::*;
use usbd_hid::hid_class::HIDClass;
use vibl_core::boot::{
    BootConfig, BootDecision, BootDecisionEngine, MappedImage, MatrixTrigger, DEFAULT_APP_BASE,
};
use vibl_core::flag::BackupFlagStore;
use vibl_core::protocol::{Revision, Uid, USB_VID};
use vibl_core::server::{Action, FlashRegion, FlashServer, ServerConfig};

#[cfg(not(feature = "legacy"))]
const REVISION: Revision = Revision::VIAL;
#[cfg(feature = "legacy")]
const REVISION: Revision = Revision::LEGACY;

/// Answer to GET_UID. Boards sold as a set keep the wildcard; give each
/// board its own value to make packages refuse the wrong keyboard.
const KEYBOARD_UID: Uid = Uid::WILDCARD;

const REPORT_BYTES: u8 = REVISION.report_size as u8;
static REPORT_DESCRIPTOR: [u8; 27] = usb::report_descriptor::<REPORT_BYTES>();

#[entry]
fn main() -> ! {
    hw::early_init();

    let mut store = BackupFlagStore::new(hw::Dr10);
    // SAFETY: the application area is memory-mapped flash
    let image = unsafe { MappedImage::new(DEFAULT_APP_BASE as *const u32) };
    let mut trigger = MatrixTrigger::new(
        hw::TriggerRow::new(),
        hw::TriggerColumn::new(),
        hw::CycleDelay,
    );

    let outcome =
        BootDecisionEngine::new(BootConfig::default()).decide(&mut store, &image, Some(&mut trigger));
    defmt::info!(
        "flag={} image_valid={} trigger={}",
        defmt::Debug2Format(&outcome.flag),
        outcome.image_valid,
        outcome.trigger_fired
    );

    if outcome.decision == BootDecision::RunApplication {
        hw::early_deinit();
        start_application();
    }

    update_mode(outcome.insecure())
}

/// Point VTOR at the application, load its stack pointer and jump
#[inline(never)]
fn start_application() -> ! {
    defmt::info!("starting application at {=u32:#x}", DEFAULT_APP_BASE);
    let vt = DEFAULT_APP_BASE as *const u32;
    // SAFETY: the boot decision checked the initial stack pointer; nothing
    // set up by the bootloader is used after this point
    unsafe {
        let peripherals = cortex_m::Peripherals::steal();
        peripherals.SCB.vtor.write(DEFAULT_APP_BASE);
        cortex_m::asm::bootload(vt)
    }
}

/// Serve the flash protocol until REBOOT
fn update_mode(insecure: bool) -> ! {
    // SAFETY: the boot decision only used PWR, BKP and GPIOB through raw
    // register access; the HAL owns everything from here on
    let dp = unsafe { pac::Peripherals::steal() };

    let mut flash = dp.FLASH.constrain();
    let rcc = dp.RCC.constrain();
    let clocks = rcc
        .cfgr
        .use_hse(8.MHz())
        .sysclk(72.MHz())
        .pclk1(36.MHz())
        .freeze(&mut flash.acr);
    defmt::assert!(clocks.usbclk_valid());

    // Pull D+ low for a moment so the host notices a new device
    let mut gpioa = dp.GPIOA.split();
    let mut usb_dp = gpioa.pa12.into_push_pull_output(&mut gpioa.crh);
    usb_dp.set_low();
    cortex_m::asm::delay(clocks.sysclk().raw() / 100);

    let bus = UsbBus::new(Peripheral {
        usb: dp.USB,
        pin_dm: gpioa.pa11,
        pin_dp: usb_dp.into_floating_input(&mut gpioa.crh),
    });
    let mut hid = HIDClass::new(&bus, &REPORT_DESCRIPTOR, 1);

    let mut serial = [0u8; usb::SERIAL_LEN];
    let serial = usb::serial_number(&KEYBOARD_UID, &mut serial);
    let mut usb_dev = UsbDeviceBuilder::new(&bus, UsbVidPid(USB_VID, REVISION.usb_pid))
        .manufacturer("Vial")
        .product("vibl bootloader")
        .serial_number(serial)
        .device_class(0)
        .build();

    let config = ServerConfig {
        uid: KEYBOARD_UID,
        insecure,
        ..ServerConfig::new(REVISION, FlashRegion::STM32F103X8)
    };
    let writer = flash.writer(SectorSize::Sz1K, FlashSize::Sz64K);
    let mut server = FlashServer::new(hw::HalFlash::new(writer), config);
    let mut assembler = usb::ReportAssembler::new(&REVISION);
    let mut packet = [0u8; usb::PACKET_SIZE];

    defmt::info!("update mode: protocol {}, insecure={}", REVISION.name, insecure);

    loop {
        if !usb_dev.poll(&mut [&mut hid]) {
            continue;
        }
        let Ok(len) = hid.pull_raw_output(&mut packet) else {
            continue;
        };
        let Some(report) = assembler.push(&packet[..len]) else {
            continue;
        };

        match server.handle_report(report) {
            Ok(Action::None) => {}
            Ok(Action::Reply(reply)) => {
                if hid.push_raw_input(reply).is_err() {
                    defmt::warn!("reply dropped");
                }
            }
            Ok(Action::Reset) => SCB::sys_reset(),
            Err(e) => defmt::warn!("report rejected: {}", defmt::Display2Format(&e)),
        }
    }
}
