//! Flash command implementation

use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use vibl_core::client::{FlashError, FlashProgress};
use vibl_core::discovery::{discover, open_single, DiscoveryOptions};
use vibl_core::package::FirmwarePackage;
use vibl_core::transport::{HidEnumerator, TransportError};

use crate::cli::{Backend, Cli};

/// Progress reporter using an indicatif progress bar
struct IndicatifProgress {
    bar: Option<ProgressBar>,
}

impl IndicatifProgress {
    fn new() -> Self {
        Self { bar: None }
    }
}

impl FlashProgress for IndicatifProgress {
    fn start(&mut self, total_bytes: usize) {
        let pb = ProgressBar::new(total_bytes as u64);
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {percent:>3}% ({bytes_per_sec}, {eta}) Writing")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("#>-"),
        );
        self.bar = Some(pb);
    }

    fn update(&mut self, done: usize, _total: usize) {
        if let Some(pb) = &self.bar {
            pb.set_position(done as u64);
        }
    }

    fn finish(&mut self) {
        if let Some(pb) = self.bar.take() {
            pb.finish();
        }
    }
}

fn read_firmware(path: &Path) -> Result<Vec<u8>, FlashError> {
    std::fs::read(path).map_err(|source| FlashError::File {
        path: path.to_path_buf(),
        source,
    })
}

fn describe(path: &Path, package: &FirmwarePackage<'_>) {
    if package.is_legacy() {
        log::warn!(
            "{} is a raw binary: no target UID and no integrity hash. Wrap it with vibl-pack to get both.",
            path.display()
        );
    } else if package.pins_target() {
        log::info!(
            "Firmware package verified: {} bytes for device {}",
            package.payload().len(),
            package.target()
        );
    } else {
        log::info!(
            "Firmware package verified: {} bytes for any device",
            package.payload().len()
        );
    }
}

/// Start a thread that sets the returned flag after `secs` seconds
fn deadline(secs: u64) -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let setter = Arc::clone(&flag);
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_secs(secs));
        setter.store(true, Ordering::Relaxed);
    });
    flag
}

fn flash_with<E: HidEnumerator>(
    enumerator: &E,
    package: &FirmwarePackage<'_>,
    options: &DiscoveryOptions<'_>,
) -> Result<(), FlashError> {
    let mut session = if package.pins_target() {
        discover(enumerator, &package.target(), options)?
    } else {
        open_single(enumerator, options)?
    };

    let mut progress = IndicatifProgress::new();
    session.update(package, &mut progress)?;

    log::debug!(
        "{} of {} pages written",
        session.pages_written(),
        session.pages_total()
    );
    Ok(())
}

/// Run the flash command
///
/// The firmware is read and its hash checked before any device is touched.
pub fn run(cli: &Cli) -> Result<(), FlashError> {
    let bytes = read_firmware(&cli.firmware)?;
    let package = FirmwarePackage::load(&bytes)?;
    describe(&cli.firmware, &package);

    let revision = cli.protocol.revision();
    log::info!("Using protocol {}", revision);

    let cancel = match cli.wait {
        Some(secs) if secs > 0 => Some(deadline(secs)),
        _ => None,
    };
    let options = DiscoveryOptions {
        max_scans: (cli.wait == Some(0)).then_some(1),
        cancel: cancel.as_deref(),
        ..DiscoveryOptions::new(revision)
    };

    match cli.backend {
        #[cfg(feature = "nusb")]
        Backend::Nusb => flash_with(&vibl_nusb::NusbEnumerator::new(&revision), &package, &options),
        #[cfg(feature = "dummy")]
        Backend::Dummy => flash_with(&dummy_bus(revision), &package, &options),
        #[allow(unreachable_patterns)]
        other => Err(TransportError::Open(format!(
            "the {} backend is not compiled in",
            other.name()
        ))
        .into()),
    }
}

/// One simulated board in update mode
#[cfg(feature = "dummy")]
fn dummy_bus(revision: vibl_core::protocol::Revision) -> vibl_dummy::DummyBus {
    use vibl_dummy::{DummyBus, DummyConfig, DummyDevice};

    log::info!("Dummy backend: the image is written to a simulated device in memory");
    let config = DummyConfig {
        revision,
        ..Default::default()
    };
    DummyBus::new().with_device(DummyDevice::new("dummy:0", config))
}

#[cfg(all(test, feature = "dummy"))]
mod tests {
    use super::*;
    use clap::Parser;
    use std::path::PathBuf;
    use vibl_core::package::{self, PackageError};
    use vibl_core::protocol::Uid;

    fn temp_file(name: &str, contents: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("vibl-flash-{}-{}", std::process::id(), name));
        std::fs::write(&path, contents).unwrap();
        path
    }

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("vibl-flash").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_defaults() {
        let cli = parse(&["fw.bin"]);
        assert_eq!(cli.protocol, crate::cli::Protocol::Vial);
        assert_eq!(cli.backend, Backend::Nusb);
        assert_eq!(cli.wait, None);
        assert_eq!(cli.verbose, 0);
    }

    #[test]
    fn test_flash_package_to_dummy() {
        let file = package::build(Uid::WILDCARD, &[0x42; 3000]);
        let path = temp_file("ok.vfw", &file);
        let cli = parse(&["--backend", "dummy", "--wait", "0", path.to_str().unwrap()]);
        assert!(run(&cli).is_ok());
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_flash_raw_binary_legacy_protocol() {
        let path = temp_file("raw.bin", &[0x11; 2000]);
        let cli = parse(&[
            "--backend",
            "dummy",
            "--protocol",
            "legacy",
            "--wait",
            "0",
            path.to_str().unwrap(),
        ]);
        assert!(run(&cli).is_ok());
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_image_larger_than_device_fails() {
        let region = vibl_core::server::FlashRegion::STM32F103X8.size as usize;
        let file = package::build(Uid::WILDCARD, &vec![0x42; region + 64]);
        let path = temp_file("big.vfw", &file);
        let cli = parse(&["--backend", "dummy", "--wait", "0", path.to_str().unwrap()]);
        assert!(matches!(
            run(&cli),
            Err(FlashError::TransferRefused { .. })
        ));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_corrupt_package_fails_before_device() {
        let mut file = package::build(Uid::WILDCARD, &[0x42; 300]);
        let last = file.len() - 1;
        file[last] ^= 1;
        let path = temp_file("corrupt.vfw", &file);
        let cli = parse(&["--backend", "dummy", "--wait", "0", path.to_str().unwrap()]);
        assert!(matches!(
            run(&cli),
            Err(FlashError::Package(PackageError::Integrity))
        ));
        std::fs::remove_file(path).ok();
    }

    #[test]
    fn test_missing_file() {
        let cli = parse(&["--backend", "dummy", "/nonexistent/vibl/fw.bin"]);
        assert!(matches!(run(&cli), Err(FlashError::File { .. })));
    }

    #[test]
    fn test_pinned_package_without_matching_device() {
        let file = package::build(Uid([1, 2, 3, 4, 5, 6, 7, 8]), &[0x42; 300]);
        let path = temp_file("pinned.vfw", &file);
        let cli = parse(&["--backend", "dummy", "--wait", "0", path.to_str().unwrap()]);
        assert!(matches!(run(&cli), Err(FlashError::DeviceNotFound)));
        std::fs::remove_file(path).ok();
    }
}
