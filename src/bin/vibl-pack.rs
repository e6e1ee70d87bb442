//! vibl-pack - Wrap a raw application image into a firmware package
//!
//! Usage: vibl-pack [--uid <HEX16|any>] <INPUT> <OUTPUT>

use clap::Parser;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use vibl_core::package::{self, FirmwarePackage, HEADER_LEN};
use vibl_core::protocol::Uid;

#[derive(Parser, Debug)]
#[command(name = "vibl-pack")]
#[command(author, version, about = "Create a VIALFW01 firmware package", long_about = None)]
struct Args {
    /// Board UID the package is locked to (16 hex digits), or "any"
    #[arg(long, value_name = "HEX16|any", default_value = "any", value_parser = parse_uid)]
    uid: Uid,

    /// Raw application image
    input: PathBuf,

    /// Package to write
    output: PathBuf,
}

fn parse_uid(s: &str) -> Result<Uid, String> {
    Uid::parse_hex(s).ok_or_else(|| format!("expected 16 hex digits or \"any\", got \"{}\"", s))
}

#[derive(Debug, thiserror::Error)]
enum PackError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("{} is empty", .0.display())]
    Empty(PathBuf),
    #[error("{} is already a firmware package", .0.display())]
    AlreadyPackaged(PathBuf),
}

fn pack(uid: Uid, input: &Path, output: &Path) -> Result<Vec<u8>, PackError> {
    let image = std::fs::read(input).map_err(|source| PackError::Read {
        path: input.to_path_buf(),
        source,
    })?;
    if image.is_empty() {
        return Err(PackError::Empty(input.to_path_buf()));
    }
    // Double wrapping would flash the inner header as code
    if FirmwarePackage::parse(&image).is_ok_and(|p| !p.is_legacy()) {
        return Err(PackError::AlreadyPackaged(input.to_path_buf()));
    }

    let file = package::build(uid, &image);
    std::fs::write(output, &file).map_err(|source| PackError::Write {
        path: output.to_path_buf(),
        source,
    })?;
    Ok(file)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    match pack(args.uid, &args.input, &args.output) {
        Ok(file) => {
            log::debug!("Header is {} bytes", HEADER_LEN);
            let payload = &file[HEADER_LEN..];
            println!("Package:  {}", args.output.display());
            if args.uid.is_wildcard() {
                println!("Target:   any device");
            } else {
                println!("Target:   {}", args.uid);
            }
            println!("Payload:  {} bytes", payload.len());
            println!("SHA-256:  {}", hex(&package::digest(payload)));
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {}", e);
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("vibl-pack-{}-{}", std::process::id(), name))
    }

    #[test]
    fn test_parse_uid() {
        assert_eq!(parse_uid("any").unwrap(), Uid::WILDCARD);
        assert_eq!(
            parse_uid("0102030405060708").unwrap(),
            Uid([1, 2, 3, 4, 5, 6, 7, 8])
        );
        assert!(parse_uid("0102").is_err());
        assert!(parse_uid("zz02030405060708").is_err());
    }

    #[test]
    fn test_pack_produces_loadable_package() {
        let input = temp_path("app.bin");
        let output = temp_path("app.vfw");
        let image: Vec<u8> = (0..700u32).map(|i| i as u8).collect();
        std::fs::write(&input, &image).unwrap();

        let target = Uid([0xAB; 8]);
        pack(target, &input, &output).unwrap();

        let file = std::fs::read(&output).unwrap();
        let pkg = FirmwarePackage::load(&file).unwrap();
        assert_eq!(pkg.target(), target);
        assert_eq!(pkg.payload(), &image[..]);

        // Packaging the package again is refused
        assert!(matches!(
            pack(target, &output, &temp_path("twice.vfw")),
            Err(PackError::AlreadyPackaged(_))
        ));

        std::fs::remove_file(input).ok();
        std::fs::remove_file(output).ok();
    }

    #[test]
    fn test_pack_rejects_empty_and_missing_input() {
        let input = temp_path("empty.bin");
        std::fs::write(&input, b"").unwrap();
        assert!(matches!(
            pack(Uid::WILDCARD, &input, &temp_path("empty.vfw")),
            Err(PackError::Empty(_))
        ));
        std::fs::remove_file(input).ok();

        assert!(matches!(
            pack(Uid::WILDCARD, Path::new("/nonexistent/app.bin"), &temp_path("x.vfw")),
            Err(PackError::Read { .. })
        ));
    }

    #[test]
    fn test_hex() {
        assert_eq!(hex(&[0x00, 0xab, 0x10]), "00ab10");
    }
}
