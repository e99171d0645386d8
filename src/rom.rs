/*!
rom - loading BIOS and floppy images from the filesystem.

The `Bus`'s own `bus::ram::Rom`/`bus::fdc::Fdc765` types hold the decoded
in-memory images; this module is the file-I/O boundary that reads bytes off
disk and turns them into the crate's `EmulatorError` on failure, per the
External-errors category of the error handling design.
*/

use std::fs;
use std::path::Path;

use crate::error::{EmulatorError, Result};

/// Read a BIOS ROM image from `path`. Size validation happens downstream in
/// `bus::ram::Rom::from_image`; this just turns I/O failures into
/// `EmulatorError::Io`.
pub fn load_bios<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    read_file(path)
}

/// Read a floppy disk image from `path`. Geometry validation happens
/// downstream in `bus::fdc::Fdc765::load_image`.
pub fn load_floppy_image<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    read_file(path)
}

fn read_file<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let path = path.as_ref();
    fs::read(path).map_err(|source| EmulatorError::Io {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_surfaces_io_error() {
        let err = load_bios("/nonexistent/path/to/bios.bin").unwrap_err();
        assert!(matches!(err, EmulatorError::Io { .. }));
    }

    #[test]
    fn existing_file_reads_back_its_bytes() {
        let mut path = std::env::temp_dir();
        path.push("pcxt_core_rom_test_load.bin");
        {
            let mut file = fs::File::create(&path).unwrap();
            file.write_all(&[0xEA, 0x00, 0xFF]).unwrap();
        }
        let bytes = load_bios(&path).unwrap();
        assert_eq!(bytes, vec![0xEA, 0x00, 0xFF]);
        fs::remove_file(&path).ok();
    }
}
