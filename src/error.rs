//! Crate-level error type for the embedding boundary.
//!
//! Internal programming violations (a corrupt microcode table index, an
//! out-of-range register enum) are never represented here: those are bugs
//! and are handled with `debug_assert!`/`panic!` at the point of detection,
//! per the "programming violations are never surfaced to the guest" rule.
//! `EmulatorError` only covers failures an embedder can reasonably recover
//! from: bad media, bad firmware images, bad configuration.

use thiserror::Error;

/// Result alias used for every fallible operation at the embedding boundary.
pub type Result<T> = std::result::Result<T, EmulatorError>;

#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error("floppy image for drive {drive} has {size} bytes, which does not match any known PC floppy geometry")]
    InvalidFloppyImage { drive: u8, size: usize },

    #[error("drive index {0} out of range (0..=3)")]
    InvalidDriveIndex(u8),

    #[error("ROM image is {actual} bytes, expected {expected}")]
    RomSizeMismatch { expected: usize, actual: usize },

    #[error("I/O error loading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
