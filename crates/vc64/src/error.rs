//! Error taxonomy for the emulation core.
//!
//! Config errors are reported synchronously and change no state. Image
//! errors reject the whole file; there is no partial attach. Runtime traps
//! (CPU jam) leave the machine paused with its state intact for
//! inspection. The core never aborts the process.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A required ROM image is missing or has the wrong size.
    #[error("bad ROM image: {0}")]
    Rom(String),

    /// The requested machine model is not known.
    #[error("unknown machine model: {0}")]
    UnknownModel(String),

    /// The CRT hardware type is not one of the emulated variants.
    #[error("unsupported cartridge hardware type {0}")]
    UnsupportedCartridge(u16),

    /// A container file is truncated or structurally invalid.
    #[error("corrupt {kind} image: {reason}")]
    Image {
        kind: &'static str,
        reason: String,
    },

    /// A snapshot failed its header or layout checks. The machine state
    /// is unchanged.
    #[error("snapshot rejected: {0}")]
    Snapshot(String),

    /// The CPU hit a jamming opcode and stopped.
    #[error("CPU jammed at ${0:04X}")]
    CpuJam(u16),

    /// The drive could not decode the inserted disk back into sectors.
    #[error("disk decode failed: {0}")]
    DiskDecode(String),
}

impl Error {
    /// Shorthand for image errors.
    pub fn image(kind: &'static str, reason: impl Into<String>) -> Self {
        Error::Image {
            kind,
            reason: reason.into(),
        }
    }
}
