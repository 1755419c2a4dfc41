//! Error kinds surfaced by the core.
//!
//! Propagation is local to each component: fallible operations return tagged
//! results and the caller decides whether a failure is fatal. The panic path
//! is the only global failure channel.

use core::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Page allocator, descriptor list, or a static pool is empty.
    OutOfMemory,
    /// A mapping (or another exclusive resource) already covers the target.
    Conflict,
    /// A virtual address is outside the range the operation permits.
    BadVirtualAddress,
    /// A caller-supplied argument is malformed.
    InvalidArgument,
    /// The named object does not exist.
    NotFound,
    /// The device reported an I/O failure.
    Io,
    /// The firmware returned a non-zero error code.
    Firmware(isize),
    /// An executable image failed validation.
    BadExecutable,
    /// A device rejected the driver's initialization sequence.
    DeviceRefused,
}

pub type Result<T> = core::result::Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::Conflict => write!(f, "resource conflict"),
            Self::BadVirtualAddress => write!(f, "bad virtual address"),
            Self::InvalidArgument => write!(f, "invalid argument"),
            Self::NotFound => write!(f, "not found"),
            Self::Io => write!(f, "i/o error"),
            Self::Firmware(e) => write!(f, "firmware error {}", e),
            Self::BadExecutable => write!(f, "bad executable"),
            Self::DeviceRefused => write!(f, "device refused initialization"),
        }
    }
}
