use std::{error::Error, fmt};

use crate::interval::Address;

#[derive(Debug)]
pub enum ShadowError {
    EmptyRegion {
        address: Address,
    },
    Unresolved {
        address: Address,
    },
    UnknownAddress,
    UnhandledByGcMoved {
        left: Address,
        right: Address,
    },
    UnhandledByGcMarked {
        left: Address,
        right: Address,
    },
    StaleObject {
        id: u64,
    },
    OutOfBounds {
        offset: usize,
        size: usize,
        object_size: usize,
    },
    Overlap {
        first: (Address, Address),
        second: (Address, Address),
    },
    AllocationOverlap {
        left: Address,
        right: Address,
        existing: (Address, Address),
    },
    OutOfOrder {
        before: Address,
        after: Address,
    },
    ArrayLayout {
        elem_size: usize,
        length: usize,
        object_size: usize,
    },
    MemoryRead {
        address: Address,
        size: usize,
    },
    Encoding(String),
    Trace {
        line: usize,
        message: String,
    },
    Io(std::io::Error),
}

impl ShadowError {
    /// Invariant violations mean the shadow model and the real runtime have
    /// diverged. Nothing computed after one of these can be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ShadowError::Unresolved { .. }
                | ShadowError::UnhandledByGcMoved { .. }
                | ShadowError::UnhandledByGcMarked { .. }
                | ShadowError::StaleObject { .. }
                | ShadowError::Overlap { .. }
                | ShadowError::AllocationOverlap { .. }
                | ShadowError::OutOfOrder { .. }
        )
    }
}

impl fmt::Display for ShadowError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShadowError::EmptyRegion { address } => {
                write!(f, "Cannot track an empty region at {:#x}", address)
            }
            ShadowError::Unresolved { address } => {
                write!(f, "Unable to resolve physical address {:#x}", address)
            }
            ShadowError::UnknownAddress => {
                write!(f, "Stack cell without memory cannot be resolved")
            }
            ShadowError::UnhandledByGcMoved { left, right } => write!(
                f,
                "Nodes unhandled by GC were unexpectedly moved: [{:#x}..{:#x}]",
                left, right
            ),
            ShadowError::UnhandledByGcMarked { left, right } => write!(
                f,
                "Nodes unhandled by GC were unexpectedly marked: [{:#x}..{:#x}]",
                left, right
            ),
            ShadowError::StaleObject { id } => {
                write!(f, "Object id {:#x} does not name a live object", id)
            }
            ShadowError::OutOfBounds {
                offset,
                size,
                object_size,
            } => write!(
                f,
                "Range [{}, {}) is outside of object of size {}",
                offset,
                offset + size,
                object_size
            ),
            ShadowError::Overlap { first, second } => write!(
                f,
                "Tracked regions overlap: [{:#x}..{:#x}] and [{:#x}..{:#x}]",
                first.0, first.1, second.0, second.1
            ),
            ShadowError::AllocationOverlap {
                left,
                right,
                existing,
            } => write!(
                f,
                "Allocation [{:#x}..{:#x}] overlaps tracked region [{:#x}..{:#x}]",
                left, right, existing.0, existing.1
            ),
            ShadowError::OutOfOrder { before, after } => write!(
                f,
                "Tree out of order: {:#x} stored before {:#x}",
                before, after
            ),
            ShadowError::ArrayLayout {
                elem_size,
                length,
                object_size,
            } => write!(
                f,
                "Array of {} elements of size {} does not fit object of size {}",
                length, elem_size, object_size
            ),
            ShadowError::MemoryRead { address, size } => {
                write!(f, "Failed to read {} bytes at {:#x}", size, address)
            }
            ShadowError::Encoding(msg) => write!(f, "Encoding error: {}", msg),
            ShadowError::Trace { line, message } => {
                write!(f, "Trace line {}: {}", line, message)
            }
            ShadowError::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl Error for ShadowError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            ShadowError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for ShadowError {
    fn from(err: std::io::Error) -> Self {
        ShadowError::Io(err)
    }
}

/// Escalates an invariant violation. Continuing with a shadow heap that
/// disagrees with the collector would corrupt every later result, so this
/// never returns.
#[track_caller]
pub fn fail_loud(err: ShadowError) -> ! {
    log::error!("{}", err);
    panic!("{}", err);
}
