//! Error types for Sapling operations
//!
//! All Sapling errors are represented by the SapError enum. Every variant maps
//! onto one of the coarse result codes callers branch on (see [`ErrorKind`]),
//! while carrying enough context for debugging.

use std::error::Error;
use std::fmt;

/// Coarse result classes shared by every subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Pop or similar operation on an empty structure
    Empty,
    /// Index or buffer-capacity violation
    Range,
    /// Bad argument, cycle, unresolved handle, malformed input, poisoned structure
    Invalid,
    /// Allocation failure
    OutOfMemory,
    /// A collaborator lookup found no entry for an id
    NotFound,
}

/// Sapling error types with detailed context
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SapError {
    /// Operation requires at least one element
    Empty,

    /// Index outside the valid range of a structure
    IndexOutOfRange {
        /// The offending index
        index: usize,
        /// Length of the structure at the time of the call
        len: usize,
    },

    /// Caller-supplied buffer cannot hold the output
    BufferTooSmall {
        /// Bytes needed for the complete output
        required: usize,
        /// Bytes the caller provided
        capacity: usize,
    },

    /// Invalid argument or malformed input
    Invalid {
        /// Human-readable description
        reason: String,
    },

    /// Structure was left inconsistent by an earlier failure and must be reset
    Poisoned,

    /// Lookup by id found nothing
    NotFound {
        /// Which table was consulted
        what: &'static str,
        /// The id that was looked up
        id: u32,
    },

    /// Allocator refused a block
    OutOfMemory {
        /// Size of the refused block
        requested: u32,
        /// Bytes live in the allocator when the request was made
        live_bytes: u64,
        /// Allocator byte budget
        limit_bytes: u64,
    },
}

impl SapError {
    /// Shorthand for [`SapError::Invalid`].
    pub fn invalid(reason: impl Into<String>) -> Self {
        SapError::Invalid { reason: reason.into() }
    }

    /// The coarse class of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            SapError::Empty => ErrorKind::Empty,
            SapError::IndexOutOfRange { .. } | SapError::BufferTooSmall { .. } => ErrorKind::Range,
            SapError::Invalid { .. } | SapError::Poisoned => ErrorKind::Invalid,
            SapError::NotFound { .. } => ErrorKind::NotFound,
            SapError::OutOfMemory { .. } => ErrorKind::OutOfMemory,
        }
    }

    /// True for allocation failures, the only errors that poison a structure.
    pub fn is_oom(&self) -> bool {
        matches!(self, SapError::OutOfMemory { .. })
    }
}

impl fmt::Display for SapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SapError::Empty => write!(f, "Operation on empty sequence"),

            SapError::IndexOutOfRange { index, len } => {
                write!(f, "Index {} out of range for length {}", index, len)
            }

            SapError::BufferTooSmall { required, capacity } => {
                write!(f, "Buffer too small: {} bytes required, {} provided", required, capacity)
            }

            SapError::Invalid { reason } => write!(f, "Invalid argument: {}", reason),

            SapError::Poisoned => {
                write!(f, "Structure is poisoned by an earlier failure; reset it before use")
            }

            SapError::NotFound { what, id } => write!(f, "No {} with id {}", what, id),

            SapError::OutOfMemory { requested, live_bytes, limit_bytes } => {
                write!(f, "Out of memory: requested {} bytes with {} of {} bytes live",
                       requested, live_bytes, limit_bytes)
            }
        }
    }
}

impl Error for SapError {}

/// Result type alias for Sapling operations
pub type SapResult<T> = Result<T, SapError>;
