//! # Error Handling
//!
//! Error taxonomy shared by every layer of the session stack.
//!
//! - Errors are typed and `Copy`, so they cross lock boundaries freely
//! - Recoverable conditions (`PoolExhausted`, `SlotWaitTimeout`, `Timeout`)
//!   are distinct from programming errors (`InvalidState`)
//! - Terminal command failures carry the device return code

use core::fmt;

// =============================================================================
// RESULT TYPE
// =============================================================================

/// Session layer result type alias
pub type Result<T> = core::result::Result<T, Error>;

// =============================================================================
// ERROR ENUM
// =============================================================================

/// Unified error type for the session layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    // =========================================================================
    // Resource Errors
    // =========================================================================
    /// No free buffer left in the pool
    PoolExhausted,
    /// No command slot became reclaimable within the configured wait
    SlotWaitTimeout,
    /// Device memory allocation failed while building a pool
    OutOfDeviceMemory,

    // =========================================================================
    // Command Errors
    // =========================================================================
    /// Command did not finish in time
    Timeout,
    /// Device reported an error return code
    CommandError(i32),
    /// Device aborted the command
    CommandAbort,
    /// Co-processor kernel crashed while running the command
    CoprocessorCrash,
    /// Dispatch collaborator rejected the command
    SubmissionFailed,
    /// Payload exceeds the command buffer capacity
    PayloadTooLarge,

    // =========================================================================
    // Usage Errors
    // =========================================================================
    /// Unknown or stale command identifier, or a buffer released too often
    InvalidState,
    /// Invalid parameter provided
    InvalidParameter,
    /// Compute unit, memory bank or pool not found
    NotFound,
    /// Exclusive compute unit already claimed by another session
    ComputeUnitBusy,
    /// Session has been closed
    SessionClosed,
    /// Background thread could not be started
    ThreadSpawn,
}

impl Error {
    /// Whether the caller may reasonably retry or keep waiting
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::PoolExhausted | Self::SlotWaitTimeout | Self::Timeout
        )
    }

    /// Whether the error is a terminal state reported by the device
    pub const fn is_command_failure(&self) -> bool {
        matches!(
            self,
            Self::CommandError(_) | Self::CommandAbort | Self::CoprocessorCrash
        )
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            // Resource
            Self::PoolExhausted => write!(f, "buffer pool exhausted"),
            Self::SlotWaitTimeout => write!(f, "timed out waiting for a free command slot"),
            Self::OutOfDeviceMemory => write!(f, "out of device memory"),

            // Command
            Self::Timeout => write!(f, "command timed out"),
            Self::CommandError(code) => write!(f, "command failed with return code {}", code),
            Self::CommandAbort => write!(f, "command aborted by device"),
            Self::CoprocessorCrash => write!(f, "co-processor kernel crashed"),
            Self::SubmissionFailed => write!(f, "command submission failed"),
            Self::PayloadTooLarge => write!(f, "payload exceeds command buffer capacity"),

            // Usage
            Self::InvalidState => write!(f, "invalid state"),
            Self::InvalidParameter => write!(f, "invalid parameter"),
            Self::NotFound => write!(f, "resource not found"),
            Self::ComputeUnitBusy => write!(f, "compute unit claimed by another session"),
            Self::SessionClosed => write!(f, "session closed"),
            Self::ThreadSpawn => write!(f, "failed to spawn background thread"),
        }
    }
}

impl std::error::Error for Error {}
