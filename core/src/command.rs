//! # Command Identity and State
//!
//! A command is identified by a generation-stamped handle: a rolling counter
//! plus a random salt. The counter keys the record table; the salt tells a
//! live command apart from a stale one that happened to reuse the counter
//! after wraparound.

use core::fmt;

use crate::error::{Error, Result};

// =============================================================================
// COMMAND IDENTIFIER
// =============================================================================

/// Identifier of one submitted command
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CommandId {
    counter: u32,
    salt: i32,
}

impl CommandId {
    /// Create from raw parts
    #[inline]
    pub const fn new(counter: u32, salt: i32) -> Self {
        Self { counter, salt }
    }

    /// Rolling counter part (record table key)
    #[inline]
    pub const fn counter(self) -> u32 {
        self.counter
    }

    /// Random salt part (generation stamp)
    #[inline]
    pub const fn salt(self) -> i32 {
        self.salt
    }

    /// Pack into a single u64, counter in the high half
    #[inline]
    pub const fn to_u64(self) -> u64 {
        ((self.counter as u64) << 32) | (self.salt as u32 as u64)
    }
}

impl fmt::Debug for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CommandId({}:{:+})", self.counter, self.salt)
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:+}", self.counter, self.salt)
    }
}

// =============================================================================
// COMMAND STATE
// =============================================================================

/// Lifecycle state of a command
///
/// `Queued` is the only non-terminal state a live command can be in.
/// `Invalid` marks an uninitialized record and is never observed after a
/// successful submit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum CommandState {
    /// Submitted to the device, not yet finished
    Queued = 0,
    /// Finished normally
    Completed = 1,
    /// Error during submission or execution
    Error = 2,
    /// Aborted by the device; the compute unit may or may not have run it
    Abort = 3,
    /// Device-side timeout waiting for the command to finish
    Timeout = 4,
    /// Co-processor kernel finished with an error return code
    CoprocessorError = 5,
    /// Co-processor kernel crashed
    CoprocessorCrashed = 6,
    /// Uninitialized record sentinel
    #[default]
    Invalid = 7,
}

impl CommandState {
    /// Whether no further transition can occur
    #[inline]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Queued | Self::Invalid)
    }

    /// Whether the state is a terminal failure kind
    #[inline]
    pub const fn is_error(self) -> bool {
        self.is_terminal() && !matches!(self, Self::Completed)
    }

    /// Short name for logs
    pub const fn name(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Abort => "abort",
            Self::Timeout => "timeout",
            Self::CoprocessorError => "coprocessor-error",
            Self::CoprocessorCrashed => "coprocessor-crashed",
            Self::Invalid => "invalid",
        }
    }
}

impl fmt::Display for CommandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// COMMAND OUTCOME
// =============================================================================

/// Terminal state and return code of a finished command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandOutcome {
    /// Terminal state
    pub state: CommandState,
    /// Device return code
    pub return_code: i32,
}

impl CommandOutcome {
    /// Create an outcome
    pub const fn new(state: CommandState, return_code: i32) -> Self {
        Self { state, return_code }
    }

    /// Whether this outcome belongs in the error sub-table
    pub const fn is_failure(&self) -> bool {
        self.state.is_error() || self.return_code < 0
    }

    /// Map onto the error taxonomy, yielding the return code on success
    pub fn into_result(self) -> Result<i32> {
        match self.state {
            CommandState::Completed if self.return_code >= 0 => Ok(self.return_code),
            CommandState::Completed | CommandState::Error | CommandState::CoprocessorError => {
                Err(Error::CommandError(self.return_code))
            },
            CommandState::Abort => Err(Error::CommandAbort),
            CommandState::Timeout => Err(Error::Timeout),
            CommandState::CoprocessorCrashed => Err(Error::CoprocessorCrash),
            CommandState::Queued | CommandState::Invalid => Err(Error::InvalidState),
        }
    }
}
