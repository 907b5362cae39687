//! # Dispatch Interface
//!
//! Contract with the low-level dispatch path: bind a payload to a compute
//! unit through a command slot, and report finished commands back.

use accel_core::{CommandId, CommandOutcome, CommandState, CuIndex, Result, SlotIndex};

// =============================================================================
// REQUEST / COMPLETION
// =============================================================================

/// Request to run one command
#[derive(Debug, Clone, Copy)]
pub struct DispatchRequest<'a> {
    /// Target compute unit
    pub cu: CuIndex,
    /// Command slot the command is bound to
    pub slot: SlotIndex,
    /// Identifier the completion must echo back
    pub command: CommandId,
    /// Opaque command payload
    pub payload: &'a [u8],
}

/// A finished command reported by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Identifier from the originating request
    pub command: CommandId,
    /// Terminal state
    pub state: CommandState,
    /// Device return code
    pub return_code: i32,
}

impl Completion {
    /// Create a completion
    pub const fn new(command: CommandId, state: CommandState, return_code: i32) -> Self {
        Self {
            command,
            state,
            return_code,
        }
    }

    /// Outcome carried by this completion
    pub const fn outcome(&self) -> CommandOutcome {
        CommandOutcome::new(self.state, self.return_code)
    }
}

// =============================================================================
// DISPATCHER TRAIT
// =============================================================================

/// Low-level dispatch collaborator
///
/// `dispatch` must not call back into the session; completions are
/// reported through `poll` or pushed by the caller via the session's
/// signaled completion path.
pub trait Dispatcher: Send + Sync {
    /// Hand a command to the device
    fn dispatch(&self, request: &DispatchRequest<'_>) -> Result<()>;

    /// Append finished commands to `out`, returning how many were added
    fn poll(&self, out: &mut Vec<Completion>) -> Result<usize>;
}
