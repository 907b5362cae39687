//! # Command Record Table
//!
//! Bookkeeping for outstanding and recently finished commands, keyed by the
//! identifier's counter. The salt stored in each record rejects stale
//! identifiers from an earlier counter era.
//!
//! Failed commands are copied into a separate error table that survives
//! slot reclamation until drained.

use std::time::Instant;

use accel_core::{CommandId, CommandOutcome, CommandState, CuIndex, Error, Result, SlotIndex};
use hashbrown::HashMap;

// =============================================================================
// RECORDS
// =============================================================================

/// State of one command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandRecord {
    /// Identifier
    pub id: CommandId,
    /// Compute unit
    pub cu: CuIndex,
    /// Bound slot
    pub slot: SlotIndex,
    /// Set once, never cleared
    pub finished: bool,
    /// Lifecycle state
    pub state: CommandState,
    /// Device return code, valid once finished
    pub return_code: i32,
    /// When the command was recorded
    pub submitted_at: Instant,
}

impl CommandRecord {
    fn queued(id: CommandId, cu: CuIndex, slot: SlotIndex) -> Self {
        Self {
            id,
            cu,
            slot,
            finished: false,
            state: CommandState::Queued,
            return_code: 0,
            submitted_at: Instant::now(),
        }
    }

    /// Terminal outcome, if finished
    pub fn outcome(&self) -> Option<CommandOutcome> {
        self.finished
            .then(|| CommandOutcome::new(self.state, self.return_code))
    }
}

/// Entry of the error table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailedCommand {
    /// Identifier
    pub id: CommandId,
    /// Compute unit
    pub cu: CuIndex,
    /// Slot the command ran in
    pub slot: SlotIndex,
    /// Terminal state
    pub state: CommandState,
    /// Device return code
    pub return_code: i32,
}

// =============================================================================
// TABLE
// =============================================================================

/// Command record table with error sub-table
#[derive(Debug, Default)]
pub struct RecordTable {
    records: HashMap<u32, CommandRecord>,
    errors: Vec<FailedCommand>,
}

impl RecordTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a queued command
    ///
    /// A finished record from an earlier era with the same counter is
    /// replaced. A live one is a collision and fails with `InvalidState`;
    /// the caller draws a new identifier.
    pub fn insert(&mut self, id: CommandId, cu: CuIndex, slot: SlotIndex) -> Result<()> {
        if let Some(existing) = self.records.get(&id.counter()) {
            if !existing.finished {
                return Err(Error::InvalidState);
            }
            log::debug!("evicting finished {} for reused counter", existing.id);
        }
        self.records
            .insert(id.counter(), CommandRecord::queued(id, cu, slot));
        Ok(())
    }

    /// Look up a record by full identifier
    pub fn get(&self, id: CommandId) -> Result<&CommandRecord> {
        self.records
            .get(&id.counter())
            .filter(|r| r.id == id)
            .ok_or(Error::InvalidState)
    }

    /// Whether the table holds this exact identifier
    pub fn contains(&self, id: CommandId) -> bool {
        self.get(id).is_ok()
    }

    /// Move a queued command to a terminal state
    pub fn finish(&mut self, id: CommandId, outcome: CommandOutcome) -> Result<&CommandRecord> {
        if !outcome.state.is_terminal() {
            return Err(Error::InvalidParameter);
        }
        let record = self
            .records
            .get_mut(&id.counter())
            .filter(|r| r.id == id)
            .ok_or(Error::InvalidState)?;
        if record.finished {
            return Err(Error::InvalidState);
        }

        record.finished = true;
        record.state = outcome.state;
        record.return_code = outcome.return_code;

        if outcome.is_failure() {
            self.errors.push(FailedCommand {
                id,
                cu: record.cu,
                slot: record.slot,
                state: outcome.state,
                return_code: outcome.return_code,
            });
        }
        Ok(record)
    }

    /// Remove a record by full identifier
    pub fn remove(&mut self, id: CommandId) -> Option<CommandRecord> {
        if self.records.get(&id.counter())?.id != id {
            return None;
        }
        self.records.remove(&id.counter())
    }

    /// Records currently held
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records not yet finished
    pub fn queued_count(&self) -> usize {
        self.records.values().filter(|r| !r.finished).count()
    }

    /// Error table contents, oldest first
    pub fn errors(&self) -> &[FailedCommand] {
        &self.errors
    }

    /// Take the error table contents
    pub fn drain_errors(&mut self) -> Vec<FailedCommand> {
        core::mem::take(&mut self.errors)
    }

    /// Drop every record
    pub fn clear(&mut self) {
        self.records.clear();
    }
}
