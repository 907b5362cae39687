//! # Command Slot Table
//!
//! Fixed set of reusable hardware command slots. A slot is either free
//! (never bound, or rolled back), bound to a live command, or bound to a
//! finished command and therefore reclaimable.
//!
//! Reclamation picks the least recently bound reclaimable slot. A slot
//! whose command is still live is never handed out.

use std::collections::VecDeque;

use accel_core::{CommandId, CuIndex, SlotIndex};

/// One command slot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Slot {
    /// Bound to a command that has not finished
    pub in_use: bool,
    /// Compute unit of the bound command
    pub cu: Option<CuIndex>,
    /// Bound command, live or finished
    pub command: Option<CommandId>,
}

impl Slot {
    /// Never bound, or rolled back
    pub fn is_free(&self) -> bool {
        self.command.is_none()
    }

    /// Bound to a finished command
    pub fn is_reclaimable(&self) -> bool {
        !self.in_use && self.command.is_some()
    }
}

/// Slot chosen for a new command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotGrant {
    /// Slot to bind
    pub slot: SlotIndex,
    /// Finished command whose record must be dropped, if the slot was reclaimed
    pub evicted: Option<CommandId>,
}

/// Fixed-size slot table with LRU reclamation
#[derive(Debug)]
pub struct SlotTable {
    slots: Vec<Slot>,
    /// Bind order, least recent first
    lru: VecDeque<SlotIndex>,
}

impl SlotTable {
    /// Create `count` free slots
    pub fn new(count: u32) -> Self {
        Self {
            slots: vec![Slot::default(); count as usize],
            lru: VecDeque::with_capacity(count as usize),
        }
    }

    /// Number of slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Whether the table has no slots
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Look up a slot
    pub fn get(&self, slot: SlotIndex) -> Option<&Slot> {
        self.slots.get(slot.as_usize())
    }

    /// Pick a free slot, else the least recently bound reclaimable one
    pub fn find_available(&self) -> Option<SlotGrant> {
        if let Some(pos) = self.slots.iter().position(Slot::is_free) {
            return Some(SlotGrant {
                slot: SlotIndex::new(pos as u32),
                evicted: None,
            });
        }

        self.lru
            .iter()
            .copied()
            .find(|s| self.slots[s.as_usize()].is_reclaimable())
            .map(|slot| SlotGrant {
                slot,
                evicted: self.slots[slot.as_usize()].command,
            })
    }

    /// Bind a live command
    pub fn bind(&mut self, slot: SlotIndex, cu: CuIndex, command: CommandId) {
        self.slots[slot.as_usize()] = Slot {
            in_use: true,
            cu: Some(cu),
            command: Some(command),
        };
        self.lru.retain(|s| *s != slot);
        self.lru.push_back(slot);
    }

    /// The bound command finished; the slot becomes reclaimable
    pub fn mark_done(&mut self, slot: SlotIndex) {
        if let Some(s) = self.slots.get_mut(slot.as_usize()) {
            s.in_use = false;
        }
    }

    /// Drop the binding entirely
    pub fn unbind(&mut self, slot: SlotIndex) {
        if let Some(s) = self.slots.get_mut(slot.as_usize()) {
            *s = Slot::default();
        }
        self.lru.retain(|s| *s != slot);
    }

    /// Slots bound to live commands
    pub fn in_use_count(&self) -> usize {
        self.slots.iter().filter(|s| s.in_use).count()
    }

    /// Slots that can take a new command without blocking
    pub fn available_count(&self) -> usize {
        self.slots.len() - self.in_use_count()
    }
}
