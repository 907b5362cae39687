//! # Session
//!
//! A session multiplexes client submissions onto its command slot table and
//! owns the buffer pools created through it.
//!
//! ## Locking
//!
//! One `parking_lot` mutex guards the slot table, the record table (with
//! its error sub-table), the utilization tracker and the per-unit
//! outstanding counts. Three condition variables share that mutex:
//!
//! - `work_item_done`: some command reached a terminal state
//! - `slot_freed`: a slot became free or reclaimable
//! - `cu_done`: a compute unit's outstanding count dropped
//!
//! Pool lists use a separate spin lock and are never touched while the
//! session mutex is held. The dispatch collaborator is always called with
//! the session mutex released.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use accel_core::{
    CommandId, CommandOutcome, CommandState, CuIndex, Error, PoolId, Result, SlotIndex,
};
use accel_hal::{Completion, DispatchRequest};
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::config::{PoolConfig, SessionConfig};
use crate::device::DeviceContext;
use crate::pool::{BufferObject, BufferPool, PoolStats};
use crate::records::{CommandRecord, FailedCommand, RecordTable};
use crate::slots::{Slot, SlotTable};
use crate::utilization::{CuLoad, UtilizationTracker};

// =============================================================================
// STATISTICS
// =============================================================================

/// Session statistics snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Commands handed to the device
    pub submitted: u64,
    /// Commands that reached a terminal state
    pub completed: u64,
    /// Terminal commands that landed in the error table
    pub failed: u64,
    /// Completions rejected as stale, duplicate or non-terminal
    pub rejected: u64,
    /// Slots taken over from a finished command
    pub reclaimed: u64,
    /// Submissions the dispatcher refused
    pub dispatch_failures: u64,
    /// Commands still queued
    pub queued: usize,
    /// Completion notifications not yet consumed by `work_item_done`
    pub unclaimed: u32,
    /// Slots bound to a queued command
    pub slots_in_use: usize,
}

/// Result of offering a polled completion to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Routed {
    Applied,
    Rejected(Error),
    NotOwned,
}

// =============================================================================
// SESSION STATE
// =============================================================================

#[derive(Debug)]
struct SessionState {
    slots: SlotTable,
    records: RecordTable,
    utilization: UtilizationTracker,
    outstanding: BTreeMap<CuIndex, u32>,
    unclaimed: u32,
    stats: SessionStats,
}

impl SessionState {
    fn new(slot_count: u32, units: impl IntoIterator<Item = CuIndex>) -> Self {
        Self {
            slots: SlotTable::new(slot_count),
            records: RecordTable::new(),
            utilization: UtilizationTracker::new(units),
            outstanding: BTreeMap::new(),
            unclaimed: 0,
            stats: SessionStats::default(),
        }
    }

    fn outstanding(&self, cu: CuIndex) -> u32 {
        self.outstanding.get(&cu).copied().unwrap_or(0)
    }

    /// Record a queued command under the first drawn identifier whose
    /// counter is not held by a live record
    fn insert_fresh(
        &mut self,
        mut draw: impl FnMut() -> CommandId,
        cu: CuIndex,
        slot: SlotIndex,
    ) -> CommandId {
        loop {
            let id = draw();
            match self.records.insert(id, cu, slot) {
                Ok(()) => return id,
                Err(_) => log::debug!("counter of {} still live, redrawing", id),
            }
        }
    }

    /// Feed a finished command into the utilization tracker
    ///
    /// Tracker errors are logged only; the command is already finished.
    fn track_completion(&mut self, cu: CuIndex, state: CommandState) {
        if state == CommandState::CoprocessorCrashed {
            if let Err(e) = self.utilization.record_crash(cu) {
                log::warn!("crash on untracked {}: {}", cu, e);
            }
        }
        if let Err(e) = self.utilization.record_completion(cu) {
            log::warn!("completion on untracked {}: {}", cu, e);
        }
    }
}

// =============================================================================
// SESSION
// =============================================================================

/// A client session on one device
pub struct Session {
    number: u32,
    device: Arc<DeviceContext>,
    cu: CuIndex,
    config: SessionConfig,
    closed: AtomicBool,
    state: Mutex<SessionState>,
    work_item_done: Condvar,
    slot_freed: Condvar,
    cu_done: Condvar,
    pools: spin::Mutex<Vec<Arc<BufferPool>>>,
    next_pool: AtomicU64,
}

/// Open a session on `cu` with the default configuration
pub fn open_session(device: &Arc<DeviceContext>, cu: CuIndex) -> Result<Arc<Session>> {
    Session::open(device, cu, SessionConfig::default())
}

/// Close a session, waking everything blocked on it
pub fn close_session(session: Arc<Session>) {
    session.close();
}

impl Session {
    /// Open a session on `cu`
    ///
    /// A compute unit without the `SHARED` flag is claimed for the lifetime
    /// of the session; a second open fails with `ComputeUnitBusy`.
    pub fn open(device: &Arc<DeviceContext>, cu: CuIndex, config: SessionConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let exclusive = !device.device().compute_unit(cu)?.is_shared();
        let units = device.device().compute_units().iter().map(|unit| unit.index);

        let session = Arc::new(Self {
            number: device.next_session_number(),
            device: Arc::clone(device),
            cu,
            state: Mutex::new(SessionState::new(config.slot_count, units)),
            config,
            closed: AtomicBool::new(false),
            work_item_done: Condvar::new(),
            slot_freed: Condvar::new(),
            cu_done: Condvar::new(),
            pools: spin::Mutex::new(Vec::new()),
            next_pool: AtomicU64::new(1),
        });

        if let Err(e) = device.register(&session, exclusive) {
            // Never registered: make drop a no-op.
            session.closed.store(true, Ordering::Release);
            log::debug!("{}: open on {} refused: {}", device.device().index(), cu, e);
            return Err(e);
        }

        log::info!(
            "session {} opened on {}/{} ({} slots{})",
            session.number,
            device.device().index(),
            cu,
            session.config.slot_count,
            if exclusive { ", exclusive" } else { "" }
        );
        Ok(session)
    }

    /// Session number, unique per device
    pub fn number(&self) -> u32 {
        self.number
    }

    /// Compute unit the session was opened on
    pub fn compute_unit(&self) -> CuIndex {
        self.cu
    }

    /// Device context
    pub fn device(&self) -> &Arc<DeviceContext> {
        &self.device
    }

    /// Configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Whether `close` has run
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(Error::SessionClosed)
        } else {
            Ok(())
        }
    }

    /// Block on `cv` until notified or past `deadline`; true on timeout
    fn wait(
        &self,
        cv: &Condvar,
        guard: &mut MutexGuard<'_, SessionState>,
        deadline: Option<Instant>,
    ) -> bool {
        match deadline {
            Some(deadline) => cv.wait_until(guard, deadline).timed_out(),
            None => {
                cv.wait(guard);
                false
            },
        }
    }

    fn notify_completion(&self) {
        self.work_item_done.notify_all();
        self.slot_freed.notify_all();
        self.cu_done.notify_all();
    }

    // =========================================================================
    // SUBMISSION
    // =========================================================================

    /// Commands may target the session's own unit or any shared unit
    fn check_target(&self, cu: CuIndex) -> Result<()> {
        if cu == self.cu {
            return Ok(());
        }
        if self.device.device().compute_unit(cu)?.is_shared() {
            Ok(())
        } else {
            Err(Error::ComputeUnitBusy)
        }
    }

    /// Submit a command to `cu`
    ///
    /// Binds a free slot, or the least recently used slot whose command has
    /// finished. With neither available the caller blocks until a slot is
    /// freed, or until `slot_wait_timeout` elapses. Returns as soon as the
    /// dispatcher accepts the command.
    pub fn submit(&self, cu: CuIndex, payload: &[u8]) -> Result<CommandId> {
        if payload.len() > self.config.max_payload {
            return Err(Error::PayloadTooLarge);
        }
        self.check_target(cu)?;

        let deadline = self
            .config
            .slot_wait_timeout
            .and_then(|timeout| Instant::now().checked_add(timeout));

        let mut state = self.state.lock();
        let mut timed_out = false;
        let grant = loop {
            self.ensure_open()?;
            if let Some(grant) = state.slots.find_available() {
                break grant;
            }
            if timed_out {
                return Err(Error::SlotWaitTimeout);
            }
            timed_out = self.wait(&self.slot_freed, &mut state, deadline);
        };

        if let Some(evicted) = grant.evicted {
            state.records.remove(evicted);
            state.stats.reclaimed += 1;
            log::debug!(
                "session {}: reclaiming {} from finished {}",
                self.number,
                grant.slot,
                evicted
            );
        }

        let id = state.insert_fresh(|| self.device.next_id(), cu, grant.slot);
        state.slots.bind(grant.slot, cu, id);
        *state.outstanding.entry(cu).or_insert(0) += 1;
        state.stats.submitted += 1;
        drop(state);

        let request = DispatchRequest {
            cu,
            slot: grant.slot,
            command: id,
            payload,
        };
        if let Err(e) = self.device.dispatcher().dispatch(&request) {
            log::warn!("session {}: dispatch of {} to {} failed: {}", self.number, id, cu, e);
            self.rollback(id, cu, grant.slot);
            return Err(Error::SubmissionFailed);
        }

        // A close racing the dispatch has already discarded the record.
        if self.is_closed() {
            log::warn!("session {}: closed while dispatching {}", self.number, id);
            return Err(Error::SessionClosed);
        }

        log::trace!("session {}: {} queued on {} in {}", self.number, id, cu, grant.slot);
        Ok(id)
    }

    fn rollback(&self, id: CommandId, cu: CuIndex, slot: SlotIndex) {
        let mut state = self.state.lock();
        state.stats.submitted = state.stats.submitted.saturating_sub(1);
        state.stats.dispatch_failures += 1;
        // A concurrent close already discarded everything.
        if state.records.remove(id).is_some() {
            state.slots.unbind(slot);
            if let Some(n) = state.outstanding.get_mut(&cu) {
                *n = n.saturating_sub(1);
            }
        }
        drop(state);
        self.slot_freed.notify_all();
        self.cu_done.notify_all();
    }

    // =========================================================================
    // COMPLETION
    // =========================================================================

    fn apply(&self, state: &mut SessionState, id: CommandId, outcome: CommandOutcome) -> Result<()> {
        let (cu, slot) = match state.records.finish(id, outcome) {
            Ok(record) => (record.cu, record.slot),
            Err(e) => {
                state.stats.rejected += 1;
                log::warn!("session {}: rejecting completion for {}: {}", self.number, id, e);
                return Err(e);
            },
        };

        state.slots.mark_done(slot);
        if let Some(n) = state.outstanding.get_mut(&cu) {
            *n = n.saturating_sub(1);
        }
        state.unclaimed = state.unclaimed.saturating_add(1);
        state.stats.completed += 1;

        if outcome.is_failure() {
            state.stats.failed += 1;
            log::warn!(
                "session {}: {} on {} finished {} ({})",
                self.number,
                id,
                cu,
                outcome.state,
                outcome.return_code
            );
        } else {
            log::debug!("session {}: {} on {} completed", self.number, id, cu);
        }

        state.track_completion(cu, outcome.state);
        Ok(())
    }

    /// Signaled completion path: finish `id` with a terminal state
    ///
    /// Fails with `InvalidState` for an unknown, stale or already finished
    /// identifier, and with `InvalidParameter` for a non-terminal state.
    pub fn complete(&self, id: CommandId, state: CommandState, return_code: i32) -> Result<()> {
        let mut guard = self.state.lock();
        self.apply(&mut guard, id, CommandOutcome::new(state, return_code))?;
        drop(guard);
        self.notify_completion();
        Ok(())
    }

    pub(crate) fn route_completion(&self, completion: &Completion) -> Routed {
        let mut state = self.state.lock();
        if !state.records.contains(completion.command) {
            return Routed::NotOwned;
        }
        match self.apply(&mut state, completion.command, completion.outcome()) {
            Ok(()) => {
                drop(state);
                self.notify_completion();
                Routed::Applied
            },
            Err(e) => Routed::Rejected(e),
        }
    }

    /// Poll the device for completions, routing them to their sessions
    pub fn poll_completions(&self) -> Result<usize> {
        self.device.poll_completions()
    }

    // =========================================================================
    // WAITING
    // =========================================================================

    /// Wait until `id` reaches a terminal state
    ///
    /// Fails with `Timeout` when `timeout` elapses first; the command keeps
    /// running. A reclaimed or unknown identifier fails with `InvalidState`.
    pub fn wait_for(&self, id: CommandId, timeout: Duration) -> Result<CommandOutcome> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        let mut timed_out = false;
        loop {
            self.ensure_open()?;
            if let Some(outcome) = state.records.get(id)?.outcome() {
                return Ok(outcome);
            }
            if timed_out {
                return Err(Error::Timeout);
            }
            timed_out = self.wait(&self.work_item_done, &mut state, deadline);
        }
    }

    /// Wait for any completion and consume its notification
    ///
    /// Returns the number of notifications still unconsumed.
    pub fn work_item_done(&self, timeout: Duration) -> Result<u32> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        let mut timed_out = false;
        loop {
            self.ensure_open()?;
            if state.unclaimed > 0 {
                state.unclaimed -= 1;
                return Ok(state.unclaimed);
            }
            if timed_out {
                return Err(Error::Timeout);
            }
            timed_out = self.wait(&self.work_item_done, &mut state, deadline);
        }
    }

    /// Wait until this session has nothing outstanding on `cu`
    pub fn wait_cu_idle(&self, cu: CuIndex, timeout: Duration) -> Result<()> {
        self.device.device().compute_unit(cu)?;
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        let mut timed_out = false;
        loop {
            self.ensure_open()?;
            if state.outstanding(cu) == 0 {
                return Ok(());
            }
            if timed_out {
                return Err(Error::Timeout);
            }
            timed_out = self.wait(&self.cu_done, &mut state, deadline);
        }
    }

    /// Records of several commands, optionally once all have finished
    pub fn cu_cmd_status(
        &self,
        ids: &[CommandId],
        wait_all: bool,
        timeout: Duration,
    ) -> Result<Vec<CommandRecord>> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        let mut timed_out = false;
        loop {
            self.ensure_open()?;
            let records = ids
                .iter()
                .map(|id| state.records.get(*id).copied())
                .collect::<Result<Vec<_>>>()?;
            if !wait_all || records.iter().all(|r| r.finished) {
                return Ok(records);
            }
            if timed_out {
                return Err(Error::Timeout);
            }
            timed_out = self.wait(&self.work_item_done, &mut state, deadline);
        }
    }

    // =========================================================================
    // INSPECTION
    // =========================================================================

    /// Record of one command
    pub fn record(&self, id: CommandId) -> Result<CommandRecord> {
        self.state.lock().records.get(id).copied()
    }

    /// State of one slot
    pub fn slot(&self, slot: SlotIndex) -> Option<Slot> {
        self.state.lock().slots.get(slot).copied()
    }

    /// Take the error table contents, oldest first
    pub fn drain_errors(&self) -> Vec<FailedCommand> {
        self.state.lock().records.drain_errors()
    }

    /// Entries in the error table
    pub fn error_count(&self) -> usize {
        self.state.lock().records.errors().len()
    }

    /// Statistics snapshot
    pub fn stats(&self) -> SessionStats {
        let state = self.state.lock();
        SessionStats {
            queued: state.records.queued_count(),
            unclaimed: state.unclaimed,
            slots_in_use: state.slots.in_use_count(),
            ..state.stats
        }
    }

    // =========================================================================
    // UTILIZATION
    // =========================================================================

    /// Take one sample: a busy tick for units with outstanding commands,
    /// an idle tick for the rest
    pub fn sample_utilization(&self) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        let mut state = self.state.lock();
        for unit in self.device.device().compute_units() {
            let outstanding = state.outstanding(unit.index);
            let busy = u32::from(outstanding > 0);
            state.utilization.record_commands(unit.index, outstanding)?;
            state.utilization.record_sample(unit.index, busy, 1 - busy)?;
        }
        Ok(())
    }

    /// Feed externally measured ticks for `cu`
    pub fn record_sample(&self, cu: CuIndex, busy_ticks: u32, idle_ticks: u32) -> Result<()> {
        self.state
            .lock()
            .utilization
            .record_sample(cu, busy_ticks, idle_ticks)
    }

    /// Fold the current window of `cu` early
    pub fn finalize_window(&self, cu: CuIndex) -> Result<Option<u16>> {
        self.state.lock().utilization.finalize_window(cu)
    }

    /// Compute units from least to most loaded, suspects last
    pub fn utilization_rank(&self) -> Vec<CuIndex> {
        self.state.lock().utilization.rank()
    }

    /// Load of one compute unit
    pub fn cu_load(&self, cu: CuIndex) -> Result<CuLoad> {
        self.state.lock().utilization.load(cu).cloned()
    }

    /// Busiest compute unit as of the last finalized window
    pub fn slowest_cu(&self) -> Option<CuIndex> {
        self.state.lock().utilization.slowest()
    }

    /// Forget the crashes of `cu`
    pub fn clear_suspect(&self, cu: CuIndex) -> Result<()> {
        self.state.lock().utilization.clear_suspect(cu)
    }

    // =========================================================================
    // BUFFER POOLS
    // =========================================================================

    /// Allocate a buffer pool owned by this session
    pub fn create_pool(&self, config: PoolConfig) -> Result<PoolId> {
        self.ensure_open()?;
        let id = PoolId::new(self.next_pool.fetch_add(1, Ordering::Relaxed));
        let pool = BufferPool::new(id, &self.device, config)?;

        let mut pools = self.pools.lock();
        // `close` marks the session before taking the list.
        if self.is_closed() {
            drop(pools);
            drop(pool);
            return Err(Error::SessionClosed);
        }
        pools.push(pool);
        Ok(id)
    }

    fn pool(&self, id: PoolId) -> Result<Arc<BufferPool>> {
        self.pools
            .lock()
            .iter()
            .find(|pool| pool.id() == id)
            .cloned()
            .ok_or(Error::NotFound)
    }

    /// Take a buffer from a pool; fails fast with `PoolExhausted`
    pub fn acquire_buffer(&self, pool: PoolId) -> Result<BufferObject> {
        self.ensure_open()?;
        self.pool(pool)?.acquire()
    }

    /// Another reference to an acquired buffer
    pub fn retain_buffer(&self, buffer: &BufferObject) -> BufferObject {
        buffer.retain()
    }

    /// Give back one reference; true if the buffer returned to its pool
    pub fn release_buffer(&self, buffer: BufferObject) -> bool {
        buffer.release()
    }

    /// Statistics of one pool
    pub fn pool_stats(&self, pool: PoolId) -> Result<PoolStats> {
        Ok(self.pool(pool)?.stats())
    }

    /// Statistics of every pool, in creation order
    pub fn all_pool_stats(&self) -> Vec<PoolStats> {
        self.pools.lock().iter().map(|pool| pool.stats()).collect()
    }

    // =========================================================================
    // TEARDOWN
    // =========================================================================

    /// Close the session
    ///
    /// Wakes every waiter with `SessionClosed`, discards the command tables
    /// and drops the session's pools. Buffers still held by callers keep
    /// their pool alive until released. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        let mut state = self.state.lock();
        let queued = state.records.queued_count();
        if queued > 0 {
            log::warn!(
                "session {}: closing with {} outstanding command(s)",
                self.number,
                queued
            );
        }
        state.records.clear();
        state.slots = SlotTable::new(self.config.slot_count);
        state.outstanding.clear();
        let stats = state.stats;
        drop(state);
        self.notify_completion();

        let pools = core::mem::take(&mut *self.pools.lock());
        for pool in pools {
            let pool_stats = pool.stats();
            if pool_stats.busy > 0 {
                log::warn!(
                    "session {}: pool '{}' dropped with {} busy buffer(s)",
                    self.number,
                    pool_stats.name,
                    pool_stats.busy
                );
            }
        }

        self.device.unregister(self.number);
        log::info!(
            "session {} closed: {} submitted, {} completed, {} failed",
            self.number,
            stats.submitted,
            stats.completed,
            stats.failed
        );
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

impl core::fmt::Debug for Session {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Session")
            .field("number", &self.number)
            .field("device", &self.device.device().index())
            .field("cu", &self.cu)
            .field("slots", &self.config.slot_count)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use std::sync::mpsc::{self, Receiver, Sender};

    use accel_core::{BankIndex, ByteSize, IdGenerator};
    use accel_hal::sim::SimDevice;
    use accel_hal::{DeviceBuffer, DeviceMemory, Dispatcher};
    use hashbrown::HashSet;

    use super::*;
    use crate::config::MAX_PAYLOAD_BYTES;

    const CU0: CuIndex = CuIndex::new(0);
    const CU1: CuIndex = CuIndex::new(1);
    const LONG: Duration = Duration::from_secs(5);
    const SETTLE: Duration = Duration::from_millis(50);

    fn context() -> (Arc<SimDevice>, Arc<DeviceContext>) {
        let _ = env_logger::builder().is_test(true).try_init();
        let sim = Arc::new(SimDevice::new(SimDevice::reference_device()));
        let ctx = DeviceContext::new(sim.device().clone(), sim.clone(), sim.clone());
        (sim, ctx)
    }

    fn setup(config: SessionConfig) -> (Arc<SimDevice>, Arc<DeviceContext>, Arc<Session>) {
        let (sim, ctx) = context();
        let session = Session::open(&ctx, CU0, config).unwrap();
        (sim, ctx, session)
    }

    fn slots(n: u32) -> SessionConfig {
        SessionConfig::default().with_slots(n)
    }

    #[test]
    fn test_submits_within_slot_count_are_distinct() {
        let (sim, _ctx, session) = setup(slots(4));
        let ids: HashSet<CommandId> = (0..4).map(|_| session.submit(CU0, b"cmd").unwrap()).collect();
        assert_eq!(ids.len(), 4);
        assert_eq!(sim.pending_count(), 4);

        let stats = session.stats();
        assert_eq!(stats.submitted, 4);
        assert_eq!(stats.queued, 4);
        assert_eq!(stats.slots_in_use, 4);
    }

    #[test]
    fn test_round_trip() {
        let (sim, _ctx, session) = setup(slots(2));
        let id = session.submit(CU0, b"scale").unwrap();
        assert_eq!(sim.pending()[0].payload, b"scale".to_vec());

        sim.finish(id, CommandState::Completed, 0).unwrap();
        assert_eq!(session.poll_completions().unwrap(), 1);

        let outcome = session.wait_for(id, LONG).unwrap();
        assert_eq!(outcome, CommandOutcome::new(CommandState::Completed, 0));
        assert_eq!(outcome.into_result(), Ok(0));

        let record = session.record(id).unwrap();
        assert!(session.slot(record.slot).unwrap().is_reclaimable());
        assert_eq!(session.error_count(), 0);
    }

    #[test]
    fn test_blocked_submit_reuses_errored_slot() {
        let (sim, ctx, session) = setup(slots(2));
        let first = session.submit(CU0, b"1").unwrap();
        let _second = session.submit(CU0, b"2").unwrap();

        let blocked = {
            let session = Arc::clone(&session);
            thread::spawn(move || session.submit(CU0, b"3"))
        };
        thread::sleep(SETTLE);
        assert!(!blocked.is_finished());
        assert_eq!(sim.pending_count(), 2);

        sim.finish(first, CommandState::Error, -5).unwrap();
        assert_eq!(ctx.poll_completions().unwrap(), 1);

        let third = blocked.join().unwrap().unwrap();
        assert_eq!(session.record(third).unwrap().slot, SlotIndex::new(0));
        assert_eq!(session.stats().reclaimed, 1);

        // The slot was rebound, so the main record is gone.
        assert_eq!(session.wait_for(first, LONG), Err(Error::InvalidState));

        let errors = session.drain_errors();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].id, first);
        assert_eq!(errors[0].state, CommandState::Error);
        assert_eq!(errors[0].return_code, -5);
        assert_eq!(session.error_count(), 0);
    }

    #[test]
    fn test_negative_return_code_kept_until_reclaimed() {
        let (_sim, _ctx, session) = setup(slots(2));
        let id = session.submit(CU0, b"").unwrap();
        session.complete(id, CommandState::Completed, -3).unwrap();

        assert_eq!(session.record(id).unwrap().return_code, -3);
        assert_eq!(session.error_count(), 1);
        assert_eq!(
            session.wait_for(id, LONG).unwrap().into_result(),
            Err(Error::CommandError(-3))
        );
    }

    #[test]
    fn test_finished_slot_reclaimed_without_blocking() {
        let (_sim, _ctx, session) = setup(slots(1));
        let first = session.submit(CU0, b"").unwrap();
        session.complete(first, CommandState::Completed, 0).unwrap();

        let second = session.submit(CU0, b"").unwrap();
        assert_ne!(first, second);
        assert_eq!(session.record(first), Err(Error::InvalidState));
        assert_eq!(session.stats().reclaimed, 1);
    }

    #[test]
    fn test_slot_wait_timeout() {
        let config = slots(1).with_slot_wait_timeout(Duration::from_millis(20));
        let (_sim, _ctx, session) = setup(config);
        session.submit(CU0, b"").unwrap();
        assert_eq!(session.submit(CU0, b""), Err(Error::SlotWaitTimeout));
        assert_eq!(session.stats().submitted, 1);
    }

    #[test]
    fn test_payload_too_large() {
        let (sim, _ctx, session) = setup(slots(1));
        let payload = vec![0u8; MAX_PAYLOAD_BYTES + 1];
        assert_eq!(session.submit(CU0, &payload), Err(Error::PayloadTooLarge));
        assert_eq!(session.stats().slots_in_use, 0);
        assert_eq!(sim.dispatched(), 0);
    }

    #[test]
    fn test_dispatch_failure_rolls_back() {
        let (sim, _ctx, session) = setup(slots(1));
        sim.fail_next_dispatch();
        assert_eq!(session.submit(CU0, b""), Err(Error::SubmissionFailed));

        let stats = session.stats();
        assert_eq!(stats.submitted, 0);
        assert_eq!(stats.dispatch_failures, 1);
        assert_eq!(stats.queued, 0);
        assert!(session.slot(SlotIndex::new(0)).unwrap().is_free());

        // The only slot is usable again.
        session.submit(CU0, b"").unwrap();
    }

    #[test]
    fn test_wait_for_signaled_completion() {
        let (_sim, _ctx, session) = setup(slots(2));
        let id = session.submit(CU0, b"").unwrap();

        let completer = {
            let session = Arc::clone(&session);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                session.complete(id, CommandState::Completed, 7)
            })
        };
        let outcome = session.wait_for(id, LONG).unwrap();
        assert_eq!(outcome.return_code, 7);
        completer.join().unwrap().unwrap();
    }

    #[test]
    fn test_wait_for_timeout_leaves_command_queued() {
        let (_sim, _ctx, session) = setup(slots(2));
        let id = session.submit(CU0, b"").unwrap();
        assert_eq!(
            session.wait_for(id, Duration::from_millis(20)),
            Err(Error::Timeout)
        );
        assert_eq!(session.record(id).unwrap().state, CommandState::Queued);
    }

    #[test]
    fn test_wait_for_unknown_id() {
        let (_sim, _ctx, session) = setup(slots(2));
        assert_eq!(
            session.wait_for(CommandId::new(99, 1), Duration::ZERO),
            Err(Error::InvalidState)
        );
    }

    #[test]
    fn test_stale_and_duplicate_completions_rejected() {
        let (sim, ctx, session) = setup(slots(2));
        let id = session.submit(CU0, b"").unwrap();
        let stale = CommandId::new(id.counter(), id.salt().wrapping_add(1));

        sim.inject(Completion::new(stale, CommandState::Completed, 0));
        assert_eq!(ctx.poll_completions().unwrap(), 0);
        assert_eq!(ctx.stale_completions(), 1);
        assert!(!session.record(id).unwrap().finished);

        assert_eq!(
            session.complete(stale, CommandState::Completed, 0),
            Err(Error::InvalidState)
        );
        session.complete(id, CommandState::Completed, 0).unwrap();
        assert_eq!(
            session.complete(id, CommandState::Error, -1),
            Err(Error::InvalidState)
        );
        assert_eq!(session.record(id).unwrap().state, CommandState::Completed);
        assert_eq!(session.stats().rejected, 2);
    }

    #[test]
    fn test_non_terminal_completion_rejected() {
        let (_sim, _ctx, session) = setup(slots(2));
        let id = session.submit(CU0, b"").unwrap();
        assert_eq!(
            session.complete(id, CommandState::Queued, 0),
            Err(Error::InvalidParameter)
        );
        assert!(!session.record(id).unwrap().finished);
    }

    #[test]
    fn test_work_item_done_counts_notifications() {
        let (_sim, _ctx, session) = setup(slots(2));
        let a = session.submit(CU0, b"").unwrap();
        let b = session.submit(CU0, b"").unwrap();
        session.complete(a, CommandState::Completed, 0).unwrap();
        session.complete(b, CommandState::Abort, 0).unwrap();

        assert_eq!(session.work_item_done(Duration::ZERO), Ok(1));
        assert_eq!(session.work_item_done(Duration::ZERO), Ok(0));
        assert_eq!(
            session.work_item_done(Duration::from_millis(10)),
            Err(Error::Timeout)
        );
    }

    #[test]
    fn test_wait_cu_idle() {
        let (sim, ctx, session) = setup(slots(4));
        session.submit(CU0, b"").unwrap();
        session.submit(CU0, b"").unwrap();
        assert_eq!(
            session.wait_cu_idle(CU0, Duration::from_millis(10)),
            Err(Error::Timeout)
        );

        let waiter = {
            let session = Arc::clone(&session);
            thread::spawn(move || session.wait_cu_idle(CU0, LONG))
        };
        thread::sleep(SETTLE);
        sim.finish_oldest(CommandState::Completed, 0).unwrap();
        ctx.poll_completions().unwrap();
        thread::sleep(SETTLE);
        assert!(!waiter.is_finished());

        sim.finish_oldest(CommandState::Completed, 0).unwrap();
        ctx.poll_completions().unwrap();
        assert_eq!(waiter.join().unwrap(), Ok(()));

        assert_eq!(session.wait_cu_idle(CU1, Duration::ZERO), Ok(()));
        assert_eq!(
            session.wait_cu_idle(CuIndex::new(9), Duration::ZERO),
            Err(Error::NotFound)
        );
    }

    #[test]
    fn test_cu_cmd_status() {
        let (_sim, _ctx, session) = setup(slots(4));
        let a = session.submit(CU0, b"").unwrap();
        let b = session.submit(CU0, b"").unwrap();
        session.complete(a, CommandState::Completed, 1).unwrap();

        let records = session.cu_cmd_status(&[a, b], false, Duration::ZERO).unwrap();
        assert!(records[0].finished);
        assert_eq!(records[0].return_code, 1);
        assert!(!records[1].finished);

        assert_eq!(
            session.cu_cmd_status(&[a, b], true, Duration::from_millis(10)),
            Err(Error::Timeout)
        );

        session.complete(b, CommandState::Timeout, 0).unwrap();
        let records = session.cu_cmd_status(&[a, b], true, LONG).unwrap();
        assert!(records.iter().all(|r| r.finished));
        assert_eq!(records[1].state, CommandState::Timeout);
    }

    #[test]
    fn test_close_wakes_waiters() {
        let (_sim, ctx, session) = setup(slots(1));
        let id = session.submit(CU0, b"").unwrap();

        let submitter = {
            let session = Arc::clone(&session);
            thread::spawn(move || session.submit(CU0, b""))
        };
        let waiter = {
            let session = Arc::clone(&session);
            thread::spawn(move || session.wait_for(id, LONG))
        };
        thread::sleep(SETTLE);
        assert_eq!(ctx.open_sessions(), 1);

        session.close();
        assert_eq!(submitter.join().unwrap(), Err(Error::SessionClosed));
        assert_eq!(waiter.join().unwrap(), Err(Error::SessionClosed));
        assert_eq!(ctx.open_sessions(), 0);
        assert_eq!(session.submit(CU0, b""), Err(Error::SessionClosed));

        // Idempotent.
        session.close();
        assert_eq!(ctx.open_sessions(), 0);
    }

    #[test]
    fn test_exclusive_compute_unit() {
        let (_sim, ctx) = context();
        let first = open_session(&ctx, CU1).unwrap();
        assert_eq!(open_session(&ctx, CU1).unwrap_err(), Error::ComputeUnitBusy);
        assert_eq!(ctx.open_sessions(), 1);

        // Shared units accept any number of sessions.
        let shared_a = open_session(&ctx, CU0).unwrap();
        let shared_b = open_session(&ctx, CU0).unwrap();
        assert_eq!(shared_a.submit(CU1, b""), Err(Error::ComputeUnitBusy));
        assert!(first.submit(CU0, b"").is_ok());

        close_session(first);
        assert!(open_session(&ctx, CU1).is_ok());
        drop((shared_a, shared_b));
        assert_eq!(ctx.open_sessions(), 0);
    }

    #[test]
    fn test_open_rejects_unknown_unit_and_bad_config() {
        let (_sim, ctx) = context();
        assert_eq!(
            open_session(&ctx, CuIndex::new(7)).unwrap_err(),
            Error::NotFound
        );
        assert_eq!(
            Session::open(&ctx, CU0, slots(0)).unwrap_err(),
            Error::InvalidParameter
        );
        assert_eq!(ctx.open_sessions(), 0);
    }

    #[test]
    fn test_completions_routed_across_sessions() {
        let (sim, ctx) = context();
        let s1 = open_session(&ctx, CU0).unwrap();
        let s2 = open_session(&ctx, CU0).unwrap();
        let a = s1.submit(CU0, b"a").unwrap();
        let b = s2.submit(CU0, b"b").unwrap();

        sim.finish(b, CommandState::Completed, 2).unwrap();
        sim.finish(a, CommandState::Completed, 1).unwrap();
        assert_eq!(ctx.poll_completions().unwrap(), 2);

        assert_eq!(s1.wait_for(a, LONG).unwrap().return_code, 1);
        assert_eq!(s2.wait_for(b, LONG).unwrap().return_code, 2);
        assert_eq!(s1.record(b), Err(Error::InvalidState));
        assert_eq!(ctx.stale_completions(), 0);
    }

    #[test]
    fn test_completion_after_close_is_stale() {
        let (sim, ctx, session) = setup(slots(1));
        let id = session.submit(CU0, b"").unwrap();
        session.close();
        sim.finish(id, CommandState::Completed, 0).unwrap();
        assert_eq!(ctx.poll_completions().unwrap(), 0);
        assert_eq!(ctx.stale_completions(), 1);
    }

    #[test]
    fn test_coprocessor_crash_marks_unit_suspect() {
        let (sim, ctx) = context();
        let session = open_session(&ctx, CU1).unwrap();
        let id = session.submit(CU1, b"").unwrap();
        sim.finish(id, CommandState::CoprocessorCrashed, 0).unwrap();
        ctx.poll_completions().unwrap();

        assert_eq!(
            session.wait_for(id, LONG).unwrap().into_result(),
            Err(Error::CoprocessorCrash)
        );
        assert!(session.cu_load(CU1).unwrap().is_suspect());
        assert_eq!(session.utilization_rank(), vec![CU0, CU1]);

        session.clear_suspect(CU1).unwrap();
        assert!(!session.cu_load(CU1).unwrap().is_suspect());
    }

    #[test]
    fn test_sample_utilization() {
        let (_sim, ctx, session) = setup(slots(2));
        session.submit(CU0, b"").unwrap();
        ctx.sample_utilization();

        let cu0 = session.cu_load(CU0).unwrap();
        assert_eq!((cu0.busy_ticks, cu0.idle_ticks, cu0.sampled_commands), (1, 0, 1));
        let cu1 = session.cu_load(CU1).unwrap();
        assert_eq!((cu1.busy_ticks, cu1.idle_ticks), (0, 1));

        assert_eq!(session.finalize_window(CU0), Ok(Some(1000)));
        assert_eq!(session.finalize_window(CU1), Ok(Some(0)));
        assert_eq!(session.slowest_cu(), Some(CU0));
        assert_eq!(session.utilization_rank(), vec![CU1, CU0]);
    }

    #[test]
    fn test_buffer_pools() {
        let (sim, _ctx, session) = setup(slots(1));
        let pool = session
            .create_pool(PoolConfig::new(0, ByteSize::KIB_4, 2).named("frames"))
            .unwrap();
        assert_eq!(sim.live_buffers(), 2);

        let a = session.acquire_buffer(pool).unwrap();
        let b = session.acquire_buffer(pool).unwrap();
        assert_eq!(session.acquire_buffer(pool).unwrap_err(), Error::PoolExhausted);

        let shared = session.retain_buffer(&a);
        assert!(!session.release_buffer(a));
        assert_eq!(session.pool_stats(pool).unwrap().free, 0);
        assert!(session.release_buffer(shared));
        assert_eq!(session.pool_stats(pool).unwrap().free, 1);

        assert_eq!(session.all_pool_stats().len(), 1);
        assert_eq!(
            session.pool_stats(PoolId::new(42)).unwrap_err(),
            Error::NotFound
        );

        // A held buffer outlives the session's pool list.
        session.close();
        assert_eq!(sim.live_buffers(), 2);
        drop(b);
        assert_eq!(sim.live_buffers(), 0);
    }

    #[test]
    fn test_concurrent_submitters() {
        const THREADS: usize = 4;
        const PER_THREAD: usize = 25;
        const TOTAL: usize = THREADS * PER_THREAD;

        let (sim, ctx, session) = setup(slots(4));

        let completer = {
            let (sim, ctx) = (Arc::clone(&sim), Arc::clone(&ctx));
            thread::spawn(move || {
                let mut done = 0;
                let mut max_pending = 0;
                while done < TOTAL {
                    max_pending = max_pending.max(sim.pending_count());
                    sim.finish_oldest(CommandState::Completed, 0);
                    done += ctx.poll_completions().unwrap();
                    thread::yield_now();
                }
                max_pending
            })
        };

        let submitters: Vec<_> = (0..THREADS)
            .map(|_| {
                let session = Arc::clone(&session);
                thread::spawn(move || {
                    (0..PER_THREAD)
                        .map(|_| session.submit(CU0, b"work").unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let ids: HashSet<CommandId> = submitters
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        let max_pending = completer.join().unwrap();

        assert_eq!(ids.len(), TOTAL);
        assert!(max_pending <= 4);
        assert_eq!(sim.dispatched(), TOTAL as u64);

        let stats = session.stats();
        assert_eq!(stats.completed, TOTAL as u64);
        assert_eq!(stats.queued, 0);
    }

    /// Device whose dispatch and allocate calls park until released
    struct GatedDevice {
        sim: Arc<SimDevice>,
        entered: Mutex<Sender<()>>,
        release: Mutex<Receiver<()>>,
    }

    impl GatedDevice {
        fn new(sim: Arc<SimDevice>) -> (Arc<Self>, Receiver<()>, Sender<()>) {
            let (entered_tx, entered_rx) = mpsc::channel();
            let (release_tx, release_rx) = mpsc::channel();
            let gated = Arc::new(Self {
                sim,
                entered: Mutex::new(entered_tx),
                release: Mutex::new(release_rx),
            });
            (gated, entered_rx, release_tx)
        }

        fn pass(&self) {
            let _ = self.entered.lock().send(());
            let _ = self.release.lock().recv();
        }
    }

    impl Dispatcher for GatedDevice {
        fn dispatch(&self, request: &DispatchRequest<'_>) -> Result<()> {
            self.pass();
            self.sim.dispatch(request)
        }

        fn poll(&self, out: &mut Vec<Completion>) -> Result<usize> {
            self.sim.poll(out)
        }
    }

    impl DeviceMemory for GatedDevice {
        fn allocate(&self, bank: BankIndex, size: ByteSize, device_only: bool) -> Result<DeviceBuffer> {
            self.pass();
            self.sim.allocate(bank, size, device_only)
        }

        fn free(&self, buffer: DeviceBuffer) {
            self.sim.free(buffer);
        }
    }

    #[test]
    fn test_close_during_dispatch_fails_submit() {
        let sim = Arc::new(SimDevice::new(SimDevice::reference_device()));
        let (gated, entered, release) = GatedDevice::new(Arc::clone(&sim));
        let ctx = DeviceContext::new(sim.device().clone(), gated, sim.clone());
        let session = Session::open(&ctx, CU0, slots(2)).unwrap();

        let submitter = {
            let session = Arc::clone(&session);
            thread::spawn(move || session.submit(CU0, b"late"))
        };
        entered.recv().unwrap();
        session.close();
        release.send(()).unwrap();

        assert_eq!(submitter.join().unwrap(), Err(Error::SessionClosed));
        assert_eq!(session.stats().queued, 0);
    }

    #[test]
    fn test_close_during_pool_allocation_discards_pool() {
        let sim = Arc::new(SimDevice::new(SimDevice::reference_device()));
        let (gated, entered, release) = GatedDevice::new(Arc::clone(&sim));
        let ctx = DeviceContext::new(sim.device().clone(), sim.clone(), gated);
        let session = Session::open(&ctx, CU0, slots(1)).unwrap();

        let creator = {
            let session = Arc::clone(&session);
            thread::spawn(move || session.create_pool(PoolConfig::new(0, ByteSize::KIB_4, 1)))
        };
        entered.recv().unwrap();
        session.close();
        release.send(()).unwrap();

        assert_eq!(creator.join().unwrap(), Err(Error::SessionClosed));
        assert!(session.all_pool_stats().is_empty());
        assert_eq!(sim.live_buffers(), 0);
    }

    #[test]
    fn test_submits_across_counter_wraparound() {
        let _ = env_logger::builder().is_test(true).try_init();
        let sim = Arc::new(SimDevice::new(SimDevice::reference_device()));
        let ids = IdGenerator::with_seed_and_counter(3, u32::MAX - 1);
        let ctx = DeviceContext::with_ids(sim.device().clone(), sim.clone(), sim.clone(), ids);
        let session = Session::open(&ctx, CU0, slots(4)).unwrap();

        let submitted: Vec<CommandId> = (0..4).map(|_| session.submit(CU0, b"").unwrap()).collect();
        let counters: Vec<u32> = submitted.iter().map(|id| id.counter()).collect();
        assert_eq!(counters, vec![u32::MAX, 0, 1, 2]);

        for id in &submitted {
            sim.finish(*id, CommandState::Completed, 0).unwrap();
        }
        assert_eq!(ctx.poll_completions().unwrap(), 4);
        for id in &submitted {
            assert_eq!(session.wait_for(*id, LONG).unwrap().return_code, 0);
        }
    }

    #[test]
    fn test_live_counter_is_redrawn() {
        let mut state = SessionState::new(2, [CU0]);
        let live = CommandId::new(7, 11);
        state.records.insert(live, CU0, SlotIndex::new(0)).unwrap();

        // Same counter from a later era, then a fresh one.
        let mut draws = vec![CommandId::new(8, 5), CommandId::new(7, -3)];
        let id = state.insert_fresh(|| draws.pop().unwrap(), CU0, SlotIndex::new(1));
        assert_eq!(id, CommandId::new(8, 5));
        assert!(draws.is_empty());
        assert!(state.records.contains(live));
        assert!(state.records.contains(id));
    }

    #[test]
    fn test_untracked_unit_does_not_fail_completion() {
        let mut state = SessionState::new(1, [CU0]);
        state.track_completion(CU1, CommandState::CoprocessorCrashed);
        assert_eq!(state.utilization.load(CU1), Err(Error::NotFound));

        state.track_completion(CU0, CommandState::CoprocessorCrashed);
        let load = state.utilization.load(CU0).unwrap();
        assert_eq!((load.completed, load.crashes), (1, 1));
    }
}
