//! # Device Context
//!
//! Explicitly shared per-device state: the inventory, the identifier
//! generator, the two hardware collaborators, and the registry of open
//! sessions. Every session opened on the device holds an `Arc` to it.
//!
//! Sessions on one device share one dispatch collaborator, so polled
//! completions are drained here and routed to the session that owns each
//! identifier.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use accel_core::{CommandId, CuIndex, Error, IdGenerator, Result};
use accel_hal::{Completion, Device, DeviceMemory, Dispatcher};
use spin::Mutex;

use crate::session::{Routed, Session};

/// Registry entry for one open session
///
/// The compute unit claim lives here so the exclusivity check never has to
/// upgrade a session under the registry lock.
#[derive(Debug)]
struct OpenSession {
    number: u32,
    cu: CuIndex,
    session: Weak<Session>,
}

/// Per-device context shared by all sessions on that device
pub struct DeviceContext {
    device: Device,
    ids: IdGenerator,
    dispatcher: Arc<dyn Dispatcher>,
    memory: Arc<dyn DeviceMemory>,
    sessions: Mutex<Vec<OpenSession>>,
    open_sessions: AtomicU32,
    session_seq: AtomicU32,
    stale_completions: AtomicU64,
}

impl DeviceContext {
    /// Build a context with an entropy-seeded identifier generator
    pub fn new(
        device: Device,
        dispatcher: Arc<dyn Dispatcher>,
        memory: Arc<dyn DeviceMemory>,
    ) -> Arc<Self> {
        Self::with_ids(device, dispatcher, memory, IdGenerator::new())
    }

    /// Build a context around a given identifier generator
    pub fn with_ids(
        device: Device,
        dispatcher: Arc<dyn Dispatcher>,
        memory: Arc<dyn DeviceMemory>,
        ids: IdGenerator,
    ) -> Arc<Self> {
        log::info!(
            "{} ({}): {} compute units, {} memory banks",
            device.index(),
            device.name(),
            device.compute_units().len(),
            device.banks().len()
        );
        Arc::new(Self {
            device,
            ids,
            dispatcher,
            memory,
            sessions: Mutex::new(Vec::new()),
            open_sessions: AtomicU32::new(0),
            session_seq: AtomicU32::new(0),
            stale_completions: AtomicU64::new(0),
        })
    }

    /// Inventory
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Draw the next command identifier
    pub fn next_id(&self) -> CommandId {
        self.ids.next_id()
    }

    /// Identifier generator
    pub fn ids(&self) -> &IdGenerator {
        &self.ids
    }

    /// Dispatch collaborator
    pub fn dispatcher(&self) -> &dyn Dispatcher {
        &*self.dispatcher
    }

    /// Memory collaborator
    pub fn memory(&self) -> &Arc<dyn DeviceMemory> {
        &self.memory
    }

    /// Sessions currently open on this device
    pub fn open_sessions(&self) -> u32 {
        self.open_sessions.load(Ordering::Acquire)
    }

    /// Completions no open session owned
    pub fn stale_completions(&self) -> u64 {
        self.stale_completions.load(Ordering::Relaxed)
    }

    pub(crate) fn next_session_number(&self) -> u32 {
        self.session_seq.fetch_add(1, Ordering::Relaxed)
    }

    fn live_sessions(&self) -> Vec<Arc<Session>> {
        self.sessions
            .lock()
            .iter()
            .filter_map(|open| open.session.upgrade())
            .collect()
    }

    /// Register an open session, claiming its compute unit if exclusive
    pub(crate) fn register(&self, session: &Arc<Session>, exclusive: bool) -> Result<()> {
        let cu = session.compute_unit();
        let mut sessions = self.sessions.lock();
        if exclusive && sessions.iter().any(|open| open.cu == cu) {
            return Err(Error::ComputeUnitBusy);
        }

        sessions.push(OpenSession {
            number: session.number(),
            cu,
            session: Arc::downgrade(session),
        });
        self.open_sessions.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub(crate) fn unregister(&self, number: u32) {
        let mut sessions = self.sessions.lock();
        if let Some(pos) = sessions.iter().position(|open| open.number == number) {
            sessions.swap_remove(pos);
            self.open_sessions.fetch_sub(1, Ordering::AcqRel);
        }
    }

    /// Drain the dispatcher and hand each completion to its session
    ///
    /// Returns the number of completions applied.
    pub fn poll_completions(&self) -> Result<usize> {
        let mut batch: Vec<Completion> = Vec::new();
        if self.dispatcher.poll(&mut batch)? == 0 {
            return Ok(0);
        }

        let sessions = self.live_sessions();
        let mut applied = 0;
        for completion in &batch {
            let routed = sessions
                .iter()
                .map(|s| s.route_completion(completion))
                .find(|r| !matches!(r, Routed::NotOwned))
                .unwrap_or(Routed::NotOwned);

            match routed {
                Routed::Applied => applied += 1,
                Routed::Rejected(e) => {
                    log::warn!("completion for {} rejected: {}", completion.command, e);
                },
                Routed::NotOwned => {
                    self.stale_completions.fetch_add(1, Ordering::Relaxed);
                    log::warn!(
                        "dropping completion for unknown or stale {} ({})",
                        completion.command,
                        completion.state
                    );
                },
            }
        }
        log::trace!("{}: applied {} of {} completions", self.device.index(), applied, batch.len());
        Ok(applied)
    }

    /// Take one utilization sample in every open session
    pub fn sample_utilization(&self) {
        for session in self.live_sessions() {
            if let Err(e) = session.sample_utilization() {
                log::warn!("session {}: utilization sample failed: {}", session.number(), e);
            }
        }
    }
}

impl core::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("device", &self.device.index())
            .field("name", &self.device.name())
            .field("ids_issued", &self.ids.issued())
            .field("open_sessions", &self.open_sessions())
            .finish()
    }
}
