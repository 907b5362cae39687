//! # Completion Observer
//!
//! Background thread driving the polled completion path of one device:
//! every interval it drains the dispatcher, routes completions to their
//! sessions and takes a utilization sample.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use accel_core::{Error, Result};
use parking_lot::{Condvar, Mutex};

use crate::device::DeviceContext;

#[derive(Debug, Default)]
struct Shared {
    stop: Mutex<bool>,
    wake: Condvar,
    rounds: AtomicU64,
    applied: AtomicU64,
}

/// Handle to a running observer thread
///
/// Dropping the handle stops the thread and joins it.
#[derive(Debug)]
pub struct CompletionObserver {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl CompletionObserver {
    /// Start observing `device`, polling every `interval`
    pub fn spawn(device: Arc<DeviceContext>, interval: Duration) -> Result<Self> {
        if interval.is_zero() {
            return Err(Error::InvalidParameter);
        }

        let shared = Arc::new(Shared::default());
        let name = format!("accel-observer-{}", device.device().index());
        let handle = thread::Builder::new()
            .name(name)
            .spawn({
                let shared = Arc::clone(&shared);
                move || run(&device, &shared, interval)
            })
            .map_err(|e| {
                log::error!("observer thread: {}", e);
                Error::ThreadSpawn
            })?;

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Polling rounds completed so far
    pub fn rounds(&self) -> u64 {
        self.shared.rounds.load(Ordering::Relaxed)
    }

    /// Completions applied so far
    pub fn applied(&self) -> u64 {
        self.shared.applied.load(Ordering::Relaxed)
    }

    /// Stop the thread and wait for it to exit
    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        *self.shared.stop.lock() = true;
        self.shared.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log::error!("observer thread panicked");
            }
        }
    }
}

impl Drop for CompletionObserver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(device: &DeviceContext, shared: &Shared, interval: Duration) {
    log::debug!("{}: observer started ({:?})", device.device().index(), interval);
    loop {
        match device.poll_completions() {
            Ok(0) => {},
            Ok(n) => {
                shared.applied.fetch_add(n as u64, Ordering::Relaxed);
                log::trace!("{}: observer applied {}", device.device().index(), n);
            },
            Err(e) => log::warn!("{}: poll failed: {}", device.device().index(), e),
        }
        device.sample_utilization();
        shared.rounds.fetch_add(1, Ordering::Relaxed);

        let mut stop = shared.stop.lock();
        if !*stop {
            shared.wake.wait_for(&mut stop, interval);
        }
        if *stop {
            break;
        }
    }
    log::debug!("{}: observer stopped", device.device().index());
}
