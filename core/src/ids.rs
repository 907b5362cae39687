//! # Identifier Generator
//!
//! Per-device source of command identifiers. The counter is a lock-free
//! atomic; the salt comes from a seeded PRNG behind a spin lock, so
//! sessions sharing a device can draw concurrently.

use core::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use spin::Mutex;

use crate::command::CommandId;

/// Lower bound of the salt distribution
pub const SALT_MIN: i32 = -97_986_387;
/// Upper bound of the salt distribution
pub const SALT_MAX: i32 = 97_986_387;

/// Per-device command identifier generator
#[derive(Debug)]
pub struct IdGenerator {
    /// Rolling counter, wraps silently
    counter: AtomicU32,
    /// Salt source
    rng: Mutex<StdRng>,
    /// Identifiers handed out
    issued: AtomicU64,
}

impl IdGenerator {
    /// Create a generator seeded from OS entropy mixed with wall-clock time
    pub fn new() -> Self {
        let entropy: u64 = rand::random();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        Self::with_seed(entropy ^ now.rotate_left(32))
    }

    /// Create a generator with a fixed seed
    pub fn with_seed(seed: u64) -> Self {
        Self::with_seed_and_counter(seed, 0)
    }

    /// Create a generator with a fixed seed and starting counter value
    ///
    /// The first identifier uses `counter + 1`.
    pub fn with_seed_and_counter(seed: u64, counter: u32) -> Self {
        Self {
            counter: AtomicU32::new(counter),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
            issued: AtomicU64::new(0),
        }
    }

    /// Draw the next identifier
    pub fn next_id(&self) -> CommandId {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        let salt = self.rng.lock().random_range(SALT_MIN..=SALT_MAX);
        self.issued.fetch_add(1, Ordering::Relaxed);
        CommandId::new(counter, salt)
    }

    /// Number of identifiers issued so far
    pub fn issued(&self) -> u64 {
        self.issued.load(Ordering::Relaxed)
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
