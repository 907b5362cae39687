//! # Configuration
//!
//! Session and buffer pool tunables.

use std::time::Duration;

use accel_core::{BankIndex, ByteSize, Error, Result};

/// Largest number of command slots a session may own
pub const MAX_SLOTS: u32 = 64;

/// Register map capacity of one hardware command buffer, in bytes
pub const MAX_PAYLOAD_BYTES: usize = 4032;

// =============================================================================
// SESSION CONFIGURATION
// =============================================================================

/// Session configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Number of command slots (fixed for the session's lifetime)
    pub slot_count: u32,
    /// How long `submit` waits for a slot; `None` waits indefinitely
    pub slot_wait_timeout: Option<Duration>,
    /// Largest accepted payload
    pub max_payload: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            slot_count: 4,
            slot_wait_timeout: None,
            max_payload: MAX_PAYLOAD_BYTES,
        }
    }
}

impl SessionConfig {
    /// Set the slot count
    pub fn with_slots(mut self, slot_count: u32) -> Self {
        self.slot_count = slot_count;
        self
    }

    /// Bound the wait for a free slot
    pub fn with_slot_wait_timeout(mut self, timeout: Duration) -> Self {
        self.slot_wait_timeout = Some(timeout);
        self
    }

    /// Set the payload limit
    pub fn with_max_payload(mut self, bytes: usize) -> Self {
        self.max_payload = bytes;
        self
    }

    /// Check the configuration
    pub fn validate(&self) -> Result<()> {
        if self.slot_count == 0 || self.slot_count > MAX_SLOTS {
            return Err(Error::InvalidParameter);
        }
        if self.max_payload == 0 || self.max_payload > MAX_PAYLOAD_BYTES {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }
}

// =============================================================================
// POOL CONFIGURATION
// =============================================================================

/// Buffer pool configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Bank the buffers are allocated in
    pub bank: BankIndex,
    /// Size of every buffer
    pub buffer_size: ByteSize,
    /// Number of buffers
    pub count: u32,
    /// Buffers are not host addressable
    pub device_only: bool,
    /// Name for logs
    pub name: &'static str,
}

impl PoolConfig {
    /// Host-visible pool in `bank`
    pub const fn new(bank: u32, buffer_size: ByteSize, count: u32) -> Self {
        Self {
            bank: BankIndex::new(bank),
            buffer_size,
            count,
            device_only: false,
            name: "pool",
        }
    }

    /// Mark the pool device-only
    pub const fn device_only(mut self) -> Self {
        self.device_only = true;
        self
    }

    /// Set the pool name
    pub const fn named(mut self, name: &'static str) -> Self {
        self.name = name;
        self
    }

    /// Check the configuration
    pub fn validate(&self) -> Result<()> {
        if self.count == 0 || self.buffer_size.is_zero() {
            return Err(Error::InvalidParameter);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(SessionConfig::default().validate().is_ok());
        assert_eq!(SessionConfig::default().slot_count, 4);
    }

    #[test]
    fn test_slot_bounds() {
        assert_eq!(
            SessionConfig::default().with_slots(0).validate(),
            Err(Error::InvalidParameter)
        );
        assert_eq!(
            SessionConfig::default().with_slots(MAX_SLOTS + 1).validate(),
            Err(Error::InvalidParameter)
        );
        assert!(SessionConfig::default().with_slots(MAX_SLOTS).validate().is_ok());
    }

    #[test]
    fn test_payload_bound() {
        assert_eq!(
            SessionConfig::default()
                .with_max_payload(MAX_PAYLOAD_BYTES + 1)
                .validate(),
            Err(Error::InvalidParameter)
        );
    }

    #[test]
    fn test_pool_config() {
        let config = PoolConfig::new(1, ByteSize::KIB_4, 8).device_only().named("frames");
        assert!(config.device_only);
        assert_eq!(config.name, "frames");
        assert!(config.validate().is_ok());
        assert_eq!(
            PoolConfig::new(0, ByteSize::ZERO, 8).validate(),
            Err(Error::InvalidParameter)
        );
    }
}
