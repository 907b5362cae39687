//! # Device Memory Interface
//!
//! Contract with the memory collaborator that backs buffer pools.

use accel_core::{BankIndex, ByteSize, DeviceAddr, Result};

/// One allocated device buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceBuffer {
    /// Backend handle
    pub handle: u64,
    /// Bank the buffer lives in
    pub bank: BankIndex,
    /// Device address
    pub addr: DeviceAddr,
    /// Size
    pub size: ByteSize,
    /// Not host addressable
    pub device_only: bool,
}

/// Device memory collaborator
pub trait DeviceMemory: Send + Sync {
    /// Allocate one buffer in `bank`
    fn allocate(&self, bank: BankIndex, size: ByteSize, device_only: bool) -> Result<DeviceBuffer>;

    /// Return a buffer to the device
    fn free(&self, buffer: DeviceBuffer);
}
