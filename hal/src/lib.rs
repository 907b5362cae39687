//! # Accel HAL
//!
//! Boundary between the session layer and the hardware.
//!
//! ```text
//!   hardware discovery ──▶ Device (inventory, read-only)
//!                                │
//!   session layer ───────────────┼──▶ Dispatcher   (bind payload, poll completions)
//!                                └──▶ DeviceMemory (allocate pool buffers)
//! ```
//!
//! The `sim` feature provides an in-memory device implementing both
//! collaborator traits.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod dispatch;
pub mod inventory;
pub mod memory;
#[cfg(feature = "sim")]
pub mod sim;

pub use dispatch::{Completion, DispatchRequest, Dispatcher};
pub use inventory::{BankFlags, ComputeUnit, CuFlags, Device, DeviceBuilder, MemoryBank};
pub use memory::{DeviceBuffer, DeviceMemory};
