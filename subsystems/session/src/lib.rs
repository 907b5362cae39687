//! # Accel Session
//!
//! Command dispatch and buffer pool core of the accelerator session layer.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                          DeviceContext                           │
//! │   inventory · IdGenerator · Dispatcher · DeviceMemory · registry │
//! └───────────────┬──────────────────────────────────┬───────────────┘
//!                 │                                  │
//!        ┌────────▼─────────┐              ┌─────────▼──────────┐
//!        │     Session      │     ...      │      Session       │
//!        │ ┌──────────────┐ │              └────────────────────┘
//!        │ │ SlotTable    │ │  parking_lot mutex + 3 condvars
//!        │ │ RecordTable  │ │
//!        │ │ Utilization  │ │
//!        │ └──────────────┘ │
//!        │ ┌──────────────┐ │
//!        │ │ BufferPools  │ │  spin lock per pool
//!        │ └──────────────┘ │
//!        └──────────────────┘
//! ```
//!
//! Completions reach a session either through `Session::complete`, or
//! through `DeviceContext::poll_completions`, which the
//! [`CompletionObserver`] thread can drive periodically.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod device;
pub mod observer;
pub mod pool;
pub mod records;
pub mod session;
pub mod slots;
pub mod utilization;

pub use config::{PoolConfig, SessionConfig, MAX_PAYLOAD_BYTES, MAX_SLOTS};
pub use device::DeviceContext;
pub use observer::CompletionObserver;
pub use pool::{BufferObject, BufferPool, PoolStats};
pub use records::{CommandRecord, FailedCommand, RecordTable};
pub use session::{close_session, open_session, Session, SessionStats};
pub use slots::{Slot, SlotGrant, SlotTable};
pub use utilization::{CuLoad, UtilizationTracker, HISTORY_WINDOWS, WINDOW_SAMPLES};

static_assertions::assert_impl_all!(Session: Send, Sync);
static_assertions::assert_impl_all!(DeviceContext: Send, Sync);
static_assertions::assert_impl_all!(BufferObject: Send, Sync);
