//! # Accel Core
//!
//! Foundational types for the accelerator session layer.
//!
//! ## Contents
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                       accel-core                          │
//! │  ┌─────────────┐  ┌─────────────┐  ┌──────────────────┐   │
//! │  │   Types     │  │  Command    │  │     Error        │   │
//! │  │ (CuIndex,   │  │ (CommandId, │  │   Taxonomy       │   │
//! │  │  ByteSize)  │  │   State)    │  │                  │   │
//! │  └─────────────┘  └─────────────┘  └──────────────────┘   │
//! │                  ┌──────────────────┐                     │
//! │                  │  Id Generator    │                     │
//! │                  │ (counter + salt) │                     │
//! │                  └──────────────────┘                     │
//! └───────────────────────────────────────────────────────────┘
//! ```

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod command;
pub mod error;
pub mod ids;
pub mod types;

pub use command::{CommandId, CommandOutcome, CommandState};
pub use error::{Error, Result};
pub use ids::IdGenerator;
pub use types::*;

static_assertions::assert_eq_size!(CommandId, u64);
static_assertions::assert_impl_all!(IdGenerator: Send, Sync);
