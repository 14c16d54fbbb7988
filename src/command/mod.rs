//! # Pending Operations
//!
//! The synchronous bridge between caller threads and the reactor thread.
//! A caller creates a [`PendingOperation`] and hands the matching
//! [`Completion`] to the reactor; exactly one outcome is ever recorded.

mod error;
mod pending;

pub use error::{CommandError, CommandResult};
pub use pending::{Completion, PendingOperation};
