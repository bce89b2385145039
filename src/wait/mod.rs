//! Polling waits.
//!
//! - [`poll`]: the [`Poller`] state machine trait and the generic [`drive`] loop
//! - [`state_waiter`]: migration completion and garbage-collection waits

pub mod poll;
pub mod state_waiter;

pub use poll::{PollOutcome, PollSchedule, Poller, drive};
pub use state_waiter::{CompletionPoller, GarbageCollectionPoller, MigrationOutcome, StateWaiter};
