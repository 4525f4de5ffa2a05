//! Shared building blocks.
//!
//! - [`Bag`]: a counting multiset, used to tally poll votes
//! - [`timer`]: elapsed-time and ETA helpers for progress logging
//! - [`errors`]: an accumulator for best-effort teardown
//! - [`logging`]: `tracing` subscriber setup

pub mod bag;
pub mod errors;
pub mod logging;
pub mod timer;

pub use bag::Bag;
pub use errors::Errors;
