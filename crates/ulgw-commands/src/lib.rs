//! Command and configuration round-trip state.
//!
//! Matches asynchronous device replies to the commands that caused them and
//! reports every status change to the context sink.

pub mod correlator;

pub use correlator::{CommandCorrelator, CommandKey, PendingCommand, TIMEOUT_MESSAGE};
