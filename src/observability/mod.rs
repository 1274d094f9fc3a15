//! Structured harness events
//!
//! Every externally meaningful transition is appended as one JSON line to
//! the run's event log, correlated by run id and submission key.

pub mod events;

pub use events::{classify_exec_failure, Correlation, EventLog, HarnessEvent, HarnessEventType};
