//! Device boundary of the orchestrator.
//!
//! - `capabilities`: async traits every driver implements
//! - `mock`: simulated rig used by tests and the demo binary
//! - `storage`: file-backed sinks for frames, traces and metadata

pub mod capabilities;
pub mod mock;
pub mod storage;
