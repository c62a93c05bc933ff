//! Session orchestration modules.
//!
//! Covers agent process supervision, streaming accumulation, workspace
//! confinement, and the session coordinator tying them together.

pub mod coordinator;
pub mod path_guard;
pub mod streaming;
pub mod supervisor;
