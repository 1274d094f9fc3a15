//! Sandbox boundary for untrusted submissions
//!
//! The single trust boundary of the harness: everything inside a submission
//! run is opaque, and only the declared `SandboxOutcome` variant crosses
//! back out.

pub mod runner;
pub mod workspace;

pub use runner::{
    CapabilityRule, RunArtifacts, SandboxLimits, SandboxOutcome, SandboxRunner, SubmissionRunner,
};
pub use workspace::ScratchDir;
