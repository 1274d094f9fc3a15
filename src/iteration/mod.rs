//! Iteration loop: gating, evidence feedback, convergence
//!
//! Each (model, strategy) pair walks a fixed Iter0..Iter3 ladder. Every
//! iteration is gated and scored; non-converged iterations emit an
//! evidence bundle the generator consumes exactly once before producing
//! the next submission.

pub mod controller;
pub mod evidence;
pub mod workers;

pub use controller::{IterationConfig, IterationController, IterationState, IterationStep};
pub use evidence::{
    changed_lines, write_bundle_once, ComplianceFlags, EvidenceBundle, EvidenceStore,
    PeerReviewExcerpt,
};
pub use workers::{run_batch, WorkerReport};
