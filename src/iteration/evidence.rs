/// Evidence bundles: the only feedback channel back to a generator.
///
/// A bundle packages the scorecard, the first gate failure, drift
/// mismatches, peer-review excerpts, and the compliance flags for the
/// changed-lines budget. Bundles are stored per (model, strategy,
/// iteration) and consumed exactly once.
use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::scorecard::Scorecard;
use crate::types::{HarnessError, Result};

/// A peer reviewer's verdict carried into the next iteration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerReviewExcerpt {
    pub reviewer: String,
    /// Spec-fidelity score on the 1..10 review scale.
    pub d1: f64,
    /// Risk-discipline score on the 1..10 review scale.
    pub d2: f64,
    #[serde(default)]
    pub comment: String,
}

/// Post hoc compliance accounting for the revision budget. Advisory: an
/// exceeded budget flags the bundle but never blocks an iteration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ComplianceFlags {
    pub changed_lines: usize,
    pub budget: usize,
    pub budget_exceeded: bool,
}

impl ComplianceFlags {
    pub fn new(changed_lines: usize, budget: usize) -> Self {
        Self {
            changed_lines,
            budget,
            budget_exceeded: changed_lines > budget,
        }
    }
}

/// Feedback for one non-converged iteration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvidenceBundle {
    pub model_id: String,
    pub strategy_id: String,
    pub iteration: u32,
    pub scorecard: Scorecard,
    /// First fatal gate failure, as `(gate, detail)`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_failure: Option<(String, String)>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub drift_mismatches: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub peer_reviews: Vec<PeerReviewExcerpt>,
    pub compliance: ComplianceFlags,
}

/// Changed lines between two code revisions, counted as a line-occurrence
/// multiset difference (added plus removed). Reordering counts as change.
pub fn changed_lines(previous: &str, next: &str) -> usize {
    let mut counts: BTreeMap<&str, i64> = BTreeMap::new();
    for line in previous.lines() {
        *counts.entry(line).or_insert(0) += 1;
    }
    for line in next.lines() {
        *counts.entry(line).or_insert(0) -= 1;
    }
    counts.values().map(|c| c.unsigned_abs() as usize).sum()
}

/// In-memory evidence store keyed by (model, strategy, iteration).
/// Insertion is write-once and retrieval consumes the bundle.
#[derive(Debug, Default)]
pub struct EvidenceStore {
    bundles: BTreeMap<(String, String, u32), EvidenceBundle>,
}

impl EvidenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, bundle: EvidenceBundle) -> Result<()> {
        let key = (
            bundle.model_id.clone(),
            bundle.strategy_id.clone(),
            bundle.iteration,
        );
        if self.bundles.contains_key(&key) {
            return Err(HarnessError::Store(format!(
                "evidence already recorded for {}/{} iter {}",
                key.0, key.1, key.2
            )));
        }
        self.bundles.insert(key, bundle);
        Ok(())
    }

    /// Consume the bundle for one key. A second take returns None.
    pub fn take(&mut self, model_id: &str, strategy_id: &str, iteration: u32) -> Option<EvidenceBundle> {
        self.bundles
            .remove(&(model_id.to_string(), strategy_id.to_string(), iteration))
    }

    pub fn len(&self) -> usize {
        self.bundles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bundles.is_empty()
    }
}

/// Persist a bundle to disk with the same write-once discipline as the
/// store: an existing file at `path` is a duplicate key, not a target
/// to overwrite.
pub fn write_bundle_once(path: &Path, bundle: &EvidenceBundle) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .map_err(|err| {
            if err.kind() == std::io::ErrorKind::AlreadyExists {
                HarnessError::Store(format!(
                    "evidence bundle already exists at {}",
                    path.display()
                ))
            } else {
                HarnessError::Io(err)
            }
        })?;
    let body = serde_json::to_string_pretty(bundle)
        .map_err(|err| HarnessError::Store(format!("cannot serialize evidence bundle: {err}")))?;
    file.write_all(body.as_bytes())?;
    file.write_all(b"\n")?;
    Ok(())
}
