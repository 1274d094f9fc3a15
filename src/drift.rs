/// Semantic drift detection across iterations.
///
/// A submission's semantic surface — parameter set, signal formulas from the
/// strategy card, and declared output schema — is fingerprinted per field
/// with SHA-256 at Iter0. Later iterations are compared field-wise against
/// that baseline, restricted to fields the frozen spec does NOT declare
/// tunable. Any frozen-field mismatch forces D1 to 0 and invalidates the
/// iteration regardless of gate outcomes.
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::spec::StrategySpec;
use crate::submission::StrategyCard;

/// Canonical per-field digests of a submission's semantic surface.
/// BTreeMap keeps comparison and serialization order-stable.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct DriftFingerprint {
    pub fields: BTreeMap<String, String>,
}

impl DriftFingerprint {
    /// Compute the fingerprint of a strategy card.
    ///
    /// Field keys: `param:<name>` (digest over declared type and value),
    /// `formula:<name>`, `output:trade_log`, `output:audit_log`.
    pub fn compute(card: &StrategyCard) -> Self {
        let mut fields = BTreeMap::new();
        for (name, param) in &card.parameters {
            let material = format!(
                "{}|{}|{}",
                name,
                param.declared_type.as_deref().unwrap_or(""),
                param.value
            );
            fields.insert(format!("param:{}", name), digest(&material));
        }
        for (name, formula) in &card.formulas {
            fields.insert(format!("formula:{}", name), digest(formula));
        }
        fields.insert(
            "output:trade_log".to_string(),
            digest(&card.output_specification.trade_log_columns.join(",")),
        );
        fields.insert(
            "output:audit_log".to_string(),
            digest(&card.output_specification.audit_log_columns.join(",")),
        );
        Self { fields }
    }
}

fn digest(material: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(material.as_bytes());
    hex::encode(hasher.finalize())
}

/// Outcome of one drift check.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DriftReport {
    pub drifted: bool,
    /// Frozen fields that changed, were removed, or were added.
    pub mismatches: Vec<String>,
}

impl DriftReport {
    pub fn clean() -> Self {
        Self {
            drifted: false,
            mismatches: Vec::new(),
        }
    }
}

/// Holds the Iter0 baseline and the tunable-field allowlist.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DriftDetector {
    baseline: DriftFingerprint,
    tunable_fields: BTreeSet<String>,
}

impl DriftDetector {
    /// Freeze the baseline at Iter0. Tunable fields come from the frozen
    /// spec, never from the submission's own declarations.
    pub fn freeze(card: &StrategyCard, spec: &StrategySpec) -> Self {
        let tunable_fields = spec
            .tunable_parameters()
            .into_iter()
            .map(|name| format!("param:{}", name))
            .collect();
        Self {
            baseline: DriftFingerprint::compute(card),
            tunable_fields,
        }
    }

    pub fn baseline(&self) -> &DriftFingerprint {
        &self.baseline
    }

    /// Compare a later iteration's card against the frozen baseline.
    pub fn check(&self, card: &StrategyCard) -> DriftReport {
        let current = DriftFingerprint::compute(card);
        let mut mismatches = Vec::new();

        for (field, base_digest) in &self.baseline.fields {
            if self.tunable_fields.contains(field) {
                continue;
            }
            match current.fields.get(field) {
                None => mismatches.push(format!("frozen field removed: {}", field)),
                Some(d) if d != base_digest => {
                    mismatches.push(format!("frozen field changed: {}", field))
                }
                Some(_) => {}
            }
        }
        // New frozen-side fields are drift too: the semantic surface grew.
        for field in current.fields.keys() {
            if !self.baseline.fields.contains_key(field) && !self.tunable_fields.contains(field) {
                mismatches.push(format!("frozen field added: {}", field));
            }
        }

        DriftReport {
            drifted: !mismatches.is_empty(),
            mismatches,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::submission::StrategyCard;

    fn spec() -> StrategySpec {
        serde_json::from_str(crate::config::spec::tests::SPEC_JSON).unwrap()
    }

    fn card() -> StrategyCard {
        StrategyCard::from_json_str(crate::submission::tests::CARD_JSON).unwrap()
    }

    #[test]
    fn test_identical_card_is_clean() {
        let detector = DriftDetector::freeze(&card(), &spec());
        let report = detector.check(&card());
        assert!(!report.drifted);
        assert!(report.mismatches.is_empty());
    }

    #[test]
    fn test_tunable_parameter_change_is_not_drift() {
        let detector = DriftDetector::freeze(&card(), &spec());
        let mut later = card();
        // N is declared tunable in the spec: 20 -> 25 is allowed.
        later.parameters.get_mut("N").unwrap().value = serde_json::json!(25);
        assert!(!detector.check(&later).drifted);
    }

    #[test]
    fn test_frozen_parameter_change_is_drift() {
        let detector = DriftDetector::freeze(&card(), &spec());
        let mut later = card();
        // stop_loss_pct is not tunable.
        later.parameters.get_mut("stop_loss_pct").unwrap().value = serde_json::json!(0.2);
        let report = detector.check(&later);
        assert!(report.drifted);
        assert!(report.mismatches[0].contains("param:stop_loss_pct"));
    }

    #[test]
    fn test_formula_operator_swap_is_drift() {
        let detector = DriftDetector::freeze(&card(), &spec());
        let mut later = card();
        let entry = later.formulas.get_mut("entry").unwrap();
        *entry = entry.replace('<', "<=");
        let report = detector.check(&later);
        assert!(report.drifted);
        assert!(report
            .mismatches
            .iter()
            .any(|m| m.contains("formula:entry")));
    }

    #[test]
    fn test_added_formula_is_drift() {
        let detector = DriftDetector::freeze(&card(), &spec());
        let mut later = card();
        later
            .formulas
            .insert("bonus_exit".to_string(), "close > UB".to_string());
        let report = detector.check(&later);
        assert!(report.drifted);
        assert!(report
            .mismatches
            .iter()
            .any(|m| m.contains("frozen field added")));
    }

    #[test]
    fn test_output_schema_change_is_drift() {
        let detector = DriftDetector::freeze(&card(), &spec());
        let mut later = card();
        later.output_specification.trade_log_columns.pop();
        assert!(detector.check(&later).drifted);
    }

    #[test]
    fn test_detector_roundtrips_through_serde() {
        let detector = DriftDetector::freeze(&card(), &spec());
        let json = serde_json::to_string(&detector).unwrap();
        let reloaded: DriftDetector = serde_json::from_str(&json).unwrap();
        assert_eq!(reloaded.baseline(), detector.baseline());
        assert!(!reloaded.check(&card()).drifted);
    }
}
