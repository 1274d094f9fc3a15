//! Validity gate pipeline
//!
//! Six gates in fixed order: parse, schema, exec, determ, anti_leak,
//! audit. The first five are fatal; audit records a failure but does not
//! abort. Gate failures are values, not errors: an `Err` from the pipeline
//! means the harness itself broke, never that a submission was bad.

pub mod indicators;
pub mod pipeline;

use serde::{Deserialize, Serialize};

pub use pipeline::{GatePipeline, PipelineOutcome};

/// The six gates, in pipeline order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateName {
    Parse,
    Schema,
    Exec,
    Determ,
    AntiLeak,
    Audit,
}

impl GateName {
    pub const ORDER: [GateName; 6] = [
        GateName::Parse,
        GateName::Schema,
        GateName::Exec,
        GateName::Determ,
        GateName::AntiLeak,
        GateName::Audit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            GateName::Parse => "parse",
            GateName::Schema => "schema",
            GateName::Exec => "exec",
            GateName::Determ => "determ",
            GateName::AntiLeak => "anti_leak",
            GateName::Audit => "audit",
        }
    }

    /// Audit is advisory; every other gate aborts the pipeline on failure.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, GateName::Audit)
    }
}

impl std::fmt::Display for GateName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateVerdict {
    Pass,
    Fail,
    /// Not evaluated because an earlier fatal gate failed.
    Skipped,
}

/// Outcome of one gate.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GateResult {
    pub gate: GateName,
    pub verdict: GateVerdict,
    /// Human-readable reason, empty on pass.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub detail: String,
    pub is_fatal: bool,
}

impl GateResult {
    pub fn pass(gate: GateName) -> Self {
        Self {
            gate,
            verdict: GateVerdict::Pass,
            detail: String::new(),
            is_fatal: gate.is_fatal(),
        }
    }

    pub fn fail(gate: GateName, detail: impl Into<String>) -> Self {
        Self {
            gate,
            verdict: GateVerdict::Fail,
            detail: detail.into(),
            is_fatal: gate.is_fatal(),
        }
    }

    pub fn skipped(gate: GateName) -> Self {
        Self {
            gate,
            verdict: GateVerdict::Skipped,
            detail: String::new(),
            is_fatal: gate.is_fatal(),
        }
    }

    pub fn passed(&self) -> bool {
        self.verdict == GateVerdict::Pass
    }

    pub fn failed(&self) -> bool {
        self.verdict == GateVerdict::Fail
    }

    pub fn is_fatal_failure(&self) -> bool {
        self.failed() && self.is_fatal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gate_order_and_fatality() {
        assert_eq!(GateName::ORDER.len(), 6);
        assert_eq!(GateName::ORDER[0], GateName::Parse);
        assert_eq!(GateName::ORDER[5], GateName::Audit);
        assert!(GateName::Determ.is_fatal());
        assert!(!GateName::Audit.is_fatal());
    }

    #[test]
    fn test_gate_name_serializes_snake_case() {
        assert_eq!(
            serde_json::to_string(&GateName::AntiLeak).unwrap(),
            "\"anti_leak\""
        );
    }
}
