/// Frozen strategy specification (`spec.json`).
///
/// The spec is the contract every submission is gated against: the declared
/// parameter surface (with per-parameter tunability), the frozen signal
/// formulas, the required output columns, and the indicator declarations
/// the Audit gate recomputes independently.
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::schema::{FieldDescriptor, SchemaDescriptor};
use crate::types::{HarnessError, Result};

/// One declared parameter of the frozen spec.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ParamSpec {
    #[serde(rename = "type")]
    pub param_type: String,
    #[serde(default = "default_true")]
    pub required: bool,
    /// Tunable parameters may change value between iterations without
    /// counting as drift.
    #[serde(default)]
    pub tunable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<serde_json::Value>,
}

fn default_true() -> bool {
    true
}

/// Indicator the harness recomputes for the Audit gate. `column` names the
/// audit-log column the submission must emit for it.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IndicatorSpec {
    Sma { column: String, period: usize },
    RollingStd { column: String, period: usize },
    BollingerUpper { column: String, period: usize, width: f64 },
    BollingerLower { column: String, period: usize, width: f64 },
    Ema { column: String, period: usize },
}

impl IndicatorSpec {
    pub fn column(&self) -> &str {
        match self {
            IndicatorSpec::Sma { column, .. }
            | IndicatorSpec::RollingStd { column, .. }
            | IndicatorSpec::BollingerUpper { column, .. }
            | IndicatorSpec::BollingerLower { column, .. }
            | IndicatorSpec::Ema { column, .. } => column,
        }
    }
}

/// Required output columns, per artifact.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct RequiredOutputs {
    #[serde(default)]
    pub trade_log: Vec<FieldDescriptor>,
    #[serde(default)]
    pub audit_log: Vec<FieldDescriptor>,
}

/// The frozen specification of one strategy.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StrategySpec {
    pub strategy_id: String,
    #[serde(default)]
    pub strategy_name: String,
    /// Declared parameter surface. BTreeMap keeps fingerprinting and
    /// violation reports deterministic.
    #[serde(default)]
    pub parameters: BTreeMap<String, ParamSpec>,
    /// Frozen formulas (entry/exit conditions, signal priority order).
    /// Changing any of these between iterations is semantic drift.
    #[serde(default)]
    pub frozen_formulas: BTreeMap<String, String>,
    #[serde(default)]
    pub required_outputs: RequiredOutputs,
    #[serde(default)]
    pub indicators: Vec<IndicatorSpec>,
}

impl StrategySpec {
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|e| {
            HarnessError::Config(format!("failed to parse spec {}: {}", path.display(), e))
        })
    }

    /// Schema descriptor for the emitted trade log.
    pub fn trade_log_schema(&self) -> SchemaDescriptor {
        SchemaDescriptor::new("trade_log", self.required_outputs.trade_log.clone())
    }

    /// Schema descriptor for the emitted audit log.
    pub fn audit_log_schema(&self) -> SchemaDescriptor {
        SchemaDescriptor::new("audit_log", self.required_outputs.audit_log.clone())
    }

    /// Names of parameters a generator may vary without triggering drift.
    pub fn tunable_parameters(&self) -> Vec<&str> {
        self.parameters
            .iter()
            .filter(|(_, p)| p.tunable)
            .map(|(name, _)| name.as_str())
            .collect()
    }
}
