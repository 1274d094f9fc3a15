/// Submission artifacts: one model's attempt at one (strategy, iteration).
///
/// A submission directory contains `strategy_card.json`, `code/<entry file>`
/// and optionally the self-reported `logs/` the Schema gate inspects before
/// anything is executed. Immutable once handed to the gate pipeline.
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::data::logs::LogTable;
use crate::types::{HarnessError, Result};

/// Declared entry point. The sandbox is language-agnostic: `command` is the
/// argv run inside the scratch directory (market CSV path and initial
/// capital appended), `file` is where the code blob is materialised, and
/// `symbol` is the entry identifier the Parse gate must find in the code.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntryDeclaration {
    pub command: Vec<String>,
    #[serde(default = "default_entry_file")]
    pub file: String,
    #[serde(default = "default_entry_symbol")]
    pub symbol: String,
}

fn default_entry_file() -> String {
    "strategy.py".to_string()
}

fn default_entry_symbol() -> String {
    "Strategy".to_string()
}

/// One declared parameter of the strategy card.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CardParameter {
    pub value: serde_json::Value,
    #[serde(rename = "type", default)]
    pub declared_type: Option<String>,
}

/// Output column declaration mirrored from the card.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct OutputSpecification {
    #[serde(default)]
    pub trade_log_columns: Vec<String>,
    #[serde(default)]
    pub audit_log_columns: Vec<String>,
}

impl OutputSpecification {
    pub fn is_declared(&self) -> bool {
        !self.trade_log_columns.is_empty() && !self.audit_log_columns.is_empty()
    }
}

/// Risk constraints the D2 dimension scores against.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Constraints {
    #[serde(default = "default_max_position")]
    pub max_position_size: f64,
}

fn default_max_position() -> f64 {
    1.0
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            max_position_size: default_max_position(),
        }
    }
}

/// Structured declaration of the submission's interpreted semantics
/// (`strategy_card.json`). Consumed by the Schema gate and Drift Detector.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StrategyCard {
    pub strategy_id: String,
    #[serde(default)]
    pub strategy_name: Option<String>,
    #[serde(default)]
    pub parameters: BTreeMap<String, CardParameter>,
    /// Signal formulas as the submission interprets them; fingerprinted by
    /// the Drift Detector.
    #[serde(default)]
    pub formulas: BTreeMap<String, String>,
    pub entry: EntryDeclaration,
    #[serde(default)]
    pub output_specification: OutputSpecification,
    #[serde(default)]
    pub constraints: Constraints,
}

impl StrategyCard {
    pub fn from_json_str(raw: &str) -> Result<Self> {
        serde_json::from_str(raw)
            .map_err(|e| HarnessError::Parse(format!("invalid strategy card: {}", e)))
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            HarnessError::Parse(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_json_str(&raw)
    }
}

/// One model's gated attempt.
#[derive(Clone, Debug)]
pub struct Submission {
    pub model_id: String,
    pub strategy_id: String,
    pub iteration: u32,
    pub code: String,
    pub card: StrategyCard,
    /// Self-reported logs shipped with the submission, if any. The Schema
    /// gate validates these; executed logs come from the sandbox.
    pub trade_log: Option<LogTable>,
    pub audit_log: Option<LogTable>,
}

impl Submission {
    /// Load a submission directory:
    /// `strategy_card.json`, `code/<entry.file>`, optional `logs/*.csv`.
    pub fn load(dir: &Path, model_id: &str, strategy_id: &str, iteration: u32) -> Result<Self> {
        let card = StrategyCard::from_path(&dir.join("strategy_card.json"))?;
        let code_path = dir.join("code").join(&card.entry.file);
        let code = fs::read_to_string(&code_path).map_err(|e| {
            HarnessError::Parse(format!("cannot read code {}: {}", code_path.display(), e))
        })?;

        let trade_log_path = dir.join("logs").join("trade_log.csv");
        let audit_log_path = dir.join("logs").join("audit_log.csv");
        let trade_log = trade_log_path
            .exists()
            .then(|| LogTable::from_csv_path(&trade_log_path))
            .transpose()?;
        let audit_log = audit_log_path
            .exists()
            .then(|| LogTable::from_csv_path(&audit_log_path))
            .transpose()?;

        Ok(Self {
            model_id: model_id.to_string(),
            strategy_id: strategy_id.to_string(),
            iteration,
            code,
            card,
            trade_log,
            audit_log,
        })
    }

    /// Key under which evidence and results are stored.
    pub fn key(&self) -> (String, String, u32) {
        (
            self.model_id.clone(),
            self.strategy_id.clone(),
            self.iteration,
        )
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) const CARD_JSON: &str = r#"{
        "strategy_id": "bollinger_mean_reversion",
        "parameters": {
            "N": {"value": 20, "type": "int"},
            "k": {"value": 2.0, "type": "float"},
            "stop_loss_pct": {"value": 0.1, "type": "float"}
        },
        "formulas": {
            "entry": "close < LB and prev_close >= prev_LB",
            "exit": "close >= MB or close <= entry_price * (1 - stop_loss_pct)",
            "signal_priority": "stop_loss,exit,entry"
        },
        "entry": {
            "command": ["python3", "code/strategy.py"],
            "file": "strategy.py",
            "symbol": "Strategy"
        },
        "output_specification": {
            "trade_log_columns": ["trade_id", "side", "entry_time", "entry_price",
                                  "exit_time", "exit_price", "pnl",
                                  "reason_entry", "reason_exit"],
            "audit_log_columns": ["datetime", "close", "MB", "signal",
                                  "position_state", "equity"]
        },
        "constraints": {"max_position_size": 1.0}
    }"#;

    #[test]
    fn test_card_parse() {
        let card = StrategyCard::from_json_str(CARD_JSON).unwrap();
        assert_eq!(card.strategy_id, "bollinger_mean_reversion");
        assert_eq!(card.parameters["N"].value, serde_json::json!(20));
        assert_eq!(card.entry.command[0], "python3");
        assert!(card.output_specification.is_declared());
    }

    #[test]
    fn test_card_defaults() {
        let card = StrategyCard::from_json_str(
            r#"{"strategy_id": "s", "entry": {"command": ["sh", "code/run.sh"]}}"#,
        )
        .unwrap();
        assert_eq!(card.entry.file, "strategy.py");
        assert_eq!(card.entry.symbol, "Strategy");
        assert!((card.constraints.max_position_size - 1.0).abs() < f64::EPSILON);
        assert!(!card.output_specification.is_declared());
    }

    #[test]
    fn test_load_submission_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("strategy_card.json"), CARD_JSON).unwrap();
        std::fs::create_dir_all(dir.path().join("code")).unwrap();
        std::fs::write(dir.path().join("code/strategy.py"), "class Strategy: pass").unwrap();
        std::fs::create_dir_all(dir.path().join("logs")).unwrap();
        std::fs::write(
            dir.path().join("logs/trade_log.csv"),
            "trade_id,pnl\n1,5.0\n",
        )
        .unwrap();

        let sub = Submission::load(dir.path(), "alpha-1", "bollinger_mean_reversion", 0).unwrap();
        assert_eq!(sub.key(), ("alpha-1".into(), "bollinger_mean_reversion".into(), 0));
        assert!(sub.trade_log.is_some());
        assert!(sub.audit_log.is_none());
        assert!(sub.code.contains("Strategy"));
    }
}
