/// Experiment and model roster configuration (`experiment.yaml`, `models.yaml`).
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{HarnessError, Result};

/// Iteration loop settings (§ iteration controller).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IterationSettings {
    /// Highest iteration index; the controller terminates unconditionally
    /// after gating it.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    /// D1/D2/D3 threshold for early convergence.
    #[serde(default = "default_score_threshold")]
    pub score_threshold: f64,
    /// Advisory changed-lines budget carried on every evidence bundle.
    #[serde(default = "default_changed_lines_budget")]
    pub changed_lines_budget: usize,
}

fn default_max_iterations() -> u32 {
    3
}
fn default_score_threshold() -> f64 {
    0.85
}
fn default_changed_lines_budget() -> usize {
    50
}

impl Default for IterationSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            score_threshold: default_score_threshold(),
            changed_lines_budget: default_changed_lines_budget(),
        }
    }
}

/// Sandbox resource settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SandboxSettings {
    #[serde(default = "default_wall_timeout_secs")]
    pub wall_timeout_secs: u64,
    #[serde(default = "default_output_limit_bytes")]
    pub output_limit_bytes: usize,
    #[serde(default = "default_initial_capital")]
    pub initial_capital: f64,
}

fn default_wall_timeout_secs() -> u64 {
    30
}
fn default_output_limit_bytes() -> usize {
    2 * 1024 * 1024
}
fn default_initial_capital() -> f64 {
    100_000.0
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            wall_timeout_secs: default_wall_timeout_secs(),
            output_limit_bytes: default_output_limit_bytes(),
            initial_capital: default_initial_capital(),
        }
    }
}

impl SandboxSettings {
    pub fn wall_timeout(&self) -> Duration {
        Duration::from_secs(self.wall_timeout_secs)
    }
}

/// One strategy entry of the experiment roster.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StrategyEntry {
    pub strategy_id: String,
    /// Path to the frozen spec.json, relative to the config directory.
    pub spec_path: PathBuf,
    /// Path to the market data CSV, relative to the config directory.
    pub market_data: PathBuf,
}

/// Top-level experiment configuration.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ExperimentConfig {
    #[serde(default)]
    pub iteration: IterationSettings,
    #[serde(default)]
    pub sandbox: SandboxSettings,
    #[serde(default)]
    pub strategies: Vec<StrategyEntry>,
}

impl ExperimentConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            HarnessError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_yaml::from_str(&raw).map_err(|e| {
            HarnessError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    pub fn strategy(&self, strategy_id: &str) -> Result<&StrategyEntry> {
        self.strategies
            .iter()
            .find(|s| s.strategy_id == strategy_id)
            .ok_or_else(|| {
                HarnessError::Config(format!("strategy {} not in experiment config", strategy_id))
            })
    }
}

/// One model of the roster.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ModelEntry {
    pub model_id: String,
    pub vendor: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Model roster (`models.yaml`).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ModelsConfig {
    #[serde(default)]
    pub models: Vec<ModelEntry>,
}

impl ModelsConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|e| {
            HarnessError::Config(format!("cannot read {}: {}", path.display(), e))
        })?;
        serde_yaml::from_str(&raw).map_err(|e| {
            HarnessError::Config(format!("failed to parse {}: {}", path.display(), e))
        })
    }

    pub fn enabled_model_ids(&self) -> Vec<String> {
        self.models
            .iter()
            .filter(|m| m.enabled)
            .map(|m| m.model_id.clone())
            .collect()
    }

    /// Explicit model -> vendor map consumed by the arena shortlist.
    pub fn vendor_map(&self) -> BTreeMap<String, String> {
        self.models
            .iter()
            .map(|m| (m.model_id.clone(), m.vendor.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_experiment_defaults() {
        let cfg: ExperimentConfig = serde_yaml::from_str("strategies: []").unwrap();
        assert_eq!(cfg.iteration.max_iterations, 3);
        assert!((cfg.iteration.score_threshold - 0.85).abs() < f64::EPSILON);
        assert_eq!(cfg.iteration.changed_lines_budget, 50);
        assert_eq!(cfg.sandbox.wall_timeout_secs, 30);
    }

    #[test]
    fn test_models_config_vendor_map() {
        let yaml = r#"
models:
  - model_id: alpha-1
    vendor: acme
  - model_id: beta-9
    vendor: initech
    enabled: false
"#;
        let cfg: ModelsConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.enabled_model_ids(), vec!["alpha-1"]);
        assert_eq!(cfg.vendor_map()["beta-9"], "initech");
    }

    #[test]
    fn test_strategy_lookup_missing_is_config_error() {
        let cfg = ExperimentConfig::default();
        assert!(cfg.strategy("nope").is_err());
    }
}
