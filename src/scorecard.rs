/// Scorecard derivation: four dimensions over gate outcomes and artifacts.
///
/// Dimensions are in [0, 1] or null. Any fatal gate failure nulls all
/// four; gate flags are still recorded so the evidence bundle can point
/// at the first failure. Semantic drift forces D1 to zero after the
/// dimensions are derived. Derivation is pure: identical inputs yield
/// byte-identical scorecards, so timestamps belong to the event log,
/// never here.
use serde::{Deserialize, Serialize};

use crate::config::spec::StrategySpec;
use crate::data::logs::LogTable;
use crate::gates::{GateName, GateVerdict, PipelineOutcome};
use crate::submission::Submission;

/// Annualization factor for the Sharpe estimate (daily bars assumed).
const SHARPE_ANNUALIZATION: f64 = 252.0;

/// Pass/fail per gate; `None` means not evaluated.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct GateFlags {
    pub parse: Option<bool>,
    pub schema: Option<bool>,
    pub exec: Option<bool>,
    pub determ: Option<bool>,
    pub anti_leak: Option<bool>,
    pub audit: Option<bool>,
}

impl GateFlags {
    fn from_outcome(outcome: &PipelineOutcome) -> Self {
        let flag = |name: GateName| match outcome.gate(name).verdict {
            GateVerdict::Pass => Some(true),
            GateVerdict::Fail => Some(false),
            GateVerdict::Skipped => None,
        };
        Self {
            parse: flag(GateName::Parse),
            schema: flag(GateName::Schema),
            exec: flag(GateName::Exec),
            determ: flag(GateName::Determ),
            anti_leak: flag(GateName::AntiLeak),
            audit: flag(GateName::Audit),
        }
    }
}

/// One (model, strategy, iteration) scorecard.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Scorecard {
    pub model_id: String,
    pub strategy_id: String,
    pub iteration: u32,
    /// Spec fidelity.
    #[serde(rename = "D1")]
    pub d1: Option<f64>,
    /// Risk discipline.
    #[serde(rename = "D2")]
    pub d2: Option<f64>,
    /// Reliability.
    #[serde(rename = "D3")]
    pub d3: Option<f64>,
    /// Out-of-sample robustness.
    #[serde(rename = "D4")]
    pub d4: Option<f64>,
    pub gates: GateFlags,
    pub drifted: bool,
}

impl Scorecard {
    /// All dimensions a threshold decision depends on (D4 is informative
    /// only and never blocks convergence).
    pub fn decision_dimensions(&self) -> [Option<f64>; 3] {
        [self.d1, self.d2, self.d3]
    }

    pub fn meets_threshold(&self, threshold: f64) -> bool {
        !self.drifted
            && self
                .decision_dimensions()
                .iter()
                .all(|d| d.map(|v| v >= threshold).unwrap_or(false))
    }
}

/// Derive the scorecard for one gated submission.
pub fn derive_scorecard(
    outcome: &PipelineOutcome,
    submission: &Submission,
    spec: &StrategySpec,
    drifted: bool,
) -> Scorecard {
    let gates = GateFlags::from_outcome(outcome);
    let (d1, d2, d3, d4) = if outcome.fatal_failure().is_some() {
        (None, None, None, None)
    } else {
        let artifacts = outcome.artifacts.as_ref();
        let d1 = Some(spec_fidelity(submission, spec));
        let d2 = Some(
            artifacts
                .map(|a| risk_discipline(&a.trade_log, submission.card.constraints.max_position_size))
                .unwrap_or(0.0),
        );
        let d3 = Some(reliability(outcome));
        let d4 = artifacts.and_then(|a| oos_robustness(&a.trade_log));
        (d1, d2, d3, d4)
    };

    let d1 = if drifted { Some(0.0) } else { d1 };

    Scorecard {
        model_id: submission.model_id.clone(),
        strategy_id: submission.strategy_id.clone(),
        iteration: submission.iteration,
        d1,
        d2,
        d3,
        d4,
        gates,
        drifted,
    }
}

/// D1: four equally weighted fidelity checks against the frozen spec.
fn spec_fidelity(submission: &Submission, spec: &StrategySpec) -> f64 {
    let card = &submission.card;
    let mut passed = 0u32;

    if card.strategy_id == spec.strategy_id {
        passed += 1;
    }
    // No parameters outside the declared surface.
    if card
        .parameters
        .keys()
        .all(|name| spec.parameters.contains_key(name))
    {
        passed += 1;
    }
    // Card formulas that shadow frozen ones must match them verbatim.
    if card
        .formulas
        .iter()
        .all(|(name, formula)| match spec.frozen_formulas.get(name) {
            Some(frozen) => formula.trim() == frozen.trim(),
            None => true,
        })
    {
        passed += 1;
    }
    if card.output_specification.is_declared() {
        passed += 1;
    }

    f64::from(passed) / 4.0
}

/// D2: share of trades that respect the declared position cap. Trades
/// without a position column cannot violate it, and only cells that
/// parse as numbers enter the rate.
fn risk_discipline(trade_log: &LogTable, max_position_size: f64) -> f64 {
    let Some(positions) = trade_log.column("position_after") else {
        return 1.0;
    };
    let parsed: Vec<f64> = positions
        .iter()
        .filter_map(|p| p.trim().parse::<f64>().ok())
        .collect();
    if parsed.is_empty() {
        return 1.0;
    }
    let violations = parsed.iter().filter(|p| p.abs() > max_position_size).count();
    1.0 - violations as f64 / parsed.len() as f64
}

/// D3: fraction of the four behavioral gates that passed.
fn reliability(outcome: &PipelineOutcome) -> f64 {
    let behavioral = [
        GateName::Exec,
        GateName::Determ,
        GateName::AntiLeak,
        GateName::Audit,
    ];
    let passed = behavioral
        .iter()
        .filter(|g| outcome.gate(**g).passed())
        .count();
    passed as f64 / behavioral.len() as f64
}

/// D4: annualized Sharpe estimate over the per-trade pnl series, squashed
/// into [0, 1]. Null when no pnl column or fewer than two trades.
fn oos_robustness(trade_log: &LogTable) -> Option<f64> {
    let pnls: Vec<f64> = trade_log
        .column("pnl")?
        .iter()
        .filter_map(|p| p.trim().parse::<f64>().ok())
        .collect();
    let sharpe = sharpe_ratio(&pnls)?;
    Some((sharpe * 0.5).clamp(0.0, 1.0))
}

/// Annualized Sharpe over a return-like series. None for fewer than two
/// observations or zero variance.
pub fn sharpe_ratio(returns: &[f64]) -> Option<f64> {
    if returns.len() < 2 {
        return None;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let std = var.sqrt();
    if std == 0.0 {
        return None;
    }
    Some(mean / std * SHARPE_ANNUALIZATION.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::{GateResult, PipelineOutcome};
    use crate::submission::StrategyCard;

    fn spec() -> StrategySpec {
        serde_json::from_str(crate::config::spec::tests::SPEC_JSON).unwrap()
    }

    fn submission() -> Submission {
        Submission {
            model_id: "m".to_string(),
            strategy_id: "bollinger_mean_reversion".to_string(),
            iteration: 0,
            code: "class Strategy: pass".to_string(),
            card: StrategyCard::from_json_str(crate::submission::tests::CARD_JSON).unwrap(),
            trade_log: None,
            audit_log: None,
        }
    }

    fn outcome_with(results: Vec<GateResult>) -> PipelineOutcome {
        PipelineOutcome {
            results,
            artifacts: None,
        }
    }

    fn all_pass() -> PipelineOutcome {
        outcome_with(GateName::ORDER.iter().map(|g| GateResult::pass(*g)).collect())
    }

    fn fatal_at_schema() -> PipelineOutcome {
        outcome_with(vec![
            GateResult::pass(GateName::Parse),
            GateResult::fail(GateName::Schema, "missing column"),
            GateResult::skipped(GateName::Exec),
            GateResult::skipped(GateName::Determ),
            GateResult::skipped(GateName::AntiLeak),
            GateResult::skipped(GateName::Audit),
        ])
    }

    #[test]
    fn test_fatal_failure_nulls_all_dimensions() {
        let card = derive_scorecard(&fatal_at_schema(), &submission(), &spec(), false);
        assert_eq!(card.d1, None);
        assert_eq!(card.d2, None);
        assert_eq!(card.d3, None);
        assert_eq!(card.d4, None);
        assert_eq!(card.gates.parse, Some(true));
        assert_eq!(card.gates.schema, Some(false));
        assert_eq!(card.gates.exec, None);
    }

    #[test]
    fn test_all_pass_yields_full_reliability() {
        let card = derive_scorecard(&all_pass(), &submission(), &spec(), false);
        assert_eq!(card.d3, Some(1.0));
        assert_eq!(card.d1, Some(1.0));
        // No artifacts in this synthetic outcome, so risk defaults low.
        assert_eq!(card.d2, Some(0.0));
        assert!(!card.drifted);
    }

    #[test]
    fn test_drift_zeroes_spec_fidelity() {
        let card = derive_scorecard(&all_pass(), &submission(), &spec(), true);
        assert_eq!(card.d1, Some(0.0));
        assert!(card.drifted);
        assert!(!card.meets_threshold(0.85));
    }

    #[test]
    fn test_audit_failure_costs_a_quarter_of_reliability() {
        let mut results: Vec<GateResult> =
            GateName::ORDER.iter().map(|g| GateResult::pass(*g)).collect();
        results[5] = GateResult::fail(GateName::Audit, "indicator drift");
        let card = derive_scorecard(&outcome_with(results), &submission(), &spec(), false);
        assert_eq!(card.d3, Some(0.75));
        assert_eq!(card.gates.audit, Some(false));
    }

    #[test]
    fn test_risk_discipline_counts_cap_violations() {
        let log = LogTable::from_parts(
            vec!["trade_id".into(), "position_after".into()],
            vec![
                vec!["1".into(), "0.5".into()],
                vec!["2".into(), "1.5".into()],
                vec!["3".into(), "-0.8".into()],
                vec!["4".into(), "0.9".into()],
            ],
        );
        assert!((risk_discipline(&log, 1.0) - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_risk_discipline_ignores_unparsable_cells() {
        let log = LogTable::from_parts(
            vec!["trade_id".into(), "position_after".into()],
            vec![
                vec!["1".into(), "1.5".into()],
                vec!["2".into(), "n/a".into()],
                vec!["3".into(), "0.5".into()],
                vec!["4".into(), "".into()],
            ],
        );
        // One violation out of the two cells that parse.
        assert!((risk_discipline(&log, 1.0) - 0.5).abs() < 1e-12);

        let all_junk = LogTable::from_parts(
            vec!["trade_id".into(), "position_after".into()],
            vec![vec!["1".into(), "oops".into()]],
        );
        assert!((risk_discipline(&all_junk, 1.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_sharpe_ratio_edges() {
        assert_eq!(sharpe_ratio(&[]), None);
        assert_eq!(sharpe_ratio(&[1.0]), None);
        assert_eq!(sharpe_ratio(&[2.0, 2.0, 2.0]), None);
        assert!(sharpe_ratio(&[1.0, 2.0, 3.0]).unwrap() > 0.0);
        assert!(sharpe_ratio(&[-1.0, -2.0, -3.0]).unwrap() < 0.0);
    }

    #[test]
    fn test_scorecard_serializes_dimension_names() {
        let card = derive_scorecard(&all_pass(), &submission(), &spec(), false);
        let json = serde_json::to_value(&card).unwrap();
        assert!(json.get("D1").is_some());
        assert!(json.get("D4").is_some());
        assert!(json.get("gates").is_some());
    }
}
