/// Per-(model, strategy) iteration state machine.
///
/// Iter0 freezes the drift baseline; Iter1..Iter3 check against it. An
/// iteration converges early when D1, D2 and D3 all reach the score
/// threshold without drift, and terminates unconditionally after the
/// highest iteration index. Only advancing steps emit evidence.
use serde::{Deserialize, Serialize};

use crate::config::experiment::IterationSettings;
use crate::data::market::MarketData;
use crate::drift::{DriftDetector, DriftReport};
use crate::gates::{GatePipeline, GateResult};
use crate::iteration::evidence::{changed_lines, ComplianceFlags, EvidenceBundle, PeerReviewExcerpt};
use crate::scorecard::{derive_scorecard, Scorecard};
use crate::submission::Submission;
use crate::types::{HarnessError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IterationState {
    Iter0,
    Iter1,
    Iter2,
    Iter3,
    Done,
}

impl IterationState {
    pub fn index(&self) -> Option<u32> {
        match self {
            IterationState::Iter0 => Some(0),
            IterationState::Iter1 => Some(1),
            IterationState::Iter2 => Some(2),
            IterationState::Iter3 => Some(3),
            IterationState::Done => None,
        }
    }

    fn next(&self) -> IterationState {
        match self {
            IterationState::Iter0 => IterationState::Iter1,
            IterationState::Iter1 => IterationState::Iter2,
            IterationState::Iter2 => IterationState::Iter3,
            IterationState::Iter3 | IterationState::Done => IterationState::Done,
        }
    }

    fn from_index(index: u32) -> Result<Self> {
        match index {
            0 => Ok(IterationState::Iter0),
            1 => Ok(IterationState::Iter1),
            2 => Ok(IterationState::Iter2),
            3 => Ok(IterationState::Iter3),
            other => Err(HarnessError::Config(format!(
                "iteration index {} out of range",
                other
            ))),
        }
    }
}

#[derive(Clone, Debug)]
pub struct IterationConfig {
    pub settings: IterationSettings,
}

impl IterationConfig {
    pub fn new(settings: IterationSettings) -> Self {
        Self { settings }
    }
}

/// What one gated iteration produced.
#[derive(Clone, Debug)]
pub struct IterationStep {
    pub scorecard: Scorecard,
    /// Full gate verdicts in pipeline order, for the event stream.
    pub gate_results: Vec<GateResult>,
    pub drift: DriftReport,
    /// Present only when the loop advances to another iteration.
    pub evidence: Option<EvidenceBundle>,
    pub converged: bool,
    pub state_after: IterationState,
}

pub struct IterationController {
    cfg: IterationConfig,
    state: IterationState,
    drift: Option<DriftDetector>,
    prior_code: Option<String>,
}

impl IterationController {
    pub fn new(cfg: IterationConfig) -> Self {
        Self {
            cfg,
            state: IterationState::Iter0,
            drift: None,
            prior_code: None,
        }
    }

    /// Rebuild a controller mid-ladder, from state persisted after an
    /// earlier invocation.
    pub fn resume(
        cfg: IterationConfig,
        iteration: u32,
        drift: DriftDetector,
        prior_code: String,
    ) -> Result<Self> {
        Ok(Self {
            cfg,
            state: IterationState::from_index(iteration)?,
            drift: Some(drift),
            prior_code: Some(prior_code),
        })
    }

    pub fn state(&self) -> IterationState {
        self.state
    }

    pub fn drift_detector(&self) -> Option<&DriftDetector> {
        self.drift.as_ref()
    }

    /// Code of the most recently gated submission.
    pub fn prior_code(&self) -> Option<&str> {
        self.prior_code.as_deref()
    }

    /// Gate one submission and advance the state machine.
    pub fn gate_submission(
        &mut self,
        pipeline: &GatePipeline,
        submission: &Submission,
        market: &MarketData,
        peer_reviews: Vec<PeerReviewExcerpt>,
    ) -> Result<IterationStep> {
        let Some(expected) = self.state.index() else {
            return Err(HarnessError::Config(format!(
                "{}/{} already terminated",
                submission.model_id, submission.strategy_id
            )));
        };
        if submission.iteration != expected {
            return Err(HarnessError::Config(format!(
                "expected iteration {} for {}/{}, got {}",
                expected, submission.model_id, submission.strategy_id, submission.iteration
            )));
        }

        let drift_report = match &self.drift {
            None => {
                self.drift = Some(DriftDetector::freeze(&submission.card, pipeline.spec()));
                DriftReport::clean()
            }
            Some(detector) => detector.check(&submission.card),
        };

        let outcome = pipeline.execute(submission, market);
        let scorecard = derive_scorecard(&outcome, submission, pipeline.spec(), drift_report.drifted);

        let converged = scorecard.meets_threshold(self.cfg.settings.score_threshold);
        let exhausted = expected >= self.cfg.settings.max_iterations;

        let evidence = if converged || exhausted {
            self.state = IterationState::Done;
            None
        } else {
            self.state = self.state.next();
            let diff = self
                .prior_code
                .as_deref()
                .map(|prev| changed_lines(prev, &submission.code))
                .unwrap_or(0);
            Some(EvidenceBundle {
                model_id: submission.model_id.clone(),
                strategy_id: submission.strategy_id.clone(),
                iteration: submission.iteration,
                scorecard: scorecard.clone(),
                first_failure: outcome
                    .fatal_failure()
                    .map(|r| (r.gate.as_str().to_string(), r.detail.clone())),
                drift_mismatches: drift_report.mismatches.clone(),
                peer_reviews,
                compliance: ComplianceFlags::new(diff, self.cfg.settings.changed_lines_budget),
            })
        };
        self.prior_code = Some(submission.code.clone());

        Ok(IterationStep {
            scorecard,
            gate_results: outcome.results,
            drift: drift_report,
            evidence,
            converged,
            state_after: self.state,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::spec::StrategySpec;
    use crate::data::logs::LogTable;
    use crate::data::market::testutil::synthetic_series;
    use crate::sandbox::{RunArtifacts, SandboxOutcome, SubmissionRunner};
    use crate::submission::StrategyCard;

    /// Deterministic in-process runner producing schema-complete logs.
    struct HonestRunner;

    impl SubmissionRunner for HonestRunner {
        fn run(&self, _submission: &Submission, market: &MarketData) -> SandboxOutcome {
            SandboxOutcome::Success(honest_artifacts(market))
        }
    }

    fn honest_artifacts(market: &MarketData) -> RunArtifacts {
        let closes = market.closes();
        let headers: Vec<String> = ["datetime", "close", "MB", "signal", "position_state", "equity"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let mut rows = Vec::new();
        for (i, bar) in market.bars().iter().enumerate() {
            let mb = if i >= 2 {
                format!("{}", (closes[i - 2] + closes[i - 1] + closes[i]) / 3.0)
            } else {
                String::new()
            };
            rows.push(vec![
                bar.datetime.clone(),
                format!("{}", bar.close),
                mb,
                "hold".to_string(),
                "flat".to_string(),
                "100000".to_string(),
            ]);
        }
        let audit_log = LogTable::from_parts(headers, rows);
        let trade_log = LogTable::from_parts(
            [
                "trade_id", "side", "entry_time", "entry_price", "exit_time", "exit_price",
                "pnl", "reason_entry", "reason_exit",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            vec![],
        );
        RunArtifacts {
            trade_log,
            audit_log,
            stdout: String::new(),
        }
    }

    fn spec() -> StrategySpec {
        serde_json::from_str(crate::config::spec::tests::SPEC_JSON).unwrap()
    }

    fn submission(iteration: u32) -> Submission {
        Submission {
            model_id: "m".to_string(),
            strategy_id: "bollinger_mean_reversion".to_string(),
            iteration,
            code: "class Strategy:\n    pass\n".to_string(),
            card: StrategyCard::from_json_str(crate::submission::tests::CARD_JSON).unwrap(),
            trade_log: None,
            audit_log: None,
        }
    }

    fn controller() -> IterationController {
        IterationController::new(IterationConfig::new(IterationSettings::default()))
    }

    #[test]
    fn test_honest_submission_converges_at_iter0() {
        let pipeline = GatePipeline::new(spec(), Arc::new(HonestRunner));
        let market = synthetic_series(12);
        let mut ctl = controller();
        let step = ctl
            .gate_submission(&pipeline, &submission(0), &market, vec![])
            .unwrap();
        assert!(step.converged);
        assert_eq!(step.state_after, IterationState::Done);
        assert!(step.evidence.is_none());
        assert_eq!(step.scorecard.d3, Some(1.0));
        // Every gate verdict rides along for the event stream.
        assert_eq!(step.gate_results.len(), 6);
        assert!(step.gate_results.iter().all(|r| r.passed()));
    }

    #[test]
    fn test_wrong_iteration_index_is_config_error() {
        let pipeline = GatePipeline::new(spec(), Arc::new(HonestRunner));
        let market = synthetic_series(12);
        let mut ctl = controller();
        assert!(ctl
            .gate_submission(&pipeline, &submission(2), &market, vec![])
            .is_err());
    }

    #[test]
    fn test_frozen_formula_drift_zeroes_fidelity() {
        let pipeline = GatePipeline::new(spec(), Arc::new(HonestRunner));
        let market = synthetic_series(12);
        let mut ctl = controller();

        // Force a non-converging Iter0 so the ladder advances: break the
        // card's declared outputs enough to fail the schema gate.
        let mut first = submission(0);
        first.card.parameters.remove("N");
        let step0 = ctl
            .gate_submission(&pipeline, &first, &market, vec![])
            .unwrap();
        assert!(!step0.converged);
        let evidence = step0.evidence.unwrap();
        assert_eq!(evidence.first_failure.as_ref().unwrap().0, "schema");

        // Iter1 fixes the schema but tampers with a frozen formula.
        let mut second = submission(1);
        second
            .card
            .formulas
            .insert("exit".to_string(), "close >= UB".to_string());
        let step1 = ctl
            .gate_submission(&pipeline, &second, &market, vec![])
            .unwrap();
        assert!(step1.drift.drifted);
        assert_eq!(step1.scorecard.d1, Some(0.0));
        assert!(!step1.converged);
    }

    #[test]
    fn test_evidence_carries_changed_lines_diff() {
        let pipeline = GatePipeline::new(spec(), Arc::new(HonestRunner));
        let market = synthetic_series(12);
        let mut ctl = controller();

        let mut first = submission(0);
        first.card.parameters.remove("N");
        ctl.gate_submission(&pipeline, &first, &market, vec![])
            .unwrap();

        let mut second = submission(1);
        second.card.parameters.remove("N");
        second.code.push_str("    # tweak\n");
        let step = ctl
            .gate_submission(&pipeline, &second, &market, vec![])
            .unwrap();
        let evidence = step.evidence.unwrap();
        assert_eq!(evidence.compliance.changed_lines, 1);
        assert!(!evidence.compliance.budget_exceeded);
    }

    #[test]
    fn test_ladder_terminates_after_highest_iteration() {
        let pipeline = GatePipeline::new(spec(), Arc::new(HonestRunner));
        let market = synthetic_series(12);
        let mut ctl = controller();

        for k in 0..=3u32 {
            let mut sub = submission(k);
            sub.card.parameters.remove("N");
            let step = ctl.gate_submission(&pipeline, &sub, &market, vec![]).unwrap();
            if k < 3 {
                assert!(step.evidence.is_some());
            } else {
                assert!(step.evidence.is_none());
                assert_eq!(step.state_after, IterationState::Done);
            }
        }
        let mut extra = submission(0);
        extra.card.parameters.remove("N");
        assert!(ctl
            .gate_submission(&pipeline, &extra, &market, vec![])
            .is_err());
    }
}
