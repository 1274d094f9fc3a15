/// The six-gate validity pipeline.
///
/// Gates run in fixed order. A fatal failure records the remaining gates
/// as skipped so every outcome carries all six entries. The pipeline owns
/// no execution machinery itself; sandbox runs go through the
/// `SubmissionRunner` seam.
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::config::spec::StrategySpec;
use crate::data::logs::LogTable;
use crate::data::market::MarketData;
use crate::gates::{indicators, GateName, GateResult};
use crate::sandbox::{RunArtifacts, SandboxOutcome, SubmissionRunner};
use crate::submission::Submission;
use crate::types::{nearly_equal, NUMERIC_TOLERANCE};

/// Probe points for the guarded replay, as fractions of the series.
const LEAK_PROBE_FRACTIONS: [(usize, usize); 4] = [(1, 4), (1, 2), (3, 4), (1, 1)];

pub struct GatePipeline {
    spec: StrategySpec,
    runner: Arc<dyn SubmissionRunner>,
    tolerance: f64,
}

/// Everything one pipeline pass produced.
#[derive(Clone, Debug)]
pub struct PipelineOutcome {
    /// One entry per gate, in pipeline order.
    pub results: Vec<GateResult>,
    /// Artifacts of the first successful execution, if the exec gate ran.
    pub artifacts: Option<RunArtifacts>,
}

impl PipelineOutcome {
    pub fn gate(&self, name: GateName) -> &GateResult {
        self.results
            .iter()
            .find(|r| r.gate == name)
            .expect("pipeline outcome always carries all gates")
    }

    pub fn fatal_failure(&self) -> Option<&GateResult> {
        self.results.iter().find(|r| r.is_fatal_failure())
    }

    pub fn all_fatal_passed(&self) -> bool {
        self.fatal_failure().is_none()
    }
}

impl GatePipeline {
    pub fn new(spec: StrategySpec, runner: Arc<dyn SubmissionRunner>) -> Self {
        Self {
            spec,
            runner,
            tolerance: NUMERIC_TOLERANCE,
        }
    }

    pub fn spec(&self) -> &StrategySpec {
        &self.spec
    }

    /// Run the full pipeline on one submission.
    pub fn execute(&self, submission: &Submission, market: &MarketData) -> PipelineOutcome {
        let mut results = Vec::with_capacity(GateName::ORDER.len());
        let mut artifacts: Option<RunArtifacts> = None;
        let mut aborted = false;

        for gate in GateName::ORDER {
            if aborted {
                results.push(GateResult::skipped(gate));
                continue;
            }
            log::debug!(
                "gate {} start for {}/{} iter {}",
                gate,
                submission.model_id,
                submission.strategy_id,
                submission.iteration
            );
            let result = match gate {
                GateName::Parse => self.gate_parse(submission),
                GateName::Schema => self.gate_schema(submission),
                GateName::Exec => self.gate_exec(submission, market, &mut artifacts),
                GateName::Determ => self.gate_determ(submission, market, &artifacts),
                GateName::AntiLeak => self.gate_anti_leak(submission, market, &artifacts),
                GateName::Audit => self.gate_audit(market, &artifacts),
            };
            if result.is_fatal_failure() {
                aborted = true;
            }
            results.push(result);
        }

        PipelineOutcome { results, artifacts }
    }

    /// Parse gate: the code blob must be non-trivial, bracket-balanced
    /// outside string literals, and must mention the declared entry symbol.
    fn gate_parse(&self, submission: &Submission) -> GateResult {
        let code = submission.code.trim();
        if code.is_empty() {
            return GateResult::fail(GateName::Parse, "code blob is empty");
        }
        if let Err(detail) = check_bracket_balance(code) {
            return GateResult::fail(GateName::Parse, detail);
        }
        let symbol = &submission.card.entry.symbol;
        if !code.contains(symbol.as_str()) {
            return GateResult::fail(
                GateName::Parse,
                format!("declared entry symbol {:?} not found in code", symbol),
            );
        }
        GateResult::pass(GateName::Parse)
    }

    /// Schema gate: the strategy card must cover the frozen parameter
    /// surface with consistent types and a declared output specification,
    /// and any self-reported logs must match the required output schemas.
    fn gate_schema(&self, submission: &Submission) -> GateResult {
        let card = &submission.card;
        let mut violations = Vec::new();

        for (name, param) in &self.spec.parameters {
            if !param.required {
                continue;
            }
            match card.parameters.get(name) {
                None => violations.push(format!("card missing required parameter {}", name)),
                Some(declared) => {
                    if let Some(t) = &declared.declared_type {
                        if t != &param.param_type {
                            violations.push(format!(
                                "parameter {} declared as {} but spec requires {}",
                                name, t, param.param_type
                            ));
                        }
                    }
                    if !value_matches_type(&declared.value, &param.param_type) {
                        violations.push(format!(
                            "parameter {} value {} is not a {}",
                            name, declared.value, param.param_type
                        ));
                    }
                }
            }
        }

        if !card.output_specification.is_declared() {
            violations.push("card does not declare its output columns".to_string());
        } else {
            for field in &self.spec.required_outputs.trade_log {
                if !card
                    .output_specification
                    .trade_log_columns
                    .contains(&field.name)
                {
                    violations.push(format!(
                        "declared trade log omits required column {}",
                        field.name
                    ));
                }
            }
            for field in &self.spec.required_outputs.audit_log {
                if !card
                    .output_specification
                    .audit_log_columns
                    .contains(&field.name)
                {
                    violations.push(format!(
                        "declared audit log omits required column {}",
                        field.name
                    ));
                }
            }
        }

        if let Some(trade_log) = &submission.trade_log {
            violations.extend(self.spec.trade_log_schema().validate_table(trade_log));
        }
        if let Some(audit_log) = &submission.audit_log {
            violations.extend(self.spec.audit_log_schema().validate_table(audit_log));
        }

        if violations.is_empty() {
            GateResult::pass(GateName::Schema)
        } else {
            GateResult::fail(GateName::Schema, violations.join("; "))
        }
    }

    /// Exec gate: one full sandbox run must succeed and emit both logs.
    fn gate_exec(
        &self,
        submission: &Submission,
        market: &MarketData,
        artifacts: &mut Option<RunArtifacts>,
    ) -> GateResult {
        match self.runner.run(submission, market) {
            SandboxOutcome::Success(produced) => {
                let mut violations = self.spec.trade_log_schema().validate_table(&produced.trade_log);
                violations.extend(self.spec.audit_log_schema().validate_table(&produced.audit_log));
                *artifacts = Some(produced);
                if violations.is_empty() {
                    GateResult::pass(GateName::Exec)
                } else {
                    GateResult::fail(
                        GateName::Exec,
                        format!("emitted logs violate required schema: {}", violations.join("; ")),
                    )
                }
            }
            other => GateResult::fail(GateName::Exec, other.describe()),
        }
    }

    /// Determ gate: a second identical run must reproduce both logs within
    /// numeric tolerance.
    fn gate_determ(
        &self,
        submission: &Submission,
        market: &MarketData,
        artifacts: &Option<RunArtifacts>,
    ) -> GateResult {
        let Some(first) = artifacts else {
            return GateResult::fail(GateName::Determ, "no artifacts from first run");
        };
        match self.runner.run(submission, market) {
            SandboxOutcome::Success(second) => {
                let mut diffs = first.trade_log.diff(&second.trade_log, self.tolerance);
                diffs.extend(first.audit_log.diff(&second.audit_log, self.tolerance));
                if diffs.is_empty() {
                    GateResult::pass(GateName::Determ)
                } else {
                    GateResult::fail(
                        GateName::Determ,
                        format!("second run diverged: {}", diffs.join("; ")),
                    )
                }
            }
            other => GateResult::fail(
                GateName::Determ,
                format!("second run did not succeed: {}", other.describe()),
            ),
        }
    }

    /// Anti-Leak gate: replays strict prefixes of the series and requires
    /// the audit trail up to each cutoff to be reproduced exactly. Any
    /// ambiguity (failed replay, missing or extra rows) is a rejection.
    fn gate_anti_leak(
        &self,
        submission: &Submission,
        market: &MarketData,
        artifacts: &Option<RunArtifacts>,
    ) -> GateResult {
        let Some(full) = artifacts else {
            return GateResult::fail(GateName::AntiLeak, "no artifacts from full run");
        };
        let n = market.len();
        if n < 4 {
            // Too short to probe meaningfully; nothing to leak from.
            return GateResult::pass(GateName::AntiLeak);
        }

        let mut probes = BTreeSet::new();
        for (num, den) in LEAK_PROBE_FRACTIONS {
            let idx = (n * num / den).min(n - 1);
            if idx > 0 {
                probes.insert(idx);
            }
        }

        for cutoff in probes {
            let prefix = market.truncate(cutoff + 1);
            let cutoff_datetime = &market.bars()[cutoff].datetime;
            let replay = match self.runner.run(submission, &prefix) {
                SandboxOutcome::Success(r) => r,
                other => {
                    return GateResult::fail(
                        GateName::AntiLeak,
                        format!(
                            "replay truncated at {} failed: {}",
                            cutoff_datetime,
                            other.describe()
                        ),
                    )
                }
            };
            if let Some(detail) =
                audit_prefix_mismatch(&full.audit_log, &replay.audit_log, cutoff_datetime, self.tolerance)
            {
                return GateResult::fail(
                    GateName::AntiLeak,
                    format!("replay truncated at {}: {}", cutoff_datetime, detail),
                );
            }
        }
        GateResult::pass(GateName::AntiLeak)
    }

    /// Audit gate: recompute the declared indicators from the close series
    /// and require the audit log to agree within tolerance, and every trade
    /// timestamp to appear in the audit trail. Advisory only.
    fn gate_audit(&self, market: &MarketData, artifacts: &Option<RunArtifacts>) -> GateResult {
        let Some(run) = artifacts else {
            return GateResult::fail(GateName::Audit, "no artifacts from full run");
        };
        let audit = &run.audit_log;
        let closes = market.closes();
        let mut violations = Vec::new();

        let bar_index: std::collections::BTreeMap<&str, usize> = market
            .bars()
            .iter()
            .enumerate()
            .map(|(i, b)| (b.datetime.as_str(), i))
            .collect();

        for indicator in &self.spec.indicators {
            let column = indicator.column();
            if audit.column_index(column).is_none() {
                violations.push(format!("audit log missing indicator column {}", column));
                continue;
            }
            let expected = indicators::recompute(indicator, &closes);
            for row in 0..audit.len() {
                let Some(datetime) = audit.value(row, "datetime") else {
                    continue;
                };
                let Some(&bar) = bar_index.get(datetime) else {
                    violations.push(format!(
                        "audit row {} datetime {} not in market series",
                        row, datetime
                    ));
                    break;
                };
                let Some(want) = expected[bar] else {
                    // Warmup bar; nothing to check.
                    continue;
                };
                match audit.numeric(row, column) {
                    Some(got) if nearly_equal(got, want, self.tolerance) => {}
                    Some(got) => {
                        violations.push(format!(
                            "{} at {}: submission {} vs recomputed {}",
                            column, datetime, got, want
                        ));
                        break;
                    }
                    None => {
                        violations.push(format!(
                            "{} at {}: expected {} but cell is not numeric",
                            column, datetime, want
                        ));
                        break;
                    }
                }
            }
        }

        let audit_times: BTreeSet<&str> = audit
            .column("datetime")
            .map(|c| c.into_iter().collect())
            .unwrap_or_default();
        for time_column in ["entry_time", "exit_time"] {
            if let Some(times) = run.trade_log.column(time_column) {
                for t in times {
                    if !t.is_empty() && !audit_times.contains(t) {
                        violations.push(format!(
                            "trade {} {} has no matching audit row",
                            time_column, t
                        ));
                        break;
                    }
                }
            }
        }

        if violations.is_empty() {
            GateResult::pass(GateName::Audit)
        } else {
            GateResult::fail(GateName::Audit, violations.join("; "))
        }
    }
}

/// Compare the replay's audit trail against the full run's rows up to and
/// including `cutoff_datetime`, keyed by datetime.
fn audit_prefix_mismatch(
    full: &LogTable,
    replay: &LogTable,
    cutoff_datetime: &str,
    tolerance: f64,
) -> Option<String> {
    if full.headers() != replay.headers() {
        return Some("audit headers differ between full run and replay".to_string());
    }
    let Some(full_times) = full.column("datetime") else {
        return Some("full-run audit log has no datetime column".to_string());
    };
    let expected_rows: Vec<usize> = full_times
        .iter()
        .enumerate()
        .filter(|(_, t)| t.as_bytes() <= cutoff_datetime.as_bytes())
        .map(|(i, _)| i)
        .collect();
    if replay.len() != expected_rows.len() {
        return Some(format!(
            "replay emitted {} audit rows, full run had {} up to the cutoff",
            replay.len(),
            expected_rows.len()
        ));
    }
    for &full_row in &expected_rows {
        let datetime = full.value(full_row, "datetime").unwrap_or("");
        let Some(replay_row) = replay.find_row("datetime", datetime) else {
            return Some(format!("replay lost audit row at {}", datetime));
        };
        for (col, header) in full.headers().iter().enumerate() {
            let a = full.cell(full_row, col).unwrap_or("").trim();
            let b = replay.cell(replay_row, col).unwrap_or("").trim();
            let equal = a == b
                || matches!(
                    (a.parse::<f64>(), b.parse::<f64>()),
                    (Ok(x), Ok(y)) if nearly_equal(x, y, tolerance)
                );
            if !equal {
                return Some(format!(
                    "audit {} at {} changed under truncation: {:?} vs {:?}",
                    header, datetime, a, b
                ));
            }
        }
    }
    None
}

/// Does a card parameter value structurally match the spec's type name?
/// Unknown type names are accepted; the spec author owns the vocabulary.
fn value_matches_type(value: &serde_json::Value, type_name: &str) -> bool {
    match type_name {
        "int" | "integer" => value.is_i64() || value.is_u64(),
        "float" | "number" => value.is_number(),
        "string" | "str" => value.is_string(),
        "bool" | "boolean" => value.is_boolean(),
        _ => true,
    }
}

/// Bracket balance over `()[]{}`, skipping single- and double-quoted
/// string literals. A structural smoke test, not a language parser.
fn check_bracket_balance(code: &str) -> std::result::Result<(), String> {
    let mut stack = Vec::new();
    let mut quote: Option<char> = None;
    let mut escaped = false;
    for (i, c) in code.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '\'' | '"' => quote = Some(c),
            '(' | '[' | '{' => stack.push((c, i)),
            ')' | ']' | '}' => {
                let expected = match c {
                    ')' => '(',
                    ']' => '[',
                    _ => '{',
                };
                match stack.pop() {
                    Some((open, _)) if open == expected => {}
                    _ => return Err(format!("unbalanced {:?} at byte {}", c, i)),
                }
            }
            _ => {}
        }
    }
    if let Some((open, i)) = stack.pop() {
        return Err(format!("unclosed {:?} at byte {}", open, i));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bracket_balance_accepts_brackets_in_strings() {
        assert!(check_bracket_balance("f(\"(((\")").is_ok());
        assert!(check_bracket_balance("x = '([{'").is_ok());
    }

    #[test]
    fn test_bracket_balance_rejects_mismatch() {
        assert!(check_bracket_balance("f(]").is_err());
        assert!(check_bracket_balance("def f(:").is_err());
    }

    #[test]
    fn test_bracket_balance_handles_escapes() {
        assert!(check_bracket_balance(r#"s = "\"(" "#).is_ok());
    }

    #[test]
    fn test_audit_prefix_mismatch_detects_changed_row() {
        let full = LogTable::from_parts(
            vec!["datetime".into(), "signal".into()],
            vec![
                vec!["t1".into(), "hold".into()],
                vec!["t2".into(), "buy".into()],
                vec!["t3".into(), "sell".into()],
            ],
        );
        let replay_ok = LogTable::from_parts(
            vec!["datetime".into(), "signal".into()],
            vec![
                vec!["t1".into(), "hold".into()],
                vec!["t2".into(), "buy".into()],
            ],
        );
        assert!(audit_prefix_mismatch(&full, &replay_ok, "t2", NUMERIC_TOLERANCE).is_none());

        let replay_leaky = LogTable::from_parts(
            vec!["datetime".into(), "signal".into()],
            vec![
                vec!["t1".into(), "hold".into()],
                vec!["t2".into(), "hold".into()],
            ],
        );
        let detail = audit_prefix_mismatch(&full, &replay_leaky, "t2", NUMERIC_TOLERANCE).unwrap();
        assert!(detail.contains("changed under truncation"));
    }
}
