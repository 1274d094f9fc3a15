/// Command-line surface of the harness.
///
/// Three subcommands cover the lifecycle: `run-iter` gates one iteration
/// of submissions, `cross-eval` folds peer reviews into rankings, and
/// `select-top` publishes the per-vendor shortlist. All state between
/// invocations lives under the results directory.
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

use crate::arena::{aggregate, select_shortlist, CrossEvaluation, RankingSnapshot};
use crate::config::experiment::{ExperimentConfig, ModelsConfig, StrategyEntry};
use crate::config::spec::StrategySpec;
use crate::data::market::MarketData;
use crate::drift::DriftDetector;
use crate::gates::{GateName, GatePipeline, GateVerdict};
use crate::iteration::controller::{IterationConfig, IterationController};
use crate::iteration::evidence::{write_bundle_once, EvidenceStore, PeerReviewExcerpt};
use crate::iteration::workers::run_batch;
use crate::observability::{classify_exec_failure, Correlation, EventLog, HarnessEventType};
use crate::sandbox::{SandboxLimits, SandboxRunner};
use crate::submission::Submission;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Directory holding experiment.yaml, models.yaml and spec files
    #[arg(long, default_value = "configs")]
    config_dir: PathBuf,
    /// Directory holding submissions, state and outputs
    #[arg(long, default_value = "results")]
    results_dir: PathBuf,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Gate one iteration of submissions for every enabled model
    RunIter {
        /// Iteration index (0..=3)
        #[arg(long)]
        iter: u32,
        /// Restrict to these model ids (default: all enabled)
        #[arg(long)]
        models: Vec<String>,
        /// Restrict to these strategy ids (default: all configured)
        #[arg(long)]
        strategies: Vec<String>,
    },
    /// Aggregate peer reviews into per-strategy rankings
    CrossEval {
        /// Restrict to these model ids (default: all enabled)
        #[arg(long)]
        models: Vec<String>,
        /// Restrict to these strategy ids (default: all configured)
        #[arg(long)]
        strategies: Vec<String>,
    },
    /// Publish the best-model-per-vendor shortlist
    SelectTop {
        /// Restrict to these strategy ids (default: all configured)
        #[arg(long)]
        strategies: Vec<String>,
        /// Maximum shortlist length
        #[arg(long, default_value_t = 10)]
        top_n: usize,
    },
}

/// Per-(model, strategy) ladder state persisted between invocations.
#[derive(Serialize, Deserialize)]
struct LadderState {
    /// Next expected iteration index; None once terminated.
    next_iteration: Option<u32>,
    drift: DriftDetector,
    prior_code: String,
}

pub fn run() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    match cli.command {
        Commands::RunIter {
            iter,
            models,
            strategies,
        } => run_iteration(&cli.config_dir, &cli.results_dir, iter, &models, &strategies),
        Commands::CrossEval { models, strategies } => {
            cross_eval(&cli.config_dir, &cli.results_dir, &models, &strategies)
        }
        Commands::SelectTop { strategies, top_n } => {
            select_top(&cli.config_dir, &cli.results_dir, &strategies, top_n)
        }
    }
}

fn load_configs(config_dir: &Path) -> Result<(ExperimentConfig, ModelsConfig)> {
    let experiment = ExperimentConfig::from_path(&config_dir.join("experiment.yaml"))
        .context("loading experiment config")?;
    let models =
        ModelsConfig::from_path(&config_dir.join("models.yaml")).context("loading model roster")?;
    Ok((experiment, models))
}

fn selected_strategies<'a>(
    experiment: &'a ExperimentConfig,
    filter: &[String],
) -> Vec<&'a StrategyEntry> {
    experiment
        .strategies
        .iter()
        .filter(|s| filter.is_empty() || filter.contains(&s.strategy_id))
        .collect()
}

fn run_iteration(
    config_dir: &Path,
    results_dir: &Path,
    iter: u32,
    model_filter: &[String],
    strategy_filter: &[String],
) -> Result<()> {
    let (experiment, models) = load_configs(config_dir)?;
    let mut model_ids = models.enabled_model_ids();
    if !model_filter.is_empty() {
        model_ids.retain(|m| model_filter.contains(m));
    }
    if model_ids.is_empty() {
        bail!("no enabled models in roster");
    }

    let events = EventLog::open(&results_dir.join("events.jsonl"))?;
    let correlation = Correlation::new_run();
    let reviews = load_peer_reviews(results_dir);

    let limits = SandboxLimits {
        wall_timeout: experiment.sandbox.wall_timeout(),
        output_limit_bytes: experiment.sandbox.output_limit_bytes,
        ..SandboxLimits::default()
    };
    let scratch_root = results_dir.join("scratch");
    fs::create_dir_all(&scratch_root)?;
    let runner = Arc::new(SandboxRunner::new(
        &scratch_root,
        limits,
        experiment.sandbox.initial_capital,
    ));

    let iter_cfg = IterationConfig::new(experiment.iteration.clone());
    let mut evidence_store = EvidenceStore::new();
    let mut gated = 0usize;
    for entry in selected_strategies(&experiment, strategy_filter) {
        let spec = StrategySpec::from_path(&config_dir.join(&entry.spec_path))?;
        let market = Arc::new(MarketData::from_csv_path(
            &entry.strategy_id,
            &config_dir.join(&entry.market_data),
        )?);
        let pipeline = Arc::new(GatePipeline::new(spec, runner.clone()));

        let mut jobs = Vec::new();
        for model_id in &model_ids {
            let submission_dir = results_dir
                .join(format!("iter{}_submissions", iter))
                .join(model_id)
                .join(&entry.strategy_id);
            if !submission_dir.exists() {
                log::warn!(
                    "no iter{} submission from {} for {}",
                    iter,
                    model_id,
                    entry.strategy_id
                );
                continue;
            }
            let submission =
                match Submission::load(&submission_dir, model_id, &entry.strategy_id, iter) {
                    Ok(s) => s,
                    Err(e) => {
                        log::warn!("skipping unloadable submission {}: {}", model_id, e);
                        continue;
                    }
                };
            let controller = match build_controller(
                results_dir,
                &iter_cfg,
                model_id,
                &entry.strategy_id,
                iter,
            ) {
                Ok(c) => c,
                Err(e) => {
                    log::warn!("skipping {}: {}", model_id, e);
                    continue;
                }
            };
            let peer = reviews_for(&reviews, model_id, &entry.strategy_id);
            jobs.push((controller, submission, peer));
        }

        for (controller, report) in run_batch(pipeline.clone(), market, jobs) {
            let key = correlation.for_submission(&report.model_id, &report.strategy_id, iter);
            let step = match report.outcome {
                Ok(step) => step,
                Err(e) => {
                    events.record(HarnessEventType::GateVerdict, &key, &format!("error: {}", e));
                    continue;
                }
            };
            gated += 1;

            for result in &step.gate_results {
                if result.verdict == GateVerdict::Skipped {
                    continue;
                }
                let line = if result.failed() {
                    format!("{}: fail ({})", result.gate, result.detail)
                } else {
                    format!("{}: pass", result.gate)
                };
                events.record(HarnessEventType::GateVerdict, &key, &line);
                if result.gate == GateName::Exec && result.failed() {
                    if let Some(kind) = classify_exec_failure(&result.detail) {
                        events.record(kind, &key, &result.detail);
                    }
                }
            }

            let out_dir = results_dir
                .join(format!("iter{}_results", iter))
                .join(&report.model_id)
                .join(&report.strategy_id);
            fs::create_dir_all(&out_dir)?;
            write_json(&out_dir.join("scorecard.json"), &step.scorecard)?;
            if let Some(evidence) = &step.evidence {
                // Write-once: a bundle that already exists for this key
                // means the iteration was gated before.
                evidence_store.insert(evidence.clone())?;
                write_bundle_once(&out_dir.join("evidence_bundle.json"), evidence)?;
                events.record(HarnessEventType::EvidenceEmitted, &key, "bundle written");
            }
            if step.drift.drifted {
                events.record(
                    HarnessEventType::DriftFlagged,
                    &key,
                    &step.drift.mismatches.join("; "),
                );
            }
            events.record(
                HarnessEventType::IterationTransition,
                &key,
                &format!("{:?} (converged: {})", step.state_after, step.converged),
            );

            persist_state(
                results_dir,
                &report.model_id,
                &report.strategy_id,
                &controller,
            )?;
        }
    }

    if gated == 0 {
        bail!("no valid submissions gated for iteration {}", iter);
    }
    log::info!("gated {} submissions at iteration {}", gated, iter);
    Ok(())
}

fn state_path(results_dir: &Path, model_id: &str, strategy_id: &str) -> PathBuf {
    results_dir
        .join("state")
        .join(format!("{}__{}.json", model_id, strategy_id))
}

fn build_controller(
    results_dir: &Path,
    cfg: &IterationConfig,
    model_id: &str,
    strategy_id: &str,
    iter: u32,
) -> Result<IterationController> {
    if iter == 0 {
        return Ok(IterationController::new(cfg.clone()));
    }
    let path = state_path(results_dir, model_id, strategy_id);
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("no persisted state at {}", path.display()))?;
    let state: LadderState = serde_json::from_str(&raw).context("corrupt ladder state")?;
    match state.next_iteration {
        Some(expected) if expected == iter => Ok(IterationController::resume(
            cfg.clone(),
            iter,
            state.drift,
            state.prior_code,
        )?),
        Some(expected) => bail!(
            "{}/{} expects iteration {}, not {}",
            model_id,
            strategy_id,
            expected,
            iter
        ),
        None => bail!("{}/{} already terminated", model_id, strategy_id),
    }
}

fn persist_state(
    results_dir: &Path,
    model_id: &str,
    strategy_id: &str,
    controller: &IterationController,
) -> Result<()> {
    // The detector and prior code are always set once a step has run.
    let Some(drift) = controller.drift_detector() else {
        return Ok(());
    };
    let Some(prior_code) = controller.prior_code() else {
        return Ok(());
    };
    let state = LadderState {
        next_iteration: controller.state().index(),
        drift: drift.clone(),
        prior_code: prior_code.to_string(),
    };
    let path = state_path(results_dir, model_id, strategy_id);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    write_json(&path, &state)
}

fn load_peer_reviews(results_dir: &Path) -> Vec<CrossEvaluation> {
    let path = results_dir.join("cross_evaluations.json");
    if !path.exists() {
        return Vec::new();
    }
    match fs::read_to_string(&path)
        .map_err(anyhow::Error::from)
        .and_then(|raw| serde_json::from_str(&raw).map_err(anyhow::Error::from))
    {
        Ok(evals) => evals,
        Err(e) => {
            log::warn!("ignoring unreadable cross evaluations: {}", e);
            Vec::new()
        }
    }
}

fn reviews_for(
    evaluations: &[CrossEvaluation],
    model_id: &str,
    strategy_id: &str,
) -> Vec<PeerReviewExcerpt> {
    evaluations
        .iter()
        .filter(|e| e.submitter == model_id && e.strategy_id == strategy_id && !e.is_self_review())
        .map(|e| PeerReviewExcerpt {
            reviewer: e.reviewer.clone(),
            d1: e.d1,
            d2: e.d2,
            comment: e.comment.clone(),
        })
        .collect()
}

fn rankings_path(results_dir: &Path, strategy_id: &str) -> PathBuf {
    results_dir.join(format!("rankings_{}.json", strategy_id))
}

fn cross_eval(
    config_dir: &Path,
    results_dir: &Path,
    model_filter: &[String],
    strategy_filter: &[String],
) -> Result<()> {
    let (experiment, models) = load_configs(config_dir)?;
    let evaluations = load_peer_reviews(results_dir);
    if evaluations.is_empty() {
        bail!("no cross evaluations found under {}", results_dir.display());
    }
    let mut participants = models.enabled_model_ids();
    if !model_filter.is_empty() {
        participants.retain(|m| model_filter.contains(m));
    }
    if participants.is_empty() {
        bail!("no enabled models in roster");
    }

    for entry in selected_strategies(&experiment, strategy_filter) {
        let snapshot = aggregate(&entry.strategy_id, &participants, &evaluations);
        write_json(&rankings_path(results_dir, &entry.strategy_id), &snapshot)?;
        log::info!(
            "ranked {} models for {}",
            snapshot.rankings.len(),
            entry.strategy_id
        );
    }
    Ok(())
}

fn select_top(
    config_dir: &Path,
    results_dir: &Path,
    strategy_filter: &[String],
    top_n: usize,
) -> Result<()> {
    let (experiment, models) = load_configs(config_dir)?;
    let events = EventLog::open(&results_dir.join("events.jsonl"))?;
    let correlation = Correlation::new_run();

    for entry in selected_strategies(&experiment, strategy_filter) {
        let path = rankings_path(results_dir, &entry.strategy_id);
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("no rankings at {}; run cross-eval first", path.display()))?;
        let snapshot: RankingSnapshot = serde_json::from_str(&raw).context("corrupt rankings")?;

        let shortlist = select_shortlist(&snapshot, &models.vendor_map(), top_n);
        let out = results_dir.join(format!("shortlist_{}.yaml", entry.strategy_id));
        let mut doc = BTreeMap::new();
        doc.insert(
            "strategy_id".to_string(),
            serde_yaml::Value::from(entry.strategy_id.as_str()),
        );
        doc.insert(
            "shortlist".to_string(),
            serde_yaml::to_value(&shortlist).context("serializing shortlist")?,
        );
        fs::write(&out, serde_yaml::to_string(&doc)?)?;

        events.record(
            HarnessEventType::ShortlistSelected,
            &correlation,
            &format!("{} entries for {}", shortlist.len(), entry.strategy_id),
        );
        log::info!("shortlist written to {}", out.display());
    }
    Ok(())
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let body = serde_json::to_string_pretty(value)?;
    fs::write(path, body).with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}
