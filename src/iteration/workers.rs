/// Batch gating: one worker thread per submission.
///
/// Submissions are independent (one controller per (model, strategy)
/// pair), so the batch fans out a thread per job and collects reports
/// over a channel. Reports are sorted before returning so downstream
/// output is order-stable regardless of scheduling.
use std::sync::Arc;
use std::thread;

use crossbeam_channel::unbounded;

use crate::data::market::MarketData;
use crate::gates::GatePipeline;
use crate::iteration::controller::{IterationController, IterationStep};
use crate::iteration::evidence::PeerReviewExcerpt;
use crate::submission::Submission;
use crate::types::Result;

/// One worker's result for one submission.
#[derive(Debug)]
pub struct WorkerReport {
    pub model_id: String,
    pub strategy_id: String,
    pub outcome: Result<IterationStep>,
}

/// Gate a batch of submissions concurrently. Returns each controller
/// (advanced by its step) alongside its report, sorted by
/// (model, strategy).
pub fn run_batch(
    pipeline: Arc<GatePipeline>,
    market: Arc<MarketData>,
    jobs: Vec<(IterationController, Submission, Vec<PeerReviewExcerpt>)>,
) -> Vec<(IterationController, WorkerReport)> {
    let (tx, rx) = unbounded();
    let expected = jobs.len();

    let mut handles = Vec::with_capacity(expected);
    for (mut controller, submission, reviews) in jobs {
        let tx = tx.clone();
        let pipeline = Arc::clone(&pipeline);
        let market = Arc::clone(&market);
        handles.push(thread::spawn(move || {
            let outcome = controller.gate_submission(&pipeline, &submission, &market, reviews);
            let report = WorkerReport {
                model_id: submission.model_id.clone(),
                strategy_id: submission.strategy_id.clone(),
                outcome,
            };
            // Receiver outlives all senders; a send failure means the
            // batch was abandoned and the report is moot.
            let _ = tx.send((controller, report));
        }));
    }
    drop(tx);

    let mut results: Vec<(IterationController, WorkerReport)> = rx.iter().collect();
    for handle in handles {
        if let Err(e) = handle.join() {
            log::error!("gating worker panicked: {:?}", e);
        }
    }
    results.sort_by(|a, b| {
        (a.1.model_id.as_str(), a.1.strategy_id.as_str())
            .cmp(&(b.1.model_id.as_str(), b.1.strategy_id.as_str()))
    });
    results
}
