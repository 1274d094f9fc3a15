/// JSONL event log for gate, sandbox, drift, iteration and arena
/// transitions. One serialized event per line; a failed append is logged
/// and dropped rather than failing the run.
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::Result;

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HarnessEventType {
    GateStart,
    GateVerdict,
    SandboxTimeout,
    CapabilityViolation,
    DriftFlagged,
    IterationTransition,
    EvidenceEmitted,
    ShortlistSelected,
}

/// Correlation fields stamped on every event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Correlation {
    pub run_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iteration: Option<u32>,
}

impl Correlation {
    pub fn new_run() -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            model_id: None,
            strategy_id: None,
            iteration: None,
        }
    }

    pub fn for_submission(&self, model_id: &str, strategy_id: &str, iteration: u32) -> Self {
        Self {
            run_id: self.run_id.clone(),
            model_id: Some(model_id.to_string()),
            strategy_id: Some(strategy_id.to_string()),
            iteration: Some(iteration),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HarnessEvent {
    pub timestamp: String,
    pub event_type: HarnessEventType,
    #[serde(flatten)]
    pub correlation: Correlation,
    pub detail: String,
}

/// Map an exec-gate failure detail onto the sandbox event it stands
/// for. Details come verbatim from the sandbox outcome description;
/// plain runtime failures carry no dedicated event.
pub fn classify_exec_failure(detail: &str) -> Option<HarnessEventType> {
    if detail.starts_with("wall-clock timeout") {
        Some(HarnessEventType::SandboxTimeout)
    } else if detail.starts_with("capability violation") {
        Some(HarnessEventType::CapabilityViolation)
    } else {
        None
    }
}

/// Append-only JSONL sink, shared across worker threads.
pub struct EventLog {
    file: Mutex<File>,
}

impl EventLog {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }

    pub fn record(&self, event_type: HarnessEventType, correlation: &Correlation, detail: &str) {
        let event = HarnessEvent {
            timestamp: chrono::Utc::now().to_rfc3339(),
            event_type,
            correlation: correlation.clone(),
            detail: detail.to_string(),
        };
        log::info!("{:?}: {}", event_type, detail);
        let line = match serde_json::to_string(&event) {
            Ok(l) => l,
            Err(e) => {
                log::error!("failed to serialize event: {}", e);
                return;
            }
        };
        let mut file = match self.file.lock() {
            Ok(f) => f,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(e) = writeln!(file, "{}", line) {
            log::error!("failed to append event: {}", e);
        }
    }
}
