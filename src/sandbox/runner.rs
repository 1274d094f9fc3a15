/// Subprocess execution of untrusted strategy code.
///
/// The runner materialises a submission into a scratch directory, spawns
/// the declared entry command in its own process group with a scrubbed
/// environment, collects bounded output, enforces the wall-clock timeout
/// with a kill of the whole group, and harvests the emitted logs. All
/// failure modes inside the boundary are reported as `SandboxOutcome`
/// variants, never as errors.
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::data::logs::LogTable;
use crate::data::market::MarketData;
use crate::sandbox::workspace::ScratchDir;
use crate::submission::Submission;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
const MARKET_FILE: &str = "market.csv";
const LOG_DIR: &str = "logs";

/// A capability the sandbox refuses, with the code patterns that reveal it.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CapabilityRule {
    pub capability: String,
    pub patterns: Vec<String>,
}

impl CapabilityRule {
    fn matches(&self, code: &str) -> Option<&str> {
        self.patterns
            .iter()
            .find(|p| code.contains(p.as_str()))
            .map(|p| p.as_str())
    }
}

fn default_capability_rules() -> Vec<CapabilityRule> {
    vec![
        CapabilityRule {
            capability: "network".to_string(),
            patterns: vec![
                "import socket".to_string(),
                "import requests".to_string(),
                "import urllib".to_string(),
                "import http.client".to_string(),
            ],
        },
        CapabilityRule {
            capability: "subprocess".to_string(),
            patterns: vec!["import subprocess".to_string(), "os.system".to_string()],
        },
        CapabilityRule {
            capability: "native".to_string(),
            patterns: vec!["import ctypes".to_string()],
        },
    ]
}

/// Resource and capability limits for one run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SandboxLimits {
    pub wall_timeout: Duration,
    pub output_limit_bytes: usize,
    #[serde(default = "default_capability_rules")]
    pub disallowed: Vec<CapabilityRule>,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            wall_timeout: Duration::from_secs(30),
            output_limit_bytes: 2 * 1024 * 1024,
            disallowed: default_capability_rules(),
        }
    }
}

/// What a successful run produced.
#[derive(Clone, Debug)]
pub struct RunArtifacts {
    pub trade_log: LogTable,
    pub audit_log: LogTable,
    pub stdout: String,
}

/// Terminal state of one sandbox run.
#[derive(Clone, Debug)]
pub enum SandboxOutcome {
    Success(RunArtifacts),
    Timeout {
        wall_ms: u64,
    },
    RuntimeFailure {
        exit_code: Option<i32>,
        signal: Option<i32>,
        message: String,
    },
    ResourceViolation {
        capability: String,
        detail: String,
    },
}

impl SandboxOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SandboxOutcome::Success(_))
    }

    /// One-line description for gate details and event logs.
    pub fn describe(&self) -> String {
        match self {
            SandboxOutcome::Success(_) => "success".to_string(),
            SandboxOutcome::Timeout { wall_ms } => {
                format!("wall-clock timeout after {}ms", wall_ms)
            }
            SandboxOutcome::RuntimeFailure {
                exit_code,
                signal,
                message,
            } => format!(
                "runtime failure (exit={:?}, signal={:?}): {}",
                exit_code, signal, message
            ),
            SandboxOutcome::ResourceViolation { capability, detail } => {
                format!("capability violation ({}): {}", capability, detail)
            }
        }
    }
}

/// The seam between the gate pipeline and the execution substrate. Gates
/// never see a scratch directory or a process handle, only outcomes.
pub trait SubmissionRunner: Send + Sync {
    fn run(&self, submission: &Submission, market: &MarketData) -> SandboxOutcome;
}

/// Real subprocess-backed runner.
pub struct SandboxRunner {
    scratch_root: PathBuf,
    limits: SandboxLimits,
    initial_capital: f64,
}

impl SandboxRunner {
    pub fn new(scratch_root: &Path, limits: SandboxLimits, initial_capital: f64) -> Self {
        Self {
            scratch_root: scratch_root.to_path_buf(),
            limits,
            initial_capital,
        }
    }

    fn scan_capabilities(&self, code: &str) -> Option<SandboxOutcome> {
        for rule in &self.limits.disallowed {
            if let Some(pattern) = rule.matches(code) {
                return Some(SandboxOutcome::ResourceViolation {
                    capability: rule.capability.clone(),
                    detail: format!("code contains disallowed pattern {:?}", pattern),
                });
            }
        }
        None
    }

    fn stage(&self, submission: &Submission, market: &MarketData) -> crate::types::Result<ScratchDir> {
        let scratch = ScratchDir::new(&self.scratch_root)?;
        scratch.write_file(
            &format!("code/{}", submission.card.entry.file),
            submission.code.as_bytes(),
        )?;
        market.write_csv(&scratch.path().join(MARKET_FILE))?;
        scratch.create_dir(LOG_DIR)?;
        Ok(scratch)
    }

    fn spawn(&self, submission: &Submission, scratch: &ScratchDir) -> std::io::Result<Child> {
        let argv = &submission.card.entry.command;
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..])
            .arg(MARKET_FILE)
            .arg(self.initial_capital.to_string())
            .current_dir(scratch.path())
            .env_clear()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }
        // Own process group so a timeout kill reaps any children too.
        std::os::unix::process::CommandExt::process_group(&mut cmd, 0);
        cmd.spawn()
    }

    fn wait_with_timeout(&self, child: &mut Child) -> std::io::Result<WaitResult> {
        let deadline = Instant::now() + self.limits.wall_timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(WaitResult::Exited(status));
            }
            if Instant::now() >= deadline {
                let pgid = Pid::from_raw(child.id() as i32);
                if let Err(e) = killpg(pgid, Signal::SIGKILL) {
                    log::warn!("killpg({}) failed: {}", pgid, e);
                }
                let _ = child.wait();
                return Ok(WaitResult::TimedOut);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn harvest(&self, scratch: &ScratchDir, stdout: String) -> SandboxOutcome {
        let log_dir = scratch.path().join(LOG_DIR);
        let trade_path = log_dir.join("trade_log.csv");
        let audit_path = log_dir.join("audit_log.csv");
        for (name, path) in [("trade_log.csv", &trade_path), ("audit_log.csv", &audit_path)] {
            if !path.exists() {
                return SandboxOutcome::RuntimeFailure {
                    exit_code: Some(0),
                    signal: None,
                    message: format!("run exited cleanly but did not emit logs/{}", name),
                };
            }
        }
        let trade_log = match LogTable::from_csv_path(&trade_path) {
            Ok(t) => t,
            Err(e) => {
                return SandboxOutcome::RuntimeFailure {
                    exit_code: Some(0),
                    signal: None,
                    message: format!("unreadable trade log: {}", e),
                }
            }
        };
        let audit_log = match LogTable::from_csv_path(&audit_path) {
            Ok(t) => t,
            Err(e) => {
                return SandboxOutcome::RuntimeFailure {
                    exit_code: Some(0),
                    signal: None,
                    message: format!("unreadable audit log: {}", e),
                }
            }
        };
        SandboxOutcome::Success(RunArtifacts {
            trade_log,
            audit_log,
            stdout,
        })
    }
}

enum WaitResult {
    Exited(std::process::ExitStatus),
    TimedOut,
}

/// Drain a pipe on its own thread so a chatty child cannot deadlock the
/// poll loop, truncating at the configured byte limit.
fn bounded_reader<R: Read + Send + 'static>(
    mut source: R,
    limit: usize,
) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut collected = Vec::new();
        let mut buf = [0u8; 8192];
        let mut truncated = false;
        loop {
            match source.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if collected.len() < limit {
                        let take = n.min(limit - collected.len());
                        collected.extend_from_slice(&buf[..take]);
                        if take < n {
                            truncated = true;
                        }
                    } else {
                        truncated = true;
                    }
                }
            }
        }
        if truncated {
            collected.extend_from_slice(b"\n[output truncated]");
        }
        collected
    })
}

impl SubmissionRunner for SandboxRunner {
    fn run(&self, submission: &Submission, market: &MarketData) -> SandboxOutcome {
        if submission.card.entry.command.is_empty() {
            return SandboxOutcome::RuntimeFailure {
                exit_code: None,
                signal: None,
                message: "entry command is empty".to_string(),
            };
        }
        if let Some(violation) = self.scan_capabilities(&submission.code) {
            return violation;
        }

        let scratch = match self.stage(submission, market) {
            Ok(s) => s,
            Err(e) => {
                return SandboxOutcome::RuntimeFailure {
                    exit_code: None,
                    signal: None,
                    message: format!("failed to stage run: {}", e),
                }
            }
        };

        let mut child = match self.spawn(submission, &scratch) {
            Ok(c) => c,
            Err(e) => {
                return SandboxOutcome::RuntimeFailure {
                    exit_code: None,
                    signal: None,
                    message: format!(
                        "failed to spawn {:?}: {}",
                        submission.card.entry.command[0], e
                    ),
                }
            }
        };

        let stdout_handle = child
            .stdout
            .take()
            .map(|s| bounded_reader(s, self.limits.output_limit_bytes));
        let stderr_handle = child
            .stderr
            .take()
            .map(|s| bounded_reader(s, self.limits.output_limit_bytes));

        let started = Instant::now();
        let waited = match self.wait_with_timeout(&mut child) {
            Ok(w) => w,
            Err(e) => {
                return SandboxOutcome::RuntimeFailure {
                    exit_code: None,
                    signal: None,
                    message: format!("wait failed: {}", e),
                }
            }
        };

        let stdout = stdout_handle
            .and_then(|h| h.join().ok())
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default();
        let stderr = stderr_handle
            .and_then(|h| h.join().ok())
            .map(|b| String::from_utf8_lossy(&b).into_owned())
            .unwrap_or_default();

        match waited {
            WaitResult::TimedOut => SandboxOutcome::Timeout {
                wall_ms: started.elapsed().as_millis() as u64,
            },
            WaitResult::Exited(status) => {
                if status.success() {
                    self.harvest(&scratch, stdout)
                } else {
                    let signal = std::os::unix::process::ExitStatusExt::signal(&status);
                    SandboxOutcome::RuntimeFailure {
                        exit_code: status.code(),
                        signal,
                        message: first_lines(&stderr, 5),
                    }
                }
            }
        }
    }
}

fn first_lines(text: &str, n: usize) -> String {
    text.lines().take(n).collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::market::testutil::synthetic_series;
    use crate::submission::{StrategyCard, Submission};

    fn shell_submission(script: &str) -> Submission {
        let card = StrategyCard::from_json_str(
            r#"{
                "strategy_id": "s",
                "entry": {"command": ["/bin/sh", "code/run.sh"], "file": "run.sh"}
            }"#,
        )
        .unwrap();
        Submission {
            model_id: "m".to_string(),
            strategy_id: "s".to_string(),
            iteration: 0,
            code: script.to_string(),
            card,
            trade_log: None,
            audit_log: None,
        }
    }

    fn runner(root: &Path, timeout_secs: u64) -> SandboxRunner {
        let limits = SandboxLimits {
            wall_timeout: Duration::from_secs(timeout_secs),
            ..SandboxLimits::default()
        };
        SandboxRunner::new(root, limits, 100_000.0)
    }

    #[test]
    fn test_successful_run_harvests_logs() {
        let root = tempfile::tempdir().unwrap();
        let script = "\
printf 'trade_id,pnl\\n1,5.0\\n' > logs/trade_log.csv\n\
printf 'datetime,close\\n2024-01-01T00:00:00,100.0\\n' > logs/audit_log.csv\n\
echo done\n";
        let sub = shell_submission(script);
        let market = synthetic_series(5);
        let outcome = runner(root.path(), 10).run(&sub, &market);
        match outcome {
            SandboxOutcome::Success(artifacts) => {
                assert_eq!(artifacts.trade_log.len(), 1);
                assert_eq!(artifacts.audit_log.headers()[0], "datetime");
                assert!(artifacts.stdout.contains("done"));
            }
            other => panic!("expected success, got {}", other.describe()),
        }
    }

    #[test]
    fn test_market_csv_and_capital_passed_as_args() {
        let root = tempfile::tempdir().unwrap();
        let script = "\
test -f \"$1\" || exit 3\n\
printf 'trade_id,pnl\\n' > logs/trade_log.csv\n\
printf 'datetime,close,capital\\n2024-01-01T00:00:00,100.0,'\"$2\"'\\n' > logs/audit_log.csv\n";
        let sub = shell_submission(script);
        let market = synthetic_series(5);
        let outcome = runner(root.path(), 10).run(&sub, &market);
        match outcome {
            SandboxOutcome::Success(artifacts) => {
                assert_eq!(artifacts.audit_log.value(0, "capital").unwrap(), "100000");
            }
            other => panic!("expected success, got {}", other.describe()),
        }
    }

    #[test]
    fn test_timeout_kills_run() {
        let root = tempfile::tempdir().unwrap();
        let sub = shell_submission("sleep 60\n");
        let market = synthetic_series(5);
        let start = Instant::now();
        let outcome = runner(root.path(), 1).run(&sub, &market);
        assert!(matches!(outcome, SandboxOutcome::Timeout { .. }));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_nonzero_exit_is_runtime_failure() {
        let root = tempfile::tempdir().unwrap();
        let sub = shell_submission("echo boom >&2\nexit 7\n");
        let market = synthetic_series(5);
        match runner(root.path(), 10).run(&sub, &market) {
            SandboxOutcome::RuntimeFailure {
                exit_code, message, ..
            } => {
                assert_eq!(exit_code, Some(7));
                assert!(message.contains("boom"));
            }
            other => panic!("expected runtime failure, got {}", other.describe()),
        }
    }

    #[test]
    fn test_missing_logs_is_runtime_failure() {
        let root = tempfile::tempdir().unwrap();
        let sub = shell_submission("true\n");
        let market = synthetic_series(5);
        match runner(root.path(), 10).run(&sub, &market) {
            SandboxOutcome::RuntimeFailure { message, .. } => {
                assert!(message.contains("did not emit"));
            }
            other => panic!("expected runtime failure, got {}", other.describe()),
        }
    }

    #[test]
    fn test_capability_scan_rejects_network() {
        let root = tempfile::tempdir().unwrap();
        let sub = shell_submission("# import socket\ncurl example.com\n");
        let market = synthetic_series(5);
        match runner(root.path(), 10).run(&sub, &market) {
            SandboxOutcome::ResourceViolation { capability, .. } => {
                assert_eq!(capability, "network");
            }
            other => panic!("expected violation, got {}", other.describe()),
        }
    }
}
