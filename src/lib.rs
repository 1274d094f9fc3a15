//! Benchmark harness for machine-generated trading strategies.
//!
//! Submissions are gated through a fixed six-stage validity pipeline
//! (parse, schema, exec, determ, anti_leak, audit), executed inside a
//! process sandbox, checked for semantic drift across iterations, scored
//! on four dimensions, and fed back evidence bundles until convergence.
//! A separate arena pass folds peer reviews into rankings and a
//! best-model-per-vendor shortlist.
//!
//! Module map:
//! - [`types`]: error taxonomy and numeric tolerance
//! - [`config`]: experiment, roster and frozen strategy specs
//! - [`data`]: market series and tabular log handling
//! - [`submission`]: strategy cards and submission loading
//! - [`sandbox`]: scratch workspaces and subprocess execution
//! - [`gates`]: the validity pipeline and indicator recomputation
//! - [`drift`]: fingerprint-based drift detection
//! - [`scorecard`]: dimension derivation
//! - [`iteration`]: evidence bundles, the iteration ladder, batch workers
//! - [`arena`]: cross-review aggregation and shortlist selection
//! - [`observability`]: JSONL event log
//! - [`cli`]: command-line entry points

pub mod arena;
pub mod cli;
pub mod config;
pub mod data;
pub mod drift;
pub mod gates;
pub mod iteration;
pub mod observability;
pub mod sandbox;
pub mod scorecard;
pub mod submission;
pub mod types;
