//! Market data and emitted log tables
//!
//! Read-only OHLCV input shared by all workers, and the generic tabular
//! form of trade/audit logs the gates compare.

pub mod logs;
pub mod market;
