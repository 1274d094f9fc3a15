//! Configuration and frozen specifications
//!
//! Experiment/model configuration, frozen strategy specs, and the explicit
//! schema descriptors the Schema gate validates against.

pub mod experiment;
pub mod schema;
pub mod spec;
