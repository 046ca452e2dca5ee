//! # Compiler and Driver Options
//!
//! Options are plain serde structs so tooling can keep them next to the
//! graph asset as JSON. Every field has a default; unknown keys are rejected.

use crate::error::ConfigError;
use crate::machine::Transition;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Options for [`compile_graph_with_options`](crate::compile_graph_with_options)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompileOptions {
    /// Accept suspending operations in blocks the entry cannot reach.
    /// Their regions are built and then dropped as dead states.
    pub allow_unreachable_suspensions: bool,
    /// Drop regions the root state can never transition into
    pub prune_dead_states: bool,
    /// Transition emitted when a path runs out of blocks
    pub natural_end: Completion,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            allow_unreachable_suspensions: false,
            prune_dead_states: true,
            natural_end: Completion::Removed,
        }
    }
}

/// How a behavior that simply runs out of blocks reports completion.
/// An explicit `Return` always reports `Removed`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Completion {
    #[default]
    Removed,
    Terminal,
}

impl Completion {
    pub fn transition<S>(self) -> Transition<S> {
        match self {
            Completion::Removed => Transition::Removed,
            Completion::Terminal => Transition::Terminal,
        }
    }
}

impl CompileOptions {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }
}

/// Options for [`Driver`](crate::runtime::Driver)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriverOptions {
    /// Upper bound on operations executed for one entity in one step
    pub max_ops_per_step: usize,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            max_ops_per_step: 4096,
        }
    }
}

impl DriverOptions {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_keeps_defaults() {
        let options = CompileOptions::from_json(r#"{ "allow_unreachable_suspensions": true }"#)
            .expect("valid options");
        assert!(options.allow_unreachable_suspensions);
        assert!(options.prune_dead_states);
        assert_eq!(options.natural_end, Completion::Removed);
    }

    #[test]
    fn test_natural_end_from_json() {
        let options = CompileOptions::from_json(r#"{ "natural_end": "terminal" }"#).expect("valid options");
        assert_eq!(options.natural_end, Completion::Terminal);
        assert_eq!(options.natural_end.transition::<u32>(), Transition::Terminal);
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let result = DriverOptions::from_json(r#"{ "max_ops": 10 }"#);
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_driver_options_from_json() {
        let options = DriverOptions::from_json(r#"{ "max_ops_per_step": 12 }"#).expect("valid options");
        assert_eq!(options.max_ops_per_step, 12);
        assert_eq!(DriverOptions::default().max_ops_per_step, 4096);
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let result = CompileOptions::from_file("/nonexistent/pbcc-options.json");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
