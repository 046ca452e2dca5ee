//! # Graph Analysis
//!
//! Read-only passes over a validated graph: scope nesting and suspension tags.

pub mod nesting;
pub mod suspension;

pub use nesting::{Arrival, DepthConflict, Nesting, Scope};
pub use suspension::{analyze, check_progress, check_reachability, SuspensionTags};
