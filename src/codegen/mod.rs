//! # Behavior Code Generation
//!
//! Rust code generation for compiled behavior state machines.

mod rust_codegen;

pub use rust_codegen::*;
