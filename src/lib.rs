//! # Pulsar Behavior Coroutine Compiler (PBCC)
//!
//! Compiles Pulsar behavior graphs (blocks of operations wired together by
//! branch, loop and fallthrough edges) into per-entity state machines.
//! Behaviors may suspend: wait a number of frames, wait for a condition, or
//! wait for a long-running host action. Every suspension becomes a resume
//! point, so an entity's whole progress fits in a small
//! [`ExecutionRecord`](runtime::ExecutionRecord) that is advanced at most once
//! per frame.
//!
//! ## Quick Start
//!
//! ```rust
//! use pbcc::compile_graph;
//! use pbcc::graph::{Expr, GraphBuilder, Operation, ResumeCheck, Statement};
//! use pbcc::runtime::{Driver, EntityId, ExecutionRecord, MemoryWorld};
//!
//! let mut builder = GraphBuilder::new("door");
//! builder.add_block([
//!     Operation::Suspend(ResumeCheck::Until(Expr::field("unlocked"))),
//!     Operation::Plain(Statement::set("open", Expr::bool(true))),
//! ]);
//! let machine = compile_graph(&builder.build())?;
//!
//! let driver = Driver::new(&machine);
//! let mut world = MemoryWorld::new();
//! let door = EntityId(1);
//! world.set(door, "unlocked", false);
//!
//! let mut record = ExecutionRecord::new();
//! driver.step(door, 1, &mut record, &mut world)?;
//! world.set(door, "unlocked", true);
//! driver.step(door, 2, &mut record, &mut world)?;
//! assert_eq!(world.get(door, "open"), Some(true.into()));
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! ## Architecture
//!
//! PBCC follows a multi-phase compilation pipeline:
//!
//! 1. **Validation** - Reject malformed edges and misplaced control operations
//! 2. **Nesting Analysis** - Scope stack of every block (branch merges, loop bodies)
//! 3. **Suspension Analysis** - Tag blocks that require a continuation
//! 4. **Region Partitioning** - Cut the graph into continuation regions at suspensions
//! 5. **Join Resolution** - Give cold and warm arrivals at a join one shared state
//! 6. **State Machine Synthesis** - Number states densely and deterministically
//!
//! The result runs on the [`runtime::Driver`] or is turned into Rust source by
//! [`codegen::RustCodeGenerator`].

pub mod analysis;
pub mod codegen;
pub mod compiler;
pub mod config;
pub mod error;
pub mod graph;
pub mod join;
pub mod machine;
pub mod partition;
pub mod runtime;

// Re-export the main compilation API
pub use compiler::{
    compile_graph,
    compile_graph_detailed,
    compile_graph_to_rust,
    compile_graph_with_options,
    Compilation,
};

pub use config::{CompileOptions, Completion, DriverOptions};
pub use error::{CompileError, CompileResult, ConfigError, ExecutionError};
pub use graph::{BlockId, Graph, GraphBuilder};
pub use machine::{CompiledStateMachine, StateId, Transition};
