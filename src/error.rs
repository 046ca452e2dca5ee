//! # Error Types
//!
//! Structured errors for compilation and execution. Compile errors carry the
//! offending block ids so the editor can highlight them; formatting for
//! humans is left to the caller.

use crate::graph::{BlockId, ExitSlot};
use crate::machine::StateId;
use crate::runtime::EntityId;
use thiserror::Error;

/// Result type for compilation
pub type CompileResult<T> = std::result::Result<T, CompileError>;

/// Structural compile errors. Generation is aborted on any of these.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    #[error("Graph has no blocks")]
    EmptyGraph,

    #[error("Entry block {0} does not exist")]
    MissingEntry(BlockId),

    #[error("Edge {from}.{slot} targets nonexistent block {to}")]
    DanglingEdge {
        from: BlockId,
        slot: ExitSlot,
        to: BlockId,
    },

    #[error("Block {block} has more than one edge on exit '{slot}'")]
    DuplicateExit { block: BlockId, slot: ExitSlot },

    #[error("Exit '{slot}' is not valid for the terminator of block {block}")]
    InvalidExit { block: BlockId, slot: ExitSlot },

    #[error("Control operation {block}[{index}] must be the last operation of its block")]
    MisplacedControl { block: BlockId, index: usize },

    #[error(
        "Join at {block} is reached at nesting depth {expected} from {first} and at depth {found} from {second}"
    )]
    JoinDepthMismatch {
        block: BlockId,
        first: BlockId,
        second: BlockId,
        expected: usize,
        found: usize,
    },

    #[error("Suspending operation {block}[{index}] is unreachable from the entry block")]
    UnreachableSuspendingOperation { block: BlockId, index: usize },

    #[error("Suspending operation {block}[{index}] sits on a cycle that never completes")]
    CyclicSuspensionWithoutProgress { block: BlockId, index: usize },

    #[error("Internal compiler error: {0}")]
    Internal(String),
}

impl CompileError {
    /// Blocks the editor should highlight for this error
    pub fn blocks(&self) -> Vec<BlockId> {
        match self {
            CompileError::EmptyGraph | CompileError::Internal(_) => Vec::new(),
            CompileError::MissingEntry(block) => vec![*block],
            CompileError::DanglingEdge { from, .. } => vec![*from],
            CompileError::DuplicateExit { block, .. }
            | CompileError::InvalidExit { block, .. }
            | CompileError::MisplacedControl { block, .. }
            | CompileError::UnreachableSuspendingOperation { block, .. }
            | CompileError::CyclicSuspensionWithoutProgress { block, .. } => vec![*block],
            CompileError::JoinDepthMismatch {
                block,
                first,
                second,
                ..
            } => vec![*block, *first, *second],
        }
    }
}

/// Runtime contract violations raised by the execution driver
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionError {
    #[error("Entity {entity} holds state {state} which does not exist in behavior '{behavior}'")]
    StateMismatch {
        entity: EntityId,
        state: StateId,
        behavior: String,
    },

    #[error("Entity {entity} was already stepped in frame {frame}")]
    AlreadyStepped { entity: EntityId, frame: u64 },

    #[error("Entity {entity} has no field '{field}'")]
    MissingField { entity: EntityId, field: String },

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Unknown host function '{0}'")]
    UnknownFunction(String),

    #[error("Entity {entity} exceeded the budget of {budget} operations in one step")]
    BudgetExceeded { entity: EntityId, budget: usize },

    #[error("State {state} has a malformed operation tree: {reason}")]
    MalformedRegion { state: StateId, reason: String },
}

/// Errors raised while loading options
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    Parse(#[from] serde_json::Error),
}
