//! # Behavior Graph Model
//!
//! In-memory representation of a behavior graph: an immutable arena of
//! blocks indexed by [`BlockId`], plus an adjacency table mapping
//! `(BlockId, ExitSlot)` to the block that exit leads to.
//!
//! A block is a straight-line list of [`Operation`]s. Control operations
//! (`Branch`, `Loop`, `Return`) may only appear last and decide which exit
//! slots the block is allowed to use.

use crate::error::CompileError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;

/// Index of a block in the graph arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(pub u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

/// Typed exit of a block
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ExitSlot {
    /// Sequential continuation. On a branch block this is the merge point of both arms.
    Next,
    Then,
    Else,
    LoopBody,
    LoopExit,
}

impl ExitSlot {
    pub const ALL: [ExitSlot; 5] = [
        ExitSlot::Next,
        ExitSlot::Then,
        ExitSlot::Else,
        ExitSlot::LoopBody,
        ExitSlot::LoopExit,
    ];
}

impl fmt::Display for ExitSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExitSlot::Next => "next",
            ExitSlot::Then => "then",
            ExitSlot::Else => "else",
            ExitSlot::LoopBody => "loop_body",
            ExitSlot::LoopExit => "loop_exit",
        };
        f.write_str(name)
    }
}

/// Runtime value stored in entity fields
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Bool(_) => "bool",
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(v) => write!(f, "{}", v),
            Value::Float(v) => write!(f, "{:?}", v),
            Value::Bool(v) => write!(f, "{}", v),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Value::Float(value)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }
}

/// Expression evaluated against a single entity's fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Expr {
    Const(Value),
    Field(String),
    Not(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
}

impl Expr {
    pub fn int(value: i64) -> Self {
        Expr::Const(Value::Int(value))
    }

    pub fn bool(value: bool) -> Self {
        Expr::Const(Value::Bool(value))
    }

    pub fn field(name: impl Into<String>) -> Self {
        Expr::Field(name.into())
    }

    pub fn not(inner: Expr) -> Self {
        Expr::Not(Box::new(inner))
    }

    pub fn binary(op: BinaryOp, lhs: Expr, rhs: Expr) -> Self {
        Expr::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn add(lhs: Expr, rhs: Expr) -> Self {
        Expr::binary(BinaryOp::Add, lhs, rhs)
    }

    pub fn eq(lhs: Expr, rhs: Expr) -> Self {
        Expr::binary(BinaryOp::Eq, lhs, rhs)
    }

    pub fn lt(lhs: Expr, rhs: Expr) -> Self {
        Expr::binary(BinaryOp::Lt, lhs, rhs)
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Expr::Const(value) => write!(f, "{}", value),
            Expr::Field(name) => write!(f, "${}", name),
            Expr::Not(inner) => write!(f, "!({})", inner),
            Expr::Binary { op, lhs, rhs } => write!(f, "({} {} {})", lhs, op.symbol(), rhs),
        }
    }
}

/// Plain statement executed for its side effect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Statement {
    /// Write a value into an entity field
    Set { field: String, value: Expr },
    /// Call a host function with evaluated arguments
    Invoke { function: String, args: Vec<Expr> },
}

impl Statement {
    pub fn set(field: impl Into<String>, value: Expr) -> Self {
        Statement::Set {
            field: field.into(),
            value,
        }
    }

    pub fn invoke(function: impl Into<String>, args: Vec<Expr>) -> Self {
        Statement::Invoke {
            function: function.into(),
            args,
        }
    }
}

/// Resumption condition of a suspending operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ResumeCheck {
    /// Resume once this many frames have passed (at least one)
    Frames(u32),
    /// Resume on the first frame the predicate holds
    Until(Expr),
    /// Resume when the host progress function reports completion
    Progress(String),
}

/// Supported loop shapes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LoopKind {
    /// Repeat the body while the condition holds
    While(Expr),
    /// Run the body for `index` in `0..count`; the index lives in an entity field
    ForEach { index: String, count: Expr },
}

impl LoopKind {
    /// Condition tested before every iteration
    pub fn condition(&self) -> Expr {
        match self {
            LoopKind::While(cond) => cond.clone(),
            LoopKind::ForEach { index, count } => Expr::lt(Expr::field(index.clone()), count.clone()),
        }
    }

    /// Statement run when the loop is entered from outside
    pub fn init(&self) -> Option<Statement> {
        match self {
            LoopKind::While(_) => None,
            LoopKind::ForEach { index, .. } => Some(Statement::set(index.clone(), Expr::int(0))),
        }
    }

    /// Statement run when the body finishes an iteration
    pub fn latch(&self) -> Option<Statement> {
        match self {
            LoopKind::While(_) => None,
            LoopKind::ForEach { index, .. } => Some(Statement::set(
                index.clone(),
                Expr::add(Expr::field(index.clone()), Expr::int(1)),
            )),
        }
    }
}

/// Atomic unit of work inside a block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    Plain(Statement),
    Suspend(ResumeCheck),
    Branch(Expr),
    Loop(LoopKind),
    Return,
}

impl Operation {
    pub fn is_suspending(&self) -> bool {
        matches!(self, Operation::Suspend(_))
    }

    pub fn is_control(&self) -> bool {
        matches!(self, Operation::Branch(_) | Operation::Loop(_) | Operation::Return)
    }
}

/// How control leaves a block
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Terminator<'a> {
    Fallthrough,
    Branch(&'a Expr),
    Loop(&'a LoopKind),
    Return,
}

impl Terminator<'_> {
    pub fn allowed_exits(&self) -> &'static [ExitSlot] {
        match self {
            Terminator::Fallthrough => &[ExitSlot::Next],
            Terminator::Branch(_) => &[ExitSlot::Then, ExitSlot::Else, ExitSlot::Next],
            Terminator::Loop(_) => &[ExitSlot::LoopBody, ExitSlot::LoopExit],
            Terminator::Return => &[],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Block {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub operations: Vec<Operation>,
}

impl Block {
    pub fn new(operations: Vec<Operation>) -> Self {
        Self { label: None, operations }
    }

    pub fn terminator(&self) -> Terminator<'_> {
        match self.operations.last() {
            Some(Operation::Branch(cond)) => Terminator::Branch(cond),
            Some(Operation::Loop(kind)) => Terminator::Loop(kind),
            Some(Operation::Return) => Terminator::Return,
            _ => Terminator::Fallthrough,
        }
    }

    /// Indices of the suspending operations in this block
    pub fn suspension_points(&self) -> impl Iterator<Item = usize> + '_ {
        self.operations
            .iter()
            .enumerate()
            .filter(|(_, op)| op.is_suspending())
            .map(|(index, _)| index)
    }

    pub fn contains_suspension(&self) -> bool {
        self.operations.iter().any(Operation::is_suspending)
    }

    pub fn loop_kind(&self) -> Option<&LoopKind> {
        match self.terminator() {
            Terminator::Loop(kind) => Some(kind),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub from: BlockId,
    pub slot: ExitSlot,
    pub to: BlockId,
}

/// Serialized form of a graph, as handed over by the editor
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GraphAsset {
    name: String,
    entry: BlockId,
    blocks: Vec<Block>,
    #[serde(default)]
    edges: Vec<Edge>,
}

impl From<GraphAsset> for Graph {
    fn from(asset: GraphAsset) -> Self {
        Graph::new(asset.name, asset.entry, asset.blocks, asset.edges)
    }
}

impl From<Graph> for GraphAsset {
    fn from(graph: Graph) -> Self {
        GraphAsset {
            name: graph.name,
            entry: graph.entry,
            blocks: graph.blocks,
            edges: graph.edges,
        }
    }
}

/// Immutable behavior graph
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "GraphAsset", into = "GraphAsset")]
pub struct Graph {
    name: String,
    entry: BlockId,
    blocks: Vec<Block>,
    edges: Vec<Edge>,
    adjacency: BTreeMap<(BlockId, ExitSlot), BlockId>,
}

impl Graph {
    /// Build a graph without validating it; see [`Graph::validate`].
    pub fn new(name: impl Into<String>, entry: BlockId, blocks: Vec<Block>, edges: Vec<Edge>) -> Self {
        let mut adjacency = BTreeMap::new();
        for edge in &edges {
            adjacency.entry((edge.from, edge.slot)).or_insert(edge.to);
        }
        Self {
            name: name.into(),
            entry,
            blocks,
            edges,
            adjacency,
        }
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self) -> BlockId {
        self.entry
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(id.index())
    }

    pub fn contains(&self, id: BlockId) -> bool {
        id.index() < self.blocks.len()
    }

    /// Iterate blocks in id order
    pub fn blocks(&self) -> impl Iterator<Item = (BlockId, &Block)> {
        self.blocks
            .iter()
            .enumerate()
            .map(|(index, block)| (BlockId(index as u32), block))
    }

    pub fn block_ids(&self) -> impl Iterator<Item = BlockId> {
        (0..self.blocks.len() as u32).map(BlockId)
    }

    pub fn successor(&self, block: BlockId, slot: ExitSlot) -> Option<BlockId> {
        self.adjacency.get(&(block, slot)).copied()
    }

    /// Connected exits of a block in slot order
    pub fn exits(&self, block: BlockId) -> impl Iterator<Item = (ExitSlot, BlockId)> + '_ {
        ExitSlot::ALL
            .into_iter()
            .filter_map(move |slot| self.successor(block, slot).map(|to| (slot, to)))
    }

    /// Blocks reachable from the entry along any edge
    pub fn reachable(&self) -> BTreeSet<BlockId> {
        let mut seen = BTreeSet::new();
        if !self.contains(self.entry) {
            return seen;
        }
        let mut queue = VecDeque::from([self.entry]);
        seen.insert(self.entry);
        while let Some(block) = queue.pop_front() {
            for (_, next) in self.exits(block) {
                if self.contains(next) && seen.insert(next) {
                    queue.push_back(next);
                }
            }
        }
        seen
    }

    /// Check the structural rules every compilation relies on
    pub fn validate(&self) -> Result<(), CompileError> {
        if self.blocks.is_empty() {
            return Err(CompileError::EmptyGraph);
        }
        if !self.contains(self.entry) {
            return Err(CompileError::MissingEntry(self.entry));
        }

        for (id, block) in self.blocks() {
            let last = block.operations.len().saturating_sub(1);
            for (index, op) in block.operations.iter().enumerate() {
                if op.is_control() && index != last {
                    return Err(CompileError::MisplacedControl { block: id, index });
                }
            }
        }

        let mut seen = BTreeSet::new();
        for edge in &self.edges {
            if !self.contains(edge.from) || !self.contains(edge.to) {
                return Err(CompileError::DanglingEdge {
                    from: edge.from,
                    slot: edge.slot,
                    to: edge.to,
                });
            }
            if !seen.insert((edge.from, edge.slot)) {
                return Err(CompileError::DuplicateExit {
                    block: edge.from,
                    slot: edge.slot,
                });
            }
            let allowed = self.blocks[edge.from.index()].terminator().allowed_exits();
            if !allowed.contains(&edge.slot) {
                return Err(CompileError::InvalidExit {
                    block: edge.from,
                    slot: edge.slot,
                });
            }
        }

        Ok(())
    }
}

/// Incremental construction of a [`Graph`]
#[derive(Debug, Clone, Default)]
pub struct GraphBuilder {
    name: String,
    entry: Option<BlockId>,
    blocks: Vec<Block>,
    edges: Vec<Edge>,
}

impl GraphBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn add_block(&mut self, operations: impl IntoIterator<Item = Operation>) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block::new(operations.into_iter().collect()));
        id
    }

    pub fn add_labeled_block(
        &mut self,
        label: impl Into<String>,
        operations: impl IntoIterator<Item = Operation>,
    ) -> BlockId {
        let id = self.add_block(operations);
        self.blocks[id.index()].label = Some(label.into());
        id
    }

    pub fn connect(&mut self, from: BlockId, slot: ExitSlot, to: BlockId) -> &mut Self {
        self.edges.push(Edge { from, slot, to });
        self
    }

    /// Shorthand for a `Next` edge
    pub fn then(&mut self, from: BlockId, to: BlockId) -> &mut Self {
        self.connect(from, ExitSlot::Next, to)
    }

    pub fn entry(&mut self, block: BlockId) -> &mut Self {
        self.entry = Some(block);
        self
    }

    /// Finish the graph. The entry defaults to the first block added.
    pub fn build(self) -> Graph {
        Graph::new(self.name, self.entry.unwrap_or(BlockId(0)), self.blocks, self.edges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(field: &str, value: i64) -> Operation {
        Operation::Plain(Statement::set(field, Expr::int(value)))
    }

    #[test]
    fn test_builder_assigns_dense_ids() {
        let mut builder = GraphBuilder::new("dense");
        let a = builder.add_block([set("a", 1)]);
        let b = builder.add_block([set("b", 2)]);
        builder.then(a, b);
        let graph = builder.build();

        assert_eq!(a, BlockId(0));
        assert_eq!(b, BlockId(1));
        assert_eq!(graph.entry(), a);
        assert_eq!(graph.successor(a, ExitSlot::Next), Some(b));
        assert_eq!(graph.successor(b, ExitSlot::Next), None);
        assert!(graph.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_dangling_edge() {
        let mut builder = GraphBuilder::new("dangling");
        let a = builder.add_block([set("a", 1)]);
        builder.then(a, BlockId(7));
        let graph = builder.build();

        assert_eq!(
            graph.validate(),
            Err(CompileError::DanglingEdge {
                from: a,
                slot: ExitSlot::Next,
                to: BlockId(7)
            })
        );
    }

    #[test]
    fn test_validate_rejects_duplicate_exit() {
        let mut builder = GraphBuilder::new("duplicate");
        let a = builder.add_block([set("a", 1)]);
        let b = builder.add_block([]);
        let c = builder.add_block([]);
        builder.then(a, b).then(a, c);
        let graph = builder.build();

        assert_eq!(
            graph.validate(),
            Err(CompileError::DuplicateExit {
                block: a,
                slot: ExitSlot::Next
            })
        );
        // the first edge wins in the adjacency table
        assert_eq!(graph.successor(a, ExitSlot::Next), Some(b));
    }

    #[test]
    fn test_validate_rejects_misplaced_control() {
        let mut builder = GraphBuilder::new("misplaced");
        builder.add_block([Operation::Return, set("a", 1)]);
        let graph = builder.build();

        assert_eq!(
            graph.validate(),
            Err(CompileError::MisplacedControl {
                block: BlockId(0),
                index: 0
            })
        );
    }

    #[test]
    fn test_validate_rejects_exit_not_allowed_by_terminator() {
        let mut builder = GraphBuilder::new("invalid_exit");
        let a = builder.add_block([set("a", 1)]);
        let b = builder.add_block([]);
        builder.connect(a, ExitSlot::Then, b);
        let graph = builder.build();

        assert_eq!(
            graph.validate(),
            Err(CompileError::InvalidExit {
                block: a,
                slot: ExitSlot::Then
            })
        );
    }

    #[test]
    fn test_validate_rejects_missing_entry_and_empty_graph() {
        let empty = GraphBuilder::new("empty").build();
        assert_eq!(empty.validate(), Err(CompileError::EmptyGraph));

        let mut builder = GraphBuilder::new("no_entry");
        builder.add_block([]);
        builder.entry(BlockId(3));
        assert_eq!(builder.build().validate(), Err(CompileError::MissingEntry(BlockId(3))));
    }

    #[test]
    fn test_reachable_ignores_disconnected_blocks() {
        let mut builder = GraphBuilder::new("reach");
        let a = builder.add_block([Operation::Branch(Expr::bool(true))]);
        let b = builder.add_block([]);
        let orphan = builder.add_block([]);
        builder.connect(a, ExitSlot::Then, b);
        let graph = builder.build();

        let reachable = graph.reachable();
        assert!(reachable.contains(&a));
        assert!(reachable.contains(&b));
        assert!(!reachable.contains(&orphan));
    }

    #[test]
    fn test_graph_json_round_trip_rebuilds_adjacency() {
        let mut builder = GraphBuilder::new("json");
        let a = builder.add_labeled_block("start", [Operation::Suspend(ResumeCheck::Frames(2))]);
        let b = builder.add_block([set("done", 1)]);
        builder.then(a, b);
        let graph = builder.build();

        let json = graph.to_json().expect("serialize");
        let parsed = Graph::from_json(&json).expect("deserialize");

        assert_eq!(parsed.name(), "json");
        assert_eq!(parsed.successor(a, ExitSlot::Next), Some(b));
        assert_eq!(parsed.block(a).and_then(|block| block.label.clone()), Some("start".to_string()));
    }

    #[test]
    fn test_for_each_loop_statements() {
        let kind = LoopKind::ForEach {
            index: "i".to_string(),
            count: Expr::int(3),
        };
        assert_eq!(kind.condition(), Expr::lt(Expr::field("i"), Expr::int(3)));
        assert_eq!(kind.init(), Some(Statement::set("i", Expr::int(0))));
        assert!(kind.latch().is_some());
        assert_eq!(LoopKind::While(Expr::bool(true)).init(), None);
    }
}
