//! # Nesting Analysis
//!
//! Every block executes inside a stack of scopes: the arms of a branch that
//! has a `Next` merge exit, and the bodies of loops. When a path runs out of
//! connected exits it continues with the innermost scope (the branch's merge
//! block or the loop's back-edge), and at top level the behavior completes.
//!
//! An arm that jumps to its branch's merge block, or to anything the merge
//! block goes on to reach, leaves the arm scope. A block reached from the
//! entry under two different scope stacks has no well-defined continuation;
//! those blocks are recorded as depth conflicts and reported by the join
//! resolver. Edges out of unreachable blocks never conflict.

use crate::graph::{BlockId, ExitSlot, Graph, Terminator};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Scope {
    /// Inside an arm of this branch block; sinks continue at its `Next` exit
    Merge(BlockId),
    /// Inside the body of this loop block; sinks return to the loop test
    Loop(BlockId),
}

/// Where control goes when it leaves a block through one exit
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Arrival {
    /// Enter the block from its first operation
    Enter(BlockId),
    /// Finish an iteration of this loop block
    BackEdge(BlockId),
    /// The behavior ran to its natural end
    Finish,
    /// An explicit return
    Return,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepthConflict {
    pub block: BlockId,
    /// Block whose edge established the first scope stack
    pub first: BlockId,
    /// Block whose edge disagreed with it
    pub second: BlockId,
    pub expected: usize,
    pub found: usize,
}

#[derive(Debug, Clone, Default)]
pub struct Nesting {
    scopes: BTreeMap<BlockId, Vec<Scope>>,
    sources: BTreeMap<BlockId, BlockId>,
    conflicts: BTreeMap<BlockId, DepthConflict>,
}

impl Nesting {
    pub fn analyze(graph: &Graph) -> Self {
        let mut nesting = Nesting::default();

        if graph.contains(graph.entry()) {
            nesting.seed(graph, graph.entry(), true);
        }
        // unreachable blocks get a top-level scope of their own
        for block in graph.block_ids() {
            if !nesting.scopes.contains_key(&block) {
                nesting.seed(graph, block, false);
            }
        }

        tracing::debug!(
            "[NESTING] {} blocks scoped, {} depth conflicts",
            nesting.scopes.len(),
            nesting.conflicts.len()
        );
        nesting
    }

    fn seed(&mut self, graph: &Graph, block: BlockId, live: bool) {
        self.scopes.insert(block, Vec::new());
        self.sources.insert(block, block);
        let mut queue = VecDeque::from([block]);

        while let Some(current) = queue.pop_front() {
            let Some(data) = graph.block(current) else {
                continue;
            };
            let scope = self.scopes.get(&current).cloned().unwrap_or_default();
            let terminator = data.terminator();

            for (slot, target) in graph.exits(current) {
                if !graph.contains(target) {
                    continue;
                }
                let mut entered = entered_scope(graph, terminator, current, slot, &scope);
                normalize(graph, target, &mut entered);

                match self.scopes.get(&target) {
                    None => {
                        self.scopes.insert(target, entered);
                        self.sources.insert(target, current);
                        queue.push_back(target);
                    }
                    Some(existing) if live && *existing != entered => {
                        let first = self.sources.get(&target).copied().unwrap_or(target);
                        let expected = existing.len();
                        self.conflicts.entry(target).or_insert(DepthConflict {
                            block: target,
                            first,
                            second: current,
                            expected,
                            found: entered.len(),
                        });
                    }
                    Some(_) => {}
                }
            }
        }
    }

    pub fn scope(&self, block: BlockId) -> &[Scope] {
        self.scopes.get(&block).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn depth(&self, block: BlockId) -> usize {
        self.scope(block).len()
    }

    pub fn conflicts(&self) -> impl Iterator<Item = &DepthConflict> {
        self.conflicts.values()
    }

    pub fn conflict(&self, block: BlockId) -> Option<&DepthConflict> {
        self.conflicts.get(&block)
    }

    /// Continuation taken when a path inside `scope` has nowhere else to go
    pub fn sink(&self, graph: &Graph, scope: &[Scope]) -> Arrival {
        match scope.split_last() {
            None => Arrival::Finish,
            Some((Scope::Merge(branch), rest)) => match graph.successor(*branch, ExitSlot::Next) {
                Some(next) => Arrival::Enter(next),
                None => self.sink(graph, rest),
            },
            Some((Scope::Loop(header), _)) => Arrival::BackEdge(*header),
        }
    }

    /// Arrival reached by leaving `block` through `slot`, connected or not
    pub fn exit_arrival(&self, graph: &Graph, block: BlockId, slot: ExitSlot) -> Arrival {
        if let Some(target) = graph.successor(block, slot) {
            return Arrival::Enter(target);
        }
        let Some(data) = graph.block(block) else {
            return Arrival::Finish;
        };
        let scope = entered_scope(graph, data.terminator(), block, slot, self.scope(block));
        self.sink(graph, &scope)
    }

    /// Every way control can leave `block` at runtime, in slot order
    pub fn flow_arrivals(&self, graph: &Graph, block: BlockId) -> Vec<(Option<ExitSlot>, Arrival)> {
        let Some(data) = graph.block(block) else {
            return Vec::new();
        };
        let slots: &[ExitSlot] = match data.terminator() {
            Terminator::Fallthrough => &[ExitSlot::Next],
            Terminator::Branch(_) => &[ExitSlot::Then, ExitSlot::Else],
            Terminator::Loop(_) => &[ExitSlot::LoopBody, ExitSlot::LoopExit],
            Terminator::Return => return vec![(None, Arrival::Return)],
        };
        slots
            .iter()
            .map(|slot| (Some(*slot), self.exit_arrival(graph, block, *slot)))
            .collect()
    }
}

fn entered_scope(
    graph: &Graph,
    terminator: Terminator<'_>,
    block: BlockId,
    slot: ExitSlot,
    scope: &[Scope],
) -> Vec<Scope> {
    let mut entered = scope.to_vec();
    match (terminator, slot) {
        (Terminator::Branch(_), ExitSlot::Then | ExitSlot::Else)
            if graph.successor(block, ExitSlot::Next).is_some() =>
        {
            entered.push(Scope::Merge(block));
        }
        (Terminator::Loop(_), ExitSlot::LoopBody) => entered.push(Scope::Loop(block)),
        _ => {}
    }
    entered
}

/// Wiring an arm into its branch's merge block, or past it into code the
/// merge block reaches, leaves the arm scope. Loop bodies are never left this way.
fn normalize(graph: &Graph, target: BlockId, scope: &mut Vec<Scope>) {
    let merged = scope.iter().enumerate().position(|(position, frame)| match frame {
        Scope::Merge(branch) => {
            let inside_loop = scope[position..].iter().any(|frame| matches!(frame, Scope::Loop(_)));
            !inside_loop
                && graph
                    .successor(*branch, ExitSlot::Next)
                    .map_or(false, |merge| reaches(graph, merge, target))
        }
        Scope::Loop(_) => false,
    });
    if let Some(position) = merged {
        scope.truncate(position);
    }
}

/// Whether `target` is `from` or lies downstream of it
fn reaches(graph: &Graph, from: BlockId, target: BlockId) -> bool {
    let mut seen = BTreeSet::from([from]);
    let mut queue = VecDeque::from([from]);
    while let Some(block) = queue.pop_front() {
        if block == target {
            return true;
        }
        for (_, next) in graph.exits(block) {
            if seen.insert(next) {
                queue.push_back(next);
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Expr, GraphBuilder, LoopKind, Operation, Statement};

    fn plain(field: &str) -> Operation {
        Operation::Plain(Statement::set(field, Expr::int(1)))
    }

    #[test]
    fn test_branch_with_merge_pushes_scope() {
        let mut builder = GraphBuilder::new("merge");
        let branch = builder.add_block([Operation::Branch(Expr::field("c"))]);
        let then_arm = builder.add_block([plain("a")]);
        let merge = builder.add_block([plain("m")]);
        builder
            .connect(branch, ExitSlot::Then, then_arm)
            .connect(branch, ExitSlot::Next, merge);
        let graph = builder.build();
        let nesting = Nesting::analyze(&graph);

        assert_eq!(nesting.scope(then_arm), &[Scope::Merge(branch)]);
        assert_eq!(nesting.depth(merge), 0);
        // the missing else arm passes straight through to the merge block
        assert_eq!(nesting.exit_arrival(&graph, branch, ExitSlot::Else), Arrival::Enter(merge));
        // the then arm's sink continues at the merge block too
        assert_eq!(nesting.exit_arrival(&graph, then_arm, ExitSlot::Next), Arrival::Enter(merge));
        assert_eq!(nesting.exit_arrival(&graph, merge, ExitSlot::Next), Arrival::Finish);
    }

    #[test]
    fn test_arm_wired_into_merge_block_is_not_a_conflict() {
        let mut builder = GraphBuilder::new("wired_merge");
        let branch = builder.add_block([Operation::Branch(Expr::field("c"))]);
        let then_arm = builder.add_block([plain("a")]);
        let merge = builder.add_block([plain("m")]);
        builder
            .connect(branch, ExitSlot::Then, then_arm)
            .connect(branch, ExitSlot::Next, merge)
            .then(then_arm, merge);
        let graph = builder.build();
        let nesting = Nesting::analyze(&graph);

        assert_eq!(nesting.conflicts().count(), 0);
        assert_eq!(nesting.depth(merge), 0);
    }

    #[test]
    fn test_arm_wired_past_merge_block_is_not_a_conflict() {
        let mut builder = GraphBuilder::new("past_merge");
        let branch = builder.add_block([Operation::Branch(Expr::field("c"))]);
        let merge = builder.add_block([plain("m")]);
        let then_arm = builder.add_block([plain("a")]);
        let tail = builder.add_block([plain("z")]);
        builder
            .connect(branch, ExitSlot::Then, then_arm)
            .connect(branch, ExitSlot::Next, merge)
            .then(then_arm, tail)
            .then(merge, tail);
        let graph = builder.build();
        let nesting = Nesting::analyze(&graph);

        assert_eq!(nesting.conflicts().count(), 0);
        assert_eq!(nesting.scope(then_arm), &[Scope::Merge(branch)]);
        assert_eq!(nesting.depth(tail), 0);
    }

    #[test]
    fn test_unreachable_block_into_loop_body_is_not_a_conflict() {
        let mut builder = GraphBuilder::new("dead_edge");
        let header = builder.add_block([Operation::Loop(LoopKind::While(Expr::field("c")))]);
        let body = builder.add_block([plain("x")]);
        let dead = builder.add_block([plain("d")]);
        builder
            .connect(header, ExitSlot::LoopBody, body)
            .then(dead, body);
        let graph = builder.build();
        let nesting = Nesting::analyze(&graph);

        assert_eq!(nesting.conflicts().count(), 0);
        assert_eq!(nesting.scope(body), &[Scope::Loop(header)]);
        assert_eq!(nesting.depth(dead), 0);
    }

    #[test]
    fn test_loop_body_sink_is_back_edge() {
        let mut builder = GraphBuilder::new("loop");
        let header = builder.add_block([Operation::Loop(LoopKind::While(Expr::field("c")))]);
        let body = builder.add_block([plain("x")]);
        builder.connect(header, ExitSlot::LoopBody, body);
        let graph = builder.build();
        let nesting = Nesting::analyze(&graph);

        assert_eq!(nesting.scope(body), &[Scope::Loop(header)]);
        assert_eq!(nesting.exit_arrival(&graph, body, ExitSlot::Next), Arrival::BackEdge(header));
        assert_eq!(
            nesting.flow_arrivals(&graph, header),
            vec![
                (Some(ExitSlot::LoopBody), Arrival::Enter(body)),
                (Some(ExitSlot::LoopExit), Arrival::Finish),
            ]
        );
    }

    #[test]
    fn test_block_reached_inside_and_outside_loop_conflicts() {
        let mut builder = GraphBuilder::new("conflict");
        let header = builder.add_block([Operation::Loop(LoopKind::While(Expr::field("c")))]);
        let body = builder.add_block([plain("x")]);
        let after = builder.add_block([plain("y")]);
        builder
            .connect(header, ExitSlot::LoopBody, body)
            .connect(header, ExitSlot::LoopExit, after)
            .then(body, after);
        let graph = builder.build();
        let nesting = Nesting::analyze(&graph);

        let conflict = nesting.conflict(after).expect("depth conflict");
        assert_eq!(conflict.first, header);
        assert_eq!(conflict.second, body);
        assert_eq!(conflict.expected, 0);
        assert_eq!(conflict.found, 1);
    }

    #[test]
    fn test_return_has_single_arrival() {
        let mut builder = GraphBuilder::new("ret");
        let block = builder.add_block([plain("x"), Operation::Return]);
        let graph = builder.build();
        let nesting = Nesting::analyze(&graph);

        assert_eq!(nesting.flow_arrivals(&graph, block), vec![(None, Arrival::Return)]);
    }
}
