//! # Suspension Analysis
//!
//! Tags every block that requires a continuation: the block suspends itself,
//! or one of its connected exits leads into code where every forward path
//! reaches a suspending block before running out of successors. Missing exits
//! are ignored, so a branch without an `Else` side is judged by its other
//! exits alone.
//!
//! Both the tags and the looser "some path may suspend" set used to place
//! loop-header states are least fixed points over the exit graph, seeded from
//! the blocks that suspend directly. Loops and diamonds settle in at most one
//! pass per block.

use super::nesting::{Arrival, Nesting};
use crate::error::CompileError;
use crate::graph::{BlockId, Graph};
use std::collections::{BTreeMap, BTreeSet};

/// Per-block "requires continuation" tags
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuspensionTags {
    tags: BTreeMap<BlockId, bool>,
    may_suspend: BTreeSet<BlockId>,
    iterations: usize,
}

impl SuspensionTags {
    pub fn requires_continuation(&self, block: BlockId) -> bool {
        self.tags.get(&block).copied().unwrap_or(false)
    }

    /// Whether some forward path from the block reaches a suspending block
    pub(crate) fn may_suspend(&self, block: BlockId) -> bool {
        self.may_suspend.contains(&block)
    }

    /// Passes the fixed point needed, including the final stable pass
    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn tagged(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.tags
            .iter()
            .filter(|(_, tagged)| **tagged)
            .map(|(block, _)| *block)
    }
}

/// Grow `set` until every block that `admit` accepts is in it
fn fixed_point(
    graph: &Graph,
    set: &mut BTreeSet<BlockId>,
    admit: impl Fn(BlockId, &BTreeSet<BlockId>) -> bool,
) -> usize {
    let mut iterations = 0;
    loop {
        iterations += 1;
        let mut changed = false;
        for block in graph.block_ids() {
            if !set.contains(&block) && admit(block, set) {
                set.insert(block);
                changed = true;
            }
        }
        if !changed {
            return iterations;
        }
    }
}

/// Compute suspension tags for every block in the graph
pub fn analyze(graph: &Graph) -> SuspensionTags {
    let direct: BTreeSet<BlockId> = graph
        .blocks()
        .filter(|(_, block)| block.contains_suspension())
        .map(|(id, _)| id)
        .collect();

    // every forward path from the block reaches a suspending block
    let mut must = direct.clone();
    let iterations = fixed_point(graph, &mut must, |block, must| {
        let mut exits = graph.exits(block).peekable();
        exits.peek().is_some() && exits.all(|(_, target)| must.contains(&target))
    });
    debug_assert!(iterations <= graph.len() + 1);

    let mut may_suspend = direct.clone();
    fixed_point(graph, &mut may_suspend, |block, may| {
        graph.exits(block).any(|(_, target)| may.contains(&target))
    });

    let tags: BTreeMap<BlockId, bool> = graph
        .block_ids()
        .map(|block| {
            let tagged = direct.contains(&block) || graph.exits(block).any(|(_, target)| must.contains(&target));
            (block, tagged)
        })
        .collect();

    tracing::debug!(
        "[SUSPENSION] {} of {} blocks require a continuation, {} may suspend ({} passes)",
        tags.values().filter(|tagged| **tagged).count(),
        tags.len(),
        may_suspend.len(),
        iterations
    );

    SuspensionTags {
        tags,
        may_suspend,
        iterations,
    }
}

/// Reject suspending operations the entry can never reach
pub fn check_reachability(graph: &Graph, reachable: &BTreeSet<BlockId>) -> Result<(), CompileError> {
    for (id, block) in graph.blocks() {
        if reachable.contains(&id) {
            continue;
        }
        if let Some(index) = block.suspension_points().next() {
            return Err(CompileError::UnreachableSuspendingOperation { block: id, index });
        }
    }
    Ok(())
}

/// Reject suspending operations on cycles from which the behavior can never
/// finish or return. Same-frame cycles without suspension are left alone.
pub fn check_progress(
    graph: &Graph,
    nesting: &Nesting,
    reachable: &BTreeSet<BlockId>,
) -> Result<(), CompileError> {
    let successors: BTreeMap<BlockId, Vec<Arrival>> = graph
        .block_ids()
        .map(|block| {
            let arrivals = nesting
                .flow_arrivals(graph, block)
                .into_iter()
                .map(|(_, arrival)| arrival)
                .collect();
            (block, arrivals)
        })
        .collect();

    // least fixed point: a block can finish if any way out of it can
    let mut can_finish: BTreeSet<BlockId> = BTreeSet::new();
    loop {
        let mut changed = false;
        for (block, arrivals) in &successors {
            if can_finish.contains(block) {
                continue;
            }
            let finishes = arrivals.iter().any(|arrival| match arrival {
                Arrival::Finish | Arrival::Return => true,
                Arrival::Enter(next) | Arrival::BackEdge(next) => can_finish.contains(next),
            });
            if finishes {
                can_finish.insert(*block);
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    for (id, block) in graph.blocks() {
        if !reachable.contains(&id) || can_finish.contains(&id) {
            continue;
        }
        let Some(index) = block.suspension_points().next() else {
            continue;
        };
        if on_cycle(id, &successors) {
            return Err(CompileError::CyclicSuspensionWithoutProgress { block: id, index });
        }
    }

    Ok(())
}

fn on_cycle(start: BlockId, successors: &BTreeMap<BlockId, Vec<Arrival>>) -> bool {
    let mut seen = BTreeSet::new();
    let mut stack = vec![start];
    while let Some(block) = stack.pop() {
        for arrival in successors.get(&block).into_iter().flatten() {
            let next = match arrival {
                Arrival::Enter(next) | Arrival::BackEdge(next) => *next,
                Arrival::Finish | Arrival::Return => continue,
            };
            if next == start {
                return true;
            }
            if seen.insert(next) {
                stack.push(next);
            }
        }
    }
    false
}
