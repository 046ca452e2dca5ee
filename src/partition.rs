//! # Region Partitioner
//!
//! Blocks are split into segments at every suspending operation. Segments
//! are grouped into continuation regions: maximal code that runs without
//! suspending, entered at exactly one point. A region starts
//!
//! - at the synthetic root (the behavior's first activation),
//! - right at a suspending operation (a resume point),
//! - at the test of a loop whose body suspends,
//! - at a join reached from more than one region, or at the head of a
//!   same-frame cycle.
//!
//! Each region is emitted as a structured [`RegionOp`] tree. Branch arms
//! rejoin at their immediate post-dominator inside the region; control that
//! leaves the region becomes an `Exit` transition.

use crate::analysis::{Arrival, Nesting, SuspensionTags};
use crate::config::CompileOptions;
use crate::graph::{BlockId, ExitSlot, Graph, Operation, Terminator};
use crate::join::{self, Ownership};
use crate::machine::{RegionOp, Transition};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Run of operations inside one block, from `start` up to the next
/// suspending operation or the end of the block
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentId {
    pub block: BlockId,
    pub start: usize,
}

impl SegmentId {
    pub fn entry(block: BlockId) -> Self {
        Self { block, start: 0 }
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.block, self.start)
    }
}

/// Identity of a continuation region before states are numbered
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RegionKey {
    Root,
    Segment(SegmentId),
}

impl RegionKey {
    pub fn segment(self) -> Option<SegmentId> {
        match self {
            RegionKey::Root => None,
            RegionKey::Segment(segment) => Some(segment),
        }
    }
}

impl fmt::Display for RegionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegionKey::Root => f.write_str("root"),
            RegionKey::Segment(segment) => segment.fmt(f),
        }
    }
}

/// Why a region starts where it does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryKind {
    Root,
    /// Resumes a suspending operation on a later frame
    Resume,
    /// Continuation shared by several regions, entered in the same frame
    Join,
    /// Test of a loop whose body suspends
    LoopHeader,
}

/// How control moves from one segment to the next
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Via {
    Edge,
    Suspension,
    BackEdge,
}

/// Segment-level view of the graph shared by the partitioner and the join
/// resolver
pub(crate) struct SegmentFlow<'g> {
    graph: &'g Graph,
    nesting: &'g Nesting,
    splits: BTreeMap<BlockId, Vec<usize>>,
}

impl<'g> SegmentFlow<'g> {
    pub(crate) fn new(graph: &'g Graph, nesting: &'g Nesting) -> Self {
        let splits = graph
            .blocks()
            .map(|(id, block)| {
                let mut starts = vec![0];
                starts.extend(block.suspension_points().filter(|index| *index != 0));
                (id, starts)
            })
            .collect();
        Self {
            graph,
            nesting,
            splits,
        }
    }

    pub(crate) fn graph(&self) -> &'g Graph {
        self.graph
    }

    pub(crate) fn segments(&self) -> impl Iterator<Item = SegmentId> + '_ {
        self.splits
            .iter()
            .flat_map(|(block, starts)| starts.iter().map(|start| SegmentId { block: *block, start: *start }))
    }

    pub(crate) fn next_segment(&self, segment: SegmentId) -> Option<SegmentId> {
        self.splits
            .get(&segment.block)?
            .iter()
            .find(|start| **start > segment.start)
            .map(|start| SegmentId {
                block: segment.block,
                start: *start,
            })
    }

    /// One past the last operation of the segment
    pub(crate) fn end(&self, segment: SegmentId) -> usize {
        match self.next_segment(segment) {
            Some(next) => next.start,
            None => self
                .graph
                .block(segment.block)
                .map(|block| block.operations.len())
                .unwrap_or(segment.start),
        }
    }

    /// Segment holding the block's terminator
    pub(crate) fn last_segment(&self, block: BlockId) -> SegmentId {
        let start = self
            .splits
            .get(&block)
            .and_then(|starts| starts.last().copied())
            .unwrap_or(0);
        SegmentId { block, start }
    }

    pub(crate) fn is_suspension(&self, segment: SegmentId) -> bool {
        self.graph
            .block(segment.block)
            .and_then(|block| block.operations.get(segment.start))
            .map_or(false, Operation::is_suspending)
    }

    pub(crate) fn target(&self, arrival: Arrival) -> Option<(SegmentId, Via)> {
        match arrival {
            Arrival::Enter(block) => Some((SegmentId::entry(block), Via::Edge)),
            Arrival::BackEdge(header) => Some((self.last_segment(header), Via::BackEdge)),
            Arrival::Finish | Arrival::Return => None,
        }
    }

    /// Every way out of a segment; `None` leaves the behavior
    pub(crate) fn exits(&self, segment: SegmentId) -> Vec<Option<(SegmentId, Via)>> {
        if let Some(next) = self.next_segment(segment) {
            return vec![Some((next, Via::Suspension))];
        }
        self.nesting
            .flow_arrivals(self.graph, segment.block)
            .into_iter()
            .map(|(_, arrival)| self.target(arrival))
            .collect()
    }

    pub(crate) fn successors(&self, segment: SegmentId) -> Vec<(SegmentId, Via)> {
        self.exits(segment).into_iter().flatten().collect()
    }

    fn arrival(&self, block: BlockId, slot: ExitSlot) -> Arrival {
        self.nesting.exit_arrival(self.graph, block, slot)
    }
}

/// Code that runs from one entry point up to its next suspension, join or end
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContinuationRegion {
    pub key: RegionKey,
    pub kind: EntryKind,
    /// Segments owned by this region, in segment order
    pub segments: Vec<SegmentId>,
    pub ops: Vec<RegionOp<RegionKey>>,
}

impl ContinuationRegion {
    pub fn blocks(&self) -> Vec<BlockId> {
        let blocks: BTreeSet<BlockId> = self.segments.iter().map(|segment| segment.block).collect();
        blocks.into_iter().collect()
    }

    /// Regions this one can transition into, in first-seen order
    pub fn targets(&self) -> Vec<RegionKey> {
        let mut targets = Vec::new();
        for op in &self.ops {
            op.for_each_transition(&mut |transition: &Transition<RegionKey>| {
                if let Some(target) = transition.target() {
                    if !targets.contains(&target) {
                        targets.push(target);
                    }
                }
            });
        }
        targets
    }
}

/// The partitioned graph
#[derive(Debug, Clone)]
pub struct Partition {
    regions: BTreeMap<RegionKey, ContinuationRegion>,
    ownership: Ownership,
}

impl Partition {
    pub fn regions(&self) -> impl Iterator<Item = &ContinuationRegion> {
        self.regions.values()
    }

    pub fn region(&self, key: RegionKey) -> Option<&ContinuationRegion> {
        self.regions.get(&key)
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn kind(&self, key: RegionKey) -> Option<EntryKind> {
        self.regions.get(&key).map(|region| region.kind)
    }

    /// Region that owns a segment
    pub fn owner(&self, segment: SegmentId) -> Option<RegionKey> {
        self.ownership.owner(segment)
    }

    /// Region that owns the first segment of a block
    pub fn block_owner(&self, block: BlockId) -> Option<RegionKey> {
        self.owner(SegmentId::entry(block))
    }

    pub(crate) fn ownership(&self) -> &Ownership {
        &self.ownership
    }
}

/// Split the graph into continuation regions
pub fn partition(graph: &Graph, tags: &SuspensionTags, nesting: &Nesting, options: &CompileOptions) -> Partition {
    let flow = SegmentFlow::new(graph, nesting);
    let mut starts = initial_starts(&flow, tags);
    let heads = cycle_heads(&flow, &starts);
    for head in heads {
        tracing::debug!("[PARTITION] Same-frame cycle head at {}", head);
        starts.entry(RegionKey::Segment(head)).or_insert(EntryKind::Join);
    }

    let ownership = loop {
        let ownership = join::discover(&flow, &mut starts);
        let stray = stray_back_edges(&flow, &starts, &ownership);
        if stray.is_empty() {
            break ownership;
        }
        for header in stray {
            tracing::debug!("[PARTITION] Loop at {} is re-entered from another region", header);
            starts.insert(RegionKey::Segment(header), EntryKind::LoopHeader);
        }
    };

    let mut owned: BTreeMap<RegionKey, BTreeSet<SegmentId>> = BTreeMap::new();
    for (segment, owner) in ownership.owners() {
        owned.entry(owner).or_default().insert(segment);
    }

    let mut merges = BTreeMap::new();
    for segments in owned.values() {
        merges.extend(merge_points(&flow, &starts, segments));
    }

    let emitter = Emitter {
        flow: &flow,
        starts: &starts,
        merges: &merges,
        natural_end: options.natural_end.transition(),
    };
    let regions: BTreeMap<RegionKey, ContinuationRegion> = starts
        .iter()
        .map(|(key, kind)| {
            let region = ContinuationRegion {
                key: *key,
                kind: *kind,
                segments: owned.get(key).map(|set| set.iter().copied().collect()).unwrap_or_default(),
                ops: emitter.emit_region(*key),
            };
            (*key, region)
        })
        .collect();

    tracing::debug!(
        "[PARTITION] {} segments in {} regions ({} ownership rounds)",
        flow.segments().count(),
        regions.len(),
        ownership.rounds()
    );

    Partition { regions, ownership }
}

fn initial_starts(flow: &SegmentFlow<'_>, tags: &SuspensionTags) -> BTreeMap<RegionKey, EntryKind> {
    let mut starts = BTreeMap::from([(RegionKey::Root, EntryKind::Root)]);

    for segment in flow.segments() {
        if flow.is_suspension(segment) {
            starts.insert(RegionKey::Segment(segment), EntryKind::Resume);
        }
    }

    let graph = flow.graph();
    for (id, block) in graph.blocks() {
        if block.loop_kind().is_none() {
            continue;
        }
        let body_suspends = graph
            .successor(id, ExitSlot::LoopBody)
            .map_or(false, |body| tags.may_suspend(body));
        if body_suspends {
            starts
                .entry(RegionKey::Segment(flow.last_segment(id)))
                .or_insert(EntryKind::LoopHeader);
        }
    }

    starts
}

/// Headers of same-frame loops whose back-edge is taken from a region other
/// than the one the loop is emitted in. Those loops need a state of their own.
fn stray_back_edges(
    flow: &SegmentFlow<'_>,
    starts: &BTreeMap<RegionKey, EntryKind>,
    ownership: &Ownership,
) -> BTreeSet<SegmentId> {
    let mut stray = BTreeSet::new();
    for (segment, owner) in ownership.owners() {
        for (target, via) in flow.successors(segment) {
            if via != Via::BackEdge || starts.contains_key(&RegionKey::Segment(target)) {
                continue;
            }
            if ownership.owner(target) != Some(owner) {
                stray.insert(target);
            }
        }
    }
    stray
}

/// Heads of cycles that never suspend, found by depth-first search from every
/// region start. Loop back-edges are excluded since loops are emitted in place.
fn cycle_heads(flow: &SegmentFlow<'_>, starts: &BTreeMap<RegionKey, EntryKind>) -> BTreeSet<SegmentId> {
    let is_start = |segment: SegmentId| starts.contains_key(&RegionKey::Segment(segment));
    let children = |segment: SegmentId| -> Vec<SegmentId> {
        flow.successors(segment)
            .into_iter()
            .filter(|(target, via)| *via != Via::BackEdge && !is_start(*target))
            .map(|(target, _)| target)
            .collect()
    };

    let mut roots = Vec::new();
    if flow.graph().contains(flow.graph().entry()) {
        roots.push(SegmentId::entry(flow.graph().entry()));
    }
    roots.extend(starts.keys().filter_map(|key| key.segment()));

    let mut done = BTreeSet::new();
    let mut heads = BTreeSet::new();
    for root in roots {
        if done.contains(&root) {
            continue;
        }
        let mut on_stack = BTreeSet::from([root]);
        let mut stack = vec![(root, children(root), 0usize)];

        while let Some((segment, next, cursor)) = stack.last_mut() {
            if let Some(child) = next.get(*cursor).copied() {
                *cursor += 1;
                if on_stack.contains(&child) {
                    heads.insert(child);
                } else if !done.contains(&child) {
                    on_stack.insert(child);
                    stack.push((child, children(child), 0));
                }
            } else {
                let finished = *segment;
                stack.pop();
                on_stack.remove(&finished);
                done.insert(finished);
            }
        }
    }
    heads
}

/// Immediate post-dominator of every branch segment within one region.
/// Leaving the region, finishing, and loop back-edges all count as exit.
fn merge_points(
    flow: &SegmentFlow<'_>,
    starts: &BTreeMap<RegionKey, EntryKind>,
    owned: &BTreeSet<SegmentId>,
) -> BTreeMap<SegmentId, Option<SegmentId>> {
    let nodes: Vec<SegmentId> = owned.iter().copied().collect();
    let index: BTreeMap<SegmentId, usize> = nodes.iter().enumerate().map(|(i, segment)| (*segment, i)).collect();
    let exit = nodes.len();

    let successors: Vec<Vec<usize>> = nodes
        .iter()
        .map(|segment| {
            let mut out: Vec<usize> = flow
                .exits(*segment)
                .into_iter()
                .map(|target| match target {
                    Some((target, via))
                        if via != Via::BackEdge && !starts.contains_key(&RegionKey::Segment(target)) =>
                    {
                        index.get(&target).copied().unwrap_or(exit)
                    }
                    _ => exit,
                })
                .collect();
            if out.is_empty() {
                out.push(exit);
            }
            out
        })
        .collect();

    let everything: BTreeSet<usize> = (0..=exit).collect();
    let mut pdom: Vec<BTreeSet<usize>> = vec![everything; nodes.len()];
    loop {
        let mut changed = false;
        for node in (0..nodes.len()).rev() {
            let mut set: Option<BTreeSet<usize>> = None;
            for succ in &successors[node] {
                let succ_set = if *succ == exit {
                    BTreeSet::from([exit])
                } else {
                    pdom[*succ].clone()
                };
                set = Some(match set {
                    None => succ_set,
                    Some(acc) => acc.intersection(&succ_set).copied().collect(),
                });
            }
            let mut set = set.unwrap_or_default();
            set.insert(node);
            if set != pdom[node] {
                pdom[node] = set;
                changed = true;
            }
        }
        if !changed {
            break;
        }
    }

    let pdom_size = |node: usize| if node == exit { 1 } else { pdom[node].len() };
    let graph = flow.graph();
    nodes
        .iter()
        .enumerate()
        .filter(|(_, segment)| {
            flow.next_segment(**segment).is_none()
                && graph
                    .block(segment.block)
                    .map_or(false, |block| matches!(block.terminator(), Terminator::Branch(_)))
        })
        .map(|(node, segment)| {
            // the strict post-dominator closest to the branch has the largest set
            let merge = pdom[node]
                .iter()
                .copied()
                .filter(|candidate| *candidate != node)
                .max_by_key(|candidate| pdom_size(*candidate))
                .filter(|candidate| *candidate != exit)
                .map(|candidate| nodes[candidate]);
            (*segment, merge)
        })
        .collect()
}

struct Emitter<'a, 'g> {
    flow: &'a SegmentFlow<'g>,
    starts: &'a BTreeMap<RegionKey, EntryKind>,
    merges: &'a BTreeMap<SegmentId, Option<SegmentId>>,
    natural_end: Transition<RegionKey>,
}

type Ops = Vec<RegionOp<RegionKey>>;

impl Emitter<'_, '_> {
    fn start_kind(&self, segment: SegmentId) -> Option<EntryKind> {
        self.starts.get(&RegionKey::Segment(segment)).copied()
    }

    fn emit_region(&self, key: RegionKey) -> Ops {
        let mut out = Vec::new();
        match key {
            RegionKey::Root => {
                let entry = self.flow.graph().entry();
                if let Some(segment) = self.arrive(Arrival::Enter(entry), &mut out) {
                    self.emit_from(segment, None, &mut out);
                }
            }
            RegionKey::Segment(segment) => self.emit_from(segment, None, &mut out),
        }
        out
    }

    fn transition(&self, segment: SegmentId, kind: EntryKind) -> RegionOp<RegionKey> {
        let key = RegionKey::Segment(segment);
        match kind {
            EntryKind::Resume => RegionOp::Exit(Transition::NextState(key)),
            EntryKind::Root | EntryKind::Join | EntryKind::LoopHeader => {
                RegionOp::Exit(Transition::FastForward(key))
            }
        }
    }

    /// Emit whatever an arrival needs before its target runs; returns the
    /// segment to keep emitting inline, if any.
    fn arrive(&self, arrival: Arrival, out: &mut Ops) -> Option<SegmentId> {
        let graph = self.flow.graph();
        match arrival {
            Arrival::Finish => {
                out.push(RegionOp::Exit(self.natural_end));
                None
            }
            Arrival::Return => {
                out.push(RegionOp::Exit(Transition::Removed));
                None
            }
            Arrival::Enter(block) => {
                if let Some(init) = graph.block(block).and_then(|data| data.loop_kind()?.init()) {
                    out.push(RegionOp::Exec(init));
                }
                let segment = SegmentId::entry(block);
                match self.start_kind(segment) {
                    Some(kind) => {
                        out.push(self.transition(segment, kind));
                        None
                    }
                    None => Some(segment),
                }
            }
            Arrival::BackEdge(header) => {
                if let Some(latch) = graph.block(header).and_then(|data| data.loop_kind()?.latch()) {
                    out.push(RegionOp::Exec(latch));
                }
                let segment = self.flow.last_segment(header);
                match self.start_kind(segment) {
                    Some(kind) => out.push(self.transition(segment, kind)),
                    None => out.push(RegionOp::Continue),
                }
                None
            }
        }
    }

    fn arm(&self, block: BlockId, slot: ExitSlot, stop: Option<SegmentId>) -> Ops {
        let mut ops = Vec::new();
        if let Some(segment) = self.arrive(self.flow.arrival(block, slot), &mut ops) {
            self.emit_from(segment, stop, &mut ops);
        }
        ops
    }

    fn straight_ops(operations: &[Operation], out: &mut Ops) {
        for operation in operations {
            match operation {
                Operation::Plain(statement) => out.push(RegionOp::Exec(statement.clone())),
                Operation::Suspend(check) => out.push(RegionOp::Await(check.clone())),
                Operation::Branch(_) | Operation::Loop(_) | Operation::Return => {}
            }
        }
    }

    fn emit_from(&self, mut segment: SegmentId, stop: Option<SegmentId>, out: &mut Ops) {
        let graph = self.flow.graph();
        loop {
            if Some(segment) == stop {
                return;
            }
            let Some(block) = graph.block(segment.block) else {
                return;
            };
            let end = self.flow.end(segment).max(segment.start);
            let operations = &block.operations[segment.start.min(end)..end];

            if let Some(next) = self.flow.next_segment(segment) {
                Self::straight_ops(operations, out);
                match self.start_kind(next) {
                    Some(kind) => {
                        out.push(self.transition(next, kind));
                        return;
                    }
                    None => {
                        segment = next;
                        continue;
                    }
                }
            }

            match block.terminator() {
                Terminator::Loop(kind) if self.start_kind(segment).is_none() => {
                    // same-frame loop: the header's leading operations rerun every iteration
                    let mut body = Vec::new();
                    Self::straight_ops(operations, &mut body);
                    let iteration = self.arm(segment.block, ExitSlot::LoopBody, None);
                    body.push(RegionOp::If {
                        condition: kind.condition(),
                        then_ops: iteration,
                        else_ops: vec![RegionOp::Break],
                    });
                    out.push(RegionOp::Loop(body));
                    match self.arrive(self.flow.arrival(segment.block, ExitSlot::LoopExit), out) {
                        Some(after) => segment = after,
                        None => return,
                    }
                }
                Terminator::Loop(kind) => {
                    // loop test that is its own region: one iteration per entry
                    Self::straight_ops(operations, out);
                    let body = self.arm(segment.block, ExitSlot::LoopBody, None);
                    let exit = self.arm(segment.block, ExitSlot::LoopExit, stop);
                    out.push(RegionOp::If {
                        condition: kind.condition(),
                        then_ops: body,
                        else_ops: exit,
                    });
                    return;
                }
                Terminator::Branch(condition) => {
                    Self::straight_ops(operations, out);
                    let merge = self.merges.get(&segment).copied().flatten();
                    let arm_stop = merge.or(stop);
                    let then_ops = self.arm(segment.block, ExitSlot::Then, arm_stop);
                    let else_ops = self.arm(segment.block, ExitSlot::Else, arm_stop);
                    out.push(RegionOp::If {
                        condition: condition.clone(),
                        then_ops,
                        else_ops,
                    });
                    match merge {
                        Some(merge) if Some(merge) != stop => segment = merge,
                        _ => return,
                    }
                }
                Terminator::Return => {
                    Self::straight_ops(operations, out);
                    out.push(RegionOp::Exit(Transition::Removed));
                    return;
                }
                Terminator::Fallthrough => {
                    Self::straight_ops(operations, out);
                    match self.arrive(self.flow.arrival(segment.block, ExitSlot::Next), out) {
                        Some(after) => segment = after,
                        None => return,
                    }
                }
            }
        }
    }
}
