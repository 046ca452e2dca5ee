//! # Join Resolution
//!
//! A join is a block entered from two or more distinct blocks. When every
//! incoming path runs inside the same region the join is emitted inline in
//! that region. When incoming paths belong to different regions (some of
//! them resumed on a later frame, some not) the join becomes a region of its
//! own, and every path transitions to that one state. That is what makes the
//! two-branch rendezvous problem go away: each pairing of cold and warm
//! arrivals meets in the same continuation.
//!
//! Region ownership is computed as a fixed point: each region floods the
//! segments it can reach without crossing another region start, and
//! segments claimed by more than one region are promoted to join starts
//! until every segment has a single owner.

use crate::analysis::Nesting;
use crate::error::{CompileError, CompileResult};
use crate::graph::{BlockId, Graph};
use crate::partition::{EntryKind, Partition, RegionKey, SegmentFlow, SegmentId};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, VecDeque};

/// Where an arrival into a segment came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum Origin {
    /// First activation of the behavior
    Activation,
    Segment(SegmentId),
}

/// Which region claims each segment, and who arrives where
#[derive(Debug, Clone, Default)]
pub(crate) struct Ownership {
    claims: BTreeMap<SegmentId, BTreeSet<RegionKey>>,
    arrivals: BTreeMap<SegmentId, BTreeSet<(RegionKey, Origin)>>,
    rounds: usize,
}

impl Ownership {
    fn claim(&mut self, segment: SegmentId, region: RegionKey) -> bool {
        self.claims.entry(segment).or_default().insert(region)
    }

    fn arrive(&mut self, segment: SegmentId, region: RegionKey, origin: Origin) {
        self.arrivals.entry(segment).or_default().insert((region, origin));
    }

    fn conflicts(&self) -> Vec<SegmentId> {
        self.claims
            .iter()
            .filter(|(_, regions)| regions.len() > 1)
            .map(|(segment, _)| *segment)
            .collect()
    }

    /// Conflicting segments entered from a segment with a different set of
    /// claimants. Promoting only these avoids splitting code that merely
    /// inherits a conflict from upstream.
    fn frontier(&self, conflicts: &[SegmentId]) -> Vec<SegmentId> {
        conflicts
            .iter()
            .copied()
            .filter(|segment| {
                let mine = self.claims.get(segment);
                self.arrivals
                    .get(segment)
                    .into_iter()
                    .flatten()
                    .any(|(_, origin)| match origin {
                        Origin::Activation => true,
                        Origin::Segment(from) => self.claims.get(from) != mine,
                    })
            })
            .collect()
    }

    pub(crate) fn owner(&self, segment: SegmentId) -> Option<RegionKey> {
        let regions = self.claims.get(&segment)?;
        if regions.len() == 1 {
            regions.iter().next().copied()
        } else {
            None
        }
    }

    pub(crate) fn owners(&self) -> impl Iterator<Item = (SegmentId, RegionKey)> + '_ {
        self.claims
            .keys()
            .filter_map(|segment| self.owner(*segment).map(|owner| (*segment, owner)))
    }

    pub(crate) fn rounds(&self) -> usize {
        self.rounds
    }

    /// Distinct source blocks entering the first segment of `block`
    fn sources(&self, block: BlockId) -> BTreeSet<(RegionKey, Option<BlockId>)> {
        self.arrivals
            .get(&SegmentId::entry(block))
            .into_iter()
            .flatten()
            .map(|(region, origin)| {
                let from = match origin {
                    Origin::Activation => None,
                    Origin::Segment(segment) => Some(segment.block),
                };
                (*region, from)
            })
            .collect()
    }
}

fn flood(flow: &SegmentFlow<'_>, starts: &BTreeMap<RegionKey, EntryKind>) -> Ownership {
    let is_start = |segment: SegmentId| starts.contains_key(&RegionKey::Segment(segment));
    let mut ownership = Ownership::default();
    let graph = flow.graph();

    for key in starts.keys().copied() {
        let mut queue = VecDeque::new();
        match key {
            RegionKey::Root => {
                if !graph.contains(graph.entry()) {
                    continue;
                }
                let entry = SegmentId::entry(graph.entry());
                ownership.arrive(entry, key, Origin::Activation);
                if !is_start(entry) && ownership.claim(entry, key) {
                    queue.push_back(entry);
                }
            }
            RegionKey::Segment(segment) => {
                ownership.claim(segment, key);
                queue.push_back(segment);
            }
        }

        while let Some(segment) = queue.pop_front() {
            for (target, _) in flow.successors(segment) {
                ownership.arrive(target, key, Origin::Segment(segment));
                if is_start(target) {
                    continue;
                }
                if ownership.claim(target, key) {
                    queue.push_back(target);
                }
            }
        }
    }

    ownership
}

/// Promote shared segments to join starts until ownership is unique
pub(crate) fn discover(flow: &SegmentFlow<'_>, starts: &mut BTreeMap<RegionKey, EntryKind>) -> Ownership {
    let mut rounds = 0;
    loop {
        rounds += 1;
        let mut ownership = flood(flow, starts);
        let conflicts = ownership.conflicts();
        if conflicts.is_empty() {
            ownership.rounds = rounds;
            return ownership;
        }

        let frontier = ownership.frontier(&conflicts);
        let promoted = if frontier.is_empty() { conflicts } else { frontier };
        for segment in promoted {
            tracing::debug!(
                "[JOIN] {} is shared by {:?}, materializing",
                segment,
                ownership.claims.get(&segment)
            );
            starts.insert(RegionKey::Segment(segment), EntryKind::Join);
        }
    }
}

/// How a join is realized in the compiled machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum JoinResolution {
    /// Every incoming path runs inside this region; emitted inline
    SameFrame(RegionKey),
    /// Incoming paths come from several regions and transition to this one
    Materialized(RegionKey),
}

impl JoinResolution {
    pub fn region(&self) -> RegionKey {
        match self {
            JoinResolution::SameFrame(region) | JoinResolution::Materialized(region) => *region,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinSource {
    /// Region the incoming path runs in
    pub region: RegionKey,
    /// Block the path leaves; `None` for the behavior's first activation
    pub block: Option<BlockId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JoinPoint {
    pub block: BlockId,
    pub sources: Vec<JoinSource>,
    pub resolution: JoinResolution,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JoinTable {
    points: BTreeMap<BlockId, JoinPoint>,
}

impl JoinTable {
    pub fn get(&self, block: BlockId) -> Option<&JoinPoint> {
        self.points.get(&block)
    }

    pub fn points(&self) -> impl Iterator<Item = &JoinPoint> {
        self.points.values()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Joins that got a region of their own
    pub fn materialized(&self) -> impl Iterator<Item = (BlockId, RegionKey)> + '_ {
        self.points.values().filter_map(|point| match point.resolution {
            JoinResolution::Materialized(region) => Some((point.block, region)),
            JoinResolution::SameFrame(_) => None,
        })
    }
}

/// Reject joins reached under incompatible nesting and classify the rest
pub fn resolve_joins(graph: &Graph, nesting: &Nesting, partition: &Partition) -> CompileResult<JoinTable> {
    if let Some(conflict) = nesting.conflicts().next() {
        return Err(CompileError::JoinDepthMismatch {
            block: conflict.block,
            first: conflict.first,
            second: conflict.second,
            expected: conflict.expected,
            found: conflict.found,
        });
    }

    let ownership = partition.ownership();
    let mut points = BTreeMap::new();
    for block in graph.block_ids() {
        let sources = ownership.sources(block);
        let distinct: BTreeSet<Option<BlockId>> = sources.iter().map(|(_, from)| *from).collect();
        if distinct.len() < 2 {
            continue;
        }
        let Some(owner) = partition.block_owner(block) else {
            return Err(CompileError::Internal(format!("join {} has no owning region", block)));
        };

        let resolution = if owner == RegionKey::Segment(SegmentId::entry(block)) {
            JoinResolution::Materialized(owner)
        } else {
            JoinResolution::SameFrame(owner)
        };
        let sources = sources
            .into_iter()
            .map(|(region, block)| JoinSource { region, block })
            .collect();

        tracing::debug!("[JOIN] {} resolved as {:?}", block, resolution);
        points.insert(
            block,
            JoinPoint {
                block,
                sources,
                resolution,
            },
        );
    }

    Ok(JoinTable { points })
}
