//! # State Machine Synthesis
//!
//! Turns partitioned continuation regions into a [`CompiledStateMachine`]:
//! every live region gets a dense, deterministic [`StateId`] (breadth-first
//! from the root in operation order) and its op tree is rewritten to refer
//! to state ids instead of region keys.

use crate::config::CompileOptions;
use crate::error::{CompileError, CompileResult};
use crate::graph::{BlockId, Expr, ResumeCheck, Statement};
use crate::join::JoinTable;
use crate::partition::{EntryKind, Partition, RegionKey, SegmentId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

/// Dense state identifier; the root is always state 0
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateId(pub u32);

impl StateId {
    pub const ROOT: StateId = StateId(0);

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for StateId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// How a region hands the entity over when it is done for now
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Transition<S = StateId> {
    /// Persist the state and resume there on the next frame
    NextState(S),
    /// Continue into the state within the same frame
    FastForward(S),
    /// The behavior finished and the host keeps the entity
    Terminal,
    /// The behavior finished and the entity leaves it
    Removed,
}

impl<S: Copy> Transition<S> {
    pub fn target(&self) -> Option<S> {
        match self {
            Transition::NextState(target) | Transition::FastForward(target) => Some(*target),
            Transition::Terminal | Transition::Removed => None,
        }
    }

    /// The entity's record is cleared after this transition
    pub fn is_final(&self) -> bool {
        matches!(self, Transition::Terminal | Transition::Removed)
    }
}

impl<S: fmt::Display> fmt::Display for Transition<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transition::NextState(target) => write!(f, "next({})", target),
            Transition::FastForward(target) => write!(f, "fast_forward({})", target),
            Transition::Terminal => f.write_str("terminal"),
            Transition::Removed => f.write_str("removed"),
        }
    }
}

/// Operation tree executed by one state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RegionOp<S = StateId> {
    Exec(Statement),
    /// Resumption check of the suspension this state starts with.
    /// Not ready means staying in the current state until the next frame.
    Await(ResumeCheck),
    If {
        condition: Expr,
        then_ops: Vec<RegionOp<S>>,
        else_ops: Vec<RegionOp<S>>,
    },
    /// Same-frame loop, left through `Break` or an `Exit`
    Loop(Vec<RegionOp<S>>),
    Break,
    Continue,
    Exit(Transition<S>),
}

impl<S: Copy> RegionOp<S> {
    pub fn try_map_targets<T, E>(
        &self,
        f: &mut impl FnMut(S) -> Result<T, E>,
    ) -> Result<RegionOp<T>, E> {
        Ok(match self {
            RegionOp::Exec(statement) => RegionOp::Exec(statement.clone()),
            RegionOp::Await(check) => RegionOp::Await(check.clone()),
            RegionOp::If {
                condition,
                then_ops,
                else_ops,
            } => RegionOp::If {
                condition: condition.clone(),
                then_ops: map_all(then_ops, f)?,
                else_ops: map_all(else_ops, f)?,
            },
            RegionOp::Loop(body) => RegionOp::Loop(map_all(body, f)?),
            RegionOp::Break => RegionOp::Break,
            RegionOp::Continue => RegionOp::Continue,
            RegionOp::Exit(transition) => RegionOp::Exit(match transition {
                Transition::NextState(target) => Transition::NextState(f(*target)?),
                Transition::FastForward(target) => Transition::FastForward(f(*target)?),
                Transition::Terminal => Transition::Terminal,
                Transition::Removed => Transition::Removed,
            }),
        })
    }

    /// Visit every transition in the tree in execution order
    pub fn for_each_transition(&self, f: &mut impl FnMut(&Transition<S>)) {
        match self {
            RegionOp::If {
                then_ops, else_ops, ..
            } => {
                then_ops.iter().for_each(|op| op.for_each_transition(f));
                else_ops.iter().for_each(|op| op.for_each_transition(f));
            }
            RegionOp::Loop(body) => body.iter().for_each(|op| op.for_each_transition(f)),
            RegionOp::Exit(transition) => f(transition),
            RegionOp::Exec(_) | RegionOp::Await(_) | RegionOp::Break | RegionOp::Continue => {}
        }
    }

    /// Number of `Await` operations anywhere in the tree
    pub fn await_count(&self) -> usize {
        match self {
            RegionOp::Await(_) => 1,
            RegionOp::If {
                then_ops, else_ops, ..
            } => then_ops.iter().chain(else_ops).map(RegionOp::await_count).sum(),
            RegionOp::Loop(body) => body.iter().map(RegionOp::await_count).sum(),
            _ => 0,
        }
    }
}

fn map_all<S: Copy, T, E>(
    ops: &[RegionOp<S>],
    f: &mut impl FnMut(S) -> Result<T, E>,
) -> Result<Vec<RegionOp<T>>, E> {
    ops.iter().map(|op| op.try_map_targets(f)).collect()
}

/// A field the storage layer must keep per entity for this behavior
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordField {
    pub name: String,
    pub ty: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordLayout {
    pub fields: Vec<RecordField>,
}

impl RecordLayout {
    fn for_states(states: &[CompiledState]) -> Self {
        let mut fields = vec![
            RecordField {
                name: "state".to_string(),
                ty: "Option<u32>".to_string(),
            },
            RecordField {
                name: "last_frame".to_string(),
                ty: "Option<u64>".to_string(),
            },
        ];
        let waits_frames = states
            .iter()
            .any(|state| matches!(state.ops.first(), Some(RegionOp::Await(ResumeCheck::Frames(_)))));
        if waits_frames {
            fields.push(RecordField {
                name: "wait_frames".to_string(),
                ty: "u32".to_string(),
            });
        }
        Self { fields }
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.iter().any(|field| field.name == name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledState {
    pub id: StateId,
    pub kind: EntryKind,
    /// First segment of the region; `None` for the synthetic root
    pub entry: Option<SegmentId>,
    pub blocks: Vec<BlockId>,
    pub ops: Vec<RegionOp>,
    /// Distinct transitions this state can take, in first-seen order
    pub transitions: Vec<Transition>,
}

impl CompiledState {
    pub fn suspends(&self) -> bool {
        matches!(self.ops.first(), Some(RegionOp::Await(_)))
    }
}

/// Output of the compiler, consumed by the execution driver or a code generator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompiledStateMachine {
    pub name: String,
    pub root: StateId,
    pub states: Vec<CompiledState>,
    /// Materialized joins and the state every incoming path transitions to
    pub joins: BTreeMap<BlockId, StateId>,
    pub record: RecordLayout,
}

impl CompiledStateMachine {
    pub fn state(&self, id: StateId) -> Option<&CompiledState> {
        self.states.get(id.index()).filter(|state| state.id == id)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn join_state(&self, block: BlockId) -> Option<StateId> {
        self.joins.get(&block).copied()
    }

    /// State that resumes the suspension at `block[index]`
    pub fn resume_state(&self, block: BlockId, index: usize) -> Option<StateId> {
        let entry = SegmentId { block, start: index };
        self.states
            .iter()
            .find(|state| state.kind == EntryKind::Resume && state.entry == Some(entry))
            .map(|state| state.id)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Number the regions and emit the compiled machine
pub fn synthesize(
    name: &str,
    partition: &Partition,
    joins: &JoinTable,
    options: &CompileOptions,
) -> CompileResult<CompiledStateMachine> {
    fn assign(key: RegionKey, ids: &mut BTreeMap<RegionKey, StateId>, order: &mut Vec<RegionKey>) -> bool {
        if ids.contains_key(&key) {
            return false;
        }
        ids.insert(key, StateId(order.len() as u32));
        order.push(key);
        true
    }

    let mut ids: BTreeMap<RegionKey, StateId> = BTreeMap::new();
    let mut order: Vec<RegionKey> = Vec::new();
    let mut queue = VecDeque::new();

    assign(RegionKey::Root, &mut ids, &mut order);
    queue.push_back(RegionKey::Root);
    while let Some(key) = queue.pop_front() {
        let Some(region) = partition.region(key) else {
            return Err(CompileError::Internal(format!("missing region {}", key)));
        };
        for target in region.targets() {
            if assign(target, &mut ids, &mut order) {
                queue.push_back(target);
            }
        }
    }

    let live = order.len();
    if !options.prune_dead_states {
        for region in partition.regions() {
            assign(region.key, &mut ids, &mut order);
        }
    }
    let dead = partition.len().saturating_sub(live);
    if dead > 0 {
        if options.prune_dead_states {
            tracing::debug!("[SYNTH] Pruned {} unreachable regions", dead);
        } else {
            tracing::debug!("[SYNTH] Kept {} unreachable regions after live states", dead);
        }
    }

    let mut lookup = |key: RegionKey| {
        ids.get(&key)
            .copied()
            .ok_or_else(|| CompileError::Internal(format!("transition into unnumbered region {}", key)))
    };

    let mut states = Vec::with_capacity(order.len());
    for (index, key) in order.iter().enumerate() {
        let Some(region) = partition.region(*key) else {
            return Err(CompileError::Internal(format!("missing region {}", key)));
        };
        let id = StateId(index as u32);
        let ops = region
            .ops
            .iter()
            .map(|op| op.try_map_targets(&mut lookup))
            .collect::<CompileResult<Vec<_>>>()?;

        let mut transitions = Vec::new();
        if matches!(ops.first(), Some(RegionOp::Await(_))) {
            transitions.push(Transition::NextState(id));
        }
        for op in &ops {
            op.for_each_transition(&mut |transition| {
                if !transitions.contains(transition) {
                    transitions.push(*transition);
                }
            });
        }

        tracing::debug!(
            "[SYNTH] {} <- {} ({:?}, {} ops, transitions: {})",
            id,
            key,
            region.kind,
            ops.len(),
            transitions
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", ")
        );

        states.push(CompiledState {
            id,
            kind: region.kind,
            entry: key.segment(),
            blocks: region.blocks(),
            ops,
            transitions,
        });
    }

    let joins = joins
        .materialized()
        .filter_map(|(block, key)| ids.get(&key).map(|id| (block, *id)))
        .collect();
    let record = RecordLayout::for_states(&states);

    Ok(CompiledStateMachine {
        name: name.to_string(),
        root: StateId::ROOT,
        states,
        joins,
        record,
    })
}
