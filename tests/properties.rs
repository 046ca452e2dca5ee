//! Property tests over randomly shaped behavior graphs.
//!
//! Edges only point forward, except for the implicit back-edges of loop
//! bodies, so every generated graph is well formed. Compilation may still
//! reject a graph for nesting reasons; those are filtered out.

use pbcc::analysis::{Arrival, Nesting};
use pbcc::graph::{BlockId, ExitSlot, Expr, Graph, GraphBuilder, LoopKind, Operation, ResumeCheck, Statement};
use pbcc::machine::{CompiledStateMachine, RegionOp};
use pbcc::partition::SegmentId;
use pbcc::runtime::{Driver, EntityId, ExecutionRecord, MemoryWorld};
use pbcc::{
    compile_graph_detailed, compile_graph_with_options, Compilation, CompileError, CompileOptions, ExecutionError,
    StateId, Transition,
};
use proptest::prelude::*;
use std::collections::BTreeSet;

#[derive(Debug, Clone)]
enum Shape {
    Plain,
    Suspend(u32),
    Branch(i64),
    Loop(i64),
    Return,
}

impl Shape {
    fn operations(&self) -> Vec<Operation> {
        let bump = Operation::Plain(Statement::set("x", Expr::add(Expr::field("x"), Expr::int(1))));
        let below = |limit: i64| Expr::lt(Expr::field("x"), Expr::int(limit));
        match self {
            Shape::Plain => vec![bump],
            Shape::Suspend(frames) => vec![Operation::Suspend(ResumeCheck::Frames(*frames)), bump],
            Shape::Branch(limit) => vec![bump, Operation::Branch(below(*limit))],
            Shape::Loop(limit) => vec![Operation::Loop(LoopKind::While(below(*limit)))],
            Shape::Return => vec![Operation::Return],
        }
    }

    fn slots(&self) -> &'static [ExitSlot] {
        match self {
            Shape::Plain | Shape::Suspend(_) => &[ExitSlot::Next],
            Shape::Branch(_) => &[ExitSlot::Then, ExitSlot::Else, ExitSlot::Next],
            Shape::Loop(_) => &[ExitSlot::LoopBody, ExitSlot::LoopExit],
            Shape::Return => &[],
        }
    }
}

fn shape() -> impl Strategy<Value = Shape> {
    prop_oneof![
        3 => Just(Shape::Plain),
        3 => (0u32..3).prop_map(Shape::Suspend),
        2 => (0i64..4).prop_map(Shape::Branch),
        1 => (1i64..4).prop_map(Shape::Loop),
        1 => Just(Shape::Return),
    ]
}

/// Per block: its shape, and for each of its exit slots an optional pick
/// among the blocks after it
fn graph_plan() -> impl Strategy<Value = Vec<(Shape, Vec<Option<u8>>)>> {
    prop::collection::vec((shape(), prop::collection::vec(prop::option::of(any::<u8>()), 3)), 1..8)
}

fn build(plan: &[(Shape, Vec<Option<u8>>)]) -> Graph {
    let mut builder = GraphBuilder::new("generated");
    for (shape, _) in plan {
        builder.add_block(shape.operations());
    }
    for (index, (shape, picks)) in plan.iter().enumerate() {
        let later = plan.len() - index - 1;
        if later == 0 {
            continue;
        }
        for (slot, pick) in shape.slots().iter().zip(picks) {
            if let Some(pick) = pick {
                let to = index + 1 + (*pick as usize % later);
                builder.connect(BlockId(index as u32), *slot, BlockId(to as u32));
            }
        }
    }
    builder.build()
}

fn options() -> CompileOptions {
    CompileOptions {
        allow_unreachable_suspensions: true,
        ..CompileOptions::default()
    }
}

fn accepted<T>(result: Result<T, CompileError>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(CompileError::JoinDepthMismatch { .. }) | Err(CompileError::CyclicSuspensionWithoutProgress { .. }) => {
            None
        }
        Err(other) => panic!("unexpected compile error: {}", other),
    }
}

fn compile(graph: &Graph) -> Option<CompiledStateMachine> {
    accepted(compile_graph_with_options(graph, &options()))
}

fn compile_detailed(graph: &Graph) -> Option<Compilation> {
    accepted(compile_graph_detailed(graph, &options()))
}

/// Segments control can reach from the entry block within one activation
/// or across suspensions
fn reachable_segments(graph: &Graph) -> BTreeSet<SegmentId> {
    let nesting = Nesting::analyze(graph);
    let mut seen = BTreeSet::from([graph.entry()]);
    let mut queue = vec![graph.entry()];
    while let Some(block) = queue.pop() {
        for (_, arrival) in nesting.flow_arrivals(graph, block) {
            let next = match arrival {
                Arrival::Enter(next) | Arrival::BackEdge(next) => next,
                Arrival::Finish | Arrival::Return => continue,
            };
            if seen.insert(next) {
                queue.push(next);
            }
        }
    }

    let mut segments = BTreeSet::new();
    for block in seen {
        let Some(data) = graph.block(block) else { continue };
        segments.insert(SegmentId::entry(block));
        for start in data.suspension_points() {
            segments.insert(SegmentId { block, start });
        }
    }
    segments
}

fn awaits_below_top(ops: &[RegionOp]) -> usize {
    ops.iter()
        .map(|op| match op {
            RegionOp::Await(_) => 1,
            RegionOp::If {
                then_ops, else_ops, ..
            } => awaits_below_top(then_ops) + awaits_below_top(else_ops),
            RegionOp::Loop(body) => awaits_below_top(body),
            _ => 0,
        })
        .sum()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn compilation_is_deterministic(plan in graph_plan()) {
        let graph = build(&plan);
        let first = compile(&graph);
        let second = compile(&graph);
        prop_assert_eq!(first, second);
    }

    #[test]
    fn state_ids_are_dense_and_targets_exist(plan in graph_plan()) {
        let graph = build(&plan);
        if let Some(machine) = compile(&graph) {
            prop_assert_eq!(machine.root, StateId(0));
            prop_assert!(!machine.is_empty());
            for (index, state) in machine.states.iter().enumerate() {
                prop_assert_eq!(state.id, StateId(index as u32));
                for transition in &state.transitions {
                    if let Some(target) = transition.target() {
                        prop_assert!(machine.state(target).is_some(), "{} -> {}", state.id, target);
                    }
                }
            }
            for state in machine.joins.values() {
                prop_assert!(machine.state(*state).is_some());
            }
        }
    }

    #[test]
    fn every_reachable_segment_has_one_live_owner(plan in graph_plan()) {
        let graph = build(&plan);
        if let Some(compilation) = compile_detailed(&graph) {
            let partition = &compilation.partition;
            let machine = &compilation.machine;
            for segment in reachable_segments(&graph) {
                let owner = partition.owner(segment);
                prop_assert!(owner.is_some(), "{} has no owner", segment);
                let listing: Vec<_> = partition
                    .regions()
                    .filter(|region| region.segments.contains(&segment))
                    .map(|region| region.key)
                    .collect();
                prop_assert_eq!(listing.len(), 1, "{} listed by {:?}", segment, listing);
                prop_assert_eq!(Some(listing[0]), owner);

                let entry = listing[0].segment();
                prop_assert!(
                    machine.states.iter().any(|state| state.entry == entry),
                    "region {} of {} has no state",
                    listing[0],
                    segment
                );
            }
            for region in partition.regions() {
                if let Some(start) = region.key.segment() {
                    prop_assert_eq!(partition.owner(start), Some(region.key));
                }
            }
        }
    }

    #[test]
    fn awaits_only_open_a_state(plan in graph_plan()) {
        let graph = build(&plan);
        if let Some(machine) = compile(&graph) {
            for state in &machine.states {
                let awaits = awaits_below_top(&state.ops);
                prop_assert!(awaits <= 1, "{} has {} awaits", state.id, awaits);
                if awaits == 1 {
                    prop_assert!(matches!(state.ops.first(), Some(RegionOp::Await(_))));
                    prop_assert!(state.transitions.contains(&Transition::NextState(state.id)));
                }
            }
        }
    }

    #[test]
    fn driving_only_fails_on_budget(plan in graph_plan()) {
        let graph = build(&plan);
        if let Some(machine) = compile(&graph) {
            let driver = Driver::new(&machine);
            let mut world = MemoryWorld::new();
            let entity = EntityId(1);
            world.set(entity, "x", 0i64);
            let mut record = ExecutionRecord::new();

            for frame in 1..=6 {
                let resumed_from = record.state.unwrap_or(machine.root);
                match driver.step(entity, frame, &mut record, &mut world) {
                    Ok(outcome) => {
                        prop_assert_eq!(outcome.visited.first().copied(), Some(resumed_from));
                        prop_assert_eq!(record.is_tracked(), !outcome.transition.is_final());
                    }
                    Err(ExecutionError::BudgetExceeded { .. }) => break,
                    Err(other) => prop_assert!(false, "unexpected execution error: {}", other),
                }
            }
        }
    }
}
