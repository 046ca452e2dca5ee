//! # Execution Driver
//!
//! Steps compiled behaviors once per frame for each entity. An entity's
//! progress lives entirely in its [`ExecutionRecord`]; the driver itself is
//! stateless and can step any number of entities sharing one machine.
//!
//! Within a step, `FastForward` transitions are followed immediately, so a
//! step ends only on `NextState`, `Terminal` or `Removed`.

mod eval;
mod world;

pub use eval::{binary, expect_bool, negate, read_field};
pub use world::{Call, MemoryWorld, World};

use crate::config::DriverOptions;
use crate::error::ExecutionError;
use crate::graph::{ResumeCheck, Statement};
use crate::machine::{CompiledState, CompiledStateMachine, RegionOp, StateId, Transition};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(pub u64);

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Per-entity progress through one behavior
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// State to run on the next step; `None` means not started or completed,
    /// and the next step runs the root
    pub state: Option<StateId>,
    /// Frames spent waiting in the current `Frames` suspension
    pub wait_frames: u32,
    pub last_frame: Option<u64>,
}

impl ExecutionRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the entity is parked in a state waiting for a later frame
    pub fn is_tracked(&self) -> bool {
        self.state.is_some()
    }
}

/// What happened to one entity during one step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    /// States run this step, in order
    pub visited: Vec<StateId>,
    /// Transition that ended the step. After `Terminal` or `Removed` the
    /// caller may drop the record.
    pub transition: Transition,
    pub ops_executed: usize,
}

enum Flow {
    Normal,
    Break,
    Continue,
    Exit(Transition),
}

struct Context<'a> {
    entity: EntityId,
    state: StateId,
    record: &'a mut ExecutionRecord,
    world: &'a mut dyn World,
    budget: usize,
    executed: usize,
}

impl Context<'_> {
    fn tick(&mut self) -> Result<(), ExecutionError> {
        self.executed += 1;
        if self.executed > self.budget {
            return Err(ExecutionError::BudgetExceeded {
                entity: self.entity,
                budget: self.budget,
            });
        }
        Ok(())
    }
}

/// Runs a compiled machine for any number of entities
#[derive(Debug, Clone)]
pub struct Driver<'m> {
    machine: &'m CompiledStateMachine,
    options: DriverOptions,
}

impl<'m> Driver<'m> {
    pub fn new(machine: &'m CompiledStateMachine) -> Self {
        Self::with_options(machine, DriverOptions::default())
    }

    pub fn with_options(machine: &'m CompiledStateMachine, options: DriverOptions) -> Self {
        Self { machine, options }
    }

    pub fn machine(&self) -> &'m CompiledStateMachine {
        self.machine
    }

    /// Advance one entity by one frame.
    ///
    /// On error the record is left exactly as it was before the call. World
    /// writes made before the failure are not undone.
    pub fn step(
        &self,
        entity: EntityId,
        frame: u64,
        record: &mut ExecutionRecord,
        world: &mut dyn World,
    ) -> Result<StepOutcome, ExecutionError> {
        if matches!(record.last_frame, Some(last) if last >= frame) {
            return Err(ExecutionError::AlreadyStepped { entity, frame });
        }

        let saved = record.clone();
        record.last_frame = Some(frame);
        let result = self.run(entity, frame, record, world);
        if result.is_err() {
            *record = saved;
        }
        result
    }

    fn run(
        &self,
        entity: EntityId,
        frame: u64,
        record: &mut ExecutionRecord,
        world: &mut dyn World,
    ) -> Result<StepOutcome, ExecutionError> {
        let start = record.state.unwrap_or(StateId::ROOT);

        let mut ctx = Context {
            entity,
            state: start,
            record,
            world,
            budget: self.options.max_ops_per_step,
            executed: 0,
        };
        let mut visited = Vec::new();

        let transition = loop {
            let state = self.lookup(ctx.state, entity)?;
            visited.push(state.id);

            let transition = match self.exec_ops(&state.ops, &mut ctx)? {
                Flow::Exit(transition) => transition,
                Flow::Normal | Flow::Break | Flow::Continue => {
                    return Err(ExecutionError::MalformedRegion {
                        state: state.id,
                        reason: "ran off the end without a transition".to_string(),
                    })
                }
            };

            match transition {
                Transition::FastForward(next) => {
                    ctx.state = next;
                    ctx.record.state = Some(next);
                }
                Transition::NextState(next) => {
                    ctx.record.state = Some(next);
                    break transition;
                }
                Transition::Terminal | Transition::Removed => {
                    ctx.record.state = None;
                    ctx.record.wait_frames = 0;
                    break transition;
                }
            }
        };

        tracing::debug!(
            "[DRIVER] {} frame {}: {} -> {} ({} ops)",
            entity,
            frame,
            start,
            transition,
            ctx.executed
        );

        Ok(StepOutcome {
            visited,
            transition,
            ops_executed: ctx.executed,
        })
    }

    /// Step several entities in one frame; each entity may appear only once
    pub fn step_batch<'r>(
        &self,
        frame: u64,
        records: impl IntoIterator<Item = (EntityId, &'r mut ExecutionRecord)>,
        world: &mut dyn World,
    ) -> Result<Vec<(EntityId, StepOutcome)>, ExecutionError> {
        let mut seen = BTreeSet::new();
        let mut outcomes = Vec::new();
        for (entity, record) in records {
            if !seen.insert(entity) {
                return Err(ExecutionError::AlreadyStepped { entity, frame });
            }
            let outcome = self.step(entity, frame, record, world)?;
            outcomes.push((entity, outcome));
        }
        Ok(outcomes)
    }

    fn lookup(&self, id: StateId, entity: EntityId) -> Result<&'m CompiledState, ExecutionError> {
        self.machine.state(id).ok_or_else(|| ExecutionError::StateMismatch {
            entity,
            state: id,
            behavior: self.machine.name.clone(),
        })
    }

    fn exec_ops(&self, ops: &[RegionOp], ctx: &mut Context<'_>) -> Result<Flow, ExecutionError> {
        for op in ops {
            ctx.tick()?;
            match op {
                RegionOp::Exec(statement) => self.exec_statement(statement, ctx)?,
                RegionOp::Await(check) => {
                    if !self.ready(check, ctx)? {
                        return Ok(Flow::Exit(Transition::NextState(ctx.state)));
                    }
                }
                RegionOp::If {
                    condition,
                    then_ops,
                    else_ops,
                } => {
                    let taken = if eval::truthy(condition, ctx.entity, &*ctx.world)? {
                        then_ops
                    } else {
                        else_ops
                    };
                    match self.exec_ops(taken, ctx)? {
                        Flow::Normal => {}
                        flow => return Ok(flow),
                    }
                }
                RegionOp::Loop(body) => loop {
                    match self.exec_ops(body, ctx)? {
                        Flow::Normal | Flow::Continue => ctx.tick()?,
                        Flow::Break => break,
                        Flow::Exit(transition) => return Ok(Flow::Exit(transition)),
                    }
                },
                RegionOp::Break => return Ok(Flow::Break),
                RegionOp::Continue => return Ok(Flow::Continue),
                RegionOp::Exit(transition) => return Ok(Flow::Exit(*transition)),
            }
        }
        Ok(Flow::Normal)
    }

    fn exec_statement(&self, statement: &Statement, ctx: &mut Context<'_>) -> Result<(), ExecutionError> {
        match statement {
            Statement::Set { field, value } => {
                let value = eval::eval(value, ctx.entity, &*ctx.world)?;
                ctx.world.write(ctx.entity, field, value);
            }
            Statement::Invoke { function, args } => {
                let args = args
                    .iter()
                    .map(|arg| eval::eval(arg, ctx.entity, &*ctx.world))
                    .collect::<Result<Vec<_>, _>>()?;
                ctx.world.invoke(ctx.entity, function, &args)?;
            }
        }
        Ok(())
    }

    fn ready(&self, check: &ResumeCheck, ctx: &mut Context<'_>) -> Result<bool, ExecutionError> {
        let ready = match check {
            ResumeCheck::Frames(frames) => {
                ctx.record.wait_frames += 1;
                if ctx.record.wait_frames >= (*frames).max(1) {
                    ctx.record.wait_frames = 0;
                    true
                } else {
                    false
                }
            }
            ResumeCheck::Until(condition) => eval::truthy(condition, ctx.entity, &*ctx.world)?,
            ResumeCheck::Progress(action) => ctx.world.poll(ctx.entity, action)?,
        };
        if !ready {
            tracing::trace!("[DRIVER] {} still waiting in {}", ctx.entity, ctx.state);
        }
        Ok(ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compile_graph;
    use crate::graph::{Expr, GraphBuilder, Operation};

    fn counter_machine() -> CompiledStateMachine {
        let mut builder = GraphBuilder::new("counter");
        builder.add_block([
            Operation::Plain(Statement::set("n", Expr::add(Expr::field("n"), Expr::int(1)))),
            Operation::Suspend(ResumeCheck::Frames(2)),
            Operation::Plain(Statement::set("done", Expr::bool(true))),
        ]);
        compile_graph(&builder.build()).expect("compiles")
    }

    #[test]
    fn test_frames_wait_counts_frames() {
        let machine = counter_machine();
        let driver = Driver::new(&machine);
        let mut world = MemoryWorld::new();
        let entity = EntityId(1);
        world.set(entity, "n", 0i64);
        let mut record = ExecutionRecord::new();

        let first = driver.step(entity, 1, &mut record, &mut world).expect("frame 1");
        assert!(matches!(first.transition, Transition::NextState(_)));
        assert!(record.is_tracked());
        assert_eq!(world.get(entity, "n"), Some(1i64.into()));

        driver.step(entity, 2, &mut record, &mut world).expect("frame 2");
        assert_eq!(record.wait_frames, 1);
        assert_eq!(world.get(entity, "done"), None);

        let third = driver.step(entity, 3, &mut record, &mut world).expect("frame 3");
        assert_eq!(third.transition, Transition::Removed);
        assert_eq!(world.get(entity, "done"), Some(true.into()));
        assert!(!record.is_tracked());
        assert_eq!(record.wait_frames, 0);
    }

    #[test]
    fn test_cleared_record_restarts_at_root() {
        let machine = counter_machine();
        let driver = Driver::new(&machine);
        let mut world = MemoryWorld::new();
        let entity = EntityId(1);
        world.set(entity, "n", 5i64);
        let mut record = ExecutionRecord {
            state: None,
            wait_frames: 0,
            last_frame: Some(4),
        };

        let outcome = driver.step(entity, 5, &mut record, &mut world).expect("root step");
        assert_eq!(outcome.visited, vec![StateId::ROOT]);
        assert_eq!(world.get(entity, "n"), Some(6i64.into()));
        assert_eq!(record.last_frame, Some(5));
    }

    #[test]
    fn test_same_frame_twice_is_rejected() {
        let machine = counter_machine();
        let driver = Driver::new(&machine);
        let mut world = MemoryWorld::new();
        let entity = EntityId(3);
        world.set(entity, "n", 0i64);
        let mut record = ExecutionRecord::new();

        driver.step(entity, 1, &mut record, &mut world).expect("frame 1");
        assert_eq!(
            driver.step(entity, 1, &mut record, &mut world),
            Err(ExecutionError::AlreadyStepped { entity, frame: 1 })
        );
    }

    #[test]
    fn test_failed_step_leaves_record_untouched() {
        use crate::graph::ExitSlot;

        // the warm path fast-forwards into the join, which reads a missing field
        let mut builder = GraphBuilder::new("faulty");
        let branch = builder.add_block([Operation::Branch(Expr::field("slow"))]);
        let arm = builder.add_block([Operation::Suspend(ResumeCheck::Frames(1))]);
        let join = builder.add_block([Operation::Plain(Statement::set(
            "total",
            Expr::add(Expr::field("missing"), Expr::int(1)),
        ))]);
        builder
            .connect(branch, ExitSlot::Then, arm)
            .connect(arm, ExitSlot::Next, join)
            .connect(branch, ExitSlot::Next, join);
        let machine = compile_graph(&builder.build()).expect("compiles");
        let driver = Driver::new(&machine);
        let mut world = MemoryWorld::new();
        let entity = EntityId(4);
        world.set(entity, "slow", false);
        let mut record = ExecutionRecord {
            state: None,
            wait_frames: 0,
            last_frame: Some(7),
        };
        let before = record.clone();

        let result = driver.step(entity, 8, &mut record, &mut world);
        assert!(matches!(result, Err(ExecutionError::MissingField { ref field, .. }) if field == "missing"));
        assert_eq!(record, before);

        // the failed frame was not consumed
        world.set(entity, "missing", 1i64);
        let outcome = driver.step(entity, 8, &mut record, &mut world).expect("retry");
        assert_eq!(outcome.transition, Transition::Removed);
        assert_eq!(outcome.visited.len(), 2);
        assert_eq!(world.get(entity, "total"), Some(2i64.into()));
    }

    #[test]
    fn test_batch_rejects_duplicate_entity() {
        let machine = counter_machine();
        let driver = Driver::new(&machine);
        let mut world = MemoryWorld::new();
        world.set(EntityId(1), "n", 0i64);
        let mut first = ExecutionRecord::new();
        let mut second = ExecutionRecord::new();

        let result = driver.step_batch(
            1,
            [(EntityId(1), &mut first), (EntityId(1), &mut second)],
            &mut world,
        );
        assert_eq!(
            result,
            Err(ExecutionError::AlreadyStepped {
                entity: EntityId(1),
                frame: 1
            })
        );
    }
}
