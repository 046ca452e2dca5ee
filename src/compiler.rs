//! # Behavior Compiler
//!
//! Main entry points for compiling behavior graphs into state machines.

use crate::analysis::{self, Nesting, SuspensionTags};
use crate::codegen::RustCodeGenerator;
use crate::config::CompileOptions;
use crate::error::CompileResult;
use crate::graph::Graph;
use crate::join::{resolve_joins, JoinTable};
use crate::machine::{synthesize, CompiledStateMachine};
use crate::partition::{partition, Partition};

/// Every intermediate result of one compilation
#[derive(Debug, Clone)]
pub struct Compilation {
    pub tags: SuspensionTags,
    pub partition: Partition,
    pub joins: JoinTable,
    pub machine: CompiledStateMachine,
}

/// Compile a behavior graph into a per-entity state machine
///
/// # Examples
///
/// ```rust
/// use pbcc::compile_graph;
/// use pbcc::graph::{Expr, GraphBuilder, Operation, ResumeCheck, Statement};
///
/// let mut builder = GraphBuilder::new("greet");
/// builder.add_block([
///     Operation::Suspend(ResumeCheck::Frames(1)),
///     Operation::Plain(Statement::set("greeted", Expr::bool(true))),
/// ]);
///
/// let machine = compile_graph(&builder.build()).expect("compiles");
/// assert_eq!(machine.len(), 2);
/// ```
pub fn compile_graph(graph: &Graph) -> CompileResult<CompiledStateMachine> {
    compile_graph_with_options(graph, &CompileOptions::default())
}

/// Compile a behavior graph with explicit options
pub fn compile_graph_with_options(graph: &Graph, options: &CompileOptions) -> CompileResult<CompiledStateMachine> {
    compile_graph_detailed(graph, options).map(|compilation| compilation.machine)
}

/// Compile a behavior graph and keep the analysis results alongside the machine
pub fn compile_graph_detailed(graph: &Graph, options: &CompileOptions) -> CompileResult<Compilation> {
    tracing::info!("[PBCC] Starting behavior compilation");
    tracing::info!(
        "[PBCC] Graph: {} ({} blocks, {} edges)",
        graph.name(),
        graph.len(),
        graph.edges().len()
    );

    // Phase 1: Structural validation
    tracing::info!("[PBCC] Phase 1: Validating graph...");
    graph.validate()?;

    // Phase 2: Scopes and sink continuations
    tracing::info!("[PBCC] Phase 2: Analyzing nesting...");
    let nesting = Nesting::analyze(graph);

    // Phase 3: Suspension tags
    tracing::info!("[PBCC] Phase 3: Analyzing suspensions...");
    let tags = analysis::analyze(graph);
    let reachable = graph.reachable();
    if !options.allow_unreachable_suspensions {
        analysis::check_reachability(graph, &reachable)?;
    }
    analysis::check_progress(graph, &nesting, &reachable)?;
    tracing::info!(
        "[PBCC]   - {} blocks require a continuation",
        tags.tagged().count()
    );

    // Phase 4: Continuation regions
    tracing::info!("[PBCC] Phase 4: Partitioning regions...");
    let partition = partition(graph, &tags, &nesting, options);
    tracing::info!("[PBCC]   - {} regions", partition.len());

    // Phase 5: Joins
    tracing::info!("[PBCC] Phase 5: Resolving joins...");
    let joins = resolve_joins(graph, &nesting, &partition)?;
    tracing::info!(
        "[PBCC]   - {} joins, {} materialized",
        joins.len(),
        joins.materialized().count()
    );

    // Phase 6: State machine
    tracing::info!("[PBCC] Phase 6: Synthesizing state machine...");
    let machine = synthesize(graph.name(), &partition, &joins, options)?;

    tracing::info!("[PBCC] Compilation successful! ({} states)", machine.len());

    Ok(Compilation {
        tags,
        partition,
        joins,
        machine,
    })
}

/// Compile a behavior graph straight to Rust source code
pub fn compile_graph_to_rust(graph: &Graph) -> CompileResult<String> {
    let machine = compile_graph(graph)?;

    tracing::info!("[PBCC] Generating Rust code...");
    let code = RustCodeGenerator::new(&machine).generate_program()?;
    tracing::info!("[PBCC] Code generation complete ({} bytes)", code.len());

    Ok(code)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CompileError;
    use crate::graph::{Expr, GraphBuilder, Operation, ResumeCheck, Statement};

    #[test]
    fn test_empty_graph_is_rejected() {
        let graph = GraphBuilder::new("empty").build();
        assert_eq!(compile_graph(&graph), Err(CompileError::EmptyGraph));
    }

    #[test]
    fn test_unreachable_suspension_can_be_allowed() {
        let mut builder = GraphBuilder::new("orphan");
        builder.add_block([Operation::Plain(Statement::set("a", Expr::int(1)))]);
        let orphan = builder.add_block([Operation::Suspend(ResumeCheck::Frames(1))]);
        let graph = builder.build();

        assert!(matches!(
            compile_graph(&graph),
            Err(CompileError::UnreachableSuspendingOperation { block, index: 0 }) if block == orphan
        ));

        let options = CompileOptions {
            allow_unreachable_suspensions: true,
            ..CompileOptions::default()
        };
        let machine = compile_graph_with_options(&graph, &options).expect("compiles");
        assert_eq!(machine.len(), 1);

        let keep_dead = CompileOptions {
            allow_unreachable_suspensions: true,
            prune_dead_states: false,
            ..CompileOptions::default()
        };
        let machine = compile_graph_with_options(&graph, &keep_dead).expect("compiles");
        assert_eq!(machine.len(), 2);
        assert_eq!(machine.resume_state(orphan, 0), Some(crate::machine::StateId(1)));
    }

    #[test]
    fn test_compile_to_rust_has_header() {
        let mut builder = GraphBuilder::new("tiny");
        builder.add_block([Operation::Plain(Statement::set("a", Expr::int(1)))]);
        let code = compile_graph_to_rust(&builder.build()).expect("generates");
        assert!(code.starts_with("// Auto-generated code from Pulsar behavior graph"));
        assert!(code.contains("pub fn tiny_step("));
    }

    #[test]
    fn test_natural_end_transition_follows_options() {
        let mut builder = GraphBuilder::new("ending");
        builder.add_block([Operation::Plain(Statement::set("a", Expr::int(1)))]);
        let graph = builder.build();

        let machine = compile_graph(&graph).expect("compiles");
        assert_eq!(machine.states[0].transitions, vec![crate::machine::Transition::Removed]);

        let options = CompileOptions {
            natural_end: crate::config::Completion::Terminal,
            ..CompileOptions::default()
        };
        let machine = compile_graph_with_options(&graph, &options).expect("compiles");
        assert_eq!(machine.states[0].transitions, vec![crate::machine::Transition::Terminal]);
    }
}
