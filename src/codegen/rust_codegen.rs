//! # Rust Code Generator for Behaviors
//!
//! Generates a standalone Rust step function from a compiled state machine.
//! The generated function has the same contract as
//! [`Driver::step`](crate::runtime::Driver::step): one call per entity per
//! frame, state kept in an [`ExecutionRecord`](crate::runtime::ExecutionRecord).

use crate::error::{CompileError, CompileResult};
use crate::graph::{BinaryOp, Expr, ResumeCheck, Statement, Value};
use crate::machine::{CompiledState, CompiledStateMachine, RegionOp, StateId, Transition};

/// Behavior-specific Rust code generator
pub struct RustCodeGenerator<'a> {
    machine: &'a CompiledStateMachine,
}

impl<'a> RustCodeGenerator<'a> {
    pub fn new(machine: &'a CompiledStateMachine) -> Self {
        Self { machine }
    }

    /// Name of the generated step function
    pub fn function_name(&self) -> String {
        format!("{}_step", sanitize_identifier(&self.machine.name))
    }

    /// Generate the complete Rust module for the behavior
    pub fn generate_program(&self) -> CompileResult<String> {
        if self.machine.is_empty() {
            return Err(CompileError::Internal(format!(
                "behavior '{}' has no states to generate",
                self.machine.name
            )));
        }

        let mut code = String::new();

        // Add header
        code.push_str("// Auto-generated code from Pulsar behavior graph\n");
        code.push_str("// DO NOT EDIT - Changes will be overwritten\n");
        code.push_str("// Compiled with PBCC (Pulsar Behavior Coroutine Compiler)\n\n");

        code.push_str("use pbcc::error::ExecutionError;\n");
        code.push_str("use pbcc::graph::{BinaryOp, Value};\n");
        code.push_str("use pbcc::machine::{StateId, Transition};\n");
        code.push_str("use pbcc::runtime::{binary, expect_bool, negate, read_field};\n");
        code.push_str("use pbcc::runtime::{EntityId, ExecutionRecord, World};\n\n");

        code.push_str(&self.generate_step_function()?);

        tracing::debug!(
            "[CODEGEN] Generated {} for {} states ({} bytes)",
            self.function_name(),
            self.machine.len(),
            code.len()
        );

        Ok(code)
    }

    fn dispatch_name(&self) -> String {
        format!("{}_dispatch", sanitize_identifier(&self.machine.name))
    }

    fn generate_step_function(&self) -> CompileResult<String> {
        let mut code = String::new();

        code.push_str(&format!(
            "/// Step behavior '{}' for one entity by one frame. On error the\n/// record is left as it was before the call.\n",
            self.machine.name.replace('\n', " ")
        ));
        code.push_str(&format!(
            "pub fn {}(\n    entity: EntityId,\n    frame: u64,\n    record: &mut ExecutionRecord,\n    world: &mut dyn World,\n) -> Result<Transition, ExecutionError> {{\n",
            self.function_name()
        ));
        code.push_str("    if matches!(record.last_frame, Some(last) if last >= frame) {\n");
        code.push_str("        return Err(ExecutionError::AlreadyStepped { entity, frame });\n");
        code.push_str("    }\n");
        code.push_str("    let saved = record.clone();\n");
        code.push_str("    record.last_frame = Some(frame);\n");
        code.push_str(&format!("    let result = {}(entity, record, world);\n", self.dispatch_name()));
        code.push_str("    if result.is_err() {\n");
        code.push_str("        *record = saved;\n");
        code.push_str("    }\n");
        code.push_str("    result\n");
        code.push_str("}\n\n");

        code.push_str("#[allow(unreachable_code, unused_variables, unused_mut)]\n");
        code.push_str(&format!(
            "fn {}(\n    entity: EntityId,\n    record: &mut ExecutionRecord,\n    world: &mut dyn World,\n) -> Result<Transition, ExecutionError> {{\n",
            self.dispatch_name()
        ));
        code.push_str("    let mut state = record.state.unwrap_or(StateId(0));\n\n");
        code.push_str("    'dispatch: loop {\n");
        code.push_str("        match state.0 {\n");

        for state in &self.machine.states {
            code.push_str(&self.generate_state(state, 3)?);
        }

        code.push_str("            other => {\n");
        code.push_str("                return Err(ExecutionError::StateMismatch {\n");
        code.push_str("                    entity,\n");
        code.push_str("                    state: StateId(other),\n");
        code.push_str(&format!(
            "                    behavior: {:?}.to_string(),\n",
            self.machine.name
        ));
        code.push_str("                });\n");
        code.push_str("            }\n");
        code.push_str("        }\n");
        code.push_str("    }\n");
        code.push_str("}\n");

        Ok(code)
    }

    fn generate_state(&self, state: &CompiledState, indent_level: usize) -> CompileResult<String> {
        let mut code = String::new();
        let indent = "    ".repeat(indent_level);

        let blocks = state
            .blocks
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(", ");
        code.push_str(&format!("{}// {} ({:?}) blocks: [{}]\n", indent, state.id, state.kind, blocks));
        code.push_str(&format!("{}{} => {{\n", indent, state.id.0));
        for op in &state.ops {
            code.push_str(&self.generate_op(op, state.id, indent_level + 1)?);
        }
        code.push_str(&format!("{}}}\n", indent));

        Ok(code)
    }

    fn generate_op(&self, op: &RegionOp, current: StateId, indent_level: usize) -> CompileResult<String> {
        let mut code = String::new();
        let indent = "    ".repeat(indent_level);

        match op {
            RegionOp::Exec(statement) => {
                code.push_str(&format!("{}{}\n", indent, generate_statement(statement)));
            }
            RegionOp::Await(check) => {
                let stay = generate_transition(&Transition::NextState(current));
                match check {
                    ResumeCheck::Frames(frames) => {
                        code.push_str(&format!("{}record.wait_frames += 1;\n", indent));
                        code.push_str(&format!(
                            "{}if record.wait_frames < {} {{\n",
                            indent,
                            (*frames).max(1)
                        ));
                        code.push_str(&format!("{}    {}\n", indent, stay));
                        code.push_str(&format!("{}}}\n", indent));
                        code.push_str(&format!("{}record.wait_frames = 0;\n", indent));
                    }
                    ResumeCheck::Until(condition) => {
                        code.push_str(&format!(
                            "{}if !expect_bool({})? {{\n",
                            indent,
                            generate_expr(condition)
                        ));
                        code.push_str(&format!("{}    {}\n", indent, stay));
                        code.push_str(&format!("{}}}\n", indent));
                    }
                    ResumeCheck::Progress(action) => {
                        code.push_str(&format!("{}if !world.poll(entity, {:?})? {{\n", indent, action));
                        code.push_str(&format!("{}    {}\n", indent, stay));
                        code.push_str(&format!("{}}}\n", indent));
                    }
                }
            }
            RegionOp::If {
                condition,
                then_ops,
                else_ops,
            } => {
                code.push_str(&format!(
                    "{}if expect_bool({})? {{\n",
                    indent,
                    generate_expr(condition)
                ));
                for op in then_ops {
                    code.push_str(&self.generate_op(op, current, indent_level + 1)?);
                }
                if !else_ops.is_empty() {
                    code.push_str(&format!("{}}} else {{\n", indent));
                    for op in else_ops {
                        code.push_str(&self.generate_op(op, current, indent_level + 1)?);
                    }
                }
                code.push_str(&format!("{}}}\n", indent));
            }
            RegionOp::Loop(body) => {
                code.push_str(&format!("{}loop {{\n", indent));
                for op in body {
                    code.push_str(&self.generate_op(op, current, indent_level + 1)?);
                }
                code.push_str(&format!("{}}}\n", indent));
            }
            RegionOp::Break => code.push_str(&format!("{}break;\n", indent)),
            RegionOp::Continue => code.push_str(&format!("{}continue;\n", indent)),
            RegionOp::Exit(transition) => {
                if let Some(target) = transition.target() {
                    if self.machine.state(target).is_none() {
                        return Err(CompileError::Internal(format!(
                            "{} transitions into unknown state {}",
                            current, target
                        )));
                    }
                }
                code.push_str(&format!("{}{}\n", indent, generate_transition(transition)));
            }
        }

        Ok(code)
    }
}

fn generate_transition(transition: &Transition) -> String {
    match transition {
        Transition::FastForward(target) => {
            format!("state = StateId({}); record.state = Some(state); continue 'dispatch;", target.0)
        }
        Transition::NextState(target) => format!(
            "record.state = Some(StateId({0})); return Ok(Transition::NextState(StateId({0})));",
            target.0
        ),
        Transition::Terminal => {
            "record.state = None; record.wait_frames = 0; return Ok(Transition::Terminal);".to_string()
        }
        Transition::Removed => {
            "record.state = None; record.wait_frames = 0; return Ok(Transition::Removed);".to_string()
        }
    }
}

fn generate_statement(statement: &Statement) -> String {
    match statement {
        Statement::Set { field, value } => {
            format!("{{ let value = {}; world.write(entity, {:?}, value); }}", generate_expr(value), field)
        }
        Statement::Invoke { function, args } => {
            let count = args.len();
            let args = args.iter().map(generate_expr).collect::<Vec<_>>().join(", ");
            format!(
                "{{ let args: [Value; {}] = [{}]; world.invoke(entity, {:?}, &args)?; }}",
                count, args, function
            )
        }
    }
}

fn generate_expr(expr: &Expr) -> String {
    match expr {
        Expr::Const(value) => generate_value(*value),
        Expr::Field(name) => format!("read_field(&*world, entity, {:?})?", name),
        Expr::Not(inner) => format!("negate({})?", generate_expr(inner)),
        Expr::Binary {
            op: BinaryOp::And,
            lhs,
            rhs,
        } => format!(
            "Value::Bool(expect_bool({})? && expect_bool({})?)",
            generate_expr(lhs),
            generate_expr(rhs)
        ),
        Expr::Binary {
            op: BinaryOp::Or,
            lhs,
            rhs,
        } => format!(
            "Value::Bool(expect_bool({})? || expect_bool({})?)",
            generate_expr(lhs),
            generate_expr(rhs)
        ),
        Expr::Binary { op, lhs, rhs } => format!(
            "binary(BinaryOp::{:?}, {}, {})?",
            op,
            generate_expr(lhs),
            generate_expr(rhs)
        ),
    }
}

fn generate_value(value: Value) -> String {
    match value {
        Value::Int(v) => format!("Value::Int({}i64)", v),
        Value::Float(v) if v.is_finite() => format!("Value::Float({:?}f64)", v),
        Value::Float(v) => format!("Value::Float(f64::from_bits({:#x}))", v.to_bits()),
        Value::Bool(v) => format!("Value::Bool({})", v),
    }
}

/// Turn a behavior name into a valid snake_case Rust identifier
pub fn sanitize_identifier(name: &str) -> String {
    let mut ident: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    if ident.is_empty() || ident.starts_with(|c: char| c.is_ascii_digit()) {
        ident.insert(0, '_');
    }
    ident
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_identifier() {
        assert_eq!(sanitize_identifier("Patrol Route"), "patrol_route");
        assert_eq!(sanitize_identifier("2fast"), "_2fast");
        assert_eq!(sanitize_identifier(""), "_");
    }

    #[test]
    fn test_expression_rendering() {
        let expr = Expr::binary(
            BinaryOp::And,
            Expr::lt(Expr::field("hp"), Expr::int(10)),
            Expr::not(Expr::field("dead")),
        );
        assert_eq!(
            generate_expr(&expr),
            "Value::Bool(expect_bool(binary(BinaryOp::Lt, read_field(&*world, entity, \"hp\")?, Value::Int(10i64))?)? && expect_bool(negate(read_field(&*world, entity, \"dead\")?)?)?)"
        );
    }

    #[test]
    fn test_float_rendering_is_valid_rust() {
        assert_eq!(generate_value(Value::Float(1.0)), "Value::Float(1.0f64)");
        assert!(generate_value(Value::Float(f64::NAN)).starts_with("Value::Float(f64::from_bits("));
    }
}
