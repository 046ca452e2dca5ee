//! Expression evaluation against one entity's fields.

use super::{EntityId, World};
use crate::error::ExecutionError;
use crate::graph::{BinaryOp, Expr, Value};

pub(crate) fn eval(expr: &Expr, entity: EntityId, world: &dyn World) -> Result<Value, ExecutionError> {
    match expr {
        Expr::Const(value) => Ok(*value),
        Expr::Field(name) => read_field(world, entity, name),
        Expr::Not(inner) => negate(eval(inner, entity, world)?),
        Expr::Binary { op, lhs, rhs } => {
            let lhs = eval(lhs, entity, world)?;
            // && and || short-circuit like the generated code does
            match (op, lhs) {
                (BinaryOp::And, Value::Bool(false)) => return Ok(Value::Bool(false)),
                (BinaryOp::Or, Value::Bool(true)) => return Ok(Value::Bool(true)),
                _ => {}
            }
            let rhs = eval(rhs, entity, world)?;
            binary(*op, lhs, rhs)
        }
    }
}

/// Evaluate a condition; anything but a boolean is a type error
pub(crate) fn truthy(expr: &Expr, entity: EntityId, world: &dyn World) -> Result<bool, ExecutionError> {
    expect_bool(eval(expr, entity, world)?)
}

pub fn read_field(world: &dyn World, entity: EntityId, field: &str) -> Result<Value, ExecutionError> {
    world.read(entity, field).ok_or_else(|| ExecutionError::MissingField {
        entity,
        field: field.to_string(),
    })
}

pub fn expect_bool(value: Value) -> Result<bool, ExecutionError> {
    match value {
        Value::Bool(value) => Ok(value),
        other => Err(ExecutionError::TypeMismatch(format!(
            "expected bool, found {} value {}",
            other.type_name(),
            other
        ))),
    }
}

pub fn negate(value: Value) -> Result<Value, ExecutionError> {
    match value {
        Value::Bool(value) => Ok(Value::Bool(!value)),
        other => Err(ExecutionError::TypeMismatch(format!(
            "cannot negate {} value {}",
            other.type_name(),
            other
        ))),
    }
}

/// Apply a binary operator. Mixed int/float arithmetic promotes to float;
/// integer arithmetic wraps.
pub fn binary(op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, ExecutionError> {
    use Value::{Bool, Float, Int};

    let mismatch = || {
        ExecutionError::TypeMismatch(format!(
            "{} {} {} is not defined",
            lhs.type_name(),
            op.symbol(),
            rhs.type_name()
        ))
    };

    Ok(match (op, lhs, rhs) {
        (BinaryOp::And, Bool(a), Bool(b)) => Bool(a && b),
        (BinaryOp::Or, Bool(a), Bool(b)) => Bool(a || b),
        (BinaryOp::Eq, Bool(a), Bool(b)) => Bool(a == b),
        (BinaryOp::Ne, Bool(a), Bool(b)) => Bool(a != b),

        (BinaryOp::Add, Int(a), Int(b)) => Int(a.wrapping_add(b)),
        (BinaryOp::Sub, Int(a), Int(b)) => Int(a.wrapping_sub(b)),
        (BinaryOp::Mul, Int(a), Int(b)) => Int(a.wrapping_mul(b)),
        (BinaryOp::Eq, Int(a), Int(b)) => Bool(a == b),
        (BinaryOp::Ne, Int(a), Int(b)) => Bool(a != b),
        (BinaryOp::Lt, Int(a), Int(b)) => Bool(a < b),
        (BinaryOp::Le, Int(a), Int(b)) => Bool(a <= b),
        (BinaryOp::Gt, Int(a), Int(b)) => Bool(a > b),
        (BinaryOp::Ge, Int(a), Int(b)) => Bool(a >= b),

        (_, Int(_) | Float(_), Int(_) | Float(_)) => {
            let (a, b) = (as_float(lhs), as_float(rhs));
            match op {
                BinaryOp::Add => Float(a + b),
                BinaryOp::Sub => Float(a - b),
                BinaryOp::Mul => Float(a * b),
                BinaryOp::Eq => Bool(a == b),
                BinaryOp::Ne => Bool(a != b),
                BinaryOp::Lt => Bool(a < b),
                BinaryOp::Le => Bool(a <= b),
                BinaryOp::Gt => Bool(a > b),
                BinaryOp::Ge => Bool(a >= b),
                BinaryOp::And | BinaryOp::Or => return Err(mismatch()),
            }
        }

        _ => return Err(mismatch()),
    })
}

fn as_float(value: Value) -> f64 {
    match value {
        Value::Int(v) => v as f64,
        Value::Float(v) => v,
        Value::Bool(v) => f64::from(u8::from(v)),
    }
}
