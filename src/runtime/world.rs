//! Host-side storage the driver reads and writes entity fields through.

use super::EntityId;
use crate::error::ExecutionError;
use crate::graph::Value;
use std::collections::BTreeMap;

/// Field storage and host functions for a population of entities
pub trait World {
    fn read(&self, entity: EntityId, field: &str) -> Option<Value>;

    fn write(&mut self, entity: EntityId, field: &str, value: Value);

    /// Run a host function for its side effect
    fn invoke(&mut self, _entity: EntityId, function: &str, _args: &[Value]) -> Result<(), ExecutionError> {
        Err(ExecutionError::UnknownFunction(function.to_string()))
    }

    /// Whether the named long-running action has completed for this entity
    fn poll(&mut self, _entity: EntityId, progress: &str) -> Result<bool, ExecutionError> {
        Err(ExecutionError::UnknownFunction(progress.to_string()))
    }
}

/// A recorded host call
#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub entity: EntityId,
    pub function: String,
    pub args: Vec<Value>,
}

/// In-memory world used by tests and tooling. Every host function is
/// accepted and recorded; progress actions complete when marked done.
#[derive(Debug, Clone, Default)]
pub struct MemoryWorld {
    fields: BTreeMap<(EntityId, String), Value>,
    progress: BTreeMap<(EntityId, String), bool>,
    calls: Vec<Call>,
}

impl MemoryWorld {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, entity: EntityId, field: &str, value: impl Into<Value>) -> &mut Self {
        self.fields.insert((entity, field.to_string()), value.into());
        self
    }

    pub fn get(&self, entity: EntityId, field: &str) -> Option<Value> {
        self.fields.get(&(entity, field.to_string())).copied()
    }

    /// Mark a progress action as done (or not) for an entity
    pub fn complete(&mut self, entity: EntityId, progress: &str, done: bool) -> &mut Self {
        self.progress.insert((entity, progress.to_string()), done);
        self
    }

    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    pub fn calls_to<'a>(&'a self, function: &'a str) -> impl Iterator<Item = &'a Call> + 'a {
        self.calls.iter().filter(move |call| call.function == function)
    }
}

impl World for MemoryWorld {
    fn read(&self, entity: EntityId, field: &str) -> Option<Value> {
        self.get(entity, field)
    }

    fn write(&mut self, entity: EntityId, field: &str, value: Value) {
        self.fields.insert((entity, field.to_string()), value);
    }

    fn invoke(&mut self, entity: EntityId, function: &str, args: &[Value]) -> Result<(), ExecutionError> {
        self.calls.push(Call {
            entity,
            function: function.to_string(),
            args: args.to_vec(),
        });
        Ok(())
    }

    fn poll(&mut self, entity: EntityId, progress: &str) -> Result<bool, ExecutionError> {
        Ok(self
            .progress
            .get(&(entity, progress.to_string()))
            .copied()
            .unwrap_or(false))
    }
}
