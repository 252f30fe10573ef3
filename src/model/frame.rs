use crate::model::types::TypeId;
use crate::model::value::Value;
use std::sync::{Arc, RwLock};

/// Named storage location of a frame: local variable or parameter.
#[derive(Debug)]
pub struct VariableSlot {
    pub name: String,
    pub ty: TypeId,
    value: RwLock<Value>,
}

impl VariableSlot {
    pub fn new(name: impl Into<String>, ty: TypeId, value: Value) -> Self {
        Self {
            name: name.into(),
            ty,
            value: RwLock::new(value),
        }
    }

    pub fn get(&self) -> Value {
        self.value.read().unwrap().clone()
    }

    pub fn set(&self, value: Value) {
        *self.value.write().unwrap() = value;
    }
}

/// Snapshot of a single activation record.
#[derive(Debug)]
pub struct StackFrame {
    pub address: u64,
    /// Method signature, like `Program.Run(int count)`.
    pub method: String,
    pub declaring_type: Option<TypeId>,
    pub file: Option<String>,
    pub line: Option<u32>,
    pub locals: Vec<Arc<VariableSlot>>,
    pub params: Vec<Arc<VariableSlot>>,
    pub this: Option<Value>,
}

impl StackFrame {
    pub fn local(&self, name: &str) -> Option<(usize, &Arc<VariableSlot>)> {
        self.locals.iter().enumerate().find(|(_, s)| s.name == name)
    }

    pub fn param(&self, name: &str) -> Option<(usize, &Arc<VariableSlot>)> {
        self.params.iter().enumerate().find(|(_, s)| s.name == name)
    }
}
