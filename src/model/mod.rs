//! In-memory model of a debuggee: type registry, heap, values and stack frames.

mod frame;
mod types;
mod value;
mod vm;

pub use frame::{StackFrame, VariableSlot};
pub use types::{
    DisplayAttribute, FieldMirror, MethodBody, MethodId, MethodMirror, ParamMirror,
    PrimitiveKind, PropertyMirror, TargetException, TypeId, TypeKind, TypeMirror,
};
pub use value::{ObjectId, Primitive, StructValue, Value};
pub use vm::{InvokeError, InvokeScope, TypeBuilder, VirtualMachine};
