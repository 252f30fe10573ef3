use crate::adaptor::ObjectValueFlags;
use crate::error::Error;
use crate::eval::context::EvaluationContext;
use crate::eval::invoke::runtime_invoke;
use crate::model::{FieldMirror, PropertyMirror, StackFrame, TypeId, Value, VariableSlot};
use std::sync::Arc;

/// Location of a value: something that can be read and, often, written.
#[derive(Debug, Clone)]
pub enum ValueReference {
    Local {
        frame: Arc<StackFrame>,
        index: usize,
    },
    Parameter {
        frame: Arc<StackFrame>,
        index: usize,
    },
    This {
        value: Value,
        ty: TypeId,
    },
    Field {
        field: FieldMirror,
        target: Option<Value>,
    },
    /// Property or indexer access, index arguments are empty for plain properties.
    Property {
        property: PropertyMirror,
        target: Option<Value>,
        index_args: Vec<Value>,
    },
    ArrayElement {
        array: Value,
        element_type: TypeId,
        index: i64,
    },
    /// Result of a computation, like a method call.
    Literal {
        name: String,
        value: Value,
        ty: TypeId,
    },
}

impl ValueReference {
    fn slot(&self) -> Option<&Arc<VariableSlot>> {
        match self {
            ValueReference::Local { frame, index } => frame.locals.get(*index),
            ValueReference::Parameter { frame, index } => frame.params.get(*index),
            _ => None,
        }
    }

    pub fn name(&self) -> String {
        match self {
            ValueReference::Local { .. } | ValueReference::Parameter { .. } => self
                .slot()
                .map(|s| s.name.clone())
                .unwrap_or_default(),
            ValueReference::This { .. } => "this".to_string(),
            ValueReference::Field { field, .. } => field.name.clone(),
            ValueReference::Property { property, .. } => property.name.clone(),
            ValueReference::ArrayElement { index, .. } => format!("[{index}]"),
            ValueReference::Literal { name, .. } => name.clone(),
        }
    }

    /// Declared type of the location.
    pub fn type_id(&self) -> TypeId {
        match self {
            ValueReference::Local { .. } | ValueReference::Parameter { .. } => {
                self.slot().map(|s| s.ty).unwrap_or(TypeId::OBJECT)
            }
            ValueReference::This { ty, .. } => *ty,
            ValueReference::Field { field, .. } => field.ty,
            ValueReference::Property { property, .. } => property.ty,
            ValueReference::ArrayElement { element_type, .. } => *element_type,
            ValueReference::Literal { ty, .. } => *ty,
        }
    }

    pub fn flags(&self) -> ObjectValueFlags {
        match self {
            ValueReference::Local { .. } => ObjectValueFlags::VARIABLE,
            ValueReference::Parameter { .. } => ObjectValueFlags::PARAMETER,
            ValueReference::This { .. } => {
                ObjectValueFlags::VARIABLE | ObjectValueFlags::READ_ONLY
            }
            ValueReference::Field { field, .. } => {
                let mut flags = ObjectValueFlags::FIELD;
                if field.is_static {
                    flags |= ObjectValueFlags::GLOBAL;
                }
                flags |= if field.is_public {
                    ObjectValueFlags::PUBLIC
                } else {
                    ObjectValueFlags::PRIVATE
                };
                flags
            }
            ValueReference::Property { property, .. } => {
                let mut flags = ObjectValueFlags::PROPERTY | ObjectValueFlags::PUBLIC;
                if property.is_static {
                    flags |= ObjectValueFlags::GLOBAL;
                }
                if property.setter.is_none() {
                    flags |= ObjectValueFlags::READ_ONLY;
                }
                flags
            }
            ValueReference::ArrayElement { .. } => ObjectValueFlags::ARRAY_ELEMENT,
            ValueReference::Literal { .. } => {
                ObjectValueFlags::LITERAL | ObjectValueFlags::READ_ONLY
            }
        }
    }

    pub fn is_property(&self) -> bool {
        matches!(self, ValueReference::Property { .. })
    }

    /// Read the current value. Property access runs the getter in the debuggee.
    pub fn value(&self, ctx: &EvaluationContext) -> Result<Value, Error> {
        match self {
            ValueReference::Local { .. } | ValueReference::Parameter { .. } => self
                .slot()
                .map(|s| s.get())
                .ok_or_else(|| Error::UnknownIdentifier(self.name())),
            ValueReference::This { value, .. } => Ok(value.clone()),
            ValueReference::Field { field, target } => ctx.vm.get_field(target.as_ref(), field),
            ValueReference::Property {
                property,
                target,
                index_args,
            } => {
                let getter = property
                    .getter
                    .ok_or_else(|| Error::Evaluation(format!("property `{}` has no getter", property.name)))?;
                runtime_invoke(ctx, getter, target.as_ref(), index_args)
            }
            ValueReference::ArrayElement { array, index, .. } => ctx.vm.array_get(array, *index),
            ValueReference::Literal { value, .. } => Ok(value.clone()),
        }
    }

    /// Store a new value, after checking it fits the location type.
    pub fn set_value(&self, ctx: &EvaluationContext, value: Value) -> Result<(), Error> {
        let value = ctx.adaptor.cast(ctx, value, self.type_id())?;
        match self {
            ValueReference::Local { .. } | ValueReference::Parameter { .. } => {
                let slot = self
                    .slot()
                    .ok_or_else(|| Error::UnknownIdentifier(self.name()))?;
                slot.set(value);
                Ok(())
            }
            ValueReference::Field { field, target } => {
                ctx.vm.set_field(target.as_ref(), field, value)
            }
            ValueReference::Property {
                property,
                target,
                index_args,
            } => {
                let setter = property
                    .setter
                    .ok_or_else(|| Error::ReadOnly(property.name.clone()))?;
                let mut args = index_args.clone();
                args.push(value);
                runtime_invoke(ctx, setter, target.as_ref(), &args).map(|_| ())
            }
            ValueReference::ArrayElement { array, index, .. } => {
                ctx.vm.array_set(array, *index, value)
            }
            ValueReference::This { .. } | ValueReference::Literal { .. } => {
                Err(Error::ReadOnly(self.name()))
            }
        }
    }
}
