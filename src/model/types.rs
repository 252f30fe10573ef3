use crate::model::value::Value;
use crate::model::vm::InvokeScope;
use serde::{Deserialize, Serialize};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

/// Index of a type in the virtual machine registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeId(pub u32);

impl TypeId {
    pub const OBJECT: TypeId = TypeId(0);
    pub const VALUE_TYPE: TypeId = TypeId(1);
    pub const VOID: TypeId = TypeId(2);
    pub const BOOL: TypeId = TypeId(3);
    pub const CHAR: TypeId = TypeId(4);
    pub const INT32: TypeId = TypeId(5);
    pub const INT64: TypeId = TypeId(6);
    pub const DOUBLE: TypeId = TypeId(7);
    pub const STRING: TypeId = TypeId(8);
}

/// Index of a method in the virtual machine registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimitiveKind {
    Bool,
    Char,
    Int32,
    Int64,
    Double,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TypeKind {
    Class,
    Struct,
    Enum { variants: Vec<(String, i64)> },
    Primitive(PrimitiveKind),
    String,
    Array { element: TypeId },
    Void,
}

/// Exception raised by debuggee code.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetException {
    pub type_name: String,
    pub message: String,
}

impl TargetException {
    pub fn new(type_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            message: message.into(),
        }
    }
}

/// Native body of a debuggee method.
pub type MethodBody = Arc<
    dyn Fn(&InvokeScope<'_>, Option<&Value>, &[Value]) -> Result<Value, TargetException>
        + Send
        + Sync,
>;

#[derive(Debug, Clone, PartialEq)]
pub struct ParamMirror {
    pub name: String,
    pub ty: TypeId,
}

#[derive(Clone)]
pub struct MethodMirror {
    pub id: MethodId,
    pub name: String,
    pub declaring: TypeId,
    pub params: Vec<ParamMirror>,
    pub return_type: TypeId,
    pub is_static: bool,
    pub body: MethodBody,
}

impl Debug for MethodMirror {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MethodMirror")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("declaring", &self.declaring)
            .field("params", &self.params)
            .field("return_type", &self.return_type)
            .field("is_static", &self.is_static)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FieldMirror {
    pub name: String,
    pub ty: TypeId,
    pub declaring: TypeId,
    pub is_static: bool,
    pub is_public: bool,
    /// Excluded from child listings.
    pub hidden: bool,
}

/// Property or indexer. Indexer parameters are the getter parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct PropertyMirror {
    pub name: String,
    pub ty: TypeId,
    pub declaring: TypeId,
    pub getter: Option<MethodId>,
    pub setter: Option<MethodId>,
    pub index_params: Vec<ParamMirror>,
    pub is_static: bool,
    pub hidden: bool,
}

impl PropertyMirror {
    pub fn is_indexer(&self) -> bool {
        !self.index_params.is_empty()
    }
}

/// Display templates attached to a type, `{expr}` holes are evaluated against an instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisplayAttribute {
    pub name: Option<String>,
    pub value: Option<String>,
    pub type_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TypeMirror {
    pub id: TypeId,
    pub full_name: String,
    pub kind: TypeKind,
    pub base: Option<TypeId>,
    pub fields: Vec<FieldMirror>,
    pub properties: Vec<PropertyMirror>,
    pub methods: Vec<MethodId>,
    pub display: Option<DisplayAttribute>,
}

impl TypeMirror {
    pub fn is_value_type(&self) -> bool {
        matches!(
            self.kind,
            TypeKind::Struct | TypeKind::Enum { .. } | TypeKind::Primitive(_)
        )
    }

    pub fn field(&self, name: &str) -> Option<&FieldMirror> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn property(&self, name: &str) -> Option<&PropertyMirror> {
        self.properties
            .iter()
            .find(|p| p.name == name && !p.is_indexer())
    }

    /// Short name, without namespace.
    pub fn name(&self) -> &str {
        self.full_name
            .rsplit_once('.')
            .map(|(_, n)| n)
            .unwrap_or(&self.full_name)
    }
}
