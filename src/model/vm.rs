use crate::error::Error;
use crate::model::types::{
    DisplayAttribute, FieldMirror, MethodBody, MethodId, MethodMirror, ParamMirror,
    PrimitiveKind, PropertyMirror, TargetException, TypeId, TypeKind, TypeMirror,
};
use crate::model::value::{ObjectId, Primitive, StructValue, Value};
use crate::utils::CancellationToken;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Environment of a running method body.
pub struct InvokeScope<'a> {
    pub vm: &'a VirtualMachine,
    pub token: &'a CancellationToken,
}

impl InvokeScope<'_> {
    /// Long running bodies should poll this and return as soon as it is `true`.
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InvokeError {
    Exception(TargetException),
    Aborted,
}

#[derive(Debug)]
enum HeapObject {
    Instance {
        ty: TypeId,
        fields: IndexMap<(TypeId, String), Value>,
    },
    Array {
        ty: TypeId,
        items: Vec<Value>,
    },
}

/// Types, heap and statics of a debuggee.
pub struct VirtualMachine {
    types: RwLock<Vec<Arc<TypeMirror>>>,
    names: RwLock<HashMap<String, TypeId>>,
    methods: RwLock<Vec<Arc<MethodMirror>>>,
    heap: Mutex<HashMap<ObjectId, HeapObject>>,
    statics: Mutex<HashMap<(TypeId, String), Value>>,
    next_object: AtomicU64,
}

impl Default for VirtualMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualMachine {
    pub fn new() -> Self {
        let vm = Self {
            types: RwLock::default(),
            names: RwLock::default(),
            methods: RwLock::default(),
            heap: Mutex::default(),
            statics: Mutex::default(),
            next_object: AtomicU64::new(1),
        };

        // keep in sync with `TypeId` constants
        let builtins = [
            ("object", TypeKind::Class, None),
            ("System.ValueType", TypeKind::Class, Some(TypeId::OBJECT)),
            ("void", TypeKind::Void, None),
            (
                "bool",
                TypeKind::Primitive(PrimitiveKind::Bool),
                Some(TypeId::VALUE_TYPE),
            ),
            (
                "char",
                TypeKind::Primitive(PrimitiveKind::Char),
                Some(TypeId::VALUE_TYPE),
            ),
            (
                "int",
                TypeKind::Primitive(PrimitiveKind::Int32),
                Some(TypeId::VALUE_TYPE),
            ),
            (
                "long",
                TypeKind::Primitive(PrimitiveKind::Int64),
                Some(TypeId::VALUE_TYPE),
            ),
            (
                "double",
                TypeKind::Primitive(PrimitiveKind::Double),
                Some(TypeId::VALUE_TYPE),
            ),
            ("string", TypeKind::String, Some(TypeId::OBJECT)),
        ];
        for (name, kind, base) in builtins {
            let mut builder = TypeBuilder::new(&vm, name, kind);
            builder.base = base;
            builder.build();
        }

        vm.extend_type(TypeId::OBJECT, |b| {
            b.method("ToString", &[], TypeId::STRING, |scope, this, _| {
                let this = this.ok_or_else(|| {
                    TargetException::new("NullReferenceException", "instance expected")
                })?;
                Ok(Value::string(scope.vm.type_name(scope.vm.type_of(this))))
            })
        });
        vm.extend_type(TypeId::STRING, |b| {
            b.method("ToString", &[], TypeId::STRING, |_, this, _| {
                Ok(this.cloned().unwrap_or(Value::Null))
            })
        });

        vm
    }

    /// Define a reference type, derived from `object` unless [`TypeBuilder::base`] says otherwise.
    pub fn define_class(&self, full_name: &str) -> TypeBuilder<'_> {
        let mut builder = TypeBuilder::new(self, full_name, TypeKind::Class);
        builder.base = Some(TypeId::OBJECT);
        builder
    }

    pub fn define_struct(&self, full_name: &str) -> TypeBuilder<'_> {
        let mut builder = TypeBuilder::new(self, full_name, TypeKind::Struct);
        builder.base = Some(TypeId::VALUE_TYPE);
        builder
    }

    pub fn define_enum(&self, full_name: &str, variants: &[(&str, i64)]) -> TypeId {
        let kind = TypeKind::Enum {
            variants: variants
                .iter()
                .map(|(name, v)| (name.to_string(), *v))
                .collect(),
        };
        let mut builder = TypeBuilder::new(self, full_name, kind);
        builder.base = Some(TypeId::VALUE_TYPE);
        builder.build()
    }

    /// Type of arrays of `element`, created on first request.
    pub fn array_type(&self, element: TypeId) -> TypeId {
        let name = format!("{}[]", self.type_name(element));
        if let Some(id) = self.names.read().unwrap().get(&name) {
            return *id;
        }
        let mut builder = TypeBuilder::new(self, &name, TypeKind::Array { element });
        builder.base = Some(TypeId::OBJECT);
        builder.build()
    }

    /// Add members to an already defined type.
    fn extend_type(&self, ty: TypeId, f: impl FnOnce(TypeBuilder<'_>) -> TypeBuilder<'_>) {
        let info = self.type_info(ty);
        let builder = f(TypeBuilder::new(self, &info.full_name, info.kind.clone()));
        let mut methods = self.methods.write().unwrap();
        let ids: Vec<_> = builder
            .methods
            .into_iter()
            .map(|m| push_method(&mut methods, ty, m))
            .collect();
        let mut types = self.types.write().unwrap();
        let mut updated = (*types[ty.0 as usize]).clone();
        updated.methods.extend(ids);
        types[ty.0 as usize] = Arc::new(updated);
    }

    pub fn type_info(&self, ty: TypeId) -> Arc<TypeMirror> {
        let types = self.types.read().unwrap();
        types
            .get(ty.0 as usize)
            .unwrap_or(&types[TypeId::OBJECT.0 as usize])
            .clone()
    }

    pub fn type_name(&self, ty: TypeId) -> String {
        self.type_info(ty).full_name.clone()
    }

    /// Find type by full name, or by short name if that is unambiguous.
    pub fn find_type(&self, name: &str) -> Option<TypeId> {
        if let Some(id) = self.names.read().unwrap().get(name) {
            return Some(*id);
        }
        let types = self.types.read().unwrap();
        let mut found = types.iter().filter(|t| t.name() == name);
        match (found.next(), found.next()) {
            (Some(t), None) => Some(t.id),
            _ => None,
        }
    }

    pub fn method(&self, id: MethodId) -> Arc<MethodMirror> {
        self.methods.read().unwrap()[id.0 as usize].clone()
    }

    /// Type with all its ancestors, most derived first.
    pub fn base_chain(&self, ty: TypeId) -> Vec<Arc<TypeMirror>> {
        let mut chain = vec![];
        let mut current = Some(ty);
        while let Some(id) = current {
            let info = self.type_info(id);
            current = info.base;
            chain.push(info);
        }
        chain
    }

    /// Whether a value of type `from` may be stored in a location of type `to`.
    pub fn is_assignable(&self, from: TypeId, to: TypeId) -> bool {
        if from == to || to == TypeId::OBJECT {
            return true;
        }
        let (from_info, to_info) = (self.type_info(from), self.type_info(to));
        if let (TypeKind::Array { element: fe }, TypeKind::Array { element: te }) =
            (&from_info.kind, &to_info.kind)
        {
            return !self.type_info(*fe).is_value_type() && self.is_assignable(*fe, *te);
        }
        self.base_chain(from).iter().any(|t| t.id == to)
    }

    /// Runtime type of a value, `object` for null.
    pub fn type_of(&self, value: &Value) -> TypeId {
        match value {
            Value::Null => TypeId::OBJECT,
            Value::Primitive(p) => p.type_id(),
            Value::String(_) => TypeId::STRING,
            Value::Enum { ty, .. } => *ty,
            Value::Struct(s) => s.ty,
            Value::Array(id) | Value::Object(id) => match self.heap.lock().unwrap().get(id) {
                Some(HeapObject::Instance { ty, .. }) | Some(HeapObject::Array { ty, .. }) => *ty,
                None => TypeId::OBJECT,
            },
        }
    }

    pub fn default_value(&self, ty: TypeId) -> Value {
        let info = self.type_info(ty);
        match &info.kind {
            TypeKind::Primitive(kind) => Value::Primitive(match kind {
                PrimitiveKind::Bool => Primitive::Bool(false),
                PrimitiveKind::Char => Primitive::Char('\0'),
                PrimitiveKind::Int32 => Primitive::Int32(0),
                PrimitiveKind::Int64 => Primitive::Int64(0),
                PrimitiveKind::Double => Primitive::Double(0.0),
            }),
            TypeKind::Enum { .. } => Value::Enum { ty, value: 0 },
            TypeKind::Struct => Value::Struct(StructValue {
                ty,
                fields: info
                    .fields
                    .iter()
                    .filter(|f| !f.is_static)
                    .map(|f| (f.name.clone(), self.default_value(f.ty)))
                    .collect(),
            }),
            _ => Value::Null,
        }
    }

    /// Allocate a new instance of `ty` with default field values.
    pub fn new_object(&self, ty: TypeId) -> Value {
        let info = self.type_info(ty);
        if info.is_value_type() {
            return self.default_value(ty);
        }
        let fields = self
            .base_chain(ty)
            .iter()
            .flat_map(|t| t.fields.iter().filter(|f| !f.is_static))
            .map(|f| ((f.declaring, f.name.clone()), self.default_value(f.ty)))
            .collect();
        let id = self.alloc(HeapObject::Instance { ty, fields });
        Value::Object(id)
    }

    pub fn new_array(&self, element: TypeId, items: Vec<Value>) -> Value {
        let ty = self.array_type(element);
        Value::Array(self.alloc(HeapObject::Array { ty, items }))
    }

    fn alloc(&self, obj: HeapObject) -> ObjectId {
        let id = ObjectId(self.next_object.fetch_add(1, Ordering::Relaxed));
        self.heap.lock().unwrap().insert(id, obj);
        id
    }

    pub fn get_field(&self, target: Option<&Value>, field: &FieldMirror) -> Result<Value, Error> {
        if field.is_static {
            let stored = self
                .statics
                .lock()
                .unwrap()
                .get(&(field.declaring, field.name.clone()))
                .cloned();
            return Ok(stored.unwrap_or_else(|| self.default_value(field.ty)));
        }

        match target {
            Some(Value::Object(id)) => match self.heap.lock().unwrap().get(id) {
                Some(HeapObject::Instance { fields, .. }) => fields
                    .get(&(field.declaring, field.name.clone()))
                    .cloned()
                    .ok_or_else(|| self.missing_member(field)),
                _ => Err(Error::Evaluation("invalid object reference".to_string())),
            },
            Some(Value::Struct(s)) => s
                .fields
                .get(&field.name)
                .cloned()
                .ok_or_else(|| self.missing_member(field)),
            Some(Value::Null) | None => Err(null_reference()),
            Some(_) => Err(self.missing_member(field)),
        }
    }

    pub fn set_field(
        &self,
        target: Option<&Value>,
        field: &FieldMirror,
        value: Value,
    ) -> Result<(), Error> {
        if field.is_static {
            self.statics
                .lock()
                .unwrap()
                .insert((field.declaring, field.name.clone()), value);
            return Ok(());
        }

        match target {
            Some(Value::Object(id)) => match self.heap.lock().unwrap().get_mut(id) {
                Some(HeapObject::Instance { fields, .. }) => {
                    match fields.get_mut(&(field.declaring, field.name.clone())) {
                        Some(slot) => {
                            *slot = value;
                            Ok(())
                        }
                        None => Err(self.missing_member(field)),
                    }
                }
                _ => Err(Error::Evaluation("invalid object reference".to_string())),
            },
            Some(Value::Struct(_)) => Err(Error::ReadOnly(field.name.clone())),
            Some(Value::Null) | None => Err(null_reference()),
            Some(_) => Err(self.missing_member(field)),
        }
    }

    fn missing_member(&self, field: &FieldMirror) -> Error {
        Error::MemberNotFound {
            type_name: self.type_name(field.declaring),
            member: field.name.clone(),
        }
    }

    pub fn array_len(&self, array: &Value) -> Result<usize, Error> {
        self.with_array(array, |items| Ok(items.len()))
    }

    pub fn array_get(&self, array: &Value, index: i64) -> Result<Value, Error> {
        self.with_array(array, |items| {
            usize::try_from(index)
                .ok()
                .and_then(|i| items.get(i))
                .cloned()
                .ok_or(Error::IndexOutOfRange {
                    index,
                    len: items.len(),
                })
        })
    }

    /// Slice of array items, `count` is clamped to the array length.
    pub fn array_items(&self, array: &Value, first: usize, count: usize) -> Result<Vec<Value>, Error> {
        self.with_array(array, |items| {
            Ok(items.iter().skip(first).take(count).cloned().collect())
        })
    }

    pub fn array_set(&self, array: &Value, index: i64, value: Value) -> Result<(), Error> {
        let Some(id) = array.object_id() else {
            return Err(null_reference());
        };
        match self.heap.lock().unwrap().get_mut(&id) {
            Some(HeapObject::Array { items, .. }) => {
                let len = items.len();
                let slot = usize::try_from(index)
                    .ok()
                    .and_then(|i| items.get_mut(i))
                    .ok_or(Error::IndexOutOfRange { index, len })?;
                *slot = value;
                Ok(())
            }
            _ => Err(Error::Evaluation("value is not an array".to_string())),
        }
    }

    fn with_array<T>(
        &self,
        array: &Value,
        f: impl FnOnce(&[Value]) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let Some(id) = array.object_id() else {
            return Err(null_reference());
        };
        match self.heap.lock().unwrap().get(&id) {
            Some(HeapObject::Array { items, .. }) => f(items),
            _ => Err(Error::Evaluation("value is not an array".to_string())),
        }
    }

    /// Name of enum variant with value `value`.
    pub fn enum_variant(&self, ty: TypeId, value: i64) -> Option<String> {
        match &self.type_info(ty).kind {
            TypeKind::Enum { variants } => variants
                .iter()
                .find(|(_, v)| *v == value)
                .map(|(n, _)| n.clone()),
            _ => None,
        }
    }

    /// Run a method body. Cancellation is observed before the call and right after it.
    pub fn invoke(
        &self,
        method: MethodId,
        this: Option<&Value>,
        args: &[Value],
        token: &CancellationToken,
    ) -> Result<Value, InvokeError> {
        if token.is_cancelled() {
            return Err(InvokeError::Aborted);
        }
        let method = self.method(method);
        if !method.is_static && this.map(Value::is_null).unwrap_or(true) {
            return Err(InvokeError::Exception(TargetException::new(
                "NullReferenceException",
                "Object reference not set to an instance of an object",
            )));
        }
        let scope = InvokeScope { vm: self, token };
        let result = (method.body)(&scope, this, args);
        if token.is_cancelled() {
            return Err(InvokeError::Aborted);
        }
        result.map_err(InvokeError::Exception)
    }
}

fn null_reference() -> Error {
    Error::EvaluationException("Object reference not set to an instance of an object".to_string())
}

struct PendingMethod {
    name: String,
    params: Vec<ParamMirror>,
    ret: TypeId,
    is_static: bool,
    body: MethodBody,
}

struct PendingProperty {
    name: String,
    ty: TypeId,
    index_params: Vec<ParamMirror>,
    getter: Option<MethodBody>,
    setter: Option<MethodBody>,
    is_static: bool,
    hidden: bool,
}

struct PendingField {
    mirror: FieldMirror,
    init: Option<Value>,
}

fn params(list: &[(&str, TypeId)]) -> Vec<ParamMirror> {
    list.iter()
        .map(|(name, ty)| ParamMirror {
            name: name.to_string(),
            ty: *ty,
        })
        .collect()
}

fn push_method(
    methods: &mut Vec<Arc<MethodMirror>>,
    declaring: TypeId,
    m: PendingMethod,
) -> MethodId {
    let id = MethodId(methods.len() as u32);
    methods.push(Arc::new(MethodMirror {
        id,
        name: m.name,
        declaring,
        params: m.params,
        return_type: m.ret,
        is_static: m.is_static,
        body: m.body,
    }));
    id
}

/// Builder of a debuggee type.
pub struct TypeBuilder<'a> {
    vm: &'a VirtualMachine,
    full_name: String,
    kind: TypeKind,
    base: Option<TypeId>,
    fields: Vec<PendingField>,
    properties: Vec<PendingProperty>,
    methods: Vec<PendingMethod>,
    display: Option<DisplayAttribute>,
}

impl<'a> TypeBuilder<'a> {
    fn new(vm: &'a VirtualMachine, full_name: &str, kind: TypeKind) -> Self {
        Self {
            vm,
            full_name: full_name.to_string(),
            kind,
            base: None,
            fields: vec![],
            properties: vec![],
            methods: vec![],
            display: None,
        }
    }

    pub fn base(mut self, base: TypeId) -> Self {
        self.base = Some(base);
        self
    }

    fn add_field(mut self, name: &str, ty: TypeId, is_public: bool, hidden: bool) -> Self {
        self.fields.push(PendingField {
            mirror: FieldMirror {
                name: name.to_string(),
                ty,
                declaring: TypeId::OBJECT,
                is_static: false,
                is_public,
                hidden,
            },
            init: None,
        });
        self
    }

    pub fn field(self, name: &str, ty: TypeId) -> Self {
        self.add_field(name, ty, true, false)
    }

    pub fn private_field(self, name: &str, ty: TypeId) -> Self {
        self.add_field(name, ty, false, false)
    }

    /// Field excluded from child listings.
    pub fn hidden_field(self, name: &str, ty: TypeId) -> Self {
        self.add_field(name, ty, false, true)
    }

    pub fn static_field(mut self, name: &str, ty: TypeId, init: Value) -> Self {
        self.fields.push(PendingField {
            mirror: FieldMirror {
                name: name.to_string(),
                ty,
                declaring: TypeId::OBJECT,
                is_static: true,
                is_public: true,
                hidden: false,
            },
            init: Some(init),
        });
        self
    }

    pub fn method(
        mut self,
        name: &str,
        args: &[(&str, TypeId)],
        ret: TypeId,
        body: impl Fn(&InvokeScope<'_>, Option<&Value>, &[Value]) -> Result<Value, TargetException>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.methods.push(PendingMethod {
            name: name.to_string(),
            params: params(args),
            ret,
            is_static: false,
            body: Arc::new(body),
        });
        self
    }

    pub fn static_method(
        mut self,
        name: &str,
        args: &[(&str, TypeId)],
        ret: TypeId,
        body: impl Fn(&InvokeScope<'_>, Option<&Value>, &[Value]) -> Result<Value, TargetException>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.methods.push(PendingMethod {
            name: name.to_string(),
            params: params(args),
            ret,
            is_static: true,
            body: Arc::new(body),
        });
        self
    }

    /// Read-only instance property.
    pub fn property(
        mut self,
        name: &str,
        ty: TypeId,
        getter: impl Fn(&InvokeScope<'_>, Option<&Value>, &[Value]) -> Result<Value, TargetException>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.properties.push(PendingProperty {
            name: name.to_string(),
            ty,
            index_params: vec![],
            getter: Some(Arc::new(getter)),
            setter: None,
            is_static: false,
            hidden: false,
        });
        self
    }

    /// Instance property with a setter, the setter gets the new value as its only argument.
    pub fn property_rw(
        mut self,
        name: &str,
        ty: TypeId,
        getter: impl Fn(&InvokeScope<'_>, Option<&Value>, &[Value]) -> Result<Value, TargetException>
            + Send
            + Sync
            + 'static,
        setter: impl Fn(&InvokeScope<'_>, Option<&Value>, &[Value]) -> Result<Value, TargetException>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.properties.push(PendingProperty {
            name: name.to_string(),
            ty,
            index_params: vec![],
            getter: Some(Arc::new(getter)),
            setter: Some(Arc::new(setter)),
            is_static: false,
            hidden: false,
        });
        self
    }

    /// Indexer, the setter gets index arguments followed by the new value.
    pub fn indexer(
        mut self,
        ty: TypeId,
        index: &[(&str, TypeId)],
        getter: impl Fn(&InvokeScope<'_>, Option<&Value>, &[Value]) -> Result<Value, TargetException>
            + Send
            + Sync
            + 'static,
        setter: Option<MethodBody>,
    ) -> Self {
        self.properties.push(PendingProperty {
            name: "Item".to_string(),
            ty,
            index_params: params(index),
            getter: Some(Arc::new(getter)),
            setter,
            is_static: false,
            hidden: false,
        });
        self
    }

    pub fn display(mut self, display: DisplayAttribute) -> Self {
        self.display = Some(display);
        self
    }

    pub fn build(self) -> TypeId {
        let mut types = self.vm.types.write().unwrap();
        let mut methods = self.vm.methods.write().unwrap();
        let id = TypeId(types.len() as u32);

        let mut method_ids: Vec<_> = self
            .methods
            .into_iter()
            .map(|m| push_method(&mut methods, id, m))
            .collect();

        let mut properties = Vec::with_capacity(self.properties.len());
        for p in self.properties {
            let getter = p.getter.map(|body| {
                push_method(
                    &mut methods,
                    id,
                    PendingMethod {
                        name: format!("get_{}", p.name),
                        params: p.index_params.clone(),
                        ret: p.ty,
                        is_static: p.is_static,
                        body,
                    },
                )
            });
            let setter = p.setter.map(|body| {
                let mut params = p.index_params.clone();
                params.push(ParamMirror {
                    name: "value".to_string(),
                    ty: p.ty,
                });
                push_method(
                    &mut methods,
                    id,
                    PendingMethod {
                        name: format!("set_{}", p.name),
                        params,
                        ret: TypeId::VOID,
                        is_static: p.is_static,
                        body,
                    },
                )
            });
            method_ids.extend(getter.iter().chain(setter.iter()));
            properties.push(PropertyMirror {
                name: p.name,
                ty: p.ty,
                declaring: id,
                getter,
                setter,
                index_params: p.index_params,
                is_static: p.is_static,
                hidden: p.hidden,
            });
        }

        let mut statics = self.vm.statics.lock().unwrap();
        let fields = self
            .fields
            .into_iter()
            .map(|mut f| {
                f.mirror.declaring = id;
                if let Some(init) = f.init {
                    statics.insert((id, f.mirror.name.clone()), init);
                }
                f.mirror
            })
            .collect();

        types.push(Arc::new(TypeMirror {
            id,
            full_name: self.full_name.clone(),
            kind: self.kind,
            base: self.base,
            fields,
            properties,
            methods: method_ids,
            display: self.display,
        }));
        self.vm.names.write().unwrap().insert(self.full_name, id);
        id
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_builtin_ids() {
        let vm = VirtualMachine::new();
        assert_eq!(vm.type_name(TypeId::INT32), "int");
        assert_eq!(vm.type_name(TypeId::STRING), "string");
        assert_eq!(vm.find_type("System.ValueType"), Some(TypeId::VALUE_TYPE));
        assert!(vm.type_info(TypeId::DOUBLE).is_value_type());
    }

    #[test]
    fn test_assignability() {
        let vm = VirtualMachine::new();
        let base = vm.define_class("App.Base").build();
        let derived = vm.define_class("App.Derived").base(base).build();
        let other = vm.define_class("App.Other").build();

        assert!(vm.is_assignable(derived, base));
        assert!(vm.is_assignable(derived, TypeId::OBJECT));
        assert!(!vm.is_assignable(base, derived));
        assert!(!vm.is_assignable(derived, other));
        assert!(vm.is_assignable(TypeId::INT32, TypeId::VALUE_TYPE));
        assert!(!vm.is_assignable(TypeId::INT32, TypeId::INT64));

        let derived_arr = vm.array_type(derived);
        let base_arr = vm.array_type(base);
        assert!(vm.is_assignable(derived_arr, base_arr));
        assert!(!vm.is_assignable(vm.array_type(TypeId::INT32), vm.array_type(TypeId::OBJECT)));
        assert_eq!(vm.find_type("Derived"), Some(derived));
    }

    #[test]
    fn test_fields_across_base_chain() {
        let vm = VirtualMachine::new();
        let base = vm.define_class("Base").field("id", TypeId::INT32).build();
        let derived = vm
            .define_class("Derived")
            .base(base)
            .field("name", TypeId::STRING)
            .static_field("count", TypeId::INT32, Value::int(3))
            .build();

        let obj = vm.new_object(derived);
        assert_eq!(vm.type_of(&obj), derived);
        let id_field = vm.type_info(base).field("id").cloned().unwrap();
        assert_eq!(vm.get_field(Some(&obj), &id_field).unwrap(), Value::int(0));
        vm.set_field(Some(&obj), &id_field, Value::int(42)).unwrap();
        assert_eq!(vm.get_field(Some(&obj), &id_field).unwrap(), Value::int(42));

        let count = vm.type_info(derived).field("count").cloned().unwrap();
        assert_eq!(vm.get_field(None, &count).unwrap(), Value::int(3));
        assert!(vm.get_field(Some(&Value::Null), &id_field).is_err());
    }

    #[test]
    fn test_arrays() {
        let vm = VirtualMachine::new();
        let arr = vm.new_array(TypeId::INT32, vec![Value::int(1), Value::int(2)]);
        assert_eq!(vm.type_name(vm.type_of(&arr)), "int[]");
        assert_eq!(vm.array_len(&arr).unwrap(), 2);
        vm.array_set(&arr, 1, Value::int(5)).unwrap();
        assert_eq!(vm.array_get(&arr, 1).unwrap(), Value::int(5));
        assert!(matches!(
            vm.array_get(&arr, 2),
            Err(Error::IndexOutOfRange { index: 2, len: 2 })
        ));
        assert_eq!(vm.array_items(&arr, 1, 10).unwrap(), vec![Value::int(5)]);
    }

    #[test]
    fn test_invoke_default_to_string() {
        let vm = VirtualMachine::new();
        let point = vm.define_class("Geometry.Point").build();
        let obj = vm.new_object(point);
        let to_string = vm.type_info(TypeId::OBJECT).methods[0];
        let res = vm
            .invoke(to_string, Some(&obj), &[], &CancellationToken::new())
            .unwrap();
        assert_eq!(res, Value::string("Geometry.Point"));

        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(
            vm.invoke(to_string, Some(&obj), &[], &token),
            Err(InvokeError::Aborted)
        );
    }
}
