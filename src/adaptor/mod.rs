//! Turns raw debuggee values into display-ready [`ObjectValue`] nodes.

mod object_value;

use crate::error::Error;
use crate::eval::overload::{overload_resolve, Binding};
use crate::eval::{evaluate_in_instance, find_member, list_members, runtime_invoke};
use crate::eval::{EvaluationContext, ValueReference};
use crate::model::{ObjectId, Primitive, StructValue, TypeId, TypeKind, Value};
use crate::{muted_error, rd_debug};
use lru::LruCache;
use once_cell::sync;
use regex::{Captures, Regex};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};

pub use object_value::{ObjectPath, ObjectValue, ObjectValueFlags, ObjectValueKind};

/// Closed classification of a value, decides how it is rendered.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ValueClass<'a> {
    Null,
    Primitive(Primitive),
    String(&'a str),
    Enum { ty: TypeId, value: i64 },
    Array(ObjectId),
    Struct(&'a StructValue),
    Object(ObjectId),
}

/// Display templates of a type, taken from the nearest type in its base chain that has them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TypeDisplayData {
    pub name_display: Option<String>,
    pub type_display: Option<String>,
    pub value_display: Option<String>,
}

const DISPLAY_CACHE_SIZE: usize = 256;
/// Nesting level at which display templates of hole values are no longer expanded.
const MAX_TEMPLATE_DEPTH: usize = 2;

pub struct ObjectValueAdaptor {
    display_cache: Mutex<LruCache<TypeId, Arc<TypeDisplayData>>>,
}

impl Default for ObjectValueAdaptor {
    fn default() -> Self {
        Self::new()
    }
}

impl ObjectValueAdaptor {
    pub fn new() -> Self {
        Self {
            display_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(DISPLAY_CACHE_SIZE).expect("infallible"),
            )),
        }
    }

    pub fn classify(value: &Value) -> ValueClass<'_> {
        match value {
            Value::Null => ValueClass::Null,
            Value::Primitive(p) => ValueClass::Primitive(*p),
            Value::String(s) => ValueClass::String(s),
            Value::Enum { ty, value } => ValueClass::Enum {
                ty: *ty,
                value: *value,
            },
            Value::Array(id) => ValueClass::Array(*id),
            Value::Struct(s) => ValueClass::Struct(s),
            Value::Object(id) => ValueClass::Object(*id),
        }
    }

    pub fn type_display_data(&self, ctx: &EvaluationContext, ty: TypeId) -> Arc<TypeDisplayData> {
        if let Some(data) = self.display_cache.lock().unwrap().get(&ty) {
            return data.clone();
        }

        let mut data = TypeDisplayData::default();
        for info in ctx.vm.base_chain(ty) {
            let Some(display) = info.display.as_ref() else {
                continue;
            };
            data.name_display = data.name_display.or_else(|| display.name.clone());
            data.type_display = data.type_display.or_else(|| display.type_name.clone());
            data.value_display = data.value_display.or_else(|| display.value.clone());
        }

        let data = Arc::new(data);
        self.display_cache.lock().unwrap().put(ty, data.clone());
        data
    }

    /// Value converted to `ty` if its runtime type allows that.
    pub fn try_cast(&self, ctx: &EvaluationContext, value: Value, ty: TypeId) -> Option<Value> {
        if value.is_null() {
            return (!ctx.vm.type_info(ty).is_value_type()).then_some(Value::Null);
        }
        ctx.vm
            .is_assignable(ctx.vm.type_of(&value), ty)
            .then_some(value)
    }

    pub fn cast(&self, ctx: &EvaluationContext, value: Value, ty: TypeId) -> Result<Value, Error> {
        let from = if value.is_null() {
            "null".to_string()
        } else {
            ctx.vm.type_name(ctx.vm.type_of(&value))
        };
        self.try_cast(ctx, value, ty)
            .ok_or_else(|| Error::CastFailure {
                from,
                to: ctx.vm.type_name(ty),
            })
    }

    /// Text of `value.ToString()`, running debuggee code for objects.
    pub fn call_to_string(&self, ctx: &EvaluationContext, value: &Value) -> Result<String, Error> {
        match Self::classify(value) {
            ValueClass::Null => Ok(String::new()),
            ValueClass::String(s) => Ok(s.to_string()),
            ValueClass::Primitive(Primitive::Char(c)) => Ok(c.to_string()),
            ValueClass::Primitive(p) => Ok(p.to_string()),
            ValueClass::Enum { ty, value } => Ok(ctx
                .vm
                .enum_variant(ty, value)
                .unwrap_or_else(|| value.to_string())),
            _ => {
                ctx.assert_target_invoke_allowed()?;
                let ty = ctx.vm.type_of(value);
                let method = overload_resolve(&ctx.vm, "ToString", ty, &[], Binding::INSTANCE)?;
                let result = runtime_invoke(ctx, method.id, Some(value), &[])?;
                Ok(result
                    .as_str()
                    .map(ToString::to_string)
                    .unwrap_or_else(|| format!("{{{}}}", ctx.vm.type_name(ty))))
            }
        }
    }

    /// Inline text of a value, as shown next to its name.
    pub fn value_display(&self, ctx: &EvaluationContext, value: &Value) -> Result<String, Error> {
        self.display_at(ctx, value, 0)
    }

    fn display_at(
        &self,
        ctx: &EvaluationContext,
        value: &Value,
        depth: usize,
    ) -> Result<String, Error> {
        let display = match Self::classify(value) {
            ValueClass::Null => "(null)".to_string(),
            ValueClass::Primitive(p) => p.to_string(),
            ValueClass::String(s) => format!("{s:?}"),
            ValueClass::Enum { ty, value } => ctx
                .vm
                .enum_variant(ty, value)
                .unwrap_or_else(|| value.to_string()),
            ValueClass::Array(_) => {
                let ty = ctx.vm.type_of(value);
                let element = match ctx.vm.type_info(ty).kind {
                    TypeKind::Array { element } => ctx.vm.type_name(element),
                    _ => ctx.vm.type_name(TypeId::OBJECT),
                };
                format!("{{{element}[{}]}}", ctx.vm.array_len(value)?)
            }
            ValueClass::Struct(_) | ValueClass::Object(_) => {
                let ty = ctx.vm.type_of(value);
                let data = self.type_display_data(ctx, ty);
                match data.value_display.as_deref() {
                    Some(template) if depth < MAX_TEMPLATE_DEPTH => {
                        self.expand_template(ctx, value, template, depth)
                    }
                    _ => self.default_display(ctx, value, ty),
                }
            }
        };
        Ok(display)
    }

    /// `ToString()` when the type overrides it and invocation is allowed, type name otherwise.
    fn default_display(&self, ctx: &EvaluationContext, value: &Value, ty: TypeId) -> String {
        let type_name = format!("{{{}}}", ctx.vm.type_name(ty));
        if !ctx.options.allow_target_invoke {
            return type_name;
        }
        let overridden = overload_resolve(&ctx.vm, "ToString", ty, &[], Binding::INSTANCE)
            .map(|m| m.declaring != TypeId::OBJECT && m.declaring != TypeId::VALUE_TYPE)
            .unwrap_or(false);
        if !overridden {
            return type_name;
        }
        muted_error!(self.call_to_string(ctx, value), "ToString():").unwrap_or(type_name)
    }

    /// Substitute every `{expr}` hole of a display template, `expr` is evaluated
    /// against `instance`. A `,nq` suffix drops quotes around strings.
    pub fn evaluate_display_string(
        &self,
        ctx: &EvaluationContext,
        instance: &Value,
        template: &str,
    ) -> String {
        self.expand_template(ctx, instance, template, 0)
    }

    fn expand_template(
        &self,
        ctx: &EvaluationContext,
        instance: &Value,
        template: &str,
        depth: usize,
    ) -> String {
        static HOLE_RE: sync::Lazy<Regex> =
            sync::Lazy::new(|| Regex::new(r"\{([^{}]+)\}").expect("must compile"));

        HOLE_RE
            .replace_all(template, |caps: &Captures| {
                let hole = caps[1].trim();
                let (expr, no_quotes) = match hole.strip_suffix(",nq") {
                    Some(expr) => (expr.trim(), true),
                    None => (hole, false),
                };
                let value = evaluate_in_instance(ctx, instance, expr).and_then(|r| r.value(ctx));
                let text = value.and_then(|v| match (&v, no_quotes) {
                    (Value::String(s), true) => Ok(s.to_string()),
                    _ => self.display_at(ctx, &v, depth + 1),
                });
                text.unwrap_or_else(|e| format!("{{error: {e}}}"))
            })
            .into_owned()
    }

    /// Node for a value with a known declared type.
    pub fn create_object_value(
        &self,
        ctx: &EvaluationContext,
        path: ObjectPath,
        name: &str,
        value: &Value,
        declared: TypeId,
        flags: ObjectValueFlags,
    ) -> ObjectValue {
        let ty = if value.is_null() {
            declared
        } else {
            ctx.vm.type_of(value)
        };
        let type_name = ctx.vm.type_name(ty);

        match Self::classify(value) {
            ValueClass::Null => {
                ObjectValue::object(path, name, &type_name, "(null)".to_string(), flags, false)
            }
            ValueClass::Primitive(_) | ValueClass::String(_) | ValueClass::Enum { .. } => {
                match self.value_display(ctx, value) {
                    Ok(display) => ObjectValue::primitive(path, name, &type_name, display, flags),
                    Err(e) => ObjectValue::error(path, name, e.to_string(), flags),
                }
            }
            ValueClass::Array(_) => {
                let len = match ctx.vm.array_len(value) {
                    Ok(len) => len,
                    Err(e) => return ObjectValue::error(path, name, e.to_string(), flags),
                };
                let display = self
                    .value_display(ctx, value)
                    .unwrap_or_else(|_| format!("{{{type_name}}}"));
                ObjectValue::array(path, name, &type_name, display, flags, len)
            }
            ValueClass::Struct(_) | ValueClass::Object(_) => {
                let data = self.type_display_data(ctx, ty);
                let display = match data.value_display.as_deref() {
                    Some(template) => self.evaluate_display_string(ctx, value, template),
                    None => self.default_display(ctx, value, ty),
                };
                let shown_type = data
                    .type_display
                    .as_deref()
                    .map(|t| self.evaluate_display_string(ctx, value, t))
                    .unwrap_or(type_name);
                let shown_name = data
                    .name_display
                    .as_deref()
                    .map(|t| self.evaluate_display_string(ctx, value, t))
                    .unwrap_or_else(|| name.to_string());
                let has_children = !list_members(ctx, ty, Some(value)).is_empty();
                ObjectValue::object(path, &shown_name, &shown_type, display, flags, has_children)
            }
        }
    }

    /// Node for a value location. Read failures become error nodes.
    pub fn create_from_reference(
        &self,
        ctx: &EvaluationContext,
        path: ObjectPath,
        reference: &ValueReference,
    ) -> ObjectValue {
        let name = reference.name();
        let flags = reference.flags();
        let declared = reference.type_id();

        if reference.is_property()
            && !(ctx.options.evaluate_properties && ctx.options.allow_target_invoke)
        {
            return ObjectValue::not_evaluated(path, &name, &ctx.vm.type_name(declared), flags);
        }

        match reference.value(ctx) {
            Ok(value) => self.create_object_value(ctx, path, &name, &value, declared, flags),
            Err(e) => {
                rd_debug!(target: "eval", "read {name}: {e}");
                ObjectValue::error(path, &name, e.to_string(), flags)
            }
        }
    }

    /// Children of `value`, starting from `index`. Without `count` all remaining children
    /// are returned. Failure to read one child doesn't affect the others.
    pub fn get_children(
        &self,
        ctx: &EvaluationContext,
        path: &ObjectPath,
        value: &Value,
        index: usize,
        count: Option<usize>,
    ) -> Result<Vec<ObjectValue>, Error> {
        let count = count.unwrap_or(usize::MAX);
        match Self::classify(value) {
            ValueClass::Array(_) => {
                let element = match ctx.vm.type_info(ctx.vm.type_of(value)).kind {
                    TypeKind::Array { element } => element,
                    _ => TypeId::OBJECT,
                };
                let items = ctx.vm.array_items(value, index, count)?;
                Ok(items
                    .iter()
                    .enumerate()
                    .map(|(i, item)| {
                        let name = format!("[{}]", index + i);
                        self.create_object_value(
                            ctx,
                            path.child(name.clone()),
                            &name,
                            item,
                            element,
                            ObjectValueFlags::ARRAY_ELEMENT,
                        )
                    })
                    .collect())
            }
            ValueClass::Struct(_) | ValueClass::Object(_) => {
                let ty = ctx.vm.type_of(value);
                Ok(list_members(ctx, ty, Some(value))
                    .iter()
                    .skip(index)
                    .take(count)
                    .map(|member| self.create_from_reference(ctx, path.child(member.name()), member))
                    .collect())
            }
            _ => Ok(vec![]),
        }
    }

    /// Walk from `root` down through member names and `[i]` array indexes.
    pub fn resolve_path(
        &self,
        ctx: &EvaluationContext,
        root: Value,
        segments: &[String],
    ) -> Result<Value, Error> {
        let mut current = root;
        for segment in segments {
            if current.is_null() {
                return Err(Error::EvaluationException(
                    "Object reference not set to an instance of an object".to_string(),
                ));
            }
            let index = segment
                .strip_prefix('[')
                .and_then(|s| s.strip_suffix(']'))
                .and_then(|s| s.parse::<i64>().ok());
            current = match (index, &current) {
                (Some(i), Value::Array(_)) => ctx.vm.array_get(&current, i)?,
                _ => {
                    let ty = ctx.vm.type_of(&current);
                    find_member(ctx, ty, Some(&current), segment)
                        .ok_or_else(|| Error::MemberNotFound {
                            type_name: ctx.vm.type_name(ty),
                            member: segment.clone(),
                        })?
                        .value(ctx)?
                }
            };
        }
        Ok(current)
    }
}
